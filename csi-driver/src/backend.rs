//! Backend volume client abstraction.
//!
//! The controller talks to the block-storage backend exclusively through the
//! [`VolumeBackend`] trait. Two implementations exist: [`crate::AgentBackend`]
//! forwards calls to the remote block agent over gRPC, and [`MemoryBackend`]
//! keeps disks in process memory for tests and local development.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Errors reported by a backend implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("volume '{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    Api(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid backend request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// The backend primitives the controller depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCall {
    CreateDisk,
    DeleteDisk,
    AttachDisk,
    FindVolumesByTag,
}

impl BackendCall {
    /// Label used in logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            BackendCall::CreateDisk => "create_disk",
            BackendCall::DeleteDisk => "delete_disk",
            BackendCall::AttachDisk => "attach_disk",
            BackendCall::FindVolumesByTag => "find_volumes_by_tag",
        }
    }
}

impl Display for BackendCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote block-storage primitives.
///
/// Implementations must be safe for concurrent use; the controller shares a
/// single instance across all in-flight requests.
#[tonic::async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Create a disk of `capacity_gib` GiB carrying `tags`, returning its handle.
    async fn create_disk(
        &self,
        capacity_gib: i64,
        tags: HashMap<String, String>,
    ) -> Result<String>;

    /// Delete the disk identified by `handle`.
    async fn delete_disk(&self, handle: &str) -> Result<()>;

    /// Attach the disk to `node_id`, returning the device path on that node.
    async fn attach_disk(&self, handle: &str, node_id: &str) -> Result<String>;

    /// Handles of every disk tagged with `key=value`.
    async fn find_volumes_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
struct Disk {
    capacity_gib: i64,
    tags: HashMap<String, String>,
    attachment: Option<(String, String)>,
}

#[derive(Debug, Default)]
struct MemoryState {
    disks: HashMap<String, Disk>,
    failures: HashMap<BackendCall, BackendError>,
}

/// In-process backend.
///
/// Disks live only as long as the backend instance. Every call is counted,
/// calls can be made to fail, and disk creation can be slowed down to widen
/// race windows in tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
    create_calls: AtomicU32,
    delete_calls: AtomicU32,
    attach_calls: AtomicU32,
    find_calls: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `create_disk` call by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Make every subsequent `call` fail with `error` until cleared.
    pub fn fail(&self, call: BackendCall, error: BackendError) {
        self.lock().failures.insert(call, error);
    }

    /// Stop failing `call`.
    pub fn clear_failure(&self, call: BackendCall) {
        self.lock().failures.remove(&call);
    }

    /// Number of times `call` has been invoked.
    pub fn calls(&self, call: BackendCall) -> u32 {
        self.counter(call).load(Ordering::SeqCst)
    }

    /// Insert a disk directly, bypassing call accounting.
    ///
    /// Models disks that already exist on the backend, e.g. those created
    /// before a driver restart.
    pub fn seed_disk(&self, capacity_gib: i64, tags: HashMap<String, String>) -> String {
        let handle = Self::new_handle();
        self.lock().disks.insert(
            handle.clone(),
            Disk {
                capacity_gib,
                tags,
                attachment: None,
            },
        );
        handle
    }

    /// Whether a disk with `handle` exists.
    pub fn contains(&self, handle: &str) -> bool {
        self.lock().disks.contains_key(handle)
    }

    /// Capacity of the disk with `handle`, if it exists.
    pub fn capacity_gib(&self, handle: &str) -> Option<i64> {
        self.lock().disks.get(handle).map(|d| d.capacity_gib)
    }

    /// Number of disks currently held.
    pub fn disk_count(&self) -> usize {
        self.lock().disks.len()
    }

    fn new_handle() -> String {
        format!("vol-{}", uuid::Uuid::new_v4().simple())
    }

    fn counter(&self, call: BackendCall) -> &AtomicU32 {
        match call {
            BackendCall::CreateDisk => &self.create_calls,
            BackendCall::DeleteDisk => &self.delete_calls,
            BackendCall::AttachDisk => &self.attach_calls,
            BackendCall::FindVolumesByTag => &self.find_calls,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test thread panicked; the map is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and return the injected failure for it, if any.
    fn enter(&self, call: BackendCall) -> Result<()> {
        self.counter(call).fetch_add(1, Ordering::SeqCst);
        match self.lock().failures.get(&call) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[tonic::async_trait]
impl VolumeBackend for MemoryBackend {
    async fn create_disk(
        &self,
        capacity_gib: i64,
        tags: HashMap<String, String>,
    ) -> Result<String> {
        self.enter(BackendCall::CreateDisk)?;

        if capacity_gib <= 0 {
            return Err(BackendError::InvalidRequest(format!(
                "capacity must be positive, got {} GiB",
                capacity_gib
            )));
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let handle = Self::new_handle();
        debug!(handle = %handle, capacity_gib, "Memory backend created disk");
        self.lock().disks.insert(
            handle.clone(),
            Disk {
                capacity_gib,
                tags,
                attachment: None,
            },
        );
        Ok(handle)
    }

    async fn delete_disk(&self, handle: &str) -> Result<()> {
        self.enter(BackendCall::DeleteDisk)?;

        match self.lock().disks.remove(handle) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(handle.to_string())),
        }
    }

    async fn attach_disk(&self, handle: &str, node_id: &str) -> Result<String> {
        self.enter(BackendCall::AttachDisk)?;

        let mut state = self.lock();

        // Device letters are handed out per node starting at xvdf
        let attached_on_node = state
            .disks
            .values()
            .filter(|d| matches!(&d.attachment, Some((node, _)) if node == node_id))
            .count();

        let disk = state
            .disks
            .get_mut(handle)
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;

        match &disk.attachment {
            Some((node, device)) if node == node_id => Ok(device.clone()),
            Some((node, _)) => Err(BackendError::Api(format!(
                "volume {} is already attached to node {}",
                handle, node
            ))),
            None => {
                let letter = b'f' + attached_on_node as u8;
                if letter > b'z' {
                    return Err(BackendError::Api(format!(
                        "node {} has no free device names",
                        node_id
                    )));
                }
                let device = format!("/dev/xvd{}", letter as char);
                disk.attachment = Some((node_id.to_string(), device.clone()));
                Ok(device)
            }
        }
    }

    async fn find_volumes_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>> {
        self.enter(BackendCall::FindVolumesByTag)?;

        let mut handles: Vec<String> = self
            .lock()
            .disks
            .iter()
            .filter(|(_, d)| d.tags.get(key).is_some_and(|v| v == value))
            .map(|(h, _)| h.clone())
            .collect();
        handles.sort();
        Ok(handles)
    }
}
