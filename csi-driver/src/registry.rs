//! Volume identity registry.
//!
//! Maps orchestrator-supplied volume names to the backend handles allocated
//! for them. Every lookup-then-insert for a name happens while holding that
//! name's exclusive lock, so concurrent CreateVolume calls for one name are
//! serialized while calls for different names proceed independently.
//!
//! The registry lives in process memory only. After a restart it is empty and
//! the backend tag lookup performed by the controller is the sole durable
//! idempotency mechanism.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::metrics;

/// One provisioned volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub name: String,
    pub volume_id: String,
    pub capacity_bytes: i64,
}

type NameLock = Arc<tokio::sync::Mutex<()>>;

/// Name to backend handle registry with per-name locking.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    records: RwLock<HashMap<String, VolumeRecord>>,
    /// Lock table; entries exist only while some task holds or awaits the lock
    locks: Mutex<HashMap<String, NameLock>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock for `name`.
    ///
    /// The returned guard is the only way to mutate the record for `name`.
    pub async fn lock(&self, name: &str) -> NameGuard<'_> {
        let lock = {
            let mut locks = self.lock_table();
            locks.entry(name.to_string()).or_default().clone()
        };

        let guard = lock.lock_owned().await;
        debug!(name = %name, "Acquired volume name lock");

        NameGuard {
            registry: self,
            name: name.to_string(),
            guard: Some(guard),
        }
    }

    /// Look up a record by volume name.
    pub async fn get(&self, name: &str) -> Option<VolumeRecord> {
        self.records.read().await.get(name).cloned()
    }

    /// Look up a record by backend handle.
    pub async fn find_by_volume_id(&self, volume_id: &str) -> Option<VolumeRecord> {
        self.records
            .read()
            .await
            .values()
            .find(|r| r.volume_id == volume_id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Number of names with a live lock entry.
    pub fn lock_entries(&self) -> usize {
        self.lock_table().len()
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, NameLock>> {
        // Critical sections never panic; recover the table if one ever did
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive hold on one volume name.
///
/// Dropping the guard releases the name and prunes its lock-table entry when
/// no other task is waiting for it.
#[derive(Debug)]
pub struct NameGuard<'a> {
    registry: &'a VolumeRegistry,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NameGuard<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current record for the locked name.
    pub async fn get(&self) -> Option<VolumeRecord> {
        self.registry.get(&self.name).await
    }

    /// Record the backend handle allocated for the locked name.
    pub async fn insert(&self, volume_id: &str, capacity_bytes: i64) -> VolumeRecord {
        let record = VolumeRecord {
            name: self.name.clone(),
            volume_id: volume_id.to_string(),
            capacity_bytes,
        };

        let mut records = self.registry.records.write().await;
        records.insert(self.name.clone(), record.clone());
        metrics::set_registry_records(records.len());

        debug!(name = %self.name, volume_id = %volume_id, "Registered volume");
        record
    }

    /// Remove the record for the locked name.
    pub async fn remove(&self) -> Option<VolumeRecord> {
        let mut records = self.registry.records.write().await;
        let removed = records.remove(&self.name);
        metrics::set_registry_records(records.len());
        removed
    }
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        // Release first so the strong count below only sees the table and waiters
        drop(self.guard.take());

        let mut locks = self.registry.lock_table();
        let idle = locks
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.name);
        }
    }
}
