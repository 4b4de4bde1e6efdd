//! CSI Controller Service Implementation
//!
//! Handles the volume lifecycle by driving the backend volume client through
//! the volume identity registry. CreateVolume is idempotent per volume name:
//! the registry answers repeated requests in process, and the `VolumeName`
//! tag on backend disks answers them across restarts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tonic::{Code, Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::backend::{self, BackendCall, BackendError, VolumeBackend};
use crate::capacity;
use crate::csi;
use crate::driver::DriverInfo;
use crate::metrics::{self, OperationTimer};
use crate::registry::VolumeRegistry;
use crate::types::UnpublishPolicy;

/// Backend tag binding a disk to the volume name it was created for
pub const VOLUME_NAME_TAG: &str = "VolumeName";

/// Publish context key carrying the attached device path
pub const DEVICE_PATH_KEY: &str = "DevicePath";

/// Failure of one bounded backend call.
#[derive(Error, Debug)]
enum CallError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("backend call {0} timed out after {1:?}")]
    Timeout(BackendCall, Duration),
}

impl CallError {
    /// Status for a failed call; backend errors use `code` and keep their message.
    fn into_status(self, code: Code) -> Status {
        match self {
            CallError::Backend(e) => Status::new(code, e.to_string()),
            timeout @ CallError::Timeout(..) => Status::deadline_exceeded(timeout.to_string()),
        }
    }
}

/// Label used for the operation metric status.
fn status_label(status: &Status) -> &'static str {
    match status.code() {
        Code::InvalidArgument => "invalid_argument",
        Code::OutOfRange => "out_of_range",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::Internal => "internal",
        Code::Unimplemented => "unimplemented",
        _ => "error",
    }
}

/// Record the outcome of an RPC on its timer and pass it through.
fn finish<T>(timer: OperationTimer, result: Result<T, Status>) -> Result<Response<T>, Status> {
    match result {
        Ok(response) => {
            timer.success();
            Ok(Response::new(response))
        }
        Err(status) => {
            timer.failure(status_label(&status));
            Err(status)
        }
    }
}

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation and deletion
/// - Volume publication (attach to a node)
/// - Capability reporting
///
/// The backend client and the registry are injected; the service itself
/// holds no other mutable state.
pub struct ControllerService {
    driver: Arc<DriverInfo>,
    backend: Arc<dyn VolumeBackend>,
    registry: Arc<VolumeRegistry>,
    backend_timeout: Duration,
}

impl ControllerService {
    pub fn new(
        driver: Arc<DriverInfo>,
        backend: Arc<dyn VolumeBackend>,
        registry: Arc<VolumeRegistry>,
        backend_timeout: Duration,
    ) -> Self {
        Self {
            driver,
            backend,
            registry,
            backend_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    /// Run one backend call under the configured timeout.
    ///
    /// A timed out call is abandoned here but may still complete on the
    /// backend; callers rely on tag discovery to pick up such disks later.
    async fn call_backend<T, F>(&self, call: BackendCall, fut: F) -> Result<T, CallError>
    where
        F: Future<Output = backend::Result<T>>,
    {
        let outcome = match tokio::time::timeout(self.backend_timeout, fut).await {
            Ok(result) => result.map_err(CallError::from),
            Err(_) => Err(CallError::Timeout(call, self.backend_timeout)),
        };
        metrics::record_backend_call(call.as_str(), outcome.is_ok());
        outcome
    }

    /// Reject capabilities whose access mode the driver does not declare.
    fn validate_capabilities(&self, capabilities: &[csi::VolumeCapability]) -> Result<(), Status> {
        use csi::volume_capability::access_mode::Mode;

        for capability in capabilities {
            let mode = capability
                .access_mode
                .as_ref()
                .ok_or_else(|| Status::invalid_argument("Volume capability access mode is required"))?
                .mode;

            if !self.driver.supports_access_mode(mode) {
                let mode_name = Mode::try_from(mode)
                    .map(|m| m.as_str_name())
                    .unwrap_or("UNKNOWN");
                return Err(Status::invalid_argument(format!(
                    "Access mode {} is not supported",
                    mode_name
                )));
            }
        }
        Ok(())
    }

    async fn create(&self, req: csi::CreateVolumeRequest) -> Result<csi::Volume, Status> {
        let name = req.name.as_str();

        if name.is_empty() {
            return Err(Status::invalid_argument("Volume name is required"));
        }

        info!(name = %name, "CreateVolume request");

        self.validate_capabilities(&req.volume_capabilities)?;
        let capacity_gib = capacity::quantize(req.capacity_range.as_ref())?;
        let capacity_bytes = capacity::gib_to_bytes(capacity_gib)?;

        // Held until the record is inserted, across every backend call below
        let guard = self.registry.lock(name).await;

        if let Some(record) = guard.get().await {
            info!(
                name = %name,
                volume_id = %record.volume_id,
                "Volume already registered, returning existing volume"
            );
            return Ok(volume(record.volume_id, record.capacity_bytes));
        }

        let existing = self
            .call_backend(
                BackendCall::FindVolumesByTag,
                self.backend.find_volumes_by_tag(VOLUME_NAME_TAG, name),
            )
            .await
            .map_err(|e| {
                error!(name = %name, error = %e, "Failed to query backend for existing volume");
                e.into_status(Code::Internal)
            })?;

        let volume_id = match existing.as_slice() {
            [] => {
                debug!(name = %name, capacity_gib, "Creating backend disk");
                let tags = HashMap::from([(VOLUME_NAME_TAG.to_string(), name.to_string())]);
                self.call_backend(
                    BackendCall::CreateDisk,
                    self.backend.create_disk(capacity_gib, tags),
                )
                .await
                .map_err(|e| {
                    error!(name = %name, error = %e, "Failed to create backend disk");
                    e.into_status(Code::Internal)
                })?
            }
            [found] => {
                info!(name = %name, volume_id = %found, "Adopting existing backend disk");
                found.clone()
            }
            _ => {
                error!(
                    name = %name,
                    volume_ids = ?existing,
                    "Multiple backend disks carry the same volume name"
                );
                return Err(Status::internal(format!(
                    "multiple volumes with same name '{}': {}",
                    name,
                    existing.join(", ")
                )));
            }
        };

        let record = guard.insert(&volume_id, capacity_bytes).await;

        info!(
            name = %name,
            volume_id = %record.volume_id,
            capacity_bytes = record.capacity_bytes,
            "Volume created successfully"
        );

        Ok(volume(record.volume_id, record.capacity_bytes))
    }

    async fn delete(&self, req: csi::DeleteVolumeRequest) -> Result<(), Status> {
        let volume_id = req.volume_id.as_str();

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %volume_id, "DeleteVolume request");

        // Callers may pass either the volume name or the backend handle
        let resolved = match self.registry.get(volume_id).await {
            Some(record) => Some(record),
            None => self.registry.find_by_volume_id(volume_id).await,
        };

        match resolved {
            Some(resolved) => {
                let guard = self.registry.lock(&resolved.name).await;
                // The name may have been deleted and provisioned again since the lookup
                match guard.get().await {
                    Some(current) if current.volume_id == resolved.volume_id => {
                        guard.remove().await;
                        debug!(name = %resolved.name, volume_id = %resolved.volume_id, "Resolved volume through registry");
                    }
                    Some(current) => {
                        debug!(
                            name = %resolved.name,
                            volume_id = %resolved.volume_id,
                            current_volume_id = %current.volume_id,
                            "Name now bound to another volume, keeping its record"
                        );
                    }
                    None => {
                        debug!(name = %resolved.name, "Volume record already removed by a concurrent delete");
                    }
                }
                self.delete_disk(&resolved.volume_id).await;
            }
            None => self.delete_disk(volume_id).await,
        }

        info!(volume_id = %volume_id, "Volume deleted successfully");
        Ok(())
    }

    /// Best-effort backend delete. Failures are logged and counted, never returned.
    async fn delete_disk(&self, handle: &str) {
        match self
            .call_backend(BackendCall::DeleteDisk, self.backend.delete_disk(handle))
            .await
        {
            Ok(()) => debug!(volume_id = %handle, "Backend disk deleted"),
            Err(CallError::Backend(BackendError::NotFound(_))) => {
                warn!(volume_id = %handle, "Backend disk not found, treating as already deleted");
            }
            Err(e) => {
                warn!(
                    volume_id = %handle,
                    error = %e,
                    "Backend delete failed, reporting success; disk may be orphaned"
                );
                metrics::record_swallowed_delete_failure();
            }
        }
    }

    async fn publish(
        &self,
        req: csi::ControllerPublishVolumeRequest,
    ) -> Result<csi::ControllerPublishVolumeResponse, Status> {
        let volume_id = req.volume_id.as_str();
        let node_id = req.node_id.as_str();

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if node_id.is_empty() {
            return Err(Status::invalid_argument("Node ID is required"));
        }

        info!(volume_id = %volume_id, node_id = %node_id, "ControllerPublishVolume request");

        let device_path = self
            .call_backend(
                BackendCall::AttachDisk,
                self.backend.attach_disk(volume_id, node_id),
            )
            .await
            .map_err(|e| {
                error!(volume_id = %volume_id, node_id = %node_id, error = %e, "Failed to attach backend disk");
                e.into_status(Code::InvalidArgument)
            })?;

        info!(
            volume_id = %volume_id,
            node_id = %node_id,
            device_path = %device_path,
            "Volume published successfully"
        );

        Ok(csi::ControllerPublishVolumeResponse {
            publish_context: HashMap::from([(DEVICE_PATH_KEY.to_string(), device_path)]),
        })
    }

    fn unpublish(&self, req: csi::ControllerUnpublishVolumeRequest) -> Result<(), Status> {
        match self.driver.unpublish_policy {
            UnpublishPolicy::Unimplemented => Err(Status::unimplemented(
                "ControllerUnpublishVolume is not supported",
            )),
            UnpublishPolicy::NoOp => {
                if req.volume_id.is_empty() {
                    return Err(Status::invalid_argument("Volume ID is required"));
                }
                info!(
                    volume_id = %req.volume_id,
                    node_id = %req.node_id,
                    "ControllerUnpublishVolume acknowledged without detaching"
                );
                Ok(())
            }
        }
    }
}

fn volume(volume_id: String, capacity_bytes: i64) -> csi::Volume {
    csi::Volume {
        capacity_bytes,
        volume_id,
        volume_context: HashMap::new(),
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume, or return the one already provisioned for the name.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let result = self
            .create(request.into_inner())
            .await
            .map(|volume| csi::CreateVolumeResponse {
                volume: Some(volume),
            });
        finish(timer, result)
    }

    /// Delete a volume. Backend failures never fail the RPC.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let result = self
            .delete(request.into_inner())
            .await
            .map(|()| csi::DeleteVolumeResponse {});
        finish(timer, result)
    }

    /// Attach a volume to a node.
    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("publish_volume");
        let result = self.publish(request.into_inner()).await;
        finish(timer, result)
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("unpublish_volume");
        let result = self
            .unpublish(request.into_inner())
            .map(|()| csi::ControllerUnpublishVolumeResponse {});
        finish(timer, result)
    }

    async fn validate_volume_capabilities(
        &self,
        _request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        Err(Status::unimplemented(
            "ValidateVolumeCapabilities is not supported",
        ))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("ListVolumes is not supported"))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not supported"))
    }

    /// Report the declared controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities: self.driver.controller_service_capabilities(),
        }))
    }
}
