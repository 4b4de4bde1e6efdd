//! CSI Identity Service Implementation
//!
//! Provides plugin identification and capability reporting to Kubernetes.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::csi;
use crate::driver::DriverInfo;

/// CSI Identity Service
///
/// Implements the CSI Identity service which provides:
/// - Plugin identification (name and version)
/// - Plugin capability reporting
/// - Readiness probing
pub struct IdentityService {
    driver: Arc<DriverInfo>,
}

impl IdentityService {
    pub fn new(driver: Arc<DriverInfo>) -> Self {
        Self { driver }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Returns the name and version of the CSI plugin.
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        debug!(name = %self.driver.name, version = %self.driver.version, "GetPluginInfo request");

        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.driver.name.clone(),
            vendor_version: self.driver.version.clone(),
            manifest: HashMap::new(),
        }))
    }

    /// Returns the capabilities of the CSI plugin.
    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::PluginCapability {
            r#type: Some(csi::plugin_capability::Type::Service(
                csi::plugin_capability::Service {
                    r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                },
            )),
        }];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    /// Probes the plugin to check if it is ready.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        // The plugin is ready when this service is running
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DRIVER_NAME, DRIVER_VERSION};
    use csi::identity_server::Identity;

    fn service() -> IdentityService {
        IdentityService::new(Arc::new(DriverInfo::new("node-1")))
    }

    #[tokio::test]
    async fn test_get_plugin_info() {
        let service = service();
        let request = Request::new(csi::GetPluginInfoRequest {});
        let response = Identity::get_plugin_info(&service, request).await.unwrap();
        let info = response.into_inner();

        assert_eq!(info.name, DRIVER_NAME);
        assert_eq!(info.vendor_version, DRIVER_VERSION);
    }

    #[tokio::test]
    async fn test_get_plugin_capabilities() {
        let service = service();
        let request = Request::new(csi::GetPluginCapabilitiesRequest {});
        let response = Identity::get_plugin_capabilities(&service, request).await.unwrap();
        let caps = response.into_inner();

        // Controller service only
        assert_eq!(caps.capabilities.len(), 1);
        assert!(matches!(
            &caps.capabilities[0].r#type,
            Some(csi::plugin_capability::Type::Service(s))
                if s.r#type == csi::plugin_capability::service::Type::ControllerService as i32
        ));
    }

    #[tokio::test]
    async fn test_probe() {
        let service = service();
        let request = Request::new(csi::ProbeRequest {});
        let response = Identity::probe(&service, request).await.unwrap();
        let probe = response.into_inner();

        assert_eq!(probe.ready, Some(true));
    }
}
