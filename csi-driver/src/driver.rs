//! Driver Frontend
//!
//! Static identity and declared capabilities of the plugin, plus the wiring
//! that turns them into the Identity, Controller, and Node services.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::VolumeBackend;
use crate::controller::ControllerService;
use crate::csi;
use crate::identity::IdentityService;
use crate::node::NodeService;
use crate::registry::VolumeRegistry;
use crate::types::UnpublishPolicy;

use csi::controller_service_capability::rpc::Type as RpcType;
use csi::volume_capability::access_mode::Mode as AccessMode;

pub const DRIVER_NAME: &str = "cloudblock.csi.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default bound on a single backend call
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity and capability declarations shared by every service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub name: String,
    pub version: String,
    pub node_id: String,
    pub controller_capabilities: Vec<RpcType>,
    pub access_modes: Vec<AccessMode>,
    pub unpublish_policy: UnpublishPolicy,
}

impl DriverInfo {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            name: DRIVER_NAME.to_string(),
            version: DRIVER_VERSION.to_string(),
            node_id: node_id.into(),
            controller_capabilities: vec![
                RpcType::CreateDeleteVolume,
                RpcType::PublishUnpublishVolume,
                RpcType::ListVolumes,
            ],
            access_modes: vec![AccessMode::SingleNodeWriter],
            unpublish_policy: UnpublishPolicy::default(),
        }
    }

    pub fn with_unpublish_policy(mut self, policy: UnpublishPolicy) -> Self {
        self.unpublish_policy = policy;
        self
    }

    /// Whether `mode` (a raw wire value) is one of the declared access modes.
    pub fn supports_access_mode(&self, mode: i32) -> bool {
        self.access_modes.iter().any(|m| *m as i32 == mode)
    }

    /// Declared controller capabilities in wire form.
    pub fn controller_service_capabilities(&self) -> Vec<csi::ControllerServiceCapability> {
        self.controller_capabilities
            .iter()
            .map(|rpc| csi::ControllerServiceCapability {
                r#type: Some(csi::controller_service_capability::Type::Rpc(
                    csi::controller_service_capability::Rpc {
                        r#type: *rpc as i32,
                    },
                )),
            })
            .collect()
    }
}

/// The assembled plugin: shared declarations plus the injected collaborators.
///
/// Each accessor hands out a service value ready to be wrapped in its
/// generated tonic server; all of them share the same registry and backend.
#[derive(Clone)]
pub struct Driver {
    info: Arc<DriverInfo>,
    backend: Arc<dyn VolumeBackend>,
    registry: Arc<VolumeRegistry>,
    backend_timeout: Duration,
}

impl Driver {
    pub fn new(info: DriverInfo, backend: Arc<dyn VolumeBackend>) -> Self {
        Self {
            info: Arc::new(info),
            backend,
            registry: Arc::new(VolumeRegistry::new()),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn info(&self) -> &Arc<DriverInfo> {
        &self.info
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> IdentityService {
        IdentityService::new(self.info.clone())
    }

    pub fn controller(&self) -> ControllerService {
        ControllerService::new(
            self.info.clone(),
            self.backend.clone(),
            self.registry.clone(),
            self.backend_timeout,
        )
    }

    pub fn node(&self) -> NodeService {
        NodeService::new(self.info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn test_driver_info_defaults() {
        let info = DriverInfo::new("node-1");
        assert_eq!(info.name, DRIVER_NAME);
        assert_eq!(info.version, DRIVER_VERSION);
        assert_eq!(info.node_id, "node-1");
        assert_eq!(info.unpublish_policy, UnpublishPolicy::Unimplemented);
        assert_eq!(info.controller_service_capabilities().len(), 3);
    }

    #[test]
    fn test_supports_access_mode() {
        let info = DriverInfo::new("node-1");
        assert!(info.supports_access_mode(AccessMode::SingleNodeWriter as i32));
        assert!(!info.supports_access_mode(AccessMode::MultiNodeMultiWriter as i32));
        assert!(!info.supports_access_mode(AccessMode::Unknown as i32));
        assert!(!info.supports_access_mode(42));
    }

    #[test]
    fn test_services_share_registry() {
        let driver = Driver::new(DriverInfo::new("node-1"), Arc::new(MemoryBackend::new()));
        let a = driver.controller();
        let b = driver.controller();
        assert!(Arc::ptr_eq(a.registry(), b.registry()));
        assert!(Arc::ptr_eq(a.registry(), driver.registry()));
    }
}
