//! CSI Node Service Implementation
//!
//! Reports node identity to the orchestrator. Device staging and mounting
//! happen outside this plugin, so the volume RPCs are unimplemented.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::info;

use crate::csi;
use crate::driver::DriverInfo;

/// CSI Node Service
pub struct NodeService {
    driver: Arc<DriverInfo>,
}

impl NodeService {
    pub fn new(driver: Arc<DriverInfo>) -> Self {
        Self { driver }
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeStageVolume is not supported"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeUnstageVolume is not supported"))
    }

    async fn node_publish_volume(
        &self,
        _request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        Err(Status::unimplemented("NodePublishVolume is not supported"))
    }

    async fn node_unpublish_volume(
        &self,
        _request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeUnpublishVolume is not supported"))
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!(node_id = %self.driver.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.driver.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }

    /// Report node capabilities. No staging is advertised.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: vec![],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi::node_server::Node;

    fn service() -> NodeService {
        NodeService::new(Arc::new(DriverInfo::new("test-node-1")))
    }

    #[tokio::test]
    async fn test_node_get_info() {
        let info = service()
            .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.node_id, "test-node-1");
        assert_eq!(info.max_volumes_per_node, 0);
    }

    #[tokio::test]
    async fn test_node_get_capabilities_empty() {
        let caps = service()
            .node_get_capabilities(Request::new(csi::NodeGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(caps.capabilities.is_empty());
    }

    #[tokio::test]
    async fn test_volume_rpcs_unimplemented() {
        let svc = service();

        let err = svc
            .node_stage_volume(Request::new(csi::NodeStageVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unimplemented);

        let err = svc
            .node_publish_volume(Request::new(csi::NodePublishVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unimplemented);
    }
}
