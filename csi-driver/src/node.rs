//! CSI Node Service Implementation
//!
//! Publishes network block store disks and file store filesystems to pods
//! on this node. Staging is a validated no-op: the endpoint is started at
//! publish time, once the pod that will consume it is known.
//!
//! Endpoint and mount work is delegated to [`VolumeEndpointManager`].

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::csi;
use crate::endpoint::{PublishTarget, VolumeEndpointManager};
use crate::error::NodeError;
use crate::metrics::OperationTimer;
use crate::target_path::TargetPath;
use crate::types::{AccessKind, Backend, ExecutionMode, publish_route};

/// Topology segment key carrying the node ID
pub const TOPOLOGY_NODE_KEY: &str = "topology.nbs.csi/node";

/// CSI Node Service
pub struct NodeService {
    /// The node identifier for this CSI node
    node_id: String,
    execution_mode: ExecutionMode,
    endpoints: VolumeEndpointManager,
}

impl NodeService {
    pub fn new(
        node_id: String,
        execution_mode: ExecutionMode,
        endpoints: VolumeEndpointManager,
    ) -> Self {
        Self {
            node_id,
            execution_mode,
            endpoints,
        }
    }

    /// Validate that a target path is absolute and free of `..` components.
    fn validate_path(path: &str) -> Result<(), NodeError> {
        let path = Path::new(path);

        if !path.is_absolute() {
            return Err(NodeError::InvalidArgument(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }

        if path.components().any(|c| c == Component::ParentDir) {
            return Err(NodeError::InvalidArgument(
                "Path cannot contain '..' (path traversal)".to_string(),
            ));
        }

        Ok(())
    }

    fn require(value: &str, message: &str) -> Result<(), NodeError> {
        if value.is_empty() {
            return Err(NodeError::InvalidArgument(message.to_string()));
        }
        Ok(())
    }

    fn validate_stage(req: &csi::NodeStageVolumeRequest) -> Result<(), NodeError> {
        Self::require(&req.volume_id, "Volume ID is required")?;
        Self::require(&req.staging_target_path, "Staging target path is required")?;
        if req.volume_capability.is_none() {
            return Err(NodeError::InvalidArgument(
                "Volume capability is required".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_unstage(req: &csi::NodeUnstageVolumeRequest) -> Result<(), NodeError> {
        Self::require(&req.volume_id, "Volume ID is required")?;
        Self::require(&req.staging_target_path, "Staging target path is required")
    }

    async fn publish(&self, req: csi::NodePublishVolumeRequest) -> Result<(), NodeError> {
        Self::require(&req.volume_id, "Volume ID is required")?;
        Self::require(&req.staging_target_path, "Staging target path is required")?;
        Self::require(&req.target_path, "Target path is required")?;
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| NodeError::InvalidArgument("Volume capability is required".into()))?;
        if req.volume_context.is_empty() {
            return Err(NodeError::InvalidArgument(
                "Volume context is required".to_string(),
            ));
        }
        Self::validate_path(&req.target_path)?;

        let target_path = PathBuf::from(&req.target_path);
        let pod_id = TargetPath::parse(&target_path)
            .map(|parsed| parsed.pod_id)
            .map_err(|e| NodeError::Internal(format!("Pod UID missing in target path: {}", e)))?;

        let (access, mount) = match &capability.access_type {
            Some(csi::volume_capability::AccessType::Mount(mount)) => {
                (AccessKind::Mount, Some(mount))
            }
            Some(csi::volume_capability::AccessType::Block(_)) => (AccessKind::Block, None),
            None => return Err(NodeError::InvalidArgument("Unknown access type".to_string())),
        };

        let backend = backend_of(&req.volume_context)?;
        let route = publish_route(self.execution_mode, access, backend);

        info!(
            volume_id = %req.volume_id,
            pod_id = %pod_id,
            target_path = %req.target_path,
            mode = %self.execution_mode,
            access = %access,
            backend = %backend,
            route = ?route,
            "NodePublishVolume request"
        );

        let target = PublishTarget {
            pod_id,
            volume_id: req.volume_id.clone(),
            target_path,
            fs_type: mount.map(|m| m.fs_type.clone()).unwrap_or_default(),
            mount_flags: mount.map(|m| m.mount_flags.clone()).unwrap_or_default(),
        };

        self.endpoints.publish(route, &target).await?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "Volume published successfully"
        );
        Ok(())
    }

    async fn unpublish(&self, req: csi::NodeUnpublishVolumeRequest) -> Result<(), NodeError> {
        Self::require(&req.volume_id, "Volume ID is required")?;
        Self::require(&req.target_path, "Target path is required")?;
        Self::validate_path(&req.target_path)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        self.endpoints
            .unpublish(&req.volume_id, Path::new(&req.target_path))
            .await?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "Volume unpublished successfully"
        );
        Ok(())
    }
}

fn backend_of(volume_context: &HashMap<String, String>) -> Result<Backend, NodeError> {
    Backend::from_volume_context(volume_context)
        .map_err(|e| NodeError::InvalidArgument(e.to_string()))
}

/// Record the outcome of a node operation and convert it for the wire.
fn finish<T>(timer: OperationTimer, result: Result<T, NodeError>) -> Result<Response<T>, Status> {
    match result {
        Ok(response) => {
            timer.success();
            Ok(Response::new(response))
        }
        Err(e) => {
            error!(operation = timer.operation(), error = %e, "Node operation failed");
            timer.failure(e.kind());
            Err(e.into())
        }
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Staging only validates the request; the endpoint is started on publish.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_stage_volume");
        let req = request.into_inner();

        let result = Self::validate_stage(&req).map(|()| {
            info!(
                volume_id = %req.volume_id,
                staging_target_path = %req.staging_target_path,
                "NodeStageVolume request"
            );
            csi::NodeStageVolumeResponse {}
        });

        finish(timer, result)
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unstage_volume");
        let req = request.into_inner();

        let result = Self::validate_unstage(&req).map(|()| {
            info!(
                volume_id = %req.volume_id,
                staging_target_path = %req.staging_target_path,
                "NodeUnstageVolume request"
            );
            csi::NodeUnstageVolumeResponse {}
        });

        finish(timer, result)
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        let result = self.publish(request.into_inner()).await;
        finish(timer, result.map(|()| csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        let result = self.unpublish(request.into_inner()).await;
        finish(timer, result.map(|()| csi::NodeUnpublishVolumeResponse {}))
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!(node_id = %self.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: Some(csi::Topology {
                segments: HashMap::from([(TOPOLOGY_NODE_KEY.to_string(), self.node_id.clone())]),
            }),
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc {
                    r#type: csi::node_service_capability::rpc::Type::StageUnstageVolume as i32,
                },
            )),
        }];

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeExpandVolume is not supported"))
    }

    /// Get volume statistics (not implemented).
    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }
}
