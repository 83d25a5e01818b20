//! Control-plane client contracts.
//!
//! The node plugin and the clone orchestrator are written against these
//! traits; `crate::grpc` provides the production implementations and tests
//! substitute recording fakes.

use std::path::Path;

use crate::error::Result;
use crate::types::{
    CreateVolumeParams, FsEndpointConfig, StartEndpointRequest, StartEndpointResponse,
    VolumeConfig,
};

/// Block store control plane.
#[tonic::async_trait]
pub trait BlockStoreClient: Send + Sync {
    /// Read the full configuration of a volume. Missing volumes yield
    /// `ClientError::NotFound`.
    async fn describe_volume(&self, disk_id: &str) -> Result<VolumeConfig>;

    /// Create a volume. A racing writer yields `ClientError::Aborted`.
    async fn create_volume(&self, params: CreateVolumeParams) -> Result<()>;

    /// Delete a volume only if it still carries `fill_generation`.
    ///
    /// A volume that has moved on to a newer generation is left untouched
    /// and the control plane reports the mismatch as an error.
    async fn delete_volume_with_fill_generation(
        &self,
        disk_id: &str,
        fill_generation: u64,
    ) -> Result<()>;

    /// Start an endpoint. Starting the same endpoint twice is idempotent on
    /// the control-plane side.
    async fn start_endpoint(&self, request: StartEndpointRequest)
    -> Result<StartEndpointResponse>;

    async fn stop_endpoint(&self, unix_socket_path: &Path) -> Result<()>;
}

/// File store endpoint control plane.
#[tonic::async_trait]
pub trait FileStoreClient: Send + Sync {
    async fn start_endpoint(&self, config: FsEndpointConfig) -> Result<()>;

    async fn stop_endpoint(&self, socket_path: &Path) -> Result<()>;
}
