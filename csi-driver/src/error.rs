use std::io;
use std::path::PathBuf;

use nbs_client::ClientError;
use thiserror::Error;
use tonic::Status;

use crate::platform::{FilesystemError, MountError};
use crate::target_path::TargetPathError;
use crate::types::Backend;

/// Node service failures, classified by how the caller should react.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    MalformedPath(#[from] TargetPathError),

    #[error("failed to start {backend} endpoint for volume {volume_id}: {error}")]
    StartEndpoint {
        backend: Backend,
        volume_id: String,
        #[source]
        error: ClientError,
    },

    #[error("failed to stop {backend} endpoint {}: {error}", .socket.display())]
    StopEndpoint {
        backend: Backend,
        socket: PathBuf,
        #[source]
        error: ClientError,
    },

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    #[error("{context} {}: {error}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        error: io::Error,
    },

    #[error("failed to remove endpoint directory {}: {error}", .path.display())]
    RemoveEndpointDir {
        path: PathBuf,
        #[source]
        error: io::Error,
    },
}

impl NodeError {
    pub fn io(context: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |error| NodeError::Io {
            context,
            path,
            error,
        }
    }

    /// Metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::InvalidArgument(_) => "invalid_argument",
            NodeError::Internal(_) => "internal",
            NodeError::MalformedPath(_) => "malformed_path",
            NodeError::StartEndpoint { .. } => "start_endpoint_failed",
            NodeError::StopEndpoint { .. } => "stop_endpoint_failed",
            NodeError::Mount(_) => "mount_failed",
            NodeError::Filesystem(_) => "filesystem_failed",
            NodeError::Io { .. } => "io_failed",
            NodeError::RemoveEndpointDir { .. } => "remove_endpoint_dir_failed",
        }
    }
}

impl From<NodeError> for Status {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::InvalidArgument(msg) => Status::invalid_argument(msg),
            NodeError::RemoveEndpointDir { .. } => Status::unknown(err.to_string()),
            NodeError::Internal(_)
            | NodeError::MalformedPath(_)
            | NodeError::StartEndpoint { .. }
            | NodeError::StopEndpoint { .. }
            | NodeError::Mount(_)
            | NodeError::Filesystem(_)
            | NodeError::Io { .. } => Status::internal(err.to_string()),
        }
    }
}
