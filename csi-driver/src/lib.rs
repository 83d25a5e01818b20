//! NBS CSI Driver Library
//!
//! Kubernetes CSI node plugin that exposes Network Block Store disks and
//! file store filesystems to pods, either as vhost-user sockets for virtual
//! machines or as mounted filesystems and block devices for containers.
//!
//! This library provides:
//! - CSI Identity and Node service implementations
//! - Endpoint lifecycle management against the block and file store control planes
//! - Platform mount and filesystem provisioning

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod endpoint;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod platform;
pub mod target_path;
pub mod types;

pub use endpoint::{EndpointSettings, PublishTarget, VolumeEndpointManager};
pub use error::NodeError;
pub use identity::IdentityService;
pub use node::NodeService;
pub use types::{AccessKind, Backend, ExecutionMode, PublishRoute};
