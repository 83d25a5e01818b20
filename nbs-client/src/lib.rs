//! Network Block Store control-plane clients
//!
//! Typed clients for the block store and file store control planes, used by
//! the CSI node plugin to start and stop endpoints, and a multi-zone client
//! that clones disks between availability zones.

pub mod client;
pub mod error;
pub mod grpc;
pub mod metrics;
pub mod multi_zone;
pub mod types;

/// Generated protobuf types
pub mod proto {
    pub mod blockstore {
        tonic::include_proto!("nbs.blockstore.v1");
    }

    pub mod filestore {
        tonic::include_proto!("nbs.filestore.v1");
    }
}

pub use client::{BlockStoreClient, FileStoreClient};
pub use error::{ClientError, Result};
pub use grpc::{GrpcBlockStoreClient, GrpcFileStoreClient, TlsConfig};
pub use multi_zone::{CloneError, CloneTask, MultiZoneClient};
pub use types::{
    CreateVolumeParams, EncryptionDesc, FsEndpointConfig, IpcMode, StartEndpointRequest,
    StartEndpointResponse, VolumeConfig,
};
