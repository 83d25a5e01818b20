//! Control-plane request and response types.
//!
//! These are the shapes the node plugin and the clone orchestrator work
//! with. Each converts to or from the generated proto messages at the gRPC
//! boundary so callers never touch raw `i32` enum fields.

use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

use crate::proto::{blockstore, filestore};

pub use crate::proto::blockstore::{
    EncryptionMode, StorageMediaKind, VolumeAccessMode, VolumeMountMode,
};

/// Number of vhost queues requested for every endpoint.
pub const VHOST_QUEUES_COUNT: u32 = 8;

// ============================================================================
// IpcMode
// ============================================================================

/// How a started endpoint is exposed on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpcMode {
    /// vhost-user-blk socket consumed by a virtual machine
    Vhost,
    /// Kernel network block device (`/dev/nbdN`)
    NetworkBlockDevice,
}

impl Display for IpcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcMode::Vhost => write!(f, "vhost"),
            IpcMode::NetworkBlockDevice => write!(f, "nbd"),
        }
    }
}

impl FromStr for IpcMode {
    type Err = IpcModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vhost" => Ok(IpcMode::Vhost),
            "nbd" => Ok(IpcMode::NetworkBlockDevice),
            _ => Err(IpcModeParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid IPC mode.
#[derive(Debug, Clone)]
pub struct IpcModeParseError(String);

impl Display for IpcModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown ipc mode '{}': expected 'vhost' or 'nbd'", self.0)
    }
}

impl std::error::Error for IpcModeParseError {}

impl From<IpcMode> for blockstore::IpcType {
    fn from(value: IpcMode) -> Self {
        match value {
            IpcMode::Vhost => blockstore::IpcType::Vhost,
            IpcMode::NetworkBlockDevice => blockstore::IpcType::Nbd,
        }
    }
}

// ============================================================================
// Volumes
// ============================================================================

/// Encryption descriptor of an existing volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionDesc {
    pub mode: EncryptionMode,
    /// Hash of the key; the key material itself never leaves the control plane.
    pub key_hash: Vec<u8>,
}

/// Full configuration of a volume as returned by DescribeVolume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeConfig {
    pub disk_id: String,
    pub block_size: u32,
    pub blocks_count: u64,
    pub storage_media_kind: StorageMediaKind,
    pub tablet_version: u32,
    pub partitions_count: u32,
    pub cloud_id: String,
    pub folder_id: String,
    pub project_id: String,
    pub channels_count: u32,
    pub is_system: bool,
    pub base_disk_id: String,
    pub base_disk_checkpoint_id: String,
    pub encryption: EncryptionDesc,
    pub placement_group_id: String,
    pub placement_partition_index: u32,
    /// Generation of the clone attempt that created this volume (0 if never cloned)
    pub fill_generation: u64,
    /// Set by the control plane once the clone copy has completed
    pub is_fill_finished: bool,
}

impl From<blockstore::Volume> for VolumeConfig {
    fn from(volume: blockstore::Volume) -> Self {
        let storage_media_kind = volume.storage_media_kind();
        let encryption = volume
            .encryption_desc
            .map(|desc| EncryptionDesc {
                mode: desc.mode(),
                key_hash: desc.key_hash,
            })
            .unwrap_or_default();

        Self {
            disk_id: volume.disk_id,
            block_size: volume.block_size,
            blocks_count: volume.blocks_count,
            storage_media_kind,
            tablet_version: volume.tablet_version,
            partitions_count: volume.partitions_count,
            cloud_id: volume.cloud_id,
            folder_id: volume.folder_id,
            project_id: volume.project_id,
            channels_count: volume.channels_count,
            is_system: volume.is_system,
            base_disk_id: volume.base_disk_id,
            base_disk_checkpoint_id: volume.base_disk_checkpoint_id,
            encryption,
            placement_group_id: volume.placement_group_id,
            placement_partition_index: volume.placement_partition_index,
            fill_generation: volume.fill_generation,
            is_fill_finished: volume.is_fill_finished,
        }
    }
}

/// Parameters of a CreateVolume call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateVolumeParams {
    pub disk_id: String,
    pub blocks_count: u64,
    pub block_size: u32,
    pub storage_media_kind: StorageMediaKind,
    pub cloud_id: String,
    pub folder_id: String,
    pub project_id: String,
    pub tablet_version: u32,
    pub placement_group_id: String,
    pub placement_partition_index: u32,
    pub partitions_count: u32,
    pub is_system: bool,
    pub channels_count: u32,
    pub base_disk_id: String,
    pub base_disk_checkpoint_id: String,
    pub encryption: EncryptionDesc,
    pub storage_pool_name: String,
    pub agent_ids: Vec<String>,
    pub fill_generation: u64,
}

impl From<CreateVolumeParams> for blockstore::CreateVolumeRequest {
    fn from(params: CreateVolumeParams) -> Self {
        Self {
            disk_id: params.disk_id,
            blocks_count: params.blocks_count,
            block_size: params.block_size,
            storage_media_kind: params.storage_media_kind as i32,
            cloud_id: params.cloud_id,
            folder_id: params.folder_id,
            project_id: params.project_id,
            tablet_version: params.tablet_version,
            placement_group_id: params.placement_group_id,
            placement_partition_index: params.placement_partition_index,
            partitions_count: params.partitions_count,
            is_system: params.is_system,
            channels_count: params.channels_count,
            base_disk_id: params.base_disk_id,
            base_disk_checkpoint_id: params.base_disk_checkpoint_id,
            encryption_spec: Some(blockstore::EncryptionSpec {
                mode: params.encryption.mode as i32,
                key_param: Some(blockstore::encryption_spec::KeyParam::KeyHash(
                    params.encryption.key_hash,
                )),
            }),
            storage_pool_name: params.storage_pool_name,
            agent_ids: params.agent_ids,
            fill_generation: params.fill_generation,
        }
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// Request to start a block store endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartEndpointRequest {
    /// Socket path as seen by the control plane (node-visible root)
    pub unix_socket_path: PathBuf,
    pub disk_id: String,
    pub client_id: String,
    pub device_name: String,
    pub ipc_mode: IpcMode,
    pub vhost_queues_count: u32,
    pub access_mode: VolumeAccessMode,
    pub mount_mode: VolumeMountMode,
    /// Survive client disconnects and be restored by the control plane on restart
    pub persistent: bool,
}

impl From<StartEndpointRequest> for blockstore::StartEndpointRequest {
    fn from(request: StartEndpointRequest) -> Self {
        let ipc_type: blockstore::IpcType = request.ipc_mode.into();
        Self {
            unix_socket_path: request.unix_socket_path.to_string_lossy().into_owned(),
            disk_id: request.disk_id,
            client_id: request.client_id,
            device_name: request.device_name,
            ipc_type: ipc_type as i32,
            vhost_queues_count: request.vhost_queues_count,
            volume_access_mode: request.access_mode as i32,
            volume_mount_mode: request.mount_mode as i32,
            persistent: request.persistent,
            use_free_nbd_device_file: request.ipc_mode == IpcMode::NetworkBlockDevice,
            client_profile: Some(blockstore::ClientProfile {
                host_type: blockstore::HostType::Default as i32,
            }),
        }
    }
}

/// Result of starting a block store endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartEndpointResponse {
    /// Kernel device backing the endpoint; only set for NBD endpoints
    pub nbd_device_file: Option<PathBuf>,
}

impl From<blockstore::StartEndpointResponse> for StartEndpointResponse {
    fn from(response: blockstore::StartEndpointResponse) -> Self {
        let nbd_device_file = Some(response.nbd_device_file)
            .filter(|device| !device.is_empty())
            .map(PathBuf::from);
        Self { nbd_device_file }
    }
}

/// Configuration of a file store vhost endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEndpointConfig {
    pub socket_path: PathBuf,
    pub file_system_id: String,
    pub client_id: String,
    pub vhost_queues_count: u32,
    pub persistent: bool,
}

impl From<FsEndpointConfig> for filestore::EndpointConfig {
    fn from(config: FsEndpointConfig) -> Self {
        Self {
            socket_path: config.socket_path.to_string_lossy().into_owned(),
            file_system_id: config.file_system_id,
            client_id: config.client_id,
            vhost_queues_count: config.vhost_queues_count,
            persistent: config.persistent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_mode_from_str() {
        assert_eq!("vhost".parse::<IpcMode>().unwrap(), IpcMode::Vhost);
        assert_eq!("NBD".parse::<IpcMode>().unwrap(), IpcMode::NetworkBlockDevice);
        assert!("grpc".parse::<IpcMode>().is_err());
    }

    #[test]
    fn test_ipc_mode_to_proto() {
        let proto: blockstore::IpcType = IpcMode::Vhost.into();
        assert_eq!(proto, blockstore::IpcType::Vhost);

        let proto: blockstore::IpcType = IpcMode::NetworkBlockDevice.into();
        assert_eq!(proto, blockstore::IpcType::Nbd);
    }

    #[test]
    fn test_start_endpoint_requests_free_nbd_device_only_for_nbd() {
        let request = StartEndpointRequest {
            unix_socket_path: PathBuf::from("/run/nbsd/sockets/pod/vol/nbs.sock"),
            disk_id: "vol".to_string(),
            client_id: "client".to_string(),
            device_name: "vol".to_string(),
            ipc_mode: IpcMode::NetworkBlockDevice,
            vhost_queues_count: VHOST_QUEUES_COUNT,
            access_mode: VolumeAccessMode::ReadWrite,
            mount_mode: VolumeMountMode::Remote,
            persistent: true,
        };

        let proto: blockstore::StartEndpointRequest = request.clone().into();
        assert!(proto.use_free_nbd_device_file);
        assert_eq!(proto.ipc_type, blockstore::IpcType::Nbd as i32);
        assert_eq!(proto.unix_socket_path, "/run/nbsd/sockets/pod/vol/nbs.sock");
        assert_eq!(proto.volume_mount_mode, VolumeMountMode::Remote as i32);

        let vhost = StartEndpointRequest {
            ipc_mode: IpcMode::Vhost,
            ..request
        };
        let proto: blockstore::StartEndpointRequest = vhost.into();
        assert!(!proto.use_free_nbd_device_file);
    }

    #[test]
    fn test_empty_nbd_device_file_is_none() {
        let response = StartEndpointResponse::from(blockstore::StartEndpointResponse {
            nbd_device_file: String::new(),
        });
        assert_eq!(response.nbd_device_file, None);

        let response = StartEndpointResponse::from(blockstore::StartEndpointResponse {
            nbd_device_file: "/dev/nbd3".to_string(),
        });
        assert_eq!(response.nbd_device_file, Some(PathBuf::from("/dev/nbd3")));
    }

    #[test]
    fn test_volume_from_proto_copies_encryption() {
        let volume = blockstore::Volume {
            disk_id: "disk-1".to_string(),
            block_size: 4096,
            blocks_count: 1024,
            storage_media_kind: StorageMediaKind::Ssd as i32,
            encryption_desc: Some(blockstore::EncryptionDesc {
                mode: EncryptionMode::AesXts as i32,
                key_hash: vec![1, 2, 3],
            }),
            fill_generation: 4,
            is_fill_finished: true,
            ..Default::default()
        };

        let config = VolumeConfig::from(volume);
        assert_eq!(config.disk_id, "disk-1");
        assert_eq!(config.storage_media_kind, StorageMediaKind::Ssd);
        assert_eq!(config.encryption.mode, EncryptionMode::AesXts);
        assert_eq!(config.encryption.key_hash, vec![1, 2, 3]);
        assert_eq!(config.fill_generation, 4);
        assert!(config.is_fill_finished);
    }
}
