//! Volume endpoint lifecycle
//!
//! Starts and stops block store and file store endpoints for a pod's volume
//! and wires them into the pod's target path.
//!
//! Every (pod, volume) pair owns one endpoint directory, reachable through
//! two roots that name the same host directory:
//! - the node root (`--nbs-sockets-dir`), where the control plane creates
//!   sockets and where stop requests point;
//! - the local root (`--pod-sockets-dir`), where this plugin sees the
//!   directory, checks for sockets and bind-mounts it from.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nbs_client::types::{
    FsEndpointConfig, IpcMode, StartEndpointRequest, VHOST_QUEUES_COUNT, VolumeAccessMode,
    VolumeMountMode,
};
use nbs_client::{BlockStoreClient, FileStoreClient};
use tracing::{debug, info, instrument};

use crate::error::NodeError;
use crate::platform::{DEFAULT_FS_TYPE, FilesystemProvisioner, Mounter};
use crate::target_path::TargetPath;
use crate::types::{Backend, PublishRoute};

/// Block store socket name inside an endpoint directory
pub const NBS_SOCKET_NAME: &str = "nbs.sock";
/// File store socket name inside an endpoint directory
pub const NFS_SOCKET_NAME: &str = "nfs.sock";
/// Placeholder image that keeps the VM launcher from allocating one
pub const DISK_IMAGE_NAME: &str = "disk.img";

const ENDPOINT_DIR_MODE: u32 = 0o777;
const TARGET_DIR_MODE: u32 = 0o755;
const BLOCK_TARGET_PARENT_MODE: u32 = 0o750;
const PLACEHOLDER_FILE_MODE: u32 = 0o660;

/// Settings shared by every endpoint on this node.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    /// Client ID presented to the control planes
    pub client_id: String,
    /// Endpoint root as seen by the control planes
    pub nbs_sockets_dir: PathBuf,
    /// Endpoint root as seen by this plugin
    pub pod_sockets_dir: PathBuf,
}

/// A validated publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub pod_id: String,
    pub volume_id: String,
    pub target_path: PathBuf,
    /// Requested filesystem; empty means the default
    pub fs_type: String,
    pub mount_flags: Vec<String>,
}

pub struct VolumeEndpointManager {
    settings: EndpointSettings,
    nbs: Arc<dyn BlockStoreClient>,
    nfs: Option<Arc<dyn FileStoreClient>>,
    mounter: Arc<dyn Mounter>,
    provisioner: Arc<dyn FilesystemProvisioner>,
}

impl VolumeEndpointManager {
    pub fn new(
        settings: EndpointSettings,
        nbs: Arc<dyn BlockStoreClient>,
        mounter: Arc<dyn Mounter>,
        provisioner: Arc<dyn FilesystemProvisioner>,
    ) -> Self {
        Self {
            settings,
            nbs,
            nfs: None,
            mounter,
            provisioner,
        }
    }

    /// Enable file store volumes.
    pub fn with_filestore(mut self, nfs: Arc<dyn FileStoreClient>) -> Self {
        self.nfs = Some(nfs);
        self
    }

    pub fn settings(&self) -> &EndpointSettings {
        &self.settings
    }

    /// Endpoint directory under the local root
    pub fn local_endpoint_dir(&self, pod_id: &str, volume_id: &str) -> PathBuf {
        self.settings.pod_sockets_dir.join(pod_id).join(volume_id)
    }

    /// Endpoint directory under the node root
    pub fn node_endpoint_dir(&self, pod_id: &str, volume_id: &str) -> PathBuf {
        self.settings.nbs_sockets_dir.join(pod_id).join(volume_id)
    }

    /// Run the provisioning routine for a route.
    pub async fn publish(&self, route: PublishRoute, target: &PublishTarget) -> Result<(), NodeError> {
        match route {
            PublishRoute::DiskAsVhostSocket => self.publish_disk_as_vhost_socket(target).await,
            PublishRoute::DiskAsFilesystem => self.publish_disk_as_filesystem(target).await,
            PublishRoute::DiskAsBlockDevice => self.publish_disk_as_block_device(target).await,
            PublishRoute::FileStoreAsVhostSocket => {
                self.publish_filestore_as_vhost_socket(target).await
            }
            PublishRoute::Reject(reason) => Err(NodeError::InvalidArgument(reason.to_string())),
        }
    }

    #[instrument(skip(self, target), fields(pod_id = %target.pod_id, volume_id = %target.volume_id))]
    pub async fn publish_disk_as_vhost_socket(&self, target: &PublishTarget) -> Result<(), NodeError> {
        self.start_nbs_endpoint(target, IpcMode::Vhost).await?;
        self.mount_socket_dir(target).await
    }

    #[instrument(skip(self, target), fields(pod_id = %target.pod_id, volume_id = %target.volume_id))]
    pub async fn publish_disk_as_filesystem(&self, target: &PublishTarget) -> Result<(), NodeError> {
        let device = self
            .start_nbs_endpoint(target, IpcMode::NetworkBlockDevice)
            .await?;

        let fs_type = if target.fs_type.is_empty() {
            DEFAULT_FS_TYPE
        } else {
            target.fs_type.as_str()
        };

        self.provisioner.ensure_filesystem(&device, fs_type).await?;

        create_dir_all(&target.target_path, TARGET_DIR_MODE)
            .await
            .map_err(NodeError::io("failed to create target directory", &target.target_path))?;

        self.mounter
            .mount(&device, &target.target_path, Some(fs_type), &target.mount_flags)
            .await?;

        info!(device = %device.display(), fs_type = %fs_type, "Volume mounted as filesystem");
        Ok(())
    }

    #[instrument(skip(self, target), fields(pod_id = %target.pod_id, volume_id = %target.volume_id))]
    pub async fn publish_disk_as_block_device(&self, target: &PublishTarget) -> Result<(), NodeError> {
        let device = self
            .start_nbs_endpoint(target, IpcMode::NetworkBlockDevice)
            .await?;

        self.mount_block_device(&device, &target.target_path).await
    }

    #[instrument(skip(self, target), fields(pod_id = %target.pod_id, volume_id = %target.volume_id))]
    pub async fn publish_filestore_as_vhost_socket(
        &self,
        target: &PublishTarget,
    ) -> Result<(), NodeError> {
        let endpoint_dir = self.local_endpoint_dir(&target.pod_id, &target.volume_id);
        create_dir_all(&endpoint_dir, ENDPOINT_DIR_MODE)
            .await
            .map_err(NodeError::io("failed to create endpoint directory", &endpoint_dir))?;

        let nfs = self
            .nfs
            .as_ref()
            .ok_or_else(|| NodeError::Internal("NFS client wasn't created".to_string()))?;

        let socket_path = self
            .node_endpoint_dir(&target.pod_id, &target.volume_id)
            .join(NFS_SOCKET_NAME);

        nfs.start_endpoint(FsEndpointConfig {
            socket_path: socket_path.clone(),
            file_system_id: target.volume_id.clone(),
            client_id: self.settings.client_id.clone(),
            vhost_queues_count: VHOST_QUEUES_COUNT,
            persistent: true,
        })
        .await
        .map_err(|error| NodeError::StartEndpoint {
            backend: Backend::FileStore,
            volume_id: target.volume_id.clone(),
            error,
        })?;

        info!(socket = %socket_path.display(), "File store endpoint started");

        self.mount_socket_dir(target).await
    }

    /// Start a block store endpoint for the target's pod and volume.
    ///
    /// Returns the kernel device for NBD endpoints; vhost endpoints return
    /// the socket path.
    async fn start_nbs_endpoint(
        &self,
        target: &PublishTarget,
        ipc_mode: IpcMode,
    ) -> Result<PathBuf, NodeError> {
        let endpoint_dir = self.local_endpoint_dir(&target.pod_id, &target.volume_id);
        create_dir_all(&endpoint_dir, ENDPOINT_DIR_MODE)
            .await
            .map_err(NodeError::io("failed to create endpoint directory", &endpoint_dir))?;

        let socket_path = self
            .node_endpoint_dir(&target.pod_id, &target.volume_id)
            .join(NBS_SOCKET_NAME);

        let response = self
            .nbs
            .start_endpoint(StartEndpointRequest {
                unix_socket_path: socket_path.clone(),
                disk_id: target.volume_id.clone(),
                client_id: self.settings.client_id.clone(),
                device_name: target.volume_id.clone(),
                ipc_mode,
                vhost_queues_count: VHOST_QUEUES_COUNT,
                access_mode: VolumeAccessMode::ReadWrite,
                mount_mode: VolumeMountMode::Remote,
                persistent: true,
            })
            .await
            .map_err(|error| NodeError::StartEndpoint {
                backend: Backend::BlockStore,
                volume_id: target.volume_id.clone(),
                error,
            })?;

        match ipc_mode {
            IpcMode::Vhost => {
                info!(socket = %socket_path.display(), "Block store endpoint started");
                Ok(socket_path)
            }
            IpcMode::NetworkBlockDevice => {
                let device = response.nbd_device_file.ok_or_else(|| {
                    NodeError::Internal(format!(
                        "NbdDeviceFile shouldn't be empty for volume {}",
                        target.volume_id
                    ))
                })?;
                info!(device = %device.display(), "Endpoint started with device file");
                Ok(device)
            }
        }
    }

    /// Bind-mount the local endpoint directory at the target path.
    async fn mount_socket_dir(&self, target: &PublishTarget) -> Result<(), NodeError> {
        let endpoint_dir = self.local_endpoint_dir(&target.pod_id, &target.volume_id);

        let image = endpoint_dir.join(DISK_IMAGE_NAME);
        create_placeholder_file(&image)
            .await
            .map_err(|e| NodeError::Internal(format!("Failed to create {}: {}", DISK_IMAGE_NAME, e)))?;

        create_dir_all(&target.target_path, TARGET_DIR_MODE)
            .await
            .map_err(NodeError::io("failed to create target directory", &target.target_path))?;

        let mut options = vec!["bind".to_string()];
        options.extend(target.mount_flags.iter().cloned());

        self.mounter
            .mount(&endpoint_dir, &target.target_path, None, &options)
            .await?;

        info!(
            source = %endpoint_dir.display(),
            target = %target.target_path.display(),
            "Endpoint directory mounted"
        );
        Ok(())
    }

    /// Bind-mount a raw device onto a file at the target path.
    async fn mount_block_device(&self, device: &Path, target_path: &Path) -> Result<(), NodeError> {
        if let Some(parent) = target_path.parent() {
            create_dir_all(parent, BLOCK_TARGET_PARENT_MODE)
                .await
                .map_err(NodeError::io("failed to create target directory", parent))?;
        }

        create_placeholder_file(target_path)
            .await
            .map_err(NodeError::io("failed to create target file", target_path))?;

        self.mounter
            .mount(device, target_path, None, &["bind".to_string()])
            .await?;

        info!(
            device = %device.display(),
            target = %target_path.display(),
            "Device mounted as block device"
        );
        Ok(())
    }

    /// Tear down whatever publish left behind for a target path.
    ///
    /// Each step tolerates its resource being absent already, so repeated
    /// calls converge on the same state.
    #[instrument(skip(self, target_path), fields(target_path = %target_path.display()))]
    pub async fn unpublish(&self, volume_id: &str, target_path: &Path) -> Result<(), NodeError> {
        self.mounter.cleanup_mount_point(target_path).await?;

        // The request carries no pod context; the target path is the only source
        let TargetPath { pod_id, .. } = TargetPath::parse(target_path)?;

        let local_dir = self.local_endpoint_dir(&pod_id, volume_id);
        let node_dir = self.node_endpoint_dir(&pod_id, volume_id);

        if socket_exists(&local_dir.join(NBS_SOCKET_NAME)).await? {
            let socket = node_dir.join(NBS_SOCKET_NAME);
            info!(pod_id = %pod_id, volume_id = %volume_id, "Stopping nbs endpoint");
            if let Err(error) = self.nbs.stop_endpoint(&socket).await {
                return Err(NodeError::StopEndpoint {
                    backend: Backend::BlockStore,
                    socket,
                    error,
                });
            }
        } else {
            debug!(pod_id = %pod_id, volume_id = %volume_id, "No nbs endpoint socket");
        }

        if socket_exists(&local_dir.join(NFS_SOCKET_NAME)).await? {
            let socket = node_dir.join(NFS_SOCKET_NAME);
            info!(pod_id = %pod_id, volume_id = %volume_id, "Stopping nfs endpoint");
            let nfs = self.nfs.as_ref().ok_or_else(|| {
                NodeError::Internal(format!(
                    "NFS client wasn't created, can't stop endpoint {}",
                    socket.display()
                ))
            })?;
            if let Err(error) = nfs.stop_endpoint(&socket).await {
                return Err(NodeError::StopEndpoint {
                    backend: Backend::FileStore,
                    socket,
                    error,
                });
            }
        } else {
            debug!(pod_id = %pod_id, volume_id = %volume_id, "No nfs endpoint socket");
        }

        match tokio::fs::remove_dir_all(&local_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %local_dir.display(), "Endpoint directory already removed");
            }
            Err(error) => {
                return Err(NodeError::RemoveEndpointDir {
                    path: local_dir,
                    error,
                });
            }
        }

        Ok(())
    }
}

async fn create_dir_all(path: &Path, mode: u32) -> std::io::Result<()> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .await
}

/// Create an empty file unless one is already there.
async fn create_placeholder_file(path: &Path) -> std::io::Result<()> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(PLACEHOLDER_FILE_MODE)
        .open(path)
        .await?;
    Ok(())
}

async fn socket_exists(path: &Path) -> Result<bool, NodeError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(NodeError::io("failed to check endpoint socket", path))
}
