//! Host operations for the CSI Node service
//!
//! Mounting and filesystem provisioning are expressed as traits so the
//! node service can be driven by fakes in tests. The Linux implementations
//! shell out to `mount`, `umount`, `blkid` and `mkfs`.
//!
//! # Usage
//!
//! ```ignore
//! use crate::platform::{FilesystemProvisioner, Mounter, SystemMounter, SystemProvisioner};
//!
//! let provisioner = SystemProvisioner::new();
//! provisioner.ensure_filesystem(Path::new("/dev/nbd0"), "ext4").await?;
//!
//! let mounter = SystemMounter::new();
//! mounter.mount(Path::new("/dev/nbd0"), target, Some("ext4"), &[]).await?;
//! ```

mod linux;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use linux::{DEFAULT_FS_TYPE, SystemMounter, SystemProvisioner};

/// Failure of a mount table operation.
#[derive(Error, Debug)]
pub enum MountError {
    #[error("failed to execute {tool}: {error}")]
    Spawn {
        tool: String,
        #[source]
        error: io::Error,
    },

    #[error("mount {} on {} failed: {output}", .mount_source.display(), .target.display())]
    Mount {
        mount_source: PathBuf,
        target: PathBuf,
        output: String,
    },

    #[error("umount {} failed: {output}", .target.display())]
    Unmount { target: PathBuf, output: String },

    #[error("{context} {}: {error}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        error: io::Error,
    },
}

/// Failure to put a filesystem on a device.
#[derive(Error, Debug)]
pub enum FilesystemError {
    #[error("failed to find '{tool}' tool: {error}")]
    ToolNotFound {
        tool: String,
        #[source]
        error: which::Error,
    },

    #[error("failed to find device {}: {error}", .device.display())]
    DeviceNotFound {
        device: PathBuf,
        #[source]
        error: io::Error,
    },

    #[error("failed to execute {tool}: {error}")]
    Spawn {
        tool: String,
        #[source]
        error: io::Error,
    },

    #[error("failed to make {fs_type} filesystem on {}: {output}", .device.display())]
    Format {
        device: PathBuf,
        fs_type: String,
        output: String,
    },
}

/// Mount table of the host.
#[tonic::async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `source` on `target`. `fs_type` is omitted for bind mounts.
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), MountError>;

    /// Unmount `target` if it is mounted and remove the mount point.
    /// A target that is already gone is not an error.
    async fn cleanup_mount_point(&self, target: &Path) -> Result<(), MountError>;
}

/// Ensures a raw device carries a filesystem.
#[tonic::async_trait]
pub trait FilesystemProvisioner: Send + Sync {
    /// Create a `fs_type` filesystem on `device` unless one already exists.
    /// An existing filesystem is never reformatted.
    async fn ensure_filesystem(&self, device: &Path, fs_type: &str)
    -> Result<(), FilesystemError>;
}
