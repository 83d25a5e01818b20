//! Linux implementation of the host operations
//!
//! Uses Linux-specific tools:
//! - mount/umount with /proc/mounts for the mount table
//! - blkid to probe for existing filesystems
//! - mkfs -t <fstype> for formatting
//!
//! Every child process is killed if the request that started it is
//! dropped, so a cancelled RPC does not leave tools running.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{FilesystemError, FilesystemProvisioner, MountError, Mounter};

/// Default filesystem type for Linux
pub const DEFAULT_FS_TYPE: &str = "ext4";

fn command(program: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true);
    cmd
}

/// stdout followed by stderr, trimmed
fn combined_output(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined.trim().to_string()
}

/// Decode the octal escapes (`\040` for space) the kernel uses for mount
/// points in /proc/mounts.
fn unescape_mount_point(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
            && let Ok(byte) = u8::from_str_radix(&raw[i + 1..i + 4], 8)
        {
            decoded.push(byte);
            i += 4;
            continue;
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

// ============================================================================
// Mounter
// ============================================================================

/// Mounts through the host's `mount` and `umount` tools.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    mount_cmd: PathBuf,
    umount_cmd: PathBuf,
    mount_table: PathBuf,
}

impl SystemMounter {
    pub fn new() -> Self {
        Self {
            mount_cmd: PathBuf::from("mount"),
            umount_cmd: PathBuf::from("umount"),
            mount_table: PathBuf::from("/proc/mounts"),
        }
    }

    /// Use alternative tools and mount table (for tests and chroots).
    pub fn with_commands(
        mount_cmd: impl Into<PathBuf>,
        umount_cmd: impl Into<PathBuf>,
        mount_table: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mount_cmd: mount_cmd.into(),
            umount_cmd: umount_cmd.into(),
            mount_table: mount_table.into(),
        }
    }

    /// Check if a path is currently a mount point.
    pub async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        let mounts = tokio::fs::read_to_string(&self.mount_table)
            .await
            .map_err(|error| MountError::Io {
                context: "failed to read mount table",
                path: self.mount_table.clone(),
                error,
            })?;

        Ok(mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mount_point| Path::new(&unescape_mount_point(mount_point)) == target))
    }
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl Mounter for SystemMounter {
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), MountError> {
        info!(
            source = %source.display(),
            target = %target.display(),
            fs_type = fs_type.unwrap_or(""),
            options = ?options,
            "Mounting"
        );

        let mut cmd = command(&self.mount_cmd);
        if let Some(fs_type) = fs_type {
            cmd.args(["-t", fs_type]);
        }
        if !options.is_empty() {
            cmd.arg("-o").arg(options.join(","));
        }
        cmd.arg(source).arg(target);

        let output = cmd.output().await.map_err(|error| {
            error!(error = %error, "Failed to execute mount");
            MountError::Spawn {
                tool: self.mount_cmd.display().to_string(),
                error,
            }
        })?;

        if !output.status.success() {
            let output = combined_output(&output);
            error!(output = %output, "mount failed");
            return Err(MountError::Mount {
                mount_source: source.to_path_buf(),
                target: target.to_path_buf(),
                output,
            });
        }

        Ok(())
    }

    async fn cleanup_mount_point(&self, target: &Path) -> Result<(), MountError> {
        match tokio::fs::symlink_metadata(target).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(target = %target.display(), "Mount point does not exist, nothing to clean up");
                return Ok(());
            }
            Err(error) => {
                return Err(MountError::Io {
                    context: "failed to stat mount point",
                    path: target.to_path_buf(),
                    error,
                });
            }
        }

        if self.is_mounted(target).await? {
            info!(target = %target.display(), "Unmounting");

            let output = command(&self.umount_cmd)
                .arg(target)
                .output()
                .await
                .map_err(|error| {
                    error!(error = %error, "Failed to execute umount");
                    MountError::Spawn {
                        tool: self.umount_cmd.display().to_string(),
                        error,
                    }
                })?;

            if !output.status.success() {
                let output = combined_output(&output);
                // Treat "not mounted" as success
                if output.contains("not mounted") || output.contains("no mount point") {
                    warn!(target = %target.display(), "Path was not mounted");
                } else {
                    error!(output = %output, "umount failed");
                    return Err(MountError::Unmount {
                        target: target.to_path_buf(),
                        output,
                    });
                }
            }
        } else {
            debug!(target = %target.display(), "Path is not mounted, skipping unmount");
        }

        let removal = match tokio::fs::symlink_metadata(target).await {
            Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir(target).await,
            Ok(_) => tokio::fs::remove_file(target).await,
            Err(e) => Err(e),
        };

        match removal {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(MountError::Io {
                context: "failed to remove mount point",
                path: target.to_path_buf(),
                error,
            }),
        }
    }
}

// ============================================================================
// Filesystem provisioner
// ============================================================================

/// Probes with `blkid` and formats with `mkfs`.
#[derive(Debug, Clone)]
pub struct SystemProvisioner {
    blkid: PathBuf,
    mkfs: PathBuf,
}

impl SystemProvisioner {
    pub fn new() -> Self {
        Self {
            blkid: PathBuf::from("blkid"),
            mkfs: PathBuf::from("mkfs"),
        }
    }

    /// Use alternative probe and format tools.
    pub fn with_tools(blkid: impl Into<PathBuf>, mkfs: impl Into<PathBuf>) -> Self {
        Self {
            blkid: blkid.into(),
            mkfs: mkfs.into(),
        }
    }
}

impl Default for SystemProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl FilesystemProvisioner for SystemProvisioner {
    async fn ensure_filesystem(
        &self,
        device: &Path,
        fs_type: &str,
    ) -> Result<(), FilesystemError> {
        let blkid = which::which(&self.blkid).map_err(|error| FilesystemError::ToolNotFound {
            tool: self.blkid.display().to_string(),
            error,
        })?;

        tokio::fs::metadata(device)
            .await
            .map_err(|error| FilesystemError::DeviceNotFound {
                device: device.to_path_buf(),
                error,
            })?;

        let probe = command(&blkid)
            .arg(device)
            .output()
            .await
            .map_err(|error| FilesystemError::Spawn {
                tool: blkid.display().to_string(),
                error,
            })?;

        // blkid exits non-zero and prints nothing when no signature is found
        let signature = combined_output(&probe);
        if probe.status.success() && !signature.is_empty() {
            info!(device = %device.display(), signature = %signature, "Filesystem exists");
            return Ok(());
        }

        info!(device = %device.display(), fs_type = %fs_type, "Making filesystem");

        let output = command(&self.mkfs)
            .args(["-t", fs_type])
            .arg(device)
            .output()
            .await
            .map_err(|error| {
                error!(error = %error, "Failed to execute mkfs");
                FilesystemError::Spawn {
                    tool: self.mkfs.display().to_string(),
                    error,
                }
            })?;

        let output_text = combined_output(&output);
        if !output.status.success() {
            error!(output = %output_text, "mkfs failed");
            return Err(FilesystemError::Format {
                device: device.to_path_buf(),
                fs_type: fs_type.to_string(),
                output: output_text,
            });
        }

        info!(device = %device.display(), output = %output_text, "Filesystem created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// mount/umount stand-ins that append their arguments to `calls.log`
    fn recording_mounter(dir: &Path, mount_table: &str, umount_body: &str) -> SystemMounter {
        let log = dir.join("calls.log");
        let mount = write_script(
            dir,
            "mount",
            &format!("echo \"mount $@\" >> {}", log.display()),
        );
        let umount = write_script(
            dir,
            "umount",
            &format!("echo \"umount $@\" >> {}\n{}", log.display(), umount_body),
        );
        let table = dir.join("mounts");
        std::fs::write(&table, mount_table).unwrap();
        SystemMounter::with_commands(mount, umount, table)
    }

    fn calls(dir: &Path) -> String {
        std::fs::read_to_string(dir.join("calls.log")).unwrap_or_default()
    }

    #[test]
    fn test_unescape_mount_point() {
        assert_eq!(unescape_mount_point("/mnt/a\\040b"), "/mnt/a b");
        assert_eq!(unescape_mount_point("/mnt/plain"), "/mnt/plain");
        assert_eq!(unescape_mount_point("/mnt/trailing\\04"), "/mnt/trailing\\04");
    }

    #[test]
    fn test_default_fs_type() {
        assert_eq!(DEFAULT_FS_TYPE, "ext4");
    }

    #[tokio::test]
    async fn test_mount_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = recording_mounter(dir.path(), "", "exit 0");

        mounter
            .mount(
                Path::new("/dev/nbd0"),
                Path::new("/mnt/target"),
                Some("ext4"),
                &["noatime".to_string(), "ro".to_string()],
            )
            .await
            .unwrap();
        mounter
            .mount(
                Path::new("/run/sockets/pod/vol"),
                Path::new("/mnt/socket"),
                None,
                &["bind".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(
            calls(dir.path()),
            "mount -t ext4 -o noatime,ro /dev/nbd0 /mnt/target\n\
             mount -o bind /run/sockets/pod/vol /mnt/socket\n"
        );
    }

    #[tokio::test]
    async fn test_mount_failure_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let mount = write_script(dir.path(), "mount", "echo 'special device does not exist' >&2\nexit 32");
        let table = dir.path().join("mounts");
        std::fs::write(&table, "").unwrap();
        let mounter = SystemMounter::with_commands(mount, "umount", table);

        let err = mounter
            .mount(Path::new("/dev/nbd9"), Path::new("/mnt/x"), Some("ext4"), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("special device does not exist"));
    }

    #[tokio::test]
    async fn test_cleanup_missing_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = recording_mounter(dir.path(), "", "exit 0");

        mounter
            .cleanup_mount_point(&dir.path().join("absent"))
            .await
            .unwrap();
        assert_eq!(calls(dir.path()), "");
    }

    #[tokio::test]
    async fn test_cleanup_unmounted_directory_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = recording_mounter(dir.path(), "proc /proc proc rw 0 0\n", "exit 0");
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();

        mounter.cleanup_mount_point(&target).await.unwrap();

        assert!(!target.exists());
        assert_eq!(calls(dir.path()), "");
    }

    #[tokio::test]
    async fn test_cleanup_unmounts_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();
        let table = format!("/dev/nbd0 {} ext4 rw 0 0\n", target.display());
        let mounter = recording_mounter(dir.path(), &table, "exit 0");

        mounter.cleanup_mount_point(&target).await.unwrap();

        assert!(!target.exists());
        assert_eq!(calls(dir.path()), format!("umount {}\n", target.display()));
    }

    #[tokio::test]
    async fn test_cleanup_removes_block_device_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("device");
        std::fs::write(&target, "").unwrap();
        let table = format!("udev {} devtmpfs rw 0 0\n", target.display());
        let mounter = recording_mounter(dir.path(), &table, "exit 0");

        mounter.cleanup_mount_point(&target).await.unwrap();
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_not_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();
        let table = format!("/dev/nbd0 {} ext4 rw 0 0\n", target.display());
        let mounter = recording_mounter(
            dir.path(),
            &table,
            "echo \"umount: $1: not mounted.\" >&2\nexit 32",
        );

        mounter.cleanup_mount_point(&target).await.unwrap();
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_cleanup_umount_failure() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();
        let table = format!("/dev/nbd0 {} ext4 rw 0 0\n", target.display());
        let mounter = recording_mounter(dir.path(), &table, "echo 'target is busy' >&2\nexit 32");

        let err = mounter.cleanup_mount_point(&target).await.unwrap_err();

        assert!(matches!(err, MountError::Unmount { .. }));
        assert!(target.exists());
    }

    // ------------------------------------------------------------------------
    // Provisioner
    // ------------------------------------------------------------------------

    struct Tools {
        dir: tempfile::TempDir,
        device: PathBuf,
    }

    impl Tools {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let device = dir.path().join("nbd0");
            std::fs::write(&device, "").unwrap();
            Self { dir, device }
        }

        fn provisioner(&self, blkid_body: &str, mkfs_body: &str) -> SystemProvisioner {
            let blkid = write_script(self.dir.path(), "blkid", blkid_body);
            let mkfs = write_script(
                self.dir.path(),
                "mkfs",
                &format!("echo \"$@\" > {}\n{}", self.mkfs_log().display(), mkfs_body),
            );
            SystemProvisioner::with_tools(blkid, mkfs)
        }

        fn mkfs_log(&self) -> PathBuf {
            self.dir.path().join("mkfs.log")
        }
    }

    #[tokio::test]
    async fn test_existing_filesystem_is_not_reformatted() {
        let tools = Tools::new();
        let provisioner = tools.provisioner(
            "echo \"$1: UUID=\\\"1234\\\" TYPE=\\\"ext4\\\"\"",
            "exit 0",
        );

        provisioner
            .ensure_filesystem(&tools.device, "ext4")
            .await
            .unwrap();

        assert!(!tools.mkfs_log().exists());
    }

    #[tokio::test]
    async fn test_blank_device_is_formatted() {
        let tools = Tools::new();
        let provisioner = tools.provisioner("exit 2", "exit 0");

        provisioner
            .ensure_filesystem(&tools.device, "xfs")
            .await
            .unwrap();

        let args = std::fs::read_to_string(tools.mkfs_log()).unwrap();
        assert_eq!(args.trim(), format!("-t xfs {}", tools.device.display()));
    }

    #[tokio::test]
    async fn test_format_failure_carries_output() {
        let tools = Tools::new();
        let provisioner = tools.provisioner("exit 2", "echo 'bad superblock' >&2\nexit 1");

        let err = provisioner
            .ensure_filesystem(&tools.device, "ext4")
            .await
            .unwrap_err();

        assert!(matches!(err, FilesystemError::Format { .. }));
        assert!(err.to_string().contains("bad superblock"));
    }

    #[tokio::test]
    async fn test_missing_probe_tool() {
        let tools = Tools::new();
        let provisioner =
            SystemProvisioner::with_tools(tools.dir.path().join("no-blkid"), "mkfs");

        let err = provisioner
            .ensure_filesystem(&tools.device, "ext4")
            .await
            .unwrap_err();

        assert!(matches!(err, FilesystemError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_missing_device() {
        let tools = Tools::new();
        let provisioner = tools.provisioner("exit 2", "exit 0");

        let err = provisioner
            .ensure_filesystem(&tools.dir.path().join("nbd42"), "ext4")
            .await
            .unwrap_err();

        assert!(matches!(err, FilesystemError::DeviceNotFound { .. }));
        assert!(!tools.mkfs_log().exists());
    }
}
