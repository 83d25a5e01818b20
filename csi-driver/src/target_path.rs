//! Kubelet publish target paths.
//!
//! Kubelet publishes CSI volumes at
//! `<kubelet-dir>/pods/<pod-uid>/volumes/<plugin-namespace>~csi/<volume>/mount`.
//! NodeUnpublishVolume carries only the volume ID and this path, so the pod
//! UID needed to locate the pod's endpoint directory is recovered from it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Plugin namespace kubelet uses for CSI volumes
pub const CSI_PLUGIN_NAMESPACE: &str = "kubernetes.io";

static TARGET_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.*/pods/([a-z0-9-]+)/volumes/[^/]+~csi/([a-z0-9-]+)/mount/?$")
        .expect("target path pattern is valid")
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to parse target path {path:?}: expected .../pods/<pod>/volumes/<namespace>~csi/<volume>/mount")]
pub struct TargetPathError {
    pub path: String,
}

/// Pod and volume identity encoded in a target path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetPath {
    pub pod_id: String,
    pub volume_id: String,
}

impl TargetPath {
    pub fn new(pod_id: impl Into<String>, volume_id: impl Into<String>) -> Self {
        Self {
            pod_id: pod_id.into(),
            volume_id: volume_id.into(),
        }
    }

    pub fn parse(path: &Path) -> Result<Self, TargetPathError> {
        let malformed = || TargetPathError {
            path: path.to_string_lossy().into_owned(),
        };

        let path_str = path.to_str().ok_or_else(malformed)?;
        let captures = TARGET_PATH_RE.captures(path_str).ok_or_else(malformed)?;

        Ok(Self {
            pod_id: captures[1].to_string(),
            volume_id: captures[2].to_string(),
        })
    }

    /// Build the path kubelet would publish this volume at.
    pub fn to_path(&self, kubelet_dir: &Path) -> PathBuf {
        kubelet_dir
            .join("pods")
            .join(&self.pod_id)
            .join("volumes")
            .join(format!("{}~csi", CSI_PLUGIN_NAMESPACE))
            .join(&self.volume_id)
            .join("mount")
    }
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod_id, self.volume_id)
    }
}
