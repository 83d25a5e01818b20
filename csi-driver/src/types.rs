//! Publish dispatch types.
//!
//! A publish request is routed on three independent axes: how the node runs
//! workloads, the access type the pod asked for, and the storage backend of
//! the volume. The combinations are listed in a single table so every one
//! of them is explicit and testable.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use AccessKind::{Block, Mount};
use Backend::{BlockStore, FileStore};
use ExecutionMode::{Container, VirtualMachine};

/// Volume context key naming the storage backend.
pub const BACKEND_CONTEXT_KEY: &str = "backend";

// ============================================================================
// Backend
// ============================================================================

/// Storage backend a volume lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Network block store disk (default)
    #[default]
    BlockStore,
    /// Network file store filesystem
    FileStore,
}

impl Backend {
    /// Backend named by a volume context; volumes without one are disks.
    pub fn from_volume_context(
        volume_context: &HashMap<String, String>,
    ) -> Result<Self, BackendParseError> {
        volume_context
            .get(BACKEND_CONTEXT_KEY)
            .map_or(Ok(Backend::BlockStore), |value| value.parse())
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::BlockStore => write!(f, "nbs"),
            Backend::FileStore => write!(f, "nfs"),
        }
    }
}

impl FromStr for Backend {
    type Err = BackendParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "nbs" | "blockstore" => Ok(Backend::BlockStore),
            "nfs" | "filestore" => Ok(Backend::FileStore),
            _ => Err(BackendParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendParseError(String);

impl Display for BackendParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown backend '{}': expected 'nbs' or 'nfs'", self.0)
    }
}

impl std::error::Error for BackendParseError {}

// ============================================================================
// ExecutionMode / AccessKind
// ============================================================================

/// How workloads on this node consume volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Pods run virtual machines that attach volumes over vhost sockets
    VirtualMachine,
    /// Pods are plain containers
    Container,
}

impl ExecutionMode {
    pub fn from_vm_mode(vm_mode: bool) -> Self {
        if vm_mode {
            ExecutionMode::VirtualMachine
        } else {
            ExecutionMode::Container
        }
    }
}

impl Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::VirtualMachine => write!(f, "vm"),
            ExecutionMode::Container => write!(f, "container"),
        }
    }
}

/// Access type of a volume capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Mount,
    Block,
}

impl Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Mount => write!(f, "mount"),
            AccessKind::Block => write!(f, "block"),
        }
    }
}

// ============================================================================
// PublishRoute
// ============================================================================

/// Provisioning routine a publish request resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishRoute {
    /// Block store vhost socket directory bind-mounted at the target
    DiskAsVhostSocket,
    /// NBD device with a filesystem mounted at the target
    DiskAsFilesystem,
    /// NBD device bind-mounted onto a file at the target
    DiskAsBlockDevice,
    /// File store vhost socket directory bind-mounted at the target
    FileStoreAsVhostSocket,
    /// Unsupported combination; the request is rejected with this reason
    Reject(&'static str),
}

const FILESTORE_IN_CONTAINER: &str = "FileStore can't be mounted to container as a filesystem";
const FILESTORE_AS_BLOCK: &str = "'Block' volume mode is not supported for nfs backend";
const UNSUPPORTED_COMBINATION: &str = "unsupported combination of execution mode, access type and backend";

const PUBLISH_ROUTES: &[(ExecutionMode, AccessKind, Backend, PublishRoute)] = &[
    (VirtualMachine, Mount, BlockStore, PublishRoute::DiskAsVhostSocket),
    (VirtualMachine, Mount, FileStore, PublishRoute::FileStoreAsVhostSocket),
    (VirtualMachine, Block, BlockStore, PublishRoute::DiskAsBlockDevice),
    (VirtualMachine, Block, FileStore, PublishRoute::Reject(FILESTORE_AS_BLOCK)),
    (Container, Mount, BlockStore, PublishRoute::DiskAsFilesystem),
    (Container, Mount, FileStore, PublishRoute::Reject(FILESTORE_IN_CONTAINER)),
    (Container, Block, BlockStore, PublishRoute::DiskAsBlockDevice),
    (Container, Block, FileStore, PublishRoute::Reject(FILESTORE_AS_BLOCK)),
];

/// Resolve the provisioning routine for a publish request.
pub fn publish_route(mode: ExecutionMode, access: AccessKind, backend: Backend) -> PublishRoute {
    PUBLISH_ROUTES
        .iter()
        .find(|(m, a, b, _)| *m == mode && *a == access && *b == backend)
        .map_or(PublishRoute::Reject(UNSUPPORTED_COMBINATION), |(_, _, _, route)| {
            *route
        })
}
