//! Cross-zone disk cloning.
//!
//! A clone copies a disk's identity and configuration from a source zone
//! into a destination zone. Every attempt for a given disk carries a
//! caller-supplied fill generation, strictly increasing across attempts.
//! The destination control plane persists that generation on the created
//! volume and scopes deletes to it, which is what makes it safe to discard
//! the leftovers of a preempted attempt without touching a newer one.
//!
//! ```text
//! Start -> Describe(src) -> Create(dst) -> Succeeded
//!                              | aborted
//!                              v
//!                        Cleanup(dst, generation - 1) -> Create(dst) ...
//!                              | budget exhausted          (bounded)
//!                              v
//!                        FailedRetriable
//! ```
//!
//! Any other failure ends the task as non-retriable.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::BlockStoreClient;
use crate::error::ClientError;
use crate::metrics::{self, OperationTimer};
use crate::types::{CreateVolumeParams, VolumeConfig};

/// Default number of create attempts before a contended clone is handed
/// back to the caller as retriable.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// One clone attempt for a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneTask {
    pub disk_id: String,
    pub dst_placement_group_id: String,
    pub dst_placement_partition_index: u32,
    /// Caller-supplied, one per distinct attempt for the same disk
    pub fill_generation: u64,
    /// Disk this clone is incrementally based on
    pub base_disk_id: String,
}

impl CloneTask {
    /// Destination volume parameters: the source configuration with this
    /// task's placement, base disk and fill generation.
    fn create_params(&self, source: VolumeConfig) -> CreateVolumeParams {
        CreateVolumeParams {
            disk_id: source.disk_id,
            blocks_count: source.blocks_count,
            block_size: source.block_size,
            storage_media_kind: source.storage_media_kind,
            cloud_id: source.cloud_id,
            folder_id: source.folder_id,
            project_id: source.project_id,
            tablet_version: source.tablet_version,
            placement_group_id: self.dst_placement_group_id.clone(),
            placement_partition_index: self.dst_placement_partition_index,
            partitions_count: source.partitions_count,
            is_system: source.is_system,
            channels_count: source.channels_count,
            base_disk_id: self.base_disk_id.clone(),
            base_disk_checkpoint_id: source.base_disk_checkpoint_id,
            encryption: source.encryption,
            // TODO: pass the destination storage pool and agent IDs once the
            // scheduler starts supplying them for non-replicated disks.
            storage_pool_name: String::new(),
            agent_ids: Vec::new(),
            fill_generation: self.fill_generation,
        }
    }
}

#[derive(Error, Debug)]
pub enum CloneError {
    #[error("failed to describe disk {disk_id} in source zone: {source}")]
    DescribeSource { disk_id: String, source: ClientError },

    #[error(
        "failed to create disk {disk_id} with fill generation {fill_generation} in destination zone: {source}"
    )]
    CreateDestination {
        disk_id: String,
        fill_generation: u64,
        source: ClientError,
    },

    /// The destination disk has already been filled; deleting it would
    /// destroy a completed clone.
    #[error("can't delete disk {disk_id} because filling is finished (fill generation {fill_generation})")]
    Inconsistency { disk_id: String, fill_generation: u64 },

    #[error("failed to delete outdated disk {disk_id} with fill generation {fill_generation}: {source}")]
    Cleanup {
        disk_id: String,
        fill_generation: u64,
        source: ClientError,
    },

    #[error(
        "disk {disk_id} is still contended after {attempts} clone attempts with fill generation {fill_generation}: {source}"
    )]
    Retriable {
        disk_id: String,
        fill_generation: u64,
        attempts: u32,
        source: ClientError,
    },

    #[error("clone of disk {disk_id} was cancelled")]
    Cancelled { disk_id: String },
}

impl CloneError {
    /// Whether the caller's own retry policy should schedule the task again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CloneError::Retriable { .. } | CloneError::Cancelled { .. }
        )
    }

    fn status_label(&self) -> &'static str {
        match self {
            CloneError::DescribeSource { .. } => "describe_source_failed",
            CloneError::CreateDestination { .. } => "create_destination_failed",
            CloneError::Inconsistency { .. } => "inconsistency",
            CloneError::Cleanup { .. } => "cleanup_failed",
            CloneError::Retriable { .. } => "retriable",
            CloneError::Cancelled { .. } => "cancelled",
        }
    }
}

/// Outcome of a single describe-and-create attempt.
enum AttemptError {
    /// Another writer raced the destination create
    Contended(ClientError),
    Fatal(CloneError),
}

/// Pair of block store clients for a source and a destination zone.
pub struct MultiZoneClient {
    src_zone: Arc<dyn BlockStoreClient>,
    dst_zone: Arc<dyn BlockStoreClient>,
    max_attempts: u32,
}

impl MultiZoneClient {
    pub fn new(src_zone: Arc<dyn BlockStoreClient>, dst_zone: Arc<dyn BlockStoreClient>) -> Self {
        Self {
            src_zone,
            dst_zone,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set the number of create attempts made before giving up with a
    /// retriable error. At least one attempt is always made.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Clone a disk from the source zone into the destination zone.
    ///
    /// Cancelling `cancel` stops the task at the next remote call or
    /// between attempts, whichever comes first.
    #[instrument(
        skip(self, task, cancel),
        fields(disk_id = %task.disk_id, fill_generation = task.fill_generation)
    )]
    pub async fn clone_disk(
        &self,
        task: &CloneTask,
        cancel: &CancellationToken,
    ) -> Result<(), CloneError> {
        let timer = OperationTimer::new("clone");

        let result = self.clone_with_retries(task, cancel).await;
        match &result {
            Ok(()) => timer.success(),
            Err(e) => timer.failure(e.status_label()),
        }

        result
    }

    async fn clone_with_retries(
        &self,
        task: &CloneTask,
        cancel: &CancellationToken,
    ) -> Result<(), CloneError> {
        let cancelled = || CloneError::Cancelled {
            disk_id: task.disk_id.clone(),
        };

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            attempt += 1;

            let outcome = cancel
                .run_until_cancelled(self.try_clone(task))
                .await
                .ok_or_else(cancelled)?;

            let conflict = match outcome {
                Ok(()) => {
                    info!(attempt, "Disk cloned to destination zone");
                    return Ok(());
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Contended(e)) => e,
            };

            metrics::record_clone_conflict();
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                error = %conflict,
                "Destination disk is contended, cleaning up outdated attempt"
            );

            cancel
                .run_until_cancelled(self.delete_outdated_dst_disk(task))
                .await
                .ok_or_else(cancelled)??;

            if attempt >= self.max_attempts {
                return Err(CloneError::Retriable {
                    disk_id: task.disk_id.clone(),
                    fill_generation: task.fill_generation,
                    attempts: attempt,
                    source: conflict,
                });
            }
        }
    }

    async fn try_clone(&self, task: &CloneTask) -> Result<(), AttemptError> {
        let source = self
            .src_zone
            .describe_volume(&task.disk_id)
            .await
            .map_err(|source| {
                AttemptError::Fatal(CloneError::DescribeSource {
                    disk_id: task.disk_id.clone(),
                    source,
                })
            })?;

        debug!(
            block_size = source.block_size,
            blocks_count = source.blocks_count,
            "Creating disk in destination zone"
        );

        match self.dst_zone.create_volume(task.create_params(source)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_aborted() => Err(AttemptError::Contended(e)),
            Err(source) => Err(AttemptError::Fatal(CloneError::CreateDestination {
                disk_id: task.disk_id.clone(),
                fill_generation: task.fill_generation,
                source,
            })),
        }
    }

    /// Delete a destination disk left behind by the preceding attempt.
    ///
    /// Generation 1 has no predecessor. A finished disk is never deleted,
    /// and a disk that is not older than this attempt is not ours to delete.
    async fn delete_outdated_dst_disk(&self, task: &CloneTask) -> Result<(), CloneError> {
        if task.fill_generation <= 1 {
            return Ok(());
        }

        let outdated_generation = task.fill_generation - 1;
        let cleanup_error = |source| CloneError::Cleanup {
            disk_id: task.disk_id.clone(),
            fill_generation: outdated_generation,
            source,
        };

        let volume = match self.dst_zone.describe_volume(&task.disk_id).await {
            Ok(volume) => volume,
            Err(e) if e.is_not_found() => {
                debug!("No destination disk to clean up");
                return Ok(());
            }
            Err(e) => return Err(cleanup_error(e)),
        };

        if volume.is_fill_finished {
            return Err(CloneError::Inconsistency {
                disk_id: task.disk_id.clone(),
                fill_generation: volume.fill_generation,
            });
        }

        // The control plane refuses the delete if the disk has moved past this generation
        info!(
            outdated_generation,
            existing_generation = volume.fill_generation,
            "Deleting destination disk left by an earlier attempt"
        );

        match self
            .dst_zone
            .delete_volume_with_fill_generation(&task.disk_id, outdated_generation)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(cleanup_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(fill_generation: u64) -> CloneTask {
        CloneTask {
            disk_id: "disk-1".to_string(),
            dst_placement_group_id: "pg-dst".to_string(),
            dst_placement_partition_index: 2,
            fill_generation,
            base_disk_id: "base-1".to_string(),
        }
    }

    #[test]
    fn test_create_params_take_placement_and_generation_from_task() {
        let source = VolumeConfig {
            disk_id: "disk-1".to_string(),
            block_size: 4096,
            blocks_count: 100,
            placement_group_id: "pg-src".to_string(),
            placement_partition_index: 7,
            base_disk_id: "base-src".to_string(),
            base_disk_checkpoint_id: "checkpoint-1".to_string(),
            fill_generation: 9,
            ..Default::default()
        };

        let params = task(3).create_params(source);
        assert_eq!(params.placement_group_id, "pg-dst");
        assert_eq!(params.placement_partition_index, 2);
        assert_eq!(params.base_disk_id, "base-1");
        assert_eq!(params.base_disk_checkpoint_id, "checkpoint-1");
        assert_eq!(params.fill_generation, 3);
        assert_eq!(params.block_size, 4096);
        assert!(params.storage_pool_name.is_empty());
        assert!(params.agent_ids.is_empty());
    }

    #[test]
    fn test_retriable_classification() {
        let retriable = CloneError::Retriable {
            disk_id: "disk-1".to_string(),
            fill_generation: 2,
            attempts: 4,
            source: ClientError::Aborted("raced".to_string()),
        };
        assert!(retriable.is_retriable());

        let inconsistency = CloneError::Inconsistency {
            disk_id: "disk-1".to_string(),
            fill_generation: 1,
        };
        assert!(!inconsistency.is_retriable());
        assert!(inconsistency.to_string().contains("disk-1"));
    }

    #[test]
    fn test_max_attempts_is_at_least_one() {
        struct Unused;

        #[tonic::async_trait]
        impl BlockStoreClient for Unused {
            async fn describe_volume(&self, _: &str) -> crate::Result<VolumeConfig> {
                unreachable!()
            }
            async fn create_volume(&self, _: CreateVolumeParams) -> crate::Result<()> {
                unreachable!()
            }
            async fn delete_volume_with_fill_generation(&self, _: &str, _: u64) -> crate::Result<()> {
                unreachable!()
            }
            async fn start_endpoint(
                &self,
                _: crate::types::StartEndpointRequest,
            ) -> crate::Result<crate::types::StartEndpointResponse> {
                unreachable!()
            }
            async fn stop_endpoint(&self, _: &std::path::Path) -> crate::Result<()> {
                unreachable!()
            }
        }

        let client = MultiZoneClient::new(Arc::new(Unused), Arc::new(Unused)).with_max_attempts(0);
        assert_eq!(client.max_attempts(), 1);
    }
}
