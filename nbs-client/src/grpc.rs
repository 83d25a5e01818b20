//! gRPC implementations of the control-plane clients.
//!
//! Includes automatic retry with exponential backoff for transient
//! transport failures. Protocol-level outcomes (`NotFound`, `Aborted`) are
//! returned to the caller on the first occurrence.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, warn};

use crate::client::{BlockStoreClient, FileStoreClient};
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::proto::blockstore::{
    self, DescribeVolumeRequest, DestroyVolumeRequest, StopEndpointRequest,
    block_store_service_client::BlockStoreServiceClient,
};
use crate::proto::filestore::{self, endpoint_service_client::EndpointServiceClient};
use crate::types::{
    CreateVolumeParams, FsEndpointConfig, StartEndpointRequest, StartEndpointResponse,
    VolumeConfig,
};

/// Maximum number of retry attempts for transient failures
const MAX_RETRIES: u32 = 3;
/// Initial backoff delay in milliseconds
const INITIAL_BACKOFF_MS: u64 = 100;
/// Maximum backoff delay in milliseconds
const MAX_BACKOFF_MS: u64 = 5000;
/// Backoff multiplier (exponential factor)
const BACKOFF_MULTIPLIER: u64 = 2;

/// TLS configuration for connecting to a control plane
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub ca_path: PathBuf,
    /// Client certificate and key, for mTLS
    pub identity: Option<(PathBuf, PathBuf)>,
    pub domain: String,
}

/// Execute an async operation with exponential backoff retry.
///
/// Retries the operation up to MAX_RETRIES times for retryable errors,
/// with exponential backoff between attempts.
async fn with_retry<T, F, Fut>(operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, tonic::Status>>,
{
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(status) => {
                let err = ClientError::from(status);
                attempt += 1;

                if !err.is_retryable() || attempt > MAX_RETRIES {
                    if attempt > 1 {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %err,
                            "Operation failed after retries"
                        );
                    }
                    return Err(err);
                }

                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_retries = MAX_RETRIES,
                    error = %err,
                    backoff_ms = backoff_ms,
                    "Retryable error, backing off"
                );

                metrics::record_retry(operation_name);

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                backoff_ms = (backoff_ms * BACKOFF_MULTIPLIER).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Open a channel with optional TLS and robust connection settings.
///
/// Connection settings:
/// - 10 second connect timeout (fail fast if the control plane is unreachable)
/// - 30 second request timeout
/// - TCP keepalive every 60 seconds
/// - HTTP/2 keepalive every 30 seconds with 10 second timeout
pub async fn connect_channel(endpoint: &str, tls: Option<&TlsConfig>) -> Result<Channel> {
    let mut endpoint_builder = Endpoint::from_shared(endpoint.to_string())?
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .tcp_nodelay(true)
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    if let Some(tls) = tls {
        let read = |path: &Path| {
            let path = path.to_path_buf();
            async move {
                tokio::fs::read(&path).await.map_err(|e| {
                    ClientError::Transport(format!("failed to read {}: {}", path.display(), e))
                })
            }
        };

        let ca = read(&tls.ca_path).await?;
        let mut tls_config = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca))
            .domain_name(&tls.domain);

        if let Some((cert_path, key_path)) = &tls.identity {
            let cert = read(cert_path).await?;
            let key = read(key_path).await?;
            tls_config = tls_config.identity(Identity::from_pem(cert, key));
        }

        endpoint_builder = endpoint_builder.tls_config(tls_config)?;
    }

    Ok(endpoint_builder.connect().await?)
}

// ============================================================================
// Block store
// ============================================================================

/// Block store control-plane client over gRPC.
#[derive(Debug, Clone)]
pub struct GrpcBlockStoreClient {
    client: BlockStoreServiceClient<Channel>,
}

impl GrpcBlockStoreClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: BlockStoreServiceClient::new(channel),
        }
    }

    /// Connect to the block store control plane at the specified endpoint.
    pub async fn connect(endpoint: &str, tls: Option<&TlsConfig>) -> Result<Self> {
        let channel = connect_channel(endpoint, tls).await?;
        Ok(Self::new(channel))
    }
}

#[tonic::async_trait]
impl BlockStoreClient for GrpcBlockStoreClient {
    async fn describe_volume(&self, disk_id: &str) -> Result<VolumeConfig> {
        let request = DescribeVolumeRequest {
            disk_id: disk_id.to_string(),
        };

        debug!(disk_id = disk_id, "Describing volume");

        let client = self.client.clone();
        let volume = with_retry("describe_volume", || {
            let req = request.clone();
            let mut c = client.clone();
            async move {
                let response = c.describe_volume(req).await?;
                response
                    .into_inner()
                    .volume
                    .ok_or_else(|| tonic::Status::internal("control plane returned empty volume"))
            }
        })
        .await?;

        Ok(volume.into())
    }

    async fn create_volume(&self, params: CreateVolumeParams) -> Result<()> {
        let request: blockstore::CreateVolumeRequest = params.into();

        debug!(
            disk_id = %request.disk_id,
            fill_generation = request.fill_generation,
            "Creating volume"
        );

        let client = self.client.clone();
        with_retry("create_volume", || {
            let req = request.clone();
            let mut c = client.clone();
            async move {
                c.create_volume(req).await?;
                Ok(())
            }
        })
        .await
    }

    async fn delete_volume_with_fill_generation(
        &self,
        disk_id: &str,
        fill_generation: u64,
    ) -> Result<()> {
        let request = DestroyVolumeRequest {
            disk_id: disk_id.to_string(),
            sync: true,
            fill_generation,
        };

        debug!(
            disk_id = disk_id,
            fill_generation = fill_generation,
            "Destroying volume"
        );

        let client = self.client.clone();
        with_retry("destroy_volume", || {
            let req = request.clone();
            let mut c = client.clone();
            async move {
                c.destroy_volume(req).await?;
                Ok(())
            }
        })
        .await
    }

    async fn start_endpoint(
        &self,
        request: StartEndpointRequest,
    ) -> Result<StartEndpointResponse> {
        let request: blockstore::StartEndpointRequest = request.into();

        debug!(
            disk_id = %request.disk_id,
            socket = %request.unix_socket_path,
            "Starting endpoint"
        );

        let client = self.client.clone();
        let response = with_retry("start_endpoint", || {
            let req = request.clone();
            let mut c = client.clone();
            async move { Ok(c.start_endpoint(req).await?.into_inner()) }
        })
        .await?;

        Ok(response.into())
    }

    async fn stop_endpoint(&self, unix_socket_path: &Path) -> Result<()> {
        let request = StopEndpointRequest {
            unix_socket_path: unix_socket_path.to_string_lossy().into_owned(),
        };

        debug!(socket = %request.unix_socket_path, "Stopping endpoint");

        let client = self.client.clone();
        with_retry("stop_endpoint", || {
            let req = request.clone();
            let mut c = client.clone();
            async move {
                c.stop_endpoint(req).await?;
                Ok(())
            }
        })
        .await
    }
}

// ============================================================================
// File store
// ============================================================================

/// File store endpoint client over gRPC.
#[derive(Debug, Clone)]
pub struct GrpcFileStoreClient {
    client: EndpointServiceClient<Channel>,
}

impl GrpcFileStoreClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: EndpointServiceClient::new(channel),
        }
    }

    /// Connect to the file store endpoint service at the specified endpoint.
    pub async fn connect(endpoint: &str, tls: Option<&TlsConfig>) -> Result<Self> {
        let channel = connect_channel(endpoint, tls).await?;
        Ok(Self::new(channel))
    }
}

#[tonic::async_trait]
impl FileStoreClient for GrpcFileStoreClient {
    async fn start_endpoint(&self, config: FsEndpointConfig) -> Result<()> {
        let request = filestore::StartEndpointRequest {
            endpoint: Some(config.into()),
        };

        debug!(?request, "Starting filestore endpoint");

        let client = self.client.clone();
        with_retry("start_fs_endpoint", || {
            let req = request.clone();
            let mut c = client.clone();
            async move {
                c.start_endpoint(req).await?;
                Ok(())
            }
        })
        .await
    }

    async fn stop_endpoint(&self, socket_path: &Path) -> Result<()> {
        let request = filestore::StopEndpointRequest {
            socket_path: socket_path.to_string_lossy().into_owned(),
        };

        debug!(socket = %request.socket_path, "Stopping filestore endpoint");

        let client = self.client.clone();
        with_retry("stop_fs_endpoint", || {
            let req = request.clone();
            let mut c = client.clone();
            async move {
                c.stop_endpoint(req).await?;
                Ok(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retry_immediate_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<i32> = with_retry("test", || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_success_after_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<i32> = with_retry("test", || {
            let c = counter_clone.clone();
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    Err(tonic::Status::unavailable("temporarily unavailable"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_aborted() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<i32> = with_retry("test", || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(tonic::Status::aborted("disk is being created"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_aborted());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_not_found_is_returned_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<i32> = with_retry("test", || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(tonic::Status::not_found("no such disk"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausted() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<i32> = with_retry("test", || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(tonic::Status::unavailable("always unavailable"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        // Initial attempt plus MAX_RETRIES retries
        assert_eq!(counter.load(Ordering::SeqCst), MAX_RETRIES + 1);
    }
}
