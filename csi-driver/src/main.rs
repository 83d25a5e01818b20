//! NBS CSI Driver
//!
//! Kubernetes CSI node plugin for Network Block Store disks and file store
//! filesystems.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use csi_driver::csi::identity_server::IdentityServer;
use csi_driver::csi::node_server::NodeServer;
use csi_driver::identity::DRIVER_NAME;
use csi_driver::metrics;
use csi_driver::platform::{SystemMounter, SystemProvisioner};
use csi_driver::{
    EndpointSettings, ExecutionMode, IdentityService, NodeService, VolumeEndpointManager,
};
use nbs_client::{GrpcBlockStoreClient, GrpcFileStoreClient, TlsConfig};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "csi-driver")]
#[command(about = "NBS CSI node plugin for Kubernetes")]
struct Args {
    /// CSI endpoint (unix socket path)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node (defaults to the hostname)
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Client ID presented to the control planes
    #[arg(long, env = "NBS_CLIENT_ID", default_value = "nbs-csi-driver")]
    client_id: String,

    /// Pods on this node are virtual machines
    #[arg(long, env = "VM_MODE", default_value = "false")]
    vm_mode: bool,

    /// Block store control-plane endpoint
    #[arg(long, env = "NBS_ENDPOINT", default_value = "http://localhost:9766")]
    nbs_endpoint: String,

    /// File store control-plane endpoint (file store volumes are rejected if unset)
    #[arg(long, env = "NFS_ENDPOINT")]
    nfs_endpoint: Option<String>,

    /// Endpoint root as seen by the control planes
    #[arg(long, default_value = "/run/nbsd/sockets")]
    nbs_sockets_dir: PathBuf,

    /// Endpoint root as seen by this plugin
    #[arg(long, default_value = "/nbsd-sockets")]
    pod_sockets_dir: PathBuf,

    /// Driver name
    #[arg(long, default_value = DRIVER_NAME)]
    driver_name: String,

    /// CA certificate for the control-plane channels (enables TLS)
    #[arg(long, env = "NBS_TLS_CA_PATH")]
    tls_ca: Option<PathBuf>,

    /// Client certificate for mTLS
    #[arg(long, env = "NBS_TLS_CERT_PATH", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Client key for mTLS
    #[arg(long, env = "NBS_TLS_KEY_PATH", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Server name expected in the control-plane certificates
    #[arg(long, env = "NBS_TLS_DOMAIN", default_value = "localhost")]
    tls_domain: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };
    let execution_mode = ExecutionMode::from_vm_mode(args.vm_mode);

    info!(
        driver_name = %args.driver_name,
        endpoint = %args.endpoint,
        nbs_endpoint = %args.nbs_endpoint,
        nfs_endpoint = ?args.nfs_endpoint,
        node_id = %node_id,
        mode = %execution_mode,
        "Starting NBS CSI Driver"
    );

    let tls = args.tls_ca.as_ref().map(|ca_path| TlsConfig {
        ca_path: ca_path.clone(),
        identity: args.tls_cert.clone().zip(args.tls_key.clone()),
        domain: args.tls_domain.clone(),
    });

    let nbs = GrpcBlockStoreClient::connect(&args.nbs_endpoint, tls.as_ref())
        .await
        .map_err(|e| format!("Failed to connect to block store: {}", e))?;

    let settings = EndpointSettings {
        client_id: args.client_id,
        nbs_sockets_dir: args.nbs_sockets_dir,
        pod_sockets_dir: args.pod_sockets_dir,
    };
    let mut endpoints = VolumeEndpointManager::new(
        settings,
        Arc::new(nbs),
        Arc::new(SystemMounter::new()),
        Arc::new(SystemProvisioner::new()),
    );

    if let Some(ref nfs_endpoint) = args.nfs_endpoint {
        let nfs = GrpcFileStoreClient::connect(nfs_endpoint, tls.as_ref())
            .await
            .map_err(|e| format!("Failed to connect to file store: {}", e))?;
        endpoints = endpoints.with_filestore(Arc::new(nfs));
    }

    let identity = IdentityService::new(args.driver_name);
    let node = NodeService::new(node_id, execution_mode, endpoints);

    let socket_path = PathBuf::from(
        args.endpoint
            .strip_prefix("unix://")
            .unwrap_or(&args.endpoint),
    );
    match tokio::fs::remove_file(&socket_path).await {
        Ok(()) => info!(path = %socket_path.display(), "Removed stale CSI socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(format!("Failed to remove {}: {}", socket_path.display(), e).into());
        }
    }
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    info!("CSI server listening on {}", socket_path.display());

    Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
            shutdown_signal().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    info!("CSI driver shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or Ctrl-C
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let terminate = async {
        match sigterm.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = terminate => info!("Received SIGTERM"),
        _ = signal::ctrl_c() => info!("Received SIGINT"),
    }
}
