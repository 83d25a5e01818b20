use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use nbs_client::metrics;
use nbs_client::multi_zone::{CloneTask, DEFAULT_MAX_ATTEMPTS, MultiZoneClient};
use nbs_client::{GrpcBlockStoreClient, TlsConfig};

#[derive(Parser, Debug)]
#[command(name = "nbs-clone")]
#[command(about = "Clone a Network Block Store disk into another availability zone")]
struct Args {
    /// Block store endpoint of the source zone
    #[arg(long, env = "NBS_SRC_ENDPOINT")]
    src_endpoint: String,

    /// Block store endpoint of the destination zone
    #[arg(long, env = "NBS_DST_ENDPOINT")]
    dst_endpoint: String,

    /// Disk to clone
    #[arg(long)]
    disk_id: String,

    /// Placement group of the disk in the destination zone
    #[arg(long, default_value = "")]
    dst_placement_group_id: String,

    /// Placement partition index in the destination zone
    #[arg(long, default_value = "0")]
    dst_placement_partition_index: u32,

    /// Fill generation of this attempt; must grow with every new attempt
    #[arg(long)]
    fill_generation: u64,

    /// Base disk of the destination disk
    #[arg(long, default_value = "")]
    base_disk_id: String,

    /// Create attempts before giving up on a contended disk
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// CA certificate for the control-plane channels (enables TLS)
    #[arg(long, env = "NBS_TLS_CA_PATH")]
    tls_ca: Option<std::path::PathBuf>,

    /// Client certificate for mTLS
    #[arg(long, env = "NBS_TLS_CERT_PATH", requires = "tls_key")]
    tls_cert: Option<std::path::PathBuf>,

    /// Client key for mTLS
    #[arg(long, env = "NBS_TLS_KEY_PATH", requires = "tls_cert")]
    tls_key: Option<std::path::PathBuf>,

    /// Server name expected in the control-plane certificates
    #[arg(long, env = "NBS_TLS_DOMAIN", default_value = "localhost")]
    tls_domain: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9092)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

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

    let tls = args.tls_ca.as_ref().map(|ca_path| TlsConfig {
        ca_path: ca_path.clone(),
        identity: args.tls_cert.clone().zip(args.tls_key.clone()),
        domain: args.tls_domain.clone(),
    });

    info!(
        disk_id = %args.disk_id,
        fill_generation = args.fill_generation,
        src = %args.src_endpoint,
        dst = %args.dst_endpoint,
        "Starting cross-zone clone"
    );

    let src = GrpcBlockStoreClient::connect(&args.src_endpoint, tls.as_ref())
        .await
        .map_err(|e| format!("Failed to connect to source zone: {}", e))?;
    let dst = GrpcBlockStoreClient::connect(&args.dst_endpoint, tls.as_ref())
        .await
        .map_err(|e| format!("Failed to connect to destination zone: {}", e))?;

    let client =
        MultiZoneClient::new(Arc::new(src), Arc::new(dst)).with_max_attempts(args.max_attempts);

    let task = CloneTask {
        disk_id: args.disk_id,
        dst_placement_group_id: args.dst_placement_group_id,
        dst_placement_partition_index: args.dst_placement_partition_index,
        fill_generation: args.fill_generation,
        base_disk_id: args.base_disk_id,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, cancelling clone");
        on_signal.cancel();
    });

    match client.clone_disk(&task, &cancel).await {
        Ok(()) => {
            info!(disk_id = %task.disk_id, "Clone complete");
            Ok(())
        }
        Err(e) => {
            error!(retriable = e.is_retriable(), error = %e, "Clone failed");
            Err(e.into())
        }
    }
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
