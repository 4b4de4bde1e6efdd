//! Cloud Block Storage CSI Driver
//!
//! Serves the CSI Identity, Controller, and Node services and provisions
//! volumes through the configured backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use cloudblock_csi::agent_client::{AgentBackend, TlsConfig};
use cloudblock_csi::backend::{MemoryBackend, VolumeBackend};
use cloudblock_csi::config::CloudConfig;
use cloudblock_csi::driver::{Driver, DriverInfo};
use cloudblock_csi::metrics;
use cloudblock_csi::server;
use cloudblock_csi::types::{BackendKind, CsiEndpoint, UnpublishPolicy};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "cloudblock-csi")]
#[command(about = "Cloud block storage CSI driver for Kubernetes")]
struct Args {
    /// CSI endpoint (unix://<path> or tcp://<host>:<port>)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///tmp/csi.sock")]
    endpoint: CsiEndpoint,

    /// Node ID for this CSI node (defaults to the hostname)
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Volume backend (agent or memory)
    #[arg(long, env = "CSI_BACKEND", default_value = "agent")]
    backend: BackendKind,

    /// Block agent gRPC endpoint
    #[arg(long, env = "CSI_AGENT_ENDPOINT", default_value = "http://127.0.0.1:50051")]
    agent_endpoint: String,

    /// Client certificate for mTLS to the block agent (PEM format)
    #[arg(long, env = "AGENT_TLS_CERT_PATH")]
    agent_tls_cert: Option<PathBuf>,

    /// Client private key for mTLS to the block agent (PEM format)
    #[arg(long, env = "AGENT_TLS_KEY_PATH")]
    agent_tls_key: Option<PathBuf>,

    /// CA certificate used to verify the block agent (PEM format)
    #[arg(long, env = "AGENT_TLS_CA_PATH")]
    agent_tls_ca: Option<PathBuf>,

    /// Expected server name in the block agent certificate
    #[arg(long, env = "AGENT_TLS_DOMAIN", default_value = "localhost")]
    agent_tls_domain: String,

    /// JSON file with backend region and credentials
    #[arg(long, env = "CSI_CLOUD_CONFIG")]
    cloud_config: Option<PathBuf>,

    /// Upper bound on each backend call, in seconds
    #[arg(long, env = "CSI_BACKEND_TIMEOUT_SECS", default_value = "60")]
    backend_timeout_secs: u64,

    /// ControllerUnpublishVolume behavior (unimplemented or noop)
    #[arg(long, env = "CSI_UNPUBLISH_POLICY", default_value = "unimplemented")]
    unpublish_policy: UnpublishPolicy,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9090)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// mTLS settings, present only when all three files are given.
    fn agent_tls(&self) -> Option<TlsConfig> {
        match (&self.agent_tls_cert, &self.agent_tls_key, &self.agent_tls_ca) {
            (Some(cert), Some(key), Some(ca)) => Some(TlsConfig {
                cert_path: cert.clone(),
                key_path: key.clone(),
                ca_path: ca.clone(),
                domain: self.agent_tls_domain.clone(),
            }),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
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

    if let Some(addr) = &args.metrics_addr {
        metrics::init_metrics(addr.parse()?)?;
    }

    // Determine node_id
    let node_id = match &args.node_id {
        Some(id) => id.clone(),
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    let backend: Arc<dyn VolumeBackend> = match args.backend {
        BackendKind::Agent => {
            let cloud = CloudConfig::load(args.cloud_config.as_deref())?;
            let tls = args.agent_tls();
            info!(
                agent_endpoint = %args.agent_endpoint,
                region = %cloud.region,
                tls = tls.is_some(),
                "Using block agent backend"
            );
            Arc::new(AgentBackend::connect(&args.agent_endpoint, tls, cloud).await?)
        }
        BackendKind::Memory => {
            info!("Using in-memory backend; volumes are lost on exit");
            Arc::new(MemoryBackend::new())
        }
    };

    let info = DriverInfo::new(node_id).with_unpublish_policy(args.unpublish_policy);

    info!(
        driver_name = %info.name,
        version = %info.version,
        endpoint = %args.endpoint,
        node_id = %info.node_id,
        backend = %args.backend,
        unpublish_policy = %info.unpublish_policy,
        "Starting CSI driver"
    );

    let driver = Driver::new(info, backend)
        .with_backend_timeout(Duration::from_secs(args.backend_timeout_secs));

    server::serve(&args.endpoint, &driver, async {
        server::shutdown_signal().await;
        info!("Shutdown signal received, draining connections...");
    })
    .await?;

    info!("CSI driver shutdown complete");
    Ok(())
}
