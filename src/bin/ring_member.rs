//! Ring member process
//!
//! Registers this ingester in the shared ring, keeps its heartbeat fresh,
//! evicts stale peers and hands its tokens off gracefully on SIGTERM.

use clap::Parser;
use ingest_ring::config::ComponentFactory;
use ingest_ring::lifecycle::{LifecycleConfig, Lifecycler};
use ingest_ring::ring::{RingClient, RingConfig, TokenStrategy};
use ingest_ring::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Ingester ring member
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Ingester identity in the ring
    #[arg(long, env = "INGESTER_ID")]
    id: String,

    /// Address peers use to reach this ingester
    #[arg(long, env = "INGESTER_ADDR")]
    addr: String,

    /// gRPC address, if served
    #[arg(long, env = "INGESTER_GRPC_ADDR", default_value = "")]
    grpc_addr: String,

    /// Number of tokens to claim at join
    #[arg(long, env = "RING_NUM_TOKENS", default_value = "128")]
    num_tokens: usize,

    /// Draw tokens at random instead of deriving them from the identity
    #[arg(long, env = "RING_RANDOM_TOKENS", default_value = "false")]
    random_tokens: bool,

    /// Explicit comma-separated tokens; overrides --num-tokens
    #[arg(long, env = "RING_TOKENS", value_delimiter = ',', conflicts_with = "random_tokens")]
    tokens: Vec<u32>,

    /// Heartbeat period in seconds
    #[arg(long, env = "RING_HEARTBEAT_SECS", default_value = "5")]
    heartbeat_secs: u64,

    /// Peers silent for this many heartbeat periods are evicted
    #[arg(long, env = "RING_HEARTBEAT_TIMEOUT_MULTIPLE", default_value = "12")]
    heartbeat_timeout_multiple: u32,

    /// Drain period before removal on shutdown, in seconds
    #[arg(long, env = "RING_DRAIN_SECS", default_value = "30")]
    drain_secs: u64,

    /// Store key holding the ring descriptor
    #[arg(long, env = "RING_KEY", default_value = "collectors/ring")]
    ring_key: String,

    /// Replication factor
    #[arg(long, env = "RING_REPLICATION_FACTOR", default_value = "3")]
    replication_factor: usize,

    /// Ring refresh interval in seconds
    #[arg(long, env = "RING_REFRESH_SECS", default_value = "5")]
    refresh_secs: u64,

    /// Service name used for metric labels
    #[arg(long, env = "SERVICE_NAME", default_value = "ingest-ring-member")]
    service_name: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    telemetry::init_logging(&args.service_name, &args.log_level)?;

    info!("Starting ring member");

    let kv = ComponentFactory::create_kv_store().await?;

    let ring_config = RingConfig {
        key: args.ring_key.clone(),
        replication_factor: args.replication_factor,
        refresh_interval: Duration::from_secs(args.refresh_secs),
        ..Default::default()
    };
    let ring = Arc::new(RingClient::new(kv, ring_config)?);
    ring.refresh_until_ready().await?;

    let mut lifecycle_config = LifecycleConfig::new(&args.id, &args.addr);
    lifecycle_config.grpc_addr = args.grpc_addr.clone();
    lifecycle_config.num_tokens = args.num_tokens;
    lifecycle_config.heartbeat_period = Duration::from_secs(args.heartbeat_secs);
    lifecycle_config.heartbeat_timeout_multiple = args.heartbeat_timeout_multiple;
    lifecycle_config.drain_period = Duration::from_secs(args.drain_secs);
    if !args.tokens.is_empty() {
        lifecycle_config.token_strategy = TokenStrategy::Fixed(args.tokens.clone());
    } else if args.random_tokens {
        lifecycle_config.token_strategy = TokenStrategy::Random;
    }
    let drain = lifecycle_config.drain_period;

    let lifecycler = Arc::new(Lifecycler::new(lifecycle_config, ring.clone())?);
    lifecycler.join().await?;

    let shutdown = CancellationToken::new();

    let refresh_ring = ring.clone();
    let refresh_shutdown = shutdown.clone();
    let refresh_task = tokio::spawn(async move {
        refresh_ring.run_refresh_loop(refresh_shutdown).await;
    });

    let heartbeat_lifecycler = lifecycler.clone();
    let heartbeat_shutdown = shutdown.clone();
    let heartbeat_task = tokio::spawn(async move {
        heartbeat_lifecycler.run_heartbeat_loop(heartbeat_shutdown).await;
    });

    info!(
        ingester = %args.id,
        tokens = lifecycler.tokens().len(),
        replication_factor = args.replication_factor,
        "Ring member ready"
    );

    shutdown_signal().await;
    info!("Shutdown signal received, leaving ring");

    // Heartbeats keep running through the drain so peers don't evict us.
    let leave_result = lifecycler.leave(drain).await;
    shutdown.cancel();
    let _ = tokio::join!(refresh_task, heartbeat_task);

    if let Err(e) = &leave_result {
        error!("Failed to leave ring cleanly: {}", e);
    }
    leave_result?;

    info!("Ring member shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
