//! Print the current ring as JSON
//!
//! Usage:
//!   RING_STORE_BACKEND=s3 S3_BUCKET=ring-coord ring_status --heartbeat-timeout-secs 60

use clap::Parser;
use ingest_ring::config::ComponentFactory;
use ingest_ring::ring::{token_for, RingClient, RingConfig};
use ingest_ring::telemetry;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Store key holding the ring descriptor
    #[arg(long, env = "RING_KEY", default_value = "collectors/ring")]
    ring_key: String,

    /// Heartbeat age after which an ingester is reported unhealthy
    #[arg(long, default_value = "60")]
    heartbeat_timeout_secs: u64,

    /// Also print the replica set for this tenant
    #[arg(long, requires = "metric")]
    tenant: Option<String>,

    /// Metric name used with --tenant
    #[arg(long)]
    metric: Option<String>,

    /// Replication factor used for --tenant lookups
    #[arg(long, default_value = "3")]
    replication_factor: usize,

    /// Include the full descriptor, not just the summary
    #[arg(long, default_value = "false")]
    full: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    telemetry::init_logging("ingest-ring-status", &args.log_level)?;

    let kv = ComponentFactory::create_kv_store().await?;
    let ring = RingClient::new(
        kv,
        RingConfig {
            key: args.ring_key.clone(),
            replication_factor: args.replication_factor,
            ..Default::default()
        },
    )?;
    let desc = ring.refresh().await?;
    let stats = desc.stats(
        chrono::Utc::now(),
        Duration::from_secs(args.heartbeat_timeout_secs),
    );

    let mut out = serde_json::json!({
        "key": args.ring_key,
        "stats": stats,
    });
    if args.full {
        out["ring"] = serde_json::to_value(desc.as_ref())?;
    }
    if let (Some(tenant), Some(metric)) = (&args.tenant, &args.metric) {
        let key = token_for(tenant, metric);
        let replicas = ring.replicas_for(key)?;
        out["route"] = serde_json::json!({
            "tenant": tenant,
            "metric": metric,
            "token": key,
            "replicas": replicas
                .iter()
                .map(|r| serde_json::json!({ "id": r.id, "addr": r.addr }))
                .collect::<Vec<_>>(),
        });
    }

    if let Err(e) = desc.check_invariants() {
        out["invariant_violation"] = serde_json::Value::String(e.to_string());
    }

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
