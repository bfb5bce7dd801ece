//! Logging bootstrap and metric labels shared by the ring binaries.
//!
//! Metrics are recorded through the `metrics` facade; installing an
//! exporter is left to the embedding process.

use crate::{Error, Result};
use std::sync::OnceLock;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_SERVICE: &str = "ingest-ring";

static SERVICE_NAME: OnceLock<&'static str> = OnceLock::new();

/// Service label attached to every metric. Defaults to `ingest-ring`.
pub fn service() -> &'static str {
    SERVICE_NAME.get().copied().unwrap_or(DEFAULT_SERVICE)
}

/// Set the service label once, at process start. Later calls are ignored.
pub fn set_service_name(name: &str) {
    let name = name.trim();
    if name.is_empty() {
        return;
    }
    // Leaked once per process; metric labels need 'static.
    let _ = SERVICE_NAME.set(Box::leak(name.to_string().into_boxed_str()));
}

/// Install the JSON log subscriber and record the service label.
pub fn init_logging(service_name: &str, log_level: &str) -> Result<()> {
    let level = parse_log_level(log_level)?;
    set_service_name(service_name);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .try_init()
        .map_err(|e| Error::Config(format!("failed to initialize log subscriber: {e}")))?;

    info!(service_name = service(), log_level = %level, "Logging initialized");
    Ok(())
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}
