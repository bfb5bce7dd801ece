//! Ring client: CAS read-modify-write loop and the locally cached ring.
//!
//! Every mutation of the shared descriptor goes through [`RingClient::update`],
//! which reads the stored document and its version, applies a transform and
//! writes the result back only if the version is unchanged. There is no
//! in-process lock around the shared document; cross-process ordering comes
//! from the store's CAS alone.
//!
//! The cached copy used for routing is an `Arc<RingDesc>` replaced wholesale
//! after each successful write or refresh, so readers never see a partially
//! applied descriptor and never wait on the network.

use super::desc::RingDesc;
use super::router::{ReadRing, Replica};
use crate::kv::{CasOutcome, KvStore, Version};
use crate::{Error, Result};
use metrics::{counter, histogram};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Ring client configuration
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Store key holding the descriptor
    pub key: String,
    /// Number of distinct ingesters each key is routed to
    pub replication_factor: usize,
    /// Read-modify-write attempts before giving up
    pub max_cas_retries: u32,
    /// Backoff before the second attempt; doubles per attempt
    pub backoff_base: Duration,
    /// Upper bound for a single backoff
    pub backoff_max: Duration,
    /// How often the background loop re-reads the descriptor
    pub refresh_interval: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            key: "collectors/ring".to_string(),
            replication_factor: 3,
            max_cas_retries: 10,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(5),
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(Error::Config("ring key cannot be empty".to_string()));
        }
        if self.replication_factor == 0 {
            return Err(Error::Config(
                "replication factor must be at least 1".to_string(),
            ));
        }
        if self.max_cas_retries == 0 {
            return Err(Error::Config(
                "max CAS retries must be at least 1".to_string(),
            ));
        }
        if self.backoff_max < self.backoff_base {
            return Err(Error::Config(format!(
                "backoff max ({:?}) is below backoff base ({:?})",
                self.backoff_max, self.backoff_base
            )));
        }
        if self.refresh_interval.is_zero() {
            return Err(Error::Config(
                "refresh interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared-ring client for one process
pub struct RingClient {
    kv: Arc<dyn KvStore>,
    config: RingConfig,
    /// Last descriptor this process observed
    current: watch::Sender<Arc<RingDesc>>,
}

impl std::fmt::Debug for RingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingClient")
            .field("kv", &self.kv)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RingClient {
    /// Create a client. The cache starts empty until the first refresh or update.
    pub fn new(kv: Arc<dyn KvStore>, config: RingConfig) -> Result<Self> {
        config.validate()?;
        let (current, _) = watch::channel(Arc::new(RingDesc::new()));
        Ok(Self {
            kv,
            config,
            current,
        })
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Last observed descriptor
    pub fn current(&self) -> Arc<RingDesc> {
        self.current.borrow().clone()
    }

    /// Receive every descriptor this client publishes
    pub fn subscribe(&self) -> watch::Receiver<Arc<RingDesc>> {
        self.current.subscribe()
    }

    /// Replica set for `key` at the configured replication factor
    pub fn replicas_for(&self, key: u32) -> Result<Vec<Replica>> {
        self.current().route(key, self.config.replication_factor)
    }

    fn publish(&self, desc: RingDesc) -> Arc<RingDesc> {
        let desc = Arc::new(desc);
        self.current.send_replace(desc.clone());
        desc
    }

    /// Read and decode the stored descriptor.
    ///
    /// A missing key reads as an empty ring with no version, so the first
    /// write creates it.
    async fn read(&self) -> Result<(RingDesc, Option<Version>)> {
        match self.kv.get(&self.config.key).await? {
            Some(stored) => {
                let desc = RingDesc::decode(&stored.value).map_err(|e| {
                    error!(
                        key = %self.config.key,
                        version = %stored.version,
                        "Stored ring descriptor is corrupt: {}",
                        e
                    );
                    e
                })?;
                Ok((desc, Some(stored.version)))
            }
            None => {
                debug!(key = %self.config.key, "Ring key absent, starting from empty ring");
                Ok((RingDesc::new(), None))
            }
        }
    }

    /// Re-read the descriptor and replace the cached copy.
    pub async fn refresh(&self) -> Result<Arc<RingDesc>> {
        let result = self.read().await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        };
        counter!(
            "ring_refresh_total",
            "service" => crate::telemetry::service(),
            "result" => outcome
        )
        .increment(1);

        let (desc, _) = result?;
        if let Err(e) = desc.check_invariants() {
            warn!(key = %self.config.key, "Ring descriptor violates invariants: {}", e);
        }
        Ok(self.publish(desc))
    }

    /// Initial load for a starting process: refresh, retrying store
    /// outages with the CAS backoff up to `max_cas_retries` attempts.
    ///
    /// A corrupt descriptor is returned immediately.
    pub async fn refresh_until_ready(&self) -> Result<Arc<RingDesc>> {
        let attempts = self.config.max_cas_retries;
        let mut attempt = 0;
        loop {
            match self.refresh().await {
                Err(Error::StoreUnavailable(msg)) if attempt + 1 < attempts => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        key = %self.config.key,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Ring store unavailable at startup, retrying: {}",
                        msg
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Apply `transform` to the shared descriptor with compare-and-swap.
    ///
    /// The transform receives the freshly read descriptor and returns the
    /// replacement, or `None` when nothing needs to change (no write is
    /// made). It may run several times and must not have side effects.
    ///
    /// Conflicts and store outages are retried with jittered exponential
    /// backoff up to `max_cas_retries` attempts. Exhausting the attempts on
    /// conflicts yields [`Error::CoordinationConflict`]; if the last attempt
    /// failed because the store was unreachable, [`Error::StoreUnavailable`].
    /// A corrupt stored document aborts immediately with
    /// [`Error::DecodeCorruption`].
    pub async fn update<F>(&self, mut transform: F) -> Result<Arc<RingDesc>>
    where
        F: FnMut(&RingDesc) -> Option<RingDesc> + Send,
    {
        let key = &self.config.key;
        let attempts = self.config.max_cas_retries;
        let mut last_unavailable = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = self.backoff(attempt - 1);
                histogram!(
                    "ring_cas_backoff_seconds",
                    "service" => crate::telemetry::service()
                )
                .record(backoff.as_secs_f64());
                tokio::time::sleep(backoff).await;
            }

            let (desc, version) = match self.read().await {
                Ok(read) => read,
                Err(Error::StoreUnavailable(msg)) => {
                    debug!(
                        "Ring read failed on attempt {} of {}: {}",
                        attempt + 1,
                        attempts,
                        msg
                    );
                    last_unavailable = Some(msg);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(next) = transform(&desc) else {
                debug!(key = %key, "Ring transform made no change");
                return Ok(self.publish(desc));
            };

            let encoded = next.encode()?;
            match self.kv.cas_put(key, encoded, version.as_ref()).await {
                Ok(CasOutcome::Swapped(new_version)) => {
                    counter!(
                        "ring_cas_attempts_total",
                        "service" => crate::telemetry::service(),
                        "result" => "ok"
                    )
                    .increment(1);
                    debug!(
                        key = %key,
                        version = %new_version,
                        attempt = attempt + 1,
                        "Ring updated"
                    );
                    return Ok(self.publish(next));
                }
                Ok(CasOutcome::Conflict) => {
                    counter!(
                        "ring_cas_attempts_total",
                        "service" => crate::telemetry::service(),
                        "result" => "conflict"
                    )
                    .increment(1);
                    counter!(
                        "ring_cas_retries_total",
                        "service" => crate::telemetry::service()
                    )
                    .increment(1);
                    debug!(
                        "CAS conflict on attempt {} of {}, retrying",
                        attempt + 1,
                        attempts
                    );
                    last_unavailable = None;
                }
                Err(Error::StoreUnavailable(msg)) => {
                    counter!(
                        "ring_cas_attempts_total",
                        "service" => crate::telemetry::service(),
                        "result" => "unavailable"
                    )
                    .increment(1);
                    debug!(
                        "Ring write failed on attempt {} of {}: {}",
                        attempt + 1,
                        attempts,
                        msg
                    );
                    last_unavailable = Some(msg);
                }
                Err(e) => return Err(e),
            }
        }

        match last_unavailable {
            Some(msg) => Err(Error::StoreUnavailable(msg)),
            None => {
                warn!(key = %key, attempts, "Giving up on ring update after repeated CAS conflicts");
                Err(Error::CoordinationConflict {
                    key: key.clone(),
                    attempts,
                })
            }
        }
    }

    /// Backoff before retry number `retry` (0-based): exponential, capped,
    /// drawn uniformly from the upper half so peers spread out.
    fn backoff(&self, retry: u32) -> Duration {
        let base = self.config.backoff_base.as_millis() as u64;
        let max = self.config.backoff_max.as_millis() as u64;
        let cap = base.saturating_mul(1u64 << retry.min(20)).min(max);
        let jittered = rand::thread_rng().gen_range(cap / 2..=cap);
        Duration::from_millis(jittered)
    }

    /// Periodically refresh the cached descriptor until `shutdown` fires.
    ///
    /// Failures are logged and the stale copy keeps serving routing.
    pub async fn run_refresh_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.refresh().await {
                        Ok(desc) => debug!(
                            ingesters = desc.ingesters.len(),
                            tokens = desc.tokens.len(),
                            "Ring refreshed"
                        ),
                        Err(e @ Error::DecodeCorruption(_)) => {
                            error!("Ring refresh found a corrupt descriptor, keeping cached ring: {}", e);
                        }
                        Err(e) => {
                            warn!("Ring refresh failed, keeping cached ring: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Ring refresh loop shutting down");
                    break;
                }
            }
        }
    }
}

impl ReadRing for RingClient {
    fn route(&self, key: u32, n: usize) -> Result<Vec<Replica>> {
        self.current().route(key, n)
    }

    fn all_active(&self) -> Vec<Replica> {
        self.current().active_replicas()
    }

    fn replication_factor(&self) -> usize {
        self.config.replication_factor
    }
}
