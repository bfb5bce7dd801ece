//! Membership lifecycle for the local ingester
//!
//! Joins the ring, heartbeats on a timer, hands off gracefully on shutdown
//! and, as a side duty, evicts peers whose heartbeat has gone stale.
//!
//! Local states: `Pending -> Active -> Leaving -> Gone`. `Gone` is absence
//! from the ring; there is no tombstone.

use crate::clock::{Clock, MonotonicClock};
use crate::ring::{IngesterState, RingClient, RingDesc, TokenStrategy};
use crate::{Error, Result};
use metrics::counter;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the local ingester's ring membership
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Identity key in the ring
    pub id: String,
    /// Address peers use to reach this ingester
    pub addr: String,
    /// gRPC address, empty if not served
    pub grpc_addr: String,
    /// Tokens claimed at join
    pub num_tokens: usize,
    pub token_strategy: TokenStrategy,
    pub heartbeat_period: Duration,
    /// A peer is evicted once its heartbeat is older than
    /// `heartbeat_period * heartbeat_timeout_multiple`
    pub heartbeat_timeout_multiple: u32,
    /// Time spent Leaving before removing ourselves
    pub drain_period: Duration,
}

impl LifecycleConfig {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            grpc_addr: String::new(),
            num_tokens: 128,
            token_strategy: TokenStrategy::default(),
            heartbeat_period: Duration::from_secs(5),
            heartbeat_timeout_multiple: 12,
            drain_period: Duration::from_secs(30),
        }
    }

    /// Saturates instead of overflowing; `validate` rejects such configs.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_period
            .checked_mul(self.heartbeat_timeout_multiple)
            .unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("ingester id cannot be empty".to_string()));
        }
        if self.addr.trim().is_empty() {
            return Err(Error::Config("ingester address cannot be empty".to_string()));
        }
        if self.num_tokens == 0 {
            return Err(Error::Config("token count must be at least 1".to_string()));
        }
        if self.heartbeat_period.is_zero() {
            return Err(Error::Config("heartbeat period must be non-zero".to_string()));
        }
        if self.heartbeat_timeout_multiple < 2 {
            return Err(Error::Config(format!(
                "heartbeat timeout multiple must be at least 2, got {}",
                self.heartbeat_timeout_multiple
            )));
        }
        if self
            .heartbeat_period
            .checked_mul(self.heartbeat_timeout_multiple)
            .is_none()
        {
            return Err(Error::Config(format!(
                "heartbeat timeout overflows: {:?} x {}",
                self.heartbeat_period, self.heartbeat_timeout_multiple
            )));
        }
        Ok(())
    }
}

/// Local view of this ingester's membership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not yet registered
    Pending,
    Active,
    Leaving,
    /// Removed from the ring
    Gone,
}

/// Drives one ingester's membership in the shared ring
pub struct Lifecycler {
    config: LifecycleConfig,
    ring: Arc<RingClient>,
    clock: Arc<dyn Clock>,
    state: Mutex<LifecycleState>,
    /// Tokens registered at join
    tokens: Mutex<Vec<u32>>,
}

impl std::fmt::Debug for Lifecycler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycler")
            .field("id", &self.config.id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Lifecycler {
    pub fn new(config: LifecycleConfig, ring: Arc<RingClient>) -> Result<Self> {
        Self::with_clock(config, ring, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        config: LifecycleConfig,
        ring: Arc<RingClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ring,
            clock,
            state: Mutex::new(LifecycleState::Pending),
            tokens: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn tokens(&self) -> Vec<u32> {
        self.tokens.lock().clone()
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Register in the ring as Active.
    ///
    /// If the ring still holds an entry for this identity (restart before a
    /// peer evicted it), its tokens are reclaimed; otherwise a fresh set is
    /// generated avoiding tokens already taken.
    pub async fn join(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Pending | LifecycleState::Gone => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot join while {:?}",
                    other
                )))
            }
        }

        let id = self.config.id.as_str();
        let mut chosen = Vec::new();
        let mut reclaimed = false;

        self.ring
            .update(|desc| {
                let existing = desc.tokens_for(id);
                reclaimed = !existing.is_empty();
                chosen = if reclaimed {
                    existing
                } else {
                    self.config.token_strategy.generate(
                        id,
                        self.config.num_tokens,
                        &desc.taken_tokens(),
                    )
                };

                let mut next = desc.clone();
                next.add_ingester(
                    id,
                    &self.config.addr,
                    &self.config.grpc_addr,
                    &chosen,
                    IngesterState::Active,
                    self.clock.now(),
                );
                Some(next)
            })
            .await?;

        if chosen.is_empty() {
            warn!(ingester = id, "Joined ring without tokens, no keys will route here");
        }
        info!(
            ingester = id,
            addr = %self.config.addr,
            tokens = chosen.len(),
            reclaimed,
            "Joined ring"
        );
        *self.tokens.lock() = chosen;
        *self.state.lock() = LifecycleState::Active;
        Ok(())
    }

    /// Refresh this ingester's heartbeat timestamp.
    ///
    /// Only the timestamp changes. If the entry is missing while Active
    /// (a peer evicted us during a partition) it is re-registered with the
    /// same tokens.
    pub async fn heartbeat(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Active | LifecycleState::Leaving => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot heartbeat while {:?}",
                    other
                )))
            }
        }

        let id = self.config.id.as_str();
        let tokens = self.tokens();

        let result = self
            .ring
            .update(|desc| {
                let now = self.clock.now();
                let mut next = desc.clone();
                if next.touch(id, now) {
                    return Some(next);
                }
                // Once leaving, a missing entry means we are done
                if self.state() != LifecycleState::Active {
                    return None;
                }
                warn!(ingester = id, "Own ring entry missing, re-registering");
                next.add_ingester(
                    id,
                    &self.config.addr,
                    &self.config.grpc_addr,
                    &tokens,
                    IngesterState::Active,
                    now,
                );
                Some(next)
            })
            .await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!(
            "ring_heartbeats_total",
            "service" => crate::telemetry::service(),
            "result" => outcome
        )
        .increment(1);

        result?;
        debug!(ingester = id, "Heartbeat written");
        Ok(())
    }

    /// Remove peers whose heartbeat is older than the heartbeat timeout.
    ///
    /// Safe to run from many processes at once: a peer already evicted by
    /// someone else is simply not stale in the re-read descriptor, and no
    /// write happens when nothing is stale. Returns the identities this call
    /// removed.
    pub async fn evict_stale(&self) -> Result<Vec<String>> {
        let timeout = self.config.heartbeat_timeout();
        let id = self.config.id.as_str();
        let stale_peers = |desc: &RingDesc| -> Vec<String> {
            desc.stale_ingesters(self.clock.now(), timeout)
                .into_iter()
                .filter(|peer| peer != id)
                .collect()
        };

        // Skip the CAS entirely when the cached ring shows nothing stale.
        if stale_peers(&self.ring.current()).is_empty() {
            return Ok(Vec::new());
        }

        let mut evicted = Vec::new();
        self.ring
            .update(|desc| {
                evicted = stale_peers(desc);
                if evicted.is_empty() {
                    return None;
                }
                let mut next = desc.clone();
                for peer in &evicted {
                    next.remove_ingester(peer);
                }
                Some(next)
            })
            .await?;

        for peer in &evicted {
            warn!(
                ingester = %peer,
                timeout_secs = timeout.as_secs(),
                "Evicted ingester with stale heartbeat"
            );
        }
        counter!(
            "ring_evictions_total",
            "service" => crate::telemetry::service()
        )
        .increment(evicted.len() as u64);

        Ok(evicted)
    }

    /// Mark Leaving, wait `drain` for in-flight work, then remove ourselves.
    ///
    /// Calling again after a failed removal skips straight to the removal.
    pub async fn leave(&self, drain: Duration) -> Result<()> {
        let id = self.config.id.as_str();

        match self.state() {
            LifecycleState::Active => {
                self.ring
                    .update(|desc| {
                        let mut next = desc.clone();
                        next.set_state(id, IngesterState::Leaving, self.clock.now())
                            .then_some(next)
                    })
                    .await?;
                *self.state.lock() = LifecycleState::Leaving;
                info!(
                    ingester = id,
                    drain_secs = drain.as_secs_f64(),
                    "Leaving ring, draining"
                );
                tokio::time::sleep(drain).await;
            }
            LifecycleState::Leaving => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot leave while {:?}",
                    other
                )))
            }
        }

        self.ring
            .update(|desc| {
                let mut next = desc.clone();
                next.remove_ingester(id).then_some(next)
            })
            .await?;

        *self.state.lock() = LifecycleState::Gone;
        info!(ingester = id, "Left ring");
        Ok(())
    }

    /// Heartbeat and evict on every period until `shutdown` fires.
    ///
    /// Errors are logged and retried on the next tick; a missed heartbeat
    /// never takes the ingester out of rotation by itself.
    pub async fn run_heartbeat_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; join just wrote a timestamp.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(ingester = %self.config.id, "Heartbeat failed: {}", e);
                    }
                    if let Err(e) = self.evict_stale().await {
                        warn!(ingester = %self.config.id, "Stale ingester scan failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(ingester = %self.config.id, "Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}
