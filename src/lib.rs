//! # ingest-ring
//!
//! Consistent-hash ring for a fleet of time-series ingesters.
//!
//! Every ingester claims a set of tokens on a 32-bit ring. The ring
//! descriptor (who is in the fleet, in which state, owning which tokens)
//! lives as a single document in a shared coordination store and is only
//! ever changed by compare-and-swap.
//!
//! ## Components
//!
//! - **Ring descriptor** ([`ring::RingDesc`]): membership plus the sorted token list
//! - **Ring client** ([`ring::RingClient`]): CAS read-modify-write loop and the cached ring
//! - **Lifecycler** ([`lifecycle::Lifecycler`]): join, heartbeat, stale eviction, graceful leave
//! - **Router** ([`ring::ReadRing`]): key to replica set
//! - **Quorum executor** ([`quorum::QuorumExecutor`]): majority fan-out to a replica set
//! - **Coordination store** ([`kv::KvStore`]): in-process or object-store backed

pub mod clock;
pub mod config;
pub mod kv;
pub mod lifecycle;
pub mod quorum;
pub mod ring;
pub mod telemetry;

mod error;

pub use error::{Error, ReplicaFailure, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, MonotonicClock};
    pub use crate::kv::{KvStore, LocalKv, ObjectStoreKv};
    pub use crate::lifecycle::{LifecycleConfig, LifecycleState, Lifecycler};
    pub use crate::quorum::{quorum, QuorumExecutor};
    pub use crate::ring::{
        token_for, IngesterState, ReadRing, Replica, RingClient, RingConfig, RingDesc,
    };
    pub use crate::{Error, Result};
}
