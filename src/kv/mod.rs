//! Coordination store interface
//!
//! The ring is stored under a single key in a store that offers
//! compare-and-swap on that key. Nothing else about the store is assumed.

mod local;
mod object;

pub use local::LocalKv;
pub use object::ObjectStoreKv;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Opaque version token returned by a read, compared only for equality
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored value together with the version it was read at
#[derive(Debug, Clone)]
pub struct Versioned {
    pub value: Bytes,
    pub version: Version,
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; the key is now at this version
    Swapped(Version),
    /// The key changed since it was read
    Conflict,
}

/// Key-value store with compare-and-swap on a single key
///
/// Implementations map transport problems to
/// [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) and a lost
/// race to [`CasOutcome::Conflict`]; no other error is expected from a
/// healthy store.
#[async_trait]
pub trait KvStore: Send + Sync + fmt::Debug {
    /// Read the current value, or `None` if the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write `value` only if the key is still at `expected`.
    ///
    /// `expected = None` writes only if the key does not exist yet.
    async fn cas_put(&self, key: &str, value: Bytes, expected: Option<&Version>)
        -> Result<CasOutcome>;
}
