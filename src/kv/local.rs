//! In-process coordination store for development and testing

use super::{CasOutcome, KvStore, Version, Versioned};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Local in-memory coordination store
///
/// Versions are numbers that strictly increase with every successful write
/// across all keys. Can be switched unavailable to exercise the
/// store-outage paths of its callers.
#[derive(Debug)]
pub struct LocalKv {
    /// Key -> (value, version)
    entries: DashMap<String, (Bytes, u64)>,
    next_version: AtomicU64,
    available: AtomicBool,
}

impl LocalKv {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_version: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going down (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Overwrite a key unconditionally (test fixtures, manual repair)
    pub fn put_raw(&self, key: &str, value: Bytes) -> Version {
        let version = self.next_version.fetch_add(1, Ordering::AcqRel);
        self.entries.insert(key.to_string(), (value, version));
        Version::new(version.to_string())
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("local store marked unavailable".to_string()))
        }
    }
}

impl Default for LocalKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for LocalKv {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.check_available()?;
        Ok(self.entries.get(key).map(|entry| {
            let (value, version) = entry.value();
            Versioned {
                value: value.clone(),
                version: Version::new(version.to_string()),
            }
        }))
    }

    async fn cas_put(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<&Version>,
    ) -> Result<CasOutcome> {
        self.check_available()?;

        // The entry guard holds the shard lock for the compare and the swap.
        match (self.entries.entry(key.to_string()), expected) {
            (Entry::Vacant(vacant), None) => {
                let version = self.next_version.fetch_add(1, Ordering::AcqRel);
                vacant.insert((value, version));
                Ok(CasOutcome::Swapped(Version::new(version.to_string())))
            }
            (Entry::Occupied(mut occupied), Some(expected))
                if occupied.get().1.to_string() == expected.as_str() =>
            {
                let version = self.next_version.fetch_add(1, Ordering::AcqRel);
                occupied.insert((value, version));
                Ok(CasOutcome::Swapped(Version::new(version.to_string())))
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }
}
