//! Hash routing: key -> ordered replica set
//!
//! Routing is a pure function of the descriptor and the key, so every
//! process holding the same descriptor computes the same replica set.

use super::desc::RingDesc;
use crate::{Error, Result};
use std::collections::HashSet;
use xxhash_rust::xxh32::xxh32;

/// An ingester selected to receive an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Replica {
    /// Ingester identity
    pub id: String,
    /// Address to send the operation to
    pub addr: String,
}

/// Read-only view of the ring used by write and read paths
pub trait ReadRing: Send + Sync {
    /// Up to `n` distinct Active ingesters owning `key`, primary first
    fn route(&self, key: u32, n: usize) -> Result<Vec<Replica>>;

    /// Every Active ingester, ordered by identity
    fn all_active(&self) -> Vec<Replica>;

    /// Configured replication factor
    fn replication_factor(&self) -> usize;
}

/// Map a (tenant, metric name) pair onto the token space.
pub fn token_for(tenant: &str, metric_name: &str) -> u32 {
    let mut buf = Vec::with_capacity(tenant.len() + metric_name.len() + 1);
    buf.extend_from_slice(tenant.as_bytes());
    buf.push(0);
    buf.extend_from_slice(metric_name.as_bytes());
    xxh32(&buf, 0)
}

impl RingDesc {
    /// Route `key` to up to `n` distinct Active ingesters.
    ///
    /// Starts at the first token >= `key` (wrapping to the smallest token)
    /// and walks the ring once. Ingesters that are not Active are skipped
    /// but still count as visited, so a Leaving ingester never causes a
    /// later token of its own to be picked up. If fewer than `n` Active
    /// ingesters exist, all of them are returned.
    pub fn route(&self, key: u32, n: usize) -> Result<Vec<Replica>> {
        if self.tokens.is_empty() {
            return Err(Error::EmptyRing);
        }

        let len = self.tokens.len();
        let start = match self.tokens.partition_point(|t| t.token < key) {
            i if i == len => 0,
            i => i,
        };

        let mut replicas = Vec::with_capacity(n);
        let mut seen = HashSet::with_capacity(n);

        for offset in 0..len {
            if replicas.len() >= n {
                break;
            }

            let token = &self.tokens[(start + offset) % len];
            if !seen.insert(token.ingester.as_str()) {
                continue;
            }

            match self.ingesters.get(&token.ingester) {
                Some(ingester) if ingester.is_active() => replicas.push(Replica {
                    id: token.ingester.clone(),
                    addr: ingester.hostname.clone(),
                }),
                _ => continue,
            }
        }

        Ok(replicas)
    }

    /// Every Active ingester, ordered by identity
    pub fn active_replicas(&self) -> Vec<Replica> {
        self.ingesters
            .iter()
            .filter(|(_, ingester)| ingester.is_active())
            .map(|(id, ingester)| Replica {
                id: id.clone(),
                addr: ingester.hostname.clone(),
            })
            .collect()
    }
}
