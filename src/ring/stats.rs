//! Ring summary for status output

use super::desc::{IngesterState, RingDesc};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Ring statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RingStats {
    pub total_ingesters: usize,
    pub active_ingesters: usize,
    pub leaving_ingesters: usize,
    /// Ingesters whose heartbeat is older than the timeout, in any state
    pub unhealthy_ingesters: usize,
    pub total_tokens: usize,
    /// Fraction of the token space owned by each ingester
    pub ownership: BTreeMap<String, f64>,
}

const TOKEN_SPACE: f64 = u32::MAX as f64 + 1.0;

impl RingDesc {
    /// Summarize the ring as seen at `now`.
    ///
    /// An ingester owns the keys in `(previous token, its token]`; the first
    /// token also owns the wrap-around range above the last token.
    pub fn stats(&self, now: DateTime<Utc>, heartbeat_timeout: Duration) -> RingStats {
        let mut ownership: BTreeMap<String, f64> =
            self.ingesters.keys().map(|id| (id.clone(), 0.0)).collect();

        let len = self.tokens.len();
        for (i, token) in self.tokens.iter().enumerate() {
            let range = if i == 0 {
                let last = self.tokens[len - 1].token;
                (u32::MAX - last) as f64 + token.token as f64 + 1.0
            } else {
                token.token.saturating_sub(self.tokens[i - 1].token) as f64
            };
            *ownership.entry(token.ingester.clone()).or_insert(0.0) += range / TOKEN_SPACE;
        }

        let count_state =
            |state: IngesterState| self.ingesters.values().filter(|i| i.state == state).count();

        RingStats {
            total_ingesters: self.ingesters.len(),
            active_ingesters: count_state(IngesterState::Active),
            leaving_ingesters: count_state(IngesterState::Leaving),
            unhealthy_ingesters: self.stale_ingesters(now, heartbeat_timeout).len(),
            total_tokens: len,
            ownership,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_sums_to_one() {
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        let old = DateTime::from_timestamp(0, 0).unwrap();
        let mut desc = RingDesc::new();
        desc.add_ingester("a", "a:1", "", &[0, 1 << 31], IngesterState::Active, now);
        desc.add_ingester("b", "b:1", "", &[1 << 30], IngesterState::Leaving, old);

        let stats = desc.stats(now, Duration::from_secs(60));
        assert_eq!(stats.total_ingesters, 2);
        assert_eq!(stats.active_ingesters, 1);
        assert_eq!(stats.leaving_ingesters, 1);
        assert_eq!(stats.unhealthy_ingesters, 1);
        assert_eq!(stats.total_tokens, 3);

        let total: f64 = stats.ownership.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((stats.ownership["b"] - 0.25).abs() < 1e-9);
        assert!((stats.ownership["a"] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_stats_on_unsorted_tokens_does_not_panic() {
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        let mut desc = RingDesc::new();
        desc.add_ingester("a", "a:1", "", &[7, 99], IngesterState::Active, now);
        desc.tokens.reverse();

        let stats = desc.stats(now, Duration::from_secs(60));
        assert_eq!(stats.total_tokens, 2);
        assert!(stats.ownership["a"] > 0.0);
    }

    #[test]
    fn test_empty_ring_stats() {
        let stats = RingDesc::new().stats(Utc::now(), Duration::from_secs(60));
        assert_eq!(stats.total_ingesters, 0);
        assert!(stats.ownership.is_empty());
    }
}
