//! Ring descriptor: the shared document mapping ingesters to tokens
//!
//! A [`RingDesc`] is a plain value. Every change goes through
//! [`RingClient::update`](super::RingClient::update), which hands the
//! transform an owned copy decoded from the store and writes the result
//! back with a CAS, so nothing here takes locks or talks to the network.
//!
//! Unknown fields at every level are captured in `extra` and written back
//! unchanged, so a process running an older build never erases data a newer
//! build added to the document.

use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Lifecycle state of an ingester as recorded in the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngesterState {
    /// Accepting new work
    Active,
    /// Draining in-flight work before removing itself
    Leaving,
    /// A state written by a newer build; kept as-is and never routed to
    Unknown(i64),
}

impl IngesterState {
    fn code(self) -> i64 {
        match self {
            IngesterState::Active => 0,
            IngesterState::Leaving => 1,
            IngesterState::Unknown(code) => code,
        }
    }

    fn from_code(code: i64) -> Self {
        match code {
            0 => IngesterState::Active,
            1 => IngesterState::Leaving,
            other => IngesterState::Unknown(other),
        }
    }
}

impl fmt::Display for IngesterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngesterState::Active => write!(f, "Active"),
            IngesterState::Leaving => write!(f, "Leaving"),
            IngesterState::Unknown(code) => write!(f, "Unknown({})", code),
        }
    }
}

impl Serialize for IngesterState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for IngesterState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        i64::deserialize(deserializer).map(IngesterState::from_code)
    }
}

/// A single ingester's entry in the ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngesterDesc {
    /// Address used to reach the ingester (distinct from its identity)
    pub hostname: String,
    /// Address of the ingester's gRPC endpoint, if it serves one
    #[serde(default)]
    pub grpc_hostname: String,
    /// Last heartbeat
    pub timestamp: DateTime<Utc>,
    /// Lifecycle state
    pub state: IngesterState,
    /// Fields this build does not know about
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IngesterDesc {
    /// Whether the last heartbeat is within `timeout` of `now`
    pub fn is_healthy(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        now.signed_duration_since(self.timestamp) <= crate::clock::to_chrono(timeout)
    }

    pub fn is_active(&self) -> bool {
        self.state == IngesterState::Active
    }
}

/// One token owned by one ingester
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDesc {
    /// Field name kept as `tokens` for compatibility with existing ring documents.
    #[serde(rename = "tokens")]
    pub token: u32,
    pub ingester: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenDesc {
    pub fn new(token: u32, ingester: impl Into<String>) -> Self {
        Self {
            token,
            ingester: ingester.into(),
            extra: Map::new(),
        }
    }
}

/// The full partition map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RingDesc {
    /// Ingester identity -> entry
    #[serde(default, deserialize_with = "null_as_default")]
    pub ingesters: BTreeMap<String, IngesterDesc>,
    /// Union of every ingester's tokens, sorted ascending by token value.
    /// Equal tokens keep insertion order.
    #[serde(default, deserialize_with = "null_as_default")]
    pub tokens: Vec<TokenDesc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl RingDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ingesters.is_empty()
    }

    /// Insert or overwrite an ingester and append its tokens.
    ///
    /// Any tokens previously registered under `id` are dropped first, so
    /// re-registering after a restart never leaves stale tokens behind.
    /// Fields of an existing entry, and of any of its tokens that are
    /// re-added, that this build does not understand are carried over.
    pub fn add_ingester(
        &mut self,
        id: &str,
        hostname: &str,
        grpc_hostname: &str,
        tokens: &[u32],
        state: IngesterState,
        now: DateTime<Utc>,
    ) {
        let extra = self
            .ingesters
            .remove(id)
            .map(|previous| previous.extra)
            .unwrap_or_default();
        let mut previous_extra: HashMap<u32, Map<String, Value>> = HashMap::new();
        self.tokens.retain_mut(|t| {
            if t.ingester != id {
                return true;
            }
            previous_extra
                .entry(t.token)
                .or_insert_with(|| std::mem::take(&mut t.extra));
            false
        });

        self.ingesters.insert(
            id.to_string(),
            IngesterDesc {
                hostname: hostname.to_string(),
                grpc_hostname: grpc_hostname.to_string(),
                timestamp: now,
                state,
                extra,
            },
        );

        // Re-registered tokens keep fields this build does not understand.
        self.tokens.extend(tokens.iter().map(|&token| TokenDesc {
            token,
            ingester: id.to_string(),
            extra: previous_extra.remove(&token).unwrap_or_default(),
        }));

        // Stable: equal tokens stay in insertion order.
        self.tokens.sort_by_key(|t| t.token);
    }

    /// Delete an ingester and every token it owns. Returns whether it was present.
    pub fn remove_ingester(&mut self, id: &str) -> bool {
        let removed = self.ingesters.remove(id).is_some();
        self.tokens.retain(|t| t.ingester != id);
        removed
    }

    /// Refresh an ingester's heartbeat timestamp without touching its tokens.
    pub fn touch(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        match self.ingesters.get_mut(id) {
            Some(ingester) => {
                ingester.timestamp = now;
                true
            }
            None => false,
        }
    }

    /// Change an ingester's state and refresh its timestamp.
    pub fn set_state(&mut self, id: &str, state: IngesterState, now: DateTime<Utc>) -> bool {
        match self.ingesters.get_mut(id) {
            Some(ingester) => {
                ingester.state = state;
                ingester.timestamp = now;
                true
            }
            None => false,
        }
    }

    /// Tokens currently assigned to `id`, ascending.
    pub fn tokens_for(&self, id: &str) -> Vec<u32> {
        self.tokens
            .iter()
            .filter(|t| t.ingester == id)
            .map(|t| t.token)
            .collect()
    }

    /// Every token value present in the ring.
    pub fn taken_tokens(&self) -> HashSet<u32> {
        self.tokens.iter().map(|t| t.token).collect()
    }

    /// Ingesters whose last heartbeat is older than `timeout`.
    pub fn stale_ingesters(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> Vec<String> {
        self.ingesters
            .iter()
            .filter(|(_, ingester)| !ingester.is_healthy(now, timeout))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Verify the token list is sorted and only references known ingesters.
    pub fn check_invariants(&self) -> Result<()> {
        if let Some(pair) = self.tokens.windows(2).find(|w| w[0].token > w[1].token) {
            return Err(Error::Internal(format!(
                "tokens out of order: {} before {}",
                pair[0].token, pair[1].token
            )));
        }

        if let Some(orphan) = self
            .tokens
            .iter()
            .find(|t| !self.ingesters.contains_key(&t.ingester))
        {
            return Err(Error::Internal(format!(
                "token {} references unknown ingester {}",
                orphan.token, orphan.ingester
            )));
        }

        Ok(())
    }

    /// Encode for storage
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a stored document.
    ///
    /// A zero-length value is an empty ring. Tokens are re-sorted by value.
    /// Anything else that fails to parse is reported as [`Error::DecodeCorruption`]; callers must never
    /// replace it with an empty ring.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        let mut desc: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::DecodeCorruption(e.to_string()))?;
        // The token list is derived from the entries; restore its order
        // rather than trusting the writer. Stable, so ties keep document order.
        desc.tokens.sort_by_key(|t| t.token);
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn token_values(desc: &RingDesc) -> Vec<u32> {
        desc.tokens.iter().map(|t| t.token).collect()
    }

    #[test]
    fn test_add_keeps_tokens_sorted() {
        let mut desc = RingDesc::new();
        desc.add_ingester("a", "10.0.0.1:9095", "", &[90, 10, 130, 50], IngesterState::Active, ts(0));
        desc.add_ingester("b", "10.0.0.2:9095", "", &[150, 30, 110, 70], IngesterState::Active, ts(0));

        assert_eq!(token_values(&desc), vec![10, 30, 50, 70, 90, 110, 130, 150]);
        assert_eq!(desc.tokens_for("a"), vec![10, 50, 90, 130]);
        desc.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_drops_all_tokens() {
        let mut desc = RingDesc::new();
        desc.add_ingester("a", "a:1", "", &[10, 50], IngesterState::Active, ts(0));
        desc.add_ingester("b", "b:1", "", &[30, 70], IngesterState::Active, ts(0));

        assert!(desc.remove_ingester("a"));
        assert_eq!(token_values(&desc), vec![30, 70]);
        assert!(!desc.ingesters.contains_key("a"));

        // Absent id is a no-op
        let before = desc.clone();
        assert!(!desc.remove_ingester("a"));
        assert_eq!(desc, before);
        desc.check_invariants().unwrap();
    }

    #[test]
    fn test_reregistration_replaces_tokens() {
        let mut desc = RingDesc::new();
        desc.add_ingester("a", "a:1", "", &[10, 20], IngesterState::Active, ts(0));
        desc.add_ingester("a", "a:2", "", &[15, 25], IngesterState::Leaving, ts(5));

        assert_eq!(desc.tokens_for("a"), vec![15, 25]);
        assert_eq!(desc.tokens.len(), 2);
        let entry = &desc.ingesters["a"];
        assert_eq!(entry.hostname, "a:2");
        assert_eq!(entry.state, IngesterState::Leaving);
        assert_eq!(entry.timestamp, ts(5));
    }

    #[test]
    fn test_equal_tokens_keep_insertion_order() {
        let mut desc = RingDesc::new();
        desc.add_ingester("first", "f:1", "", &[40], IngesterState::Active, ts(0));
        desc.add_ingester("second", "s:1", "", &[40, 10], IngesterState::Active, ts(0));

        let owners: Vec<&str> = desc.tokens.iter().map(|t| t.ingester.as_str()).collect();
        assert_eq!(owners, vec!["second", "first", "second"]);
        assert_eq!(token_values(&desc), vec![10, 40, 40]);
    }

    #[test]
    fn test_touch_and_set_state() {
        let mut desc = RingDesc::new();
        desc.add_ingester("a", "a:1", "", &[1], IngesterState::Active, ts(0));

        assert!(desc.touch("a", ts(10)));
        assert_eq!(desc.ingesters["a"].timestamp, ts(10));
        assert!(!desc.touch("missing", ts(10)));

        assert!(desc.set_state("a", IngesterState::Leaving, ts(20)));
        assert_eq!(desc.ingesters["a"].state, IngesterState::Leaving);
        assert_eq!(desc.tokens_for("a"), vec![1]);
    }

    #[test]
    fn test_stale_ingesters() {
        let mut desc = RingDesc::new();
        desc.add_ingester("fresh", "f:1", "", &[1], IngesterState::Active, ts(100));
        desc.add_ingester("stale", "s:1", "", &[2], IngesterState::Active, ts(10));

        let stale = desc.stale_ingesters(ts(120), std::time::Duration::from_secs(60));
        assert_eq!(stale, vec!["stale".to_string()]);
    }

    #[test]
    fn test_decode_legacy_document() {
        let raw = br#"{
            "ingesters": {
                "ing-1": {
                    "hostname": "10.0.0.1:9095",
                    "timestamp": "2017-03-01T12:00:00Z",
                    "state": 0,
                    "grpc_hostname": "10.0.0.1:9095"
                }
            },
            "tokens": [
                {"tokens": 7, "ingester": "ing-1"},
                {"tokens": 99, "ingester": "ing-1"}
            ]
        }"#;

        let desc = RingDesc::decode(raw).unwrap();
        assert_eq!(desc.tokens_for("ing-1"), vec![7, 99]);
        assert_eq!(desc.ingesters["ing-1"].state, IngesterState::Active);
    }

    #[test]
    fn test_decode_null_tokens() {
        let desc = RingDesc::decode(br#"{"ingesters": {}, "tokens": null}"#).unwrap();
        assert!(desc.tokens.is_empty());
        assert!(desc.is_empty());
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let raw = br#"{
            "ingesters": {
                "ing-1": {
                    "hostname": "h:1",
                    "timestamp": "2017-03-01T12:00:00Z",
                    "state": 4,
                    "zone": "us-east-1a"
                }
            },
            "tokens": [{"tokens": 7, "ingester": "ing-1", "weight": 2}],
            "generation": 12
        }"#;

        let mut desc = RingDesc::decode(raw).unwrap();
        assert_eq!(desc.ingesters["ing-1"].state, IngesterState::Unknown(4));

        // Overwriting the entry keeps the fields this build does not know.
        desc.add_ingester("ing-1", "h:2", "", &[7], IngesterState::Unknown(4), ts(0));

        let encoded = desc.encode().unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["generation"], 12);
        assert_eq!(value["ingesters"]["ing-1"]["zone"], "us-east-1a");
        assert_eq!(value["ingesters"]["ing-1"]["state"], 4);
        assert_eq!(value["tokens"][0]["tokens"], 7);
        assert_eq!(value["tokens"][0]["weight"], 2);
    }

    #[test]
    fn test_reregistration_keeps_token_fields_of_kept_tokens() {
        let raw = br#"{
            "ingesters": {
                "a": {"hostname": "h:1", "timestamp": "2017-03-01T12:00:00Z", "state": 0}
            },
            "tokens": [
                {"tokens": 7, "ingester": "a", "weight": 2},
                {"tokens": 99, "ingester": "a", "weight": 5}
            ]
        }"#;

        let mut desc = RingDesc::decode(raw).unwrap();
        desc.add_ingester("a", "h:2", "", &[7, 150], IngesterState::Active, ts(0));

        assert_eq!(token_values(&desc), vec![7, 150]);
        assert_eq!(desc.tokens[0].extra["weight"], 2);
        // Dropped token takes its fields with it; new tokens start clean
        assert!(desc.tokens[1].extra.is_empty());
    }

    #[test]
    fn test_decode_sorts_unsorted_tokens() {
        let raw = br#"{
            "ingesters": {
                "a": {"hostname": "h:1", "timestamp": "2017-03-01T12:00:00Z", "state": 0},
                "b": {"hostname": "h:2", "timestamp": "2017-03-01T12:00:00Z", "state": 0}
            },
            "tokens": [
                {"tokens": 99, "ingester": "a"},
                {"tokens": 50, "ingester": "b"},
                {"tokens": 7, "ingester": "a"},
                {"tokens": 50, "ingester": "a"}
            ]
        }"#;

        let desc = RingDesc::decode(raw).unwrap();
        assert_eq!(token_values(&desc), vec![7, 50, 50, 99]);
        // Tie keeps document order
        assert_eq!(desc.tokens[1].ingester, "b");
        assert!(desc.check_invariants().is_ok());
        assert_eq!(desc.route(8, 1).unwrap()[0].id, "b");

        let stats = desc.stats(ts(0), std::time::Duration::from_secs(60));
        assert_eq!(stats.total_tokens, 4);
    }

    #[test]
    fn test_decode_corruption_is_reported() {
        let err = RingDesc::decode(b"{\"ingesters\": [").unwrap_err();
        assert!(matches!(err, Error::DecodeCorruption(_)));

        let err = RingDesc::decode(b"[1, 2, 3]").unwrap_err();
        assert!(matches!(err, Error::DecodeCorruption(_)));
    }

    #[test]
    fn test_empty_value_is_empty_ring() {
        assert_eq!(RingDesc::decode(b"").unwrap(), RingDesc::new());
    }

    #[test]
    fn test_check_invariants_detects_orphans() {
        let mut desc = RingDesc::new();
        desc.add_ingester("a", "a:1", "", &[1], IngesterState::Active, ts(0));
        desc.tokens.push(TokenDesc::new(5, "ghost"));
        assert!(desc.check_invariants().is_err());
    }
}
