//! Integration tests for ring membership: join, heartbeat, eviction, leave
//!
//! Each ingester gets its own `RingClient` over a shared store, the way
//! separate processes would see the ring.

use chrono::Utc;
use ingest_ring::clock::{Clock, ManualClock, MonotonicClock};
use ingest_ring::kv::{KvStore, LocalKv};
use ingest_ring::lifecycle::{LifecycleConfig, LifecycleState, Lifecycler};
use ingest_ring::ring::{IngesterState, ReadRing, RingClient, RingConfig, TokenStrategy};
use ingest_ring::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn ring_config() -> RingConfig {
    RingConfig {
        key: "collectors/ring".to_string(),
        max_cas_retries: 20,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(10),
        ..Default::default()
    }
}

fn member(
    kv: &Arc<dyn KvStore>,
    id: &str,
    strategy: TokenStrategy,
    clock: Arc<dyn Clock>,
) -> (Arc<RingClient>, Arc<Lifecycler>) {
    let ring = Arc::new(RingClient::new(kv.clone(), ring_config()).unwrap());
    let mut config = LifecycleConfig::new(id, format!("{}.ingesters:9095", id));
    config.num_tokens = 8;
    config.token_strategy = strategy;
    config.heartbeat_period = Duration::from_secs(5);
    config.heartbeat_timeout_multiple = 12;
    let lifecycler = Arc::new(Lifecycler::with_clock(config, ring.clone(), clock).unwrap());
    (ring, lifecycler)
}

fn first_replica(ring: &RingClient, key: u32) -> String {
    ring.route(key, 1).unwrap()[0].id.clone()
}

/// Two ingesters join, one leaves; routing follows each step
#[tokio::test]
async fn test_join_route_leave_scenario() {
    let kv: Arc<dyn KvStore> = Arc::new(LocalKv::new());
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());

    let (ring_a, a) = member(&kv, "a", TokenStrategy::Fixed(vec![10, 50, 90, 130]), clock.clone());
    let (ring_b, b) = member(&kv, "b", TokenStrategy::Fixed(vec![30, 70, 110, 150]), clock.clone());

    assert!(matches!(ring_a.route(60, 1), Err(Error::EmptyRing)));

    a.join().await.unwrap();
    assert_eq!(a.state(), LifecycleState::Active);
    assert_eq!(a.tokens(), vec![10, 50, 90, 130]);
    assert_eq!(first_replica(&ring_a, 60), "a");

    b.join().await.unwrap();
    assert_eq!(first_replica(&ring_b, 60), "b");

    // a's cache only catches up on refresh
    assert_eq!(first_replica(&ring_a, 60), "a");
    ring_a.refresh().await.unwrap();
    assert_eq!(first_replica(&ring_a, 60), "b");

    a.leave(Duration::ZERO).await.unwrap();
    assert_eq!(a.state(), LifecycleState::Gone);

    ring_b.refresh().await.unwrap();
    assert_eq!(first_replica(&ring_b, 60), "b");
    // Token 10 is gone; the walk starts at 30
    assert_eq!(first_replica(&ring_b, 20), "b");
    assert!(!ring_b.current().ingesters.contains_key("a"));
    assert_eq!(ring_b.current().tokens.len(), 4);
}

/// A Leaving ingester keeps its tokens but is never routed to
#[tokio::test(start_paused = true)]
async fn test_leaving_ingester_is_skipped_during_drain() {
    let kv: Arc<dyn KvStore> = Arc::new(LocalKv::new());
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());

    let (_, a) = member(&kv, "a", TokenStrategy::Fixed(vec![10, 50]), clock.clone());
    let (ring_b, b) = member(&kv, "b", TokenStrategy::Fixed(vec![30, 70]), clock.clone());
    a.join().await.unwrap();
    b.join().await.unwrap();

    let leaving = a.clone();
    let handle = tokio::spawn(async move { leaving.leave(Duration::from_secs(30)).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(a.state(), LifecycleState::Leaving);

    let desc = ring_b.refresh().await.unwrap();
    assert_eq!(desc.ingesters["a"].state, IngesterState::Leaving);
    assert_eq!(desc.tokens_for("a"), vec![10, 50]);

    let replicas = ring_b.route(5, 2).unwrap();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0].id, "b");

    handle.await.unwrap().unwrap();
    assert_eq!(a.state(), LifecycleState::Gone);
    let desc = ring_b.refresh().await.unwrap();
    assert!(desc.ingesters.get("a").is_none());
    assert!(desc.tokens_for("a").is_empty());
}

/// Peers whose heartbeat aged past the timeout are evicted exactly once
#[tokio::test]
async fn test_stale_peer_is_evicted() {
    let kv: Arc<dyn KvStore> = Arc::new(LocalKv::new());
    let manual = Arc::new(ManualClock::new(Utc::now()));
    let clock: Arc<dyn Clock> = manual.clone();

    let (ring_a, a) = member(&kv, "a", TokenStrategy::default(), clock.clone());
    let (_, b) = member(&kv, "b", TokenStrategy::default(), clock.clone());
    a.join().await.unwrap();
    b.join().await.unwrap();

    manual.advance(Duration::from_secs(30));
    a.heartbeat().await.unwrap();
    assert!(a.evict_stale().await.unwrap().is_empty());

    // b has been silent for 70s, past the 60s timeout; a for 40s
    manual.advance(Duration::from_secs(40));
    let evicted = a.evict_stale().await.unwrap();
    assert_eq!(evicted, vec!["b".to_string()]);

    let desc = ring_a.current();
    assert!(!desc.ingesters.contains_key("b"));
    assert!(desc.tokens.iter().all(|t| t.ingester == "a"));
    assert!(desc.check_invariants().is_ok());

    // Nothing left to evict
    assert!(a.evict_stale().await.unwrap().is_empty());
}

/// An evicted ingester that is still alive re-registers on its next heartbeat
#[tokio::test]
async fn test_heartbeat_reregisters_after_eviction() {
    let kv: Arc<dyn KvStore> = Arc::new(LocalKv::new());
    let manual = Arc::new(ManualClock::new(Utc::now()));
    let clock: Arc<dyn Clock> = manual.clone();

    let (ring_a, a) = member(&kv, "a", TokenStrategy::default(), clock.clone());
    let (_, b) = member(&kv, "b", TokenStrategy::default(), clock.clone());
    a.join().await.unwrap();
    b.join().await.unwrap();
    let b_tokens = b.tokens();

    manual.advance(Duration::from_secs(61));
    a.heartbeat().await.unwrap();
    assert_eq!(a.evict_stale().await.unwrap(), vec!["b".to_string()]);

    b.heartbeat().await.unwrap();
    assert_eq!(b.state(), LifecycleState::Active);

    let desc = ring_a.refresh().await.unwrap();
    assert_eq!(desc.tokens_for("b"), b_tokens);
    assert_eq!(desc.ingesters["b"].state, IngesterState::Active);
    assert_eq!(desc.ingesters["b"].timestamp, manual.now());
}

/// Heartbeat only moves the timestamp
#[tokio::test]
async fn test_heartbeat_updates_only_timestamp() {
    let kv: Arc<dyn KvStore> = Arc::new(LocalKv::new());
    let manual = Arc::new(ManualClock::new(Utc::now()));

    let (ring, a) = member(&kv, "a", TokenStrategy::default(), manual.clone());
    a.join().await.unwrap();
    let before = ring.current();

    manual.advance(Duration::from_secs(5));
    a.heartbeat().await.unwrap();
    let after = ring.current();

    assert_eq!(after.tokens, before.tokens);
    assert_eq!(after.ingesters["a"].state, before.ingesters["a"].state);
    assert_eq!(after.ingesters["a"].hostname, before.ingesters["a"].hostname);
    assert_eq!(
        after.ingesters["a"].timestamp - before.ingesters["a"].timestamp,
        chrono::Duration::seconds(5)
    );
}

/// A restarted process reclaims the tokens its old entry still holds
#[tokio::test]
async fn test_rejoin_reclaims_tokens() {
    let kv: Arc<dyn KvStore> = Arc::new(LocalKv::new());
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());

    let (_, first) = member(&kv, "a", TokenStrategy::Random, clock.clone());
    first.join().await.unwrap();
    let original = first.tokens();
    drop(first);

    let (ring, restarted) = member(&kv, "a", TokenStrategy::Random, clock.clone());
    restarted.join().await.unwrap();
    assert_eq!(restarted.tokens(), original);
    assert_eq!(ring.current().tokens_for("a"), original);
    assert_eq!(ring.current().tokens.len(), original.len());
}

/// Lifecycle transitions out of order are rejected
#[tokio::test]
async fn test_invalid_transitions() {
    let kv: Arc<dyn KvStore> = Arc::new(LocalKv::new());
    let (_, a) = member(&kv, "a", TokenStrategy::default(), Arc::new(MonotonicClock::new()));

    assert!(matches!(a.heartbeat().await, Err(Error::InvalidState(_))));
    assert!(matches!(a.leave(Duration::ZERO).await, Err(Error::InvalidState(_))));

    a.join().await.unwrap();
    assert!(matches!(a.join().await, Err(Error::InvalidState(_))));

    a.leave(Duration::ZERO).await.unwrap();
    assert!(matches!(a.heartbeat().await, Err(Error::InvalidState(_))));

    // Gone can join again
    a.join().await.unwrap();
    assert_eq!(a.state(), LifecycleState::Active);
}

/// The heartbeat loop writes on each period and stops on cancellation
#[tokio::test(start_paused = true)]
async fn test_heartbeat_loop_runs_until_cancelled() {
    let kv: Arc<dyn KvStore> = Arc::new(LocalKv::new());
    let manual = Arc::new(ManualClock::new(Utc::now()));
    let (ring, a) = member(&kv, "a", TokenStrategy::default(), manual.clone());
    a.join().await.unwrap();
    let joined_at = ring.current().ingesters["a"].timestamp;

    let shutdown = CancellationToken::new();
    let looping = a.clone();
    let loop_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move { looping.run_heartbeat_loop(loop_shutdown).await });

    manual.advance(Duration::from_secs(6));
    tokio::time::sleep(Duration::from_secs(6)).await;
    let beat = ring.current().ingesters["a"].timestamp;
    assert!(beat > joined_at);

    shutdown.cancel();
    handle.await.unwrap();
}

/// The token list stays sorted and consistent across a mixed sequence
#[tokio::test]
async fn test_token_order_holds_across_membership_changes() {
    let kv: Arc<dyn KvStore> = Arc::new(LocalKv::new());
    let manual = Arc::new(ManualClock::new(Utc::now()));
    let clock: Arc<dyn Clock> = manual.clone();

    let members: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|id| member(&kv, id, TokenStrategy::default(), clock.clone()))
        .collect();
    for (_, lifecycler) in &members {
        lifecycler.join().await.unwrap();
    }

    members[1].1.leave(Duration::ZERO).await.unwrap();
    manual.advance(Duration::from_secs(61));
    members[0].1.heartbeat().await.unwrap();
    let evicted = members[0].1.evict_stale().await.unwrap();
    assert_eq!(evicted, vec!["c".to_string(), "d".to_string()]);
    members[1].1.join().await.unwrap();

    let desc = members[0].0.refresh().await.unwrap();
    assert!(desc.check_invariants().is_ok());
    assert!(desc.tokens.windows(2).all(|w| w[0].token <= w[1].token));
    assert_eq!(
        desc.ingesters.keys().cloned().collect::<Vec<_>>(),
        vec!["a".to_string(), "b".to_string()]
    );
    assert_eq!(desc.tokens.len(), 16);
}

/// Reclaiming tokens on restart keeps per-token fields written by newer builds
#[tokio::test]
async fn test_rejoin_preserves_unknown_token_fields() {
    let local = Arc::new(LocalKv::new());
    local.put_raw(
        "collectors/ring",
        bytes::Bytes::from_static(
            br#"{
                "ingesters": {
                    "a": {"hostname": "a.ingesters:9095", "timestamp": "2017-03-01T12:00:00Z", "state": 0, "zone": "z1"}
                },
                "tokens": [
                    {"tokens": 7, "ingester": "a", "weight": 2},
                    {"tokens": 99, "ingester": "a", "weight": 3}
                ]
            }"#,
        ),
    );
    let kv: Arc<dyn KvStore> = local;

    let (_, a) = member(&kv, "a", TokenStrategy::default(), Arc::new(MonotonicClock::new()));
    a.join().await.unwrap();
    assert_eq!(a.tokens(), vec![7, 99]);

    let stored = kv.get("collectors/ring").await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&stored.value).unwrap();
    assert_eq!(value["tokens"][0]["tokens"], 7);
    assert_eq!(value["tokens"][0]["weight"], 2);
    assert_eq!(value["tokens"][1]["weight"], 3);
    assert_eq!(value["ingesters"]["a"]["zone"], "z1");
}
