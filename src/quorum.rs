//! Quorum fan-out over a replica set
//!
//! Sends one operation to every replica in parallel and succeeds once a
//! strict majority has acknowledged. Each replica call runs as its own
//! task: returning to the caller (on quorum, on certain failure or on
//! timeout) does not cancel calls still in flight.

use crate::error::ReplicaFailure;
use crate::ring::Replica;
use crate::{Error, Result};
use metrics::counter;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Acknowledgements needed from a replica set of size `n`: `⌈(n+1)/2⌉`
pub fn quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Fan-out/fan-in helper with a default per-request timeout
#[derive(Debug, Clone)]
pub struct QuorumExecutor {
    timeout: Duration,
}

impl Default for QuorumExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl QuorumExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `op` against every replica with the default timeout.
    pub async fn execute<T, F, Fut>(&self, replicas: &[Replica], op: F) -> Result<Vec<(Replica, T)>>
    where
        F: Fn(Replica) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_with_timeout(replicas, op, self.timeout).await
    }

    /// Run `op` against every replica concurrently.
    ///
    /// Returns the acknowledging replicas and their responses as soon as
    /// `quorum(replicas.len())` have succeeded. Fails with
    /// [`Error::QuorumFailure`] as soon as that becomes impossible, or when
    /// `timeout` elapses first. Every replica appears in the failure detail:
    /// ones that had not answered are reported as timed out, or as not
    /// awaited when the executor gave up early.
    pub async fn execute_with_timeout<T, F, Fut>(
        &self,
        replicas: &[Replica],
        op: F,
        timeout: Duration,
    ) -> Result<Vec<(Replica, T)>>
    where
        F: Fn(Replica) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let required = quorum(replicas.len());
        if replicas.is_empty() {
            return Err(record(Error::QuorumFailure {
                required,
                succeeded: 0,
                failures: Vec::new(),
            }));
        }
        let max_failures = replicas.len() - required;

        let (tx, mut rx) = mpsc::channel(replicas.len());
        for (idx, replica) in replicas.iter().enumerate() {
            let call = op(replica.clone());
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = call.await;
                // Receiver is gone once the caller has its answer.
                let _ = tx.send((idx, result)).await;
            });
        }
        drop(tx);

        let deadline = Instant::now() + timeout;
        let mut answered = vec![false; replicas.len()];
        let mut acks = Vec::with_capacity(required);
        let mut failures = Vec::new();

        while acks.len() < required && failures.len() <= max_failures {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((idx, result))) => {
                    answered[idx] = true;
                    let replica = &replicas[idx];
                    match result {
                        Ok(value) => acks.push((replica.clone(), value)),
                        Err(e) => {
                            debug!(ingester = %replica.id, addr = %replica.addr, "Replica call failed: {}", e);
                            failures.push(failure(replica, e.to_string()));
                        }
                    }
                }
                Ok(None) => {
                    // Every task finished; any silent ones panicked.
                    collect_unanswered(replicas, &mut answered, "replica call aborted", &mut failures);
                    break;
                }
                Err(_) => {
                    collect_unanswered(replicas, &mut answered, &Error::Timeout.to_string(), &mut failures);
                    break;
                }
            }
        }

        if acks.len() < required {
            // Failed fast: the rest are still running but no longer matter.
            collect_unanswered(replicas, &mut answered, "not awaited", &mut failures);
        }

        if acks.len() >= required {
            counter!(
                "ring_quorum_requests_total",
                "service" => crate::telemetry::service(),
                "result" => "ok"
            )
            .increment(1);
            return Ok(acks);
        }

        Err(record(Error::QuorumFailure {
            required,
            succeeded: acks.len(),
            failures,
        }))
    }

    /// Quorum read: same threshold as writes, responses combined by `merge`.
    pub async fn execute_read<T, M, F, Fut, G>(
        &self,
        replicas: &[Replica],
        op: F,
        merge: G,
    ) -> Result<M>
    where
        F: Fn(Replica) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        G: FnOnce(Vec<T>) -> M,
    {
        let acks = self.execute(replicas, op).await?;
        Ok(merge(acks.into_iter().map(|(_, value)| value).collect()))
    }
}

fn failure(replica: &Replica, reason: String) -> ReplicaFailure {
    ReplicaFailure {
        ingester: replica.id.clone(),
        addr: replica.addr.clone(),
        reason,
    }
}

fn collect_unanswered(
    replicas: &[Replica],
    answered: &mut [bool],
    reason: &str,
    failures: &mut Vec<ReplicaFailure>,
) {
    for (replica, done) in replicas.iter().zip(answered.iter_mut()) {
        if !*done {
            *done = true;
            failures.push(failure(replica, reason.to_string()));
        }
    }
}

fn record(err: Error) -> Error {
    counter!(
        "ring_quorum_requests_total",
        "service" => crate::telemetry::service(),
        "result" => "failure"
    )
    .increment(1);
    err
}
