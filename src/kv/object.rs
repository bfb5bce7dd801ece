//! Object-store backed coordination store
//!
//! Uses the object's ETag as the version and conditional PUTs for CAS:
//! `PutMode::Create` for the first write, `PutMode::Update` afterwards.
//! Works against S3 (and compatible stores that implement conditional
//! writes) and `object_store::memory::InMemory`.

use super::{CasOutcome, KvStore, Version, Versioned};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, histogram};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Coordination store on top of an [`ObjectStore`]
pub struct ObjectStoreKv {
    object_store: Arc<dyn ObjectStore>,
    /// Prefix prepended to every key
    prefix: String,
}

impl ObjectStoreKv {
    pub fn new(object_store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            object_store,
            prefix: prefix.into(),
        }
    }

    fn path(&self, key: &str) -> Path {
        Path::from(format!("{}{}", self.prefix, key))
    }
}

impl fmt::Debug for ObjectStoreKv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreKv")
            .field("object_store", &self.object_store.to_string())
            .field("prefix", &self.prefix)
            .finish()
    }
}

fn record_cas(result: &'static str, started: Instant) {
    counter!(
        "ring_kv_cas_attempts_total",
        "service" => crate::telemetry::service(),
        "result" => result
    )
    .increment(1);
    histogram!(
        "ring_kv_cas_duration_seconds",
        "service" => crate::telemetry::service(),
        "result" => result
    )
    .record(started.elapsed().as_secs_f64());
}

#[async_trait]
impl KvStore for ObjectStoreKv {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let path = self.path(key);

        let result = match self.object_store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                debug!("No object at {}", path);
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::StoreUnavailable(format!(
                    "failed to read {}: {}",
                    path, e
                )))
            }
        };

        let Some(e_tag) = result.meta.e_tag.clone() else {
            return Err(Error::Config(format!(
                "object store returned no ETag for {}; conditional writes are required",
                path
            )));
        };

        let value = result
            .bytes()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("failed to read {}: {}", path, e)))?;

        Ok(Some(Versioned {
            value,
            version: Version::new(e_tag),
        }))
    }

    async fn cas_put(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<&Version>,
    ) -> Result<CasOutcome> {
        let path = self.path(key);
        let started = Instant::now();

        let mode = match expected {
            // First write: Create so two processes racing to initialize can't both win
            None => PutMode::Create,
            Some(version) => PutMode::Update(UpdateVersion {
                e_tag: Some(version.as_str().to_string()),
                version: None,
            }),
        };
        let opts = PutOptions {
            mode,
            ..Default::default()
        };

        match self
            .object_store
            .put_opts(&path, PutPayload::from(value), opts)
            .await
        {
            Ok(put) => {
                record_cas("ok", started);
                match put.e_tag {
                    Some(e_tag) => Ok(CasOutcome::Swapped(Version::new(e_tag))),
                    None => Err(Error::Config(format!(
                        "object store returned no ETag after writing {}",
                        path
                    ))),
                }
            }
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => {
                record_cas("conflict", started);
                Ok(CasOutcome::Conflict)
            }
            Err(object_store::Error::NotImplemented)
            | Err(object_store::Error::NotSupported { .. }) => {
                record_cas("error", started);
                Err(Error::Config(format!(
                    "conditional writes are required for the ring at {} but are not supported by the object store",
                    path
                )))
            }
            Err(e) => {
                record_cas("error", started);
                warn!("Conditional write to {} failed: {}", path, e);
                Err(Error::StoreUnavailable(format!(
                    "failed to write {}: {}",
                    path, e
                )))
            }
        }
    }
}
