//! Component factory for environment-based configuration
//!
//! Picks the coordination store backing the ring from environment
//! variables, so the same binaries run against an in-process store in
//! development and S3 in production.

use crate::kv::{KvStore, LocalKv, ObjectStoreKv};
use crate::Result;
use object_store::{aws::AmazonS3Builder, memory::InMemory, ObjectStore};
use std::sync::Arc;
use tracing::info;

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the coordination store from environment
    ///
    /// Environment variables:
    /// - RING_STORE_BACKEND: "local" (default), "memory" or "s3"
    /// - RING_STORE_PREFIX: key prefix inside the bucket (default: ring/)
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID: AWS credentials (optional, uses IAM role if not set)
    /// - AWS_SECRET_ACCESS_KEY: AWS credentials (optional)
    pub async fn create_kv_store() -> Result<Arc<dyn KvStore>> {
        let backend = std::env::var("RING_STORE_BACKEND").unwrap_or_else(|_| "local".to_string());
        let prefix = std::env::var("RING_STORE_PREFIX").unwrap_or_else(|_| "ring/".to_string());

        match backend.as_str() {
            "local" => {
                info!("Using LocalKv ring store (single process)");
                Ok(Arc::new(LocalKv::new()))
            }
            "memory" => {
                info!("Using in-memory object store for the ring (development mode)");
                let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
                Ok(Arc::new(ObjectStoreKv::new(store, prefix)))
            }
            "s3" => {
                let store = Self::create_s3_store()?;
                info!(prefix = %prefix, "Using S3 ring store");
                Ok(Arc::new(ObjectStoreKv::new(store, prefix)))
            }
            _ => Err(crate::Error::Config(format!(
                "Unknown RING_STORE_BACKEND: {}. Use 'local', 'memory' or 's3'",
                backend
            ))),
        }
    }

    fn create_s3_store() -> Result<Arc<dyn ObjectStore>> {
        let bucket = std::env::var("S3_BUCKET").map_err(|_| {
            crate::Error::Config("S3_BUCKET required when RING_STORE_BACKEND=s3".to_string())
        })?;
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

        info!(
            "Using S3 object store: bucket={}, region={}",
            bucket, region
        );

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&bucket)
            .with_region(&region)
            // Conditional puts carry the ETag check
            .with_conditional_put(object_store::aws::S3ConditionalPut::ETagMatch);

        // Support custom endpoints (MinIO, LocalStack)
        if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
            info!("Using custom S3 endpoint: {}", endpoint);
            builder = builder.with_endpoint(&endpoint).with_allow_http(true);
        }

        // Use explicit credentials if provided, otherwise use IAM role
        if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
            builder = builder.with_access_key_id(&key);
        }
        if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            builder = builder.with_secret_access_key(&secret);
        }

        Ok(Arc::new(builder.build()?))
    }
}
