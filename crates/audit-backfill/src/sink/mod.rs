//! Content-addressed destination store.
//!
//! Records are written as JSON objects under a key derived from the tenant
//! and the record's creation minute:
//!
//! ```text
//! [prefix/]{tenant_id}/{yyyy}/{MM}/{dd}/{HH}/{mm}/{record_id}
//! ```
//!
//! An upsert compares the SHA-256 digest of the new body with whatever is
//! stored under the key, so repeating a backfill rewrites nothing.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::SinkConfig;
use crate::core::{AuditRecord, RecordSink, TenantDescriptor, UpsertOutcome};
use crate::error::{BackfillError, Result};

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Object key for a tenant's record.
pub fn object_key(prefix: Option<&str>, tenant: &TenantDescriptor, record: &AuditRecord) -> String {
    let minute = record.created_at().format("%Y/%m/%d/%H/%M");
    let key = format!("{}/{}/{}", tenant.tenant_id(), minute, record.id);
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, key),
        None => key,
    }
}

/// Idempotent sink over any `object_store` backend.
#[derive(Debug, Clone)]
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    sink_type: String,
}

impl ObjectStoreSink {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: None,
            sink_type: "object_store".to_string(),
        }
    }

    /// In-memory sink, mainly for tests.
    pub fn in_memory() -> Self {
        let mut sink = Self::new(Arc::new(InMemory::new()));
        sink.sink_type = "memory".to_string();
        sink
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Build the sink described by the `sink` config section.
    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.r#type.as_str() {
            "s3" => {
                let bucket = config
                    .bucket
                    .as_deref()
                    .ok_or_else(|| BackfillError::Config("sink.bucket is required for s3".into()))?;
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &config.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Arc::new(builder.build()?)
            }
            "local" => {
                let root = config
                    .root
                    .as_deref()
                    .ok_or_else(|| BackfillError::Config("sink.root is required for local".into()))?;
                std::fs::create_dir_all(root)?;
                Arc::new(LocalFileSystem::new_with_prefix(root)?)
            }
            "memory" => Arc::new(InMemory::new()),
            other => {
                return Err(BackfillError::Config(format!(
                    "unsupported sink.type '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            store,
            prefix: config.prefix.clone(),
            sink_type: config.r#type.clone(),
        })
    }

    /// Underlying object store handle.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Read back a stored record.
    pub async fn get(&self, tenant: &TenantDescriptor, record: &AuditRecord) -> Result<Option<AuditRecord>> {
        let path = Path::from(object_key(self.prefix.as_deref(), tenant, record));
        match self.store.get(&path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn existing_digest(&self, path: &Path) -> Result<Option<String>> {
        match self.store.get(path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(Some(sha256_hex(&bytes)))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RecordSink for ObjectStoreSink {
    async fn upsert(&self, tenant: &TenantDescriptor, record: &AuditRecord) -> Result<UpsertOutcome> {
        let path = Path::from(object_key(self.prefix.as_deref(), tenant, record));
        let body = serde_json::to_vec(record)?;
        let digest = sha256_hex(&body);

        let outcome = match self.existing_digest(&path).await? {
            Some(existing) if existing == digest => {
                debug!("{} already stored with matching checksum", path);
                return Ok(UpsertOutcome::AlreadyExisted);
            }
            Some(existing) => {
                warn!(
                    "Overwriting {}: stored checksum {} differs from {}",
                    path, existing, digest
                );
                UpsertOutcome::Replaced
            }
            None => UpsertOutcome::Created,
        };

        self.store
            .put(&path, PutPayload::from(Bytes::from(body)))
            .await
            .map_err(|e| BackfillError::sink(&record.id, e.to_string()))?;
        Ok(outcome)
    }

    fn sink_type(&self) -> &str {
        &self.sink_type
    }
}
