// src/object_store.rs
//
// Pluggable object-store abstraction over a flat, prefix-addressed key space.
// Backends: in-memory (memory_store.rs), local filesystem (file_store.rs),
// Azure Blob Storage (azure_client.rs, feature "azure-backend").
//
// Everything above this layer (tree builder, upload pipeline, delete, transfer) talks to
// `dyn ObjectStore` only. Retry lives in retry.rs as a wrapper, never at call sites.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::{BackendConfig, StorageConfig};
use crate::error::{Result, StorageError};
use crate::retry::RetryingStore;

/// Lazy, lexicographically ordered listing of objects.
pub type ObjectStream<'a> = Pin<Box<dyn Stream<Item = Result<ObjectEntry>> + Send + 'a>>;

/// One row of a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// HEAD-like view of a single object.
#[derive(Debug, Clone, Default)]
pub struct ObjectProperties {
    pub size: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Headers and metadata applied by `put` and `commit_blocks`.
#[derive(Debug, Clone)]
pub struct PutOptions {
    pub content_type: String,
    pub metadata: HashMap<String, String>,
    /// Upper bound on parallel requests a backend may use internally for one put.
    pub concurrency: usize,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            content_type: crate::constants::DEFAULT_CONTENT_TYPE.to_string(),
            metadata: HashMap::new(),
            concurrency: 1,
        }
    }
}

impl PutOptions {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            ..Default::default()
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// What the store reports after a successful write.
#[derive(Debug, Clone)]
pub struct PutReceipt {
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
}

/// Identifier of a staged block. Fixed width, so lexical order equals creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(String);

impl BlockId {
    pub fn from_index(index: usize) -> Self {
        BlockId(format!("block-{index:06}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// ObjectStore trait for pluggable storage backends.
///
/// Keys are normalized paths (see `path::normalize`). Every call is a potentially remote
/// operation; transient failures are reported as `StorageError::Transient` and retried by
/// `RetryingStore`, not by the backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Atomically write `data` under `key`, replacing any previous object.
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<PutReceipt>;

    /// Get entire object into memory.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Stat a single object. `NotFound` if absent.
    async fn get_properties(&self, key: &str) -> Result<ObjectProperties>;

    /// Delete a single object. `NotFound` if absent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lazily list objects whose key starts with `prefix` and sorts after `start_after`,
    /// in lexicographic key order. Pagination stays inside the backend.
    fn list_after<'a>(&'a self, prefix: &'a str, start_after: Option<String>) -> ObjectStream<'a>;

    /// Stage one block of a multi-block object. Staged blocks are invisible until committed.
    async fn stage_block(&self, key: &str, block_id: &BlockId, data: Bytes) -> Result<()>;

    /// Compose the object from previously staged blocks, in exactly the given order.
    async fn commit_blocks(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &PutOptions,
    ) -> Result<PutReceipt>;

    /// Drop blocks staged under `key` that were never committed. A committed object at `key`
    /// is left untouched.
    async fn discard_blocks(&self, key: &str) -> Result<()>;

    /// Public URL (or URI) of an object.
    fn url(&self, key: &str) -> String;

    /// Lazily list every object under `prefix`.
    fn list_by_prefix<'a>(&'a self, prefix: &'a str) -> ObjectStream<'a> {
        self.list_after(prefix, None)
    }

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> Result<bool> {
        match self.get_properties(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy one object, keeping its content type and metadata.
    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<PutReceipt> {
        let props = self.get_properties(src_key).await?;
        let data = self.get(src_key).await?;
        let options = PutOptions {
            content_type: props
                .content_type
                .unwrap_or_else(|| crate::constants::DEFAULT_CONTENT_TYPE.to_string()),
            metadata: props.metadata,
            concurrency: 1,
        };
        self.put(dst_key, data, &options).await
    }
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<PutReceipt> {
        (**self).put(key, data, options).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        (**self).get(key).await
    }

    async fn get_properties(&self, key: &str) -> Result<ObjectProperties> {
        (**self).get_properties(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    fn list_after<'a>(&'a self, prefix: &'a str, start_after: Option<String>) -> ObjectStream<'a> {
        (**self).list_after(prefix, start_after)
    }

    async fn stage_block(&self, key: &str, block_id: &BlockId, data: Bytes) -> Result<()> {
        (**self).stage_block(key, block_id, data).await
    }

    async fn commit_blocks(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &PutOptions,
    ) -> Result<PutReceipt> {
        (**self).commit_blocks(key, block_ids, options).await
    }

    async fn discard_blocks(&self, key: &str) -> Result<()> {
        (**self).discard_blocks(key).await
    }

    fn url(&self, key: &str) -> String {
        (**self).url(key)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key).await
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<PutReceipt> {
        (**self).copy(src_key, dst_key).await
    }
}

/// Convenience factory that builds the configured backend, wrapped in the retry policy.
pub async fn store_for_config(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    let policy = config.retry.clone();
    match &config.backend {
        BackendConfig::Memory => Ok(Arc::new(RetryingStore::new(
            crate::memory_store::InMemoryObjectStore::new(),
            policy,
        ))),
        BackendConfig::File { root } => {
            let store = crate::file_store::FileSystemObjectStore::open(root).await?;
            Ok(Arc::new(RetryingStore::new(store, policy)))
        }
        #[cfg(feature = "azure-backend")]
        BackendConfig::Azure(azure) => {
            let store = crate::azure_client::AzureObjectStore::from_config(azure).await?;
            Ok(Arc::new(RetryingStore::new(store, policy)))
        }
        #[cfg(not(feature = "azure-backend"))]
        BackendConfig::Azure(_) => Err(StorageError::Internal(anyhow::anyhow!(
            "Azure backend not compiled in; rebuild with --features azure-backend"
        ))),
    }
}
