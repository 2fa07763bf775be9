// src/memory_store.rs
//
// In-process ObjectStore backed by an ordered map. Used by the test suites and as an
// ephemeral backend; semantics mirror a real block-blob store (staged blocks are invisible
// until committed, listings are paginated and ordered).

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::constants::DEFAULT_LIST_PAGE_SIZE;
use crate::error::{Result, StorageError};
use crate::object_store::{
    BlockId, ObjectEntry, ObjectProperties, ObjectStore, ObjectStream, PutOptions, PutReceipt,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    metadata: HashMap<String, String>,
    last_modified: DateTime<Utc>,
    etag: String,
}

impl StoredObject {
    fn new(data: Bytes, options: &PutOptions) -> Self {
        let etag = format!("\"{:08x}\"", crc32fast::hash(&data));
        Self {
            data,
            content_type: options.content_type.clone(),
            metadata: options.metadata.clone(),
            last_modified: Utc::now(),
            etag,
        }
    }

    fn receipt(&self) -> PutReceipt {
        PutReceipt {
            etag: Some(self.etag.clone()),
            last_modified: self.last_modified,
        }
    }

    fn entry(&self, key: &str) -> ObjectEntry {
        ObjectEntry {
            key: key.to_string(),
            size: self.data.len() as u64,
            content_type: Some(self.content_type.clone()),
            last_modified: Some(self.last_modified),
        }
    }
}

pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    staged: Mutex<HashMap<String, HashMap<BlockId, Bytes>>>,
    page_size: usize,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_LIST_PAGE_SIZE)
    }

    /// Smaller pages make listing pagination observable in tests.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            staged: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// Snapshot of every committed key, in order.
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Number of keys with uncommitted blocks.
    pub async fn pending_uploads(&self) -> usize {
        self.staged.lock().await.len()
    }

    async fn page(&self, prefix: &str, after: Option<&str>) -> Vec<ObjectEntry> {
        let objects = self.objects.read().await;
        let lower = match after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };
        objects
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(self.page_size)
            .map(|(key, obj)| obj.entry(key))
            .collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<PutReceipt> {
        trace!("memory put {} ({} bytes)", key, data.len());
        let obj = StoredObject::new(data, options);
        let receipt = obj.receipt();
        self.objects.write().await.insert(key.to_string(), obj);
        Ok(receipt)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|obj| obj.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn get_properties(&self, key: &str) -> Result<ObjectProperties> {
        let objects = self.objects.read().await;
        let obj = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectProperties {
            size: obj.data.len() as u64,
            content_type: Some(obj.content_type.clone()),
            last_modified: Some(obj.last_modified),
            etag: Some(obj.etag.clone()),
            metadata: obj.metadata.clone(),
        })
    }

    /// Also discards uncommitted blocks staged under `key`.
    async fn delete(&self, key: &str) -> Result<()> {
        self.staged.lock().await.remove(key);
        match self.objects.write().await.remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    fn list_after<'a>(&'a self, prefix: &'a str, start_after: Option<String>) -> ObjectStream<'a> {
        Box::pin(try_stream! {
            let mut after = start_after;
            loop {
                // The read lock is held for one page only, so writers interleave with long scans.
                let page = self.page(prefix, after.as_deref()).await;
                let full = page.len() == self.page_size;
                trace!("memory list {:?} page of {} after {:?}", prefix, page.len(), after);
                for entry in page {
                    after = Some(entry.key.clone());
                    yield entry;
                }
                if !full {
                    break;
                }
            }
        })
    }

    async fn stage_block(&self, key: &str, block_id: &BlockId, data: Bytes) -> Result<()> {
        trace!("memory stage {} {} ({} bytes)", key, block_id, data.len());
        self.staged
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(block_id.clone(), data);
        Ok(())
    }

    async fn commit_blocks(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &PutOptions,
    ) -> Result<PutReceipt> {
        let mut staged = self.staged.lock().await;
        let blocks = staged.get(key);
        let mut total = 0usize;
        for id in block_ids {
            match blocks.and_then(|b| b.get(id)) {
                Some(data) => total += data.len(),
                None => {
                    return Err(StorageError::Internal(anyhow::anyhow!(
                        "block {id} of {key} was never staged"
                    )));
                }
            }
        }
        let mut body = BytesMut::with_capacity(total);
        if let Some(blocks) = blocks {
            for id in block_ids {
                if let Some(data) = blocks.get(id) {
                    body.extend_from_slice(data);
                }
            }
        }
        // Uncommitted blocks are discarded along with the staging area, as a blob store does.
        staged.remove(key);
        drop(staged);

        debug!("memory commit {} ({} blocks, {} bytes)", key, block_ids.len(), total);
        self.put(key, body.freeze(), options).await
    }

    async fn discard_blocks(&self, key: &str) -> Result<()> {
        if self.staged.lock().await.remove(key).is_some() {
            debug!("memory discarded staged blocks of {}", key);
        }
        Ok(())
    }

    fn url(&self, key: &str) -> String {
        format!("memory:///{key}")
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<PutReceipt> {
        let mut objects = self.objects.write().await;
        let mut obj = objects
            .get(src_key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(src_key.to_string()))?;
        obj.last_modified = Utc::now();
        let receipt = obj.receipt();
        objects.insert(dst_key.to_string(), obj);
        Ok(receipt)
    }
}
