// tests/common/mod.rs
//
// Shared test doubles: a call-counting store wrapper, a fault-injecting one and one that holds a
// listing back. All wrap any ObjectStore, usually the in-memory backend.

#![allow(dead_code)]

use async_stream::try_stream;
use async_trait::async_trait;
use blobtree::memory_store::InMemoryObjectStore;
use blobtree::{
    BlockId, ObjectEntry, ObjectProperties, ObjectStore, ObjectStream, PutOptions, PutReceipt, Result,
    StorageError,
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Counts every call that reaches the wrapped store, per operation.
pub struct CountingStore<S> {
    inner: S,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl<S: ObjectStore> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn record(&self, op: &'static str) {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for CountingStore<S> {
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<PutReceipt> {
        self.record("put");
        self.inner.put(key, data, options).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.record("get");
        self.inner.get(key).await
    }

    async fn get_properties(&self, key: &str) -> Result<ObjectProperties> {
        self.record("get_properties");
        self.inner.get_properties(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.record("delete");
        self.inner.delete(key).await
    }

    fn list_after<'a>(&'a self, prefix: &'a str, start_after: Option<String>) -> ObjectStream<'a> {
        self.record("list");
        self.inner.list_after(prefix, start_after)
    }

    async fn stage_block(&self, key: &str, block_id: &BlockId, data: Bytes) -> Result<()> {
        self.record("stage_block");
        self.inner.stage_block(key, block_id, data).await
    }

    async fn commit_blocks(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &PutOptions,
    ) -> Result<PutReceipt> {
        self.record("commit_blocks");
        self.inner.commit_blocks(key, block_ids, options).await
    }

    async fn discard_blocks(&self, key: &str) -> Result<()> {
        self.record("discard_blocks");
        self.inner.discard_blocks(key).await
    }

    fn url(&self, key: &str) -> String {
        self.inner.url(key)
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<PutReceipt> {
        self.record("copy");
        self.inner.copy(src_key, dst_key).await
    }
}

#[derive(Debug, Clone)]
enum Fault {
    /// Fail every matching call.
    Permanent,
    /// Fail the next `n` matching calls with a retryable error, then pass through.
    Transient(usize),
}

#[derive(Debug, Clone)]
struct Rule {
    op: &'static str,
    key_contains: String,
    fault: Fault,
}

/// Injects failures into chosen operations of the wrapped store.
pub struct FaultyStore<S> {
    inner: S,
    rules: Mutex<Vec<Rule>>,
    injected: AtomicUsize,
}

impl<S: ObjectStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            rules: Mutex::new(Vec::new()),
            injected: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Every `op` on a key containing `key_contains` fails with an internal error.
    pub fn fail(&self, op: &'static str, key_contains: &str) {
        self.rules.lock().unwrap().push(Rule {
            op,
            key_contains: key_contains.to_string(),
            fault: Fault::Permanent,
        });
    }

    /// The next `times` calls of `op` (any key) fail with a transient error.
    pub fn flake(&self, op: &'static str, times: usize) {
        self.rules.lock().unwrap().push(Rule {
            op,
            key_contains: String::new(),
            fault: Fault::Transient(times),
        });
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn check(&self, op: &str, key: &str) -> Result<()> {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if rule.op != op || !key.contains(&rule.key_contains) {
                continue;
            }
            match &mut rule.fault {
                Fault::Permanent => {
                    self.injected.fetch_add(1, Ordering::SeqCst);
                    return Err(StorageError::Internal(anyhow::anyhow!(
                        "injected {op} failure for {key}"
                    )));
                }
                Fault::Transient(0) => {}
                Fault::Transient(left) => {
                    *left -= 1;
                    self.injected.fetch_add(1, Ordering::SeqCst);
                    return Err(StorageError::Transient(anyhow::anyhow!(
                        "injected transient {op} failure for {key}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for FaultyStore<S> {
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<PutReceipt> {
        self.check("put", key)?;
        self.inner.put(key, data, options).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.check("get", key)?;
        self.inner.get(key).await
    }

    async fn get_properties(&self, key: &str) -> Result<ObjectProperties> {
        self.check("get_properties", key)?;
        self.inner.get_properties(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check("delete", key)?;
        self.inner.delete(key).await
    }

    fn list_after<'a>(&'a self, prefix: &'a str, start_after: Option<String>) -> ObjectStream<'a> {
        match self.check("list", prefix) {
            Ok(()) => self.inner.list_after(prefix, start_after),
            Err(e) => futures::stream::once(async move { Err::<ObjectEntry, _>(e) }).boxed(),
        }
    }

    async fn stage_block(&self, key: &str, block_id: &BlockId, data: Bytes) -> Result<()> {
        self.check("stage_block", key)?;
        self.inner.stage_block(key, block_id, data).await
    }

    async fn commit_blocks(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &PutOptions,
    ) -> Result<PutReceipt> {
        self.check("commit_blocks", key)?;
        self.inner.commit_blocks(key, block_ids, options).await
    }

    async fn discard_blocks(&self, key: &str) -> Result<()> {
        self.check("discard_blocks", key)?;
        self.inner.discard_blocks(key).await
    }

    fn url(&self, key: &str) -> String {
        self.inner.url(key)
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<PutReceipt> {
        self.check("copy", src_key)?;
        self.inner.copy(src_key, dst_key).await
    }
}

/// Reads the next listing in full, then holds it back until `release` is called. Lets a test
/// land a write between the store read and the point where the listing is consumed.
pub struct GatedStore<S> {
    inner: S,
    armed: AtomicBool,
    held: Notify,
    released: Notify,
}

impl<S: ObjectStore> GatedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            held: Notify::new(),
            released: Notify::new(),
        }
    }

    /// Gate the next `list_after` call.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Resolves once the gated listing has been read and is waiting.
    pub async fn wait_until_held(&self) {
        self.held.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for GatedStore<S> {
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<PutReceipt> {
        self.inner.put(key, data, options).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.inner.get(key).await
    }

    async fn get_properties(&self, key: &str) -> Result<ObjectProperties> {
        self.inner.get_properties(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    fn list_after<'a>(&'a self, prefix: &'a str, start_after: Option<String>) -> ObjectStream<'a> {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return self.inner.list_after(prefix, start_after);
        }
        Box::pin(try_stream! {
            let snapshot: Vec<ObjectEntry> =
                self.inner.list_after(prefix, start_after).try_collect().await?;
            self.held.notify_one();
            self.released.notified().await;
            for entry in snapshot {
                yield entry;
            }
        })
    }

    async fn stage_block(&self, key: &str, block_id: &BlockId, data: Bytes) -> Result<()> {
        self.inner.stage_block(key, block_id, data).await
    }

    async fn commit_blocks(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &PutOptions,
    ) -> Result<PutReceipt> {
        self.inner.commit_blocks(key, block_ids, options).await
    }

    async fn discard_blocks(&self, key: &str) -> Result<()> {
        self.inner.discard_blocks(key).await
    }

    fn url(&self, key: &str) -> String {
        self.inner.url(key)
    }
}

/// Deterministic, non-repeating-looking test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 7) % 251) as u8).collect()
}

/// Fill a fresh in-memory store with `keys`, each holding its own key as content.
pub async fn seeded_store(keys: &[&str]) -> Arc<InMemoryObjectStore> {
    let store = Arc::new(InMemoryObjectStore::new());
    for key in keys {
        store
            .put(key, Bytes::from(key.to_string()), &PutOptions::default())
            .await
            .unwrap();
    }
    store
}
