// src/retry.rs
//
// Client-level retry policy: bounded attempts with jittered exponential backoff.
// `RetryingStore` applies it to every call of the wrapped store, so no call site retries on its own.

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY, DEFAULT_RETRY_MAX_DELAY};
use crate::error::Result;
use crate::object_store::{
    BlockId, ObjectProperties, ObjectStore, ObjectStream, PutOptions, PutReceipt,
};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, first try included.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_delay: Duration,
    /// Ceiling for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after the `failures`-th consecutive failure: half the capped exponential step plus
    /// up to another half of jitter.
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        let step = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        let half = step / 2;
        let jitter_nanos = half.as_nanos() as u64;
        if jitter_nanos == 0 {
            return step;
        }
        half + Duration::from_nanos(rand::rng().random_range(0..=jitter_nanos))
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or attempts run out.
    pub async fn run<T, F, Fut>(&self, op: &str, key: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0u32;
        loop {
            match f().await {
                Err(e) if e.is_transient() && failures + 1 < self.max_attempts => {
                    failures += 1;
                    let delay = self.backoff(failures);
                    warn!(
                        "{} {} failed (attempt {}/{}): {}; retrying in {:?}",
                        op, key, failures, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if failures > 0 {
                        debug!("{} {} giving up after {} attempt(s)", op, key, failures + 1);
                    }
                    return Err(e);
                }
                ok => return ok,
            }
        }
    }
}

/// Wraps any store and retries transient failures according to a `RetryPolicy`.
///
/// Listings are resumed after the last key already delivered, so a scan interrupted halfway
/// neither repeats nor skips entries.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ObjectStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for RetryingStore<S> {
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<PutReceipt> {
        self.policy
            .run("put", key, || self.inner.put(key, data.clone(), options))
            .await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.policy.run("get", key, || self.inner.get(key)).await
    }

    async fn get_properties(&self, key: &str) -> Result<ObjectProperties> {
        self.policy
            .run("get_properties", key, || self.inner.get_properties(key))
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.policy.run("delete", key, || self.inner.delete(key)).await
    }

    fn list_after<'a>(&'a self, prefix: &'a str, start_after: Option<String>) -> ObjectStream<'a> {
        Box::pin(try_stream! {
            let mut last = start_after;
            let mut failures = 0u32;
            'scan: loop {
                let mut page = self.inner.list_after(prefix, last.clone());
                loop {
                    match page.next().await {
                        None => break 'scan,
                        Some(Ok(entry)) => {
                            failures = 0;
                            last = Some(entry.key.clone());
                            yield entry;
                        }
                        Some(Err(e)) if e.is_transient() && failures + 1 < self.policy.max_attempts => {
                            failures += 1;
                            let delay = self.policy.backoff(failures);
                            warn!(
                                "list {:?} interrupted after {:?} (attempt {}/{}): {}; resuming in {:?}",
                                prefix, last, failures, self.policy.max_attempts, e, delay
                            );
                            tokio::time::sleep(delay).await;
                            continue 'scan;
                        }
                        Some(Err(e)) => Err::<(), _>(e)?,
                    }
                }
            }
        })
    }

    async fn stage_block(&self, key: &str, block_id: &BlockId, data: Bytes) -> Result<()> {
        self.policy
            .run("stage_block", key, || {
                self.inner.stage_block(key, block_id, data.clone())
            })
            .await
    }

    async fn commit_blocks(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &PutOptions,
    ) -> Result<PutReceipt> {
        self.policy
            .run("commit_blocks", key, || {
                self.inner.commit_blocks(key, block_ids, options)
            })
            .await
    }

    async fn discard_blocks(&self, key: &str) -> Result<()> {
        self.policy
            .run("discard_blocks", key, || self.inner.discard_blocks(key))
            .await
    }

    fn url(&self, key: &str) -> String {
        self.inner.url(key)
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<PutReceipt> {
        self.policy
            .run("copy", src_key, || self.inner.copy(src_key, dst_key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(400));
        for n in 4..40 {
            assert!(policy.backoff(n) <= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out = fast_policy(5)
            .run("op", "k", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::Transient(anyhow::anyhow!("busy")))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = fast_policy(5)
            .run("op", "k", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StorageError::Transient(anyhow::anyhow!("down")))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = fast_policy(5)
            .run("op", "k", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StorageError::NotFound("k".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
