// src/upload.rs
//
// Streaming upload pipeline.
//
// Small bodies (<= single_put_threshold) are buffered and written with one atomic put.
// Larger bodies are cut into fixed-size blocks, staged in batches of at most `max_in_flight`
// concurrent calls, and committed once in creation order. Progress never reaches 100 before the
// store confirms the write. Cancellation is polled between chunks and blocks; a call already
// issued to the store is allowed to finish.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_BLOCK_SIZE, DEFAULT_MAX_IN_FLIGHT_BLOCKS, DEFAULT_READ_CHUNK_SIZE,
    DEFAULT_SINGLE_PUT_CONCURRENCY, SINGLE_PUT_THRESHOLD,
};
use crate::error::{Result, StorageError};
use crate::object_store::{BlockId, ObjectStore, PutOptions, PutReceipt};
use crate::progress::{ProgressSink, ProgressThrottle};

/// Tuning knobs of the upload pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Bodies up to this size go through a single put.
    pub single_put_threshold: u64,
    pub block_size: usize,
    /// Concurrent stage-block calls per batch.
    pub max_in_flight: usize,
    /// Concurrency hint passed to the store for a single put.
    pub single_put_concurrency: usize,
    /// Read granularity of the single-put path.
    pub read_chunk_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            single_put_threshold: SINGLE_PUT_THRESHOLD,
            block_size: DEFAULT_BLOCK_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT_BLOCKS,
            single_put_concurrency: DEFAULT_SINGLE_PUT_CONCURRENCY,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

/// Result of a committed upload.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub key: String,
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    /// Staged blocks; 0 for a single put.
    pub blocks: usize,
}

pub struct UploadPipeline {
    store: Arc<dyn ObjectStore>,
    config: UploadConfig,
}

/// Fill `buf` from `source`, stopping early only at end of stream.
async fn read_full<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + Send,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn size_mismatch(detail: String) -> StorageError {
    StorageError::Internal(anyhow::anyhow!(detail))
}

impl UploadPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploadConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Upload exactly `total_size` bytes from `source` to `key`.
    ///
    /// Fails with `Cancelled` when `cancel` fires before the commit, and with `UploadFailed`
    /// carrying the root cause otherwise. Blocks staged before the failure are discarded on a
    /// best-effort basis; an object already committed under `key` survives either way.
    pub async fn upload<R>(
        &self,
        key: &str,
        mut source: R,
        total_size: u64,
        options: PutOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt>
    where
        R: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        let throttle = ProgressThrottle::new(progress, total_size);
        let mut staged_any = false;

        let chunked = total_size > self.config.single_put_threshold;
        debug!(
            "upload {} ({} bytes, {})",
            key,
            total_size,
            if chunked { "chunked" } else { "single put" }
        );
        let outcome = if chunked {
            self.upload_blocks(key, &mut source, total_size, &options, &throttle, cancel, &mut staged_any)
                .await
        } else {
            self.upload_single(key, &mut source, total_size, options, &throttle, cancel)
                .await
                .map(|receipt| (receipt, 0))
        };

        match outcome {
            Ok((receipt, blocks)) => {
                throttle.complete();
                info!(
                    "uploaded {} ({} bytes, {} blocks) in {:?}",
                    key,
                    total_size,
                    blocks,
                    started.elapsed()
                );
                Ok(UploadReceipt {
                    key: key.to_string(),
                    url: self.store.url(key),
                    etag: receipt.etag,
                    last_modified: receipt.last_modified,
                    size: total_size,
                    blocks,
                })
            }
            Err(e) => {
                if staged_any {
                    self.discard_staged(key).await;
                }
                if e.is_cancelled() {
                    info!("upload {} cancelled after {} bytes", key, throttle.loaded());
                    Err(StorageError::Cancelled)
                } else {
                    warn!("upload {} failed: {}", key, e);
                    Err(StorageError::upload_failed(key, e))
                }
            }
        }
    }

    /// Best-effort removal of blocks staged by a failed chunked upload. Never escalates.
    async fn discard_staged(&self, key: &str) {
        match self.store.discard_blocks(key).await {
            Ok(()) => debug!("discarded staged blocks of {}", key),
            Err(e) => warn!("discarding staged blocks of {} failed: {}", key, e),
        }
    }

    /// A failed put leaves any previous object at `key` in place; there is nothing to clean up.
    async fn upload_single<R>(
        &self,
        key: &str,
        source: &mut R,
        total_size: u64,
        options: PutOptions,
        throttle: &ProgressThrottle<'_>,
        cancel: &CancellationToken,
    ) -> Result<PutReceipt>
    where
        R: AsyncRead + Unpin + Send,
    {
        let total = total_size as usize;
        let mut body = BytesMut::with_capacity(total);
        let mut chunk = vec![0u8; self.config.read_chunk_size.max(1)];

        while body.len() < total {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let want = chunk.len().min(total - body.len());
            let n = read_full(source, &mut chunk[..want]).await?;
            if n == 0 {
                return Err(size_mismatch(format!(
                    "source ended after {} of {} bytes",
                    body.len(),
                    total_size
                )));
            }
            body.extend_from_slice(&chunk[..n]);
            throttle.advance(n as u64);
        }
        Self::expect_end(source, total_size).await?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let options = options.concurrency(self.config.single_put_concurrency);
        self.store.put(key, body.freeze(), &options).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_blocks<R>(
        &self,
        key: &str,
        source: &mut R,
        total_size: u64,
        options: &PutOptions,
        throttle: &ProgressThrottle<'_>,
        cancel: &CancellationToken,
        staged_any: &mut bool,
    ) -> Result<(PutReceipt, usize)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let block_size = self.config.block_size.max(1) as u64;
        let max_in_flight = self.config.max_in_flight.max(1);
        let block_count = total_size.div_ceil(block_size) as usize;
        let mut ids: Vec<BlockId> = Vec::with_capacity(block_count);
        let mut remaining = total_size;

        while remaining > 0 {
            // Read one batch; at most max_in_flight blocks are resident at a time.
            let mut batch: Vec<(BlockId, Bytes)> = Vec::with_capacity(max_in_flight);
            while batch.len() < max_in_flight && remaining > 0 {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let len = remaining.min(block_size) as usize;
                let mut block = vec![0u8; len];
                let n = read_full(source, &mut block).await?;
                if n < len {
                    return Err(size_mismatch(format!(
                        "source ended after {} of {} bytes",
                        total_size - remaining + n as u64,
                        total_size
                    )));
                }
                remaining -= len as u64;
                let id = BlockId::from_index(ids.len());
                ids.push(id.clone());
                batch.push((id, Bytes::from(block)));
            }

            *staged_any = true;
            let staged = join_all(batch.into_iter().map(|(id, data)| async move {
                let len = data.len() as u64;
                self.store.stage_block(key, &id, data).await?;
                throttle.advance(len);
                Ok::<_, StorageError>(())
            }))
            .await;
            // The whole batch has settled; surface the first failure.
            staged.into_iter().collect::<Result<Vec<()>>>()?;
            debug!("upload {}: {} of {} blocks staged", key, ids.len(), block_count);
        }

        Self::expect_end(source, total_size).await?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let receipt = self.store.commit_blocks(key, &ids, options).await?;
        Ok((receipt, ids.len()))
    }

    /// The source must not yield more than the declared size.
    async fn expect_end<R>(source: &mut R, total_size: u64) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut extra = [0u8; 1];
        if read_full(source, &mut extra).await? > 0 {
            return Err(size_mismatch(format!(
                "source is longer than the declared {total_size} bytes"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryObjectStore;
    use crate::progress::{NoProgress, UploadProgress};
    use std::sync::Mutex;

    fn small_config() -> UploadConfig {
        UploadConfig {
            single_put_threshold: 64,
            block_size: 16,
            max_in_flight: 3,
            single_put_concurrency: 4,
            read_chunk_size: 8,
        }
    }

    fn pipeline() -> (Arc<InMemoryObjectStore>, UploadPipeline) {
        let store = Arc::new(InMemoryObjectStore::new());
        let pipeline = UploadPipeline::new(store.clone(), small_config());
        (store, pipeline)
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn small_body_uses_single_put() {
        let (store, pipeline) = pipeline();
        let data = body(40);
        let seen = Mutex::new(Vec::new());
        let sink = |p: UploadProgress| seen.lock().unwrap().push(p.percentage);
        let receipt = pipeline
            .upload(
                "a/small.bin",
                &data[..],
                40,
                PutOptions::with_content_type("application/x-test"),
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.blocks, 0);
        assert_eq!(receipt.size, 40);
        assert_eq!(receipt.url, "memory:///a/small.bin");
        assert_eq!(store.get("a/small.bin").await.unwrap(), Bytes::from(data));

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn large_body_is_staged_and_committed_in_order() {
        let (store, pipeline) = pipeline();
        // 7 blocks of 16 bytes (last one 4 bytes) -> batches of 3, 3, 1.
        let data = body(100);
        let receipt = pipeline
            .upload(
                "big.bin",
                &data[..],
                100,
                PutOptions::default(),
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.blocks, 7);
        assert_eq!(store.get("big.bin").await.unwrap(), Bytes::from(data));
        assert_eq!(store.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn size_mismatch_fails_without_leaving_objects() {
        let (store, pipeline) = pipeline();
        let data = body(30);
        for declared in [40u64, 20, 200, 10] {
            let err = pipeline
                .upload(
                    "k",
                    &data[..],
                    declared,
                    PutOptions::default(),
                    &NoProgress,
                    &CancellationToken::new(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::UploadFailed { .. }), "{declared}: {err}");
        }
        assert_eq!(store.object_count().await, 0);
        assert_eq!(store.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn cancelled_token_yields_cancelled() {
        let (store, pipeline) = pipeline();
        let cancel = CancellationToken::new();
        cancel.cancel();
        for size in [40usize, 100] {
            let data = body(size);
            let err = pipeline
                .upload("c", &data[..], size as u64, PutOptions::default(), &NoProgress, &cancel)
                .await
                .unwrap_err();
            assert!(err.is_cancelled());
        }
        assert_eq!(store.object_count().await, 0);
    }

    #[tokio::test]
    async fn empty_upload_completes_at_100() {
        let (store, pipeline) = pipeline();
        let seen = Mutex::new(Vec::new());
        let sink = |p: UploadProgress| seen.lock().unwrap().push(p.percentage);
        pipeline
            .upload("empty", &b""[..], 0, PutOptions::default(), &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.get("empty").await.unwrap().len(), 0);
        assert_eq!(seen.into_inner().unwrap(), [100]);
    }
}
