// src/transfer.rs
//
// Copy and rename of files and directory subtrees. The key space has no rename primitive, so
// both copy each key as the source listing streams in; a rename then deletes the originals.
//
// There is no multi-key atomicity: a crash mid-way can leave duplicates or a half-copied tree.
// Rename never deletes anything once a copy has failed.

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::ListingCache;
use crate::error::{Result, StorageError};
use crate::object_store::ObjectStore;
use crate::path;
use crate::tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Copy,
    Rename,
}

impl TransferMode {
    fn operation(self) -> &'static str {
        match self {
            TransferMode::Copy => "copy",
            TransferMode::Rename => "rename",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    pub source: String,
    pub destination: String,
    /// Keys copied (and, for a rename, removed from the source).
    pub keys: usize,
}

/// Map `key` from under `source` to the same place under `destination`.
fn remap(key: &str, source: &str, destination: &str) -> String {
    format!("{destination}{}", &key[source.len()..])
}

/// Check the request before touching the store. Returns the normalized pair.
fn validate(source: &str, destination: &str) -> Result<(String, String)> {
    let source = path::normalize(source)?;
    let destination = path::normalize(destination)?;
    if source.is_empty() {
        return Err(StorageError::invalid_path("/", "the root cannot be moved or copied"));
    }
    if destination.is_empty() {
        return Err(StorageError::invalid_path("/", "the root cannot be a destination"));
    }
    if path::is_within(&destination, &source) {
        return Err(StorageError::invalid_path(
            destination,
            format!("destination is inside the source {source:?}"),
        ));
    }
    Ok((source, destination))
}

/// Copy or rename `source` (a file, a directory, or both when they share a name) to
/// `destination`, which must not exist yet.
pub async fn transfer(
    store: &dyn ObjectStore,
    cache: &ListingCache,
    source: &str,
    destination: &str,
    mode: TransferMode,
    concurrency: usize,
) -> Result<TransferReport> {
    let (source, destination) = validate(source, destination)?;
    if store.exists(&destination).await? || tree::is_directory(store, &destination).await? {
        return Err(StorageError::invalid_path(
            destination,
            "destination already exists",
        ));
    }

    let result = run_transfer(store, &source, &destination, mode, concurrency).await;

    // The destination may create directories at any level above it.
    cache.invalidate_subtree(&destination).await;
    if mode == TransferMode::Rename {
        cache.invalidate_subtree(&source).await;
    }
    let keys = result?;

    info!(
        "{} {} -> {} ({} key(s))",
        mode.operation(),
        source,
        destination,
        keys
    );
    Ok(TransferReport {
        source,
        destination,
        keys,
    })
}

/// Outcome of the copy phase.
#[derive(Debug, Default)]
struct CopyPass {
    copied: usize,
    failed: Vec<String>,
    /// Copied originals, kept only for a rename, which removes them once every copy succeeded.
    originals: Vec<String>,
}

/// Copy every key of `source` while its listing streams in, then (rename only) remove the
/// originals. Returns the number of keys transferred.
async fn run_transfer(
    store: &dyn ObjectStore,
    source: &str,
    destination: &str,
    mode: TransferMode,
    concurrency: usize,
) -> Result<usize> {
    let concurrency = concurrency.max(1);
    let dir_prefix = path::dir_prefix(source);
    // A file with the source's exact name travels along with the directory.
    let exact = store
        .exists(source)
        .await?
        .then(|| Ok::<_, StorageError>(source.to_string()));
    let keys = stream::iter(exact).chain(store.list_by_prefix(&dir_prefix).map_ok(|entry| entry.key));

    let pass = keys
        .map_ok(|key| async move {
            let target = remap(&key, source, destination);
            let res = store.copy(&key, &target).await;
            Ok::<_, StorageError>((key, res))
        })
        .try_buffer_unordered(concurrency)
        .try_fold(CopyPass::default(), |mut pass, (key, res)| async move {
            match res {
                Ok(_) => {
                    pass.copied += 1;
                    if mode == TransferMode::Rename {
                        pass.originals.push(key);
                    }
                }
                Err(e) => {
                    warn!("{} of {} failed: {}", mode.operation(), key, e);
                    pass.failed.push(key);
                }
            }
            Ok(pass)
        })
        .await?;

    if pass.copied == 0 && pass.failed.is_empty() {
        return Err(StorageError::NotFound(source.to_string()));
    }
    debug!(
        "{} {} -> {}: {} key(s) copied, {} failed",
        mode.operation(),
        source,
        destination,
        pass.copied,
        pass.failed.len()
    );
    if !pass.failed.is_empty() {
        let mut failed = pass.failed;
        failed.sort();
        if mode == TransferMode::Rename {
            warn!(
                "rename {} -> {}: {} copy failure(s), originals left in place",
                source,
                destination,
                failed.len()
            );
        }
        return Err(StorageError::PartialFailure {
            operation: mode.operation(),
            path: source.to_string(),
            failed,
        });
    }
    if mode == TransferMode::Copy {
        return Ok(pass.copied);
    }

    let mut failed: Vec<String> = stream::iter(pass.originals)
        .map(|key| async move {
            match store.delete(&key).await {
                Ok(()) => None,
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    warn!("rename could not remove original {}: {}", key, e);
                    Some(key)
                }
            }
        })
        .buffer_unordered(concurrency)
        .filter_map(|failed| async move { failed })
        .collect()
        .await;
    if !failed.is_empty() {
        failed.sort();
        return Err(StorageError::PartialFailure {
            operation: "rename",
            path: source.to_string(),
            failed,
        });
    }
    Ok(pass.copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryObjectStore;
    use crate::object_store::PutOptions;
    use bytes::Bytes;
    use std::time::Duration;

    async fn seeded(keys: &[&str]) -> InMemoryObjectStore {
        let store = InMemoryObjectStore::new();
        for key in keys {
            store
                .put(key, Bytes::from(key.to_string()), &PutOptions::default())
                .await
                .unwrap();
        }
        store
    }

    fn cache() -> ListingCache {
        ListingCache::new(Duration::from_secs(60))
    }

    #[test]
    fn remap_and_validation() {
        assert_eq!(remap("a/b/c", "a/b", "x"), "x/c");
        assert_eq!(remap("a/b", "a/b", "x/y"), "x/y");
        assert!(validate("", "x").is_err());
        assert!(validate("a", "/").is_err());
        assert!(validate("a", "a").is_err());
        assert!(validate("a", "a/b").is_err());
        assert_eq!(
            validate("/a/", "ab/").unwrap(),
            ("a".to_string(), "ab".to_string())
        );
    }

    #[tokio::test]
    async fn rename_moves_a_subtree() {
        let store = seeded(&["a/.folder_marker", "a/x.txt", "a/b/y.txt", "keep.txt"]).await;
        let report = transfer(&store, &cache(), "a", "z/a2", TransferMode::Rename, 4)
            .await
            .unwrap();
        assert_eq!(report.keys, 3);
        assert_eq!(
            store.keys().await,
            ["keep.txt", "z/a2/.folder_marker", "z/a2/b/y.txt", "z/a2/x.txt"]
        );
        assert_eq!(
            store.get("z/a2/b/y.txt").await.unwrap(),
            Bytes::from_static(b"a/b/y.txt")
        );
    }

    #[tokio::test]
    async fn copy_streams_across_listing_pages() {
        let store = InMemoryObjectStore::with_page_size(3);
        let mut keys: Vec<String> = (0..40).map(|i| format!("logs/{i:02}.log")).collect();
        keys.push("logs".to_string());
        for key in &keys {
            store
                .put(key, Bytes::from(key.clone()), &PutOptions::default())
                .await
                .unwrap();
        }
        let report = transfer(&store, &cache(), "logs", "old/logs", TransferMode::Copy, 4)
            .await
            .unwrap();
        assert_eq!(report.keys, 41);
        assert_eq!(store.object_count().await, 82);
        assert_eq!(
            store.get("old/logs").await.unwrap(),
            Bytes::from_static(b"logs")
        );
        assert_eq!(
            store.get("old/logs/39.log").await.unwrap(),
            Bytes::from_static(b"logs/39.log")
        );
    }

    #[tokio::test]
    async fn copy_keeps_the_source() {
        let store = seeded(&["docs/a.txt"]).await;
        transfer(&store, &cache(), "docs/a.txt", "docs/b.txt", TransferMode::Copy, 4)
            .await
            .unwrap();
        assert_eq!(store.keys().await, ["docs/a.txt", "docs/b.txt"]);
    }

    #[tokio::test]
    async fn existing_destination_and_missing_source_are_rejected() {
        let store = seeded(&["a/x", "b/y", "c"]).await;
        for dst in ["b", "c"] {
            let err = transfer(&store, &cache(), "a", dst, TransferMode::Rename, 4)
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidPath { .. }), "{dst}");
        }
        let err = transfer(&store, &cache(), "nope", "d", TransferMode::Copy, 4)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.object_count().await, 3);
    }
}
