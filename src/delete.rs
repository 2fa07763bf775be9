// src/delete.rs
//
// Delete a file or a whole directory subtree. Sub-deletes run with bounded parallelism, keep
// going past individual failures, and report an aggregate error at the end.

use futures::stream::{StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::ListingCache;
use crate::error::{Result, StorageError};
use crate::object_store::ObjectStore;
use crate::path;
use crate::tree::{self, marker_key};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    #[serde(rename = "path")]
    pub deleted_path: String,
    pub is_directory: bool,
    #[serde(skip)]
    pub keys_deleted: usize,
}

/// Delete `path`. Directories are removed recursively; plain files must exist.
///
/// Cached listings of `path`, everything below it and every ancestor are invalidated before
/// returning, also when the delete fails part-way.
pub async fn delete_path(
    store: &dyn ObjectStore,
    cache: &ListingCache,
    path: &str,
    concurrency: usize,
) -> Result<DeleteOutcome> {
    let path = path::normalize(path)?;
    if path.is_empty() {
        return Err(StorageError::invalid_path("/", "refusing to delete the root"));
    }

    let result = if tree::is_directory(store, &path).await? {
        delete_directory(store, &path, concurrency.max(1)).await
    } else {
        store.delete(&path).await.map(|()| DeleteOutcome {
            deleted_path: path.clone(),
            is_directory: false,
            keys_deleted: 1,
        })
    };
    cache.invalidate_subtree(&path).await;
    if let Ok(outcome) = &result {
        info!(
            "deleted {} ({}, {} key(s))",
            path,
            if outcome.is_directory { "directory" } else { "file" },
            outcome.keys_deleted
        );
    }
    result
}

async fn delete_directory(
    store: &dyn ObjectStore,
    path: &str,
    concurrency: usize,
) -> Result<DeleteOutcome> {
    let prefix = path::dir_prefix(path);
    let mut deleted = 0usize;
    let mut failed: Vec<String> = Vec::new();

    let marker = marker_key(path);
    match store.delete(&marker).await {
        Ok(()) => deleted += 1,
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            warn!("could not delete marker {}: {}", marker, e);
            failed.push(marker);
        }
    }

    // Keys are disjoint, so order does not matter. NotFound means someone else got there first.
    // Only failed keys are kept; the listing itself is consumed as it streams.
    (deleted, failed) = store
        .list_by_prefix(&prefix)
        .map_ok(|entry| async move {
            let res = match store.delete(&entry.key).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            };
            Ok::<_, StorageError>((entry.key, res))
        })
        .try_buffer_unordered(concurrency)
        .try_fold((deleted, failed), |(deleted, mut failed), (key, res)| async move {
            match res {
                Ok(()) => Ok((deleted + 1, failed)),
                Err(e) => {
                    warn!("could not delete {}: {}", key, e);
                    failed.push(key);
                    Ok((deleted, failed))
                }
            }
        })
        .await?;

    // A file may share the directory's name in a flat key space.
    match store.delete(path).await {
        Ok(()) => deleted += 1,
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            warn!("could not delete {}: {}", path, e);
            failed.push(path.to_string());
        }
    }

    let residue: Vec<String> = store
        .list_by_prefix(&prefix)
        .map_ok(|entry| entry.key)
        .take(10)
        .try_collect()
        .await
        .unwrap_or_default();
    if !residue.is_empty() {
        warn!(
            "keys remain under {} after delete (first {}): {:?}",
            prefix,
            residue.len(),
            residue
        );
    }

    if !failed.is_empty() {
        failed.sort();
        return Err(StorageError::PartialFailure {
            operation: "delete",
            path: path.to_string(),
            failed,
        });
    }
    debug!("directory {} removed, {} key(s)", path, deleted);
    Ok(DeleteOutcome {
        deleted_path: path.to_string(),
        is_directory: true,
        keys_deleted: deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryObjectStore;
    use crate::object_store::PutOptions;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    async fn seeded(keys: &[&str]) -> InMemoryObjectStore {
        let store = InMemoryObjectStore::with_page_size(4);
        for key in keys {
            store
                .put(key, Bytes::from_static(b"x"), &PutOptions::default())
                .await
                .unwrap();
        }
        store
    }

    fn cache() -> ListingCache {
        ListingCache::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn deletes_directory_recursively() {
        let store = seeded(&[
            "a/.folder_marker",
            "a/b/x.txt",
            "a/b/c/y.txt",
            "a/z.txt",
            "a",
            "ab.txt",
        ])
        .await;
        let outcome = delete_path(&store, &cache(), "/a/", 4).await.unwrap();
        assert_eq!(outcome.deleted_path, "a");
        assert!(outcome.is_directory);
        assert_eq!(outcome.keys_deleted, 5);
        assert_eq!(store.keys().await, ["ab.txt"]);
        assert!(!tree::is_directory(&store, "a").await.unwrap());
    }

    #[tokio::test]
    async fn deletes_single_file_or_reports_not_found() {
        let store = seeded(&["docs/readme.md"]).await;
        let outcome = delete_path(&store, &cache(), "docs/readme.md", 4).await.unwrap();
        assert!(!outcome.is_directory);
        assert_eq!(store.object_count().await, 0);

        let err = delete_path(&store, &cache(), "docs/readme.md", 4).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn root_is_refused() {
        let store = seeded(&["a"]).await;
        for root in ["", "/", "//"] {
            let err = delete_path(&store, &cache(), root, 4).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidPath { .. }));
        }
        assert_eq!(store.object_count().await, 1);
    }

    #[tokio::test]
    async fn invalidates_subtree_and_ancestors() {
        let store = seeded(&["a/b/x", "a/b/c/y", "z/w"]).await;
        let cache = cache();
        for p in ["", "a", "a/b", "a/b/c", "z"] {
            cache.insert(p, Arc::new(Vec::new())).await;
        }
        delete_path(&store, &cache, "a/b", 4).await.unwrap();
        for gone in ["", "a", "a/b", "a/b/c"] {
            assert!(cache.get(gone).await.is_none(), "{gone:?}");
        }
        assert!(cache.get("z").await.is_some());
    }

    #[tokio::test]
    async fn large_directory_is_removed_in_one_pass() {
        let keys: Vec<String> = (0..250).map(|i| format!("bulk/{:02}/{i:04}", i % 7)).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let store = seeded(&refs).await;
        let outcome = delete_path(&store, &cache(), "bulk", 8).await.unwrap();
        assert_eq!(outcome.keys_deleted, 250);
        assert_eq!(store.object_count().await, 0);
    }

    #[test]
    fn outcome_serializes_like_the_controller_expects() {
        let outcome = DeleteOutcome {
            deleted_path: "a/b".into(),
            is_directory: true,
            keys_deleted: 3,
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({"path": "a/b", "isDirectory": true})
        );
    }
}
