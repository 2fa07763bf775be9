// src/tree.rs
//
// Virtual directory tree over a flat key space. Directories are derived: a key `a/b/c` implies
// directories `a` and `a/b`; a zero-byte `<dir>/.folder_marker` keeps an empty directory visible.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::constants::{FOLDER_MARKER, LEGACY_FOLDER_MARKER};
use crate::error::Result;
use crate::object_store::{ObjectEntry, ObjectStore};
use crate::path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl DirectoryEntry {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: path::file_name(&path).to_string(),
            path,
            is_directory: true,
            size: None,
            last_modified: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
}

impl FileEntry {
    pub fn from_object(object: &ObjectEntry) -> Self {
        Self {
            name: path::file_name(&object.key).to_string(),
            path: object.key.clone(),
            is_directory: false,
            size: object.size,
            last_modified: object.last_modified,
            content_type: object.content_type.clone(),
        }
    }
}

/// One child of a directory listing.
///
/// `File` is tried first when deserializing: a directory has no size, so it never matches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Entry {
    File(FileEntry),
    Directory(DirectoryEntry),
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::Directory(d) => &d.name,
            Entry::File(f) => &f.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Entry::Directory(d) => &d.path,
            Entry::File(f) => &f.path,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Entry::Directory(_))
    }
}

/// True for `.../.folder_marker` and legacy `.../.folder` keys (or a bare marker at the root).
pub fn is_folder_marker(key: &str) -> bool {
    let name = path::file_name(key);
    name == FOLDER_MARKER || name == LEGACY_FOLDER_MARKER
}

/// Key of the marker for directory `path`.
pub fn marker_key(path: &str) -> String {
    path::join(path, FOLDER_MARKER)
}

/// Direct children of `path` (root for ""): directories first, then files, each sorted by name.
///
/// A single prefixed scan; the result never contains an entry more than one level below `path`.
pub async fn list_children(store: &dyn ObjectStore, path: &str) -> Result<Vec<Entry>> {
    let path = path::normalize(path)?;
    let prefix = path::dir_prefix(&path);

    let mut dirs: BTreeMap<String, DirectoryEntry> = BTreeMap::new();
    let mut files: Vec<FileEntry> = Vec::new();
    let mut scanned = 0usize;

    let mut listing = store.list_by_prefix(&prefix);
    while let Some(object) = listing.next().await {
        let object = object?;
        scanned += 1;
        if object.key == path {
            continue;
        }
        let Some(relative) = object.key.strip_prefix(prefix.as_str()) else {
            continue;
        };
        let mut segments = relative.split('/');
        let first = segments.next().unwrap_or_default();
        let nested = segments.next().is_some();

        if is_folder_marker(&object.key) && !nested {
            // Marker of `path` itself.
            continue;
        }
        if first.is_empty() || first.starts_with('.') {
            continue;
        }
        if nested {
            // Deeper keys and deeper markers both imply the first-segment directory.
            dirs.entry(first.to_string())
                .or_insert_with(|| DirectoryEntry::new(path::join(&path, first)));
        } else {
            files.push(FileEntry::from_object(&object));
        }
    }
    drop(listing);

    files.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(
        "listed {:?}: {} keys scanned, {} dirs, {} files",
        path,
        scanned,
        dirs.len(),
        files.len()
    );

    Ok(dirs
        .into_values()
        .map(Entry::Directory)
        .chain(files.into_iter().map(Entry::File))
        .collect())
}

/// True when `path` is the root, has a folder marker, or has at least one key below it.
pub async fn is_directory(store: &dyn ObjectStore, path: &str) -> Result<bool> {
    let path = path::normalize(path)?;
    if path.is_empty() {
        return Ok(true);
    }
    if store.exists(&marker_key(&path)).await? {
        return Ok(true);
    }
    let prefix = path::dir_prefix(&path);
    let mut listing = store.list_by_prefix(&prefix);
    match listing.next().await {
        Some(entry) => entry.map(|_| true),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryObjectStore;
    use crate::object_store::PutOptions;
    use bytes::Bytes;

    async fn store_with(keys: &[&str]) -> InMemoryObjectStore {
        let store = InMemoryObjectStore::with_page_size(3);
        for key in keys {
            store
                .put(key, Bytes::from_static(b"data"), &PutOptions::default())
                .await
                .unwrap();
        }
        store
    }

    fn names(entries: &[Entry]) -> Vec<(&str, bool)> {
        entries.iter().map(|e| (e.name(), e.is_directory())).collect()
    }

    #[tokio::test]
    async fn lists_direct_children_only() {
        let store = store_with(&[
            "a/x.txt",
            "a/b/deep.txt",
            "a/b/c/deeper.txt",
            "a/c/.folder_marker",
            "a/.folder_marker",
            "a/.hidden",
            "a/Z.txt",
            "top.txt",
        ])
        .await;

        let entries = list_children(&store, "/a/").await.unwrap();
        assert_eq!(
            names(&entries),
            [("b", true), ("c", true), ("Z.txt", false), ("x.txt", false)]
        );
        for entry in &entries {
            let relative = entry.path().strip_prefix("a/").unwrap();
            assert!(!relative.contains('/'), "{relative}");
        }

        let root = list_children(&store, "").await.unwrap();
        assert_eq!(names(&root), [("a", true), ("top.txt", false)]);
    }

    #[tokio::test]
    async fn deeper_markers_imply_directories_and_dedupe() {
        let store = store_with(&["p/q/r/.folder", "p/q/.folder_marker", "p/q/file"]).await;
        let entries = list_children(&store, "p").await.unwrap();
        assert_eq!(names(&entries), [("q", true)]);
        assert_eq!(entries[0].path(), "p/q");
    }

    #[tokio::test]
    async fn file_entries_carry_size_and_type() {
        let store = InMemoryObjectStore::new();
        store
            .put(
                "docs/readme.md",
                Bytes::from_static(b"# hi"),
                &PutOptions::with_content_type("text/markdown"),
            )
            .await
            .unwrap();
        let entries = list_children(&store, "docs").await.unwrap();
        match &entries[..] {
            [Entry::File(f)] => {
                assert_eq!(f.size, 4);
                assert_eq!(f.content_type.as_deref(), Some("text/markdown"));
                assert!(!f.is_directory);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_and_missing_directories_list_empty() {
        let store = store_with(&["empty/.folder_marker"]).await;
        assert!(list_children(&store, "empty").await.unwrap().is_empty());
        assert!(list_children(&store, "nowhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn directory_detection() {
        let store = store_with(&["a/b/x.txt", "m/.folder_marker", "file.txt", "ab"]).await;
        assert!(is_directory(&store, "").await.unwrap());
        assert!(is_directory(&store, "a").await.unwrap());
        assert!(is_directory(&store, "a/b").await.unwrap());
        assert!(is_directory(&store, "m").await.unwrap());
        assert!(!is_directory(&store, "file.txt").await.unwrap());
        assert!(!is_directory(&store, "nope").await.unwrap());
        assert!(!is_directory(&store, "a/b/x.txt").await.unwrap());
    }

    #[test]
    fn entries_serialize_camel_case() {
        let dir = Entry::Directory(DirectoryEntry::new("a/b"));
        let json = serde_json::to_value(&dir).unwrap();
        assert_eq!(json["name"], "b");
        assert_eq!(json["isDirectory"], true);
        assert!(json["size"].is_null());
        assert!(json["lastModified"].is_null());
        assert_eq!(serde_json::from_value::<Entry>(json).unwrap(), dir);

        let file = serde_json::json!({
            "name": "x.txt", "path": "a/x.txt", "isDirectory": false, "size": 3,
            "lastModified": null, "contentType": "text/plain"
        });
        assert!(!serde_json::from_value::<Entry>(file).unwrap().is_directory());
    }
}
