// src/file_store.rs
//
// FileSystemObjectStore: the ObjectStore contract on top of a local directory.
//
// Layout under the root:
//   <key>                                  object bytes, one file per key
//   .blobtree/meta/<dir>.d/.../<name>.json content type, metadata, etag
//   .blobtree/staging/<dir>.d/.../<name>.blocks/<block-id>
//   .blobtree/tmp/                         scratch files, renamed into place
//
// Sidecar and staging trees suffix directories with ".d" so a directory and a file that share a
// name can never collide there. Writes go through a temp file and a rename, so readers observe
// either the old or the new object.

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::constants::FILE_STORE_INTERNAL_DIR;
use crate::error::{Result, StorageError};
use crate::object_store::{
    BlockId, ObjectEntry, ObjectProperties, ObjectStore, ObjectStream, PutOptions, PutReceipt,
};

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Per-object attributes a plain file cannot carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    content_type: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    etag: String,
}

/// One entry of a directory being walked by `list_after`.
struct Child {
    key: String,
    is_dir: bool,
}

impl Child {
    /// Directory children sort as if followed by '/', which makes the walk emit keys in
    /// lexicographic order.
    fn sort_key(&self) -> String {
        if self.is_dir {
            format!("{}/", self.key)
        } else {
            self.key.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileSystemObjectStore {
    root: PathBuf,
    internal: PathBuf,
}

impl FileSystemObjectStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let internal = root.join(FILE_STORE_INTERNAL_DIR);
        for dir in ["meta", "staging", "tmp"] {
            fs::create_dir_all(internal.join(dir)).await?;
        }
        debug!("opened filesystem store at {}", root.display());
        Ok(Self { root, internal })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StorageError::invalid_path(key, "empty key"));
        }
        if crate::path::normalize(key)? != key {
            return Err(StorageError::invalid_path(key, "key is not normalized"));
        }
        if key.split('/').next() == Some(FILE_STORE_INTERNAL_DIR) {
            return Err(StorageError::invalid_path(key, "reserved by the filesystem backend"));
        }
        Ok(())
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Mirror `key` under `base`, with ".d" on directory segments and `suffix` on the last one.
    fn mirrored(base: &Path, key: &str, suffix: &str) -> PathBuf {
        let mut path = base.to_path_buf();
        let (dirs, name) = match key.rsplit_once('/') {
            Some((dirs, name)) => (Some(dirs), name),
            None => (None, key),
        };
        if let Some(dirs) = dirs {
            for segment in dirs.split('/') {
                path.push(format!("{segment}.d"));
            }
        }
        path.push(format!("{name}{suffix}"));
        path
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        Self::mirrored(&self.internal.join("meta"), key, ".json")
    }

    fn staging_dir(&self, key: &str) -> PathBuf {
        Self::mirrored(&self.internal.join("staging"), key, ".blocks")
    }

    fn temp_path(&self) -> PathBuf {
        self.internal
            .join("tmp")
            .join(format!("{:016x}", rand::random::<u64>()))
    }

    async fn read_sidecar(&self, key: &str) -> Result<Option<Sidecar>> {
        match fs::read(self.sidecar_path(key)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `data` to a temp file and rename it over `target`.
    async fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<()> {
        let tmp = self.temp_path();
        fs::write(&tmp, data).await?;
        self.move_into_place(&tmp, target).await
    }

    async fn move_into_place(&self, tmp: &Path, target: &Path) -> Result<()> {
        let placed = async {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(tmp, target).await
        }
        .await;
        if let Err(e) = placed {
            let _ = fs::remove_file(tmp).await;
            return Err(match e.kind() {
                ErrorKind::NotADirectory | ErrorKind::IsADirectory | ErrorKind::AlreadyExists => {
                    StorageError::invalid_path(
                        target.display().to_string(),
                        "conflicts with an existing object or directory",
                    )
                }
                _ => e.into(),
            });
        }
        Ok(())
    }

    async fn finish_put(
        &self,
        key: &str,
        tmp: &Path,
        etag: String,
        options: &PutOptions,
    ) -> Result<PutReceipt> {
        let target = self.object_path(key);
        if fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
            let _ = fs::remove_file(tmp).await;
            return Err(StorageError::invalid_path(key, "a directory exists at this key"));
        }
        self.move_into_place(tmp, &target).await?;

        let sidecar = Sidecar {
            content_type: options.content_type.clone(),
            metadata: options.metadata.clone(),
            etag: etag.clone(),
        };
        self.write_atomic(&self.sidecar_path(key), &serde_json::to_vec(&sidecar)?)
            .await?;

        let last_modified = fs::metadata(&target)
            .await?
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(PutReceipt {
            etag: Some(etag),
            last_modified,
        })
    }

    /// Remove now-empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(start: Option<&Path>, stop: &Path) {
        let mut dir = start.map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == stop || !current.starts_with(stop) {
                break;
            }
            if fs::remove_dir(&current).await.is_err() {
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }
    }

    /// Sorted children of the directory holding keys under `dir_key/` (root for "").
    async fn read_children(&self, dir_key: &str) -> Result<Vec<Child>> {
        let dir = if dir_key.is_empty() {
            self.root.clone()
        } else {
            self.object_path(dir_key)
        };
        let mut rd = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mut children = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                warn!("skipping non UTF-8 file name in {}", dir.display());
                continue;
            };
            if dir_key.is_empty() && name == FILE_STORE_INTERNAL_DIR {
                continue;
            }
            let file_type = match fs::metadata(entry.path()).await {
                Ok(meta) => meta.file_type(),
                // Removed between read_dir and stat.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !file_type.is_dir() && !file_type.is_file() {
                continue;
            }
            children.push(Child {
                key: crate::path::join(dir_key, &name),
                is_dir: file_type.is_dir(),
            });
        }
        children.sort_by_cached_key(Child::sort_key);
        Ok(children)
    }

    async fn entry_for(&self, key: &str) -> Result<Option<ObjectEntry>> {
        let meta = match fs::metadata(self.object_path(key)).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let content_type = self.read_sidecar(key).await?.map(|s| s.content_type);
        Ok(Some(ObjectEntry {
            key: key.to_string(),
            size: meta.len(),
            content_type,
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }))
    }
}

fn not_found_as(key: &str, e: std::io::Error) -> StorageError {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::NotADirectory | ErrorKind::IsADirectory => {
            StorageError::NotFound(key.to_string())
        }
        _ => e.into(),
    }
}

#[async_trait]
impl ObjectStore for FileSystemObjectStore {
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<PutReceipt> {
        Self::check_key(key)?;
        trace!("file put {} ({} bytes)", key, data.len());
        let etag = format!("\"{:08x}\"", crc32fast::hash(&data));
        let tmp = self.temp_path();
        fs::write(&tmp, &data).await?;
        self.finish_put(key, &tmp, etag, options).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        Self::check_key(key)?;
        let path = self.object_path(key);
        let data = fs::read(&path).await.map_err(|e| not_found_as(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn get_properties(&self, key: &str) -> Result<ObjectProperties> {
        Self::check_key(key)?;
        let meta = fs::metadata(self.object_path(key))
            .await
            .map_err(|e| not_found_as(key, e))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let sidecar = self.read_sidecar(key).await?;
        Ok(ObjectProperties {
            size: meta.len(),
            content_type: sidecar.as_ref().map(|s| s.content_type.clone()),
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            etag: sidecar.as_ref().map(|s| s.etag.clone()),
            metadata: sidecar.map(|s| s.metadata).unwrap_or_default(),
        })
    }

    /// Also discards uncommitted blocks staged under `key`.
    async fn delete(&self, key: &str) -> Result<()> {
        Self::check_key(key)?;
        let staging = self.staging_dir(key);
        if fs::remove_dir_all(&staging).await.is_ok() {
            Self::prune_empty_dirs(staging.parent(), &self.internal.join("staging")).await;
        }
        let path = self.object_path(key);
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_as(key, e))?;

        let sidecar = self.sidecar_path(key);
        if let Err(e) = fs::remove_file(&sidecar).await {
            if e.kind() != ErrorKind::NotFound {
                warn!("could not remove metadata of {}: {}", key, e);
            }
        }
        Self::prune_empty_dirs(path.parent(), &self.root).await;
        Self::prune_empty_dirs(sidecar.parent(), &self.internal.join("meta")).await;
        Ok(())
    }

    fn list_after<'a>(&'a self, prefix: &'a str, start_after: Option<String>) -> ObjectStream<'a> {
        Box::pin(try_stream! {
            // Deepest directory that holds every key under `prefix`.
            let base = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            let top_level = self.read_children(base).await?;
            let mut stack = vec![top_level.into_iter()];

            while let Some(top) = stack.last_mut() {
                let Some(child) = top.next() else {
                    stack.pop();
                    continue;
                };
                if !child.key.starts_with(prefix) {
                    continue;
                }
                if child.is_dir {
                    let dir_prefix = format!("{}/", child.key);
                    // Whole subtree sorts before the resume point.
                    if let Some(after) = &start_after {
                        if after.as_str() > dir_prefix.as_str() && !after.starts_with(&dir_prefix) {
                            continue;
                        }
                    }
                    let children = self.read_children(&child.key).await?;
                    stack.push(children.into_iter());
                    continue;
                }
                if start_after.as_deref().is_some_and(|after| child.key.as_str() <= after) {
                    continue;
                }
                if let Some(entry) = self.entry_for(&child.key).await? {
                    yield entry;
                }
            }
        })
    }

    async fn stage_block(&self, key: &str, block_id: &BlockId, data: Bytes) -> Result<()> {
        Self::check_key(key)?;
        let dir = self.staging_dir(key);
        fs::create_dir_all(&dir).await?;
        trace!("file stage {} {} ({} bytes)", key, block_id, data.len());
        self.write_atomic(&dir.join(block_id.as_str()), &data).await
    }

    async fn commit_blocks(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &PutOptions,
    ) -> Result<PutReceipt> {
        Self::check_key(key)?;
        let dir = self.staging_dir(key);
        let tmp = self.temp_path();
        let mut out = fs::File::create(&tmp).await?;
        let mut hasher = Hasher::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];

        let assembled: Result<()> = async {
            for id in block_ids {
                let mut block = fs::File::open(dir.join(id.as_str())).await.map_err(|e| {
                    match e.kind() {
                        ErrorKind::NotFound => StorageError::Internal(anyhow::anyhow!(
                            "block {id} of {key} was never staged"
                        )),
                        _ => e.into(),
                    }
                })?;
                loop {
                    let n = block.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    out.write_all(&buf[..n]).await?;
                }
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok(())
        }
        .await;
        drop(out);
        if let Err(e) = assembled {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }

        let etag = format!("\"{:08x}\"", hasher.finalize());
        let receipt = self.finish_put(key, &tmp, etag, options).await?;
        if let Err(e) = fs::remove_dir_all(&dir).await {
            warn!("could not clear staged blocks of {}: {}", key, e);
        }
        Self::prune_empty_dirs(dir.parent(), &self.internal.join("staging")).await;
        debug!("file commit {} ({} blocks)", key, block_ids.len());
        Ok(receipt)
    }

    async fn discard_blocks(&self, key: &str) -> Result<()> {
        Self::check_key(key)?;
        let staging = self.staging_dir(key);
        match fs::remove_dir_all(&staging).await {
            Ok(()) => {
                debug!("file discarded staged blocks of {}", key);
                Self::prune_empty_dirs(staging.parent(), &self.internal.join("staging")).await;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("file://{}", self.object_path(key).display())
    }
}
