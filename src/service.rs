// src/service.rs
//
// FileService: the operations the request-handling layer calls. Constructed once at startup; owns
// the store handle, the listing cache and the upload pipeline.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheStats, ListingCache};
use crate::config::StorageConfig;
use crate::constants::{DEFAULT_CONTENT_TYPE, FOLDER_MARKER_CONTENT_TYPE};
use crate::content_type::content_type_for;
use crate::delete::{self, DeleteOutcome};
use crate::error::{Result, StorageError};
use crate::object_store::{store_for_config, ObjectStore, PutOptions};
use crate::path;
use crate::progress::{ChannelProgressSink, NoProgress, ProgressSink, UploadEvent};
use crate::transfer::{self, TransferMode, TransferReport};
use crate::tree::{self, DirectoryEntry, Entry, FileEntry};
use crate::upload::UploadPipeline;

/// `{data: [...]}` body of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub data: Vec<Entry>,
}

/// An object ready to be streamed to a client.
#[derive(Debug, Clone)]
pub struct Download {
    pub body: Bytes,
    pub content_type: String,
    pub content_length: u64,
    pub content_disposition: String,
}

/// One file to upload into a directory.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub directory: String,
    pub file_name: String,
    pub size: u64,
    /// Inferred from the file extension when absent.
    pub content_type: Option<String>,
}

impl UploadRequest {
    pub fn new(directory: impl Into<String>, file_name: impl Into<String>, size: u64) -> Self {
        Self {
            directory: directory.into(),
            file_name: file_name.into(),
            size,
            content_type: None,
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

pub struct FileService {
    store: Arc<dyn ObjectStore>,
    cache: Arc<ListingCache>,
    uploader: UploadPipeline,
    config: StorageConfig,
    sweeper: Option<JoinHandle<()>>,
}

impl FileService {
    /// Wrap an existing store. No background sweeper runs; expired listings are still ignored.
    pub fn new(store: Arc<dyn ObjectStore>, config: StorageConfig) -> Self {
        let cache = Arc::new(ListingCache::new(config.cache_ttl));
        let uploader = UploadPipeline::new(Arc::clone(&store), config.upload.clone());
        Self {
            store,
            cache,
            uploader,
            config,
            sweeper: None,
        }
    }

    /// Build the configured backend and start the passive cache sweeper.
    pub async fn from_config(config: StorageConfig) -> Result<Self> {
        let store = store_for_config(&config).await?;
        let mut service = Self::new(store, config);
        service.sweeper = Some(
            service
                .cache
                .spawn_sweeper(service.config.cache_sweep_interval),
        );
        Ok(service)
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Direct children of `path`, served from the cache within its TTL. A listing that races
    /// with an in-process mutation is returned but not cached.
    pub async fn list(&self, path: &str) -> Result<Listing> {
        let path = path::normalize(path)?;
        if let Some(entries) = self.cache.get(&path).await {
            return Ok(Listing {
                data: entries.as_ref().clone(),
            });
        }
        let generation = self.cache.generation();
        let entries = tree::list_children(self.store.as_ref(), &path).await?;
        self.cache
            .insert_if_unchanged(path, Arc::new(entries.clone()), generation)
            .await;
        Ok(Listing { data: entries })
    }

    pub async fn is_directory(&self, path: &str) -> Result<bool> {
        tree::is_directory(self.store.as_ref(), path).await
    }

    /// Upload `request.size` bytes from `source` into `request.directory`.
    ///
    /// Name, directory and size are checked before anything is sent to the store.
    pub async fn upload<R>(
        &self,
        request: UploadRequest,
        source: R,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<FileEntry>
    where
        R: AsyncRead + Unpin + Send,
    {
        let directory = path::normalize(&request.directory)?;
        path::validate_file_name(&request.file_name)?;
        if request.size > self.config.max_upload_size {
            return Err(StorageError::SizeLimitExceeded {
                size: request.size,
                limit: self.config.max_upload_size,
            });
        }
        let key = path::join(&directory, &request.file_name);
        let content_type = request
            .content_type
            .unwrap_or_else(|| content_type_for(&request.file_name).to_string());
        let options = PutOptions::with_content_type(content_type.clone())
            .metadata("originalName", request.file_name.clone())
            .metadata("size", request.size.to_string());

        let result = self
            .uploader
            .upload(&key, source, request.size, options, progress, cancel)
            .await;
        self.cache.invalidate_lineage(&key).await;
        let receipt = result?;

        Ok(FileEntry {
            name: request.file_name,
            path: receipt.key,
            is_directory: false,
            size: receipt.size,
            last_modified: Some(receipt.last_modified),
            content_type: Some(content_type),
        })
    }

    /// Upload an in-memory body to `target_path` (directory plus file name).
    pub async fn upload_bytes(&self, target_path: &str, data: Bytes) -> Result<Vec<FileEntry>> {
        let target = path::normalize(target_path)?;
        let request = UploadRequest::new(
            path::parent(&target),
            path::file_name(&target),
            data.len() as u64,
        );
        let entry = self
            .upload(request, &data[..], &NoProgress, &CancellationToken::new())
            .await?;
        Ok(vec![entry])
    }

    /// Like `upload`, relaying progress to `events` and finishing the channel with exactly one
    /// complete or error event.
    pub async fn upload_with_events<R>(
        &self,
        request: UploadRequest,
        source: R,
        events: UnboundedSender<UploadEvent>,
        cancel: &CancellationToken,
    ) -> Result<FileEntry>
    where
        R: AsyncRead + Unpin + Send,
    {
        let sink = ChannelProgressSink::new(events.clone());
        let result = self.upload(request, source, &sink, cancel).await;
        let terminal = match &result {
            Ok(entry) => UploadEvent::complete(entry.clone()),
            Err(e) => UploadEvent::error(e),
        };
        // The receiver may already be gone (client disconnected).
        let _ = events.send(terminal);
        result
    }

    /// Delete a file or, recursively, a directory.
    pub async fn delete_item(&self, path: &str) -> Result<DeleteOutcome> {
        delete::delete_path(
            self.store.as_ref(),
            &self.cache,
            path,
            self.config.bulk_concurrency,
        )
        .await
    }

    /// Make `path` a visible (possibly empty) directory by writing its marker.
    pub async fn create_folder(&self, path: &str) -> Result<Listing> {
        let path = path::normalize(path)?;
        if path.is_empty() {
            return Err(StorageError::invalid_path("/", "the root already exists"));
        }
        let marker = tree::marker_key(&path);
        self.store
            .put(
                &marker,
                Bytes::new(),
                &PutOptions::with_content_type(FOLDER_MARKER_CONTENT_TYPE),
            )
            .await?;
        self.cache.invalidate_lineage(&path).await;
        debug!("created folder {}", path);
        Ok(Listing {
            data: vec![Entry::Directory(DirectoryEntry::new(path))],
        })
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<TransferReport> {
        self.transfer(old_path, new_path, TransferMode::Rename).await
    }

    pub async fn copy(&self, source_path: &str, destination_path: &str) -> Result<TransferReport> {
        self.transfer(source_path, destination_path, TransferMode::Copy)
            .await
    }

    async fn transfer(
        &self,
        source: &str,
        destination: &str,
        mode: TransferMode,
    ) -> Result<TransferReport> {
        transfer::transfer(
            self.store.as_ref(),
            &self.cache,
            source,
            destination,
            mode,
            self.config.bulk_concurrency,
        )
        .await
    }

    /// Whole object with the headers a download response needs.
    pub async fn download(&self, path: &str) -> Result<Download> {
        let key = path::normalize(path)?;
        if key.is_empty() {
            return Err(StorageError::invalid_path("/", "the root is a directory"));
        }
        let props = self.store.get_properties(&key).await?;
        let body = self.store.get(&key).await?;
        let name = props
            .metadata
            .get("originalName")
            .map(String::as_str)
            .unwrap_or_else(|| path::file_name(&key));
        Ok(Download {
            content_length: body.len() as u64,
            content_type: props
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            content_disposition: content_disposition(name),
            body,
        })
    }

    /// The file at `path`, or the directory when no object has that exact key.
    pub async fn stat(&self, path: &str) -> Result<Entry> {
        let key = path::normalize(path)?;
        if !key.is_empty() {
            match self.store.get_properties(&key).await {
                Ok(props) => {
                    return Ok(Entry::File(FileEntry {
                        name: path::file_name(&key).to_string(),
                        path: key,
                        is_directory: false,
                        size: props.size,
                        last_modified: props.last_modified,
                        content_type: props.content_type,
                    }));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if tree::is_directory(self.store.as_ref(), &key).await? {
            Ok(Entry::Directory(DirectoryEntry::new(key)))
        } else {
            Err(StorageError::NotFound(key))
        }
    }
}

impl Drop for FileService {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

fn content_disposition(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}
