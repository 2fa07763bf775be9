// src/lib.rs
//
// Crate root: a virtual directory tree over a flat object store, with chunked uploads,
// recursive delete, bulk copy/rename and a listing cache.

pub mod constants;
pub mod error;
pub mod path;
pub mod content_type;
pub mod config;
pub mod object_store;
pub mod retry;
pub mod memory_store;
pub mod file_store;
#[cfg(feature = "azure-backend")]
pub mod azure_client;
pub mod tree;
pub mod cache;
pub mod progress;
pub mod upload;
pub mod delete;
pub mod transfer;
pub mod service;

pub use config::{AzureConfig, BackendConfig, StorageConfig};
pub use error::{Result, StorageError};
pub use object_store::{
    store_for_config, BlockId, ObjectEntry, ObjectProperties, ObjectStore, ObjectStream,
    PutOptions, PutReceipt,
};
pub use progress::{ProgressSink, UploadEvent, UploadProgress};
pub use service::{Download, FileService, Listing, UploadRequest};
pub use tree::{DirectoryEntry, Entry, FileEntry};
