// src/constants.rs
//
// Centralized constants for blobtree to avoid hardcoded values throughout the codebase

use std::time::Duration;

/// Name of the zero-byte object that marks an explicit directory
pub const FOLDER_MARKER: &str = ".folder_marker";

/// Legacy marker name still recognised when listing
pub const LEGACY_FOLDER_MARKER: &str = ".folder";

/// Content type written on folder markers
pub const FOLDER_MARKER_CONTENT_TYPE: &str = "application/x-directory";

/// Fallback content type when nothing better is known
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Maximum length of a single path segment (characters)
pub const MAX_SEGMENT_LEN: usize = 200;

// ============================================================================
// Upload pipeline
// ============================================================================

/// Uploads at or below this size go through a single atomic put (100 MiB)
pub const SINGLE_PUT_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Block size for chunked uploads (100 MiB, last block truncated)
pub const DEFAULT_BLOCK_SIZE: usize = 100 * 1024 * 1024;

/// Maximum concurrent stage-block calls per batch
pub const DEFAULT_MAX_IN_FLIGHT_BLOCKS: usize = 10;

/// Concurrency hint handed to the backend for a single put
pub const DEFAULT_SINGLE_PUT_CONCURRENCY: usize = 20;

/// Read granularity of the single-put path; cancellation and progress are polled per chunk (8 MiB)
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Default maximum upload size (4 GiB)
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Progress never reaches 100 before the store confirms the write
pub const PROGRESS_CAP_BEFORE_COMMIT: u8 = 99;

// ============================================================================
// Backends
// ============================================================================

/// Above this size the Azure backend stages a put as sub-blocks (4 MiB)
pub const AZURE_SINGLE_SHOT_LIMIT: usize = 4 * 1024 * 1024;

/// Sub-block size used by the Azure backend for large single puts (4 MiB)
pub const AZURE_PUT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Keys returned per listing page by the in-memory backend
pub const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

/// Internal bookkeeping directory of the filesystem backend, relative to its root
pub const FILE_STORE_INTERNAL_DIR: &str = ".blobtree";

// ============================================================================
// Retry policy
// ============================================================================

/// Attempts per store call, first try included
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Initial backoff delay
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound for a single backoff delay
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Listing cache and bulk operations
// ============================================================================

/// Listing cache time-to-live (5 minutes)
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Passive sweep interval for expired listings (2 minutes)
pub const DEFAULT_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Parallel sub-deletes / copies for recursive operations
pub const DEFAULT_BULK_CONCURRENCY: usize = 32;
