//! Error types for the cache and download layers.

use thiserror::Error;
use voxid::FileId;

/// Errors from the on-disk chunk store and its journal.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal error: {0}")]
    Journal(#[from] rusqlite::Error),

    #[error("unknown file id {0}")]
    UnknownFile(FileId),

    #[error("range {offset}+{len} is outside the file ({total} bytes)")]
    RangeOutOfBounds { offset: u64, len: u64, total: u64 },

    #[error("chunk {index} of {file_id} is not cached")]
    MissingChunk { file_id: FileId, index: u32 },
}

/// Errors from the progressive downloader.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("file {0} does not exist on the server")]
    NotFound(FileId),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server did not report a total size for {0}")]
    UnknownSize(FileId),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("download cancelled")]
    Cancelled,
}
