//! # voxcache
//!
//! Progressive download and caching for encrypted audio objects, plus the
//! tiered metadata cache.
//!
//! The read path is built for instant starts: a [`download::FileDownload`]
//! fills a shared on-disk chunk store ([`store::AudioFileStore`]) with
//! ranged HTTP fetches while any number of [`download::StreamingFile`]
//! handles expose the same bytes as a blocking `Read + Seek` stream,
//! waiting only for the exact ranges they touch. Interval bookkeeping is
//! done with [`range_set::RangeSet`].
//!
//! The [`head`] module fetches the pre-decrypted head blob the service
//! serves for instant playback, and [`metadata`] holds the hot/cold entity
//! and extension cache.

pub mod download;
pub mod error;
pub mod head;
pub mod metadata;
pub mod range_set;
pub mod store;

pub use download::{ChunkedDownloader, DownloadConfig, FileDownload, StreamingFile};
pub use error::{CacheError, DownloadError};
pub use head::{HeadFileClient, HeadFileError};
pub use metadata::{EntityCache, EntityCacheConfig, EntityEntry};
pub use range_set::{ByteRange, RangeSet, SharedRangeSet};
pub use store::{AudioFileStore, CacheEntry, StoreConfig};
