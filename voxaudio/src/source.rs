//! # Track sources
//!
//! The pipeline resolves a track URI through a registry of sources. A
//! source loads a [`LoadedTrack`]: metadata plus a re-openable byte stream
//! and optional seek-prefetch support. Streams open fresh handles so a
//! seek can reopen the decoder without disturbing other readers.
//!
//! [`StubSource`] serves silence with a known PCM layout; it exists for
//! tests and headless bring-up, in the same spirit as the stub sink.

use std::{
    io::{self, Cursor, Read, Seek, SeekFrom},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    decoder::MediaStreamBox,
    format::{AudioFormat, TrackMetadata},
};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to load {uri}: {reason}")]
    LoadFailed { uri: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A re-openable byte stream for one track.
pub trait TrackStream: Send + Sync {
    /// Opens a fresh stream positioned at byte zero.
    fn open(&self) -> io::Result<MediaStreamBox>;

    /// Hints that playback will continue near `position_ms` soon, so the
    /// covering byte range can be fetched ahead of the decoder.
    fn prefetch_for_seek(&self, _position_ms: u64) {}

    /// Average encoded byte rate, when known; used for time→byte seeks.
    fn byte_rate(&self) -> Option<u64> {
        None
    }
}

/// A resolved, playable track.
#[derive(Clone)]
pub struct LoadedTrack {
    pub metadata: TrackMetadata,
    pub stream: Arc<dyn TrackStream>,
    /// Present when the stream is raw PCM with a known layout; sniffing is
    /// skipped in that case.
    pub known_format: Option<AudioFormat>,
    pub can_seek: bool,
}

/// Resolves URIs to playable tracks.
#[async_trait]
pub trait TrackSource: Send + Sync {
    fn can_handle(&self, uri: &str) -> bool;

    async fn load(&self, uri: &str) -> Result<LoadedTrack, SourceError>;
}

/// Ordered source registry; the first source claiming a URI wins.
#[derive(Default)]
pub struct SourceRegistry {
    sources: RwLock<Vec<Arc<dyn TrackSource>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: Arc<dyn TrackSource>) {
        self.sources.write().unwrap().push(source);
    }

    pub fn find(&self, uri: &str) -> Option<Arc<dyn TrackSource>> {
        self.sources
            .read()
            .unwrap()
            .iter()
            .find(|s| s.can_handle(uri))
            .cloned()
    }
}

/// Seekable stream of zeros with a fixed length.
struct SilenceStream {
    len: u64,
}

struct SilenceReader {
    len: u64,
    position: u64,
}

impl TrackStream for SilenceStream {
    fn open(&self) -> io::Result<MediaStreamBox> {
        Ok(Box::new(SilenceReader {
            len: self.len,
            position: 0,
        }))
    }
}

impl Read for SilenceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.position);
        let take = (buf.len() as u64).min(remaining) as usize;
        buf[..take].fill(0);
        self.position += take as u64;
        Ok(take)
    }
}

impl Seek for SilenceReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => self.len as i64 + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

/// Test source: `stub:<anything>` resolves to silence.
pub struct StubSource {
    pub format: AudioFormat,
    pub duration_ms: u64,
}

impl Default for StubSource {
    fn default() -> Self {
        Self {
            format: AudioFormat::new(44_100, 2, 16),
            duration_ms: 10_000,
        }
    }
}

#[async_trait]
impl TrackSource for StubSource {
    fn can_handle(&self, uri: &str) -> bool {
        uri.starts_with("stub:")
    }

    async fn load(&self, uri: &str) -> Result<LoadedTrack, SourceError> {
        let bytes = self.format.ms_to_bytes(self.duration_ms);
        Ok(LoadedTrack {
            metadata: TrackMetadata {
                uri: uri.to_string(),
                title: Some("silence".to_string()),
                duration_ms: Some(self.duration_ms),
                ..TrackMetadata::default()
            },
            stream: Arc::new(SilenceStream { len: bytes }),
            known_format: Some(self.format),
            can_seek: true,
        })
    }
}

/// In-memory track used by decoder tests.
pub struct BufferSource {
    pub uri_prefix: &'static str,
    pub data: Arc<Vec<u8>>,
    pub known_format: Option<AudioFormat>,
}

struct BufferStream {
    data: Arc<Vec<u8>>,
}

impl TrackStream for BufferStream {
    fn open(&self) -> io::Result<MediaStreamBox> {
        Ok(Box::new(Cursor::new(self.data.as_ref().clone())))
    }
}

#[async_trait]
impl TrackSource for BufferSource {
    fn can_handle(&self, uri: &str) -> bool {
        uri.starts_with(self.uri_prefix)
    }

    async fn load(&self, uri: &str) -> Result<LoadedTrack, SourceError> {
        Ok(LoadedTrack {
            metadata: TrackMetadata {
                uri: uri.to_string(),
                ..TrackMetadata::default()
            },
            stream: Arc::new(BufferStream {
                data: self.data.clone(),
            }),
            known_format: self.known_format,
            can_seek: true,
        })
    }
}
