//! Track source for service-hosted audio objects.
//!
//! Resolving a `vox:track:…` URI takes four steps: look the encoded file
//! up through the metadata resolver, fetch its AES key over the AP
//! session, attach to (or start) the progressive download, and try for the
//! instant-start head blob. The returned stream stacks decryption, the
//! head stitch and the header skip so the decoder sees clean audio bytes.

use std::{io, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use voxap::{audio_key::AudioKey, error::AudioKeyError, ApSession};
use voxaudio::{
    decrypt::{AudioDecrypt, AUDIO_HEADER_LEN},
    format::TrackMetadata,
    normalization::NormalizationData,
    source::{LoadedTrack, SourceError, TrackSource, TrackStream},
    MediaStreamBox,
};
use voxcache::{download::ChunkedDownloader, head::HeadFileClient, FileDownload};
use voxid::{EntityId, FileId, ItemType};

use crate::stream::HeadStitch;

/// External metadata lookup: which encoded object backs a track, and
/// where the CDN serves it.
#[derive(Debug, Clone)]
pub struct ResolvedTrack {
    pub file_id: FileId,
    pub url: String,
    pub metadata: TrackMetadata,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("track {0} has no playable file")]
    NoPlayableFile(String),

    #[error("resolver error: {0}")]
    Other(String),
}

#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, track: &EntityId) -> Result<ResolvedTrack, ResolveError>;
}

/// Source of per-file AES keys. The AP session is the real provider.
#[async_trait]
pub trait AudioKeyProvider: Send + Sync {
    async fn request(&self, track: &EntityId, file: &FileId) -> Result<AudioKey, AudioKeyError>;
}

#[async_trait]
impl AudioKeyProvider for ApSession {
    async fn request(&self, track: &EntityId, file: &FileId) -> Result<AudioKey, AudioKeyError> {
        self.audio_key().request(track, file).await
    }
}

/// [`TrackSource`] for tracks and episodes hosted by the service.
pub struct ServiceTrackSource {
    keys: Arc<dyn AudioKeyProvider>,
    downloader: Arc<ChunkedDownloader>,
    heads: Option<Arc<HeadFileClient>>,
    resolver: Arc<dyn TrackResolver>,
}

impl ServiceTrackSource {
    pub fn new(
        keys: Arc<dyn AudioKeyProvider>,
        downloader: Arc<ChunkedDownloader>,
        heads: Option<Arc<HeadFileClient>>,
        resolver: Arc<dyn TrackResolver>,
    ) -> Self {
        Self {
            keys,
            downloader,
            heads,
            resolver,
        }
    }
}

#[async_trait]
impl TrackSource for ServiceTrackSource {
    fn can_handle(&self, uri: &str) -> bool {
        EntityId::try_from_uri(uri)
            .map(|id| matches!(id.item_type(), ItemType::Track | ItemType::Episode))
            .unwrap_or(false)
    }

    async fn load(&self, uri: &str) -> Result<LoadedTrack, SourceError> {
        let entity = EntityId::try_from_uri(uri).ok_or_else(|| SourceError::LoadFailed {
            uri: uri.to_string(),
            reason: "not a playable entity URI".to_string(),
        })?;

        let resolved =
            self.resolver
                .resolve(&entity)
                .await
                .map_err(|e| SourceError::LoadFailed {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                })?;

        let key = self
            .keys
            .request(&entity, &resolved.file_id)
            .await
            .map_err(|e| SourceError::LoadFailed {
                uri: uri.to_string(),
                reason: format!("audio key: {e}"),
            })?;

        // The head fetch is best-effort; playback works without it.
        let head = match &self.heads {
            Some(heads) => heads
                .try_fetch_head(&resolved.file_id)
                .await
                .unwrap_or_else(Bytes::new),
            None => Bytes::new(),
        };
        if !head.is_empty() {
            debug!(file = %resolved.file_id, bytes = head.len(), "instant-start head available");
        }

        let download = self
            .downloader
            .open(resolved.file_id, resolved.url.clone())
            .await
            .map_err(|e| SourceError::LoadFailed {
                uri: uri.to_string(),
                reason: format!("download: {e}"),
            })?;

        let stream = Arc::new(ServiceTrackStream {
            download,
            key,
            head,
            duration_ms: resolved.metadata.duration_ms,
        });

        // Normalization data sits before the header-skip boundary; read it
        // once off the async threads and attach it to the metadata.
        let mut metadata = resolved.metadata;
        let reader = stream.clone();
        let normalization = tokio::task::spawn_blocking(move || {
            let mut decrypted = reader.open_decrypted()?;
            NormalizationData::read_from(&mut decrypted)
        })
        .await;
        match normalization {
            Ok(Ok(data)) => metadata.replaygain = Some(data),
            Ok(Err(e)) => warn!("normalization data unavailable: {e}"),
            Err(e) => warn!("normalization read task failed: {e}"),
        }

        Ok(LoadedTrack {
            metadata,
            stream,
            known_format: None,
            can_seek: true,
        })
    }
}

struct ServiceTrackStream {
    download: Arc<FileDownload>,
    key: AudioKey,
    head: Bytes,
    duration_ms: Option<u64>,
}

impl ServiceTrackStream {
    /// Decrypted full object (header included), head-stitched.
    fn open_decrypted(&self) -> io::Result<HeadStitch<AudioDecrypt<voxcache::StreamingFile>>> {
        let raw = self.download.stream();
        let decrypt = AudioDecrypt::new(&self.key, raw);
        Ok(HeadStitch::new(
            self.head.clone(),
            decrypt,
            self.download.total_size(),
        ))
    }

    /// Estimated encoded bytes per second of audio.
    fn estimated_byte_rate(&self) -> Option<u64> {
        let duration = self.duration_ms?;
        if duration == 0 {
            return None;
        }
        let audio_bytes = self.download.total_size().saturating_sub(AUDIO_HEADER_LEN);
        Some(audio_bytes * 1000 / duration)
    }
}

impl TrackStream for ServiceTrackStream {
    fn open(&self) -> io::Result<MediaStreamBox> {
        let decrypted = self.open_decrypted()?;
        let skipped = voxaudio::HeaderSkip::over_audio_header(decrypted)?;
        Ok(Box::new(skipped))
    }

    fn prefetch_for_seek(&self, position_ms: u64) {
        let Some(rate) = self.estimated_byte_rate() else {
            return;
        };
        let target = AUDIO_HEADER_LEN + rate * position_ms / 1000;
        debug!(position_ms, target, "prefetching for seek");
        self.download.prefetch_for_seek(target);
    }

    fn byte_rate(&self) -> Option<u64> {
        self.estimated_byte_rate()
    }
}
