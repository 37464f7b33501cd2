//! # Decoder registry
//!
//! Format detection and decoder selection over a byte stream that may or
//! may not support seeking.
//!
//! For a seekable stream the registry records the position, probes up to
//! 256 bytes, rewinds and asks each decoder in order. For a non-seekable
//! stream the probed bytes are kept and re-emitted byte-for-byte by a
//! [`PrefixedStream`] before the rest of the stream, and only the prefix is
//! sniffed.
//!
//! Ogg containers go to the dedicated Vorbis decoder; MP3, FLAC, RIFF/AIFF
//! and ISO-BMFF route to the shared Symphonia decoder. Sources that already
//! know their PCM layout bypass sniffing via [`pcm::PcmDecoder`].

pub mod pcm;
pub mod shared;
pub mod vorbis;

use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};

use tracing::debug;

use crate::{
    error::DecodeError,
    format::{AudioBuffer, AudioFormat},
};

/// Bytes buffered for format sniffing.
pub const SNIFF_LEN: usize = 256;

/// A seekable byte stream feeding a decoder.
pub trait MediaStream: Read + Seek + Send + Sync {}
impl<T: Read + Seek + Send + Sync> MediaStream for T {}

pub type MediaStreamBox = Box<dyn MediaStream>;

/// Input handed to a decoder: seekable, or forward-only.
pub enum DecoderSource {
    Seekable(MediaStreamBox),
    Stream(Box<dyn Read + Send + Sync>),
}

impl DecoderSource {
    pub fn is_seekable(&self) -> bool {
        matches!(self, DecoderSource::Seekable(_))
    }
}

impl Read for DecoderSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecoderSource::Seekable(inner) => inner.read(buf),
            DecoderSource::Stream(inner) => inner.read(buf),
        }
    }
}

impl Seek for DecoderSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            DecoderSource::Seekable(inner) => inner.seek(pos),
            DecoderSource::Stream(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream is not seekable",
            )),
        }
    }
}

/// A running decoder producing PCM lazily.
pub trait AudioDecoder: Send {
    /// PCM layout of the produced buffers.
    fn format(&self) -> AudioFormat;

    /// Next PCM block, or `None` at end of stream.
    fn next_buffer(&mut self) -> Result<Option<AudioBuffer>, DecodeError>;
}

impl std::fmt::Debug for dyn AudioDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDecoder")
            .field("format", &self.format())
            .finish()
    }
}

/// A decoder implementation known to the registry.
pub trait DecoderFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sniffs the probe bytes for this decoder's container.
    fn can_decode(&self, header: &[u8]) -> bool;

    /// Opens a decoder over `source`, positioned at `start_ms`.
    fn open(
        &self,
        source: DecoderSource,
        start_ms: u64,
    ) -> Result<Box<dyn AudioDecoder>, DecodeError>;
}

/// Ordered list of decoder factories with format sniffing.
pub struct DecoderRegistry {
    factories: Vec<Arc<dyn DecoderFactory>>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// The standard set: dedicated Vorbis first, Symphonia for the rest.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(vorbis::VorbisDecoderFactory));
        registry.register(Arc::new(shared::SymphoniaDecoderFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn DecoderFactory>) {
        self.factories.push(factory);
    }

    fn select(&self, probe: &[u8]) -> Result<&Arc<dyn DecoderFactory>, DecodeError> {
        self.factories
            .iter()
            .find(|f| f.can_decode(probe))
            .ok_or(DecodeError::UnknownFormat)
    }

    /// Sniffs a seekable stream and opens the matching decoder.
    pub fn open(
        &self,
        mut stream: MediaStreamBox,
        start_ms: u64,
    ) -> Result<Box<dyn AudioDecoder>, DecodeError> {
        let origin = stream.stream_position()?;
        let mut probe = [0u8; SNIFF_LEN];
        let filled = read_up_to(&mut stream, &mut probe)?;
        stream.seek(SeekFrom::Start(origin))?;

        let factory = self.select(&probe[..filled])?;
        debug!(decoder = factory.name(), "format detected");
        factory.open(DecoderSource::Seekable(stream), start_ms)
    }

    /// Sniffs a forward-only stream; the probed prefix is replayed in front
    /// of the remaining bytes.
    pub fn open_unseekable(
        &self,
        mut stream: Box<dyn Read + Send + Sync>,
        start_ms: u64,
    ) -> Result<Box<dyn AudioDecoder>, DecodeError> {
        let mut probe = [0u8; SNIFF_LEN];
        let filled = read_up_to(&mut stream, &mut probe)?;
        let prefix = probe[..filled].to_vec();

        let factory = self.select(&prefix)?;
        debug!(decoder = factory.name(), "format detected (unseekable)");
        let prefixed = PrefixedStream::new(prefix, stream);
        factory.open(DecoderSource::Stream(Box::new(prefixed)), start_ms)
    }
}

fn read_up_to<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Replays an in-memory prefix before delegating to the inner reader.
pub struct PrefixedStream<R> {
    prefix: Vec<u8>,
    position: usize,
    inner: R,
}

impl<R> PrefixedStream<R> {
    pub fn new(prefix: Vec<u8>, inner: R) -> Self {
        Self {
            prefix,
            position: 0,
            inner,
        }
    }
}

impl<R: Read> Read for PrefixedStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position < self.prefix.len() && !buf.is_empty() {
            let remaining = self.prefix.len() - self.position;
            let take = remaining.min(buf.len());
            buf[..take].copy_from_slice(&self.prefix[self.position..self.position + take]);
            self.position += take;
            return Ok(take);
        }
        self.inner.read(buf)
    }
}

/// Container sniffers used by the factories.
pub(crate) mod sniff {
    pub fn is_ogg(header: &[u8]) -> bool {
        header.len() >= 4 && &header[..4] == b"OggS"
    }

    pub fn is_mp3(header: &[u8]) -> bool {
        if header.len() >= 3 && &header[..3] == b"ID3" {
            return true;
        }
        header.len() >= 2 && header[0] == 0xFF && (header[1] & 0xE0) == 0xE0
    }

    pub fn is_flac(header: &[u8]) -> bool {
        header.len() >= 4 && &header[..4] == b"fLaC"
    }

    pub fn is_riff(header: &[u8]) -> bool {
        header.len() >= 4 && &header[..4] == b"RIFF"
    }

    pub fn is_aiff(header: &[u8]) -> bool {
        header.len() >= 4 && &header[..4] == b"FORM"
    }

    pub fn is_iso_bmff(header: &[u8]) -> bool {
        header.len() >= 8 && &header[4..8] == b"ftyp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffers_match_magic_bytes() {
        assert!(sniff::is_ogg(b"OggS\x00rest"));
        assert!(sniff::is_mp3(b"ID3\x04tag"));
        assert!(sniff::is_mp3(&[0xFF, 0xFB, 0x90]));
        assert!(!sniff::is_mp3(&[0xFF, 0x10]));
        assert!(sniff::is_flac(b"fLaC\x00"));
        assert!(sniff::is_riff(b"RIFFxxxxWAVE"));
        assert!(sniff::is_aiff(b"FORMxxxxAIFF"));
        assert!(sniff::is_iso_bmff(b"\x00\x00\x00\x20ftypM4A "));
        assert!(!sniff::is_ogg(b"Og"));
    }

    #[test]
    fn prefixed_stream_replays_prefix_byte_for_byte() {
        let prefix = vec![1u8, 2, 3, 4, 5];
        let tail: &[u8] = &[6, 7, 8];
        let mut stream = PrefixedStream::new(prefix.clone(), tail);

        let mut out = Vec::new();
        let mut tiny = [0u8; 2];
        loop {
            let n = stream.read(&mut tiny).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&tiny[..n]);
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let registry = DecoderRegistry::with_defaults();
        let noise = std::io::Cursor::new(vec![0x55u8; 512]);
        let err = registry.open(Box::new(noise), 0).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownFormat));
    }
}
