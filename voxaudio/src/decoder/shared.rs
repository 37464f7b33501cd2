//! Shared decoder for non-Ogg containers, backed by Symphonia.
//!
//! Handles MP3, FLAC, RIFF/WAV, AIFF and ISO-BMFF objects. Output is
//! interleaved 16-bit little-endian PCM, re-sampled positions come from the
//! container time base.

use std::io::{self, Read, Seek, SeekFrom};

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSource, MediaSourceStream, ReadOnlySource},
    meta::MetadataOptions,
    probe::Hint,
    units::{Time, TimeBase},
};
use tracing::warn;

use crate::{
    decoder::{sniff, AudioDecoder, DecoderFactory, DecoderSource, MediaStreamBox},
    error::DecodeError,
    format::{AudioBuffer, AudioFormat},
};

pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn name(&self) -> &'static str {
        "symphonia"
    }

    fn can_decode(&self, header: &[u8]) -> bool {
        sniff::is_mp3(header)
            || sniff::is_flac(header)
            || sniff::is_riff(header)
            || sniff::is_aiff(header)
            || sniff::is_iso_bmff(header)
    }

    fn open(
        &self,
        source: DecoderSource,
        start_ms: u64,
    ) -> Result<Box<dyn AudioDecoder>, DecodeError> {
        Ok(Box::new(SymphoniaDecoder::new(source, start_ms)?))
    }
}

/// Adapter marking our seekable stream as such for Symphonia.
struct SeekableMediaSource(MediaStreamBox);

impl Read for SeekableMediaSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Seek for SeekableMediaSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl MediaSource for SeekableMediaSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

pub struct SymphoniaDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    format: AudioFormat,
}

impl SymphoniaDecoder {
    pub fn new(source: DecoderSource, start_ms: u64) -> Result<Self, DecodeError> {
        let seekable = source.is_seekable();
        let media: Box<dyn MediaSource> = match source {
            DecoderSource::Seekable(inner) => Box::new(SeekableMediaSource(inner)),
            DecoderSource::Stream(inner) => Box::new(ReadOnlySource::new(inner)),
        };
        let stream = MediaSourceStream::new(media, Default::default());

        let probed = symphonia::default::get_probe()
            .format(
                &Hint::new(),
                stream,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(symphonia_err)?;
        let mut reader = probed.format;

        let track = reader
            .default_track()
            .ok_or_else(|| DecodeError::Decode("container has no audio track".to_string()))?
            .clone();
        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(symphonia_err)?;

        let sample_rate = track.codec_params.sample_rate.unwrap_or(44_100);
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(2);
        let format = AudioFormat::new(sample_rate, channels, 16);

        if start_ms > 0 && seekable {
            reader
                .seek(
                    SeekMode::Accurate,
                    SeekTo::Time {
                        time: Time::new(start_ms / 1000, (start_ms % 1000) as f64 / 1000.0),
                        track_id: Some(track.id),
                    },
                )
                .map_err(symphonia_err)?;
            decoder.reset();
        }

        Ok(Self {
            reader,
            decoder,
            track_id: track.id,
            time_base: track.codec_params.time_base,
            format,
        })
    }

    fn ts_to_ms(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                time.seconds * 1000 + (time.frac * 1000.0) as u64
            }
            None => 0,
        }
    }
}

impl AudioDecoder for SymphoniaDecoder {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn next_buffer(&mut self) -> Result<Option<AudioBuffer>, DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(symphonia_err(e)),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            let ts = packet.ts();

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let spec = *decoded.spec();
                    let mut buffer =
                        SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);

                    let samples = buffer.samples();
                    let mut data = Vec::with_capacity(samples.len() * 2);
                    for s in samples {
                        data.extend_from_slice(&s.to_le_bytes());
                    }
                    return Ok(Some(AudioBuffer::new(data, self.ts_to_ms(ts))));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // A corrupt packet is skippable; the stream continues.
                    warn!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(SymphoniaError::IoError(e))
                    if e.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(symphonia_err(e)),
            }
        }
    }
}

fn symphonia_err(e: SymphoniaError) -> DecodeError {
    DecodeError::Decode(e.to_string())
}
