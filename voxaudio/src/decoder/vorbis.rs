//! Dedicated Ogg/Vorbis decoder.
//!
//! Decodes with Lewton's generic sample API, clamping floats to `[-1, 1]`
//! before scaling to 16-bit little-endian PCM. Buffers accumulate 4096
//! samples per channel before being emitted. A positioned open seeks by
//! granule on seekable streams and decode-skips on forward-only ones.

use lewton::{
    inside_ogg::OggStreamReader,
    samples::InterleavedSamples,
    VorbisError,
};
use tracing::debug;

use crate::{
    decoder::{sniff, AudioDecoder, DecoderFactory, DecoderSource},
    error::DecodeError,
    format::{AudioBuffer, AudioFormat},
};

/// Samples accumulated per channel before a buffer is emitted.
const SAMPLES_PER_CHANNEL: usize = 4096;

pub struct VorbisDecoderFactory;

impl DecoderFactory for VorbisDecoderFactory {
    fn name(&self) -> &'static str {
        "vorbis"
    }

    fn can_decode(&self, header: &[u8]) -> bool {
        sniff::is_ogg(header)
    }

    fn open(
        &self,
        source: DecoderSource,
        start_ms: u64,
    ) -> Result<Box<dyn AudioDecoder>, DecodeError> {
        Ok(Box::new(VorbisDecoder::new(source, start_ms)?))
    }
}

pub struct VorbisDecoder {
    reader: OggStreamReader<DecoderSource>,
    format: AudioFormat,
    /// Absolute frame index of the next sample to emit.
    frame_cursor: u64,
    /// Frames to drop before emitting, for positioned non-seekable opens.
    skip_frames: u64,
}

impl VorbisDecoder {
    pub fn new(source: DecoderSource, start_ms: u64) -> Result<Self, DecodeError> {
        let seekable = source.is_seekable();
        let mut reader = OggStreamReader::new(source).map_err(vorbis_err)?;

        let sample_rate = reader.ident_hdr.audio_sample_rate;
        let channels = reader.ident_hdr.audio_channels as u16;
        let format = AudioFormat::new(sample_rate, channels, 16);

        let mut frame_cursor = 0;
        let mut skip_frames = 0;
        if start_ms > 0 {
            let granule = start_ms * sample_rate as u64 / 1000;
            if seekable {
                reader.seek_absgp_pg(granule).map_err(vorbis_err)?;
                frame_cursor = granule;
            } else {
                debug!(start_ms, "non-seekable vorbis stream, decode-skipping");
                skip_frames = granule;
            }
        }

        Ok(Self {
            reader,
            format,
            frame_cursor,
            skip_frames,
        })
    }
}

impl AudioDecoder for VorbisDecoder {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn next_buffer(&mut self) -> Result<Option<AudioBuffer>, DecodeError> {
        let channels = self.format.channels as usize;
        let target = SAMPLES_PER_CHANNEL * channels;

        loop {
            let mut samples: Vec<i16> = Vec::with_capacity(target);
            let mut eos = false;

            while samples.len() < target {
                match self
                    .reader
                    .read_dec_packet_generic::<InterleavedSamples<f32>>()
                {
                    Ok(Some(packet)) => {
                        for s in packet.samples {
                            let clamped = s.clamp(-1.0, 1.0);
                            samples.push((clamped * 32767.0) as i16);
                        }
                    }
                    Ok(None) => {
                        eos = true;
                        break;
                    }
                    Err(VorbisError::BadAudio(
                        lewton::audio::AudioReadError::AudioIsHeader,
                    )) => continue,
                    Err(e) => return Err(vorbis_err(e)),
                }
            }

            let frames = (samples.len() / channels) as u64;
            if frames == 0 {
                return Ok(None);
            }

            // Decode-skip for positioned opens on forward-only streams.
            if self.skip_frames >= frames {
                self.skip_frames -= frames;
                self.frame_cursor += frames;
                if eos {
                    return Ok(None);
                }
                continue;
            }
            let dropped_frames = self.skip_frames;
            let dropped = dropped_frames as usize * channels;
            self.skip_frames = 0;

            let position_ms =
                (self.frame_cursor + dropped_frames) * 1000 / self.format.sample_rate as u64;
            self.frame_cursor += frames;

            let emitted = &samples[dropped..];
            let mut data = Vec::with_capacity(emitted.len() * 2);
            for s in emitted {
                data.extend_from_slice(&s.to_le_bytes());
            }
            return Ok(Some(AudioBuffer::new(data, position_ms)));
        }
    }
}

fn vorbis_err(e: VorbisError) -> DecodeError {
    DecodeError::Decode(e.to_string())
}
