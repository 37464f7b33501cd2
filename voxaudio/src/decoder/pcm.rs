//! Raw PCM pass-through decoder for sources with a known format.
//!
//! There is nothing to sniff: the source declares its interleaved 16-bit
//! layout and the decoder slices the byte stream into frame-aligned
//! buffers, translating the start position into a byte offset.

use std::io::{Seek, SeekFrom};

use crate::{
    decoder::{AudioDecoder, DecoderSource},
    error::DecodeError,
    format::{AudioBuffer, AudioFormat},
};

/// Frames per emitted buffer.
const FRAMES_PER_BUFFER: u64 = 4096;

pub struct PcmDecoder {
    source: DecoderSource,
    format: AudioFormat,
    position_bytes: u64,
}

impl PcmDecoder {
    pub fn new(
        mut source: DecoderSource,
        format: AudioFormat,
        start_ms: u64,
    ) -> Result<Self, DecodeError> {
        if format.bytes_per_frame() == 0 {
            return Err(DecodeError::Decode("zero-sized PCM frame".to_string()));
        }

        let start_byte = format.ms_to_bytes(start_ms);
        if source.is_seekable() {
            source.seek(SeekFrom::Start(start_byte))?;
        } else {
            skip_forward(&mut source, start_byte)?;
        }

        Ok(Self {
            source,
            format,
            position_bytes: start_byte,
        })
    }
}

fn skip_forward(source: &mut DecoderSource, mut remaining: u64) -> Result<(), DecodeError> {
    use std::io::Read;
    let mut scratch = [0u8; 8192];
    while remaining > 0 {
        let take = (scratch.len() as u64).min(remaining) as usize;
        let n = source.read(&mut scratch[..take])?;
        if n == 0 {
            break;
        }
        remaining -= n as u64;
    }
    Ok(())
}

impl AudioDecoder for PcmDecoder {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn next_buffer(&mut self) -> Result<Option<AudioBuffer>, DecodeError> {
        use std::io::Read;

        let frame = self.format.bytes_per_frame() as u64;
        let mut data = vec![0u8; (FRAMES_PER_BUFFER * frame) as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = self.source.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        // Whole frames only.
        filled -= filled % frame as usize;
        if filled == 0 {
            return Ok(None);
        }
        data.truncate(filled);

        let position_ms = self.format.bytes_to_ms(self.position_bytes);
        self.position_bytes += filled as u64;
        Ok(Some(AudioBuffer::new(data, position_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stereo() -> AudioFormat {
        AudioFormat::new(44_100, 2, 16)
    }

    #[test]
    fn slices_into_frame_aligned_buffers() {
        // One second of audio plus a ragged trailing byte.
        let mut body = vec![0u8; 176_400];
        body.push(0xFF);
        let mut decoder = PcmDecoder::new(
            DecoderSource::Seekable(Box::new(Cursor::new(body))),
            stereo(),
            0,
        )
        .unwrap();

        let mut total = 0u64;
        let mut buffers = 0;
        while let Some(buf) = decoder.next_buffer().unwrap() {
            assert_eq!(buf.data.len() % 4, 0);
            total += buf.data.len() as u64;
            buffers += 1;
        }
        assert_eq!(total, 176_400);
        assert!(buffers > 1);
    }

    #[test]
    fn positioned_open_reports_start_time() {
        let body = vec![0u8; 176_400 * 2];
        let mut decoder = PcmDecoder::new(
            DecoderSource::Seekable(Box::new(Cursor::new(body))),
            stereo(),
            1000,
        )
        .unwrap();
        let buf = decoder.next_buffer().unwrap().unwrap();
        assert_eq!(buf.position_ms, 1000);
    }
}
