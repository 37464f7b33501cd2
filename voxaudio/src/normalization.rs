//! Replay-gain normalization data embedded in each audio object.
//!
//! Sixteen bytes at offset 144 of the decrypted object hold four big-endian
//! IEEE-754 floats: track gain (dB), track peak, album gain (dB), album
//! peak. Objects without the block (or with a short read) fall back to
//! neutral values.

use std::io::{self, Read, Seek, SeekFrom};

/// Byte offset of the normalization block in the decrypted object.
pub const NORMALIZATION_OFFSET: u64 = 144;

/// Size of the normalization block.
pub const NORMALIZATION_LEN: usize = 16;

/// Default loudness target in LUFS.
pub const DEFAULT_TARGET_LUFS: f32 = -14.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationData {
    pub track_gain_db: f32,
    pub track_peak: f32,
    pub album_gain_db: f32,
    pub album_peak: f32,
}

impl Default for NormalizationData {
    fn default() -> Self {
        Self {
            track_gain_db: 0.0,
            track_peak: 1.0,
            album_gain_db: 0.0,
            album_peak: 1.0,
        }
    }
}

impl NormalizationData {
    /// Parses the 16-byte block; anything shorter yields the default.
    pub fn parse(bytes: &[u8]) -> Self {
        if bytes.len() < NORMALIZATION_LEN {
            return Self::default();
        }
        let f = |i: usize| f32::from_be_bytes(bytes[i..i + 4].try_into().unwrap());
        Self {
            track_gain_db: f(0),
            track_peak: f(4),
            album_gain_db: f(8),
            album_peak: f(12),
        }
    }

    /// Reads the block from a decrypted (pre-header-skip) stream and
    /// restores the stream position.
    pub fn read_from<R: Read + Seek>(stream: &mut R) -> io::Result<Self> {
        let restore = stream.stream_position()?;
        stream.seek(SeekFrom::Start(NORMALIZATION_OFFSET))?;
        let mut block = [0u8; NORMALIZATION_LEN];
        let mut filled = 0;
        while filled < block.len() {
            let n = stream.read(&mut block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        stream.seek(SeekFrom::Start(restore))?;
        Ok(Self::parse(&block[..filled]))
    }

    /// Linear gain factor toward `target_lufs`.
    ///
    /// With clipping prevention the factor is capped at `1 / track_peak`;
    /// a peak of zero means no peak limit is known.
    pub fn factor(&self, target_lufs: f32, prevent_clipping: bool) -> f32 {
        let mut gain = 10f32.powf((target_lufs - self.track_gain_db) / 20.0);
        if prevent_clipping && self.track_peak > 0.0 {
            gain = gain.min(1.0 / self.track_peak);
        }
        gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_big_endian_floats() {
        let mut block = Vec::new();
        for v in [-5.5f32, 0.95, -4.2, 0.98] {
            block.extend_from_slice(&v.to_be_bytes());
        }
        let data = NormalizationData::parse(&block);
        assert!((data.track_gain_db + 5.5).abs() < 1e-3);
        assert!((data.track_peak - 0.95).abs() < 1e-3);
        assert!((data.album_gain_db + 4.2).abs() < 1e-3);
        assert!((data.album_peak - 0.98).abs() < 1e-3);
    }

    #[test]
    fn all_zero_block_is_all_zero() {
        let data = NormalizationData::parse(&[0u8; 16]);
        assert_eq!(data.track_gain_db, 0.0);
        assert_eq!(data.track_peak, 0.0);
        assert_eq!(data.album_gain_db, 0.0);
        assert_eq!(data.album_peak, 0.0);
    }

    #[test]
    fn short_block_falls_back_to_default() {
        let data = NormalizationData::parse(&[1u8; 7]);
        assert_eq!(data, NormalizationData::default());
        assert_eq!(data.track_gain_db, 0.0);
        assert_eq!(data.track_peak, 1.0);
    }

    #[test]
    fn default_factor_matches_target() {
        let data = NormalizationData::default();
        let factor = data.factor(DEFAULT_TARGET_LUFS, true);
        assert!((factor - 0.19953).abs() < 1e-4);
    }

    #[test]
    fn peak_caps_the_factor() {
        let data = NormalizationData {
            track_gain_db: -20.0,
            track_peak: 0.5,
            ..NormalizationData::default()
        };
        // Raw gain would be 10^(6/20) ≈ 2.0; the peak caps it at 2.0 exactly,
        // a hotter peak caps lower.
        assert!(data.factor(-14.0, true) <= 1.0 / 0.5 + 1e-6);

        let hot = NormalizationData {
            track_gain_db: -20.0,
            track_peak: 0.99,
            ..NormalizationData::default()
        };
        assert!((hot.factor(-14.0, true) - 1.0 / 0.99).abs() < 1e-4);

        // Peak of zero disables the cap.
        let unknown = NormalizationData {
            track_gain_db: -20.0,
            track_peak: 0.0,
            ..NormalizationData::default()
        };
        assert!((unknown.factor(-14.0, true) - 10f32.powf(6.0 / 20.0)).abs() < 1e-4);
    }

    #[test]
    fn read_from_restores_position() {
        use std::io::Cursor;
        let mut body = vec![0u8; 200];
        for (i, v) in [-5.5f32, 0.95, -4.2, 0.98].iter().enumerate() {
            body[NORMALIZATION_OFFSET as usize + i * 4..][..4]
                .copy_from_slice(&v.to_be_bytes());
        }
        let mut cursor = Cursor::new(body);
        cursor.set_position(10);
        let data = NormalizationData::read_from(&mut cursor).unwrap();
        assert!((data.track_gain_db + 5.5).abs() < 1e-3);
        assert_eq!(cursor.position(), 10);
    }
}
