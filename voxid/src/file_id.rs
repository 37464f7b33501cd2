//! 160-bit audio object identifiers.

use std::fmt;

use crate::error::IdError;

/// Width of the lowercase base16 form.
const BASE16_LEN: usize = 40;

/// A 160-bit identifier naming a specific encoded audio object.
///
/// The all-zero value is the `Empty` marker and is considered invalid for
/// any real file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId([u8; 20]);

impl FileId {
    /// The invalid all-zero identifier.
    pub const EMPTY: FileId = FileId([0u8; 20]);

    pub fn from_raw(raw: [u8; 20]) -> Self {
        Self(raw)
    }

    /// Builds an identifier from a raw byte slice, which must be exactly
    /// 20 bytes long.
    pub fn from_raw_slice(raw: &[u8]) -> Result<Self, IdError> {
        let raw: [u8; 20] = raw.try_into().map_err(|_| IdError::InvalidLength {
            expected: 20,
            actual: raw.len(),
        })?;
        Ok(Self(raw))
    }

    /// Parses the 40-character lowercase base16 form.
    pub fn from_base16(s: &str) -> Result<Self, IdError> {
        if s.len() != BASE16_LEN {
            return Err(IdError::InvalidLength {
                expected: BASE16_LEN,
                actual: s.len(),
            });
        }
        let mut raw = [0u8; 20];
        hex::decode_to_slice(s, &mut raw).map_err(|_| {
            let bad = s
                .chars()
                .find(|c| !c.is_ascii_hexdigit())
                .unwrap_or('?');
            IdError::InvalidBase16(bad)
        })?;
        Ok(Self(raw))
    }

    /// True for the all-zero `Empty` marker.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Copies the 20 raw bytes into `dst`, which must hold at least 20 bytes.
    pub fn write_raw(&self, dst: &mut [u8]) -> Result<(), IdError> {
        if dst.len() < 20 {
            return Err(IdError::BufferTooSmall {
                need: 20,
                got: dst.len(),
            });
        }
        dst[..20].copy_from_slice(&self.0);
        Ok(())
    }

    /// Renders the 40-character lowercase base16 form.
    pub fn to_base16(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.to_base16())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base16_round_trip() {
        let raw: [u8; 20] = (0u8..20).collect::<Vec<_>>().try_into().unwrap();
        let id = FileId::from_raw(raw);
        let hex = id.to_base16();
        assert_eq!(hex.len(), 40);
        assert_eq!(FileId::from_base16(&hex).unwrap(), id);
    }

    #[test]
    fn empty_is_all_zero() {
        assert!(FileId::EMPTY.is_empty());
        assert!(!FileId::from_raw([1u8; 20]).is_empty());
    }

    #[test]
    fn write_raw_checks_destination() {
        let id = FileId::from_raw([7u8; 20]);
        let mut short = [0u8; 10];
        assert!(matches!(
            id.write_raw(&mut short),
            Err(IdError::BufferTooSmall { need: 20, got: 10 })
        ));

        let mut dst = [0u8; 24];
        id.write_raw(&mut dst).unwrap();
        assert_eq!(&dst[..20], &[7u8; 20]);
        assert_eq!(&dst[20..], &[0u8; 4]);
    }

    #[test]
    fn rejects_bad_base16() {
        assert!(matches!(
            FileId::from_base16("zz"),
            Err(IdError::InvalidLength { .. })
        ));
        let bad = "g".repeat(40);
        assert!(matches!(
            FileId::from_base16(&bad),
            Err(IdError::InvalidBase16('g'))
        ));
    }
}
