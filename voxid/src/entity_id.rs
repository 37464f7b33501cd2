//! 128-bit catalogue entity identifiers.

use std::fmt;

use crate::{error::IdError, URI_SCHEME};

/// Alphabet used for the fixed-width base62 form: digits, then upper case,
/// then lower case.
const BASE62_ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Width of the base62 form. 62^22 > 2^128, so 22 digits always suffice.
const BASE62_LEN: usize = 22;

/// Width of the lowercase base16 form.
const BASE16_LEN: usize = 32;

/// Kind of catalogue entity an [`EntityId`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemType {
    Track,
    Album,
    Artist,
    Playlist,
    Show,
    Episode,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Track => "track",
            ItemType::Album => "album",
            ItemType::Artist => "artist",
            ItemType::Playlist => "playlist",
            ItemType::Show => "show",
            ItemType::Episode => "episode",
        }
    }

    fn parse(s: &str) -> Result<Self, IdError> {
        match s {
            "track" => Ok(ItemType::Track),
            "album" => Ok(ItemType::Album),
            "artist" => Ok(ItemType::Artist),
            "playlist" => Ok(ItemType::Playlist),
            "show" => Ok(ItemType::Show),
            "episode" => Ok(ItemType::Episode),
            other => Err(IdError::UnknownItemType(other.to_string())),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 128-bit catalogue entity identifier.
///
/// Two identifiers are equal iff both the raw bytes and the item type match.
/// The canonical textual forms are the 22-character base62 string, the
/// 32-character lowercase base16 string, and the `vox:<type>:<base62>` URI.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId {
    raw: [u8; 16],
    item_type: ItemType,
}

impl EntityId {
    /// Builds an identifier from its 16 raw bytes.
    pub fn from_raw(raw: [u8; 16], item_type: ItemType) -> Self {
        Self { raw, item_type }
    }

    /// Builds an identifier from a raw byte slice, which must be exactly
    /// 16 bytes long.
    pub fn from_raw_slice(raw: &[u8], item_type: ItemType) -> Result<Self, IdError> {
        let raw: [u8; 16] = raw.try_into().map_err(|_| IdError::InvalidLength {
            expected: 16,
            actual: raw.len(),
        })?;
        Ok(Self { raw, item_type })
    }

    /// Parses the fixed-width 22-character base62 form.
    pub fn from_base62(s: &str, item_type: ItemType) -> Result<Self, IdError> {
        if s.len() != BASE62_LEN {
            return Err(IdError::InvalidLength {
                expected: BASE62_LEN,
                actual: s.len(),
            });
        }

        let mut value: u128 = 0;
        for c in s.chars() {
            let digit = match c {
                '0'..='9' => c as u128 - '0' as u128,
                'A'..='Z' => c as u128 - 'A' as u128 + 10,
                'a'..='z' => c as u128 - 'a' as u128 + 36,
                other => return Err(IdError::InvalidBase62(other)),
            };
            value = value
                .checked_mul(62)
                .and_then(|v| v.checked_add(digit))
                .ok_or(IdError::InvalidBase62(c))?;
        }

        Ok(Self {
            raw: value.to_be_bytes(),
            item_type,
        })
    }

    /// Parses the 32-character lowercase base16 form.
    pub fn from_base16(s: &str, item_type: ItemType) -> Result<Self, IdError> {
        if s.len() != BASE16_LEN {
            return Err(IdError::InvalidLength {
                expected: BASE16_LEN,
                actual: s.len(),
            });
        }
        let mut raw = [0u8; 16];
        hex::decode_to_slice(s, &mut raw).map_err(|_| {
            let bad = s
                .chars()
                .find(|c| !c.is_ascii_hexdigit())
                .unwrap_or('?');
            IdError::InvalidBase16(bad)
        })?;
        Ok(Self { raw, item_type })
    }

    /// Parses a `vox:<type>:<base62>` URI.
    pub fn from_uri(uri: &str) -> Result<Self, IdError> {
        let mut parts = uri.splitn(3, ':');
        let scheme = parts
            .next()
            .ok_or_else(|| IdError::MalformedUri(uri.to_string()))?;
        if scheme != URI_SCHEME {
            return Err(IdError::UnknownScheme(scheme.to_string()));
        }
        let kind = parts
            .next()
            .ok_or_else(|| IdError::MalformedUri(uri.to_string()))?;
        let id = parts
            .next()
            .ok_or_else(|| IdError::MalformedUri(uri.to_string()))?;

        Self::from_base62(id, ItemType::parse(kind)?)
    }

    /// Non-throwing variant of [`EntityId::from_uri`].
    pub fn try_from_uri(uri: &str) -> Option<Self> {
        Self::from_uri(uri).ok()
    }

    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    /// Returns the 16 raw bytes.
    pub fn to_raw(&self) -> [u8; 16] {
        self.raw
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.raw
    }

    /// Renders the fixed-width 22-character base62 form.
    pub fn to_base62(&self) -> String {
        let mut value = u128::from_be_bytes(self.raw);
        let mut out = [b'0'; BASE62_LEN];
        for slot in out.iter_mut().rev() {
            *slot = BASE62_ALPHABET[(value % 62) as usize];
            value /= 62;
        }
        // 62^22 exceeds u128::MAX, so the division always terminates at zero.
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Renders the 32-character lowercase base16 form.
    pub fn to_base16(&self) -> String {
        hex::encode(self.raw)
    }

    /// Renders the canonical URI form.
    pub fn to_uri(&self) -> String {
        format!("{}:{}:{}", URI_SCHEME, self.item_type, self.to_base62())
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.to_uri())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id() -> EntityId {
        let raw: [u8; 16] = (0u8..16).collect::<Vec<_>>().try_into().unwrap();
        EntityId::from_raw(raw, ItemType::Track)
    }

    #[test]
    fn base62_round_trip() {
        let id = sample_id();
        let b62 = id.to_base62();
        assert_eq!(b62.len(), 22);
        let back = EntityId::from_base62(&b62, ItemType::Track).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn base16_round_trip() {
        let id = sample_id();
        let b16 = id.to_base16();
        assert_eq!(b16, "000102030405060708090a0b0c0d0e0f");
        let back = EntityId::from_base16(&b16, ItemType::Track).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn uri_round_trip() {
        let id = sample_id();
        let uri = id.to_uri();
        assert!(uri.starts_with("vox:track:"));
        assert_eq!(EntityId::from_uri(&uri).unwrap(), id);
        assert_eq!(EntityId::try_from_uri(&uri), Some(id));
    }

    #[test]
    fn equality_includes_type() {
        let raw = sample_id().to_raw();
        let track = EntityId::from_raw(raw, ItemType::Track);
        let episode = EntityId::from_raw(raw, ItemType::Episode);
        assert_ne!(track, episode);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = EntityId::from_uri("other:track:0000000000000000000000").unwrap_err();
        assert_eq!(err, IdError::UnknownScheme("other".to_string()));
    }

    #[test]
    fn rejects_unknown_item_type() {
        let err = EntityId::from_uri("vox:concert:0000000000000000000000").unwrap_err();
        assert_eq!(err, IdError::UnknownItemType("concert".to_string()));
    }

    #[test]
    fn rejects_bad_base62() {
        assert!(matches!(
            EntityId::from_base62("00000000000000000000-0", ItemType::Track),
            Err(IdError::InvalidBase62('-'))
        ));
        assert!(matches!(
            EntityId::from_base62("0", ItemType::Track),
            Err(IdError::InvalidLength { .. })
        ));
    }

    #[test]
    fn try_from_uri_is_non_throwing() {
        assert_eq!(EntityId::try_from_uri("not a uri"), None);
        assert_eq!(EntityId::try_from_uri("vox:track:short"), None);
    }
}
