//! # voxid
//!
//! Compact identifier types for the Vox streaming core.
//!
//! Two kinds of identifiers flow through the client:
//!
//! - [`EntityId`]: a 128-bit identifier for logical catalogue entities
//!   (tracks, albums, artists, playlists, shows, episodes), with base62,
//!   base16 and `vox:<type>:<base62>` URI representations.
//! - [`FileId`]: a 160-bit identifier for a specific encoded audio object,
//!   rendered as 40 lowercase hex characters.
//!
//! Both types store their raw bytes inline; parsing never allocates on the
//! heap beyond the error path.

mod entity_id;
mod error;
mod file_id;

pub use entity_id::{EntityId, ItemType};
pub use error::IdError;
pub use file_id::FileId;

/// URI scheme recognised by [`EntityId::from_uri`].
pub const URI_SCHEME: &str = "vox";
