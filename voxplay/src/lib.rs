//! # voxplay
//!
//! Top-level assembly of the Vox streaming client core. The member crates
//! each own one subsystem:
//!
//! | crate | subsystem |
//! |---|---|
//! | `voxid` | entity / file identifiers |
//! | `voxap` | encrypted AP session, audio keys, login challenges |
//! | `voxcache` | progressive download, chunk store, metadata cache |
//! | `voxaudio` | decryption, decoding, processing, playback pipeline |
//! | `voxconnect` | dealer channel, remote commands, state publication |
//!
//! This crate glues them: [`ServiceTrackSource`] turns a track URI into a
//! decrypted seekable stream (audio key over the session, chunked
//! download into the shared store, head-blob stitch, header skip), and
//! [`VoxClient`] owns the lifecycles.

pub mod client;
pub mod service_source;
pub mod stream;

pub use client::{VoxClient, VoxClientConfig};
pub use service_source::{
    AudioKeyProvider, ResolveError, ResolvedTrack, ServiceTrackSource, TrackResolver,
};
pub use stream::HeadStitch;
