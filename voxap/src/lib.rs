//! # voxap
//!
//! Access-point (AP) session layer for the Vox streaming core.
//!
//! The AP channel is a TCP connection framed with a proprietary stream
//! cipher. This crate implements the full client side of that channel:
//!
//! - [`shannon`]: the Shannon stream cipher and its packet MAC.
//! - [`codec`]: `[cmd][len][payload][mac]` framing over the cipher, as a
//!   `tokio_util` codec with strict nonce sequencing.
//! - [`handshake`]: Diffie-Hellman key exchange, server signature
//!   verification and key derivation, producing a primed codec.
//! - [`session`]: the connected session with its read/write loops, packet
//!   dispatch, heartbeat and shutdown semantics.
//! - [`audio_key`]: request/response correlation for per-file audio keys.
//! - [`hashcash`]: the SHA-1 proof-of-work solver used by login
//!   challenges.
//! - [`token`]: access-token expiry bookkeeping.

pub mod audio_key;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod hashcash;
pub mod proto;
pub mod session;
pub mod shannon;
pub mod token;

pub use codec::{ApCodec, ApPacket};
pub use error::{ApError, AudioKeyError, HandshakeError, Login5Error};
pub use session::{ApSession, Credentials, SessionConfig};
pub use shannon::Shannon;
