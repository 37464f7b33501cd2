//! # voxconnect
//!
//! The remote-control subsystem: other devices running the official
//! client steer local playback over the service's "dealer" channel.
//!
//! - [`protocol`]: JSON frame parsing with a byte-level `type` scan,
//!   request key validation and reply framing.
//! - [`dealer`]: the WebSocket transport with ping/pong liveness and
//!   reconnect backoff.
//! - [`handler`]: maps command endpoints (`play`, `pause`, `seek_to`,
//!   shuffle/repeat flags, skips, transfers) onto the playback pipeline
//!   and answers every request.
//! - [`state`]: publishes local playback state back to the service with
//!   increasing sequence numbers and keepalives.

pub mod dealer;
pub mod handler;
pub mod protocol;
pub mod state;

pub use dealer::{DealerConfig, DealerError, DealerEvent, DealerHandle};
pub use handler::{ConnectCommandHandler, NoQueue, QueueNavigator};
pub use protocol::{DealerMessage, DealerNotification, DealerRequest, RequestKey};
pub use state::{
    HttpPutStateTransport, PutStateRequest, PutStateTransport, SpClientError, StatePublisher,
};
