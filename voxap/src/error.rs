//! Error taxonomy for the AP session layer.

use std::io;

use thiserror::Error;

/// Errors raised while establishing the encrypted channel.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("server signature verification failed")]
    ServerVerificationFailed,

    #[error("network error: {0}")]
    NetworkError(#[from] io::Error),

    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// Errors raised by the framed codec and the session transport.
#[derive(Error, Debug)]
pub enum ApError {
    #[error("packet MAC verification failed")]
    MacFailure,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("authentication rejected: {0}")]
    AuthFailure(Login5Error),

    #[error("session closed")]
    SessionClosed,

    #[error("session timed out waiting for the access point")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by the audio key manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioKeyError {
    #[error("session is not connected")]
    NotConnected,

    #[error("access point refused the key (code {0})")]
    KeyError(u16),

    #[error("malformed key response")]
    MalformedResponse,

    #[error("unexpected packet for key exchange")]
    UnexpectedPacket,

    #[error("key request timed out")]
    Timeout,

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Login service failure classification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Login5Error {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("bad request")]
    BadRequest,

    #[error("unsupported protocol version")]
    UnsupportedProtocol,

    #[error("login timed out")]
    Timeout,

    #[error("unknown identifier")]
    UnknownIdentifier,

    #[error("too many attempts")]
    TooManyAttempts,

    #[error("invalid phone number")]
    InvalidPhoneNumber,

    #[error("service busy, try again later")]
    TryAgainLater,

    #[error("unknown login failure (code {0})")]
    Unknown(i32),
}

impl Login5Error {
    /// Maps the numeric error code carried by a login-failure packet.
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => Login5Error::BadRequest,
            5 => Login5Error::UnsupportedProtocol,
            9 => Login5Error::TooManyAttempts,
            12 => Login5Error::InvalidCredentials,
            13 => Login5Error::UnknownIdentifier,
            14 => Login5Error::InvalidPhoneNumber,
            16 => Login5Error::TryAgainLater,
            17 => Login5Error::Timeout,
            other => Login5Error::Unknown(other),
        }
    }
}
