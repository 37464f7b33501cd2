use thiserror::Error;

/// Errors produced while parsing or encoding identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("unknown URI scheme: {0}")]
    UnknownScheme(String),

    #[error("unknown item type: {0}")]
    UnknownItemType(String),

    #[error("malformed URI: {0}")]
    MalformedUri(String),

    #[error("invalid base62 character: {0:?}")]
    InvalidBase62(char),

    #[error("invalid base16 character: {0:?}")]
    InvalidBase16(char),

    #[error("invalid identifier length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("destination buffer too small: need {need}, got {got}")]
    BufferTooSmall { need: usize, got: usize },
}
