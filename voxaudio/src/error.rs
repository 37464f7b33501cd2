//! Error types for decoding, sinks and the pipeline.

use std::io;

use thiserror::Error;

/// Errors from decoder sniffing and PCM production.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unknown or unsupported audio format")]
    UnknownFormat,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Errors from an audio sink implementation.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink has been disposed")]
    Disposed,

    #[error("sink does not support the format: {0}")]
    Unsupported(String),

    #[error("sink backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by pipeline commands.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("pipeline has been disposed")]
    Disposed,

    #[error("timed out waiting for the command lock")]
    CommandTimeout,

    #[error("no source can handle {0}")]
    TrackNotFound(String),

    #[error("failed to load track: {0}")]
    LoadFailed(String),

    #[error("seek rejected while stopped")]
    SeekRejected,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}
