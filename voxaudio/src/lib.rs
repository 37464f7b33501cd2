//! # voxaudio
//!
//! The audio half of the Vox streaming core: on-the-fly decryption of
//! downloaded objects, format detection and decoding to PCM, the
//! processing chain (normalization, volume, equalizer), the sink
//! abstraction and the playback pipeline that drives them.
//!
//! ## Data path
//!
//! ```text
//! encrypted bytes → AudioDecrypt → HeaderSkip → DecoderRegistry
//!     → AudioDecoder (PCM buffers) → ProcessingChain → AudioSink
//! ```
//!
//! The [`pipeline::PlaybackPipeline`] owns the path for one track at a
//! time, executes commands sequentially and broadcasts
//! [`pipeline::PlaybackState`] over a last-value channel.

pub mod decoder;
pub mod decrypt;
pub mod error;
pub mod format;
pub mod normalization;
pub mod pipeline;
pub mod processing;
pub mod sink;
pub mod source;

pub use decoder::{AudioDecoder, DecoderFactory, DecoderRegistry, MediaStream, MediaStreamBox};
pub use decrypt::{AudioDecrypt, HeaderSkip, AUDIO_HEADER_LEN, AUDIO_IV};
pub use error::{DecodeError, PipelineError, SinkError};
pub use format::{AudioBuffer, AudioFormat, TrackMetadata};
pub use normalization::NormalizationData;
pub use pipeline::{PipelineConfig, PlayCommand, PlaybackPipeline, PlaybackState};
pub use processing::{
    AudioProcessor, EqBand, EqualizerProcessor, NormalizationProcessor, ProcessingChain,
    VolumeControl, VolumeProcessor,
};
pub use sink::{AudioSink, SinkStatus, StubSink};
pub use source::{LoadedTrack, SourceRegistry, StubSource, TrackSource, TrackStream};
