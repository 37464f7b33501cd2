//! # Audio sink abstraction
//!
//! The sink is the pipeline's hand-off to the platform audio device. It
//! negotiates a format, accepts interleaved PCM writes under backpressure
//! (a write parks once more than twice the configured buffer is queued),
//! and reports a monotonically non-decreasing playback position derived
//! from frames actually consumed.
//!
//! [`StubSink`] consumes at the nominal sample rate without touching any
//! device; it backs the pipeline tests and headless runs.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{error::SinkError, format::AudioFormat};

/// Snapshot of sink playback state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStatus {
    pub position_ms: u64,
    pub buffered_ms: u64,
    pub is_playing: bool,
}

/// Platform audio output.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Prepares the device for a stream in `format` with roughly
    /// `buffer_ms` of device buffering.
    async fn init(&self, format: AudioFormat, buffer_ms: u32) -> Result<(), SinkError>;

    /// Queues interleaved PCM. Applies backpressure while more than
    /// `2 x buffer_ms` is already queued.
    async fn write(&self, pcm: &[u8]) -> Result<(), SinkError>;

    async fn pause(&self);

    async fn resume(&self);

    /// Discards queued audio.
    async fn flush(&self);

    fn status(&self) -> SinkStatus;

    /// Releases the device. Idempotent.
    async fn dispose(&self);
}

/// How often a backpressured write re-checks the queue.
const WRITE_RECHECK: Duration = Duration::from_millis(5);

struct StubState {
    format: Option<AudioFormat>,
    buffer_ms: u32,
    frames_written: u64,
    /// Frames consumed up to the last pause/init.
    consumed_frozen: u64,
    playing: bool,
    resumed_at: Instant,
    disposed: bool,
}

impl StubState {
    /// Frames consumed by the simulated device so far.
    fn consumed_frames(&self, now: Instant) -> u64 {
        let Some(format) = self.format else { return 0 };
        let mut consumed = self.consumed_frozen;
        if self.playing {
            let elapsed = now.saturating_duration_since(self.resumed_at);
            consumed += (elapsed.as_secs_f64() * format.sample_rate as f64) as u64;
        }
        consumed.min(self.frames_written)
    }
}

/// A sink that consumes PCM at the nominal rate of its format.
pub struct StubSink {
    state: Mutex<StubState>,
}

impl Default for StubSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StubSink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState {
                format: None,
                buffer_ms: 100,
                frames_written: 0,
                consumed_frozen: 0,
                playing: false,
                resumed_at: Instant::now(),
                disposed: false,
            }),
        }
    }
}

#[async_trait]
impl AudioSink for StubSink {
    async fn init(&self, format: AudioFormat, buffer_ms: u32) -> Result<(), SinkError> {
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(SinkError::Unsupported(format!("{format:?}")));
        }
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return Err(SinkError::Disposed);
        }
        state.format = Some(format);
        state.buffer_ms = buffer_ms;
        state.frames_written = 0;
        state.consumed_frozen = 0;
        state.playing = true;
        state.resumed_at = Instant::now();
        Ok(())
    }

    async fn write(&self, pcm: &[u8]) -> Result<(), SinkError> {
        let format = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return Err(SinkError::Disposed);
            }
            let format = state.format.ok_or(SinkError::Backend(
                "write before init".to_string(),
            ))?;
            let frame = format.bytes_per_frame() as u64;
            if frame > 0 {
                state.frames_written += pcm.len() as u64 / frame;
            }
            format
        };

        // Backpressure: park while more than two buffers are queued.
        loop {
            let over = {
                let state = self.state.lock().unwrap();
                if state.disposed {
                    return Err(SinkError::Disposed);
                }
                let queued = state.frames_written - state.consumed_frames(Instant::now());
                let queued_ms = queued * 1000 / format.sample_rate as u64;
                queued_ms > 2 * state.buffer_ms as u64
            };
            if !over {
                return Ok(());
            }
            tokio::time::sleep(WRITE_RECHECK).await;
        }
    }

    async fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        let consumed = state.consumed_frames(Instant::now());
        state.consumed_frozen = consumed;
        state.playing = false;
    }

    async fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.playing {
            state.playing = true;
            state.resumed_at = Instant::now();
        }
    }

    async fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        state.consumed_frozen = state.frames_written;
        state.resumed_at = Instant::now();
    }

    fn status(&self) -> SinkStatus {
        let state = self.state.lock().unwrap();
        let Some(format) = state.format else {
            return SinkStatus::default();
        };
        let consumed = state.consumed_frames(Instant::now());
        SinkStatus {
            position_ms: consumed * 1000 / format.sample_rate as u64,
            buffered_ms: (state.frames_written - consumed) * 1000 / format.sample_rate as u64,
            is_playing: state.playing,
        }
    }

    async fn dispose(&self) {
        let mut state = self.state.lock().unwrap();
        state.disposed = true;
        state.playing = false;
    }
}
