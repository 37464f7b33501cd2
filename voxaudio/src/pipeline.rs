//! # Playback pipeline
//!
//! Orchestrates source → decoder → processing chain → sink for one track
//! at a time. Commands (`play`, `pause`, `resume`, `seek`, flag updates,
//! `stop`, `dispose`) serialize on a single lock with a bounded wait;
//! reading the current state never takes that lock.
//!
//! The decode loop runs on a blocking task feeding a bounded buffer queue,
//! so sink backpressure propagates naturally back into the decoder. State
//! is broadcast over a last-value channel: every subscriber sees the
//! current state on attach, every broadcast carries a strictly increasing
//! timestamp, and the `playback_id` changes with each new playing session.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    decoder::{pcm::PcmDecoder, AudioDecoder, DecoderRegistry, DecoderSource},
    error::{DecodeError, PipelineError},
    processing::{
        EqBand, EqualizerProcessor, NormalizationProcessor, ProcessingChain, VolumeControl,
        VolumeProcessor,
    },
    sink::AudioSink,
    source::{LoadedTrack, SourceRegistry},
};

/// A `play` command resolved against the source registry.
#[derive(Debug, Clone)]
pub struct PlayCommand {
    pub track_uri: String,
    pub track_uid: Option<String>,
    pub context_uri: Option<String>,
    pub position_ms: u64,
}

impl PlayCommand {
    pub fn new(track_uri: impl Into<String>) -> Self {
        Self {
            track_uri: track_uri.into(),
            track_uid: None,
            context_uri: None,
            position_ms: 0,
        }
    }

    pub fn at(mut self, position_ms: u64) -> Self {
        self.position_ms = position_ms;
        self
    }
}

/// Broadcast playback state. Exactly one of playing / paused / stopped
/// (both flags false) holds at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackState {
    pub track_uri: Option<String>,
    pub track_uid: Option<String>,
    pub context_uri: Option<String>,
    pub is_playing: bool,
    pub is_paused: bool,
    pub position_ms: u64,
    pub duration_ms: Option<u64>,
    pub shuffling: bool,
    pub repeating_track: bool,
    pub repeating_context: bool,
    pub timestamp_unix_ms: u64,
    pub playback_id: u64,
}

impl PlaybackState {
    fn initial() -> Self {
        Self {
            track_uri: None,
            track_uid: None,
            context_uri: None,
            is_playing: false,
            is_paused: false,
            position_ms: 0,
            duration_ms: None,
            shuffling: false,
            repeating_track: false,
            repeating_context: false,
            timestamp_unix_ms: 0,
            playback_id: 0,
        }
    }

    pub fn is_stopped(&self) -> bool {
        !self.is_playing && !self.is_paused
    }
}

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub command_timeout: Duration,
    pub sink_buffer_ms: u32,
    /// Minimum interval between sink position samples.
    pub position_interval: Duration,
    /// Depth of the decoder → sink buffer queue.
    pub queue_depth: usize,
    pub eq_bands: Vec<EqBand>,
    pub eq_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            sink_buffer_ms: 100,
            position_interval: Duration::from_millis(250),
            queue_depth: 4,
            eq_bands: Vec::new(),
            eq_enabled: false,
        }
    }
}

/// Gate the playback loop parks on while paused.
#[derive(Clone)]
struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    fn pause(&self) {
        self.tx.send_replace(true);
    }

    fn resume(&self) {
        self.tx.send_replace(false);
    }

    async fn wait_resumed(&self, cancel: &CancellationToken) {
        let mut rx = self.tx.subscribe();
        loop {
            if !*rx.borrow() {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

struct ActivePlayback {
    cancel: CancellationToken,
    abort: tokio::task::AbortHandle,
    handle: tokio::task::JoinHandle<()>,
    pause: PauseGate,
    track: LoadedTrack,
}

struct Flags {
    shuffling: AtomicBool,
    repeating_track: AtomicBool,
    repeating_context: AtomicBool,
}

struct PipelineShared {
    sources: Arc<SourceRegistry>,
    registry: Arc<DecoderRegistry>,
    sink: Arc<dyn AudioSink>,
    config: PipelineConfig,
    volume: VolumeControl,
    command_lock: tokio::sync::Mutex<()>,
    current: Mutex<PlaybackState>,
    state_tx: Mutex<Option<watch::Sender<PlaybackState>>>,
    state_rx: watch::Receiver<PlaybackState>,
    active: Mutex<Option<ActivePlayback>>,
    flags: Flags,
    /// Track-time offset of the running sink session.
    session_start: AtomicU64,
    playback_seq: AtomicU64,
    last_timestamp: AtomicU64,
    disposed: AtomicBool,
}

/// One playback pipeline instance. Cloning shares the instance.
#[derive(Clone)]
pub struct PlaybackPipeline {
    shared: Arc<PipelineShared>,
}

impl PlaybackPipeline {
    pub fn new(
        sources: Arc<SourceRegistry>,
        registry: Arc<DecoderRegistry>,
        sink: Arc<dyn AudioSink>,
        config: PipelineConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(PlaybackState::initial());
        Self {
            shared: Arc::new(PipelineShared {
                sources,
                registry,
                sink,
                config,
                volume: VolumeControl::default(),
                command_lock: tokio::sync::Mutex::new(()),
                current: Mutex::new(PlaybackState::initial()),
                state_tx: Mutex::new(Some(state_tx)),
                state_rx,
                active: Mutex::new(None),
                flags: Flags {
                    shuffling: AtomicBool::new(false),
                    repeating_track: AtomicBool::new(false),
                    repeating_context: AtomicBool::new(false),
                },
                session_start: AtomicU64::new(0),
                playback_seq: AtomicU64::new(0),
                last_timestamp: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Current state, readable without the command lock.
    pub fn current_state(&self) -> PlaybackState {
        self.shared.current.lock().unwrap().clone()
    }

    /// Replaying state stream: the latest value on attach, then updates.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.shared.state_rx.clone()
    }

    pub fn volume(&self) -> &VolumeControl {
        &self.shared.volume
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.volume.set(volume);
    }

    async fn lock_commands(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, ()>, PipelineError> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(PipelineError::Disposed);
        }
        tokio::time::timeout(
            self.shared.config.command_timeout,
            self.shared.command_lock.lock(),
        )
        .await
        .map_err(|_| PipelineError::CommandTimeout)
    }

    /// Starts (or restarts) playback of a track.
    ///
    /// Any active playback is cancelled first; the `Playing` state is
    /// broadcast as soon as the loop task is started.
    pub async fn play(&self, cmd: PlayCommand) -> Result<(), PipelineError> {
        if cmd.track_uri.is_empty() {
            return Err(PipelineError::InvalidArgument(
                "track_uri must not be empty".to_string(),
            ));
        }
        let _guard = self.lock_commands().await?;
        cancel_active(&self.shared).await;

        let source = self
            .shared
            .sources
            .find(&cmd.track_uri)
            .ok_or_else(|| PipelineError::TrackNotFound(cmd.track_uri.clone()))?;
        let track = source
            .load(&cmd.track_uri)
            .await
            .map_err(|e| PipelineError::LoadFailed(e.to_string()))?;

        let playback_id = self.shared.playback_seq.fetch_add(1, Ordering::SeqCst) + 1;
        info!(uri = %cmd.track_uri, playback_id, "starting playback");
        start_locked(
            &self.shared,
            track,
            cmd.position_ms,
            playback_id,
            Some((cmd.track_uid, cmd.context_uri)),
        )
        .await
    }

    /// Pauses playback; the last sampled position is retained.
    pub async fn pause(&self) -> Result<(), PipelineError> {
        let _guard = self.lock_commands().await?;
        let gate = {
            let active = self.shared.active.lock().unwrap();
            active.as_ref().map(|a| a.pause.clone())
        };
        let Some(gate) = gate else {
            debug!("pause with no active playback");
            return Ok(());
        };

        gate.pause();
        self.shared.sink.pause().await;
        let position = sampled_position(&self.shared);
        broadcast(&self.shared, |s| {
            s.is_playing = false;
            s.is_paused = true;
            s.position_ms = position;
        });
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), PipelineError> {
        let _guard = self.lock_commands().await?;
        let gate = {
            let active = self.shared.active.lock().unwrap();
            active.as_ref().map(|a| a.pause.clone())
        };
        let Some(gate) = gate else {
            debug!("resume with no active playback");
            return Ok(());
        };

        self.shared.sink.resume().await;
        gate.resume();
        broadcast(&self.shared, |s| {
            s.is_playing = true;
            s.is_paused = false;
        });
        Ok(())
    }

    /// Seeks within the current track by reopening the decoder.
    ///
    /// Playback continues in `Playing` regardless of a previous pause; a
    /// seek while stopped is rejected.
    pub async fn seek(&self, position_ms: u64) -> Result<(), PipelineError> {
        let _guard = self.lock_commands().await?;
        if self.current_state().is_stopped() {
            return Err(PipelineError::SeekRejected);
        }

        let Some(track) = cancel_active(&self.shared).await else {
            return Err(PipelineError::SeekRejected);
        };
        let playback_id = self.current_state().playback_id;
        debug!(position_ms, "seeking");
        start_locked(&self.shared, track, position_ms, playback_id, None).await
    }

    pub async fn set_shuffle(&self, on: bool) -> Result<(), PipelineError> {
        let _guard = self.lock_commands().await?;
        self.shared.flags.shuffling.store(on, Ordering::SeqCst);
        broadcast(&self.shared, |s| s.shuffling = on);
        Ok(())
    }

    pub async fn set_repeat_track(&self, on: bool) -> Result<(), PipelineError> {
        let _guard = self.lock_commands().await?;
        self.shared
            .flags
            .repeating_track
            .store(on, Ordering::SeqCst);
        broadcast(&self.shared, |s| s.repeating_track = on);
        Ok(())
    }

    pub async fn set_repeat_context(&self, on: bool) -> Result<(), PipelineError> {
        let _guard = self.lock_commands().await?;
        self.shared
            .flags
            .repeating_context
            .store(on, Ordering::SeqCst);
        broadcast(&self.shared, |s| s.repeating_context = on);
        Ok(())
    }

    /// Stops playback and broadcasts the stopped state.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let _guard = self.lock_commands().await?;
        if cancel_active(&self.shared).await.is_some() {
            broadcast(&self.shared, |s| {
                s.is_playing = false;
                s.is_paused = false;
            });
        }
        Ok(())
    }

    /// Cancels playback, releases the sink and completes the state stream.
    /// Safe to call any number of times.
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("disposing playback pipeline");
        cancel_active(&self.shared).await;
        self.shared.sink.dispose().await;
        broadcast(&self.shared, |s| {
            s.is_playing = false;
            s.is_paused = false;
        });
        // Dropping the sender completes every subscriber.
        self.shared.state_tx.lock().unwrap().take();
    }
}

async fn start_locked(
    shared: &Arc<PipelineShared>,
    track: LoadedTrack,
    position_ms: u64,
    playback_id: u64,
    identity: Option<(Option<String>, Option<String>)>,
) -> Result<(), PipelineError> {
    if position_ms > 0 {
        track.stream.prefetch_for_seek(position_ms);
    }

    let decoder = open_decoder(shared, &track, position_ms).await?;
    let format = decoder.format();

    let mut chain = ProcessingChain::new();
    chain.push(Box::new(NormalizationProcessor::new(
        track.metadata.replaygain,
    )));
    chain.push(Box::new(VolumeProcessor::new(shared.volume.clone())));
    chain.push(Box::new(EqualizerProcessor::new(
        shared.config.eq_bands.clone(),
        shared.config.eq_enabled,
    )));
    chain.init(&format);

    shared
        .sink
        .init(format, shared.config.sink_buffer_ms)
        .await?;
    shared.session_start.store(position_ms, Ordering::SeqCst);

    let cancel = CancellationToken::new();
    let pause = PauseGate::new();

    let uri = track.metadata.uri.clone();
    let duration = track.metadata.duration_ms;
    broadcast(shared, |s| {
        s.track_uri = Some(uri);
        if let Some((uid, context)) = identity {
            s.track_uid = uid;
            s.context_uri = context;
        }
        s.is_playing = true;
        s.is_paused = false;
        s.position_ms = position_ms;
        s.duration_ms = duration;
        s.playback_id = playback_id;
    });

    let handle = tokio::spawn(playback_task(
        shared.clone(),
        decoder,
        chain,
        track.clone(),
        cancel.clone(),
        pause.clone(),
    ));
    *shared.active.lock().unwrap() = Some(ActivePlayback {
        cancel,
        abort: handle.abort_handle(),
        handle,
        pause,
        track,
    });

    // A disposal racing a command must not leave a fresh loop running.
    if shared.disposed.load(Ordering::SeqCst) {
        if let Some(active) = shared.active.lock().unwrap().take() {
            active.cancel.cancel();
        }
        return Err(PipelineError::Disposed);
    }
    Ok(())
}

/// Cancels the running loop task and returns its track for reuse.
async fn cancel_active(shared: &Arc<PipelineShared>) -> Option<LoadedTrack> {
    let active = shared.active.lock().unwrap().take()?;
    active.cancel.cancel();
    // Unpark a paused loop so it can observe the cancellation.
    active.pause.resume();

    if tokio::time::timeout(shared.config.command_timeout, active.handle)
        .await
        .is_err()
    {
        warn!("playback loop did not stop in time, aborting it");
        active.abort.abort();
    }
    Some(active.track)
}

/// Opens the right decoder for a track, off the async threads.
async fn open_decoder(
    shared: &Arc<PipelineShared>,
    track: &LoadedTrack,
    position_ms: u64,
) -> Result<Box<dyn AudioDecoder>, PipelineError> {
    let stream = track.stream.clone();
    let registry = shared.registry.clone();
    let known_format = track.known_format;

    let opened = tokio::task::spawn_blocking(move || -> Result<Box<dyn AudioDecoder>, DecodeError> {
        let media = stream.open()?;
        match known_format {
            Some(format) => Ok(Box::new(PcmDecoder::new(
                DecoderSource::Seekable(media),
                format,
                position_ms,
            )?)),
            None => registry.open(media, position_ms),
        }
    })
    .await
    .map_err(|e| PipelineError::LoadFailed(format!("decoder task panicked: {e}")))?;

    Ok(opened?)
}

enum LoopEnd {
    Cancelled,
    EndOfStream,
    Failed,
}

async fn playback_task(
    shared: Arc<PipelineShared>,
    decoder: Box<dyn AudioDecoder>,
    mut chain: ProcessingChain,
    track: LoadedTrack,
    cancel: CancellationToken,
    pause: PauseGate,
) {
    let mut current = decoder;

    loop {
        let end = run_session(&shared, current, &mut chain, &cancel, &pause).await;

        match end {
            LoopEnd::Cancelled => return,
            LoopEnd::Failed => {
                finish_stopped(&shared).await;
                return;
            }
            LoopEnd::EndOfStream => {
                if shared.flags.repeating_track.load(Ordering::SeqCst)
                    && !cancel.is_cancelled()
                {
                    debug!("end of stream, repeating track");
                    chain.reset();
                    match open_decoder(&shared, &track, 0).await {
                        Ok(next) => {
                            shared.sink.flush().await;
                            if shared
                                .sink
                                .init(next.format(), shared.config.sink_buffer_ms)
                                .await
                                .is_err()
                            {
                                finish_stopped(&shared).await;
                                return;
                            }
                            shared.session_start.store(0, Ordering::SeqCst);
                            broadcast(&shared, |s| {
                                s.is_playing = true;
                                s.is_paused = false;
                                s.position_ms = 0;
                            });
                            current = next;
                            continue;
                        }
                        Err(e) => {
                            error!("repeat reopen failed: {e}");
                            finish_stopped(&shared).await;
                            return;
                        }
                    }
                }
                finish_stopped(&shared).await;
                return;
            }
        }
    }
}

/// Runs one decode-process-write session until cancel, EOS or failure.
async fn run_session(
    shared: &Arc<PipelineShared>,
    decoder: Box<dyn AudioDecoder>,
    chain: &mut ProcessingChain,
    cancel: &CancellationToken,
    pause: &PauseGate,
) -> LoopEnd {
    let (buffer_tx, mut buffer_rx) =
        mpsc::channel::<Result<crate::format::AudioBuffer, DecodeError>>(
            shared.config.queue_depth.max(1),
        );

    let producer_cancel = cancel.clone();
    let mut decoder = decoder;
    let producer = tokio::task::spawn_blocking(move || {
        loop {
            if producer_cancel.is_cancelled() {
                return;
            }
            match decoder.next_buffer() {
                Ok(Some(buffer)) => {
                    if buffer_tx.blocking_send(Ok(buffer)).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    let _ = buffer_tx.blocking_send(Err(e));
                    return;
                }
            }
        }
    });

    let mut last_sample = Instant::now();
    let end = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break LoopEnd::Cancelled,
            next = buffer_rx.recv() => next,
        };
        let Some(result) = next else {
            break LoopEnd::EndOfStream;
        };
        let buffer = match result {
            Ok(buffer) => buffer,
            Err(e) => {
                error!("decoder failed mid-track: {e}");
                break LoopEnd::Failed;
            }
        };

        pause.wait_resumed(cancel).await;
        if cancel.is_cancelled() {
            break LoopEnd::Cancelled;
        }

        let processed = chain.process(buffer);
        if !processed.is_empty() {
            let written = tokio::select! {
                _ = cancel.cancelled() => break LoopEnd::Cancelled,
                written = shared.sink.write(&processed.data) => written,
            };
            if let Err(e) = written {
                warn!("sink rejected audio: {e}");
                break LoopEnd::Failed;
            }
        }

        if last_sample.elapsed() >= shared.config.position_interval {
            last_sample = Instant::now();
            let position = sampled_position(shared);
            let changed = shared.current.lock().unwrap().position_ms != position;
            if changed {
                broadcast(shared, |s| s.position_ms = position);
            }
        }
    };

    drop(buffer_rx);
    let _ = producer.await;
    end
}

/// Track position derived from the sink, clamped to the known duration.
fn sampled_position(shared: &Arc<PipelineShared>) -> u64 {
    let status = shared.sink.status();
    let position = shared.session_start.load(Ordering::SeqCst) + status.position_ms;
    match shared.current.lock().unwrap().duration_ms {
        Some(duration) => position.min(duration),
        None => position,
    }
}

async fn finish_stopped(shared: &Arc<PipelineShared>) {
    shared.sink.flush().await;
    let position = sampled_position(shared);
    broadcast(shared, |s| {
        s.is_playing = false;
        s.is_paused = false;
        s.position_ms = position;
    });
    shared.active.lock().unwrap().take();
}

/// Applies `update` to the current state and broadcasts the new value with
/// a strictly increasing timestamp.
fn broadcast<F: FnOnce(&mut PlaybackState)>(shared: &Arc<PipelineShared>, update: F) {
    let snapshot = {
        let mut current = shared.current.lock().unwrap();
        update(&mut current);
        current.timestamp_unix_ms = next_timestamp(shared);
        current.clone()
    };
    if let Some(tx) = shared.state_tx.lock().unwrap().as_ref() {
        let _ = tx.send(snapshot);
    }
}

/// Wall-clock milliseconds, bumped to stay strictly increasing.
fn next_timestamp(shared: &Arc<PipelineShared>) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut last = shared.last_timestamp.load(Ordering::SeqCst);
    loop {
        let candidate = now.max(last + 1);
        match shared.last_timestamp.compare_exchange(
            last,
            candidate,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}
