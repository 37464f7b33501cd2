//! # State publisher
//!
//! Mirrors local playback state to the service's device graph. A
//! publication goes out on every state change and at least every 30
//! seconds as a keepalive. Each request carries a strictly increasing
//! client timestamp and an incrementing sequence number; acknowledgements
//! arriving out of order are ignored.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxaudio::PlaybackState;

/// REST failures from the state endpoint.
#[derive(Error, Debug)]
pub enum SpClientError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("endpoint not found")]
    NotFound,

    #[error("rate limited")]
    RateLimited,

    #[error("server error (status {0})")]
    ServerError(u16),
}

/// Wire form of one state publication.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PutStateRequest {
    pub seq_num: u64,
    pub client_timestamp_ms: u64,
    pub is_active: bool,
    pub player_state: PlayerState,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlayerState {
    pub track_uri: Option<String>,
    pub track_uid: Option<String>,
    pub context_uri: Option<String>,
    pub is_playing: bool,
    pub is_paused: bool,
    pub position_ms: u64,
    pub duration_ms: Option<u64>,
    pub shuffling_context: bool,
    pub repeating_track: bool,
    pub repeating_context: bool,
    pub timestamp_ms: u64,
    pub playback_id: u64,
}

impl From<&PlaybackState> for PlayerState {
    fn from(state: &PlaybackState) -> Self {
        Self {
            track_uri: state.track_uri.clone(),
            track_uid: state.track_uid.clone(),
            context_uri: state.context_uri.clone(),
            is_playing: state.is_playing,
            is_paused: state.is_paused,
            position_ms: state.position_ms,
            duration_ms: state.duration_ms,
            shuffling_context: state.shuffling,
            repeating_track: state.repeating_track,
            repeating_context: state.repeating_context,
            timestamp_ms: state.timestamp_unix_ms,
            playback_id: state.playback_id,
        }
    }
}

/// Where publications go; the answer is the acknowledged sequence number.
#[async_trait]
pub trait PutStateTransport: Send + Sync {
    async fn put_state(&self, request: &PutStateRequest) -> Result<u64, SpClientError>;
}

/// HTTP PUT transport against the service's connect-state endpoint.
pub struct HttpPutStateTransport {
    client: reqwest::Client,
    url: String,
    bearer_token: String,
}

impl HttpPutStateTransport {
    pub fn new(url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            bearer_token: bearer_token.into(),
        }
    }
}

#[async_trait]
impl PutStateTransport for HttpPutStateTransport {
    async fn put_state(&self, request: &PutStateRequest) -> Result<u64, SpClientError> {
        let response = self
            .client
            .put(&self.url)
            .bearer_auth(&self.bearer_token)
            .json(request)
            .send()
            .await
            .map_err(|e| SpClientError::RequestFailed(e.to_string()))?;

        match response.status().as_u16() {
            200..=299 => Ok(request.seq_num),
            401 | 403 => Err(SpClientError::Unauthorized),
            404 => Err(SpClientError::NotFound),
            429 => Err(SpClientError::RateLimited),
            status if status >= 500 => Err(SpClientError::ServerError(status)),
            status => Err(SpClientError::RequestFailed(format!("status {status}"))),
        }
    }
}

/// Interval of the keepalive publication.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Publishes pipeline state changes plus periodic keepalives.
pub struct StatePublisher {
    transport: Arc<dyn PutStateTransport>,
    keepalive: Duration,
    seq: AtomicU64,
    last_timestamp: AtomicU64,
    last_ack: AtomicU64,
}

impl StatePublisher {
    pub fn new(transport: Arc<dyn PutStateTransport>) -> Self {
        Self::with_keepalive(transport, KEEPALIVE_INTERVAL)
    }

    pub fn with_keepalive(transport: Arc<dyn PutStateTransport>, keepalive: Duration) -> Self {
        Self {
            transport,
            keepalive,
            seq: AtomicU64::new(0),
            last_timestamp: AtomicU64::new(0),
            last_ack: AtomicU64::new(0),
        }
    }

    /// Highest acknowledged sequence seen so far.
    pub fn acked_seq(&self) -> u64 {
        self.last_ack.load(Ordering::SeqCst)
    }

    fn next_timestamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut last = self.last_timestamp.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last + 1);
            match self.last_timestamp.compare_exchange(
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

    /// Builds and sends one publication for `state`.
    pub async fn publish(&self, state: &PlaybackState) {
        let request = PutStateRequest {
            seq_num: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            client_timestamp_ms: self.next_timestamp(),
            is_active: !state.is_stopped(),
            player_state: PlayerState::from(state),
        };

        match self.transport.put_state(&request).await {
            Ok(acked) => {
                // Stale acknowledgements are ignored.
                let previous = self.last_ack.fetch_max(acked, Ordering::SeqCst);
                if acked < previous {
                    debug!(acked, previous, "ignoring out-of-order state ack");
                }
            }
            Err(e) => warn!(seq = request.seq_num, "state publication failed: {e}"),
        }
    }

    /// Publishes every state change and a keepalive on silence.
    pub fn spawn(
        self: Arc<Self>,
        mut states: watch::Receiver<PlaybackState>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let state = states.borrow().clone();
                self.publish(&state).await;

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = states.changed() => {
                        if changed.is_err() {
                            // Pipeline disposed; publish the final state once.
                            let state = states.borrow().clone();
                            self.publish(&state).await;
                            return;
                        }
                    }
                    _ = tokio::time::sleep(self.keepalive) => {
                        debug!("state keepalive");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingTransport {
        requests: Mutex<Vec<PutStateRequest>>,
        acks: Mutex<Vec<u64>>,
    }

    impl RecordingTransport {
        fn new(acks: Vec<u64>) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                acks: Mutex::new(acks),
            }
        }
    }

    #[async_trait]
    impl PutStateTransport for RecordingTransport {
        async fn put_state(&self, request: &PutStateRequest) -> Result<u64, SpClientError> {
            self.requests.lock().unwrap().push(request.clone());
            let mut acks = self.acks.lock().unwrap();
            Ok(if acks.is_empty() {
                request.seq_num
            } else {
                acks.remove(0)
            })
        }
    }

    fn playing_state() -> PlaybackState {
        PlaybackState {
            track_uri: Some("vox:track:0000000000000000000000".to_string()),
            track_uid: None,
            context_uri: None,
            is_playing: true,
            is_paused: false,
            position_ms: 0,
            duration_ms: Some(10_000),
            shuffling: false,
            repeating_track: false,
            repeating_context: false,
            timestamp_unix_ms: 1,
            playback_id: 1,
        }
    }

    #[tokio::test]
    async fn publications_carry_increasing_seq_and_timestamps() {
        let transport = Arc::new(RecordingTransport::new(Vec::new()));
        let publisher = StatePublisher::new(transport.clone());

        let state = playing_state();
        publisher.publish(&state).await;
        publisher.publish(&state).await;
        publisher.publish(&state).await;

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        for pair in requests.windows(2) {
            assert!(pair[1].seq_num == pair[0].seq_num + 1);
            assert!(pair[1].client_timestamp_ms > pair[0].client_timestamp_ms);
        }
        assert!(requests[0].is_active);
    }

    #[tokio::test]
    async fn out_of_order_acks_are_ignored() {
        let transport = Arc::new(RecordingTransport::new(vec![5, 3, 9]));
        let publisher = StatePublisher::new(transport);

        let state = playing_state();
        publisher.publish(&state).await;
        assert_eq!(publisher.acked_seq(), 5);
        publisher.publish(&state).await;
        // The stale ack of 3 does not regress the high-water mark.
        assert_eq!(publisher.acked_seq(), 5);
        publisher.publish(&state).await;
        assert_eq!(publisher.acked_seq(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_publishes_on_silence() {
        let transport = Arc::new(RecordingTransport::new(Vec::new()));
        let publisher = Arc::new(StatePublisher::with_keepalive(
            transport.clone(),
            Duration::from_secs(30),
        ));

        let (tx, rx) = watch::channel(playing_state());
        let cancel = CancellationToken::new();
        let task = publisher.clone().spawn(rx, cancel.clone());

        // Initial publish plus two keepalives with no state change.
        tokio::time::sleep(Duration::from_secs(65)).await;
        cancel.cancel();
        let _ = task.await;
        drop(tx);

        let count = transport.requests.lock().unwrap().len();
        assert!(count >= 3, "expected keepalives, saw {count}");
    }
}
