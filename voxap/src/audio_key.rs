//! # Audio key manager
//!
//! Every encrypted audio object is unlocked by a 16-byte AES key fetched
//! over the AP channel. Requests and responses are correlated by a
//! monotonic 32-bit sequence number; the manager retries slow requests on a
//! fixed schedule and keeps resolved keys for the life of the session.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use voxid::{EntityId, FileId};

use crate::{codec::ApPacket, error::AudioKeyError, session};

/// A per-file AES-128 key.
pub type AudioKey = [u8; 16];

/// Delay before each attempt; five attempts total.
const ATTEMPT_DELAYS_MS: [u64; 5] = [0, 500, 1000, 2000, 3000];

/// How long a single attempt waits for its response.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

type PendingMap = HashMap<u32, (oneshot::Sender<Result<AudioKey, AudioKeyError>>, FileId)>;

/// Correlates audio-key requests with their AP responses.
pub struct AudioKeyManager {
    outbound: mpsc::Sender<ApPacket>,
    cancel: CancellationToken,
    seq: AtomicU32,
    pending: Mutex<PendingMap>,
    cache: Mutex<HashMap<FileId, AudioKey>>,
}

impl AudioKeyManager {
    pub(crate) fn new(outbound: mpsc::Sender<ApPacket>, cancel: CancellationToken) -> Self {
        Self {
            outbound,
            cancel,
            seq: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches the AES key for `(track, file)`, retrying on timeouts.
    ///
    /// Up to five attempts are made, each with a fresh sequence number and a
    /// three second response window. A key refusal from the access point is
    /// final and is not retried.
    pub async fn request(
        &self,
        track: &EntityId,
        file: &FileId,
    ) -> Result<AudioKey, AudioKeyError> {
        if file.is_empty() {
            return Err(AudioKeyError::InternalError(
                "cannot request a key for the empty file id".to_string(),
            ));
        }
        if let Some(key) = self.cache.lock().unwrap().get(file) {
            return Ok(*key);
        }

        for delay_ms in ATTEMPT_DELAYS_MS {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            if self.cancel.is_cancelled() {
                return Err(AudioKeyError::NotConnected);
            }

            match self.attempt(track, file).await {
                Ok(key) => {
                    self.cache.lock().unwrap().insert(*file, key);
                    return Ok(key);
                }
                Err(AudioKeyError::Timeout) => {
                    debug!(file = %file, "audio key attempt timed out, retrying");
                    continue;
                }
                Err(other) => return Err(other),
            }
        }

        Err(AudioKeyError::Timeout)
    }

    async fn attempt(&self, track: &EntityId, file: &FileId) -> Result<AudioKey, AudioKeyError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(seq, (tx, *file));

        let mut payload = Vec::with_capacity(20 + 16 + 4 + 2);
        payload.extend_from_slice(file.as_bytes());
        payload.extend_from_slice(track.as_bytes());
        payload.extend_from_slice(&seq.to_be_bytes());
        payload.extend_from_slice(&[0, 0]);

        if self
            .outbound
            .send(ApPacket::new(session::CMD_REQUEST_KEY, payload))
            .await
            .is_err()
        {
            self.pending.lock().unwrap().remove(&seq);
            return Err(AudioKeyError::NotConnected);
        }

        let result = tokio::select! {
            outcome = tokio::time::timeout(ATTEMPT_TIMEOUT, rx) => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(AudioKeyError::NotConnected),
                Err(_) => Err(AudioKeyError::Timeout),
            },
            _ = self.cancel.cancelled() => Err(AudioKeyError::NotConnected),
        };

        if result.is_err() {
            self.pending.lock().unwrap().remove(&seq);
        }
        result
    }

    /// Routes an `AES_KEY` / `AES_KEY_ERROR` packet from the read loop.
    ///
    /// Both payloads start with the 4-byte big-endian sequence of the
    /// request they answer.
    pub(crate) fn dispatch(&self, packet: &ApPacket) {
        if packet.payload.len() < 4 {
            warn!("audio key response too short: {} bytes", packet.payload.len());
            return;
        }
        let seq = u32::from_be_bytes(packet.payload[..4].try_into().unwrap());

        let entry = self.pending.lock().unwrap().remove(&seq);
        let Some((tx, file)) = entry else {
            warn!(seq, "audio key response for an unknown request");
            return;
        };

        let body = &packet.payload[4..];
        let result = match packet.cmd {
            session::CMD_AES_KEY => {
                if body.len() == 16 {
                    let mut key = [0u8; 16];
                    key.copy_from_slice(body);
                    Ok(key)
                } else {
                    warn!(file = %file, "malformed audio key payload");
                    Err(AudioKeyError::MalformedResponse)
                }
            }
            session::CMD_AES_KEY_ERROR => {
                if body.len() == 2 {
                    let code = u16::from_be_bytes([body[0], body[1]]);
                    Err(AudioKeyError::KeyError(code))
                } else {
                    Err(AudioKeyError::MalformedResponse)
                }
            }
            _ => Err(AudioKeyError::UnexpectedPacket),
        };

        let _ = tx.send(result);
    }

    /// Fails every in-flight request; called on session shutdown.
    pub(crate) fn cancel_all(&self) {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_, (tx, _)) in pending {
            let _ = tx.send(Err(AudioKeyError::NotConnected));
        }
    }

    /// Number of cached keys.
    pub fn cached_keys(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxid::ItemType;

    fn ids() -> (EntityId, FileId) {
        (
            EntityId::from_raw([1u8; 16], ItemType::Track),
            FileId::from_raw([2u8; 20]),
        )
    }

    fn manager() -> (AudioKeyManager, mpsc::Receiver<ApPacket>) {
        let (tx, rx) = mpsc::channel(8);
        (AudioKeyManager::new(tx, CancellationToken::new()), rx)
    }

    #[tokio::test]
    async fn resolves_key_and_caches_it() {
        let (manager, mut rx) = manager();
        let (track, file) = ids();

        let request = tokio::spawn(async move {
            let sent = rx.recv().await.unwrap();
            assert_eq!(sent.cmd, session::CMD_REQUEST_KEY);
            assert_eq!(&sent.payload[..20], &[2u8; 20]);
            assert_eq!(&sent.payload[20..36], &[1u8; 16]);
            assert_eq!(&sent.payload[40..42], &[0, 0]);
            sent.payload[36..40].to_vec()
        });

        // Answer with the sequence echoed back plus a key.
        let manager = std::sync::Arc::new(manager);
        let responder = manager.clone();
        let answer = tokio::spawn(async move {
            let seq = request.await.unwrap();
            let mut payload = seq;
            payload.extend_from_slice(&[9u8; 16]);
            responder.dispatch(&ApPacket::new(session::CMD_AES_KEY, payload));
        });

        let key = manager.request(&track, &file).await.unwrap();
        assert_eq!(key, [9u8; 16]);
        answer.await.unwrap();

        // Second request is served from the cache with no outbound traffic.
        assert_eq!(manager.cached_keys(), 1);
        let again = manager.request(&track, &file).await.unwrap();
        assert_eq!(again, key);
    }

    #[tokio::test]
    async fn key_refusal_is_not_retried() {
        let (manager, mut rx) = manager();
        let manager = std::sync::Arc::new(manager);
        let (track, file) = ids();

        let responder = manager.clone();
        tokio::spawn(async move {
            let sent = rx.recv().await.unwrap();
            let mut payload = sent.payload[36..40].to_vec();
            payload.extend_from_slice(&2u16.to_be_bytes());
            responder.dispatch(&ApPacket::new(session::CMD_AES_KEY_ERROR, payload));
            // Any further request would hang the test; refusals must not retry.
            assert!(rx.recv().await.is_none());
        });

        let err = manager.request(&track, &file).await.unwrap_err();
        assert_eq!(err, AudioKeyError::KeyError(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_then_times_out() {
        let (manager, mut rx) = manager();
        let (track, file) = ids();

        let collector = tokio::spawn(async move {
            let mut seen = 0;
            while rx.recv().await.is_some() {
                seen += 1;
            }
            seen
        });

        let err = manager.request(&track, &file).await.unwrap_err();
        assert_eq!(err, AudioKeyError::Timeout);

        drop(manager);
        assert_eq!(collector.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn empty_file_id_is_rejected() {
        let (manager, _rx) = manager();
        let (track, _) = ids();
        let err = manager.request(&track, &FileId::EMPTY).await.unwrap_err();
        assert!(matches!(err, AudioKeyError::InternalError(_)));
    }

    #[tokio::test]
    async fn shutdown_fails_pending_requests() {
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let manager = std::sync::Arc::new(AudioKeyManager::new(tx, cancel.clone()));
        let (track, file) = ids();

        let requester = manager.clone();
        let handle =
            tokio::spawn(async move { requester.request(&track, &file).await });

        tokio::task::yield_now().await;
        cancel.cancel();
        manager.cancel_all();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err, AudioKeyError::NotConnected);
    }
}
