//! # Dealer transport
//!
//! Maintains the JSON-over-WebSocket channel to the service. The
//! connection task parses inbound frames, answers `ping` immediately,
//! surfaces `message` / `request` frames as [`DealerEvent`]s and watches
//! liveness: with no inbound frame for twice the ping interval the
//! connection is declared dead and re-established with exponential
//! backoff (1 s doubling, capped at 60 s).
//!
//! Outbound frames (replies, device state) go through the handle's queue
//! and survive reconnects.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{
    parse_frame, pong_frame, reply_frame, DealerMessage, DealerNotification, DealerRequest,
    RequestKey,
};

#[derive(Error, Debug)]
pub enum DealerError {
    #[error("dealer transport is shut down")]
    Closed,
}

/// Transport tunables; defaults match the deployed service.
#[derive(Debug, Clone)]
pub struct DealerConfig {
    pub url: String,
    pub ping_interval: Duration,
    pub reconnect_cap: Duration,
}

impl DealerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: Duration::from_secs(30),
            reconnect_cap: Duration::from_secs(60),
        }
    }
}

/// Events surfaced to the command handler and subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum DealerEvent {
    Connected,
    Disconnected,
    Message(DealerNotification),
    Request(DealerRequest),
}

/// Handle for sending frames and shutting the transport down.
#[derive(Clone)]
pub struct DealerHandle {
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl DealerHandle {
    /// Sends a reply bound to a request key.
    pub async fn send_reply(&self, key: &RequestKey, success: bool) -> Result<(), DealerError> {
        self.send_frame(reply_frame(key, success)).await
    }

    /// Sends a raw JSON frame.
    pub async fn send_frame(&self, frame: String) -> Result<(), DealerError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| DealerError::Closed)
    }

    /// Stops the transport permanently. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Starts the transport; events arrive on the returned receiver.
pub fn connect(config: DealerConfig) -> (DealerHandle, mpsc::Receiver<DealerEvent>) {
    let (outbound_tx, outbound_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();

    tokio::spawn(run(config, outbound_rx, event_tx, cancel.clone()));

    (
        DealerHandle {
            outbound: outbound_tx,
            cancel,
        },
        event_rx,
    )
}

async fn run(
    config: DealerConfig,
    mut outbound: mpsc::Receiver<String>,
    events: mpsc::Sender<DealerEvent>,
    cancel: CancellationToken,
) {
    let mut backoff = Duration::from_secs(1);

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match connect_async(config.url.as_str()).await {
            Ok((socket, _)) => {
                info!(url = %config.url, "dealer connected");
                backoff = Duration::from_secs(1);
                let _ = events.send(DealerEvent::Connected).await;

                let outcome =
                    run_connection(socket, &config, &mut outbound, &events, &cancel).await;
                let _ = events.send(DealerEvent::Disconnected).await;
                if matches!(outcome, ConnectionEnd::Shutdown) {
                    return;
                }
            }
            Err(e) => {
                warn!("dealer connection failed: {e}");
            }
        }

        debug!(?backoff, "dealer reconnecting after backoff");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(config.reconnect_cap);
    }
}

enum ConnectionEnd {
    Shutdown,
    Reconnect,
}

async fn run_connection<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    config: &DealerConfig,
    outbound: &mut mpsc::Receiver<String>,
    events: &mpsc::Sender<DealerEvent>,
    cancel: &CancellationToken,
) -> ConnectionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let mut last_inbound = Instant::now();
    let mut ping_tick = tokio::time::interval(config.ping_interval);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ping_tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return ConnectionEnd::Shutdown;
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else { return ConnectionEnd::Shutdown };
                if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                    return ConnectionEnd::Reconnect;
                }
            }

            _ = ping_tick.tick() => {
                if last_inbound.elapsed() >= config.ping_interval * 2 {
                    warn!("dealer went silent, reconnecting");
                    return ConnectionEnd::Reconnect;
                }
                if sink
                    .send(WsMessage::Text(crate::protocol::ping_frame().into()))
                    .await
                    .is_err()
                {
                    return ConnectionEnd::Reconnect;
                }
            }

            inbound = stream.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!("dealer read failed: {e}");
                        return ConnectionEnd::Reconnect;
                    }
                    None => return ConnectionEnd::Reconnect,
                };
                last_inbound = Instant::now();

                match message {
                    WsMessage::Text(text) => {
                        match parse_frame(text.as_str()) {
                            DealerMessage::Ping => {
                                // Answer inline; the pong deadline is tight.
                                if sink.send(WsMessage::Text(pong_frame().into())).await.is_err() {
                                    return ConnectionEnd::Reconnect;
                                }
                            }
                            DealerMessage::Pong => {}
                            DealerMessage::Message(m) => {
                                let _ = events.send(DealerEvent::Message(m)).await;
                            }
                            DealerMessage::Request(r) => {
                                let _ = events.send(DealerEvent::Request(r)).await;
                            }
                            DealerMessage::Unknown => {
                                debug!("dropping unknown dealer frame");
                            }
                        }
                    }
                    WsMessage::Ping(body) => {
                        let _ = sink.send(WsMessage::Pong(body)).await;
                    }
                    WsMessage::Close(_) => return ConnectionEnd::Reconnect,
                    _ => {}
                }
            }
        }
    }
}
