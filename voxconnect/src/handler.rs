//! # Connect command handler
//!
//! Consumes dealer `request` events and maps each command endpoint onto a
//! pipeline operation. Every request is answered: success when the
//! operation completed, failure when it errored or the endpoint is
//! unknown. Skip commands are delegated to the external queue navigator.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxaudio::{PipelineError, PlayCommand, PlaybackPipeline};

use crate::dealer::{DealerEvent, DealerHandle};
use crate::protocol::DealerRequest;

/// External queue/context manager consulted for skip commands.
#[async_trait]
pub trait QueueNavigator: Send + Sync {
    async fn next(&self) -> Option<PlayCommand>;
    async fn previous(&self) -> Option<PlayCommand>;

    /// Context updates are queue bookkeeping; playback is untouched.
    async fn update_context(&self, _command: &Value) {}
}

/// A navigator with an empty queue.
pub struct NoQueue;

#[async_trait]
impl QueueNavigator for NoQueue {
    async fn next(&self) -> Option<PlayCommand> {
        None
    }

    async fn previous(&self) -> Option<PlayCommand> {
        None
    }
}

/// Dispatches remote commands onto a pipeline.
pub struct ConnectCommandHandler {
    pipeline: PlaybackPipeline,
    queue: Arc<dyn QueueNavigator>,
}

impl ConnectCommandHandler {
    pub fn new(pipeline: PlaybackPipeline, queue: Arc<dyn QueueNavigator>) -> Self {
        Self { pipeline, queue }
    }

    /// Consumes dealer events until cancellation, replying to every
    /// request through `handle`.
    pub fn spawn(
        self,
        handle: DealerHandle,
        mut events: mpsc::Receiver<DealerEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };

                let DealerEvent::Request(request) = event else {
                    continue;
                };
                let success = match self.dispatch(&request).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            endpoint = endpoint_of(&request).unwrap_or("?"),
                            "remote command failed: {e}"
                        );
                        false
                    }
                };
                if handle.send_reply(&request.key, success).await.is_err() {
                    return;
                }
            }
        })
    }

    /// Maps one request onto the pipeline.
    pub async fn dispatch(&self, request: &DealerRequest) -> Result<(), PipelineError> {
        let endpoint = endpoint_of(request).ok_or_else(|| {
            PipelineError::InvalidArgument("command without an endpoint".to_string())
        })?;
        debug!(endpoint, "remote command");

        let command = &request.command;
        match endpoint {
            // A transfer carries the same shape as a play with state.
            "play" | "transfer" => self.pipeline.play(play_command(command)?).await,
            "pause" => self.pipeline.pause().await,
            "resume" => self.pipeline.resume().await,
            "seek_to" => {
                let position = command["value"].as_u64().ok_or_else(|| {
                    PipelineError::InvalidArgument("seek_to without a value".to_string())
                })?;
                self.pipeline.seek(position).await
            }
            "skip_next" => match self.queue.next().await {
                Some(next) => self.pipeline.play(next).await,
                None => Err(PipelineError::TrackNotFound("queue end".to_string())),
            },
            "skip_prev" => match self.queue.previous().await {
                Some(previous) => self.pipeline.play(previous).await,
                None => Err(PipelineError::TrackNotFound("queue start".to_string())),
            },
            "set_shuffling_context" => self.pipeline.set_shuffle(bool_value(command)?).await,
            "set_repeating_track" => self.pipeline.set_repeat_track(bool_value(command)?).await,
            "set_repeating_context" => {
                self.pipeline.set_repeat_context(bool_value(command)?).await
            }
            "update_context" => {
                self.queue.update_context(command).await;
                Ok(())
            }
            other => {
                info!(endpoint = other, "unsupported remote endpoint");
                Err(PipelineError::InvalidArgument(format!(
                    "unknown endpoint {other}"
                )))
            }
        }
    }
}

fn endpoint_of(request: &DealerRequest) -> Option<&str> {
    request.command["endpoint"].as_str()
}

fn bool_value(command: &Value) -> Result<bool, PipelineError> {
    command["value"]
        .as_bool()
        .ok_or_else(|| PipelineError::InvalidArgument("missing boolean value".to_string()))
}

/// Builds a [`PlayCommand`] from a `play`/`transfer` command body.
///
/// The track comes from `context.current_item.uri` (falling back to
/// `track.uri`), the context from `context.uri`, and the start offset from
/// `options.seek_to` or `position_ms`.
fn play_command(command: &Value) -> Result<PlayCommand, PipelineError> {
    let track_uri = command["context"]["current_item"]["uri"]
        .as_str()
        .or_else(|| command["track"]["uri"].as_str())
        .ok_or_else(|| {
            PipelineError::InvalidArgument("play without a track uri".to_string())
        })?;

    let position_ms = command["options"]["seek_to"]
        .as_u64()
        .or_else(|| command["position_ms"].as_u64())
        .unwrap_or(0);

    Ok(PlayCommand {
        track_uri: track_uri.to_string(),
        track_uid: command["context"]["current_item"]["uid"]
            .as_str()
            .map(str::to_string),
        context_uri: command["context"]["uri"].as_str().map(str::to_string),
        position_ms,
    })
}
