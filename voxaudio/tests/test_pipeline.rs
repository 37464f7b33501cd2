use std::{sync::Arc, time::Duration};

use voxaudio::{
    DecoderRegistry, PipelineConfig, PlayCommand, PlaybackPipeline, SourceRegistry, StubSink,
    StubSource,
};

fn pipeline() -> (PlaybackPipeline, Arc<StubSink>) {
    let sources = Arc::new(SourceRegistry::new());
    sources.register(Arc::new(StubSource::default()));
    let sink = Arc::new(StubSink::new());
    let pipeline = PlaybackPipeline::new(
        sources,
        Arc::new(DecoderRegistry::with_defaults()),
        sink.clone(),
        PipelineConfig::default(),
    );
    (pipeline, sink)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn positioned_play_pause_resume() {
    let (pipeline, _sink) = pipeline();

    pipeline
        .play(PlayCommand::new("stub:x").at(5000))
        .await
        .unwrap();

    // The positioned Playing state is visible right away.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let state = pipeline.current_state();
    assert!(state.is_playing);
    assert!(!state.is_paused);
    assert_eq!(state.track_uri.as_deref(), Some("stub:x"));
    assert!(state.position_ms >= 5000, "got {}", state.position_ms);
    let playback_id = state.playback_id;
    assert!(playback_id > 0);

    // Pause freezes the reported position.
    pipeline.pause().await.unwrap();
    let paused = pipeline.current_state();
    assert!(paused.is_paused);
    assert!(!paused.is_playing);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pipeline.current_state().position_ms, paused.position_ms);

    // Resume continues the same playing session.
    pipeline.resume().await.unwrap();
    let resumed = pipeline.current_state();
    assert!(resumed.is_playing);
    assert_eq!(resumed.playback_id, playback_id);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(pipeline.current_state().position_ms > paused.position_ms);

    pipeline.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_play_supersedes_the_first() {
    let (pipeline, _sink) = pipeline();

    pipeline.play(PlayCommand::new("stub:first")).await.unwrap();
    let first = pipeline.current_state();
    pipeline.play(PlayCommand::new("stub:second")).await.unwrap();

    let state = pipeline.current_state();
    assert_eq!(state.track_uri.as_deref(), Some("stub:second"));
    assert!(state.is_playing);
    assert!(state.playback_id > first.playback_id);

    pipeline.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seek_stays_playing_and_is_rejected_when_stopped() {
    let (pipeline, _sink) = pipeline();

    // Seeks with nothing loaded are rejected.
    assert!(matches!(
        pipeline.seek(1000).await,
        Err(voxaudio::PipelineError::SeekRejected)
    ));

    pipeline.play(PlayCommand::new("stub:x")).await.unwrap();
    let id = pipeline.current_state().playback_id;

    pipeline.seek(7000).await.unwrap();
    let state = pipeline.current_state();
    assert!(state.is_playing);
    assert_eq!(state.position_ms, 7000);
    assert_eq!(state.playback_id, id);

    // A paused pipeline resumes playing on seek.
    pipeline.pause().await.unwrap();
    pipeline.seek(2000).await.unwrap();
    assert!(pipeline.current_state().is_playing);

    pipeline.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flags_do_not_interrupt_playback() {
    let (pipeline, _sink) = pipeline();
    pipeline.play(PlayCommand::new("stub:x")).await.unwrap();
    let id = pipeline.current_state().playback_id;

    pipeline.set_shuffle(true).await.unwrap();
    pipeline.set_repeat_track(true).await.unwrap();
    pipeline.set_repeat_context(true).await.unwrap();

    let state = pipeline.current_state();
    assert!(state.shuffling);
    assert!(state.repeating_track);
    assert!(state.repeating_context);
    assert!(state.is_playing);
    assert_eq!(state.playback_id, id);

    pipeline.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcasts_are_ordered_and_timestamped() {
    let (pipeline, _sink) = pipeline();
    let mut updates = pipeline.subscribe();

    pipeline.play(PlayCommand::new("stub:x")).await.unwrap();
    pipeline.pause().await.unwrap();
    pipeline.resume().await.unwrap();

    let mut last_timestamp = 0;
    let mut seen = 0;
    while updates.changed().await.is_ok() {
        let state = updates.borrow().clone();
        assert!(
            state.timestamp_unix_ms > last_timestamp,
            "timestamps must strictly increase"
        );
        last_timestamp = state.timestamp_unix_ms;
        seen += 1;
        if state.is_playing && seen >= 3 {
            break;
        }
    }
    assert!(seen >= 3);

    pipeline.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispose_is_idempotent_and_completes_subscribers() {
    let (pipeline, _sink) = pipeline();
    let mut updates = pipeline.subscribe();

    pipeline.play(PlayCommand::new("stub:x")).await.unwrap();
    pipeline.dispose().await;
    pipeline.dispose().await;

    // Commands after disposal fail.
    assert!(matches!(
        pipeline.play(PlayCommand::new("stub:x")).await,
        Err(voxaudio::PipelineError::Disposed)
    ));

    // The state stream completes once the sender is gone.
    loop {
        if updates.changed().await.is_err() {
            break;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_track_stops_at_end_of_stream() {
    let sources = Arc::new(SourceRegistry::new());
    sources.register(Arc::new(StubSource {
        duration_ms: 150,
        ..StubSource::default()
    }));
    let sink = Arc::new(StubSink::new());
    let pipeline = PlaybackPipeline::new(
        sources,
        Arc::new(DecoderRegistry::with_defaults()),
        sink,
        PipelineConfig::default(),
    );

    pipeline.play(PlayCommand::new("stub:short")).await.unwrap();
    let mut updates = pipeline.subscribe();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = updates.borrow().clone();
        if state.is_stopped() && state.track_uri.is_some() {
            break;
        }
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    panic!("stream completed before the stop broadcast");
                }
            }
            _ = tokio::time::sleep_until(deadline) => panic!("track never stopped"),
        }
    }

    pipeline.dispose().await;
}
