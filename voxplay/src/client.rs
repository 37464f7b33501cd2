//! Client assembly.
//!
//! [`VoxClient`] owns one AP session, the shared caches, the playback
//! pipeline and (optionally) the remote-control channel. The pieces are
//! restartable independently: a dealer reconnect never touches the
//! session, and pipeline failures never tear down the AP channel.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use voxap::{ApSession, Credentials, SessionConfig};
use voxaudio::{
    AudioSink, DecoderRegistry, PipelineConfig, PlaybackPipeline, SourceRegistry,
};
use voxcache::{
    download::{ChunkedDownloader, DownloadConfig},
    head::HeadFileClient,
    metadata::{EntityCache, EntityCacheConfig},
    store::{AudioFileStore, StoreConfig},
};
use voxconnect::{
    dealer::{self, DealerConfig, DealerHandle},
    handler::{ConnectCommandHandler, NoQueue, QueueNavigator},
    state::{PutStateTransport, StatePublisher},
};

use crate::service_source::{ServiceTrackSource, TrackResolver};

/// Everything needed to bring a client up.
pub struct VoxClientConfig {
    pub ap_addr: String,
    pub device_id: String,
    pub cache_dir: PathBuf,
    /// Dealer WebSocket URL; `None` disables remote control.
    pub dealer_url: Option<String>,
    /// Head-file host origin; `None` disables instant-start prefixes.
    pub head_base_url: Option<String>,
    /// Transport for state publication; `None` disables it.
    pub put_state: Option<Arc<dyn PutStateTransport>>,
    pub queue: Option<Arc<dyn QueueNavigator>>,
}

/// A fully wired client instance.
pub struct VoxClient {
    session: ApSession,
    pipeline: PlaybackPipeline,
    sources: Arc<SourceRegistry>,
    entity_cache: Arc<EntityCache>,
    dealer: Option<DealerHandle>,
    cancel: CancellationToken,
}

impl VoxClient {
    /// Connects, authenticates and wires the subsystems together.
    pub async fn connect(
        config: VoxClientConfig,
        credentials: Credentials,
        resolver: Arc<dyn TrackResolver>,
        sink: Arc<dyn AudioSink>,
    ) -> anyhow::Result<Self> {
        let session = ApSession::connect(
            &config.ap_addr,
            credentials,
            SessionConfig {
                device_id: config.device_id.clone(),
                ..SessionConfig::default()
            },
        )
        .await
        .context("connecting to the access point")?;

        let cancel = CancellationToken::new();

        let store = Arc::new(
            AudioFileStore::new(StoreConfig::new(config.cache_dir.join("audio")))
                .context("opening the audio chunk store")?,
        );
        let downloader = Arc::new(ChunkedDownloader::new(store, DownloadConfig::default()));
        let heads = config
            .head_base_url
            .map(|base| Arc::new(HeadFileClient::new(base)));

        let entity_config = EntityCacheConfig::default();
        let entity_cache = Arc::new(
            EntityCache::open(&config.cache_dir.join("metadata.db"), &entity_config)
                .context("opening the metadata cache")?,
        );
        let _janitor = entity_cache.spawn_janitor(&entity_config, cancel.clone());

        let sources = Arc::new(SourceRegistry::new());
        sources.register(Arc::new(ServiceTrackSource::new(
            Arc::new(session.clone()),
            downloader,
            heads,
            resolver,
        )));

        let pipeline = PlaybackPipeline::new(
            sources.clone(),
            Arc::new(DecoderRegistry::with_defaults()),
            sink,
            PipelineConfig::default(),
        );

        let dealer = config.dealer_url.map(|url| {
            let (handle, events) = dealer::connect(DealerConfig::new(url));
            let queue = config.queue.clone().unwrap_or_else(|| Arc::new(NoQueue));
            let _handler = ConnectCommandHandler::new(pipeline.clone(), queue).spawn(
                handle.clone(),
                events,
                cancel.clone(),
            );
            handle
        });

        if let Some(transport) = config.put_state {
            let _publisher = Arc::new(StatePublisher::new(transport))
                .spawn(pipeline.subscribe(), cancel.clone());
        }

        info!(device = %config.device_id, "client assembled");
        Ok(Self {
            session,
            pipeline,
            sources,
            entity_cache,
            dealer,
            cancel,
        })
    }

    pub fn session(&self) -> &ApSession {
        &self.session
    }

    pub fn pipeline(&self) -> &PlaybackPipeline {
        &self.pipeline
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    pub fn entity_cache(&self) -> &Arc<EntityCache> {
        &self.entity_cache
    }

    pub fn dealer(&self) -> Option<&DealerHandle> {
        self.dealer.as_ref()
    }

    /// Tears the client down: pipeline, remote control, session.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.pipeline.dispose().await;
        if let Some(dealer) = &self.dealer {
            dealer.shutdown();
        }
        self.session.shutdown();
    }
}
