use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::{
    config::AppConfig,
    models::{ChannelCatalog, EpgIndex},
    server::error::{FetchError, GuideError},
};

use super::{
    catalog_services::{CatalogService, DynCatalogService},
    epg_services::{DynGuideService, GuideService},
    fetch_services::ResilientFetcher,
    snapshot_services::SnapshotCache,
    transport_services::{DynHttpTransport, ReqwestTransport},
};

/// everything a handler needs, cloned into each request through an Extension
#[derive(Clone)]
pub struct EdgeServices {
    pub transport: DynHttpTransport,
    pub fetcher: ResilientFetcher,
    pub catalog: DynCatalogService,
    pub guide: DynGuideService,
    pub catalog_snapshot: Arc<SnapshotCache<ChannelCatalog>>,
    pub guide_snapshot: Arc<SnapshotCache<EpgIndex>>,
    pub config: Arc<AppConfig>,
}

impl EdgeServices {
    pub fn new(config: Arc<AppConfig>) -> Self {
        // i like to make it look like a real browser but it's really not needed
        let http = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36")
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self::with_transport(config, Arc::new(ReqwestTransport::new(http)))
    }

    /// same wiring on top of any transport, tests hand in a mock here
    pub fn with_transport(config: Arc<AppConfig>, transport: DynHttpTransport) -> Self {
        info!("starting edge services...");

        let fetcher = ResilientFetcher::new(transport.clone(), config.proxy_prefixes());
        info!(
            proxies = fetcher.proxies().len(),
            "fetch chain ready, starting catalog and guide services..."
        );

        let catalog = Arc::new(CatalogService::new(
            fetcher.clone(),
            config.channel_source_url.clone(),
            config.channel_source_format,
            config.gateway_url(),
            config.fetch_timeout_ms,
        )) as DynCatalogService;

        let guide = Arc::new(GuideService::new(
            fetcher.clone(),
            config.guide_url.clone(),
            config.guide_timeout_ms,
        )) as DynGuideService;

        let ttl = Duration::from_secs(config.snapshot_ttl_secs);

        Self {
            transport,
            fetcher,
            catalog,
            guide,
            catalog_snapshot: Arc::new(SnapshotCache::new(ttl)),
            guide_snapshot: Arc::new(SnapshotCache::new(ttl)),
            config,
        }
    }

    pub async fn current_channels(&self) -> Result<Arc<ChannelCatalog>, FetchError> {
        let catalog = self.catalog.clone();
        self.catalog_snapshot
            .get_or_refresh(|| async move { catalog.get_channels().await })
            .await
    }

    pub async fn current_guide(&self) -> Result<Arc<EpgIndex>, GuideError> {
        let guide = self.guide.clone();
        self.guide_snapshot
            .get_or_refresh(|| async move { guide.fetch_guide().await })
            .await
    }
}
