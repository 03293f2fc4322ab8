use std::sync::Arc;

use async_trait::async_trait;
use mockall::automock;
use tracing::{debug, error};

use crate::{
    models::EpgIndex,
    server::{
        error::GuideError,
        utils::xmltv_utils::{decode_guide_body, parse_guide},
    },
};

use super::fetch_services::{FetchOptions, ResilientFetcher};

pub type DynGuideService = Arc<dyn GuideServiceTrait + Send + Sync>;

#[automock]
#[async_trait]
pub trait GuideServiceTrait {
    /// Whole index or nothing. Individual bad programmes are dropped and only show up in
    /// `EpgIndex::skipped`.
    async fn fetch_guide(&self) -> Result<EpgIndex, GuideError>;
}

pub struct GuideService {
    fetcher: ResilientFetcher,
    guide_url: String,
    timeout_ms: u64,
}

impl GuideService {
    pub fn new(fetcher: ResilientFetcher, guide_url: String, timeout_ms: u64) -> Self {
        Self {
            fetcher,
            guide_url,
            timeout_ms,
        }
    }
}

#[async_trait]
impl GuideServiceTrait for GuideService {
    async fn fetch_guide(&self) -> Result<EpgIndex, GuideError> {
        debug!(url = %self.guide_url, "fetching guide");

        let options = FetchOptions::default().with_timeout_ms(self.timeout_ms);
        let response = self.fetcher.fetch(&self.guide_url, &options).await?;

        let xml = decode_guide_body(&response.body)?;
        // parsing tens of megabytes is cpu bound, keep it off the reactor
        let parsed = tokio::task::spawn_blocking(move || parse_guide(&xml))
            .await
            .map_err(|e| GuideError::Malformed(format!("guide parser task failed: {}", e)))?;

        if let Err(e) = &parsed {
            error!(url = %self.guide_url, "{}", e);
        }
        parsed
    }
}
