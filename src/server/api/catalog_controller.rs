use axum::{
    Extension, Json, Router,
    extract::{Path, Query},
    routing::get,
};
use chrono::{DateTime, FixedOffset, Utc};
use tracing::debug;

use crate::{
    models::{Channel, ChannelCatalog, EpgIndex},
    server::{
        dtos::guide_dto::{ChannelGuideResponse, GuideWindowQuery},
        error::{AppResult, Error},
        services::edge_services::EdgeServices,
    },
};

/// read only views over the cached catalog and guide snapshots
pub struct CatalogController;

impl CatalogController {
    pub fn app() -> Router {
        Router::new()
            .route("/channels", get(Self::list_channels))
            .route("/channels/{id}", get(Self::get_channel))
            .route("/guide", get(Self::get_guide))
            .route("/guide/{epg_id}", get(Self::get_channel_guide))
    }

    async fn list_channels(
        Extension(services): Extension<EdgeServices>,
    ) -> AppResult<Json<ChannelCatalog>> {
        let catalog = services.current_channels().await?;
        Ok(Json(catalog.as_ref().clone()))
    }

    async fn get_channel(
        Extension(services): Extension<EdgeServices>,
        Path(id): Path<String>,
    ) -> AppResult<Json<Channel>> {
        let catalog = services.current_channels().await?;
        catalog
            .find(&id)
            .cloned()
            .map(Json)
            .ok_or_else(|| Error::NotFound(format!("No channel with id {}", id)))
    }

    async fn get_guide(Extension(services): Extension<EdgeServices>) -> AppResult<Json<EpgIndex>> {
        let guide = services.current_guide().await?;
        Ok(Json(guide.as_ref().clone()))
    }

    fn parse_instant(raw: &str) -> AppResult<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(raw)
            .map_err(|_| Error::BadRequest(format!("Invalid timestamp {}", raw)))
    }

    /// An unknown epg id is an empty guide, not a 404. Channels without listings are normal.
    async fn get_channel_guide(
        Extension(services): Extension<EdgeServices>,
        Path(epg_id): Path<String>,
        Query(window): Query<GuideWindowQuery>,
    ) -> AppResult<Json<ChannelGuideResponse>> {
        let guide = services.current_guide().await?;
        let now = Utc::now().fixed_offset();

        let programmes = match (window.from.as_deref(), window.to.as_deref()) {
            (None, None) => guide.programmes(&epg_id).to_vec(),
            (from, to) => {
                let from = from.map(Self::parse_instant).transpose()?;
                let to = to.map(Self::parse_instant).transpose()?;
                let from = from.unwrap_or(DateTime::<Utc>::MIN_UTC.fixed_offset());
                let to = to.unwrap_or(DateTime::<Utc>::MAX_UTC.fixed_offset());
                if from >= to {
                    return Err(Error::BadRequest("from must be before to".to_string()));
                }
                guide
                    .programmes_in_range(&epg_id, from, to)
                    .into_iter()
                    .cloned()
                    .collect()
            }
        };
        debug!("{} programmes for {}", programmes.len(), epg_id);

        Ok(Json(ChannelGuideResponse {
            now: guide.current_programme(&epg_id, now).cloned(),
            next: guide.next_programme(&epg_id, now).cloned(),
            programmes,
            epg_id,
        }))
    }
}
