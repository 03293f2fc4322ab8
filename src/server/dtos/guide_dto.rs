use serde::{Deserialize, Serialize};

use crate::models::Programme;

/// optional window for `/guide/{epg_id}`, both ends RFC 3339
#[derive(Debug, Default, Deserialize)]
pub struct GuideWindowQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelGuideResponse {
    pub epg_id: String,
    pub now: Option<Programme>,
    pub next: Option<Programme>,
    pub programmes: Vec<Programme>,
}
