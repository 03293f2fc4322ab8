use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// header name -> value in the order the directory listed them
pub type RequestHeaders = IndexMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelCategory {
    NewZealand,
    International,
    Religious,
    Sports,
    News,
}

/// One playable channel. Built once per catalog refresh and replaced wholesale by the next one.
///
/// `stream_url` is already wrapped in the stream proxy url when `needs_proxy` is set, so the
/// player can use it as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub logo_url: String,
    pub stream_url: String,
    /// join key into the guide, not always the same as `id`
    pub epg_id: String,
    pub category: ChannelCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<RequestHeaders>,
    pub needs_proxy: bool,
}

/// what `getChannels` hands out, `diagnostic` is set when the directory couldn't be understood
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCatalog {
    pub channels: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl ChannelCatalog {
    pub fn unrecognized(diagnostic: impl Into<String>) -> Self {
        Self {
            channels: Vec::new(),
            diagnostic: Some(diagnostic.into()),
        }
    }

    pub fn find(&self, id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }
}
