use std::sync::Arc;

use async_trait::async_trait;
use mockall::automock;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{
    config::ChannelSourceFormat,
    models::{Channel, ChannelCatalog, ChannelCategory, RequestHeaders},
    server::{
        error::FetchError,
        utils::{m3u_utils, manifest_utils::proxy_url},
    },
};

use super::fetch_services::{FetchOptions, ResilientFetcher};

/// channels whose origin refuses browser fetches no matter what headers are sent
pub const PROXY_REQUIRED_IDS: &[&str] = &[
    "mjh-parliament",
    "mjh-trackside-1",
    "mjh-trackside-2",
    "mjh-sky-open",
    "mjh-tvnz-1",
    "mjh-tvnz-2",
    "mjh-tvnz-duke",
];

// cdn hosts that don't send cors headers
static PROXY_REQUIRED_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(tvnz\.co\.nz|sky\.co\.nz|trackside\.co\.nz|\.amagi\.tv/|akamaized\.net/hls/live/)")
        .expect("Static regex should compile")
});

/// set top box agents some directories ship, origins reject them from anything else
pub const STRIPPED_USER_AGENTS: &[&str] = &[
    "otg/1.5.1 (AppleTv Apple TV 4; tvOS16.0; appletv.client) libcurl/7.58.0 OpenSSL/1.0.2o zlib/1.2.11 clib/1.8.56",
    "Mozilla/5.0 (SMART-TV; Linux; Tizen 5.0) AppleWebKit/538.1 (KHTML, like Gecko) Version/5.0 NativeTVAds Safari/538.1",
];

/// display order, first entry that prefixes the name (case insensitive) decides the rank
pub const CHANNEL_PRIORITY: &[&str] = &[
    "TVNZ 1",
    "TVNZ 2",
    "Three",
    "Bravo",
    "Whakaata Māori",
    "Te Reo",
    "TVNZ DUKE",
    "eden",
    "Rush",
    "Sky Open",
    "Prime",
    "Parliament TV",
    "Al Jazeera",
    "BBC News",
    "CNN",
];

const NZ_KEYWORDS: &[&str] = &[
    "tvnz", "three", "bravo", "māori", "maori", "te reo", "duke", "eden", "rush", "sky open",
    "prime", "parliament", "whakaata", "choice", "trackside", "wairarapa", "chtv", "apna",
];
const SPORTS_KEYWORDS: &[&str] = &["sport", "trackside", "racing", "tab ", "espn", "fight"];
const NEWS_KEYWORDS: &[&str] = &["news", "jazeera", "cnn", "dw ", "france 24", "sky news", "rnz"];
const RELIGIOUS_KEYWORDS: &[&str] = &[
    "shine", "firstlight", "hope channel", "daystar", "church", "faith", "gospel", "tbn",
];

/// Keyword classification on the source's group hint first, then the name.
pub fn classify_category(name: &str, hint: Option<&str>) -> ChannelCategory {
    let contains_any = |haystack: &str, keywords: &[&str]| {
        let haystack = haystack.to_lowercase();
        keywords.iter().any(|k| haystack.contains(k))
    };

    for text in hint.into_iter().chain(std::iter::once(name)) {
        if contains_any(text, SPORTS_KEYWORDS) {
            return ChannelCategory::Sports;
        }
        if contains_any(text, NEWS_KEYWORDS) {
            return ChannelCategory::News;
        }
        if contains_any(text, RELIGIOUS_KEYWORDS) {
            return ChannelCategory::Religious;
        }
        if contains_any(text, NZ_KEYWORDS) || text.to_lowercase().contains("new zealand") {
            return ChannelCategory::NewZealand;
        }
    }

    ChannelCategory::International
}

pub fn priority_rank(name: &str, priority: &[&str]) -> Option<usize> {
    let name = name.to_lowercase();
    priority
        .iter()
        .position(|p| name.starts_with(&p.to_lowercase()))
}

/// priority matches first in list order, everything else after them alphabetically
pub fn sort_channels(channels: &mut [Channel], priority: &[&str]) {
    channels.sort_by_cached_key(|c| {
        (
            priority_rank(&c.name, priority).unwrap_or(priority.len()),
            c.name.to_lowercase(),
        )
    });
}

pub fn requires_proxy(id: &str, stream_url: &str) -> bool {
    PROXY_REQUIRED_IDS.contains(&id) || PROXY_REQUIRED_URL.is_match(stream_url)
}

/// Drops header values known to get requests rejected, `None` when nothing is left.
///
/// Source order is kept. A name repeated in another case replaces the earlier value in place.
pub fn sanitize_headers(
    headers: impl IntoIterator<Item = (String, String)>,
) -> Option<RequestHeaders> {
    let mut cleaned = RequestHeaders::new();
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if lower == "referer" && value.trim().is_empty() {
            continue;
        }
        if lower == "user-agent" && STRIPPED_USER_AGENTS.contains(&value.trim()) {
            continue;
        }

        match cleaned
            .keys()
            .position(|existing| existing.eq_ignore_ascii_case(&name))
        {
            Some(index) => {
                if let Some((_, slot)) = cleaned.get_index_mut(index) {
                    *slot = value;
                }
            }
            None => {
                cleaned.insert(name, value);
            }
        }
    }

    (!cleaned.is_empty()).then_some(cleaned)
}

/// Turns directory fields into the final record: header cleanup, proxy flag, and proxy
/// wrapping of the playback url when it's needed.
pub struct ChannelBuilder<'a> {
    pub id: String,
    pub name: String,
    pub logo_url: String,
    pub stream_url: String,
    pub epg_id: String,
    pub category_hint: Option<&'a str>,
    pub headers: Vec<(String, String)>,
}

impl ChannelBuilder<'_> {
    pub fn build(self, gateway_url: &str) -> Channel {
        let request_headers = sanitize_headers(self.headers);
        let needs_proxy = requires_proxy(&self.id, &self.stream_url);

        let stream_url = if needs_proxy {
            proxy_url(
                gateway_url,
                &self.stream_url,
                request_headers
                    .iter()
                    .flatten()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            )
        } else {
            self.stream_url
        };

        Channel {
            category: classify_category(&self.name, self.category_hint),
            id: self.id,
            name: self.name,
            logo_url: self.logo_url,
            stream_url,
            epg_id: self.epg_id,
            request_headers,
            needs_proxy,
        }
    }
}

fn str_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn header_field(obj: &Map<String, Value>) -> Vec<(String, String)> {
    obj.get("headers")
        .and_then(Value::as_object)
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

const STREAM_KEYS: &[&str] = &["mjh_master", "streamUrl", "stream_url", "url"];
const LOGO_KEYS: &[&str] = &["logo", "logoUrl", "logo_url"];
const EPG_KEYS: &[&str] = &["epg_id", "epgId", "tvg_id"];
const HINT_KEYS: &[&str] = &["category", "group", "network"];

// keyed form is strict: name, logo, master url and epg id must all be there
fn from_keyed(map: &Map<String, Value>, gateway_url: &str) -> Vec<Channel> {
    map.iter()
        .filter_map(|(id, entry)| {
            let obj = entry.as_object()?;
            let hint = str_field(obj, HINT_KEYS);
            let builder = ChannelBuilder {
                id: id.clone(),
                name: str_field(obj, &["name"])?,
                logo_url: str_field(obj, LOGO_KEYS)?,
                stream_url: str_field(obj, STREAM_KEYS)?,
                epg_id: str_field(obj, EPG_KEYS)?,
                category_hint: hint.as_deref(),
                headers: header_field(obj),
            };
            Some(builder.build(gateway_url))
        })
        .collect()
}

fn from_list(items: &[Value], gateway_url: &str) -> Vec<Channel> {
    items
        .iter()
        .filter_map(|entry| {
            let obj = entry.as_object()?;
            let name = str_field(obj, &["name"])?;
            let stream_url = str_field(obj, STREAM_KEYS)?;
            let id = str_field(obj, &["id"])
                .or_else(|| str_field(obj, EPG_KEYS))
                .unwrap_or_else(|| name.clone());
            let hint = str_field(obj, HINT_KEYS);
            let builder = ChannelBuilder {
                epg_id: str_field(obj, EPG_KEYS).unwrap_or_else(|| id.clone()),
                id,
                name,
                logo_url: str_field(obj, LOGO_KEYS).unwrap_or_default(),
                stream_url,
                category_hint: hint.as_deref(),
                headers: header_field(obj),
            };
            Some(builder.build(gateway_url))
        })
        .collect()
}

/// Accepts a bare array, `{ "channels": [...] }`, or an object keyed by channel id.
pub fn normalize_json(value: &Value, gateway_url: &str) -> ChannelCatalog {
    let mut channels = match value {
        Value::Array(items) => from_list(items, gateway_url),
        Value::Object(map) => match map.get("channels") {
            Some(Value::Array(items)) => from_list(items, gateway_url),
            // metadata scalars such as "version" sit beside the entries and are skipped
            _ if map.values().any(Value::is_object) => {
                from_keyed(map, gateway_url)
            }
            _ => {
                return ChannelCatalog::unrecognized(
                    "channel directory object has neither a channels array nor keyed entries",
                );
            }
        },
        _ => {
            return ChannelCatalog::unrecognized(
                "channel directory is neither an array nor an object",
            );
        }
    };

    sort_channels(&mut channels, CHANNEL_PRIORITY);
    ChannelCatalog {
        channels,
        diagnostic: None,
    }
}

pub fn normalize_m3u(content: &str, gateway_url: &str) -> ChannelCatalog {
    let entries = m3u_utils::parse_m3u(content);
    if entries.is_empty() {
        return ChannelCatalog::unrecognized("channel playlist has no #EXTINF entries");
    }

    let mut channels: Vec<Channel> = entries
        .into_iter()
        .map(|entry| {
            let id = entry
                .channel_id
                .clone()
                .or_else(|| entry.tvg_id.clone())
                .unwrap_or_else(|| entry.name.clone());
            ChannelBuilder {
                epg_id: entry.tvg_id.clone().unwrap_or_else(|| id.clone()),
                id,
                name: entry.name,
                logo_url: entry.tvg_logo.unwrap_or_default(),
                stream_url: entry.url,
                category_hint: entry.group_title.as_deref(),
                headers: entry.headers,
            }
            .build(gateway_url)
        })
        .collect();

    sort_channels(&mut channels, CHANNEL_PRIORITY);
    ChannelCatalog {
        channels,
        diagnostic: None,
    }
}

pub type DynCatalogService = Arc<dyn CatalogServiceTrait + Send + Sync>;

#[automock]
#[async_trait]
pub trait CatalogServiceTrait {
    /// An unreadable directory is not an error, it comes back as an empty catalog with a
    /// diagnostic. Only a failed fetch is.
    async fn get_channels(&self) -> Result<ChannelCatalog, FetchError>;
}

pub struct CatalogService {
    fetcher: ResilientFetcher,
    source_url: String,
    format: ChannelSourceFormat,
    gateway_url: String,
    timeout_ms: u64,
}

impl CatalogService {
    pub fn new(
        fetcher: ResilientFetcher,
        source_url: String,
        format: ChannelSourceFormat,
        gateway_url: String,
        timeout_ms: u64,
    ) -> Self {
        Self {
            fetcher,
            source_url,
            format,
            gateway_url,
            timeout_ms,
        }
    }
}

#[async_trait]
impl CatalogServiceTrait for CatalogService {
    async fn get_channels(&self) -> Result<ChannelCatalog, FetchError> {
        debug!(url = %self.source_url, format = ?self.format, "fetching channel directory");

        let options = FetchOptions::default().with_timeout_ms(self.timeout_ms);
        let response = self.fetcher.fetch(&self.source_url, &options).await?;
        let text = response.text();

        let catalog = match self.format {
            ChannelSourceFormat::Json => match serde_json::from_str::<Value>(&text) {
                Ok(value) => normalize_json(&value, &self.gateway_url),
                Err(e) => {
                    ChannelCatalog::unrecognized(format!("channel directory is not JSON: {}", e))
                }
            },
            ChannelSourceFormat::M3u => normalize_m3u(&text, &self.gateway_url),
        };

        match &catalog.diagnostic {
            Some(diagnostic) => warn!(url = %self.source_url, "{}", diagnostic),
            None => info!(
                channels = catalog.channels.len(),
                proxied = catalog.channels.iter().filter(|c| c.needs_proxy).count(),
                "channel catalog built"
            ),
        }

        Ok(catalog)
    }
}
