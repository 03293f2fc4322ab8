use axum::extract::{FromRequestParts, Query};
use axum::http::{HeaderName, request::Parts};
use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use tracing::{debug, error};

use crate::server::error::Error;

/// never forwarded even if asked for, they describe our connection and not the player's
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "content-length",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-connection",
];

/// `?url=<target>&<header>=<value>...` of a stream proxy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamProxyTarget {
    pub url: String,
    /// query order is kept so rewritten manifests carry them in the same order
    pub forwarded_headers: Vec<(String, String)>,
}

pub fn is_forwardable_header(name: &str) -> bool {
    HeaderName::from_bytes(name.as_bytes()).is_ok()
        && !HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

/// The target is either a plain http(s) url (already percent decoded by the query parser) or
/// url safe base64 of one with the padding stripped.
pub fn decode_target_url(url_param: &str) -> Result<String, Error> {
    let url_param = url_param.trim();

    let decoded = if url_param.starts_with("http://") || url_param.starts_with("https://") {
        url_param.to_string()
    } else {
        let mut padded = url_param.to_string();
        while padded.len() % 4 != 0 {
            padded.push('=');
        }

        let bytes = URL_SAFE.decode(&padded).map_err(|e| {
            debug!("Failed to decode base64 target: {}", e);
            Error::BadRequest("Invalid URL encoding".to_string())
        })?;
        String::from_utf8(bytes).map_err(|e| {
            debug!("Failed to parse target as UTF-8: {}", e);
            Error::BadRequest("Invalid URL encoding".to_string())
        })?
    };

    match url::Url::parse(&decoded) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(decoded),
        _ => {
            error!("Rejected stream proxy target: {}", decoded);
            Err(Error::BadRequest("Invalid URL format".to_string()))
        }
    }
}

impl<S> FromRequestParts<S> for StreamProxyTarget
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(params): Query<Vec<(String, String)>> =
            Query::from_request_parts(parts, state)
                .await
                .map_err(|e| Error::BadRequest(format!("Invalid query string: {}", e)))?;

        let mut url: Option<String> = None;
        let mut forwarded_headers = Vec::new();

        for (name, value) in params {
            if name == "url" {
                // first one wins
                url.get_or_insert(value);
            } else if is_forwardable_header(&name) {
                forwarded_headers.push((name, value));
            } else {
                debug!("Ignoring query parameter {}", name);
            }
        }

        let url = url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Error::BadRequest("Missing url parameter".to_string()))?;

        Ok(Self {
            url: decode_target_url(&url)?,
            forwarded_headers,
        })
    }
}
