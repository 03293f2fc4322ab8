use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::server::error::FetchError;

use super::transport_services::DynHttpTransport;

pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;
pub const GUIDE_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub timeout_ms: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl FetchOptions {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// one entry of the fallback chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Proxy(String),
    Direct,
}

impl Candidate {
    /// prefixes that end in a query parameter get the target percent encoded, path style relays
    /// get it appended as is
    pub fn url_for(&self, target: &str) -> String {
        match self {
            Self::Proxy(prefix) if prefix.ends_with('=') => {
                format!("{}{}", prefix, urlencoding::encode(target))
            }
            Self::Proxy(prefix) => format!("{}{}", prefix, target),
            Self::Direct => target.to_string(),
        }
    }
}

/// Candidate order for a single call: every proxy in declared order, then direct.
///
/// Computed fresh on each fetch so nothing about a previous call (which proxy worked last time)
/// can influence the next one.
pub fn candidates(proxies: &[String]) -> Vec<Candidate> {
    proxies
        .iter()
        .map(|p| Candidate::Proxy(p.clone()))
        .chain(std::iter::once(Candidate::Direct))
        .collect()
}

/// A successful, fully buffered response.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub via: Candidate,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// GET with a deadline and an ordered proxy -> direct fallback chain.
///
/// Candidates are tried one at a time and each exactly once; the first 2xx wins. A non 2xx is
/// treated like a dropped connection. Holds no mutable state, so one instance can be shared by
/// any number of concurrent callers.
#[derive(Clone)]
pub struct ResilientFetcher {
    transport: DynHttpTransport,
    proxies: Arc<[String]>,
}

impl ResilientFetcher {
    pub fn new(transport: DynHttpTransport, proxies: Vec<String>) -> Self {
        Self {
            transport,
            proxies: proxies.into(),
        }
    }

    pub fn proxies(&self) -> &[String] {
        &self.proxies
    }

    pub async fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<FetchedResponse, FetchError> {
        let mut last_proxy_failure: Option<FetchError> = None;
        let mut direct_failure: Option<FetchError> = None;

        for candidate in candidates(&self.proxies) {
            let candidate_url = candidate.url_for(url);
            debug!(candidate = ?candidate, url = %candidate_url, "trying fetch candidate");

            match self.attempt(&candidate_url, options).await {
                Ok((status, headers, body)) => {
                    debug!(
                        candidate = ?candidate,
                        status = status.as_u16(),
                        bytes = body.len(),
                        "fetch candidate succeeded"
                    );
                    return Ok(FetchedResponse {
                        via: candidate,
                        status,
                        headers,
                        body,
                    });
                }
                Err(e) => {
                    warn!(candidate = ?candidate, error = %e, "fetch candidate failed");
                    match candidate {
                        Candidate::Proxy(_) => last_proxy_failure = Some(e),
                        Candidate::Direct => direct_failure = Some(e),
                    }
                }
            }
        }

        Err(FetchError::AllFailed {
            last_proxy: last_proxy_failure
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no proxies configured".to_string()),
            direct: direct_failure
                .map(|e| e.to_string())
                .unwrap_or_else(|| "not attempted".to_string()),
        })
    }

    // the deadline covers headers and body, dropping the future on timeout drops the connection
    async fn attempt(
        &self,
        candidate_url: &str,
        options: &FetchOptions,
    ) -> Result<(StatusCode, HeaderMap, Bytes), FetchError> {
        let exchange = async {
            let response = self
                .transport
                .send(options.method.clone(), candidate_url, options.headers.clone())
                .await
                .map_err(|e| FetchError::Transport {
                    url: candidate_url.to_string(),
                    message: e.to_string(),
                })?;

            if !response.status.is_success() {
                return Err(FetchError::Status {
                    url: candidate_url.to_string(),
                    status: response.status.as_u16(),
                });
            }

            let status = response.status;
            let headers = response.headers.clone();
            let body = response.bytes().await.map_err(|e| FetchError::Transport {
                url: candidate_url.to_string(),
                message: e.to_string(),
            })?;

            Ok((status, headers, body))
        };

        tokio::time::timeout(Duration::from_millis(options.timeout_ms), exchange)
            .await
            .unwrap_or_else(|_| {
                Err(FetchError::Timeout {
                    url: candidate_url.to_string(),
                    timeout_ms: options.timeout_ms,
                })
            })
    }
}
