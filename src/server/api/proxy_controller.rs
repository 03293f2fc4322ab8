use std::time::Duration;

use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::server::{
    error::{AppResult, Error, TransportError},
    extractors::StreamProxyTarget,
    services::{
        edge_services::EdgeServices,
        transport_services::{BodyStream, UpstreamResponse},
    },
    utils::{
        encoding_utils::{ContentEncoding, decode_body},
        manifest_utils::ManifestRewriteContext,
    },
};

const CORS_HEADERS: [(HeaderName, &str); 4] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, HEAD, OPTIONS"),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
    (
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        "Content-Length, Content-Range",
    ),
];

/// upstream response headers that describe the upstream connection rather than the content
const DROPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authenticate",
    "proxy-connection",
    "set-cookie",
];

/// How the gateway treats an upstream body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Manifest,
    Media,
    /// no usable content type, the first bytes decide
    Ambiguous,
}

impl ResourceKind {
    pub fn classify(content_type: Option<&str>, url: &str) -> Self {
        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();

        if essence.contains("mpegurl") || url_path(url).ends_with(".m3u8") {
            Self::Manifest
        } else if essence.is_empty()
            || essence.starts_with("text/")
            || essence == "application/octet-stream"
            || essence == "binary/octet-stream"
        {
            Self::Ambiguous
        } else {
            Self::Media
        }
    }
}

/// lowercased path of the target, query and fragment dropped
fn url_path(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_ascii_lowercase(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or("")
            .to_ascii_lowercase(),
    }
}

/// content type for media the origin served without one
pub fn infer_content_type(url: &str) -> &'static str {
    let path = url_path(url);
    let extension = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");

    match extension {
        "ts" => "video/mp2t",
        "m4s" | "mp4" => "video/mp4",
        "aac" => "audio/aac",
        "vtt" => "text/vtt",
        "m3u8" => "application/vnd.apple.mpegurl",
        _ => "application/octet-stream",
    }
}

const MANIFEST_MAGIC: &[u8] = b"#EXTM3U";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
/// leading whitespace tolerated before giving up on the sniff
const SNIFF_LIMIT: usize = 1024;

/// body text past any BOM and leading whitespace
fn sniff_window(prefix: &[u8]) -> &[u8] {
    let prefix = prefix.strip_prefix(UTF8_BOM).unwrap_or(prefix);
    let start = prefix
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(prefix.len());
    &prefix[start..]
}

pub fn looks_like_manifest(prefix: &[u8]) -> bool {
    sniff_window(prefix).starts_with(MANIFEST_MAGIC)
}

/// True once `prefix` settles the sniff either way, origins may split `#EXTM3U` across chunks.
pub fn sniff_decidable(prefix: &[u8]) -> bool {
    if prefix.len() >= SNIFF_LIMIT {
        return true;
    }
    if prefix.len() < UTF8_BOM.len() && UTF8_BOM.starts_with(prefix) {
        return false;
    }

    let window = sniff_window(prefix);
    let seen = window.len().min(MANIFEST_MAGIC.len());
    window.len() >= MANIFEST_MAGIC.len() || window[..seen] != MANIFEST_MAGIC[..seen]
}

pub struct ProxyController;

impl ProxyController {
    pub fn app() -> Router {
        Router::new().route(
            "/",
            get(Self::proxy_get)
                .head(Self::proxy_get)
                .options(Self::proxy_options),
        )
    }

    fn apply_cors(response: &mut Response) {
        let headers = response.headers_mut();
        for (name, value) in CORS_HEADERS {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }

    async fn proxy_options() -> Response {
        let mut response = StatusCode::NO_CONTENT.into_response();
        Self::apply_cors(&mut response);
        response
    }

    /// every exit, errors included, carries the CORS headers or the player never sees the status
    async fn proxy_get(
        Extension(services): Extension<EdgeServices>,
        method: Method,
        headers: HeaderMap,
        target: Result<StreamProxyTarget, Error>,
    ) -> Response {
        let mut response = match target {
            Ok(target) => Self::proxy(&services, method, &headers, target)
                .await
                .unwrap_or_else(IntoResponse::into_response),
            Err(e) => e.into_response(),
        };
        Self::apply_cors(&mut response);
        response
    }

    /// forwarded query headers plus the player's Range so seeking hits the origin
    fn upstream_headers(target: &StreamProxyTarget, client_headers: &HeaderMap) -> HeaderMap {
        let mut upstream = HeaderMap::new();

        for (name, value) in &target.forwarded_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    upstream.insert(name, value);
                }
                _ => debug!("Skipping unusable forwarded header {}", name),
            }
        }

        if let Some(range) = client_headers.get(header::RANGE) {
            upstream.insert(header::RANGE, range.clone());
        }

        upstream
    }

    async fn proxy(
        services: &EdgeServices,
        method: Method,
        client_headers: &HeaderMap,
        target: StreamProxyTarget,
    ) -> AppResult<Response> {
        let timeout_ms = services.config.gateway_timeout_ms;
        let timeout = Duration::from_millis(timeout_ms);
        debug!(method = %method, "Proxying: {}", target.url);

        let upstream = match tokio::time::timeout(
            timeout,
            services.transport.send(
                method.clone(),
                &target.url,
                Self::upstream_headers(&target, client_headers),
            ),
        )
        .await
        {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => {
                error!("Request to {} failed: {}", target.url, e);
                return Err(Error::InternalServerErrorWithContext(format!(
                    "Upstream request failed: {}",
                    e
                )));
            }
            Err(_) => {
                error!("Request to {} timed out after {}ms", target.url, timeout_ms);
                return Err(Error::InternalServerErrorWithContext(format!(
                    "Upstream request timed out after {}ms",
                    timeout_ms
                )));
            }
        };

        // dropping the response here closes the upstream connection without reading the body
        if !upstream.status.is_success() {
            warn!(
                "Response from {} not successful: {}",
                target.url, upstream.status
            );
            return Err(Error::Upstream(upstream.status));
        }

        let content_type = upstream
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let kind = ResourceKind::classify(content_type, &target.url);
        debug!("Content-Type: {:?}, treating as {:?}", content_type, kind);

        if method == Method::HEAD {
            return Ok(Self::media_response(&method, upstream, &target, kind));
        }

        match kind {
            ResourceKind::Manifest => {
                Self::manifest_response(services, upstream, &target, client_headers).await
            }
            ResourceKind::Media => Ok(Self::media_response(&method, upstream, &target, kind)),
            ResourceKind::Ambiguous => {
                let (first, upstream) = Self::peek_prefix(upstream, timeout).await?;
                if looks_like_manifest(&first) {
                    debug!("Body starts with #EXTM3U, rewriting as a manifest");
                    Self::manifest_response(services, upstream, &target, client_headers).await
                } else {
                    Ok(Self::media_response(&method, upstream, &target, kind))
                }
            }
        }
    }

    /// Buffers just enough of the body to sniff it and hands back a response that replays the
    /// buffered bytes before the rest of the stream.
    async fn peek_prefix(
        mut upstream: UpstreamResponse,
        timeout: Duration,
    ) -> AppResult<(Bytes, UpstreamResponse)> {
        let mut buffered = BytesMut::new();

        let read = tokio::time::timeout(timeout, async {
            while !sniff_decidable(&buffered) {
                match upstream.body.next().await {
                    Some(Ok(chunk)) => buffered.extend_from_slice(&chunk),
                    Some(Err(e)) => return Err(e),
                    None => break,
                }
            }
            Ok(())
        })
        .await;

        match read {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Failed to read response: {}", e);
                return Err(Error::InternalServerErrorWithContext(format!(
                    "Failed to read response: {}",
                    e
                )));
            }
            Err(_) => {
                return Err(Error::InternalServerErrorWithContext(
                    "Upstream response timed out".to_string(),
                ));
            }
        }

        let prefix = buffered.freeze();
        let replay = prefix.clone();
        let body: BodyStream = Box::pin(
            futures::stream::once(async move { Ok::<Bytes, TransportError>(replay) })
                .chain(upstream.body),
        );

        Ok((prefix, UpstreamResponse { body, ..upstream }))
    }

    async fn manifest_response(
        services: &EdgeServices,
        upstream: UpstreamResponse,
        target: &StreamProxyTarget,
        client_headers: &HeaderMap,
    ) -> AppResult<Response> {
        // relative uris resolve against wherever the redirects ended up
        let base_url = upstream.url.clone().unwrap_or_else(|| target.url.clone());
        let content_encoding = upstream
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase());

        let timeout_ms = services.config.gateway_timeout_ms;
        let bytes = tokio::time::timeout(Duration::from_millis(timeout_ms), upstream.bytes())
            .await
            .map_err(|_| {
                error!("Reading manifest {} timed out", target.url);
                Error::InternalServerErrorWithContext(format!(
                    "Upstream response timed out after {}ms",
                    timeout_ms
                ))
            })?
            .map_err(|e| {
                error!("Failed to read manifest: {}", e);
                Error::InternalServerErrorWithContext(format!("Failed to read response: {}", e))
            })?;

        let decoded = decode_body(content_encoding.as_deref(), &bytes).map_err(|e| {
            error!("Failed to decompress {:?} manifest: {}", content_encoding, e);
            Error::InternalServerErrorWithContext("Failed to decompress response".to_string())
        })?;

        let text = String::from_utf8(decoded).map_err(|e| {
            error!("Failed to parse manifest as UTF-8: {}", e);
            Error::InternalServerErrorWithContext("Invalid m3u8 encoding".to_string())
        })?;

        let context = ManifestRewriteContext::new(
            &base_url,
            services.config.gateway_url(),
            target.forwarded_headers.clone(),
        )
        .map_err(|e| {
            error!("Unusable manifest base url {}: {}", base_url, e);
            Error::InternalServerErrorWithContext("Invalid manifest base url".to_string())
        })?;

        // a leading BOM would turn the #EXTM3U line into a uri line
        let text = text.strip_prefix('\u{feff}').unwrap_or(text.as_str());
        let rewritten = context.rewrite_manifest(text);
        info!(
            "Rewrote manifest {} ({} -> {} bytes)",
            target.url,
            text.len(),
            rewritten.len()
        );

        Self::build_m3u8_response(&rewritten, client_headers)
    }

    /// build m3u8 response with proper headers and optional compression
    fn build_m3u8_response(processed_body: &str, headers: &HeaderMap) -> AppResult<Response> {
        let encoding = ContentEncoding::negotiate(
            headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/vnd.apple.mpegurl"),
        );
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let response_body = encoding.encode(processed_body.as_bytes()).map_err(|e| {
            error!("Failed to compress response with {:?}: {}", encoding, e);
            Error::InternalServerErrorWithContext("Failed to compress response".to_string())
        })?;

        if let Some(enc_header) = encoding.header_value() {
            debug!(
                "Compressed M3U8 with {:?} from {} to {} bytes",
                encoding,
                processed_body.len(),
                response_body.len()
            );
            response_headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(enc_header));
        }

        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(response_body.len()));

        Ok((StatusCode::OK, response_headers, response_body).into_response())
    }

    /// passes the upstream body through chunk by chunk, nothing is buffered
    fn media_response(
        method: &Method,
        upstream: UpstreamResponse,
        target: &StreamProxyTarget,
        kind: ResourceKind,
    ) -> Response {
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers.iter() {
            let lowered = name.as_str();
            if lowered.starts_with("access-control-") || DROPPED_RESPONSE_HEADERS.contains(&lowered)
            {
                continue;
            }
            response_headers.append(name.clone(), value.clone());
        }

        if kind == ResourceKind::Manifest {
            response_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/vnd.apple.mpegurl"),
            );
        } else if !response_headers.contains_key(header::CONTENT_TYPE) {
            response_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(infer_content_type(&target.url)),
            );
        }

        let body = if *method == Method::HEAD {
            Body::empty()
        } else {
            Body::from_stream(upstream.body)
        };

        (upstream.status, response_headers, body).into_response()
    }
}
