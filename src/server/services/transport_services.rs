use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use mockall::automock;

use crate::server::error::TransportError;

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Response head plus a body that hasn't been read yet. Dropping it drops the upstream
/// connection, which is how an abandoned request gets cleaned up.
pub struct UpstreamResponse {
    /// where the response actually came from after redirects, when the transport knows
    pub url: Option<String>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            url: None,
            status,
            headers,
            body,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// single chunk body, handy for canned responses
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(
            status,
            headers,
            Box::pin(futures::stream::once(async move {
                Ok::<Bytes, TransportError>(body)
            })),
        )
    }

    /// buffers the whole body
    pub async fn bytes(mut self) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

pub type DynHttpTransport = Arc<dyn HttpTransport + Send + Sync>;

/// The only way this crate talks to the network. Both the fetch chain and the stream proxy go
/// through it, tests swap in a mock.
#[automock]
#[async_trait]
pub trait HttpTransport {
    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
    ) -> Result<UpstreamResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
    ) -> Result<UpstreamResponse, TransportError> {
        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .send()
            .await?;

        let final_url = response.url().to_string();
        let status = response.status();
        let headers = response.headers().clone();
        let body: BodyStream = Box::pin(response.bytes_stream().map_err(TransportError::from));

        Ok(UpstreamResponse::new(status, headers, body).with_url(final_url))
    }
}
