use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;
use tracing::error;

/// failure of a single upstream exchange at the transport level (dns, connect, reset, body read)
#[derive(Debug, Clone, ThisError)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self(e.to_string())
    }
}

/// errors out of the multi proxy fetch chain
///
/// `Timeout`, `Status` and `Transport` describe one candidate and are absorbed by the chain,
/// only `AllFailed` ever reaches a caller.
#[derive(Debug, Clone, ThisError)]
pub enum FetchError {
    #[error("{url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("every fetch candidate failed (last proxy: {last_proxy}; direct: {direct})")]
    AllFailed { last_proxy: String, direct: String },
}

#[derive(Debug, Clone, ThisError)]
pub enum GuideError {
    #[error("guide unavailable: {0}")]
    Unavailable(#[from] FetchError),

    #[error("guide malformed: {0}")]
    Malformed(String),
}

/// http facing error, everything is rendered as a short plain text body
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// non 2xx from the origin, echoed with the same status
    #[error("upstream returned {0}")]
    Upstream(StatusCode),

    #[error("{0}")]
    Unavailable(String),

    #[error("internal server error")]
    InternalServerError,

    #[error("{0}")]
    InternalServerErrorWithContext(String),
}

pub type AppResult<T> = Result<T, Error>;

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream(status) => *status,
            Self::Unavailable(_) => StatusCode::BAD_GATEWAY,
            Self::InternalServerError | Self::InternalServerErrorWithContext(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<FetchError> for Error {
    fn from(e: FetchError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<GuideError> for Error {
    fn from(e: GuideError) -> Self {
        match e {
            GuideError::Unavailable(inner) => Self::Unavailable(inner.to_string()),
            GuideError::Malformed(msg) => {
                Self::InternalServerErrorWithContext(format!("guide malformed: {}", msg))
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), "request failed: {}", self);
        }

        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}
