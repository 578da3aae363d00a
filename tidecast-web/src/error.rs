//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tidecast_core::{
    FailureKind, LibraryError, NormalizationError, PipelineError, TidecastError,
};

/// Client closed the request before a response was produced.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Web server errors.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),

    #[error("Failed to set up pipeline: {0}")]
    Setup(#[from] TidecastError),
}

impl WebError {
    fn status(&self) -> StatusCode {
        match self {
            WebError::Pipeline(PipelineError::FileNotFound { .. })
            | WebError::Pipeline(PipelineError::Normalization(
                NormalizationError::SourceMissing { .. },
            )) => StatusCode::NOT_FOUND,
            WebError::Pipeline(e) => match e.kind() {
                FailureKind::InvalidRequest => StatusCode::BAD_REQUEST,
                FailureKind::TransferFailed => StatusCode::BAD_GATEWAY,
                FailureKind::NoPlayableFile => StatusCode::UNPROCESSABLE_ENTITY,
                FailureKind::TranscodeFailed | FailureKind::DispatchFailed => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                FailureKind::Cancelled => StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                    .unwrap_or(StatusCode::BAD_REQUEST),
            },
            WebError::Library(LibraryError::InvalidName { .. }) => StatusCode::BAD_REQUEST,
            WebError::Library(LibraryError::NotFound { .. }) => StatusCode::NOT_FOUND,
            WebError::Library(_)
            | WebError::Bind { .. }
            | WebError::Serve(_)
            | WebError::Setup(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            WebError::Pipeline(e) => match e.kind() {
                FailureKind::InvalidRequest => "invalid_request",
                FailureKind::TransferFailed => "transfer_failed",
                FailureKind::NoPlayableFile => "no_playable_file",
                FailureKind::TranscodeFailed => "transcode_failed",
                FailureKind::DispatchFailed => "dispatch_failed",
                FailureKind::Cancelled => "cancelled",
            },
            WebError::Library(_) => "library",
            WebError::Bind { .. } | WebError::Serve(_) | WebError::Setup(_) => "internal",
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = match self {
            WebError::Pipeline(e) => TidecastError::from(e).user_message(),
            WebError::Library(e) => TidecastError::from(e).user_message(),
            other => other.to_string(),
        };
        tracing::debug!("Responding {} ({}): {}", status, kind, message);

        (status, Json(json!({ "error": message, "kind": kind }))).into_response()
    }
}
