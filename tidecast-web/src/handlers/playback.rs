//! Playback endpoints driving the pipeline.

use axum::Json;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tidecast_core::{PipelineOutcome, PlaybackRequest};

use crate::error::WebError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct PlayQuery {
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TorrentQuery {
    #[serde(rename = "magnetLink")]
    pub magnet_link: Option<String>,
}

/// Body returned once dispatch has been issued.
#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub status: &'static str,
    pub file: String,
    pub url: String,
}

/// The file a transfer resolved to.
#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub name: String,
    /// Size label as listed by `/library`
    pub size: String,
    pub bytes: u64,
    pub url: String,
    pub status: &'static str,
}

/// `GET /play?fileName=` plays a library file.
///
/// # Errors
/// - `WebError::Pipeline` - File missing or normalization failed
pub async fn play_by_name(
    State(state): State<AppState>,
    Query(query): Query<PlayQuery>,
) -> Result<Response, WebError> {
    let Some(file_name) = present(query.file_name) else {
        return Ok("no file name".into_response());
    };
    tracing::info!("Play request for {}", file_name);

    let outcome = run(&state, PlaybackRequest::Local { file_name }).await?;
    Ok(Json(DispatchResponse {
        status: "dispatching",
        file: outcome.file.name,
        url: outcome.media_url,
    })
    .into_response())
}

/// `GET /torrent?magnetLink=` downloads, then plays.
///
/// # Errors
/// - `WebError::Pipeline` - Invalid link, failed transfer, no playable file
///   or failed normalization
pub async fn play_by_locator(
    State(state): State<AppState>,
    Query(query): Query<TorrentQuery>,
) -> Result<Response, WebError> {
    let Some(locator) = present(query.magnet_link) else {
        return Ok("magnetLink is required".into_response());
    };
    tracing::info!("Transfer request for {}", locator);

    let outcome = run(&state, PlaybackRequest::Transfer { locator }).await?;
    Ok(Json(TransferResponse {
        size: outcome.file.size_label(),
        bytes: outcome.file.size,
        name: outcome.file.name,
        url: outcome.media_url,
        status: "dispatching",
    })
    .into_response())
}

/// Runs the pipeline, cancelling it if the client goes away first.
async fn run(state: &AppState, request: PlaybackRequest) -> Result<PipelineOutcome, WebError> {
    let cancel = state.shutdown.child_token();
    // Dropped with the handler future when the connection closes
    let abandon = cancel.clone().drop_guard();

    let result = state.pipeline.run(request, None, &cancel).await;
    abandon.disarm();
    Ok(result?)
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
