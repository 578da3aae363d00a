//! HTTP server for Tidecast
//!
//! Serves the library directory under `/videos` so receivers can fetch the
//! URLs they are handed, plus the JSON endpoints driving the pipeline.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use tidecast_core::config::TidecastConfig;
use tidecast_core::normalize::FfmpegTranscoder;
use tidecast_core::{MediaLibrary, PipelineOrchestrator, TidecastError};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::error::WebError;
use crate::handlers::{list_library, play_by_locator, play_by_name};

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: PipelineOrchestrator,
    /// Parent of every request token; cancelled on shutdown
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(pipeline: PipelineOrchestrator, shutdown: CancellationToken) -> Self {
        Self { pipeline, shutdown }
    }
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    let videos = ServeDir::new(state.pipeline.library().directory());

    Router::new()
        .route("/library", get(list_library))
        .route("/play", get(play_by_name))
        .route("/torrent", get(play_by_locator))
        .nest_service("/videos", videos)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs the server until Ctrl-C or until `shutdown` is cancelled.
///
/// # Errors
/// - `WebError::Setup` - Pipeline collaborators could not be created
/// - `WebError::Library` - Library directory could not be created
/// - `WebError::Bind` - Address already in use or not permitted
/// - `WebError::Serve` - Server failed while running
pub async fn run_server(
    config: TidecastConfig,
    shutdown: CancellationToken,
) -> Result<(), WebError> {
    MediaLibrary::open(&config.library.directory).await?;
    if !FfmpegTranscoder::new(&config.normalization).is_available().await {
        tracing::warn!(
            "{} not found; legacy containers cannot be normalized",
            config.normalization.ffmpeg_path.display()
        );
    }
    let pipeline = PipelineOrchestrator::production(&config).map_err(TidecastError::from)?;

    let state = AppState::new(pipeline, shutdown.clone());
    let app = router(state);

    let address = SocketAddr::new(config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|source| WebError::Bind { address, source })?;

    tracing::info!(
        "Tidecast serving {} on http://{}:{}",
        config.library.directory.display(),
        config.server.public_address,
        config.server.port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                shutdown.cancelled().await;
            }
            tracing::info!("Shutting down");
        }
        _ = shutdown.cancelled() => {}
    }
    // Abandon in-flight transfers, transcodes and dispatches
    shutdown.cancel();
}
