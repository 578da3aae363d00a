//! Library listing.

use axum::Json;
use axum::extract::State;
use tidecast_core::library::LibraryEntry;

use crate::error::WebError;
use crate::server::AppState;

/// Lists library files in directory order with megabyte size labels.
///
/// # Errors
/// - `WebError::Library` - Library directory cannot be read
pub async fn list_library(
    State(state): State<AppState>,
) -> Result<Json<Vec<LibraryEntry>>, WebError> {
    let files = state.pipeline.library().list().await?;
    Ok(Json(files.iter().map(LibraryEntry::from).collect()))
}
