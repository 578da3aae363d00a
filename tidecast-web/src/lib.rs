//! Tidecast Web - HTTP API and media server

#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! Serves the library directory to receivers and exposes the play-by-name,
//! play-by-magnet and listing endpoints.

pub mod error;
pub mod handlers;
pub mod server;

// Re-export main types
pub use error::WebError;
pub use server::{AppState, router, run_server};
