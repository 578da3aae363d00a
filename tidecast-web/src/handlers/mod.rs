//! HTTP request handlers organized by functionality

pub mod library;
pub mod playback;

// Re-export handler functions
pub use library::list_library;
pub use playback::{PlayQuery, TorrentQuery, play_by_locator, play_by_name};
