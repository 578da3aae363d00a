//! Tidecast Core - download, normalize and cast media to a network receiver
//!
//! This crate provides the building blocks of the playback pipeline: the
//! library store, transfer acquisition, container normalization, receiver
//! discovery and dispatch, and the orchestrator tying them together.

pub mod acquisition;
pub mod cast;
pub mod config;
pub mod library;
pub mod normalize;
pub mod pipeline;
pub mod tracing_setup;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

// Re-export main types for convenient access
pub use acquisition::{AcquisitionController, AcquisitionError, TransferError};
pub use cast::{DispatchError, DispatchEvent, DispatchOutcome, PlaybackDispatcher};
pub use config::TidecastConfig;
pub use library::{LibraryError, MediaFile, MediaLibrary};
pub use normalize::{FormatNormalizer, NormalizationError};
pub use pipeline::{
    FailureKind, PipelineError, PipelineOrchestrator, PipelineOutcome, PlaybackRequest,
};

/// Core errors that can bubble up from any Tidecast subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TidecastError {
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Transfer backend error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TidecastError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TidecastError::Pipeline(e) => match e {
                PipelineError::InvalidRequest { reason } => format!("Invalid request: {reason}"),
                PipelineError::FileNotFound { name } => format!("{name} is not in the library"),
                PipelineError::Acquisition(AcquisitionError::InvalidLocator { reason }) => {
                    format!("Invalid magnet link: {reason}")
                }
                PipelineError::Acquisition(AcquisitionError::NoPlayableFile { .. }) => {
                    "The download contains no playable video".to_string()
                }
                PipelineError::Acquisition(_) => "Download failed".to_string(),
                PipelineError::Normalization(NormalizationError::SourceMissing { name }) => {
                    format!("{name} is not in the library")
                }
                PipelineError::Normalization(_) => "Could not convert the video".to_string(),
                PipelineError::Library(_) => "Library error occurred".to_string(),
                PipelineError::Cancelled => "Request cancelled".to_string(),
            },
            TidecastError::Library(_) => "Library error occurred".to_string(),
            TidecastError::Transfer(_) => "Download service unavailable".to_string(),
            TidecastError::Dispatch(_) => "Could not reach the receiver".to_string(),
            TidecastError::Configuration { .. } => "Configuration error occurred".to_string(),
            TidecastError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        match self {
            TidecastError::Pipeline(e) => e.kind() == FailureKind::InvalidRequest,
            TidecastError::Library(LibraryError::InvalidName { .. }) => true,
            TidecastError::Configuration { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TidecastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let missing = TidecastError::from(PipelineError::FileNotFound {
            name: "movie.mp4".to_string(),
        });
        assert!(missing.is_user_error());
        assert_eq!(missing.user_message(), "movie.mp4 is not in the library");

        let transfer = TidecastError::from(PipelineError::from(AcquisitionError::TransferFailed {
            locator: "magnet:?xt=urn:btih:abc".to_string(),
            reason: "timeout".to_string(),
        }));
        assert!(!transfer.is_user_error());
        assert_eq!(transfer.user_message(), "Download failed");
    }
}
