//! Request pipeline.
//!
//! A playback request either names a library file or carries a transfer
//! locator. It moves through a fixed sequence of stages:
//!
//! ```text
//! Received -> Acquiring | Local -> Normalizing -> Dispatching -> Done
//! ```
//!
//! Any stage before `Dispatching` may end the request in `Failed`. Dispatch
//! runs in the background and reports to its own observer.

mod orchestrator;

use std::fmt;

pub use orchestrator::{PipelineOrchestrator, PipelineOutcome};

use crate::acquisition::AcquisitionError;
use crate::library::LibraryError;
use crate::normalize::NormalizationError;

/// Stage of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Acquiring,
    Local,
    Normalizing,
    Dispatching,
    Done,
    Failed(FailureKind),
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Received => write!(f, "received"),
            PipelineState::Acquiring => write!(f, "acquiring"),
            PipelineState::Local => write!(f, "local"),
            PipelineState::Normalizing => write!(f, "normalizing"),
            PipelineState::Dispatching => write!(f, "dispatching"),
            PipelineState::Done => write!(f, "done"),
            PipelineState::Failed(kind) => write!(f, "failed ({kind})"),
        }
    }
}

/// Why a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidRequest,
    TransferFailed,
    NoPlayableFile,
    TranscodeFailed,
    /// Only ever reported through dispatch observers
    DispatchFailed,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::InvalidRequest => "invalid request",
            FailureKind::TransferFailed => "transfer failed",
            FailureKind::NoPlayableFile => "no playable file",
            FailureKind::TranscodeFailed => "transcode failed",
            FailureKind::DispatchFailed => "dispatch failed",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// A validated playback request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackRequest {
    /// Play a file already in the library
    Local { file_name: String },
    /// Download, then play
    Transfer { locator: String },
}

impl PlaybackRequest {
    /// Builds a request from optional inputs; exactly one must be non-empty.
    ///
    /// # Errors
    /// - `PipelineError::InvalidRequest` - Neither or both inputs given
    pub fn from_parts(
        file_name: Option<&str>,
        locator: Option<&str>,
    ) -> Result<Self, PipelineError> {
        let present = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
        };
        match (present(file_name), present(locator)) {
            (Some(file_name), None) => Ok(PlaybackRequest::Local { file_name }),
            (None, Some(locator)) => Ok(PlaybackRequest::Transfer { locator }),
            (None, None) => Err(PipelineError::InvalidRequest {
                reason: "either a file name or a locator is required".to_string(),
            }),
            (Some(_), Some(_)) => Err(PipelineError::InvalidRequest {
                reason: "a file name and a locator are mutually exclusive".to_string(),
            }),
        }
    }
}

/// Errors that end a request before dispatch.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("File not found: {name}")]
    FileNotFound { name: String },

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Request cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::InvalidRequest { .. }
            | PipelineError::FileNotFound { .. }
            | PipelineError::Library(_) => FailureKind::InvalidRequest,
            PipelineError::Acquisition(e) => match e {
                AcquisitionError::InvalidLocator { .. } => FailureKind::InvalidRequest,
                AcquisitionError::NoPlayableFile { .. } => FailureKind::NoPlayableFile,
                AcquisitionError::Cancelled { .. } => FailureKind::Cancelled,
                AcquisitionError::TransferFailed { .. }
                | AcquisitionError::SessionStorage { .. }
                | AcquisitionError::Relocation(_) => FailureKind::TransferFailed,
            },
            PipelineError::Normalization(e) => match e {
                NormalizationError::Cancelled { .. } => FailureKind::Cancelled,
                NormalizationError::SourceMissing { .. }
                | NormalizationError::TranscodeFailed { .. }
                | NormalizationError::Library(_) => FailureKind::TranscodeFailed,
            },
            PipelineError::Cancelled => FailureKind::Cancelled,
        }
    }
}
