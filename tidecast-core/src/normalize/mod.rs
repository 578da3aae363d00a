//! Container normalization.
//!
//! Receivers cannot play the legacy container, so such files are transcoded
//! into a compatible sibling before dispatch. Everything else passes through
//! untouched.

pub mod ffmpeg;
mod normalizer;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
pub use ffmpeg::{FfmpegTranscoder, TranscodeOptions};
pub use normalizer::{FormatNormalizer, NormalizationJob, NormalizationPlan};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::library::LibraryError;

/// Input and output of a single transcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    /// Output path; its extension need not match `container`
    pub output: PathBuf,
    /// Target container, e.g. `mp4`
    pub container: String,
}

/// Latest progress reported by a running transcode.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TranscodeProgress {
    /// 0.0 to 100.0
    pub percent: f64,
    pub eta: Option<Duration>,
}

/// Converts media between containers.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Runs a transcode to completion, publishing progress on `progress`.
    ///
    /// Must not leave a playable file at `request.output` on failure; the
    /// caller removes whatever is there.
    ///
    /// # Errors
    /// - `TranscodeError::Spawn` - Transcoder binary could not be started
    /// - `TranscodeError::Failed` - Transcoder exited unsuccessfully
    /// - `TranscodeError::InvalidOutput` - Output missing or not of the target container
    /// - `TranscodeError::Cancelled` - `cancel` fired
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        progress: watch::Sender<TranscodeProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError>;
}

/// Replaces the final suffix of `name` with `suffix`.
///
/// A name without a suffix gets one appended.
pub fn replace_suffix(name: &str, suffix: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{stem}.{suffix}"),
        _ => format!("{name}.{suffix}"),
    }
}

/// Errors reported by a transcoder.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcode failed: {reason}")]
    Failed { reason: String },

    #[error("Transcode produced invalid output: {reason}")]
    InvalidOutput { reason: String },

    #[error("Transcode cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end a normalization.
#[derive(Debug, thiserror::Error)]
pub enum NormalizationError {
    /// Transcoding failed; no output was published
    #[error("Transcoding {name} failed: {source}")]
    TranscodeFailed {
        name: String,
        #[source]
        source: TranscodeError,
    },

    /// Input file does not exist in the library
    #[error("Cannot normalize {name}: source file missing")]
    SourceMissing { name: String },

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    /// The request was abandoned while transcoding
    #[error("Normalization of {name} cancelled")]
    Cancelled { name: String },
}
