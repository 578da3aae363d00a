//! Transfer acquisition.
//!
//! Drives one peer-to-peer transfer session per request until it completes,
//! picks the video file out of the downloaded set and moves it into the
//! library store. The transfer protocol itself lives behind
//! [`TransferBackend`]; production uses an aria2 daemon over JSON-RPC.

pub mod aria2;
mod controller;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
pub use aria2::Aria2Backend;
pub use controller::AcquisitionController;

use crate::library::{LibraryError, has_suffix};

/// Opens isolated transfer sessions.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Starts a new session for `locator` that stores data under `storage_dir`.
    ///
    /// Sessions are never shared: two calls with the same locator produce two
    /// independent sessions.
    ///
    /// # Errors
    /// - `TransferError::Rejected` - Backend refused the locator
    /// - `TransferError::Http` - Backend unreachable
    async fn open_session(
        &self,
        locator: &str,
        storage_dir: &Path,
    ) -> Result<Box<dyn TransferSession>, TransferError>;
}

/// A single in-flight transfer.
#[async_trait]
pub trait TransferSession: Send {
    /// Locator this session was opened for.
    fn locator(&self) -> &str;

    /// Fetches the current session status.
    ///
    /// # Errors
    /// - `TransferError` - Any backend or network failure
    async fn status(&mut self) -> Result<TransferStatus, TransferError>;

    /// Stops the session and releases backend resources.
    ///
    /// Called exactly once, after the selected file was relocated or after a
    /// fatal error.
    ///
    /// # Errors
    /// - `TransferError` - Backend failed to release the session
    async fn teardown(&mut self) -> Result<(), TransferError>;
}

/// Snapshot of a session as reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStatus {
    /// Fraction complete between 0.0 and 1.0
    pub progress: f64,
    /// Estimated time until completion, if the backend can tell
    pub time_remaining: Option<Duration>,
    pub state: TransferState,
    /// Files of the session; complete only once `state` is `Done`
    pub files: Vec<TransferFile>,
}

/// Lifecycle state of a transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Active,
    Done,
    Aborted { reason: String },
}

/// One file produced by a transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFile {
    /// Original base name of the file
    pub name: String,
    /// Location inside the session's private storage
    pub path: PathBuf,
    /// Length in bytes
    pub length: u64,
}

/// Picks the first file whose suffix is a recognized video container.
pub fn select_playable_file<'a>(
    files: &'a [TransferFile],
    video_suffixes: &[String],
) -> Option<&'a TransferFile> {
    files.iter().find(|file| {
        video_suffixes
            .iter()
            .any(|suffix| has_suffix(&file.name, suffix))
    })
}

/// Errors reported by a transfer backend.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Transfer backend rejected {method}: {message} (code {code})")]
    Rejected {
        method: String,
        code: i64,
        message: String,
    },

    #[error("Transfer backend protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Transfer session failed: {reason}")]
    SessionFailed { reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end an acquisition.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    /// Locator missing, empty or malformed; no session was created
    #[error("Invalid transfer locator: {reason}")]
    InvalidLocator { reason: String },

    /// Session-level failure; the session was aborted
    #[error("Transfer of {locator} failed: {reason}")]
    TransferFailed { locator: String, reason: String },

    /// Transfer finished but contained no recognized video file
    #[error("Transfer of {locator} contains no playable file (found: {files:?})")]
    NoPlayableFile { locator: String, files: Vec<String> },

    /// Private storage for the session could not be prepared
    #[error("Session storage {path} unavailable: {source}")]
    SessionStorage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Moving the downloaded file into the library failed
    #[error("Relocation failed: {0}")]
    Relocation(#[from] LibraryError),

    /// The request was abandoned while the transfer was running
    #[error("Transfer of {locator} cancelled")]
    Cancelled { locator: String },
}
