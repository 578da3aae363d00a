//! Acquisition controller driving a single transfer session to completion.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{
    AcquisitionError, TransferBackend, TransferSession, TransferState, TransferStatus,
    select_playable_file,
};
use crate::config::AcquisitionConfig;
use crate::library::{MediaFile, MediaLibrary};

/// Acquires media files through a [`TransferBackend`].
///
/// Stateless between calls; every `acquire` opens, drives and tears down its
/// own session inside its own storage directory, so concurrent acquisitions
/// share nothing but the library.
#[derive(Clone)]
pub struct AcquisitionController {
    backend: Arc<dyn TransferBackend>,
    library: MediaLibrary,
    config: AcquisitionConfig,
}

impl AcquisitionController {
    pub fn new(
        backend: Arc<dyn TransferBackend>,
        library: MediaLibrary,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            backend,
            library,
            config,
        }
    }

    /// Downloads `locator` and moves its video file into the library.
    ///
    /// # Errors
    /// - `AcquisitionError::InvalidLocator` - Empty or malformed locator, no session opened
    /// - `AcquisitionError::TransferFailed` - Session error, abort or timeout
    /// - `AcquisitionError::NoPlayableFile` - Finished without a recognized video file
    /// - `AcquisitionError::Relocation` - File could not be moved into the library
    /// - `AcquisitionError::Cancelled` - `cancel` fired before completion
    pub async fn acquire(
        &self,
        locator: &str,
        cancel: &CancellationToken,
    ) -> Result<MediaFile, AcquisitionError> {
        let locator = validate_locator(locator)?;

        let storage_dir = self
            .config
            .sessions_dir
            .join(uuid::Uuid::new_v4().simple().to_string());
        let storage_error = |source| AcquisitionError::SessionStorage {
            path: storage_dir.clone(),
            source,
        };
        tokio::fs::create_dir_all(&storage_dir)
            .await
            .map_err(storage_error)?;
        // The backend may run in another working directory
        let storage_dir = tokio::fs::canonicalize(&storage_dir)
            .await
            .map_err(storage_error)?;

        tracing::info!("Opening transfer session for {}", locator);
        let mut session = match self.backend.open_session(locator, &storage_dir).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("Failed to open transfer session: {}", e);
                remove_storage(&storage_dir).await;
                return Err(AcquisitionError::TransferFailed {
                    locator: locator.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let result = self.drive(session.as_mut(), cancel).await;

        if let Err(e) = session.teardown().await {
            tracing::warn!("Teardown of session for {} failed: {}", locator, e);
        } else {
            tracing::debug!("Session for {} torn down", locator);
        }
        remove_storage(&storage_dir).await;

        match &result {
            Ok(file) => tracing::info!("Acquired {} ({})", file.name, file.size_label()),
            Err(e) => tracing::error!("Acquisition failed: {}", e),
        }
        result
    }

    async fn drive(
        &self,
        session: &mut dyn TransferSession,
        cancel: &CancellationToken,
    ) -> Result<MediaFile, AcquisitionError> {
        let locator = session.locator().to_string();
        let failed = |reason: String| AcquisitionError::TransferFailed {
            locator: locator.clone(),
            reason,
        };

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = tokio::time::interval(self.config.progress_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let deadline = self.config.transfer_timeout.map(|t| Instant::now() + t);
        let timeout = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        let mut observed = ObservedProgress::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AcquisitionError::Cancelled { locator: locator.clone() });
                }
                _ = &mut timeout => {
                    return Err(failed(format!(
                        "no completion within {:?}",
                        self.config.transfer_timeout.unwrap_or_default()
                    )));
                }
                _ = report.tick() => observed.report(&locator),
                _ = poll.tick() => {
                    let status = session.status().await.map_err(|e| failed(e.to_string()))?;
                    observed.update(&status);
                    match status.state {
                        TransferState::Active => {}
                        TransferState::Aborted { reason } => return Err(failed(reason)),
                        TransferState::Done => return self.finish(&locator, status).await,
                    }
                }
            }
        }
    }

    async fn finish(
        &self,
        locator: &str,
        status: TransferStatus,
    ) -> Result<MediaFile, AcquisitionError> {
        for file in &status.files {
            tracing::debug!("Session file {} at {}", file.name, file.path.display());
        }

        let Some(selected) = select_playable_file(&status.files, &self.config.video_suffixes)
        else {
            return Err(AcquisitionError::NoPlayableFile {
                locator: locator.to_string(),
                files: status.files.iter().map(|f| f.name.clone()).collect(),
            });
        };

        let name = base_name(&selected.name);
        Ok(self.library.relocate(&selected.path, &name).await?)
    }
}

/// Highest progress seen so far; backends may report regressions when
/// switching from metadata to payload download.
#[derive(Debug, Default)]
struct ObservedProgress {
    fraction: f64,
    time_remaining: Option<Duration>,
}

impl ObservedProgress {
    fn update(&mut self, status: &TransferStatus) {
        let fraction = status.progress.clamp(0.0, 1.0);
        if fraction >= self.fraction {
            self.fraction = fraction;
        }
        self.time_remaining = status.time_remaining;
    }

    fn report(&self, locator: &str) {
        let minutes = self
            .time_remaining
            .map(|t| format!("{:.2}", t.as_secs_f64() / 60.0))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!(
            locator = %locator,
            "Progress: {:.2}%, time remaining: {} minutes",
            self.fraction * 100.0,
            minutes
        );
    }
}

fn validate_locator(locator: &str) -> Result<&str, AcquisitionError> {
    let locator = locator.trim();
    if locator.is_empty() {
        return Err(AcquisitionError::InvalidLocator {
            reason: "locator is empty".to_string(),
        });
    }
    if locator.starts_with("magnet:") {
        magnet_url::Magnet::new(locator).map_err(|e| AcquisitionError::InvalidLocator {
            reason: format!("invalid magnet link: {e}"),
        })?;
        if !locator.to_ascii_lowercase().contains("xt=urn:") {
            return Err(AcquisitionError::InvalidLocator {
                reason: "magnet link has no exact topic".to_string(),
            });
        }
        return Ok(locator);
    }
    // Anything else must point at a .torrent file aria2 can fetch
    let url = url::Url::parse(locator).map_err(|e| AcquisitionError::InvalidLocator {
        reason: format!("not a magnet link or URL: {e}"),
    })?;
    if !matches!(url.scheme(), "http" | "https" | "ftp") {
        return Err(AcquisitionError::InvalidLocator {
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    Ok(locator)
}

fn base_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name)
        .to_string()
}

async fn remove_storage(storage_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(storage_dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(
            "Failed to remove session storage {}: {}",
            storage_dir.display(),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::test_mocks::{MockFile, MockTransferBackend};

    const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";

    #[tokio::test]
    async fn test_teardown_failure_is_not_escalated() {
        let root = tempdir().unwrap();
        let backend = Arc::new(
            MockTransferBackend::new()
                .with_files(vec![MockFile::new("Bao/Bao.2018.mp4", "payload")])
                .with_failing_teardown(),
        );
        let library = MediaLibrary::open(root.path().join("videos")).await.unwrap();
        let controller = AcquisitionController::new(
            backend.clone(),
            library,
            AcquisitionConfig {
                sessions_dir: root.path().join("sessions"),
                poll_interval: Duration::from_millis(10),
                ..AcquisitionConfig::default()
            },
        );

        let file = controller
            .acquire(MAGNET, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(file.name, "Bao.2018.mp4");
        assert_eq!(
            std::fs::read(root.path().join("videos/Bao.2018.mp4")).unwrap(),
            b"payload"
        );
        assert_eq!(backend.teardowns(), 1);
        let storage_dir = &backend.storage_dirs()[0];
        assert!(storage_dir.is_absolute());
        assert!(!storage_dir.exists());
    }

    #[test]
    fn test_validate_locator() {
        assert!(matches!(
            validate_locator("   "),
            Err(AcquisitionError::InvalidLocator { .. })
        ));
        assert!(matches!(
            validate_locator("magnet:?not-a-magnet"),
            Err(AcquisitionError::InvalidLocator { .. })
        ));
        assert!(matches!(
            validate_locator("Bao.2018.mkv"),
            Err(AcquisitionError::InvalidLocator { .. })
        ));
        assert!(matches!(
            validate_locator("file:///etc/passwd"),
            Err(AcquisitionError::InvalidLocator { .. })
        ));
        assert_eq!(
            validate_locator(" https://example.org/file.torrent ").unwrap(),
            "https://example.org/file.torrent"
        );
        let magnet = "magnet:?xt=urn:btih:FAE25355ACCF4B0D49EAE2A8096606DB7D437A4F&dn=Bao";
        assert_eq!(validate_locator(magnet).unwrap(), magnet);
    }

    #[test]
    fn test_observed_progress_never_decreases() {
        let mut observed = ObservedProgress::default();
        let status = |progress| TransferStatus {
            progress,
            time_remaining: None,
            state: TransferState::Active,
            files: Vec::new(),
        };
        observed.update(&status(0.6));
        observed.update(&status(0.1));
        assert_eq!(observed.fraction, 0.6);
        observed.update(&status(1.7));
        assert_eq!(observed.fraction, 1.0);
    }

    #[test]
    fn test_base_name_strips_directories() {
        assert_eq!(base_name("Movie (2018)/Movie.mkv"), "Movie.mkv");
        assert_eq!(base_name("Movie.mkv"), "Movie.mkv");
    }
}
