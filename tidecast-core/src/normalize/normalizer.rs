//! Format normalizer deciding whether and how a library file is transcoded.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{
    NormalizationError, TranscodeError, TranscodeProgress, TranscodeRequest, Transcoder,
    replace_suffix,
};
use crate::config::NormalizationConfig;
use crate::library::{MediaLibrary, has_suffix};

/// Transcode work for one legacy file; discarded once it finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationJob {
    pub source: String,
    pub target: String,
    pub target_format: String,
}

/// What `normalize` would do for a given name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizationPlan {
    /// Already playable; the name is returned as-is
    Unchanged(String),
    Transcode(NormalizationJob),
}

/// Transcodes legacy containers into the receiver-compatible one.
///
/// Each call is independent; concurrent normalizations only share the
/// library directory, and only publish through an atomic rename.
#[derive(Clone)]
pub struct FormatNormalizer {
    transcoder: Arc<dyn Transcoder>,
    library: MediaLibrary,
    config: NormalizationConfig,
}

impl FormatNormalizer {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        library: MediaLibrary,
        config: NormalizationConfig,
    ) -> Self {
        Self {
            transcoder,
            library,
            config,
        }
    }

    /// Decides whether `file_name` needs a transcode.
    pub fn plan(&self, file_name: &str) -> NormalizationPlan {
        if !has_suffix(file_name, &self.config.legacy_suffix) {
            return NormalizationPlan::Unchanged(file_name.to_string());
        }
        NormalizationPlan::Transcode(NormalizationJob {
            source: file_name.to_string(),
            target: replace_suffix(file_name, &self.config.compatible_suffix),
            target_format: self.config.compatible_suffix.clone(),
        })
    }

    /// Returns the name of a receiver-compatible version of `file_name`.
    ///
    /// The returned name only ever refers to a complete file: the transcoder
    /// writes to a hidden staging file that is renamed into place after it
    /// reports success.
    ///
    /// # Errors
    /// - `NormalizationError::SourceMissing` - `file_name` is not in the library
    /// - `NormalizationError::TranscodeFailed` - Transcoder failed; nothing published
    /// - `NormalizationError::Library` - Staging or commit failed
    /// - `NormalizationError::Cancelled` - `cancel` fired while transcoding
    pub async fn normalize(
        &self,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, NormalizationError> {
        let job = match self.plan(file_name) {
            NormalizationPlan::Unchanged(name) => {
                tracing::debug!("{} is already receiver compatible", name);
                return Ok(name);
            }
            NormalizationPlan::Transcode(job) => job,
        };

        if !self.library.contains(&job.source).await {
            return Err(NormalizationError::SourceMissing { name: job.source });
        }
        if self.library.contains(&job.target).await {
            tracing::info!("Reusing existing {} for {}", job.target, job.source);
            return Ok(job.target);
        }

        let request = TranscodeRequest {
            input: self.library.path_for(&job.source)?,
            output: self.library.staging_path(&job.target)?,
            container: job.target_format.clone(),
        };

        tracing::info!(
            "{} is {}, converting to {}",
            job.source,
            self.config.legacy_suffix,
            job.target_format
        );

        match self.run(&job, &request, cancel).await {
            Ok(()) => {
                let file = self.library.commit(&request.output, &job.target).await?;
                tracing::info!("Conversion complete: {} ({})", file.name, file.size_label());
                Ok(file.name)
            }
            Err(e) => {
                self.library.discard(&request.output).await;
                tracing::error!("Conversion of {} failed: {}", job.source, e);
                Err(match e {
                    TranscodeError::Cancelled => NormalizationError::Cancelled { name: job.source },
                    source => NormalizationError::TranscodeFailed {
                        name: job.source,
                        source,
                    },
                })
            }
        }
    }

    /// Runs the transcoder while logging its latest progress on a fixed
    /// interval. Logging never delays completion.
    async fn run(
        &self,
        job: &NormalizationJob,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        let (progress_tx, progress_rx) = watch::channel(TranscodeProgress::default());
        let transcode = self.transcoder.transcode(request, progress_tx, cancel);
        tokio::pin!(transcode);

        let mut report = tokio::time::interval(self.config.progress_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        report.tick().await;

        loop {
            tokio::select! {
                result = &mut transcode => return result,
                _ = report.tick() => {
                    let progress = *progress_rx.borrow();
                    let eta = progress
                        .eta
                        .map(|eta| format!("{}s", eta.as_secs()))
                        .unwrap_or_else(|| "unknown".to_string());
                    tracing::info!(
                        source = %job.source,
                        "Percent complete: {:.2}, ETA: {}",
                        progress.percent,
                        eta
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::*;
    use crate::test_mocks::MockTranscoder;

    fn normalizer(dir: &std::path::Path, transcoder: Arc<MockTranscoder>) -> FormatNormalizer {
        let config = crate::config::TidecastConfig::for_testing().normalization;
        FormatNormalizer::new(transcoder, MediaLibrary::new(dir), config)
    }

    #[test]
    fn test_plan() {
        let n = normalizer(&PathBuf::from("/unused"), Arc::new(MockTranscoder::new()));
        assert_eq!(
            n.plan("clip.mp4"),
            NormalizationPlan::Unchanged("clip.mp4".to_string())
        );
        assert_eq!(
            n.plan("Bao.2018.MKV"),
            NormalizationPlan::Transcode(NormalizationJob {
                source: "Bao.2018.MKV".to_string(),
                target: "Bao.2018.mp4".to_string(),
                target_format: "mp4".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_compatible_input_is_returned_without_job() {
        let dir = tempdir().unwrap();
        let transcoder = Arc::new(MockTranscoder::new());
        let n = normalizer(dir.path(), transcoder.clone());

        let name = n.normalize("clip.avi", &CancellationToken::new()).await.unwrap();

        assert_eq!(name, "clip.avi");
        assert_eq!(transcoder.invocations(), 0);
    }

    #[tokio::test]
    async fn test_legacy_input_is_transcoded_and_committed() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("movie.mkv"), b"matroska").unwrap();
        let transcoder = Arc::new(MockTranscoder::new());
        let n = normalizer(dir.path(), transcoder.clone());

        let name = n.normalize("movie.mkv", &CancellationToken::new()).await.unwrap();

        assert_eq!(name, "movie.mp4");
        assert_eq!(transcoder.invocations(), 1);
        assert!(dir.path().join("movie.mp4").exists());
        // Source is superseded, not deleted
        assert!(dir.path().join("movie.mkv").exists());
    }

    #[tokio::test]
    async fn test_failed_transcode_publishes_nothing() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("broken.mkv"), b"garbage").unwrap();
        let n = normalizer(dir.path(), Arc::new(MockTranscoder::failing("invalid data")));

        let result = n.normalize("broken.mkv", &CancellationToken::new()).await;

        assert!(matches!(result, Err(NormalizationError::TranscodeFailed { .. })));
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["broken.mkv"]);
    }

    #[tokio::test]
    async fn test_missing_source() {
        let dir = tempdir().unwrap();
        let n = normalizer(dir.path(), Arc::new(MockTranscoder::new()));
        assert!(matches!(
            n.normalize("ghost.mkv", &CancellationToken::new()).await,
            Err(NormalizationError::SourceMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_existing_target_is_reused() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("movie.mkv"), b"matroska").unwrap();
        std::fs::write(dir.path().join("movie.mp4"), b"mp4").unwrap();
        let transcoder = Arc::new(MockTranscoder::new());
        let n = normalizer(dir.path(), transcoder.clone());

        let name = n.normalize("movie.mkv", &CancellationToken::new()).await.unwrap();

        assert_eq!(name, "movie.mp4");
        assert_eq!(transcoder.invocations(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_transcode() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("movie.mkv"), b"matroska").unwrap();
        let transcoder =
            Arc::new(MockTranscoder::new().with_delay(std::time::Duration::from_secs(5)));
        let n = normalizer(dir.path(), transcoder);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = n.normalize("movie.mkv", &cancel).await;

        assert!(matches!(result, Err(NormalizationError::Cancelled { .. })));
        assert!(!dir.path().join("movie.mp4").exists());
    }
}
