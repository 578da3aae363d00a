//! Pipeline orchestrator wiring acquisition, normalization and dispatch.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{PipelineError, PipelineState, PlaybackRequest};
use crate::acquisition::{AcquisitionController, Aria2Backend, TransferBackend, TransferError};
use crate::cast::{
    CastV2Controller, DispatchObserver, DispatchTicket, MdnsDiscovery, PlaybackDispatcher,
    ReceiverController, ReceiverDiscovery,
};
use crate::config::{PipelineConfig, TidecastConfig};
use crate::library::{LibraryError, MediaFile, MediaLibrary};
use crate::normalize::{FfmpegTranscoder, FormatNormalizer, Transcoder};

/// Result of a request that reached dispatch.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// The library file handed to the receiver
    pub file: MediaFile,
    pub media_url: String,
    /// Background dispatch; its result never affects the request
    pub dispatch: DispatchTicket,
    /// Every state the request went through, in order
    pub transitions: Vec<PipelineState>,
}

/// Runs playback requests end to end.
///
/// Holds no per-request state; concurrent `run` calls are independent.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    library: MediaLibrary,
    acquisition: AcquisitionController,
    normalizer: FormatNormalizer,
    dispatcher: PlaybackDispatcher,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    /// Builds an orchestrator from explicit collaborators.
    pub fn new(
        config: &TidecastConfig,
        backend: Arc<dyn TransferBackend>,
        transcoder: Arc<dyn Transcoder>,
        discovery: Arc<dyn ReceiverDiscovery>,
        controller: Arc<dyn ReceiverController>,
    ) -> Self {
        let library = MediaLibrary::new(&config.library.directory);
        Self {
            acquisition: AcquisitionController::new(
                backend,
                library.clone(),
                config.acquisition.clone(),
            ),
            normalizer: FormatNormalizer::new(
                transcoder,
                library.clone(),
                config.normalization.clone(),
            ),
            dispatcher: PlaybackDispatcher::new(
                discovery,
                controller,
                config.cast.clone(),
                config.server.media_base_url(),
            ),
            library,
            config: config.pipeline.clone(),
        }
    }

    /// Builds an orchestrator talking to aria2, ffmpeg and Cast receivers.
    ///
    /// # Errors
    /// - `TransferError::Http` - aria2 client could not be created
    pub fn production(config: &TidecastConfig) -> Result<Self, TransferError> {
        Ok(Self::new(
            config,
            Arc::new(Aria2Backend::new(&config.acquisition)?),
            Arc::new(FfmpegTranscoder::new(&config.normalization)),
            Arc::new(MdnsDiscovery::new(config.cast.service_type.clone())),
            Arc::new(CastV2Controller::new(&config.cast)),
        ))
    }

    pub fn library(&self) -> &MediaLibrary {
        &self.library
    }

    /// Runs `request` up to the point where dispatch has been issued.
    ///
    /// # Errors
    /// - `PipelineError::FileNotFound` - Requested or produced file is not in the library
    /// - `PipelineError::Acquisition` - Transfer failed or produced no playable file
    /// - `PipelineError::Normalization` - Transcoding failed
    /// - `PipelineError::Cancelled` - `cancel` fired before dispatch
    pub async fn run(
        &self,
        request: PlaybackRequest,
        observer: Option<DispatchObserver>,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut transitions = Transitions::default();
        transitions.enter(PipelineState::Received);

        match self.execute(request, observer, cancel, &mut transitions).await {
            Ok((file, dispatch)) => {
                transitions.enter(PipelineState::Done);
                Ok(PipelineOutcome {
                    media_url: dispatch.url().to_string(),
                    file,
                    dispatch,
                    transitions: transitions.states,
                })
            }
            Err(e) => {
                transitions.enter(PipelineState::Failed(e.kind()));
                tracing::error!("Request failed: {}", e);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        request: PlaybackRequest,
        observer: Option<DispatchObserver>,
        cancel: &CancellationToken,
        transitions: &mut Transitions,
    ) -> Result<(MediaFile, DispatchTicket), PipelineError> {
        let (name, normalize) = match request {
            PlaybackRequest::Local { file_name } => {
                transitions.enter(PipelineState::Local);
                (file_name, self.config.normalize_local_files)
            }
            PlaybackRequest::Transfer { locator } => {
                transitions.enter(PipelineState::Acquiring);
                let file = self.acquisition.acquire(&locator, cancel).await?;
                (file.name, self.config.normalize_transfers)
            }
        };

        let name = if normalize {
            transitions.enter(PipelineState::Normalizing);
            self.normalizer.normalize(&name, cancel).await?
        } else {
            name
        };

        let file = match self.library.media_file(&name).await {
            Ok(file) => file,
            Err(LibraryError::NotFound { .. } | LibraryError::InvalidName { .. }) => {
                return Err(PipelineError::FileNotFound { name });
            }
            Err(e) => return Err(e.into()),
        };
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        transitions.enter(PipelineState::Dispatching);
        let ticket = self
            .dispatcher
            .dispatch(&file.name, observer, cancel.child_token());
        Ok((file, ticket))
    }
}

#[derive(Debug, Default)]
struct Transitions {
    states: Vec<PipelineState>,
}

impl Transitions {
    fn enter(&mut self, state: PipelineState) {
        match self.states.last() {
            Some(previous) => tracing::info!("Request {} -> {}", previous, state),
            None => tracing::debug!("Request {}", state),
        }
        self.states.push(state);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    use super::*;
    use crate::cast::{DispatchEvent, DispatchOutcome};
    use crate::pipeline::FailureKind;
    use crate::test_mocks::{
        MockController, MockDiscovery, MockFile, MockTranscoder, MockTransferBackend, mock_receiver,
    };

    struct Harness {
        _root: tempfile::TempDir,
        config: TidecastConfig,
        backend: Arc<MockTransferBackend>,
        transcoder: Arc<MockTranscoder>,
        controller: Arc<MockController>,
    }

    impl Harness {
        fn new(backend: MockTransferBackend, controller: MockController) -> Self {
            let root = tempdir().unwrap();
            let config = TidecastConfig::for_testing().with_storage_root(root.path());
            std::fs::create_dir_all(&config.library.directory).unwrap();
            Self {
                _root: root,
                config,
                backend: Arc::new(backend),
                transcoder: Arc::new(MockTranscoder::new()),
                controller: Arc::new(controller),
            }
        }

        fn orchestrator(&self) -> PipelineOrchestrator {
            PipelineOrchestrator::new(
                &self.config,
                self.backend.clone(),
                self.transcoder.clone(),
                Arc::new(MockDiscovery::new(vec![mock_receiver("TV", "10.0.0.6")])),
                self.controller.clone(),
            )
        }

        fn add_library_file(&self, name: &str) {
            std::fs::write(self.config.library.directory.join(name), b"media").unwrap();
        }
    }

    #[tokio::test]
    async fn test_local_compatible_file_is_dispatched_unchanged() {
        let h = Harness::new(MockTransferBackend::new(), MockController::new());
        h.add_library_file("clip.mp4");

        let outcome = h
            .orchestrator()
            .run(
                PlaybackRequest::Local {
                    file_name: "clip.mp4".to_string(),
                },
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.file.name, "clip.mp4");
        assert_eq!(outcome.media_url, "http://127.0.0.1:8008/videos/clip.mp4");
        assert_eq!(
            outcome.transitions,
            vec![
                PipelineState::Received,
                PipelineState::Local,
                PipelineState::Normalizing,
                PipelineState::Dispatching,
                PipelineState::Done,
            ]
        );
        assert_eq!(h.transcoder.invocations(), 0);
        assert_eq!(h.backend.sessions_opened(), 0);
        assert!(matches!(
            outcome.dispatch.outcome().await,
            DispatchOutcome::Playing { .. }
        ));
    }

    #[tokio::test]
    async fn test_local_legacy_file_is_normalized_before_dispatch() {
        let h = Harness::new(MockTransferBackend::new(), MockController::new());
        h.add_library_file("Bao.2018.mkv");

        let outcome = h
            .orchestrator()
            .run(
                PlaybackRequest::Local {
                    file_name: "Bao.2018.mkv".to_string(),
                },
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.file.name, "Bao.2018.mp4");
        assert_eq!(h.transcoder.invocations(), 1);
        outcome.dispatch.outcome().await;
        assert_eq!(h.controller.plays()[0].1.content_type, "video/mp4");
    }

    #[tokio::test]
    async fn test_normalization_can_be_disabled() {
        let mut h = Harness::new(MockTransferBackend::new(), MockController::new());
        h.config.pipeline.normalize_local_files = false;
        h.add_library_file("Bao.2018.mkv");

        let outcome = h
            .orchestrator()
            .run(
                PlaybackRequest::Local {
                    file_name: "Bao.2018.mkv".to_string(),
                },
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.file.name, "Bao.2018.mkv");
        assert!(!outcome.transitions.contains(&PipelineState::Normalizing));
        assert_eq!(h.transcoder.invocations(), 0);
    }

    #[tokio::test]
    async fn test_missing_local_file_fails_before_dispatch() {
        let h = Harness::new(MockTransferBackend::new(), MockController::new());

        let err = h
            .orchestrator()
            .run(
                PlaybackRequest::Local {
                    file_name: "ghost.mp4".to_string(),
                },
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::FileNotFound { .. }));
        assert_eq!(err.kind(), FailureKind::InvalidRequest);
        assert!(h.controller.plays().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_is_acquired_normalized_and_dispatched() {
        let backend = MockTransferBackend::new().with_files(vec![
            MockFile::new("Bao (2018)/Bao.2018.720p.mkv", "matroska"),
            MockFile::new("Bao (2018)/www.YTS.AM.jpg", "jpeg"),
        ]);
        let h = Harness::new(backend, MockController::new());

        let outcome = h
            .orchestrator()
            .run(
                PlaybackRequest::Transfer {
                    locator: "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567".to_string(),
                },
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.file.name, "Bao.2018.720p.mp4");
        assert_eq!(
            outcome.transitions,
            vec![
                PipelineState::Received,
                PipelineState::Acquiring,
                PipelineState::Normalizing,
                PipelineState::Dispatching,
                PipelineState::Done,
            ]
        );
        assert_eq!(h.backend.teardowns(), 1);
        assert!(h.config.library.directory.join("Bao.2018.720p.mkv").exists());
    }

    #[tokio::test]
    async fn test_transfer_without_video_fails() {
        let backend =
            MockTransferBackend::new().with_files(vec![MockFile::new("readme.txt", "hello")]);
        let h = Harness::new(backend, MockController::new());

        let err = h
            .orchestrator()
            .run(
                PlaybackRequest::Transfer {
                    locator: "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567".to_string(),
                },
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::NoPlayableFile);
        assert_eq!(h.backend.teardowns(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_does_not_fail_request() {
        let receiver = mock_receiver("TV", "10.0.0.6");
        let h = Harness::new(
            MockTransferBackend::new(),
            MockController::new().failing_for(&receiver.id),
        );
        h.add_library_file("clip.mp4");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = h
            .orchestrator()
            .run(
                PlaybackRequest::Local {
                    file_name: "clip.mp4".to_string(),
                },
                Some(tx),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.dispatch.outcome().await, DispatchOutcome::TimedOut);
        assert!(matches!(rx.recv().await, Some(DispatchEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn test_request_cancel_reaches_dispatch() {
        let h = Harness::new(MockTransferBackend::new(), MockController::new());
        h.add_library_file("clip.mp4");
        let cancel = CancellationToken::new();

        let outcome = h
            .orchestrator()
            .run(
                PlaybackRequest::Local {
                    file_name: "clip.mp4".to_string(),
                },
                None,
                &cancel,
            )
            .await
            .unwrap();

        assert!(!outcome.dispatch.cancellation_token().is_cancelled());
        cancel.cancel();
        assert!(outcome.dispatch.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_transfer() {
        let h = Harness::new(MockTransferBackend::stalling(), MockController::new());
        let cancel = CancellationToken::new();
        let orchestrator = h.orchestrator();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = orchestrator
            .run(
                PlaybackRequest::Transfer {
                    locator: "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567".to_string(),
                },
                None,
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Cancelled);
        assert_eq!(h.backend.teardowns(), 1);
        assert!(h.controller.plays().is_empty());
    }
}
