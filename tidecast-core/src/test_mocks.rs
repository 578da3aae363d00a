//! Mock collaborators for exercising the pipeline without aria2, ffmpeg or
//! a receiver on the network.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::acquisition::{
    TransferBackend, TransferError, TransferFile, TransferSession, TransferState, TransferStatus,
};
use crate::cast::{
    DispatchError, MediaLoad, Receiver, ReceiverController, ReceiverDiscovery,
    ReceiverSubscription,
};
use crate::normalize::{TranscodeError, TranscodeProgress, TranscodeRequest, Transcoder};

/// Minimal MP4 header accepted by the output validation.
pub const MP4_HEADER: &[u8] = b"\x00\x00\x00\x18ftypisom\x00\x00\x02\x00isomiso2";

/// File a mock session produces, relative to its storage directory.
#[derive(Debug, Clone)]
pub struct MockFile {
    pub path: String,
    pub contents: Vec<u8>,
}

impl MockFile {
    pub fn new(path: &str, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.to_string(),
            contents: contents.into(),
        }
    }
}

#[derive(Debug, Clone)]
enum SessionScript {
    Complete,
    Abort(String),
    Reject,
    /// Never completes
    Stall,
}

#[derive(Debug, Default)]
struct BackendCounters {
    opened: AtomicUsize,
    torn_down: AtomicUsize,
    storage_dirs: Mutex<Vec<PathBuf>>,
}

/// Transfer backend that writes scripted files into the session directory.
#[derive(Debug, Clone)]
pub struct MockTransferBackend {
    script: SessionScript,
    default_files: Vec<MockFile>,
    files_by_locator: HashMap<String, Vec<MockFile>>,
    polls_until_done: usize,
    teardown_fails: bool,
    counters: Arc<BackendCounters>,
}

impl Default for MockTransferBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransferBackend {
    /// Completes after a few polls with a single `movie.mp4`.
    pub fn new() -> Self {
        Self {
            script: SessionScript::Complete,
            default_files: vec![MockFile::new("Movie (2018)/movie.mp4", MP4_HEADER)],
            files_by_locator: HashMap::new(),
            polls_until_done: 3,
            teardown_fails: false,
            counters: Arc::new(BackendCounters::default()),
        }
    }

    /// Sessions end in an aborted state.
    pub fn aborting(reason: &str) -> Self {
        Self {
            script: SessionScript::Abort(reason.to_string()),
            ..Self::new()
        }
    }

    /// Every `open_session` call is refused.
    pub fn rejecting() -> Self {
        Self {
            script: SessionScript::Reject,
            ..Self::new()
        }
    }

    /// Sessions stay active forever.
    pub fn stalling() -> Self {
        Self {
            script: SessionScript::Stall,
            ..Self::new()
        }
    }

    /// Files produced by sessions for any locator without explicit files.
    pub fn with_files(mut self, files: Vec<MockFile>) -> Self {
        self.default_files = files;
        self
    }

    pub fn with_files_for(mut self, locator: &str, files: Vec<MockFile>) -> Self {
        self.files_by_locator.insert(locator.to_string(), files);
        self
    }

    /// Teardown reports an error and leaves the session data behind.
    pub fn with_failing_teardown(mut self) -> Self {
        self.teardown_fails = true;
        self
    }

    pub fn with_polls_until_done(mut self, polls: usize) -> Self {
        self.polls_until_done = polls.max(1);
        self
    }

    pub fn sessions_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.counters.torn_down.load(Ordering::SeqCst)
    }

    /// Storage directories handed to `open_session`, in call order.
    pub fn storage_dirs(&self) -> Vec<PathBuf> {
        self.counters.storage_dirs.lock().clone()
    }
}

#[async_trait]
impl TransferBackend for MockTransferBackend {
    async fn open_session(
        &self,
        locator: &str,
        storage_dir: &Path,
    ) -> Result<Box<dyn TransferSession>, TransferError> {
        if matches!(self.script, SessionScript::Reject) {
            return Err(TransferError::Rejected {
                method: "open_session".to_string(),
                code: 1,
                message: "mock backend rejects everything".to_string(),
            });
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.counters
            .storage_dirs
            .lock()
            .push(storage_dir.to_path_buf());

        let files = self
            .files_by_locator
            .get(locator)
            .unwrap_or(&self.default_files)
            .clone();
        Ok(Box::new(MockSession {
            locator: locator.to_string(),
            storage_dir: storage_dir.to_path_buf(),
            script: self.script.clone(),
            files,
            polls: 0,
            polls_until_done: self.polls_until_done,
            teardown_fails: self.teardown_fails,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MockSession {
    locator: String,
    storage_dir: PathBuf,
    script: SessionScript,
    files: Vec<MockFile>,
    polls: usize,
    polls_until_done: usize,
    teardown_fails: bool,
    counters: Arc<BackendCounters>,
}

#[async_trait]
impl TransferSession for MockSession {
    fn locator(&self) -> &str {
        &self.locator
    }

    async fn status(&mut self) -> Result<TransferStatus, TransferError> {
        self.polls += 1;
        let active = TransferStatus {
            progress: self.polls as f64 / self.polls_until_done as f64,
            time_remaining: Some(Duration::from_secs(60)),
            state: TransferState::Active,
            files: Vec::new(),
        };
        if self.polls < self.polls_until_done {
            return Ok(active);
        }

        match &self.script {
            SessionScript::Stall | SessionScript::Reject => Ok(TransferStatus {
                progress: 0.5,
                ..active
            }),
            SessionScript::Abort(reason) => Ok(TransferStatus {
                state: TransferState::Aborted {
                    reason: reason.clone(),
                },
                ..active
            }),
            SessionScript::Complete => {
                let mut files = Vec::new();
                for file in &self.files {
                    let path = self.storage_dir.join(&file.path);
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&path, &file.contents).await?;
                    files.push(TransferFile {
                        name: file.path.clone(),
                        path,
                        length: file.contents.len() as u64,
                    });
                }
                Ok(TransferStatus {
                    progress: 1.0,
                    time_remaining: None,
                    state: TransferState::Done,
                    files,
                })
            }
        }
    }

    async fn teardown(&mut self) -> Result<(), TransferError> {
        self.counters.torn_down.fetch_add(1, Ordering::SeqCst);
        if self.teardown_fails {
            return Err(TransferError::SessionFailed {
                reason: "mock backend lost the session".to_string(),
            });
        }
        // Like a real client dropping its data
        match tokio::fs::remove_dir_all(&self.storage_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Transcoder that writes a tiny MP4 header instead of running ffmpeg.
#[derive(Debug, Clone, Default)]
pub struct MockTranscoder {
    failure: Option<String>,
    delay: Duration,
    invocations: Arc<AtomicUsize>,
}

impl MockTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaves partial output behind and reports `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for MockTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        progress: watch::Sender<TranscodeProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !tokio::fs::try_exists(&request.input).await? {
            return Err(TranscodeError::Failed {
                reason: format!("{} does not exist", request.input.display()),
            });
        }

        let _ = progress.send(TranscodeProgress {
            percent: 50.0,
            eta: Some(self.delay),
        });
        tokio::select! {
            _ = cancel.cancelled() => return Err(TranscodeError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }

        if let Some(reason) = &self.failure {
            tokio::fs::write(&request.output, b"partial").await?;
            return Err(TranscodeError::Failed {
                reason: reason.clone(),
            });
        }

        tokio::fs::write(&request.output, MP4_HEADER).await?;
        let _ = progress.send(TranscodeProgress {
            percent: 100.0,
            eta: Some(Duration::ZERO),
        });
        Ok(())
    }
}

/// Builds a receiver announced at `ip`.
pub fn mock_receiver(name: &str, ip: &str) -> Receiver {
    let ip: IpAddr = ip.parse().unwrap_or(IpAddr::from([127, 0, 0, 1]));
    Receiver {
        friendly_name: name.to_string(),
        id: format!("{name}@{ip}"),
        model: "Chromecast".to_string(),
        host: ip.to_string(),
        address: SocketAddr::new(ip, 8009),
    }
}

/// Discovery that announces a fixed receiver list once per subscription.
#[derive(Debug, Default)]
pub struct MockDiscovery {
    receivers: Vec<Receiver>,
    unavailable: bool,
    subscriptions: Mutex<Vec<CancellationToken>>,
}

impl MockDiscovery {
    pub fn new(receivers: Vec<Receiver>) -> Self {
        Self {
            receivers,
            ..Self::default()
        }
    }

    /// Subscribing always fails.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Whether every subscription handed out has been released.
    pub fn all_unsubscribed(&self) -> bool {
        self.subscriptions.lock().iter().all(|stop| stop.is_cancelled())
    }
}

#[async_trait]
impl ReceiverDiscovery for MockDiscovery {
    async fn subscribe(&self) -> Result<ReceiverSubscription, DispatchError> {
        if self.unavailable {
            return Err(DispatchError::Discovery {
                reason: "mock network has no multicast".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        self.subscriptions.lock().push(stop.clone());

        let receivers = self.receivers.clone();
        let stopped = stop.clone();
        tokio::spawn(async move {
            for receiver in receivers {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if tx.send(receiver).await.is_err() {
                    return;
                }
            }
            // Keep the browse open until released
            stopped.cancelled().await;
        });

        Ok(ReceiverSubscription::new(rx, stop))
    }
}

/// Controller recording play commands.
#[derive(Debug, Default)]
pub struct MockController {
    failing: HashSet<String>,
    plays: Mutex<Vec<(String, MediaLoad)>>,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Play commands to the receiver with `id` fail.
    pub fn failing_for(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    /// Receiver name and media of every play command, in order.
    pub fn plays(&self) -> Vec<(String, MediaLoad)> {
        self.plays.lock().clone()
    }
}

#[async_trait]
impl ReceiverController for MockController {
    async fn play(&self, receiver: &Receiver, media: &MediaLoad) -> Result<(), DispatchError> {
        self.plays
            .lock()
            .push((receiver.friendly_name.clone(), media.clone()));
        if self.failing.contains(&receiver.id) {
            return Err(DispatchError::Rejected {
                receiver: receiver.friendly_name.clone(),
                reason: "LOAD_FAILED".to_string(),
            });
        }
        Ok(())
    }
}
