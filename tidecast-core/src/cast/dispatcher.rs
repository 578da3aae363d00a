//! Playback dispatcher matching announced receivers against the target.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    DispatchEvent, DispatchObserver, DispatchOutcome, MediaLoad, Receiver, ReceiverController,
    ReceiverDiscovery, ReceiverSubscription,
};
use crate::config::CastConfig;

/// Sends library files to the configured receiver.
#[derive(Clone)]
pub struct PlaybackDispatcher {
    discovery: Arc<dyn ReceiverDiscovery>,
    controller: Arc<dyn ReceiverController>,
    config: CastConfig,
    media_base_url: String,
}

/// Handle to a running dispatch.
#[derive(Debug)]
pub struct DispatchTicket {
    url: String,
    cancel: CancellationToken,
    handle: JoinHandle<DispatchOutcome>,
}

impl DispatchTicket {
    /// Playback URL handed to the receiver.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Waits for the dispatch to finish.
    pub async fn outcome(self) -> DispatchOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => DispatchOutcome::Aborted {
                reason: format!("dispatch task failed: {e}"),
            },
        }
    }
}

impl PlaybackDispatcher {
    /// `media_base_url` is the public URL of the served library directory,
    /// without a trailing slash.
    pub fn new(
        discovery: Arc<dyn ReceiverDiscovery>,
        controller: Arc<dyn ReceiverController>,
        config: CastConfig,
        media_base_url: impl Into<String>,
    ) -> Self {
        Self {
            discovery,
            controller,
            config,
            media_base_url: media_base_url.into(),
        }
    }

    /// Public URL under which the library serves `file_name`.
    pub fn media_url(&self, file_name: &str) -> String {
        format!(
            "{}/{}",
            self.media_base_url.trim_end_matches('/'),
            urlencoding::encode(file_name)
        )
    }

    /// Starts discovery for the configured receiver and returns immediately.
    ///
    /// Failures are delivered to `observer` when given and logged in any
    /// case; they never surface here.
    pub fn dispatch(
        &self,
        file_name: &str,
        observer: Option<DispatchObserver>,
        cancel: CancellationToken,
    ) -> DispatchTicket {
        let url = self.media_url(file_name);
        let content_type = mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        tracing::info!(
            "Looking for receiver \"{}\" to play {}",
            self.config.receiver_name,
            file_name
        );

        let task = DispatchTask {
            discovery: Arc::clone(&self.discovery),
            controller: Arc::clone(&self.controller),
            target: self.config.receiver_name.clone(),
            timeout: self.config.discovery_timeout,
            media: MediaLoad {
                url: url.clone(),
                content_type,
                title: file_name.to_string(),
            },
            observer,
            cancel: cancel.clone(),
        };

        DispatchTicket {
            url,
            cancel,
            handle: tokio::spawn(task.run()),
        }
    }
}

enum Step {
    Cancelled,
    TimedOut,
    Announced(Option<Receiver>),
}

struct DispatchTask {
    discovery: Arc<dyn ReceiverDiscovery>,
    controller: Arc<dyn ReceiverController>,
    target: String,
    timeout: Duration,
    media: MediaLoad,
    observer: Option<DispatchObserver>,
    cancel: CancellationToken,
}

impl DispatchTask {
    async fn run(self) -> DispatchOutcome {
        let subscribed = tokio::select! {
            _ = self.cancel.cancelled() => return self.cancelled(None),
            subscribed = self.discovery.subscribe() => subscribed,
        };
        let mut subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!("Receiver discovery failed: {}", e);
                self.emit(DispatchEvent::Failed {
                    receiver: None,
                    reason: e.to_string(),
                });
                return DispatchOutcome::Aborted {
                    reason: e.to_string(),
                };
            }
        };

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut attempted = HashSet::new();

        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Cancelled,
                _ = &mut deadline => Step::TimedOut,
                announced = subscription.next() => Step::Announced(announced),
            };
            let receiver = match step {
                Step::Cancelled => return self.cancelled(Some(subscription)),
                Step::TimedOut => {
                    subscription.unsubscribe();
                    tracing::warn!(
                        "Receiver \"{}\" not found within {:?}",
                        self.target,
                        self.timeout
                    );
                    self.emit(DispatchEvent::TimedOut { after: self.timeout });
                    return DispatchOutcome::TimedOut;
                }
                Step::Announced(Some(receiver)) => receiver,
                Step::Announced(None) => {
                    let reason = "receiver discovery stopped".to_string();
                    tracing::error!("{}", reason);
                    self.emit(DispatchEvent::Failed {
                        receiver: None,
                        reason: reason.clone(),
                    });
                    return DispatchOutcome::Aborted { reason };
                }
            };

            if receiver.friendly_name != self.target {
                tracing::debug!(
                    "Ignoring receiver \"{}\" ({})",
                    receiver.friendly_name,
                    receiver.address
                );
                continue;
            }
            if !attempted.insert(receiver.id.clone()) {
                tracing::debug!("Receiver \"{}\" already attempted", receiver.friendly_name);
                continue;
            }

            let played = tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled(Some(subscription)),
                played = self.play(&receiver) => played,
            };
            if played {
                subscription.unsubscribe();
                return DispatchOutcome::Playing {
                    receiver: receiver.friendly_name,
                };
            }
        }
    }

    async fn play(&self, receiver: &Receiver) -> bool {
        tracing::info!(
            "Found receiver \"{}\" at {}, casting {}",
            receiver.friendly_name,
            receiver.address,
            self.media.url
        );
        match self.controller.play(receiver, &self.media).await {
            Ok(()) => {
                tracing::info!("\"{}\" is playing {}", receiver.friendly_name, self.media.title);
                self.emit(DispatchEvent::Playing {
                    receiver: receiver.friendly_name.clone(),
                    url: self.media.url.clone(),
                });
                true
            }
            Err(e) => {
                tracing::error!("Failed to play on \"{}\": {}", receiver.friendly_name, e);
                self.emit(DispatchEvent::Failed {
                    receiver: Some(receiver.friendly_name.clone()),
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    fn cancelled(&self, subscription: Option<ReceiverSubscription>) -> DispatchOutcome {
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        tracing::info!("Dispatch of {} cancelled", self.media.title);
        self.emit(DispatchEvent::Cancelled);
        DispatchOutcome::Cancelled
    }

    fn emit(&self, event: DispatchEvent) {
        if let Some(observer) = &self.observer
            && observer.send(event).is_err()
        {
            tracing::debug!("Dispatch observer went away");
        }
    }
}
