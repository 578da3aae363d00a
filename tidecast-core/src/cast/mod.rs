//! Receiver discovery and playback dispatch.
//!
//! Receivers announce themselves on the local network; the dispatcher waits
//! for the configured one, hands it the playback URL and reports how that
//! went through a [`DispatchObserver`]. Dispatch outcomes never reach the
//! synchronous caller of the pipeline.

pub mod castv2;
mod dispatcher;
pub mod mdns;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
pub use castv2::CastV2Controller;
pub use dispatcher::{DispatchTicket, PlaybackDispatcher};
pub use mdns::MdnsDiscovery;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A device that accepts play commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receiver {
    /// User-visible name, matched against the configured target
    pub friendly_name: String,
    /// Stable device identifier; falls back to the address when not advertised
    pub id: String,
    pub model: String,
    /// Host name used for the TLS handshake
    pub host: String,
    pub address: SocketAddr,
}

/// What a receiver is asked to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLoad {
    pub url: String,
    pub content_type: String,
    pub title: String,
}

/// Live stream of receiver announcements.
///
/// Dropping or unsubscribing stops the underlying browse.
#[derive(Debug)]
pub struct ReceiverSubscription {
    receivers: mpsc::Receiver<Receiver>,
    stop: CancellationToken,
}

impl ReceiverSubscription {
    /// Wraps a channel fed by a discovery source. The source must stop
    /// browsing once `stop` is cancelled.
    pub fn new(receivers: mpsc::Receiver<Receiver>, stop: CancellationToken) -> Self {
        Self { receivers, stop }
    }

    /// Next announced receiver, or `None` once the source has stopped.
    pub async fn next(&mut self) -> Option<Receiver> {
        self.receivers.recv().await
    }

    pub fn unsubscribe(self) {
        tracing::debug!("Unsubscribing from receiver announcements");
    }
}

impl Drop for ReceiverSubscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Source of receiver announcements.
#[async_trait]
pub trait ReceiverDiscovery: Send + Sync {
    /// Starts browsing for receivers.
    ///
    /// # Errors
    /// - `DispatchError::Discovery` - Browse could not be started
    async fn subscribe(&self) -> Result<ReceiverSubscription, DispatchError>;
}

/// Issues play commands to receivers.
#[async_trait]
pub trait ReceiverController: Send + Sync {
    /// Asks `receiver` to load and start playing `media`.
    ///
    /// Returns once the receiver acknowledged the load.
    ///
    /// # Errors
    /// - `DispatchError::Connect` - Receiver unreachable
    /// - `DispatchError::Rejected` - Receiver refused to launch or load
    /// - `DispatchError::Timeout` - Receiver did not answer in time
    async fn play(&self, receiver: &Receiver, media: &MediaLoad) -> Result<(), DispatchError>;
}

/// Progress of a dispatch, delivered to its observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// The target receiver acknowledged the play command
    Playing { receiver: String, url: String },
    /// Discovery or a play attempt failed; `receiver` is `None` for discovery
    Failed {
        receiver: Option<String>,
        reason: String,
    },
    TimedOut { after: Duration },
    Cancelled,
}

/// Channel receiving [`DispatchEvent`]s.
pub type DispatchObserver = mpsc::UnboundedSender<DispatchEvent>;

/// Terminal result of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Playing { receiver: String },
    TimedOut,
    Cancelled,
    /// Discovery could not run or stopped early
    Aborted { reason: String },
}

/// Errors from discovery and receiver control.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Receiver discovery failed: {reason}")]
    Discovery { reason: String },

    #[error("Failed to connect to receiver at {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {reason}")]
    Tls { reason: String },

    #[error("Cast protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Receiver {receiver} rejected playback: {reason}")]
    Rejected { receiver: String, reason: String },

    #[error("Receiver did not answer {stage} in time")]
    Timeout { stage: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
