//! mDNS receiver discovery.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ResolvedService, ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DispatchError, Receiver, ReceiverDiscovery, ReceiverSubscription};

const BROWSE_POLL: Duration = Duration::from_millis(250);

/// Browses a DNS-SD service type and reports every resolved instance.
#[derive(Debug, Clone)]
pub struct MdnsDiscovery {
    service_type: String,
}

impl MdnsDiscovery {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
        }
    }
}

#[async_trait]
impl ReceiverDiscovery for MdnsDiscovery {
    async fn subscribe(&self) -> Result<ReceiverSubscription, DispatchError> {
        let daemon = ServiceDaemon::new().map_err(|e| DispatchError::Discovery {
            reason: format!("failed to start mDNS daemon: {e}"),
        })?;
        let browse = daemon
            .browse(&self.service_type)
            .map_err(|e| DispatchError::Discovery {
                reason: format!("failed to browse {}: {e}", self.service_type),
            })?;

        let (tx, rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let service_type = self.service_type.clone();

        tracing::debug!("Browsing for {}", service_type);
        // The daemon channel is blocking; poll it off the runtime
        tokio::task::spawn_blocking(move || {
            let poll = || match browse.recv_timeout(BROWSE_POLL) {
                Ok(event) => BrowsePoll::Event(event),
                Err(_) if browse.is_disconnected() => BrowsePoll::Closed,
                Err(_) => BrowsePoll::Idle,
            };
            run_browse(&stopped, poll, |event| {
                let ServiceEvent::ServiceResolved(service) = event else {
                    return true;
                };
                let Some(receiver) = receiver_from_service(&service, &service_type) else {
                    tracing::debug!("Ignoring {} without IPv4 address", service.get_fullname());
                    return true;
                };
                tx.blocking_send(receiver).is_ok()
            });
            if let Err(e) = daemon.stop_browse(&service_type) {
                tracing::debug!("Failed to stop mDNS browse: {}", e);
            }
            if let Err(e) = daemon.shutdown() {
                tracing::debug!("Failed to shut down mDNS daemon: {}", e);
            }
        });

        Ok(ReceiverSubscription::new(rx, stop))
    }
}

enum BrowsePoll<E> {
    Event(E),
    Idle,
    /// The daemon dropped its side of the channel
    Closed,
}

/// Feeds browse events to `on_event` until `stop` fires, the channel closes
/// or `on_event` returns `false`.
fn run_browse<E>(
    stop: &CancellationToken,
    mut poll: impl FnMut() -> BrowsePoll<E>,
    mut on_event: impl FnMut(E) -> bool,
) {
    while !stop.is_cancelled() {
        match poll() {
            BrowsePoll::Event(event) => {
                if !on_event(event) {
                    return;
                }
            }
            BrowsePoll::Idle => {}
            BrowsePoll::Closed => {
                tracing::warn!("mDNS daemon stopped reporting events");
                return;
            }
        }
    }
}

fn receiver_from_service(service: &ResolvedService, service_type: &str) -> Option<Receiver> {
    let mut addresses: Vec<_> = service.get_addresses_v4().iter().copied().collect();
    addresses.sort();
    let ip = IpAddr::V4(*addresses.first()?);
    let address = SocketAddr::new(ip, service.get_port());

    let txt = |key: &str| {
        service
            .get_property_val_str(key)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    Some(Receiver {
        friendly_name: txt("fn")
            .unwrap_or_else(|| instance_name(service.get_fullname(), service_type)),
        id: txt("id").unwrap_or_else(|| address.to_string()),
        model: txt("md").unwrap_or_default(),
        host: service.get_hostname().trim_end_matches('.').to_string(),
        address,
    })
}

/// Instance label of a full service name, e.g. `Living Room` from
/// `Living Room._googlecast._tcp.local.`.
fn instance_name(fullname: &str, service_type: &str) -> String {
    let suffix = format!(".{}", service_type.trim_start_matches('.'));
    fullname
        .strip_suffix(&suffix)
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}
