//! Observes which LAN address clients can reach us on.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of the current outward-facing address.
pub trait AddressSource: Send + Sync + 'static {
    fn local_address(&self) -> Option<IpAddr>;
}

/// Asks the routing table which local address would reach `target`.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
#[derive(Debug, Clone)]
pub struct UdpRouteLookup {
    target: SocketAddr,
}

impl Default for UdpRouteLookup {
    fn default() -> Self {
        Self {
            target: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80),
        }
    }
}

impl UdpRouteLookup {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl AddressSource for UdpRouteLookup {
    fn local_address(&self) -> Option<IpAddr> {
        let bind: SocketAddr = match self.target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).ok()?;
        socket.connect(self.target).ok()?;
        let ip = socket.local_addr().ok()?.ip();
        (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
    }
}

/// An address that never changes, for pinned hosts and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedAddress(pub Option<IpAddr>);

impl AddressSource for FixedAddress {
    fn local_address(&self) -> Option<IpAddr> {
        self.0
    }
}

/// Publishes the observed address on a watch channel, only when it changes.
#[derive(Clone)]
pub struct NetworkMonitor {
    source: Arc<dyn AddressSource>,
    tx: Arc<watch::Sender<Option<IpAddr>>>,
}

impl NetworkMonitor {
    pub fn new(source: impl AddressSource) -> Self {
        let source: Arc<dyn AddressSource> = Arc::new(source);
        let (tx, _) = watch::channel(source.local_address());
        Self {
            source,
            tx: Arc::new(tx),
        }
    }

    pub fn current(&self) -> Option<IpAddr> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<IpAddr>> {
        self.tx.subscribe()
    }

    /// Record an externally observed address. Returns whether it changed.
    pub fn set(&self, ip: Option<IpAddr>) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == ip {
                return false;
            }
            *current = ip;
            true
        });
        if changed {
            match ip {
                Some(ip) => info!(%ip, "network address available"),
                None => warn!("network address lost"),
            }
        }
        changed
    }

    /// Look the address up once, off the async workers.
    pub async fn refresh(&self) -> bool {
        let source = Arc::clone(&self.source);
        match tokio::task::spawn_blocking(move || source.local_address()).await {
            Ok(ip) => self.set(ip),
            Err(e) => {
                debug!(error = %e, "address lookup task failed");
                false
            }
        }
    }

    /// Look again every `interval` until `shutdown` fires.
    pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.refresh().await;
                    }
                }
            }
            debug!("network monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Scripted(Mutex<Option<IpAddr>>);

    impl AddressSource for Arc<Scripted> {
        fn local_address(&self) -> Option<IpAddr> {
            *self.0.lock()
        }
    }

    const LAN: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 12));

    #[tokio::test]
    async fn refresh_publishes_only_changes() {
        let script = Arc::new(Scripted(Mutex::new(Some(LAN))));
        let monitor = NetworkMonitor::new(Arc::clone(&script));
        assert_eq!(monitor.current(), Some(LAN));

        let mut rx = monitor.subscribe();
        assert!(!monitor.refresh().await);
        assert!(!rx.has_changed().unwrap());

        *script.0.lock() = None;
        assert!(monitor.refresh().await);
        assert_eq!(*rx.borrow_and_update(), None);
    }

    #[test]
    fn fixed_address_is_reported() {
        let monitor = NetworkMonitor::new(FixedAddress(Some(LAN)));
        assert_eq!(monitor.current(), Some(LAN));
        assert!(monitor.set(None));
        assert!(!monitor.set(None));
    }

    #[test]
    fn udp_route_never_reports_loopback() {
        let route = UdpRouteLookup::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9));
        assert_eq!(route.local_address(), None);
    }
}
