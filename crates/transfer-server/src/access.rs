use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::approval::ApprovalBroker;
use crate::AppState;

/// How long an operator's approval of an address lasts.
pub const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(60 * 60);

pub const ACCESS_DENIED: &str = "Access denied by host device.";

/// Addresses the operator has let in, each until its expiry.
#[derive(Debug)]
pub struct ApprovedIps {
    entries: Mutex<HashMap<IpAddr, Instant>>,
    validity: Duration,
}

impl ApprovedIps {
    pub fn new(validity: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            validity,
        }
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Drops expired entries, then reports whether `ip` is still trusted.
    pub fn is_approved(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expiry| *expiry > now);
        entries.contains_key(&ip)
    }

    pub fn approve(&self, ip: IpAddr) {
        let expiry = Instant::now() + self.validity;
        self.entries.lock().insert(ip, expiry);
    }

    pub fn revoke(&self, ip: IpAddr) -> bool {
        self.entries.lock().remove(&ip).is_some()
    }

    /// Live entries with their remaining validity.
    pub fn snapshot(&self) -> Vec<(IpAddr, Duration)> {
        let now = Instant::now();
        let mut live: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, expiry)| **expiry > now)
            .map(|(ip, expiry)| (*ip, *expiry - now))
            .collect();
        live.sort();
        live
    }
}

/// The IP approval gate: cached decisions first, then the operator.
#[derive(Clone)]
pub struct AccessControl {
    approved: Arc<ApprovedIps>,
    broker: ApprovalBroker,
}

impl AccessControl {
    pub fn new(validity: Duration) -> Self {
        let approved = Arc::new(ApprovedIps::new(validity));
        Self {
            broker: ApprovalBroker::new(Arc::clone(&approved)),
            approved,
        }
    }

    pub fn approved(&self) -> &ApprovedIps {
        &self.approved
    }

    pub fn broker(&self) -> &ApprovalBroker {
        &self.broker
    }

    /// Decide whether `ip` may proceed, suspending on the operator if needed.
    pub async fn check_ip(&self, ip: IpAddr, gate_enabled: bool) -> bool {
        if !gate_enabled {
            return true;
        }
        let ip = ip.to_canonical();
        if self.approved.is_approved(ip) {
            return true;
        }
        self.broker.request_approval(ip).await
    }

    /// Operator grant: settles a pending prompt or pre-approves the address.
    pub fn allow(&self, ip: IpAddr) {
        let ip = ip.to_canonical();
        self.approved.approve(ip);
        self.broker.resolve(ip, true);
    }

    /// Operator refusal: settles a pending prompt and forgets any earlier grant.
    pub fn deny(&self, ip: IpAddr) {
        let ip = ip.to_canonical();
        self.approved.revoke(ip);
        self.broker.resolve(ip, false);
    }
}

/// Axum middleware enforcing per-address operator approval.
pub async fn require_ip_approval(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let enabled = state.settings.current().ip_approval;
    if state.access.check_ip(addr.ip(), enabled).await {
        debug!(ip = %addr.ip(), "address approved");
        next.run(request).await
    } else {
        info!(ip = %addr.ip(), path = %request.uri().path(), "access denied");
        (StatusCode::FORBIDDEN, ACCESS_DENIED).into_response()
    }
}
