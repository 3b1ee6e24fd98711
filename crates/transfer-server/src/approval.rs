//! Single-flight bridge between suspended requests and the operator's decision.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::access::{ApprovedIps, DEFAULT_APPROVAL_TTL};

const EVENT_CAPACITY: usize = 32;

/// Prompts for whatever decision surface is attached (console, UI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ApprovalEvent {
    /// A new client is waiting; show a prompt.
    Requested { ip: IpAddr },
    /// Every waiter for this IP went away; drop the prompt.
    Withdrawn { ip: IpAddr },
    Resolved { ip: IpAddr, approved: bool },
}

struct Pending {
    id: u64,
    decision: watch::Sender<Option<bool>>,
}

struct Inner {
    pending: Mutex<HashMap<IpAddr, Pending>>,
    /// Written under the `pending` lock so a decision and its record are one step.
    approved: Arc<ApprovedIps>,
    events: broadcast::Sender<ApprovalEvent>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct ApprovalBroker {
    inner: Arc<Inner>,
}

impl Default for ApprovalBroker {
    fn default() -> Self {
        Self::new(Arc::new(ApprovedIps::new(DEFAULT_APPROVAL_TTL)))
    }
}

impl ApprovalBroker {
    /// Approvals granted through this broker are recorded in `approved`.
    pub fn new(approved: Arc<ApprovedIps>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                approved,
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.inner.events.subscribe()
    }

    /// Addresses currently waiting on a decision.
    pub fn pending(&self) -> Vec<IpAddr> {
        let mut ips: Vec<_> = self.inner.pending.lock().keys().copied().collect();
        ips.sort();
        ips
    }

    /// Wait for the operator to decide on `ip`.
    ///
    /// Concurrent callers for the same address share one prompt and one outcome.
    /// Dropping the future withdraws this caller; the prompt is withdrawn once
    /// nobody is left waiting.
    pub async fn request_approval(&self, ip: IpAddr) -> bool {
        let (id, mut rx) = {
            let mut pending = self.inner.pending.lock();
            if self.inner.approved.is_approved(ip) {
                return true;
            }
            match pending.get(&ip) {
                Some(cell) => {
                    debug!(%ip, "joining pending approval");
                    (cell.id, cell.decision.subscribe())
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let (decision, rx) = watch::channel(None);
                    pending.insert(ip, Pending { id, decision });
                    info!(%ip, "approval requested");
                    let _ = self.inner.events.send(ApprovalEvent::Requested { ip });
                    (id, rx)
                }
            }
        };

        let mut guard = WaitGuard {
            inner: &self.inner,
            ip,
            id,
            finished: false,
        };
        let approved = match rx.wait_for(Option::is_some).await {
            Ok(decision) => *decision == Some(true),
            // Cell dropped without a value.
            Err(_) => false,
        };
        guard.finished = true;
        approved
    }

    /// Settle the pending request for `ip`. Returns `false` if nothing was pending.
    pub fn resolve(&self, ip: IpAddr, approved: bool) -> bool {
        let cell = {
            let mut pending = self.inner.pending.lock();
            let Some(cell) = pending.remove(&ip) else {
                debug!(%ip, "no pending approval to resolve");
                return false;
            };
            if approved {
                self.inner.approved.approve(ip);
            }
            cell
        };
        cell.decision.send_replace(Some(approved));
        info!(%ip, approved, "approval resolved");
        let _ = self
            .inner
            .events
            .send(ApprovalEvent::Resolved { ip, approved });
        true
    }

    /// The prompt was closed without a choice.
    pub fn dismiss(&self, ip: IpAddr) -> bool {
        self.resolve(ip, false)
    }
}

struct WaitGuard<'a> {
    inner: &'a Inner,
    ip: IpAddr,
    id: u64,
    finished: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut pending = self.inner.pending.lock();
        let last_waiter = pending
            .get(&self.ip)
            .is_some_and(|cell| cell.id == self.id && cell.decision.receiver_count() <= 1);
        if last_waiter {
            pending.remove(&self.ip);
            debug!(ip = %self.ip, "approval abandoned");
            let _ = self
                .inner
                .events
                .send(ApprovalEvent::Withdrawn { ip: self.ip });
        }
    }
}
