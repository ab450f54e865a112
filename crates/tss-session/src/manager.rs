//! Session routing table.
//!
//! The manager maps exact session ids to session queues and is the
//! transport's [`Inbound`] sink. Envelopes for an id nobody has registered
//! yet are parked per sender for at most the grace window, then handed over
//! when the session registers. At most one session per kind prefix
//! (`SIGN:evm`, `KEYGEN`, …) is active at a time.
//!
//! ## Drop accounting
//!
//! | Situation                                   | Counter    |
//! |---------------------------------------------|------------|
//! | parked longer than the grace window         | `Expired`  |
//! | evicted from a full per-sender parking slot | `NoSession`|
//! | addressed to a recently terminated session  | `Closed`   |
//! | session queue full                          | `Overflow` |

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tss_transport::{DropCounters, DropReason, Envelope, Inbound};
use tss_types::{CoreAddress, SessionId};

use crate::queue::{self, QueueReceiver, QueueSender};
use crate::{Result, SessionError};

/// Terminated ids remembered for drop accounting.
const RECENTLY_CLOSED: usize = 256;

struct Route {
    /// Id the session registered with; aliases share it.
    primary: String,
    sender: QueueSender,
}

struct Parked {
    at: Instant,
    envelope: Envelope,
}

#[derive(Default)]
struct RouteTable {
    routes: HashMap<String, Route>,
    /// Kind prefix → primary id.
    active: HashMap<String, String>,
    parked: HashMap<CoreAddress, VecDeque<Parked>>,
    closed: VecDeque<String>,
}

pub struct SessionManager {
    counters: Arc<DropCounters>,
    grace_window: Duration,
    park_capacity: usize,
    table: Mutex<RouteTable>,
}

/// What a session gets back from [`SessionManager::register`].
pub struct Registration {
    pub inbound: QueueReceiver,
    pub route: RouteHandle,
}

/// The session's only link back to the manager.
///
/// Dropping it removes every route of the session.
pub struct RouteHandle {
    manager: Weak<SessionManager>,
    primary: String,
}

impl RouteHandle {
    /// Route `new_id` to this session too. Call before sending anything
    /// under the new id.
    pub fn id_changed(&self, new_id: &SessionId) {
        if let Some(manager) = self.manager.upgrade() {
            manager.register_id_change(&self.primary, new_id);
        }
    }
}

impl Drop for RouteHandle {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(&self.primary);
        }
    }
}

impl SessionManager {
    pub fn new(counters: Arc<DropCounters>, grace_window: Duration, park_capacity: usize) -> Self {
        Self {
            counters,
            grace_window,
            park_capacity: park_capacity.max(1),
            table: Mutex::new(RouteTable::default()),
        }
    }

    pub fn counters(&self) -> &Arc<DropCounters> {
        &self.counters
    }

    /// Activate a session and hand it any envelopes parked for its id.
    ///
    /// # Errors
    ///
    /// [`SessionError::KindBusy`] if a session of the same kind is active.
    pub fn register(self: &Arc<Self>, id: &SessionId, capacity: usize) -> Result<Registration> {
        let prefix = id.kind_prefix();
        let primary = id.to_string();
        let mut table = self.lock();
        if table.active.contains_key(&prefix) {
            return Err(SessionError::KindBusy(prefix));
        }
        let (sender, inbound) = queue::channel(capacity, self.counters.clone());
        table.closed.retain(|closed| closed != &primary);
        table.routes.insert(
            primary.clone(),
            Route {
                primary: primary.clone(),
                sender: sender.clone(),
            },
        );
        table.active.insert(prefix, primary.clone());
        let delivered = self.unpark(&mut table, &primary, &sender);
        drop(table);
        tracing::debug!(session_id = %primary, unparked = delivered, "session registered");
        Ok(Registration {
            inbound,
            route: RouteHandle {
                manager: Arc::downgrade(self),
                primary,
            },
        })
    }

    /// Add `new_id` as an alias for the session registered as `primary`.
    pub fn register_id_change(&self, primary: &str, new_id: &SessionId) {
        let new_id = new_id.to_string();
        let mut table = self.lock();
        let Some(sender) = table.routes.get(primary).map(|r| r.sender.clone()) else {
            return;
        };
        table.closed.retain(|closed| closed != &new_id);
        table.routes.insert(
            new_id.clone(),
            Route {
                primary: primary.to_string(),
                sender: sender.clone(),
            },
        );
        let delivered = self.unpark(&mut table, &new_id, &sender);
        drop(table);
        tracing::debug!(session_id = %primary, new_id = %new_id, unparked = delivered, "session id changed");
    }

    /// Remove every route of a session.
    pub fn unregister(&self, primary: &str) {
        let mut table = self.lock();
        let ids: Vec<String> = table
            .routes
            .iter()
            .filter(|(_, route)| route.primary == primary)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            table.routes.remove(&id);
            table.closed.push_back(id);
        }
        while table.closed.len() > RECENTLY_CLOSED {
            table.closed.pop_front();
        }
        table.active.retain(|_, active| active != primary);
    }

    /// Primary ids of every active session, sorted.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().active.values().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.lock().routes.contains_key(&id.to_string())
    }

    /// Count and discard parked envelopes older than the grace window.
    pub fn sweep(&self) {
        let mut table = self.lock();
        let now = Instant::now();
        let grace = self.grace_window;
        let counters = &self.counters;
        table.parked.retain(|_, slot| {
            slot.retain(|p| {
                let fresh = now.duration_since(p.at) <= grace;
                if !fresh {
                    counters.bump(DropReason::Expired);
                }
                fresh
            });
            !slot.is_empty()
        });
    }

    fn unpark(&self, table: &mut RouteTable, id: &str, sender: &QueueSender) -> usize {
        let now = Instant::now();
        let mut delivered = 0;
        for slot in table.parked.values_mut() {
            let mut kept = VecDeque::with_capacity(slot.len());
            for parked in slot.drain(..) {
                if parked.envelope.session_id != id {
                    kept.push_back(parked);
                } else if now.duration_since(parked.at) <= self.grace_window {
                    sender.push(parked.envelope);
                    delivered += 1;
                } else {
                    self.counters.bump(DropReason::Expired);
                }
            }
            *slot = kept;
        }
        table.parked.retain(|_, slot| !slot.is_empty());
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouteTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inbound for SessionManager {
    fn deliver(&self, envelope: Envelope) {
        let mut table = self.lock();
        if let Some(route) = table.routes.get(&envelope.session_id) {
            route.sender.push(envelope);
            return;
        }
        if table.closed.contains(&envelope.session_id) {
            tracing::debug!(
                session_id = %envelope.session_id,
                sender = %envelope.sender,
                "envelope for terminated session"
            );
            self.counters.bump(DropReason::Closed);
            return;
        }

        let now = Instant::now();
        let slot = table.parked.entry(envelope.sender.clone()).or_default();
        while slot
            .front()
            .is_some_and(|p| now.duration_since(p.at) > self.grace_window)
        {
            slot.pop_front();
            self.counters.bump(DropReason::Expired);
        }
        if slot.len() >= self.park_capacity {
            if let Some(evicted) = slot.pop_front() {
                tracing::debug!(
                    session_id = %evicted.envelope.session_id,
                    sender = %evicted.envelope.sender,
                    "parking slot full, dropping oldest"
                );
                self.counters.bump(DropReason::NoSession);
            }
        }
        tracing::trace!(session_id = %envelope.session_id, sender = %envelope.sender, "parked");
        slot.push_back(Parked { at: now, envelope });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tss_transport::RequestType;
    use tss_types::SessionKind;

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::new(DropCounters::new()),
            Duration::from_millis(500),
            4,
        ))
    }

    fn sign_id(epoch: u64) -> SessionId {
        SessionId::new(SessionKind::Sign("evm".into()), epoch)
    }

    fn env(session_id: &str, sender: &str) -> Envelope {
        Envelope::new(session_id, RequestType::TssRound, sender.into(), vec![1])
    }

    #[tokio::test]
    async fn test_routes_to_registered_session() {
        let manager = manager();
        let reg = manager.register(&sign_id(1), 8).expect("register");
        manager.deliver(env("SIGN:evm/1", "bridge1a"));
        assert_eq!(reg.inbound.len(), 1);
    }

    #[tokio::test]
    async fn test_one_session_per_kind() {
        let manager = manager();
        let _reg = manager.register(&sign_id(1), 8).expect("register");
        assert!(matches!(
            manager.register(&sign_id(2), 8),
            Err(SessionError::KindBusy(prefix)) if prefix == "SIGN:evm"
        ));
        let other = SessionId::new(SessionKind::Sign("bitcoin".into()), 2);
        manager.register(&other, 8).expect("different chain");
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_envelope_is_unparked() {
        let manager = manager();
        manager.deliver(env("SIGN:evm/1", "bridge1a"));
        tokio::time::advance(Duration::from_millis(200)).await;
        let reg = manager.register(&sign_id(1), 8).expect("register");
        let got = reg.inbound.recv().await.expect("unparked");
        assert_eq!(got.session_id, "SIGN:evm/1");
        assert_eq!(manager.counters().snapshot().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_parked_envelope_expires() {
        let manager = manager();
        manager.deliver(env("SIGN:evm/1", "bridge1a"));
        tokio::time::advance(Duration::from_millis(800)).await;
        let reg = manager.register(&sign_id(1), 8).expect("register");
        assert!(reg.inbound.is_empty());
        assert_eq!(manager.counters().snapshot().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_counts_unclaimed() {
        let manager = manager();
        manager.deliver(env("SIGN:evm/9", "bridge1a"));
        tokio::time::advance(Duration::from_secs(1)).await;
        manager.sweep();
        assert_eq!(manager.counters().snapshot().expired, 1);
    }

    #[tokio::test]
    async fn test_parking_bounded_per_sender() {
        let manager = manager();
        for epoch in 0..6 {
            manager.deliver(env(&format!("SIGN:evm/{epoch}"), "bridge1a"));
        }
        manager.deliver(env("SIGN:evm/0", "bridge1b"));
        assert_eq!(manager.counters().snapshot().no_session, 2);
    }

    #[tokio::test]
    async fn test_id_change_and_unregister() {
        let manager = manager();
        let id = sign_id(3);
        let reg = manager.register(&id, 8).expect("register");
        manager.deliver(env("SIGN:evm/3/finalize", "bridge1a"));
        reg.route.id_changed(&id.finalize());
        assert_eq!(reg.inbound.len(), 1);
        manager.deliver(env("SIGN:evm/3/finalize", "bridge1b"));
        assert_eq!(reg.inbound.len(), 2);

        drop(reg);
        assert!(manager.active_sessions().is_empty());
        manager.deliver(env("SIGN:evm/3/finalize", "bridge1c"));
        manager.deliver(env("SIGN:evm/3", "bridge1c"));
        assert_eq!(manager.counters().snapshot().closed, 2 + 2);
        manager.register(&sign_id(4), 8).expect("kind free again");
    }
}
