//! Monotonic drop counters.
//!
//! Every inbound envelope is either delivered to a session or counted here
//! under exactly one reason.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Why an inbound envelope was not delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Undecodable frame or failed validation.
    Malformed,
    /// `msg_type` outside the known set.
    UnknownType,
    /// Claimed sender does not match the authenticated peer.
    WrongSender,
    /// No active session and the parking buffer did not take it.
    NoSession,
    /// Parked past the grace window.
    Expired,
    /// Oldest message evicted from a full session queue.
    Overflow,
    /// Arrived for a session that already terminated.
    Closed,
}

#[derive(Debug, Default)]
pub struct DropCounters {
    malformed: AtomicU64,
    unknown_type: AtomicU64,
    wrong_sender: AtomicU64,
    no_session: AtomicU64,
    expired: AtomicU64,
    overflow: AtomicU64,
    closed: AtomicU64,
}

/// Point-in-time copy of [`DropCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DropSnapshot {
    pub malformed: u64,
    pub unknown_type: u64,
    pub wrong_sender: u64,
    pub no_session: u64,
    pub expired: u64,
    pub overflow: u64,
    pub closed: u64,
}

impl DropSnapshot {
    pub fn total(&self) -> u64 {
        self.malformed
            + self.unknown_type
            + self.wrong_sender
            + self.no_session
            + self.expired
            + self.overflow
            + self.closed
    }
}

impl DropCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Malformed => &self.malformed,
            DropReason::UnknownType => &self.unknown_type,
            DropReason::WrongSender => &self.wrong_sender,
            DropReason::NoSession => &self.no_session,
            DropReason::Expired => &self.expired,
            DropReason::Overflow => &self.overflow,
            DropReason::Closed => &self.closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DropSnapshot {
        DropSnapshot {
            malformed: self.malformed.load(Ordering::Relaxed),
            unknown_type: self.unknown_type.load(Ordering::Relaxed),
            wrong_sender: self.wrong_sender.load(Ordering::Relaxed),
            no_session: self.no_session.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}
