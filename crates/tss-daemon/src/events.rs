//! Event bus.
//!
//! Session state changes are pushed to API subscribers as JSON-RPC
//! notifications. Each subscriber has its own bounded buffer; a slow
//! subscriber loses the oldest events, never blocks a session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tss_session::{CancelToken, SessionEvent};
use tss_types::{SessionId, SessionKind, SessionResult};

/// An event emitted by the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// `SessionStatus`, `NodeStarted`, ...
    pub event_type: String,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            payload,
        }
    }

    /// Key shares produced by keygen and committee resharing are never
    /// published.
    pub fn session(event: &SessionEvent) -> Self {
        let mut event = event.clone();
        if carries_key_share(&event.session_id) {
            if let Some(SessionResult::Completed { artifact, .. }) = &mut event.result {
                *artifact = None;
            }
        }
        Self::new(
            "SessionStatus",
            serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
        )
    }
}

fn carries_key_share(session_id: &str) -> bool {
    session_id
        .parse::<SessionId>()
        .map_or(true, |id| matches!(id.kind, SessionKind::Keygen | SessionKind::Reshare(None)))
}

/// Subscription filter sent with `subscribe`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only sessions whose id starts with one of these, e.g. `SIGN:evm`.
    #[serde(default)]
    pub session_prefixes: Option<Vec<String>>,
    /// Drop intermediate states, keep results.
    #[serde(default)]
    pub results_only: bool,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if event.event_type != "SessionStatus" {
            return self.session_prefixes.is_none() && !self.results_only;
        }
        if self.results_only && !matches!(event.payload.get("result"), Some(r) if !r.is_null()) {
            return false;
        }
        if let Some(prefixes) = &self.session_prefixes {
            let id = event
                .payload
                .get("session_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if !prefixes.iter().any(|p| id.starts_with(p.as_str())) {
                return false;
            }
        }
        true
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: Event) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Republish every session event of an engine until cancelled.
    pub async fn forward(self, mut sessions: broadcast::Receiver<SessionEvent>, cancel: CancelToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = sessions.recv() => event,
            };
            match event {
                Ok(event) => self.emit(Event::session(&event)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event bus lagged behind sessions");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
