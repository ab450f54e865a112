//! Threshold protocol driver.
//!
//! The threshold-ECDSA library is a black box behind [`ThresholdProtocol`].
//! The driver feeds it inbound round messages, ships what it emits, and
//! enforces a deadline per protocol round. Every library call runs on the
//! blocking pool; a cancel signal is only observed between calls, so an
//! in-flight call always completes.
//!
//! ## Round messages
//!
//! ```text
//! Envelope{type: TssRound, payload: CBOR(RoundMessage{round, index, broadcast, payload})}
//! ```
//!
//! Inbound messages are deduplicated by `(sender, round, index)` before they
//! reach the library.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, Instant};
use tss_transport::{Envelope, RequestType, Transport};
use tss_types::{cbor, CoreAddress, EcdsaSignature, Hash32, SessionId};

use crate::cancel::CancelToken;
use crate::queue::QueueReceiver;
use crate::{Result, SessionError};

// ---------------------------------------------------------------------------
// Library interface
// ---------------------------------------------------------------------------

/// Errors reported by a threshold protocol implementation.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Fatal cryptographic failure; the session cannot complete.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// The protocol backend could not be reached.
    #[error("backend unavailable: {0}")]
    Backend(String),

    /// A peer sent something the library refused. The session goes on.
    #[error("invalid message from {from}: {reason}")]
    InvalidMessage { from: CoreAddress, reason: String },
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Routing {
    Broadcast,
    To(CoreAddress),
}

/// A message emitted by the library.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutMsg {
    pub routing: Routing,
    pub round: u16,
    /// Distinguishes several messages of the same round.
    pub index: u32,
    pub payload: Vec<u8>,
}

/// A message handed to the library.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMsg {
    pub from: CoreAddress,
    pub round: u16,
    pub index: u32,
    pub broadcast: bool,
    pub payload: Vec<u8>,
}

/// What the session asks the library to do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolTask {
    Keygen {
        preparams: Option<Vec<u8>>,
    },
    /// One signature per hash, in order.
    Sign {
        message_hashes: Vec<Hash32>,
    },
    Reshare {
        old_parties: Vec<CoreAddress>,
        new_parties: Vec<CoreAddress>,
        new_threshold: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartParams {
    pub session_id: String,
    /// Sorted participants.
    pub parties: Vec<CoreAddress>,
    pub local_index: usize,
    pub threshold: usize,
    pub task: ProtocolTask,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolOutput {
    Signatures(Vec<EcdsaSignature>),
    /// Serialized key share from keygen or resharing.
    Share(Vec<u8>),
}

/// A threshold-ECDSA state machine.
///
/// Calls may be CPU heavy; the driver only invokes them on the blocking pool.
pub trait ThresholdProtocol: Send {
    fn start(&mut self, params: &StartParams) -> std::result::Result<Vec<OutMsg>, ProtocolError>;

    fn update(&mut self, msg: InMsg) -> std::result::Result<Vec<OutMsg>, ProtocolError>;

    /// Current round, starting at 1.
    fn round(&self) -> u16;

    /// The output, once the protocol finished.
    fn done(&mut self) -> Option<ProtocolOutput>;
}

/// Creates a protocol instance per session.
pub trait ProtocolFactory: Send + Sync {
    fn create(
        &self,
        session_id: &SessionId,
        task: &ProtocolTask,
    ) -> std::result::Result<Box<dyn ThresholdProtocol>, ProtocolError>;
}

/// Wire form of a round message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMessage {
    pub round: u16,
    pub index: u32,
    pub broadcast: bool,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub(crate) struct Driver<'a> {
    pub transport: &'a Arc<dyn Transport>,
    pub session_id: String,
    /// Sorted participants, local party included.
    pub parties: Vec<CoreAddress>,
    pub round_deadline: Duration,
    pub inbound: &'a QueueReceiver,
    pub cancel: &'a CancelToken,
}

type Boxed = Box<dyn ThresholdProtocol>;

/// Run one library call on the blocking pool and hand the instance back.
async fn blocking<T, F>(mut protocol: Boxed, call: F) -> Result<(Boxed, T)>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn ThresholdProtocol) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let out = call(protocol.as_mut());
        (protocol, out)
    })
    .await
    .map_err(|e| SessionError::Protocol(format!("protocol worker failed: {e}")))
}

impl Driver<'_> {
    /// Drive `protocol` to completion. `stash` holds round messages that
    /// arrived before the driver started.
    pub async fn run(
        &self,
        protocol: Boxed,
        params: StartParams,
        stash: Vec<Envelope>,
    ) -> Result<ProtocolOutput> {
        let local = self.transport.local_address().clone();
        let (mut protocol, out) = blocking(protocol, move |p| p.start(&params)).await?;
        self.dispatch(out?).await;

        let mut seen: HashSet<(CoreAddress, u16, u32)> = HashSet::new();
        let mut pending: VecDeque<Envelope> = stash.into();
        let mut round = protocol.round();
        let mut round_deadline = Instant::now() + self.round_deadline;
        tracing::debug!(session_id = %self.session_id, round, "protocol started");

        loop {
            if let Some(output) = protocol.done() {
                tracing::info!(session_id = %self.session_id, rounds = round, "protocol finished");
                return Ok(output);
            }
            let envelope = match pending.pop_front() {
                Some(envelope) => envelope,
                None => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                    _ = sleep_until(round_deadline) => {
                        tracing::warn!(session_id = %self.session_id, round, "round deadline passed");
                        return Err(SessionError::RoundTimeout { round });
                    }
                    envelope = self.inbound.recv() => envelope.ok_or(SessionError::QueueClosed)?,
                },
            };
            let Some(msg) = self.screen(envelope, &local, &mut seen) else {
                continue;
            };

            let (next, result) = blocking(protocol, move |p| p.update(msg)).await?;
            protocol = next;
            match result {
                Ok(out) => self.dispatch(out).await,
                Err(ProtocolError::InvalidMessage { from, reason }) => {
                    tracing::warn!(session_id = %self.session_id, peer = %from, reason, "protocol deviation");
                }
                Err(e) => return Err(e.into()),
            }

            let now = protocol.round();
            if now != round {
                tracing::debug!(session_id = %self.session_id, from = round, to = now, "round advanced");
                round = now;
                round_deadline = Instant::now() + self.round_deadline;
            }
        }
    }

    /// Turn an envelope into a library message, or drop it.
    fn screen(
        &self,
        envelope: Envelope,
        local: &CoreAddress,
        seen: &mut HashSet<(CoreAddress, u16, u32)>,
    ) -> Option<InMsg> {
        if envelope.request_type() != Some(RequestType::TssRound)
            || envelope.session_id != self.session_id
        {
            tracing::debug!(session_id = %self.session_id, peer = %envelope.sender, msg_type = envelope.msg_type, "ignored while running");
            return None;
        }
        if &envelope.sender == local || !self.parties.contains(&envelope.sender) {
            tracing::warn!(session_id = %self.session_id, peer = %envelope.sender, "round message from non-participant");
            return None;
        }
        let message = match cbor::from_slice::<RoundMessage>(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, peer = %envelope.sender, error = %e, "malformed round message");
                return None;
            }
        };
        if !seen.insert((envelope.sender.clone(), message.round, message.index)) {
            tracing::debug!(session_id = %self.session_id, peer = %envelope.sender, round = message.round, "duplicate round message");
            return None;
        }
        Some(InMsg {
            from: envelope.sender,
            round: message.round,
            index: message.index,
            broadcast: message.broadcast,
            payload: message.payload,
        })
    }

    async fn dispatch(&self, out: Vec<OutMsg>) {
        let local = self.transport.local_address().clone();
        for msg in out {
            let wire = RoundMessage {
                round: msg.round,
                index: msg.index,
                broadcast: msg.routing == Routing::Broadcast,
                payload: msg.payload,
            };
            let payload = match cbor::to_vec(&wire) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, error = %e, "cannot encode round message");
                    continue;
                }
            };
            let envelope =
                Envelope::new(self.session_id.clone(), RequestType::TssRound, local.clone(), payload);
            match msg.routing {
                Routing::Broadcast => {
                    for (peer, error) in self.transport.broadcast(&self.parties, &envelope).await {
                        tracing::debug!(session_id = %self.session_id, peer = %peer, error = %error, "round send failed");
                    }
                }
                Routing::To(peer) => {
                    if !self.parties.contains(&peer) || peer == local {
                        tracing::warn!(session_id = %self.session_id, peer = %peer, "library addressed a non-participant");
                        continue;
                    }
                    if let Err(error) = self.transport.send(&peer, envelope).await {
                        tracing::debug!(session_id = %self.session_id, peer = %peer, error = %error, "round send failed");
                    }
                }
            }
        }
    }
}
