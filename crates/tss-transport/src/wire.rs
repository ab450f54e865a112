//! Wire-protocol frames exchanged between committee members.
//!
//! Every frame is wrapped in a versioned [`WireMessage`], CBOR-serialized and
//! written to the peer's stream with a 4-byte little-endian length prefix.
//!
//! ## Wire format
//!
//! ```text
//! WireMessage {
//!     version: u8,              // PROTOCOL_VERSION
//!     frame:   Frame,
//! }
//!
//! Frame::Heartbeat     { status: u8 }
//! Frame::SessionSubmit { session_id, msg_type: u16, sender, payload, signature? }
//! ```
//!
//! `msg_type` is kept as a raw integer on the wire so that an unknown type can
//! be counted and dropped instead of failing the whole frame.

use serde::{Deserialize, Serialize};
use tss_types::{cbor, CoreAddress, EcdsaSignature, PartyStatus};

use crate::TransportError;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum encoded frame size.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Maximum envelope payload size.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - 4096;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Discriminant of a [`Envelope`] payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestType {
    Proposal = 0x0001,
    Accept = 0x0002,
    Reject = 0x0003,
    Commit = 0x0004,
    Abort = 0x0005,
    TssRound = 0x0010,
    DepositDistribution = 0x0020,
    Finalize = 0x0030,
    /// A signer's withdrawal record, sent to the parties that did not sign.
    WithdrawalRecorded = 0x0031,
}

impl RequestType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Proposal),
            0x0002 => Some(Self::Accept),
            0x0003 => Some(Self::Reject),
            0x0004 => Some(Self::Commit),
            0x0005 => Some(Self::Abort),
            0x0010 => Some(Self::TssRound),
            0x0020 => Some(Self::DepositDistribution),
            0x0030 => Some(Self::Finalize),
            0x0031 => Some(Self::WithdrawalRecorded),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Types whose payload must carry a signature from the sender's core key.
    pub fn requires_signature(self) -> bool {
        matches!(self, Self::Proposal | Self::Commit)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A session-addressed message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Exact id of the producing session phase.
    pub session_id: String,
    pub msg_type: u16,
    pub sender: CoreAddress,
    pub payload: Vec<u8>,
    /// Signature over the payload, where non-repudiation is required.
    pub signature: Option<EcdsaSignature>,
}

impl Envelope {
    pub fn new(
        session_id: impl Into<String>,
        request_type: RequestType,
        sender: CoreAddress,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            msg_type: request_type.as_u16(),
            sender,
            payload,
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: EcdsaSignature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// The decoded request type, or `None` for an unknown discriminant.
    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::from_u16(self.msg_type)
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Everything that travels on a peer stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Health ping; the receiver answers with its own heartbeat.
    Heartbeat { status: u8 },
    SessionSubmit(Envelope),
}

impl Frame {
    pub fn heartbeat(status: PartyStatus) -> Self {
        Self::Heartbeat {
            status: status as u8,
        }
    }
}

/// Versioned frame container.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub version: u8,
    pub frame: Frame,
}

impl WireMessage {
    pub fn new(frame: Frame) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame,
        }
    }

    /// Serialize this message to CBOR bytes for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        cbor::to_vec(self).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    /// Deserialize and validate a message received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Deserialization`] for undecodable bytes and
    /// [`TransportError::ProtocolViolation`] for a version mismatch or an
    /// oversized payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        let msg: Self =
            cbor::from_slice(data).map_err(|e| TransportError::Deserialization(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.version != PROTOCOL_VERSION {
            return Err(TransportError::ProtocolViolation(format!(
                "unsupported protocol version {}, expected {PROTOCOL_VERSION}",
                self.version
            )));
        }
        if let Frame::SessionSubmit(envelope) = &self.frame {
            if envelope.payload.len() > MAX_PAYLOAD_SIZE {
                return Err(TransportError::ProtocolViolation(format!(
                    "payload too large: {} bytes, max {MAX_PAYLOAD_SIZE}",
                    envelope.payload.len()
                )));
            }
        }
        Ok(())
    }
}

/// Encode an envelope as a complete wire frame.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, TransportError> {
    WireMessage::new(Frame::SessionSubmit(envelope.clone())).to_bytes()
}
