//! Session identifiers, lifecycle states and results.
//!
//! ## Identifier format
//!
//! ```text
//! KEYGEN/<epoch>[/<sub>]
//! SIGN:<chain>/<epoch>[/<sub>]
//! RESHARE[:<chain>]/<epoch>[/<sub>]
//! DEPOSIT_ACCEPTOR
//! ```
//!
//! The string form is the demultiplexing key on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{EcdsaSignature, TypesError};

const KEYGEN: &str = "KEYGEN";
const SIGN: &str = "SIGN";
const RESHARE: &str = "RESHARE";
const DEPOSIT_ACCEPTOR: &str = "DEPOSIT_ACCEPTOR";

/// Sub-tag used by the finalization phase of signing sessions.
pub const FINALIZE_SUB: &str = "finalize";

/// What kind of cooperative protocol a session runs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// Distributed key generation.
    Keygen,
    /// Withdrawal signing for the named chain.
    Sign(String),
    /// Committee key resharing (`None`) or migration signing for a chain.
    Reshare(Option<String>),
    /// Long-lived deposit ingestion.
    DepositAcceptor,
}

impl SessionKind {
    /// The chain this session is bound to, if any.
    pub fn chain(&self) -> Option<&str> {
        match self {
            Self::Sign(chain) => Some(chain),
            Self::Reshare(chain) => chain.as_deref(),
            Self::Keygen | Self::DepositAcceptor => None,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keygen => f.write_str(KEYGEN),
            Self::Sign(chain) => write!(f, "{SIGN}:{chain}"),
            Self::Reshare(None) => f.write_str(RESHARE),
            Self::Reshare(Some(chain)) => write!(f, "{RESHARE}:{chain}"),
            Self::DepositAcceptor => f.write_str(DEPOSIT_ACCEPTOR),
        }
    }
}

impl FromStr for SessionKind {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, chain) = match s.split_once(':') {
            Some((head, chain)) if !chain.is_empty() => (head, Some(chain.to_string())),
            Some(_) => return Err(TypesError::InvalidSessionId(s.to_string())),
            None => (s, None),
        };
        match (head, chain) {
            (KEYGEN, None) => Ok(Self::Keygen),
            (SIGN, Some(chain)) => Ok(Self::Sign(chain)),
            (RESHARE, chain) => Ok(Self::Reshare(chain)),
            (DEPOSIT_ACCEPTOR, None) => Ok(Self::DepositAcceptor),
            _ => Err(TypesError::InvalidSessionId(s.to_string())),
        }
    }
}

/// Structured session identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId {
    pub kind: SessionKind,
    /// Monotonic counter advanced on each scheduled session.
    pub epoch: u64,
    /// Optional phase or per-chain tag.
    pub sub: Option<String>,
}

impl SessionId {
    pub fn new(kind: SessionKind, epoch: u64) -> Self {
        Self {
            kind,
            epoch,
            sub: None,
        }
    }

    /// The fixed identifier of the deposit acceptor.
    pub fn deposit_acceptor() -> Self {
        Self::new(SessionKind::DepositAcceptor, 0)
    }

    /// A copy of this identifier carrying the given sub-tag.
    pub fn with_sub(&self, sub: impl Into<String>) -> Self {
        Self {
            kind: self.kind.clone(),
            epoch: self.epoch,
            sub: Some(sub.into()),
        }
    }

    /// The identifier used by the finalization phase of this session.
    pub fn finalize(&self) -> Self {
        self.with_sub(FINALIZE_SUB)
    }

    /// Routing prefix; at most one session per prefix may be active.
    pub fn kind_prefix(&self) -> String {
        self.kind.to_string()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == SessionKind::DepositAcceptor {
            return f.write_str(DEPOSIT_ACCEPTOR);
        }
        write!(f, "{}/{}", self.kind, self.epoch)?;
        if let Some(sub) = &self.sub {
            write!(f, "/{sub}")?;
        }
        Ok(())
    }
}

impl FromStr for SessionId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == DEPOSIT_ACCEPTOR {
            return Ok(Self::deposit_acceptor());
        }
        let mut parts = s.splitn(3, '/');
        let kind = parts
            .next()
            .ok_or_else(|| TypesError::InvalidSessionId(s.to_string()))?
            .parse::<SessionKind>()?;
        if kind == SessionKind::DepositAcceptor {
            return Err(TypesError::InvalidSessionId(s.to_string()));
        }
        let epoch = parts
            .next()
            .and_then(|e| e.parse::<u64>().ok())
            .ok_or_else(|| TypesError::InvalidSessionId(s.to_string()))?;
        let sub = match parts.next() {
            Some("") => return Err(TypesError::InvalidSessionId(s.to_string())),
            Some(sub) => Some(sub.to_string()),
            None => None,
        };
        Ok(Self { kind, epoch, sub })
    }
}

impl TryFrom<String> for SessionId {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.to_string()
    }
}

/// Process-wide activity advertised to peers in heartbeats.
///
/// A mismatch between peers is advisory only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PartyStatus {
    Idle = 0,
    Keygen = 1,
    Signing = 2,
    Reshare = 3,
}

impl PartyStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Keygen),
            2 => Some(Self::Signing),
            3 => Some(Self::Reshare),
            _ => None,
        }
    }
}

impl fmt::Display for PartyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Keygen => write!(f, "KEYGEN"),
            Self::Signing => write!(f, "SIGNING"),
            Self::Reshare => write!(f, "RESHARE"),
        }
    }
}

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Consensus,
    Running,
    Finalizing,
    Excluded,
    Failed,
    Cancelled,
    Terminal,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Excluded | Self::Failed | Self::Cancelled | Self::Terminal
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Consensus => "consensus",
            Self::Running => "running",
            Self::Finalizing => "finalizing",
            Self::Excluded => "excluded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

/// Why a session failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No `Commit` (or not enough acceptances) before the consensus deadline.
    ConsensusTimeout,
    /// The proposal was rejected or aborted.
    ConsensusRejected,
    /// The threshold protocol did not advance past `round` in time.
    RoundTimeout { round: u16 },
    /// The threshold protocol reported a cryptographic failure.
    CryptoError,
    /// The signed artifact could not be assembled or broadcast.
    FinalizeError,
    /// The proposer had nothing to put up for signing.
    NothingToSign,
    /// Peers could not be reached outside any protocol deadline.
    TransportError,
    /// Another session of the same kind was still active.
    KindBusy,
    /// Local misconfiguration or a broken session pipeline.
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsensusTimeout => write!(f, "consensus timeout"),
            Self::ConsensusRejected => write!(f, "consensus rejected"),
            Self::RoundTimeout { round } => write!(f, "round {round} timeout"),
            Self::CryptoError => write!(f, "crypto error"),
            Self::FinalizeError => write!(f, "finalize error"),
            Self::NothingToSign => write!(f, "nothing to sign"),
            Self::TransportError => write!(f, "transport error"),
            Self::KindBusy => write!(f, "session kind busy"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

/// The single outcome a session publishes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionResult {
    Completed {
        signatures: Vec<EcdsaSignature>,
        artifact: Option<Vec<u8>>,
    },
    /// The local party was not chosen to sign.
    Excluded,
    Failed {
        kind: FailureKind,
        detail: String,
    },
    Cancelled,
}

impl SessionResult {
    pub fn failed(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            detail: detail.into(),
        }
    }

    /// The terminal state a session ends in after publishing this result.
    pub fn terminal_state(&self) -> SessionState {
        match self {
            Self::Completed { .. } => SessionState::Terminal,
            Self::Excluded => SessionState::Excluded,
            Self::Failed { .. } => SessionState::Failed,
            Self::Cancelled => SessionState::Cancelled,
        }
    }
}
