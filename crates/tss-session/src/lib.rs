//! # tss-session
//!
//! The session engine: everything between the transport and the chain
//! adapters.
//!
//! - **Routing** of inbound envelopes to sessions, with a parking buffer for
//!   early arrivals via [`manager`] and bounded per-session queues via [`queue`]
//! - **Proposer election** via [`election`]
//! - **Consensus** on what is signed and who signs it via [`consensus`]
//! - **Threshold protocol driving** via [`driver`]
//! - **Session lifecycle** (`PENDING → CONSENSUS → RUNNING → FINALIZING`) via
//!   [`session`]
//! - **Deposit ingestion** via [`acceptor`]
//! - **Deterministic epochs** via [`schedule`] and hierarchical cancellation
//!   via [`cancel`]
//!
//! ## Architecture
//!
//! ```text
//!   Transport ──deliver──▶ SessionManager ──push──▶ SessionQueue ──▶ session task
//!                                                                      │
//!          ┌──────────── consensus ◀── Workload (chain + db) ◀────────┤
//!          ▼                                                           │
//!        Driver ── spawn_blocking ──▶ ThresholdProtocol                │
//!          │                                                           │
//!          └──────▶ Workload::record / publish ──▶ SessionResult ◀─────┘
//! ```

use std::time::Duration;

use tss_chains::ChainError;
use tss_crypto::CryptoError;
use tss_db::DbError;
use tss_transport::TransportError;
use tss_types::{FailureKind, TypesError};

pub mod acceptor;
pub mod cancel;
pub mod consensus;
pub mod driver;
pub mod election;
pub mod manager;
pub mod queue;
pub mod schedule;
pub mod session;
pub mod workload;

pub use acceptor::{DepositAcceptor, DepositDistribution, Ingest};
pub use cancel::{CancelSource, CancelToken};
pub use driver::{
    InMsg, OutMsg, ProtocolError, ProtocolFactory, ProtocolOutput, ProtocolTask, Routing,
    StartParams, ThresholdProtocol,
};
pub use manager::SessionManager;
pub use session::{Engine, EngineConfig, SessionEvent, SessionHandle, SessionMode, SessionPlan};
pub use workload::{MigrationSigning, ProposalBody, WithdrawalSigning, Workload};

/// Timing and sizing constants shared by every session of a node.
///
/// All of them are required configuration; nothing here has a default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timing {
    /// How long an envelope may wait in the parking buffer for its session.
    pub grace_window: Duration,
    /// How long peers wait for the primary proposer before falling back.
    pub election_timeout: Duration,
    /// Budget for the whole consensus phase, election included.
    pub consensus_deadline: Duration,
    /// Budget for each threshold protocol round.
    pub round_deadline: Duration,
    pub finalize_deadline: Duration,
    /// Per-session inbound queue bound.
    pub queue_capacity: usize,
    /// Parked envelopes kept per sender.
    pub park_capacity_per_sender: usize,
}

/// Errors raised inside the session engine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("encoding error: {0}")]
    Encoding(#[from] TypesError),

    /// The engine was set up inconsistently (key, roster, threshold).
    #[error("configuration error: {0}")]
    Config(String),

    /// Another session with the same kind prefix is still running.
    #[error("a {0} session is already active")]
    KindBusy(String),

    #[error("consensus timeout: {0}")]
    ConsensusTimeout(String),

    #[error("consensus rejected: {0}")]
    ConsensusRejected(String),

    #[error("nothing to sign")]
    NothingToSign,

    #[error("round {round} timed out")]
    RoundTimeout { round: u16 },

    /// The threshold protocol failed.
    #[error("protocol failure: {0}")]
    Protocol(String),

    #[error("finalization failed: {0}")]
    Finalize(String),

    /// The local party may not distribute deposits.
    #[error("not a configured distributor")]
    NotDistributor,

    #[error("inbound queue closed")]
    QueueClosed,

    #[error("cancelled")]
    Cancelled,
}

impl SessionError {
    /// Place this error in the failure taxonomy published with a session
    /// result.
    ///
    /// Chain and database errors can only escape from finalization.
    /// A cancelled session publishes `Cancelled`, never a failure kind.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ConsensusTimeout(_) => FailureKind::ConsensusTimeout,
            Self::ConsensusRejected(_) | Self::NotDistributor => FailureKind::ConsensusRejected,
            Self::NothingToSign => FailureKind::NothingToSign,
            Self::RoundTimeout { round } => FailureKind::RoundTimeout { round: *round },
            Self::Protocol(_) | Self::Crypto(_) => FailureKind::CryptoError,
            Self::Finalize(_) | Self::Chain(_) | Self::Db(_) => FailureKind::FinalizeError,
            Self::Transport(_) => FailureKind::TransportError,
            Self::KindBusy(_) => FailureKind::KindBusy,
            Self::Encoding(_) | Self::Config(_) | Self::QueueClosed | Self::Cancelled => {
                FailureKind::Internal
            }
        }
    }
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            SessionError::RoundTimeout { round: 3 }.failure_kind(),
            FailureKind::RoundTimeout { round: 3 }
        );
        assert_eq!(
            SessionError::ConsensusRejected("x".into()).failure_kind(),
            FailureKind::ConsensusRejected
        );
        assert_eq!(
            SessionError::Finalize("x".into()).failure_kind(),
            FailureKind::FinalizeError
        );
        assert_eq!(SessionError::NothingToSign.failure_kind(), FailureKind::NothingToSign);
        assert_eq!(
            SessionError::Protocol("bad share".into()).failure_kind(),
            FailureKind::CryptoError
        );
        assert_eq!(
            SessionError::ConsensusTimeout("no proposal".into()).failure_kind(),
            FailureKind::ConsensusTimeout
        );
    }

    #[test]
    fn test_infrastructure_errors_not_reported_as_timeouts() {
        assert_eq!(
            SessionError::Transport(TransportError::Connection("reset".into())).failure_kind(),
            FailureKind::TransportError
        );
        assert_eq!(
            SessionError::KindBusy("SIGN:evm".into()).failure_kind(),
            FailureKind::KindBusy
        );
        for err in [SessionError::Config("no share".into()), SessionError::QueueClosed] {
            assert_eq!(err.failure_kind(), FailureKind::Internal, "{err}");
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            SessionError::KindBusy("SIGN:evm".into()).to_string(),
            "a SIGN:evm session is already active"
        );
        assert_eq!(
            SessionError::RoundTimeout { round: 2 }.to_string(),
            "round 2 timed out"
        );
    }
}
