//! # tss-types
//!
//! Shared domain types used across the threshold signing service workspace:
//! committee members, session identifiers and results, deposit records and
//! the CBOR helpers every wire and context encoding goes through.

pub mod cbor;
pub mod deposit;
pub mod party;
pub mod session;
pub mod signature;

pub use deposit::{Deposit, DepositIdentifier, WithdrawalRecord, WithdrawalStatus};
pub use party::{CoreAddress, Party};
pub use session::{FailureKind, PartyStatus, SessionId, SessionKind, SessionResult, SessionState};
pub use signature::EcdsaSignature;

/// A 32-byte digest (message hash, sighash, transaction hash).
pub type Hash32 = [u8; 32];

/// Opaque byte blob.
pub type Bytes = Vec<u8>;

/// Errors raised while parsing or decoding shared types.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// A session identifier string could not be parsed.
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// An enum discriminant was outside its known range.
    #[error("unknown {kind} value: {value}")]
    UnknownDiscriminant { kind: &'static str, value: String },

    /// CBOR encoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR decoding failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A signature had the wrong length.
    #[error("invalid signature length: {0}")]
    InvalidSignatureLength(usize),
}

/// Result type alias for shared type operations.
pub type Result<T> = std::result::Result<T, TypesError>;
