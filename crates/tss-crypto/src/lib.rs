//! # tss-crypto
//!
//! Cryptographic primitives used by the threshold signing service outside the
//! threshold protocol itself.
//!
//! ## Modules
//!
//! - [`hashing`] - Domain-separated BLAKE3, SHA-256, Keccak-256 and hash160
//! - [`secp256k1`] - Core account keys: recoverable signing, recovery, addresses

pub mod hashing;
pub mod secp256k1;

pub use secp256k1::{recover_address, CoreKey};

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A signature did not verify or did not recover to the expected signer.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Secret key material was malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// A signature was malformed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Address encoding or decoding failed.
    #[error("address error: {0}")]
    Address(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
