//! # tss-chains
//!
//! Chain adapters: what the signing engine needs to know about each target
//! chain, and nothing more.
//!
//! Every adapter provides four capabilities:
//!
//! - [`AddressValid`] - receiver address validation
//! - [`GetDepositData`] - fetch a deposit event from its source chain
//! - [`Constructor`] - turn a deposit (or a migration) into the hash(es) to sign
//!   plus a self-contained [`SigningContext`], and verify a peer's proposal
//! - [`Finalizer`] - assemble the signed artifact and broadcast it
//!
//! The closed set of supported chains is the [`Chain`] enum.
//!
//! ## Modules
//!
//! - [`amount`] - exact decimal conversion
//! - [`evm`], [`utxo`], [`zano`], [`ton`], [`solana`] - per-chain adapters
//! - [`rpc`] - JSON-RPC over HTTP shared by the chain clients
//! - [`tokens`] - token pairs used to map deposits to withdrawals

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tss_types::{cbor, Deposit, DepositIdentifier, EcdsaSignature, Hash32};

pub mod amount;
pub mod chain;
pub mod evm;
pub mod rpc;
pub mod solana;
pub mod tokens;
pub mod ton;
pub mod utxo;
pub mod zano;

pub use chain::{Chain, ChainConfig};
pub use tokens::{TokenPair, TokenRegistry};

/// Errors raised by chain adapters.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// HTTP-level failure talking to a node or wallet.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node answered with a JSON-RPC error.
    #[error("RPC {method} failed ({code}): {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    /// The node answered with something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("deposit not found: {0}")]
    DepositNotFound(String),

    #[error("invalid deposit: {0}")]
    InvalidDeposit(String),

    /// Scaling down would lose value.
    #[error("amount {amount} cannot be converted exactly from {from} to {to} decimals")]
    InexactAmount { amount: String, from: u32, to: u32 },

    #[error("amount overflow: {0}")]
    AmountOverflow(String),

    /// A proposal failed verification. The reason is sent back to the proposer.
    #[error("proposal rejected: {0}")]
    Verification(RejectReason),

    #[error("not enough funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("finalization failed: {0}")]
    Finalize(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, ChainError>;

/// Why a non-proposer rejected a proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RejectReason {
    #[error("message hash mismatch")]
    HashMismatch,
    #[error("context does not match the deposit")]
    ContextMismatch,
    #[error("unknown deposit")]
    UnknownDeposit,
    #[error("deposit already processed")]
    AlreadyProcessed,
    #[error("output does not pay the target address")]
    WrongDestination,
    #[error("input is not an unspent output")]
    MissingInput,
    #[error("negative fee")]
    NegativeFee,
    /// An output above the money supply, or values that overflow when summed.
    #[error("amount out of range")]
    AmountOutOfRange,
    #[error("fee rate outside tolerance")]
    FeeOutsideTolerance,
    #[error("wrong chain")]
    WrongChain,
    #[error("{0}")]
    Other(String),
}

impl From<RejectReason> for ChainError {
    fn from(reason: RejectReason) -> Self {
        Self::Verification(reason)
    }
}

// ---------------------------------------------------------------------------
// Signing requests and artifacts
// ---------------------------------------------------------------------------

/// Everything a peer needs to reproduce and check the hashes to sign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningContext {
    Evm(evm::EvmContext),
    Utxo(utxo::UtxoContext),
    Zano(zano::ZanoContext),
    Ton(ton::TonContext),
    Solana(solana::SolanaContext),
}

impl SigningContext {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        cbor::to_vec(self).map_err(|e| ChainError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        cbor::from_slice_named(bytes, "SigningContext")
            .map_err(|e| ChainError::Encoding(e.to_string()))
    }
}

/// Input to a signing session.
///
/// UTXO contexts carry one hash per input; every other chain carries one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub message_hashes: Vec<Hash32>,
    pub context: SigningContext,
}

/// The assembled result of a signing session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedArtifact {
    /// Hex withdrawal signature as stored with the deposit.
    pub signature: String,
    pub withdrawal_tx_hash: Option<String>,
    /// Raw transaction to broadcast, if the chain needs one.
    pub raw: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

pub trait AddressValid {
    fn is_valid_address(&self, address: &str) -> bool;
}

/// A deposit event as read from its source chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositData {
    pub identifier: DepositIdentifier,
    pub depositor: Option<String>,
    pub amount: num_bigint::BigUint,
    pub token: String,
    pub receiver: String,
    pub withdrawal_chain_id: String,
    pub block: u64,
}

#[async_trait]
pub trait GetDepositData {
    async fn get_deposit_data(&self, id: &DepositIdentifier) -> Result<DepositData>;
}

#[async_trait]
pub trait Constructor {
    /// Build the signing request for a withdrawal of `deposit`.
    async fn construct(&self, deposit: &Deposit) -> Result<SigningRequest>;

    /// Check a proposer's request for `deposit` before accepting it.
    async fn verify(&self, deposit: &Deposit, request: &SigningRequest) -> Result<()>;

    /// Build a key migration transaction moving funds to `target`.
    async fn construct_migration(&self, target: &str) -> Result<SigningRequest> {
        let _ = target;
        Err(ChainError::Unsupported("migration".to_string()))
    }

    async fn verify_migration(&self, target: &str, request: &SigningRequest) -> Result<()> {
        let _ = (target, request);
        Err(ChainError::Unsupported("migration".to_string()))
    }
}

#[async_trait]
pub trait Finalizer {
    /// Combine the context with the produced signatures. Pure.
    fn assemble(
        &self,
        context: &SigningContext,
        signatures: &[EcdsaSignature],
    ) -> Result<SignedArtifact>;

    /// Publish the artifact to the target chain. Calling it again with the
    /// same artifact succeeds without side effects.
    async fn broadcast(&self, artifact: &SignedArtifact) -> Result<()>;
}

/// Everything the engine needs from one chain.
pub trait ChainAdapter:
    AddressValid + GetDepositData + Constructor + Finalizer + Send + Sync
{
    /// Chain id as stored in `deposits.chain_id` / `withdrawal_chain_id`.
    fn chain_id(&self) -> &str;
}

pub(crate) fn expect_single(signatures: &[EcdsaSignature]) -> Result<&EcdsaSignature> {
    match signatures {
        [sig] => Ok(sig),
        other => Err(ChainError::Finalize(format!(
            "expected one signature, got {}",
            other.len()
        ))),
    }
}

pub(crate) fn expect_single_hash(request: &SigningRequest) -> Result<Hash32> {
    match request.message_hashes.as_slice() {
        [hash] => Ok(*hash),
        _ => Err(RejectReason::HashMismatch.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_bytes_roundtrip() {
        let ctx = SigningContext::Ton(ton::TonContext { hash: [9; 32] });
        let restored = SigningContext::from_bytes(&ctx.to_bytes().expect("encode")).expect("decode");
        assert_eq!(restored, ctx);
    }

    #[test]
    fn test_reject_reason_display() {
        let err: ChainError = RejectReason::FeeOutsideTolerance.into();
        assert_eq!(err.to_string(), "proposal rejected: fee rate outside tolerance");
    }
}
