//! Solana withdrawals.
//!
//! ```text
//! hash = sha256("withdraw" || bridge_id[32] || amount_le[8] || nonce_le[8]
//!               || receiver[32] || mint[32]?)
//! ```
//!
//! `mint` is omitted for native SOL. The withdrawal nonce is derived from
//! the deposit identifier under its own domain tag, see [`withdrawal_nonce`].
//! Signatures are `r || s || v`; the receiver submits them on-chain.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tss_crypto::hashing::{encode_multi_field, sha256};
use tss_types::{Deposit, DepositIdentifier, EcdsaSignature, Hash32};

use crate::evm::NATIVE_TOKEN;
use crate::{
    amount, expect_single, expect_single_hash, AddressValid, ChainAdapter, ChainError,
    Constructor, DepositData, Finalizer, GetDepositData, RejectReason, Result, SignedArtifact,
    SigningContext, SigningRequest,
};

const WITHDRAW_TAG: &[u8] = b"withdraw";
const NONCE_DOMAIN: &[u8] = b"bridge-withdrawal-nonce";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolanaConfig {
    pub name: String,
    pub id: String,
    /// Base58 bridge account.
    pub bridge_id: String,
    #[serde(default)]
    pub rpc_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolanaContext {
    pub amount: u64,
    pub nonce: u64,
    pub receiver: [u8; 32],
    pub mint: Option<[u8; 32]>,
}

/// Decode a base58 Solana public key.
pub fn decode_pubkey(s: &str) -> Result<[u8; 32]> {
    let bytes =
        bitcoin::base58::decode(s).map_err(|_| ChainError::InvalidAddress(s.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ChainError::InvalidAddress(s.to_string()))
}

pub fn encode_pubkey(key: &[u8; 32]) -> String {
    bitcoin::base58::encode(key)
}

/// Nonce committed in the withdrawal: the first 8 bytes (LE) of
/// `sha256(NONCE_DOMAIN || fields(chain_id, tx_hash, tx_nonce_le))`.
pub fn withdrawal_nonce(id: &DepositIdentifier) -> u64 {
    let fields = encode_multi_field(&[
        id.chain_id.as_bytes(),
        id.tx_hash.as_bytes(),
        &id.tx_nonce.to_le_bytes(),
    ]);
    let mut preimage = Vec::with_capacity(NONCE_DOMAIN.len() + fields.len());
    preimage.extend_from_slice(NONCE_DOMAIN);
    preimage.extend_from_slice(&fields);
    let digest = sha256(&preimage);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(first)
}

impl SolanaContext {
    pub fn from_deposit(deposit: &Deposit) -> Result<Self> {
        let mint = if deposit.withdrawal_token == NATIVE_TOKEN {
            None
        } else {
            Some(decode_pubkey(&deposit.withdrawal_token)?)
        };
        Ok(Self {
            amount: amount::to_u64(&deposit.withdrawal_amount)?,
            nonce: withdrawal_nonce(&deposit.identifier),
            receiver: decode_pubkey(&deposit.receiver)?,
            mint,
        })
    }

    pub fn hash(&self, bridge_id: &[u8; 32]) -> Hash32 {
        let mut buf = Vec::with_capacity(WITHDRAW_TAG.len() + 32 + 8 + 8 + 32 + 32);
        buf.extend_from_slice(WITHDRAW_TAG);
        buf.extend_from_slice(bridge_id);
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.receiver);
        if let Some(mint) = &self.mint {
            buf.extend_from_slice(mint);
        }
        sha256(&buf)
    }
}

pub struct SolanaChain {
    config: SolanaConfig,
}

impl SolanaChain {
    pub fn new(config: SolanaConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn bridge_id(&self) -> Result<[u8; 32]> {
        decode_pubkey(&self.config.bridge_id)
    }
}

impl AddressValid for SolanaChain {
    fn is_valid_address(&self, address: &str) -> bool {
        decode_pubkey(address).is_ok()
    }
}

#[async_trait]
impl GetDepositData for SolanaChain {
    async fn get_deposit_data(&self, _id: &DepositIdentifier) -> Result<DepositData> {
        Err(ChainError::Unsupported("Solana deposit discovery".to_string()))
    }
}

#[async_trait]
impl Constructor for SolanaChain {
    async fn construct(&self, deposit: &Deposit) -> Result<SigningRequest> {
        let context = SolanaContext::from_deposit(deposit)?;
        Ok(SigningRequest {
            message_hashes: vec![context.hash(&self.bridge_id()?)],
            context: SigningContext::Solana(context),
        })
    }

    async fn verify(&self, deposit: &Deposit, request: &SigningRequest) -> Result<()> {
        let SigningContext::Solana(ctx) = &request.context else {
            return Err(RejectReason::WrongChain.into());
        };
        if *ctx != SolanaContext::from_deposit(deposit)? {
            return Err(RejectReason::ContextMismatch.into());
        }
        if expect_single_hash(request)? != ctx.hash(&self.bridge_id()?) {
            return Err(RejectReason::HashMismatch.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Finalizer for SolanaChain {
    fn assemble(
        &self,
        context: &SigningContext,
        signatures: &[EcdsaSignature],
    ) -> Result<SignedArtifact> {
        if !matches!(context, SigningContext::Solana(_)) {
            return Err(ChainError::Finalize("not a Solana context".to_string()));
        }
        let sig = expect_single(signatures)?;
        Ok(SignedArtifact {
            signature: hex::encode(sig.to_bytes()),
            withdrawal_tx_hash: None,
            raw: None,
        })
    }

    async fn broadcast(&self, _artifact: &SignedArtifact) -> Result<()> {
        Ok(())
    }
}

impl ChainAdapter for SolanaChain {
    fn chain_id(&self) -> &str {
        &self.config.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use tss_types::WithdrawalStatus;

    fn chain() -> SolanaChain {
        SolanaChain::new(SolanaConfig {
            name: "solana".to_string(),
            id: "solana".to_string(),
            bridge_id: bitcoin::base58::encode(&[4u8; 32]),
            rpc_url: String::new(),
        })
    }

    fn deposit(token: &str) -> Deposit {
        Deposit {
            id: 1,
            identifier: DepositIdentifier::new("11155111", "0xabc", 0),
            depositor: None,
            deposit_amount: BigUint::from(1_000u32),
            withdrawal_amount: BigUint::from(1_000u32),
            deposit_token: "0xaaaa".to_string(),
            withdrawal_token: token.to_string(),
            receiver: bitcoin::base58::encode(&[8u8; 32]),
            deposit_block: 1,
            is_wrapped_token: false,
            withdrawal_chain_id: "solana".to_string(),
            withdrawal_status: WithdrawalStatus::Pending,
            signature: None,
            withdrawal_tx_hash: None,
        }
    }

    #[test]
    fn test_hash_layout_native() {
        let ctx = SolanaContext::from_deposit(&deposit(NATIVE_TOKEN)).expect("ctx");
        let mut expected = Vec::new();
        expected.extend_from_slice(b"withdraw");
        expected.extend_from_slice(&[4u8; 32]);
        expected.extend_from_slice(&1_000u64.to_le_bytes());
        expected.extend_from_slice(&ctx.nonce.to_le_bytes());
        expected.extend_from_slice(&[8u8; 32]);
        assert_eq!(ctx.hash(&[4u8; 32]), sha256(&expected));
    }

    #[test]
    fn test_mint_changes_hash() {
        let native = SolanaContext::from_deposit(&deposit(NATIVE_TOKEN)).expect("ctx");
        let spl = SolanaContext::from_deposit(&deposit(&bitcoin::base58::encode(&[6u8; 32])))
            .expect("ctx");
        assert_eq!(spl.mint, Some([6u8; 32]));
        assert_ne!(native.hash(&[4u8; 32]), spl.hash(&[4u8; 32]));
    }

    #[test]
    fn test_nonce_distinguishes_deposits() {
        let a = withdrawal_nonce(&DepositIdentifier::new("1", "0xabc", 0));
        let b = withdrawal_nonce(&DepositIdentifier::new("1", "0xabc", 1));
        let c = withdrawal_nonce(&DepositIdentifier::new("2", "0xabc", 0));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, withdrawal_nonce(&DepositIdentifier::new("1", "0xabc", 0)));
    }

    #[tokio::test]
    async fn test_construct_verify() {
        let chain = chain();
        let request = chain.construct(&deposit(NATIVE_TOKEN)).await.expect("construct");
        chain.verify(&deposit(NATIVE_TOKEN), &request).await.expect("verify");

        let mut other = deposit(NATIVE_TOKEN);
        other.identifier.tx_nonce = 1;
        let err = chain.verify(&other, &request).await.expect_err("different nonce");
        assert!(matches!(err, ChainError::Verification(RejectReason::ContextMismatch)));
    }

    #[test]
    fn test_address_validation() {
        let chain = chain();
        assert!(chain.is_valid_address(&bitcoin::base58::encode(&[1u8; 32])));
        assert!(!chain.is_valid_address(&bitcoin::base58::encode(&[1u8; 20])));
        assert!(!chain.is_valid_address("0OIl"));
    }
}
