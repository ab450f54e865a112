//! EVM withdrawals.
//!
//! The signed message is the Ethereum personal-message hash of the packed
//! withdrawal operation:
//!
//! ```text
//! inner = keccak256(token[20] || amount[32] || receiver[20] || tx_hash[32]
//!                   || tx_nonce[32] || chain_id[32] || is_wrapped[1])
//! hash  = keccak256("\x19Ethereum Signed Message:\n32" || inner)
//! ```
//!
//! The withdrawal signature is `r || s || v+27`. Nothing is broadcast: the
//! receiver submits the signature to the bridge contract.

use std::time::Duration;

use async_trait::async_trait;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tss_crypto::hashing::keccak256;
use tss_types::{Deposit, DepositIdentifier, EcdsaSignature, Hash32};

use crate::rpc::JsonRpcClient;
use crate::{
    amount, expect_single, expect_single_hash, AddressValid, ChainAdapter, ChainError,
    Constructor, DepositData, Finalizer, GetDepositData, RejectReason, Result, SignedArtifact,
    SigningContext, SigningRequest,
};

const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// Event emitted by the bridge contract on every deposit.
pub const DEPOSIT_EVENT: &str = "Deposited(address,uint256,string,string)";

/// Token value meaning the chain's native coin.
pub const NATIVE_TOKEN: &str = "native";

fn default_confirmations() -> u64 {
    12
}

fn default_timeout_ms() -> u64 {
    15_000
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmConfig {
    pub name: String,
    /// Numeric EVM chain id, e.g. `"11155111"`.
    pub id: String,
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default)]
    pub bridge_address: String,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// The withdrawal operation as packed into the hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmContext {
    pub token: String,
    /// Decimal string, in the withdrawal token's units.
    pub amount: String,
    pub receiver: String,
    pub tx_hash: String,
    pub tx_nonce: u64,
    pub chain_id: u64,
    pub is_wrapped: bool,
}

impl EvmContext {
    pub fn from_deposit(deposit: &Deposit, chain_id: u64) -> Self {
        Self {
            token: deposit.withdrawal_token.clone(),
            amount: deposit.withdrawal_amount.to_string(),
            receiver: deposit.receiver.clone(),
            tx_hash: deposit.identifier.tx_hash.clone(),
            tx_nonce: deposit.identifier.tx_nonce,
            chain_id,
            is_wrapped: deposit.is_wrapped_token,
        }
    }

    /// Hash to sign for this operation.
    pub fn hash(&self) -> Result<Hash32> {
        let amount: BigUint = self
            .amount
            .parse()
            .map_err(|_| ChainError::Encoding(format!("bad amount {}", self.amount)))?;

        let mut packed = Vec::with_capacity(20 + 32 + 20 + 32 + 32 + 32 + 1);
        if self.token == NATIVE_TOKEN {
            packed.extend_from_slice(&[0u8; 20]);
        } else {
            packed.extend_from_slice(&parse_address(&self.token)?);
        }
        packed.extend_from_slice(&amount::to_be_word(&amount)?);
        packed.extend_from_slice(&parse_address(&self.receiver)?);
        packed.extend_from_slice(&bytes32_of(&self.tx_hash));
        packed.extend_from_slice(&u64_word(self.tx_nonce));
        packed.extend_from_slice(&u64_word(self.chain_id));
        packed.push(u8::from(self.is_wrapped));

        let inner = keccak256(&packed);
        let mut prefixed = Vec::with_capacity(PERSONAL_MESSAGE_PREFIX.len() + 32);
        prefixed.extend_from_slice(PERSONAL_MESSAGE_PREFIX);
        prefixed.extend_from_slice(&inner);
        Ok(keccak256(&prefixed))
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

pub(crate) fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

fn parse_address(s: &str) -> Result<[u8; 20]> {
    let raw = strip_0x(s);
    if raw.len() != 40 {
        return Err(ChainError::InvalidAddress(s.to_string()));
    }
    let bytes = hex::decode(raw).map_err(|_| ChainError::InvalidAddress(s.to_string()))?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Source transaction hashes come from any chain: 32-byte hex is used as-is,
/// anything else is hashed.
fn bytes32_of(tx_hash: &str) -> [u8; 32] {
    match hex::decode(strip_0x(tx_hash)) {
        Ok(bytes) if bytes.len() == 32 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(&bytes);
            out
        }
        _ => keccak256(tx_hash.as_bytes()),
    }
}

fn u64_word(v: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&v.to_be_bytes());
    word
}

fn parse_quantity(value: &Value, field: &str) -> Result<u64> {
    let s = value
        .as_str()
        .ok_or_else(|| ChainError::InvalidResponse(format!("missing {field}")))?;
    u64::from_str_radix(strip_0x(s), 16)
        .map_err(|_| ChainError::InvalidResponse(format!("bad {field}: {s}")))
}

fn word_at(data: &[u8], offset: usize) -> Result<&[u8]> {
    offset
        .checked_add(32)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| ChainError::InvalidDeposit("truncated log data".to_string()))
}

fn word_as_usize(word: &[u8]) -> Result<usize> {
    if word[..24].iter().any(|b| *b != 0) {
        return Err(ChainError::InvalidDeposit("offset out of range".to_string()));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&word[24..]);
    usize::try_from(u64::from_be_bytes(bytes))
        .map_err(|_| ChainError::InvalidDeposit("offset out of range".to_string()))
}

fn abi_string(data: &[u8], head_offset: usize) -> Result<String> {
    let offset = word_as_usize(word_at(data, head_offset)?)?;
    let len = word_as_usize(word_at(data, offset)?)?;
    let start = offset.saturating_add(32);
    let bytes = start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| ChainError::InvalidDeposit("truncated string".to_string()))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ChainError::InvalidDeposit("non-utf8 string".to_string()))
}

/// A decoded `Deposited` event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepositLog {
    pub token: String,
    pub amount: BigUint,
    pub receiver: String,
    pub network: String,
}

/// Decode the data section of a `Deposited` event.
pub fn decode_deposit_log(data: &[u8]) -> Result<DepositLog> {
    let token_word = word_at(data, 0)?;
    let token = if token_word.iter().all(|b| *b == 0) {
        NATIVE_TOKEN.to_string()
    } else {
        format!("0x{}", hex::encode(&token_word[12..]))
    };
    let amount = BigUint::from_bytes_be(word_at(data, 32)?);
    let receiver = abi_string(data, 64)?;
    let network = abi_string(data, 96)?;
    Ok(DepositLog {
        token,
        amount,
        receiver,
        network,
    })
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct EvmChain {
    config: EvmConfig,
    chain_id: u64,
    rpc: JsonRpcClient,
}

impl EvmChain {
    pub fn connect(config: EvmConfig) -> Result<Self> {
        let chain_id = config
            .id
            .parse()
            .map_err(|_| ChainError::Encoding(format!("EVM chain id must be numeric: {}", config.id)))?;
        let rpc = JsonRpcClient::new(
            config.rpc_url.clone(),
            Duration::from_millis(config.timeout_ms),
        )?;
        Ok(Self {
            config,
            chain_id,
            rpc,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn context_of(request: &SigningRequest) -> Result<&EvmContext> {
        match &request.context {
            SigningContext::Evm(ctx) => Ok(ctx),
            _ => Err(RejectReason::WrongChain.into()),
        }
    }
}

impl AddressValid for EvmChain {
    fn is_valid_address(&self, address: &str) -> bool {
        address.starts_with("0x") && parse_address(address).is_ok()
    }
}

#[async_trait]
impl GetDepositData for EvmChain {
    async fn get_deposit_data(&self, id: &DepositIdentifier) -> Result<DepositData> {
        let receipt: Value = self
            .rpc
            .call_raw("eth_getTransactionReceipt", json!([id.tx_hash]))
            .await?;
        if receipt.is_null() {
            return Err(ChainError::DepositNotFound(id.to_string()));
        }
        if parse_quantity(&receipt["status"], "status")? != 1 {
            return Err(ChainError::InvalidDeposit("transaction reverted".to_string()));
        }
        let block = parse_quantity(&receipt["blockNumber"], "blockNumber")?;
        let head: Value = self.rpc.call_raw("eth_blockNumber", json!([])).await?;
        let head = parse_quantity(&head, "blockNumber")?;
        if head.saturating_sub(block) + 1 < self.config.confirmations {
            return Err(ChainError::InvalidDeposit(format!(
                "{} confirmations required",
                self.config.confirmations
            )));
        }

        let topic = format!("0x{}", hex::encode(keccak256(DEPOSIT_EVENT.as_bytes())));
        let logs = receipt["logs"].as_array().cloned().unwrap_or_default();
        let log = logs
            .iter()
            .filter(|log| {
                log["address"]
                    .as_str()
                    .is_some_and(|a| a.eq_ignore_ascii_case(&self.config.bridge_address))
                    && log["topics"][0]
                        .as_str()
                        .is_some_and(|t| t.eq_ignore_ascii_case(&topic))
            })
            .nth(usize::try_from(id.tx_nonce).unwrap_or(usize::MAX))
            .ok_or_else(|| ChainError::DepositNotFound(id.to_string()))?;

        let data = hex::decode(strip_0x(log["data"].as_str().unwrap_or_default()))
            .map_err(|_| ChainError::InvalidDeposit("log data is not hex".to_string()))?;
        let decoded = decode_deposit_log(&data)?;
        let depositor = log["topics"][1].as_str().and_then(topic_address);

        Ok(DepositData {
            identifier: id.clone(),
            depositor,
            amount: decoded.amount,
            token: decoded.token,
            receiver: decoded.receiver,
            withdrawal_chain_id: decoded.network,
            block,
        })
    }
}

/// The address in the low 20 bytes of an indexed topic word.
fn topic_address(topic: &str) -> Option<String> {
    let word = hex::decode(strip_0x(topic)).ok()?;
    let low = word.get(word.len().checked_sub(20)?..)?;
    Some(format!("0x{}", hex::encode(low)))
}

#[async_trait]
impl Constructor for EvmChain {
    async fn construct(&self, deposit: &Deposit) -> Result<SigningRequest> {
        let context = EvmContext::from_deposit(deposit, self.chain_id);
        let hash = context.hash()?;
        Ok(SigningRequest {
            message_hashes: vec![hash],
            context: SigningContext::Evm(context),
        })
    }

    async fn verify(&self, deposit: &Deposit, request: &SigningRequest) -> Result<()> {
        let context = Self::context_of(request)?;
        if *context != EvmContext::from_deposit(deposit, self.chain_id) {
            return Err(RejectReason::ContextMismatch.into());
        }
        if expect_single_hash(request)? != context.hash()? {
            return Err(RejectReason::HashMismatch.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Finalizer for EvmChain {
    fn assemble(
        &self,
        context: &SigningContext,
        signatures: &[EcdsaSignature],
    ) -> Result<SignedArtifact> {
        let SigningContext::Evm(ctx) = context else {
            return Err(ChainError::Finalize("not an EVM context".to_string()));
        };
        let sig = expect_single(signatures)?;
        // The receiver submits the signature; the bridge contract keys the
        // withdrawal by its operation hash.
        Ok(SignedArtifact {
            signature: format!("0x{}", hex::encode(sig.to_evm_bytes())),
            withdrawal_tx_hash: Some(format!("0x{}", hex::encode(ctx.hash()?))),
            raw: None,
        })
    }

    async fn broadcast(&self, _artifact: &SignedArtifact) -> Result<()> {
        Ok(())
    }
}

impl ChainAdapter for EvmChain {
    fn chain_id(&self) -> &str {
        &self.config.id
    }
}
