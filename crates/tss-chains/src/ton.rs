//! TON withdrawals.
//!
//! The bridge contract exposes `get_withdrawal_hash`; the message hash is
//! whatever that get-method returns for the withdrawal's numeric arguments,
//! so every peer obtains it the same way. Signatures are `r || s || v`.
//! Deposit discovery on TON is not supported.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tss_crypto::hashing::sha256;
use tss_types::{Deposit, DepositIdentifier, EcdsaSignature, Hash32};

use crate::evm::{strip_0x, NATIVE_TOKEN};
use crate::rpc::JsonRpcClient;
use crate::{
    expect_single, expect_single_hash, AddressValid, ChainAdapter, ChainError, Constructor,
    DepositData, Finalizer, GetDepositData, RejectReason, Result, SignedArtifact, SigningContext,
    SigningRequest,
};

pub const WITHDRAWAL_HASH_METHOD: &str = "get_withdrawal_hash";

fn default_timeout_ms() -> u64 {
    15_000
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TonConfig {
    pub name: String,
    pub id: String,
    /// toncenter `jsonRPC` endpoint.
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub bridge_address: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TonContext {
    pub hash: Hash32,
}

/// A parsed TON account address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TonAddress {
    pub workchain: i8,
    pub hash: [u8; 32],
}

/// CRC-16/XMODEM, as appended to user-friendly addresses.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= u16::from(*byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

impl TonAddress {
    /// Parse raw (`wc:hex`) or user-friendly (base64, 36 bytes) form.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || ChainError::InvalidAddress(s.to_string());
        if let Some((wc, hash)) = s.split_once(':') {
            let workchain: i8 = wc.parse().map_err(|_| invalid())?;
            let bytes = hex::decode(hash).map_err(|_| invalid())?;
            let hash: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
            return Ok(Self { workchain, hash });
        }
        if s.len() != 48 {
            return Err(invalid());
        }
        let bytes = URL_SAFE
            .decode(s)
            .or_else(|_| STANDARD.decode(s))
            .map_err(|_| invalid())?;
        if bytes.len() != 36 {
            return Err(invalid());
        }
        let expected = u16::from_be_bytes([bytes[34], bytes[35]]);
        if crc16(&bytes[..34]) != expected {
            return Err(invalid());
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);
        Ok(Self {
            workchain: bytes[1] as i8,
            hash,
        })
    }

    pub fn to_raw(&self) -> String {
        format!("{}:{}", self.workchain, hex::encode(self.hash))
    }
}

/// Runs get-methods against the bridge contract.
#[async_trait]
pub trait TonGetter: Send + Sync {
    /// Call `method` with numeric arguments; returns the numeric stack.
    async fn run_get_method(
        &self,
        address: &str,
        method: &str,
        args: &[BigUint],
    ) -> Result<Vec<BigUint>>;
}

/// Arguments of `get_withdrawal_hash`, in stack order.
pub fn withdrawal_args(deposit: &Deposit) -> Result<Vec<BigUint>> {
    let receiver = TonAddress::parse(&deposit.receiver)?;
    let token = if deposit.withdrawal_token == NATIVE_TOKEN {
        BigUint::from(0u8)
    } else {
        BigUint::from_bytes_be(&TonAddress::parse(&deposit.withdrawal_token)?.hash)
    };
    // The origin transaction hash is committed as sha256 of its string form
    // so every source chain's hash format fits in one 256-bit cell.
    let origin = sha256(deposit.identifier.tx_hash.as_bytes());
    Ok(vec![
        BigUint::from(u8::from(deposit.is_wrapped_token)),
        deposit.withdrawal_amount.clone(),
        BigUint::from(receiver.workchain as u8),
        BigUint::from_bytes_be(&receiver.hash),
        token,
        BigUint::from_bytes_be(&origin),
        BigUint::from(deposit.identifier.tx_nonce),
    ])
}

fn to_hash32(value: &BigUint) -> Result<Hash32> {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return Err(ChainError::InvalidResponse("hash wider than 256 bits".to_string()));
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct TonChain {
    config: TonConfig,
    getter: Arc<dyn TonGetter>,
}

impl TonChain {
    pub fn connect(config: TonConfig) -> Result<Self> {
        let url = match &config.api_key {
            Some(key) => format!("{}?api_key={key}", config.rpc_url),
            None => config.rpc_url.clone(),
        };
        let rpc = JsonRpcClient::new(url, Duration::from_millis(config.timeout_ms))?;
        Ok(Self::with_getter(config, Arc::new(ToncenterRpc { rpc })))
    }

    pub fn with_getter(config: TonConfig, getter: Arc<dyn TonGetter>) -> Self {
        Self { config, getter }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    async fn withdrawal_hash(&self, deposit: &Deposit) -> Result<Hash32> {
        let args = withdrawal_args(deposit)?;
        let stack = self
            .getter
            .run_get_method(&self.config.bridge_address, WITHDRAWAL_HASH_METHOD, &args)
            .await?;
        let first = stack
            .first()
            .ok_or_else(|| ChainError::InvalidResponse("empty stack".to_string()))?;
        to_hash32(first)
    }
}

impl AddressValid for TonChain {
    fn is_valid_address(&self, address: &str) -> bool {
        TonAddress::parse(address).is_ok()
    }
}

#[async_trait]
impl GetDepositData for TonChain {
    async fn get_deposit_data(&self, _id: &DepositIdentifier) -> Result<DepositData> {
        Err(ChainError::Unsupported("TON deposit discovery".to_string()))
    }
}

#[async_trait]
impl Constructor for TonChain {
    async fn construct(&self, deposit: &Deposit) -> Result<SigningRequest> {
        let hash = self.withdrawal_hash(deposit).await?;
        Ok(SigningRequest {
            message_hashes: vec![hash],
            context: SigningContext::Ton(TonContext { hash }),
        })
    }

    async fn verify(&self, deposit: &Deposit, request: &SigningRequest) -> Result<()> {
        let SigningContext::Ton(ctx) = &request.context else {
            return Err(RejectReason::WrongChain.into());
        };
        let expected = self.withdrawal_hash(deposit).await?;
        if ctx.hash != expected || expect_single_hash(request)? != expected {
            return Err(RejectReason::HashMismatch.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Finalizer for TonChain {
    fn assemble(
        &self,
        context: &SigningContext,
        signatures: &[EcdsaSignature],
    ) -> Result<SignedArtifact> {
        if !matches!(context, SigningContext::Ton(_)) {
            return Err(ChainError::Finalize("not a TON context".to_string()));
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

impl ChainAdapter for TonChain {
    fn chain_id(&self) -> &str {
        &self.config.id
    }
}

// ---------------------------------------------------------------------------
// toncenter
// ---------------------------------------------------------------------------

pub struct ToncenterRpc {
    rpc: JsonRpcClient,
}

#[async_trait]
impl TonGetter for ToncenterRpc {
    async fn run_get_method(
        &self,
        address: &str,
        method: &str,
        args: &[BigUint],
    ) -> Result<Vec<BigUint>> {
        let stack: Vec<Value> = args
            .iter()
            .map(|a| json!(["num", format!("0x{}", a.to_str_radix(16))]))
            .collect();
        let result = self
            .rpc
            .call_raw(
                "runGetMethod",
                json!({ "address": address, "method": method, "stack": stack }),
            )
            .await?;
        let exit_code = result["exit_code"].as_i64().unwrap_or(-1);
        if exit_code != 0 {
            return Err(ChainError::Rpc {
                method: method.to_string(),
                code: exit_code,
                message: "get-method failed".to_string(),
            });
        }
        result["stack"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|entry| {
                let num = entry[1]
                    .as_str()
                    .ok_or_else(|| ChainError::InvalidResponse("non-numeric stack entry".to_string()))?;
                BigUint::parse_bytes(strip_0x(num).as_bytes(), 16)
                    .ok_or_else(|| ChainError::InvalidResponse(format!("bad number {num}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tss_types::WithdrawalStatus;

    /// Stands in for the contract: hashes the arguments.
    struct HashingGetter;

    #[async_trait]
    impl TonGetter for HashingGetter {
        async fn run_get_method(
            &self,
            _address: &str,
            _method: &str,
            args: &[BigUint],
        ) -> Result<Vec<BigUint>> {
            let mut buf = Vec::new();
            for arg in args {
                buf.extend_from_slice(&arg.to_bytes_be());
                buf.push(0xff);
            }
            Ok(vec![BigUint::from_bytes_be(&sha256(&buf))])
        }
    }

    fn friendly(workchain: i8, hash: [u8; 32]) -> String {
        let mut bytes = vec![0x11, workchain as u8];
        bytes.extend_from_slice(&hash);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        URL_SAFE.encode(bytes)
    }

    fn chain() -> TonChain {
        TonChain::with_getter(
            TonConfig {
                name: "ton".to_string(),
                id: "ton".to_string(),
                rpc_url: String::new(),
                api_key: None,
                bridge_address: format!("0:{}", "ab".repeat(32)),
                timeout_ms: 1_000,
            },
            Arc::new(HashingGetter),
        )
    }

    fn deposit() -> Deposit {
        Deposit {
            id: 1,
            identifier: DepositIdentifier::new("11155111", "0xabc", 2),
            depositor: None,
            deposit_amount: BigUint::from(10u8),
            withdrawal_amount: BigUint::from(10u8),
            deposit_token: "0xaaaa".to_string(),
            withdrawal_token: NATIVE_TOKEN.to_string(),
            receiver: friendly(0, [5; 32]),
            deposit_block: 1,
            is_wrapped_token: false,
            withdrawal_chain_id: "ton".to_string(),
            withdrawal_status: WithdrawalStatus::Pending,
            signature: None,
            withdrawal_tx_hash: None,
        }
    }

    #[test]
    fn test_crc16_xmodem_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_parse_addresses() {
        let raw = TonAddress::parse(&format!("-1:{}", "cd".repeat(32))).expect("raw");
        assert_eq!(raw.workchain, -1);
        assert_eq!(raw.hash, [0xcd; 32]);

        let parsed = TonAddress::parse(&friendly(0, [5; 32])).expect("friendly");
        assert_eq!(parsed.to_raw(), format!("0:{}", "05".repeat(32)));

        let mut corrupted = friendly(0, [5; 32]);
        let replacement = if &corrupted[10..11] == "A" { "B" } else { "A" };
        corrupted.replace_range(10..11, replacement);
        assert!(TonAddress::parse(&corrupted).is_err());
        assert!(TonAddress::parse("0:abcd").is_err());
    }

    #[tokio::test]
    async fn test_construct_verify() {
        let chain = chain();
        let request = chain.construct(&deposit()).await.expect("construct");
        chain.verify(&deposit(), &request).await.expect("verify");

        let mut other = deposit();
        other.withdrawal_amount = BigUint::from(11u8);
        let err = chain.verify(&other, &request).await.expect_err("amount changed");
        assert!(matches!(err, ChainError::Verification(RejectReason::HashMismatch)));
    }

    #[tokio::test]
    async fn test_deposits_unsupported() {
        let err = chain()
            .get_deposit_data(&DepositIdentifier::new("ton", "abc", 0))
            .await
            .expect_err("unsupported");
        assert!(matches!(err, ChainError::Unsupported(_)));
    }
}
