//! Zano asset withdrawals.
//!
//! The wallet builds the transaction (`emit_asset` for withdrawals,
//! `transfer_asset_ownership` for migrations) and returns the data needed for
//! external signing. The threshold key signs the expected transaction id;
//! `send_ext_signed_asset_tx` submits the transaction with the 64-byte
//! signature.

use std::time::Duration;

use async_trait::async_trait;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tss_types::{Deposit, DepositIdentifier, EcdsaSignature, Hash32};

use crate::evm::strip_0x;
use crate::rpc::JsonRpcClient;
use crate::{
    amount, expect_single, expect_single_hash, AddressValid, ChainAdapter, ChainError,
    Constructor, DepositData, Finalizer, GetDepositData, RejectReason, Result, SignedArtifact,
    SigningContext, SigningRequest,
};

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_confirmations() -> u64 {
    10
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZanoConfig {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub wallet_rpc_url: String,
    #[serde(default)]
    pub daemon_rpc_url: String,
    /// Asset emitted on withdrawals.
    pub asset_id: String,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Wallet output of an externally signed transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSigningData {
    pub expected_tx_hash: String,
    pub finalized_tx: String,
    pub unsigned_tx: String,
    pub outputs_addresses: Vec<String>,
    pub tx_secret_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZanoContext {
    pub expected_tx_hash: String,
    pub finalized_tx: String,
    pub data: ExternalSigningData,
}

impl ZanoContext {
    fn from_data(data: ExternalSigningData) -> Self {
        Self {
            expected_tx_hash: data.expected_tx_hash.clone(),
            finalized_tx: data.finalized_tx.clone(),
            data,
        }
    }

    /// The signed digest is the raw transaction id.
    pub fn hash(&self) -> Result<Hash32> {
        tx_id_bytes(&self.expected_tx_hash)
    }
}

fn tx_id_bytes(tx_id: &str) -> Result<Hash32> {
    let bytes =
        hex::decode(strip_0x(tx_id)).map_err(|e| ChainError::Encoding(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ChainError::Encoding(format!("tx id {tx_id} is not 32 bytes")))
}

/// One decoded output of a transaction under verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedOutput {
    pub address: String,
    pub amount: u64,
    pub asset_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedTx {
    pub verified_tx_id: String,
    pub outputs: Vec<DecodedOutput>,
}

/// An incoming transfer found by tx id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingTransfer {
    pub amount: u64,
    pub asset_id: String,
    pub comment: String,
    pub height: u64,
    pub confirmations: u64,
}

#[async_trait]
pub trait ZanoWallet: Send + Sync {
    async fn emit_asset(
        &self,
        asset_id: &str,
        receiver: &str,
        amount: u64,
    ) -> Result<ExternalSigningData>;
    async fn transfer_asset_ownership(
        &self,
        asset_id: &str,
        new_owner: &str,
    ) -> Result<ExternalSigningData>;
    async fn decrypt_tx_details(&self, data: &ExternalSigningData) -> Result<DecryptedTx>;
    async fn send_ext_signed_asset_tx(&self, context: &ZanoContext, signature: &str) -> Result<()>;
    async fn find_incoming(&self, tx_id: &str) -> Result<Vec<IncomingTransfer>>;
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct ZanoChain {
    config: ZanoConfig,
    wallet: std::sync::Arc<dyn ZanoWallet>,
}

impl ZanoChain {
    pub fn connect(config: ZanoConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let wallet = ZanoRpc {
            wallet: JsonRpcClient::new(config.wallet_rpc_url.clone(), timeout)?,
        };
        Ok(Self::with_wallet(config, std::sync::Arc::new(wallet)))
    }

    pub fn with_wallet(config: ZanoConfig, wallet: std::sync::Arc<dyn ZanoWallet>) -> Self {
        Self { config, wallet }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn context_of(request: &SigningRequest) -> Result<&ZanoContext> {
        match &request.context {
            SigningContext::Zano(ctx) => Ok(ctx),
            _ => Err(RejectReason::WrongChain.into()),
        }
    }

    fn request(data: ExternalSigningData) -> Result<SigningRequest> {
        let context = ZanoContext::from_data(data);
        Ok(SigningRequest {
            message_hashes: vec![context.hash()?],
            context: SigningContext::Zano(context),
        })
    }

    /// Decrypt the proposed transaction and check it is the one being signed.
    async fn decrypt_checked(&self, request: &SigningRequest) -> Result<DecryptedTx> {
        let ctx = Self::context_of(request)?;
        if ctx.expected_tx_hash != ctx.data.expected_tx_hash
            || ctx.finalized_tx != ctx.data.finalized_tx
        {
            return Err(RejectReason::ContextMismatch.into());
        }
        if expect_single_hash(request)? != ctx.hash()? {
            return Err(RejectReason::HashMismatch.into());
        }
        let details = self.wallet.decrypt_tx_details(&ctx.data).await?;
        if !details
            .verified_tx_id
            .eq_ignore_ascii_case(strip_0x(&ctx.expected_tx_hash))
        {
            return Err(RejectReason::HashMismatch.into());
        }
        Ok(details)
    }
}

fn is_valid_zano_address(address: &str) -> bool {
    // Standard and integrated addresses are base58 and start with Z or iZ.
    let prefixed = address.starts_with('Z') || address.starts_with("iZ");
    prefixed
        && (90..=110).contains(&address.len())
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l'))
}

impl AddressValid for ZanoChain {
    fn is_valid_address(&self, address: &str) -> bool {
        is_valid_zano_address(address)
    }
}

#[async_trait]
impl GetDepositData for ZanoChain {
    async fn get_deposit_data(&self, id: &DepositIdentifier) -> Result<DepositData> {
        let transfers = self.wallet.find_incoming(strip_0x(&id.tx_hash)).await?;
        let index = usize::try_from(id.tx_nonce).unwrap_or(usize::MAX);
        let transfer = transfers
            .get(index)
            .ok_or_else(|| ChainError::DepositNotFound(id.to_string()))?;
        if transfer.confirmations < self.config.confirmations {
            return Err(ChainError::InvalidDeposit(format!(
                "{} confirmations required",
                self.config.confirmations
            )));
        }
        let (withdrawal_chain_id, receiver) = transfer
            .comment
            .split_once(':')
            .ok_or_else(|| ChainError::InvalidDeposit("malformed comment".to_string()))?;
        Ok(DepositData {
            identifier: id.clone(),
            depositor: None,
            amount: BigUint::from(transfer.amount),
            token: transfer.asset_id.clone(),
            receiver: receiver.to_string(),
            withdrawal_chain_id: withdrawal_chain_id.to_string(),
            block: transfer.height,
        })
    }
}

#[async_trait]
impl Constructor for ZanoChain {
    async fn construct(&self, deposit: &Deposit) -> Result<SigningRequest> {
        let amount = amount::to_u64(&deposit.withdrawal_amount)?;
        let data = self
            .wallet
            .emit_asset(&deposit.withdrawal_token, &deposit.receiver, amount)
            .await?;
        Self::request(data)
    }

    async fn verify(&self, deposit: &Deposit, request: &SigningRequest) -> Result<()> {
        let details = self.decrypt_checked(request).await?;
        let amount = amount::to_u64(&deposit.withdrawal_amount)?;
        let pays_receiver = details.outputs.iter().any(|o| {
            o.address == deposit.receiver
                && o.amount == amount
                && o.asset_id == deposit.withdrawal_token
        });
        if !pays_receiver {
            return Err(RejectReason::WrongDestination.into());
        }
        Ok(())
    }

    async fn construct_migration(&self, target: &str) -> Result<SigningRequest> {
        let data = self
            .wallet
            .transfer_asset_ownership(&self.config.asset_id, target)
            .await?;
        Self::request(data)
    }

    async fn verify_migration(&self, target: &str, request: &SigningRequest) -> Result<()> {
        // Ownership transfers carry no value outputs. The wallet checks the
        // blob against the transaction id, which commits to the new owner.
        self.decrypt_checked(request).await?;
        tracing::debug!(chain = %self.config.name, target, "ownership transfer verified");
        Ok(())
    }
}

#[async_trait]
impl Finalizer for ZanoChain {
    fn assemble(
        &self,
        context: &SigningContext,
        signatures: &[EcdsaSignature],
    ) -> Result<SignedArtifact> {
        let SigningContext::Zano(ctx) = context else {
            return Err(ChainError::Finalize("not a Zano context".to_string()));
        };
        let sig = expect_single(signatures)?;
        let raw = tss_types::cbor::to_vec(ctx).map_err(|e| ChainError::Encoding(e.to_string()))?;
        Ok(SignedArtifact {
            signature: hex::encode(sig.to_compact()),
            withdrawal_tx_hash: Some(strip_0x(&ctx.expected_tx_hash).to_string()),
            raw: Some(raw),
        })
    }

    async fn broadcast(&self, artifact: &SignedArtifact) -> Result<()> {
        let raw = artifact
            .raw
            .as_deref()
            .ok_or_else(|| ChainError::Finalize("artifact has no transaction".to_string()))?;
        let ctx: ZanoContext = tss_types::cbor::from_slice_named(raw, "ZanoContext")
            .map_err(|e| ChainError::Encoding(e.to_string()))?;
        match self
            .wallet
            .send_ext_signed_asset_tx(&ctx, &artifact.signature)
            .await
        {
            Ok(()) => Ok(()),
            Err(ChainError::Rpc { message, .. }) if message.contains("already") => {
                tracing::debug!(tx = %ctx.expected_tx_hash, "transaction already relayed");
                Ok(())
            }
            Err(e) => Err(ChainError::Finalize(e.to_string())),
        }
    }
}

impl ChainAdapter for ZanoChain {
    fn chain_id(&self) -> &str {
        &self.config.id
    }
}

// ---------------------------------------------------------------------------
// Wallet JSON-RPC
// ---------------------------------------------------------------------------

pub struct ZanoRpc {
    wallet: JsonRpcClient,
}

fn field<'a>(value: &'a Value, name: &str) -> Result<&'a str> {
    value[name]
        .as_str()
        .ok_or_else(|| ChainError::InvalidResponse(format!("missing {name}")))
}

fn signing_data(result: &Value) -> Result<ExternalSigningData> {
    let ext = &result["data_for_external_signing"];
    Ok(ExternalSigningData {
        expected_tx_hash: field(result, "tx_id")?.to_string(),
        finalized_tx: field(ext, "finalized_tx")?.to_string(),
        unsigned_tx: field(ext, "unsigned_tx")?.to_string(),
        outputs_addresses: ext["outputs_addresses"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        tx_secret_key: field(ext, "tx_secret_key")?.to_string(),
    })
}

#[async_trait]
impl ZanoWallet for ZanoRpc {
    async fn emit_asset(
        &self,
        asset_id: &str,
        receiver: &str,
        amount: u64,
    ) -> Result<ExternalSigningData> {
        let result = self
            .wallet
            .call_raw(
                "emit_asset",
                json!({
                    "asset_id": asset_id,
                    "destinations": [{ "address": receiver, "amount": amount, "asset_id": asset_id }],
                    "do_not_split_destinations": false,
                }),
            )
            .await?;
        signing_data(&result)
    }

    async fn transfer_asset_ownership(
        &self,
        asset_id: &str,
        new_owner: &str,
    ) -> Result<ExternalSigningData> {
        let result = self
            .wallet
            .call_raw(
                "transfer_asset_ownership",
                json!({ "asset_id": asset_id, "new_owner_eth_pub_key": new_owner }),
            )
            .await?;
        signing_data(&result)
    }

    async fn decrypt_tx_details(&self, data: &ExternalSigningData) -> Result<DecryptedTx> {
        let result = self
            .wallet
            .call_raw(
                "decrypt_tx_details",
                json!({
                    "tx_id": data.expected_tx_hash,
                    "tx_blob": data.unsigned_tx,
                    "tx_secret_key": data.tx_secret_key,
                    "outputs_addresses": data.outputs_addresses,
                }),
            )
            .await?;
        let outputs = result["decoded_outputs"]
            .as_array()
            .map(|outputs| {
                outputs
                    .iter()
                    .filter_map(|o| {
                        Some(DecodedOutput {
                            address: o["address"].as_str()?.to_string(),
                            amount: o["amount"].as_u64()?,
                            asset_id: o["asset_id"].as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(DecryptedTx {
            verified_tx_id: field(&result, "verified_tx_id")?.to_string(),
            outputs,
        })
    }

    async fn send_ext_signed_asset_tx(&self, context: &ZanoContext, signature: &str) -> Result<()> {
        let result = self
            .wallet
            .call_raw(
                "send_ext_signed_asset_tx",
                json!({
                    "eth_sig": signature,
                    "expected_tx_id": context.expected_tx_hash,
                    "finalized_tx": context.finalized_tx,
                    "unsigned_tx": context.data.unsigned_tx,
                    "unlock_transfers_on_fail": false,
                }),
            )
            .await?;
        match result["status"].as_str() {
            Some("OK") | None => Ok(()),
            Some(status) => Err(ChainError::Finalize(format!("wallet status {status}"))),
        }
    }

    async fn find_incoming(&self, tx_id: &str) -> Result<Vec<IncomingTransfer>> {
        let result = self
            .wallet
            .call_raw(
                "search_for_transactions2",
                json!({ "tx_id": tx_id, "in": true, "out": false, "pool": false, "filter_by_height": false }),
            )
            .await?;
        let head: Value = self.wallet.call_raw("get_wallet_info", json!({})).await?;
        let head = head["current_height"].as_u64().unwrap_or(0);
        let mut transfers = Vec::new();
        for entry in result["in"].as_array().into_iter().flatten() {
            let height = entry["height"].as_u64().unwrap_or(0);
            let comment = entry["comment"].as_str().unwrap_or_default().to_string();
            for sub in entry["subtransfers"].as_array().into_iter().flatten() {
                if !sub["is_income"].as_bool().unwrap_or(false) {
                    continue;
                }
                transfers.push(IncomingTransfer {
                    amount: sub["amount"].as_u64().unwrap_or(0),
                    asset_id: sub["asset_id"].as_str().unwrap_or_default().to_string(),
                    comment: comment.clone(),
                    height,
                    confirmations: if height == 0 { 0 } else { head.saturating_sub(height) + 1 },
                });
            }
        }
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tss_types::WithdrawalStatus;

    const TX_ID: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";

    #[derive(Default)]
    struct StubWallet {
        /// The wallet decodes an output that differs from the request.
        tamper: bool,
        sent: AtomicUsize,
    }

    fn data() -> ExternalSigningData {
        ExternalSigningData {
            expected_tx_hash: TX_ID.to_string(),
            finalized_tx: "finalized".to_string(),
            unsigned_tx: "unsigned".to_string(),
            outputs_addresses: vec!["ZxReceiver".to_string()],
            tx_secret_key: "secret".to_string(),
        }
    }

    #[async_trait]
    impl ZanoWallet for StubWallet {
        async fn emit_asset(&self, _: &str, _: &str, _: u64) -> Result<ExternalSigningData> {
            Ok(data())
        }
        async fn transfer_asset_ownership(&self, _: &str, _: &str) -> Result<ExternalSigningData> {
            Ok(data())
        }
        async fn decrypt_tx_details(&self, data: &ExternalSigningData) -> Result<DecryptedTx> {
            Ok(DecryptedTx {
                verified_tx_id: data.expected_tx_hash.clone(),
                outputs: vec![DecodedOutput {
                    address: "ZxReceiver".to_string(),
                    amount: if self.tamper { 1 } else { 5_000 },
                    asset_id: "asset".to_string(),
                }],
            })
        }
        async fn send_ext_signed_asset_tx(&self, _: &ZanoContext, _: &str) -> Result<()> {
            if self.sent.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(ChainError::Rpc {
                    method: "send_ext_signed_asset_tx".to_string(),
                    code: -1,
                    message: "transaction already in pool".to_string(),
                });
            }
            Ok(())
        }
        async fn find_incoming(&self, _: &str) -> Result<Vec<IncomingTransfer>> {
            Ok(vec![IncomingTransfer {
                amount: 7_000,
                asset_id: "asset".to_string(),
                comment: "11155111:0x2222222222222222222222222222222222222222".to_string(),
                height: 90,
                confirmations: 20,
            }])
        }
    }

    fn chain(wallet: Arc<StubWallet>) -> ZanoChain {
        ZanoChain::with_wallet(
            ZanoConfig {
                name: "zano".to_string(),
                id: "zano".to_string(),
                wallet_rpc_url: String::new(),
                daemon_rpc_url: String::new(),
                asset_id: "asset".to_string(),
                confirmations: 10,
                timeout_ms: 1_000,
            },
            wallet,
        )
    }

    fn deposit() -> Deposit {
        Deposit {
            id: 1,
            identifier: DepositIdentifier::new("11155111", "0xabc", 0),
            depositor: None,
            deposit_amount: BigUint::from(5_000u32),
            withdrawal_amount: BigUint::from(5_000u32),
            deposit_token: "0xaaaa".to_string(),
            withdrawal_token: "asset".to_string(),
            receiver: "ZxReceiver".to_string(),
            deposit_block: 1,
            is_wrapped_token: true,
            withdrawal_chain_id: "zano".to_string(),
            withdrawal_status: WithdrawalStatus::Pending,
            signature: None,
            withdrawal_tx_hash: None,
        }
    }

    #[tokio::test]
    async fn test_construct_verify() {
        let chain = chain(Arc::new(StubWallet::default()));
        let request = chain.construct(&deposit()).await.expect("construct");
        assert_eq!(hex::encode(request.message_hashes[0]), TX_ID);
        chain.verify(&deposit(), &request).await.expect("verify");
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_output() {
        let chain = chain(Arc::new(StubWallet {
            tamper: true,
            ..StubWallet::default()
        }));
        let request = chain.construct(&deposit()).await.expect("construct");
        let err = chain.verify(&deposit(), &request).await.expect_err("tampered");
        assert!(matches!(err, ChainError::Verification(RejectReason::WrongDestination)));
    }

    #[tokio::test]
    async fn test_finalize_strips_recovery_id_and_is_idempotent() {
        let wallet = Arc::new(StubWallet::default());
        let chain = chain(wallet.clone());
        let request = chain.construct(&deposit()).await.expect("construct");
        let sig = EcdsaSignature {
            r: [1; 32],
            s: [2; 32],
            v: 1,
        };
        let artifact = chain.assemble(&request.context, &[sig]).expect("assemble");
        assert_eq!(artifact.signature.len(), 128);
        assert_eq!(artifact.withdrawal_tx_hash.as_deref(), Some(TX_ID));
        chain.broadcast(&artifact).await.expect("first");
        chain.broadcast(&artifact).await.expect("repeat");
        assert_eq!(wallet.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deposit_from_comment() {
        let chain = chain(Arc::new(StubWallet::default()));
        let data = chain
            .get_deposit_data(&DepositIdentifier::new("zano", TX_ID, 0))
            .await
            .expect("deposit");
        assert_eq!(data.amount, BigUint::from(7_000u32));
        assert_eq!(data.withdrawal_chain_id, "11155111");
        assert!(chain
            .get_deposit_data(&DepositIdentifier::new("zano", TX_ID, 1))
            .await
            .is_err());
    }

    #[test]
    fn test_address_shape() {
        let valid = format!("Z{}", "x".repeat(96));
        assert!(is_valid_zano_address(&valid));
        assert!(!is_valid_zano_address("0x2222"));
        assert!(!is_valid_zano_address(&format!("Z{}", "0".repeat(96))));
    }
}
