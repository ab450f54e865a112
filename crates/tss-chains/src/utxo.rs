//! Bitcoin-family UTXO chains.
//!
//! One adapter serves every UTXO network; the variant is selected by the
//! configured [`bitcoin::Network`]. The bridge holds its funds at a single
//! P2PKH address controlled by the threshold key.
//!
//! ## Signing
//!
//! The context carries the consensus-encoded unsigned transaction and the
//! prevout of every input. One legacy `SIGHASH_ALL` digest is signed per
//! input; finalization injects `<der-sig+hashtype> <pubkey>` into each
//! input's script and the withdrawal hash is the resulting txid.
//!
//! ## Migration
//!
//! A key migration consolidates every bridge UTXO into one output paying
//! the target address. Peers re-derive the fee they would have paid and
//! accept only if the proposer's effective fee rate is within
//! [`FEE_TOLERANCE_PERCENT`] of their own estimate.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::script::{Instruction, PushBytesBuf};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    absolute, transaction, Address, Amount, Network, OutPoint, Script, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tss_types::{Deposit, DepositIdentifier, EcdsaSignature, Hash32};

use crate::evm::strip_0x;
use crate::rpc::JsonRpcClient;
use crate::{
    amount, AddressValid, ChainAdapter, ChainError, Constructor, DepositData, Finalizer,
    GetDepositData, RejectReason, Result, SignedArtifact, SigningContext, SigningRequest,
};

/// Accepted deviation of a proposer's fee rate from our own estimate.
pub const FEE_TOLERANCE_PERCENT: u64 = 10;

pub const DUST_LIMIT_SATS: u64 = 546;

const TX_OVERHEAD_VBYTES: u64 = 10;
const P2PKH_INPUT_VBYTES: u64 = 148;
const OUTPUT_VBYTES: u64 = 34;

/// bitcoind `RPC_VERIFY_ALREADY_IN_CHAIN`.
const RPC_ALREADY_IN_CHAIN: i64 = -27;

fn default_confirmations() -> u64 {
    6
}

fn default_fee_target_blocks() -> u16 {
    6
}

fn default_min_fee_rate() -> u64 {
    1
}

fn default_timeout_ms() -> u64 {
    15_000
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoConfig {
    pub name: String,
    pub id: String,
    pub network: Network,
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default)]
    pub rpc_user: Option<String>,
    #[serde(default)]
    pub rpc_password: Option<String>,
    pub bridge_address: String,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_fee_target_blocks")]
    pub fee_target_blocks: u16,
    /// Floor for the estimated fee rate, sat/vB.
    #[serde(default = "default_min_fee_rate")]
    pub min_fee_rate: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prevout {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoContext {
    /// Consensus-encoded unsigned transaction.
    pub unsigned_tx: Vec<u8>,
    /// Spent output of each input, in input order.
    pub prevouts: Vec<Prevout>,
    /// Fee rate the proposer built with, sat/vB.
    pub fee_rate: u64,
}

impl UtxoContext {
    pub fn transaction(&self) -> Result<Transaction> {
        deserialize(&self.unsigned_tx).map_err(|e| ChainError::Encoding(e.to_string()))
    }

    /// Sum of the spent values; `None` if it leaves the money range.
    fn input_total(&self) -> Option<u64> {
        checked_total(self.prevouts.iter().map(|p| p.value))
    }
}

/// A spendable bridge output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unspent {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: ScriptBuf,
}

/// A transaction as seen by the source node.
#[derive(Clone, Debug)]
pub struct SourceTx {
    pub tx: Transaction,
    pub confirmations: u64,
    pub block_height: u64,
}

/// Node access needed by the adapter.
#[async_trait]
pub trait UtxoSource: Send + Sync {
    async fn list_unspent(&self, address: &Address) -> Result<Vec<Unspent>>;
    async fn get_tx_out(&self, outpoint: &OutPoint) -> Result<Option<TxOut>>;
    /// Estimated fee rate in sat/vB.
    async fn estimate_fee_rate(&self, target_blocks: u16) -> Result<u64>;
    async fn get_transaction(&self, txid: &Txid) -> Result<Option<SourceTx>>;
    async fn send_raw_transaction(&self, tx: &[u8]) -> Result<()>;
}

/// Sum of satoshi values, each and all within [`Amount::MAX_MONEY`].
pub fn checked_total(values: impl IntoIterator<Item = u64>) -> Option<u64> {
    let max = Amount::MAX_MONEY.to_sat();
    values.into_iter().try_fold(0u64, |total, value| {
        if value > max {
            return None;
        }
        total.checked_add(value).filter(|total| *total <= max)
    })
}

/// Estimated virtual size of a P2PKH spend.
pub fn estimate_vsize(inputs: usize, outputs: usize) -> u64 {
    TX_OVERHEAD_VBYTES + P2PKH_INPUT_VBYTES * inputs as u64 + OUTPUT_VBYTES * outputs as u64
}

/// Whether `fee` for a transaction of `vsize` is within tolerance of `rate`.
/// `slack` widens the upper bound (dust folded into the fee).
pub fn fee_within_tolerance(fee: u64, vsize: u64, rate: u64, slack: u64) -> bool {
    let fee = u128::from(fee);
    let expected = u128::from(rate) * u128::from(vsize);
    let lower = expected * u128::from(100 - FEE_TOLERANCE_PERCENT);
    let upper = (expected * u128::from(100 + FEE_TOLERANCE_PERCENT)) + u128::from(slack) * 100;
    (lower..=upper).contains(&(fee * 100))
}

fn sighashes(tx: &Transaction, prevouts: &[Prevout]) -> Result<Vec<Hash32>> {
    let cache = SighashCache::new(tx);
    prevouts
        .iter()
        .enumerate()
        .map(|(index, prevout)| {
            cache
                .legacy_signature_hash(
                    index,
                    Script::from_bytes(&prevout.script_pubkey),
                    EcdsaSighashType::All.to_u32(),
                )
                .map(|h| h.to_byte_array())
                .map_err(|e| ChainError::Encoding(e.to_string()))
        })
        .collect()
}

fn unsigned_transaction(inputs: &[Unspent], outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

fn is_already_known(err: &ChainError) -> bool {
    match err {
        ChainError::Rpc { code, message, .. } => {
            *code == RPC_ALREADY_IN_CHAIN || message.contains("already")
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct UtxoChain {
    config: UtxoConfig,
    bridge: Address,
    source: Arc<dyn UtxoSource>,
}

impl UtxoChain {
    pub fn connect(config: UtxoConfig) -> Result<Self> {
        let mut rpc = JsonRpcClient::new(
            config.rpc_url.clone(),
            Duration::from_millis(config.timeout_ms),
        )?;
        if let (Some(user), Some(password)) = (&config.rpc_user, &config.rpc_password) {
            rpc = rpc.with_basic_auth(user.clone(), password.clone());
        }
        Self::with_source(config, Arc::new(BitcoindRpc { rpc }))
    }

    pub fn with_source(config: UtxoConfig, source: Arc<dyn UtxoSource>) -> Result<Self> {
        let bridge = parse_address(&config.bridge_address, config.network)?;
        Ok(Self {
            config,
            bridge,
            source,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn bridge_address(&self) -> &Address {
        &self.bridge
    }

    async fn fee_rate(&self) -> Result<u64> {
        let estimate = self
            .source
            .estimate_fee_rate(self.config.fee_target_blocks)
            .await?;
        Ok(estimate.max(self.config.min_fee_rate))
    }

    /// Bridge UTXOs, largest first, ties broken by outpoint.
    async fn spendable(&self) -> Result<Vec<Unspent>> {
        let mut unspent = self.source.list_unspent(&self.bridge).await?;
        unspent.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        });
        Ok(unspent)
    }

    fn request(inputs: &[Unspent], outputs: Vec<TxOut>, fee_rate: u64) -> Result<SigningRequest> {
        let tx = unsigned_transaction(inputs, outputs);
        let prevouts: Vec<Prevout> = inputs
            .iter()
            .map(|u| Prevout {
                value: u.value,
                script_pubkey: u.script_pubkey.to_bytes(),
            })
            .collect();
        let message_hashes = sighashes(&tx, &prevouts)?;
        Ok(SigningRequest {
            message_hashes,
            context: SigningContext::Utxo(UtxoContext {
                unsigned_tx: serialize(&tx),
                prevouts,
                fee_rate,
            }),
        })
    }

    fn context_of(request: &SigningRequest) -> Result<&UtxoContext> {
        match &request.context {
            SigningContext::Utxo(ctx) => Ok(ctx),
            _ => Err(RejectReason::WrongChain.into()),
        }
    }

    /// Checks shared by withdrawals and migrations: inputs are live bridge
    /// outputs, the fee is sane and the digests match the transaction.
    async fn verify_common(
        &self,
        tx: &Transaction,
        ctx: &UtxoContext,
        request: &SigningRequest,
        fee_slack: u64,
    ) -> Result<()> {
        if tx.input.len() != ctx.prevouts.len() || tx.input.is_empty() {
            return Err(RejectReason::MissingInput.into());
        }
        let bridge_script = self.bridge.script_pubkey();
        for (input, prevout) in tx.input.iter().zip(&ctx.prevouts) {
            if prevout.script_pubkey != bridge_script.as_bytes() {
                return Err(RejectReason::MissingInput.into());
            }
            match self.source.get_tx_out(&input.previous_output).await? {
                Some(out)
                    if out.value.to_sat() == prevout.value
                        && out.script_pubkey.as_bytes() == prevout.script_pubkey.as_slice() => {}
                _ => return Err(RejectReason::MissingInput.into()),
            }
        }

        let spent = ctx
            .input_total()
            .ok_or(ChainError::Verification(RejectReason::AmountOutOfRange))?;
        let paid = checked_total(tx.output.iter().map(|o| o.value.to_sat()))
            .ok_or(ChainError::Verification(RejectReason::AmountOutOfRange))?;
        let fee = spent
            .checked_sub(paid)
            .ok_or(ChainError::Verification(RejectReason::NegativeFee))?;

        let own_rate = self.fee_rate().await?;
        let vsize = estimate_vsize(tx.input.len(), tx.output.len());
        if !fee_within_tolerance(fee, vsize, own_rate, fee_slack) {
            tracing::warn!(
                chain = %self.config.name,
                fee,
                vsize,
                own_rate,
                proposed_rate = ctx.fee_rate,
                "fee rate outside tolerance"
            );
            return Err(RejectReason::FeeOutsideTolerance.into());
        }

        if sighashes(tx, &ctx.prevouts)? != request.message_hashes {
            return Err(RejectReason::HashMismatch.into());
        }
        Ok(())
    }
}

fn parse_address(s: &str, network: Network) -> Result<Address> {
    let unchecked: Address<NetworkUnchecked> = s
        .parse()
        .map_err(|_| ChainError::InvalidAddress(s.to_string()))?;
    unchecked
        .require_network(network)
        .map_err(|_| ChainError::InvalidAddress(s.to_string()))
}

fn op_return_payload(script: &Script) -> Option<Vec<u8>> {
    if !script.is_op_return() {
        return None;
    }
    match script.instructions().nth(1) {
        Some(Ok(Instruction::PushBytes(bytes))) => Some(bytes.as_bytes().to_vec()),
        _ => None,
    }
}

impl AddressValid for UtxoChain {
    fn is_valid_address(&self, address: &str) -> bool {
        parse_address(address, self.config.network).is_ok()
    }
}

#[async_trait]
impl GetDepositData for UtxoChain {
    async fn get_deposit_data(&self, id: &DepositIdentifier) -> Result<DepositData> {
        let txid = Txid::from_str(strip_0x(&id.tx_hash))
            .map_err(|_| ChainError::InvalidDeposit(format!("bad txid {}", id.tx_hash)))?;
        let source = self
            .source
            .get_transaction(&txid)
            .await?
            .ok_or_else(|| ChainError::DepositNotFound(id.to_string()))?;
        if source.confirmations < self.config.confirmations {
            return Err(ChainError::InvalidDeposit(format!(
                "{} confirmations required",
                self.config.confirmations
            )));
        }

        let vout = usize::try_from(id.tx_nonce).unwrap_or(usize::MAX);
        let output = source
            .tx
            .output
            .get(vout)
            .ok_or_else(|| ChainError::DepositNotFound(id.to_string()))?;
        if output.script_pubkey != self.bridge.script_pubkey() {
            return Err(ChainError::InvalidDeposit(
                "output does not pay the bridge".to_string(),
            ));
        }

        let memo = source
            .tx
            .output
            .iter()
            .find_map(|o| op_return_payload(&o.script_pubkey))
            .ok_or_else(|| ChainError::InvalidDeposit("missing memo".to_string()))?;
        let memo = String::from_utf8(memo)
            .map_err(|_| ChainError::InvalidDeposit("memo is not utf-8".to_string()))?;
        let (withdrawal_chain_id, receiver) = memo
            .split_once(':')
            .ok_or_else(|| ChainError::InvalidDeposit(format!("malformed memo {memo}")))?;

        Ok(DepositData {
            identifier: id.clone(),
            depositor: None,
            amount: BigUint::from(output.value.to_sat()),
            token: crate::evm::NATIVE_TOKEN.to_string(),
            receiver: receiver.to_string(),
            withdrawal_chain_id: withdrawal_chain_id.to_string(),
            block: source.block_height,
        })
    }
}

#[async_trait]
impl Constructor for UtxoChain {
    async fn construct(&self, deposit: &Deposit) -> Result<SigningRequest> {
        let receiver = parse_address(&deposit.receiver, self.config.network)?;
        let amount = amount::to_u64(&deposit.withdrawal_amount)?;
        if amount < DUST_LIMIT_SATS {
            return Err(ChainError::InvalidDeposit(format!("{amount} sats is dust")));
        }
        let rate = self.fee_rate().await?;

        let overflow = || ChainError::AmountOverflow(format!("withdrawal of {amount} sats"));
        let fee_for = |inputs: usize, outputs: usize| {
            rate.checked_mul(estimate_vsize(inputs, outputs))
                .and_then(|fee| fee.checked_add(amount))
                .ok_or_else(overflow)
        };

        let mut selected = Vec::new();
        let mut total = 0u64;
        for unspent in self.spendable().await? {
            total = total.checked_add(unspent.value).ok_or_else(overflow)?;
            selected.push(unspent);
            if total >= fee_for(selected.len(), 2)? {
                break;
            }
        }

        let needed_with_change = fee_for(selected.len(), 2)?;
        let needed = fee_for(selected.len(), 1)?;
        if total < needed {
            return Err(ChainError::InsufficientFunds {
                needed,
                available: total,
            });
        }

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: receiver.script_pubkey(),
        }];
        let change = total.saturating_sub(needed_with_change);
        if change >= DUST_LIMIT_SATS {
            outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: self.bridge.script_pubkey(),
            });
        }
        Self::request(&selected, outputs, rate)
    }

    async fn verify(&self, deposit: &Deposit, request: &SigningRequest) -> Result<()> {
        let ctx = Self::context_of(request)?;
        let tx = ctx.transaction()?;
        let receiver = parse_address(&deposit.receiver, self.config.network)
            .map_err(|_| ChainError::Verification(RejectReason::WrongDestination))?;
        let amount = amount::to_u64(&deposit.withdrawal_amount)?;

        let Some((payout, change)) = tx.output.split_first() else {
            return Err(RejectReason::WrongDestination.into());
        };
        if payout.script_pubkey != receiver.script_pubkey() || payout.value.to_sat() != amount {
            return Err(RejectReason::WrongDestination.into());
        }
        let bridge_script = self.bridge.script_pubkey();
        if change.len() > 1 || change.iter().any(|o| o.script_pubkey != bridge_script) {
            return Err(RejectReason::WrongDestination.into());
        }
        let slack = if change.is_empty() { DUST_LIMIT_SATS } else { 0 };
        self.verify_common(&tx, ctx, request, slack).await
    }

    async fn construct_migration(&self, target: &str) -> Result<SigningRequest> {
        let target = parse_address(target, self.config.network)?;
        let inputs = self.spendable().await?;
        let total = checked_total(inputs.iter().map(|u| u.value))
            .ok_or_else(|| ChainError::AmountOverflow("bridge balance".to_string()))?;
        let rate = self.fee_rate().await?;
        let fee = rate.saturating_mul(estimate_vsize(inputs.len(), 1));
        let needed = fee.saturating_add(DUST_LIMIT_SATS);
        if inputs.is_empty() || total < needed {
            return Err(ChainError::InsufficientFunds {
                needed,
                available: total,
            });
        }
        let outputs = vec![TxOut {
            value: Amount::from_sat(total - fee),
            script_pubkey: target.script_pubkey(),
        }];
        tracing::info!(
            chain = %self.config.name,
            inputs = inputs.len(),
            total,
            fee,
            "built consolidation"
        );
        Self::request(&inputs, outputs, rate)
    }

    async fn verify_migration(&self, target: &str, request: &SigningRequest) -> Result<()> {
        let ctx = Self::context_of(request)?;
        let tx = ctx.transaction()?;
        let target = parse_address(target, self.config.network)
            .map_err(|_| ChainError::Verification(RejectReason::WrongDestination))?;
        let target_script = target.script_pubkey();
        if tx.output.is_empty() || tx.output.iter().any(|o| o.script_pubkey != target_script) {
            return Err(RejectReason::WrongDestination.into());
        }
        self.verify_common(&tx, ctx, request, 0).await
    }
}

#[async_trait]
impl Finalizer for UtxoChain {
    fn assemble(
        &self,
        context: &SigningContext,
        signatures: &[EcdsaSignature],
    ) -> Result<SignedArtifact> {
        let SigningContext::Utxo(ctx) = context else {
            return Err(ChainError::Finalize("not a UTXO context".to_string()));
        };
        let mut tx = ctx.transaction()?;
        if signatures.len() != tx.input.len() {
            return Err(ChainError::Finalize(format!(
                "{} inputs but {} signatures",
                tx.input.len(),
                signatures.len()
            )));
        }
        let digests = sighashes(&tx, &ctx.prevouts)?;

        for ((input, sig), (digest, prevout)) in tx
            .input
            .iter_mut()
            .zip(signatures)
            .zip(digests.iter().zip(&ctx.prevouts))
        {
            let public_key = tss_crypto::secp256k1::recover_public_key(digest, sig)
                .map_err(|e| ChainError::Finalize(e.to_string()))?;
            let public_key = bitcoin::PublicKey::from_slice(&public_key)
                .map_err(|e| ChainError::Finalize(e.to_string()))?;
            if ScriptBuf::new_p2pkh(&public_key.pubkey_hash()).as_bytes()
                != prevout.script_pubkey.as_slice()
            {
                return Err(ChainError::Finalize(
                    "signature does not match the spent output".to_string(),
                ));
            }

            let mut signature =
                bitcoin::secp256k1::ecdsa::Signature::from_compact(&sig.to_compact())
                    .map_err(|e| ChainError::Finalize(e.to_string()))?;
            signature.normalize_s();
            let push = PushBytesBuf::try_from(bitcoin::ecdsa::Signature::sighash_all(signature).to_vec())
                .map_err(|e| ChainError::Finalize(e.to_string()))?;
            input.script_sig = bitcoin::script::Builder::new()
                .push_slice(push)
                .push_key(&public_key)
                .into_script();
        }

        let signature = signatures
            .iter()
            .map(|s| hex::encode(s.to_bytes()))
            .collect::<Vec<_>>()
            .join("");
        Ok(SignedArtifact {
            signature,
            withdrawal_tx_hash: Some(tx.compute_txid().to_string()),
            raw: Some(serialize(&tx)),
        })
    }

    async fn broadcast(&self, artifact: &SignedArtifact) -> Result<()> {
        let raw = artifact
            .raw
            .as_deref()
            .ok_or_else(|| ChainError::Finalize("artifact has no transaction".to_string()))?;
        match self.source.send_raw_transaction(raw).await {
            Ok(()) => Ok(()),
            Err(e) if is_already_known(&e) => {
                tracing::debug!(
                    chain = %self.config.name,
                    txid = ?artifact.withdrawal_tx_hash,
                    "transaction already known"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl ChainAdapter for UtxoChain {
    fn chain_id(&self) -> &str {
        &self.config.id
    }
}

// ---------------------------------------------------------------------------
// bitcoind JSON-RPC
// ---------------------------------------------------------------------------

/// [`UtxoSource`] backed by a bitcoind-compatible node.
pub struct BitcoindRpc {
    rpc: JsonRpcClient,
}

fn btc_to_sats(value: &Value) -> Result<u64> {
    let btc = value
        .as_f64()
        .ok_or_else(|| ChainError::InvalidResponse("missing amount".to_string()))?;
    Amount::from_btc(btc)
        .map(|a| a.to_sat())
        .map_err(|e| ChainError::InvalidResponse(e.to_string()))
}

fn script_from_hex(value: &Value) -> Result<ScriptBuf> {
    let hex_str = value
        .as_str()
        .ok_or_else(|| ChainError::InvalidResponse("missing scriptPubKey".to_string()))?;
    ScriptBuf::from_hex(hex_str).map_err(|e| ChainError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl UtxoSource for BitcoindRpc {
    async fn list_unspent(&self, address: &Address) -> Result<Vec<Unspent>> {
        let entries: Vec<Value> = self
            .rpc
            .call("listunspent", json!([1, 9_999_999, [address.to_string()]]))
            .await?;
        entries
            .iter()
            .map(|entry| {
                let txid = entry["txid"]
                    .as_str()
                    .and_then(|s| Txid::from_str(s).ok())
                    .ok_or_else(|| ChainError::InvalidResponse("bad txid".to_string()))?;
                let vout = entry["vout"]
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| ChainError::InvalidResponse("bad vout".to_string()))?;
                Ok(Unspent {
                    outpoint: OutPoint { txid, vout },
                    value: btc_to_sats(&entry["amount"])?,
                    script_pubkey: script_from_hex(&entry["scriptPubKey"])?,
                })
            })
            .collect()
    }

    async fn get_tx_out(&self, outpoint: &OutPoint) -> Result<Option<TxOut>> {
        let out: Value = self
            .rpc
            .call_raw(
                "gettxout",
                json!([outpoint.txid.to_string(), outpoint.vout, true]),
            )
            .await?;
        if out.is_null() {
            return Ok(None);
        }
        Ok(Some(TxOut {
            value: Amount::from_sat(btc_to_sats(&out["value"])?),
            script_pubkey: script_from_hex(&out["scriptPubKey"]["hex"])?,
        }))
    }

    async fn estimate_fee_rate(&self, target_blocks: u16) -> Result<u64> {
        let estimate: Value = self
            .rpc
            .call_raw("estimatesmartfee", json!([target_blocks]))
            .await?;
        // BTC per kvB
        let per_kvb = btc_to_sats(&estimate["feerate"])?;
        Ok(per_kvb.div_ceil(1000))
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Option<SourceTx>> {
        let verbose = match self
            .rpc
            .call_raw("getrawtransaction", json!([txid.to_string(), true]))
            .await
        {
            Ok(v) => v,
            // RPC_INVALID_ADDRESS_OR_KEY: no such transaction
            Err(ChainError::Rpc { code: -5, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let raw = hex::decode(verbose["hex"].as_str().unwrap_or_default())
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?;
        let tx: Transaction =
            deserialize(&raw).map_err(|e| ChainError::InvalidResponse(e.to_string()))?;
        let confirmations = verbose["confirmations"].as_u64().unwrap_or(0);
        let block_height = match verbose["blockhash"].as_str() {
            Some(hash) => {
                let header: Value = self.rpc.call_raw("getblockheader", json!([hash])).await?;
                header["height"].as_u64().unwrap_or(0)
            }
            None => 0,
        };
        Ok(Some(SourceTx {
            tx,
            confirmations,
            block_height,
        }))
    }

    async fn send_raw_transaction(&self, tx: &[u8]) -> Result<()> {
        let _txid: Value = self
            .rpc
            .call_raw("sendrawtransaction", json!([hex::encode(tx)]))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FixedState {
    unspent: Vec<Unspent>,
    transactions: HashMap<Txid, SourceTx>,
    sent: Vec<Vec<u8>>,
}

/// A [`UtxoSource`] holding a fixed UTXO set and fee rate.
pub struct FixedUtxoSource {
    fee_rate: u64,
    state: Mutex<FixedState>,
}

impl FixedUtxoSource {
    pub fn new(fee_rate: u64, unspent: Vec<Unspent>) -> Self {
        Self {
            fee_rate,
            state: Mutex::new(FixedState {
                unspent,
                ..FixedState::default()
            }),
        }
    }

    pub fn add_transaction(&self, tx: SourceTx) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.transactions.insert(tx.tx.compute_txid(), tx);
    }

    /// Raw transactions accepted so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sent
            .clone()
    }
}

#[async_trait]
impl UtxoSource for FixedUtxoSource {
    async fn list_unspent(&self, address: &Address) -> Result<Vec<Unspent>> {
        let script = address.script_pubkey();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .unspent
            .iter()
            .filter(|u| u.script_pubkey == script)
            .cloned()
            .collect())
    }

    async fn get_tx_out(&self, outpoint: &OutPoint) -> Result<Option<TxOut>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .unspent
            .iter()
            .find(|u| u.outpoint == *outpoint)
            .map(|u| TxOut {
                value: Amount::from_sat(u.value),
                script_pubkey: u.script_pubkey.clone(),
            }))
    }

    async fn estimate_fee_rate(&self, _target_blocks: u16) -> Result<u64> {
        Ok(self.fee_rate)
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Option<SourceTx>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.transactions.get(txid).cloned())
    }

    async fn send_raw_transaction(&self, tx: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.sent.iter().any(|sent| sent.as_slice() == tx) {
            return Err(ChainError::Rpc {
                method: "sendrawtransaction".to_string(),
                code: RPC_ALREADY_IN_CHAIN,
                message: "transaction already in block chain".to_string(),
            });
        }
        state.sent.push(tx.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tss_crypto::CoreKey;
    use tss_types::WithdrawalStatus;

    fn bridge_key() -> CoreKey {
        CoreKey::from_bytes(&[7u8; 32]).expect("key")
    }

    fn p2pkh_of(key: &CoreKey) -> Address {
        let pk = bitcoin::PublicKey::from_slice(&key.public_key()).expect("pubkey");
        Address::p2pkh(pk.pubkey_hash(), Network::Regtest)
    }

    fn config(bridge: &Address) -> UtxoConfig {
        UtxoConfig {
            name: "bitcoin".to_string(),
            id: "bitcoin".to_string(),
            network: Network::Regtest,
            rpc_url: String::new(),
            rpc_user: None,
            rpc_password: None,
            bridge_address: bridge.to_string(),
            confirmations: 1,
            fee_target_blocks: 6,
            min_fee_rate: 1,
            timeout_ms: 1_000,
        }
    }

    fn utxos(bridge: &Address, values: &[u64]) -> Vec<Unspent> {
        values
            .iter()
            .enumerate()
            .map(|(i, value)| Unspent {
                outpoint: OutPoint {
                    txid: Txid::from_byte_array([i as u8 + 1; 32]),
                    vout: 0,
                },
                value: *value,
                script_pubkey: bridge.script_pubkey(),
            })
            .collect()
    }

    fn chain_with(fee_rate: u64, values: &[u64]) -> (UtxoChain, Arc<FixedUtxoSource>) {
        let bridge = p2pkh_of(&bridge_key());
        let source = Arc::new(FixedUtxoSource::new(fee_rate, utxos(&bridge, values)));
        let chain = UtxoChain::with_source(config(&bridge), source.clone()).expect("chain");
        (chain, source)
    }

    fn receiver() -> Address {
        p2pkh_of(&CoreKey::from_bytes(&[9u8; 32]).expect("key"))
    }

    fn deposit(amount: u64) -> Deposit {
        Deposit {
            id: 1,
            identifier: DepositIdentifier::new("11155111", "0xabc", 0),
            depositor: None,
            deposit_amount: BigUint::from(amount),
            withdrawal_amount: BigUint::from(amount),
            deposit_token: "0xaaaa".to_string(),
            withdrawal_token: "native".to_string(),
            receiver: receiver().to_string(),
            deposit_block: 1,
            is_wrapped_token: false,
            withdrawal_chain_id: "bitcoin".to_string(),
            withdrawal_status: WithdrawalStatus::Pending,
            signature: None,
            withdrawal_tx_hash: None,
        }
    }

    #[test]
    fn test_fee_tolerance_bounds() {
        let vsize = estimate_vsize(2, 1);
        assert!(fee_within_tolerance(10 * vsize, vsize, 10, 0));
        assert!(fee_within_tolerance(9 * vsize, vsize, 10, 0));
        assert!(fee_within_tolerance(11 * vsize, vsize, 10, 0));
        assert!(!fee_within_tolerance(8 * vsize, vsize, 10, 0));
        assert!(!fee_within_tolerance(12 * vsize, vsize, 10, 0));
    }

    #[tokio::test]
    async fn test_withdrawal_construct_verify() {
        let (chain, _) = chain_with(10, &[50_000, 200_000]);
        let request = chain.construct(&deposit(100_000)).await.expect("construct");
        // the larger UTXO alone covers amount + fee
        assert_eq!(request.message_hashes.len(), 1);
        chain.verify(&deposit(100_000), &request).await.expect("verify");
    }

    #[tokio::test]
    async fn test_withdrawal_wrong_amount_rejected() {
        let (chain, _) = chain_with(10, &[200_000]);
        let request = chain.construct(&deposit(100_000)).await.expect("construct");
        let err = chain.verify(&deposit(90_000), &request).await.expect_err("amount");
        assert!(matches!(err, ChainError::Verification(RejectReason::WrongDestination)));
    }

    #[tokio::test]
    async fn test_withdrawal_insufficient_funds() {
        let (chain, _) = chain_with(10, &[1_000]);
        let err = chain.construct(&deposit(100_000)).await.expect_err("funds");
        assert!(matches!(err, ChainError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_migration_fee_below_tolerance_rejected() {
        let target = receiver().to_string();
        let (proposer, _) = chain_with(8, &[50_000, 60_000, 70_000]);
        let (verifier, _) = chain_with(10, &[50_000, 60_000, 70_000]);
        let request = proposer.construct_migration(&target).await.expect("construct");
        assert_eq!(request.message_hashes.len(), 3);
        let err = verifier
            .verify_migration(&target, &request)
            .await
            .expect_err("fee too low");
        assert!(matches!(err, ChainError::Verification(RejectReason::FeeOutsideTolerance)));
    }

    #[tokio::test]
    async fn test_migration_within_tolerance_accepted() {
        let target = receiver().to_string();
        let (proposer, _) = chain_with(10, &[50_000, 60_000]);
        let (verifier, _) = chain_with(11, &[50_000, 60_000]);
        let request = proposer.construct_migration(&target).await.expect("construct");
        verifier.verify_migration(&target, &request).await.expect("accept");
    }

    #[test]
    fn test_checked_total_bounds() {
        assert_eq!(checked_total([1, 2, 3]), Some(6));
        assert_eq!(checked_total([Amount::MAX_MONEY.to_sat()]), Some(Amount::MAX_MONEY.to_sat()));
        assert_eq!(checked_total([Amount::MAX_MONEY.to_sat(), 1]), None);
        assert_eq!(checked_total([u64::MAX]), None);
    }

    #[tokio::test]
    async fn test_migration_with_wrapping_outputs_rejected() {
        let target = receiver();
        let (proposer, _) = chain_with(10, &[50_000, 60_000]);
        let (verifier, _) = chain_with(10, &[50_000, 60_000]);
        let honest = proposer
            .construct_migration(&target.to_string())
            .await
            .expect("construct");
        let ctx = UtxoChain::context_of(&honest).expect("utxo context");

        // u64::MAX + (paid + 1) wraps around to the honest total.
        let mut tx = ctx.transaction().expect("tx");
        let paid = tx.output[0].value.to_sat();
        tx.output = vec![
            TxOut {
                value: Amount::from_sat(u64::MAX),
                script_pubkey: target.script_pubkey(),
            },
            TxOut {
                value: Amount::from_sat(paid + 1),
                script_pubkey: target.script_pubkey(),
            },
        ];
        let forged = SigningRequest {
            message_hashes: sighashes(&tx, &ctx.prevouts).expect("sighashes"),
            context: SigningContext::Utxo(UtxoContext {
                unsigned_tx: serialize(&tx),
                prevouts: ctx.prevouts.clone(),
                fee_rate: ctx.fee_rate,
            }),
        };

        let err = verifier
            .verify_migration(&target.to_string(), &forged)
            .await
            .expect_err("outputs exceed inputs");
        assert!(matches!(err, ChainError::Verification(RejectReason::AmountOutOfRange)));
    }

    #[tokio::test]
    async fn test_migration_missing_input_rejected() {
        let target = receiver().to_string();
        let (proposer, _) = chain_with(10, &[50_000, 60_000]);
        let (verifier, _) = chain_with(10, &[50_000]);
        let request = proposer.construct_migration(&target).await.expect("construct");
        let err = verifier.verify_migration(&target, &request).await.expect_err("missing");
        assert!(matches!(err, ChainError::Verification(RejectReason::MissingInput)));
    }

    #[tokio::test]
    async fn test_assemble_and_broadcast_idempotent() {
        let key = bridge_key();
        let (chain, source) = chain_with(10, &[200_000, 30_000]);
        let request = chain.construct(&deposit(210_000)).await.expect("construct");
        assert_eq!(request.message_hashes.len(), 2);
        let signatures: Vec<EcdsaSignature> = request
            .message_hashes
            .iter()
            .map(|h| key.sign_prehash(h).expect("sign"))
            .collect();

        let artifact = chain.assemble(&request.context, &signatures).expect("assemble");
        let again = chain.assemble(&request.context, &signatures).expect("assemble");
        assert_eq!(artifact, again);

        let tx: Transaction = deserialize(artifact.raw.as_deref().expect("raw")).expect("decode");
        assert!(tx.input.iter().all(|i| !i.script_sig.is_empty()));
        assert_eq!(
            artifact.withdrawal_tx_hash.as_deref(),
            Some(tx.compute_txid().to_string().as_str())
        );

        chain.broadcast(&artifact).await.expect("first broadcast");
        chain.broadcast(&artifact).await.expect("second broadcast");
        assert_eq!(source.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_assemble_rejects_foreign_key() {
        let (chain, _) = chain_with(10, &[200_000]);
        let request = chain.construct(&deposit(100_000)).await.expect("construct");
        let other = CoreKey::from_bytes(&[3u8; 32]).expect("key");
        let signatures: Vec<EcdsaSignature> = request
            .message_hashes
            .iter()
            .map(|h| other.sign_prehash(h).expect("sign"))
            .collect();
        assert!(matches!(
            chain.assemble(&request.context, &signatures),
            Err(ChainError::Finalize(_))
        ));
    }

    #[tokio::test]
    async fn test_deposit_from_memo() {
        let (chain, source) = chain_with(10, &[]);
        let memo = PushBytesBuf::try_from(b"11155111:0x2222222222222222222222222222222222222222".to_vec())
            .expect("push");
        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![],
            output: vec![
                TxOut {
                    value: Amount::from_sat(150_000),
                    script_pubkey: chain.bridge_address().script_pubkey(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: ScriptBuf::new_op_return(memo),
                },
            ],
        };
        let txid = tx.compute_txid();
        source.add_transaction(SourceTx {
            tx,
            confirmations: 3,
            block_height: 800,
        });

        let data = chain
            .get_deposit_data(&DepositIdentifier::new("bitcoin", txid.to_string(), 0))
            .await
            .expect("deposit");
        assert_eq!(data.amount, BigUint::from(150_000u64));
        assert_eq!(data.withdrawal_chain_id, "11155111");
        assert_eq!(data.receiver, "0x2222222222222222222222222222222222222222");
        assert_eq!(data.block, 800);

        let err = chain
            .get_deposit_data(&DepositIdentifier::new("bitcoin", txid.to_string(), 1))
            .await
            .expect_err("memo output");
        assert!(matches!(err, ChainError::InvalidDeposit(_)));
    }

    #[test]
    fn test_address_network_checked() {
        let (chain, _) = chain_with(1, &[]);
        assert!(chain.is_valid_address(&receiver().to_string()));
        let mainnet = Address::p2pkh(
            bitcoin::PublicKey::from_slice(&bridge_key().public_key())
                .expect("pk")
                .pubkey_hash(),
            Network::Bitcoin,
        );
        assert!(!chain.is_valid_address(&mainnet.to_string()));
    }
}
