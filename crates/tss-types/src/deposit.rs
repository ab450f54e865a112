//! Deposit records and their withdrawal lifecycle.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::TypesError;

/// Uniquely names a deposit event on its source chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepositIdentifier {
    pub chain_id: String,
    pub tx_hash: String,
    /// Index of the deposit event within the transaction.
    pub tx_nonce: u64,
}

impl DepositIdentifier {
    pub fn new(chain_id: impl Into<String>, tx_hash: impl Into<String>, tx_nonce: u64) -> Self {
        Self {
            chain_id: chain_id.into(),
            tx_hash: tx_hash.into(),
            tx_nonce,
        }
    }

    /// Cheap structural validation before any chain lookup.
    pub fn is_well_formed(&self) -> bool {
        !self.chain_id.is_empty()
            && !self.tx_hash.is_empty()
            && self.tx_hash.len() <= 128
            && self
                .tx_hash
                .trim_start_matches("0x")
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
    }
}

impl fmt::Display for DepositIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain_id, self.tx_hash, self.tx_nonce)
    }
}

/// Where a deposit stands on its way to a signed withdrawal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    Pending,
    Processed,
    Invalid,
    Failed,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processed => "PROCESSED",
            Self::Invalid => "INVALID",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawalStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSED" => Ok(Self::Processed),
            "INVALID" => Ok(Self::Invalid),
            "FAILED" => Ok(Self::Failed),
            other => Err(TypesError::UnknownDiscriminant {
                kind: "withdrawal_status",
                value: other.to_string(),
            }),
        }
    }
}

/// A deposit as stored in the `deposits` table.
///
/// Amounts are arbitrary precision; `withdrawal_amount` is already
/// converted to the destination chain's decimals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Row id; `0` before insertion.
    pub id: i64,
    pub identifier: DepositIdentifier,
    pub depositor: Option<String>,
    pub deposit_amount: BigUint,
    pub withdrawal_amount: BigUint,
    pub deposit_token: String,
    pub withdrawal_token: String,
    pub receiver: String,
    pub deposit_block: u64,
    pub is_wrapped_token: bool,
    pub withdrawal_chain_id: String,
    pub withdrawal_status: WithdrawalStatus,
    /// Hex-encoded withdrawal signature once signed.
    pub signature: Option<String>,
    pub withdrawal_tx_hash: Option<String>,
}

impl Deposit {
    pub fn is_pending(&self) -> bool {
        self.withdrawal_status == WithdrawalStatus::Pending
    }

    /// The recorded withdrawal, once processed.
    pub fn withdrawal_record(&self) -> Option<WithdrawalRecord> {
        if self.withdrawal_status != WithdrawalStatus::Processed {
            return None;
        }
        Some(WithdrawalRecord {
            deposit: self.identifier.clone(),
            signature: self.signature.clone()?,
            withdrawal_tx_hash: self.withdrawal_tx_hash.clone(),
        })
    }
}

/// A signed withdrawal as one signer recorded it, shared with the parties
/// that did not sign.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub deposit: DepositIdentifier,
    pub signature: String,
    pub withdrawal_tx_hash: Option<String>,
}
