//! Token pairs bridging one chain's token to another's.
//!
//! A deposit of `source_token` on `source_chain_id` destined for
//! `target_chain_id` is paid out as `target_token`, converted exactly
//! between the two decimal scales.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tss_types::{Deposit, WithdrawalStatus};

use crate::{amount, ChainError, DepositData, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub source_chain_id: String,
    pub source_token: String,
    pub source_decimals: u32,
    pub target_chain_id: String,
    pub target_token: String,
    pub target_decimals: u32,
    /// The target token is a bridge-minted wrapper.
    #[serde(default)]
    pub is_wrapped: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TokenRegistry {
    pairs: Vec<TokenPair>,
}

impl TokenRegistry {
    pub fn new(pairs: Vec<TokenPair>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[TokenPair] {
        &self.pairs
    }

    pub fn resolve(
        &self,
        source_chain_id: &str,
        source_token: &str,
        target_chain_id: &str,
    ) -> Option<&TokenPair> {
        self.pairs.iter().find(|p| {
            p.source_chain_id == source_chain_id
                && p.source_token.eq_ignore_ascii_case(source_token)
                && p.target_chain_id == target_chain_id
        })
    }

    /// Turn raw deposit data into a `PENDING` deposit record.
    ///
    /// # Errors
    ///
    /// [`ChainError::InvalidDeposit`] when no pair matches, or any
    /// conversion error from [`amount::convert`].
    pub fn build_deposit(&self, data: DepositData) -> Result<Deposit> {
        let pair = self
            .resolve(&data.identifier.chain_id, &data.token, &data.withdrawal_chain_id)
            .ok_or_else(|| {
                ChainError::InvalidDeposit(format!(
                    "no token pair for {} on {} to {}",
                    data.token, data.identifier.chain_id, data.withdrawal_chain_id
                ))
            })?;
        let withdrawal_amount = self.withdrawal_amount(pair, &data.amount)?;
        if withdrawal_amount == BigUint::from(0u8) {
            return Err(ChainError::InvalidDeposit("zero amount".to_string()));
        }
        Ok(Deposit {
            id: 0,
            identifier: data.identifier,
            depositor: data.depositor,
            deposit_amount: data.amount,
            withdrawal_amount,
            deposit_token: data.token,
            withdrawal_token: pair.target_token.clone(),
            receiver: data.receiver,
            deposit_block: data.block,
            is_wrapped_token: pair.is_wrapped,
            withdrawal_chain_id: data.withdrawal_chain_id,
            withdrawal_status: WithdrawalStatus::Pending,
            signature: None,
            withdrawal_tx_hash: None,
        })
    }

    pub fn withdrawal_amount(&self, pair: &TokenPair, deposited: &BigUint) -> Result<BigUint> {
        amount::convert(deposited, pair.source_decimals, pair.target_decimals)
    }
}
