//! What a signing session signs.
//!
//! A [`Workload`] binds a session to a chain adapter: the proposer builds a
//! [`ProposalBody`], every other party re-derives and checks it, and after
//! signing every signer records the assembled artifact while only the
//! proposer publishes it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tss_chains::{ChainAdapter, ChainError, RejectReason, SignedArtifact, SigningRequest};
use tss_db::{Database, DbError};
use tss_types::{DepositIdentifier, EcdsaSignature, WithdrawalRecord};

use crate::Result;

/// The "what" of a consensus proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalBody {
    /// Withdrawal for a stored deposit.
    Withdrawal {
        deposit: DepositIdentifier,
        request: SigningRequest,
    },
    /// Move the bridge's funds to `target`.
    Migration {
        target: String,
        request: SigningRequest,
    },
}

impl ProposalBody {
    pub fn request(&self) -> &SigningRequest {
        match self {
            Self::Withdrawal { request, .. } | Self::Migration { request, .. } => request,
        }
    }
}

#[async_trait]
pub trait Workload: Send + Sync {
    /// Build the next proposal; `None` when there is nothing to sign.
    async fn propose(&self) -> Result<Option<ProposalBody>>;

    /// Independently check a proposal received from the proposer.
    async fn verify(&self, body: &ProposalBody) -> std::result::Result<(), RejectReason>;

    /// Assemble the artifact and record it locally.
    async fn record(
        &self,
        body: &ProposalBody,
        signatures: &[EcdsaSignature],
    ) -> Result<SignedArtifact>;

    /// Publish the artifact to the target chain. Proposer only.
    async fn publish(&self, artifact: &SignedArtifact) -> Result<()>;

    /// The local record of an already signed proposal, attached to an
    /// `AlreadyProcessed` rejection.
    async fn processed(&self, _body: &ProposalBody) -> Option<WithdrawalRecord> {
        None
    }

    /// Adopt a record enough peers agree on, so the proposal is not made again.
    async fn reconcile(&self, _record: &WithdrawalRecord) -> Result<()> {
        Ok(())
    }
}

fn reject_reason(err: ChainError) -> RejectReason {
    match err {
        ChainError::Verification(reason) => reason,
        other => RejectReason::Other(other.to_string()),
    }
}

/// Whether a construction error will repeat for the same deposit.
fn is_permanent(err: &ChainError) -> bool {
    matches!(
        err,
        ChainError::InvalidAddress(_)
            | ChainError::InvalidDeposit(_)
            | ChainError::InexactAmount { .. }
            | ChainError::AmountOverflow(_)
    )
}

// ---------------------------------------------------------------------------
// Withdrawals
// ---------------------------------------------------------------------------

/// Signs withdrawals for the oldest pending deposit bound to one chain.
pub struct WithdrawalSigning {
    chain: Arc<dyn ChainAdapter>,
    db: Database,
}

impl WithdrawalSigning {
    pub fn new(chain: Arc<dyn ChainAdapter>, db: Database) -> Self {
        Self { chain, db }
    }
}

#[async_trait]
impl Workload for WithdrawalSigning {
    async fn propose(&self) -> Result<Option<ProposalBody>> {
        let Some(deposit) = self.db.oldest_pending(self.chain.chain_id()).await? else {
            return Ok(None);
        };
        match self.chain.construct(&deposit).await {
            Ok(request) => Ok(Some(ProposalBody::Withdrawal {
                deposit: deposit.identifier,
                request,
            })),
            Err(e) if is_permanent(&e) => {
                tracing::warn!(deposit = %deposit.identifier, error = %e, "withdrawal cannot be built, marking failed");
                self.db
                    .set_status(&deposit.identifier, tss_types::WithdrawalStatus::Failed)
                    .await?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn verify(&self, body: &ProposalBody) -> std::result::Result<(), RejectReason> {
        let ProposalBody::Withdrawal { deposit, request } = body else {
            return Err(RejectReason::Other("expected a withdrawal".to_string()));
        };
        let stored = match self.db.get_deposit(deposit).await {
            Ok(stored) => stored,
            Err(DbError::NotFound(_)) => return Err(RejectReason::UnknownDeposit),
            Err(e) => return Err(RejectReason::Other(e.to_string())),
        };
        if !stored.is_pending() {
            return Err(RejectReason::AlreadyProcessed);
        }
        if stored.withdrawal_chain_id != self.chain.chain_id() {
            return Err(RejectReason::WrongChain);
        }
        self.chain
            .verify(&stored, request)
            .await
            .map_err(reject_reason)
    }

    async fn record(
        &self,
        body: &ProposalBody,
        signatures: &[EcdsaSignature],
    ) -> Result<SignedArtifact> {
        let ProposalBody::Withdrawal { deposit, request } = body else {
            return Err(crate::SessionError::Finalize(
                "withdrawal workload got a migration".to_string(),
            ));
        };
        let artifact = self.chain.assemble(&request.context, signatures)?;
        self.db
            .mark_processed(
                deposit,
                &artifact.signature,
                artifact.withdrawal_tx_hash.as_deref(),
            )
            .await?;
        tracing::info!(
            deposit = %deposit,
            tx_hash = artifact.withdrawal_tx_hash.as_deref().unwrap_or("-"),
            "withdrawal recorded"
        );
        Ok(artifact)
    }

    async fn publish(&self, artifact: &SignedArtifact) -> Result<()> {
        self.chain.broadcast(artifact).await?;
        Ok(())
    }

    async fn processed(&self, body: &ProposalBody) -> Option<WithdrawalRecord> {
        let ProposalBody::Withdrawal { deposit, .. } = body else {
            return None;
        };
        self.db.get_deposit(deposit).await.ok()?.withdrawal_record()
    }

    async fn reconcile(&self, record: &WithdrawalRecord) -> Result<()> {
        let stored = self.db.get_deposit(&record.deposit).await?;
        if !stored.is_pending() {
            return Ok(());
        }
        self.db
            .mark_processed(
                &record.deposit,
                &record.signature,
                record.withdrawal_tx_hash.as_deref(),
            )
            .await?;
        tracing::info!(deposit = %record.deposit, "withdrawal signed without us, marked processed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Signs a transaction moving the bridge's funds on one chain to `target`.
pub struct MigrationSigning {
    chain: Arc<dyn ChainAdapter>,
    target: String,
}

impl MigrationSigning {
    pub fn new(chain: Arc<dyn ChainAdapter>, target: impl Into<String>) -> Self {
        Self {
            chain,
            target: target.into(),
        }
    }
}

#[async_trait]
impl Workload for MigrationSigning {
    async fn propose(&self) -> Result<Option<ProposalBody>> {
        let request = self.chain.construct_migration(&self.target).await?;
        Ok(Some(ProposalBody::Migration {
            target: self.target.clone(),
            request,
        }))
    }

    async fn verify(&self, body: &ProposalBody) -> std::result::Result<(), RejectReason> {
        let ProposalBody::Migration { target, request } = body else {
            return Err(RejectReason::Other("expected a migration".to_string()));
        };
        if target != &self.target {
            return Err(RejectReason::WrongDestination);
        }
        self.chain
            .verify_migration(target, request)
            .await
            .map_err(reject_reason)
    }

    async fn record(
        &self,
        body: &ProposalBody,
        signatures: &[EcdsaSignature],
    ) -> Result<SignedArtifact> {
        let artifact = self.chain.assemble(&body.request().context, signatures)?;
        tracing::info!(
            chain = self.chain.chain_id(),
            target = %self.target,
            tx_hash = artifact.withdrawal_tx_hash.as_deref().unwrap_or("-"),
            "migration assembled"
        );
        Ok(artifact)
    }

    async fn publish(&self, artifact: &SignedArtifact) -> Result<()> {
        self.chain.broadcast(artifact).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use tss_chains::solana::{SolanaChain, SolanaConfig};
    use tss_types::{Deposit, WithdrawalStatus};

    fn b58(bytes: &[u8; 32]) -> String {
        tss_chains::solana::encode_pubkey(bytes)
    }

    fn chain() -> Arc<dyn ChainAdapter> {
        Arc::new(SolanaChain::new(SolanaConfig {
            name: "solana".to_string(),
            id: "solana".to_string(),
            bridge_id: b58(&[4u8; 32]),
            rpc_url: String::new(),
        }))
    }

    fn deposit(nonce: u64) -> Deposit {
        Deposit {
            id: 0,
            identifier: DepositIdentifier::new("11155111", "0xabc", nonce),
            depositor: None,
            deposit_amount: BigUint::from(1_000u32),
            withdrawal_amount: BigUint::from(1_000u32),
            deposit_token: "0xaaaa".to_string(),
            withdrawal_token: "native".to_string(),
            receiver: b58(&[8u8; 32]),
            deposit_block: 1,
            is_wrapped_token: false,
            withdrawal_chain_id: "solana".to_string(),
            withdrawal_status: WithdrawalStatus::Pending,
            signature: None,
            withdrawal_tx_hash: None,
        }
    }

    async fn setup() -> (WithdrawalSigning, Database) {
        let db = Database::open_memory().expect("db");
        db.insert_deposit(&deposit(0)).await.expect("insert");
        (WithdrawalSigning::new(chain(), db.clone()), db)
    }

    #[tokio::test]
    async fn test_propose_then_verify() {
        let (workload, _db) = setup().await;
        let body = workload.propose().await.expect("propose").expect("pending");
        workload.verify(&body).await.expect("valid");
    }

    #[tokio::test]
    async fn test_nothing_pending() {
        let db = Database::open_memory().expect("db");
        let workload = WithdrawalSigning::new(chain(), db);
        assert!(workload.propose().await.expect("propose").is_none());
    }

    #[tokio::test]
    async fn test_verify_unknown_and_processed() {
        let (workload, db) = setup().await;
        let body = workload.propose().await.expect("propose").expect("pending");

        let unknown = ProposalBody::Withdrawal {
            deposit: DepositIdentifier::new("11155111", "0xdef", 0),
            request: body.request().clone(),
        };
        assert_eq!(workload.verify(&unknown).await, Err(RejectReason::UnknownDeposit));

        db.mark_processed(&DepositIdentifier::new("11155111", "0xabc", 0), "00", None)
            .await
            .expect("mark");
        assert_eq!(workload.verify(&body).await, Err(RejectReason::AlreadyProcessed));
    }

    #[tokio::test]
    async fn test_processed_record_and_reconcile() {
        let (workload, db) = setup().await;
        let body = workload.propose().await.expect("propose").expect("pending");
        assert!(workload.processed(&body).await.is_none());

        let id = DepositIdentifier::new("11155111", "0xabc", 0);
        let record = WithdrawalRecord {
            deposit: id.clone(),
            signature: "0xfeed".to_string(),
            withdrawal_tx_hash: Some("0xbeef".to_string()),
        };
        workload.reconcile(&record).await.expect("reconcile");
        let stored = db.get_deposit(&id).await.expect("stored");
        assert_eq!(stored.withdrawal_status, WithdrawalStatus::Processed);
        assert_eq!(stored.signature.as_deref(), Some("0xfeed"));
        assert_eq!(stored.withdrawal_tx_hash.as_deref(), Some("0xbeef"));
        assert_eq!(workload.processed(&body).await, Some(record.clone()));
        assert!(workload.propose().await.expect("propose").is_none());

        let other = WithdrawalRecord {
            signature: "0x0bad".to_string(),
            ..record
        };
        workload.reconcile(&other).await.expect("no-op");
        let stored = db.get_deposit(&id).await.expect("stored");
        assert_eq!(stored.signature.as_deref(), Some("0xfeed"));
    }

    #[tokio::test]
    async fn test_verify_detects_substituted_request() {
        let (workload, db) = setup().await;
        db.insert_deposit(&deposit(1)).await.expect("insert");
        let body = workload.propose().await.expect("propose").expect("pending");
        let swapped = ProposalBody::Withdrawal {
            deposit: DepositIdentifier::new("11155111", "0xabc", 1),
            request: body.request().clone(),
        };
        assert_eq!(workload.verify(&swapped).await, Err(RejectReason::ContextMismatch));
    }
}
