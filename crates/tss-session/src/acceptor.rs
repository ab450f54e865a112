//! Deposit acceptor.
//!
//! A long-lived session under the fixed `DEPOSIT_ACCEPTOR` id. Distributors
//! announce deposit identifiers; every party independently fetches the
//! deposit from its source chain, maps it through the token registry and
//! stores it. A second announcement of a stored deposit is a no-op.
//!
//! Deposits that exist on-chain but cannot be withdrawn (no token pair,
//! inexact amount, bad receiver) are stored as `INVALID` so they are not
//! fetched again.
//!
//! The acceptor also hears from signers of withdrawals this party did not
//! sign. A pending deposit is marked processed once `threshold + 1`
//! committee members reported the same record for it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tss_chains::{ChainAdapter, ChainError, DepositData, TokenRegistry};
use tss_db::{Database, DbError};
use tss_transport::{Envelope, RequestType, Transport};
use tss_types::{
    cbor, CoreAddress, Deposit, DepositIdentifier, SessionId, WithdrawalRecord, WithdrawalStatus,
};

use crate::cancel::CancelToken;
use crate::manager::SessionManager;
use crate::{Result, SessionError};

/// Deposits with reports still short of a quorum.
const MAX_REPORTED_DEPOSITS: usize = 1024;

/// Payload of a `DepositDistribution` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositDistribution {
    pub identifier: DepositIdentifier,
}

/// What happened to one announced deposit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ingest {
    Stored,
    Duplicate,
    /// Stored with status `INVALID`.
    StoredInvalid(String),
    /// Not stored: the identifier or the on-chain event is unusable.
    Rejected(String),
    /// Not stored: try again later.
    Deferred(String),
}

pub struct DepositAcceptor {
    local: CoreAddress,
    parties: Vec<CoreAddress>,
    threshold: usize,
    distributors: HashSet<CoreAddress>,
    chains: HashMap<String, Arc<dyn ChainAdapter>>,
    tokens: Arc<TokenRegistry>,
    db: Database,
    /// Withdrawal records reported per deposit, by reporter.
    reports: Mutex<HashMap<DepositIdentifier, HashMap<CoreAddress, WithdrawalRecord>>>,
}

impl DepositAcceptor {
    pub fn new(
        local: CoreAddress,
        parties: Vec<CoreAddress>,
        threshold: usize,
        distributors: impl IntoIterator<Item = CoreAddress>,
        chains: impl IntoIterator<Item = Arc<dyn ChainAdapter>>,
        tokens: Arc<TokenRegistry>,
        db: Database,
    ) -> Self {
        Self {
            local,
            parties,
            threshold,
            reports: Mutex::new(HashMap::new()),
            distributors: distributors.into_iter().collect(),
            chains: chains
                .into_iter()
                .map(|chain| (chain.chain_id().to_string(), chain))
                .collect(),
            tokens,
            db,
        }
    }

    pub fn is_distributor(&self, party: &CoreAddress) -> bool {
        self.distributors.contains(party)
    }

    /// Fetch, convert and store one deposit.
    ///
    /// # Errors
    ///
    /// Only database failures other than a duplicate are errors.
    pub async fn ingest(&self, id: &DepositIdentifier) -> Result<Ingest> {
        if !id.is_well_formed() {
            return Ok(Ingest::Rejected("malformed identifier".to_string()));
        }
        let Some(source) = self.chains.get(&id.chain_id) else {
            return Ok(Ingest::Rejected(format!("unknown chain {}", id.chain_id)));
        };
        let data = match source.get_deposit_data(id).await {
            Ok(data) => data,
            Err(
                e @ (ChainError::DepositNotFound(_)
                | ChainError::InvalidDeposit(_)
                | ChainError::Unsupported(_)),
            ) => {
                return Ok(Ingest::Rejected(e.to_string()));
            }
            Err(e) => return Ok(Ingest::Deferred(e.to_string())),
        };
        if &data.identifier != id {
            return Ok(Ingest::Rejected("chain returned another deposit".to_string()));
        }

        let (deposit, invalid) = match self.tokens.build_deposit(data.clone()) {
            Ok(deposit) => match self.chains.get(&deposit.withdrawal_chain_id) {
                Some(target) if !target.is_valid_address(&deposit.receiver) => {
                    (invalid_record(data), Some("invalid receiver".to_string()))
                }
                Some(_) => (deposit, None),
                None => (
                    invalid_record(data),
                    Some(format!("unsupported target chain {}", deposit.withdrawal_chain_id)),
                ),
            },
            Err(e) => (invalid_record(data), Some(e.to_string())),
        };

        match self.db.insert_deposit(&deposit).await {
            Ok(_) => match invalid {
                None => {
                    tracing::info!(deposit = %id, target = %deposit.withdrawal_chain_id, "deposit stored");
                    Ok(Ingest::Stored)
                }
                Some(reason) => {
                    tracing::warn!(deposit = %id, reason = %reason, "deposit stored as invalid");
                    Ok(Ingest::StoredInvalid(reason))
                }
            },
            Err(DbError::Duplicate(_)) => {
                tracing::debug!(deposit = %id, "deposit already known");
                Ok(Ingest::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ingest locally and announce to every other party. Distributors only.
    pub async fn distribute(
        &self,
        transport: &dyn Transport,
        id: &DepositIdentifier,
    ) -> Result<Ingest> {
        if !self.is_distributor(&self.local) {
            return Err(SessionError::NotDistributor);
        }
        let outcome = self.ingest(id).await?;
        let payload = cbor::to_vec(&DepositDistribution {
            identifier: id.clone(),
        })?;
        let envelope = Envelope::new(
            SessionId::deposit_acceptor().to_string(),
            RequestType::DepositDistribution,
            self.local.clone(),
            payload,
        );
        for (peer, error) in transport.broadcast(&self.parties, &envelope).await {
            tracing::warn!(deposit = %id, peer = %peer, error = %error, "distribution not delivered");
        }
        Ok(outcome)
    }

    /// Serve announcements until cancelled.
    pub async fn run(
        self: Arc<Self>,
        manager: Arc<SessionManager>,
        capacity: usize,
        cancel: CancelToken,
    ) -> Result<()> {
        let registration = manager.register(&SessionId::deposit_acceptor(), capacity)?;
        tracing::info!(distributors = self.distributors.len(), "deposit acceptor running");
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = registration.inbound.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            self.handle(envelope).await;
        }
        tracing::info!("deposit acceptor stopped");
        Ok(())
    }

    async fn handle(&self, envelope: Envelope) {
        match envelope.request_type() {
            Some(RequestType::DepositDistribution) => self.handle_distribution(envelope).await,
            Some(RequestType::WithdrawalRecorded) => self.handle_record(envelope).await,
            _ => {
                tracing::debug!(peer = %envelope.sender, msg_type = envelope.msg_type, "ignored by deposit acceptor");
            }
        }
    }

    async fn handle_distribution(&self, envelope: Envelope) {
        if !self.is_distributor(&envelope.sender) {
            tracing::warn!(peer = %envelope.sender, "deposit announced by non-distributor");
            return;
        }
        let distribution = match cbor::from_slice::<DepositDistribution>(&envelope.payload) {
            Ok(distribution) => distribution,
            Err(e) => {
                tracing::warn!(peer = %envelope.sender, error = %e, "malformed deposit distribution");
                return;
            }
        };
        match self.ingest(&distribution.identifier).await {
            Ok(Ingest::Rejected(reason)) => {
                tracing::warn!(deposit = %distribution.identifier, reason = %reason, "deposit rejected");
            }
            Ok(Ingest::Deferred(reason)) => {
                tracing::warn!(deposit = %distribution.identifier, reason = %reason, "deposit lookup failed");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(deposit = %distribution.identifier, error = %e, "deposit not stored");
            }
        }
    }

    async fn handle_record(&self, envelope: Envelope) {
        let sender = envelope.sender;
        if sender == self.local || !self.parties.contains(&sender) {
            tracing::warn!(peer = %sender, "withdrawal record from non-member");
            return;
        }
        let record = match cbor::from_slice::<WithdrawalRecord>(&envelope.payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(peer = %sender, error = %e, "malformed withdrawal record");
                return;
            }
        };
        match self.db.get_deposit(&record.deposit).await {
            Ok(stored) if stored.is_pending() => {}
            Ok(_) => {
                self.forget(&record.deposit);
                return;
            }
            Err(e) => {
                tracing::debug!(deposit = %record.deposit, peer = %sender, error = %e, "withdrawal record for unknown deposit");
                return;
            }
        }
        let Some(agreed) = self.report(sender, record) else {
            return;
        };
        match self
            .db
            .mark_processed(
                &agreed.deposit,
                &agreed.signature,
                agreed.withdrawal_tx_hash.as_deref(),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(deposit = %agreed.deposit, "withdrawal signed by peers, marked processed");
                self.forget(&agreed.deposit);
            }
            Err(e) => {
                tracing::error!(deposit = %agreed.deposit, error = %e, "withdrawal record not stored");
            }
        }
    }

    /// Count `record` for `reporter`; the record once `threshold + 1`
    /// reporters agree on it.
    fn report(&self, reporter: CoreAddress, record: WithdrawalRecord) -> Option<WithdrawalRecord> {
        let mut reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        if !reports.contains_key(&record.deposit) && reports.len() >= MAX_REPORTED_DEPOSITS {
            tracing::warn!(deposit = %record.deposit, "too many unconfirmed withdrawal records, dropping");
            return None;
        }
        let by_reporter = reports.entry(record.deposit.clone()).or_default();
        by_reporter.insert(reporter, record.clone());
        let agreeing = by_reporter.values().filter(|r| **r == record).count();
        (agreeing > self.threshold).then_some(record)
    }

    fn forget(&self, deposit: &DepositIdentifier) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(deposit);
    }
}

/// An `INVALID` row for a deposit that exists but cannot be withdrawn.
fn invalid_record(data: DepositData) -> Deposit {
    Deposit {
        id: 0,
        identifier: data.identifier,
        depositor: data.depositor,
        deposit_amount: data.amount,
        withdrawal_amount: BigUint::from(0u8),
        deposit_token: data.token,
        withdrawal_token: String::new(),
        receiver: data.receiver,
        deposit_block: data.block,
        is_wrapped_token: false,
        withdrawal_chain_id: data.withdrawal_chain_id,
        withdrawal_status: WithdrawalStatus::Invalid,
        signature: None,
        withdrawal_tx_hash: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tss_chains::{
        AddressValid, Constructor, Finalizer, GetDepositData, SignedArtifact, SigningContext,
        SigningRequest, TokenPair,
    };
    use tss_transport::memory::MemoryNetwork;
    use tss_transport::{DropCounters, Inbound};
    use tss_types::EcdsaSignature;

    /// A source chain that knows a fixed set of deposits.
    struct Source {
        id: String,
        deposits: Mutex<HashMap<DepositIdentifier, DepositData>>,
        lookups: Mutex<usize>,
    }

    impl AddressValid for Source {
        fn is_valid_address(&self, address: &str) -> bool {
            address.starts_with("ok")
        }
    }

    #[async_trait]
    impl GetDepositData for Source {
        async fn get_deposit_data(&self, id: &DepositIdentifier) -> tss_chains::Result<DepositData> {
            *self.lookups.lock().unwrap_or_else(std::sync::PoisonError::into_inner) += 1;
            self.deposits
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(id)
                .cloned()
                .ok_or_else(|| ChainError::DepositNotFound(id.to_string()))
        }
    }

    #[async_trait]
    impl Constructor for Source {
        async fn construct(&self, _deposit: &Deposit) -> tss_chains::Result<SigningRequest> {
            Err(ChainError::Unsupported("test".into()))
        }

        async fn verify(&self, _deposit: &Deposit, _req: &SigningRequest) -> tss_chains::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Finalizer for Source {
        fn assemble(
            &self,
            _context: &SigningContext,
            _signatures: &[EcdsaSignature],
        ) -> tss_chains::Result<SignedArtifact> {
            Err(ChainError::Unsupported("test".into()))
        }

        async fn broadcast(&self, _artifact: &SignedArtifact) -> tss_chains::Result<()> {
            Ok(())
        }
    }

    impl ChainAdapter for Source {
        fn chain_id(&self) -> &str {
            &self.id
        }
    }

    fn data(nonce: u64, amount: u64, receiver: &str) -> DepositData {
        DepositData {
            identifier: DepositIdentifier::new("src", "0xabc", nonce),
            depositor: Some("0xdead".into()),
            amount: BigUint::from(amount),
            token: "0xtoken".into(),
            receiver: receiver.into(),
            withdrawal_chain_id: "dst".into(),
            block: 10,
        }
    }

    fn acceptor(local: &str) -> (Arc<DepositAcceptor>, Arc<Source>, Database) {
        let source = Arc::new(Source {
            id: "src".into(),
            deposits: Mutex::new(
                [data(0, 1_000, "ok-receiver"), data(1, 1_001, "ok-receiver"), data(2, 1_000, "bad")]
                    .into_iter()
                    .map(|d| (d.identifier.clone(), d))
                    .collect(),
            ),
            lookups: Mutex::new(0),
        });
        let target = Arc::new(Source {
            id: "dst".into(),
            deposits: Mutex::new(HashMap::new()),
            lookups: Mutex::new(0),
        });
        let tokens = Arc::new(TokenRegistry::new(vec![TokenPair {
            source_chain_id: "src".into(),
            source_token: "0xtoken".into(),
            source_decimals: 3,
            target_chain_id: "dst".into(),
            target_token: "native".into(),
            target_decimals: 1,
            is_wrapped: false,
        }]));
        let db = Database::open_memory().expect("db");
        let chains: Vec<Arc<dyn ChainAdapter>> = vec![source.clone(), target];
        let acceptor = Arc::new(DepositAcceptor::new(
            local.into(),
            vec!["bridge1a".into(), "bridge1b".into(), "bridge1c".into()],
            1,
            vec![CoreAddress::from("bridge1a")],
            chains,
            tokens,
            db.clone(),
        ));
        (acceptor, source, db)
    }

    #[tokio::test]
    async fn test_duplicate_is_idempotent() {
        let (acceptor, _, db) = acceptor("bridge1b");
        let id = DepositIdentifier::new("src", "0xabc", 0);
        assert_eq!(acceptor.ingest(&id).await.expect("first"), Ingest::Stored);
        assert_eq!(acceptor.ingest(&id).await.expect("second"), Ingest::Duplicate);
        let stored = db.get_deposit(&id).await.expect("stored");
        assert_eq!(stored.withdrawal_amount, BigUint::from(10u32));
        assert!(stored.is_pending());
    }

    #[tokio::test]
    async fn test_unwithdrawable_stored_invalid() {
        let (acceptor, _, db) = acceptor("bridge1b");
        let inexact = DepositIdentifier::new("src", "0xabc", 1);
        assert!(matches!(
            acceptor.ingest(&inexact).await.expect("ingest"),
            Ingest::StoredInvalid(_)
        ));
        let bad_receiver = DepositIdentifier::new("src", "0xabc", 2);
        assert_eq!(
            acceptor.ingest(&bad_receiver).await.expect("ingest"),
            Ingest::StoredInvalid("invalid receiver".to_string())
        );
        assert_eq!(
            db.count_by_status(WithdrawalStatus::Invalid).await.expect("count"),
            2
        );
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_rejected() {
        let (acceptor, source, _) = acceptor("bridge1b");
        let missing = DepositIdentifier::new("src", "0xfff", 0);
        assert!(matches!(
            acceptor.ingest(&missing).await.expect("ingest"),
            Ingest::Rejected(_)
        ));
        let malformed = DepositIdentifier::new("src", "0x!!", 0);
        assert!(matches!(
            acceptor.ingest(&malformed).await.expect("ingest"),
            Ingest::Rejected(_)
        ));
        assert_eq!(
            *source.lookups.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
            1
        );
    }

    #[tokio::test]
    async fn test_withdrawal_record_needs_quorum() {
        let (acceptor, _, db) = acceptor("bridge1c");
        let id = DepositIdentifier::new("src", "0xabc", 0);
        assert_eq!(acceptor.ingest(&id).await.expect("ingest"), Ingest::Stored);

        let record = WithdrawalRecord {
            deposit: id.clone(),
            signature: "0x5151".to_string(),
            withdrawal_tx_hash: Some("0x77".to_string()),
        };
        let forged = WithdrawalRecord {
            signature: "0x0bad".to_string(),
            ..record.clone()
        };
        let envelope = |sender: &str, record: &WithdrawalRecord| {
            Envelope::new(
                SessionId::deposit_acceptor().to_string(),
                RequestType::WithdrawalRecorded,
                sender.into(),
                cbor::to_vec(record).expect("encode"),
            )
        };

        acceptor.handle(envelope("bridge1z", &record)).await;
        acceptor.handle(envelope("bridge1a", &record)).await;
        acceptor.handle(envelope("bridge1a", &record)).await;
        acceptor.handle(envelope("bridge1b", &forged)).await;
        assert!(db.get_deposit(&id).await.expect("stored").is_pending());

        acceptor.handle(envelope("bridge1b", &record)).await;
        let stored = db.get_deposit(&id).await.expect("stored");
        assert_eq!(stored.withdrawal_status, WithdrawalStatus::Processed);
        assert_eq!(stored.signature.as_deref(), Some("0x5151"));
        assert_eq!(stored.withdrawal_tx_hash.as_deref(), Some("0x77"));
    }

    #[tokio::test]
    async fn test_only_distributors_announce() {
        let network = MemoryNetwork::new();
        let (a_acceptor, _, a_db) = acceptor("bridge1a");
        let (b_acceptor, _, b_db) = acceptor("bridge1b");

        let mut transports = Vec::new();
        let mut managers = Vec::new();
        for name in ["bridge1a", "bridge1b"] {
            let counters = Arc::new(DropCounters::new());
            let manager = Arc::new(SessionManager::new(counters.clone(), Duration::from_secs(1), 8));
            transports.push(network.join(name.into(), manager.clone() as Arc<dyn Inbound>, counters));
            managers.push(manager);
        }
        let cancel = crate::cancel::CancelSource::new();
        let task = tokio::spawn(b_acceptor.clone().run(managers[1].clone(), 16, cancel.token()));
        tokio::task::yield_now().await;

        let id = DepositIdentifier::new("src", "0xabc", 0);
        assert_eq!(
            a_acceptor.distribute(&transports[0], &id).await.expect("distribute"),
            Ingest::Stored
        );
        assert!(a_db.get_deposit(&id).await.is_ok());

        let stored = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if b_db.get_deposit(&id).await.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(stored.is_ok(), "peer stored the announced deposit");

        assert!(matches!(
            b_acceptor.distribute(&transports[1], &id).await,
            Err(SessionError::NotDistributor)
        ));

        cancel.cancel();
        task.await.expect("join").expect("acceptor");
    }
}
