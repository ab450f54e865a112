//! Integration test: withdrawal signing across a three-party committee.
//!
//! 1. A distributor announces a deposit; every member stores it.
//! 2. One signing session per member: consensus picks the proposer plus the
//!    lowest ready party, the third member is excluded.
//! 3. Both signers record the same withdrawal signature and share it; the
//!    excluded member adopts it and can then lead a slot for the next
//!    deposit.
//! 4. With the primary proposer offline the others fall back to the next
//!    candidate and still agree on one signature. Back online, the former
//!    primary proposes the signed deposit, adopts its peers' record from
//!    their rejections and moves on.
//! 5. A primary busy with a session of another kind is skipped.

use std::sync::Arc;
use std::time::Duration;

use num_bigint::BigUint;
use tokio::time::Instant;
use tss_chains::evm::EvmContext;
use tss_chains::ChainAdapter;
use tss_crypto::secp256k1::recover_public_key;
use tss_integration_tests::{
    deposit_data, eventually, evm_chain, pending_deposit, Cluster, SharedKeyFactory, StubSource,
    EVM_CHAIN_ID,
};
use tss_session::{Ingest, SessionHandle, SessionMode, SessionPlan, WithdrawalSigning};
use tss_transport::Transport;
use tss_types::{
    CoreAddress, DepositIdentifier, EcdsaSignature, FailureKind, PartyStatus, SessionId,
    SessionKind, SessionResult, WithdrawalStatus,
};

fn sign_id(epoch: u64) -> SessionId {
    SessionId::new(SessionKind::Sign("sepolia".to_string()), epoch)
}

/// The first epoch after `after` whose primary proposer is `leader`.
fn epoch_led_by(cluster: &Cluster, leader: &CoreAddress, after: u64) -> SessionId {
    (after + 1..)
        .map(sign_id)
        .find(|id| &cluster.primary_proposer(id) == leader)
        .expect("some epoch is led by every member")
}

fn completed(results: &[SessionResult]) -> Vec<Vec<EcdsaSignature>> {
    results
        .iter()
        .filter_map(|r| match r {
            SessionResult::Completed { signatures, .. } => Some(signatures.clone()),
            _ => None,
        })
        .collect()
}

async fn stored_status(cluster: &Cluster, member: &CoreAddress, id: &DepositIdentifier) -> WithdrawalStatus {
    cluster
        .member(member)
        .db
        .get_deposit(id)
        .await
        .expect("deposit")
        .withdrawal_status
}

async fn wait_all(handles: Vec<SessionHandle>) -> Vec<SessionResult> {
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.wait().await);
    }
    results
}

fn spawn_signing(cluster: &Cluster, id: &SessionId, skip: Option<&CoreAddress>) -> Vec<SessionHandle> {
    let evm = evm_chain();
    let start_at = Instant::now() + Duration::from_millis(100);
    cluster
        .members
        .iter()
        .filter(|m| Some(&m.address) != skip)
        .map(|member| {
            let workload = WithdrawalSigning::new(evm.clone() as Arc<dyn ChainAdapter>, member.db.clone());
            member
                .engine
                .spawn(SessionPlan {
                    id: id.clone(),
                    start_at,
                    mode: SessionMode::Signing(Arc::new(workload)),
                })
                .expect("spawn signing session")
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distributed_deposit_is_signed_once() {
    let cluster = Cluster::new(3, 1, SharedKeyFactory::new(3));
    let source = Arc::new(StubSource::new());
    let id = source.add(deposit_data("0xabc1", 1_000));
    let distributor = cluster.parties()[0].clone();
    let acceptors = cluster.spawn_acceptors(source.clone(), &distributor);

    let outcome = acceptors[0]
        .distribute(cluster.members[0].engine.transport().as_ref(), &id)
        .await
        .expect("distribute");
    assert_eq!(outcome, Ingest::Stored);
    for member in &cluster.members {
        let db = member.db.clone();
        let stored_id = id.clone();
        assert!(
            eventually(Duration::from_secs(3), || {
                let db = db.clone();
                let stored_id = stored_id.clone();
                async move { db.get_deposit(&stored_id).await.is_ok() }
            })
            .await,
            "every member stores the announced deposit"
        );
    }

    let results = wait_all(spawn_signing(&cluster, &sign_id(1), None)).await;
    let signatures = completed(&results);
    assert_eq!(signatures.len(), 2, "threshold 1 needs two signers: {results:?}");
    let excluded: Vec<CoreAddress> = cluster
        .members
        .iter()
        .zip(&results)
        .filter(|(_, r)| **r == SessionResult::Excluded)
        .map(|(m, _)| m.address.clone())
        .collect();
    assert_eq!(excluded.len(), 1);
    assert_eq!(signatures[0], signatures[1]);

    // The signature is over the EVM withdrawal hash, under the group key.
    let deposit = cluster.members[0].db.get_deposit(&id).await.expect("deposit");
    let hash = EvmContext::from_deposit(&deposit, EVM_CHAIN_ID.parse().expect("chain id"))
        .hash()
        .expect("hash");
    assert_eq!(
        recover_public_key(&hash, &signatures[0][0]).expect("recover"),
        cluster.protocols.public_key()
    );

    // The excluded member learns the outcome from both signers.
    let excluded = excluded[0].clone();
    assert!(
        eventually(Duration::from_secs(3), || {
            let db = cluster.member(&excluded).db.clone();
            let id = id.clone();
            async move {
                db.get_deposit(&id)
                    .await
                    .is_ok_and(|d| d.withdrawal_status == WithdrawalStatus::Processed)
            }
        })
        .await,
        "excluded member adopts the withdrawal record"
    );

    let expected = format!("0x{}", hex::encode(signatures[0][0].to_evm_bytes()));
    let operation_hash = format!("0x{}", hex::encode(hash));
    for member in &cluster.members {
        let stored = member.db.get_deposit(&id).await.expect("deposit");
        assert_eq!(stored.withdrawal_amount, BigUint::from(10u32));
        assert_eq!(stored.withdrawal_status, WithdrawalStatus::Processed);
        assert_eq!(stored.signature.as_deref(), Some(expected.as_str()));
        assert_eq!(
            stored.withdrawal_tx_hash.as_deref(),
            Some(operation_hash.as_str()),
            "member {}",
            member.address
        );
    }

    // The formerly excluded member leads a slot and the next deposit is signed.
    let next = pending_deposit(deposit_data("0xabc3", 3_000));
    cluster.seed(&next).await;
    let led = epoch_led_by(&cluster, &excluded, 1);
    let results = wait_all(spawn_signing(&cluster, &led, None)).await;
    assert_eq!(completed(&results).len(), 2, "{results:?}");
    assert_eq!(
        stored_status(&cluster, &excluded, &next.identifier).await,
        WithdrawalStatus::Processed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn offline_proposer_falls_back_to_next_candidate() {
    let cluster = Cluster::new(3, 1, SharedKeyFactory::new(2));
    let deposit = pending_deposit(deposit_data("0xabc2", 2_000));
    cluster.seed(&deposit).await;

    let id = sign_id(7);
    let primary = cluster.primary_proposer(&id);
    cluster.network.set_online(&primary, false);

    let results = wait_all(spawn_signing(&cluster, &id, Some(&primary))).await;
    let signatures = completed(&results);
    assert_eq!(signatures.len(), 2, "both online members sign: {results:?}");
    assert_eq!(signatures[0], signatures[1]);

    for member in &cluster.members {
        let expected = if member.address == primary {
            WithdrawalStatus::Pending
        } else {
            WithdrawalStatus::Processed
        };
        assert_eq!(
            stored_status(&cluster, &member.address, &deposit.identifier).await,
            expected,
            "member {}",
            member.address
        );
    }

    // Back online, the former primary proposes the signed deposit once; the
    // rejections carry the record it adopts.
    cluster.network.set_online(&primary, true);
    let led = epoch_led_by(&cluster, &primary, 7);
    for result in wait_all(spawn_signing(&cluster, &led, None)).await {
        assert!(
            matches!(
                result,
                SessionResult::Failed {
                    kind: FailureKind::ConsensusRejected,
                    ..
                }
            ),
            "got {result:?}"
        );
    }
    let peer = cluster
        .parties()
        .into_iter()
        .find(|p| p != &primary)
        .expect("another member");
    let adopted = cluster
        .member(&primary)
        .db
        .get_deposit(&deposit.identifier)
        .await
        .expect("deposit");
    let signed = cluster
        .member(&peer)
        .db
        .get_deposit(&deposit.identifier)
        .await
        .expect("deposit");
    assert_eq!(adopted.withdrawal_status, WithdrawalStatus::Processed);
    assert_eq!(adopted.signature, signed.signature);

    let led = epoch_led_by(&cluster, &primary, led.epoch);
    for result in wait_all(spawn_signing(&cluster, &led, None)).await {
        assert!(
            matches!(
                result,
                SessionResult::Failed {
                    kind: FailureKind::NothingToSign,
                    ..
                }
            ),
            "got {result:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_primary_is_skipped() {
    let cluster = Cluster::new(3, 1, SharedKeyFactory::new(2));
    let deposit = pending_deposit(deposit_data("0xabc4", 4_000));
    cluster.seed(&deposit).await;

    let id = sign_id(11);
    let primary = cluster.primary_proposer(&id);
    cluster
        .member(&primary)
        .engine
        .transport()
        .set_party_status(PartyStatus::Keygen);

    let results = wait_all(spawn_signing(&cluster, &id, Some(&primary))).await;
    assert_eq!(completed(&results).len(), 2, "the free members sign: {results:?}");
    assert_eq!(
        stored_status(&cluster, &primary, &deposit.identifier).await,
        WithdrawalStatus::Pending
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_queue_fails_with_nothing_to_sign() {
    let cluster = Cluster::new(2, 1, SharedKeyFactory::new(1));
    for result in wait_all(spawn_signing(&cluster, &sign_id(3), None)).await {
        assert!(
            matches!(
                result,
                SessionResult::Failed {
                    kind: FailureKind::NothingToSign,
                    ..
                }
            ),
            "got {result:?}"
        );
    }
}
