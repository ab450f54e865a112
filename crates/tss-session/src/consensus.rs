//! Consensus on what is signed and who signs it.
//!
//! ## Flow
//!
//! ```text
//! Proposer                                  Other parties
//!    │── Proposal{signer_set, body} (signed) ──▶│ verify body
//!    │◀────────────── Accept / Reject{reason} ──│
//!    │── Commit{signer_set, digest} (signed) ──▶│ member → RUNNING, else EXCLUDED
//!    │── Abort{reason} ────────────────────────▶│ FAILED
//! ```
//!
//! The proposer commits as soon as every member of its proposed signer set
//! has accepted. Otherwise it waits until every party answered or the
//! deadline passed, and commits to itself plus the `threshold` lowest-sorted
//! acceptors if there are enough of them.
//!
//! A party that already recorded the proposed withdrawal rejects it with
//! `AlreadyProcessed` and attaches its record. A proposer holding
//! `threshold + 1` identical records adopts them instead of proposing the
//! same deposit again.
//!
//! `Proposal` and `Commit` payloads are signed with the sender's core key
//! over [`signing_digest`]; receivers recover the signer and compare it to
//! the envelope's sender.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, sleep_until, Instant};
use tss_chains::RejectReason;
use tss_crypto::hashing::{contexts, derive_key};
use tss_crypto::secp256k1::verify_address;
use tss_transport::{Envelope, RequestType};
use tss_types::{cbor, CoreAddress, Hash32, PartyStatus, WithdrawalRecord};

use crate::cancel::CancelToken;
use crate::election;
use crate::queue::QueueReceiver;
use crate::session::EngineInner;
use crate::workload::{ProposalBody, Workload};
use crate::{Result, SessionError};

/// How often readiness is re-checked while waiting for the primary proposer.
const ELECTION_POLL: std::time::Duration = std::time::Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub session_id: String,
    pub proposer: CoreAddress,
    pub signer_set: Vec<CoreAddress>,
    pub body: ProposalBody,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub session_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub reason: RejectReason,
    /// The rejecting party's record when the reason is `AlreadyProcessed`.
    #[serde(default)]
    pub processed: Option<WithdrawalRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub signer_set: Vec<CoreAddress>,
    /// [`signing_digest`] of the proposal payload being committed.
    pub proposal_digest: Hash32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    NothingToSign,
    /// The proposer could not build a proposal.
    ProposalFailed(String),
    NotEnoughParties,
    Rejected(Vec<String>),
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abort {
    pub reason: AbortReason,
}

impl AbortReason {
    fn into_error(self) -> SessionError {
        match self {
            Self::NothingToSign => SessionError::NothingToSign,
            Self::ProposalFailed(detail) => SessionError::ConsensusRejected(detail),
            Self::Rejected(reasons) => SessionError::ConsensusRejected(reasons.join("; ")),
            Self::NotEnoughParties => {
                SessionError::ConsensusTimeout("not enough ready parties".to_string())
            }
            Self::Timeout => SessionError::ConsensusTimeout("proposer saw no quorum".to_string()),
        }
    }
}

/// Digest signed by the core key over a `Proposal` or `Commit` payload.
pub fn signing_digest(payload: &[u8]) -> Hash32 {
    derive_key(contexts::PROPOSAL_SIGNATURE, payload)
}

/// Agreed outcome of a successful consensus phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Committed {
    pub proposer: CoreAddress,
    /// Sorted, exactly `threshold + 1` parties.
    pub signer_set: Vec<CoreAddress>,
    pub body: ProposalBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Committed(Committed),
    /// The local party is not in the committed signer set.
    Excluded,
}

// ---------------------------------------------------------------------------
// Round
// ---------------------------------------------------------------------------

/// One consensus run inside a session task.
pub(crate) struct ConsensusRound<'a> {
    pub engine: &'a EngineInner,
    pub session_id: &'a str,
    pub inbound: &'a QueueReceiver,
    pub cancel: &'a CancelToken,
    /// Status this session advertises once it runs.
    pub activity: PartyStatus,
    /// Threshold-protocol envelopes that raced ahead of the commit.
    pub stash: Vec<Envelope>,
}

impl ConsensusRound<'_> {
    pub async fn run(&mut self, workload: &dyn Workload) -> Result<Outcome> {
        let deadline = Instant::now() + self.engine.config.timing.consensus_deadline;
        let proposer = self.elect().await?;
        tracing::info!(session_id = self.session_id, proposer = %proposer, "proposer elected");
        if proposer == self.engine.local {
            self.lead(workload, deadline).await
        } else {
            self.follow(workload, &proposer, deadline).await
        }
    }

    /// Parties free to take part: ready, and not running a session of
    /// another kind. The local party is judged by its own status.
    async fn available(&self) -> HashSet<CoreAddress> {
        let mut available: HashSet<CoreAddress> = self
            .engine
            .transport
            .available_peers(self.activity)
            .await
            .into_iter()
            .collect();
        let status = self.engine.transport.party_status();
        if status == PartyStatus::Idle || status == self.activity {
            available.insert(self.engine.local.clone());
        }
        available
    }

    /// Wait up to the election timeout for the primary candidate, then take
    /// the first available fallback.
    async fn elect(&self) -> Result<CoreAddress> {
        let parties = &self.engine.config.parties;
        let primary = election::candidate(self.session_id, parties, 0)
            .cloned()
            .ok_or_else(|| SessionError::Config("empty party set".to_string()))?;
        let election_deadline = Instant::now() + self.engine.config.timing.election_timeout;
        loop {
            let available = self.available().await;
            if available.contains(&primary) {
                return Ok(primary);
            }
            if Instant::now() >= election_deadline {
                let (proposer, k) =
                    election::elect(self.session_id, parties, |p| available.contains(p))
                        .ok_or_else(|| {
                            SessionError::ConsensusTimeout("no ready proposer".to_string())
                        })?;
                tracing::warn!(
                    session_id = self.session_id,
                    primary = %primary,
                    fallback = k,
                    "primary proposer not ready, falling back"
                );
                return Ok(proposer);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = sleep(ELECTION_POLL) => {}
            }
        }
    }

    // -- proposer ---------------------------------------------------------

    async fn lead(&mut self, workload: &dyn Workload, deadline: Instant) -> Result<Outcome> {
        let local = self.engine.local.clone();
        let threshold = self.engine.config.threshold;

        let body = match workload.propose().await {
            Ok(Some(body)) => body,
            Ok(None) => return Err(self.abort(AbortReason::NothingToSign).await),
            Err(e) => {
                tracing::warn!(session_id = self.session_id, error = %e, "cannot build proposal");
                return Err(self.abort(AbortReason::ProposalFailed(e.to_string())).await);
            }
        };

        let available = self.available().await;
        let Some(proposed) =
            election::signer_set(&self.engine.config.parties, &local, threshold, |p| {
                available.contains(p)
            })
        else {
            return Err(self.abort(AbortReason::NotEnoughParties).await);
        };

        let proposal = Proposal {
            session_id: self.session_id.to_string(),
            proposer: local.clone(),
            signer_set: proposed.clone(),
            body,
        };
        let payload = cbor::to_vec(&proposal)?;
        let digest = signing_digest(&payload);
        self.broadcast(RequestType::Proposal, payload, true).await?;
        tracing::info!(
            session_id = self.session_id,
            signers = ?proposed,
            "proposal sent"
        );

        let total = self.engine.config.parties.len();
        let mut accepted: BTreeSet<CoreAddress> = BTreeSet::from([local.clone()]);
        let mut rejected: BTreeMap<CoreAddress, Reject> = BTreeMap::new();
        loop {
            if proposed.iter().all(|p| accepted.contains(p))
                || accepted.len() + rejected.len() == total
            {
                break;
            }
            if total - rejected.len() < threshold + 1 {
                break;
            }
            let envelope = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = sleep_until(deadline) => break,
                envelope = self.inbound.recv() => envelope.ok_or(SessionError::QueueClosed)?,
            };
            let sender = envelope.sender.clone();
            if !self.engine.config.parties.contains(&sender) || sender == local {
                continue;
            }
            match envelope.request_type() {
                Some(RequestType::Accept) => {
                    match cbor::from_slice::<Accept>(&envelope.payload) {
                        Ok(accept) if accept.session_id == self.session_id => {
                            tracing::debug!(session_id = self.session_id, peer = %sender, "accepted");
                            rejected.remove(&sender);
                            accepted.insert(sender);
                        }
                        _ => {
                            tracing::warn!(session_id = self.session_id, peer = %sender, "malformed accept");
                        }
                    }
                }
                Some(RequestType::Reject) => match cbor::from_slice::<Reject>(&envelope.payload) {
                    Ok(reject) => {
                        tracing::info!(
                            session_id = self.session_id,
                            peer = %sender,
                            reason = %reject.reason,
                            "rejected"
                        );
                        if !accepted.contains(&sender) {
                            rejected.insert(sender, reject);
                        }
                    }
                    Err(_) => {
                        tracing::warn!(session_id = self.session_id, peer = %sender, "malformed reject");
                    }
                },
                Some(RequestType::TssRound) => self.stash.push(envelope),
                _ => {
                    tracing::debug!(session_id = self.session_id, peer = %sender, msg_type = envelope.msg_type, "ignored during consensus");
                }
            }
        }

        if accepted.len() < threshold + 1 {
            self.reconcile(workload, &proposal.body, &rejected).await;
            let reason = if rejected.is_empty() {
                AbortReason::Timeout
            } else {
                AbortReason::Rejected(
                    rejected
                        .iter()
                        .map(|(peer, reject)| format!("{peer}: {}", reject.reason))
                        .collect(),
                )
            };
            return Err(self.abort(reason).await);
        }

        let signer_set = if proposed.iter().all(|p| accepted.contains(p)) {
            proposed
        } else {
            let mut set: Vec<CoreAddress> = accepted
                .iter()
                .filter(|p| **p != local)
                .take(threshold)
                .cloned()
                .collect();
            set.push(local.clone());
            set.sort();
            set
        };

        let commit = Commit {
            signer_set: signer_set.clone(),
            proposal_digest: digest,
        };
        self.broadcast(RequestType::Commit, cbor::to_vec(&commit)?, true)
            .await?;
        tracing::info!(session_id = self.session_id, signers = ?signer_set, "committed");
        Ok(Outcome::Committed(Committed {
            proposer: local,
            signer_set,
            body: proposal.body,
        }))
    }

    /// Adopt the withdrawal record `threshold + 1` rejecting parties agree on.
    async fn reconcile(
        &self,
        workload: &dyn Workload,
        body: &ProposalBody,
        rejected: &BTreeMap<CoreAddress, Reject>,
    ) {
        let ProposalBody::Withdrawal { deposit, .. } = body else {
            return;
        };
        let mut votes: HashMap<&WithdrawalRecord, usize> = HashMap::new();
        for reject in rejected.values() {
            if let (RejectReason::AlreadyProcessed, Some(record)) = (&reject.reason, &reject.processed) {
                if &record.deposit == deposit {
                    *votes.entry(record).or_default() += 1;
                }
            }
        }
        let quorum = self.engine.config.threshold + 1;
        let Some(record) = votes
            .into_iter()
            .find(|(_, count)| *count >= quorum)
            .map(|(record, _)| record)
        else {
            return;
        };
        match workload.reconcile(record).await {
            Ok(()) => {
                tracing::info!(session_id = self.session_id, deposit = %deposit, "adopted peers' withdrawal record");
            }
            Err(e) => {
                tracing::warn!(session_id = self.session_id, deposit = %deposit, error = %e, "cannot adopt withdrawal record");
            }
        }
    }

    /// Tell everyone the session is off and return the matching error.
    async fn abort(&self, reason: AbortReason) -> SessionError {
        tracing::info!(session_id = self.session_id, reason = ?reason, "aborting");
        match cbor::to_vec(&Abort {
            reason: reason.clone(),
        }) {
            Ok(payload) => {
                if let Err(e) = self.broadcast(RequestType::Abort, payload, false).await {
                    tracing::warn!(session_id = self.session_id, error = %e, "abort not sent");
                }
            }
            Err(e) => return e.into(),
        }
        reason.into_error()
    }

    // -- other parties ----------------------------------------------------

    async fn follow(
        &mut self,
        workload: &dyn Workload,
        proposer: &CoreAddress,
        deadline: Instant,
    ) -> Result<Outcome> {
        let local = self.engine.local.clone();
        // (proposal, its digest, whether we accepted it)
        let mut seen: Option<(Proposal, Hash32, bool)> = None;
        loop {
            let envelope = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = sleep_until(deadline) => {
                    return Err(SessionError::ConsensusTimeout(if seen.is_some() {
                        "no commit before deadline".to_string()
                    } else {
                        "no proposal before deadline".to_string()
                    }));
                }
                envelope = self.inbound.recv() => envelope.ok_or(SessionError::QueueClosed)?,
            };

            match envelope.request_type() {
                Some(RequestType::TssRound) => {
                    self.stash.push(envelope);
                    continue;
                }
                Some(RequestType::Proposal | RequestType::Commit | RequestType::Abort) => {}
                _ => continue,
            }
            if &envelope.sender != proposer {
                tracing::warn!(
                    session_id = self.session_id,
                    peer = %envelope.sender,
                    expected = %proposer,
                    "consensus message from unexpected sender"
                );
                continue;
            }

            match envelope.request_type() {
                Some(RequestType::Proposal) => {
                    if seen.is_some() {
                        continue;
                    }
                    if !self.signed_by_sender(&envelope) {
                        tracing::warn!(session_id = self.session_id, peer = %proposer, "bad proposal signature");
                        continue;
                    }
                    let Ok(proposal) = cbor::from_slice::<Proposal>(&envelope.payload) else {
                        tracing::warn!(session_id = self.session_id, peer = %proposer, "malformed proposal");
                        continue;
                    };
                    let verdict = match self.check_signer_set(&proposal, proposer) {
                        Err(reason) => Err(reason),
                        Ok(()) => workload.verify(&proposal.body).await,
                    };
                    let accepted = verdict.is_ok();
                    match verdict {
                        Ok(()) => {
                            let accept = Accept {
                                session_id: self.session_id.to_string(),
                            };
                            self.send(proposer, RequestType::Accept, cbor::to_vec(&accept)?)
                                .await;
                            tracing::info!(session_id = self.session_id, "proposal accepted");
                        }
                        Err(reason) => {
                            tracing::warn!(session_id = self.session_id, reason = %reason, "proposal rejected");
                            let processed = if reason == RejectReason::AlreadyProcessed {
                                workload.processed(&proposal.body).await
                            } else {
                                None
                            };
                            let reject = Reject { reason, processed };
                            self.send(proposer, RequestType::Reject, cbor::to_vec(&reject)?)
                                .await;
                        }
                    }
                    seen = Some((proposal, signing_digest(&envelope.payload), accepted));
                }
                Some(RequestType::Commit) => {
                    if !self.signed_by_sender(&envelope) {
                        tracing::warn!(session_id = self.session_id, peer = %proposer, "bad commit signature");
                        continue;
                    }
                    let Ok(commit) = cbor::from_slice::<Commit>(&envelope.payload) else {
                        tracing::warn!(session_id = self.session_id, peer = %proposer, "malformed commit");
                        continue;
                    };
                    if !commit.signer_set.contains(&local) {
                        tracing::info!(session_id = self.session_id, "not in signer set");
                        return Ok(Outcome::Excluded);
                    }
                    let Some((proposal, digest, accepted)) = seen.take() else {
                        return Err(SessionError::ConsensusRejected(
                            "commit for a proposal never received".to_string(),
                        ));
                    };
                    if commit.proposal_digest != digest {
                        return Err(SessionError::ConsensusRejected(
                            "commit does not match the proposal".to_string(),
                        ));
                    }
                    if !accepted {
                        return Err(SessionError::ConsensusRejected(
                            "committed to a rejected proposal".to_string(),
                        ));
                    }
                    if !self.valid_commit_set(&commit.signer_set, proposer) {
                        return Err(SessionError::ConsensusRejected(
                            "malformed signer set".to_string(),
                        ));
                    }
                    tracing::info!(session_id = self.session_id, signers = ?commit.signer_set, "commit received");
                    return Ok(Outcome::Committed(Committed {
                        proposer: proposer.clone(),
                        signer_set: commit.signer_set,
                        body: proposal.body,
                    }));
                }
                Some(RequestType::Abort) => {
                    let reason = cbor::from_slice::<Abort>(&envelope.payload)
                        .map(|a| a.reason)
                        .unwrap_or_else(|_| AbortReason::Rejected(vec!["malformed abort".to_string()]));
                    tracing::info!(session_id = self.session_id, reason = ?reason, "proposer aborted");
                    return Err(reason.into_error());
                }
                _ => {}
            }
        }
    }

    fn check_signer_set(
        &self,
        proposal: &Proposal,
        proposer: &CoreAddress,
    ) -> std::result::Result<(), RejectReason> {
        if proposal.session_id != self.session_id || &proposal.proposer != proposer {
            return Err(RejectReason::Other("proposal for another session".to_string()));
        }
        if !self.valid_commit_set(&proposal.signer_set, proposer) {
            return Err(RejectReason::Other("malformed signer set".to_string()));
        }
        Ok(())
    }

    /// Sorted, duplicate-free, `threshold + 1` known parties including the
    /// proposer.
    fn valid_commit_set(&self, set: &[CoreAddress], proposer: &CoreAddress) -> bool {
        set.len() == self.engine.config.threshold + 1
            && set.windows(2).all(|w| w[0] < w[1])
            && set.contains(proposer)
            && set.iter().all(|p| self.engine.config.parties.contains(p))
    }

    fn signed_by_sender(&self, envelope: &Envelope) -> bool {
        let Some(signature) = &envelope.signature else {
            return false;
        };
        verify_address(
            &self.engine.config.address_prefix,
            &signing_digest(&envelope.payload),
            signature,
            &envelope.sender,
        )
        .is_ok()
    }

    // -- sending ----------------------------------------------------------

    fn envelope(&self, request_type: RequestType, payload: Vec<u8>, signed: bool) -> Result<Envelope> {
        let envelope = if signed {
            let signature = self
                .engine
                .config
                .core_key
                .sign_prehash(&signing_digest(&payload))?;
            Envelope::new(self.session_id, request_type, self.engine.local.clone(), payload)
                .with_signature(signature)
        } else {
            Envelope::new(self.session_id, request_type, self.engine.local.clone(), payload)
        };
        Ok(envelope)
    }

    async fn broadcast(&self, request_type: RequestType, payload: Vec<u8>, signed: bool) -> Result<()> {
        let envelope = self.envelope(request_type, payload, signed)?;
        let failures = self
            .engine
            .transport
            .broadcast(&self.engine.config.parties, &envelope)
            .await;
        for (peer, error) in failures {
            tracing::debug!(session_id = self.session_id, peer = %peer, error = %error, "send failed");
        }
        Ok(())
    }

    async fn send(&self, to: &CoreAddress, request_type: RequestType, payload: Vec<u8>) {
        let envelope = match self.envelope(request_type, payload, false) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(session_id = self.session_id, error = %e, "cannot build envelope");
                return;
            }
        };
        if let Err(e) = self.engine.transport.send(to, envelope).await {
            tracing::warn!(session_id = self.session_id, peer = %to, error = %e, "send failed");
        }
    }
}
