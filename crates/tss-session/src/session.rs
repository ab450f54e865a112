//! Session lifecycle.
//!
//! ```text
//! PENDING ─▶ CONSENSUS ─▶ RUNNING ─▶ FINALIZING ─▶ TERMINAL
//!                │           │
//!                ▼           ▼
//!            EXCLUDED    FAILED / CANCELLED
//! ```
//!
//! Each session is one task that owns its state. It publishes the current
//! state on a watch channel, and its single [`SessionResult`] on a oneshot
//! channel before it enters the terminal state. Keygen and committee
//! resharing skip consensus: every party takes part.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tss_crypto::CoreKey;
use tss_transport::{Envelope, RequestType, Transport};
use tss_types::{
    cbor, CoreAddress, EcdsaSignature, PartyStatus, SessionId, SessionKind, SessionResult,
    SessionState, WithdrawalRecord,
};

use crate::cancel::{CancelSource, CancelToken};
use crate::consensus::{Committed, ConsensusRound, Outcome};
use crate::driver::{Driver, ProtocolFactory, ProtocolOutput, ProtocolTask, StartParams};
use crate::manager::{Registration, SessionManager};
use crate::workload::{ProposalBody, Workload};
use crate::{Result, SessionError, Timing};

/// Capacity of the session event bus.
const EVENT_CAPACITY: usize = 256;

/// Node-wide settings every session shares.
pub struct EngineConfig {
    pub core_key: CoreKey,
    /// Human-readable prefix of core addresses.
    pub address_prefix: String,
    /// Full committee; sorted on engine creation.
    pub parties: Vec<CoreAddress>,
    pub threshold: usize,
    pub timing: Timing,
}

pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub local: CoreAddress,
    pub transport: Arc<dyn Transport>,
    pub manager: Arc<SessionManager>,
    protocols: Arc<dyn ProtocolFactory>,
    events: broadcast::Sender<SessionEvent>,
    root: CancelSource,
    /// Statuses of the sessions currently running a protocol, oldest first.
    activity: Mutex<Vec<PartyStatus>>,
}

impl EngineInner {
    /// Advertise `status` while a session runs its protocol.
    pub(crate) fn push_activity(&self, status: PartyStatus) {
        let mut activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        activity.push(status);
        self.transport.set_party_status(status);
    }

    /// Forget one session running `status` and advertise the most recent
    /// one still running, or idle.
    pub(crate) fn pop_activity(&self, status: PartyStatus) {
        let mut activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = activity.iter().rposition(|s| *s == status) {
            activity.remove(pos);
        }
        self.transport
            .set_party_status(activity.last().copied().unwrap_or(PartyStatus::Idle));
    }
}

/// A state change of some session, for observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub state: SessionState,
    /// Present once the session published its result.
    pub result: Option<SessionResult>,
}

/// How a session spends its `RUNNING` phase.
pub enum SessionMode {
    /// Consensus on the workload's proposal, then a signature per hash.
    Signing(Arc<dyn Workload>),
    Keygen {
        preparams: Option<Vec<u8>>,
    },
    /// Hand the key over from `old_parties` to `new_parties`.
    Reshare {
        old_parties: Vec<CoreAddress>,
        new_parties: Vec<CoreAddress>,
        new_threshold: usize,
    },
}

pub struct SessionPlan {
    pub id: SessionId,
    /// When every party enters the session.
    pub start_at: Instant,
    pub mode: SessionMode,
}

/// Caller's view of a spawned session.
pub struct SessionHandle {
    id: SessionId,
    state: watch::Receiver<SessionState>,
    result: oneshot::Receiver<SessionResult>,
    cancel: CancelSource,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Cancel this session only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session's result.
    pub async fn wait(self) -> SessionResult {
        self.result.await.unwrap_or(SessionResult::Cancelled)
    }
}

/// Spawns sessions sharing one transport, manager and protocol backend.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// # Errors
    ///
    /// [`SessionError::Config`] if the core key does not belong to the
    /// transport's local address, the local party is not in the committee,
    /// or the committee is smaller than `threshold + 1`.
    pub fn new(
        mut config: EngineConfig,
        transport: Arc<dyn Transport>,
        manager: Arc<SessionManager>,
        protocols: Arc<dyn ProtocolFactory>,
        root: CancelSource,
    ) -> Result<Self> {
        config.parties.sort();
        config.parties.dedup();
        let local = transport.local_address().clone();
        if config.core_key.address(&config.address_prefix)? != local {
            return Err(SessionError::Config(format!(
                "core key does not match local address {local}"
            )));
        }
        if !config.parties.contains(&local) {
            return Err(SessionError::Config(format!("{local} is not a committee member")));
        }
        if config.parties.len() < config.threshold + 1 {
            return Err(SessionError::Config(format!(
                "{} parties cannot meet threshold {}",
                config.parties.len(),
                config.threshold
            )));
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                local,
                transport,
                manager,
                protocols,
                events,
                root,
                activity: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn local(&self) -> &CoreAddress {
        &self.inner.local
    }

    pub fn parties(&self) -> &[CoreAddress] {
        &self.inner.config.parties
    }

    pub fn threshold(&self) -> usize {
        self.inner.config.threshold
    }

    pub fn timing(&self) -> &Timing {
        &self.inner.config.timing
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.inner.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.root.token()
    }

    /// Cancel every session of this engine.
    pub fn shutdown(&self) {
        tracing::info!("cancelling all sessions");
        self.inner.root.cancel();
    }

    /// Register and start a session.
    ///
    /// # Errors
    ///
    /// [`SessionError::KindBusy`] while another session of the same kind runs.
    pub fn spawn(&self, plan: SessionPlan) -> Result<SessionHandle> {
        let registration = self
            .inner
            .manager
            .register(&plan.id, self.inner.config.timing.queue_capacity)?;
        let cancel = self.inner.root.child();
        let (state_tx, state_rx) = watch::channel(SessionState::Pending);
        let (result_tx, result_rx) = oneshot::channel();

        let task = SessionTask {
            engine: self.inner.clone(),
            id: plan.id.clone(),
            registration,
            cancel: cancel.token(),
            state: state_tx,
            activity: Mutex::new(None),
        };
        tokio::spawn(task.run(plan.start_at, plan.mode, result_tx));

        Ok(SessionHandle {
            id: plan.id,
            state: state_rx,
            result: result_rx,
            cancel,
        })
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

/// Sent by the proposer to the other signers after publishing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeNotice {
    pub withdrawal_tx_hash: Option<String>,
    pub published: bool,
}

struct SessionTask {
    engine: Arc<EngineInner>,
    id: SessionId,
    registration: Registration,
    cancel: CancelToken,
    state: watch::Sender<SessionState>,
    /// The status this session advertised, once its protocol started.
    activity: Mutex<Option<PartyStatus>>,
}

impl SessionTask {
    async fn run(
        self,
        start_at: Instant,
        mode: SessionMode,
        result_tx: oneshot::Sender<SessionResult>,
    ) {
        let result = match self.drive(start_at, mode).await {
            Ok(result) => result,
            Err(SessionError::Cancelled) => SessionResult::Cancelled,
            Err(e) => SessionResult::failed(e.failure_kind(), e.to_string()),
        };
        self.registration.inbound.close();
        let activity = self
            .activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(status) = activity {
            self.engine.pop_activity(status);
        }

        let terminal = result.terminal_state();
        match &result {
            SessionResult::Failed { kind, detail } => {
                tracing::warn!(session_id = %self.id, kind = %kind, detail, "session failed");
            }
            _ => tracing::info!(session_id = %self.id, state = %terminal, "session ended"),
        }
        let _ = self.engine.events.send(SessionEvent {
            session_id: self.id.to_string(),
            state: terminal,
            result: Some(result.clone()),
        });
        let _ = result_tx.send(result);
        self.state.send_replace(terminal);
    }

    fn enter(&self, state: SessionState) {
        tracing::info!(session_id = %self.id, state = %state, "session state");
        self.state.send_replace(state);
        let _ = self.engine.events.send(SessionEvent {
            session_id: self.id.to_string(),
            state,
            result: None,
        });
    }

    async fn drive(&self, start_at: Instant, mode: SessionMode) -> Result<SessionResult> {
        self.enter(SessionState::Pending);
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = sleep_until(start_at) => {}
        }

        let parties = self.engine.config.parties.clone();
        let threshold = self.engine.config.threshold;
        match mode {
            SessionMode::Signing(workload) => self.sign(workload.as_ref()).await,
            SessionMode::Keygen { preparams } => {
                let output = self
                    .run_protocol(
                        PartyStatus::Keygen,
                        parties,
                        threshold,
                        ProtocolTask::Keygen { preparams },
                        Vec::new(),
                    )
                    .await?;
                share_result(output)
            }
            SessionMode::Reshare {
                old_parties,
                new_parties,
                new_threshold,
            } => {
                let mut participants: Vec<CoreAddress> =
                    old_parties.iter().chain(new_parties.iter()).cloned().collect();
                participants.sort();
                participants.dedup();
                let output = self
                    .run_protocol(
                        PartyStatus::Reshare,
                        participants,
                        threshold,
                        ProtocolTask::Reshare {
                            old_parties,
                            new_parties,
                            new_threshold,
                        },
                        Vec::new(),
                    )
                    .await?;
                share_result(output)
            }
        }
    }

    async fn sign(&self, workload: &dyn Workload) -> Result<SessionResult> {
        self.enter(SessionState::Consensus);
        let session_id = self.id.to_string();
        let status = match self.id.kind {
            SessionKind::Reshare(_) => PartyStatus::Reshare,
            _ => PartyStatus::Signing,
        };
        let mut round = ConsensusRound {
            engine: &self.engine,
            session_id: &session_id,
            inbound: &self.registration.inbound,
            cancel: &self.cancel,
            activity: status,
            stash: Vec::new(),
        };
        let committed = match round.run(workload).await? {
            Outcome::Excluded => return Ok(SessionResult::Excluded),
            Outcome::Committed(committed) => committed,
        };
        let stash = std::mem::take(&mut round.stash);

        let message_hashes = committed.body.request().message_hashes.clone();
        let expected = message_hashes.len();
        let output = self
            .run_protocol(
                status,
                committed.signer_set.clone(),
                self.engine.config.threshold,
                ProtocolTask::Sign { message_hashes },
                stash,
            )
            .await?;
        let ProtocolOutput::Signatures(signatures) = output else {
            return Err(SessionError::Protocol("expected signatures".to_string()));
        };
        if signatures.len() != expected {
            return Err(SessionError::Protocol(format!(
                "expected {expected} signatures, got {}",
                signatures.len()
            )));
        }

        self.enter(SessionState::Finalizing);
        let artifact = self.finalize(workload, &committed, &signatures).await?;
        Ok(SessionResult::Completed {
            signatures,
            artifact: Some(cbor::to_vec(&artifact)?),
        })
    }

    async fn run_protocol(
        &self,
        status: PartyStatus,
        parties: Vec<CoreAddress>,
        threshold: usize,
        task: ProtocolTask,
        stash: Vec<Envelope>,
    ) -> Result<ProtocolOutput> {
        self.enter(SessionState::Running);
        *self.activity.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
        self.engine.push_activity(status);
        let local_index = parties
            .iter()
            .position(|p| p == &self.engine.local)
            .ok_or_else(|| SessionError::Config("local party not a participant".to_string()))?;
        let protocol = self.engine.protocols.create(&self.id, &task)?;
        let params = StartParams {
            session_id: self.id.to_string(),
            parties: parties.clone(),
            local_index,
            threshold,
            task,
        };
        let driver = Driver {
            transport: &self.engine.transport,
            session_id: self.id.to_string(),
            parties,
            round_deadline: self.engine.config.timing.round_deadline,
            inbound: &self.registration.inbound,
            cancel: &self.cancel,
        };
        driver.run(protocol, params, stash).await
    }

    /// Every signer records the artifact and shares a withdrawal record with
    /// the parties that did not sign. Only the proposer publishes it and
    /// tells the other signers.
    async fn finalize(
        &self,
        workload: &dyn Workload,
        committed: &Committed,
        signatures: &[EcdsaSignature],
    ) -> Result<tss_chains::SignedArtifact> {
        let finalize_id = self.id.finalize();
        self.registration.route.id_changed(&finalize_id);
        let deadline = Instant::now() + self.engine.config.timing.finalize_deadline;

        let artifact = timeout_at(deadline, workload.record(&committed.body, signatures)).await??;
        self.share_record(committed, &artifact).await?;

        if committed.proposer == self.engine.local {
            let published = timeout_at(deadline, workload.publish(&artifact)).await;
            let ok = matches!(published, Ok(Ok(())));
            let notice = FinalizeNotice {
                withdrawal_tx_hash: artifact.withdrawal_tx_hash.clone(),
                published: ok,
            };
            let envelope = Envelope::new(
                finalize_id.to_string(),
                RequestType::Finalize,
                self.engine.local.clone(),
                cbor::to_vec(&notice)?,
            );
            for (peer, error) in self
                .engine
                .transport
                .broadcast(&committed.signer_set, &envelope)
                .await
            {
                tracing::debug!(session_id = %finalize_id, peer = %peer, error = %error, "finalize notice not sent");
            }
            match published {
                Ok(Ok(())) => {
                    tracing::info!(session_id = %finalize_id, tx_hash = artifact.withdrawal_tx_hash.as_deref().unwrap_or("-"), "artifact published");
                }
                Ok(Err(e)) => return Err(SessionError::Finalize(e.to_string())),
                Err(e) => return Err(e),
            }
        } else {
            self.await_notice(&finalize_id, &committed.proposer, deadline)
                .await;
        }
        Ok(artifact)
    }

    async fn share_record(
        &self,
        committed: &Committed,
        artifact: &tss_chains::SignedArtifact,
    ) -> Result<()> {
        let ProposalBody::Withdrawal { deposit, .. } = &committed.body else {
            return Ok(());
        };
        let others: Vec<CoreAddress> = self
            .engine
            .config
            .parties
            .iter()
            .filter(|p| !committed.signer_set.contains(p))
            .cloned()
            .collect();
        if others.is_empty() {
            return Ok(());
        }
        let record = WithdrawalRecord {
            deposit: deposit.clone(),
            signature: artifact.signature.clone(),
            withdrawal_tx_hash: artifact.withdrawal_tx_hash.clone(),
        };
        let envelope = Envelope::new(
            SessionId::deposit_acceptor().to_string(),
            RequestType::WithdrawalRecorded,
            self.engine.local.clone(),
            cbor::to_vec(&record)?,
        );
        for (peer, error) in self.engine.transport.broadcast(&others, &envelope).await {
            tracing::debug!(session_id = %self.id, peer = %peer, error = %error, "withdrawal record not sent");
        }
        Ok(())
    }

    /// Wait for the proposer's notice. The artifact is already recorded, so
    /// a missing notice is only logged.
    async fn await_notice(&self, finalize_id: &SessionId, proposer: &CoreAddress, deadline: Instant) {
        let finalize_id = finalize_id.to_string();
        loop {
            let envelope = tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep_until(deadline) => {
                    tracing::debug!(session_id = %finalize_id, "no finalize notice from proposer");
                    return;
                }
                envelope = self.registration.inbound.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => return,
                },
            };
            if envelope.session_id != finalize_id
                || envelope.request_type() != Some(RequestType::Finalize)
                || &envelope.sender != proposer
            {
                continue;
            }
            match cbor::from_slice::<FinalizeNotice>(&envelope.payload) {
                Ok(notice) => {
                    tracing::info!(
                        session_id = %finalize_id,
                        published = notice.published,
                        tx_hash = notice.withdrawal_tx_hash.as_deref().unwrap_or("-"),
                        "finalize notice"
                    );
                }
                Err(e) => {
                    tracing::warn!(session_id = %finalize_id, error = %e, "malformed finalize notice");
                }
            }
            return;
        }
    }
}

async fn timeout_at<F: std::future::Future>(deadline: Instant, future: F) -> Result<F::Output> {
    timeout(deadline.saturating_duration_since(Instant::now()), future)
        .await
        .map_err(|_| SessionError::Finalize("finalize deadline passed".to_string()))
}

fn share_result(output: ProtocolOutput) -> Result<SessionResult> {
    match output {
        ProtocolOutput::Share(share) => Ok(SessionResult::Completed {
            signatures: Vec::new(),
            artifact: Some(share),
        }),
        ProtocolOutput::Signatures(_) => Err(SessionError::Protocol("expected a key share".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{InMsg, OutMsg, ProtocolError, Routing, ThresholdProtocol};
    use std::time::Duration;
    use tss_transport::memory::MemoryNetwork;
    use tss_transport::DropCounters;

    const PREFIX: &str = "bridge";

    /// Finishes in a single round once every other party said hello.
    struct Hello {
        parties: usize,
        heard: usize,
        stall: bool,
    }

    impl ThresholdProtocol for Hello {
        fn start(&mut self, params: &StartParams) -> std::result::Result<Vec<OutMsg>, ProtocolError> {
            self.parties = params.parties.len();
            Ok(vec![OutMsg {
                routing: Routing::Broadcast,
                round: 1,
                index: 0,
                payload: Vec::new(),
            }])
        }

        fn update(&mut self, _msg: InMsg) -> std::result::Result<Vec<OutMsg>, ProtocolError> {
            self.heard += 1;
            Ok(Vec::new())
        }

        fn round(&self) -> u16 {
            1
        }

        fn done(&mut self) -> Option<ProtocolOutput> {
            (!self.stall && self.heard + 1 == self.parties)
                .then(|| ProtocolOutput::Share(vec![self.parties as u8]))
        }
    }

    struct HelloFactory {
        stall: bool,
    }

    impl ProtocolFactory for HelloFactory {
        fn create(
            &self,
            _session_id: &SessionId,
            _task: &ProtocolTask,
        ) -> std::result::Result<Box<dyn ThresholdProtocol>, ProtocolError> {
            Ok(Box::new(Hello {
                parties: 0,
                heard: 0,
                stall: self.stall,
            }))
        }
    }

    fn timing() -> Timing {
        Timing {
            grace_window: Duration::from_secs(1),
            election_timeout: Duration::from_millis(200),
            consensus_deadline: Duration::from_secs(2),
            round_deadline: Duration::from_secs(2),
            finalize_deadline: Duration::from_secs(2),
            queue_capacity: 64,
            park_capacity_per_sender: 16,
        }
    }

    fn engines(n: usize, stall: bool) -> Vec<Engine> {
        let network = MemoryNetwork::new();
        let keys: Vec<CoreKey> = (0..n).map(|_| CoreKey::generate()).collect();
        let parties: Vec<CoreAddress> = keys
            .iter()
            .map(|k| k.address(PREFIX).expect("address"))
            .collect();
        keys.into_iter()
            .zip(parties.iter())
            .map(|(key, local)| {
                let counters = Arc::new(DropCounters::new());
                let manager = Arc::new(SessionManager::new(counters.clone(), Duration::from_secs(1), 16));
                let transport = Arc::new(network.join(local.clone(), manager.clone(), counters));
                Engine::new(
                    EngineConfig {
                        core_key: key,
                        address_prefix: PREFIX.to_string(),
                        parties: parties.clone(),
                        threshold: 1,
                        timing: timing(),
                    },
                    transport,
                    manager,
                    Arc::new(HelloFactory { stall }),
                    CancelSource::new(),
                )
                .expect("engine")
            })
            .collect()
    }

    fn keygen_plan(epoch: u64) -> SessionPlan {
        SessionPlan {
            id: SessionId::new(SessionKind::Keygen, epoch),
            start_at: Instant::now(),
            mode: SessionMode::Keygen { preparams: None },
        }
    }

    #[tokio::test]
    async fn test_keygen_completes_everywhere() {
        let engines = engines(3, false);
        let handles: Vec<SessionHandle> = engines
            .iter()
            .map(|e| e.spawn(keygen_plan(1)).expect("spawn"))
            .collect();
        for handle in handles {
            let result = handle.wait().await;
            assert_eq!(
                result,
                SessionResult::Completed {
                    signatures: Vec::new(),
                    artifact: Some(vec![3]),
                }
            );
        }
        assert!(engines[0].manager().active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_kind_busy_while_running() {
        let engines = engines(2, true);
        let _first = engines[0].spawn(keygen_plan(1)).expect("spawn");
        assert!(matches!(
            engines[0].spawn(keygen_plan(2)),
            Err(SessionError::KindBusy(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_publishes_cancelled() {
        let engines = engines(2, true);
        let handle = engines[0].spawn(keygen_plan(1)).expect("spawn");
        let mut state = handle.watch_state();
        state
            .wait_for(|s| *s == SessionState::Running)
            .await
            .expect("running");
        engines[0].shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("prompt");
        assert_eq!(result, SessionResult::Cancelled);
    }

    #[tokio::test]
    async fn test_events_observe_lifecycle() {
        let engines = engines(2, false);
        let mut events = engines[0].subscribe();
        let handles: Vec<SessionHandle> = engines
            .iter()
            .map(|e| e.spawn(keygen_plan(5)).expect("spawn"))
            .collect();
        for handle in handles {
            handle.wait().await;
        }
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            states.push(event.state);
        }
        assert_eq!(
            states,
            vec![SessionState::Pending, SessionState::Running, SessionState::Terminal]
        );
    }

    #[tokio::test]
    async fn test_status_survives_other_session_ending() {
        let engines = engines(2, true);
        let keygen = engines[0].spawn(keygen_plan(1)).expect("spawn keygen");
        keygen
            .watch_state()
            .wait_for(|s| *s == SessionState::Running)
            .await
            .expect("keygen running");

        let parties = engines[0].parties().to_vec();
        let reshare = engines[0]
            .spawn(SessionPlan {
                id: SessionId::new(SessionKind::Reshare(None), 1),
                start_at: Instant::now(),
                mode: SessionMode::Reshare {
                    old_parties: parties.clone(),
                    new_parties: parties,
                    new_threshold: 1,
                },
            })
            .expect("spawn reshare");
        reshare
            .watch_state()
            .wait_for(|s| *s == SessionState::Running)
            .await
            .expect("reshare running");
        assert_eq!(engines[0].transport().party_status(), PartyStatus::Reshare);

        reshare.cancel();
        assert_eq!(reshare.wait().await, SessionResult::Cancelled);
        assert_eq!(engines[0].transport().party_status(), PartyStatus::Keygen);

        keygen.cancel();
        assert_eq!(keygen.wait().await, SessionResult::Cancelled);
        assert_eq!(engines[0].transport().party_status(), PartyStatus::Idle);
    }

    #[test]
    fn test_engine_rejects_foreign_key() {
        let network = MemoryNetwork::new();
        let counters = Arc::new(DropCounters::new());
        let manager = Arc::new(SessionManager::new(counters.clone(), Duration::from_secs(1), 16));
        let transport = Arc::new(network.join("bridge1zzz".into(), manager.clone(), counters));
        let err = Engine::new(
            EngineConfig {
                core_key: CoreKey::generate(),
                address_prefix: PREFIX.to_string(),
                parties: vec!["bridge1zzz".into()],
                threshold: 0,
                timing: timing(),
            },
            transport,
            manager,
            Arc::new(HelloFactory { stall: false }),
            CancelSource::new(),
        )
        .err()
        .expect("mismatch");
        assert!(matches!(err, SessionError::Config(_)));
    }
}
