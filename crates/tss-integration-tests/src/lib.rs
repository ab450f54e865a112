//! Fixtures for the end-to-end scenarios under `tests/`.
//!
//! A [`Cluster`] is a committee of engines joined over one
//! [`MemoryNetwork`], each with its own in-memory database. The threshold
//! backend is replaced by [`SharedKeyFactory`]: every party runs the same
//! lock-step round schedule and, at the end, signs with one shared secp256k1
//! key. RFC 6979 makes those signatures identical across parties, which is
//! what a real threshold signature looks like from the outside.
//!
//! Run the scenarios:
//! ```sh
//! cargo test -p tss-integration-tests
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use num_bigint::BigUint;
use tss_chains::evm::{EvmChain, EvmConfig};
use tss_chains::{
    AddressValid, ChainAdapter, ChainError, Constructor, DepositData, Finalizer, GetDepositData,
    SignedArtifact, SigningContext, SigningRequest, TokenPair, TokenRegistry,
};
use tss_crypto::hashing;
use tss_crypto::CoreKey;
use tss_db::Database;
use tss_session::election;
use tss_session::{
    CancelSource, DepositAcceptor, Engine, EngineConfig, InMsg, OutMsg, ProtocolError,
    ProtocolFactory, ProtocolOutput, ProtocolTask, Routing, SessionManager, StartParams,
    ThresholdProtocol, Timing,
};
use tss_transport::memory::MemoryNetwork;
use tss_transport::DropCounters;
use tss_types::{CoreAddress, Deposit, DepositIdentifier, EcdsaSignature, SessionId};

pub const PREFIX: &str = "bridge";

/// Chain id of the EVM withdrawal chain used by the scenarios.
pub const EVM_CHAIN_ID: &str = "11155111";

/// Chain id of the stub deposit source.
pub const SOURCE_CHAIN_ID: &str = "source";

pub const SOURCE_TOKEN: &str = "0x00000000000000000000000000000000000000aa";

pub const RECEIVER: &str = "0x00000000000000000000000000000000000000cc";

/// Timing tight enough for tests, loose enough for a loaded CI box.
pub fn timing() -> Timing {
    Timing {
        grace_window: Duration::from_secs(2),
        election_timeout: Duration::from_millis(300),
        consensus_deadline: Duration::from_secs(3),
        round_deadline: Duration::from_secs(3),
        finalize_deadline: Duration::from_secs(3),
        queue_capacity: 128,
        park_capacity_per_sender: 32,
    }
}

// ---------------------------------------------------------------------------
// Shared-key protocol
// ---------------------------------------------------------------------------

/// Creates [`SharedKeyProtocol`] instances.
pub struct SharedKeyFactory {
    key: [u8; 32],
    rounds: u16,
    stall_at: Option<u16>,
    reached: Arc<AtomicU16>,
}

impl SharedKeyFactory {
    /// `rounds` lock-step rounds, then the output.
    pub fn new(rounds: u16) -> Self {
        Self {
            key: [0x42; 32],
            rounds: rounds.max(1),
            stall_at: None,
            reached: Arc::new(AtomicU16::new(0)),
        }
    }

    /// Never leave round `round`.
    pub fn stalling_at(mut self, round: u16) -> Self {
        self.stall_at = Some(round);
        self
    }

    /// Compressed public key every signature recovers to.
    pub fn public_key(&self) -> [u8; 33] {
        CoreKey::from_bytes(&self.key)
            .expect("fixture key")
            .public_key()
    }

    /// Highest round any instance has entered.
    pub fn reached(&self) -> u16 {
        self.reached.load(Ordering::SeqCst)
    }

    /// Wait until some instance entered `round`.
    pub async fn wait_for_round(&self, round: u16) {
        while self.reached() < round {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl ProtocolFactory for SharedKeyFactory {
    fn create(
        &self,
        _session_id: &SessionId,
        _task: &ProtocolTask,
    ) -> Result<Box<dyn ThresholdProtocol>, ProtocolError> {
        Ok(Box::new(SharedKeyProtocol {
            key: self.key,
            rounds: self.rounds,
            stall_at: self.stall_at,
            reached: self.reached.clone(),
            params: None,
            round: 0,
            heard: HashMap::new(),
            output: None,
        }))
    }
}

/// Every party broadcasts once per round and moves on after hearing from
/// all the others in that round. Messages for later rounds are counted
/// ahead of time.
pub struct SharedKeyProtocol {
    key: [u8; 32],
    rounds: u16,
    stall_at: Option<u16>,
    reached: Arc<AtomicU16>,
    params: Option<StartParams>,
    round: u16,
    heard: HashMap<u16, usize>,
    output: Option<ProtocolOutput>,
}

impl SharedKeyProtocol {
    fn enter(&mut self, round: u16) -> OutMsg {
        self.round = round;
        self.reached.fetch_max(round, Ordering::SeqCst);
        OutMsg {
            routing: Routing::Broadcast,
            round,
            index: 0,
            payload: round.to_be_bytes().to_vec(),
        }
    }

    fn peers(&self) -> usize {
        self.params
            .as_ref()
            .map_or(0, |p| p.parties.len().saturating_sub(1))
    }

    fn advance(&mut self) -> Result<Vec<OutMsg>, ProtocolError> {
        let mut out = Vec::new();
        while self.output.is_none()
            && self.stall_at != Some(self.round)
            && self.heard.get(&self.round).copied().unwrap_or(0) >= self.peers()
        {
            if self.round >= self.rounds {
                self.output = Some(self.finish()?);
            } else {
                let next = self.round + 1;
                out.push(self.enter(next));
            }
        }
        Ok(out)
    }

    fn finish(&self) -> Result<ProtocolOutput, ProtocolError> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| ProtocolError::Crypto("not started".to_string()))?;
        let key = CoreKey::from_bytes(&self.key).map_err(|e| ProtocolError::Crypto(e.to_string()))?;
        match &params.task {
            ProtocolTask::Sign { message_hashes } => message_hashes
                .iter()
                .map(|hash| key.sign_prehash(hash))
                .collect::<Result<Vec<EcdsaSignature>, _>>()
                .map(ProtocolOutput::Signatures)
                .map_err(|e| ProtocolError::Crypto(e.to_string())),
            ProtocolTask::Keygen { .. } | ProtocolTask::Reshare { .. } => {
                let share = hashing::encode_multi_field(&[
                    params.session_id.as_bytes(),
                    &(params.local_index as u64).to_be_bytes(),
                    &key.public_key(),
                ]);
                Ok(ProtocolOutput::Share(hashing::hash(&share).to_vec()))
            }
        }
    }
}

impl ThresholdProtocol for SharedKeyProtocol {
    fn start(&mut self, params: &StartParams) -> Result<Vec<OutMsg>, ProtocolError> {
        self.params = Some(params.clone());
        let mut out = vec![self.enter(1)];
        out.extend(self.advance()?);
        Ok(out)
    }

    fn update(&mut self, msg: InMsg) -> Result<Vec<OutMsg>, ProtocolError> {
        if msg.round == 0 || msg.round > self.rounds {
            return Err(ProtocolError::InvalidMessage {
                from: msg.from,
                reason: format!("no round {}", msg.round),
            });
        }
        *self.heard.entry(msg.round).or_default() += 1;
        self.advance()
    }

    fn round(&self) -> u16 {
        self.round
    }

    fn done(&mut self) -> Option<ProtocolOutput> {
        self.output.take()
    }
}

// ---------------------------------------------------------------------------
// Deposit source
// ---------------------------------------------------------------------------

/// A source chain whose deposits are whatever the test put there.
pub struct StubSource {
    deposits: Mutex<HashMap<DepositIdentifier, DepositData>>,
    lookups: AtomicU16,
}

impl Default for StubSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StubSource {
    pub fn new() -> Self {
        Self {
            deposits: Mutex::new(HashMap::new()),
            lookups: AtomicU16::new(0),
        }
    }

    /// Make `data` visible on the chain.
    pub fn add(&self, data: DepositData) -> DepositIdentifier {
        let identifier = data.identifier.clone();
        self.deposits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identifier.clone(), data);
        identifier
    }

    pub fn lookups(&self) -> u16 {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl AddressValid for StubSource {
    fn is_valid_address(&self, address: &str) -> bool {
        !address.is_empty()
    }
}

#[async_trait]
impl GetDepositData for StubSource {
    async fn get_deposit_data(&self, id: &DepositIdentifier) -> tss_chains::Result<DepositData> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.deposits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ChainError::DepositNotFound(id.to_string()))
    }
}

#[async_trait]
impl Constructor for StubSource {
    async fn construct(&self, _deposit: &Deposit) -> tss_chains::Result<SigningRequest> {
        Err(ChainError::Unsupported("withdrawals to the source chain".to_string()))
    }

    async fn verify(&self, _deposit: &Deposit, _request: &SigningRequest) -> tss_chains::Result<()> {
        Err(ChainError::Unsupported("withdrawals to the source chain".to_string()))
    }
}

#[async_trait]
impl Finalizer for StubSource {
    fn assemble(
        &self,
        _context: &SigningContext,
        _signatures: &[EcdsaSignature],
    ) -> tss_chains::Result<SignedArtifact> {
        Err(ChainError::Unsupported("withdrawals to the source chain".to_string()))
    }

    async fn broadcast(&self, _artifact: &SignedArtifact) -> tss_chains::Result<()> {
        Ok(())
    }
}

impl ChainAdapter for StubSource {
    fn chain_id(&self) -> &str {
        SOURCE_CHAIN_ID
    }
}

/// A deposit of `amount` source units paying [`RECEIVER`] on the EVM chain.
pub fn deposit_data(tx_hash: &str, amount: u64) -> DepositData {
    DepositData {
        identifier: DepositIdentifier::new(SOURCE_CHAIN_ID, tx_hash, 0),
        depositor: Some("0x00000000000000000000000000000000000000dd".to_string()),
        amount: BigUint::from(amount),
        token: SOURCE_TOKEN.to_string(),
        receiver: RECEIVER.to_string(),
        withdrawal_chain_id: EVM_CHAIN_ID.to_string(),
        block: 100,
    }
}

/// The pending row every member would store for `data`.
pub fn pending_deposit(data: DepositData) -> Deposit {
    tokens().build_deposit(data).expect("convertible deposit")
}

/// The EVM withdrawal chain. Nothing here touches its RPC endpoint.
pub fn evm_chain() -> Arc<EvmChain> {
    Arc::new(
        EvmChain::connect(EvmConfig {
            name: "sepolia".to_string(),
            id: EVM_CHAIN_ID.to_string(),
            rpc_url: "http://127.0.0.1:1".to_string(),
            bridge_address: "0x00000000000000000000000000000000000000b1".to_string(),
            confirmations: 1,
            timeout_ms: 500,
        })
        .expect("evm chain"),
    )
}

/// Source token (3 decimals) bridged to the EVM native coin (1 decimal).
pub fn tokens() -> Arc<TokenRegistry> {
    Arc::new(TokenRegistry::new(vec![TokenPair {
        source_chain_id: SOURCE_CHAIN_ID.to_string(),
        source_token: SOURCE_TOKEN.to_string(),
        source_decimals: 3,
        target_chain_id: EVM_CHAIN_ID.to_string(),
        target_token: "native".to_string(),
        target_decimals: 1,
        is_wrapped: false,
    }]))
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// One committee member.
pub struct Member {
    pub address: CoreAddress,
    pub engine: Engine,
    pub db: Database,
}

pub struct Cluster {
    pub network: MemoryNetwork,
    /// Sorted by address.
    pub members: Vec<Member>,
    pub protocols: Arc<SharedKeyFactory>,
    pub threshold: usize,
}

impl Cluster {
    /// `n` parties, any `threshold + 1` of which can sign.
    pub fn new(n: usize, threshold: usize, protocols: SharedKeyFactory) -> Self {
        let network = MemoryNetwork::new();
        let protocols = Arc::new(protocols);
        let mut keys: Vec<(CoreAddress, CoreKey)> = (0..n)
            .map(|_| {
                let key = CoreKey::generate();
                (key.address(PREFIX).expect("address"), key)
            })
            .collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        let parties: Vec<CoreAddress> = keys.iter().map(|(address, _)| address.clone()).collect();

        let members = keys
            .into_iter()
            .map(|(address, key)| {
                let timing = timing();
                let counters = Arc::new(DropCounters::new());
                let manager = Arc::new(SessionManager::new(
                    counters.clone(),
                    timing.grace_window,
                    timing.park_capacity_per_sender,
                ));
                let transport = Arc::new(network.join(address.clone(), manager.clone(), counters));
                let engine = Engine::new(
                    EngineConfig {
                        core_key: key,
                        address_prefix: PREFIX.to_string(),
                        parties: parties.clone(),
                        threshold,
                        timing,
                    },
                    transport,
                    manager,
                    protocols.clone(),
                    CancelSource::new(),
                )
                .expect("engine");
                Member {
                    address,
                    engine,
                    db: Database::open_memory().expect("database"),
                }
            })
            .collect();

        Self {
            network,
            members,
            protocols,
            threshold,
        }
    }

    pub fn parties(&self) -> Vec<CoreAddress> {
        self.members.iter().map(|m| m.address.clone()).collect()
    }

    pub fn member(&self, address: &CoreAddress) -> &Member {
        self.members
            .iter()
            .find(|m| &m.address == address)
            .expect("committee member")
    }

    /// The first election candidate for `id`.
    pub fn primary_proposer(&self, id: &SessionId) -> CoreAddress {
        election::candidate(&id.to_string(), &self.parties(), 0)
            .cloned()
            .expect("non-empty committee")
    }

    /// Store `deposit` with every member, as if the acceptor had run.
    pub async fn seed(&self, deposit: &Deposit) {
        for member in &self.members {
            member.db.insert_deposit(deposit).await.expect("insert deposit");
        }
    }

    /// A deposit acceptor per member over `source` and the EVM chain, all
    /// serving in the background. `distributor` may announce deposits.
    pub fn spawn_acceptors(
        &self,
        source: Arc<StubSource>,
        distributor: &CoreAddress,
    ) -> Vec<Arc<DepositAcceptor>> {
        let evm = evm_chain();
        self.members
            .iter()
            .map(|member| {
                let acceptor = Arc::new(DepositAcceptor::new(
                    member.address.clone(),
                    self.parties(),
                    self.threshold,
                    [distributor.clone()],
                    [
                        source.clone() as Arc<dyn ChainAdapter>,
                        evm.clone() as Arc<dyn ChainAdapter>,
                    ],
                    tokens(),
                    member.db.clone(),
                ));
                let runner = acceptor.clone();
                let manager = member.engine.manager().clone();
                let cancel = member.engine.cancel_token();
                tokio::spawn(async move {
                    let _ = runner.run(manager, 64, cancel).await;
                });
                acceptor
            })
            .collect()
    }
}

/// Poll until `check` holds or `within` passes.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

