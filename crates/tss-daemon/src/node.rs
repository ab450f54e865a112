//! Node assembly: secrets, transport, engine, database and chains.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tss_chains::{Chain, ChainAdapter, TokenRegistry};
use tss_crypto::CoreKey;
use tss_db::Database;
use tss_session::{DepositAcceptor, Engine, EngineConfig, SessionManager};
use tss_transport::connection::{ConnectionManager, StatusCell};
use tss_transport::quic::{QuicConfig, QuicNode};
use tss_transport::server::{self, ServerContext};
use tss_transport::tls::TlsIdentity;
use tss_transport::{DropCounters, Inbound, Registry, Transport};
use tss_types::PartyStatus;

use crate::backend::RemoteFactory;
use crate::config::Config;
use crate::events::{Event, EventBus};
use crate::secrets::{self, SecretStore};

/// Buffer of each API event subscriber.
const EVENT_BUFFER: usize = 1000;

/// A running committee member.
pub struct Node {
    pub config: Config,
    pub engine: Engine,
    pub connections: Arc<ConnectionManager>,
    pub db: Database,
    /// Adapters by configured name.
    pub chains: HashMap<String, Arc<Chain>>,
    pub acceptor: Arc<DepositAcceptor>,
    pub events: EventBus,
    pub backend: Arc<RemoteFactory>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Load secrets, bind the P2P endpoint and wire every component.
    pub async fn start(config: Config, store: &dyn SecretStore) -> anyhow::Result<Self> {
        let core_key = CoreKey::from_bytes(&secrets::require_bytes(store, secrets::CORE_KEY).await?)
            .context("core account key")?;
        let local = core_key.address(&config.local.address_prefix)?;
        if local != config.local.core_address {
            anyhow::bail!(
                "core key belongs to {local}, config names {}",
                config.local.core_address
            );
        }
        let identity = TlsIdentity::from_der(
            secrets::require_bytes(store, secrets::TLS_CERT).await?.to_vec(),
            secrets::require_bytes(store, secrets::TLS_KEY).await?.to_vec(),
        );
        let share = secrets::optional_bytes(store, secrets::SHARE).await?;

        let registry = Arc::new(Registry::new(config.parties.clone()));
        let pinned = registry
            .others(&local)
            .map(|p| p.tls_public_key.clone())
            .collect();
        let quic = Arc::new(QuicNode::new(
            QuicConfig {
                bind_addr: config.local.listen,
                ..QuicConfig::default()
            },
            identity,
            pinned,
        )?);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let connections = ConnectionManager::start(
            quic.clone(),
            local.clone(),
            registry.clone(),
            config.connection(),
            Arc::new(StatusCell::new(PartyStatus::Idle)),
            shutdown_rx.clone(),
        );

        let timing = config.timing();
        let counters = Arc::new(DropCounters::new());
        let manager = Arc::new(SessionManager::new(
            counters.clone(),
            timing.grace_window,
            timing.park_capacity_per_sender,
        ));
        tokio::spawn(server::serve(
            quic,
            ServerContext {
                registry,
                connections: connections.clone(),
                inbound: manager.clone() as Arc<dyn Inbound>,
                counters,
            },
            shutdown_rx,
        ));

        let backend = Arc::new(RemoteFactory::new(
            config.backend.socket.clone(),
            share.as_deref().map(Vec::as_slice),
        ));
        let engine = Engine::new(
            EngineConfig {
                core_key,
                address_prefix: config.local.address_prefix.clone(),
                parties: config.addresses(),
                threshold: config.tss.threshold,
                timing: timing.clone(),
            },
            connections.clone() as Arc<dyn Transport>,
            manager.clone(),
            backend.clone(),
            tss_session::CancelSource::new(),
        )?;

        let db = Database::open(&config.database.path)
            .with_context(|| format!("database {}", config.database.path.display()))?;

        let mut chains = HashMap::new();
        for chain_config in &config.chains {
            let chain = Chain::connect(chain_config)
                .with_context(|| format!("chain {}", chain_config.name()))?;
            chains.insert(chain_config.name().to_string(), Arc::new(chain));
        }
        let acceptor = Arc::new(DepositAcceptor::new(
            local,
            config.addresses(),
            config.tss.threshold,
            config.local.distributors.clone(),
            chains.values().map(|c| c.clone() as Arc<dyn ChainAdapter>),
            Arc::new(TokenRegistry::new(config.tokens.clone())),
            db.clone(),
        ));

        let events = EventBus::new(EVENT_BUFFER);
        tokio::spawn(events.clone().forward(engine.subscribe(), engine.cancel_token()));
        tokio::spawn(sweep_parked(manager, timing.grace_window, engine.cancel_token()));
        events.emit(Event::new(
            "NodeStarted",
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "core_address": engine.local(),
            }),
        ));
        tracing::info!(local = %engine.local(), parties = engine.parties().len(), "node started");

        Ok(Self {
            config,
            engine,
            connections,
            db,
            chains,
            acceptor,
            events,
            backend,
            shutdown,
        })
    }

    pub fn chain(&self, name: &str) -> anyhow::Result<Arc<Chain>> {
        self.chains
            .get(name)
            .cloned()
            .with_context(|| format!("chain {name} is not configured"))
    }

    /// Run the deposit acceptor until shutdown.
    pub fn spawn_acceptor(&self) {
        let acceptor = self.acceptor.clone();
        let manager = self.engine.manager().clone();
        let capacity = self.engine.timing().queue_capacity;
        let cancel = self.engine.cancel_token();
        tokio::spawn(async move {
            if let Err(e) = acceptor.run(manager, capacity, cancel).await {
                tracing::error!(error = %e, "deposit acceptor failed");
            }
        });
    }

    /// Cancel every session and stop the transport.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        let _ = self.shutdown.send(true);
        tracing::info!("node stopped");
    }
}

/// Drop parked envelopes whose grace window elapsed.
async fn sweep_parked(
    manager: Arc<SessionManager>,
    every: std::time::Duration,
    cancel: tss_session::CancelToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => manager.sweep(),
        }
    }
}
