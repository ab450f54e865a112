//! `service run ...`: the long-running signer and the one-shot sessions.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tss_chains::{AddressValid, Chain, ChainAdapter};
use tss_session::schedule::Scheduler;
use tss_session::{
    CancelToken, MigrationSigning, SessionError, SessionHandle, SessionMode, SessionPlan,
    WithdrawalSigning,
};
use tss_types::{SessionId, SessionKind, SessionResult};

use super::Outcome;
use crate::config::Config;
use crate::node::Node;
use crate::rpc::{ApiState, RpcServer};
use crate::secrets::{self, SecretStore};

/// What `service run reshare` hands over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReshareTarget {
    /// Move the key to the committee in the config's `reshare` section.
    Committee,
    /// Move a chain's funds to `target`, signed with the current key.
    Chain { name: String, target: String },
}

/// Run distributed key generation once and store the share.
pub async fn keygen(config: Config, store: Arc<dyn SecretStore>) -> anyhow::Result<Outcome> {
    let node = Node::start(config, store.as_ref()).await?;
    let preparams = secrets::optional_bytes(store.as_ref(), secrets::PREPARAMS)
        .await?
        .map(|p| p.to_vec());
    if preparams.is_none() {
        warn!("no preparameters stored; the backend will generate them");
    }

    let result = one_shot(&node, SessionKind::Keygen, SessionMode::Keygen { preparams }).await?;
    let outcome = match result {
        SessionResult::Completed {
            artifact: Some(share),
            ..
        } => {
            secrets::set_bytes(store.as_ref(), secrets::SHARE, &share).await?;
            info!("key share stored");
            Outcome::Success
        }
        other => {
            error!(result = ?other, "keygen did not complete");
            Outcome::SessionFailed
        }
    };
    node.shutdown();
    Ok(outcome)
}

/// Rotate the committee, or sign a migration transaction on one chain.
pub async fn reshare(
    config: Config,
    store: Arc<dyn SecretStore>,
    target: ReshareTarget,
) -> anyhow::Result<Outcome> {
    let node = Node::start(config, store.as_ref()).await?;
    let outcome = match target {
        ReshareTarget::Committee => {
            let plan = node
                .config
                .reshare
                .clone()
                .context("config has no reshare section")?;
            let keeps_share = plan.new_parties.contains(node.engine.local());
            let mode = SessionMode::Reshare {
                old_parties: plan.old_parties,
                new_parties: plan.new_parties,
                new_threshold: plan.new_threshold,
            };
            match one_shot(&node, SessionKind::Reshare(None), mode).await? {
                SessionResult::Completed {
                    artifact: Some(share),
                    ..
                } if keeps_share => {
                    secrets::set_bytes(store.as_ref(), secrets::SHARE, &share).await?;
                    info!("new key share stored");
                    Outcome::Success
                }
                SessionResult::Completed { .. } => {
                    info!("left the committee");
                    Outcome::Success
                }
                other => {
                    error!(result = ?other, "committee reshare did not complete");
                    Outcome::SessionFailed
                }
            }
        }
        ReshareTarget::Chain { name, target } => {
            let chain = node.chain(&name)?;
            if !chain.is_valid_address(&target) {
                anyhow::bail!("{target} is not a valid {name} address");
            }
            let workload = MigrationSigning::new(chain as Arc<dyn ChainAdapter>, target);
            let mode = SessionMode::Signing(Arc::new(workload));
            match one_shot(&node, SessionKind::Reshare(Some(name)), mode).await? {
                SessionResult::Completed { signatures, .. } => {
                    info!(signatures = signatures.len(), "migration signed");
                    Outcome::Success
                }
                SessionResult::Excluded => Outcome::Success,
                other => {
                    error!(result = ?other, "migration did not complete");
                    Outcome::SessionFailed
                }
            }
        }
    };
    node.shutdown();
    Ok(outcome)
}

/// The signer: deposit acceptor plus one signing session per chain and slot.
pub async fn sign(config: Config, store: Arc<dyn SecretStore>) -> anyhow::Result<Outcome> {
    let node = Arc::new(Node::start(config, store.as_ref()).await?);
    node.spawn_acceptor();
    spawn_api(&node);

    for (name, chain) in &node.chains {
        let node = node.clone();
        let name = name.clone();
        let chain = chain.clone();
        let cancel = node.engine.cancel_token();
        tokio::spawn(async move {
            if let Err(e) = sign_loop(&node, &name, chain, cancel).await {
                error!(chain = %name, error = %e, "signing loop stopped");
            }
        });
    }
    info!(chains = node.chains.len(), "signing service running");

    wait_for_shutdown().await;
    node.shutdown();
    Ok(Outcome::Success)
}

/// Only the status API and the deposit acceptor.
pub async fn api(config: Config, store: Arc<dyn SecretStore>) -> anyhow::Result<Outcome> {
    if config.api.is_none() {
        anyhow::bail!("config has no api section");
    }
    let node = Arc::new(Node::start(config, store.as_ref()).await?);
    node.spawn_acceptor();
    spawn_api(&node);
    wait_for_shutdown().await;
    node.shutdown();
    Ok(Outcome::Success)
}

async fn sign_loop(
    node: &Node,
    name: &str,
    chain: Arc<Chain>,
    cancel: CancelToken,
) -> anyhow::Result<()> {
    let mut scheduler = Scheduler::new(node.config.session_interval(), node.engine.timing().grace_window)?;
    loop {
        let slot = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            slot = scheduler.tick() => slot,
        };
        let workload = WithdrawalSigning::new(chain.clone() as Arc<dyn ChainAdapter>, node.db.clone());
        let plan = SessionPlan {
            id: SessionId::new(SessionKind::Sign(name.to_string()), slot.epoch),
            start_at: slot.start_at,
            mode: SessionMode::Signing(Arc::new(workload)),
        };
        match node.engine.spawn(plan) {
            Ok(handle) => {
                tokio::spawn(report(handle));
            }
            Err(SessionError::KindBusy(kind)) => {
                warn!(kind = %kind, epoch = slot.epoch, "previous session still running, slot skipped");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn report(handle: SessionHandle) {
    let id = handle.id().clone();
    match handle.wait().await {
        SessionResult::Completed { signatures, .. } => {
            info!(session_id = %id, signatures = signatures.len(), "session completed");
        }
        SessionResult::Excluded => info!(session_id = %id, "not selected to sign"),
        SessionResult::Failed { kind, detail } => {
            warn!(session_id = %id, kind = ?kind, detail = %detail, "session failed");
        }
        SessionResult::Cancelled => info!(session_id = %id, "session cancelled"),
    }
}

/// Schedule one session in the next slot and wait for its result.
/// Ctrl-C cancels it.
async fn one_shot(node: &Node, kind: SessionKind, mode: SessionMode) -> anyhow::Result<SessionResult> {
    let mut scheduler = Scheduler::new(node.config.session_interval(), node.engine.timing().grace_window)?;
    let slot = scheduler.tick().await;
    let handle = node.engine.spawn(SessionPlan {
        id: SessionId::new(kind, slot.epoch),
        start_at: slot.start_at,
        mode,
    })?;
    info!(session_id = %handle.id(), "session scheduled");

    let id = handle.id().clone();
    let wait = handle.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        result = &mut wait => result,
        _ = tokio::signal::ctrl_c() => {
            info!(session_id = %id, "Ctrl-C received, cancelling");
            node.engine.shutdown();
            wait.await
        }
    };
    info!(session_id = %id, state = ?result.terminal_state(), "session finished");
    Ok(result)
}

fn spawn_api(node: &Arc<Node>) {
    let Some(api) = node.config.api.clone() else {
        return;
    };
    let server = RpcServer::new(
        ApiState {
            engine: node.engine.clone(),
            db: node.db.clone(),
            acceptor: node.acceptor.clone(),
            events: node.events.clone(),
            connections: Some(node.connections.clone()),
        },
        api.socket,
    );
    let cancel = node.engine.cancel_token();
    tokio::spawn(async move {
        if let Err(e) = server.run(cancel).await {
            error!(error = %e, "status API failed");
        }
    });
}

async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, shutting down"),
        Err(e) => error!(error = %e, "cannot listen for Ctrl-C, shutting down"),
    }
}
