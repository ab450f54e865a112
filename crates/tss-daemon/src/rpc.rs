//! Status API: JSON-RPC 2.0 over a Unix socket, one request per line.
//!
//! | Method           | Params                              | Result                    |
//! |------------------|-------------------------------------|---------------------------|
//! | `status`         | -                                   | party status, peers, sessions, drop counters |
//! | `get_deposit`    | `{chain_id, tx_hash, tx_nonce}`     | the stored deposit        |
//! | `submit_deposit` | `{chain_id, tx_hash, tx_nonce}`     | ingest outcome (distributors only) |
//! | `subscribe`      | `{session_prefixes?, results_only?}`| `true`, then `event` notifications |

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tss_db::{Database, DbError};
use tss_session::{CancelToken, DepositAcceptor, Engine, SessionError};
use tss_transport::connection::ConnectionManager;
use tss_types::DepositIdentifier;

use crate::events::{EventBus, EventFilter};

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: serde_json::Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

impl RpcError {
    fn new(code: i32, message: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            code,
            message: message.to_string(),
            data,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(-32700, "PARSE_ERROR", None)
    }

    pub fn invalid_request() -> Self {
        Self::new(-32600, "INVALID_REQUEST", None)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, "METHOD_NOT_FOUND", Some(serde_json::json!({"method": method})))
    }

    pub fn invalid_params(detail: &str) -> Self {
        Self::new(-32602, "INVALID_PARAMS", Some(serde_json::json!({"detail": detail})))
    }

    pub fn internal_error(detail: &str) -> Self {
        Self::new(-32603, "INTERNAL_ERROR", Some(serde_json::json!({"detail": detail})))
    }

    pub fn not_distributor() -> Self {
        Self::new(-32010, "NOT_DISTRIBUTOR", None)
    }

    pub fn deposit_not_found() -> Self {
        Self::new(-32020, "DEPOSIT_NOT_FOUND", None)
    }
}

/// Everything the API reads from.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Engine,
    pub db: Database,
    pub acceptor: Arc<DepositAcceptor>,
    pub events: EventBus,
    /// Peer health; absent on in-memory networks.
    pub connections: Option<Arc<ConnectionManager>>,
}

pub struct RpcServer {
    state: ApiState,
    socket_path: PathBuf,
}

impl RpcServer {
    pub fn new(state: ApiState, socket_path: PathBuf) -> Self {
        Self { state, socket_path }
    }

    /// Accept connections until cancelled.
    pub async fn run(&self, cancel: CancelToken) -> anyhow::Result<()> {
        // Stale socket from a previous run.
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "status API listening");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _addr)) => {
                    let state = self.state.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(state, stream, cancel).await {
                            warn!(error = %e, "API connection error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "API accept error"),
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

async fn handle_connection(
    state: ApiState,
    stream: tokio::net::UnixStream,
    cancel: CancelToken,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read_line(&mut line) => read?,
        };
        if bytes_read == 0 {
            break;
        }

        let request = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) if request.jsonrpc == "2.0" => request,
            Ok(request) => {
                write_line(&mut writer, &RpcResponse::error(request.id, RpcError::invalid_request())).await?;
                continue;
            }
            Err(_) => {
                write_line(&mut writer, &RpcResponse::error(serde_json::Value::Null, RpcError::parse_error())).await?;
                continue;
            }
        };

        if request.method == "subscribe" {
            let filter = match parse_params::<EventFilter>(&request.params) {
                Ok(filter) => filter,
                Err(e) => {
                    write_line(&mut writer, &RpcResponse::error(request.id, e)).await?;
                    continue;
                }
            };
            let events = state.events.subscribe();
            write_line(&mut writer, &RpcResponse::success(request.id, serde_json::json!(true))).await?;
            // The connection belongs to the subscription from here on.
            return stream_events(&mut writer, events, filter, cancel).await;
        }

        let response = dispatch_request(&state, request).await;
        write_line(&mut writer, &response).await?;
    }

    Ok(())
}

async fn stream_events(
    writer: &mut OwnedWriteHalf,
    mut events: broadcast::Receiver<crate::events::Event>,
    filter: EventFilter,
    cancel: CancelToken,
) -> anyhow::Result<()> {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = events.recv() => event,
        };
        match event {
            Ok(event) if filter.matches(&event) => {
                let notification = serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "event",
                    "params": event,
                });
                write_line(writer, &notification).await?;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "API subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn write_line<T: Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> anyhow::Result<()> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn parse_params<T: serde::de::DeserializeOwned + Default>(
    params: &serde_json::Value,
) -> Result<T, RpcError> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone()).map_err(|e| RpcError::invalid_params(&e.to_string()))
}

fn parse_identifier(params: &serde_json::Value) -> Result<DepositIdentifier, RpcError> {
    let id: DepositIdentifier =
        serde_json::from_value(params.clone()).map_err(|e| RpcError::invalid_params(&e.to_string()))?;
    if !id.is_well_formed() {
        return Err(RpcError::invalid_params("malformed deposit identifier"));
    }
    Ok(id)
}

pub async fn dispatch_request(state: &ApiState, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    debug!(method = %request.method, "dispatching API method");

    let result = match request.method.as_str() {
        "status" => Ok(status(state).await),
        "get_deposit" => get_deposit(state, &request.params).await,
        "submit_deposit" => submit_deposit(state, &request.params).await,
        other => Err(RpcError::method_not_found(other)),
    };
    match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(e) => RpcResponse::error(id, e),
    }
}

async fn status(state: &ApiState) -> serde_json::Value {
    let transport = state.engine.transport();
    let peers = match &state.connections {
        Some(connections) => serde_json::to_value(connections.statuses().await).unwrap_or_default(),
        None => serde_json::Value::Null,
    };
    serde_json::json!({
        "core_address": state.engine.local(),
        "party_status": transport.party_status(),
        "ready_count": transport.ready_count().await,
        "threshold": state.engine.threshold(),
        "peers": peers,
        "active_sessions": state.engine.manager().active_sessions(),
        "dropped": state.engine.manager().counters().snapshot(),
    })
}

async fn get_deposit(state: &ApiState, params: &serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let id = parse_identifier(params)?;
    match state.db.get_deposit(&id).await {
        Ok(deposit) => serde_json::to_value(deposit).map_err(|e| RpcError::internal_error(&e.to_string())),
        Err(DbError::NotFound(_)) => Err(RpcError::deposit_not_found()),
        Err(e) => Err(RpcError::internal_error(&e.to_string())),
    }
}

async fn submit_deposit(state: &ApiState, params: &serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let id = parse_identifier(params)?;
    match state
        .acceptor
        .distribute(state.engine.transport().as_ref(), &id)
        .await
    {
        Ok(outcome) => {
            info!(deposit = %id, outcome = ?outcome, "deposit submitted");
            Ok(serde_json::json!({ "outcome": outcome }))
        }
        Err(SessionError::NotDistributor) => Err(RpcError::not_distributor()),
        Err(e) => Err(RpcError::internal_error(&e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tss_chains::TokenRegistry;
    use tss_crypto::CoreKey;
    use tss_session::{CancelSource, EngineConfig, SessionManager, Timing};
    use tss_transport::memory::MemoryNetwork;
    use tss_transport::{DropCounters, Inbound, Transport};

    fn state() -> ApiState {
        let key = CoreKey::generate();
        let local = key.address("bridge").expect("address");
        let counters = Arc::new(DropCounters::new());
        let manager = Arc::new(SessionManager::new(counters.clone(), Duration::from_secs(1), 8));
        let transport = Arc::new(MemoryNetwork::new().join(
            local.clone(),
            manager.clone() as Arc<dyn Inbound>,
            counters,
        ));
        let engine = Engine::new(
            EngineConfig {
                core_key: key,
                address_prefix: "bridge".to_string(),
                parties: vec![local.clone()],
                threshold: 0,
                timing: Timing {
                    grace_window: Duration::from_secs(1),
                    election_timeout: Duration::from_secs(1),
                    consensus_deadline: Duration::from_secs(1),
                    round_deadline: Duration::from_secs(1),
                    finalize_deadline: Duration::from_secs(1),
                    queue_capacity: 8,
                    park_capacity_per_sender: 8,
                },
            },
            transport as Arc<dyn Transport>,
            manager,
            Arc::new(crate::backend::RemoteFactory::new("/nonexistent.sock".into(), None)),
            CancelSource::new(),
        )
        .expect("engine");
        let db = Database::open_memory().expect("db");
        let acceptor = Arc::new(DepositAcceptor::new(
            local.clone(),
            vec![local],
            0,
            Vec::new(),
            Vec::new(),
            Arc::new(TokenRegistry::default()),
            db.clone(),
        ));
        ApiState {
            engine,
            db,
            acceptor,
            events: EventBus::new(8),
            connections: None,
        }
    }

    fn request(method: &str, params: serde_json::Value) -> RpcRequest {
        RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: serde_json::json!(1),
            method: method.to_string(),
            params,
        }
    }

    fn error_code(response: &RpcResponse) -> Option<i32> {
        response.error.as_ref().map(|e| e.code)
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(RpcError::not_distributor().code, -32010);
        assert_eq!(RpcError::deposit_not_found().message, "DEPOSIT_NOT_FOUND");
        assert_eq!(RpcError::method_not_found("unknown").code, -32601);
    }

    #[tokio::test]
    async fn test_status() {
        let state = state();
        let response = dispatch_request(&state, request("status", serde_json::Value::Null)).await;
        let result = response.result.expect("result");
        assert_eq!(result["core_address"], serde_json::json!(state.engine.local()));
        assert_eq!(result["ready_count"], 0);
        assert_eq!(result["active_sessions"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_deposit_methods() {
        let state = state();
        let id = serde_json::json!({"chain_id": "evm", "tx_hash": "0xabc", "tx_nonce": 0});

        let response = dispatch_request(&state, request("get_deposit", id.clone())).await;
        assert_eq!(error_code(&response), Some(-32020));

        let response = dispatch_request(&state, request("submit_deposit", id)).await;
        assert_eq!(error_code(&response), Some(-32010));

        let response = dispatch_request(&state, request("get_deposit", serde_json::json!({"tx_hash": 1}))).await;
        assert_eq!(error_code(&response), Some(-32602));

        let response = dispatch_request(&state, request("withdraw_all", serde_json::Value::Null)).await;
        assert_eq!(error_code(&response), Some(-32601));
    }
}
