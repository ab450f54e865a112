//! Minimal JSON-RPC 2.0 client over HTTP.
//!
//! Transient failures (connect errors, timeouts, 5xx) are retried with
//! exponential backoff a bounded number of times. RPC-level errors are
//! returned as [`ChainError::Rpc`] without retrying.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{ChainError, Result};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// HTTP JSON-RPC endpoint.
#[derive(Debug)]
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    basic_auth: Option<(String, String)>,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
            basic_auth: None,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and decode its `result`.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.call_raw(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| ChainError::InvalidResponse(format!("{method}: {e}")))
    }

    /// Call `method` and return the raw `result` value.
    pub async fn call_raw(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.post(&body).await {
                Ok(response) => return Self::unwrap_response(method, response),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::debug!(method, attempt, error = %e, "transient RPC failure, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post(&self, body: &Value) -> Result<RpcResponse> {
        let mut request = self.http.post(&self.url).json(body);
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        if response.status().is_server_error() {
            return Err(ChainError::Transport(format!("HTTP {}", response.status())));
        }
        response
            .json::<RpcResponse>()
            .await
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))
    }

    fn unwrap_response(method: &str, response: RpcResponse) -> Result<Value> {
        if let Some(error) = response.error {
            return Err(ChainError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}
