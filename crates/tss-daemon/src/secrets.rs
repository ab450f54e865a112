//! Secrets store.
//!
//! The core account key, the TLS identity, the key share and the protocol
//! preparameters are read from HashiCorp Vault (KV v2). Values are stored as
//! hex strings under `{MOUNT_PATH}/data/{key}` in a single `value` field.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use zeroize::Zeroizing;

pub const CORE_KEY: &str = "core_key";
pub const TLS_CERT: &str = "tls_cert";
pub const TLS_KEY: &str = "tls_key";
pub const SHARE: &str = "share";
pub const PREPARAMS: &str = "preparams";

const DEFAULT_MOUNT_PATH: &str = "secret";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("secret {0} not found")]
    NotFound(String),

    #[error("vault request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vault returned {status} for {path}")]
    Status { status: u16, path: String },

    #[error("secret {key} is not valid hex")]
    Encoding { key: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a secret; `Ok(None)` if it was never written.
    async fn get(&self, key: &str) -> Result<Option<Zeroizing<String>>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Read a hex secret that must exist.
pub async fn require_bytes(store: &dyn SecretStore, key: &str) -> Result<Zeroizing<Vec<u8>>> {
    let value = store
        .get(key)
        .await?
        .ok_or_else(|| SecretError::NotFound(key.to_string()))?;
    decode(key, &value)
}

/// Read a hex secret that may be absent.
pub async fn optional_bytes(store: &dyn SecretStore, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
    match store.get(key).await? {
        Some(value) => decode(key, &value).map(Some),
        None => Ok(None),
    }
}

pub async fn set_bytes(store: &dyn SecretStore, key: &str, value: &[u8]) -> Result<()> {
    let encoded = Zeroizing::new(hex::encode(value));
    store.set(key, &encoded).await
}

fn decode(key: &str, value: &str) -> Result<Zeroizing<Vec<u8>>> {
    hex::decode(value.trim())
        .map(Zeroizing::new)
        .map_err(|_| SecretError::Encoding {
            key: key.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

pub struct VaultStore {
    client: reqwest::Client,
    address: String,
    token: Zeroizing<String>,
    mount: String,
}

#[derive(Deserialize)]
struct KvResponse {
    data: KvData,
}

#[derive(Deserialize)]
struct KvData {
    data: HashMap<String, String>,
}

impl VaultStore {
    /// Configure from `VAULT_PATH`, `VAULT_TOKEN` and `MOUNT_PATH`.
    pub fn from_env() -> Result<Self> {
        let address = std::env::var("VAULT_PATH").map_err(|_| SecretError::MissingEnv("VAULT_PATH"))?;
        let token = std::env::var("VAULT_TOKEN").map_err(|_| SecretError::MissingEnv("VAULT_TOKEN"))?;
        let mount = std::env::var("MOUNT_PATH").unwrap_or_else(|_| DEFAULT_MOUNT_PATH.to_string());
        Self::new(address, token, mount)
    }

    pub fn new(address: String, token: String, mount: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            address: address.trim_end_matches('/').to_string(),
            token: Zeroizing::new(token),
            mount,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/v1/{}/data/{}", self.address, self.mount, key)
    }
}

#[async_trait]
impl SecretStore for VaultStore {
    async fn get(&self, key: &str) -> Result<Option<Zeroizing<String>>> {
        let response = self
            .client
            .get(self.url(key))
            .header("X-Vault-Token", self.token.as_str())
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SecretError::Status {
                status: response.status().as_u16(),
                path: key.to_string(),
            });
        }
        let mut body: KvResponse = response.json().await?;
        Ok(body.data.data.remove("value").map(Zeroizing::new))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(key))
            .header("X-Vault-Token", self.token.as_str())
            .json(&serde_json::json!({ "data": { "value": value } }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SecretError::Status {
                status: response.status().as_u16(),
                path: key.to_string(),
            });
        }
        tracing::info!(key, "secret written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store for tests and throwaway nodes.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Zeroizing<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Zeroizing<String>>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Zeroizing::new(value.to_string()));
        Ok(())
    }
}
