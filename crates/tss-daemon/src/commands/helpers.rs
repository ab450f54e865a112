//! `helpers ...`: key material and secrets maintenance.

use std::path::PathBuf;

use serde::Serialize;
use tss_crypto::CoreKey;
use tss_transport::tls::TlsIdentity;

use super::Outcome;
use crate::backend::RemoteFactory;
use crate::secrets::{self, SecretStore};

/// A freshly generated core account.
#[derive(Debug, Serialize)]
pub struct Account {
    pub core_address: String,
    pub public_key: String,
    pub private_key: String,
}

/// Generate a core account key. Nothing is stored.
pub fn cosmos_account(prefix: &str) -> anyhow::Result<Account> {
    let key = CoreKey::generate();
    Ok(Account {
        core_address: key.address(prefix)?.to_string(),
        public_key: hex::encode(key.public_key()),
        private_key: key.to_hex().to_string(),
    })
}

/// Ask the backend for keygen preparameters and store them.
pub async fn preparams(socket: PathBuf, store: &dyn SecretStore) -> anyhow::Result<Outcome> {
    let backend = RemoteFactory::new(socket, None);
    let preparams = tokio::task::spawn_blocking(move || backend.generate_preparams()).await??;
    secrets::set_bytes(store, secrets::PREPARAMS, &preparams).await?;
    tracing::info!(bytes = preparams.len(), "preparameters stored");
    Ok(Outcome::Success)
}

/// Generate a self-signed TLS identity, store it, and return the SPKI to
/// pin in every peer's config.
pub async fn tls_identity(name: &str, store: &dyn SecretStore) -> anyhow::Result<String> {
    let identity = TlsIdentity::generate(name)?;
    secrets::set_bytes(store, secrets::TLS_CERT, identity.cert_der()).await?;
    secrets::set_bytes(store, secrets::TLS_KEY, identity.key_der()).await?;
    Ok(hex::encode(identity.public_key()?))
}

pub async fn vault_get(store: &dyn SecretStore, key: &str) -> anyhow::Result<String> {
    let value = store
        .get(key)
        .await?
        .ok_or_else(|| secrets::SecretError::NotFound(key.to_string()))?;
    Ok(value.to_string())
}

pub async fn vault_set(store: &dyn SecretStore, key: &str, value: &str) -> anyhow::Result<Outcome> {
    store.set(key, value).await?;
    Ok(Outcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemoryStore;

    #[test]
    fn test_cosmos_account() {
        let account = cosmos_account("bridge").expect("account");
        assert!(account.core_address.starts_with("bridge1"));
        let key = CoreKey::from_hex(&account.private_key).expect("key");
        assert_eq!(key.address("bridge").expect("address").to_string(), account.core_address);
    }

    #[tokio::test]
    async fn test_tls_identity_stored() {
        let store = MemoryStore::new();
        let spki = tls_identity("bridge1a", &store).await.expect("identity");
        let cert = secrets::require_bytes(&store, secrets::TLS_CERT).await.expect("cert");
        assert_eq!(
            hex::encode(tss_transport::tls::spki_of(&cert).expect("spki")),
            spki
        );
    }

    #[tokio::test]
    async fn test_vault_get_set() {
        let store = MemoryStore::new();
        vault_set(&store, "share", "abcd").await.expect("set");
        assert_eq!(vault_get(&store, "share").await.expect("get"), "abcd");
        assert!(vault_get(&store, "core_key").await.is_err());
    }
}
