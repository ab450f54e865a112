//! Node configuration.
//!
//! One YAML file, given by `--config`, merged with `TSS_`-prefixed
//! environment overrides (`TSS_LOG_FILTER`, `TSS_TSS__THRESHOLD`, ...).
//! Secrets never live here; see [`crate::secrets`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tss_chains::{ChainConfig, TokenPair};
use tss_session::Timing;
use tss_transport::connection::ConnectionConfig;
use tss_types::{CoreAddress, Party};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    pub local: LocalConfig,
    /// The full committee, local party included.
    pub parties: Vec<Party>,
    pub tss: TssConfig,
    pub database: DatabaseConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenPair>,
    #[serde(default)]
    pub api: Option<ApiConfig>,
    /// Committee change for `service run reshare committee`.
    #[serde(default)]
    pub reshare: Option<CommitteeReshare>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub core_address: CoreAddress,
    /// Human-readable part of core addresses.
    #[serde(default = "default_address_prefix")]
    pub address_prefix: String,
    /// P2P listen address.
    pub listen: SocketAddr,
    /// Parties allowed to announce deposits.
    #[serde(default)]
    pub distributors: Vec<CoreAddress>,
}

/// Threshold and timing. Every field is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TssConfig {
    pub threshold: usize,
    pub session_interval_ms: u64,
    pub grace_window_ms: u64,
    pub election_timeout_ms: u64,
    pub consensus_deadline_ms: u64,
    pub round_deadline_ms: u64,
    pub finalize_deadline_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub queue_capacity: usize,
    pub park_capacity_per_sender: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unix socket of the threshold-ECDSA backend process.
    pub socket: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub socket: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitteeReshare {
    pub old_parties: Vec<CoreAddress>,
    pub new_parties: Vec<CoreAddress>,
    pub new_threshold: usize,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_address_prefix() -> String {
    "bridge".to_string()
}

impl Config {
    /// Load the YAML file at `path` and apply environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: Config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("TSS_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self
            .parties
            .iter()
            .any(|p| p.core_address == self.local.core_address)
        {
            anyhow::bail!("local party {} is not in the committee", self.local.core_address);
        }
        if self.parties.len() < self.tss.threshold + 1 {
            anyhow::bail!(
                "{} parties cannot meet threshold {}",
                self.parties.len(),
                self.tss.threshold
            );
        }
        if self.tss.grace_window_ms == 0 || self.tss.heartbeat_interval_ms == 0 {
            anyhow::bail!("grace_window_ms and heartbeat_interval_ms must be positive");
        }
        if self.tss.grace_window_ms >= self.tss.session_interval_ms {
            anyhow::bail!("grace_window_ms must be shorter than session_interval_ms");
        }
        for distributor in &self.local.distributors {
            if !self.parties.iter().any(|p| &p.core_address == distributor) {
                anyhow::bail!("distributor {distributor} is not in the committee");
            }
        }
        Ok(())
    }

    pub fn timing(&self) -> Timing {
        let tss = &self.tss;
        Timing {
            grace_window: Duration::from_millis(tss.grace_window_ms),
            election_timeout: Duration::from_millis(tss.election_timeout_ms),
            consensus_deadline: Duration::from_millis(tss.consensus_deadline_ms),
            round_deadline: Duration::from_millis(tss.round_deadline_ms),
            finalize_deadline: Duration::from_millis(tss.finalize_deadline_ms),
            queue_capacity: tss.queue_capacity,
            park_capacity_per_sender: tss.park_capacity_per_sender,
        }
    }

    pub fn session_interval(&self) -> Duration {
        Duration::from_millis(self.tss.session_interval_ms)
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::with_heartbeat(Duration::from_millis(self.tss.heartbeat_interval_ms))
    }

    pub fn addresses(&self) -> Vec<CoreAddress> {
        self.parties.iter().map(|p| p.core_address.clone()).collect()
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const CONFIG: &str = r#"
local:
  core_address: bridge1a
  listen: 127.0.0.1:7000
  distributors: [bridge1a]
parties:
  - core_address: bridge1a
    endpoint: 127.0.0.1:7000
    tls_public_key: "3059"
  - core_address: bridge1b
    endpoint: 127.0.0.1:7001
    tls_public_key: "3059"
tss:
  threshold: 1
  session_interval_ms: 30000
  grace_window_ms: 2000
  election_timeout_ms: 1000
  consensus_deadline_ms: 10000
  round_deadline_ms: 10000
  finalize_deadline_ms: 10000
  heartbeat_interval_ms: 5000
  queue_capacity: 256
  park_capacity_per_sender: 64
database:
  path: /var/lib/tss/tss.db
backend:
  socket: /run/tss/backend.sock
chains:
  - type: solana
    name: solana
    id: solana-devnet
    bridge_id: "11111111111111111111111111111111"
"#;

    #[test]
    fn test_load_with_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yaml", CONFIG)?;
            jail.set_env("TSS_LOG_FILTER", "debug");
            jail.set_env("TSS_TSS__ROUND_DEADLINE_MS", "500");

            let config = Config::load(Path::new("config.yaml")).map_err(|e| e.to_string())?;
            assert_eq!(config.log_filter, "debug");
            assert_eq!(config.local.address_prefix, "bridge");
            assert_eq!(config.timing().round_deadline, Duration::from_millis(500));
            assert_eq!(config.addresses().len(), 2);
            assert!(config.chain("solana").is_some());
            assert!(config.api.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_timing_fields_required() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yaml", &CONFIG.replace("  grace_window_ms: 2000\n", ""))?;
            assert!(Config::load(Path::new("config.yaml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_rejects_foreign_local_party() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yaml", &CONFIG.replace("core_address: bridge1a\n  listen", "core_address: bridge1z\n  listen"))?;
            assert!(Config::load(Path::new("config.yaml")).is_err());
            Ok(())
        });
    }
}
