//! tss-svc: threshold signing service of the bridge committee.
//!
//! Exit codes: `0` success, `1` startup error, `2` session failure.

mod backend;
mod commands;
mod config;
mod events;
mod node;
mod rpc;
mod secrets;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::migrate::Direction;
use crate::commands::service::ReshareTarget;
use crate::commands::{helpers, migrate, service, Outcome};
use crate::config::Config;
use crate::secrets::{SecretStore, VaultStore};

#[derive(Parser)]
#[command(name = "tss-svc", version)]
#[command(about = "Threshold ECDSA signing service for the bridge committee", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run or maintain the service
    #[command(subcommand)]
    Service(ServiceCommand),
    /// Key material and secrets
    #[command(subcommand)]
    Helpers(HelpersCommand),
}

#[derive(Subcommand)]
enum ServiceCommand {
    #[command(subcommand)]
    Run(RunCommand),
    /// Apply or revert database migrations
    Migrate {
        #[arg(value_enum)]
        direction: MigrateDirection,
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum RunCommand {
    /// Distributed key generation
    Keygen {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Deposit acceptor plus periodic signing sessions
    Sign {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Reshare the key: `committee`, or migrate a configured chain's funds
    Reshare {
        /// `committee` or a chain name (bitcoin, zano, ...)
        target: String,
        /// Destination address of a chain migration
        #[arg(long)]
        to: Option<String>,
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Status API only
    Api {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum MigrateDirection {
    Up,
    Down,
}

#[derive(Subcommand)]
enum HelpersCommand {
    #[command(subcommand)]
    Generate(GenerateCommand),
    #[command(subcommand)]
    Vault(VaultCommand),
}

#[derive(Subcommand)]
enum GenerateCommand {
    /// Ask the backend for keygen preparameters and store them
    Preparams {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print a new core account key
    CosmosAccount {
        #[arg(long, default_value = "bridge")]
        prefix: String,
    },
    /// Store a new TLS identity and print its public key
    Tls {
        /// Certificate subject name
        name: String,
    },
}

#[derive(Subcommand)]
enum VaultCommand {
    Get { key: String },
    Set { key: String, value: String },
}

/// `RUST_LOG` wins over the configured filter. Only the first call takes
/// effect.
fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load(path: &std::path::Path) -> anyhow::Result<Config> {
    let config = Config::load(path)?;
    init_tracing(&config.log_filter);
    Ok(config)
}

fn vault() -> anyhow::Result<Arc<dyn SecretStore>> {
    init_tracing("info");
    Ok(Arc::new(VaultStore::from_env()?))
}

/// Every error returned here is a startup error.
async fn run(cli: Cli) -> anyhow::Result<Outcome> {
    match cli.command {
        Command::Service(ServiceCommand::Run(run)) => match run {
            RunCommand::Keygen { config } => service::keygen(load(&config)?, vault()?).await,
            RunCommand::Sign { config } => service::sign(load(&config)?, vault()?).await,
            RunCommand::Api { config } => service::api(load(&config)?, vault()?).await,
            RunCommand::Reshare { target, to, config } => {
                let config = load(&config)?;
                let target = match (target.as_str(), to) {
                    ("committee", _) => ReshareTarget::Committee,
                    (name, Some(to)) => ReshareTarget::Chain {
                        name: name.to_string(),
                        target: to,
                    },
                    (name, None) => anyhow::bail!("migrating {name} needs --to <address>"),
                };
                service::reshare(config, vault()?, target).await
            }
        },
        Command::Service(ServiceCommand::Migrate { direction, config }) => {
            let config = load(&config)?;
            let direction = match direction {
                MigrateDirection::Up => Direction::Up,
                MigrateDirection::Down => Direction::Down,
            };
            migrate::run(&config.database.path, direction)
        }
        Command::Helpers(HelpersCommand::Generate(generate)) => match generate {
            GenerateCommand::Preparams { config } => {
                let config = load(&config)?;
                helpers::preparams(config.backend.socket, vault()?.as_ref()).await
            }
            GenerateCommand::CosmosAccount { prefix } => {
                print_json(&helpers::cosmos_account(&prefix)?);
                Ok(Outcome::Success)
            }
            GenerateCommand::Tls { name } => {
                let spki = helpers::tls_identity(&name, vault()?.as_ref()).await?;
                println!("{spki}");
                Ok(Outcome::Success)
            }
        },
        Command::Helpers(HelpersCommand::Vault(command)) => {
            let store = vault()?;
            match command {
                VaultCommand::Get { key } => {
                    println!("{}", helpers::vault_get(store.as_ref(), &key).await?);
                    Ok(Outcome::Success)
                }
                VaultCommand::Set { key, value } => {
                    helpers::vault_set(store.as_ref(), &key, &value).await
                }
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("cannot print result: {e}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(Outcome::Success) => ExitCode::SUCCESS,
        Ok(Outcome::SessionFailed) => ExitCode::from(2),
        Err(e) => {
            init_tracing("info");
            tracing::error!(error = %format!("{e:#}"), "startup failed");
            ExitCode::from(1)
        }
    }
}
