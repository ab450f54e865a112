//! The closed set of supported chains.
//!
//! [`ChainConfig`] is the tagged configuration entry (`type: evm | utxo |
//! zano | ton | solana`); [`Chain`] is the connected adapter. Every
//! capability call on a [`Chain`] is a plain `match` onto the variant.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tss_types::{Deposit, DepositIdentifier, EcdsaSignature};

use crate::evm::{EvmChain, EvmConfig};
use crate::solana::{SolanaChain, SolanaConfig};
use crate::ton::{TonChain, TonConfig};
use crate::utxo::{UtxoChain, UtxoConfig};
use crate::zano::{ZanoChain, ZanoConfig};
use crate::{
    AddressValid, ChainAdapter, Constructor, DepositData, Finalizer, GetDepositData, Result,
    SignedArtifact, SigningContext, SigningRequest,
};

/// Default HTTP timeout for chain RPC calls.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChainConfig {
    Evm(EvmConfig),
    Utxo(UtxoConfig),
    Zano(ZanoConfig),
    Ton(TonConfig),
    Solana(SolanaConfig),
}

impl ChainConfig {
    /// Session tag, as in `SIGN:<name>`.
    pub fn name(&self) -> &str {
        match self {
            Self::Evm(c) => &c.name,
            Self::Utxo(c) => &c.name,
            Self::Zano(c) => &c.name,
            Self::Ton(c) => &c.name,
            Self::Solana(c) => &c.name,
        }
    }

    /// Chain id as it appears in deposit records.
    pub fn id(&self) -> &str {
        match self {
            Self::Evm(c) => &c.id,
            Self::Utxo(c) => &c.id,
            Self::Zano(c) => &c.id,
            Self::Ton(c) => &c.id,
            Self::Solana(c) => &c.id,
        }
    }
}

pub enum Chain {
    Evm(EvmChain),
    Utxo(UtxoChain),
    Zano(ZanoChain),
    Ton(TonChain),
    Solana(SolanaChain),
}

impl Chain {
    /// Build the adapter and its RPC clients. Does not touch the network.
    pub fn connect(config: &ChainConfig) -> Result<Self> {
        Ok(match config {
            ChainConfig::Evm(c) => Self::Evm(EvmChain::connect(c.clone())?),
            ChainConfig::Utxo(c) => Self::Utxo(UtxoChain::connect(c.clone())?),
            ChainConfig::Zano(c) => Self::Zano(ZanoChain::connect(c.clone())?),
            ChainConfig::Ton(c) => Self::Ton(TonChain::connect(c.clone())?),
            ChainConfig::Solana(c) => Self::Solana(SolanaChain::new(c.clone())),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Evm(c) => c.name(),
            Self::Utxo(c) => c.name(),
            Self::Zano(c) => c.name(),
            Self::Ton(c) => c.name(),
            Self::Solana(c) => c.name(),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            Chain::Evm($inner) => $body,
            Chain::Utxo($inner) => $body,
            Chain::Zano($inner) => $body,
            Chain::Ton($inner) => $body,
            Chain::Solana($inner) => $body,
        }
    };
}

impl AddressValid for Chain {
    fn is_valid_address(&self, address: &str) -> bool {
        dispatch!(self, c => c.is_valid_address(address))
    }
}

#[async_trait]
impl GetDepositData for Chain {
    async fn get_deposit_data(&self, id: &DepositIdentifier) -> Result<DepositData> {
        dispatch!(self, c => c.get_deposit_data(id).await)
    }
}

#[async_trait]
impl Constructor for Chain {
    async fn construct(&self, deposit: &Deposit) -> Result<SigningRequest> {
        dispatch!(self, c => c.construct(deposit).await)
    }

    async fn verify(&self, deposit: &Deposit, request: &SigningRequest) -> Result<()> {
        dispatch!(self, c => c.verify(deposit, request).await)
    }

    async fn construct_migration(&self, target: &str) -> Result<SigningRequest> {
        dispatch!(self, c => c.construct_migration(target).await)
    }

    async fn verify_migration(&self, target: &str, request: &SigningRequest) -> Result<()> {
        dispatch!(self, c => c.verify_migration(target, request).await)
    }
}

#[async_trait]
impl Finalizer for Chain {
    fn assemble(
        &self,
        context: &SigningContext,
        signatures: &[EcdsaSignature],
    ) -> Result<SignedArtifact> {
        dispatch!(self, c => c.assemble(context, signatures))
    }

    async fn broadcast(&self, artifact: &SignedArtifact) -> Result<()> {
        dispatch!(self, c => c.broadcast(artifact).await)
    }
}

impl ChainAdapter for Chain {
    fn chain_id(&self) -> &str {
        dispatch!(self, c => c.chain_id())
    }
}
