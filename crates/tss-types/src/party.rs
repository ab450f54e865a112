//! Committee members.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// Stable identity of a committee member.
///
/// A bech32 string derived from the member's secp256k1 account key. Ordering
/// is plain lexicographic string ordering, which every peer uses for
/// deterministic tie-breaks.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoreAddress(String);

impl CoreAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoreAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CoreAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A committee member as loaded from configuration.
///
/// Never mutated after load.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub core_address: CoreAddress,
    /// `host:port` of the member's P2P listener.
    pub endpoint: String,
    /// DER-encoded SubjectPublicKeyInfo pinned for the member's TLS identity.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub tls_public_key: Vec<u8>,
}

/// Sort parties by core address and drop duplicates.
pub fn sorted(mut parties: Vec<Party>) -> Vec<Party> {
    parties.sort_by(|a, b| a.core_address.cmp(&b.core_address));
    parties.dedup_by(|a, b| a.core_address == b.core_address);
    parties
}
