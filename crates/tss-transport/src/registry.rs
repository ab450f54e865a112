//! Static committee roster.

use std::collections::HashMap;

use tss_types::{party, CoreAddress, Party};

/// The immutable set of committee members, sorted by core address.
#[derive(Clone, Debug)]
pub struct Registry {
    parties: Vec<Party>,
    by_address: HashMap<CoreAddress, usize>,
    by_tls_key: HashMap<Vec<u8>, usize>,
}

impl Registry {
    pub fn new(parties: Vec<Party>) -> Self {
        let parties = party::sorted(parties);
        let by_address = parties
            .iter()
            .enumerate()
            .map(|(i, p)| (p.core_address.clone(), i))
            .collect();
        let by_tls_key = parties
            .iter()
            .enumerate()
            .map(|(i, p)| (p.tls_public_key.clone(), i))
            .collect();
        Self {
            parties,
            by_address,
            by_tls_key,
        }
    }

    /// All parties in sorted order.
    pub fn parties(&self) -> &[Party] {
        &self.parties
    }

    pub fn addresses(&self) -> Vec<CoreAddress> {
        self.parties.iter().map(|p| p.core_address.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    pub fn get(&self, address: &CoreAddress) -> Option<&Party> {
        self.by_address.get(address).map(|&i| &self.parties[i])
    }

    pub fn contains(&self, address: &CoreAddress) -> bool {
        self.by_address.contains_key(address)
    }

    /// Position of `address` in the sorted roster.
    pub fn index_of(&self, address: &CoreAddress) -> Option<usize> {
        self.by_address.get(address).copied()
    }

    /// Resolve a pinned TLS public key to its owner.
    pub fn by_tls_key(&self, spki: &[u8]) -> Option<&Party> {
        self.by_tls_key.get(spki).map(|&i| &self.parties[i])
    }

    /// Everyone except `local`.
    pub fn others<'a>(&'a self, local: &'a CoreAddress) -> impl Iterator<Item = &'a Party> + 'a {
        self.parties.iter().filter(move |p| &p.core_address != local)
    }
}
