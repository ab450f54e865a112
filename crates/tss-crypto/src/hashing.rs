//! Hash functions used across the service.
//!
//! ## BLAKE3 modes
//!
//! - [`hash`] - Plain hashing
//! - [`derive_key`] - Key derivation from a registered context string
//! - [`keyed_hash`] - Keyed PRF, used for deterministic proposer election
//!
//! Chain adapters need the chain-native digests as well: [`sha256`],
//! [`keccak256`] and [`hash160`].

use bitcoin::hashes::Hash as _;
use sha2::Digest;
use tiny_keccak::Hasher as _;

/// Registered BLAKE3 context strings. Using any other context is a bug.
pub mod contexts {
    pub const PROPOSER_ELECTION: &str = "tss-svc v1 proposer-election";
    pub const PROPOSAL_SIGNATURE: &str = "tss-svc v1 proposal-signature";

    pub const ALL_CONTEXTS: &[&str] = &[PROPOSER_ELECTION, PROPOSAL_SIGNATURE];
}

/// Compute the BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Derive a key using BLAKE3's key derivation mode.
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    *hasher.finalize().as_bytes()
}

/// Compute a keyed BLAKE3 hash.
pub fn keyed_hash(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    *::blake3::keyed_hash(key, message).as_bytes()
}

/// Verify that a context string is registered.
pub fn is_registered_context(context: &str) -> bool {
    contexts::ALL_CONTEXTS.contains(&context)
}

/// The election hash `H(session_id)`.
///
/// Callers interpret the output as an unsigned big-endian integer.
pub fn election_hash(session_id: &str) -> [u8; 32] {
    let key = derive_key(contexts::PROPOSER_ELECTION, b"");
    keyed_hash(&key, session_id.as_bytes())
}

/// `value mod n` where `value` is a 32-byte big-endian integer.
///
/// Returns 0 when `n` is 0.
pub fn be_mod(value: &[u8; 32], n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let n = u128::from(n);
    let mut acc: u128 = 0;
    for byte in value {
        acc = ((acc << 8) | u128::from(*byte)) % n;
    }
    // acc < n <= u64::MAX
    acc as u64
}

/// SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha2::Sha256::digest(data).into()
}

/// Keccak-256 as used by Ethereum.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut hasher = tiny_keccak::Keccak::v256();
    hasher.update(data);
    hasher.finalize(&mut out);
    out
}

/// `RIPEMD160(SHA256(data))`.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    bitcoin::hashes::hash160::Hash::hash(data).to_byte_array()
}

/// Encode multiple dynamic fields as `LE32(len) || field` pairs.
pub fn encode_multi_field(fields: &[&[u8]]) -> Vec<u8> {
    let total_len: usize = fields.iter().map(|f| 4 + f.len()).sum();
    let mut output = Vec::with_capacity(total_len);
    for field in fields {
        output.extend_from_slice(&(field.len() as u32).to_le_bytes());
        output.extend_from_slice(field);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_context_strings_prefixed() {
        for ctx in contexts::ALL_CONTEXTS {
            assert!(ctx.starts_with("tss-svc v1 "), "bad prefix: {ctx}");
        }
        assert!(is_registered_context(contexts::PROPOSER_ELECTION));
        assert!(!is_registered_context("tss-svc v1 made-up"));
    }

    #[test]
    fn test_election_hash_deterministic() {
        assert_eq!(election_hash("SIGN:evm/42"), election_hash("SIGN:evm/42"));
        assert_ne!(election_hash("SIGN:evm/42"), election_hash("SIGN:evm/43"));
    }

    #[test]
    fn test_election_hash_is_keyed() {
        assert_ne!(election_hash("SIGN:evm/42"), hash(b"SIGN:evm/42"));
    }

    #[test]
    fn test_be_mod_small_values() {
        let mut value = [0u8; 32];
        value[31] = 10;
        assert_eq!(be_mod(&value, 4), 2);
        value[30] = 1; // 266
        assert_eq!(be_mod(&value, 4), 2);
        assert_eq!(be_mod(&value, 7), 266 % 7);
        assert_eq!(be_mod(&value, 0), 0);
    }

    #[test]
    fn test_be_mod_full_width() {
        // 2^256 - 1 = 3 * 5 * 17 * 257 * ...
        let value = [0xFF; 32];
        assert_eq!(be_mod(&value, 3), 0);
        assert_eq!(be_mod(&value, 5), 0);
        assert_eq!(be_mod(&value, 4), 3);
    }

    #[test]
    fn test_sha256_vector() {
        assert_eq!(
            sha256(b"abc"),
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_keccak256_vector() {
        assert_eq!(
            keccak256(b""),
            hex!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470")
        );
    }

    #[test]
    fn test_hash160_length_and_determinism() {
        let a = hash160(b"pubkey");
        assert_eq!(a, hash160(b"pubkey"));
        assert_ne!(a, hash160(b"other"));
    }

    #[test]
    fn test_multi_field_encoding() {
        let encoded = encode_multi_field(&[b"hello", b"world"]);
        assert_eq!(encoded.len(), 4 + 5 + 4 + 5);
        assert_eq!(&encoded[0..4], &5u32.to_le_bytes());
        assert_eq!(&encoded[13..18], b"world");
    }
}
