//! secp256k1 core account keys.
//!
//! Every committee member owns a core account key. Its compressed public key
//! determines the member's [`CoreAddress`]: `bech32(prefix, hash160(pubkey))`.
//! Consensus proposals are signed with this key using recoverable ECDSA, so a
//! receiver can check the signer without any public key configuration by
//! recovering the address and comparing it to the claimed sender.

use bitcoin::bech32::{self, Bech32, Hrp};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use tss_types::{CoreAddress, EcdsaSignature};
use zeroize::Zeroizing;

use crate::hashing;
use crate::{CryptoError, Result};

/// A core account signing key.
///
/// The inner key zeroizes itself on drop.
#[derive(Clone)]
pub struct CoreKey {
    inner: SigningKey,
}

impl std::fmt::Debug for CoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreKey").finish_non_exhaustive()
    }
}

impl CoreKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        Self {
            inner: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Create a key from a 32-byte big-endian scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let inner =
            SigningKey::from_slice(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Create a key from its hex encoding (an optional `0x` prefix is allowed).
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim().trim_start_matches("0x"))
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
        );
        Self::from_bytes(&bytes)
    }

    /// Hex encoding of the secret scalar.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.inner.to_bytes()))
    }

    /// SEC1 compressed public key.
    pub fn public_key(&self) -> [u8; 33] {
        compressed(self.inner.verifying_key())
    }

    /// The bech32 core address under the given human-readable prefix.
    pub fn address(&self, prefix: &str) -> Result<CoreAddress> {
        address_from_public_key(prefix, &self.public_key())
    }

    /// Sign a 32-byte digest, returning a recoverable signature.
    pub fn sign_prehash(&self, digest: &[u8; 32]) -> Result<EcdsaSignature> {
        let (signature, recovery_id) = self
            .inner
            .sign_prehash_recoverable(digest)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        Ok(to_ecdsa(&signature, recovery_id))
    }
}

/// Recover the compressed public key that produced `signature` over `digest`.
pub fn recover_public_key(digest: &[u8; 32], signature: &EcdsaSignature) -> Result<[u8; 33]> {
    let sig = Signature::from_slice(&signature.to_compact())
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let recovery_id = RecoveryId::from_byte(signature.v)
        .ok_or_else(|| CryptoError::InvalidSignature(format!("recovery id {}", signature.v)))?;
    let key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)
        .map_err(|_| CryptoError::SignatureVerification)?;
    Ok(compressed(&key))
}

/// Recover the core address that produced `signature` over `digest`.
pub fn recover_address(
    prefix: &str,
    digest: &[u8; 32],
    signature: &EcdsaSignature,
) -> Result<CoreAddress> {
    let public_key = recover_public_key(digest, signature)?;
    address_from_public_key(prefix, &public_key)
}

/// Verify that `signature` over `digest` was produced by `expected`.
pub fn verify_address(
    prefix: &str,
    digest: &[u8; 32],
    signature: &EcdsaSignature,
    expected: &CoreAddress,
) -> Result<()> {
    let recovered = recover_address(prefix, digest, signature)?;
    if &recovered != expected {
        return Err(CryptoError::SignatureVerification);
    }
    Ok(())
}

/// `bech32(prefix, hash160(pubkey))`.
pub fn address_from_public_key(prefix: &str, public_key: &[u8]) -> Result<CoreAddress> {
    let hrp = Hrp::parse(prefix).map_err(|e| CryptoError::Address(e.to_string()))?;
    let encoded = bech32::encode::<Bech32>(hrp, &hashing::hash160(public_key))
        .map_err(|e| CryptoError::Address(e.to_string()))?;
    Ok(CoreAddress::new(encoded))
}

/// Check that `address` is a well-formed bech32 core address with `prefix`.
pub fn is_valid_address(prefix: &str, address: &str) -> bool {
    let Ok(expected) = Hrp::parse(prefix) else {
        return false;
    };
    match bech32::decode(address) {
        Ok((hrp, data)) => hrp == expected && data.len() == 20,
        Err(_) => false,
    }
}

/// Ethereum address of a SEC1-encoded public key.
pub fn evm_address(public_key: &[u8]) -> Result<[u8; 20]> {
    let key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let uncompressed = key.to_encoded_point(false);
    let digest = hashing::keccak256(&uncompressed.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    Ok(out)
}

fn compressed(key: &VerifyingKey) -> [u8; 33] {
    let point = key.to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(point.as_bytes());
    out
}

fn to_ecdsa(signature: &Signature, recovery_id: RecoveryId) -> EcdsaSignature {
    let bytes = signature.to_bytes();
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&bytes[..32]);
    s.copy_from_slice(&bytes[32..]);
    EcdsaSignature {
        r,
        s,
        v: recovery_id.to_byte(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "bridge";

    #[test]
    fn test_sign_and_recover() {
        let key = CoreKey::generate();
        let digest = hashing::sha256(b"proposal");
        let sig = key.sign_prehash(&digest).expect("sign");
        let recovered = recover_public_key(&digest, &sig).expect("recover");
        assert_eq!(recovered, key.public_key());
    }

    #[test]
    fn test_recover_address_matches() {
        let key = CoreKey::generate();
        let address = key.address(PREFIX).expect("address");
        let digest = hashing::sha256(b"payload");
        let sig = key.sign_prehash(&digest).expect("sign");
        verify_address(PREFIX, &digest, &sig, &address).expect("verify");
    }

    #[test]
    fn test_wrong_digest_recovers_other_address() {
        let key = CoreKey::generate();
        let address = key.address(PREFIX).expect("address");
        let sig = key.sign_prehash(&hashing::sha256(b"a")).expect("sign");
        let result = verify_address(PREFIX, &hashing::sha256(b"b"), &sig, &address);
        assert!(result.is_err());
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = CoreKey::generate();
        let restored = CoreKey::from_hex(&key.to_hex()).expect("from hex");
        assert_eq!(restored.public_key(), key.public_key());
    }

    #[test]
    fn test_from_bytes_rejects_bad_length() {
        assert!(matches!(
            CoreKey::from_bytes(&[1u8; 31]),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 31 })
        ));
        assert!(CoreKey::from_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_address_validation() {
        let key = CoreKey::generate();
        let address = key.address(PREFIX).expect("address");
        assert!(address.as_str().starts_with("bridge1"));
        assert!(is_valid_address(PREFIX, address.as_str()));
        assert!(!is_valid_address("cosmos", address.as_str()));
        assert!(!is_valid_address(PREFIX, "bridge1notanaddress"));
    }

    #[test]
    fn test_evm_address_known_key() {
        // Private key 1 maps to the well-known generator address.
        let mut scalar = [0u8; 32];
        scalar[31] = 1;
        let key = CoreKey::from_bytes(&scalar).expect("key");
        let addr = evm_address(&key.public_key()).expect("evm address");
        assert_eq!(hex::encode(addr), "7e5f4552091a69125d5dfcb7b8c2659029395bdf");
    }
}
