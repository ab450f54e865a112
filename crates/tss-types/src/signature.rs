//! Recoverable ECDSA signatures produced by the threshold protocol.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::TypesError;

/// A secp256k1 signature with its recovery id.
#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaSignature {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub r: [u8; 32],
    #[serde_as(as = "serde_with::hex::Hex")]
    pub s: [u8; 32],
    /// Recovery id, 0 or 1.
    pub v: u8,
}

impl EcdsaSignature {
    /// `r || s || v` with the raw recovery id.
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = self.v;
        out
    }

    /// `r || s` without the recovery id.
    pub fn to_compact(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r);
        out[32..].copy_from_slice(&self.s);
        out
    }

    /// Ethereum-style `r || s || (v + 27)`.
    pub fn to_evm_bytes(&self) -> [u8; 65] {
        let mut out = self.to_bytes();
        out[64] = self.v + 27;
        out
    }

    /// Parse `r || s || v`, accepting either a raw (0/1) or EVM-style (27/28) `v`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        if bytes.len() != 65 {
            return Err(TypesError::InvalidSignatureLength(bytes.len()));
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        let v = if bytes[64] >= 27 { bytes[64] - 27 } else { bytes[64] };
        Ok(Self { r, s, v })
    }
}
