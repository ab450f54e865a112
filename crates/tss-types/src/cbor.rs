//! CBOR serialization helpers.
//!
//! Wire envelopes, consensus proposals and chain signing contexts are all
//! CBOR-encoded (RFC 8949) through these wrappers around [`ciborium`].

use serde::{de::DeserializeOwned, Serialize};

use crate::TypesError;

/// Serialize a value to CBOR bytes.
///
/// # Errors
///
/// Returns [`TypesError::Serialization`] if the value cannot be serialized.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, TypesError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| TypesError::Serialization(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
///
/// # Errors
///
/// Returns [`TypesError::Deserialization`] if the bytes do not decode into `T`.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, TypesError> {
    ciborium::from_reader(data)
        .map_err(|e| TypesError::Deserialization(format!("CBOR deserialization failed: {e}")))
}

/// Deserialize a value from CBOR bytes, naming the target type in the error.
pub fn from_slice_named<T: DeserializeOwned>(
    data: &[u8],
    type_name: &str,
) -> Result<T, TypesError> {
    ciborium::from_reader(data).map_err(|e| {
        TypesError::Deserialization(format!("CBOR deserialization of {type_name} failed: {e}"))
    })
}
