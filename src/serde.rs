use serde::{de::DeserializeOwned, Serialize};

/// Encode an arbitrary serializable value into a vec.
pub fn encode<T: Serialize + ?Sized>(val: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::encode::to_vec(val)
}

/// Decode an arbitrary value from a slice of bytes.
pub fn decode<T: DeserializeOwned>(input: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::decode::from_slice(input)
}

/// Write a length prefixed field into a buffer.
///
/// Used when hashing several variable length fields together, so that the
/// boundaries between fields cannot be shifted around.
pub fn write_prefixed(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u64).to_be_bytes());
    buf.extend_from_slice(field);
}
