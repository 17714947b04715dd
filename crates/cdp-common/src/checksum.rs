//! Content hashes for archived payloads
//!
//! Raw records are archived together with the SHA-256 of their JSON encoding so
//! that a re-fetched payload can be compared against what was stored before.

use crate::error::{CommonError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash of the compact JSON encoding of `value`.
///
/// `serde_json::Map` keeps keys sorted unless `preserve_order` is enabled, so
/// two payloads with the same fields hash identically regardless of the order
/// the upstream sent them in.
pub fn payload_checksum<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_hex(&bytes))
}

/// Compare a payload against a previously stored hash
pub fn verify_payload<T: Serialize + ?Sized>(value: &T, expected: &str) -> Result<()> {
    let actual = payload_checksum(value)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
