//! SHA-256 digests used for certificate serials and credential cache keys.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// First four digest bytes of `data`, read big-endian.
pub fn sha256_prefix_u32(data: &[u8]) -> u32 {
    let hash = Sha256::digest(data);
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

/// Compare two byte strings without leaking where they first differ.
///
/// Lengths are not secret; unequal lengths return early.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
