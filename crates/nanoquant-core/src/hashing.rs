//! Hashing: payload checksums, artifact digests and sketch bucket hashing.
//!
//! Checksums and digests are hex strings so they can sit in JSON headers.

use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

/// xxh3-64 of a stored tensor payload, as 16 lowercase hex digits.
#[must_use]
pub fn payload_checksum(data: &[u8]) -> String {
    format!("{:016x}", xxh3_64(data))
}

/// Blake3 digest of a whole artifact, as 64 hex digits.
#[must_use]
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Seeded xxh3-64.
#[inline]
#[must_use]
pub fn hash_with_seed(data: &[u8], seed: u64) -> u64 {
    xxh3_64_with_seed(data, seed)
}

/// Count-sketch hash of an element position: `(bucket, sign)`.
///
/// The low bits pick the bucket, the top bit picks the sign. Stable across
/// platforms since positions are hashed as little-endian u64.
#[inline]
#[must_use]
pub fn sketch_hash(position: u64, seed: u64, buckets: usize) -> (usize, f32) {
    let h = hash_with_seed(&position.to_le_bytes(), seed);
    let bucket = (h % buckets.max(1) as u64) as usize;
    let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
    (bucket, sign)
}
