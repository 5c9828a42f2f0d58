//! # nanoquant-core
//!
//! Shared building blocks for the nanoquant compression engine:
//! - Error taxonomy ([`NanoquantError`], [`ErrorKind`])
//! - Element kinds and half-precision conversions ([`DType`])
//! - Hashing (xxh3 checksums, blake3 digests, count-sketch hashing)
//! - Payload codecs (zstd, lz4)

pub mod compression;
pub mod error;
pub mod hashing;
pub mod types;

pub use compression::{CodecKind, Compressor, Lz4Compressor, ZstdCompressor};
pub use error::{ErrorKind, NanoquantError, Result};
pub use hashing::{content_digest, hash_with_seed, payload_checksum, sketch_hash};
pub use types::{bf16_to_f32, checked_numel, f32_to_bf16, f32_to_fp16, fp16_to_f32, DType, TensorMeta};
