//! Bit-exact packing of sub-byte codes.
//!
//! Codes are packed LSB-first into a continuous bit stream. Ternary codes
//! use base-3 packing, five trits per byte (3^5 = 243 ≤ 256), which is
//! where the 1.6 bits/weight of the sub-2-bit tier comes from.

use nanoquant_core::NanoquantError;
use thiserror::Error;

/// Errors from unpacking malformed code streams.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PackingError {
    #[error("bit width {0} outside 1..=8")]
    InvalidWidth(u8),
    #[error("stream of {have} bytes too short for {count} codes (needs {need})")]
    Truncated {
        count: usize,
        have: usize,
        need: usize,
    },
    #[error("byte {0} is not a valid trit group")]
    InvalidTritGroup(u8),
}

impl From<PackingError> for NanoquantError {
    fn from(e: PackingError) -> Self {
        NanoquantError::Decompression(e.to_string())
    }
}

/// Bytes needed for `count` codes of `bits` each.
#[must_use]
pub const fn packed_len(count: usize, bits: u8) -> usize {
    (count * bits as usize + 7) / 8
}

/// Bytes needed for `count` trits.
#[must_use]
pub const fn trit_len(count: usize) -> usize {
    (count + 4) / 5
}

/// Bits needed to address `n` distinct values, at least 1.
#[must_use]
pub fn index_bits(n: usize) -> u32 {
    if n <= 2 {
        1
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

/// Pack codes of `bits` width; higher bits of each code are ignored.
#[must_use]
pub fn pack_bits(codes: &[u8], bits: u8) -> Vec<u8> {
    let bits = bits.clamp(1, 8);
    let mask = if bits == 8 { 0xFF } else { (1u16 << bits) as u8 - 1 };
    let mut out = vec![0u8; packed_len(codes.len(), bits)];
    let mut bit_pos = 0usize;
    for &code in codes {
        let value = u16::from(code & mask) << (bit_pos % 8);
        let byte = bit_pos / 8;
        out[byte] |= value as u8;
        if value > 0xFF {
            out[byte + 1] |= (value >> 8) as u8;
        }
        bit_pos += bits as usize;
    }
    out
}

/// Unpack `count` codes of `bits` width.
pub fn unpack_bits(packed: &[u8], bits: u8, count: usize) -> Result<Vec<u8>, PackingError> {
    if !(1..=8).contains(&bits) {
        return Err(PackingError::InvalidWidth(bits));
    }
    let need = packed_len(count, bits);
    if packed.len() < need {
        return Err(PackingError::Truncated {
            count,
            have: packed.len(),
            need,
        });
    }
    let mask = (1u16 << bits) - 1;
    let mut codes = Vec::with_capacity(count);
    let mut bit_pos = 0usize;
    for _ in 0..count {
        let byte = bit_pos / 8;
        let shift = bit_pos % 8;
        let low = u16::from(packed[byte]);
        let high = packed.get(byte + 1).copied().map_or(0, u16::from);
        codes.push((((high << 8) | low) >> shift & mask) as u8);
        bit_pos += bits as usize;
    }
    Ok(codes)
}

/// Pack trits (values 0..=2) five per byte, first trit least significant.
#[must_use]
pub fn pack_trits(trits: &[u8]) -> Vec<u8> {
    trits
        .chunks(5)
        .map(|chunk| {
            chunk
                .iter()
                .rev()
                .fold(0u8, |acc, &t| acc * 3 + t.min(2))
        })
        .collect()
}

/// Unpack `count` trits.
pub fn unpack_trits(packed: &[u8], count: usize) -> Result<Vec<u8>, PackingError> {
    let need = trit_len(count);
    if packed.len() < need {
        return Err(PackingError::Truncated {
            count,
            have: packed.len(),
            need,
        });
    }
    let mut trits = Vec::with_capacity(count);
    for &byte in &packed[..need] {
        if byte >= 243 {
            return Err(PackingError::InvalidTritGroup(byte));
        }
        let mut rest = byte;
        for _ in 0..5 {
            if trits.len() == count {
                break;
            }
            trits.push(rest % 3);
            rest /= 3;
        }
    }
    Ok(trits)
}
