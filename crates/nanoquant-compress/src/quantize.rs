//! Closed-form group quantizers shared by the technique stages.
//!
//! Every scale and offset is stored as an f16 and quantization uses the
//! stored (rounded) parameter, so the decoder reproduces the encoder's
//! values exactly.
//!
//! - **Affine**: `levels` evenly spaced codes between the group min and max
//!   (offset = min, scale = (max − min) / (levels − 1)). Used for the 2–8 bit
//!   integer tiers and, with three levels, for ternary codes.
//! - **Binary**: `±α` with `α = mean |v|`, the least-squares scale for
//!   fixed signs.
//!
//! A group whose stored parameters cannot carry its values (the scale
//! flushes to zero, or the reconstruction misses by more than one ideal
//! step) is rejected so the caller can keep the tensor as-is.
//!
//! ## Example
//!
//! ```rust
//! use nanoquant_compress::quantize::{quantize_affine, dequantize_affine};
//!
//! let group = quantize_affine(&[-1.0, 0.0, 0.5, 1.0], 4).unwrap();
//! let restored: Vec<f32> = group
//!     .codes
//!     .iter()
//!     .map(|&c| dequantize_affine(c, group.scale, group.offset))
//!     .collect();
//! assert_eq!(restored[0], -1.0);
//! ```

use nanoquant_core::types::{f32_to_fp16, fp16_to_f32};
use thiserror::Error;

/// Default number of consecutive elements sharing one scale.
pub const DEFAULT_GROUP_SIZE: usize = 128;

/// Error types for quantization operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuantizeError {
    #[error("non-finite input value")]
    NonFiniteInput,

    #[error("{0} is not representable as f16")]
    NonFiniteScale(&'static str),

    #[error("{0} underflows f16")]
    ScaleUnderflow(&'static str),

    #[error("group error {max_error:e} exceeds tolerance {tolerance:e}")]
    ExceedsTolerance { max_error: f32, tolerance: f32 },

    #[error("{levels} levels cannot be coded in 8 bits")]
    InvalidLevels { levels: u32 },
}

/// Result type for quantization operations.
pub type Result<T> = std::result::Result<T, QuantizeError>;

/// Store a parameter as f16, rejecting values that overflow.
pub fn to_f16(value: f32, what: &'static str) -> Result<u16> {
    let bits = f32_to_fp16(value);
    if fp16_to_f32(bits).is_finite() {
        Ok(bits)
    } else {
        Err(QuantizeError::NonFiniteScale(what))
    }
}

/// Read back an f16 parameter.
#[inline]
#[must_use]
pub fn from_f16(bits: u16) -> f32 {
    fp16_to_f32(bits)
}

/// One affine-quantized group.
#[derive(Debug, Clone, PartialEq)]
pub struct AffineGroup {
    pub codes: Vec<u8>,
    /// f16 bits
    pub scale: u16,
    /// f16 bits
    pub offset: u16,
}

/// Quantize a group to `levels` evenly spaced values.
pub fn quantize_affine(values: &[f32], levels: u32) -> Result<AffineGroup> {
    if !(2..=256).contains(&levels) {
        return Err(QuantizeError::InvalidLevels { levels });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(QuantizeError::NonFiniteInput);
    }

    if values.is_empty() {
        return Ok(AffineGroup {
            codes: Vec::new(),
            scale: 0,
            offset: 0,
        });
    }
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let offset = to_f16(min, "group offset")?;
    let offset_q = from_f16(offset);
    let range = max - offset_q;
    let scale = if range > 0.0 {
        to_f16(range / (levels - 1) as f32, "group scale")?
    } else {
        0
    };
    let scale_q = from_f16(scale);
    if range > 0.0 && scale_q == 0.0 {
        return Err(QuantizeError::ScaleUnderflow("group scale"));
    }

    let top = (levels - 1) as f32;
    let codes: Vec<u8> = values
        .iter()
        .map(|&v| {
            if scale_q > 0.0 {
                ((v - offset_q) / scale_q).round().clamp(0.0, top) as u8
            } else {
                0
            }
        })
        .collect();

    // One ideal step plus whatever the f16 offset lost on its own.
    let tolerance = (max - min) / top + (offset_q - min).abs();
    let max_error = values
        .iter()
        .zip(&codes)
        .map(|(&v, &c)| (v - (offset_q + f32::from(c) * scale_q)).abs())
        .fold(0.0f32, f32::max);
    if max_error > tolerance {
        return Err(QuantizeError::ExceedsTolerance {
            max_error,
            tolerance,
        });
    }

    Ok(AffineGroup {
        codes,
        scale,
        offset,
    })
}

/// Reconstruct one affine code.
#[inline]
#[must_use]
pub fn dequantize_affine(code: u8, scale: u16, offset: u16) -> f32 {
    from_f16(offset) + f32::from(code) * from_f16(scale)
}

/// Least-squares scale for sign codes: mean |v|, stored as f16.
pub fn binary_scale(values: &[f32]) -> Result<u16> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(QuantizeError::NonFiniteInput);
    }
    if values.is_empty() {
        return Ok(0);
    }
    let mean_abs = (values.iter().map(|v| f64::from(v.abs())).sum::<f64>()
        / values.len() as f64) as f32;
    let bits = to_f16(mean_abs, "binary scale")?;
    let stored = from_f16(bits);
    if mean_abs > 0.0 && stored == 0.0 {
        return Err(QuantizeError::ScaleUnderflow("binary scale"));
    }
    // Subnormal scales keep too few mantissa bits.
    let tolerance = mean_abs / 64.0;
    if (stored - mean_abs).abs() > tolerance {
        return Err(QuantizeError::ExceedsTolerance {
            max_error: (stored - mean_abs).abs(),
            tolerance,
        });
    }
    Ok(bits)
}

/// Error statistics between original and reconstructed values.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuantizeStats {
    /// Mean absolute error.
    pub mae: f64,
    /// Max absolute error.
    pub max_error: f64,
    /// Root mean square error.
    pub rmse: f64,
    /// ‖W − Ŵ‖ / ‖W‖, or 0 when ‖W‖ is 0.
    pub relative_error: f64,
}

impl QuantizeStats {
    /// Compare original and reconstructed values.
    #[must_use]
    pub fn compute(original: &[f32], reconstructed: &[f32]) -> Self {
        if original.is_empty() || original.len() != reconstructed.len() {
            return Self::default();
        }

        let mut sum_abs_error = 0.0f64;
        let mut sum_sq_error = 0.0f64;
        let mut sum_sq_original = 0.0f64;
        let mut max_error = 0.0f64;

        for (&orig, &rec) in original.iter().zip(reconstructed) {
            let error = f64::from(orig - rec).abs();
            sum_abs_error += error;
            sum_sq_error += error * error;
            sum_sq_original += f64::from(orig) * f64::from(orig);
            max_error = max_error.max(error);
        }

        let n = original.len() as f64;
        let relative_error = if sum_sq_original > 0.0 {
            (sum_sq_error / sum_sq_original).sqrt()
        } else {
            0.0
        };

        Self {
            mae: sum_abs_error / n,
            max_error,
            rmse: (sum_sq_error / n).sqrt(),
            relative_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affine_endpoints_are_exact() {
        let values = [-1.0, -0.25, 0.25, 1.0];
        let group = quantize_affine(&values, 4).unwrap();
        assert_eq!(group.codes.first(), Some(&0));
        assert_eq!(group.codes.last(), Some(&3));
        let first = dequantize_affine(group.codes[0], group.scale, group.offset);
        assert_eq!(first, -1.0);
    }

    #[test]
    fn test_affine_error_bounded_by_half_step() {
        let values: Vec<f32> = (0..128).map(|i| (i as f32 * 0.3).sin() * 0.05).collect();
        let group = quantize_affine(&values, 16).unwrap();
        let step = from_f16(group.scale);
        for (&v, &c) in values.iter().zip(&group.codes) {
            let restored = dequantize_affine(c, group.scale, group.offset);
            assert!((v - restored).abs() <= step * 0.5 + 1e-3, "{v} vs {restored}");
        }
    }

    #[test]
    fn test_constant_group_has_zero_scale() {
        let group = quantize_affine(&[0.0; 8], 3).unwrap();
        assert_eq!(group.scale, 0);
        assert!(group.codes.iter().all(|&c| c == 0));
        assert_eq!(dequantize_affine(0, group.scale, group.offset), 0.0);
    }

    #[test]
    fn test_overflowing_range_is_non_finite_scale() {
        let err = quantize_affine(&[-1.0e6, 1.0e6], 4).unwrap_err();
        assert!(matches!(err, QuantizeError::NonFiniteScale(_)));
        assert_eq!(
            quantize_affine(&[f32::NAN], 4).unwrap_err(),
            QuantizeError::NonFiniteInput
        );
    }

    #[test]
    fn test_tiny_group_is_rejected() {
        let tiny: Vec<f32> = (0..128).map(|i| (i as f32 * 0.37).sin() * 1.0e-7).collect();
        let err = quantize_affine(&tiny, 256).unwrap_err();
        assert!(matches!(
            err,
            QuantizeError::ScaleUnderflow(_) | QuantizeError::ExceedsTolerance { .. }
        ));
        assert!(binary_scale(&[1.0e-9, -1.0e-9]).is_err());
    }

    #[test]
    fn test_narrow_group_far_from_zero_is_accepted() {
        let values: Vec<f32> = (0..64).map(|i| 1.0 + i as f32 * 1.0e-4).collect();
        assert!(quantize_affine(&values, 256).is_ok());
        assert!(quantize_affine(&values, 3).is_ok());
    }

    #[test]
    fn test_binary_scale_is_mean_magnitude() {
        let scale = binary_scale(&[0.5, -0.5, 1.0, -1.0]).unwrap();
        assert_eq!(from_f16(scale), 0.75);
        assert_eq!(binary_scale(&[]).unwrap(), 0);
    }

    #[test]
    fn test_stats() {
        let original = vec![1.0, 2.0, 3.0, 4.0];
        let reconstructed = vec![1.1, 1.9, 3.2, 3.8];
        let stats = QuantizeStats::compute(&original, &reconstructed);
        assert!(stats.mae > 0.0);
        assert!((stats.max_error - 0.2).abs() < 1e-5);
        assert!(stats.relative_error > 0.0 && stats.relative_error < 0.1);

        let zero = QuantizeStats::compute(&[0.0; 4], &[0.0; 4]);
        assert_eq!(zero.relative_error, 0.0);
    }
}
