//! Element kinds and half-precision conversions.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{NanoquantError, Result};

/// Numeric element kind of a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point
    Float32,
    /// 16-bit floating point
    Float16,
    /// Brain floating point (16-bit)
    BFloat16,
    /// 64-bit floating point
    Float64,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 8-bit signed integer
    Int8,
    /// 8-bit unsigned integer
    UInt8,
    /// Boolean
    Bool,
}

impl DType {
    /// Size in bytes of a single element.
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Float16 | Self::BFloat16 => 2,
            Self::Float64 | Self::Int64 => 8,
            Self::Int8 | Self::UInt8 | Self::Bool => 1,
        }
    }

    /// Bits per stored element; the baseline all size ratios are measured against.
    #[must_use]
    pub const fn bits(&self) -> u32 {
        (self.size_bytes() * 8) as u32
    }

    /// Whether the kind holds weights the engine can compress.
    #[must_use]
    pub const fn is_float(&self) -> bool {
        matches!(
            self,
            Self::Float32 | Self::Float16 | Self::BFloat16 | Self::Float64
        )
    }

    /// Safetensors dtype tag.
    #[must_use]
    pub const fn as_safetensors(&self) -> &'static str {
        match self {
            Self::Float32 => "F32",
            Self::Float16 => "F16",
            Self::BFloat16 => "BF16",
            Self::Float64 => "F64",
            Self::Int32 => "I32",
            Self::Int64 => "I64",
            Self::Int8 => "I8",
            Self::UInt8 => "U8",
            Self::Bool => "BOOL",
        }
    }

    /// Parse a safetensors dtype tag.
    pub fn from_safetensors(tag: &str) -> Result<Self> {
        match tag {
            "F32" => Ok(Self::Float32),
            "F16" => Ok(Self::Float16),
            "BF16" => Ok(Self::BFloat16),
            "F64" => Ok(Self::Float64),
            "I32" => Ok(Self::Int32),
            "I64" => Ok(Self::Int64),
            "I8" => Ok(Self::Int8),
            "U8" => Ok(Self::UInt8),
            "BOOL" => Ok(Self::Bool),
            other => Err(NanoquantError::UnsupportedFormat(format!(
                "unknown dtype tag: {other}"
            ))),
        }
    }

    /// Decode little-endian element bytes into f32 values.
    ///
    /// Only floating-point kinds decode; F64 values are narrowed.
    pub fn decode_f32(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if !self.is_float() {
            return Err(NanoquantError::UnsupportedFormat(format!(
                "{self:?} tensors carry no compressible weights"
            )));
        }
        let width = self.size_bytes();
        if bytes.len() % width != 0 {
            return Err(NanoquantError::UnsupportedFormat(format!(
                "{} bytes is not a whole number of {self:?} elements",
                bytes.len()
            )));
        }

        let values = match self {
            Self::Float32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Self::Float64 => bytes
                .chunks_exact(8)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                })
                .collect(),
            Self::BFloat16 => bytes
                .chunks_exact(2)
                .map(|c| bf16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                .collect(),
            _ => bytes
                .chunks_exact(2)
                .map(|c| fp16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                .collect(),
        };
        Ok(values)
    }

    /// Encode f32 values as little-endian element bytes of this kind.
    pub fn encode_f32(&self, values: &[f32]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(values.len() * self.size_bytes());
        match self {
            Self::Float32 => values
                .iter()
                .for_each(|v| out.extend_from_slice(&v.to_le_bytes())),
            Self::Float64 => values
                .iter()
                .for_each(|v| out.extend_from_slice(&f64::from(*v).to_le_bytes())),
            Self::BFloat16 => values
                .iter()
                .for_each(|v| out.extend_from_slice(&f32_to_bf16(*v).to_le_bytes())),
            Self::Float16 => values
                .iter()
                .for_each(|v| out.extend_from_slice(&f32_to_fp16(*v).to_le_bytes())),
            other => {
                return Err(NanoquantError::UnsupportedFormat(format!(
                    "cannot encode weights as {other:?}"
                )))
            }
        }
        Ok(out)
    }

    /// Round a value to the nearest representable value of this kind
    /// (truncating conversions, matching `encode_f32`).
    #[must_use]
    pub fn round_trip(&self, value: f32) -> f32 {
        match self {
            Self::BFloat16 => bf16_to_f32(f32_to_bf16(value)),
            Self::Float16 => fp16_to_f32(f32_to_fp16(value)),
            _ => value,
        }
    }
}

/// Metadata about a stored tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    /// Name/key of the tensor
    pub name: String,
    /// Shape of the tensor
    pub shape: Vec<usize>,
    /// Data type
    pub dtype: DType,
    /// Offset in bytes within storage
    pub offset: usize,
    /// Size in bytes
    pub size: usize,
}

impl TensorMeta {
    /// Create new tensor metadata.
    #[must_use]
    pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: DType) -> Self {
        let numel: usize = shape.iter().product();
        let size = numel * dtype.size_bytes();
        Self {
            name: name.into(),
            shape,
            dtype,
            offset: 0,
            size,
        }
    }

    /// Number of elements in the tensor.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Element count of `shape`, or `None` when it does not fit in `usize`.
#[must_use]
pub fn checked_numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Convert bf16 bits to f32.
#[inline]
#[must_use]
pub fn bf16_to_f32(bits: u16) -> f32 {
    bf16::from_bits(bits).to_f32()
}

/// Convert f32 to bf16 bits, rounding to nearest even.
#[inline]
#[must_use]
pub fn f32_to_bf16(value: f32) -> u16 {
    bf16::from_f32(value).to_bits()
}

/// Convert fp16 bits to f32.
#[inline]
#[must_use]
pub fn fp16_to_f32(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

/// Convert f32 to fp16 bits, rounding to nearest even; overflow becomes infinity.
#[inline]
#[must_use]
pub fn f32_to_fp16(value: f32) -> u16 {
    f16::from_f32(value).to_bits()
}
