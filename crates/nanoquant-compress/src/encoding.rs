//! Compressed tensor representation and its replay decoder.
//!
//! A compressed tensor is an ordered list of [`StageEncoding`]s. Decoding
//! replays them over a zero-initialised approximation while tracking what
//! each element is covered by:
//!
//! | Stage       | Replay effect                                                |
//! |-------------|--------------------------------------------------------------|
//! | Salient     | writes exact values, marks `Exact`                           |
//! | Prune       | marks pending members of pruned blocks `Pruned` (value 0)    |
//! | Allocation  | assigns a precision tier to each row                         |
//! | Grouped     | writes affine-dequantized values over its scope, `Encoded`   |
//! | Binary      | writes `±scale` over its scope, `Encoded`                    |
//! | Sketch      | writes `sign · bucket` over its scope, `Encoded`             |
//! | LowRank     | adds `L · R` at `Encoded` positions                          |
//! | Dense       | writes source-precision values for everything still pending |
//!
//! The scope of a tier stage is the pending elements of rows the allocation
//! gave that tier, or every pending element when there is no allocation.
//! The compressor builds its approximation with the same replay, so decoded
//! values are bit-identical to the ones its error metrics were computed on.

use crate::model::matrix_dims;
use crate::packing::{index_bits, unpack_bits, unpack_trits, PackingError};
use crate::quantize::{dequantize_affine, from_f16};
use nanoquant_core::hashing::sketch_hash;
use nanoquant_core::types::{checked_numel, DType};
use nanoquant_core::NanoquantError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Nominal bits per weight of the sketch tier, used for allocation.
pub const SKETCH_NOMINAL_BITS: f64 = 0.25;

/// A replay step found a stage inconsistent with the tensor it decodes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ReplayError(pub String);

impl From<PackingError> for ReplayError {
    fn from(e: PackingError) -> Self {
        Self(e.to_string())
    }
}

impl From<ReplayError> for NanoquantError {
    fn from(e: ReplayError) -> Self {
        NanoquantError::Decompression(e.0)
    }
}

/// Precision tier a row can be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Count-sketch buckets, well under one bit per weight
    Sketch,
    /// Sign bit plus a per-group scale
    Binary,
    /// Three-level affine codes, 1.6 bits packed
    Ternary,
    /// Affine integer codes of 2..=8 bits
    Int(u8),
}

impl Precision {
    /// Bits per weight before group overhead.
    #[must_use]
    pub fn nominal_bits(self) -> f64 {
        match self {
            Self::Sketch => SKETCH_NOMINAL_BITS,
            Self::Binary => 1.0,
            Self::Ternary => 1.6,
            Self::Int(bits) => f64::from(bits),
        }
    }

    /// Check the tier is one the encoders support.
    pub fn validate(self) -> Result<(), String> {
        match self {
            Self::Int(bits) if !(2..=8).contains(&bits) => {
                Err(format!("integer tiers must be 2..=8 bits, got {bits}"))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sketch => f.write_str("sketch"),
            Self::Binary => f.write_str("binary"),
            Self::Ternary => f.write_str("ternary"),
            Self::Int(bits) => write!(f, "int{bits}"),
        }
    }
}

/// What an element of the approximation currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    Pending,
    /// Stored at source precision
    Exact,
    Pruned,
    Encoded,
}

/// Sparse side-table of preserved weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalientTable {
    /// Ascending flat indices
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
    /// Bits each value is charged at (the source element width)
    pub value_bits: u32,
}

/// Which blocks a prune mask removes, in whichever form is smallest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskLayout {
    /// One bit per block, set when pruned
    Bitmap(Vec<u8>),
    /// Indices of pruned blocks
    Pruned(Vec<u32>),
    /// Indices of kept blocks
    Kept(Vec<u32>),
}

/// Block-structured pruning mask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneMask {
    pub block: u32,
    pub layout: MaskLayout,
}

impl PruneMask {
    /// Per-block pruned flags for a tensor of `numel` elements.
    pub fn pruned_blocks(&self, numel: usize) -> Result<Vec<bool>, ReplayError> {
        let block = self.block.max(1) as usize;
        let n_blocks = numel.div_ceil(block);
        let check = |idx: &u32| {
            if (*idx as usize) < n_blocks {
                Ok(*idx as usize)
            } else {
                Err(ReplayError(format!("mask block {idx} out of {n_blocks}")))
            }
        };
        match &self.layout {
            MaskLayout::Bitmap(bits) => {
                let flags = unpack_bits(bits, 1, n_blocks)?;
                Ok(flags.into_iter().map(|f| f == 1).collect())
            }
            MaskLayout::Pruned(list) => {
                let mut flags = vec![false; n_blocks];
                for idx in list {
                    flags[check(idx)?] = true;
                }
                Ok(flags)
            }
            MaskLayout::Kept(list) => {
                let mut flags = vec![true; n_blocks];
                for idx in list {
                    flags[check(idx)?] = false;
                }
                Ok(flags)
            }
        }
    }

    fn storage_bits(&self, numel: usize) -> u64 {
        let n_blocks = numel.div_ceil(self.block.max(1) as usize);
        let idx = u64::from(index_bits(n_blocks));
        match &self.layout {
            MaskLayout::Bitmap(_) => n_blocks as u64,
            MaskLayout::Pruned(list) | MaskLayout::Kept(list) => list.len() as u64 * idx,
        }
    }
}

/// Per-row precision tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAllocation {
    /// Tiers in ascending nominal bits
    pub choices: Vec<Precision>,
    /// Index into `choices` for every row
    pub per_row: Vec<u8>,
}

impl ChannelAllocation {
    fn storage_bits(&self) -> u64 {
        if self.choices.len() <= 1 {
            0
        } else {
            self.per_row.len() as u64 * u64::from(index_bits(self.choices.len()))
        }
    }
}

/// Affine group codes for an integer or ternary tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCodes {
    pub precision: Precision,
    pub group_size: u32,
    pub count: u32,
    /// Packed bit stream (integer tiers) or trit stream (ternary)
    pub codes: Vec<u8>,
    /// f16 bits, one per group
    pub scales: Vec<u16>,
    /// f16 bits, one per group
    pub offsets: Vec<u16>,
}

impl GroupCodes {
    fn decode(&self) -> Result<Vec<f32>, ReplayError> {
        let count = self.count as usize;
        let codes = match self.precision {
            Precision::Ternary => unpack_trits(&self.codes, count)?,
            Precision::Int(bits) => unpack_bits(&self.codes, bits, count)?,
            other => {
                return Err(ReplayError(format!("{other} is not an affine tier")));
            }
        };
        let group = self.group_size.max(1) as usize;
        let groups = count.div_ceil(group);
        if self.scales.len() != groups || self.offsets.len() != groups {
            return Err(ReplayError(format!(
                "{} values need {groups} groups, got {} scales",
                count,
                self.scales.len()
            )));
        }
        Ok(codes
            .iter()
            .enumerate()
            .map(|(k, &c)| dequantize_affine(c, self.scales[k / group], self.offsets[k / group]))
            .collect())
    }
}

/// Sign codes with a per-group scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryCodes {
    pub group_size: u32,
    pub count: u32,
    /// Packed sign bits, 1 for non-negative
    pub signs: Vec<u8>,
    /// f16 bits, one per group
    pub scales: Vec<u16>,
}

impl BinaryCodes {
    fn decode(&self) -> Result<Vec<f32>, ReplayError> {
        let count = self.count as usize;
        let signs = unpack_bits(&self.signs, 1, count)?;
        let group = self.group_size.max(1) as usize;
        if self.scales.len() != count.div_ceil(group) {
            return Err(ReplayError("binary scale count mismatch".to_string()));
        }
        Ok(signs
            .iter()
            .enumerate()
            .map(|(k, &s)| {
                let alpha = from_f16(self.scales[k / group]);
                if s == 1 {
                    alpha
                } else {
                    -alpha
                }
            })
            .collect())
    }
}

/// Buckets a sketch block of `len` elements gets at `bits_per_weight`.
#[must_use]
pub fn buckets_for(len: usize, bits_per_weight: f32) -> usize {
    let bits = f64::from(bits_per_weight.max(0.0)) * len as f64;
    ((bits / 16.0).ceil() as usize).max(1)
}

/// Count-sketch buckets over fixed-size blocks of the covered elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SketchCodes {
    pub seed: u64,
    pub block: u32,
    pub bits_per_weight: f32,
    pub count: u32,
    /// f16 bits, all blocks concatenated
    pub buckets: Vec<u16>,
}

impl SketchCodes {
    fn decode(&self, positions: &[usize]) -> Result<Vec<f32>, ReplayError> {
        let block = self.block.max(1) as usize;
        let mut out = Vec::with_capacity(positions.len());
        let mut base = 0usize;
        for chunk in positions.chunks(block) {
            let n = buckets_for(chunk.len(), self.bits_per_weight);
            let buckets = self
                .buckets
                .get(base..base + n)
                .ok_or_else(|| ReplayError("sketch bucket table too short".to_string()))?;
            for &pos in chunk {
                let (bucket, sign) = sketch_hash(pos as u64, self.seed, n);
                out.push(sign * from_f16(buckets[bucket]));
            }
            base += n;
        }
        if base != self.buckets.len() {
            return Err(ReplayError("sketch bucket table too long".to_string()));
        }
        Ok(out)
    }
}

/// Rank-r correction `L · R` with f16 factors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowRankFactors {
    pub rows: u32,
    pub cols: u32,
    pub rank: u32,
    /// rows × rank, singular values folded in
    pub left: Vec<u16>,
    /// rank × cols
    pub right: Vec<u16>,
}

/// One step of a compressed tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageEncoding {
    Salient(SalientTable),
    Prune(PruneMask),
    Allocation(ChannelAllocation),
    Grouped(GroupCodes),
    Binary(BinaryCodes),
    Sketch(SketchCodes),
    LowRank(LowRankFactors),
    /// Remaining pending elements at source precision
    Dense { dtype: DType, bytes: Vec<u8> },
}

impl StageEncoding {
    /// Storage cost for a tensor of `numel` elements.
    #[must_use]
    pub fn storage_bits(&self, numel: usize) -> u64 {
        match self {
            Self::Salient(t) => {
                t.indices.len() as u64 * u64::from(t.value_bits + index_bits(numel))
            }
            Self::Prune(m) => m.storage_bits(numel),
            Self::Allocation(a) => a.storage_bits(),
            Self::Grouped(g) => g.codes.len() as u64 * 8 + g.scales.len() as u64 * 32,
            Self::Binary(b) => b.signs.len() as u64 * 8 + b.scales.len() as u64 * 16,
            Self::Sketch(s) => s.buckets.len() as u64 * 16,
            Self::LowRank(f) => {
                (u64::from(f.rows) + u64::from(f.cols)) * u64::from(f.rank) * 16
            }
            Self::Dense { bytes, .. } => bytes.len() as u64 * 8,
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Salient(_) => "salient",
            Self::Prune(_) => "prune",
            Self::Allocation(_) => "allocation",
            Self::Grouped(_) => "grouped",
            Self::Binary(_) => "binary",
            Self::Sketch(_) => "sketch",
            Self::LowRank(_) => "low_rank",
            Self::Dense { .. } => "dense",
        }
    }
}

/// Approximation being replayed, with per-element coverage.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f32>,
    pub coverage: Vec<Coverage>,
    pub allocation: Option<ChannelAllocation>,
}

impl Reconstruction {
    #[must_use]
    pub fn new(rows: usize, cols: usize) -> Self {
        let numel = rows * cols;
        Self {
            rows,
            cols,
            values: vec![0.0; numel],
            coverage: vec![Coverage::Pending; numel],
            allocation: None,
        }
    }

    /// Like [`Reconstruction::new`] for dimensions read from an artifact:
    /// overflow or a failed allocation is an error instead of an abort.
    pub fn try_new(rows: usize, cols: usize) -> Result<Self, ReplayError> {
        let numel = rows
            .checked_mul(cols)
            .ok_or_else(|| ReplayError(format!("{rows}x{cols} overflows")))?;
        let mut values = Vec::new();
        let mut coverage = Vec::new();
        values
            .try_reserve_exact(numel)
            .and_then(|()| coverage.try_reserve_exact(numel))
            .map_err(|e| ReplayError(format!("cannot allocate {rows}x{cols}: {e}")))?;
        values.resize(numel, 0.0);
        coverage.resize(numel, Coverage::Pending);
        Ok(Self {
            rows,
            cols,
            values,
            coverage,
            allocation: None,
        })
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.values.len()
    }

    /// Positions with the given coverage, ascending.
    #[must_use]
    pub fn positions(&self, coverage: Coverage) -> Vec<usize> {
        self.coverage
            .iter()
            .enumerate()
            .filter_map(|(i, c)| (*c == coverage).then_some(i))
            .collect()
    }

    /// Pending positions a tier stage of `precision` covers, ascending.
    #[must_use]
    pub fn scope(&self, precision: Precision) -> Vec<usize> {
        let Some(allocation) = &self.allocation else {
            return self.positions(Coverage::Pending);
        };
        let Some(tier) = allocation.choices.iter().position(|p| *p == precision) else {
            return Vec::new();
        };
        let cols = self.cols.max(1);
        self.coverage
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let row_tier = allocation.per_row.get(i / cols).copied().map(usize::from);
                (*c == Coverage::Pending && row_tier == Some(tier)).then_some(i)
            })
            .collect()
    }

    /// Replay one stage.
    pub fn apply(&mut self, stage: &StageEncoding) -> Result<(), ReplayError> {
        let numel = self.numel();
        match stage {
            StageEncoding::Salient(table) => {
                if table.indices.len() != table.values.len() {
                    return Err(ReplayError("salient table length mismatch".to_string()));
                }
                for (&idx, &value) in table.indices.iter().zip(&table.values) {
                    let idx = idx as usize;
                    if idx >= numel {
                        return Err(ReplayError(format!("salient index {idx} out of {numel}")));
                    }
                    self.values[idx] = value;
                    self.coverage[idx] = Coverage::Exact;
                }
            }
            StageEncoding::Prune(mask) => {
                let block = mask.block.max(1) as usize;
                for (b, pruned) in mask.pruned_blocks(numel)?.into_iter().enumerate() {
                    if !pruned {
                        continue;
                    }
                    let end = ((b + 1) * block).min(numel);
                    for i in b * block..end {
                        if self.coverage[i] == Coverage::Pending {
                            self.coverage[i] = Coverage::Pruned;
                            self.values[i] = 0.0;
                        }
                    }
                }
            }
            StageEncoding::Allocation(allocation) => {
                if allocation.per_row.len() != self.rows {
                    return Err(ReplayError(format!(
                        "allocation covers {} rows, tensor has {}",
                        allocation.per_row.len(),
                        self.rows
                    )));
                }
                if allocation
                    .per_row
                    .iter()
                    .any(|&t| usize::from(t) >= allocation.choices.len())
                {
                    return Err(ReplayError("allocation tier out of range".to_string()));
                }
                self.allocation = Some(allocation.clone());
            }
            StageEncoding::Grouped(codes) => {
                let scope = self.scope(codes.precision);
                self.write_scope(&scope, codes.decode()?)?;
            }
            StageEncoding::Binary(codes) => {
                let scope = self.scope(Precision::Binary);
                self.write_scope(&scope, codes.decode()?)?;
            }
            StageEncoding::Sketch(codes) => {
                let scope = self.scope(Precision::Sketch);
                if scope.len() != codes.count as usize {
                    return Err(ReplayError(format!(
                        "sketch codes {} values, scope has {}",
                        codes.count,
                        scope.len()
                    )));
                }
                let values = codes.decode(&scope)?;
                self.write_scope(&scope, values)?;
            }
            StageEncoding::LowRank(factors) => self.add_low_rank(factors)?,
            StageEncoding::Dense { dtype, bytes } => {
                let scope = self.positions(Coverage::Pending);
                let values = dtype
                    .decode_f32(bytes)
                    .map_err(|e| ReplayError(e.to_string()))?;
                if values.len() != scope.len() {
                    return Err(ReplayError(format!(
                        "dense fill has {} values for {} pending elements",
                        values.len(),
                        scope.len()
                    )));
                }
                for (&i, v) in scope.iter().zip(values) {
                    self.values[i] = v;
                    self.coverage[i] = Coverage::Exact;
                }
            }
        }
        Ok(())
    }

    fn write_scope(&mut self, scope: &[usize], values: Vec<f32>) -> Result<(), ReplayError> {
        if scope.len() != values.len() {
            return Err(ReplayError(format!(
                "stage codes {} values, scope has {}",
                values.len(),
                scope.len()
            )));
        }
        for (&i, v) in scope.iter().zip(values) {
            self.values[i] = v;
            self.coverage[i] = Coverage::Encoded;
        }
        Ok(())
    }

    fn add_low_rank(&mut self, f: &LowRankFactors) -> Result<(), ReplayError> {
        let (rows, cols, rank) = (f.rows as usize, f.cols as usize, f.rank as usize);
        if rows != self.rows || cols != self.cols {
            return Err(ReplayError(format!(
                "low-rank factors are {rows}x{cols}, tensor is {}x{}",
                self.rows, self.cols
            )));
        }
        if f.left.len() != rows * rank || f.right.len() != rank * cols {
            return Err(ReplayError("low-rank factor size mismatch".to_string()));
        }
        let left: Vec<f32> = f.left.iter().map(|&b| from_f16(b)).collect();
        let right: Vec<f32> = f.right.iter().map(|&b| from_f16(b)).collect();
        for i in 0..self.numel() {
            if self.coverage[i] != Coverage::Encoded {
                continue;
            }
            let (r, c) = (i / cols, i % cols);
            let correction: f32 = (0..rank).map(|k| left[r * rank + k] * right[k * cols + c]).sum();
            self.values[i] += correction;
        }
        Ok(())
    }
}

/// Stored form of one tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorBody {
    /// Uncompressed at the source element kind
    Raw(Vec<u8>),
    Staged(Vec<StageEncoding>),
}

/// A tensor in compressed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub body: TensorBody,
}

impl EncodedTensor {
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    #[must_use]
    pub fn is_raw(&self) -> bool {
        matches!(self.body, TensorBody::Raw(_))
    }

    /// Storage cost of this representation.
    #[must_use]
    pub fn storage_bits(&self) -> u64 {
        let numel = self.numel();
        match &self.body {
            TensorBody::Raw(bytes) => bytes.len() as u64 * 8,
            TensorBody::Staged(stages) => stages.iter().map(|s| s.storage_bits(numel)).sum(),
        }
    }

    /// Reconstruct dense f32 values.
    pub fn decode(&self) -> Result<Vec<f32>, NanoquantError> {
        let numel = checked_numel(&self.shape).ok_or_else(|| {
            NanoquantError::Decompression(format!(
                "{}: shape {:?} overflows",
                self.name, self.shape
            ))
        })?;
        let values = match &self.body {
            TensorBody::Raw(bytes) => self.dtype.decode_f32(bytes)?,
            TensorBody::Staged(stages) => {
                let (rows, cols) = matrix_dims(&self.shape);
                let mut recon = Reconstruction::try_new(rows, cols)?;
                for stage in stages {
                    recon.apply(stage)?;
                }
                recon.values
            }
        };
        if values.len() != numel {
            return Err(NanoquantError::Decompression(format!(
                "{}: decoded {} values for shape {:?}",
                self.name,
                values.len(),
                self.shape
            )));
        }
        Ok(values)
    }
}
