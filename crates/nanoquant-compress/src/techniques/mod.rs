//! Technique library and the chain runner.
//!
//! Each technique reads the current [`ChainState`] (the approximation built
//! by earlier stages, and so the residual left for it) and returns the next
//! state with its own [`StageEncoding`]s appended. [`run_chain`] folds a
//! layer's tensor through the chain:
//!
//! - `StageOutcome::Ok` continues with the new state
//! - `StageOutcome::Degraded` stops the chain; the tensor is stored as-is
//!   and flagged
//! - `StageOutcome::Fatal`, or any element-count change, aborts the run
//!
//! Elements no stage covered are stored at source precision at the end.

pub mod binary;
pub mod low_rank;
pub mod mixed_precision;
pub mod prune;
pub mod salient;
pub mod sketch;
pub mod sub2bit;

pub use binary::{BinaryParams, BinaryParameterization};
pub use low_rank::{LowRankCorrection, LowRankParams};
pub use mixed_precision::{MixedPrecisionAllocation, MixedPrecisionParams};
pub use prune::{BlockPruning, PruneCriterion, PruneParams};
pub use salient::{SalientParams, SalientPreservation};
pub use sketch::{SketchParams, Sketching};
pub use sub2bit::{Sub2BitParams, Sub2BitQuantization};

use crate::calibration::LayerSignal;
use crate::encoding::{Coverage, EncodedTensor, Reconstruction, StageEncoding, TensorBody};
use crate::model::{LayerRole, WeightTensor};
use crate::quantize::QuantizeStats;
use nanoquant_core::ErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Technique identifiers, in canonical chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechniqueKind {
    Salient,
    Prune,
    MixedPrecision,
    #[serde(rename = "sub2bit")]
    Sub2Bit,
    Binary,
    Sketch,
    LowRank,
}

impl TechniqueKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Salient => "salient",
            Self::Prune => "prune",
            Self::MixedPrecision => "mixed_precision",
            Self::Sub2Bit => "sub2bit",
            Self::Binary => "binary",
            Self::Sketch => "sketch",
            Self::LowRank => "low_rank",
        }
    }
}

impl fmt::Display for TechniqueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a tensor fell back to store-as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradeReason {
    pub technique: TechniqueKind,
    pub detail: String,
}

impl DegradeReason {
    #[must_use]
    pub fn new(technique: TechniqueKind, detail: impl Into<String>) -> Self {
        Self {
            technique,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::DegradedCompression
    }
}

impl fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.technique, self.detail)
    }
}

/// Inputs shared by every stage of one tensor's chain.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub tensor: &'a WeightTensor,
    pub signal: &'a LayerSignal,
    pub role: LayerRole,
}

/// Accumulator of the chain fold: encodings so far and their replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    pub stages: Vec<StageEncoding>,
    pub recon: Reconstruction,
    pub applied: Vec<TechniqueKind>,
}

impl ChainState {
    /// Empty state for a tensor.
    #[must_use]
    pub fn new(tensor: &WeightTensor) -> Self {
        let (rows, cols) = tensor.matrix_dims();
        Self::with_dims(rows, cols)
    }

    #[must_use]
    pub fn with_dims(rows: usize, cols: usize) -> Self {
        Self {
            stages: Vec::new(),
            recon: Reconstruction::new(rows, cols),
            applied: Vec::new(),
        }
    }

    /// Original minus approximation.
    #[must_use]
    pub fn residual(&self, original: &[f32]) -> Vec<f32> {
        original
            .iter()
            .zip(&self.recon.values)
            .map(|(w, a)| w - a)
            .collect()
    }

    /// New state with `stages` appended and replayed, credited to `kind`.
    pub fn extend(
        &self,
        kind: TechniqueKind,
        stages: Vec<StageEncoding>,
    ) -> Result<Self, crate::encoding::ReplayError> {
        let mut next = self.clone();
        for stage in stages {
            next.recon.apply(&stage)?;
            next.stages.push(stage);
        }
        next.applied.push(kind);
        Ok(next)
    }
}

/// Result of one technique on one tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Ok(ChainState),
    Degraded(DegradeReason),
    Fatal(String),
}

impl StageOutcome {
    /// Append stages, turning a replay failure into `Fatal`.
    pub(crate) fn extend(
        state: &ChainState,
        kind: TechniqueKind,
        stages: Vec<StageEncoding>,
    ) -> Self {
        if stages.is_empty() {
            return Self::Ok(state.clone());
        }
        match state.extend(kind, stages) {
            Ok(next) => Self::Ok(next),
            Err(e) => Self::Fatal(format!("{kind} produced an inconsistent stage: {e}")),
        }
    }
}

/// A composable compression transform.
pub trait Technique: Send + Sync {
    fn kind(&self) -> TechniqueKind;

    /// Whether the technique needs a real calibration signal.
    fn requires_calibration(&self) -> bool {
        false
    }

    fn apply(&self, state: &ChainState, ctx: &StageContext<'_>) -> StageOutcome;
}

/// One tensor after its chain ran.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedTensor {
    pub encoded: EncodedTensor,
    pub stats: QuantizeStats,
    pub storage_bits: u64,
    pub applied: Vec<TechniqueKind>,
}

impl CompressedTensor {
    /// Store a tensor unchanged at its source element kind.
    pub fn store_as_is(tensor: &WeightTensor) -> Result<Self, String> {
        let bytes = tensor
            .dtype
            .encode_f32(&tensor.values)
            .map_err(|e| e.to_string())?;
        let stored: Vec<f32> = tensor
            .values
            .iter()
            .map(|&v| tensor.dtype.round_trip(v))
            .collect();
        let encoded = EncodedTensor {
            name: tensor.name.clone(),
            shape: tensor.shape.clone(),
            dtype: tensor.dtype,
            body: TensorBody::Raw(bytes),
        };
        Ok(Self {
            storage_bits: encoded.storage_bits(),
            stats: QuantizeStats::compute(&tensor.values, &stored),
            encoded,
            applied: Vec::new(),
        })
    }
}

/// Per-tensor tagged result the orchestrator matches on.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorOutcome {
    Ok(CompressedTensor),
    Degraded(CompressedTensor, DegradeReason),
    Fatal(String),
}

enum Stop {
    Degraded(DegradeReason),
    Fatal(String),
}

/// Fold a tensor through `techniques`.
pub fn run_chain(
    tensor: &WeightTensor,
    signal: &LayerSignal,
    role: LayerRole,
    techniques: &[Box<dyn Technique>],
) -> TensorOutcome {
    let numel = tensor.numel();
    let ctx = StageContext {
        tensor,
        signal,
        role,
    };

    let folded = techniques
        .iter()
        .try_fold(ChainState::new(tensor), |state, technique| {
            match technique.apply(&state, &ctx) {
                StageOutcome::Ok(next) => {
                    if next.recon.numel() != numel || next.recon.coverage.len() != numel {
                        return Err(Stop::Fatal(format!(
                            "{} changed {} from {} to {} elements",
                            technique.kind(),
                            tensor.name,
                            numel,
                            next.recon.numel()
                        )));
                    }
                    debug!(
                        "{}: {} -> {} stages",
                        tensor.name,
                        technique.kind(),
                        next.stages.len()
                    );
                    Ok(next)
                }
                StageOutcome::Degraded(reason) => Err(Stop::Degraded(reason)),
                StageOutcome::Fatal(reason) => Err(Stop::Fatal(reason)),
            }
        });

    let state = match folded {
        Ok(state) => state,
        Err(Stop::Fatal(reason)) => return TensorOutcome::Fatal(reason),
        Err(Stop::Degraded(reason)) => {
            return match CompressedTensor::store_as_is(tensor) {
                Ok(stored) => TensorOutcome::Degraded(stored, reason),
                Err(e) => TensorOutcome::Fatal(e),
            }
        }
    };

    match finish(tensor, state) {
        Ok(compressed) => TensorOutcome::Ok(compressed),
        Err(reason) => TensorOutcome::Fatal(reason),
    }
}

/// Store leftover pending elements densely and package the result.
fn finish(tensor: &WeightTensor, state: ChainState) -> Result<CompressedTensor, String> {
    let pending = state.recon.positions(Coverage::Pending);
    let state = if pending.is_empty() {
        state
    } else {
        let values: Vec<f32> = pending.iter().map(|&i| tensor.values[i]).collect();
        let bytes = tensor.dtype.encode_f32(&values).map_err(|e| e.to_string())?;
        let mut next = state;
        let fill = StageEncoding::Dense {
            dtype: tensor.dtype,
            bytes,
        };
        next.recon.apply(&fill).map_err(|e| e.to_string())?;
        next.stages.push(fill);
        next
    };

    let stats = QuantizeStats::compute(&tensor.values, &state.recon.values);
    let encoded = EncodedTensor {
        name: tensor.name.clone(),
        shape: tensor.shape.clone(),
        dtype: tensor.dtype,
        body: TensorBody::Staged(state.stages),
    };
    Ok(CompressedTensor {
        storage_bits: encoded.storage_bits(),
        stats,
        encoded,
        applied: state.applied,
    })
}
