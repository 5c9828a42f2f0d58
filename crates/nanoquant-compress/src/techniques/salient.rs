//! Salient-weight preservation.
//!
//! The top `fraction` of a tensor's weights by calibration importance are
//! moved to a sparse side-table at source precision before any lossy stage
//! runs, so they reconstruct exactly.

use super::{ChainState, StageContext, StageOutcome, Technique, TechniqueKind};
use crate::encoding::{Coverage, SalientTable, StageEncoding};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalientParams {
    /// Fraction of weights to preserve, in [0, 0.5]
    pub fraction: f32,
}

pub struct SalientPreservation {
    params: SalientParams,
}

impl SalientPreservation {
    #[must_use]
    pub fn new(params: SalientParams) -> Self {
        Self { params }
    }
}

/// Number of weights to preserve out of `numel`.
#[must_use]
pub fn salient_count(fraction: f32, numel: usize) -> usize {
    if fraction <= 0.0 || numel == 0 {
        return 0;
    }
    // f32 fractions carry representation noise; 0.001 of 1000 is 1, not 2
    let exact = f64::from(fraction) * numel as f64;
    ((exact - 1e-6).ceil().max(1.0) as usize).min(numel)
}

/// Indices of the `count` most important pending weights, ascending.
///
/// Ties go to the lower index.
#[must_use]
pub fn top_indices(importance: &[f32], coverage: &[Coverage], count: usize) -> Vec<usize> {
    let mut candidates: Vec<usize> = (0..importance.len())
        .filter(|&i| coverage[i] == Coverage::Pending)
        .collect();
    candidates.sort_by(|&a, &b| importance[b].total_cmp(&importance[a]).then(a.cmp(&b)));
    candidates.truncate(count);
    candidates.sort_unstable();
    candidates
}

impl Technique for SalientPreservation {
    fn kind(&self) -> TechniqueKind {
        TechniqueKind::Salient
    }

    fn apply(&self, state: &ChainState, ctx: &StageContext<'_>) -> StageOutcome {
        let tensor = ctx.tensor;
        let count = salient_count(self.params.fraction, tensor.numel());
        if count == 0 {
            return StageOutcome::Ok(state.clone());
        }

        let importance = ctx.signal.weight_importance(&tensor.values);
        let indices = top_indices(&importance, &state.recon.coverage, count);
        let table = SalientTable {
            values: indices
                .iter()
                .map(|&i| tensor.dtype.round_trip(tensor.values[i]))
                .collect(),
            indices: indices.iter().map(|&i| i as u32).collect(),
            value_bits: tensor.dtype.bits(),
        };

        StageOutcome::extend(state, self.kind(), vec![StageEncoding::Salient(table)])
    }
}
