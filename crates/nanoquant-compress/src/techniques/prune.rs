//! One-shot block pruning to a target sparsity.
//!
//! Weights are grouped into fixed blocks of consecutive elements. Blocks are
//! ranked by the mean importance of their still-pending members and the
//! least important are zeroed until the target count is reached. Ties go to
//! the lower block index. The mask is stored in whichever of bitmap,
//! pruned-list or kept-list form is smallest.
//!
//! Whole blocks are pruned, so the pruned count lands in
//! `[target, target + block - 1]`: the last block taken is never split.

use super::{ChainState, StageContext, StageOutcome, Technique, TechniqueKind};
use crate::encoding::{Coverage, MaskLayout, PruneMask, StageEncoding};
use crate::packing::{index_bits, pack_bits};
use serde::{Deserialize, Serialize};

/// How weights are ranked for pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneCriterion {
    /// |w|
    Magnitude,
    /// |w| scaled by calibrated input activation
    ActivationAware,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneParams {
    /// Fraction of the tensor's weights to zero, in [0, 1)
    pub sparsity: f32,
    /// Consecutive elements per block
    pub block: usize,
    pub criterion: PruneCriterion,
}

pub struct BlockPruning {
    params: PruneParams,
}

impl BlockPruning {
    #[must_use]
    pub fn new(params: PruneParams) -> Self {
        Self { params }
    }
}

impl Technique for BlockPruning {
    fn kind(&self) -> TechniqueKind {
        TechniqueKind::Prune
    }

    fn requires_calibration(&self) -> bool {
        self.params.criterion == PruneCriterion::ActivationAware
    }

    fn apply(&self, state: &ChainState, ctx: &StageContext<'_>) -> StageOutcome {
        let tensor = ctx.tensor;
        let numel = tensor.numel();
        let coverage = &state.recon.coverage;
        let pending = coverage.iter().filter(|c| **c == Coverage::Pending).count();
        let target =
            ((f64::from(self.params.sparsity.clamp(0.0, 1.0)) * numel as f64).round() as usize)
                .min(pending);
        if target == 0 {
            return StageOutcome::Ok(state.clone());
        }

        let importance = match self.params.criterion {
            PruneCriterion::Magnitude => tensor
                .values
                .iter()
                .map(|w| if w.is_finite() { w.abs() } else { f32::MAX })
                .collect(),
            PruneCriterion::ActivationAware => ctx.signal.weight_importance(&tensor.values),
        };

        let block = self.params.block.max(1);
        let n_blocks = numel.div_ceil(block);
        let mut ranked: Vec<(usize, f64, usize)> = (0..n_blocks)
            .filter_map(|b| {
                let range = b * block..((b + 1) * block).min(numel);
                let (sum, count) = range
                    .filter(|&i| coverage[i] == Coverage::Pending)
                    .fold((0.0f64, 0usize), |(s, c), i| {
                        (s + f64::from(importance[i]), c + 1)
                    });
                (count > 0).then(|| (b, sum / count as f64, count))
            })
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut pruned_flags = vec![false; n_blocks];
        let mut pruned = 0usize;
        for (b, _, count) in ranked {
            if pruned >= target {
                break;
            }
            pruned_flags[b] = true;
            pruned += count;
        }

        let mask = PruneMask {
            block: block as u32,
            layout: smallest_layout(&pruned_flags),
        };
        StageOutcome::extend(state, self.kind(), vec![StageEncoding::Prune(mask)])
    }
}

/// Cheapest encoding of per-block pruned flags.
#[must_use]
pub fn smallest_layout(pruned: &[bool]) -> MaskLayout {
    let n_blocks = pruned.len();
    let idx_bits = index_bits(n_blocks) as usize;
    let pruned_list: Vec<u32> = (0..n_blocks).filter(|&b| pruned[b]).map(|b| b as u32).collect();
    let kept = n_blocks - pruned_list.len();

    let bitmap_cost = n_blocks;
    let pruned_cost = pruned_list.len() * idx_bits;
    let kept_cost = kept * idx_bits;

    if pruned_cost <= bitmap_cost && pruned_cost <= kept_cost {
        MaskLayout::Pruned(pruned_list)
    } else if kept_cost < bitmap_cost {
        MaskLayout::Kept((0..n_blocks).filter(|&b| !pruned[b]).map(|b| b as u32).collect())
    } else {
        let flags: Vec<u8> = pruned.iter().map(|&p| u8::from(p)).collect();
        MaskLayout::Bitmap(pack_bits(&flags, 1))
    }
}
