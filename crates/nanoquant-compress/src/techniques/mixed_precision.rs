//! Mixed-precision bit allocation.
//!
//! Each row (output channel) gets a precision tier from a small discrete
//! set. Ideal bits are proportional to the row's calibration importance
//! with the mean pinned to the budget; every row starts at the largest tier
//! not above its ideal, then rows are downgraded (least important first) or
//! upgraded (most important first) until the average over still-pending
//! weights meets the budget. Ties are broken by row index.
//!
//! The allocation itself is stored, and the integer tiers (2–8 bits) are
//! encoded here with group-wise affine codes. Ternary, binary and sketch
//! tiers are left pending for their own stages.

use super::{ChainState, DegradeReason, StageContext, StageOutcome, Technique, TechniqueKind};
use crate::encoding::{ChannelAllocation, Coverage, GroupCodes, Precision, StageEncoding};
use crate::packing::{pack_bits, pack_trits};
use crate::quantize::{quantize_affine, AffineGroup, QuantizeError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const BUDGET_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedPrecisionParams {
    /// Target average bits per pending weight
    pub avg_bits: f32,
    pub choices: Vec<Precision>,
    pub group_size: usize,
}

impl MixedPrecisionParams {
    /// Tiers sorted by nominal bits, duplicates removed.
    #[must_use]
    pub fn sorted_choices(&self) -> Vec<Precision> {
        let mut choices = self.choices.clone();
        choices.sort_by(|a, b| a.nominal_bits().total_cmp(&b.nominal_bits()));
        choices.dedup();
        choices
    }
}

pub struct MixedPrecisionAllocation {
    params: MixedPrecisionParams,
    choices: Vec<Precision>,
}

impl MixedPrecisionAllocation {
    #[must_use]
    pub fn new(params: MixedPrecisionParams) -> Self {
        let choices = params.sorted_choices();
        Self { params, choices }
    }
}

/// Assign a tier index to each row.
///
/// `choices` must be sorted ascending. Rows with no pending weights get
/// tier 0.
#[must_use]
pub fn allocate(
    row_importance: &[f32],
    row_counts: &[usize],
    choices: &[Precision],
    avg_bits: f64,
) -> Vec<u8> {
    let rows = row_counts.len();
    let bits: Vec<f64> = choices.iter().map(|p| p.nominal_bits()).collect();
    let total: usize = row_counts.iter().sum();
    if total == 0 || bits.is_empty() {
        return vec![0; rows];
    }

    let importance = |r: usize| {
        row_importance
            .get(r)
            .copied()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map_or(0.0, f64::from)
    };
    let mean = (0..rows)
        .map(|r| importance(r) * row_counts[r] as f64)
        .sum::<f64>()
        / total as f64;

    let mut tier: Vec<usize> = (0..rows)
        .map(|r| {
            if row_counts[r] == 0 {
                return 0;
            }
            let ideal = if mean > 0.0 {
                avg_bits * importance(r) / mean
            } else {
                avg_bits
            };
            bits.iter()
                .rposition(|&b| b <= ideal + BUDGET_EPSILON)
                .unwrap_or(0)
        })
        .collect();

    let budget = avg_bits * total as f64;
    let mut used: f64 = (0..rows).map(|r| bits[tier[r]] * row_counts[r] as f64).sum();

    let mut order: Vec<usize> = (0..rows).filter(|&r| row_counts[r] > 0).collect();
    order.sort_by(|&a, &b| importance(b).total_cmp(&importance(a)).then(a.cmp(&b)));

    if used > budget + BUDGET_EPSILON {
        loop {
            let mut changed = false;
            for &r in order.iter().rev() {
                if used <= budget + BUDGET_EPSILON {
                    break;
                }
                if tier[r] > 0 {
                    used -= (bits[tier[r]] - bits[tier[r] - 1]) * row_counts[r] as f64;
                    tier[r] -= 1;
                    changed = true;
                }
            }
            if !changed || used <= budget + BUDGET_EPSILON {
                break;
            }
        }
    } else {
        loop {
            let mut changed = false;
            for &r in &order {
                if tier[r] + 1 < bits.len() {
                    let delta = (bits[tier[r] + 1] - bits[tier[r]]) * row_counts[r] as f64;
                    if used + delta <= budget + BUDGET_EPSILON {
                        used += delta;
                        tier[r] += 1;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    tier.into_iter().map(|t| t as u8).collect()
}

/// Group-wise affine codes for an integer or ternary tier.
pub(crate) fn encode_grouped(
    values: &[f32],
    precision: Precision,
    group_size: usize,
) -> Result<GroupCodes, QuantizeError> {
    let levels = match precision {
        Precision::Ternary => 3,
        Precision::Int(bits) if (1..=8).contains(&bits) => 1u32 << bits,
        _ => return Err(QuantizeError::InvalidLevels { levels: 0 }),
    };
    let group = group_size.max(1);
    let groups: Vec<AffineGroup> = values
        .par_chunks(group)
        .map(|chunk| quantize_affine(chunk, levels))
        .collect::<Result<_, _>>()?;

    let codes: Vec<u8> = groups.iter().flat_map(|g| g.codes.iter().copied()).collect();
    let packed = match precision {
        Precision::Int(bits) => pack_bits(&codes, bits),
        _ => pack_trits(&codes),
    };

    Ok(GroupCodes {
        precision,
        group_size: group as u32,
        count: values.len() as u32,
        codes: packed,
        scales: groups.iter().map(|g| g.scale).collect(),
        offsets: groups.iter().map(|g| g.offset).collect(),
    })
}

impl Technique for MixedPrecisionAllocation {
    fn kind(&self) -> TechniqueKind {
        TechniqueKind::MixedPrecision
    }

    fn apply(&self, state: &ChainState, ctx: &StageContext<'_>) -> StageOutcome {
        let recon = &state.recon;
        let cols = recon.cols.max(1);
        let mut row_counts = vec![0usize; recon.rows];
        for (i, c) in recon.coverage.iter().enumerate() {
            if *c == Coverage::Pending {
                row_counts[i / cols] += 1;
            }
        }
        if row_counts.iter().all(|&c| c == 0) || self.choices.is_empty() {
            return StageOutcome::Ok(state.clone());
        }

        let per_row = allocate(
            &ctx.signal.channel_scores,
            &row_counts,
            &self.choices,
            f64::from(self.params.avg_bits),
        );
        let allocation = StageEncoding::Allocation(ChannelAllocation {
            choices: self.choices.clone(),
            per_row,
        });

        let mut probe = recon.clone();
        if let Err(e) = probe.apply(&allocation) {
            return StageOutcome::Fatal(format!("allocation does not fit {}: {e}", ctx.tensor.name));
        }

        let residual = state.residual(&ctx.tensor.values);
        let mut stages = vec![allocation];
        for &precision in self.choices.iter().filter(|p| matches!(p, Precision::Int(_))) {
            let scope = probe.scope(precision);
            if scope.is_empty() {
                continue;
            }
            let values: Vec<f32> = scope.iter().map(|&i| residual[i]).collect();
            match encode_grouped(&values, precision, self.params.group_size) {
                Ok(codes) => stages.push(StageEncoding::Grouped(codes)),
                Err(e) => {
                    return StageOutcome::Degraded(DegradeReason::new(
                        self.kind(),
                        format!("{precision} tier: {e}"),
                    ))
                }
            }
        }

        StageOutcome::extend(state, self.kind(), stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::LayerSignal;
    use crate::model::{LayerRole, WeightTensor};
    use nanoquant_core::DType;

    const TIERS: [Precision; 3] = [Precision::Int(2), Precision::Int(4), Precision::Int(8)];

    fn average(tiers: &[u8], counts: &[usize], choices: &[Precision]) -> f64 {
        let total: usize = counts.iter().sum();
        tiers
            .iter()
            .zip(counts)
            .map(|(&t, &c)| choices[t as usize].nominal_bits() * c as f64)
            .sum::<f64>()
            / total as f64
    }

    #[test]
    fn test_uniform_importance_meets_budget() {
        let counts = vec![10; 8];
        let tiers = allocate(&[0.125; 8], &counts, &TIERS, 3.0);
        let avg = average(&tiers, &counts, &TIERS);
        assert!(avg <= 3.0 + 1e-9, "average {avg}");
        assert!(avg >= 2.5);
        // Extra bits go to the lowest row indices first
        assert_eq!(tiers[0], 1);
        assert_eq!(tiers[7], 0);
    }

    #[test]
    fn test_important_rows_get_more_bits() {
        let counts = vec![10; 4];
        let tiers = allocate(&[0.7, 0.1, 0.1, 0.1], &counts, &TIERS, 3.0);
        assert!(tiers[0] > tiers[1]);
        assert!(average(&tiers, &counts, &TIERS) <= 3.0 + 1e-9);
    }

    #[test]
    fn test_over_budget_downgrades_least_important() {
        let choices = [Precision::Int(4), Precision::Int(8)];
        let counts = vec![10; 2];
        // Budget below the smallest tier: everything ends at the floor
        let tiers = allocate(&[0.5, 0.5], &counts, &choices, 2.0);
        assert_eq!(tiers, vec![0, 0]);
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let scores = [0.3, 0.1, 0.3, 0.2, 0.1];
        let counts = vec![7, 3, 7, 5, 0];
        let a = allocate(&scores, &counts, &TIERS, 4.0);
        let b = allocate(&scores, &counts, &TIERS, 4.0);
        assert_eq!(a, b);
        assert_eq!(a[4], 0);
    }

    #[test]
    fn test_encodes_all_integer_tiers() {
        let values: Vec<f32> = (0..512).map(|i| (i as f32 * 0.05).sin() * 0.1).collect();
        let tensor = WeightTensor::new("w", vec![4, 128], DType::BFloat16, values).unwrap();
        let signal = LayerSignal::uniform(4, 128);
        let ctx = StageContext {
            tensor: &tensor,
            signal: &signal,
            role: LayerRole::Projection,
        };
        let technique = MixedPrecisionAllocation::new(MixedPrecisionParams {
            avg_bits: 5.0,
            choices: vec![Precision::Int(8), Precision::Int(4)],
            group_size: 128,
        });
        let StageOutcome::Ok(state) = technique.apply(&ChainState::new(&tensor), &ctx) else {
            panic!("expected Ok");
        };
        assert!(state.recon.positions(Coverage::Pending).is_empty());
        assert_eq!(state.stages.len(), 3);
        let bits: u64 = state.stages.iter().map(|s| s.storage_bits(512)).sum();
        // 1 row at 8 bits, 3 at 4 bits, 4 groups, 4 one-bit row tags
        assert_eq!(bits, 128 * 8 + 384 * 4 + 4 * 32 + 4);
    }

    #[test]
    fn test_non_finite_weights_degrade() {
        let mut values = vec![0.1f32; 16];
        values[3] = f32::INFINITY;
        let tensor = WeightTensor::new("w", vec![2, 8], DType::Float32, values).unwrap();
        let signal = LayerSignal::uniform(2, 8);
        let ctx = StageContext {
            tensor: &tensor,
            signal: &signal,
            role: LayerRole::Projection,
        };
        let technique = MixedPrecisionAllocation::new(MixedPrecisionParams {
            avg_bits: 4.0,
            choices: vec![Precision::Int(4)],
            group_size: 8,
        });
        assert!(matches!(
            technique.apply(&ChainState::new(&tensor), &ctx),
            StageOutcome::Degraded(_)
        ));
    }
}
