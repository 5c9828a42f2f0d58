//! Count-sketch encoding for the sub-1-bit tier.
//!
//! Covered weights are split into blocks; within a block every weight hashes
//! (by its flat position) to one of a few shared f16 buckets with a ±1 sign.
//! A bucket stores the mean of `sign · w` over its members, and a weight is
//! reconstructed as `sign · bucket`. Only the buckets are stored, so the
//! cost is `16 · buckets / block` bits per weight.

use super::{ChainState, DegradeReason, StageContext, StageOutcome, Technique, TechniqueKind};
use crate::encoding::{buckets_for, Precision, SketchCodes, StageEncoding};
use crate::quantize::{to_f16, QuantizeError};
use nanoquant_core::hashing::sketch_hash;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Seed mixed into every position hash unless overridden.
pub const DEFAULT_SKETCH_SEED: u64 = 0x6e71_736b;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SketchParams {
    pub bits_per_weight: f32,
    /// Weights per independently sketched block
    pub block: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    DEFAULT_SKETCH_SEED
}

pub struct Sketching {
    params: SketchParams,
}

impl Sketching {
    #[must_use]
    pub fn new(params: SketchParams) -> Self {
        Self { params }
    }
}

fn sketch_block(
    positions: &[usize],
    values: &[f32],
    seed: u64,
    bits_per_weight: f32,
) -> Result<Vec<u16>, QuantizeError> {
    let n = buckets_for(positions.len(), bits_per_weight);
    let mut sums = vec![0.0f64; n];
    let mut counts = vec![0u32; n];
    for (&pos, &v) in positions.iter().zip(values) {
        if !v.is_finite() {
            return Err(QuantizeError::NonFiniteInput);
        }
        let (bucket, sign) = sketch_hash(pos as u64, seed, n);
        sums[bucket] += f64::from(sign * v);
        counts[bucket] += 1;
    }
    sums.iter()
        .zip(&counts)
        .map(|(&sum, &count)| {
            let mean = if count > 0 { sum / f64::from(count) } else { 0.0 };
            to_f16(mean as f32, "sketch bucket")
        })
        .collect()
}

impl Technique for Sketching {
    fn kind(&self) -> TechniqueKind {
        TechniqueKind::Sketch
    }

    fn apply(&self, state: &ChainState, ctx: &StageContext<'_>) -> StageOutcome {
        let scope = state.recon.scope(Precision::Sketch);
        if scope.is_empty() {
            return StageOutcome::Ok(state.clone());
        }
        let residual = state.residual(&ctx.tensor.values);
        let values: Vec<f32> = scope.iter().map(|&i| residual[i]).collect();
        let block = self.params.block.max(1);
        let seed = self.params.seed;
        let bpw = self.params.bits_per_weight;

        let blocks: Result<Vec<Vec<u16>>, QuantizeError> = scope
            .par_chunks(block)
            .zip(values.par_chunks(block))
            .map(|(positions, vals)| sketch_block(positions, vals, seed, bpw))
            .collect();

        match blocks {
            Ok(blocks) => {
                let codes = SketchCodes {
                    seed,
                    block: block as u32,
                    bits_per_weight: bpw,
                    count: scope.len() as u32,
                    buckets: blocks.concat(),
                };
                StageOutcome::extend(state, self.kind(), vec![StageEncoding::Sketch(codes)])
            }
            Err(e) => StageOutcome::Degraded(DegradeReason::new(self.kind(), e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::LayerSignal;
    use crate::encoding::Coverage;
    use crate::model::{LayerRole, WeightTensor};
    use nanoquant_core::DType;

    fn run(values: Vec<f32>, rows: usize, cols: usize) -> ChainState {
        let t = WeightTensor::new("w", vec![rows, cols], DType::Float32, values).unwrap();
        let signal = LayerSignal::uniform(rows, cols);
        let ctx = StageContext {
            tensor: &t,
            signal: &signal,
            role: LayerRole::Projection,
        };
        let stage = Sketching::new(SketchParams {
            bits_per_weight: 0.25,
            block: 256,
            seed: DEFAULT_SKETCH_SEED,
        });
        let StageOutcome::Ok(state) = stage.apply(&ChainState::new(&t), &ctx) else {
            panic!("expected Ok");
        };
        state
    }

    #[test]
    fn test_quarter_bit_per_weight() {
        let values: Vec<f32> = (0..512).map(|i| (i as f32 * 0.11).sin() * 0.01).collect();
        let state = run(values, 4, 128);
        let bits: u64 = state.stages.iter().map(|s| s.storage_bits(512)).sum();
        assert_eq!(bits, 128);
        assert!(state.recon.positions(Coverage::Pending).is_empty());
    }

    #[test]
    fn test_constant_signed_weights_reconstruct() {
        // With one bucket every member agrees after the sign flip
        let mut values = Vec::with_capacity(16);
        for i in 0..16u64 {
            let (_, sign) = sketch_hash(i, DEFAULT_SKETCH_SEED, 1);
            values.push(sign * 0.5);
        }
        let state = run(values.clone(), 2, 8);
        assert_eq!(state.recon.values, values);
    }

    #[test]
    fn test_sketch_is_deterministic() {
        let values: Vec<f32> = (0..300).map(|i| (i as f32).sqrt() * 0.001).collect();
        let a = run(values.clone(), 3, 100);
        let b = run(values, 3, 100);
        assert_eq!(a.stages, b.stages);
    }
}
