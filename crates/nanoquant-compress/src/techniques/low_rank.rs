//! Low-rank error correction.
//!
//! After the lossy tiers, the residual at encoded positions is approximated
//! by a rank-r product `L · R` found with power iteration and deflation.
//! The rank is bounded both by `max_rank_ratio · min(rows, cols)` and by the
//! bit budget, since the factors cost `16 · r · (rows + cols)` bits. A
//! correction that does not lower the error at encoded positions once its
//! factors are rounded to f16 is dropped.

use super::{ChainState, DegradeReason, StageContext, StageOutcome, Technique, TechniqueKind};
use crate::encoding::{Coverage, LowRankFactors, StageEncoding};
use crate::quantize::{to_f16, QuantizeError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_POWER_ITERATIONS: usize = 30;
const SIGMA_FLOOR: f32 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowRankParams {
    /// Budget for the factors, in bits per weight of the tensor
    pub bits_per_weight: f32,
    pub max_rank_ratio: f32,
    #[serde(default = "default_power_iterations")]
    pub power_iterations: usize,
}

fn default_power_iterations() -> usize {
    DEFAULT_POWER_ITERATIONS
}

pub struct LowRankCorrection {
    params: LowRankParams,
}

impl LowRankCorrection {
    #[must_use]
    pub fn new(params: LowRankParams) -> Self {
        Self { params }
    }
}

/// Largest rank both bounds allow.
#[must_use]
pub fn target_rank(rows: usize, cols: usize, bits_per_weight: f32, max_rank_ratio: f32) -> usize {
    if rows == 0 || cols == 0 {
        return 0;
    }
    let by_ratio = (f64::from(max_rank_ratio.max(0.0)) * rows.min(cols) as f64).floor();
    let numel = (rows * cols) as f64;
    let factor_bits = (rows + cols) as f64 * 16.0;
    let by_budget = (f64::from(bits_per_weight.max(0.0)) * numel / factor_bits).floor();
    by_ratio.min(by_budget) as usize
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > SIGMA_FLOOR {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Dominant singular triplet `(u, sigma, v)` of a row-major matrix.
fn power_iteration(
    a: &[f32],
    rows: usize,
    cols: usize,
    iterations: usize,
) -> (Vec<f32>, f32, Vec<f32>) {
    let mut v = vec![0.0f32; cols];
    let mut rng_state = 12345u64;
    for val in &mut v {
        rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
        *val = ((rng_state >> 33) as f32 / (1u64 << 31) as f32) * 2.0 - 1.0;
    }
    normalize(&mut v);

    let multiply = |v: &[f32]| -> Vec<f32> {
        a.par_chunks(cols)
            .map(|row| row.iter().zip(v).map(|(x, y)| x * y).sum())
            .collect()
    };

    let mut u = vec![0.0f32; rows];
    for _ in 0..iterations.max(1) {
        u = multiply(&v);
        normalize(&mut u);

        v = vec![0.0f32; cols];
        for (i, row) in a.chunks(cols).enumerate() {
            for (vj, x) in v.iter_mut().zip(row) {
                *vj += x * u[i];
            }
        }
        normalize(&mut v);
    }

    let av = multiply(&v);
    let sigma = u.iter().zip(&av).map(|(x, y)| x * y).sum();
    (u, sigma, v)
}

/// Rank-`rank` factors of `a`, singular values folded into the left factor.
fn factorize(
    a: &[f32],
    rows: usize,
    cols: usize,
    rank: usize,
    iterations: usize,
) -> (usize, Vec<f32>, Vec<f32>) {
    let mut a = a.to_vec();
    let mut lefts: Vec<Vec<f32>> = Vec::with_capacity(rank);
    let mut rights: Vec<Vec<f32>> = Vec::with_capacity(rank);

    for _ in 0..rank {
        let (u, sigma, v) = power_iteration(&a, rows, cols, iterations);
        if sigma.is_nan() || sigma <= SIGMA_FLOOR {
            break;
        }
        for i in 0..rows {
            for j in 0..cols {
                a[i * cols + j] -= sigma * u[i] * v[j];
            }
        }
        lefts.push(u.iter().map(|x| x * sigma).collect());
        rights.push(v);
    }

    let found = lefts.len();
    let mut left = Vec::with_capacity(rows * found);
    for i in 0..rows {
        for column in &lefts {
            left.push(column[i]);
        }
    }
    (found, left, rights.concat())
}

fn encoded_error(state: &ChainState, original: &[f32]) -> f64 {
    state
        .recon
        .coverage
        .iter()
        .zip(original.iter().zip(&state.recon.values))
        .filter(|(c, _)| **c == Coverage::Encoded)
        .map(|(_, (w, a))| f64::from(w - a).powi(2))
        .sum()
}

fn to_f16_all(values: &[f32]) -> Result<Vec<u16>, QuantizeError> {
    values.iter().map(|&v| to_f16(v, "low-rank factor")).collect()
}

impl Technique for LowRankCorrection {
    fn kind(&self) -> TechniqueKind {
        TechniqueKind::LowRank
    }

    fn apply(&self, state: &ChainState, ctx: &StageContext<'_>) -> StageOutcome {
        let (rows, cols) = (state.recon.rows, state.recon.cols);
        let rank = target_rank(
            rows,
            cols,
            self.params.bits_per_weight,
            self.params.max_rank_ratio,
        );
        let encoded = state.recon.positions(Coverage::Encoded);
        if rank == 0 || encoded.is_empty() {
            return StageOutcome::Ok(state.clone());
        }

        let residual = state.residual(&ctx.tensor.values);
        let mut masked = vec![0.0f32; rows * cols];
        for &i in &encoded {
            masked[i] = residual[i];
        }
        if masked.iter().any(|v| !v.is_finite()) {
            return StageOutcome::Degraded(DegradeReason::new(
                self.kind(),
                "non-finite residual".to_string(),
            ));
        }

        let (found, left, right) =
            factorize(&masked, rows, cols, rank, self.params.power_iterations);
        if found == 0 {
            return StageOutcome::Ok(state.clone());
        }
        let factors = match (to_f16_all(&left), to_f16_all(&right)) {
            (Ok(left), Ok(right)) => LowRankFactors {
                rows: rows as u32,
                cols: cols as u32,
                rank: found as u32,
                left,
                right,
            },
            (Err(e), _) | (_, Err(e)) => {
                return StageOutcome::Degraded(DegradeReason::new(self.kind(), e.to_string()))
            }
        };

        let before = encoded_error(state, &ctx.tensor.values);
        match StageOutcome::extend(state, self.kind(), vec![StageEncoding::LowRank(factors)]) {
            StageOutcome::Ok(next) => {
                let after = encoded_error(&next, &ctx.tensor.values);
                if after < before {
                    StageOutcome::Ok(next)
                } else {
                    debug!("{}: rank-{found} correction dropped", ctx.tensor.name);
                    StageOutcome::Ok(state.clone())
                }
            }
            other => other,
        }
    }
}
