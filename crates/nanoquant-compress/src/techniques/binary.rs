//! Binary parameterization: one sign bit per weight and a shared f16 scale
//! per group, the least-squares `α = mean |w|`.

use super::{ChainState, DegradeReason, StageContext, StageOutcome, Technique, TechniqueKind};
use crate::encoding::{BinaryCodes, Precision, StageEncoding};
use crate::packing::pack_bits;
use crate::quantize::{binary_scale, QuantizeError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryParams {
    pub group_size: usize,
}

pub struct BinaryParameterization {
    params: BinaryParams,
}

impl BinaryParameterization {
    #[must_use]
    pub fn new(params: BinaryParams) -> Self {
        Self { params }
    }
}

fn encode_binary(values: &[f32], group_size: usize) -> Result<BinaryCodes, QuantizeError> {
    let group = group_size.max(1);
    let scales = values
        .par_chunks(group)
        .map(binary_scale)
        .collect::<Result<Vec<u16>, _>>()?;
    let signs: Vec<u8> = values.iter().map(|&v| u8::from(v >= 0.0)).collect();
    Ok(BinaryCodes {
        group_size: group as u32,
        count: values.len() as u32,
        signs: pack_bits(&signs, 1),
        scales,
    })
}

impl Technique for BinaryParameterization {
    fn kind(&self) -> TechniqueKind {
        TechniqueKind::Binary
    }

    fn apply(&self, state: &ChainState, ctx: &StageContext<'_>) -> StageOutcome {
        let scope = state.recon.scope(Precision::Binary);
        if scope.is_empty() {
            return StageOutcome::Ok(state.clone());
        }
        let residual = state.residual(&ctx.tensor.values);
        let values: Vec<f32> = scope.iter().map(|&i| residual[i]).collect();

        match encode_binary(&values, self.params.group_size) {
            Ok(codes) => {
                StageOutcome::extend(state, self.kind(), vec![StageEncoding::Binary(codes)])
            }
            Err(e) => StageOutcome::Degraded(DegradeReason::new(self.kind(), e.to_string())),
        }
    }
}
