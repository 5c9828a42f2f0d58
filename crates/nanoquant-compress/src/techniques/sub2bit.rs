//! Ternary quantization for the sub-2-bit tier.
//!
//! Three affine levels per group, packed five codes to a byte.

use super::mixed_precision::encode_grouped;
use super::{ChainState, DegradeReason, StageContext, StageOutcome, Technique, TechniqueKind};
use crate::encoding::{Precision, StageEncoding};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sub2BitParams {
    pub group_size: usize,
}

pub struct Sub2BitQuantization {
    params: Sub2BitParams,
}

impl Sub2BitQuantization {
    #[must_use]
    pub fn new(params: Sub2BitParams) -> Self {
        Self { params }
    }
}

impl Technique for Sub2BitQuantization {
    fn kind(&self) -> TechniqueKind {
        TechniqueKind::Sub2Bit
    }

    fn apply(&self, state: &ChainState, ctx: &StageContext<'_>) -> StageOutcome {
        let scope = state.recon.scope(Precision::Ternary);
        if scope.is_empty() {
            return StageOutcome::Ok(state.clone());
        }
        let residual = state.residual(&ctx.tensor.values);
        let values: Vec<f32> = scope.iter().map(|&i| residual[i]).collect();

        match encode_grouped(&values, Precision::Ternary, self.params.group_size) {
            Ok(codes) => {
                StageOutcome::extend(state, self.kind(), vec![StageEncoding::Grouped(codes)])
            }
            Err(e) => StageOutcome::Degraded(DegradeReason::new(self.kind(), e.to_string())),
        }
    }
}
