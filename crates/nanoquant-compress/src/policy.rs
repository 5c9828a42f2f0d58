//! Compression levels and the technique chains they resolve to.
//!
//! The seven levels are rows of one static table. Moving down the table
//! never disables a technique; it only tightens parameters (more sparsity,
//! fewer bits, smaller tiers), which keeps the size reductions ordered.
//!
//! ## Example
//!
//! ```rust
//! use nanoquant_compress::policy::{resolve, Level};
//!
//! let chain = resolve("heavy").unwrap();
//! assert_eq!(chain.label, "heavy");
//! assert!(chain.requires_calibration());
//! assert!(resolve("gigantic").is_err());
//! assert_eq!(Level::Atomic.target_reduction(), (99.0, 99.5));
//! ```

use crate::encoding::Precision;
use crate::model::{LayerRole, ModelSummary};
use crate::quantize::DEFAULT_GROUP_SIZE;
use crate::techniques::{
    BinaryParameterization, BinaryParams, BlockPruning, LowRankCorrection, LowRankParams,
    MixedPrecisionAllocation, MixedPrecisionParams, PruneCriterion, PruneParams, SalientParams,
    SalientPreservation, SketchParams, Sketching, Sub2BitParams, Sub2BitQuantization, Technique,
    TechniqueKind,
};
use crate::techniques::sketch::DEFAULT_SKETCH_SEED;
use nanoquant_core::NanoquantError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sparsity cap for embedding and output layers.
pub const EDGE_LAYER_MAX_SPARSITY: f32 = 0.5;

/// Errors from level lookup and chain validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error(
        "unknown compression level '{0}' (expected light, medium, heavy, extreme, ultra, nano or atomic)"
    )]
    UnknownLevel(String),

    #[error("invalid technique chain: {0}")]
    InvalidChain(String),
}

impl From<PolicyError> for NanoquantError {
    fn from(e: PolicyError) -> Self {
        NanoquantError::InvalidRequest(e.to_string())
    }
}

/// Compression level, from least to most aggressive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Light,
    Medium,
    Heavy,
    Extreme,
    Ultra,
    Nano,
    Atomic,
}

impl Level {
    pub const ALL: [Level; 7] = [
        Level::Light,
        Level::Medium,
        Level::Heavy,
        Level::Extreme,
        Level::Ultra,
        Level::Nano,
        Level::Atomic,
    ];

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Medium => "medium",
            Self::Heavy => "heavy",
            Self::Extreme => "extreme",
            Self::Ultra => "ultra",
            Self::Nano => "nano",
            Self::Atomic => "atomic",
        }
    }

    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Light => "4/8-bit mixed precision with light magnitude pruning",
            Self::Medium => "2-8 bit mixed precision, 30% magnitude pruning",
            Self::Heavy => "2-4 bit tiers, activation-aware block pruning, low-rank correction",
            Self::Extreme => "ternary and 2-3 bit tiers at 70% block sparsity",
            Self::Ultra => "binary and ternary tiers at 85% block sparsity",
            Self::Nano => "binary and ternary tiers at 90% block sparsity",
            Self::Atomic => "count-sketch and binary tiers at 95% block sparsity",
        }
    }

    /// Documented size-reduction range, in percent.
    #[must_use]
    pub const fn target_reduction(&self) -> (f64, f64) {
        match self {
            Self::Light => (50.0, 70.0),
            Self::Medium => (70.0, 85.0),
            Self::Heavy => (85.0, 92.0),
            Self::Extreme => (92.0, 96.0),
            Self::Ultra => (96.0, 98.0),
            Self::Nano => (98.0, 99.0),
            Self::Atomic => (99.0, 99.5),
        }
    }

    /// Typical compressed/original size ratio.
    #[must_use]
    pub const fn estimated_ratio(&self) -> f64 {
        match self {
            Self::Light => 0.30,
            Self::Medium => 0.15,
            Self::Heavy => 0.08,
            Self::Extreme => 0.04,
            Self::Ultra => 0.02,
            Self::Nano => 0.01,
            Self::Atomic => 0.005,
        }
    }

    /// Suggest a level from model size.
    #[must_use]
    pub fn recommend(summary: &ModelSummary) -> Self {
        if summary.hidden_size > 4096 || summary.block_count > 32 {
            Self::Extreme
        } else if summary.hidden_size > 2048 || summary.block_count > 24 {
            Self::Heavy
        } else {
            Self::Medium
        }
    }

    /// The level's technique chain.
    #[must_use]
    pub fn chain(self) -> TechniqueChain {
        LEVEL_TABLE[self as usize].chain(self)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Level {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|level| level.name() == wanted)
            .ok_or_else(|| PolicyError::UnknownLevel(s.to_string()))
    }
}

/// Look up the chain for a level name.
pub fn resolve(level: &str) -> Result<TechniqueChain, PolicyError> {
    Ok(level.parse::<Level>()?.chain())
}

/// One configured technique; chains are lists of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "technique", rename_all = "snake_case")]
pub enum TechniqueSpec {
    Salient(SalientParams),
    Prune(PruneParams),
    MixedPrecision(MixedPrecisionParams),
    #[serde(rename = "sub2bit")]
    Sub2Bit(Sub2BitParams),
    Binary(BinaryParams),
    Sketch(SketchParams),
    LowRank(LowRankParams),
}

impl TechniqueSpec {
    #[must_use]
    pub const fn kind(&self) -> TechniqueKind {
        match self {
            Self::Salient(_) => TechniqueKind::Salient,
            Self::Prune(_) => TechniqueKind::Prune,
            Self::MixedPrecision(_) => TechniqueKind::MixedPrecision,
            Self::Sub2Bit(_) => TechniqueKind::Sub2Bit,
            Self::Binary(_) => TechniqueKind::Binary,
            Self::Sketch(_) => TechniqueKind::Sketch,
            Self::LowRank(_) => TechniqueKind::LowRank,
        }
    }

    #[must_use]
    pub fn build(&self) -> Box<dyn Technique> {
        match self {
            Self::Salient(p) => Box::new(SalientPreservation::new(p.clone())),
            Self::Prune(p) => Box::new(BlockPruning::new(p.clone())),
            Self::MixedPrecision(p) => Box::new(MixedPrecisionAllocation::new(p.clone())),
            Self::Sub2Bit(p) => Box::new(Sub2BitQuantization::new(p.clone())),
            Self::Binary(p) => Box::new(BinaryParameterization::new(p.clone())),
            Self::Sketch(p) => Box::new(Sketching::new(p.clone())),
            Self::LowRank(p) => Box::new(LowRankCorrection::new(p.clone())),
        }
    }

    #[must_use]
    pub fn requires_calibration(&self) -> bool {
        matches!(self, Self::Prune(p) if p.criterion == PruneCriterion::ActivationAware)
    }

    fn validate(&self) -> Result<(), String> {
        let in_range = |value: f32, lo: f32, hi: f32, what: &str| {
            if value.is_finite() && (lo..=hi).contains(&value) {
                Ok(())
            } else {
                Err(format!("{what} {value} outside [{lo}, {hi}]"))
            }
        };
        let positive = |value: usize, what: &str| {
            if value > 0 {
                Ok(())
            } else {
                Err(format!("{what} must be positive"))
            }
        };

        match self {
            Self::Salient(p) => in_range(p.fraction, 0.0, 0.5, "salient fraction"),
            Self::Prune(p) => {
                in_range(p.sparsity, 0.0, 0.99, "sparsity")?;
                positive(p.block, "prune block")
            }
            Self::MixedPrecision(p) => {
                in_range(p.avg_bits, 0.01, 16.0, "average bits")?;
                positive(p.group_size, "group size")?;
                if p.choices.is_empty() {
                    return Err("mixed precision needs at least one tier".to_string());
                }
                p.choices.iter().try_for_each(|c| c.validate())
            }
            Self::Sub2Bit(p) => positive(p.group_size, "group size"),
            Self::Binary(p) => positive(p.group_size, "group size"),
            Self::Sketch(p) => {
                in_range(p.bits_per_weight, 0.01, 1.0, "sketch bits per weight")?;
                positive(p.block, "sketch block")
            }
            Self::LowRank(p) => {
                in_range(p.bits_per_weight, 0.0, 16.0, "low-rank bits per weight")?;
                in_range(p.max_rank_ratio, 0.0, 1.0, "rank ratio")?;
                positive(p.power_iterations, "power iterations")
            }
        }
    }
}

/// An ordered list of techniques applied to each tensor of a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechniqueChain {
    pub label: String,
    pub stages: Vec<TechniqueSpec>,
}

impl TechniqueChain {
    #[must_use]
    pub fn new(label: impl Into<String>, stages: Vec<TechniqueSpec>) -> Self {
        Self {
            label: label.into(),
            stages,
        }
    }

    /// Load a chain from JSON.
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let chain: Self =
            serde_json::from_str(json).map_err(|e| PolicyError::InvalidChain(e.to_string()))?;
        chain.validate()?;
        Ok(chain)
    }

    /// Check parameters, canonical order, and that every allocated tier
    /// has a stage to encode it.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |msg: String| PolicyError::InvalidChain(msg);
        for stage in &self.stages {
            stage
                .validate()
                .map_err(|e| invalid(format!("{}: {e}", stage.kind())))?;
        }
        for pair in self.stages.windows(2) {
            if pair[0].kind() >= pair[1].kind() {
                return Err(invalid(format!(
                    "{} cannot follow {}; stages run once each, in canonical order",
                    pair[1].kind(),
                    pair[0].kind()
                )));
            }
        }

        let tiers = self.stages.iter().find_map(|s| match s {
            TechniqueSpec::MixedPrecision(p) => Some(&p.choices),
            _ => None,
        });
        for tier in tiers.into_iter().flatten() {
            let encoder = match tier {
                Precision::Int(_) => continue,
                Precision::Ternary => TechniqueKind::Sub2Bit,
                Precision::Binary => TechniqueKind::Binary,
                Precision::Sketch => TechniqueKind::Sketch,
            };
            if !self.kinds().contains(&encoder) {
                return Err(invalid(format!("{tier} tier allocated but no {encoder} stage")));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<TechniqueKind> {
        self.stages.iter().map(TechniqueSpec::kind).collect()
    }

    #[must_use]
    pub fn requires_calibration(&self) -> bool {
        self.stages.iter().any(TechniqueSpec::requires_calibration)
    }

    /// Keep or drop salient preservation.
    #[must_use]
    pub fn with_salient(mut self, preserve: bool) -> Self {
        if !preserve {
            self.stages.retain(|s| !matches!(s, TechniqueSpec::Salient(_)));
        }
        self
    }

    /// The chain a layer of `role` runs, or `None` to store it as-is.
    #[must_use]
    pub fn for_role(&self, role: LayerRole) -> Option<Self> {
        match role {
            LayerRole::Norm => None,
            LayerRole::Embedding | LayerRole::Output => {
                let mut chain = self.clone();
                for stage in &mut chain.stages {
                    if let TechniqueSpec::Prune(p) = stage {
                        p.sparsity = p.sparsity.min(EDGE_LAYER_MAX_SPARSITY);
                    }
                }
                Some(chain)
            }
            _ => Some(self.clone()),
        }
    }

    #[must_use]
    pub fn build(&self) -> Vec<Box<dyn Technique>> {
        self.stages.iter().map(TechniqueSpec::build).collect()
    }
}

struct LevelRow {
    salient: f32,
    sparsity: f32,
    block: usize,
    criterion: PruneCriterion,
    avg_bits: f32,
    tiers: &'static [Precision],
    group_size: usize,
    sub2bit: bool,
    binary: bool,
    /// (bits per weight, block)
    sketch: Option<(f32, usize)>,
    /// (bits per weight, max rank ratio)
    low_rank: Option<(f32, f32)>,
}

const WIDE_GROUP: usize = 256;

const LEVEL_TABLE: [LevelRow; 7] = [
    LevelRow {
        salient: 0.01,
        sparsity: 0.15,
        block: 1,
        criterion: PruneCriterion::Magnitude,
        avg_bits: 6.0,
        tiers: &[Precision::Int(4), Precision::Int(8)],
        group_size: DEFAULT_GROUP_SIZE,
        sub2bit: false,
        binary: false,
        sketch: None,
        low_rank: None,
    },
    LevelRow {
        salient: 0.005,
        sparsity: 0.30,
        block: 1,
        criterion: PruneCriterion::Magnitude,
        avg_bits: 4.0,
        tiers: &[
            Precision::Int(2),
            Precision::Int(3),
            Precision::Int(4),
            Precision::Int(8),
        ],
        group_size: DEFAULT_GROUP_SIZE,
        sub2bit: false,
        binary: false,
        sketch: None,
        low_rank: None,
    },
    LevelRow {
        salient: 0.0025,
        sparsity: 0.50,
        block: 4,
        criterion: PruneCriterion::ActivationAware,
        avg_bits: 2.5,
        tiers: &[Precision::Int(2), Precision::Int(3), Precision::Int(4)],
        group_size: DEFAULT_GROUP_SIZE,
        sub2bit: false,
        binary: false,
        sketch: None,
        low_rank: Some((0.25, 0.25)),
    },
    LevelRow {
        salient: 0.002,
        sparsity: 0.70,
        block: 8,
        criterion: PruneCriterion::ActivationAware,
        avg_bits: 1.8,
        tiers: &[Precision::Ternary, Precision::Int(2), Precision::Int(3)],
        group_size: DEFAULT_GROUP_SIZE,
        sub2bit: true,
        binary: false,
        sketch: None,
        low_rank: Some((0.1, 0.15)),
    },
    LevelRow {
        salient: 0.001,
        sparsity: 0.85,
        block: 16,
        criterion: PruneCriterion::ActivationAware,
        avg_bits: 1.3,
        tiers: &[Precision::Binary, Precision::Ternary, Precision::Int(2)],
        group_size: DEFAULT_GROUP_SIZE,
        sub2bit: true,
        binary: true,
        sketch: None,
        low_rank: Some((0.05, 0.1)),
    },
    LevelRow {
        salient: 0.001,
        sparsity: 0.90,
        block: 32,
        criterion: PruneCriterion::ActivationAware,
        avg_bits: 1.2,
        tiers: &[Precision::Binary, Precision::Ternary],
        group_size: WIDE_GROUP,
        sub2bit: true,
        binary: true,
        sketch: None,
        low_rank: Some((0.02, 0.05)),
    },
    LevelRow {
        salient: 0.001,
        sparsity: 0.95,
        block: 64,
        criterion: PruneCriterion::ActivationAware,
        avg_bits: 0.6,
        tiers: &[Precision::Sketch, Precision::Binary],
        group_size: WIDE_GROUP,
        sub2bit: true,
        binary: true,
        sketch: Some((0.25, WIDE_GROUP)),
        low_rank: Some((0.01, 0.02)),
    },
];

impl LevelRow {
    fn chain(&self, level: Level) -> TechniqueChain {
        let mut stages = vec![
            TechniqueSpec::Salient(SalientParams {
                fraction: self.salient,
            }),
            TechniqueSpec::Prune(PruneParams {
                sparsity: self.sparsity,
                block: self.block,
                criterion: self.criterion,
            }),
            TechniqueSpec::MixedPrecision(MixedPrecisionParams {
                avg_bits: self.avg_bits,
                choices: self.tiers.to_vec(),
                group_size: self.group_size,
            }),
        ];
        if self.sub2bit {
            stages.push(TechniqueSpec::Sub2Bit(Sub2BitParams {
                group_size: self.group_size,
            }));
        }
        if self.binary {
            stages.push(TechniqueSpec::Binary(BinaryParams {
                group_size: self.group_size,
            }));
        }
        if let Some((bits_per_weight, block)) = self.sketch {
            stages.push(TechniqueSpec::Sketch(SketchParams {
                bits_per_weight,
                block,
                seed: DEFAULT_SKETCH_SEED,
            }));
        }
        if let Some((bits_per_weight, max_rank_ratio)) = self.low_rank {
            stages.push(TechniqueSpec::LowRank(LowRankParams {
                bits_per_weight,
                max_rank_ratio,
                power_iterations: 30,
            }));
        }
        TechniqueChain::new(level.name(), stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param<T>(chain: &TechniqueChain, pick: impl Fn(&TechniqueSpec) -> Option<T>) -> Option<T> {
        chain.stages.iter().find_map(pick)
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("light".parse::<Level>().unwrap(), Level::Light);
        assert_eq!(" ATOMIC ".parse::<Level>().unwrap(), Level::Atomic);
        assert_eq!(
            "gigantic".parse::<Level>(),
            Err(PolicyError::UnknownLevel("gigantic".to_string()))
        );
        for level in Level::ALL {
            assert_eq!(level.to_string().parse::<Level>().unwrap(), level);
        }
    }

    #[test]
    fn test_unknown_level_is_invalid_request() {
        let err: NanoquantError = resolve("mega").unwrap_err().into();
        assert!(matches!(err, NanoquantError::InvalidRequest(_)));
    }

    #[test]
    fn test_every_level_chain_is_valid() {
        for level in Level::ALL {
            let chain = level.chain();
            chain.validate().unwrap();
            assert_eq!(chain.label, level.name());
            assert_eq!(chain.kinds()[0], TechniqueKind::Salient);
        }
    }

    #[test]
    fn test_techniques_stay_enabled_at_higher_levels() {
        for pair in Level::ALL.windows(2) {
            let lower = pair[0].chain().kinds();
            let higher = pair[1].chain().kinds();
            for kind in &lower {
                assert!(higher.contains(kind), "{kind} dropped at {}", pair[1]);
            }
        }
    }

    #[test]
    fn test_parameters_tighten_monotonically() {
        for pair in Level::ALL.windows(2) {
            let (a, b) = (pair[0].chain(), pair[1].chain());
            let sparsity = |c: &TechniqueChain| {
                param(c, |s| match s {
                    TechniqueSpec::Prune(p) => Some(p.sparsity),
                    _ => None,
                })
            };
            let bits = |c: &TechniqueChain| {
                param(c, |s| match s {
                    TechniqueSpec::MixedPrecision(p) => Some(p.avg_bits),
                    _ => None,
                })
            };
            assert!(sparsity(&b) > sparsity(&a));
            assert!(bits(&b) < bits(&a));
            assert!(pair[1].estimated_ratio() < pair[0].estimated_ratio());
            assert!(pair[1].target_reduction().0 >= pair[0].target_reduction().1);
        }
    }

    #[test]
    fn test_calibration_needed_from_heavy() {
        assert!(!Level::Light.chain().requires_calibration());
        assert!(!Level::Medium.chain().requires_calibration());
        for level in &Level::ALL[2..] {
            assert!(level.chain().requires_calibration());
        }
    }

    #[test]
    fn test_role_exemptions() {
        let chain = Level::Nano.chain();
        assert!(chain.for_role(LayerRole::Norm).is_none());
        let embedding = chain.for_role(LayerRole::Embedding).unwrap();
        let capped = param(&embedding, |s| match s {
            TechniqueSpec::Prune(p) => Some(p.sparsity),
            _ => None,
        });
        assert_eq!(capped, Some(EDGE_LAYER_MAX_SPARSITY));
        assert_eq!(chain.for_role(LayerRole::Attention).unwrap(), chain);
    }

    #[test]
    fn test_without_salient() {
        let chain = Level::Light.chain().with_salient(false);
        assert!(!chain.kinds().contains(&TechniqueKind::Salient));
        chain.validate().unwrap();
    }

    #[test]
    fn test_chain_json() {
        let json = r#"{
            "label": "custom",
            "stages": [
                {"technique": "prune", "sparsity": 0.5, "block": 4, "criterion": "magnitude"},
                {"technique": "mixed_precision", "avg_bits": 1.5,
                 "choices": ["ternary", {"int": 2}], "group_size": 64},
                {"technique": "sub2bit", "group_size": 64}
            ]
        }"#;
        let chain = TechniqueChain::from_json(json).unwrap();
        assert_eq!(
            chain.kinds(),
            vec![
                TechniqueKind::Prune,
                TechniqueKind::MixedPrecision,
                TechniqueKind::Sub2Bit
            ]
        );
        assert!(!chain.requires_calibration());
    }

    #[test]
    fn test_invalid_chains() {
        let missing_encoder = TechniqueChain::new(
            "custom",
            vec![TechniqueSpec::MixedPrecision(MixedPrecisionParams {
                avg_bits: 1.0,
                choices: vec![Precision::Binary],
                group_size: 128,
            })],
        );
        assert!(matches!(
            missing_encoder.validate(),
            Err(PolicyError::InvalidChain(_))
        ));

        let out_of_order = TechniqueChain::new(
            "custom",
            vec![
                TechniqueSpec::Binary(BinaryParams { group_size: 128 }),
                TechniqueSpec::Salient(SalientParams { fraction: 0.01 }),
            ],
        );
        assert!(out_of_order.validate().is_err());

        let bad_sparsity = TechniqueChain::new(
            "custom",
            vec![TechniqueSpec::Prune(PruneParams {
                sparsity: 1.5,
                block: 1,
                criterion: PruneCriterion::Magnitude,
            })],
        );
        assert!(bad_sparsity.validate().is_err());
    }

    #[test]
    fn test_recommendation() {
        let mut summary = ModelSummary {
            model_id: "m".to_string(),
            layer_count: 10,
            tensor_count: 10,
            param_count: 1000,
            original_bits: 16000,
            hidden_size: 1024,
            block_count: 12,
        };
        assert_eq!(Level::recommend(&summary), Level::Medium);
        summary.hidden_size = 3072;
        assert_eq!(Level::recommend(&summary), Level::Heavy);
        summary.block_count = 40;
        assert_eq!(Level::recommend(&summary), Level::Extreme);
    }
}
