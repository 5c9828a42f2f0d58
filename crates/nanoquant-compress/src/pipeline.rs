//! The compression orchestrator.
//!
//! A run moves through
//! `Initialized → Calibrating → Compressing(i of n) → Packaging → Completed`
//! and ends in `Aborted` on any unrecoverable error. Layers are processed one
//! at a time; the tensors of a layer and the work inside each stage run on a
//! rayon pool bounded by `concurrency_limit`. A tensor whose chain degrades
//! is stored as-is and flagged in the report; a fatal stage outcome aborts
//! the whole run and no artifact is produced.
//!
//! ## Example
//!
//! ```rust
//! use nanoquant_compress::model::{Layer, Model, WeightTensor};
//! use nanoquant_compress::pipeline::{compress_model, CompressOptions};
//! use nanoquant_compress::policy::Level;
//! use nanoquant_core::DType;
//!
//! let values: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.01).sin()).collect();
//! let tensor =
//!     WeightTensor::new("mlp.up_proj.weight", vec![32, 128], DType::Float32, values).unwrap();
//! let mut model = Model::from_layers("demo", vec![Layer::new("mlp.up_proj", vec![tensor])]);
//!
//! let artifact = compress_model(&mut model, Level::Light, CompressOptions::default()).unwrap();
//! assert!(artifact.size_ratio() < 0.5);
//! assert_eq!(artifact.per_layer_report().len(), 1);
//! ```

use crate::artifact::{
    ArtifactPackager, CompressedArtifact, CompressedLayer, CompressedModel, LayerReport,
};
use crate::calibration::{CalibrationConfig, CalibrationSampler, CalibrationSignal, SampleInput};
use crate::control::{CancellationToken, RunControl};
use crate::model::{Layer, Model, WeightTensor};
use crate::policy::{resolve, Level, TechniqueChain};
use crate::techniques::{run_chain, CompressedTensor, Technique, TechniqueKind, TensorOutcome};
use nanoquant_core::{CodecKind, NanoquantError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Options for one compression run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressOptions {
    /// Keep the most important weights exact
    pub preserve_super_weights: bool,
    pub calibration_samples: Option<Vec<SampleInput>>,
    /// Precomputed statistics, used instead of running samples
    pub activation_stats: Option<CalibrationSignal>,
    pub calibration: CalibrationConfig,
    /// Worker threads for intra-layer work; the global pool when unset
    pub concurrency_limit: Option<usize>,
    pub deadline: Option<Duration>,
    /// Keep loaded layers in memory across passes instead of re-reading
    /// the source; off by default so only one layer is resident at a time
    pub cache_layers: bool,
    pub codec: CodecKind,
    pub codec_level: i32,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            preserve_super_weights: true,
            calibration_samples: None,
            activation_stats: None,
            calibration: CalibrationConfig::default(),
            concurrency_limit: None,
            deadline: None,
            cache_layers: false,
            codec: CodecKind::Zstd,
            codec_level: 3,
            cancel: CancellationToken::new(),
        }
    }
}

impl CompressOptions {
    /// Load options from a JSON file; absent fields keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        serde_json::from_slice(&bytes).map_err(|e| {
            NanoquantError::InvalidRequest(format!(
                "invalid options file {}: {e}",
                path.as_ref().display()
            ))
        })
    }

    #[must_use]
    pub fn with_preserve_super_weights(mut self, preserve: bool) -> Self {
        self.preserve_super_weights = preserve;
        self
    }

    #[must_use]
    pub fn with_calibration_samples(mut self, samples: Vec<SampleInput>) -> Self {
        self.calibration_samples = Some(samples);
        self
    }

    #[must_use]
    pub fn with_activation_stats(mut self, stats: CalibrationSignal) -> Self {
        self.activation_stats = Some(stats);
        self
    }

    #[must_use]
    pub fn with_calibration(mut self, config: CalibrationConfig) -> Self {
        self.calibration = config;
        self
    }

    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_cache_layers(mut self, enabled: bool) -> Self {
        self.cache_layers = enabled;
        self
    }

    #[must_use]
    pub fn with_codec(mut self, codec: CodecKind, level: i32) -> Self {
        self.codec = codec;
        self.codec_level = level;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Initialized,
    Calibrating,
    /// 1-based layer index
    Compressing { layer: usize, of: usize },
    Packaging,
    Completed,
    Aborted,
}

impl PipelineState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => f.write_str("initialized"),
            Self::Calibrating => f.write_str("calibrating"),
            Self::Compressing { layer, of } => write!(f, "compressing layer {layer} of {of}"),
            Self::Packaging => f.write_str("packaging"),
            Self::Completed => f.write_str("completed"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Callback invoked on every state transition.
pub type StateObserver = Box<dyn Fn(&PipelineState) + Send + Sync>;

/// Drives one run over a model.
pub struct CompressionPipeline {
    options: CompressOptions,
    observer: Option<StateObserver>,
    state: PipelineState,
}

impl CompressionPipeline {
    #[must_use]
    pub fn new(options: CompressOptions) -> Self {
        Self {
            options,
            observer: None,
            state: PipelineState::Initialized,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    #[must_use]
    pub fn options(&self) -> &CompressOptions {
        &self.options
    }

    fn transition(&mut self, next: PipelineState) {
        debug!("pipeline: {} -> {}", self.state, next);
        self.state = next;
        if let Some(observer) = &self.observer {
            observer(&next);
        }
    }

    /// Compress `model` with `chain`.
    ///
    /// On error the pipeline ends in `Aborted` and nothing is returned.
    pub fn run(&mut self, model: &mut Model, chain: TechniqueChain) -> Result<CompressedArtifact> {
        if self.state != PipelineState::Initialized {
            return Err(NanoquantError::InvalidRequest(format!(
                "pipeline already {}",
                self.state
            )));
        }
        if let Some(observer) = &self.observer {
            observer(&self.state);
        }

        let result = match self.options.concurrency_limit {
            None => self.execute(model, chain),
            Some(0) => Err(NanoquantError::InvalidRequest(
                "concurrency_limit must be positive".to_string(),
            )),
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("nanoquant-{i}"))
                    .build()
                    .map_err(|e| {
                        NanoquantError::InternalInvariantViolation(format!(
                            "failed to start worker pool: {e}"
                        ))
                    });
                match pool {
                    Ok(pool) => pool.install(|| self.execute(model, chain)),
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = &result {
            warn!("Compression of {} aborted: {}", model.id(), e);
            self.transition(PipelineState::Aborted);
        }
        result
    }

    fn execute(&mut self, model: &mut Model, chain: TechniqueChain) -> Result<CompressedArtifact> {
        chain.validate()?;
        let chain = chain.with_salient(self.options.preserve_super_weights);
        let control = RunControl::new(self.options.cancel.clone(), self.options.deadline);
        info!(
            "Compressing {} ({} layers, {} params) at level {}",
            model.id(),
            model.layer_count(),
            model.param_count(),
            chain.label
        );

        self.transition(PipelineState::Calibrating);
        control.check()?;
        let signal = self.calibration_signal(model, &chain, &control)?;

        let techniques = chain.build();
        let total = model.layer_count();
        let mut layers = Vec::with_capacity(total);
        for (index, layer) in model.layers().enumerate() {
            control.check()?;
            self.transition(PipelineState::Compressing {
                layer: index + 1,
                of: total,
            });
            let layer = layer?;
            let compressed = compress_layer(&layer, &chain, &techniques, &signal)?;
            info!(
                "{} [{}]: {:.3} bits/weight, residual {:.4}{}",
                compressed.report.layer_name,
                compressed.report.role,
                compressed.report.achieved_bits_per_weight,
                compressed.report.residual_error,
                if compressed.report.degraded { " (degraded)" } else { "" }
            );
            layers.push(compressed);
        }
        control.check()?;

        self.transition(PipelineState::Packaging);
        let compressed = CompressedModel {
            model_id: model.id().to_string(),
            chain,
            calibration_samples: signal.samples_used,
            layers,
        };
        let payload =
            ArtifactPackager::new(self.options.codec, self.options.codec_level).pack(&compressed)?;
        control.check()?;

        info!(
            "Compressed {}: ratio {:.4}, quality loss {:.4}, {} degraded layers, {} bytes",
            compressed.model_id,
            compressed.size_ratio(),
            compressed.estimated_quality_loss(),
            compressed.degraded_count(),
            payload.len()
        );
        self.transition(PipelineState::Completed);
        Ok(CompressedArtifact::new(compressed, payload))
    }

    fn calibration_signal(
        &self,
        model: &mut Model,
        chain: &TechniqueChain,
        control: &RunControl,
    ) -> Result<CalibrationSignal> {
        if let Some(stats) = &self.options.activation_stats {
            debug!("Using {} precomputed tensor statistics", stats.tensors.len());
            return Ok(stats.clone());
        }
        match self.options.calibration_samples.as_deref() {
            Some(samples) if !samples.is_empty() => {
                CalibrationSampler::new(self.options.calibration.clone()).calibrate(
                    model,
                    samples,
                    control,
                )
            }
            _ if chain.requires_calibration() => Err(NanoquantError::CalibrationFailed(format!(
                "level {} needs calibration samples or activation statistics",
                chain.label
            ))),
            _ => Ok(CalibrationSignal::uniform()),
        }
    }
}

fn compress_layer(
    layer: &Layer,
    chain: &TechniqueChain,
    techniques: &[Box<dyn Technique>],
    signal: &CalibrationSignal,
) -> Result<CompressedLayer> {
    let role_chain = chain.for_role(layer.role);
    let role_techniques: Option<Vec<Box<dyn Technique>>> = match &role_chain {
        Some(c) if c == chain => None,
        Some(c) => Some(c.build()),
        None => Some(Vec::new()),
    };
    let active: &[Box<dyn Technique>] = role_techniques.as_deref().unwrap_or(techniques);

    let outcomes: Vec<TensorOutcome> = layer
        .tensors
        .par_iter()
        .map(|tensor| compress_tensor(tensor, layer, active, signal))
        .collect();

    let mut tensors = Vec::with_capacity(outcomes.len());
    let mut compressed_bits = 0u64;
    let mut error_sq = 0.0f64;
    let mut original_sq = 0.0f64;
    let mut reasons = Vec::new();
    let mut applied: Vec<TechniqueKind> = Vec::new();

    for (tensor, outcome) in layer.tensors.iter().zip(outcomes) {
        let compressed = match outcome {
            TensorOutcome::Ok(c) => c,
            TensorOutcome::Degraded(c, reason) => {
                warn!("{}: degraded ({}), stored as-is", tensor.name, reason);
                reasons.push(format!("{}: {}", tensor.name, reason));
                c
            }
            TensorOutcome::Fatal(reason) => {
                return Err(NanoquantError::InternalInvariantViolation(format!(
                    "layer {}: {reason}",
                    layer.name
                )));
            }
        };
        let numel = tensor.numel() as f64;
        error_sq += compressed.stats.rmse.powi(2) * numel;
        original_sq += tensor
            .values
            .iter()
            .map(|&w| f64::from(w) * f64::from(w))
            .sum::<f64>();
        compressed_bits += compressed.storage_bits;
        applied.extend(compressed.applied.iter().copied());
        tensors.push(compressed.encoded);
    }
    applied.sort_unstable();
    applied.dedup();

    let param_count = layer.param_count();
    let residual_error = if original_sq > 0.0 {
        (error_sq / original_sq).sqrt()
    } else {
        0.0
    };
    let report = LayerReport {
        layer_name: layer.name.clone(),
        role: layer.role,
        param_count,
        original_bits: layer.original_bits(),
        compressed_bits,
        achieved_bits_per_weight: if param_count > 0 {
            compressed_bits as f64 / param_count as f64
        } else {
            0.0
        },
        residual_error,
        degraded: !reasons.is_empty(),
        degrade_reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
        techniques: applied,
    };
    Ok(CompressedLayer { report, tensors })
}

fn compress_tensor(
    tensor: &WeightTensor,
    layer: &Layer,
    techniques: &[Box<dyn Technique>],
    signal: &CalibrationSignal,
) -> TensorOutcome {
    if techniques.is_empty() || !tensor.is_matrix() {
        debug!("{}: stored as-is", tensor.name);
        return match CompressedTensor::store_as_is(tensor) {
            Ok(stored) => TensorOutcome::Ok(stored),
            Err(reason) => TensorOutcome::Fatal(reason),
        };
    }
    run_chain(tensor, &signal.slice_for(tensor), layer.role, techniques)
}

/// Compress a model file or shard directory at a named level.
///
/// Fails with `InvalidRequest` for an unknown level before the model is
/// touched.
pub fn compress(
    model_reference: &str,
    level: &str,
    options: CompressOptions,
) -> Result<CompressedArtifact> {
    let chain = resolve(level)?;
    let mut model = Model::open(model_reference)?.with_layer_cache(options.cache_layers);
    CompressionPipeline::new(options).run(&mut model, chain)
}

/// Compress an already opened model at `level`.
pub fn compress_model(
    model: &mut Model,
    level: Level,
    options: CompressOptions,
) -> Result<CompressedArtifact> {
    CompressionPipeline::new(options).run(model, level.chain())
}

/// Compress with a caller-built chain.
pub fn compress_with_chain(
    model: &mut Model,
    chain: TechniqueChain,
    options: CompressOptions,
) -> Result<CompressedArtifact> {
    CompressionPipeline::new(options).run(model, chain)
}

/// Compress at every level, calibrating once.
///
/// A failure at one level does not stop the others.
pub fn compress_all_levels(
    model: &mut Model,
    options: CompressOptions,
) -> Result<Vec<(Level, Result<CompressedArtifact>)>> {
    let mut options = options;
    if options.activation_stats.is_none() {
        let samples = options.calibration_samples.as_deref().unwrap_or_default();
        if !samples.is_empty() {
            let control = RunControl::new(options.cancel.clone(), options.deadline);
            let signal = CalibrationSampler::new(options.calibration.clone())
                .calibrate(model, samples, &control)?;
            options.activation_stats = Some(signal);
        }
    }

    Ok(Level::ALL
        .into_iter()
        .map(|level| {
            let result = compress_model(model, level, options.clone());
            if let Err(e) = &result {
                warn!("Level {level} failed: {e}");
            }
            (level, result)
        })
        .collect())
}

/// [`compress`] on tokio's blocking pool.
pub async fn compress_async(
    model_reference: String,
    level: String,
    options: CompressOptions,
) -> Result<CompressedArtifact> {
    tokio::task::spawn_blocking(move || compress(&model_reference, &level, options))
        .await
        .map_err(|e| {
            NanoquantError::InternalInvariantViolation(format!("compression task failed: {e}"))
        })?
}
