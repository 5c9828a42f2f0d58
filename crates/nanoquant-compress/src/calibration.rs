//! Calibration: per-channel importance from representative inputs.
//!
//! Samples enter as the hidden state after the embedding. Layers are
//! visited in order; each matrix tensor `W` (rows × cols) is driven with
//! the activations reaching its layer, cycled or truncated to its width
//! (`x_j = act[j mod len]`), and two statistics are accumulated:
//! - channel scores: mean `|W x|` per output row
//! - input scores: RMS of each input column
//!
//! The layer's output (its last matrix tensor's `W x`, rescaled to unit RMS
//! per sample) becomes the next layer's input. Embedding layers are scored
//! but do not replace the activations.
//!
//! Both statistics are normalized to sum to 1 within the tensor. Rows are
//! processed in parallel but each row's sums run in a fixed order, so the
//! signal is bit-identical for a fixed seed and sample set.
//!
//! Offline activation statistics can be saved and loaded as JSON and used
//! in place of sample inputs.

use crate::control::RunControl;
use crate::model::{LayerRole, Model, WeightTensor};
use nanoquant_core::{NanoquantError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// One representative input vector.
pub type SampleInput = Vec<f32>;

/// Sampler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Upper bound on forward evaluations per tensor
    pub max_samples: usize,
    /// Seed for choosing samples when more than `max_samples` are supplied
    pub seed: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            max_samples: 32,
            seed: 0,
        }
    }
}

/// Normalized importance statistics for one tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSignal {
    /// Per output row, non-negative, summing to 1
    pub channel_scores: Vec<f32>,
    /// Per input column, non-negative, summing to 1
    pub input_scores: Vec<f32>,
}

impl LayerSignal {
    /// Equal importance everywhere.
    #[must_use]
    pub fn uniform(rows: usize, cols: usize) -> Self {
        Self {
            channel_scores: vec![1.0 / rows.max(1) as f32; rows],
            input_scores: vec![1.0 / cols.max(1) as f32; cols],
        }
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.channel_scores.len()
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.input_scores.len()
    }

    /// Per-weight importance `|w_ij| · input_score_j · cols`.
    ///
    /// Under a uniform signal this is plain magnitude. Non-finite weights
    /// rank as most important so nothing hides them.
    #[must_use]
    pub fn weight_importance(&self, values: &[f32]) -> Vec<f32> {
        let cols = self.cols().max(1);
        let scale = cols as f32;
        values
            .iter()
            .enumerate()
            .map(|(i, w)| {
                if w.is_finite() {
                    w.abs() * self.input_scores.get(i % cols).copied().unwrap_or(0.0) * scale
                } else {
                    f32::MAX
                }
            })
            .collect()
    }
}

/// Calibration output for a whole model, keyed by tensor name.
///
/// Empty means uniform: every lookup falls back to [`LayerSignal::uniform`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSignal {
    pub samples_used: usize,
    pub seed: u64,
    pub tensors: BTreeMap<String, LayerSignal>,
}

impl CalibrationSignal {
    /// The calibration-free signal.
    #[must_use]
    pub fn uniform() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_uniform(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Statistics for a tensor, or uniform if none match its shape.
    #[must_use]
    pub fn slice_for(&self, tensor: &WeightTensor) -> Cow<'_, LayerSignal> {
        let (rows, cols) = tensor.matrix_dims();
        match self.tensors.get(&tensor.name) {
            Some(signal) if signal.rows() == rows && signal.cols() == cols => {
                Cow::Borrowed(signal)
            }
            _ => Cow::Owned(LayerSignal::uniform(rows, cols)),
        }
    }

    /// Load offline activation statistics from JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        serde_json::from_slice(&bytes).map_err(|e| {
            NanoquantError::CalibrationFailed(format!(
                "invalid activation statistics {}: {e}",
                path.as_ref().display()
            ))
        })
    }

    /// Save as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| NanoquantError::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Runs sample inputs through a model to produce a [`CalibrationSignal`].
#[derive(Debug, Clone, Default)]
pub struct CalibrationSampler {
    config: CalibrationConfig,
}

impl CalibrationSampler {
    #[must_use]
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// Accumulate statistics for every matrix tensor, one layer at a time.
    ///
    /// Fails with `CalibrationFailed` when no usable samples are supplied.
    pub fn calibrate(
        &self,
        model: &mut Model,
        samples: &[SampleInput],
        control: &RunControl,
    ) -> Result<CalibrationSignal> {
        let chosen = self.select(samples)?;
        info!(
            "Calibrating {} layers with {} of {} samples",
            model.layer_count(),
            chosen.len(),
            samples.len()
        );

        let mut activations: Vec<Vec<f32>> = chosen.iter().map(|s| s.to_vec()).collect();
        let mut tensors = BTreeMap::new();
        for index in 0..model.layer_count() {
            control.check()?;
            let layer = model.layer(index)?;
            let mut layer_output = None;
            for tensor in layer.tensors.iter().filter(|t| t.is_matrix()) {
                debug!("Accumulating statistics for {}", tensor.name);
                let (signal, outputs) = accumulate(tensor, &activations);
                tensors.insert(tensor.name.clone(), signal);
                layer_output = Some(outputs);
            }
            if layer.role == LayerRole::Embedding {
                continue;
            }
            if let Some(outputs) = layer_output {
                for (act, out) in activations.iter_mut().zip(outputs) {
                    if let Some(next) = unit_rms(out) {
                        *act = next;
                    }
                }
            }
        }

        Ok(CalibrationSignal {
            samples_used: chosen.len(),
            seed: self.config.seed,
            tensors,
        })
    }

    /// Pick at most `max_samples` inputs, in ascending index order.
    fn select<'a>(&self, samples: &'a [SampleInput]) -> Result<Vec<&'a [f32]>> {
        if samples.is_empty() {
            return Err(NanoquantError::CalibrationFailed(
                "no sample inputs supplied".to_string(),
            ));
        }
        if let Some(pos) = samples.iter().position(|s| s.is_empty()) {
            return Err(NanoquantError::CalibrationFailed(format!(
                "sample {pos} is empty"
            )));
        }
        if self.config.max_samples == 0 {
            return Err(NanoquantError::CalibrationFailed(
                "max_samples must be positive".to_string(),
            ));
        }

        let indices = if samples.len() > self.config.max_samples {
            let mut rng = StdRng::seed_from_u64(self.config.seed);
            let mut picked =
                rand::seq::index::sample(&mut rng, samples.len(), self.config.max_samples)
                    .into_vec();
            picked.sort_unstable();
            picked
        } else {
            (0..samples.len()).collect()
        };

        Ok(indices.into_iter().map(|i| samples[i].as_slice()).collect())
    }
}

/// Statistics for one tensor plus its per-sample outputs `W x`.
fn accumulate(tensor: &WeightTensor, activations: &[Vec<f32>]) -> (LayerSignal, Vec<Vec<f64>>) {
    let (rows, cols) = tensor.matrix_dims();
    let count = activations.len() as f64;
    let input = |act: &[f32], j: usize| f64::from(act[j % act.len()]);

    // outputs[i][s]: row i driven by sample s
    let by_row: Vec<Vec<f64>> = (0..rows)
        .into_par_iter()
        .map(|i| {
            let row = &tensor.values[i * cols..(i + 1) * cols];
            activations
                .iter()
                .map(|act| {
                    row.iter()
                        .enumerate()
                        .map(|(j, &w)| f64::from(w) * input(act.as_slice(), j))
                        .sum::<f64>()
                })
                .collect()
        })
        .collect();

    let channel: Vec<f64> = by_row
        .iter()
        .map(|outs| outs.iter().map(|y| y.abs()).sum::<f64>() / count)
        .collect();

    let inputs: Vec<f64> = (0..cols)
        .into_par_iter()
        .map(|j| {
            let mean_sq = activations
                .iter()
                .map(|a| input(a.as_slice(), j).powi(2))
                .sum::<f64>()
                / count;
            mean_sq.sqrt()
        })
        .collect();

    let outputs = (0..activations.len())
        .map(|s| by_row.iter().map(|outs| outs[s]).collect())
        .collect();

    (
        LayerSignal {
            channel_scores: normalize(&channel),
            input_scores: normalize(&inputs),
        },
        outputs,
    )
}

/// Rescale to unit RMS; `None` when the vector carries no signal.
fn unit_rms(values: Vec<f64>) -> Option<Vec<f32>> {
    if values.is_empty() {
        return None;
    }
    let rms = (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt();
    if !(rms.is_finite() && rms > 0.0) {
        return None;
    }
    Some(values.iter().map(|v| (v / rms) as f32).collect())
}

fn normalize(values: &[f64]) -> Vec<f32> {
    let sum: f64 = values.iter().sum();
    if !(sum.is_finite() && sum > 0.0) {
        return vec![1.0 / values.len().max(1) as f32; values.len()];
    }
    values.iter().map(|v| (v / sum) as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Layer;
    use nanoquant_core::DType;

    fn model() -> Model {
        let values: Vec<f32> = (0..24).map(|i| (i as f32 * 0.37).sin()).collect();
        let tensor = WeightTensor::new("l.weight", vec![4, 6], DType::Float32, values).unwrap();
        let bias = WeightTensor::new("l.bias", vec![4], DType::Float32, vec![0.1; 4]).unwrap();
        Model::from_layers("m", vec![Layer::new("l", vec![tensor, bias])])
    }

    fn samples(n: usize) -> Vec<SampleInput> {
        (0..n)
            .map(|s| (0..6).map(|j| ((s * 7 + j) as f32 * 0.11).cos()).collect())
            .collect()
    }

    #[test]
    fn test_scores_are_normalized() {
        let sampler = CalibrationSampler::default();
        let signal = sampler
            .calibrate(&mut model(), &samples(4), &RunControl::unbounded())
            .unwrap();
        let layer = &signal.tensors["l.weight"];
        let channel_sum: f32 = layer.channel_scores.iter().sum();
        let input_sum: f32 = layer.input_scores.iter().sum();
        assert!((channel_sum - 1.0).abs() < 1e-5);
        assert!((input_sum - 1.0).abs() < 1e-5);
        assert!(layer.channel_scores.iter().all(|s| *s >= 0.0));
        assert!(!signal.tensors.contains_key("l.bias"));
    }

    #[test]
    fn test_inputs_follow_the_previous_layer() {
        let weights = |phase: f32| -> Vec<f32> {
            (0..36).map(|i| (i as f32 * 0.53 + phase).sin()).collect()
        };
        let a = WeightTensor::new("a.weight", vec![6, 6], DType::Float32, weights(0.0)).unwrap();
        let b = WeightTensor::new("b.weight", vec![6, 6], DType::Float32, weights(1.3)).unwrap();
        let first = a.values.clone();
        let mut model = Model::from_layers(
            "two",
            vec![Layer::new("a", vec![a]), Layer::new("b", vec![b])],
        );

        let inputs = samples(1);
        let signal = CalibrationSampler::default()
            .calibrate(&mut model, &inputs, &RunControl::unbounded())
            .unwrap();
        let a_scores = &signal.tensors["a.weight"].input_scores;
        let b_scores = &signal.tensors["b.weight"].input_scores;
        assert_ne!(a_scores, b_scores);

        // With one sample, b's inputs are |W_a x| up to scale
        let x = &inputs[0];
        let y: Vec<f64> = (0..6)
            .map(|i| {
                (0..6)
                    .map(|j| f64::from(first[i * 6 + j]) * f64::from(x[j]))
                    .sum::<f64>()
                    .abs()
            })
            .collect();
        let total: f64 = y.iter().sum();
        for (score, expected) in b_scores.iter().zip(&y) {
            assert!((f64::from(*score) - expected / total).abs() < 1e-5);
        }
    }

    #[test]
    fn test_embedding_does_not_replace_samples() {
        let embed =
            WeightTensor::new("embed_tokens.weight", vec![3, 6], DType::Float32, vec![0.5; 18])
                .unwrap();
        let proj = WeightTensor::new(
            "layers.0.mlp.up_proj.weight",
            vec![4, 6],
            DType::Float32,
            vec![0.25; 24],
        )
        .unwrap();
        let mut model = Model::from_layers(
            "m",
            vec![
                Layer::new("embed_tokens", vec![embed]),
                Layer::new("layers.0.mlp.up_proj", vec![proj]),
            ],
        );
        let signal = CalibrationSampler::default()
            .calibrate(&mut model, &samples(2), &RunControl::unbounded())
            .unwrap();
        assert_eq!(
            signal.tensors["embed_tokens.weight"].input_scores,
            signal.tensors["layers.0.mlp.up_proj.weight"].input_scores
        );
    }

    #[test]
    fn test_calibration_is_deterministic() {
        let config = CalibrationConfig {
            max_samples: 3,
            seed: 11,
        };
        let inputs = samples(10);
        let a = CalibrationSampler::new(config.clone())
            .calibrate(&mut model(), &inputs, &RunControl::unbounded())
            .unwrap();
        let b = CalibrationSampler::new(config)
            .calibrate(&mut model(), &inputs, &RunControl::unbounded())
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.samples_used, 3);
    }

    #[test]
    fn test_no_samples_fails() {
        let err = CalibrationSampler::default()
            .calibrate(&mut model(), &[], &RunControl::unbounded())
            .unwrap_err();
        assert!(matches!(err, NanoquantError::CalibrationFailed(_)));

        let err = CalibrationSampler::default()
            .calibrate(&mut model(), &[vec![]], &RunControl::unbounded())
            .unwrap_err();
        assert!(matches!(err, NanoquantError::CalibrationFailed(_)));
    }

    #[test]
    fn test_zero_weights_fall_back_to_uniform() {
        let tensor = WeightTensor::new("z.weight", vec![2, 2], DType::Float32, vec![0.0; 4]).unwrap();
        let mut model = Model::from_layers("z", vec![Layer::new("z", vec![tensor])]);
        let signal = CalibrationSampler::default()
            .calibrate(&mut model, &samples(2), &RunControl::unbounded())
            .unwrap();
        assert_eq!(signal.tensors["z.weight"].channel_scores, vec![0.5, 0.5]);
    }

    #[test]
    fn test_slice_for_falls_back_on_shape_mismatch() {
        let signal = CalibrationSignal::uniform();
        let tensor = WeightTensor::new("x", vec![2, 5], DType::Float32, vec![1.0; 10]).unwrap();
        let slice = signal.slice_for(&tensor);
        assert_eq!(slice.rows(), 2);
        assert_eq!(slice.cols(), 5);
        assert!((slice.input_scores[0] - 0.2).abs() < 1e-7);
    }

    #[test]
    fn test_uniform_importance_is_magnitude() {
        let signal = LayerSignal::uniform(1, 4);
        let importance = signal.weight_importance(&[1.0, -2.0, 0.5, f32::NAN]);
        assert_eq!(&importance[..3], &[1.0, 2.0, 0.5]);
        assert_eq!(importance[3], f32::MAX);
    }

    #[test]
    fn test_offline_stats_round_trip_through_json() {
        let signal = CalibrationSampler::default()
            .calibrate(&mut model(), &samples(3), &RunControl::unbounded())
            .unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stats.json");
        signal.save(&path).unwrap();
        assert_eq!(CalibrationSignal::load(&path).unwrap(), signal);
    }
}
