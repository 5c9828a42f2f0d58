//! Integration tests for nanoquant-compress.
//!
//! End-to-end runs over small synthetic models: level scenarios, the
//! invariants every level must keep, and the file-based round trip.

use nanoquant_compress::artifact::{ArtifactPackager, ArtifactReader};
use nanoquant_compress::calibration::{CalibrationConfig, CalibrationSampler, SampleInput};
use nanoquant_compress::control::{CancellationToken, RunControl};
use nanoquant_compress::formats::{SafetensorsReader, SafetensorsWriter};
use nanoquant_compress::model::{
    InMemorySource, Layer, LayerDescriptor, LayerRole, Model, ModelSource, WeightTensor,
};
use nanoquant_compress::pipeline::{
    compress, compress_all_levels, compress_async, compress_model, CompressOptions,
    CompressionPipeline, PipelineState,
};
use nanoquant_compress::policy::{resolve, Level};
use nanoquant_compress::techniques::salient::salient_count;
use nanoquant_compress::techniques::TechniqueKind;
use nanoquant_compress::CompressedArtifact;
use nanoquant_core::{CodecKind, DType, ErrorKind, NanoquantError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const EMBED: &str = "model.embed_tokens.weight";
const Q_PROJ: &str = "model.layers.0.self_attn.q_proj.weight";

/// Smooth weights rounded to bf16, so source values are representable.
fn bf16_weights(len: usize, step: f32, amplitude: f32) -> Vec<f32> {
    (0..len)
        .map(|i| DType::BFloat16.round_trip((i as f32 * step + 0.3).sin() * amplitude))
        .collect()
}

/// Two layers: a 1000-weight embedding and a 4000-weight attention projection.
fn two_layer_model() -> Model {
    let embed = WeightTensor::new(
        EMBED,
        vec![8, 125],
        DType::BFloat16,
        bf16_weights(1000, 0.731, 0.02),
    )
    .unwrap();
    let q_proj = WeightTensor::new(
        Q_PROJ,
        vec![16, 250],
        DType::BFloat16,
        bf16_weights(4000, 0.377, 0.05),
    )
    .unwrap();
    Model::from_layers(
        "synthetic-2l",
        vec![
            Layer::new("model.embed_tokens", vec![embed]),
            Layer::new("model.layers.0.self_attn.q_proj", vec![q_proj]),
        ],
    )
}

fn samples(count: usize, len: usize) -> Vec<SampleInput> {
    (0..count)
        .map(|s| {
            (0..len)
                .map(|j| ((s * 31 + j) as f32 * 0.173).cos())
                .collect()
        })
        .collect()
}

fn calibrated() -> CompressOptions {
    CompressOptions::default().with_calibration_samples(samples(8, 250))
}

fn reader(artifact: &CompressedArtifact) -> ArtifactReader {
    ArtifactReader::from_bytes(artifact.payload().to_vec()).unwrap()
}

// ============================================================================
// Level Scenarios
// ============================================================================

#[test]
fn test_light_scenario() {
    let mut model = two_layer_model();
    let artifact = compress_model(&mut model, Level::Light, CompressOptions::default()).unwrap();

    let ratio = artifact.size_ratio();
    assert!((0.30..=0.50).contains(&ratio), "ratio {ratio}");

    let report = artifact.per_layer_report();
    assert_eq!(report.len(), 2);
    assert!(report.iter().all(|layer| !layer.degraded));
    assert_eq!(report[0].role, LayerRole::Embedding);
    assert_eq!(report[1].role, LayerRole::Attention);
    assert!(artifact.estimated_quality_loss() < 0.2);
}

#[test]
fn test_atomic_scenario() {
    let mut model = two_layer_model();
    let artifact = compress_model(&mut model, Level::Atomic, calibrated()).unwrap();

    assert!(artifact.size_ratio() <= 0.01, "ratio {}", artifact.size_ratio());
    let report = artifact.per_layer_report();
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].layer_name, "model.embed_tokens");
    assert_eq!(report[1].layer_name, "model.layers.0.self_attn.q_proj");
    assert!((0.0..=1.0).contains(&artifact.estimated_quality_loss()));
}

#[test]
fn test_unknown_level_is_invalid_request() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("never-opened.safetensors");

    let err = compress(missing.to_str().unwrap(), "galactic", CompressOptions::default())
        .unwrap_err();
    assert!(matches!(err, NanoquantError::InvalidRequest(_)));
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[test]
fn test_all_zero_model_is_not_degraded() {
    let zeros = WeightTensor::new(Q_PROJ, vec![16, 250], DType::BFloat16, vec![0.0; 4000])
        .unwrap();
    let mut model = Model::from_layers(
        "zeros",
        vec![Layer::new("model.layers.0.self_attn.q_proj", vec![zeros])],
    );

    let artifact = compress_model(&mut model, Level::Medium, CompressOptions::default()).unwrap();
    let report = &artifact.per_layer_report()[0];
    assert!(!report.degraded);
    assert_eq!(report.residual_error, 0.0);
    assert!(reader(&artifact)
        .reconstruct(Q_PROJ)
        .unwrap()
        .iter()
        .all(|&v| v == 0.0));
}

// ============================================================================
// Invariants
// ============================================================================

#[test]
fn test_bits_per_weight_is_monotonic_across_levels() {
    let mut model = two_layer_model();
    let results = compress_all_levels(&mut model, calibrated()).unwrap();
    assert_eq!(results.len(), Level::ALL.len());

    let mut previous = f64::INFINITY;
    for (level, result) in results {
        let artifact = result.unwrap();
        let bpw = artifact.model().bits_per_weight();
        assert!(bpw <= previous, "{level}: {bpw} > {previous}");
        previous = bpw;
    }
}

#[test]
fn test_element_count_is_preserved_at_every_level() {
    let mut model = two_layer_model();
    for level in Level::ALL {
        let artifact = compress_model(&mut model, level, calibrated()).unwrap();
        let reader = reader(&artifact);
        assert_eq!(reader.reconstruct(EMBED).unwrap().len(), 1000, "{level}");
        assert_eq!(reader.reconstruct(Q_PROJ).unwrap().len(), 4000, "{level}");
        for layer in artifact.per_layer_report() {
            assert!(layer.param_count > 0);
        }
    }
}

#[test]
fn test_calibration_is_deterministic() {
    let sampler = CalibrationSampler::new(CalibrationConfig {
        max_samples: 4,
        seed: 17,
    });
    let inputs = samples(12, 250);

    let first = sampler
        .calibrate(&mut two_layer_model(), &inputs, &RunControl::unbounded())
        .unwrap();
    let second = sampler
        .calibrate(&mut two_layer_model(), &inputs, &RunControl::unbounded())
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first.samples_used, 4);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn test_super_weights_are_preserved() {
    let inputs = samples(8, 250);
    let signal = CalibrationSampler::new(CalibrationConfig::default())
        .calibrate(&mut two_layer_model(), &inputs, &RunControl::unbounded())
        .unwrap();
    let options = CompressOptions::default().with_activation_stats(signal.clone());

    let mut model = two_layer_model();
    let original = model.layer(1).unwrap().tensors[0].clone();
    let importance = signal.slice_for(&original).weight_importance(&original.values);
    let count = salient_count(0.001, original.numel());
    let mut ranked: Vec<usize> = (0..original.numel()).collect();
    ranked.sort_by(|&a, &b| importance[b].total_cmp(&importance[a]).then(a.cmp(&b)));

    for level in [Level::Ultra, Level::Nano, Level::Atomic] {
        let artifact = compress_model(&mut model, level, options.clone()).unwrap();
        let decoded = reader(&artifact).reconstruct(Q_PROJ).unwrap();
        for &i in &ranked[..count] {
            assert_eq!(decoded[i], original.values[i], "{level} index {i}");
        }
    }
}

#[test]
fn test_preservation_can_be_disabled() {
    let mut model = two_layer_model();
    let options = CompressOptions::default().with_preserve_super_weights(false);
    let artifact = compress_model(&mut model, Level::Light, options).unwrap();
    for layer in artifact.per_layer_report() {
        assert!(!layer.techniques.contains(&TechniqueKind::Salient));
        assert!(layer.techniques.contains(&TechniqueKind::MixedPrecision));
    }
}

#[test]
fn test_packaging_is_idempotent() {
    let mut model = two_layer_model();
    let artifact = compress_model(&mut model, Level::Heavy, calibrated()).unwrap();

    let packager = ArtifactPackager::new(CodecKind::Zstd, 3);
    let first = packager.pack(artifact.model()).unwrap();
    let second = packager.pack(artifact.model()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, artifact.payload());
}

#[test]
fn test_repeated_runs_produce_identical_artifacts() {
    let first = compress_model(&mut two_layer_model(), Level::Extreme, calibrated()).unwrap();
    let second = compress_model(&mut two_layer_model(), Level::Extreme, calibrated()).unwrap();
    assert_eq!(first.digest(), second.digest());
}

// ============================================================================
// Degradation, Cancellation and Deadlines
// ============================================================================

#[test]
fn test_unrepresentable_layer_degrades_and_is_stored_as_is() {
    let huge: Vec<f32> = (0..1024).map(|i| (i as f32 * 0.11).sin() * 1.0e6).collect();
    let tensor = WeightTensor::new(
        "model.layers.0.mlp.up_proj.weight",
        vec![8, 128],
        DType::Float32,
        huge.clone(),
    )
    .unwrap();
    let mut model = Model::from_layers(
        "huge",
        vec![Layer::new("model.layers.0.mlp.up_proj", vec![tensor])],
    );

    let artifact = compress_model(&mut model, Level::Light, CompressOptions::default()).unwrap();
    let report = &artifact.per_layer_report()[0];
    assert!(report.degraded);
    assert!(report.degrade_reason.is_some());
    assert_eq!(report.achieved_bits_per_weight, 32.0);
    assert_eq!(
        reader(&artifact)
            .reconstruct("model.layers.0.mlp.up_proj.weight")
            .unwrap(),
        huge
    );
}

#[test]
fn test_tiny_magnitude_layer_degrades_instead_of_collapsing() {
    let tiny: Vec<f32> = (0..4000).map(|i| (i as f32 * 0.377 + 0.3).sin() * 1.0e-7).collect();
    let tensor = WeightTensor::new(Q_PROJ, vec![16, 250], DType::Float32, tiny.clone()).unwrap();
    let mut model = Model::from_layers(
        "tiny",
        vec![Layer::new("model.layers.0.self_attn.q_proj", vec![tensor])],
    );

    let artifact = compress_model(&mut model, Level::Light, CompressOptions::default()).unwrap();
    let report = &artifact.per_layer_report()[0];
    assert!(report.degraded, "residual {}", report.residual_error);
    assert!(report.degrade_reason.is_some());
    assert_eq!(report.residual_error, 0.0);
    assert_eq!(reader(&artifact).reconstruct(Q_PROJ).unwrap(), tiny);
}

#[test]
fn test_cancelled_run_produces_no_artifact() {
    let token = CancellationToken::new();
    token.cancel();
    let options = CompressOptions::default().with_cancellation(token);

    let err = compress_model(&mut two_layer_model(), Level::Light, options).unwrap_err();
    assert!(matches!(err, NanoquantError::Cancelled));
}

#[test]
fn test_zero_deadline_is_exceeded() {
    let options = CompressOptions::default().with_deadline(Duration::ZERO);
    let err = compress_model(&mut two_layer_model(), Level::Light, options).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
}

/// Serves in-memory layers after a fixed delay and records the worker pool
/// each read ran on.
struct SlowSource {
    inner: InMemorySource,
    delay: Duration,
    reads: Arc<Mutex<Vec<(usize, String)>>>,
}

impl ModelSource for SlowSource {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn descriptors(&self) -> &[LayerDescriptor] {
        self.inner.descriptors()
    }

    fn load_layer(&mut self, index: usize) -> nanoquant_core::Result<Layer> {
        std::thread::sleep(self.delay);
        let thread = std::thread::current().name().unwrap_or_default().to_string();
        self.reads
            .lock()
            .unwrap()
            .push((rayon::current_num_threads(), thread));
        self.inner.load_layer(index)
    }
}

fn slow_model(layers: usize, delay: Duration) -> (Model, Arc<Mutex<Vec<(usize, String)>>>) {
    let layers = (0..layers)
        .map(|i| {
            let name = format!("model.layers.{i}.mlp.up_proj");
            let tensor = WeightTensor::new(
                format!("{name}.weight"),
                vec![8, 64],
                DType::BFloat16,
                bf16_weights(512, 0.29 + i as f32 * 0.01, 0.05),
            )
            .unwrap();
            Layer::new(name, vec![tensor])
        })
        .collect();
    let reads = Arc::new(Mutex::new(Vec::new()));
    let source = SlowSource {
        inner: InMemorySource::new("slow", layers),
        delay,
        reads: Arc::clone(&reads),
    };
    (Model::from_source(Box::new(source)), reads)
}

#[test]
fn test_deadline_expiring_mid_run_aborts() {
    let (mut model, reads) = slow_model(8, Duration::from_millis(40));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    let options = CompressOptions::default().with_deadline(Duration::from_millis(100));
    let mut pipeline = CompressionPipeline::new(options)
        .with_observer(Box::new(move |state: &PipelineState| {
            observed.lock().unwrap().push(*state);
        }));

    let err = pipeline.run(&mut model, resolve("light").unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert_eq!(pipeline.state(), PipelineState::Aborted);

    let seen = seen.lock().unwrap();
    assert!(seen
        .iter()
        .any(|s| matches!(s, PipelineState::Compressing { layer: 1, of: 8 })));
    assert!(!seen.contains(&PipelineState::Packaging));
    assert_eq!(seen.last(), Some(&PipelineState::Aborted));
    let read = reads.lock().unwrap().len();
    assert!(read > 0 && read < 8, "{read} layers read");
}

#[test]
fn test_concurrency_limit_sizes_the_worker_pool() {
    for limit in [1, 3] {
        let (mut model, reads) = slow_model(3, Duration::ZERO);
        let options = CompressOptions::default().with_concurrency_limit(limit);
        compress_model(&mut model, Level::Medium, options).unwrap();

        let reads = reads.lock().unwrap();
        assert_eq!(reads.len(), 3);
        for (pool, thread) in reads.iter() {
            assert_eq!(*pool, limit);
            assert!(thread.starts_with("nanoquant-"), "{thread}");
        }
    }

    let err = compress_model(
        &mut two_layer_model(),
        Level::Light,
        CompressOptions::default().with_concurrency_limit(0),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[test]
fn test_heavy_without_samples_fails_calibration() {
    let err =
        compress_model(&mut two_layer_model(), Level::Heavy, CompressOptions::default())
            .unwrap_err();
    assert!(matches!(err, NanoquantError::CalibrationFailed(_)));
}

// ============================================================================
// File Round Trips
// ============================================================================

fn write_model(dir: &TempDir) -> std::path::PathBuf {
    let mut writer = SafetensorsWriter::new();
    writer
        .add_tensor_f32(EMBED, &bf16_weights(1000, 0.731, 0.02), DType::BFloat16, vec![8, 125])
        .unwrap();
    writer
        .add_tensor_f32(Q_PROJ, &bf16_weights(4000, 0.377, 0.05), DType::BFloat16, vec![16, 250])
        .unwrap();
    let path = dir.path().join("model.safetensors");
    writer.write_file(&path).unwrap();
    path
}

#[test]
fn test_compress_file_and_decompress() {
    let dir = TempDir::new().unwrap();
    let input = write_model(&dir);

    let options = CompressOptions::default().with_codec(CodecKind::Lz4, 0);
    let artifact = compress(input.to_str().unwrap(), "medium", options).unwrap();
    assert_eq!(artifact.level(), "medium");

    let nqa = dir.path().join("model.nqa");
    artifact.write_file(&nqa).unwrap();
    let reader = ArtifactReader::open(&nqa).unwrap();
    assert_eq!(reader.header().codec, CodecKind::Lz4);
    assert_eq!(reader.header().layers.len(), 2);

    let restored = dir.path().join("restored.safetensors");
    reader.to_safetensors().unwrap().write_file(&restored).unwrap();

    let mut st = SafetensorsReader::open(&restored).unwrap();
    assert_eq!(st.tensor_meta(Q_PROJ).unwrap().dtype, DType::BFloat16);
    assert_eq!(st.read_tensor_f32(EMBED).unwrap().len(), 1000);
    assert_eq!(st.read_tensor_f32(Q_PROJ).unwrap().len(), 4000);
}

#[test]
fn test_default_run_keeps_no_layers_resident() {
    let dir = TempDir::new().unwrap();
    let input = write_model(&dir);
    let options = CompressOptions::default();
    assert!(!options.cache_layers);

    let mut model = Model::open(&input).unwrap().with_layer_cache(options.cache_layers);
    compress_model(&mut model, Level::Light, options).unwrap();
    assert_eq!(model.cached_layers(), 0);
    assert_eq!(model.fetch_count(), 2);

    // Calibration and compression each stream every layer once
    let mut model = Model::open(&input).unwrap();
    compress_model(&mut model, Level::Heavy, calibrated()).unwrap();
    assert_eq!(model.cached_layers(), 0);
    assert_eq!(model.fetch_count(), 4);
}

#[test]
fn test_missing_model_is_source_unavailable() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.safetensors");
    let err = compress(missing.to_str().unwrap(), "light", CompressOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
}

#[tokio::test]
async fn test_compress_async() {
    let dir = TempDir::new().unwrap();
    let input = write_model(&dir);

    let artifact = compress_async(
        input.to_string_lossy().into_owned(),
        "light".to_string(),
        CompressOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(artifact.per_layer_report().len(), 2);
}
