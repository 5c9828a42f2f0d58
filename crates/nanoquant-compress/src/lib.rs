//! # nanoquant-compress
//!
//! Multi-level weight compression for large language models.
//!
//! A model is compressed at one of seven named levels, from `light`
//! (mixed 4/8-bit precision with light pruning) to `atomic` (count-sketch
//! and binary tiers at 95% block sparsity). Each level resolves to an
//! ordered chain of techniques that is applied layer by layer, and the
//! result is packed into a self-describing `.nqa` artifact.
//!
//! ## Quick Start
//!
//! ```rust
//! use nanoquant_compress::{compress_model, CompressOptions, Level, Model};
//! use nanoquant_compress::model::{Layer, WeightTensor};
//! use nanoquant_core::DType;
//!
//! let values: Vec<f32> = (0..8192).map(|i| (i as f32 * 0.37).cos() * 0.05).collect();
//! let tensor =
//!     WeightTensor::new("model.layers.0.mlp.up_proj.weight", vec![64, 128], DType::BFloat16, values)
//!         .unwrap();
//! let layer = Layer::new("model.layers.0.mlp.up_proj", vec![tensor]);
//! let mut model = Model::from_layers("tiny", vec![layer]);
//!
//! let artifact = compress_model(&mut model, Level::Medium, CompressOptions::default()).unwrap();
//! println!("size ratio {:.3}", artifact.size_ratio());
//! ```
//!
//! ## Modules
//!
//! - [`model`] - Model sources, layers and tensors
//! - [`calibration`] - Activation statistics from sample inputs
//! - [`techniques`] - The compression techniques and chain execution
//! - [`policy`] - Levels and technique chains
//! - [`pipeline`] - The run state machine and entry points
//! - [`artifact`] - The `.nqa` container, packager and reader

pub mod artifact;
pub mod calibration;
pub mod control;
pub mod encoding;
pub mod formats;
pub mod model;
pub mod packing;
pub mod pipeline;
pub mod policy;
pub mod quantize;
pub mod techniques;

// Re-export main types
pub use artifact::{
    ArtifactHeader, ArtifactPackager, ArtifactReader, CompressedArtifact, LayerReport,
};
pub use calibration::{CalibrationConfig, CalibrationSampler, CalibrationSignal, SampleInput};
pub use control::CancellationToken;
pub use formats::{SafetensorsReader, SafetensorsWriter};
pub use model::{LayerRole, Model, ModelSummary};
pub use pipeline::{
    compress, compress_all_levels, compress_async, compress_model, compress_with_chain,
    CompressOptions, CompressionPipeline, PipelineState,
};
pub use policy::{resolve, Level, TechniqueChain, TechniqueSpec};
