//! Tensor access: models, layers and the sources they are loaded from.
//!
//! A [`Model`] is an ordered list of layers backed by a [`ModelSource`].
//! Layers are fetched one at a time so peak memory stays at a single
//! layer's weights; with the layer cache enabled, re-iterating a model
//! serves layers from memory instead of re-reading the source.
//!
//! ## Example
//!
//! ```no_run
//! use nanoquant_compress::model::Model;
//!
//! let mut model = Model::open("checkpoints/tiny-llama")?;
//! for layer in model.layers() {
//!     let layer = layer?;
//!     println!("{} ({}): {} params", layer.name, layer.role, layer.param_count());
//! }
//! # Ok::<(), nanoquant_core::NanoquantError>(())
//! ```

use crate::formats::{is_safetensors, SafetensorsReader};
use nanoquant_core::types::{checked_numel, DType};
use nanoquant_core::{NanoquantError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Functional role of a layer, inferred from its module path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerRole {
    Embedding,
    Attention,
    Projection,
    Norm,
    Output,
    Other,
}

impl LayerRole {
    /// Infer the role from a tensor or module name.
    #[must_use]
    pub fn infer(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| c == '.' || c == '/')
            .filter(|t| !t.is_empty())
            .collect();
        let has = |needles: &[&str]| {
            tokens
                .iter()
                .any(|t| needles.iter().any(|n| t.starts_with(n) || t.ends_with(n)))
        };

        if has(&["norm", "ln_", "layernorm"]) {
            Self::Norm
        } else if has(&["embed", "wte", "wpe", "tok_"]) {
            Self::Embedding
        } else if has(&["lm_head"]) || tokens.first() == Some(&"output") {
            Self::Output
        } else if has(&[
            "attn", "attention", "q_proj", "k_proj", "v_proj", "o_proj", "query", "key", "value",
        ]) {
            Self::Attention
        } else if has(&["mlp", "fc", "proj", "ffn", "gate", "up", "down", "dense"]) {
            Self::Projection
        } else {
            Self::Other
        }
    }

    /// Lowercase role name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Attention => "attention",
            Self::Projection => "projection",
            Self::Norm => "norm",
            Self::Output => "output",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for LayerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A dense weight tensor widened to f32.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    pub name: String,
    pub shape: Vec<usize>,
    /// Element kind the tensor was stored as; the size baseline.
    pub dtype: DType,
    pub values: Vec<f32>,
}

impl WeightTensor {
    /// Create a tensor, checking that `values` fills `shape`.
    pub fn new(
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DType,
        values: Vec<f32>,
    ) -> Result<Self> {
        let name = name.into();
        let numel = checked_numel(&shape).ok_or_else(|| {
            NanoquantError::InvalidRequest(format!("tensor {name}: shape {shape:?} overflows"))
        })?;
        if numel != values.len() {
            return Err(NanoquantError::InvalidRequest(format!(
                "tensor {name}: shape {shape:?} holds {numel} elements, got {}",
                values.len()
            )));
        }
        if !dtype.is_float() {
            return Err(NanoquantError::UnsupportedFormat(format!(
                "tensor {name}: {dtype:?} is not a floating-point kind"
            )));
        }
        Ok(Self {
            name,
            shape,
            dtype,
            values,
        })
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.values.len()
    }

    /// View as a row-major matrix.
    #[must_use]
    pub fn matrix_dims(&self) -> (usize, usize) {
        matrix_dims(&self.shape)
    }

    /// Whether the tensor has at least two dimensions.
    #[must_use]
    pub fn is_matrix(&self) -> bool {
        self.shape.len() >= 2
    }

    /// Storage cost at the source element kind.
    #[must_use]
    pub fn original_bits(&self) -> u64 {
        self.numel() as u64 * u64::from(self.dtype.bits())
    }
}

/// A named group of weight tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub role: LayerRole,
    pub tensors: Vec<WeightTensor>,
}

impl Layer {
    /// Create a layer, inferring its role from the name.
    #[must_use]
    pub fn new(name: impl Into<String>, tensors: Vec<WeightTensor>) -> Self {
        let name = name.into();
        let role = LayerRole::infer(&name);
        Self {
            name,
            role,
            tensors,
        }
    }

    /// Override the inferred role.
    #[must_use]
    pub fn with_role(mut self, role: LayerRole) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.tensors.iter().map(WeightTensor::numel).sum()
    }

    #[must_use]
    pub fn original_bits(&self) -> u64 {
        self.tensors.iter().map(WeightTensor::original_bits).sum()
    }

    /// Describe this layer without its data.
    #[must_use]
    pub fn descriptor(&self) -> LayerDescriptor {
        LayerDescriptor {
            name: self.name.clone(),
            role: self.role,
            tensors: self
                .tensors
                .iter()
                .map(|t| TensorDescriptor {
                    name: t.name.clone(),
                    shape: t.shape.clone(),
                    dtype: t.dtype,
                })
                .collect(),
        }
    }
}

/// Shape and kind of a tensor, without data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorDescriptor {
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Layer inventory entry, available before any weights are read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub name: String,
    pub role: LayerRole,
    pub tensors: Vec<TensorDescriptor>,
}

impl LayerDescriptor {
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.tensors.iter().map(TensorDescriptor::numel).sum()
    }
}

/// Where a model's layers come from.
///
/// `load_layer` returns an owned copy, so concurrent runs never share
/// tensor state.
pub trait ModelSource: Send {
    /// Stable identifier of the model.
    fn model_id(&self) -> &str;

    /// Ordered layer inventory.
    fn descriptors(&self) -> &[LayerDescriptor];

    /// Load one layer's weights.
    fn load_layer(&mut self, index: usize) -> Result<Layer>;
}

/// Layers held in memory.
pub struct InMemorySource {
    id: String,
    layers: Vec<Layer>,
    descriptors: Vec<LayerDescriptor>,
}

impl InMemorySource {
    #[must_use]
    pub fn new(id: impl Into<String>, layers: Vec<Layer>) -> Self {
        let descriptors = layers.iter().map(Layer::descriptor).collect();
        Self {
            id: id.into(),
            layers,
            descriptors,
        }
    }
}

impl ModelSource for InMemorySource {
    fn model_id(&self) -> &str {
        &self.id
    }

    fn descriptors(&self) -> &[LayerDescriptor] {
        &self.descriptors
    }

    fn load_layer(&mut self, index: usize) -> Result<Layer> {
        self.layers.get(index).cloned().ok_or_else(|| {
            NanoquantError::InternalInvariantViolation(format!("layer index {index} out of range"))
        })
    }
}

/// One safetensors file or a directory of shards.
pub struct SafetensorsSource {
    id: String,
    readers: Vec<SafetensorsReader>,
    descriptors: Vec<LayerDescriptor>,
    /// Reader index for each tensor of each layer
    locations: Vec<Vec<usize>>,
}

impl SafetensorsSource {
    /// Index a file or shard directory. Non-float tensors are skipped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let files = Self::shard_files(path)?;
        info!("Found {} safetensors files in {:?}", files.len(), path);

        let mut readers = Vec::with_capacity(files.len());
        for file in &files {
            debug!("Indexing {:?}", file);
            let reader = SafetensorsReader::open(file).map_err(|e| match e {
                NanoquantError::Io(io) => {
                    NanoquantError::SourceUnavailable(format!("{}: {io}", file.display()))
                }
                other => other,
            })?;
            readers.push(reader);
        }

        let mut descriptors: Vec<LayerDescriptor> = Vec::new();
        let mut locations: Vec<Vec<usize>> = Vec::new();
        let mut by_module: HashMap<String, usize> = HashMap::new();
        let mut skipped = 0usize;

        for (reader_idx, reader) in readers.iter().enumerate() {
            for meta in &reader.header().tensors {
                if !meta.dtype.is_float() {
                    warn!("Skipping non-float tensor {} ({:?})", meta.name, meta.dtype);
                    skipped += 1;
                    continue;
                }
                let module = module_path(&meta.name).to_string();
                let slot = *by_module.entry(module.clone()).or_insert_with(|| {
                    descriptors.push(LayerDescriptor {
                        role: LayerRole::infer(&module),
                        name: module,
                        tensors: Vec::new(),
                    });
                    locations.push(Vec::new());
                    descriptors.len() - 1
                });
                descriptors[slot].tensors.push(TensorDescriptor {
                    name: meta.name.clone(),
                    shape: meta.shape.clone(),
                    dtype: meta.dtype,
                });
                locations[slot].push(reader_idx);
            }
        }

        if descriptors.is_empty() {
            return Err(NanoquantError::UnsupportedFormat(format!(
                "{} contains no floating-point tensors",
                path.display()
            )));
        }

        info!(
            "Indexed {} layers ({} non-float tensors skipped)",
            descriptors.len(),
            skipped
        );

        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            id,
            readers,
            descriptors,
            locations,
        })
    }

    fn shard_files(path: &Path) -> Result<Vec<PathBuf>> {
        if !path.exists() {
            return Err(NanoquantError::SourceUnavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }
        if path.is_file() {
            if !is_safetensors(path) {
                return Err(NanoquantError::UnsupportedFormat(format!(
                    "{} is not a safetensors file",
                    path.display()
                )));
            }
            return Ok(vec![path.to_path_buf()]);
        }

        let entries = std::fs::read_dir(path)
            .map_err(|e| NanoquantError::SourceUnavailable(format!("{}: {e}", path.display())))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(NanoquantError::UnsupportedFormat(format!(
                "no safetensors files in {}",
                path.display()
            )));
        }
        Ok(files)
    }
}

impl ModelSource for SafetensorsSource {
    fn model_id(&self) -> &str {
        &self.id
    }

    fn descriptors(&self) -> &[LayerDescriptor] {
        &self.descriptors
    }

    fn load_layer(&mut self, index: usize) -> Result<Layer> {
        let descriptor = self.descriptors.get(index).ok_or_else(|| {
            NanoquantError::InternalInvariantViolation(format!("layer index {index} out of range"))
        })?;
        debug!("Loading layer {} ({})", index, descriptor.name);

        let mut tensors = Vec::with_capacity(descriptor.tensors.len());
        for (tensor, &reader_idx) in descriptor.tensors.iter().zip(&self.locations[index]) {
            let values = self.readers[reader_idx].read_tensor_f32(&tensor.name)?;
            tensors.push(WeightTensor::new(
                tensor.name.clone(),
                tensor.shape.clone(),
                tensor.dtype,
                values,
            )?);
        }

        Ok(Layer {
            name: descriptor.name.clone(),
            role: descriptor.role,
            tensors,
        })
    }
}

/// Row-major matrix view of a shape: first dimension by the product of the
/// rest. Vectors and scalars are a single row.
#[must_use]
pub fn matrix_dims(shape: &[usize]) -> (usize, usize) {
    match shape.split_first() {
        Some((&rows, rest)) if !rest.is_empty() => (rows, rest.iter().product()),
        _ => (1, shape.iter().product()),
    }
}

/// Module path of a tensor: the name minus a trailing `weight`/`bias`.
#[must_use]
pub fn module_path(tensor_name: &str) -> &str {
    match tensor_name.rsplit_once('.') {
        Some((module, "weight" | "bias")) => module,
        _ => tensor_name,
    }
}

/// An ordered, lazily loaded sequence of layers.
pub struct Model {
    source: Box<dyn ModelSource>,
    cache: Option<Vec<Option<Layer>>>,
    fetches: usize,
}

impl Model {
    /// Open a safetensors file or shard directory.
    ///
    /// Fails with `SourceUnavailable` if the path cannot be read and
    /// `UnsupportedFormat` if its tensors cannot be enumerated.
    pub fn open(reference: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_source(Box::new(SafetensorsSource::open(reference)?)))
    }

    /// Wrap in-memory layers.
    #[must_use]
    pub fn from_layers(id: impl Into<String>, layers: Vec<Layer>) -> Self {
        Self::from_source(Box::new(InMemorySource::new(id, layers)))
    }

    #[must_use]
    pub fn from_source(source: Box<dyn ModelSource>) -> Self {
        Self {
            source,
            cache: None,
            fetches: 0,
        }
    }

    /// Keep loaded layers so later iterations skip the source.
    #[must_use]
    pub fn with_layer_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled.then(|| vec![None; self.source.descriptors().len()]);
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.source.model_id()
    }

    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.source.descriptors().len()
    }

    #[must_use]
    pub fn descriptors(&self) -> &[LayerDescriptor] {
        self.source.descriptors()
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.descriptors()
            .iter()
            .map(LayerDescriptor::param_count)
            .sum()
    }

    /// Number of layer reads that went to the source.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches
    }

    /// Layers currently held by the cache.
    #[must_use]
    pub fn cached_layers(&self) -> usize {
        self.cache
            .as_ref()
            .map_or(0, |c| c.iter().filter(|slot| slot.is_some()).count())
    }

    /// Load the layer at `index`.
    pub fn layer(&mut self, index: usize) -> Result<Layer> {
        if let Some(Some(layer)) = self.cache.as_ref().and_then(|c| c.get(index)) {
            return Ok(layer.clone());
        }

        let layer = self.source.load_layer(index)?;
        self.fetches += 1;
        if let Some(slot) = self.cache.as_mut().and_then(|c| c.get_mut(index)) {
            *slot = Some(layer.clone());
        }
        Ok(layer)
    }

    /// Iterate layers in order. Calling again restarts from the first layer.
    pub fn layers(&mut self) -> Layers<'_> {
        Layers {
            model: self,
            next: 0,
        }
    }

    /// Architecture summary derived from the inventory alone.
    #[must_use]
    pub fn summary(&self) -> ModelSummary {
        let descriptors = self.descriptors();
        let mut hidden_size = 0usize;
        let mut blocks = BTreeSet::new();
        let mut tensor_count = 0usize;
        let mut original_bits = 0u64;

        for tensor in descriptors.iter().flat_map(|d| d.tensors.iter()) {
            tensor_count += 1;
            original_bits += tensor.numel() as u64 * u64::from(tensor.dtype.bits());
            if tensor.shape.len() == 2 {
                hidden_size = hidden_size.max(tensor.shape[0].min(tensor.shape[1]));
            }
            if let Some(block) = block_index(&tensor.name) {
                blocks.insert(block);
            }
        }

        ModelSummary {
            model_id: self.id().to_string(),
            layer_count: descriptors.len(),
            tensor_count,
            param_count: self.param_count(),
            original_bits,
            hidden_size,
            block_count: blocks.len(),
        }
    }
}

/// Iterator over a model's layers.
pub struct Layers<'a> {
    model: &'a mut Model,
    next: usize,
}

impl Iterator for Layers<'_> {
    type Item = Result<Layer>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.model.layer_count() {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.model.layer(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.model.layer_count().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

/// Size and shape facts used for level recommendation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model_id: String,
    pub layer_count: usize,
    pub tensor_count: usize,
    pub param_count: usize,
    pub original_bits: u64,
    /// Largest inner dimension among 2-D tensors
    pub hidden_size: usize,
    /// Distinct transformer blocks (`layers.N`, `h.N`, `blocks.N`)
    pub block_count: usize,
}

fn block_index(name: &str) -> Option<usize> {
    let tokens: Vec<&str> = name.split('.').collect();
    tokens.windows(2).find_map(|pair| match pair[0] {
        "layers" | "layer" | "h" | "blocks" => pair[1].parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::SafetensorsWriter;
    use tempfile::TempDir;

    fn tensor(name: &str, shape: Vec<usize>) -> WeightTensor {
        let numel = shape.iter().product();
        WeightTensor::new(name, shape, DType::Float32, vec![0.5; numel]).unwrap()
    }

    #[test]
    fn test_role_inference() {
        assert_eq!(LayerRole::infer("model.embed_tokens"), LayerRole::Embedding);
        assert_eq!(LayerRole::infer("transformer.wte"), LayerRole::Embedding);
        assert_eq!(
            LayerRole::infer("model.layers.3.self_attn.q_proj"),
            LayerRole::Attention
        );
        assert_eq!(
            LayerRole::infer("model.layers.3.mlp.down_proj"),
            LayerRole::Projection
        );
        assert_eq!(
            LayerRole::infer("model.layers.3.input_layernorm"),
            LayerRole::Norm
        );
        assert_eq!(LayerRole::infer("lm_head"), LayerRole::Output);
        assert_eq!(LayerRole::infer("classifier"), LayerRole::Other);
    }

    #[test]
    fn test_module_path() {
        assert_eq!(module_path("a.b.weight"), "a.b");
        assert_eq!(module_path("a.b.bias"), "a.b");
        assert_eq!(module_path("a.b.scale"), "a.b.scale");
    }

    #[test]
    fn test_weight_tensor_checks_element_count() {
        assert!(WeightTensor::new("w", vec![2, 3], DType::Float32, vec![0.0; 5]).is_err());
        let t = tensor("w", vec![4, 3, 2]);
        assert_eq!(t.matrix_dims(), (4, 6));
        assert_eq!(tensor("b", vec![7]).matrix_dims(), (1, 7));
        assert_eq!(t.original_bits(), 24 * 32);
    }

    #[test]
    fn test_weight_tensor_rejects_overflowing_shape() {
        let err = WeightTensor::new("w", vec![1 << 40, 1 << 40], DType::Float32, vec![0.0])
            .unwrap_err();
        assert!(matches!(err, NanoquantError::InvalidRequest(_)));
    }

    #[test]
    fn test_layer_cache_avoids_refetch() {
        let layers = vec![
            Layer::new("a", vec![tensor("a.weight", vec![2, 2])]),
            Layer::new("b", vec![tensor("b.weight", vec![3, 2])]),
        ];
        let mut model = Model::from_layers("m", layers).with_layer_cache(true);
        assert_eq!(model.layers().count(), 2);
        assert_eq!(model.layers().count(), 2);
        assert_eq!(model.fetch_count(), 2);
        assert_eq!(model.cached_layers(), 2);

        let mut uncached = Model::from_layers("m", vec![Layer::new("a", vec![])]);
        uncached.layers().for_each(drop);
        uncached.layers().for_each(drop);
        assert_eq!(uncached.fetch_count(), 2);
        assert_eq!(uncached.cached_layers(), 0);
    }

    #[test]
    fn test_open_missing_path_is_source_unavailable() {
        let err = Model::open("/nonexistent/model.safetensors")
            .err()
            .unwrap();
        assert!(matches!(err, NanoquantError::SourceUnavailable(_)));
    }

    #[test]
    fn test_open_shard_directory_groups_layers() {
        let dir = TempDir::new().unwrap();

        let mut first = SafetensorsWriter::new();
        first
            .add_tensor_f32("model.layers.0.mlp.up.weight", &[1.0; 8], DType::BFloat16, vec![4, 2])
            .unwrap();
        first
            .add_tensor_f32("model.layers.0.mlp.up.bias", &[0.0; 4], DType::BFloat16, vec![4])
            .unwrap();
        first.add_tensor("position_ids", vec![0; 16], DType::Int64, vec![2]);
        first
            .write_file(dir.path().join("model-00001.safetensors"))
            .unwrap();

        let mut second = SafetensorsWriter::new();
        second
            .add_tensor_f32("model.layers.1.mlp.up.weight", &[2.0; 8], DType::Float32, vec![4, 2])
            .unwrap();
        second
            .write_file(dir.path().join("model-00002.safetensors"))
            .unwrap();

        let mut model = Model::open(dir.path()).unwrap();
        assert_eq!(model.layer_count(), 2);
        assert_eq!(model.descriptors()[0].tensors.len(), 2);
        assert_eq!(model.descriptors()[0].role, LayerRole::Projection);

        let layer = model.layer(1).unwrap();
        assert_eq!(layer.name, "model.layers.1.mlp.up");
        assert_eq!(layer.tensors[0].values, vec![2.0; 8]);

        let summary = model.summary();
        assert_eq!(summary.block_count, 2);
        assert_eq!(summary.hidden_size, 2);
        assert_eq!(summary.param_count, 20);
    }

    #[test]
    fn test_open_empty_directory_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let err = Model::open(dir.path()).err().unwrap();
        assert!(matches!(err, NanoquantError::UnsupportedFormat(_)));
    }
}
