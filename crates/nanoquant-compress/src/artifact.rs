//! Compressed artifacts and the `.nqa` container.
//!
//! ## Format
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Magic: "NQA\x00" (4 bytes)              │
//! ├─────────────────────────────────────────┤
//! │ Version: u32 (4 bytes, little-endian)   │
//! ├─────────────────────────────────────────┤
//! │ Header Size: u64 (8 bytes, LE)          │
//! ├─────────────────────────────────────────┤
//! │ JSON Header                             │
//! │ - model id, level, technique chain      │
//! │ - size ratio, quality loss, layer report│
//! │ - tensor index: offsets, sizes, xxh3    │
//! ├─────────────────────────────────────────┤
//! │ Tensor payloads                         │
//! │ - codec(bincode(EncodedTensor))         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Packing is a pure function of the in-memory artifact: no timestamps and
//! no hash-map ordering reach the bytes, so packing twice is byte-identical.

use crate::encoding::EncodedTensor;
use crate::formats::SafetensorsWriter;
use crate::model::LayerRole;
use crate::policy::TechniqueChain;
use crate::techniques::TechniqueKind;
use nanoquant_core::hashing::{content_digest, payload_checksum};
use nanoquant_core::types::DType;
use nanoquant_core::{CodecKind, Compressor, NanoquantError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Magic bytes: "NQA\0"
pub const NQA_MAGIC: [u8; 4] = [b'N', b'Q', b'A', 0];

/// Current container version
pub const NQA_VERSION: u32 = 1;

const PREAMBLE_LEN: usize = 16;

/// Per-layer outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerReport {
    pub layer_name: String,
    pub role: LayerRole,
    pub param_count: usize,
    pub original_bits: u64,
    pub compressed_bits: u64,
    pub achieved_bits_per_weight: f64,
    /// ‖W − Ŵ‖ / ‖W‖ over the layer
    pub residual_error: f64,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degrade_reason: Option<String>,
    /// Techniques that contributed to at least one tensor
    pub techniques: Vec<TechniqueKind>,
}

/// One layer's encoded tensors and report.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedLayer {
    pub report: LayerReport,
    pub tensors: Vec<EncodedTensor>,
}

/// In-memory result of a run, before serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedModel {
    pub model_id: String,
    pub chain: TechniqueChain,
    pub calibration_samples: usize,
    pub layers: Vec<CompressedLayer>,
}

impl CompressedModel {
    #[must_use]
    pub fn level(&self) -> &str {
        &self.chain.label
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.layers.iter().map(|l| l.report.param_count).sum()
    }

    #[must_use]
    pub fn original_bits(&self) -> u64 {
        self.layers.iter().map(|l| l.report.original_bits).sum()
    }

    #[must_use]
    pub fn compressed_bits(&self) -> u64 {
        self.layers.iter().map(|l| l.report.compressed_bits).sum()
    }

    /// Compressed bits over original bits.
    #[must_use]
    pub fn size_ratio(&self) -> f64 {
        let original = self.original_bits();
        if original == 0 {
            return 0.0;
        }
        self.compressed_bits() as f64 / original as f64
    }

    /// Average storage bits per weight across the model.
    #[must_use]
    pub fn bits_per_weight(&self) -> f64 {
        let params = self.param_count();
        if params == 0 {
            return 0.0;
        }
        self.compressed_bits() as f64 / params as f64
    }

    /// Parameter-weighted mean of per-layer residual error, clamped to [0, 1].
    #[must_use]
    pub fn estimated_quality_loss(&self) -> f64 {
        let params = self.param_count();
        if params == 0 {
            return 0.0;
        }
        let weighted: f64 = self
            .layers
            .iter()
            .map(|l| l.report.residual_error.clamp(0.0, 1.0) * l.report.param_count as f64)
            .sum();
        (weighted / params as f64).clamp(0.0, 1.0)
    }

    #[must_use]
    pub fn per_layer_report(&self) -> Vec<LayerReport> {
        self.layers.iter().map(|l| l.report.clone()).collect()
    }

    #[must_use]
    pub fn degraded_count(&self) -> usize {
        self.layers.iter().filter(|l| l.report.degraded).count()
    }
}

/// A completed run: the in-memory model plus its serialized payload.
#[derive(Debug, Clone)]
pub struct CompressedArtifact {
    model: CompressedModel,
    payload: Vec<u8>,
}

impl CompressedArtifact {
    pub(crate) fn new(model: CompressedModel, payload: Vec<u8>) -> Self {
        Self { model, payload }
    }

    #[must_use]
    pub fn model(&self) -> &CompressedModel {
        &self.model
    }

    #[must_use]
    pub fn level(&self) -> &str {
        self.model.level()
    }

    #[must_use]
    pub fn size_ratio(&self) -> f64 {
        self.model.size_ratio()
    }

    #[must_use]
    pub fn estimated_quality_loss(&self) -> f64 {
        self.model.estimated_quality_loss()
    }

    #[must_use]
    pub fn per_layer_report(&self) -> Vec<LayerReport> {
        self.model.per_layer_report()
    }

    /// The serialized `.nqa` bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Blake3 hex digest of the payload.
    #[must_use]
    pub fn digest(&self) -> String {
        content_digest(&self.payload)
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, &self.payload)?;
        Ok(())
    }
}

/// Index entry for one tensor payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    pub layer: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// Offset into the payload section
    pub offset: u64,
    pub size: u64,
    /// Length of the bincode encoding before the codec
    pub decoded_size: u64,
    /// xxh3 of the stored bytes, hex
    pub checksum: String,
}

/// JSON header of an `.nqa` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub model_id: String,
    pub level: String,
    pub chain: TechniqueChain,
    pub codec: CodecKind,
    pub calibration_samples: usize,
    pub original_bits: u64,
    pub compressed_bits: u64,
    pub size_ratio: f64,
    pub estimated_quality_loss: f64,
    pub layers: Vec<LayerReport>,
    pub tensors: Vec<TensorEntry>,
}

/// Serializes a [`CompressedModel`] into the `.nqa` container.
pub struct ArtifactPackager {
    codec: CodecKind,
    compressor: Box<dyn Compressor>,
}

impl ArtifactPackager {
    #[must_use]
    pub fn new(codec: CodecKind, level: i32) -> Self {
        Self {
            codec,
            compressor: codec.compressor(level),
        }
    }

    pub fn pack(&self, model: &CompressedModel) -> Result<Vec<u8>> {
        let mut entries = Vec::new();
        let mut data = Vec::new();

        for layer in &model.layers {
            for tensor in &layer.tensors {
                let encoded = bincode::serialize(tensor)
                    .map_err(|e| NanoquantError::Serialization(e.to_string()))?;
                let stored = self.compressor.compress(&encoded)?;
                entries.push(TensorEntry {
                    name: tensor.name.clone(),
                    layer: layer.report.layer_name.clone(),
                    shape: tensor.shape.clone(),
                    dtype: tensor.dtype,
                    offset: data.len() as u64,
                    size: stored.len() as u64,
                    decoded_size: encoded.len() as u64,
                    checksum: payload_checksum(&stored),
                });
                data.extend_from_slice(&stored);
            }
        }

        let header = ArtifactHeader {
            model_id: model.model_id.clone(),
            level: model.level().to_string(),
            chain: model.chain.clone(),
            codec: self.codec,
            calibration_samples: model.calibration_samples,
            original_bits: model.original_bits(),
            compressed_bits: model.compressed_bits(),
            size_ratio: model.size_ratio(),
            estimated_quality_loss: model.estimated_quality_loss(),
            layers: model.per_layer_report(),
            tensors: entries,
        };
        let header_bytes = serde_json::to_vec(&header).map_err(|e| {
            NanoquantError::Serialization(format!("Failed to serialize header: {e}"))
        })?;

        let mut out = Vec::with_capacity(PREAMBLE_LEN + header_bytes.len() + data.len());
        out.extend_from_slice(&NQA_MAGIC);
        out.extend_from_slice(&NQA_VERSION.to_le_bytes());
        out.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&data);
        Ok(out)
    }
}

/// Reader for `.nqa` bytes.
pub struct ArtifactReader {
    header: ArtifactHeader,
    bytes: Vec<u8>,
    data_offset: usize,
    compressor: Box<dyn Compressor>,
}

impl ArtifactReader {
    /// Parse and validate the preamble and header.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < PREAMBLE_LEN {
            return Err(NanoquantError::UnsupportedFormat(
                "artifact shorter than its preamble".to_string(),
            ));
        }
        if bytes[..4] != NQA_MAGIC {
            return Err(NanoquantError::UnsupportedFormat(
                "Invalid NQA magic bytes".to_string(),
            ));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version > NQA_VERSION {
            return Err(NanoquantError::UnsupportedFormat(format!(
                "Unsupported NQA version: {version} (max supported: {NQA_VERSION})"
            )));
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&bytes[8..PREAMBLE_LEN]);
        let header_size = usize::try_from(u64::from_le_bytes(size)).map_err(|_| {
            NanoquantError::UnsupportedFormat("header size overflows".to_string())
        })?;
        let data_offset = PREAMBLE_LEN
            .checked_add(header_size)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                NanoquantError::UnsupportedFormat("header extends past end of file".to_string())
            })?;

        let header: ArtifactHeader = serde_json::from_slice(&bytes[PREAMBLE_LEN..data_offset])
            .map_err(|e| NanoquantError::UnsupportedFormat(format!("Invalid header JSON: {e}")))?;
        let data_len = (bytes.len() - data_offset) as u64;
        if let Some(entry) = header
            .tensors
            .iter()
            .find(|t| t.offset.saturating_add(t.size) > data_len)
        {
            return Err(NanoquantError::UnsupportedFormat(format!(
                "tensor {} extends past end of file",
                entry.name
            )));
        }

        let compressor = header.codec.compressor(0);
        Ok(Self {
            header,
            bytes,
            data_offset,
            compressor,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(|e| {
            NanoquantError::SourceUnavailable(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_bytes(bytes)
    }

    #[must_use]
    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.header.tensors.iter().map(|t| t.name.as_str())
    }

    /// Read, verify and decode one tensor's stages.
    pub fn tensor(&self, name: &str) -> Result<EncodedTensor> {
        let entry = self
            .header
            .tensors
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| NanoquantError::InvalidRequest(format!("no tensor named {name}")))?;
        self.read_entry(entry)
    }

    fn read_entry(&self, entry: &TensorEntry) -> Result<EncodedTensor> {
        let start = self.data_offset + entry.offset as usize;
        let stored = &self.bytes[start..start + entry.size as usize];
        let actual = payload_checksum(stored);
        if actual != entry.checksum {
            return Err(NanoquantError::Decompression(format!(
                "checksum mismatch for {}: expected {}, got {actual}",
                entry.name, entry.checksum
            )));
        }
        let encoded = self
            .compressor
            .decompress_exact(stored, entry.decoded_size as usize)?;
        let tensor: EncodedTensor = bincode::deserialize(&encoded)
            .map_err(|e| NanoquantError::Decompression(e.to_string()))?;
        if tensor.shape != entry.shape || tensor.name != entry.name {
            return Err(NanoquantError::Decompression(format!(
                "payload for {} does not match its index entry",
                entry.name
            )));
        }
        Ok(tensor)
    }

    /// Dense f32 values of one tensor.
    pub fn reconstruct(&self, name: &str) -> Result<Vec<f32>> {
        self.tensor(name)?.decode()
    }

    /// Every tensor decoded and re-encoded at its source element kind.
    pub fn to_safetensors(&self) -> Result<SafetensorsWriter> {
        let mut writer = SafetensorsWriter::new();
        writer.add_metadata("format", "pt");
        writer.add_metadata("nanoquant.level", self.header.level.clone());
        writer.add_metadata("nanoquant.model_id", self.header.model_id.clone());
        for entry in &self.header.tensors {
            let values = self.read_entry(entry)?.decode()?;
            writer.add_tensor_f32(&entry.name, &values, entry.dtype, entry.shape.clone())?;
        }
        Ok(writer)
    }
}
