//! Safetensors reading and writing.
//!
//! Models are read from safetensors files (one file or a directory of
//! shards); decompressed artifacts are written back as safetensors.
//!
//! Layout: a little-endian u64 header length, a JSON object mapping tensor
//! names to `{dtype, shape, data_offsets}` (plus an optional `__metadata__`
//! string map), then the packed tensor bytes.

use nanoquant_core::types::{checked_numel, DType, TensorMeta};
use nanoquant_core::{NanoquantError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

const METADATA_KEY: &str = "__metadata__";

/// Upper bound on a plausible JSON header, used when sniffing files.
const MAX_HEADER_LEN: u64 = 100 << 20;

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [u64; 2],
}

/// One value of the header object. Tensor entries are tried first.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum HeaderValue {
    Tensor(Entry),
    Metadata(BTreeMap<String, String>),
}

/// Parsed header of a safetensors file.
#[derive(Debug, Clone)]
pub struct SafetensorsHeader {
    /// Tensors ordered by their position in the data section
    pub tensors: Vec<TensorMeta>,
    pub metadata: BTreeMap<String, String>,
    /// File offset of the first data byte
    pub data_start: u64,
}

fn unsupported(msg: impl Into<String>) -> NanoquantError {
    NanoquantError::UnsupportedFormat(msg.into())
}

fn tensor_meta(name: &str, entry: &Entry, data_len: u64) -> Result<TensorMeta> {
    let dtype = DType::from_safetensors(&entry.dtype)?;
    let [start, end] = entry.data_offsets;
    let expected = checked_numel(&entry.shape)
        .and_then(|n| (n as u64).checked_mul(dtype.size_bytes() as u64))
        .ok_or_else(|| {
            unsupported(format!("tensor {name}: shape {:?} overflows", entry.shape))
        })?;
    if end < start || end - start != expected {
        return Err(unsupported(format!(
            "tensor {name}: offsets {start}..{end} do not fit shape {:?} of {}",
            entry.shape, entry.dtype
        )));
    }
    if end > data_len {
        return Err(unsupported(format!(
            "tensor {name} ends at {end}, past the {data_len}-byte data section"
        )));
    }
    Ok(TensorMeta {
        name: name.to_string(),
        shape: entry.shape.clone(),
        dtype,
        offset: start as usize,
        size: (end - start) as usize,
    })
}

/// Random-access reader over one safetensors file.
pub struct SafetensorsReader {
    file: BufReader<File>,
    header: SafetensorsHeader,
    index: HashMap<String, usize>,
}

impl SafetensorsReader {
    /// Open a file and validate every tensor entry against the data section.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();
        let mut file = BufReader::new(file);

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)
            .map_err(|_| unsupported("file too short for a safetensors header"))?;
        let header_len = u64::from_le_bytes(len_bytes);
        let data_start = header_len
            .checked_add(8)
            .filter(|&start| start <= file_len)
            .ok_or_else(|| unsupported(format!("header length {header_len} exceeds the file")))?;

        let mut json = vec![0u8; header_len as usize];
        file.read_exact(&mut json)?;
        let raw: BTreeMap<String, HeaderValue> = serde_json::from_slice(&json)
            .map_err(|e| unsupported(format!("invalid safetensors header: {e}")))?;

        let data_len = file_len - data_start;
        let mut tensors = Vec::with_capacity(raw.len());
        let mut metadata = BTreeMap::new();
        for (name, value) in raw {
            match value {
                HeaderValue::Metadata(entries) if name == METADATA_KEY => metadata = entries,
                HeaderValue::Metadata(_) => {
                    return Err(unsupported(format!("tensor {name} has no dtype/shape/offsets")))
                }
                HeaderValue::Tensor(entry) => tensors.push(tensor_meta(&name, &entry, data_len)?),
            }
        }

        // File order, so layers come out the way the checkpoint stored them
        tensors.sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.name.cmp(&b.name)));
        let index = tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        Ok(Self {
            file,
            header: SafetensorsHeader {
                tensors,
                metadata,
                data_start,
            },
            index,
        })
    }

    #[must_use]
    pub fn header(&self) -> &SafetensorsHeader {
        &self.header
    }

    #[must_use]
    pub fn tensor_meta(&self, name: &str) -> Option<&TensorMeta> {
        self.index.get(name).map(|&i| &self.header.tensors[i])
    }

    /// Tensor names in data-section order.
    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.header.tensors.iter().map(|t| t.name.as_str())
    }

    /// Raw little-endian bytes of a tensor.
    pub fn read_tensor(&mut self, name: &str) -> Result<Vec<u8>> {
        let (offset, size) = self
            .tensor_meta(name)
            .map(|meta| (meta.offset, meta.size))
            .ok_or_else(|| NanoquantError::SourceUnavailable(format!("no tensor named {name}")))?;
        self.file
            .seek(SeekFrom::Start(self.header.data_start + offset as u64))?;
        let mut bytes = vec![0u8; size];
        self.file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Read a floating-point tensor widened to f32.
    pub fn read_tensor_f32(&mut self, name: &str) -> Result<Vec<f32>> {
        let bytes = self.read_tensor(name)?;
        let dtype = self
            .tensor_meta(name)
            .map(|meta| meta.dtype)
            .ok_or_else(|| NanoquantError::SourceUnavailable(format!("no tensor named {name}")))?;
        dtype.decode_f32(&bytes)
    }
}

/// Whether `path` has a `.safetensors` extension or starts like one.
pub fn is_safetensors<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    if path.extension().is_some_and(|ext| ext == "safetensors") {
        return true;
    }
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut prefix = [0u8; 9];
    if file.read_exact(&mut prefix).is_err() {
        return false;
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&prefix[..8]);
    let header_len = u64::from_le_bytes(len_bytes);
    (2..MAX_HEADER_LEN).contains(&header_len) && prefix[8] == b'{'
}

#[derive(Debug, Clone)]
struct PendingTensor {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

/// Builds a safetensors file in memory, tensors laid out in insertion order.
#[derive(Debug, Clone, Default)]
pub struct SafetensorsWriter {
    tensors: Vec<PendingTensor>,
    metadata: BTreeMap<String, String>,
}

impl SafetensorsWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Add a tensor from raw little-endian bytes.
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        bytes: Vec<u8>,
        dtype: DType,
        shape: Vec<usize>,
    ) {
        self.tensors.push(PendingTensor {
            name: name.into(),
            dtype,
            shape,
            bytes,
        });
    }

    /// Add a tensor from f32 values, stored as `dtype`.
    pub fn add_tensor_f32(
        &mut self,
        name: impl Into<String>,
        values: &[f32],
        dtype: DType,
        shape: Vec<usize>,
    ) -> Result<()> {
        let numel = checked_numel(&shape).ok_or_else(|| {
            NanoquantError::InvalidRequest(format!("shape {shape:?} overflows"))
        })?;
        if numel != values.len() {
            return Err(NanoquantError::InvalidRequest(format!(
                "shape {shape:?} holds {numel} elements, got {}",
                values.len()
            )));
        }
        let bytes = dtype.encode_f32(values)?;
        self.add_tensor(name, bytes, dtype, shape);
        Ok(())
    }

    fn header_json(&self) -> Result<Vec<u8>> {
        let mut header = BTreeMap::new();
        if !self.metadata.is_empty() {
            header.insert(
                METADATA_KEY.to_string(),
                HeaderValue::Metadata(self.metadata.clone()),
            );
        }
        let mut offset = 0u64;
        for tensor in &self.tensors {
            let end = offset + tensor.bytes.len() as u64;
            header.insert(
                tensor.name.clone(),
                HeaderValue::Tensor(Entry {
                    dtype: tensor.dtype.as_safetensors().to_string(),
                    shape: tensor.shape.clone(),
                    data_offsets: [offset, end],
                }),
            );
            offset = end;
        }
        serde_json::to_vec(&header)
            .map_err(|e| NanoquantError::Serialization(format!("safetensors header: {e}")))
    }

    pub fn write<W: Write>(&self, writer: W) -> Result<()> {
        let json = self.header_json()?;
        let mut out = BufWriter::new(writer);
        out.write_all(&(json.len() as u64).to_le_bytes())?;
        out.write_all(&json)?;
        for tensor in &self.tensors {
            out.write_all(&tensor.bytes)?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.write(File::create(path.as_ref())?)
    }

    #[must_use]
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn entry(dtype: &str, shape: Vec<usize>, offsets: [u64; 2]) -> Entry {
        Entry {
            dtype: dtype.to_string(),
            shape,
            data_offsets: offsets,
        }
    }

    #[test]
    fn test_tensor_meta_from_entry() {
        let meta = tensor_meta("w", &entry("BF16", vec![4, 8], [64, 128]), 128).unwrap();
        assert_eq!(meta.dtype, DType::BFloat16);
        assert_eq!(meta.shape, vec![4, 8]);
        assert_eq!(meta.offset, 64);
        assert_eq!(meta.size, 64);
    }

    #[test]
    fn test_mismatched_offsets_are_rejected() {
        let short = entry("F32", vec![4], [0, 8]);
        assert!(matches!(
            tensor_meta("w", &short, 64),
            Err(NanoquantError::UnsupportedFormat(_))
        ));
        let past_end = entry("F32", vec![4], [0, 16]);
        assert!(tensor_meta("w", &past_end, 8).is_err());
    }

    #[test]
    fn test_metadata_parses_as_string_map() {
        let raw: BTreeMap<String, HeaderValue> = serde_json::from_str(
            r#"{"__metadata__":{"format":"pt"},"w":{"dtype":"F32","shape":[1],"data_offsets":[0,4]}}"#,
        )
        .unwrap();
        assert!(matches!(raw["__metadata__"], HeaderValue::Metadata(_)));
        assert!(matches!(raw["w"], HeaderValue::Tensor(_)));
    }

    #[test]
    fn test_write_then_read_preserves_order_and_values() {
        let mut writer = SafetensorsWriter::new();
        writer.add_metadata("format", "pt");
        writer
            .add_tensor_f32("z.weight", &[1.0, 2.0], DType::Float32, vec![2])
            .unwrap();
        writer
            .add_tensor_f32("a.weight", &[0.5, -0.25, 4.0, 8.0], DType::BFloat16, vec![2, 2])
            .unwrap();

        let file = NamedTempFile::new().unwrap();
        writer.write_file(file.path()).unwrap();
        assert!(is_safetensors(file.path()));

        let mut reader = SafetensorsReader::open(file.path()).unwrap();
        let names: Vec<_> = reader.tensor_names().map(String::from).collect();
        assert_eq!(names, vec!["z.weight", "a.weight"]);
        assert_eq!(reader.header().metadata.get("format").unwrap(), "pt");
        assert_eq!(
            reader.read_tensor_f32("a.weight").unwrap(),
            vec![0.5, -0.25, 4.0, 8.0]
        );
    }

    #[test]
    fn test_add_tensor_f32_checks_shape() {
        let mut writer = SafetensorsWriter::new();
        let err = writer
            .add_tensor_f32("w", &[1.0, 2.0, 3.0], DType::Float32, vec![2, 2])
            .unwrap_err();
        assert!(matches!(err, NanoquantError::InvalidRequest(_)));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0xFF; 32]).unwrap();
        assert!(SafetensorsReader::open(file.path()).is_err());
        assert!(!is_safetensors(file.path()));
    }

    #[test]
    fn test_overflowing_shape_is_unsupported() {
        let header = br#"{"w":{"dtype":"F32","shape":[4294967296,4294967296],"data_offsets":[0,0]}}"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
        file.write_all(header).unwrap();
        assert!(matches!(
            SafetensorsReader::open(file.path()),
            Err(NanoquantError::UnsupportedFormat(_))
        ));

        // Element count fits, byte count does not
        let wide = entry("F32", vec![1 << 31, 1 << 31], [0, 0]);
        assert!(matches!(
            tensor_meta("w", &wide, 0),
            Err(NanoquantError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_missing_tensor_is_source_unavailable() {
        let mut writer = SafetensorsWriter::new();
        writer
            .add_tensor_f32("w", &[1.0], DType::Float32, vec![1])
            .unwrap();
        let file = NamedTempFile::new().unwrap();
        writer.write_file(file.path()).unwrap();

        let mut reader = SafetensorsReader::open(file.path()).unwrap();
        assert!(matches!(
            reader.read_tensor("missing"),
            Err(NanoquantError::SourceUnavailable(_))
        ));
    }
}
