//! Owned weight mappings and safetensors file IO.
//!
//! [`WeightMapping`] is the in-memory form of one weight component: parameter
//! name to owned tensor payload. It is produced by the shard resolver and
//! consumed immediately by the external model-construction call; nothing here
//! interprets the tensors beyond dtype-aware typed accessors.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::anyhow;
use half::{bf16, f16};
use memmap2::Mmap;
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;

use crate::error::{Result, VegvisirError};

/// Element type of a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::BF16 | Self::I16 => 2,
            Self::I8 | Self::U8 | Self::Bool => 1,
        }
    }

    pub(crate) fn from_safetensors(dtype: Dtype) -> Option<Self> {
        match dtype {
            Dtype::F64 => Some(Self::F64),
            Dtype::F32 => Some(Self::F32),
            Dtype::F16 => Some(Self::F16),
            Dtype::BF16 => Some(Self::BF16),
            Dtype::I64 => Some(Self::I64),
            Dtype::I32 => Some(Self::I32),
            Dtype::I16 => Some(Self::I16),
            Dtype::I8 => Some(Self::I8),
            Dtype::U8 => Some(Self::U8),
            Dtype::BOOL => Some(Self::Bool),
            _ => None,
        }
    }

    pub(crate) fn to_safetensors(self) -> Dtype {
        match self {
            Self::F64 => Dtype::F64,
            Self::F32 => Dtype::F32,
            Self::F16 => Dtype::F16,
            Self::BF16 => Dtype::BF16,
            Self::I64 => Dtype::I64,
            Self::I32 => Dtype::I32,
            Self::I16 => Dtype::I16,
            Self::I8 => Dtype::I8,
            Self::U8 => Dtype::U8,
            Self::Bool => Dtype::BOOL,
        }
    }
}

/// One owned tensor: dtype, shape, and little-endian payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl TensorData {
    /// Number of elements implied by the shape.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Converts the payload to an `f32` array, widening `f16`/`bf16` and
    /// narrowing `f64`. Returns `None` for integer dtypes or when the
    /// payload length does not match the shape.
    pub fn to_array_f32(&self) -> Option<ArrayD<f32>> {
        let values: Vec<f32> = match self.dtype {
            DType::F32 => self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DType::F64 => self
                .data
                .chunks_exact(8)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                })
                .collect(),
            DType::F16 => self
                .data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DType::BF16 => self
                .data
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            _ => return None,
        };

        ArrayD::from_shape_vec(IxDyn(&self.shape), values).ok()
    }
}

/// A mapping from parameter name to owned tensor payload.
///
/// Keys are unique and order is irrelevant to consumers; a `BTreeMap` keeps
/// serialization deterministic.
#[derive(Debug, Default)]
pub struct WeightMapping {
    tensors: BTreeMap<String, TensorData>,
}

impl WeightMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every tensor from a `.safetensors` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_file_filtered(path, |_| true)
    }

    /// Loads the tensors whose names pass `keep`.
    ///
    /// The file stays mmap'd for the duration of the call; only kept tensors
    /// are copied out. Buffer reservations use `try_reserve_exact` so that a
    /// failed allocation surfaces as [`VegvisirError::OutOfMemory`] instead
    /// of aborting.
    pub fn from_file_filtered(path: &Path, keep: impl Fn(&str) -> bool) -> Result<Self> {
        let file = File::open(path).map_err(|e| VegvisirError::io(path, e))?;
        // SAFETY: the mapping is read-only and dropped before this function
        // returns; all tensor bytes are copied out of it.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| VegvisirError::io(path, e))?;

        let st = SafeTensors::deserialize(&mmap).map_err(|e| VegvisirError::LoadFailed {
            path: path.to_path_buf(),
            source: anyhow!(e),
        })?;

        let mut tensors = BTreeMap::new();
        for (name, view) in st.tensors() {
            if !keep(&name) {
                continue;
            }

            let dtype = DType::from_safetensors(view.dtype()).ok_or_else(|| {
                VegvisirError::LoadFailed {
                    path: path.to_path_buf(),
                    source: anyhow!("unsupported dtype {:?} for tensor '{}'", view.dtype(), name),
                }
            })?;

            let bytes = view.data();
            let mut data = Vec::new();
            data.try_reserve_exact(bytes.len())
                .map_err(|_| VegvisirError::OutOfMemory { wanted: bytes.len() })?;
            data.extend_from_slice(bytes);

            tensors.insert(
                name,
                TensorData {
                    dtype,
                    shape: view.shape().to_vec(),
                    data,
                },
            );
        }

        log::debug!(
            "loaded {} tensors from {:?}",
            tensors.len(),
            path.file_name().unwrap_or_default()
        );

        Ok(Self { tensors })
    }

    /// Writes the mapping to a `.safetensors` file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut views = Vec::with_capacity(self.tensors.len());
        for (name, tensor) in &self.tensors {
            let view = TensorView::new(
                tensor.dtype.to_safetensors(),
                tensor.shape.clone(),
                &tensor.data,
            )
            .map_err(|e| VegvisirError::LoadFailed {
                path: path.to_path_buf(),
                source: anyhow!(e),
            })?;
            views.push((name.as_str(), view));
        }

        safetensors::serialize_to_file(views, &None, path).map_err(|e| {
            VegvisirError::LoadFailed {
                path: path.to_path_buf(),
                source: anyhow!(e),
            }
        })
    }

    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.tensors.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: TensorData) {
        self.tensors.insert(name.into(), tensor);
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<TensorData> {
        self.tensors.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Parameter names, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorData)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::create_safetensors_file;

    #[test]
    fn test_load_and_typed_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = create_safetensors_file(
            dir.path(),
            "model.safetensors",
            &[
                ("layer.weight", vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]),
                ("layer.bias", vec![0.5, -0.5], vec![2]),
            ],
        );

        let weights = WeightMapping::from_file(&path).unwrap();
        assert_eq!(weights.len(), 2);

        let tensor = weights.get("layer.weight").unwrap();
        assert_eq!(tensor.dtype, DType::F32);
        assert_eq!(tensor.shape, vec![2, 3]);

        let array = tensor.to_array_f32().unwrap();
        assert_eq!(array.shape(), &[2, 3]);
        assert_eq!(array[[1, 2]], 6.0);
    }

    #[test]
    fn test_filtered_load_drops_unlisted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = create_safetensors_file(
            dir.path(),
            "model.safetensors",
            &[
                ("wanted", vec![1.0], vec![1]),
                ("unwanted", vec![2.0], vec![1]),
            ],
        );

        let weights = WeightMapping::from_file_filtered(&path, |name| name == "wanted").unwrap();
        assert_eq!(weights.len(), 1);
        assert!(weights.contains("wanted"));
        assert!(!weights.contains("unwanted"));
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        std::fs::write(&path, b"not a safetensors file").unwrap();

        let result = WeightMapping::from_file(&path);
        assert!(matches!(result, Err(VegvisirError::LoadFailed { .. })));
    }

    #[test]
    fn test_f16_widening() {
        let tensor = TensorData {
            dtype: DType::F16,
            shape: vec![2],
            data: f16::from_f32(1.5)
                .to_le_bytes()
                .iter()
                .chain(f16::from_f32(-2.0).to_le_bytes().iter())
                .copied()
                .collect(),
        };

        let array = tensor.to_array_f32().unwrap();
        assert_eq!(array[[0]], 1.5);
        assert_eq!(array[[1]], -2.0);
    }
}
