//! On-disk cache of device-ready constant tensors.
//!
//! Entries are stored as single-tensor `safetensors` files, already quantized to the
//! device data type, so that a hit skips both quantization and host data transfer.

use std::path::{Path, PathBuf};

use safetensors::{SafeTensors, tensor::TensorView};
use thiserror::Error;

use crate::loom::{
    layout::{Shape, TensorLayout},
    num::DataType,
    tensor::{HostTensor, TensorError},
};

/// Name of the single tensor stored in each cache file.
const ENTRY: &str = "tensor";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SafeTensor(#[from] safetensors::SafeTensorError),
    #[error("cached entry has unsupported data type {0:?}")]
    Type(safetensors::Dtype),
    #[error("cached entry has data type {0}, expected {1}")]
    TypeMismatch(DataType, DataType),
    #[error("cached entry has shape {0}, expected {1}")]
    ShapeMismatch(Shape, Shape),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Identity of a cache entry: a logical name under a data-type specific root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub root: PathBuf,
    pub name: String,
}

impl CacheKey {
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        let root = root.into();
        let name = name.into();
        Self { root, name }
    }

    /// The file an entry of `r#type` stored in `layout` lives in.
    pub fn path(&self, r#type: DataType, layout: TensorLayout) -> PathBuf {
        let file = format!("{}_dtype_{}_layout_{}.safetensors", self.name, r#type, layout);
        self.root.join(file)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TensorCache;

impl TensorCache {
    /// Loads an entry. Returns `None` if there is no file at `path`.
    pub fn load(
        path: &Path,
        r#type: DataType,
        shape: &Shape,
    ) -> Result<Option<HostTensor>, CacheError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let tensors = SafeTensors::deserialize(&bytes)?;
        let view = tensors.tensor(ENTRY)?;

        let cached = DataType::try_from(view.dtype()).map_err(CacheError::Type)?;
        if cached != r#type {
            return Err(CacheError::TypeMismatch(cached, r#type));
        }
        let cached = Shape::from(view.shape());
        if &cached != shape {
            return Err(CacheError::ShapeMismatch(cached, shape.clone()));
        }

        let data = r#type.decode(view.data());
        Ok(Some(HostTensor::new(cached, data)?))
    }

    /// Quantizes `tensor` to `r#type` and writes it to `path`, creating parent directories.
    pub fn store(
        path: &Path,
        r#type: DataType,
        tensor: &HostTensor,
    ) -> Result<HostTensor, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = r#type.encode(tensor.data());
        let shape = tensor.shape().to_vec();
        let view = TensorView::new(r#type.into(), shape, &bytes)?;
        safetensors::serialize_to_file([(ENTRY, view)], &None, path)?;

        // the device sees the quantized values, exactly as a later hit would
        let data = r#type.decode(&bytes);
        Ok(HostTensor::new(tensor.shape(), data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheError, CacheKey, TensorCache};
    use crate::loom::{
        layout::{Shape, TensorLayout},
        num::DataType,
        tensor::HostTensor,
    };

    fn scratch() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("meshnorm-cache-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_store_load() -> Result<(), CacheError> {
        let root = scratch();
        let key = CacheKey::new(&root, "norm.weightmultidevice");
        let path = key.path(DataType::Bf16, TensorLayout::Tile);
        assert!(path.starts_with(&root));
        assert_ne!(path, key.path(DataType::F16, TensorLayout::Tile));

        let shape = Shape::from([2, 3]);
        assert!(TensorCache::load(&path, DataType::Bf16, &shape)?.is_none());

        let tensor = HostTensor::new([2, 3], vec![1.0, 0.1, -3.0, 4.0, 5.0, 6.0]).unwrap();
        let stored = TensorCache::store(&path, DataType::Bf16, &tensor)?;
        let loaded = TensorCache::load(&path, DataType::Bf16, &shape)?.expect("entry stored");
        assert_eq!(loaded, stored);
        assert_ne!(stored.data()[1], 0.1);

        let err = TensorCache::load(&path, DataType::Bf16, &Shape::from([6])).unwrap_err();
        assert!(matches!(err, CacheError::ShapeMismatch(..)));
        let err = TensorCache::load(&path, DataType::F32, &shape).unwrap_err();
        assert!(matches!(err, CacheError::TypeMismatch(..)));

        std::fs::remove_dir_all(root)?;
        Ok(())
    }
}
