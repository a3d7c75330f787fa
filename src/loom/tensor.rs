use std::sync::Arc;

use derive_more::{Deref, DerefMut, Display};
use thiserror::Error;

use super::{
    layout::{Shape, TensorLayout},
    mapper::MeshMapper,
    memory::{MemoryConfig, Placement},
    num::DataType,
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor creation error: shape {0}'s size not match data len {1}")]
    Create(Shape, usize),
    #[error("tensor reshape error: shape {0}'s size not match shape {1}'s")]
    Reshape(Shape, Shape),
    #[error("tensor expand error: cannot expand shape {0} to {1} replicas")]
    Expand(Shape, usize),
    #[error("tensor shard error: dimension {dim} of shape {shape} does not split into {parts}")]
    Split { shape: Shape, dim: usize, parts: usize },
}

/// A host-resident array of `f32` values. Cheap to clone; never mutated once created.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Shape,
    data: Arc<[f32]>,
}

impl HostTensor {
    pub fn new(shape: impl Into<Shape>, data: impl Into<Arc<[f32]>>) -> Result<Self, TensorError> {
        let shape = shape.into();
        let data = data.into();
        if shape.volume() != data.len() {
            return Err(TensorError::Create(shape, data.len()));
        }
        Ok(Self { shape, data })
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape.clone()
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reshape the tensor, leaving the underlying data untouched.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self, TensorError> {
        let shape = shape.into();
        if shape.volume() != self.shape.volume() {
            return Err(TensorError::Reshape(self.shape(), shape));
        }
        let data = self.data.clone();
        Ok(Self { shape, data })
    }

    /// Repeats the tensor `count` times along a new leading dimension.
    pub fn expand(&self, count: usize) -> Result<Self, TensorError> {
        if count == 0 {
            return Err(TensorError::Expand(self.shape(), count));
        }
        let shape: Shape = std::iter::once(count)
            .chain(self.shape.iter().copied())
            .collect::<Vec<_>>()
            .into();
        let data: Arc<[f32]> = std::iter::repeat_n(self.data(), count)
            .flatten()
            .copied()
            .collect();
        Ok(Self { shape, data })
    }

    /// Splits the tensor into `parts` equal chunks along `dim`.
    pub fn split(&self, dim: usize, parts: usize) -> Result<Vec<Self>, TensorError> {
        let shape = &self.shape;
        if dim >= shape.len() || parts == 0 || shape[dim] % parts != 0 {
            return Err(TensorError::Split {
                shape: self.shape(),
                dim,
                parts,
            });
        }
        let outer: usize = shape[..dim].iter().product();
        let inner: usize = shape[dim..].iter().product();
        let chunk = inner / parts;
        let sub = shape.with_dim(dim, shape[dim] / parts);

        let tensors = (0..parts)
            .map(|part| {
                let data: Arc<[f32]> = (0..outer)
                    .flat_map(|row| {
                        let start = row * inner + part * chunk;
                        self.data[start..start + chunk].iter().copied()
                    })
                    .collect();
                Self {
                    shape: sub.clone(),
                    data,
                }
            })
            .collect();
        Ok(tensors)
    }
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct TensorId(uid::Id<TensorId>);

impl TensorId {
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

/// Everything the device layer needs to know about a tensor, without owning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorIr {
    pub id: TensorId,
    pub shape: Shape,
    pub r#type: DataType,
    pub layout: TensorLayout,
    pub memory: MemoryConfig,
    pub mapper: MeshMapper,
}

impl TensorIr {
    /// Size of the tensor on a single device in bytes, including tile padding.
    pub fn data_size(&self, devices: usize) -> usize {
        let shape = self.mapper.local_shape(&self.shape, devices);
        self.layout.pad(&shape).volume() * self.r#type.size()
    }
}

/// A handle to memory resident on a device mesh.
///
/// The handle is a move-only ownership token: it is not [`Clone`], and must be handed back
/// to the device layer exactly once via [`DeviceTensor::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceTensor {
    ir: TensorIr,
}

impl DeviceTensor {
    /// Wraps a tensor freshly reported by the device layer.
    #[inline]
    pub(crate) fn from_ir(ir: TensorIr) -> Self {
        Self { ir }
    }

    #[inline]
    pub fn ir(&self) -> &TensorIr {
        &self.ir
    }

    #[inline]
    pub fn id(&self) -> TensorId {
        self.ir.id
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.ir.shape.clone()
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.ir.r#type
    }

    #[inline]
    pub fn layout(&self) -> TensorLayout {
        self.ir.layout
    }

    #[inline]
    pub fn memory_config(&self) -> MemoryConfig {
        self.ir.memory
    }

    #[inline]
    pub fn placement(&self) -> Placement {
        self.ir.memory.placement
    }

    #[inline]
    pub fn mapper(&self) -> MeshMapper {
        self.ir.mapper
    }

    #[inline]
    pub fn is_sharded(&self) -> bool {
        self.ir.memory.is_sharded()
    }

    /// Number of logical elements across the whole tensor.
    #[inline]
    pub fn data_count(&self) -> usize {
        self.ir.shape.volume()
    }
}

#[cfg(test)]
mod tests {
    use super::HostTensor;
    use crate::loom::layout::Shape;

    #[test]
    fn test_host_reshape_expand() {
        let x = HostTensor::new([4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(HostTensor::new([3], vec![1.0]).is_err());

        let y = x.expand(3).unwrap();
        assert_eq!(y.shape(), Shape::from([3, 4]));
        assert_eq!(&y.data()[4..8], x.data());
        assert_eq!(&y.data()[8..], x.data());

        let z = x.reshape([1, 1, 4]).unwrap();
        assert_eq!(z.shape(), Shape::from([1, 1, 4]));
        assert!(x.reshape([5]).is_err());
        assert!(x.expand(0).is_err());
    }

    #[test]
    fn test_host_split() {
        let data: Vec<f32> = (0..12).map(|x| x as f32).collect();
        let x = HostTensor::new([2, 6], data).unwrap();

        let parts = x.split(1, 3).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].shape(), Shape::from([2, 2]));
        assert_eq!(parts[1].data(), &[2.0, 3.0, 8.0, 9.0]);

        let parts = x.split(0, 2).unwrap();
        assert_eq!(parts[1].data(), &[6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);

        assert!(x.split(1, 4).is_err());
        assert!(x.split(2, 1).is_err());
    }
}
