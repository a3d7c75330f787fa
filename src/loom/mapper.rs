use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    layout::Shape,
    tensor::{HostTensor, TensorError},
};

/// How a host tensor is distributed over the devices of a mesh.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MeshMapper {
    /// Every device holds an identical full copy.
    #[default]
    #[display("replicate")]
    Replicate,
    /// Each device holds a distinct slice along `dim`.
    #[display("shard({dim})")]
    Shard { dim: usize },
}

impl MeshMapper {
    /// Checks that a tensor of `shape` can be distributed over `devices`.
    pub fn validate(&self, shape: &Shape, devices: usize) -> Result<(), TensorError> {
        match *self {
            MeshMapper::Replicate => Ok(()),
            MeshMapper::Shard { dim } if dim < shape.len() && shape[dim] % devices.max(1) == 0 => {
                Ok(())
            }
            MeshMapper::Shard { dim } => Err(TensorError::Split {
                shape: shape.clone(),
                dim,
                parts: devices,
            }),
        }
    }

    /// Splits `tensor` into one host tensor per device.
    pub fn distribute(
        &self,
        tensor: &HostTensor,
        devices: usize,
    ) -> Result<Vec<HostTensor>, TensorError> {
        match *self {
            MeshMapper::Replicate => Ok(vec![tensor.clone(); devices]),
            MeshMapper::Shard { dim } => tensor.split(dim, devices),
        }
    }

    /// The shape each device holds of a tensor of the global `shape`.
    pub fn local_shape(&self, shape: &Shape, devices: usize) -> Shape {
        match *self {
            MeshMapper::Replicate => shape.clone(),
            MeshMapper::Shard { dim } => shape.with_dim(dim, shape[dim] / devices.max(1)),
        }
    }
}

/// Expands a logical weight into the replicated layout its consumers read.
///
/// The two policies are independent: one broadcasts a vector as-is, the other
/// first views it at a fixed width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationPlan {
    /// `[n]` → `[replicas, n]`.
    Broadcast { replicas: usize },
    /// Any weight of exactly `width` elements → `[1, replicas, width]`.
    ReshapeBroadcast { width: usize, replicas: usize },
}

impl ReplicationPlan {
    /// Number of replica rows, one per downstream tile row.
    pub const REPLICAS: usize = 32;
    /// Embedding width of the sharded norm.
    pub const SHARDED_WIDTH: usize = 4096;

    pub const BROADCAST: Self = Self::Broadcast {
        replicas: Self::REPLICAS,
    };

    pub const RESHAPE_BROADCAST: Self = Self::ReshapeBroadcast {
        width: Self::SHARDED_WIDTH,
        replicas: Self::REPLICAS,
    };

    /// The element count the source weight must have, if fixed.
    pub fn expected_len(&self) -> Option<usize> {
        match *self {
            ReplicationPlan::Broadcast { .. } => None,
            ReplicationPlan::ReshapeBroadcast { width, .. } => Some(width),
        }
    }

    pub fn apply(&self, weight: &HostTensor) -> Result<HostTensor, TensorError> {
        match *self {
            ReplicationPlan::Broadcast { replicas } => {
                if weight.shape().len() != 1 {
                    return Err(TensorError::Expand(weight.shape(), replicas));
                }
                weight.expand(replicas)
            }
            ReplicationPlan::ReshapeBroadcast { width, replicas } => weight
                .reshape([1, width])?
                .expand(replicas)?
                .reshape([1, replicas, width]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MeshMapper, ReplicationPlan};
    use crate::loom::{layout::Shape, tensor::HostTensor};

    #[test]
    fn test_broadcast() {
        let weight = HostTensor::new([64], vec![0.5; 64]).unwrap();
        let plan = ReplicationPlan::BROADCAST;
        let expanded = plan.apply(&weight).unwrap();
        assert_eq!(expanded.shape(), Shape::from([32, 64]));
        assert_eq!(expanded.len(), 32 * weight.len());
        assert!(expanded.data().chunks(64).all(|row| row == weight.data()));

        let matrix = HostTensor::new([2, 32], vec![0.5; 64]).unwrap();
        assert!(plan.apply(&matrix).is_err());
    }

    #[test]
    fn test_reshape_broadcast() {
        let plan = ReplicationPlan::ReshapeBroadcast {
            width: 8,
            replicas: 4,
        };
        let data: Vec<f32> = (0..8).map(|x| x as f32).collect();
        let weight = HostTensor::new([2, 4], data.clone()).unwrap();
        let expanded = plan.apply(&weight).unwrap();
        assert_eq!(expanded.shape(), Shape::from([1, 4, 8]));
        assert!(expanded.data().chunks(8).all(|row| row == &data[..]));

        let weight = HostTensor::new([7], vec![0.0; 7]).unwrap();
        assert!(plan.apply(&weight).is_err());
        assert_eq!(plan.expected_len(), Some(8));
        assert_eq!(ReplicationPlan::BROADCAST.expected_len(), None);
    }

    #[test]
    fn test_mapper() {
        let x = HostTensor::new([2, 8], vec![1.0; 16]).unwrap();
        let replicas = MeshMapper::Replicate.distribute(&x, 4).unwrap();
        assert_eq!(replicas.len(), 4);
        assert!(replicas.iter().all(|r| r == &x));

        let mapper = MeshMapper::Shard { dim: 1 };
        assert!(mapper.validate(&x.shape(), 4).is_ok());
        assert!(mapper.validate(&x.shape(), 3).is_err());
        assert!(MeshMapper::Shard { dim: 2 }.validate(&x.shape(), 1).is_err());
        assert!(MeshMapper::Replicate.validate(&x.shape(), 3).is_ok());

        let shards = mapper.distribute(&x, 4).unwrap();
        assert!(shards.iter().all(|s| s.shape() == Shape::from([2, 2])));
        assert_eq!(mapper.local_shape(&x.shape(), 4), Shape::from([2, 2]));
        assert!(mapper.distribute(&x, 3).is_err());
    }
}
