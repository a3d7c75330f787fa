use std::sync::Arc;

use bytemuck::Pod;
use derive_more::Display;
use half::{bf16, f16};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    #[display("f32")]
    F32,
    #[display("f16")]
    F16,
    #[display("bf16")]
    Bf16,
}

impl DataType {
    /// Returns the size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::Bf16 => 2,
        }
    }

    /// Decodes raw device bytes of this type into `f32` values.
    pub fn decode(self, bytes: &[u8]) -> Vec<f32> {
        match self {
            DataType::F32 => decode::<f32>(bytes),
            DataType::F16 => decode::<f16>(bytes),
            DataType::Bf16 => decode::<bf16>(bytes),
        }
    }

    /// Quantizes `f32` values into raw bytes of this type.
    pub fn encode(self, values: &[f32]) -> Arc<[u8]> {
        match self {
            DataType::F32 => encode::<f32>(values),
            DataType::F16 => encode::<f16>(values),
            DataType::Bf16 => encode::<bf16>(values),
        }
    }
}

impl From<DataType> for safetensors::Dtype {
    fn from(value: DataType) -> Self {
        match value {
            DataType::F32 => safetensors::Dtype::F32,
            DataType::F16 => safetensors::Dtype::F16,
            DataType::Bf16 => safetensors::Dtype::BF16,
        }
    }
}

impl TryFrom<safetensors::Dtype> for DataType {
    type Error = safetensors::Dtype;

    fn try_from(value: safetensors::Dtype) -> Result<Self, Self::Error> {
        match value {
            safetensors::Dtype::F32 => Ok(DataType::F32),
            safetensors::Dtype::F16 => Ok(DataType::F16),
            safetensors::Dtype::BF16 => Ok(DataType::Bf16),
            other => Err(other),
        }
    }
}

pub trait Scalar: Sized + Pod + Send + Sync {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl Scalar for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Scalar for f16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl Scalar for bf16 {
    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}

fn decode<T: Scalar>(bytes: &[u8]) -> Vec<f32> {
    // device buffers carry no alignment guarantee
    bytes
        .chunks_exact(size_of::<T>())
        .map(bytemuck::pod_read_unaligned::<T>)
        .map(T::to_f32)
        .collect()
}

fn encode<T: Scalar>(values: &[f32]) -> Arc<[u8]> {
    let values: Vec<T> = values.iter().copied().map(T::from_f32).collect();
    bytemuck::cast_slice(&values).into()
}

#[cfg(test)]
mod tests {
    use super::DataType;

    #[test]
    fn test_codec_precision() {
        let values = [1.0, -2.5, 0.333_333_34, 65504.0];

        let f32 = DataType::F32.decode(&DataType::F32.encode(&values));
        assert_eq!(f32, values);

        let f16 = DataType::F16.decode(&DataType::F16.encode(&values));
        assert_eq!(f16[..2], values[..2]);
        assert!((f16[2] - values[2]).abs() < 1e-3);
        assert_eq!(f16[3], 65504.0);

        let bf16 = DataType::Bf16.decode(&DataType::Bf16.encode(&values));
        assert_eq!(bf16[..2], values[..2]);
        assert!((bf16[2] - values[2]).abs() < 1e-2);

        assert_eq!(DataType::Bf16.encode(&values).len(), 4 * DataType::Bf16.size());
    }
}
