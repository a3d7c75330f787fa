use derive_more::{Deref, DerefMut};
use rustc_hash::FxHashMap as HashMap;
use safetensors::SafeTensors;
use thiserror::Error;

use crate::loom::{
    num::DataType,
    tensor::{HostTensor, TensorError},
};

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    SafeTensor(#[from] safetensors::SafeTensorError),
    #[error("tensor `{0}` has unsupported data type {1:?}")]
    Type(String, safetensors::Dtype),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Host-resident weights of a model, keyed by name.
#[derive(Debug, Default, Clone, Deref, DerefMut)]
pub struct StateDict(HashMap<String, HostTensor>);

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a weight.
    pub fn with(mut self, name: impl Into<String>, tensor: HostTensor) -> Self {
        self.0.insert(name.into(), tensor);
        self
    }

    /// Loads every floating point tensor of a `safetensors` file, widened to `f32`.
    pub fn from_safetensors(bytes: &[u8]) -> Result<Self, StateError> {
        let tensors = SafeTensors::deserialize(bytes)?;
        let mut state = HashMap::default();
        for (name, view) in tensors.tensors() {
            let r#type = DataType::try_from(view.dtype())
                .map_err(|dtype| StateError::Type(name.clone(), dtype))?;
            let data = r#type.decode(view.data());
            let tensor = HostTensor::new(view.shape(), data)?;
            state.insert(name, tensor);
        }
        log::debug!("loaded {} tensors", state.len());
        Ok(Self(state))
    }
}

impl FromIterator<(String, HostTensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, HostTensor)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use half::bf16;
    use safetensors::{Dtype, tensor::TensorView};

    use super::{StateDict, StateError};
    use crate::loom::layout::Shape;

    #[test]
    fn test_from_safetensors() -> Result<(), StateError> {
        let norm: Vec<bf16> = [1.0f32, 0.5, 2.0, -1.0].map(bf16::from_f32).to_vec();
        let norm = bytemuck::cast_slice(&norm);
        let bias: Vec<u8> = [0.25f32; 4].iter().flat_map(|x| x.to_le_bytes()).collect();
        let ids: Vec<u8> = [1i32, 2].iter().flat_map(|x| x.to_le_bytes()).collect();

        let bytes = safetensors::serialize(
            [
                ("layers.0.attention_norm.weight", TensorView::new(Dtype::BF16, vec![4], norm)?),
                ("norm.bias", TensorView::new(Dtype::F32, vec![2, 2], &bias)?),
            ],
            &None,
        )?;
        let state = StateDict::from_safetensors(&bytes)?;
        let weight = &state["layers.0.attention_norm.weight"];
        assert_eq!(weight.data(), &[1.0, 0.5, 2.0, -1.0]);
        assert_eq!(state["norm.bias"].shape(), Shape::from([2, 2]));

        let ids = TensorView::new(Dtype::I32, vec![2], &ids)?;
        let bytes = safetensors::serialize([("ids", ids)], &None)?;
        let err = StateDict::from_safetensors(&bytes).unwrap_err();
        assert!(matches!(err, StateError::Type(name, Dtype::I32) if name == "ids"));
        Ok(())
    }
}
