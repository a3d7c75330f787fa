//! Norm layers whose weights live on the device mesh.
//!
//! A layer is bound once from a [`StateDict`]: its weight is expanded by a
//! [`ReplicationPlan`], replicated to every device and kept there until the layer is
//! released. [`RmsNorm`] normalizes inputs as they are placed; [`RmsNormSharded`]
//! stages inputs into the sharded layout of its program first.

use thiserror::Error;

use super::{
    args::ModelArgs,
    config::{
        ConfigError, NORM_W_LAYOUT_TILE, NORM_WEIGHTS_MEMCFG, SHARDED_NORM_INPUT_MEMCFG,
        SHARDED_NORM_OUTPUT_MEMCFG, SHARDED_NORM_PRGM_CFG,
    },
    state::StateDict,
};
use crate::{
    hal::{frontend::NormParams, ops::NormProgramConfig},
    loom::{
        device::{CacheKey, CreateRequest, Device, DeviceError},
        layout::{Shape, TensorLayout},
        mapper::{MeshMapper, ReplicationPlan},
        memory::{BufferType, MemoryConfig, ShardSpec},
        num::DataType,
        tensor::{DeviceTensor, TensorError},
    },
};

#[derive(Debug, Error)]
pub enum NormError {
    #[error("weight `{0}` is missing from the state dict")]
    MissingWeight(String),
    #[error("weight `{name}` of shape {shape} cannot be replicated: {source}")]
    ShapeMismatch {
        name: String,
        shape: Shape,
        #[source]
        source: TensorError,
    },
    #[error("device allocation for `{name}` as {dtype} failed: {source}")]
    DeviceAllocation {
        name: String,
        dtype: DataType,
        #[source]
        source: DeviceError,
    },
    #[error("device compute error: {0}")]
    DeviceCompute(#[from] DeviceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Name of a norm weight in the state dict.
pub fn weight_name(layer: Option<usize>, key: &str) -> String {
    match layer {
        Some(layer) => format!("layers.{layer}.{key}.weight"),
        None => format!("{key}.weight"),
    }
}

/// Splits device failures into allocation failures, which a caller may retry under less
/// memory pressure, and everything else.
fn device_error(name: &str, dtype: DataType, source: DeviceError) -> NormError {
    match source.is_out_of_memory() {
        true => NormError::DeviceAllocation {
            name: name.to_string(),
            dtype,
            source,
        },
        false => NormError::DeviceCompute(source),
    }
}

/// A replicated weight bound to the device, with the name it was bound from.
#[derive(Debug)]
pub struct NormWeight {
    name: String,
    tensor: DeviceTensor,
}

impl NormWeight {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn tensor(&self) -> &DeviceTensor {
        &self.tensor
    }

    pub async fn release<D: Device>(self, device: &D) -> Result<(), NormError> {
        self.tensor.release(device).await?;
        Ok(())
    }
}

/// Binds norm layers of one model to a device.
#[derive(Debug, Clone, Copy)]
pub struct NormBuilder<'a> {
    pub state: &'a StateDict,
    pub args: &'a ModelArgs,
    pub r#type: DataType,
    pub layer: Option<usize>,
    pub key: &'a str,
}

impl<'a> NormBuilder<'a> {
    pub fn new(state: &'a StateDict, args: &'a ModelArgs, key: &'a str) -> Self {
        Self {
            state,
            args,
            r#type: DataType::Bf16,
            layer: None,
            key,
        }
    }

    pub fn data_type(mut self, r#type: DataType) -> Self {
        self.r#type = r#type;
        self
    }

    pub fn layer(mut self, layer: impl Into<Option<usize>>) -> Self {
        self.layer = layer.into();
        self
    }

    #[inline]
    pub fn weight_name(&self) -> String {
        weight_name(self.layer, self.key)
    }

    /// Cache identity of the weight, or `None` when caching is off.
    pub fn cache_key(&self) -> Option<CacheKey> {
        let name = format!("{}multidevice", self.weight_name());
        self.args
            .weight_cache_path(self.r#type)
            .map(|root| CacheKey::new(root, name))
    }

    /// Looks up, expands and uploads the weight. Nothing is sent to the device unless
    /// the weight is found and fits `plan`.
    async fn bind<D: Device>(
        &self,
        device: &D,
        plan: ReplicationPlan,
        layout: TensorLayout,
        memory: MemoryConfig,
    ) -> Result<NormWeight, NormError> {
        let name = self.weight_name();
        let weight = self
            .state
            .get(&name)
            .ok_or_else(|| NormError::MissingWeight(name.clone()))?;
        let mismatch = |source| NormError::ShapeMismatch {
            name: name.clone(),
            shape: weight.shape(),
            source,
        };
        if let Some(len) = plan.expected_len().filter(|&len| len != weight.len()) {
            let source = TensorError::Reshape(weight.shape(), Shape::from([len]));
            return Err(mismatch(source));
        }
        let data = plan.apply(weight).map_err(mismatch)?;

        let cache = self.cache_key();
        log::debug!(
            "bind {name}: {} → {} as {} {layout} {memory}, cached: {}",
            weight.shape(),
            data.shape(),
            self.r#type,
            cache.is_some()
        );

        let request = CreateRequest::new(data, self.r#type)
            .layout(layout)
            .memory(memory)
            .mapper(MeshMapper::Replicate)
            .cache(cache);
        let tensor = DeviceTensor::create(device, request)
            .await
            .map_err(|source| device_error(&name, self.r#type, source))?;
        Ok(NormWeight { name, tensor })
    }

    /// Binds a norm that runs on inputs as they are placed.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn build<D: Device>(self, device: &D) -> Result<RmsNorm, NormError> {
        let config = self.args.model_config();
        let layout = config.layout(NORM_W_LAYOUT_TILE)?;
        let memory = config.memory(NORM_WEIGHTS_MEMCFG)?;

        let weight = self
            .bind(device, ReplicationPlan::BROADCAST, layout, memory)
            .await?;
        let eps = self.args.norm_eps;
        Ok(RmsNorm { weight, eps })
    }

    /// Binds a norm that runs a sharded program over inputs of the fixed embedding width.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn build_sharded<D: Device>(self, device: &D) -> Result<RmsNormSharded, NormError> {
        let config = self.args.model_config();
        let memory = config.memory(NORM_WEIGHTS_MEMCFG)?;
        let input = config.shard_spec(SHARDED_NORM_INPUT_MEMCFG)?;
        let program = config.program(SHARDED_NORM_PRGM_CFG)?;
        let output = config.memory(SHARDED_NORM_OUTPUT_MEMCFG)?;

        let weight = self
            .bind(device, ReplicationPlan::RESHAPE_BROADCAST, TensorLayout::Tile, memory)
            .await?;
        let eps = self.args.norm_eps;
        Ok(RmsNormSharded {
            weight,
            eps,
            input,
            program,
            output,
        })
    }
}

/// RMS norm over the trailing dimension, keeping the input's placement.
#[derive(Debug)]
pub struct RmsNorm {
    weight: NormWeight,
    eps: f32,
}

impl RmsNorm {
    #[inline]
    pub fn weight(&self) -> &NormWeight {
        &self.weight
    }

    #[inline]
    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// Normalizes `x`. The caller keeps ownership of `x` and owns the returned tensor.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn forward<D: Device>(
        &self,
        device: &D,
        x: &DeviceTensor,
    ) -> Result<DeviceTensor, NormError> {
        let params = NormParams::new(self.eps).weight(self.weight.tensor());
        x.rms_norm(device, params)
            .await
            .map_err(|source| device_error(self.weight.name(), x.data_type(), source))
    }

    pub async fn release<D: Device>(self, device: &D) -> Result<(), NormError> {
        self.weight.release(device).await
    }
}

/// RMS norm computed by a sharded program.
#[derive(Debug)]
pub struct RmsNormSharded {
    weight: NormWeight,
    eps: f32,
    /// How inputs are sharded before the norm.
    input: ShardSpec,
    program: NormProgramConfig,
    /// Where the sharded result is placed.
    output: MemoryConfig,
}

impl RmsNormSharded {
    #[inline]
    pub fn weight(&self) -> &NormWeight {
        &self.weight
    }

    #[inline]
    pub fn eps(&self) -> f32 {
        self.eps
    }

    #[inline]
    pub fn program(&self) -> NormProgramConfig {
        self.program
    }

    /// Normalizes `x`, returning a sharded tensor if `out_sharded`, else an interleaved one
    /// in DRAM.
    ///
    /// The caller keeps ownership of `x`, which is never written to. Intermediates created
    /// here are released here, except for the result.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, device, x)))]
    pub async fn forward<D: Device>(
        &self,
        device: &D,
        x: &DeviceTensor,
        out_sharded: bool,
    ) -> Result<DeviceTensor, NormError> {
        let error = |source| device_error(self.weight.name(), x.data_type(), source);

        // an input that is already sharded belongs to the caller: the norm must not run over it
        let (staged, program) = match x.is_sharded() {
            true => {
                let program = NormProgramConfig {
                    inplace: false,
                    ..self.program
                };
                (None, program)
            }
            false => {
                let staged = x.to_sharded(device, self.input).await.map_err(error)?;
                (Some(staged), self.program)
            }
        };

        let params = NormParams::new(self.eps)
            .weight(self.weight.tensor())
            .program(program)
            .memory(self.output);
        let output = staged.as_ref().unwrap_or(x).rms_norm(device, params).await;

        if let Some(staged) = staged {
            staged.release(device).await?;
        }
        let output = output.map_err(error)?;

        match out_sharded {
            true => Ok(output),
            false => {
                let interleaved = output.to_interleaved(device, BufferType::Dram).await;
                output.release(device).await?;
                interleaved.map_err(error)
            }
        }
    }

    pub async fn release<D: Device>(self, device: &D) -> Result<(), NormError> {
        self.weight.release(device).await
    }
}

#[cfg(test)]
mod tests {
    use super::{NormBuilder, NormError, weight_name};
    use crate::{
        loom::{
            device::{self, MeshBuilder},
            memory::CoreGrid,
            num::DataType,
            tensor::HostTensor,
        },
        model::{args::ModelArgs, config::ModelConfig, state::StateDict},
    };

    #[test]
    fn test_weight_name() {
        assert_eq!(weight_name(None, "norm"), "norm.weight");
        assert_eq!(weight_name(Some(3), "attention_norm"), "layers.3.attention_norm.weight");
    }

    #[test]
    fn test_cache_key() {
        let state = StateDict::new();
        let args = ModelArgs::new(ModelConfig::new()).cache_root("/tmp/weights");
        let builder = NormBuilder::new(&state, &args, "ffn_norm").layer(0);
        let key = builder.cache_key().expect("caching is on");
        assert_eq!(key.name, "layers.0.ffn_norm.weightmultidevice");
        assert!(key.root.ends_with("tensor_cache_bf16"));

        let args = args.dummy_weights(true);
        let builder = NormBuilder::new(&state, &args, "ffn_norm").layer(0);
        assert_eq!(builder.cache_key(), None);
    }

    #[tokio::test]
    async fn test_missing_config() -> Result<(), NormError> {
        let mesh = MeshBuilder::new(1, 2).build().await;
        let weight = HostTensor::new([64], vec![1.0; 64]).unwrap();
        let state = StateDict::new().with("norm.weight", weight);
        let args = ModelArgs::default();

        let err = NormBuilder::new(&state, &args, "norm").build(&mesh).await.unwrap_err();
        assert!(matches!(err, NormError::Config(_)));

        let args = ModelArgs::new(ModelConfig::sharded_norm(4096, CoreGrid::new(8, 4)));
        let err = NormBuilder::new(&state, &args, "norm")
            .build_sharded(&mesh)
            .await
            .unwrap_err();
        assert!(matches!(err, NormError::ShapeMismatch { .. }));

        let norm = NormBuilder::new(&state, &args, "norm")
            .data_type(DataType::F16)
            .build(&mesh)
            .await?;
        assert_eq!(norm.weight().tensor().data_count(), 32 * 64);
        assert_eq!(norm.weight().name(), "norm.weight");
        norm.release(&mesh).await?;

        let stats = device::stats(&mesh).await?;
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.live_tensors, 0);
        Ok(())
    }
}
