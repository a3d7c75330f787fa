use super::ops::{NormKind, NormOp, NormProgramConfig};
use crate::loom::{
    device::{CreateRequest, Device, DeviceError, DeviceEvent},
    memory::{BufferType, MemoryConfig, Placement, ShardSpec},
    tensor::{DeviceTensor, HostTensor},
};

/// Operands and options of a norm.
#[derive(Debug, Clone, Copy)]
pub struct NormParams<'a> {
    pub eps: f32,
    pub weight: Option<&'a DeviceTensor>,
    pub bias: Option<&'a DeviceTensor>,
    pub program: Option<NormProgramConfig>,
    pub memory: Option<MemoryConfig>,
}

impl<'a> NormParams<'a> {
    pub fn new(eps: f32) -> Self {
        Self {
            eps,
            weight: None,
            bias: None,
            program: None,
            memory: None,
        }
    }

    pub fn weight(mut self, weight: &'a DeviceTensor) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn bias(mut self, bias: &'a DeviceTensor) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn program(mut self, program: impl Into<Option<NormProgramConfig>>) -> Self {
        self.program = program.into();
        self
    }

    pub fn memory(mut self, memory: impl Into<Option<MemoryConfig>>) -> Self {
        self.memory = memory.into();
        self
    }
}

impl DeviceTensor {
    /// Places host data on the device as described by `request`.
    ///
    /// If the request carries a cache key, the device layer may serve it from the
    /// on-disk cache instead of transferring the host data.
    pub async fn create<D: Device>(
        device: &D,
        request: CreateRequest,
    ) -> Result<Self, DeviceError> {
        let (sender, receiver) = flume::bounded(1);
        device.execute(DeviceEvent::Create { request, sender });
        let ir = receiver.recv_async().await??;
        Ok(Self::from_ir(ir))
    }

    /// # Memory Conversion (`to_memory`)
    /// Moves the tensor into another memory config.
    ///
    /// If the tensor is already placed as `memory`, no memory is allocated and the returned
    /// handle views the same buffer. Either way, the returned handle must be released on its own.
    pub async fn to_memory<D: Device>(
        &self,
        device: &D,
        memory: MemoryConfig,
    ) -> Result<Self, DeviceError> {
        let (sender, receiver) = flume::bounded(1);
        let input = self.ir().clone();
        device.execute(DeviceEvent::Convert {
            input,
            memory,
            sender,
        });
        let ir = receiver.recv_async().await??;
        Ok(Self::from_ir(ir))
    }

    /// Interleaved → sharded conversion into L1.
    #[inline]
    pub async fn to_sharded<D: Device>(
        &self,
        device: &D,
        spec: ShardSpec,
    ) -> Result<Self, DeviceError> {
        self.to_memory(device, MemoryConfig::sharded(spec)).await
    }

    /// Sharded → interleaved conversion into `buffer`.
    #[inline]
    pub async fn to_interleaved<D: Device>(
        &self,
        device: &D,
        buffer: BufferType,
    ) -> Result<Self, DeviceError> {
        let placement = Placement::Interleaved;
        self.to_memory(device, MemoryConfig { buffer, placement }).await
    }

    async fn norm<D: Device>(
        &self,
        device: &D,
        kind: NormKind,
        params: NormParams<'_>,
    ) -> Result<Self, DeviceError> {
        let NormParams {
            eps,
            weight,
            bias,
            program,
            memory,
        } = params;
        let op = NormOp {
            kind,
            eps,
            input: self.ir().clone(),
            weight: weight.map(|x| x.ir().clone()),
            bias: bias.map(|x| x.ir().clone()),
            program,
            memory,
        };

        let (sender, receiver) = flume::bounded(1);
        device.execute(DeviceEvent::Norm { op, sender });
        let ir = receiver.recv_async().await??;
        Ok(Self::from_ir(ir))
    }

    /// # RMS Normalization (`rms_norm`)
    /// Computes `x / sqrt(mean(x²) + eps) * w + b` over the trailing dimension.
    ///
    /// ## Arguments
    /// * `self` - The input tensor, of shape `[.., M]`.
    /// * `params` - Epsilon, optional weight and bias of width `M`, optional sharded
    ///   program and output memory config.
    ///
    /// ## Returns
    /// * `Result<DeviceTensor, DeviceError>` - A new handle of the input's shape.
    ///   With an in-place program it views the input's buffer.
    #[inline]
    pub async fn rms_norm<D: Device>(
        &self,
        device: &D,
        params: NormParams<'_>,
    ) -> Result<Self, DeviceError> {
        self.norm(device, NormKind::Rms, params).await
    }

    /// # Layer Normalization (`layer_norm`)
    /// Computes `(x - mean(x)) / sqrt(var(x) + eps) * w + b` over the trailing dimension.
    ///
    /// ## Arguments
    /// * `self` - The input tensor, of shape `[.., M]`.
    /// * `params` - Same as for [`DeviceTensor::rms_norm`].
    #[inline]
    pub async fn layer_norm<D: Device>(
        &self,
        device: &D,
        params: NormParams<'_>,
    ) -> Result<Self, DeviceError> {
        self.norm(device, NormKind::Layer, params).await
    }

    /// Hands the handle back to the device layer.
    pub async fn release<D: Device>(self, device: &D) -> Result<(), DeviceError> {
        let (sender, receiver) = flume::bounded(1);
        let input = self.ir().clone();
        device.execute(DeviceEvent::Release { input, sender });
        receiver.recv_async().await?
    }

    /// Read back the contents of each device.
    pub async fn back<D: Device>(&self, device: &D) -> Result<Vec<HostTensor>, DeviceError> {
        let (sender, receiver) = flume::bounded(1);
        let input = self.ir().clone();
        device.execute(DeviceEvent::Back { input, sender });
        receiver.recv_async().await?
    }
}
