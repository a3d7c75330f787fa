use std::path::PathBuf;

use derive_more::{Deref, DerefMut, Display};
use thiserror::Error;

pub use cache::{CacheError, CacheKey, TensorCache};
pub use mesh::{Mesh, MeshBuilder};

use super::{
    layout::TensorLayout,
    mapper::MeshMapper,
    memory::{BufferType, MemoryConfig, MemoryError},
    num::DataType,
    tensor::{HostTensor, TensorError, TensorId, TensorIr},
};
use crate::hal::ops::{NormOp, ProgramError};

pub mod cache;
pub mod mesh;
pub mod registry;

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct DeviceId(uid::Id<DeviceId>);

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of {buffer} memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        buffer: BufferType,
        requested: usize,
        available: usize,
    },
    #[error("tensor {0} is not resident on the device")]
    Tensor(TensorId),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error(transparent)]
    Shape(#[from] TensorError),
    #[error("compute error: {0}")]
    Compute(String),
    #[error("cache error at {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: CacheError,
    },
    #[error("device disconnected")]
    Disconnected(#[from] flume::RecvError),
}

impl DeviceError {
    /// Returns `true` if the device ran out of memory serving the request.
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, DeviceError::OutOfMemory { .. })
    }
}

/// Counters kept by a device layer since it was built.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    /// Buffers allocated, for new data or a layout conversion.
    pub allocations: usize,
    /// Handles released.
    pub releases: usize,
    /// Host data uploaded to the device.
    pub host_transfers: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// Layout conversions that copied into a new buffer.
    pub conversions: usize,
    /// Handles created over an existing buffer without allocating.
    pub aliases: usize,
    pub norms: usize,
    pub live_tensors: usize,
    pub live_buffers: usize,
}

/// A request to place host data on the device.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub data: HostTensor,
    pub r#type: DataType,
    pub layout: TensorLayout,
    pub memory: MemoryConfig,
    pub mapper: MeshMapper,
    pub cache: Option<CacheKey>,
}

impl CreateRequest {
    pub fn new(data: HostTensor, r#type: DataType) -> Self {
        Self {
            data,
            r#type,
            layout: Default::default(),
            memory: Default::default(),
            mapper: Default::default(),
            cache: None,
        }
    }

    pub fn layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    pub fn mapper(mut self, mapper: MeshMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn cache(mut self, cache: Option<CacheKey>) -> Self {
        self.cache = cache;
        self
    }
}

pub type Reply<T> = flume::Sender<Result<T, DeviceError>>;

#[derive(Debug)]
pub enum DeviceEvent {
    Create {
        request: CreateRequest,
        sender: Reply<TensorIr>,
    },
    Convert {
        input: TensorIr,
        memory: MemoryConfig,
        sender: Reply<TensorIr>,
    },
    Norm {
        op: NormOp,
        sender: Reply<TensorIr>,
    },
    Release {
        input: TensorIr,
        sender: Reply<()>,
    },
    Back {
        input: TensorIr,
        sender: Reply<Vec<HostTensor>>,
    },
    Stats {
        sender: flume::Sender<DeviceStats>,
    },
}

impl DeviceEvent {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            DeviceEvent::Create { .. } => "create",
            DeviceEvent::Convert { .. } => "convert",
            DeviceEvent::Norm { .. } => "norm",
            DeviceEvent::Release { .. } => "release",
            DeviceEvent::Back { .. } => "back",
            DeviceEvent::Stats { .. } => "stats",
        }
    }
}

/// A set of accelerators addressed as one target.
///
/// Requests are submitted as [`DeviceEvent`]s; each carries the channel its reply is sent to.
pub trait Device {
    fn execute(&self, event: DeviceEvent);
}

impl<D: Device> Device for &D {
    #[inline]
    fn execute(&self, event: DeviceEvent) {
        (**self).execute(event)
    }
}

/// Queries the counters of a device.
pub async fn stats<D: Device>(device: &D) -> Result<DeviceStats, DeviceError> {
    let (sender, receiver) = flume::bounded(1);
    device.execute(DeviceEvent::Stats { sender });
    Ok(receiver.recv_async().await?)
}
