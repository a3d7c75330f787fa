use itertools::Itertools;

use super::{
    CreateRequest, Device, DeviceError, DeviceEvent, DeviceId, DeviceStats, TensorCache,
    registry::{Capacity, Registry},
};
use crate::{
    hal::{cpu::norm, ops::NormOp},
    loom::{
        memory::{MemoryConfig, Placement},
        platform,
        tensor::{HostTensor, TensorId, TensorIr},
    },
};

/// DRAM per device of a Wormhole card.
pub const DEFAULT_DRAM_CAPACITY: usize = 12 << 30;
/// L1 per device: 64 Tensix cores of 1464 KiB each.
pub const DEFAULT_L1_CAPACITY: usize = 64 * 1464 << 10;

/// Host-side state of the simulated mesh.
#[derive(Debug)]
pub struct Backend {
    registry: Registry,
    stats: DeviceStats,
}

impl Backend {
    #[inline]
    fn devices(&self) -> usize {
        self.registry.devices()
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            live_tensors: self.registry.live_tensors(),
            live_buffers: self.registry.live_buffers(),
            ..self.stats
        }
    }

    fn create(&mut self, request: CreateRequest) -> Result<TensorIr, DeviceError> {
        let CreateRequest {
            data,
            r#type,
            layout,
            memory,
            mapper,
            cache,
        } = request;

        let devices = self.devices();
        mapper.validate(&data.shape(), devices)?;
        let local = mapper.local_shape(&data.shape(), devices);
        memory.validate(&local, layout)?;

        let ir = TensorIr {
            id: TensorId::new(),
            shape: data.shape(),
            r#type,
            layout,
            memory,
            mapper,
        };
        self.registry.reserve(memory.buffer, ir.data_size(devices))?;

        let data = match cache {
            Some(key) => {
                let path = key.path(r#type, layout);
                let shape = data.shape();
                let cached = TensorCache::load(&path, r#type, &shape)
                    .map_err(|source| DeviceError::Cache {
                        path: path.clone(),
                        source,
                    })?;
                match cached {
                    Some(cached) => {
                        log::debug!("cache hit: {}", path.display());
                        self.stats.cache_hits += 1;
                        cached
                    }
                    None => {
                        let stored = TensorCache::store(&path, r#type, &data)
                            .map_err(|source| DeviceError::Cache { path: path.clone(), source })?;
                        log::info!("cache write: {}", path.display());
                        self.stats.cache_misses += 1;
                        self.stats.host_transfers += 1;
                        stored
                    }
                }
            }
            None => {
                self.stats.host_transfers += 1;
                data
            }
        };

        let shards = mapper
            .distribute(&data, devices)?
            .iter()
            .map(|tensor| r#type.encode(tensor.data()))
            .collect_vec();
        self.registry.insert(ir.clone(), shards)?;
        self.stats.allocations += 1;
        Ok(ir)
    }

    fn convert(&mut self, input: TensorIr, memory: MemoryConfig) -> Result<TensorIr, DeviceError> {
        let source = self.registry.ir(input.id)?.clone();
        let ir = TensorIr {
            id: TensorId::new(),
            memory,
            ..source.clone()
        };

        if source.memory == memory {
            self.registry.alias(source.id, ir.clone())?;
            self.stats.aliases += 1;
            return Ok(ir);
        }

        let local = source.mapper.local_shape(&source.shape, self.devices());
        memory.validate(&local, source.layout)?;

        let shards = self.registry.fetch(source.id)?;
        self.registry.insert(ir.clone(), shards)?;
        self.stats.allocations += 1;
        self.stats.conversions += 1;
        log::debug!("convert {}: {} → {}", source.id, source.memory, memory);
        Ok(ir)
    }

    async fn norm(&mut self, op: NormOp) -> Result<TensorIr, DeviceError> {
        let NormOp {
            kind,
            eps,
            input,
            weight,
            bias,
            program,
            memory,
        } = op;

        let input = self.registry.ir(input.id)?.clone();
        let local = input.mapper.local_shape(&input.shape, self.devices());
        let width = local.width();

        if let Some(program) = &program {
            let Placement::Sharded(spec) = &input.memory.placement else {
                return Err(DeviceError::Compute(format!(
                    "sharded {kind} program requires a sharded input, got {}",
                    input.memory
                )));
            };
            program.validate(spec)?;
        }

        let memory = memory.unwrap_or(input.memory);
        if program.is_some_and(|program| program.inplace) && memory != input.memory {
            return Err(DeviceError::Compute(format!(
                "in-place {kind} cannot change memory config {} to {memory}",
                input.memory
            )));
        }
        memory.validate(&local, input.layout)?;

        // parameters are read from the first row of each device's copy
        let params = |ir: Option<TensorIr>| -> Result<Option<Vec<Vec<f32>>>, DeviceError> {
            let Some(ir) = ir else {
                return Ok(None);
            };
            let ir = self.registry.ir(ir.id)?.clone();
            let param = ir.mapper.local_shape(&ir.shape, self.devices());
            if param.width() != width {
                return Err(DeviceError::Compute(format!(
                    "{kind} parameter of shape {} does not match input width {width}",
                    ir.shape
                )));
            }
            let shards = self.registry.fetch(ir.id)?;
            let values = shards.iter().map(|shard| ir.r#type.decode(shard)).collect();
            Ok(Some(values))
        };
        let weight = params(weight)?;
        let bias = params(bias)?;

        let inputs = self.registry.fetch(input.id)?;
        let r#type = input.r#type;
        let output = platform::spawn_blocking(move || {
            inputs
                .iter()
                .enumerate()
                .map(|(index, shard)| {
                    let x = r#type.decode(shard);
                    let w = weight.as_ref().map(|w| &w[index][..]);
                    let b = bias.as_ref().map(|b| &b[index][..]);
                    let y = norm::norm(kind, &x, width, w, b, eps);
                    r#type.encode(&y)
                })
                .collect_vec()
        })
        .await
        .map_err(|err| DeviceError::Compute(err.to_string()))?;

        let ir = TensorIr {
            id: TensorId::new(),
            memory,
            ..input.clone()
        };
        match program.is_some_and(|program| program.inplace) {
            true => {
                self.registry.alias(input.id, ir.clone())?;
                self.registry.write(ir.id, output)?;
            }
            false => {
                self.registry.insert(ir.clone(), output)?;
                self.stats.allocations += 1;
            }
        }
        self.stats.norms += 1;
        Ok(ir)
    }

    fn release(&mut self, input: TensorIr) -> Result<(), DeviceError> {
        let freed = self.registry.release(input.id)?;
        self.stats.releases += 1;
        if freed {
            log::trace!("freed buffer of {}", input.id);
        }
        Ok(())
    }

    fn back(&self, input: TensorIr) -> Result<Vec<HostTensor>, DeviceError> {
        let ir = self.registry.ir(input.id)?;
        let shape = ir.mapper.local_shape(&ir.shape, self.devices());
        let tensors = self
            .registry
            .fetch(ir.id)?
            .iter()
            .map(|shard| HostTensor::new(shape.clone(), ir.r#type.decode(shard)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tensors)
    }
}

async fn serve(mut backend: Backend, receiver: flume::Receiver<DeviceEvent>) {
    macro_rules! reply {
        ($sender:expr, $result:expr) => {{
            let result = $result;
            if let Err(err) = &result {
                log::error!("{err}");
            }
            if $sender.send(result).is_err() {
                log::warn!("reply dropped: requester is gone");
            }
        }};
    }

    while let Ok(event) = receiver.recv_async().await {
        match event {
            DeviceEvent::Create { request, sender } => reply!(sender, backend.create(request)),
            DeviceEvent::Convert {
                input,
                memory,
                sender,
            } => reply!(sender, backend.convert(input, memory)),
            DeviceEvent::Norm { op, sender } => reply!(sender, backend.norm(op).await),
            DeviceEvent::Release { input, sender } => reply!(sender, backend.release(input)),
            DeviceEvent::Back { input, sender } => reply!(sender, backend.back(input)),
            DeviceEvent::Stats { sender } => {
                _ = sender.send(backend.stats());
            }
        }
    }

    let stats = backend.stats();
    if stats.live_tensors > 0 {
        log::warn!(
            "mesh shut down with {} live tensors:\n{}",
            stats.live_tensors,
            backend.registry
        );
    }
}

/// A host-simulated mesh of accelerator devices.
///
/// Requests are served in order by a background task; cloning the mesh yields
/// another handle to the same devices.
#[derive(Debug, Clone)]
pub struct Mesh {
    /// The unique identifier of the mesh.
    id: DeviceId,
    /// Rows and columns of devices.
    shape: [usize; 2],
    /// Sends requests to the backend.
    sender: flume::Sender<DeviceEvent>,
}

impl Device for Mesh {
    fn execute(&self, event: DeviceEvent) {
        _ = self.sender.send(event)
    }
}

impl Mesh {
    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    #[inline]
    pub fn num_devices(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone)]
pub struct MeshBuilder {
    pub shape: [usize; 2],
    pub capacity: Capacity,
}

impl Default for MeshBuilder {
    fn default() -> Self {
        Self {
            shape: [1, 1],
            capacity: Capacity {
                dram: DEFAULT_DRAM_CAPACITY,
                l1: DEFAULT_L1_CAPACITY,
            },
        }
    }
}

impl MeshBuilder {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            shape: [rows, cols],
            ..Default::default()
        }
    }

    pub fn dram_capacity(mut self, bytes: usize) -> Self {
        self.capacity.dram = bytes;
        self
    }

    pub fn l1_capacity(mut self, bytes: usize) -> Self {
        self.capacity.l1 = bytes;
        self
    }

    /// Starts the backend. Must be called within a `tokio` runtime.
    pub async fn build(self) -> Mesh {
        let Self { shape, capacity } = self;
        let devices = shape.iter().product::<usize>().max(1);
        let registry = Registry::new(devices, capacity);
        let stats = Default::default();

        let (sender, receiver) = flume::unbounded();
        let backend = Backend { registry, stats };
        platform::spawn(serve(backend, receiver));

        let id = DeviceId(uid::Id::new());
        Mesh { id, shape, sender }
    }
}

