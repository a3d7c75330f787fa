use std::sync::Arc;

use derive_more::{Deref, DerefMut, Display};
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::DeviceError;
use crate::loom::{
    memory::BufferType,
    tensor::{TensorId, TensorIr},
};

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct BufferId(uid::Id<BufferId>);

/// Bytes available to each device in every buffer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub dram: usize,
    pub l1: usize,
}

impl Capacity {
    #[inline]
    pub fn get(&self, buffer: BufferType) -> usize {
        match buffer {
            BufferType::Dram => self.dram,
            BufferType::L1 => self.l1,
        }
    }
}

/// A device allocation, mirrored on every device of the mesh.
#[derive(Debug, Clone)]
struct Buffer {
    buffer: BufferType,
    /// Padded size on each device in bytes.
    size: usize,
    /// Contents of each device.
    shards: Vec<Arc<[u8]>>,
    /// Number of live handles viewing the buffer.
    views: usize,
}

/// Arena of device allocations.
///
/// Every handle given out is a view of exactly one buffer; a buffer is freed
/// once its last view is released.
#[derive(Debug, Clone)]
pub struct Registry {
    devices: usize,
    capacity: Capacity,
    used: HashMap<BufferType, usize>,
    views: HashMap<TensorId, (BufferId, TensorIr)>,
    buffers: HashMap<BufferId, Buffer>,
}

impl Registry {
    pub fn new(devices: usize, capacity: Capacity) -> Self {
        Self {
            devices,
            capacity,
            used: Default::default(),
            views: Default::default(),
            buffers: Default::default(),
        }
    }

    #[inline]
    pub fn devices(&self) -> usize {
        self.devices
    }

    /// Bytes in use on each device for `buffer`.
    #[inline]
    pub fn used(&self, buffer: BufferType) -> usize {
        self.used.get(&buffer).copied().unwrap_or_default()
    }

    #[inline]
    pub fn live_tensors(&self) -> usize {
        self.views.len()
    }

    #[inline]
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Checks that `size` more bytes fit into `buffer` on every device.
    pub fn reserve(&self, buffer: BufferType, size: usize) -> Result<(), DeviceError> {
        let available = self.capacity.get(buffer).saturating_sub(self.used(buffer));
        match size <= available {
            true => Ok(()),
            false => Err(DeviceError::OutOfMemory {
                buffer,
                requested: size,
                available,
            }),
        }
    }

    /// Allocates a new buffer holding `shards` and registers `ir` as its first view.
    pub fn insert(&mut self, ir: TensorIr, shards: Vec<Arc<[u8]>>) -> Result<(), DeviceError> {
        assert_eq!(shards.len(), self.devices, "one shard per device");
        let buffer = ir.memory.buffer;
        let size = ir.data_size(self.devices);
        self.reserve(buffer, size)?;

        *self.used.entry(buffer).or_default() += size;
        let id = BufferId(uid::Id::new());
        let views = 1;
        self.buffers.insert(
            id,
            Buffer {
                buffer,
                size,
                shards,
                views,
            },
        );
        self.views.insert(ir.id, (id, ir));
        Ok(())
    }

    /// Registers `ir` as another view of the buffer behind `source`. Allocates nothing.
    pub fn alias(&mut self, source: TensorId, ir: TensorIr) -> Result<(), DeviceError> {
        let (id, _) = self.views.get(&source).ok_or(DeviceError::Tensor(source))?;
        let id = *id;
        if let Some(buffer) = self.buffers.get_mut(&id) {
            buffer.views += 1;
        }
        self.views.insert(ir.id, (id, ir));
        Ok(())
    }

    /// The metadata the device recorded for a handle.
    pub fn ir(&self, id: TensorId) -> Result<&TensorIr, DeviceError> {
        self.views
            .get(&id)
            .map(|(_, ir)| ir)
            .ok_or(DeviceError::Tensor(id))
    }

    /// Retrieves the contents of each device viewed by a handle.
    pub fn fetch(&self, id: TensorId) -> Result<Vec<Arc<[u8]>>, DeviceError> {
        let (buffer, _) = self.views.get(&id).ok_or(DeviceError::Tensor(id))?;
        self.buffers
            .get(buffer)
            .map(|buffer| buffer.shards.clone())
            .ok_or(DeviceError::Tensor(id))
    }

    /// Overwrites the contents of the buffer viewed by a handle.
    pub fn write(&mut self, id: TensorId, shards: Vec<Arc<[u8]>>) -> Result<(), DeviceError> {
        let (buffer, _) = self.views.get(&id).ok_or(DeviceError::Tensor(id))?;
        let buffer = self.buffers.get_mut(buffer).ok_or(DeviceError::Tensor(id))?;
        buffer.shards = shards;
        Ok(())
    }

    /// Drops a view. Returns `true` if this freed the underlying buffer.
    pub fn release(&mut self, id: TensorId) -> Result<bool, DeviceError> {
        let (buffer_id, _) = self.views.remove(&id).ok_or(DeviceError::Tensor(id))?;
        let Some(buffer) = self.buffers.get_mut(&buffer_id) else {
            return Ok(false);
        };
        buffer.views -= 1;
        if buffer.views > 0 {
            return Ok(false);
        }
        if let Some(buffer) = self.buffers.remove(&buffer_id) {
            let used = self.used.entry(buffer.buffer).or_default();
            *used = used.saturating_sub(buffer.size);
        }
        Ok(true)
    }

    /// Prints the registry's state in a human-readable format.
    pub fn print_pretty(&self) -> String {
        self.views
            .iter()
            .sorted_by_key(|(_, (buffer, _))| buffer.to_string())
            .map(|(id, (buffer, ir))| {
                format!("{id}\t→ {buffer}\t: {} {} {}", ir.shape, ir.r#type, ir.memory)
            })
            .join("\n")
    }
}

impl std::fmt::Display for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.print_pretty())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Capacity, Registry};
    use crate::loom::{
        device::DeviceError,
        layout::{Shape, TensorLayout},
        mapper::MeshMapper,
        memory::{BufferType, MemoryConfig},
        num::DataType,
        tensor::{TensorId, TensorIr},
    };

    fn ir(shape: [usize; 2], memory: MemoryConfig) -> TensorIr {
        TensorIr {
            id: TensorId::new(),
            shape: Shape::from(shape),
            r#type: DataType::F32,
            layout: TensorLayout::RowMajor,
            memory,
            mapper: MeshMapper::Replicate,
        }
    }

    fn shards(devices: usize, size: usize) -> Vec<Arc<[u8]>> {
        vec![vec![0u8; size].into(); devices]
    }

    #[test]
    fn test_alias_release() -> Result<(), DeviceError> {
        let capacity = Capacity {
            dram: 1 << 20,
            l1: 1 << 10,
        };
        let mut registry = Registry::new(2, capacity);

        let x = ir([4, 8], MemoryConfig::DRAM);
        registry.insert(x.clone(), shards(2, 128))?;
        assert_eq!(registry.used(BufferType::Dram), 128);

        let y = ir([4, 8], MemoryConfig::DRAM);
        registry.alias(x.id, y.clone())?;
        assert_eq!(registry.live_tensors(), 2);
        assert_eq!(registry.live_buffers(), 1);
        assert_eq!(registry.used(BufferType::Dram), 128);

        assert!(!registry.release(x.id)?);
        assert_eq!(registry.fetch(y.id)?.len(), 2);
        assert!(registry.release(y.id)?);
        assert_eq!(registry.used(BufferType::Dram), 0);
        assert_eq!(registry.live_buffers(), 0);

        assert!(matches!(registry.release(y.id), Err(DeviceError::Tensor(_))));
        Ok(())
    }

    #[test]
    fn test_out_of_memory() {
        let capacity = Capacity { dram: 256, l1: 64 };
        let mut registry = Registry::new(1, capacity);

        let x = ir([4, 8], MemoryConfig::L1);
        let err = registry.insert(x, shards(1, 128)).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(registry.live_tensors(), 0);

        let x = ir([4, 8], MemoryConfig::DRAM);
        registry.insert(x, shards(1, 128)).unwrap();
        let x = ir([4, 8], MemoryConfig::DRAM);
        registry.insert(x, shards(1, 128)).unwrap();
        let x = ir([1, 1], MemoryConfig::DRAM);
        assert!(registry.insert(x, shards(1, 4)).unwrap_err().is_out_of_memory());
    }
}
