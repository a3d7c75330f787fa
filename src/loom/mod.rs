//! The `loom` module provides the foundational abstractions for tensors resident on a mesh of
//! accelerators.
//!
//! ## Key Components
//! 1. **Tensor Model**:
//!    - Host tensors (`HostTensor`) and move-only device handles (`DeviceTensor`).
//!    - Tile and row-major layouts (`TensorLayout`) with tile padding.
//!    - Memory placements (`MemoryConfig`): interleaved, or sharded across a core grid.
//!
//! 2. **Device Abstraction**:
//!    - Hardware-agnostic requests via the `Device` trait and `DeviceEvent`s.
//!    - A host-simulated reference `Mesh` with a buffer `Registry` and capacity accounting.
//!    - An on-disk `TensorCache` of device-ready constants.
//!
//! 3. **Distribution**:
//!    - Mesh mappers (`MeshMapper`) replicating or sharding host data across devices.
//!    - Replication plans (`ReplicationPlan`) expanding weights before placement.
//!
//! 4. **Numerical System**:
//!    - Data types (`f32`, `f16`, `bf16`) and their device encodings (`DataType`).

pub mod device;
pub mod layout;
pub mod mapper;
pub mod memory;
pub mod num;
pub mod platform;
pub mod tensor;
