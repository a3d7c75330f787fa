//! Device-resident normalization weights on a mesh of accelerators.
//!
//! The crate is organized in three layers:
//! - [`loom`]: tensors, memory placements, and the [`Device`](loom::device::Device) seam
//!   together with a host-simulated reference [`Mesh`](loom::device::Mesh).
//! - [`hal`]: norm op descriptors and the host kernels backing them.
//! - [`model`]: model-level glue that binds state-dict weights to the mesh and runs norms.

pub mod hal;
pub mod loom;
pub mod model;
