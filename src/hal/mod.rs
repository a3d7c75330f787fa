//! Norm ops: their device-facing descriptors, the request API on
//! [`DeviceTensor`](crate::loom::tensor::DeviceTensor), and host kernels.

pub mod cpu;
pub mod frontend;
pub mod ops;
