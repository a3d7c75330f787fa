//! Host reference kernels backing the mesh simulation.

pub mod norm;
