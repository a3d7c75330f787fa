//! Model glue: arguments, the preset table, host weights, and the norm layers bound from them.

pub mod args;
pub mod config;
pub mod norm;
pub mod state;

pub use args::ModelArgs;
pub use config::ModelConfig;
pub use norm::{NormBuilder, NormError, RmsNorm, RmsNormSharded};
pub use state::StateDict;
