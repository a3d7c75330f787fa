use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::config::ModelConfig;
use crate::loom::num::DataType;

/// Default epsilon added to the mean square before the inverse square root.
pub const DEFAULT_NORM_EPS: f32 = 1e-5;

/// Model-level settings the norm layers are built from.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelArgs {
    pub norm_eps: f32,
    /// Weights are synthetic; nothing is read from or written to the weight cache.
    pub dummy_weights: bool,
    /// Root of the on-disk weight cache.
    pub cache_root: Option<PathBuf>,
    pub model_config: ModelConfig,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            norm_eps: DEFAULT_NORM_EPS,
            dummy_weights: false,
            cache_root: None,
            model_config: Default::default(),
        }
    }
}

impl ModelArgs {
    pub fn new(model_config: ModelConfig) -> Self {
        Self {
            model_config,
            ..Default::default()
        }
    }

    pub fn norm_eps(mut self, eps: f32) -> Self {
        self.norm_eps = eps;
        self
    }

    pub fn dummy_weights(mut self, dummy_weights: bool) -> Self {
        self.dummy_weights = dummy_weights;
        self
    }

    pub fn cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    #[inline]
    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    /// Directory holding cached weights of `r#type`.
    ///
    /// Returns `None` if caching is off: with dummy weights, or without a cache root.
    pub fn weight_cache_path(&self, r#type: DataType) -> Option<PathBuf> {
        match (self.dummy_weights, &self.cache_root) {
            (true, _) | (_, None) => None,
            (false, Some(root)) => Some(root.join(format!("tensor_cache_{}", r#type))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::ModelArgs;
    use crate::{loom::num::DataType, model::config::ModelConfig};

    #[test]
    fn test_weight_cache_path() {
        let args = ModelArgs::new(ModelConfig::new()).cache_root("/tmp/weights");
        assert_eq!(
            args.weight_cache_path(DataType::Bf16),
            Some(PathBuf::from("/tmp/weights/tensor_cache_bf16"))
        );
        assert_ne!(
            args.weight_cache_path(DataType::Bf16),
            args.weight_cache_path(DataType::F16)
        );

        let args = args.dummy_weights(true);
        assert_eq!(args.weight_cache_path(DataType::Bf16), None);
        assert_eq!(ModelArgs::default().weight_cache_path(DataType::F32), None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_args_from_json() -> Result<(), serde_json::Error> {
        use crate::{loom::memory::CoreGrid, model::config::SHARDED_NORM_PRGM_CFG};

        let args = ModelArgs::new(ModelConfig::sharded_norm(4096, CoreGrid::new(8, 4)))
            .cache_root("/tmp/weights")
            .norm_eps(1e-6);
        let json = serde_json::to_string(&args)?;
        let parsed: ModelArgs = serde_json::from_str(&json)?;
        assert_eq!(parsed, args);
        assert!(parsed.model_config.program(SHARDED_NORM_PRGM_CFG).is_ok());
        Ok(())
    }
}
