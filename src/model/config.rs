use derive_more::{Deref, DerefMut, Display};
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    hal::ops::NormProgramConfig,
    loom::{
        layout::{TILE_HEIGHT, TensorLayout},
        memory::{CoreGrid, MemoryConfig, ShardOrientation, ShardSpec, ShardStrategy},
    },
};

/// Layout of the plain norm's weight.
pub const NORM_W_LAYOUT_TILE: &str = "NORM_W_LAYOUT_TILE";
/// Memory config of norm weights.
pub const NORM_WEIGHTS_MEMCFG: &str = "NORM_WEIGHTS_MEMCFG";
/// Memory config inputs are sharded into before a sharded norm.
pub const SHARDED_NORM_INPUT_MEMCFG: &str = "SHARDED_NORM_INPUT_MEMCFG";
/// Program of a sharded norm.
pub const SHARDED_NORM_PRGM_CFG: &str = "SHARDED_NORM_PRGM_CFG";
/// Memory config of a sharded norm's output.
pub const SHARDED_NORM_OUTPUT_MEMCFG: &str = "SHARDED_NORM_OUTPUT_MEMCFG";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("model config has no preset `{0}`")]
    Missing(String),
    #[error("model config preset `{name}` is a {found} preset, expected {expected}")]
    Kind {
        name: String,
        found: PresetKind,
        expected: PresetKind,
    },
    #[error("model config preset `{0}` must be a sharded memory config")]
    NotSharded(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum PresetKind {
    #[display("layout")]
    Layout,
    #[display("memory")]
    Memory,
    #[display("program")]
    Program,
}

/// A named memory/layout descriptor of the model config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Preset {
    Layout(TensorLayout),
    Memory(MemoryConfig),
    Program(NormProgramConfig),
}

impl Preset {
    #[inline]
    pub fn kind(&self) -> PresetKind {
        match self {
            Preset::Layout(_) => PresetKind::Layout,
            Preset::Memory(_) => PresetKind::Memory,
            Preset::Program(_) => PresetKind::Program,
        }
    }
}

impl From<TensorLayout> for Preset {
    fn from(value: TensorLayout) -> Self {
        Self::Layout(value)
    }
}

impl From<MemoryConfig> for Preset {
    fn from(value: MemoryConfig) -> Self {
        Self::Memory(value)
    }
}

impl From<NormProgramConfig> for Preset {
    fn from(value: NormProgramConfig) -> Self {
        Self::Program(value)
    }
}

/// Read-only table of presets, keyed by name.
#[derive(Debug, Default, Clone, PartialEq, Deref, DerefMut)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelConfig(HashMap<String, Preset>);

impl ModelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a preset.
    pub fn with(mut self, name: impl Into<String>, preset: impl Into<Preset>) -> Self {
        self.0.insert(name.into(), preset.into());
        self
    }

    pub fn preset(&self, name: &str) -> Result<Preset, ConfigError> {
        self.get(name)
            .copied()
            .ok_or_else(|| ConfigError::Missing(name.to_string()))
    }

    fn mismatch(name: &str, found: &Preset, expected: PresetKind) -> ConfigError {
        ConfigError::Kind {
            name: name.to_string(),
            found: found.kind(),
            expected,
        }
    }

    pub fn layout(&self, name: &str) -> Result<TensorLayout, ConfigError> {
        match self.preset(name)? {
            Preset::Layout(layout) => Ok(layout),
            other => Err(Self::mismatch(name, &other, PresetKind::Layout)),
        }
    }

    pub fn memory(&self, name: &str) -> Result<MemoryConfig, ConfigError> {
        match self.preset(name)? {
            Preset::Memory(memory) => Ok(memory),
            other => Err(Self::mismatch(name, &other, PresetKind::Memory)),
        }
    }

    /// A memory preset that must be sharded; returns its shard spec.
    pub fn shard_spec(&self, name: &str) -> Result<ShardSpec, ConfigError> {
        let memory = self.memory(name)?;
        memory
            .shard_spec()
            .copied()
            .ok_or_else(|| ConfigError::NotSharded(name.to_string()))
    }

    pub fn program(&self, name: &str) -> Result<NormProgramConfig, ConfigError> {
        match self.preset(name)? {
            Preset::Program(program) => Ok(program),
            other => Err(Self::mismatch(name, &other, PresetKind::Program)),
        }
    }

    /// The norm presets of a model of hidden size `width`, with sharded norms
    /// width-sharded across `grid` and computed in place.
    ///
    /// `width` must be a multiple of `32 × grid.num_cores()` for the shards to be tile aligned.
    pub fn sharded_norm(width: usize, grid: CoreGrid) -> Self {
        let spec = ShardSpec {
            strategy: ShardStrategy::Width,
            grid,
            shape: [TILE_HEIGHT, width.div_ceil(grid.num_cores())],
            orientation: ShardOrientation::RowMajor,
        };
        let sharded = MemoryConfig::sharded(spec);
        let program = NormProgramConfig::from_shard(&spec, 8, true);

        Self::new()
            .with(NORM_W_LAYOUT_TILE, TensorLayout::Tile)
            .with(NORM_WEIGHTS_MEMCFG, MemoryConfig::DRAM)
            .with(SHARDED_NORM_INPUT_MEMCFG, sharded)
            .with(SHARDED_NORM_PRGM_CFG, program)
            .with(SHARDED_NORM_OUTPUT_MEMCFG, sharded)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ConfigError, ModelConfig, NORM_W_LAYOUT_TILE, NORM_WEIGHTS_MEMCFG,
        SHARDED_NORM_INPUT_MEMCFG, SHARDED_NORM_PRGM_CFG,
    };
    use crate::loom::{
        layout::TensorLayout,
        memory::{CoreGrid, MemoryConfig},
    };

    #[test]
    fn test_sharded_norm_presets() -> Result<(), ConfigError> {
        let config = ModelConfig::sharded_norm(4096, CoreGrid::new(8, 4));
        assert_eq!(config.layout(NORM_W_LAYOUT_TILE)?, TensorLayout::Tile);
        assert_eq!(config.memory(NORM_WEIGHTS_MEMCFG)?, MemoryConfig::DRAM);

        let spec = config.shard_spec(SHARDED_NORM_INPUT_MEMCFG)?;
        assert_eq!(spec.shape, [32, 128]);
        let program = config.program(SHARDED_NORM_PRGM_CFG)?;
        assert_eq!(program.validate(&spec), Ok(()));
        assert!(program.inplace);
        Ok(())
    }

    #[test]
    fn test_preset_errors() {
        let config = ModelConfig::sharded_norm(4096, CoreGrid::new(8, 4));
        assert_eq!(
            config.memory("MISSING"),
            Err(ConfigError::Missing("MISSING".into()))
        );
        assert!(matches!(
            config.program(NORM_WEIGHTS_MEMCFG),
            Err(ConfigError::Kind { .. })
        ));
        assert_eq!(
            config.shard_spec(NORM_WEIGHTS_MEMCFG),
            Err(ConfigError::NotSharded(NORM_WEIGHTS_MEMCFG.into()))
        );
    }
}
