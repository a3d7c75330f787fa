use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loom::{
    layout::{TILE_HEIGHT, TILE_WIDTH},
    memory::{CoreGrid, MemoryConfig, ShardSpec},
    tensor::TensorIr,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProgramError {
    #[error("program grid {program} does not match shard grid {shard}")]
    Grid { program: CoreGrid, shard: CoreGrid },
    #[error("program block [{block_h}, {block_w}] tiles does not match shard shape {shard:?}")]
    Block {
        block_h: usize,
        block_w: usize,
        shard: [usize; 2],
    },
    #[error("sub-block width {subblock_w} does not divide block width {block_w}")]
    Subblock { subblock_w: usize, block_w: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NormKind {
    /// `x / sqrt(mean(x²) + eps) * w + b`.
    #[display("rms_norm")]
    Rms,
    /// `(x - mean(x)) / sqrt(var(x) + eps) * w + b`.
    #[display("layer_norm")]
    Layer,
}

/// Execution descriptor of a norm over a sharded input: each core of `grid` normalizes
/// a block of `block_h × block_w` tiles, `subblock_w` tiles at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NormProgramConfig {
    pub grid: CoreGrid,
    pub subblock_w: usize,
    pub block_h: usize,
    pub block_w: usize,
    /// Writes the output over the input buffer.
    pub inplace: bool,
}

impl NormProgramConfig {
    /// Derives a program matching a shard spec, with the widest sub-block up to `max_subblock_w`.
    pub fn from_shard(spec: &ShardSpec, max_subblock_w: usize, inplace: bool) -> Self {
        let [h, w] = spec.shape;
        let block_h = h.div_ceil(TILE_HEIGHT);
        let block_w = w.div_ceil(TILE_WIDTH);
        let subblock_w = (1..=max_subblock_w.clamp(1, block_w.max(1)))
            .rev()
            .find(|sub| block_w % sub == 0)
            .unwrap_or(1);
        Self {
            grid: spec.grid,
            subblock_w,
            block_h,
            block_w,
            inplace,
        }
    }

    /// Checks that the program can run over inputs sharded with `spec`.
    pub fn validate(&self, spec: &ShardSpec) -> Result<(), ProgramError> {
        if self.grid != spec.grid {
            return Err(ProgramError::Grid {
                program: self.grid,
                shard: spec.grid,
            });
        }
        if self.block_h * TILE_HEIGHT != spec.shape[0]
            || self.block_w * TILE_WIDTH != spec.shape[1]
        {
            return Err(ProgramError::Block {
                block_h: self.block_h,
                block_w: self.block_w,
                shard: spec.shape,
            });
        }
        if self.subblock_w == 0 || self.block_w % self.subblock_w != 0 {
            return Err(ProgramError::Subblock {
                subblock_w: self.subblock_w,
                block_w: self.block_w,
            });
        }
        Ok(())
    }
}

/// A norm request as received by the device layer.
#[derive(Debug, Clone)]
pub struct NormOp {
    pub kind: NormKind,
    pub eps: f32,
    pub input: TensorIr,
    pub weight: Option<TensorIr>,
    pub bias: Option<TensorIr>,
    pub program: Option<NormProgramConfig>,
    pub memory: Option<MemoryConfig>,
}

#[cfg(test)]
mod tests {
    use super::{NormProgramConfig, ProgramError};
    use crate::loom::memory::{CoreGrid, ShardOrientation, ShardSpec, ShardStrategy};

    #[test]
    fn test_program_from_shard() {
        let spec = ShardSpec {
            strategy: ShardStrategy::Width,
            grid: CoreGrid::new(8, 4),
            shape: [32, 128],
            orientation: ShardOrientation::RowMajor,
        };
        let program = NormProgramConfig::from_shard(&spec, 8, true);
        assert_eq!(program.block_h, 1);
        assert_eq!(program.block_w, 4);
        assert_eq!(program.subblock_w, 4);
        assert_eq!(program.validate(&spec), Ok(()));

        let program = NormProgramConfig::from_shard(&spec, 3, false);
        assert_eq!(program.subblock_w, 2);

        let other = ShardSpec {
            grid: CoreGrid::new(4, 8),
            ..spec
        };
        assert!(matches!(program.validate(&other), Err(ProgramError::Grid { .. })));

        let program = NormProgramConfig {
            subblock_w: 3,
            ..program
        };
        assert!(matches!(program.validate(&spec), Err(ProgramError::Subblock { .. })));
    }
}
