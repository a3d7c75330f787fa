//! Memory placement of device tensors: which buffer they live in,
//! and whether they are interleaved across banks or sharded across cores.

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::layout::{Shape, TILE_HEIGHT, TILE_WIDTH, TensorLayout};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("shard spec {spec} does not cover tensor of padded shape {shape}")]
    Cover { spec: ShardSpec, shape: Shape },
    #[error("shard shape {0:?} is not tile aligned")]
    Tile([usize; 2]),
    #[error("shard spec {0} has an empty core grid or shard")]
    Empty(ShardSpec),
    #[error("{0:?} sharding is only supported in L1")]
    Buffer(BufferType),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BufferType {
    #[default]
    #[display("dram")]
    Dram,
    #[display("l1")]
    L1,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ShardOrientation {
    #[default]
    #[display("row_major")]
    RowMajor,
    #[display("col_major")]
    ColMajor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ShardStrategy {
    /// Rows are split across all cores.
    #[display("height")]
    Height,
    /// Columns are split across all cores.
    #[display("width")]
    Width,
    /// Rows are split across grid rows, columns across grid columns.
    #[display("block")]
    Block,
}

/// A rectangle of compute cores, `x` columns by `y` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{x}x{y}")]
pub struct CoreGrid {
    pub x: usize,
    pub y: usize,
}

impl CoreGrid {
    #[inline]
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    #[inline]
    pub const fn num_cores(&self) -> usize {
        self.x * self.y
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{strategy}({grid}, [{}, {}], {orientation})", shape[0], shape[1])]
pub struct ShardSpec {
    pub strategy: ShardStrategy,
    pub grid: CoreGrid,
    /// Height and width of the shard held by each core.
    pub shape: [usize; 2],
    pub orientation: ShardOrientation,
}

impl ShardSpec {
    /// Checks that the shards cover a tensor of the (already padded) 2-D extent `[height, width]`.
    pub fn validate(&self, shape: &Shape, layout: TensorLayout) -> Result<(), MemoryError> {
        let [h, w] = self.shape;
        if h == 0 || w == 0 || self.grid.num_cores() == 0 {
            return Err(MemoryError::Empty(*self));
        }
        if layout == TensorLayout::Tile && (h % TILE_HEIGHT != 0 || w % TILE_WIDTH != 0) {
            return Err(MemoryError::Tile(self.shape));
        }

        let (height, width) = (shape.height(), shape.width());
        let cores = self.grid.num_cores();
        let (rows, cols) = match (self.strategy, self.orientation) {
            (ShardStrategy::Height, _) => (cores, 1),
            (ShardStrategy::Width, _) => (1, cores),
            (ShardStrategy::Block, ShardOrientation::RowMajor) => (self.grid.y, self.grid.x),
            (ShardStrategy::Block, ShardOrientation::ColMajor) => (self.grid.x, self.grid.y),
        };
        let cover = match self.strategy {
            ShardStrategy::Height => w == width && h * rows >= height,
            ShardStrategy::Width => h == height && w * cols >= width,
            ShardStrategy::Block => h * rows >= height && w * cols >= width,
        };
        match cover {
            true => Ok(()),
            false => Err(MemoryError::Cover {
                spec: *self,
                shape: shape.clone(),
            }),
        }
    }
}

/// Whether a tensor is spread round-robin over memory banks or partitioned across cores.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Placement {
    #[default]
    #[display("interleaved")]
    Interleaved,
    #[display("sharded({_0})")]
    Sharded(ShardSpec),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{placement}@{buffer}")]
pub struct MemoryConfig {
    pub buffer: BufferType,
    pub placement: Placement,
}

impl MemoryConfig {
    pub const DRAM: Self = Self {
        buffer: BufferType::Dram,
        placement: Placement::Interleaved,
    };

    pub const L1: Self = Self {
        buffer: BufferType::L1,
        placement: Placement::Interleaved,
    };

    /// An L1 sharded memory config.
    #[inline]
    pub const fn sharded(spec: ShardSpec) -> Self {
        Self {
            buffer: BufferType::L1,
            placement: Placement::Sharded(spec),
        }
    }

    #[inline]
    pub fn is_sharded(&self) -> bool {
        matches!(self.placement, Placement::Sharded(_))
    }

    #[inline]
    pub fn shard_spec(&self) -> Option<&ShardSpec> {
        match &self.placement {
            Placement::Interleaved => None,
            Placement::Sharded(spec) => Some(spec),
        }
    }

    /// Checks that a tensor of `shape` stored in `layout` can be placed with this config.
    pub fn validate(&self, shape: &Shape, layout: TensorLayout) -> Result<(), MemoryError> {
        match (&self.placement, self.buffer) {
            (Placement::Interleaved, _) => Ok(()),
            (Placement::Sharded(_), BufferType::Dram) => Err(MemoryError::Buffer(self.buffer)),
            (Placement::Sharded(spec), BufferType::L1) => spec.validate(&layout.pad(shape), layout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BufferType, CoreGrid, MemoryConfig, MemoryError, Placement, ShardOrientation, ShardSpec,
        ShardStrategy,
    };
    use crate::loom::layout::{Shape, TensorLayout};

    fn width_spec(shard: [usize; 2]) -> ShardSpec {
        ShardSpec {
            strategy: ShardStrategy::Width,
            grid: CoreGrid::new(8, 4),
            shape: shard,
            orientation: ShardOrientation::RowMajor,
        }
    }

    #[test]
    fn test_width_sharded() {
        let shape = Shape::from([1, 32, 4096]);
        let config = MemoryConfig::sharded(width_spec([32, 128]));
        assert!(config.is_sharded());
        assert_eq!(config.validate(&shape, TensorLayout::Tile), Ok(()));

        // a narrower shard leaves columns uncovered
        let config = MemoryConfig::sharded(width_spec([32, 64]));
        assert!(matches!(
            config.validate(&shape, TensorLayout::Tile),
            Err(MemoryError::Cover { .. })
        ));

        let config = MemoryConfig::sharded(width_spec([32, 130]));
        assert_eq!(
            config.validate(&shape, TensorLayout::Tile),
            Err(MemoryError::Tile([32, 130]))
        );
        assert_eq!(config.validate(&shape, TensorLayout::RowMajor), Ok(()));
    }

    #[test]
    fn test_height_and_block_sharded() {
        let shape = Shape::from([256, 64]);
        let spec = ShardSpec {
            strategy: ShardStrategy::Height,
            grid: CoreGrid::new(4, 2),
            shape: [32, 64],
            orientation: ShardOrientation::RowMajor,
        };
        assert_eq!(spec.validate(&shape, TensorLayout::Tile), Ok(()));

        let spec = ShardSpec {
            strategy: ShardStrategy::Block,
            grid: CoreGrid::new(2, 8),
            shape: [32, 32],
            orientation: ShardOrientation::RowMajor,
        };
        assert_eq!(spec.validate(&shape, TensorLayout::Tile), Ok(()));
        let spec = ShardSpec {
            orientation: ShardOrientation::ColMajor,
            ..spec
        };
        assert!(spec.validate(&shape, TensorLayout::Tile).is_err());
    }

    #[test]
    fn test_dram_sharding_rejected() {
        let config = MemoryConfig {
            buffer: BufferType::Dram,
            placement: Placement::Sharded(width_spec([32, 128])),
        };
        assert_eq!(
            config.validate(&Shape::from([32, 4096]), TensorLayout::Tile),
            Err(MemoryError::Buffer(BufferType::Dram))
        );
        assert_eq!(
            MemoryConfig::DRAM.validate(&Shape::from([3, 5]), TensorLayout::RowMajor),
            Ok(())
        );
        assert_eq!(MemoryConfig::default(), MemoryConfig::DRAM);
    }
}
