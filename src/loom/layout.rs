use std::sync::Arc;

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Height of a device tile.
pub const TILE_HEIGHT: usize = 32;
/// Width of a device tile.
pub const TILE_WIDTH: usize = 32;

/// The in-memory arrangement of a tensor's elements.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TensorLayout {
    #[default]
    #[display("row_major")]
    RowMajor,
    /// Blocks of `32 × 32` elements over the last two dimensions.
    #[display("tile")]
    Tile,
}

impl TensorLayout {
    /// Pads the last two dimensions of `shape` to what the layout stores.
    pub fn pad(self, shape: &Shape) -> Shape {
        match self {
            TensorLayout::RowMajor => shape.clone(),
            TensorLayout::Tile => {
                let rank = shape.len();
                shape
                    .iter()
                    .enumerate()
                    .map(|(index, &dim)| match rank - index {
                        1 => dim.next_multiple_of(TILE_WIDTH),
                        2 => dim.next_multiple_of(TILE_HEIGHT),
                        _ => dim,
                    })
                    .collect_vec()
                    .into()
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl From<Vec<usize>> for Shape {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl Shape {
    /// Total number of elements.
    #[inline]
    pub fn volume(&self) -> usize {
        self.iter().product()
    }

    /// Size of the trailing dimension, i.e., the normalization group.
    #[inline]
    pub fn width(&self) -> usize {
        self.last().copied().unwrap_or(1)
    }

    /// Product of all dimensions but the last, i.e., the number of rows.
    #[inline]
    pub fn height(&self) -> usize {
        match self.split_last() {
            Some((_, rest)) => rest.iter().product(),
            None => 1,
        }
    }

    /// Returns the shape with `dim` replaced by `size`.
    pub fn with_dim(&self, dim: usize, size: usize) -> Self {
        let mut shape = self.to_vec();
        shape[dim] = size;
        shape.into()
    }
}
