use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ConvError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Half,
    BFloat16,
    Float,
    Double,
    Int8,
    Int32,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Int8 => 1,
            Self::Half | Self::BFloat16 => 2,
            Self::Float | Self::Int32 => 4,
            Self::Double => 8,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Half => "fp16",
            Self::BFloat16 => "bf16",
            Self::Float => "fp32",
            Self::Double => "fp64",
            Self::Int8 => "i8",
            Self::Int32 => "i32",
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        Self::Float
    }
}

/// Rank-4 tensor descriptor in (N, C, H, W) order.
///
/// For filters the same four slots read as (K, C, R, S): output channels,
/// input channels per group, filter height and filter width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    pub dtype: DataType,
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl TensorShape {
    pub fn new(dtype: DataType, n: usize, c: usize, h: usize, w: usize) -> Self {
        Self { dtype, n, c, h, w }
    }

    /// Builds a descriptor from a length list, which must have exactly four entries.
    pub fn from_lengths(dtype: DataType, lengths: &[usize]) -> Result<Self> {
        match lengths {
            [n, c, h, w] => Ok(Self::new(dtype, *n, *c, *h, *w)),
            other => Err(ConvError::ShapeMismatch(format!(
                "expected a rank-4 tensor, got rank {}",
                other.len()
            ))),
        }
    }

    pub fn lengths(&self) -> [usize; 4] {
        [self.n, self.c, self.h, self.w]
    }

    /// Saturates at `usize::MAX` instead of wrapping.
    pub fn element_count(&self) -> usize {
        self.lengths().iter().fold(1usize, |acc, d| acc.saturating_mul(*d))
    }

    pub fn byte_size(&self) -> usize {
        self.element_count().saturating_mul(self.dtype.size())
    }

    pub fn type_size(&self) -> usize {
        self.dtype.size()
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}x{}:{}", self.n, self.c, self.h, self.w, self.dtype.tag())
    }
}
