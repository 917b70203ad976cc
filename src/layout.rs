//! Chunk layout - how an array is divided into chunks

use crate::error::{PyramidError, Result};
use serde::{Deserialize, Serialize};

/// Size of a chunk in each dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkShape {
    dims: [usize; 3],
}

impl ChunkShape {
    /// Create a new chunk shape
    pub fn new(dims: [usize; 3]) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(PyramidError::Validation(format!(
                "Chunk dimensions must be positive, got {:?}",
                dims
            )));
        }
        Ok(Self { dims })
    }

    /// Cubic chunk with the same edge length on every axis
    pub fn cubic(edge: usize) -> Result<Self> {
        Self::new([edge; 3])
    }

    /// Get all dimensions
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Number of chunks needed along each axis of an array of `shape`
    pub fn grid_shape(&self, shape: [usize; 3]) -> [usize; 3] {
        [
            shape[0].div_ceil(self.dims[0]),
            shape[1].div_ceil(self.dims[1]),
            shape[2].div_ceil(self.dims[2]),
        ]
    }
}
