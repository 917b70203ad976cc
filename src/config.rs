//! Command-line configuration for the pyramid converter.
//!
//! Every option can also be set through an environment variable with the
//! `OMEZARR_` prefix:
//!
//! - `OMEZARR_TRANSPOSE` - Swap Y and X of every input segment
//! - `OMEZARR_OVERRIDE_SHAPE` - Level 0 shape as `Z,Y,X` (default: input shape)
//! - `OMEZARR_RESIZE_ORDER` - Interpolation order 0-5 (default: 0)
//! - `OMEZARR_DOWNSCALE_FACTOR` - Per-axis reduction between levels (default: 2)
//! - `OMEZARR_LEVELS` - Number of pyramid levels (default: 5)
//! - `OMEZARR_CHUNK_SIZE` - Edge of the cubic output chunks (default: 128)
//! - `OMEZARR_MEMORY_LIMIT` - Memory limit in GB (default: 64)
//! - `OMEZARR_COMPRESSION` - Chunk codec: none, zlib, gzip or zstd (default: none)
//! - `OMEZARR_COMPRESSION_LEVEL` - Codec level 0-9 (default: 5)
//! - `OMEZARR_WORKERS` - Resampling threads (default: 8)
//! - `OMEZARR_IO_CONCURRENCY` - Files or chunks transferred at once (default: 8)

use clap::Parser;
use std::path::PathBuf;

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::pyramid::{
    PyramidConfig, DEFAULT_CHUNK_SIZE, DEFAULT_DOWNSCALE_FACTOR, DEFAULT_LEVELS,
};
use crate::resample::{InterpolationOrder, DEFAULT_WORKERS};
use crate::assembler::DEFAULT_IO_CONCURRENCY;
use crate::utils::gib_to_bytes;

/// Default memory limit in GB.
pub const DEFAULT_MEMORY_LIMIT_GB: f64 = 64.0;

/// Default codec level.
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 5;

/// Convert a volume (TIFF, NIfTI, NPY, Zarr, PNG/JPEG or a directory of
/// them) into a multiscale OME-Zarr pyramid.
///
/// The pyramid is written to `<OUTPUT>/<name>_ome.zarr`, where `name` is the
/// input file or directory name without its suffix. Levels that already exist
/// in the output are kept.
#[derive(Parser, Debug, Clone)]
#[command(name = "omezarr-pyramid")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Input / Output
    // =========================================================================
    /// Input file, Zarr directory or directory of slices/stacks.
    pub input: PathBuf,

    /// Directory the pyramid is written into.
    pub output: PathBuf,

    /// Swap the Y and X axes of every input segment.
    #[arg(long, default_value_t = false, env = "OMEZARR_TRANSPOSE")]
    pub transpose: bool,

    /// Shape of level 0 as Z Y X. Defaults to the input shape.
    #[arg(
        long,
        num_args = 3,
        value_names = ["Z", "Y", "X"],
        value_delimiter = ',',
        env = "OMEZARR_OVERRIDE_SHAPE"
    )]
    pub override_shape: Option<Vec<usize>>,

    // =========================================================================
    // Pyramid
    // =========================================================================
    /// Interpolation order (0 nearest, 1 linear, 2-5 B-spline).
    #[arg(
        long,
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(0..=5),
        env = "OMEZARR_RESIZE_ORDER"
    )]
    pub resize_order: u8,

    /// Per-axis reduction between consecutive levels.
    #[arg(long, default_value_t = DEFAULT_DOWNSCALE_FACTOR, env = "OMEZARR_DOWNSCALE_FACTOR")]
    pub downscale_factor: usize,

    /// Number of pyramid levels.
    #[arg(long, default_value_t = DEFAULT_LEVELS, env = "OMEZARR_LEVELS")]
    pub levels: usize,

    /// Edge of the cubic output chunks.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, env = "OMEZARR_CHUNK_SIZE")]
    pub chunk_size: usize,

    // =========================================================================
    // Resources
    // =========================================================================
    /// Memory limit in GB.
    ///
    /// Half of it may be held by loaded input segments; temp buffers whose
    /// doubled size exceeds it are staged on disk.
    #[arg(long, default_value_t = DEFAULT_MEMORY_LIMIT_GB, env = "OMEZARR_MEMORY_LIMIT")]
    pub memory_limit: f64,

    /// Threads used for resampling.
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "OMEZARR_WORKERS")]
    pub workers: usize,

    /// Input files probed or loaded at once.
    #[arg(long, default_value_t = DEFAULT_IO_CONCURRENCY, env = "OMEZARR_IO_CONCURRENCY")]
    pub io_concurrency: usize,

    // =========================================================================
    // Output Encoding
    // =========================================================================
    /// Codec for output chunks: none, zlib, gzip, zstd or blosc.
    #[arg(long, default_value = "none", env = "OMEZARR_COMPRESSION")]
    pub compression: CompressionMethod,

    /// Codec level (0-9).
    #[arg(long, default_value_t = DEFAULT_COMPRESSION_LEVEL, env = "OMEZARR_COMPRESSION_LEVEL")]
    pub compression_level: u8,

    // =========================================================================
    // Logging
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(shape) = &self.override_shape {
            if shape.len() != 3 {
                return Err(format!(
                    "override_shape takes exactly three values (Z Y X), got {}",
                    shape.len()
                ));
            }
            if shape.contains(&0) {
                return Err("override_shape values must be greater than 0".to_string());
            }
        }

        if self.downscale_factor < 2 {
            return Err("downscale_factor must be at least 2".to_string());
        }
        if self.levels == 0 {
            return Err("levels must be greater than 0".to_string());
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be greater than 0".to_string());
        }
        if !self.memory_limit.is_finite() || self.memory_limit <= 0.0 {
            return Err("memory_limit must be a positive number of GB".to_string());
        }
        if self.workers == 0 {
            return Err("workers must be greater than 0".to_string());
        }
        if self.io_concurrency == 0 {
            return Err("io_concurrency must be greater than 0".to_string());
        }
        if self.compression_level > 9 {
            return Err("compression_level must be between 0 and 9".to_string());
        }

        Ok(())
    }

    /// Memory limit in bytes
    pub fn memory_budget_bytes(&self) -> u64 {
        gib_to_bytes(self.memory_limit)
    }

    /// Level 0 shape: the override when given, else `input_shape`
    pub fn full_res_shape(&self, input_shape: [usize; 3]) -> [usize; 3] {
        match self.override_shape.as_deref() {
            Some(&[z, y, x]) => [z, y, x],
            _ => input_shape,
        }
    }

    /// Pyramid settings for a volume of `input_shape`
    pub fn pyramid_config(&self, input_shape: [usize; 3]) -> Result<PyramidConfig, String> {
        let order = InterpolationOrder::new(self.resize_order).map_err(|e| e.to_string())?;
        Ok(PyramidConfig::new(self.full_res_shape(input_shape))
            .with_levels(self.levels)
            .with_downscale_factor(self.downscale_factor)
            .with_chunk_size(self.chunk_size)
            .with_memory_threshold(self.memory_budget_bytes())
            .with_order(order)
            .with_compression(
                self.compression,
                CompressionLevel::new(self.compression_level),
            )
            .with_workers(self.workers))
    }
}
