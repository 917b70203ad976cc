//! omezarr-pyramid - multiscale OME-Zarr pyramids from large 3D volumes
//!
//! Reads a volume stored as one file, a Zarr array or a directory of
//! same-format files, and writes it as a chunked Zarr v2 pyramid with OME-NGFF
//! multiscale metadata, keeping memory use under a configured limit.
//!
//! # Features
//!
//! - TIFF, NIfTI-1, NPY, Zarr v2, PNG and JPEG inputs
//! - Directories of slices or stacks concatenated along Z, loaded lazily
//! - Separable two-pass resampling with B-spline orders 0 to 5
//! - Temp buffers staged on disk when they would not fit in memory
//! - Resumable output: completed levels are kept on rerun
//! - Zarr inputs in any codec `zarrs` decodes, including zarr-python's Blosc
//! - Uncompressed, zlib, gzip, zstd or Blosc output chunks
//!
//! # Example
//!
//! ```rust,ignore
//! use omezarr_pyramid::{PyramidConfig, PyramidWriter, VolumeAssembler, GIB};
//!
//! # async fn example() -> omezarr_pyramid::Result<()> {
//! let assembler = VolumeAssembler::open("/data/stack", false, 64 * GIB).await?;
//! let config = PyramidConfig::new(assembler.shape()).with_levels(4);
//! let name = assembler.name().to_string();
//!
//! // Writes /data/out/stack_ome.zarr
//! let mut writer = PyramidWriter::create(assembler, "/data/out", name, config)?;
//! writer.write().await?;
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod assembler;
pub mod compression;
pub mod config;
pub mod error;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod pyramid;
pub mod readers;
pub mod resample;
pub mod store;
pub mod types;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-exports
pub use array::{Element, VolumeArray};
pub use assembler::{Segment, VolumeAssembler};
pub use compression::{CompressionLevel, CompressionMethod};
pub use error::{PyramidError, Result};
pub use io::{FileSystemIOManager, IOManager};
pub use layout::ChunkShape;
pub use metadata::MultiscaleAttributes;
pub use pyramid::{PyramidConfig, PyramidWriter, VolumeSource, WriteSummary};
pub use resample::{InterpolationOrder, ResamplePool};
pub use store::{ZarrArray, ZarrGroup};
pub use types::{DataType, Region};
pub use utils::GIB;

/// Version of the converter
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
