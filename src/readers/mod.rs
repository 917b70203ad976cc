//! Format readers
//!
//! Every input file is classified once into a [`FormatTag`]. A reader can
//! either probe a file for its (z, y, x) shape and element type without
//! decoding the voxels, or load it. Probing and loading apply the same
//! normalisation so the two always agree: 2D images become `(1, y, x)` and,
//! when transposition is requested, Y and X are exchanged.

mod image;
mod nifti;
mod npy;
mod tiff;
mod zarr;

use crate::array::VolumeArray;
use crate::error::{PyramidError, Result};
use crate::store::ZarrArray;
use crate::types::{DataType, Region};
use std::path::{Path, PathBuf};
use tracing::debug;

pub use zarr::open_zarr_input;

/// Suffixes accepted for single files and directory entries
pub const VALID_SUFFIXES: &[&str] = &[
    ".tif", ".tiff", ".nii", ".nii.gz", ".gz", ".npy", ".png", ".jpg", ".jpeg",
];

/// Input format of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    /// Single or multi-page TIFF
    Tiff,
    /// NIfTI-1, plain or gzip-compressed
    Nifti,
    /// NumPy `.npy` dump
    Npy,
    /// Zarr v2 array or OME group
    Zarr,
    /// PNG/JPEG and other formats handled by the generic image decoder
    Image,
}

impl FormatTag {
    /// Classify a file suffix as returned by [`file_suffix`]
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            ".tif" | ".tiff" => Some(FormatTag::Tiff),
            ".nii" | ".nii.gz" | ".gz" => Some(FormatTag::Nifti),
            ".npy" => Some(FormatTag::Npy),
            ".zarr" => Some(FormatTag::Zarr),
            ".png" | ".jpg" | ".jpeg" => Some(FormatTag::Image),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FormatTag::Tiff => "TIFF",
            FormatTag::Nifti => "NIfTI",
            FormatTag::Npy => "NPY",
            FormatTag::Zarr => "Zarr",
            FormatTag::Image => "image",
        }
    }
}

/// Lower-cased suffix of a path, keeping `.nii.gz` as one suffix
pub fn file_suffix(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    if name.ends_with(".nii.gz") {
        return Some(".nii.gz".to_string());
    }
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(format!(".{}", ext))
}

/// Shape, element type and estimated resident size of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub shape: [usize; 3],
    pub data_type: DataType,
    /// Bytes the segment occupies once loaded; 0 for chunked inputs
    pub estimated_bytes: u64,
}

impl SegmentInfo {
    fn resident(shape: [usize; 3], data_type: DataType) -> Self {
        let voxels: u64 = shape.iter().map(|&d| d as u64).product();
        Self {
            shape,
            data_type,
            estimated_bytes: voxels * data_type.size_in_bytes() as u64,
        }
    }

    fn transposed(mut self, transpose: bool) -> Self {
        if transpose {
            self.shape = [self.shape[0], self.shape[2], self.shape[1]];
        }
        self
    }
}

/// Loaded segment
#[derive(Debug, Clone)]
pub enum SegmentData {
    /// Fully decoded in memory
    Resident(VolumeArray),
    /// Opened chunked array, read on demand
    Chunked { array: ZarrArray, transpose: bool },
}

impl SegmentData {
    pub fn shape(&self) -> [usize; 3] {
        match self {
            SegmentData::Resident(array) => array.shape(),
            SegmentData::Chunked { array, transpose } => {
                let [z, y, x] = array.shape();
                if *transpose {
                    [z, x, y]
                } else {
                    [z, y, x]
                }
            }
        }
    }

    /// Copy out a region given in segment-local coordinates
    pub async fn read_region(&self, region: &Region) -> Result<VolumeArray> {
        match self {
            SegmentData::Resident(array) => array.slice(region),
            SegmentData::Chunked { array, transpose } => {
                if *transpose {
                    Ok(array.read_region(&region.swap_yx()).await?.swap_yx())
                } else {
                    array.read_region(region).await
                }
            }
        }
    }
}

/// Read the shape and element type of a file without decoding it
pub async fn probe(path: &Path, format: FormatTag, transpose: bool) -> Result<SegmentInfo> {
    debug!("Probing {} file {}", format.name(), path.display());
    let info = match format {
        FormatTag::Zarr => {
            let array = open_zarr_input(path).await?;
            SegmentInfo {
                shape: array.shape(),
                data_type: array.data_type(),
                estimated_bytes: 0,
            }
        }
        _ => {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || probe_blocking(&path, format)).await??
        }
    };
    Ok(info.transposed(transpose))
}

fn probe_blocking(path: &Path, format: FormatTag) -> Result<SegmentInfo> {
    let (shape, data_type) = match format {
        FormatTag::Tiff => tiff::probe(path)?,
        FormatTag::Nifti => nifti::probe(path)?,
        FormatTag::Npy => npy::probe(path)?,
        FormatTag::Image => image::probe(path)?,
        FormatTag::Zarr => return Err(chunked_format_error(path, format)),
    };
    Ok(SegmentInfo::resident(shape, data_type))
}

/// Load a segment, decoding it fully unless it is a chunked array
pub async fn load(path: &Path, format: FormatTag, transpose: bool) -> Result<SegmentData> {
    debug!("Loading {} file {}", format.name(), path.display());
    if format == FormatTag::Zarr {
        let array = open_zarr_input(path).await?;
        return Ok(SegmentData::Chunked { array, transpose });
    }

    let path: PathBuf = path.to_path_buf();
    let array = tokio::task::spawn_blocking(move || -> Result<VolumeArray> {
        let array = match format {
            FormatTag::Tiff => tiff::load(&path)?,
            FormatTag::Nifti => nifti::load(&path)?,
            FormatTag::Npy => npy::load(&path)?,
            FormatTag::Image => image::load(&path)?,
            FormatTag::Zarr => return Err(chunked_format_error(&path, format)),
        };
        Ok(if transpose { array.swap_yx() } else { array })
    })
    .await??;

    Ok(SegmentData::Resident(array))
}

fn chunked_format_error(path: &Path, format: FormatTag) -> PyramidError {
    PyramidError::invalid_format(
        path,
        format!("{} arrays are read chunk by chunk, not decoded in memory", format.name()),
    )
}

/// Promote a 2D shape to `(1, y, x)`; reject anything else but 3D
pub(crate) fn shape_to_3d(path: &Path, shape: &[usize]) -> Result<[usize; 3]> {
    match shape {
        [y, x] => Ok([1, *y, *x]),
        [z, y, x] => Ok([*z, *y, *x]),
        _ => Err(PyramidError::invalid_format(
            path,
            format!("Unsupported shape {:?}, expected 2 or 3 dimensions", shape),
        )),
    }
}
