//! Error types for volume assembly and pyramid writing

use crate::types::DataType;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for assembler, store and pyramid operations
#[derive(Error, Debug)]
pub enum PyramidError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No valid volume files found in {0}")]
    NotFound(PathBuf),

    #[error("Invalid format in {path}: {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Mismatch in XY dimensions: {path} has {found:?}, expected {expected:?}")]
    ShapeMismatch {
        path: PathBuf,
        expected: [usize; 2],
        found: [usize; 2],
    },

    #[error("Mismatch in data types: {path} has {found}, expected {expected}")]
    DtypeMismatch {
        path: PathBuf,
        expected: DataType,
        found: DataType,
    },

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Request needs {requested} bytes, exceeds limit of {limit} bytes")]
    ResourceExhausted { requested: u64, limit: u64 },

    #[error("Error reading {path}: {source}")]
    Segment {
        path: PathBuf,
        #[source]
        source: Box<PyramidError>,
    },

    #[error("Worker task #{index} failed: {source}")]
    WorkerFailure {
        index: usize,
        #[source]
        source: Box<PyramidError>,
    },

    #[error("Worker panicked: {0}")]
    Panic(String),

    #[error("Zarr error on {path}: {reason}")]
    Zarr { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Specialized Result type for pyramid operations
pub type Result<T> = std::result::Result<T, PyramidError>;

impl PyramidError {
    /// Wrap an I/O error with the path it happened on
    pub fn file_io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        PyramidError::FileIo {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn invalid_format(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        PyramidError::InvalidFormat {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Wrap an error reported by the Zarr storage layer
    pub fn zarr(path: impl AsRef<Path>, err: impl std::fmt::Display) -> Self {
        PyramidError::Zarr {
            path: path.as_ref().to_path_buf(),
            reason: err.to_string(),
        }
    }

    pub fn worker(index: usize, source: PyramidError) -> Self {
        PyramidError::WorkerFailure {
            index,
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for PyramidError {
    fn from(err: serde_json::Error) -> Self {
        PyramidError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_failure_names_index() {
        let err = PyramidError::worker(7, PyramidError::Validation("empty plane".into()));
        assert_eq!(
            err.to_string(),
            "Worker task #7 failed: Validation error: empty plane"
        );
    }

    #[test]
    fn test_file_io_names_path() {
        let err = PyramidError::file_io(
            "/data/slice_001.tif",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("/data/slice_001.tif"));
    }
}
