//! Chunk compressors, identified by their Zarr v2 (numcodecs) ids
//!
//! Chunks are encoded and decoded by `zarrs`. This module only chooses the
//! compressor entry written into the `.zarray` of arrays created here.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;

/// Compression methods supported for output chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Raw chunk bytes
    #[default]
    None,
    /// zlib stream
    Zlib,
    /// gzip stream
    Gzip,
    /// Zstandard frame
    Zstd,
    /// Blosc with LZ4 and byte shuffling, the zarr-python default
    Blosc,
}

impl CompressionMethod {
    /// Map a Zarr compressor id to a method
    pub fn from_zarr_id(id: &str) -> Option<Self> {
        match id {
            "zlib" => Some(CompressionMethod::Zlib),
            "gzip" => Some(CompressionMethod::Gzip),
            "zstd" => Some(CompressionMethod::Zstd),
            "blosc" => Some(CompressionMethod::Blosc),
            _ => None,
        }
    }

    /// `.zarray` compressor entry for this method, `None` when uncompressed
    pub fn to_config(&self, level: CompressionLevel) -> Option<Value> {
        let level = level.value();
        match self {
            CompressionMethod::None => None,
            CompressionMethod::Zlib => Some(json!({ "id": "zlib", "level": level })),
            CompressionMethod::Gzip => Some(json!({ "id": "gzip", "level": level })),
            CompressionMethod::Zstd => Some(json!({ "id": "zstd", "level": level })),
            CompressionMethod::Blosc => Some(json!({
                "id": "blosc",
                "cname": "lz4",
                "clevel": level,
                "shuffle": 1,
                "blocksize": 0,
            })),
        }
    }
}

impl FromStr for CompressionMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "raw" => Ok(CompressionMethod::None),
            other => Self::from_zarr_id(other).ok_or_else(|| {
                format!(
                    "Unsupported compressor '{}' (expected none, zlib, gzip, zstd or blosc)",
                    s
                )
            }),
        }
    }
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zarr_config_mapping() {
        assert!(CompressionMethod::None
            .to_config(CompressionLevel::default())
            .is_none());

        let config = CompressionMethod::Zstd
            .to_config(CompressionLevel::new(3))
            .unwrap();
        assert_eq!(config, json!({ "id": "zstd", "level": 3 }));

        let blosc = CompressionMethod::Blosc
            .to_config(CompressionLevel::default())
            .unwrap();
        assert_eq!(blosc["id"], "blosc");
        assert_eq!(blosc["cname"], "lz4");
        assert_eq!(blosc["clevel"], 5);
    }

    #[test]
    fn test_level_is_clamped() {
        assert_eq!(CompressionLevel::new(12).value(), 9);
        assert_eq!(CompressionLevel::default().value(), 5);
    }

    #[test]
    fn test_parse_method() {
        assert_eq!("zlib".parse::<CompressionMethod>(), Ok(CompressionMethod::Zlib));
        assert_eq!("NONE".parse::<CompressionMethod>(), Ok(CompressionMethod::None));
        assert_eq!("blosc".parse::<CompressionMethod>(), Ok(CompressionMethod::Blosc));
        assert!("lz4".parse::<CompressionMethod>().is_err());
    }
}
