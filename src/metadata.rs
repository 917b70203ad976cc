//! OME-NGFF multiscale attributes and the names of the Zarr v2 descriptor
//! documents

use serde::{Deserialize, Serialize};

/// Key of the array descriptor inside an array directory
pub const ZARRAY_KEY: &str = ".zarray";

/// Key of the group descriptor
pub const ZGROUP_KEY: &str = ".zgroup";

/// Key of the group attribute document
pub const ZATTRS_KEY: &str = ".zattrs";

/// OME-NGFF version written into the multiscale descriptor
pub const OME_NGFF_VERSION: &str = "0.4";

/// Named axis of the multiscale image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,

    #[serde(rename = "type")]
    pub axis_type: String,
}

impl Axis {
    pub fn space(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            axis_type: "space".to_string(),
        }
    }
}

/// Per-level coordinate transformation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateTransformation {
    #[serde(rename = "type")]
    pub transform_type: String,

    pub scale: Vec<u64>,
}

/// One pyramid level as listed in the multiscale descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub path: String,

    #[serde(rename = "coordinateTransformations")]
    pub coordinate_transformations: Vec<CoordinateTransformation>,
}

/// Multiscale descriptor for a z/y/x pyramid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multiscale {
    pub version: String,

    pub name: String,

    pub axes: Vec<Axis>,

    pub datasets: Vec<DatasetEntry>,
}

impl Multiscale {
    /// Descriptor for `levels` levels, each `downscale_factor` times coarser
    pub fn new(name: impl Into<String>, levels: usize, downscale_factor: usize) -> Self {
        let datasets = (0..levels)
            .map(|level| {
                let scale = (downscale_factor as u64).pow(level as u32);
                DatasetEntry {
                    path: level.to_string(),
                    coordinate_transformations: vec![CoordinateTransformation {
                        transform_type: "scale".to_string(),
                        scale: vec![scale; 3],
                    }],
                }
            })
            .collect();

        Self {
            version: OME_NGFF_VERSION.to_string(),
            name: name.into(),
            axes: vec![Axis::space("z"), Axis::space("y"), Axis::space("x")],
            datasets,
        }
    }
}

/// Top-level `.zattrs` document of the pyramid group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiscaleAttributes {
    pub multiscales: Vec<Multiscale>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_multiscale_document() {
        let attrs = MultiscaleAttributes {
            multiscales: vec![Multiscale::new("brain", 3, 2)],
        };
        let value = serde_json::to_value(&attrs).unwrap();
        assert_eq!(
            value,
            json!({
                "multiscales": [{
                    "version": "0.4",
                    "name": "brain",
                    "axes": [
                        {"name": "z", "type": "space"},
                        {"name": "y", "type": "space"},
                        {"name": "x", "type": "space"}
                    ],
                    "datasets": [
                        {"path": "0", "coordinateTransformations": [{"type": "scale", "scale": [1, 1, 1]}]},
                        {"path": "1", "coordinateTransformations": [{"type": "scale", "scale": [2, 2, 2]}]},
                        {"path": "2", "coordinateTransformations": [{"type": "scale", "scale": [4, 4, 4]}]}
                    ]
                }]
            })
        );
    }
}
