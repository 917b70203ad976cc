//! Zarr v2 inputs: a bare array or a multiscale group, of which level `0`
//! is read

use crate::error::{PyramidError, Result};
use crate::io::{FileSystemIOManager, IOManager};
use crate::metadata::{ZARRAY_KEY, ZGROUP_KEY};
use crate::store::ZarrArray;
use crate::utils::join_key;
use std::path::Path;
use tracing::debug;

const FULL_RESOLUTION_LEVEL: &str = "0";

/// Open a chunked input for reading
pub async fn open_zarr_input(path: &Path) -> Result<ZarrArray> {
    let io = FileSystemIOManager::new(path);
    if io.exists(ZARRAY_KEY).await? {
        return ZarrArray::open(path).await;
    }

    let level_descriptor = join_key(FULL_RESOLUTION_LEVEL, ZARRAY_KEY);
    if io.exists(ZGROUP_KEY).await? && io.exists(&level_descriptor).await? {
        debug!("Reading level {} of group {}", FULL_RESOLUTION_LEVEL, path.display());
        return ZarrArray::open(path.join(FULL_RESOLUTION_LEVEL)).await;
    }

    Err(PyramidError::invalid_format(
        path,
        "neither a Zarr array nor a group with level 0",
    ))
}
