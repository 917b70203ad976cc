//! Zarr v2 groups and arrays on the local file system
//!
//! Chunk encoding, chunk keys, partial chunk updates and fill values are
//! handled by `zarrs`. On top of it, arrays written here only become visible
//! once [`ZarrArray::commit`] stores their `.zarray` descriptor. Readers and
//! the pyramid writer treat an array directory without a descriptor as absent.

use crate::array::{dispatch, with_element, Element, VolumeArray};
use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{PyramidError, Result};
use crate::io::{FileSystemIOManager, IOManager};
use crate::layout::ChunkShape;
use crate::metadata::{MultiscaleAttributes, ZARRAY_KEY, ZATTRS_KEY, ZGROUP_KEY};
use crate::types::{DataType, Region};
use crate::utils::join_key;
use ndarray::Array3;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use zarrs::array::{Array, ArrayMetadata, DataType as StoredType};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupMetadata};

type StoreArray = Array<FilesystemStore>;

fn open_store(path: &Path) -> Result<Arc<FilesystemStore>> {
    FilesystemStore::new(path)
        .map(Arc::new)
        .map_err(|e| PyramidError::zarr(path, e))
}

/// Node path of a child array inside a store
fn node_path(name: &str) -> String {
    format!("/{}", name.trim_start_matches('/'))
}

/// Zarr v2 group on the local file system
#[derive(Clone)]
pub struct ZarrGroup {
    path: PathBuf,
    io: Arc<dyn IOManager>,
    store: Arc<FilesystemStore>,
}

impl std::fmt::Debug for ZarrGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZarrGroup").field("path", &self.path).finish()
    }
}

impl ZarrGroup {
    /// Create the group directory and `.zgroup`, keeping existing content
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let group = Self::at(path)?;
        if !group.io.exists(ZGROUP_KEY).await? {
            let store = Arc::clone(&group.store);
            let path = group.path.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let metadata: GroupMetadata = serde_json::from_value(json!({ "zarr_format": 2 }))?;
                Group::new_with_metadata(store, "/", metadata)
                    .map_err(|e| PyramidError::zarr(&path, e))?
                    .store_metadata()
                    .map_err(|e| PyramidError::zarr(&path, e))
            })
            .await??;
        }
        Ok(group)
    }

    /// Open an existing group
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let group = Self::at(path)?;
        if !group.io.exists(ZGROUP_KEY).await? {
            return Err(PyramidError::invalid_format(
                &group.path,
                "missing .zgroup descriptor",
            ));
        }
        Ok(group)
    }

    fn at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Ok(Self {
            io: Arc::new(FileSystemIOManager::new(&path)),
            store: open_store(&path)?,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a committed array named `name` exists
    pub async fn contains_array(&self, name: &str) -> Result<bool> {
        self.io.exists(&join_key(name, ZARRAY_KEY)).await
    }

    /// Remove an array and all of its chunks
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.io.delete_prefix(name).await
    }

    /// Prepare a new C-ordered array with a zero fill value. Chunks can be
    /// written right away; the array is visible once committed.
    pub fn create_array(
        &self,
        name: &str,
        shape: [usize; 3],
        chunk_shape: ChunkShape,
        data_type: DataType,
        compression: CompressionMethod,
        level: CompressionLevel,
    ) -> Result<ZarrArray> {
        let path = self.path.join(name);
        let document = json!({
            "zarr_format": 2,
            "shape": shape,
            "chunks": chunk_shape.dims(),
            "dtype": data_type.to_typestr(),
            "compressor": compression.to_config(level),
            "fill_value": 0,
            "order": "C",
            "filters": null,
            "dimension_separator": ".",
        });
        let metadata: ArrayMetadata =
            serde_json::from_value(document).map_err(|e| PyramidError::zarr(&path, e))?;
        let array = Array::new_with_metadata(Arc::clone(&self.store), &node_path(name), metadata)
            .map_err(|e| PyramidError::zarr(&path, e))?;
        ZarrArray::from_array(array, path)
    }

    /// Open a committed array
    pub async fn open_array(&self, name: &str) -> Result<ZarrArray> {
        let store = Arc::clone(&self.store);
        let node = node_path(name);
        let path = self.path.join(name);
        tokio::task::spawn_blocking(move || {
            let array = Array::open(store, &node).map_err(|e| PyramidError::zarr(&path, e))?;
            ZarrArray::from_array(array, path)
        })
        .await?
    }

    /// Write the multiscale attribute document
    pub async fn write_attributes(&self, attributes: &MultiscaleAttributes) -> Result<()> {
        let document = serde_json::to_vec_pretty(attributes)?;
        self.io.write(ZATTRS_KEY, &document).await
    }
}

/// Chunked 3D array backed by a `zarrs` array
#[derive(Clone)]
pub struct ZarrArray {
    array: Arc<StoreArray>,
    path: PathBuf,
    shape: [usize; 3],
    chunk_shape: ChunkShape,
    data_type: DataType,
}

impl std::fmt::Debug for ZarrArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZarrArray")
            .field("path", &self.path)
            .field("shape", &self.shape)
            .field("chunks", &self.chunk_shape.dims())
            .field("data_type", &self.data_type)
            .finish()
    }
}

impl ZarrArray {
    /// Open the array whose `.zarray` lives directly in `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let store = open_store(&path)?;
            let array = Array::open(store, "/").map_err(|e| PyramidError::zarr(&path, e))?;
            Self::from_array(array, path)
        })
        .await?
    }

    fn from_array(array: StoreArray, path: PathBuf) -> Result<Self> {
        let shape = dims3(array.shape()).ok_or_else(|| {
            PyramidError::Validation(format!(
                "Unsupported input dimensionality: {} has {} dimensions, expected 3",
                path.display(),
                array.shape().len()
            ))
        })?;
        let data_type = element_type(array.data_type()).ok_or_else(|| {
            PyramidError::invalid_format(
                &path,
                format!("unsupported element type {:?}", array.data_type()),
            )
        })?;
        let chunks: Vec<u64> = array
            .chunk_shape(&[0, 0, 0])
            .map_err(|e| PyramidError::zarr(&path, e))?
            .iter()
            .map(|edge| edge.get())
            .collect();
        let chunk_shape = dims3(&chunks)
            .ok_or_else(|| PyramidError::invalid_format(&path, "irregular chunk grid"))
            .and_then(ChunkShape::new)?;

        Ok(Self {
            array: Arc::new(array),
            path,
            shape,
            chunk_shape,
            data_type,
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn chunk_shape(&self) -> ChunkShape {
        self.chunk_shape
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store the `.zarray` descriptor, making the array visible
    pub async fn commit(&self) -> Result<()> {
        let array = Arc::clone(&self.array);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            array
                .store_metadata()
                .map_err(|e| PyramidError::zarr(&path, e))
        })
        .await??;
        debug!(
            "Committed array {} with shape {:?} in {:?} chunks",
            self.path.display(),
            self.shape,
            self.chunk_shape.grid_shape(self.shape)
        );
        Ok(())
    }

    fn check_region(&self, region: &Region) -> Result<()> {
        if !region.fits_within(self.shape) {
            return Err(PyramidError::OutOfBounds(format!(
                "Region {} outside array of shape {:?}",
                region, self.shape
            )));
        }
        Ok(())
    }

    /// Read a region. Chunks that were never written read as the fill value.
    pub async fn read_region(&self, region: &Region) -> Result<VolumeArray> {
        self.check_region(region)?;
        let array = Arc::clone(&self.array);
        let path = self.path.clone();
        let data_type = self.data_type;
        let region = *region;
        tokio::task::spawn_blocking(move || {
            with_element!(data_type, T => retrieve::<T>(&array, &region, &path))
        })
        .await?
    }

    /// Write `data` into `region`. Partially covered chunks are merged with
    /// their stored content.
    pub async fn write_region(&self, region: &Region, data: VolumeArray) -> Result<()> {
        self.check_region(region)?;
        if data.shape() != region.shape() {
            return Err(PyramidError::Validation(format!(
                "Data of shape {:?} does not match region {}",
                data.shape(),
                region
            )));
        }
        if data.data_type() != self.data_type {
            return Err(PyramidError::DtypeMismatch {
                path: self.path.clone(),
                expected: self.data_type,
                found: data.data_type(),
            });
        }

        let array = Arc::clone(&self.array);
        let path = self.path.clone();
        let region = *region;
        tokio::task::spawn_blocking(move || {
            dispatch!(&data, typed => store_elements(&array, &region, typed, &path))
        })
        .await?
    }
}

fn dims3(values: &[u64]) -> Option<[usize; 3]> {
    match values {
        [z, y, x] => Some([*z as usize, *y as usize, *x as usize]),
        _ => None,
    }
}

fn element_type(stored: &StoredType) -> Option<DataType> {
    let data_type = match stored {
        StoredType::UInt8 => DataType::U8,
        StoredType::UInt16 => DataType::U16,
        StoredType::UInt32 => DataType::U32,
        StoredType::UInt64 => DataType::U64,
        StoredType::Int8 => DataType::I8,
        StoredType::Int16 => DataType::I16,
        StoredType::Int32 => DataType::I32,
        StoredType::Int64 => DataType::I64,
        StoredType::Float32 => DataType::F32,
        StoredType::Float64 => DataType::F64,
        _ => return None,
    };
    Some(data_type)
}

fn subset(region: &Region) -> ArraySubset {
    let ranges: Vec<std::ops::Range<u64>> = (0..3)
        .map(|axis| region.start[axis] as u64..region.end[axis] as u64)
        .collect();
    ArraySubset::new_with_ranges(&ranges)
}

fn retrieve<T: Element>(array: &StoreArray, region: &Region, path: &Path) -> Result<VolumeArray> {
    let elements = array
        .retrieve_array_subset_elements::<T>(&subset(region))
        .map_err(|e| PyramidError::zarr(path, e))?;
    let typed = Array3::from_shape_vec(region.shape(), elements)
        .map_err(|e| PyramidError::Validation(e.to_string()))?;
    Ok(T::wrap(typed))
}

fn store_elements<T: Element>(
    array: &StoreArray,
    region: &Region,
    data: &Array3<T>,
    path: &Path,
) -> Result<()> {
    let contiguous = data.as_standard_layout();
    let elements = contiguous
        .as_slice()
        .ok_or_else(|| PyramidError::Validation("Block is not contiguous".to_string()))?;
    array
        .store_array_subset_elements::<T>(&subset(region), elements)
        .map_err(|e| PyramidError::zarr(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Multiscale;
    use tempfile::TempDir;

    fn ramp(shape: [usize; 3]) -> VolumeArray {
        let n: usize = shape.iter().product();
        let values: Vec<u16> = (1..=n).map(|v| v as u16).collect();
        VolumeArray::from(Array3::from_shape_vec(shape, values).unwrap())
    }

    async fn sample_array(dir: &TempDir, compression: CompressionMethod) -> (ZarrGroup, ZarrArray) {
        let group = ZarrGroup::create(dir.path().join("out.zarr")).await.unwrap();
        let array = group
            .create_array(
                "0",
                [10, 9, 7],
                ChunkShape::cubic(4).unwrap(),
                DataType::U16,
                compression,
                CompressionLevel::default(),
            )
            .unwrap();
        (group, array)
    }

    #[tokio::test]
    async fn test_uncommitted_array_is_absent() {
        let dir = TempDir::new().unwrap();
        let (group, array) = sample_array(&dir, CompressionMethod::None).await;
        assert!(dir.path().join("out.zarr/.zgroup").exists());

        let region = Region::full(array.shape());
        array.write_region(&region, ramp([10, 9, 7])).await.unwrap();
        assert!(!group.contains_array("0").await.unwrap());
        assert!(dir.path().join("out.zarr/0/0.0.0").exists());

        array.commit().await.unwrap();
        assert!(group.contains_array("0").await.unwrap());
        let zarray: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("out.zarr/0/.zarray")).unwrap())
                .unwrap();
        assert_eq!(zarray["zarr_format"], 2);
        assert_eq!(zarray["dtype"], "<u2");
        assert_eq!(zarray["chunks"], json!([4, 4, 4]));

        group.remove("0").await.unwrap();
        assert!(!group.contains_array("0").await.unwrap());
        assert!(!dir.path().join("out.zarr/0").exists());
    }

    #[tokio::test]
    async fn test_write_then_read_regions() {
        for compression in [
            CompressionMethod::Zstd,
            CompressionMethod::Zlib,
            CompressionMethod::Blosc,
        ] {
            let dir = TempDir::new().unwrap();
            let (group, array) = sample_array(&dir, compression).await;
            let data = ramp([10, 9, 7]);

            // Two slabs that split the second chunk row along Z
            for (z0, z1) in [(0, 5), (5, 10)] {
                let slab = Region::z_slab([10, 9, 7], z0, z1);
                array
                    .write_region(&slab, data.slice(&slab).unwrap())
                    .await
                    .unwrap();
            }
            array.commit().await.unwrap();

            let reopened = group.open_array("0").await.unwrap();
            assert_eq!(reopened.shape(), [10, 9, 7]);
            assert_eq!(reopened.data_type(), DataType::U16);
            assert_eq!(reopened.chunk_shape().dims(), [4, 4, 4]);

            let full = reopened.read_region(&Region::full([10, 9, 7])).await.unwrap();
            assert_eq!(full, data, "{:?}", compression);

            let part = Region::new([3, 2, 1], [9, 9, 6]);
            let read = reopened.read_region(&part).await.unwrap();
            assert_eq!(read, data.slice(&part).unwrap());
        }
    }

    #[tokio::test]
    async fn test_edge_chunks_stored_at_full_size() {
        let dir = TempDir::new().unwrap();
        let (_group, array) = sample_array(&dir, CompressionMethod::None).await;
        array
            .write_region(&Region::full([10, 9, 7]), ramp([10, 9, 7]))
            .await
            .unwrap();

        let edge = std::fs::metadata(dir.path().join("out.zarr/0/2.2.1")).unwrap();
        assert_eq!(edge.len() as usize, 4 * 4 * 4 * 2);
    }

    #[tokio::test]
    async fn test_missing_chunks_read_as_fill() {
        let dir = TempDir::new().unwrap();
        let (_group, array) = sample_array(&dir, CompressionMethod::Zlib).await;
        let read = array.read_region(&Region::new([0, 0, 0], [2, 2, 2])).await.unwrap();
        assert_eq!(read, VolumeArray::zeros(DataType::U16, [2, 2, 2]));
    }

    #[tokio::test]
    async fn test_rejects_bad_writes() {
        let dir = TempDir::new().unwrap();
        let (_group, array) = sample_array(&dir, CompressionMethod::None).await;

        let outside = Region::new([8, 0, 0], [12, 1, 1]);
        assert!(matches!(
            array
                .write_region(&outside, VolumeArray::zeros(DataType::U16, [4, 1, 1]))
                .await,
            Err(PyramidError::OutOfBounds(_))
        ));

        let region = Region::new([0, 0, 0], [1, 1, 1]);
        assert!(matches!(
            array
                .write_region(&region, VolumeArray::zeros(DataType::U8, [1, 1, 1]))
                .await,
            Err(PyramidError::DtypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_stat_failure_is_not_absence() {
        let dir = TempDir::new().unwrap();
        let group = ZarrGroup::create(dir.path().join("out.zarr")).await.unwrap();
        // A file where the level directory should be makes `0/.zarray` unstatable
        std::fs::write(group.path().join("0"), b"not a directory").unwrap();

        assert!(matches!(
            group.contains_array("0").await,
            Err(PyramidError::FileIo { .. })
        ));
    }

    #[tokio::test]
    async fn test_group_attributes() {
        let dir = TempDir::new().unwrap();
        let group = ZarrGroup::create(dir.path().join("vol_ome.zarr")).await.unwrap();
        let attributes = MultiscaleAttributes {
            multiscales: vec![Multiscale::new("vol", 2, 2)],
        };
        group.write_attributes(&attributes).await.unwrap();

        let reopened = ZarrGroup::open(group.path()).await.unwrap();
        let document = std::fs::read(reopened.path().join(ZATTRS_KEY)).unwrap();
        let parsed: MultiscaleAttributes = serde_json::from_slice(&document).unwrap();
        assert_eq!(parsed, attributes);
        assert!(ZarrGroup::open(dir.path().join("missing.zarr")).await.is_err());
    }
}
