//! Volume assembler - presents one or more input files as a single 3D volume
//!
//! Inputs are discovered once at [`VolumeAssembler::open`]: a single file, a
//! Zarr directory, or a directory of same-format slices/stacks that are
//! concatenated along Z in file name order. Reads load only the segments a
//! request overlaps and keep them cached until a later read no longer needs
//! them. Half of the configured memory budget may be held by the cache.

use crate::array::VolumeArray;
use crate::error::{PyramidError, Result};
use crate::readers::{self, file_suffix, FormatTag, SegmentData, VALID_SUFFIXES};
use crate::types::{DataType, Region};
use crate::utils::format_bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Segments probed or loaded at the same time
pub const DEFAULT_IO_CONCURRENCY: usize = 8;

/// One input file and its place along Z
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    pub format: FormatTag,
    pub yx_shape: [usize; 2],
    pub z_extent: usize,
    pub data_type: DataType,
    /// Resident size once loaded; 0 for chunked inputs
    pub estimated_bytes: u64,
    /// First slice of the segment in volume coordinates
    pub z_start: usize,
    /// One past the last slice
    pub z_end: usize,
}

impl Segment {
    pub fn overlaps(&self, z0: usize, z1: usize) -> bool {
        self.z_start < z1 && self.z_end > z0
    }
}

/// Logical (z, y, x) volume over a sequence of segments
pub struct VolumeAssembler {
    input_path: PathBuf,
    name: String,
    transpose: bool,
    memory_budget: u64,
    io_concurrency: usize,
    segments: Vec<Segment>,
    shape: [usize; 3],
    data_type: DataType,
    cache: BTreeMap<usize, SegmentData>,
}

impl std::fmt::Debug for VolumeAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeAssembler")
            .field("input_path", &self.input_path)
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("data_type", &self.data_type)
            .field("segments", &self.segments.len())
            .field("cached", &self.cached_segments())
            .finish()
    }
}

impl VolumeAssembler {
    /// Discover and validate the segments of `input_path`
    ///
    /// `memory_budget` is in bytes; reads fail once the cached segments would
    /// exceed half of it.
    pub async fn open(
        input_path: impl AsRef<Path>,
        transpose: bool,
        memory_budget: u64,
    ) -> Result<Self> {
        Self::open_with_concurrency(input_path, transpose, memory_budget, DEFAULT_IO_CONCURRENCY)
            .await
    }

    /// Like [`VolumeAssembler::open`] with an explicit bound on concurrent
    /// probes and loads
    pub async fn open_with_concurrency(
        input_path: impl AsRef<Path>,
        transpose: bool,
        memory_budget: u64,
        io_concurrency: usize,
    ) -> Result<Self> {
        let input_path = input_path.as_ref().to_path_buf();
        let io_concurrency = io_concurrency.max(1);
        info!("Opening volume input {}", input_path.display());

        let files = discover_segments(&input_path).await?;
        info!("Found {} volume file(s)", files.len());

        let infos: Vec<_> = stream::iter(files.iter())
            .map(|(path, format)| async move {
                readers::probe(path, *format, transpose)
                    .await
                    .map_err(|e| PyramidError::Segment {
                        path: path.clone(),
                        source: Box::new(e),
                    })
            })
            .buffered(io_concurrency)
            .try_collect()
            .await?;

        let mut segments: Vec<Segment> = Vec::with_capacity(files.len());
        let mut z_end = 0;
        for ((path, format), info) in files.into_iter().zip(infos) {
            let [z_extent, y, x] = info.shape;
            if let Some(first) = segments.first() {
                if first.yx_shape != [y, x] {
                    return Err(PyramidError::ShapeMismatch {
                        path,
                        expected: first.yx_shape,
                        found: [y, x],
                    });
                }
                if first.data_type != info.data_type {
                    return Err(PyramidError::DtypeMismatch {
                        path,
                        expected: first.data_type,
                        found: info.data_type,
                    });
                }
            }

            let z_start = z_end;
            z_end += z_extent;
            segments.push(Segment {
                path,
                format,
                yx_shape: [y, x],
                z_extent,
                data_type: info.data_type,
                estimated_bytes: info.estimated_bytes,
                z_start,
                z_end,
            });
        }

        let first = segments
            .first()
            .ok_or_else(|| PyramidError::NotFound(input_path.clone()))?;
        let shape = [z_end, first.yx_shape[0], first.yx_shape[1]];
        let data_type = first.data_type;
        let name = volume_name(&input_path);

        info!("Volume name: {}", name);
        info!("Volume shape: {:?}", shape);
        info!("Volume dtype: {}", data_type);

        Ok(Self {
            input_path,
            name,
            transpose,
            memory_budget,
            io_concurrency,
            segments,
            shape,
            data_type,
            cache: BTreeMap::new(),
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Name derived from the input path, used for the output store
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn transpose(&self) -> bool {
        self.transpose
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Indices of the segments currently held in the cache, ascending
    pub fn cached_segments(&self) -> Vec<usize> {
        self.cache.keys().copied().collect()
    }

    pub fn memory_budget(&self) -> u64 {
        self.memory_budget
    }

    /// Bytes the cache may hold
    pub fn cache_limit(&self) -> u64 {
        self.memory_budget / 2
    }

    /// Read `[z0, z1)` with optional Y and X ranges (full extent when `None`)
    pub async fn read(
        &mut self,
        z0: usize,
        z1: usize,
        y: Option<Range<usize>>,
        x: Option<Range<usize>>,
    ) -> Result<VolumeArray> {
        let y = y.unwrap_or(0..self.shape[1]);
        let x = x.unwrap_or(0..self.shape[2]);
        let region = Region::new([z0, y.start, x.start], [z1, y.end, x.end]);
        self.read_region(&region).await
    }

    /// Read an arbitrary region of the volume
    pub async fn read_region(&mut self, region: &Region) -> Result<VolumeArray> {
        if !region.fits_within(self.shape) {
            return Err(PyramidError::OutOfBounds(format!(
                "Read {} outside volume of shape {:?}",
                region, self.shape
            )));
        }
        if region.is_empty() {
            return Err(PyramidError::Validation(format!(
                "Read {} selects no voxels",
                region
            )));
        }
        debug!("Reading volume {}", region);

        let (z0, z1) = (region.start[0], region.end[0]);
        let needed: Vec<usize> = self
            .segments
            .iter()
            .enumerate()
            .filter(|(_, segment)| segment.overlaps(z0, z1))
            .map(|(index, _)| index)
            .collect();

        // Checked before eviction so a rejected read leaves the cache as it was
        let cached_bytes: u64 = needed
            .iter()
            .filter(|index| self.cache.contains_key(index))
            .map(|&index| self.segments[index].estimated_bytes)
            .sum();
        let to_load: Vec<usize> = needed
            .iter()
            .copied()
            .filter(|index| !self.cache.contains_key(index))
            .collect();
        let load_bytes: u64 = to_load
            .iter()
            .map(|&index| self.segments[index].estimated_bytes)
            .sum();
        let requested = cached_bytes + load_bytes;
        if requested > self.cache_limit() {
            return Err(PyramidError::ResourceExhausted {
                requested,
                limit: self.cache_limit(),
            });
        }

        self.cache.retain(|index, _| needed.contains(index));

        if !to_load.is_empty() {
            debug!(
                "Loading {} segment(s), {}",
                to_load.len(),
                format_bytes(load_bytes as usize)
            );
            let loaded = self.load_segments(&to_load).await?;
            self.cache.extend(loaded);
        }

        let mut parts = Vec::with_capacity(needed.len());
        for index in needed {
            let segment = &self.segments[index];
            let data = self.cache.get(&index).ok_or_else(|| {
                PyramidError::Validation(format!("Segment #{} missing from cache", index))
            })?;
            let local = Region::new(
                [
                    z0.max(segment.z_start) - segment.z_start,
                    region.start[1],
                    region.start[2],
                ],
                [
                    z1.min(segment.z_end) - segment.z_start,
                    region.end[1],
                    region.end[2],
                ],
            );
            parts.push(data.read_region(&local).await?);
        }

        VolumeArray::concatenate_z(parts)
    }

    async fn load_segments(&self, indices: &[usize]) -> Result<Vec<(usize, SegmentData)>> {
        let transpose = self.transpose;
        stream::iter(indices.iter().copied())
            .map(|index| {
                let segment = &self.segments[index];
                async move {
                    let data = readers::load(&segment.path, segment.format, transpose)
                        .await
                        .and_then(|data| {
                            let expected =
                                [segment.z_extent, segment.yx_shape[0], segment.yx_shape[1]];
                            if data.shape() == expected {
                                Ok(data)
                            } else {
                                Err(PyramidError::Validation(format!(
                                    "loaded shape {:?} differs from probed shape {:?}",
                                    data.shape(),
                                    expected
                                )))
                            }
                        })
                        .map_err(|e| {
                            PyramidError::worker(
                                index,
                                PyramidError::Segment {
                                    path: segment.path.clone(),
                                    source: Box::new(e),
                                },
                            )
                        })?;
                    Ok::<_, PyramidError>((index, data))
                }
            })
            .buffer_unordered(self.io_concurrency)
            .try_collect()
            .await
    }
}

/// Resolve the input path into an ordered list of segment files
async fn discover_segments(input_path: &Path) -> Result<Vec<(PathBuf, FormatTag)>> {
    let metadata = tokio::fs::metadata(input_path)
        .await
        .map_err(|_| PyramidError::NotFound(input_path.to_path_buf()))?;
    let suffix = file_suffix(input_path);

    if metadata.is_dir() {
        if suffix.as_deref() == Some(".zarr") {
            return Ok(vec![(input_path.to_path_buf(), FormatTag::Zarr)]);
        }
        return scan_directory(input_path).await;
    }

    match suffix
        .as_deref()
        .filter(|s| VALID_SUFFIXES.contains(s))
        .and_then(FormatTag::from_suffix)
    {
        Some(format) => Ok(vec![(input_path.to_path_buf(), format)]),
        None => Err(PyramidError::Validation(format!(
            "Unsupported file type: {}",
            suffix.unwrap_or_default()
        ))),
    }
}

async fn scan_directory(dir: &Path) -> Result<Vec<(PathBuf, FormatTag)>> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| PyramidError::file_io(dir, e))?;
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| PyramidError::file_io(dir, e))?
    {
        entries.push(entry.path());
    }
    entries.sort();

    let mut chosen: Option<String> = None;
    let mut files = Vec::new();
    for path in entries {
        let suffix = file_suffix(&path).unwrap_or_default();
        match &chosen {
            Some(expected) if *expected == suffix => {}
            None if VALID_SUFFIXES.contains(&suffix.as_str()) => {
                chosen = Some(suffix.clone());
            }
            _ => {
                warn!(
                    "Skipping {}: suffix '{}' does not match '{}'",
                    path.display(),
                    suffix,
                    chosen.as_deref().unwrap_or("")
                );
                continue;
            }
        }
        if let Some(format) = FormatTag::from_suffix(&suffix) {
            files.push((path, format));
        }
    }

    if files.is_empty() {
        return Err(PyramidError::NotFound(dir.to_path_buf()));
    }
    Ok(files)
}

/// Input file stem with `.nii.gz` and `.zarr` suffixes removed
pub fn volume_name(input_path: &Path) -> String {
    let name = input_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("volume");
    let lower = name.to_ascii_lowercase();
    for suffix in [".nii.gz", ".zarr"] {
        if lower.ends_with(suffix) {
            return name[..name.len() - suffix.len()].to_string();
        }
    }
    input_path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or(name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionLevel, CompressionMethod};
    use crate::layout::ChunkShape;
    use crate::store::ZarrGroup;
    use crate::test_support::{coded_volume, write_npy};
    use tempfile::TempDir;

    /// Directory of three u16 segments with 2, 3 and 1 slices of 6x5
    fn three_segments(dir: &TempDir) -> Vec<VolumeArray> {
        let volumes = vec![
            coded_volume([2, 6, 5], 0),
            coded_volume([3, 6, 5], 10_000),
            coded_volume([1, 6, 5], 20_000),
        ];
        for (i, volume) in volumes.iter().enumerate() {
            write_npy(&dir.path().join(format!("part_{:02}.npy", i)), volume);
        }
        volumes
    }

    #[tokio::test]
    async fn test_open_directory() {
        let dir = TempDir::new().unwrap();
        three_segments(&dir);

        let assembler = VolumeAssembler::open(dir.path(), false, 1 << 30).await.unwrap();
        assert_eq!(assembler.shape(), [6, 6, 5]);
        assert_eq!(assembler.data_type(), DataType::U16);
        let bounds: Vec<(usize, usize)> = assembler
            .segments()
            .iter()
            .map(|s| (s.z_start, s.z_end))
            .collect();
        assert_eq!(bounds, vec![(0, 2), (2, 5), (5, 6)]);
        assert_eq!(assembler.segments()[1].estimated_bytes, 3 * 6 * 5 * 2);
    }

    #[tokio::test]
    async fn test_multi_segment_read_matches_concatenation() {
        let dir = TempDir::new().unwrap();
        let volumes = three_segments(&dir);
        let expected = VolumeArray::concatenate_z(volumes).unwrap();

        let mut assembler = VolumeAssembler::open(dir.path(), false, 1 << 30).await.unwrap();
        let whole = assembler.read(0, 6, None, None).await.unwrap();
        assert_eq!(whole, expected);

        let region = Region::new([1, 2, 1], [6, 5, 4]);
        let part = assembler.read(1, 6, Some(2..5), Some(1..4)).await.unwrap();
        assert_eq!(part.shape(), [5, 3, 3]);
        assert_eq!(part, expected.slice(&region).unwrap());
    }

    #[tokio::test]
    async fn test_cache_holds_overlapping_segments() {
        let dir = TempDir::new().unwrap();
        three_segments(&dir);
        let mut assembler = VolumeAssembler::open(dir.path(), false, 1 << 30).await.unwrap();

        assembler.read(1, 3, None, None).await.unwrap();
        assert_eq!(assembler.cached_segments(), vec![0, 1]);

        assembler.read(4, 6, None, None).await.unwrap();
        assert_eq!(assembler.cached_segments(), vec![1, 2]);

        assembler.read(5, 6, None, None).await.unwrap();
        assert_eq!(assembler.cached_segments(), vec![2]);
    }

    #[tokio::test]
    async fn test_over_budget_read_leaves_cache() {
        let dir = TempDir::new().unwrap();
        three_segments(&dir);
        // Cache limit of 200 bytes; the segments take 120, 180 and 60
        let mut assembler = VolumeAssembler::open(dir.path(), false, 2 * 200).await.unwrap();

        assembler.read(0, 1, None, None).await.unwrap();
        assert_eq!(assembler.cached_segments(), vec![0]);

        let result = assembler.read(0, 6, None, None).await;
        assert!(matches!(
            result,
            Err(PyramidError::ResourceExhausted {
                requested: 360,
                limit: 200
            })
        ));
        assert_eq!(assembler.cached_segments(), vec![0]);
    }

    #[tokio::test]
    async fn test_transpose() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.npy");
        let volume = coded_volume([2, 6, 5], 0);
        write_npy(&path, &volume);

        let mut assembler = VolumeAssembler::open(&path, true, 1 << 30).await.unwrap();
        assert_eq!(assembler.shape(), [2, 5, 6]);
        let read = assembler.read(0, 2, None, None).await.unwrap();
        assert_eq!(read, volume.swap_yx());
    }

    #[tokio::test]
    async fn test_transposed_chunked_read() {
        let dir = TempDir::new().unwrap();
        let group = ZarrGroup::create(dir.path().join("in.zarr")).await.unwrap();
        let volume = coded_volume([4, 5, 7], 1);
        let array = group
            .create_array(
                "0",
                volume.shape(),
                ChunkShape::cubic(2).unwrap(),
                DataType::U16,
                CompressionMethod::Blosc,
                CompressionLevel::default(),
            )
            .unwrap();
        array
            .write_region(&Region::full(volume.shape()), volume.clone())
            .await
            .unwrap();
        array.commit().await.unwrap();

        // Chunked segments cost nothing against the cache limit
        let mut assembler = VolumeAssembler::open(group.path(), true, 2).await.unwrap();
        assert_eq!(assembler.shape(), [4, 7, 5]);
        assert_eq!(assembler.segments()[0].format, FormatTag::Zarr);
        assert_eq!(assembler.segments()[0].estimated_bytes, 0);

        let read = assembler
            .read(1, 3, Some(2..6), Some(1..4))
            .await
            .unwrap();
        let expected = volume
            .swap_yx()
            .slice(&Region::new([1, 2, 1], [3, 6, 4]))
            .unwrap();
        assert_eq!(read, expected);
        assert_eq!(assembler.cached_segments(), vec![0]);
    }

    #[tokio::test]
    async fn test_mismatched_segments() {
        let dir = TempDir::new().unwrap();
        write_npy(&dir.path().join("a.npy"), &coded_volume([1, 6, 5], 0));
        write_npy(&dir.path().join("b.npy"), &coded_volume([1, 6, 4], 0));
        assert!(matches!(
            VolumeAssembler::open(dir.path(), false, 1 << 30).await,
            Err(PyramidError::ShapeMismatch { .. })
        ));

        let dir = TempDir::new().unwrap();
        write_npy(&dir.path().join("a.npy"), &coded_volume([1, 6, 5], 0));
        write_npy(
            &dir.path().join("b.npy"),
            &VolumeArray::zeros(DataType::F32, [1, 6, 5]),
        );
        assert!(matches!(
            VolumeAssembler::open(dir.path(), false, 1 << 30).await,
            Err(PyramidError::DtypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_discovery_rules() {
        let dir = TempDir::new().unwrap();
        write_npy(&dir.path().join("b.npy"), &coded_volume([1, 2, 2], 0));
        write_npy(&dir.path().join("a.npy"), &coded_volume([1, 2, 2], 0));
        std::fs::write(dir.path().join("notes.txt"), b"acquisition log").unwrap();

        let files = discover_segments(dir.path()).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.npy", "b.npy"]);

        let empty = TempDir::new().unwrap();
        assert!(matches!(
            discover_segments(empty.path()).await,
            Err(PyramidError::NotFound(_))
        ));
        assert!(matches!(
            discover_segments(&dir.path().join("notes.txt")).await,
            Err(PyramidError::Validation(_))
        ));
        assert!(matches!(
            discover_segments(&dir.path().join("missing.tif")).await,
            Err(PyramidError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_failure_names_file() {
        let dir = TempDir::new().unwrap();
        write_npy(&dir.path().join("a.npy"), &coded_volume([1, 2, 2], 0));
        std::fs::write(dir.path().join("b.npy"), b"garbage").unwrap();

        match VolumeAssembler::open(dir.path(), false, 1 << 30).await {
            Err(PyramidError::Segment { path, .. }) => assert!(path.ends_with("b.npy")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_reads() {
        let dir = TempDir::new().unwrap();
        three_segments(&dir);
        let mut assembler = VolumeAssembler::open(dir.path(), false, 1 << 30).await.unwrap();
        assert!(matches!(
            assembler.read(0, 7, None, None).await,
            Err(PyramidError::OutOfBounds(_))
        ));
        assert!(matches!(
            assembler.read(3, 3, None, None).await,
            Err(PyramidError::Validation(_))
        ));
    }

    #[test]
    fn test_volume_name() {
        assert_eq!(volume_name(Path::new("/data/brain.nii.gz")), "brain");
        assert_eq!(volume_name(Path::new("/data/scan.zarr")), "scan");
        assert_eq!(volume_name(Path::new("/data/stack.tif")), "stack");
        assert_eq!(volume_name(Path::new("/data/slices")), "slices");
    }
}
