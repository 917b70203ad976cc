//! OME-Zarr pyramid writer
//!
//! Level 0 holds the volume at its full-resolution shape and every further
//! level is `downscale_factor` times smaller along each axis than the one
//! before it. Levels are produced in order with a separable two-pass resize:
//! every Z-chunk of the input is resized in XY into a temporary buffer, then
//! every Y-chunk of that buffer is resized in XZ into the output level. The
//! temporary buffer lives on the heap when it is small enough and in a `temp`
//! dataset of the output group otherwise.
//!
//! A level becomes visible when its `.zarray` descriptor is written after its
//! last chunk, so a rerun skips levels that were completed and redoes one that
//! was interrupted.

use crate::array::VolumeArray;
use crate::assembler::VolumeAssembler;
use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{PyramidError, Result};
use crate::layout::ChunkShape;
use crate::metadata::{Multiscale, MultiscaleAttributes};
use crate::resample::{InterpolationOrder, ResamplePool, DEFAULT_WORKERS};
use crate::store::{ZarrArray, ZarrGroup};
use crate::types::{DataType, Region};
use crate::utils::{format_bytes, GIB};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Dataset used to stage the XY pass when it does not fit in memory
const TEMP_DATASET: &str = "temp";

/// Default number of pyramid levels
pub const DEFAULT_LEVELS: usize = 5;

/// Default per-axis reduction between levels
pub const DEFAULT_DOWNSCALE_FACTOR: usize = 2;

/// Default edge of the cubic output chunks
pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// Default staging threshold, 64 GiB
pub const DEFAULT_MEMORY_THRESHOLD: u64 = 64 * GIB;

/// Anything the writer can read Z/Y/X regions from
#[async_trait]
pub trait VolumeSource: Send {
    fn shape(&self) -> [usize; 3];

    fn data_type(&self) -> DataType;

    async fn read_region(&mut self, region: &Region) -> Result<VolumeArray>;
}

#[async_trait]
impl VolumeSource for VolumeAssembler {
    fn shape(&self) -> [usize; 3] {
        VolumeAssembler::shape(self)
    }

    fn data_type(&self) -> DataType {
        VolumeAssembler::data_type(self)
    }

    async fn read_region(&mut self, region: &Region) -> Result<VolumeArray> {
        VolumeAssembler::read_region(self, region).await
    }
}

#[async_trait]
impl VolumeSource for ZarrArray {
    fn shape(&self) -> [usize; 3] {
        ZarrArray::shape(self)
    }

    fn data_type(&self) -> DataType {
        ZarrArray::data_type(self)
    }

    async fn read_region(&mut self, region: &Region) -> Result<VolumeArray> {
        ZarrArray::read_region(self, region).await
    }
}

/// Pyramid geometry and resources
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidConfig {
    /// Shape of level 0
    pub full_res_shape: [usize; 3],

    pub levels: usize,

    pub downscale_factor: usize,

    /// Edge of the cubic chunks of every level
    pub chunk_size: usize,

    /// Temp buffers larger than half of this many bytes are staged on disk
    pub memory_threshold: u64,

    pub order: InterpolationOrder,

    pub compression: CompressionMethod,

    pub compression_level: CompressionLevel,

    /// Threads in the resampling pool
    pub workers: usize,
}

impl PyramidConfig {
    pub fn new(full_res_shape: [usize; 3]) -> Self {
        Self {
            full_res_shape,
            levels: DEFAULT_LEVELS,
            downscale_factor: DEFAULT_DOWNSCALE_FACTOR,
            chunk_size: DEFAULT_CHUNK_SIZE,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            order: InterpolationOrder::default(),
            compression: CompressionMethod::None,
            compression_level: CompressionLevel::default(),
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_levels(mut self, levels: usize) -> Self {
        self.levels = levels;
        self
    }

    pub fn with_downscale_factor(mut self, factor: usize) -> Self {
        self.downscale_factor = factor;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_memory_threshold(mut self, bytes: u64) -> Self {
        self.memory_threshold = bytes;
        self
    }

    pub fn with_order(mut self, order: InterpolationOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod, level: CompressionLevel) -> Self {
        self.compression = method;
        self.compression_level = level;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Shape of every level, level 0 first
    pub fn level_shapes(&self) -> Result<Vec<[usize; 3]>> {
        if self.levels == 0 {
            return Err(PyramidError::Validation(
                "At least one pyramid level is required".to_string(),
            ));
        }
        if self.downscale_factor < 2 {
            return Err(PyramidError::Validation(format!(
                "Downscale factor must be at least 2, got {}",
                self.downscale_factor
            )));
        }

        let mut shapes = Vec::with_capacity(self.levels);
        let mut shape = self.full_res_shape;
        for level in 0..self.levels {
            if level > 0 {
                shape = shape.map(|extent| extent / self.downscale_factor);
            }
            if shape.contains(&0) {
                return Err(PyramidError::Validation(format!(
                    "Level {} would have shape {:?}; reduce the number of levels",
                    level, shape
                )));
            }
            shapes.push(shape);
        }
        Ok(shapes)
    }
}

/// Levels produced and levels found already committed by one `write`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub written: Vec<usize>,
    pub skipped: Vec<usize>,
}

/// Intermediate `(current_z, target_y, target_x)` volume between the passes
enum TempBuffer {
    Heap(VolumeArray),
    Disk(ZarrArray),
}

impl TempBuffer {
    async fn allocate(
        group: &ZarrGroup,
        shape: [usize; 3],
        data_type: DataType,
        config: &PyramidConfig,
    ) -> Result<Self> {
        let estimate = shape.iter().product::<usize>() as u64
            * data_type.size_in_bytes() as u64
            * 2;

        // Leftovers from an interrupted run
        group.remove(TEMP_DATASET).await?;

        if estimate > config.memory_threshold {
            info!(
                "Staging temp buffer {:?} on disk ({} estimated)",
                shape,
                format_bytes(estimate as usize)
            );
            let array = group
                .create_array(
                    TEMP_DATASET,
                    shape,
                    ChunkShape::cubic(config.chunk_size)?,
                    data_type,
                    CompressionMethod::None,
                    CompressionLevel::default(),
                )?;
            Ok(TempBuffer::Disk(array))
        } else {
            debug!("Keeping temp buffer {:?} in memory", shape);
            Ok(TempBuffer::Heap(VolumeArray::zeros(data_type, shape)))
        }
    }

    fn is_on_disk(&self) -> bool {
        matches!(self, TempBuffer::Disk(_))
    }

    async fn write(&mut self, region: &Region, data: VolumeArray) -> Result<()> {
        match self {
            TempBuffer::Heap(array) => array.assign(region, &data, &Region::full(data.shape())),
            TempBuffer::Disk(array) => array.write_region(region, data).await,
        }
    }

    async fn read(&self, region: &Region) -> Result<VolumeArray> {
        match self {
            TempBuffer::Heap(array) => array.slice(region),
            TempBuffer::Disk(array) => array.read_region(region).await,
        }
    }

    async fn release(self, group: &ZarrGroup) -> Result<()> {
        if self.is_on_disk() {
            info!("Cleaning temp dataset");
            group.remove(TEMP_DATASET).await?;
        }
        Ok(())
    }
}

/// Resizes one level into the next
#[derive(Debug, Clone)]
struct LevelResizer {
    config: PyramidConfig,
    pool: ResamplePool,
}

impl LevelResizer {
    /// Copy `input` chunk row by chunk row when no resampling is needed
    async fn copy<S: VolumeSource + ?Sized>(&self, input: &mut S, output: &ZarrArray) -> Result<()> {
        let shape = output.shape();
        for z0 in (0..shape[0]).step_by(self.config.chunk_size) {
            let z1 = (z0 + self.config.chunk_size).min(shape[0]);
            let region = Region::z_slab(shape, z0, z1);
            let block = input.read_region(&region).await?;
            debug!("Copying volume z: {} - {}", z0, z1);
            output.write_region(&region, block).await?;
        }
        Ok(())
    }

    async fn two_pass<S: VolumeSource + ?Sized>(
        &self,
        input: &mut S,
        group: &ZarrGroup,
        output: &ZarrArray,
    ) -> Result<()> {
        let input_shape = input.shape();
        let [target_z, target_y, target_x] = output.shape();
        let chunk = self.config.chunk_size;
        let order = self.config.order;

        let temp_shape = [input_shape[0], target_y, target_x];
        let mut temp = TempBuffer::allocate(group, temp_shape, output.data_type(), &self.config).await?;

        for z0 in (0..input_shape[0]).step_by(chunk) {
            let z1 = (z0 + chunk).min(input_shape[0]);
            let block = input.read_region(&Region::z_slab(input_shape, z0, z1)).await?;
            let resized = self.pool.resize_xy(block, [target_y, target_x], order).await?;
            debug!("Writing volume to temp z: {} - {}", z0, z1);
            temp.write(&Region::z_slab(temp_shape, z0, z1), resized)
                .await?;
        }

        for y0 in (0..target_y).step_by(chunk) {
            let y1 = (y0 + chunk).min(target_y);
            let block = temp.read(&Region::y_slab(temp_shape, y0, y1)).await?;
            let resized = self.pool.resize_xz(block, [target_z, target_x], order).await?;
            debug!("Writing volume to level y: {} - {}", y0, y1);
            output
                .write_region(&Region::y_slab(output.shape(), y0, y1), resized)
                .await?;
        }

        temp.release(group).await
    }
}

/// Writes a multiscale pyramid of `source` to `<output>/<name>_ome.zarr`
pub struct PyramidWriter<S> {
    source: S,
    ome_path: PathBuf,
    name: String,
    level_shapes: Vec<[usize; 3]>,
    resizer: LevelResizer,
}

impl<S> std::fmt::Debug for PyramidWriter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyramidWriter")
            .field("ome_path", &self.ome_path)
            .field("name", &self.name)
            .field("level_shapes", &self.level_shapes)
            .field("config", &self.resizer.config)
            .finish()
    }
}

impl<S: VolumeSource> PyramidWriter<S> {
    /// Validate the pyramid geometry and prepare the resampling pool.
    /// Nothing is written until [`PyramidWriter::write`].
    pub fn create(
        source: S,
        output_path: impl AsRef<Path>,
        name: impl Into<String>,
        config: PyramidConfig,
    ) -> Result<Self> {
        let name = name.into();
        let level_shapes = config.level_shapes()?;
        ChunkShape::cubic(config.chunk_size)?;
        let ome_path = output_path.as_ref().join(format!("{}_ome.zarr", name));
        let pool = ResamplePool::new(config.workers)?;

        info!("Initialized pyramid writer with output: {}", ome_path.display());
        Ok(Self {
            source,
            ome_path,
            name,
            level_shapes,
            resizer: LevelResizer { config, pool },
        })
    }

    pub fn ome_path(&self) -> &Path {
        &self.ome_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PyramidConfig {
        &self.resizer.config
    }

    /// Planned shape of every level
    pub fn level_shapes(&self) -> &[[usize; 3]] {
        &self.level_shapes
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Produce every missing level, then the multiscale descriptor
    pub async fn write(&mut self) -> Result<WriteSummary> {
        info!("Starting write process to {}", self.ome_path.display());
        let group = ZarrGroup::create(&self.ome_path).await?;
        let config = &self.resizer.config;
        let data_type = self.source.data_type();
        let mut summary = WriteSummary::default();

        for (level, &target) in self.level_shapes.iter().enumerate() {
            let name = level.to_string();
            if group.contains_array(&name).await? {
                info!("Level {} already exists, skipping", level);
                summary.skipped.push(level);
                continue;
            }

            // Chunks without a descriptor are from an interrupted run
            group.remove(&name).await?;

            info!("Processing level {}", level);
            let output = group
                .create_array(
                    &name,
                    target,
                    ChunkShape::cubic(config.chunk_size)?,
                    data_type,
                    config.compression,
                    config.compression_level,
                )?;

            if level == 0 {
                let current = self.source.shape();
                info!("Resizing level 0 from shape {:?} to {:?}", current, target);
                if current == target {
                    debug!("Level 0 matches the source shape, copying chunks");
                    self.resizer.copy(&mut self.source, &output).await?;
                } else {
                    self.resizer
                        .two_pass(&mut self.source, &group, &output)
                        .await?;
                }
            } else {
                let mut previous = group.open_array(&(level - 1).to_string()).await?;
                info!(
                    "Resizing level {} from shape {:?} to {:?}",
                    level,
                    previous.shape(),
                    target
                );
                self.resizer.two_pass(&mut previous, &group, &output).await?;
            }

            output.commit().await?;
            summary.written.push(level);
        }

        info!("Writing OME-Zarr multiscale metadata");
        let attributes = MultiscaleAttributes {
            multiscales: vec![Multiscale::new(
                self.name.clone(),
                self.level_shapes.len(),
                config.downscale_factor,
            )],
        };
        group.write_attributes(&attributes).await?;

        info!("Write process complete");
        Ok(summary)
    }
}
