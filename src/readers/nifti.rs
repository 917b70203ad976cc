//! NIfTI-1 volumes (`.nii` and gzip-compressed `.nii.gz`)
//!
//! Voxels are stored with X varying fastest, so the raw payload is already a
//! C-ordered `(z, y, x)` array. Intensity scaling (`scl_slope`/`scl_inter`)
//! is not applied; values are passed through in their stored type.

use crate::array::VolumeArray;
use crate::error::{PyramidError, Result};
use crate::types::DataType;
use flate2::read::GzDecoder;
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const HEADER_SIZE: usize = 348;
const MIN_VOX_OFFSET: usize = 352;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NiftiHeader {
    shape: [usize; 3],
    data_type: DataType,
    vox_offset: usize,
    swap: bool,
}

impl NiftiHeader {
    fn payload_len(&self) -> usize {
        self.shape.iter().product::<usize>() * self.data_type.size_in_bytes()
    }
}

struct HeaderReader<'a> {
    bytes: &'a [u8],
    little_endian: bool,
}

impl HeaderReader<'_> {
    fn i16_at(&self, offset: usize) -> i16 {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&self.bytes[offset..offset + 2]);
        if self.little_endian {
            i16::from_le_bytes(raw)
        } else {
            i16::from_be_bytes(raw)
        }
    }

    fn f32_at(&self, offset: usize) -> f32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        if self.little_endian {
            f32::from_le_bytes(raw)
        } else {
            f32::from_be_bytes(raw)
        }
    }
}

fn parse_header(path: &Path, bytes: &[u8]) -> Result<NiftiHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(PyramidError::invalid_format(path, "truncated NIfTI header"));
    }

    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[0..4]);
    // sizeof_hdr doubles as the byte order marker
    let little_endian = if i32::from_le_bytes(raw) == HEADER_SIZE as i32 {
        true
    } else if i32::from_be_bytes(raw) == HEADER_SIZE as i32 {
        false
    } else {
        return Err(PyramidError::invalid_format(path, "not a NIfTI-1 header"));
    };

    match &bytes[344..347] {
        b"n+1" => {}
        b"ni1" => {
            return Err(PyramidError::invalid_format(
                path,
                "header/image file pairs are not supported",
            ))
        }
        _ => return Err(PyramidError::invalid_format(path, "bad NIfTI magic")),
    }

    let header = HeaderReader {
        bytes,
        little_endian,
    };

    let ndim = header.i16_at(40);
    if !(2..=3).contains(&ndim) {
        return Err(PyramidError::invalid_format(
            path,
            format!("unsupported NIfTI dimensionality {}", ndim),
        ));
    }
    let nx = header.i16_at(42);
    let ny = header.i16_at(44);
    let nz = if ndim == 3 { header.i16_at(46) } else { 1 };
    if nx <= 0 || ny <= 0 || nz <= 0 {
        return Err(PyramidError::invalid_format(
            path,
            format!("invalid NIfTI dimensions {} x {} x {}", nx, ny, nz),
        ));
    }

    let code = header.i16_at(70);
    let data_type = match code {
        2 => DataType::U8,
        4 => DataType::I16,
        8 => DataType::I32,
        16 => DataType::F32,
        64 => DataType::F64,
        256 => DataType::I8,
        512 => DataType::U16,
        768 => DataType::U32,
        1024 => DataType::I64,
        1280 => DataType::U64,
        _ => {
            return Err(PyramidError::invalid_format(
                path,
                format!("unsupported NIfTI datatype code {}", code),
            ))
        }
    };

    let vox_offset = (header.f32_at(108).max(0.0) as usize).max(MIN_VOX_OFFSET);

    Ok(NiftiHeader {
        shape: [nz as usize, ny as usize, nx as usize],
        data_type,
        vox_offset,
        swap: little_endian != cfg!(target_endian = "little"),
    })
}

fn is_gzip(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| PyramidError::file_io(path, e))?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(_) => Ok(false),
    }
}

pub(super) fn probe(path: &Path) -> Result<([usize; 3], DataType)> {
    let file = File::open(path).map_err(|e| PyramidError::file_io(path, e))?;
    let mut bytes = Vec::with_capacity(HEADER_SIZE);
    let read = if is_gzip(path)? {
        GzDecoder::new(file)
            .take(HEADER_SIZE as u64)
            .read_to_end(&mut bytes)
    } else {
        file.take(HEADER_SIZE as u64).read_to_end(&mut bytes)
    };
    read.map_err(|e| PyramidError::file_io(path, e))?;

    let header = parse_header(path, &bytes)?;
    Ok((header.shape, header.data_type))
}

pub(super) fn load(path: &Path) -> Result<VolumeArray> {
    let file = File::open(path).map_err(|e| PyramidError::file_io(path, e))?;

    if is_gzip(path)? {
        let mut bytes = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut bytes)
            .map_err(|e| PyramidError::file_io(path, e))?;
        return decode(path, &bytes);
    }

    // The map is dropped before this function returns and the file is only read.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| PyramidError::file_io(path, e))?;
    decode(path, &mmap)
}

fn decode(path: &Path, bytes: &[u8]) -> Result<VolumeArray> {
    let header = parse_header(path, bytes)?;
    let end = header.vox_offset + header.payload_len();
    if bytes.len() < end {
        return Err(PyramidError::invalid_format(
            path,
            format!(
                "voxel data truncated: need {} bytes, file has {}",
                end,
                bytes.len()
            ),
        ));
    }
    VolumeArray::from_bytes(
        header.data_type,
        header.shape,
        &bytes[header.vox_offset..end],
        header.swap,
    )
}
