//! NumPy `.npy` arrays (format versions 1 to 3)

use super::shape_to_3d;
use crate::array::VolumeArray;
use crate::error::{PyramidError, Result};
use crate::types::DataType;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const MAGIC: &[u8] = b"\x93NUMPY";

#[derive(Debug, Clone, PartialEq, Eq)]
struct NpyHeader {
    shape: [usize; 3],
    data_type: DataType,
    swap: bool,
    fortran_order: bool,
    data_offset: usize,
}

/// Length of the preamble plus header dictionary, read from the first bytes
fn header_end(path: &Path, prefix: &[u8]) -> Result<(usize, usize)> {
    if prefix.len() < 10 || &prefix[..6] != MAGIC {
        return Err(PyramidError::invalid_format(path, "missing NPY magic"));
    }
    match prefix[6] {
        1 => {
            let len = u16::from_le_bytes([prefix[8], prefix[9]]) as usize;
            Ok((10, 10 + len))
        }
        2 | 3 => {
            if prefix.len() < 12 {
                return Err(PyramidError::invalid_format(path, "truncated NPY header"));
            }
            let len = u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]) as usize;
            Ok((12, 12 + len))
        }
        major => Err(PyramidError::invalid_format(
            path,
            format!("unsupported NPY version {}", major),
        )),
    }
}

/// Value of `'key':` in the header dictionary, up to the next top-level comma
fn dict_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{}':", key);
    let start = header.find(&pattern)? + pattern.len();
    let rest = header[start..].trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')')? + 1
    } else {
        rest.find([',', '}']).unwrap_or(rest.len())
    };
    Some(rest[..end].trim())
}

fn parse_header(path: &Path, bytes: &[u8]) -> Result<NpyHeader> {
    let (dict_start, data_offset) = header_end(path, bytes)?;
    if bytes.len() < data_offset {
        return Err(PyramidError::invalid_format(path, "truncated NPY header"));
    }
    let header = std::str::from_utf8(&bytes[dict_start..data_offset])
        .map_err(|_| PyramidError::invalid_format(path, "NPY header is not text"))?;

    let descr = dict_value(header, "descr")
        .map(|v| v.trim_matches(|c| c == '\'' || c == '"'))
        .ok_or_else(|| PyramidError::invalid_format(path, "NPY header lacks 'descr'"))?;
    let (data_type, swap) = DataType::from_typestr(descr).ok_or_else(|| {
        PyramidError::invalid_format(path, format!("unsupported NPY dtype {}", descr))
    })?;

    let fortran_order = match dict_value(header, "fortran_order") {
        Some("True") => true,
        Some("False") => false,
        _ => {
            return Err(PyramidError::invalid_format(
                path,
                "NPY header lacks 'fortran_order'",
            ))
        }
    };

    let shape_text = dict_value(header, "shape")
        .ok_or_else(|| PyramidError::invalid_format(path, "NPY header lacks 'shape'"))?;
    let dims = shape_text
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| {
            d.trim_end_matches('L').parse::<usize>().map_err(|_| {
                PyramidError::invalid_format(path, format!("bad NPY shape {}", shape_text))
            })
        })
        .collect::<Result<Vec<usize>>>()?;

    Ok(NpyHeader {
        shape: shape_to_3d(path, &dims)?,
        data_type,
        swap,
        fortran_order,
        data_offset,
    })
}

pub(super) fn probe(path: &Path) -> Result<([usize; 3], DataType)> {
    let mut file = File::open(path).map_err(|e| PyramidError::file_io(path, e))?;
    let mut prefix = [0u8; 12];
    file.read_exact(&mut prefix)
        .map_err(|_| PyramidError::invalid_format(path, "file too small for NPY"))?;

    let (_, data_offset) = header_end(path, &prefix)?;
    let mut bytes = prefix.to_vec();
    bytes.resize(data_offset.max(prefix.len()), 0);
    file.read_exact(&mut bytes[prefix.len()..])
        .map_err(|e| PyramidError::file_io(path, e))?;

    let header = parse_header(path, &bytes)?;
    Ok((header.shape, header.data_type))
}

pub(super) fn load(path: &Path) -> Result<VolumeArray> {
    let bytes = std::fs::read(path).map_err(|e| PyramidError::file_io(path, e))?;
    let header = parse_header(path, &bytes)?;

    let len = header.shape.iter().product::<usize>() * header.data_type.size_in_bytes();
    let payload = bytes
        .get(header.data_offset..header.data_offset + len)
        .ok_or_else(|| PyramidError::invalid_format(path, "NPY payload truncated"))?;

    if header.fortran_order {
        let [z, y, x] = header.shape;
        let array = VolumeArray::from_bytes(header.data_type, [x, y, z], payload, header.swap)?;
        Ok(array.reversed_axes())
    } else {
        VolumeArray::from_bytes(header.data_type, header.shape, payload, header.swap)
    }
}
