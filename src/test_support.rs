//! Fixtures shared by unit tests

use crate::array::VolumeArray;
use ndarray::Array3;
use std::path::Path;

/// Write `array` as a version 1 C-ordered `.npy` file
pub(crate) fn write_npy(path: &Path, array: &VolumeArray) {
    let [z, y, x] = array.shape();
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': ({}, {}, {}), }}",
        array.data_type().to_typestr(),
        z,
        y,
        x
    )
    .into_bytes();
    while (10 + header.len() + 1) % 64 != 0 {
        header.push(b' ');
    }
    header.push(b'\n');

    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&array.to_bytes());
    std::fs::write(path, bytes).unwrap();
}

/// u16 volume whose voxel value encodes its position plus `offset`
pub(crate) fn coded_volume(shape: [usize; 3], offset: u16) -> VolumeArray {
    VolumeArray::from(Array3::from_shape_fn(shape, |(z, y, x)| {
        offset
            .wrapping_add((z * 1000) as u16)
            .wrapping_add((y * 37 + x) as u16)
    }))
}
