//! Single and multi-page grayscale TIFF stacks, one page per Z slice

use crate::array::VolumeArray;
use crate::error::{PyramidError, Result};
use crate::types::DataType;
use ::tiff::decoder::{Decoder, DecodingResult, Limits};
use ::tiff::tags::Tag;
use ::tiff::ColorType;
use ndarray::Array3;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

fn open(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path).map_err(|e| PyramidError::file_io(path, e))?;
    Ok(Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited()))
}

/// Height, width and element type of the current page
fn page_layout(
    path: &Path,
    decoder: &mut Decoder<BufReader<File>>,
) -> Result<([usize; 2], DataType)> {
    let (width, height) = decoder.dimensions()?;
    let bits = match decoder.colortype()? {
        ColorType::Gray(bits) => bits,
        other => {
            return Err(PyramidError::invalid_format(
                path,
                format!("only grayscale pages are supported, found {:?}", other),
            ))
        }
    };
    // SampleFormat: 1 unsigned, 2 signed, 3 float
    let sample_format = decoder.find_tag_unsigned::<u16>(Tag::SampleFormat)?.unwrap_or(1);

    let data_type = match (sample_format, bits) {
        (1, 8) => DataType::U8,
        (1, 16) => DataType::U16,
        (1, 32) => DataType::U32,
        (1, 64) => DataType::U64,
        (2, 8) => DataType::I8,
        (2, 16) => DataType::I16,
        (2, 32) => DataType::I32,
        (2, 64) => DataType::I64,
        (3, 32) => DataType::F32,
        (3, 64) => DataType::F64,
        _ => {
            return Err(PyramidError::invalid_format(
                path,
                format!("unsupported sample format {} with {} bits", sample_format, bits),
            ))
        }
    };

    Ok(([height as usize, width as usize], data_type))
}

pub(super) fn probe(path: &Path) -> Result<([usize; 3], DataType)> {
    let mut decoder = open(path)?;
    let (yx, data_type) = page_layout(path, &mut decoder)?;
    let mut pages = 1;

    while decoder.more_images() {
        decoder.next_image()?;
        let (page_yx, page_type) = page_layout(path, &mut decoder)?;
        if page_yx != yx || page_type != data_type {
            return Err(PyramidError::invalid_format(
                path,
                format!(
                    "inconsistent pages: page {} is {:?} {}, page 0 is {:?} {}",
                    pages, page_yx, page_type, yx, data_type
                ),
            ));
        }
        pages += 1;
    }

    Ok(([pages, yx[0], yx[1]], data_type))
}

pub(super) fn load(path: &Path) -> Result<VolumeArray> {
    let mut decoder = open(path)?;
    let mut pages = Vec::new();

    loop {
        let (yx, _) = page_layout(path, &mut decoder)?;
        let shape = [1, yx[0], yx[1]];
        let page = match decoder.read_image()? {
            DecodingResult::U8(values) => to_page(path, shape, values)?,
            DecodingResult::U16(values) => to_page(path, shape, values)?,
            DecodingResult::U32(values) => to_page(path, shape, values)?,
            DecodingResult::U64(values) => to_page(path, shape, values)?,
            DecodingResult::I8(values) => to_page(path, shape, values)?,
            DecodingResult::I16(values) => to_page(path, shape, values)?,
            DecodingResult::I32(values) => to_page(path, shape, values)?,
            DecodingResult::I64(values) => to_page(path, shape, values)?,
            DecodingResult::F32(values) => to_page(path, shape, values)?,
            DecodingResult::F64(values) => to_page(path, shape, values)?,
        };
        pages.push(page);

        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    VolumeArray::concatenate_z(pages).map_err(|e| {
        PyramidError::invalid_format(path, format!("inconsistent pages: {}", e))
    })
}

fn to_page<T: crate::array::Element>(
    path: &Path,
    shape: [usize; 3],
    values: Vec<T>,
) -> Result<VolumeArray> {
    let page = Array3::from_shape_vec(shape, values)
        .map_err(|e| PyramidError::invalid_format(path, e.to_string()))?;
    Ok(VolumeArray::from(page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::tiff::encoder::{colortype, TiffEncoder};
    use tempfile::TempDir;

    fn write_stack(path: &Path, pages: &[Vec<u16>], width: u32, height: u32) {
        let file = File::create(path).unwrap();
        let mut encoder = TiffEncoder::new(file).unwrap();
        for page in pages {
            encoder
                .write_image::<colortype::Gray16>(width, height, page)
                .unwrap();
        }
    }

    #[test]
    fn test_multi_page_stack() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stack.tif");
        let pages: Vec<Vec<u16>> = (0..3).map(|z| vec![z as u16 * 100; 4 * 5]).collect();
        write_stack(&path, &pages, 5, 4);

        assert_eq!(probe(&path).unwrap(), ([3, 4, 5], DataType::U16));

        let volume = load(&path).unwrap();
        let typed = volume.as_typed::<u16>().unwrap();
        assert_eq!(typed.dim(), (3, 4, 5));
        assert_eq!(typed[[2, 3, 4]], 200);
    }

    #[test]
    fn test_inconsistent_pages_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.tif");
        let file = File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(file).unwrap();
        encoder
            .write_image::<colortype::Gray16>(2, 2, &[0u16; 4])
            .unwrap();
        encoder
            .write_image::<colortype::Gray16>(3, 2, &[0u16; 6])
            .unwrap();

        assert!(matches!(
            probe(&path),
            Err(PyramidError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_rgb_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rgb.tif");
        let file = File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(file).unwrap();
        encoder
            .write_image::<colortype::RGB8>(2, 2, &[0u8; 12])
            .unwrap();

        assert!(probe(&path).is_err());
    }
}
