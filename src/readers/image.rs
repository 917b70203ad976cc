//! PNG/JPEG slices through the generic image decoder, converted to grayscale

use crate::array::VolumeArray;
use crate::error::{PyramidError, Result};
use crate::types::DataType;
use ::image::{ColorType, DynamicImage, ImageDecoder, ImageReader};
use ndarray::Array3;
use std::path::Path;

/// Element type a decoded image of `color` is reduced to
fn luma_type(color: ColorType) -> DataType {
    match color {
        ColorType::L16 | ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16 => DataType::U16,
        ColorType::Rgb32F | ColorType::Rgba32F => DataType::F32,
        _ => DataType::U8,
    }
}

fn reader(path: &Path) -> Result<ImageReader<std::io::BufReader<std::fs::File>>> {
    ImageReader::open(path)
        .map_err(|e| PyramidError::file_io(path, e))?
        .with_guessed_format()
        .map_err(|e| PyramidError::file_io(path, e))
}

pub(super) fn probe(path: &Path) -> Result<([usize; 3], DataType)> {
    let decoder = reader(path)?.into_decoder()?;
    let (width, height) = decoder.dimensions();
    Ok((
        [1, height as usize, width as usize],
        luma_type(decoder.color_type()),
    ))
}

pub(super) fn load(path: &Path) -> Result<VolumeArray> {
    let image = reader(path)?.decode()?;
    let shape = [1, image.height() as usize, image.width() as usize];

    let array = match luma_type(image.color()) {
        DataType::U16 => to_volume(path, shape, image.to_luma16().into_raw())?,
        DataType::F32 => to_volume(path, shape, image.to_luma32f().into_raw())?,
        _ => match image {
            DynamicImage::ImageLuma8(gray) => to_volume(path, shape, gray.into_raw())?,
            other => to_volume(path, shape, other.to_luma8().into_raw())?,
        },
    };
    Ok(array)
}

fn to_volume<T: crate::array::Element>(
    path: &Path,
    shape: [usize; 3],
    values: Vec<T>,
) -> Result<VolumeArray> {
    let array = Array3::from_shape_vec(shape, values)
        .map_err(|e| PyramidError::invalid_format(path, e.to_string()))?;
    Ok(VolumeArray::from(array))
}
