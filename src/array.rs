//! Dynamically typed 3D arrays
//!
//! Inputs arrive in whatever element type the source file uses, so the
//! assembler, the chunk store and the pyramid writer pass arrays around as
//! [`VolumeArray`], a tagged union over `ndarray::Array3<T>`. Code that needs
//! the concrete element type is written once against [`Element`] and reached
//! through the [`dispatch!`] and [`with_element!`] macros.

use crate::error::{PyramidError, Result};
use crate::types::{DataType, Region};
use ndarray::{concatenate, s, Array3, ArrayView3, Axis};
use num_traits::{Bounded, NumCast, ToPrimitive};

/// Scalar types that can be stored in a volume
pub trait Element:
    bytemuck::Pod
    + Default
    + PartialEq
    + Send
    + Sync
    + NumCast
    + Bounded
    + ToPrimitive
    + zarrs::array::ElementOwned
    + 'static
{
    const DATA_TYPE: DataType;

    fn wrap(array: Array3<Self>) -> VolumeArray;

    fn downcast(array: &VolumeArray) -> Option<&Array3<Self>>;

    /// Widen to `f64` for resampling
    fn to_sample(self) -> f64 {
        ToPrimitive::to_f64(&self).unwrap_or(0.0)
    }

    /// Narrow a resampled value back. Integers are rounded and saturated.
    fn from_sample(value: f64) -> Self {
        if Self::DATA_TYPE.is_float() {
            return NumCast::from(value).unwrap_or_default();
        }
        if value.is_nan() {
            return Self::default();
        }

        let rounded = value.round();
        if rounded <= Self::min_value().to_sample() {
            return Self::min_value();
        }
        if rounded >= Self::max_value().to_sample() {
            return Self::max_value();
        }
        NumCast::from(rounded).unwrap_or_default()
    }
}

/// 3D array in (z, y, x) order with a runtime element type
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeArray {
    U8(Array3<u8>),
    U16(Array3<u16>),
    U32(Array3<u32>),
    U64(Array3<u64>),
    I8(Array3<i8>),
    I16(Array3<i16>),
    I32(Array3<i32>),
    I64(Array3<i64>),
    F32(Array3<f32>),
    F64(Array3<f64>),
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {$(
        impl Element for $ty {
            const DATA_TYPE: DataType = DataType::$variant;

            fn wrap(array: Array3<Self>) -> VolumeArray {
                VolumeArray::$variant(array)
            }

            fn downcast(array: &VolumeArray) -> Option<&Array3<Self>> {
                match array {
                    VolumeArray::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    )*};
}

impl_element! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

/// Run `$body` with `$array` bound to the typed `Array3` inside a [`VolumeArray`]
macro_rules! dispatch {
    ($value:expr, $array:ident => $body:expr) => {
        match $value {
            $crate::array::VolumeArray::U8($array) => $body,
            $crate::array::VolumeArray::U16($array) => $body,
            $crate::array::VolumeArray::U32($array) => $body,
            $crate::array::VolumeArray::U64($array) => $body,
            $crate::array::VolumeArray::I8($array) => $body,
            $crate::array::VolumeArray::I16($array) => $body,
            $crate::array::VolumeArray::I32($array) => $body,
            $crate::array::VolumeArray::I64($array) => $body,
            $crate::array::VolumeArray::F32($array) => $body,
            $crate::array::VolumeArray::F64($array) => $body,
        }
    };
}

/// Run `$body` with the type alias `$ty` set to the Rust type of a [`DataType`]
macro_rules! with_element {
    ($data_type:expr, $ty:ident => $body:expr) => {
        match $data_type {
            $crate::types::DataType::U8 => {
                type $ty = u8;
                $body
            }
            $crate::types::DataType::U16 => {
                type $ty = u16;
                $body
            }
            $crate::types::DataType::U32 => {
                type $ty = u32;
                $body
            }
            $crate::types::DataType::U64 => {
                type $ty = u64;
                $body
            }
            $crate::types::DataType::I8 => {
                type $ty = i8;
                $body
            }
            $crate::types::DataType::I16 => {
                type $ty = i16;
                $body
            }
            $crate::types::DataType::I32 => {
                type $ty = i32;
                $body
            }
            $crate::types::DataType::I64 => {
                type $ty = i64;
                $body
            }
            $crate::types::DataType::F32 => {
                type $ty = f32;
                $body
            }
            $crate::types::DataType::F64 => {
                type $ty = f64;
                $body
            }
        }
    };
}

pub(crate) use dispatch;
pub(crate) use with_element;

impl<T: Element> From<Array3<T>> for VolumeArray {
    fn from(array: Array3<T>) -> Self {
        T::wrap(array)
    }
}

impl VolumeArray {
    /// Array of `shape` filled with zeros
    pub fn zeros(data_type: DataType, shape: [usize; 3]) -> Self {
        with_element!(data_type, T => T::wrap(Array3::from_elem(shape, T::default())))
    }

    /// Decode a C-ordered byte buffer
    ///
    /// `swap` reverses the bytes of every element, for buffers stored in
    /// the opposite byte order.
    pub fn from_bytes(
        data_type: DataType,
        shape: [usize; 3],
        bytes: &[u8],
        swap: bool,
    ) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * data_type.size_in_bytes();
        if bytes.len() != expected {
            return Err(PyramidError::Validation(format!(
                "Data size mismatch: expected {} bytes for shape {:?} ({}), got {}",
                expected,
                shape,
                data_type,
                bytes.len()
            )));
        }

        with_element!(data_type, T => decode_typed::<T>(shape, bytes, swap))
    }

    pub fn data_type(&self) -> DataType {
        dispatch!(self, array => element_type_of(array))
    }

    pub fn shape(&self) -> [usize; 3] {
        let (z, y, x) = dispatch!(self, array => array.dim());
        [z, y, x]
    }

    /// Borrow the typed array if the element type is `T`
    pub fn as_typed<T: Element>(&self) -> Option<&Array3<T>> {
        T::downcast(self)
    }

    /// Owned copy of a sub-region
    pub fn slice(&self, region: &Region) -> Result<VolumeArray> {
        if !region.fits_within(self.shape()) {
            return Err(PyramidError::OutOfBounds(format!(
                "Region {} outside array of shape {:?}",
                region,
                self.shape()
            )));
        }
        Ok(dispatch!(self, array => slice_typed(array, region)))
    }

    /// Copy `src_region` of `src` into `dst_region` of this array
    pub fn assign(
        &mut self,
        dst_region: &Region,
        src: &VolumeArray,
        src_region: &Region,
    ) -> Result<()> {
        if dst_region.shape() != src_region.shape() {
            return Err(PyramidError::Validation(format!(
                "Region shapes differ: {:?} vs {:?}",
                dst_region.shape(),
                src_region.shape()
            )));
        }
        if !dst_region.fits_within(self.shape()) || !src_region.fits_within(src.shape()) {
            return Err(PyramidError::OutOfBounds(format!(
                "Cannot copy {} into {}",
                src_region, dst_region
            )));
        }
        let dst_type = self.data_type();
        dispatch!(self, array => assign_typed(array, dst_region, dst_type, src, src_region))
    }

    /// Concatenate arrays along Z, keeping the given order
    pub fn concatenate_z(parts: Vec<VolumeArray>) -> Result<VolumeArray> {
        let mut parts = parts.into_iter();
        let first = parts
            .next()
            .ok_or_else(|| PyramidError::Validation("Nothing to concatenate".to_string()))?;
        let rest: Vec<VolumeArray> = parts.collect();
        if rest.is_empty() {
            return Ok(first);
        }
        dispatch!(&first, array => concatenate_typed(array, &rest))
    }

    /// Exchange the Y and X axes
    pub fn swap_yx(self) -> VolumeArray {
        dispatch!(self, array => {
            let swapped = array.permuted_axes([0, 2, 1]).as_standard_layout().into_owned();
            VolumeArray::from(swapped)
        })
    }

    /// Reverse the axis order, turning a column-major read into (z, y, x)
    pub fn reversed_axes(self) -> VolumeArray {
        dispatch!(self, array => {
            let reversed = array.reversed_axes().as_standard_layout().into_owned();
            VolumeArray::from(reversed)
        })
    }

    /// C-ordered native-endian bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        dispatch!(self, array => encode_typed(array))
    }
}

fn element_type_of<T: Element>(_array: &Array3<T>) -> DataType {
    T::DATA_TYPE
}

fn decode_typed<T: Element>(shape: [usize; 3], bytes: &[u8], swap: bool) -> Result<VolumeArray> {
    let size = std::mem::size_of::<T>();
    let values: Vec<T> = if swap {
        let mut scratch = [0u8; 8];
        bytes
            .chunks_exact(size)
            .map(|element| {
                scratch[..size].copy_from_slice(element);
                scratch[..size].reverse();
                bytemuck::pod_read_unaligned(&scratch[..size])
            })
            .collect()
    } else {
        bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    };

    let array = Array3::from_shape_vec(shape, values)
        .map_err(|e| PyramidError::Validation(e.to_string()))?;
    Ok(T::wrap(array))
}

fn encode_typed<T: Element>(array: &Array3<T>) -> Vec<u8> {
    let standard = array.as_standard_layout();
    match standard.as_slice() {
        Some(values) => bytemuck::cast_slice(values).to_vec(),
        None => standard
            .iter()
            .flat_map(|value| bytemuck::bytes_of(value).to_vec())
            .collect(),
    }
}

fn slice_typed<T: Element>(array: &Array3<T>, region: &Region) -> VolumeArray {
    let view = array.slice(s![
        region.start[0]..region.end[0],
        region.start[1]..region.end[1],
        region.start[2]..region.end[2]
    ]);
    T::wrap(view.to_owned())
}

fn assign_typed<T: Element>(
    dst: &mut Array3<T>,
    dst_region: &Region,
    dst_type: DataType,
    src: &VolumeArray,
    src_region: &Region,
) -> Result<()> {
    let src = T::downcast(src).ok_or_else(|| {
        PyramidError::Validation(format!(
            "Cannot copy {} data into {} array",
            src.data_type(),
            dst_type
        ))
    })?;

    let source = src.slice(s![
        src_region.start[0]..src_region.end[0],
        src_region.start[1]..src_region.end[1],
        src_region.start[2]..src_region.end[2]
    ]);
    dst.slice_mut(s![
        dst_region.start[0]..dst_region.end[0],
        dst_region.start[1]..dst_region.end[1],
        dst_region.start[2]..dst_region.end[2]
    ])
    .assign(&source);
    Ok(())
}

fn concatenate_typed<T: Element>(first: &Array3<T>, rest: &[VolumeArray]) -> Result<VolumeArray> {
    let mut views: Vec<ArrayView3<'_, T>> = Vec::with_capacity(rest.len() + 1);
    views.push(first.view());
    for part in rest {
        let typed = T::downcast(part).ok_or_else(|| {
            PyramidError::Validation(format!(
                "Cannot concatenate {} with {}",
                T::DATA_TYPE,
                part.data_type()
            ))
        })?;
        views.push(typed.view());
    }

    let joined =
        concatenate(Axis(0), &views).map_err(|e| PyramidError::Validation(e.to_string()))?;
    Ok(T::wrap(joined))
}
