//! Core data types: element types and 3D regions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element types a volume can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// Signed 8-bit integer
    I8 = 5,
    /// Signed 16-bit integer
    I16 = 6,
    /// Signed 32-bit integer
    I32 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    fn kind_char(&self) -> char {
        match self {
            DataType::U8 | DataType::U16 | DataType::U32 | DataType::U64 => 'u',
            DataType::I8 | DataType::I16 | DataType::I32 | DataType::I64 => 'i',
            DataType::F32 | DataType::F64 => 'f',
        }
    }

    /// Encode as a NumPy type string in native byte order, e.g. `<u2`
    pub fn to_typestr(&self) -> String {
        let order = if self.size_in_bytes() == 1 {
            '|'
        } else if cfg!(target_endian = "little") {
            '<'
        } else {
            '>'
        };
        format!("{}{}{}", order, self.kind_char(), self.size_in_bytes())
    }

    /// Parse a NumPy type string such as `<u2`, `|u1` or `>f4`.
    ///
    /// Returns the data type and whether the stored bytes must be swapped
    /// to reach native byte order.
    pub fn from_typestr(typestr: &str) -> Option<(Self, bool)> {
        let mut chars = typestr.chars();
        let order = chars.next()?;
        let kind = chars.next()?;
        let size: usize = chars.as_str().parse().ok()?;

        let data_type = match (kind, size) {
            ('u', 1) | ('b', 1) => DataType::U8,
            ('u', 2) => DataType::U16,
            ('u', 4) => DataType::U32,
            ('u', 8) => DataType::U64,
            ('i', 1) => DataType::I8,
            ('i', 2) => DataType::I16,
            ('i', 4) => DataType::I32,
            ('i', 8) => DataType::I64,
            ('f', 4) => DataType::F32,
            ('f', 8) => DataType::F64,
            _ => return None,
        };

        let swap = match order {
            '<' => cfg!(target_endian = "big") && size > 1,
            '>' => cfg!(target_endian = "little") && size > 1,
            '|' | '=' => false,
            _ => return None,
        };

        Some((data_type, swap))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
            DataType::I8 => "int8",
            DataType::I16 => "int16",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Half-open box `[start, end)` in (z, y, x) voxel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub start: [usize; 3],
    pub end: [usize; 3],
}

impl Region {
    pub fn new(start: [usize; 3], end: [usize; 3]) -> Self {
        Self { start, end }
    }

    /// Region covering a whole array of the given shape
    pub fn full(shape: [usize; 3]) -> Self {
        Self::new([0, 0, 0], shape)
    }

    /// Full-extent Y/X region restricted to `z0..z1`
    pub fn z_slab(shape: [usize; 3], z0: usize, z1: usize) -> Self {
        Self::new([z0, 0, 0], [z1, shape[1], shape[2]])
    }

    /// Full-extent Z/X region restricted to `y0..y1`
    pub fn y_slab(shape: [usize; 3], y0: usize, y1: usize) -> Self {
        Self::new([0, y0, 0], [shape[0], y1, shape[2]])
    }

    /// Extent along each axis
    pub fn shape(&self) -> [usize; 3] {
        [
            self.end[0].saturating_sub(self.start[0]),
            self.end[1].saturating_sub(self.start[1]),
            self.end[2].saturating_sub(self.start[2]),
        ]
    }

    pub fn num_voxels(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.num_voxels() == 0
    }

    /// Check whether the region is non-inverted and inside an array of `shape`
    pub fn fits_within(&self, shape: [usize; 3]) -> bool {
        (0..3).all(|axis| self.start[axis] <= self.end[axis] && self.end[axis] <= shape[axis])
    }

    /// Same box with the Y and X axes exchanged
    pub fn swap_yx(&self) -> Region {
        Region::new(
            [self.start[0], self.start[2], self.start[1]],
            [self.end[0], self.end[2], self.end[1]],
        )
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "z: {} - {}, y: {} - {}, x: {} - {}",
            self.start[0], self.end[0], self.start[1], self.end[1], self.start[2], self.end[2]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::U8.size_in_bytes(), 1);
        assert_eq!(DataType::U16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F64.size_in_bytes(), 8);
    }

    #[test]
    fn test_typestr_parsing() {
        assert_eq!(DataType::from_typestr("|u1"), Some((DataType::U8, false)));
        assert_eq!(DataType::from_typestr("|i1"), Some((DataType::I8, false)));

        let (data_type, swap) = DataType::from_typestr("<u2").unwrap();
        assert_eq!(data_type, DataType::U16);
        assert_eq!(swap, cfg!(target_endian = "big"));

        let (data_type, swap) = DataType::from_typestr(">f4").unwrap();
        assert_eq!(data_type, DataType::F32);
        assert_eq!(swap, cfg!(target_endian = "little"));

        assert_eq!(DataType::from_typestr("<c8"), None);
        assert_eq!(DataType::from_typestr("u2"), None);
    }

    #[test]
    fn test_typestr_native_round_trip() {
        for data_type in [DataType::U8, DataType::I16, DataType::U32, DataType::F64] {
            let (parsed, swap) = DataType::from_typestr(&data_type.to_typestr()).unwrap();
            assert_eq!(parsed, data_type);
            assert!(!swap);
        }
    }

    #[test]
    fn test_region_helpers() {
        let shape = [64, 256, 128];
        let slab = Region::z_slab(shape, 8, 16);
        assert_eq!(slab.shape(), [8, 256, 128]);
        assert!(slab.fits_within(shape));
        assert!(!Region::z_slab(shape, 60, 70).fits_within(shape));

        let rows = Region::y_slab(shape, 32, 40);
        assert_eq!(rows.shape(), [64, 8, 128]);
        assert_eq!(rows.swap_yx().shape(), [64, 128, 8]);

        assert!(Region::new([3, 0, 0], [3, 5, 5]).is_empty());
        assert!(!Region::new([4, 0, 0], [3, 5, 5]).fits_within(shape));
    }
}
