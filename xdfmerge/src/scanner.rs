//! Binary Scanner
//!
//! Decodes raw cells out of a firmware image. Cell `(r, c)` of a region lives
//! at bit offset `base + r * major_stride_bits + c * minor_stride_bits`.
//! Strides are signed and bit-granular; a zero stride re-reads the same bits.
//! No scaling is applied here: callers get the stored integers/floats.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parser::schema::DataType;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("bit offset {bit_offset} (+{width} bits) is outside the {image_bits}-bit image")]
    OutOfBounds {
        bit_offset: i64,
        width: u32,
        image_bits: u64,
    },
    #[error("unsupported datatype: {datatype} with {element_size_bits}-bit elements")]
    UnsupportedDatatype {
        element_size_bits: u32,
        datatype: String,
    },
    #[error("region at {address:#X} has no cells")]
    EmptyRegion { address: u32 },
}

/// XDF `BASEOFFSET`: how definition addresses map onto file offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BaseOffset {
    pub offset: u32,
    pub subtract: bool,
}

impl BaseOffset {
    /// File byte offset for a definition address; may be negative.
    pub fn file_offset(&self, address: u32) -> i64 {
        if self.subtract {
            i64::from(address) - i64::from(self.offset)
        } else {
            i64::from(address) + i64::from(self.offset)
        }
    }
}

/// A firmware dump held fully in memory. Never mutated.
#[derive(Debug, Clone)]
pub struct BinaryImage {
    bytes: Vec<u8>,
    base: BaseOffset,
}

impl BinaryImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            base: BaseOffset::default(),
        }
    }

    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::new(std::fs::read(path)?))
    }

    pub fn with_base_offset(mut self, base: BaseOffset) -> Self {
        self.base = base;
        self
    }

    pub fn base_offset(&self) -> BaseOffset {
        self.base
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn bit_len(&self) -> u64 {
        self.bytes.len() as u64 * 8
    }

    /// Single byte at a definition address.
    pub fn byte_at(&self, address: u32) -> Result<u8, ScanError> {
        let offset = self.base.file_offset(address);
        usize::try_from(offset)
            .ok()
            .and_then(|i| self.bytes.get(i).copied())
            .ok_or(ScanError::OutOfBounds {
                bit_offset: offset * 8,
                width: 8,
                image_bits: self.bit_len(),
            })
    }
}

/// What to decode and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanRequest {
    pub address: u32,
    pub element_size_bits: u32,
    pub major_stride_bits: i32,
    pub minor_stride_bits: i32,
    pub rows: u32,
    pub columns: u32,
    /// `None` when the source datatype was not recognised.
    pub datatype: Option<DataType>,
    pub lsb_first: bool,
}

impl ScanRequest {
    pub fn cells(&self) -> u64 {
        u64::from(self.rows) * u64::from(self.columns)
    }
}

/// Packed stride for `count` elements of `element_size_bits`, if it fits.
pub fn packed_stride(count: u32, element_size_bits: u32) -> Option<i32> {
    i32::try_from(count)
        .ok()?
        .checked_mul(i32::try_from(element_size_bits).ok()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawValue {
    Unsigned(u32),
    Signed(i32),
    Float(f32),
}

impl RawValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            RawValue::Unsigned(v) => f64::from(v),
            RawValue::Signed(v) => f64::from(v),
            RawValue::Float(v) => f64::from(v),
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Unsigned(v) => write!(f, "{}", v),
            RawValue::Signed(v) => write!(f, "{}", v),
            RawValue::Float(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    ExactMatch,
    PlausibleUnmatched,
    Ambiguous,
}

/// Decoded region handed to the reconciliation engine. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinaryRegion {
    pub address: u32,
    pub byte_length: u64,
    pub decoded_values: Vec<RawValue>,
    pub confidence: Confidence,
}

/// Decode exactly `rows * columns` cells, row-major in traversal order.
pub fn scan(image: &BinaryImage, request: &ScanRequest) -> Result<Vec<RawValue>, ScanError> {
    let width = request.element_size_bits;
    let datatype = match request.datatype {
        Some(dt) => dt,
        None => {
            return Err(ScanError::UnsupportedDatatype {
                element_size_bits: width,
                datatype: "unverified".to_string(),
            })
        }
    };
    let supported = match datatype {
        DataType::Unsigned | DataType::Signed => matches!(width, 8 | 16 | 32),
        DataType::Float => width == 32,
    };
    if !supported {
        return Err(ScanError::UnsupportedDatatype {
            element_size_bits: width,
            datatype: format!("{:?}", datatype).to_lowercase(),
        });
    }
    if request.cells() == 0 {
        return Err(ScanError::EmptyRegion {
            address: request.address,
        });
    }

    let image_bits = image.bit_len();
    let base = image.base.file_offset(request.address) * 8;

    // Offsets are linear in (r, c): the corner cells bound every other cell.
    let last_row = i128::from(request.rows - 1);
    let last_col = i128::from(request.columns - 1);
    for (r, c) in [(0, 0), (0, last_col), (last_row, 0), (last_row, last_col)] {
        let offset = i128::from(base)
            + r * i128::from(request.major_stride_bits)
            + c * i128::from(request.minor_stride_bits);
        if offset < 0 || offset + i128::from(width) > i128::from(image_bits) {
            let bit_offset = i64::try_from(offset).unwrap_or(if offset < 0 { i64::MIN } else { i64::MAX });
            return Err(ScanError::OutOfBounds {
                bit_offset,
                width,
                image_bits,
            });
        }
    }

    let major = i64::from(request.major_stride_bits);
    let minor = i64::from(request.minor_stride_bits);
    let capacity = request.cells().min(image_bits / u64::from(width));
    let mut values = Vec::with_capacity(usize::try_from(capacity).unwrap_or_default());
    for row in 0..i64::from(request.rows) {
        for col in 0..i64::from(request.columns) {
            let bit_offset = (base + row * major + col * minor) as u64;
            let raw = read_bits(&image.bytes, bit_offset, width, request.lsb_first);
            values.push(convert(raw, width, datatype));
        }
    }
    Ok(values)
}

/// [`scan`] wrapped into a [`BinaryRegion`].
pub fn scan_region(
    image: &BinaryImage,
    request: &ScanRequest,
    confidence: Confidence,
) -> Result<BinaryRegion, ScanError> {
    let decoded_values = scan(image, request)?;
    let bits = request.cells().saturating_mul(u64::from(request.element_size_bits));
    Ok(BinaryRegion {
        address: request.address,
        byte_length: bits.div_ceil(8),
        decoded_values,
        confidence,
    })
}

fn read_bits(bytes: &[u8], bit_offset: u64, width: u32, lsb_first: bool) -> u32 {
    let value = if bit_offset % 8 == 0 {
        let start = (bit_offset / 8) as usize;
        let end = start + (width / 8) as usize;
        bytes[start..end]
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
    } else {
        // Unaligned: pull bits MSB-first across byte boundaries.
        (0..u64::from(width)).fold(0u32, |acc, i| {
            let bit = bit_offset + i;
            let byte = bytes[(bit / 8) as usize];
            let set = (byte >> (7 - (bit % 8))) & 1;
            (acc << 1) | u32::from(set)
        })
    };
    if lsb_first && width > 8 {
        value.swap_bytes() >> (32 - width)
    } else {
        value
    }
}

fn convert(raw: u32, width: u32, datatype: DataType) -> RawValue {
    match datatype {
        DataType::Unsigned => RawValue::Unsigned(raw),
        DataType::Signed => {
            let shift = 32 - width;
            RawValue::Signed(((raw << shift) as i32) >> shift)
        }
        DataType::Float => RawValue::Float(f32::from_bits(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(address: u32, bits: u32, major: i32, minor: i32, rows: u32, columns: u32) -> ScanRequest {
        ScanRequest {
            address,
            element_size_bits: bits,
            major_stride_bits: major,
            minor_stride_bits: minor,
            rows,
            columns,
            datatype: Some(DataType::Unsigned),
            lsb_first: false,
        }
    }

    #[test]
    fn test_decode_bytes_row_major() {
        let image = BinaryImage::new(vec![1, 2, 3, 4, 5, 6]);
        let values = scan(&image, &request(0, 8, 24, 8, 2, 3)).unwrap();
        let raw: Vec<f64> = values.iter().map(RawValue::as_f64).collect();
        assert_eq!(raw, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_big_and_little_endian_words() {
        let image = BinaryImage::new(vec![0x12, 0x34]);
        let mut req = request(0, 16, 16, 16, 1, 1);
        assert_eq!(scan(&image, &req).unwrap(), vec![RawValue::Unsigned(0x1234)]);
        req.lsb_first = true;
        assert_eq!(scan(&image, &req).unwrap(), vec![RawValue::Unsigned(0x3412)]);
    }

    #[test]
    fn test_signed_sign_extension() {
        let image = BinaryImage::new(vec![0xFF, 0xFE]);
        let mut req = request(0, 8, 8, 8, 2, 1);
        req.datatype = Some(DataType::Signed);
        assert_eq!(
            scan(&image, &req).unwrap(),
            vec![RawValue::Signed(-1), RawValue::Signed(-2)]
        );
    }

    #[test]
    fn test_float_decode() {
        let image = BinaryImage::new(1.5f32.to_be_bytes().to_vec());
        let mut req = request(0, 32, 32, 32, 1, 1);
        req.datatype = Some(DataType::Float);
        assert_eq!(scan(&image, &req).unwrap(), vec![RawValue::Float(1.5)]);
    }

    #[test]
    fn test_negative_major_stride_reverses_rows() {
        let image = BinaryImage::new(vec![1, 2, 3, 4, 5, 6]);
        let values = scan(&image, &request(3, 8, -24, 8, 2, 3)).unwrap();
        let raw: Vec<f64> = values.iter().map(RawValue::as_f64).collect();
        assert_eq!(raw, vec![4.0, 5.0, 6.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let image = BinaryImage::new((0u8..64).collect());
        let req = request(8, 16, 64, 16, 3, 4);
        assert_eq!(scan(&image, &req).unwrap(), scan(&image, &req).unwrap());
    }

    #[test]
    fn test_zero_stride_repeats_cell() {
        let image = BinaryImage::new(vec![7, 9]);
        let values = scan(&image, &request(0, 8, 0, 0, 2, 2)).unwrap();
        assert_eq!(values, vec![RawValue::Unsigned(7); 4]);
    }

    #[test]
    fn test_unaligned_bits() {
        // 0b0000_1111 0b1111_0000, read 8 bits starting at bit 4.
        let image = BinaryImage::new(vec![0x0F, 0xF0]);
        let mut req = request(0, 8, 0, 0, 1, 1);
        req.major_stride_bits = 4;
        req.rows = 2;
        let values = scan(&image, &req).unwrap();
        assert_eq!(values, vec![RawValue::Unsigned(0x0F), RawValue::Unsigned(0xFF)]);
    }

    #[test]
    fn test_out_of_bounds() {
        let image = BinaryImage::new(vec![0; 4]);
        let err = scan(&image, &request(3, 16, 16, 16, 1, 1)).unwrap_err();
        assert!(matches!(err, ScanError::OutOfBounds { .. }));
        let err = scan(&image, &request(0, 8, -8, 8, 2, 1)).unwrap_err();
        assert!(matches!(err, ScanError::OutOfBounds { bit_offset: -8, .. }));
    }

    #[test]
    fn test_oversized_region_fails_before_decoding() {
        let image = BinaryImage::new(vec![0; 256]);
        let req = request(0, 8, 40000 * 8, 8, 40000, 40000);
        assert_eq!(req.cells(), 1_600_000_000);
        assert!(matches!(scan(&image, &req), Err(ScanError::OutOfBounds { .. })));

        let req = request(0, 8, 65536 * 8, 8, 65536, 65536);
        assert_eq!(req.cells(), 1 << 32);
        assert!(matches!(scan(&image, &req), Err(ScanError::OutOfBounds { .. })));

        let req = request(0xFFFF_FFFF, 32, i32::MAX, i32::MAX, u32::MAX, u32::MAX);
        assert!(matches!(scan(&image, &req), Err(ScanError::OutOfBounds { .. })));
    }

    #[test]
    fn test_packed_stride_overflow() {
        assert_eq!(packed_stride(16, 16), Some(256));
        assert_eq!(packed_stride(0x1000_0000, 16), None);
        assert_eq!(packed_stride(u32::MAX, 8), None);
    }

    #[test]
    fn test_unsupported_datatypes() {
        let image = BinaryImage::new(vec![0; 8]);
        assert!(matches!(
            scan(&image, &request(0, 12, 12, 12, 1, 1)),
            Err(ScanError::UnsupportedDatatype { element_size_bits: 12, .. })
        ));
        let mut req = request(0, 16, 16, 16, 1, 1);
        req.datatype = Some(DataType::Float);
        assert!(matches!(scan(&image, &req), Err(ScanError::UnsupportedDatatype { .. })));
        req.datatype = None;
        assert!(matches!(scan(&image, &req), Err(ScanError::UnsupportedDatatype { .. })));
    }

    #[test]
    fn test_base_offset_subtract() {
        let image = BinaryImage::new(vec![0xAA, 0xBB]).with_base_offset(BaseOffset {
            offset: 0x1000,
            subtract: true,
        });
        assert_eq!(image.byte_at(0x1001).unwrap(), 0xBB);
        assert!(image.byte_at(0x10).is_err());
    }

    #[test]
    fn test_scan_region_reports_length() {
        let image = BinaryImage::new(vec![0; 64]);
        let region = scan_region(&image, &request(0, 16, 64, 16, 2, 4), Confidence::PlausibleUnmatched).unwrap();
        assert_eq!(region.byte_length, 16);
        assert_eq!(region.decoded_values.len(), 8);
    }
}
