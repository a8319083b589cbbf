//! Self-describing lookup maps used by the supported ECU firmware.
//!
//! A map starts with a one-byte input source code and a one-byte cell count,
//! followed by `count` breakpoint bytes and `count` value bytes:
//!
//! ```text
//! addr      source code
//! addr + 1  count
//! addr + 2  header[0..count]
//! addr + 2 + count  values[0..count]
//! ```

use serde::Serialize;

use crate::scanner::{BinaryImage, ScanError};

/// Human name for the map's input source, or the code in hex.
pub fn input_source_name(code: u8) -> String {
    match code {
        0x03 => "Engine Temp".to_string(),
        0x11 => "Battery Voltage".to_string(),
        0x12 => "Air Temp".to_string(),
        0x13 => "Coolant Temp".to_string(),
        0x37 => "RPM".to_string(),
        0x49 => "Engine Load".to_string(),
        other => format!("{:#04X}", other),
    }
}

/// Layout read from a map's two-byte preamble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelfDescribedMap {
    pub source_code: u8,
    pub count: u8,
    /// Definition address of the first header byte.
    pub header_address: u32,
    /// Definition address of the first value byte.
    pub data_address: u32,
    pub header: Vec<u8>,
}

impl SelfDescribedMap {
    pub fn source_name(&self) -> String {
        input_source_name(self.source_code)
    }
}

/// Read the preamble and header bytes of a map starting at `address`.
pub fn read_self_described_map(image: &BinaryImage, address: u32) -> Result<SelfDescribedMap, ScanError> {
    let source_code = image.byte_at(address)?;
    let count = image.byte_at(address.saturating_add(1))?;
    if count == 0 {
        return Err(ScanError::EmptyRegion { address });
    }

    let header_address = address.saturating_add(2);
    let header = (0..u32::from(count))
        .map(|i| image.byte_at(header_address.saturating_add(i)))
        .collect::<Result<Vec<u8>, ScanError>>()?;

    Ok(SelfDescribedMap {
        source_code,
        count,
        header_address,
        data_address: header_address.saturating_add(u32::from(count)),
        header,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_names() {
        assert_eq!(input_source_name(0x37), "RPM");
        assert_eq!(input_source_name(0x4D), "0x4D");
    }

    #[test]
    fn test_read_map_preamble() {
        let mut bytes = vec![0u8; 0x20];
        bytes[0x10..0x18].copy_from_slice(&[0x37, 3, 10, 20, 30, 1, 2, 3]);
        let image = BinaryImage::new(bytes);
        let map = read_self_described_map(&image, 0x10).unwrap();
        assert_eq!(map.count, 3);
        assert_eq!(map.header, vec![10, 20, 30]);
        assert_eq!(map.header_address, 0x12);
        assert_eq!(map.data_address, 0x15);
        assert_eq!(map.source_name(), "RPM");
    }

    #[test]
    fn test_zero_count_is_empty() {
        let image = BinaryImage::new(vec![0x11, 0]);
        assert_eq!(
            read_self_described_map(&image, 0),
            Err(ScanError::EmptyRegion { address: 0 })
        );
    }

    #[test]
    fn test_truncated_header_is_out_of_bounds() {
        let image = BinaryImage::new(vec![0x11, 4, 1]);
        assert!(matches!(
            read_self_described_map(&image, 0),
            Err(ScanError::OutOfBounds { .. })
        ));
    }
}
