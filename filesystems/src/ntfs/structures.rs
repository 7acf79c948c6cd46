// NTFS on-disk constants and small shared types
// Values match the Windows NTFS 3.0/3.1 layout.

use std::fmt;

/// Multi-sector protection always works in 512-byte strides, whatever the sector size.
pub const UPDATE_SEQUENCE_STRIDE: usize = 512;

// Well-known file record segments
pub const MFT_SEGMENT: u64 = 0;
pub const MFT_MIRROR_SEGMENT: u64 = 1;
pub const LOG_FILE_SEGMENT: u64 = 2;
pub const VOLUME_SEGMENT: u64 = 3;
pub const ATTR_DEF_SEGMENT: u64 = 4;
pub const ROOT_DIRECTORY_SEGMENT: u64 = 5;
pub const BITMAP_SEGMENT: u64 = 6;
pub const BOOT_SEGMENT: u64 = 7;
pub const BAD_CLUSTER_SEGMENT: u64 = 8;
pub const SECURE_SEGMENT: u64 = 9;
pub const UPCASE_SEGMENT: u64 = 10;
pub const EXTEND_SEGMENT: u64 = 11;

/// Segments 16..24 are held back for the MFT's own extension segments
pub const FIRST_RESERVED_SEGMENT: u64 = 16;
pub const FIRST_USER_SEGMENT: u64 = 24;

// File record segment flags
pub const FILE_RECORD_IN_USE: u16 = 0x0001;
pub const FILE_RECORD_IS_DIRECTORY: u16 = 0x0002;
pub const FILE_RECORD_IS_VIEW_INDEX: u16 = 0x0008;

// File attribute flags ($STANDARD_INFORMATION / $FILE_NAME)
pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTRIBUTE_SYSTEM: u32 = 0x0000_0004;
pub const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0000_0020;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;
pub const FILE_ATTRIBUTE_SPARSE_FILE: u32 = 0x0000_0200;
pub const FILE_ATTRIBUTE_DIRECTORY_INDEX: u32 = 0x1000_0000;
pub const FILE_ATTRIBUTE_VIEW_INDEX: u32 = 0x2000_0000;

// Attribute record flags
pub const ATTRIBUTE_FLAG_COMPRESSION_MASK: u16 = 0x00FF;
pub const ATTRIBUTE_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTRIBUTE_FLAG_SPARSE: u16 = 0x8000;

/// Name of the directory file-name index
pub const FILE_NAME_INDEX_NAME: &str = "$I30";

/// Attribute type code. Ordering follows the numeric code, which is the
/// order attributes must appear in inside a file record segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeType(pub u32);

impl AttributeType {
    pub const STANDARD_INFORMATION: AttributeType = AttributeType(0x10);
    pub const ATTRIBUTE_LIST: AttributeType = AttributeType(0x20);
    pub const FILE_NAME: AttributeType = AttributeType(0x30);
    pub const OBJECT_ID: AttributeType = AttributeType(0x40);
    pub const SECURITY_DESCRIPTOR: AttributeType = AttributeType(0x50);
    pub const VOLUME_NAME: AttributeType = AttributeType(0x60);
    pub const VOLUME_INFORMATION: AttributeType = AttributeType(0x70);
    pub const DATA: AttributeType = AttributeType(0x80);
    pub const INDEX_ROOT: AttributeType = AttributeType(0x90);
    pub const INDEX_ALLOCATION: AttributeType = AttributeType(0xA0);
    pub const BITMAP: AttributeType = AttributeType(0xB0);
    pub const REPARSE_POINT: AttributeType = AttributeType(0xC0);
    pub const EA_INFORMATION: AttributeType = AttributeType(0xD0);
    pub const EA: AttributeType = AttributeType(0xE0);
    pub const LOGGED_UTILITY_STREAM: AttributeType = AttributeType(0x100);
    /// Terminates the attribute list of a segment
    pub const END: AttributeType = AttributeType(0xFFFF_FFFF);

    pub fn name(&self) -> &'static str {
        match self.0 {
            0x10 => "$STANDARD_INFORMATION",
            0x20 => "$ATTRIBUTE_LIST",
            0x30 => "$FILE_NAME",
            0x40 => "$OBJECT_ID",
            0x50 => "$SECURITY_DESCRIPTOR",
            0x60 => "$VOLUME_NAME",
            0x70 => "$VOLUME_INFORMATION",
            0x80 => "$DATA",
            0x90 => "$INDEX_ROOT",
            0xA0 => "$INDEX_ALLOCATION",
            0xB0 => "$BITMAP",
            0xC0 => "$REPARSE_POINT",
            0xD0 => "$EA_INFORMATION",
            0xE0 => "$EA",
            0x100 => "$LOGGED_UTILITY_STREAM",
            _ => "$UNKNOWN",
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:X})", self.name(), self.0)
    }
}

/// Identifies one incarnation of a file record segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MftSegmentReference {
    pub segment_number: u64,
    pub sequence_number: u16,
}

impl MftSegmentReference {
    pub const NULL: MftSegmentReference = MftSegmentReference {
        segment_number: 0,
        sequence_number: 0,
    };

    pub fn new(segment_number: u64, sequence_number: u16) -> Self {
        Self {
            segment_number: segment_number & 0x0000_FFFF_FFFF_FFFF,
            sequence_number,
        }
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            segment_number: value & 0x0000_FFFF_FFFF_FFFF,
            sequence_number: (value >> 48) as u16,
        }
    }

    pub fn to_u64(&self) -> u64 {
        (self.segment_number & 0x0000_FFFF_FFFF_FFFF) | ((self.sequence_number as u64) << 48)
    }

    pub fn is_null(&self) -> bool {
        self.segment_number == 0 && self.sequence_number == 0
    }
}

impl fmt::Display for MftSegmentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_number, self.sequence_number)
    }
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

pub fn align8(value: usize) -> usize {
    align_up(value, 8)
}

pub fn encode_utf16(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

pub fn decode_utf16(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Number of UTF-16 code units needed to store `value`
pub fn utf16_len(value: &str) -> usize {
    value.encode_utf16().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_reference_packing() {
        let reference = MftSegmentReference::new(0x1234_5678_9ABC, 7);
        let packed = reference.to_u64();
        assert_eq!(packed, 0x0007_1234_5678_9ABC);
        assert_eq!(MftSegmentReference::from_u64(packed), reference);
        assert!(MftSegmentReference::NULL.is_null());
    }

    #[test]
    fn test_attribute_type_order() {
        assert!(AttributeType::STANDARD_INFORMATION < AttributeType::FILE_NAME);
        assert!(AttributeType::INDEX_ROOT < AttributeType::INDEX_ALLOCATION);
        assert_eq!(AttributeType::DATA.name(), "$DATA");
    }

    #[test]
    fn test_utf16_helpers() {
        let encoded = encode_utf16("$I30");
        assert_eq!(encoded.len(), 8);
        assert_eq!(decode_utf16(&encoded), "$I30");
        assert_eq!(utf16_len("\u{1F600}"), 2);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(24), 24);
        assert_eq!(align_up(513, 512), 1024);
    }
}
