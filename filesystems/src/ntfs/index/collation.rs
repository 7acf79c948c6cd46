// Index collation rules
// Ordering functions for index keys, selected by the collation rule of $INDEX_ROOT

use crate::ntfs::upcase::UpcaseTable;
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use strata_core::StrataError;

/// Offset of the name length byte inside a `$FILE_NAME` key
const FILE_NAME_LENGTH_OFFSET: usize = 0x40;
const FILE_NAME_OFFSET: usize = 0x42;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CollationRule {
    Binary = 0x00,
    FileName = 0x01,
    UnicodeString = 0x02,
    Ulong = 0x10,
    Sid = 0x11,
    SecurityHash = 0x12,
    Ulongs = 0x13,
}

impl CollationRule {
    pub fn from_u32(value: u32) -> Result<Self, StrataError> {
        match value {
            0x00 => Ok(CollationRule::Binary),
            0x01 => Ok(CollationRule::FileName),
            0x02 => Ok(CollationRule::UnicodeString),
            0x10 => Ok(CollationRule::Ulong),
            0x11 => Ok(CollationRule::Sid),
            0x12 => Ok(CollationRule::SecurityHash),
            0x13 => Ok(CollationRule::Ulongs),
            other => Err(StrataError::NotSupported(format!(
                "collation rule {:#x}",
                other
            ))),
        }
    }

    pub fn compare(&self, a: &[u8], b: &[u8], upcase: &UpcaseTable) -> Ordering {
        match self {
            CollationRule::Binary | CollationRule::Sid => a.cmp(b),
            CollationRule::FileName => upcase.compare(&file_name_units(a), &file_name_units(b)),
            CollationRule::UnicodeString => upcase.compare(&utf16_units(a), &utf16_units(b)),
            CollationRule::Ulong => read_u32(a, 0).cmp(&read_u32(b, 0)),
            CollationRule::SecurityHash => read_u32(a, 0)
                .cmp(&read_u32(b, 0))
                .then_with(|| read_u32(a, 4).cmp(&read_u32(b, 4))),
            CollationRule::Ulongs => {
                let x: Vec<u32> = a.chunks_exact(4).map(LittleEndian::read_u32).collect();
                let y: Vec<u32> = b.chunks_exact(4).map(LittleEndian::read_u32).collect();
                x.cmp(&y)
            }
        }
    }
}

fn read_u32(key: &[u8], offset: usize) -> u32 {
    key.get(offset..offset + 4).map(LittleEndian::read_u32).unwrap_or(0)
}

fn utf16_units(bytes: &[u8]) -> Vec<u16> {
    bytes.chunks_exact(2).map(LittleEndian::read_u16).collect()
}

/// Name code units of a `$FILE_NAME` key
fn file_name_units(key: &[u8]) -> Vec<u16> {
    let Some(length) = key.get(FILE_NAME_LENGTH_OFFSET) else {
        return Vec::new();
    };
    let end = (FILE_NAME_OFFSET + *length as usize * 2).min(key.len());
    key.get(FILE_NAME_OFFSET..end).map(utf16_units).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::attributes::FileNameRecord;
    use crate::ntfs::structures::MftSegmentReference;
    use crate::ntfs::timestamps::NtfsTimestamps;

    fn key(name: &str) -> Vec<u8> {
        FileNameRecord::new(MftSegmentReference::new(5, 5), name, false, NtfsTimestamps::now()).to_bytes()
    }

    #[test]
    fn test_file_name_collation_ignores_case() {
        let upcase = UpcaseTable::generate();
        let rule = CollationRule::FileName;
        assert_eq!(rule.compare(&key("readme.TXT"), &key("README.txt"), &upcase), Ordering::Equal);
        assert_eq!(rule.compare(&key("a"), &key("B"), &upcase), Ordering::Less);
        assert_eq!(rule.compare(&key("abc"), &key("ab"), &upcase), Ordering::Greater);
    }

    #[test]
    fn test_numeric_rules() {
        let upcase = UpcaseTable::generate();
        let one = 1u32.to_le_bytes();
        let big = 0x100u32.to_le_bytes();
        assert_eq!(CollationRule::Ulong.compare(&big, &one, &upcase), Ordering::Greater);
        // Binary order disagrees for little-endian values
        assert_eq!(CollationRule::Binary.compare(&big, &one, &upcase), Ordering::Less);

        let mut a = Vec::new();
        a.extend_from_slice(&7u32.to_le_bytes());
        a.extend_from_slice(&0x200u32.to_le_bytes());
        let mut b = Vec::new();
        b.extend_from_slice(&7u32.to_le_bytes());
        b.extend_from_slice(&0x101u32.to_le_bytes());
        assert_eq!(CollationRule::SecurityHash.compare(&a, &b, &upcase), Ordering::Greater);
        assert_eq!(CollationRule::Ulongs.compare(&a, &b, &upcase), Ordering::Greater);
    }

    #[test]
    fn test_unknown_rule_rejected() {
        assert!(CollationRule::from_u32(0x42).is_err());
        assert_eq!(CollationRule::from_u32(1).unwrap(), CollationRule::FileName);
    }
}
