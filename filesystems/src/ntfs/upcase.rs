// $UpCase table
// 64K UTF-16 code unit mapping used for case-insensitive name comparison

use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use strata_core::StrataError;

#[derive(Clone)]
pub struct UpcaseTable {
    table: Vec<u16>,
}

impl std::fmt::Debug for UpcaseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpcaseTable").finish_non_exhaustive()
    }
}

impl UpcaseTable {
    pub const ENTRY_COUNT: usize = 0x10000;
    pub const BYTE_LENGTH: usize = Self::ENTRY_COUNT * 2;

    /// Build the table from the Unicode simple uppercase mapping of the BMP.
    /// Code units whose uppercase form is not a single BMP character map to themselves.
    pub fn generate() -> Self {
        let table = (0..Self::ENTRY_COUNT as u32)
            .map(|unit| {
                let Some(c) = char::from_u32(unit) else {
                    // Surrogate halves
                    return unit as u16;
                };
                let mut upper = c.to_uppercase();
                match (upper.next(), upper.next()) {
                    (Some(u), None) if (u as u32) < 0x10000 => u as u16,
                    _ => unit as u16,
                }
            })
            .collect();
        Self { table }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StrataError> {
        if bytes.len() < Self::BYTE_LENGTH {
            return Err(StrataError::InvalidData(format!(
                "$UpCase is {} bytes, expected {}",
                bytes.len(),
                Self::BYTE_LENGTH
            )));
        }
        let table = bytes[..Self::BYTE_LENGTH]
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .collect();
        Ok(Self { table })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::BYTE_LENGTH];
        LittleEndian::write_u16_into(&self.table, &mut bytes);
        bytes
    }

    pub fn upcase(&self, unit: u16) -> u16 {
        self.table[unit as usize]
    }

    /// Ordinal comparison after upcasing both sides
    pub fn compare(&self, a: &[u16], b: &[u16]) -> Ordering {
        for (x, y) in a.iter().zip(b.iter()) {
            match self.upcase(*x).cmp(&self.upcase(*y)) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        a.len().cmp(&b.len())
    }

    pub fn compare_names(&self, a: &str, b: &str) -> Ordering {
        let a: Vec<u16> = a.encode_utf16().collect();
        let b: Vec<u16> = b.encode_utf16().collect();
        self.compare(&a, &b)
    }

    pub fn names_equal(&self, a: &str, b: &str) -> bool {
        self.compare_names(a, b) == Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_and_latin() {
        let table = UpcaseTable::generate();
        assert_eq!(table.upcase('a' as u16), 'A' as u16);
        assert_eq!(table.upcase('Z' as u16), 'Z' as u16);
        assert_eq!(table.upcase(0x00E9), 0x00C9);
        // Sharp s uppercases to two characters and stays as is
        assert_eq!(table.upcase(0x00DF), 0x00DF);
        assert_eq!(table.upcase(0xD800), 0xD800);
    }

    #[test]
    fn test_case_insensitive_compare() {
        let table = UpcaseTable::generate();
        assert_eq!(table.compare_names("Test.TXT", "test.txt"), Ordering::Equal);
        assert_eq!(table.compare_names("a", "B"), Ordering::Less);
        assert_eq!(table.compare_names("ab", "a"), Ordering::Greater);
        // '_' (0x5F) sorts after upcased letters
        assert_eq!(table.compare_names("_x", "zz"), Ordering::Greater);
    }

    #[test]
    fn test_bytes_round_trip() {
        let table = UpcaseTable::generate();
        let bytes = table.to_bytes();
        assert_eq!(bytes.len(), UpcaseTable::BYTE_LENGTH);
        let loaded = UpcaseTable::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.table, table.table);
        assert!(UpcaseTable::from_bytes(&bytes[..100]).is_err());
    }
}
