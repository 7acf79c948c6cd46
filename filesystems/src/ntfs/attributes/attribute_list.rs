// $ATTRIBUTE_LIST body
// One entry per attribute record of a multi-segment file record

use crate::ntfs::structures::{
    align8, decode_utf16, encode_utf16, utf16_len, AttributeType, MftSegmentReference,
};
use byteorder::{ByteOrder, LittleEndian};
use strata_core::StrataError;

const ENTRY_HEADER_LENGTH: usize = 0x1A;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeListEntry {
    pub attribute_type: AttributeType,
    pub name: String,
    pub lowest_vcn: u64,
    pub segment_reference: MftSegmentReference,
    pub instance: u16,
}

impl AttributeListEntry {
    pub fn length(&self) -> usize {
        align8(ENTRY_HEADER_LENGTH + utf16_len(&self.name) * 2)
    }

    /// Length of an entry describing an attribute with this name
    pub fn length_for_name(name: &str) -> usize {
        align8(ENTRY_HEADER_LENGTH + utf16_len(name) * 2)
    }

    pub fn parse_list(buffer: &[u8]) -> Result<Vec<AttributeListEntry>, StrataError> {
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset + ENTRY_HEADER_LENGTH <= buffer.len() {
            let entry = &buffer[offset..];
            let length = LittleEndian::read_u16(&entry[0x04..0x06]) as usize;
            let name_length = entry[0x06] as usize;
            let name_offset = entry[0x07] as usize;
            if length < ENTRY_HEADER_LENGTH
                || offset + length > buffer.len()
                || name_offset + name_length * 2 > length
            {
                return Err(StrataError::InvalidData(format!(
                    "corrupt attribute list entry at offset {}",
                    offset
                )));
            }
            entries.push(AttributeListEntry {
                attribute_type: AttributeType(LittleEndian::read_u32(&entry[0x00..0x04])),
                name: decode_utf16(&entry[name_offset..name_offset + name_length * 2]),
                lowest_vcn: LittleEndian::read_u64(&entry[0x08..0x10]),
                segment_reference: MftSegmentReference::from_u64(LittleEndian::read_u64(
                    &entry[0x10..0x18],
                )),
                instance: LittleEndian::read_u16(&entry[0x18..0x1A]),
            });
            offset += length;
        }
        Ok(entries)
    }

    pub fn list_to_bytes(entries: &[AttributeListEntry]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(entries.iter().map(|e| e.length()).sum());
        for entry in entries {
            let start = buffer.len();
            let name = encode_utf16(&entry.name);
            buffer.resize(start + entry.length(), 0);
            let out = &mut buffer[start..];
            LittleEndian::write_u32(&mut out[0x00..0x04], entry.attribute_type.0);
            LittleEndian::write_u16(&mut out[0x04..0x06], entry.length() as u16);
            out[0x06] = (name.len() / 2) as u8;
            out[0x07] = ENTRY_HEADER_LENGTH as u8;
            LittleEndian::write_u64(&mut out[0x08..0x10], entry.lowest_vcn);
            LittleEndian::write_u64(&mut out[0x10..0x18], entry.segment_reference.to_u64());
            LittleEndian::write_u16(&mut out[0x18..0x1A], entry.instance);
            out[ENTRY_HEADER_LENGTH..ENTRY_HEADER_LENGTH + name.len()].copy_from_slice(&name);
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_round_trip() {
        let entries = vec![
            AttributeListEntry {
                attribute_type: AttributeType::STANDARD_INFORMATION,
                name: String::new(),
                lowest_vcn: 0,
                segment_reference: MftSegmentReference::new(40, 2),
                instance: 0,
            },
            AttributeListEntry {
                attribute_type: AttributeType::INDEX_ALLOCATION,
                name: "$I30".to_string(),
                lowest_vcn: 0x20,
                segment_reference: MftSegmentReference::new(41, 1),
                instance: 3,
            },
        ];
        let bytes = AttributeListEntry::list_to_bytes(&entries);
        assert_eq!(bytes.len(), 0x20 + 0x28);
        assert_eq!(AttributeListEntry::parse_list(&bytes).unwrap(), entries);
    }

    #[test]
    fn test_corrupt_entry_length() {
        let mut bytes = AttributeListEntry::list_to_bytes(&[AttributeListEntry {
            attribute_type: AttributeType::DATA,
            name: String::new(),
            lowest_vcn: 0,
            segment_reference: MftSegmentReference::new(30, 1),
            instance: 1,
        }]);
        LittleEndian::write_u16(&mut bytes[0x04..0x06], 0x200);
        assert!(AttributeListEntry::parse_list(&bytes).is_err());
    }
}
