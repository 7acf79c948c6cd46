// $FILE_NAME body, also used verbatim as the key of directory index entries

use super::AttributeRecord;
use crate::ntfs::structures::{
    decode_utf16, encode_utf16, utf16_len, AttributeType, MftSegmentReference, FILE_ATTRIBUTE_DIRECTORY_INDEX,
};
use crate::ntfs::timestamps::NtfsTimestamps;
use byteorder::{ByteOrder, LittleEndian};
use strata_core::StrataError;

const NAME_OFFSET: usize = 0x42;
pub const MAXIMUM_FILE_NAME_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileNameNamespace {
    Posix = 0,
    Win32 = 1,
    Dos = 2,
    Win32AndDos = 3,
}

impl FileNameNamespace {
    pub fn from_u8(value: u8) -> Result<Self, StrataError> {
        match value {
            0 => Ok(FileNameNamespace::Posix),
            1 => Ok(FileNameNamespace::Win32),
            2 => Ok(FileNameNamespace::Dos),
            3 => Ok(FileNameNamespace::Win32AndDos),
            other => Err(StrataError::InvalidData(format!(
                "invalid file name namespace {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameRecord {
    pub parent_directory: MftSegmentReference,
    pub timestamps: NtfsTimestamps,
    pub allocated_length: u64,
    pub file_size: u64,
    pub file_attributes: u32,
    pub extended_attributes: u32,
    pub namespace: FileNameNamespace,
    pub name: String,
}

impl FileNameRecord {
    pub fn new(
        parent_directory: MftSegmentReference,
        name: &str,
        is_directory: bool,
        timestamps: NtfsTimestamps,
    ) -> Self {
        Self {
            parent_directory,
            timestamps,
            allocated_length: 0,
            file_size: 0,
            file_attributes: if is_directory {
                FILE_ATTRIBUTE_DIRECTORY_INDEX
            } else {
                0
            },
            extended_attributes: 0,
            namespace: FileNameNamespace::Win32,
            name: name.to_string(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file_attributes & FILE_ATTRIBUTE_DIRECTORY_INDEX != 0
    }

    pub fn length(&self) -> usize {
        NAME_OFFSET + utf16_len(&self.name) * 2
    }

    pub fn parse(buffer: &[u8]) -> Result<Self, StrataError> {
        if buffer.len() < NAME_OFFSET {
            return Err(StrataError::InvalidData("$FILE_NAME too small".to_string()));
        }
        let name_length = buffer[0x40] as usize;
        if NAME_OFFSET + name_length * 2 > buffer.len() {
            return Err(StrataError::InvalidData(
                "$FILE_NAME name beyond value end".to_string(),
            ));
        }
        Ok(Self {
            parent_directory: MftSegmentReference::from_u64(LittleEndian::read_u64(
                &buffer[0x00..0x08],
            )),
            timestamps: NtfsTimestamps {
                creation_time: LittleEndian::read_u64(&buffer[0x08..0x10]),
                modification_time: LittleEndian::read_u64(&buffer[0x10..0x18]),
                mft_modification_time: LittleEndian::read_u64(&buffer[0x18..0x20]),
                access_time: LittleEndian::read_u64(&buffer[0x20..0x28]),
            },
            allocated_length: LittleEndian::read_u64(&buffer[0x28..0x30]),
            file_size: LittleEndian::read_u64(&buffer[0x30..0x38]),
            file_attributes: LittleEndian::read_u32(&buffer[0x38..0x3C]),
            extended_attributes: LittleEndian::read_u32(&buffer[0x3C..0x40]),
            namespace: FileNameNamespace::from_u8(buffer[0x41])?,
            name: decode_utf16(&buffer[NAME_OFFSET..NAME_OFFSET + name_length * 2]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let name = encode_utf16(&self.name);
        let mut buffer = vec![0u8; NAME_OFFSET + name.len()];
        LittleEndian::write_u64(&mut buffer[0x00..0x08], self.parent_directory.to_u64());
        LittleEndian::write_u64(&mut buffer[0x08..0x10], self.timestamps.creation_time);
        LittleEndian::write_u64(&mut buffer[0x10..0x18], self.timestamps.modification_time);
        LittleEndian::write_u64(&mut buffer[0x18..0x20], self.timestamps.mft_modification_time);
        LittleEndian::write_u64(&mut buffer[0x20..0x28], self.timestamps.access_time);
        LittleEndian::write_u64(&mut buffer[0x28..0x30], self.allocated_length);
        LittleEndian::write_u64(&mut buffer[0x30..0x38], self.file_size);
        LittleEndian::write_u32(&mut buffer[0x38..0x3C], self.file_attributes);
        LittleEndian::write_u32(&mut buffer[0x3C..0x40], self.extended_attributes);
        buffer[0x40] = (name.len() / 2) as u8;
        buffer[0x41] = self.namespace as u8;
        buffer[NAME_OFFSET..].copy_from_slice(&name);
        buffer
    }

    /// The resident, indexed `$FILE_NAME` attribute carrying this name
    pub fn to_attribute(&self) -> AttributeRecord {
        let mut attribute = AttributeRecord::new_resident(AttributeType::FILE_NAME, "", self.to_bytes());
        if let AttributeRecord::Resident(r) = &mut attribute {
            r.indexed_flag = 1;
        }
        attribute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let parent = MftSegmentReference::new(5, 5);
        let record = FileNameRecord::new(parent, "test.txt", false, NtfsTimestamps::now());
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), 0x42 + 16);
        assert_eq!(LittleEndian::read_u64(&bytes[0..8]), parent.to_u64());
        assert_eq!(bytes[0x40], 8);
        assert_eq!(bytes[0x41], FileNameNamespace::Win32 as u8);
        assert_eq!(FileNameRecord::parse(&bytes).unwrap(), record);
    }

    #[test]
    fn test_directory_flag() {
        let record = FileNameRecord::new(
            MftSegmentReference::new(5, 5),
            "A",
            true,
            NtfsTimestamps::default(),
        );
        assert!(record.is_directory());
    }

    #[test]
    fn test_bad_namespace_rejected() {
        let mut bytes = FileNameRecord::new(
            MftSegmentReference::new(5, 5),
            "x",
            false,
            NtfsTimestamps::default(),
        )
        .to_bytes();
        bytes[0x41] = 9;
        assert!(FileNameRecord::parse(&bytes).is_err());
    }
}
