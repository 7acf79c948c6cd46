// $STANDARD_INFORMATION body

use crate::ntfs::timestamps::NtfsTimestamps;
use byteorder::{ByteOrder, LittleEndian};
use strata_core::StrataError;

/// NTFS 1.x stored only the timestamps and file attributes
const LEGACY_LENGTH: usize = 0x30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StandardInformation {
    pub timestamps: NtfsTimestamps,
    pub file_attributes: u32,
    pub maximum_versions: u32,
    pub version_number: u32,
    pub class_id: u32,
    pub owner_id: u32,
    pub security_id: u32,
    pub quota_charged: u64,
    pub update_sequence_number: u64,
}

impl StandardInformation {
    pub const LENGTH: usize = 0x48;

    pub fn new(file_attributes: u32) -> Self {
        Self {
            timestamps: NtfsTimestamps::now(),
            file_attributes,
            ..Default::default()
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self, StrataError> {
        if buffer.len() < LEGACY_LENGTH {
            return Err(StrataError::InvalidData(
                "$STANDARD_INFORMATION too small".to_string(),
            ));
        }
        let mut info = StandardInformation {
            timestamps: NtfsTimestamps {
                creation_time: LittleEndian::read_u64(&buffer[0x00..0x08]),
                modification_time: LittleEndian::read_u64(&buffer[0x08..0x10]),
                mft_modification_time: LittleEndian::read_u64(&buffer[0x10..0x18]),
                access_time: LittleEndian::read_u64(&buffer[0x18..0x20]),
            },
            file_attributes: LittleEndian::read_u32(&buffer[0x20..0x24]),
            maximum_versions: LittleEndian::read_u32(&buffer[0x24..0x28]),
            version_number: LittleEndian::read_u32(&buffer[0x28..0x2C]),
            class_id: LittleEndian::read_u32(&buffer[0x2C..0x30]),
            ..Default::default()
        };
        if buffer.len() >= Self::LENGTH {
            info.owner_id = LittleEndian::read_u32(&buffer[0x30..0x34]);
            info.security_id = LittleEndian::read_u32(&buffer[0x34..0x38]);
            info.quota_charged = LittleEndian::read_u64(&buffer[0x38..0x40]);
            info.update_sequence_number = LittleEndian::read_u64(&buffer[0x40..0x48]);
        }
        Ok(info)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; Self::LENGTH];
        LittleEndian::write_u64(&mut buffer[0x00..0x08], self.timestamps.creation_time);
        LittleEndian::write_u64(&mut buffer[0x08..0x10], self.timestamps.modification_time);
        LittleEndian::write_u64(&mut buffer[0x10..0x18], self.timestamps.mft_modification_time);
        LittleEndian::write_u64(&mut buffer[0x18..0x20], self.timestamps.access_time);
        LittleEndian::write_u32(&mut buffer[0x20..0x24], self.file_attributes);
        LittleEndian::write_u32(&mut buffer[0x24..0x28], self.maximum_versions);
        LittleEndian::write_u32(&mut buffer[0x28..0x2C], self.version_number);
        LittleEndian::write_u32(&mut buffer[0x2C..0x30], self.class_id);
        LittleEndian::write_u32(&mut buffer[0x30..0x34], self.owner_id);
        LittleEndian::write_u32(&mut buffer[0x34..0x38], self.security_id);
        LittleEndian::write_u64(&mut buffer[0x38..0x40], self.quota_charged);
        LittleEndian::write_u64(&mut buffer[0x40..0x48], self.update_sequence_number);
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::structures::FILE_ATTRIBUTE_ARCHIVE;

    #[test]
    fn test_round_trip() {
        let mut info = StandardInformation::new(FILE_ATTRIBUTE_ARCHIVE);
        info.security_id = 0x100;
        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), 0x48);
        assert_eq!(StandardInformation::parse(&bytes).unwrap(), info);
    }

    #[test]
    fn test_legacy_length_accepted() {
        let info = StandardInformation::new(FILE_ATTRIBUTE_ARCHIVE);
        let parsed = StandardInformation::parse(&info.to_bytes()[..0x30]).unwrap();
        assert_eq!(parsed.timestamps, info.timestamps);
        assert_eq!(parsed.security_id, 0);
    }
}
