// $VOLUME_INFORMATION body

use byteorder::{ByteOrder, LittleEndian};
use strata_core::StrataError;

pub const VOLUME_FLAG_DIRTY: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInformation {
    pub major_version: u8,
    pub minor_version: u8,
    pub flags: u16,
}

impl VolumeInformation {
    pub const LENGTH: usize = 12;

    pub fn new(major_version: u8, minor_version: u8) -> Self {
        Self {
            major_version,
            minor_version,
            flags: 0,
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self, StrataError> {
        if buffer.len() < Self::LENGTH {
            return Err(StrataError::InvalidData(
                "$VOLUME_INFORMATION too small".to_string(),
            ));
        }
        Ok(Self {
            major_version: buffer[0x08],
            minor_version: buffer[0x09],
            flags: LittleEndian::read_u16(&buffer[0x0A..0x0C]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; Self::LENGTH];
        buffer[0x08] = self.major_version;
        buffer[0x09] = self.minor_version;
        LittleEndian::write_u16(&mut buffer[0x0A..0x0C], self.flags);
        buffer
    }

    /// Only NTFS 3.0 (Windows 2000) and 3.1 (XP and later) are handled
    pub fn is_supported(&self) -> bool {
        self.major_version == 3 && self.minor_version <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_check() {
        assert!(VolumeInformation::new(3, 1).is_supported());
        assert!(VolumeInformation::new(3, 0).is_supported());
        assert!(!VolumeInformation::new(1, 2).is_supported());
        let info = VolumeInformation::parse(&VolumeInformation::new(3, 1).to_bytes()).unwrap();
        assert_eq!(info.minor_version, 1);
    }
}
