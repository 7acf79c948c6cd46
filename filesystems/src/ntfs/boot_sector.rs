// NTFS Boot Sector
// Parses, validates and serializes the 512-byte boot record (primary in sector 0, backup in the last sector)

use byteorder::{ByteOrder, LittleEndian};
use strata_core::StrataError;

pub const NTFS_SIGNATURE: &[u8; 8] = b"NTFS    ";
pub const BOOT_SECTOR_SIGNATURE: u16 = 0xAA55;
pub const BOOT_SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtfsBootRecord {
    pub bytes_per_sector: u16,
    /// Raw field at 0x0D; values above 0x80 encode 2^(256 - n)
    pub raw_sectors_per_cluster: u8,
    pub media_descriptor: u8,
    pub sectors_per_track: u16,
    pub number_of_heads: u16,
    pub hidden_sectors: u32,
    pub physical_drive_number: u8,
    pub total_sectors: u64,
    pub mft_start_lcn: u64,
    pub mft_mirror_start_lcn: u64,
    /// Positive: clusters per record. Negative: record is 2^(-n) bytes.
    pub raw_clusters_per_file_record_segment: i8,
    pub raw_clusters_per_index_record: i8,
    pub volume_serial_number: u64,
    pub checksum: u32,
}

impl NtfsBootRecord {
    pub fn new(
        bytes_per_sector: u16,
        bytes_per_cluster: u32,
        total_sectors: u64,
        mft_start_lcn: u64,
        mft_mirror_start_lcn: u64,
        bytes_per_file_record_segment: u32,
        bytes_per_index_record: u32,
        volume_serial_number: u64,
    ) -> Self {
        let sectors_per_cluster = bytes_per_cluster / bytes_per_sector as u32;
        Self {
            bytes_per_sector,
            raw_sectors_per_cluster: encode_sectors_per_cluster(sectors_per_cluster),
            media_descriptor: 0xF8,
            sectors_per_track: 0x3F,
            number_of_heads: 0xFF,
            hidden_sectors: 0,
            physical_drive_number: 0x80,
            total_sectors,
            mft_start_lcn,
            mft_mirror_start_lcn,
            raw_clusters_per_file_record_segment: encode_clusters_per_record(
                bytes_per_file_record_segment,
                bytes_per_cluster,
            ),
            raw_clusters_per_index_record: encode_clusters_per_record(
                bytes_per_index_record,
                bytes_per_cluster,
            ),
            volume_serial_number,
            checksum: 0,
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self, StrataError> {
        if buffer.len() < BOOT_SECTOR_SIZE {
            return Err(StrataError::InvalidData(
                "boot sector buffer too small".to_string(),
            ));
        }
        if &buffer[0x03..0x0B] != NTFS_SIGNATURE {
            return Err(StrataError::InvalidData("Not an NTFS volume".to_string()));
        }
        if LittleEndian::read_u16(&buffer[0x1FE..0x200]) != BOOT_SECTOR_SIGNATURE {
            return Err(StrataError::InvalidData(
                "Invalid boot sector signature".to_string(),
            ));
        }

        let record = Self {
            bytes_per_sector: LittleEndian::read_u16(&buffer[0x0B..0x0D]),
            raw_sectors_per_cluster: buffer[0x0D],
            media_descriptor: buffer[0x15],
            sectors_per_track: LittleEndian::read_u16(&buffer[0x18..0x1A]),
            number_of_heads: LittleEndian::read_u16(&buffer[0x1A..0x1C]),
            hidden_sectors: LittleEndian::read_u32(&buffer[0x1C..0x20]),
            physical_drive_number: buffer[0x24],
            total_sectors: LittleEndian::read_u64(&buffer[0x28..0x30]),
            mft_start_lcn: LittleEndian::read_u64(&buffer[0x30..0x38]),
            mft_mirror_start_lcn: LittleEndian::read_u64(&buffer[0x38..0x40]),
            raw_clusters_per_file_record_segment: buffer[0x40] as i8,
            raw_clusters_per_index_record: buffer[0x44] as i8,
            volume_serial_number: LittleEndian::read_u64(&buffer[0x48..0x50]),
            checksum: LittleEndian::read_u32(&buffer[0x50..0x54]),
        };
        record.validate()?;
        Ok(record)
    }

    /// Validate the geometry fields
    pub fn validate(&self) -> Result<(), StrataError> {
        if ![512, 1024, 2048, 4096].contains(&self.bytes_per_sector) {
            return Err(StrataError::InvalidData(format!(
                "Invalid bytes per sector: {}",
                self.bytes_per_sector
            )));
        }
        let sectors_per_cluster = self.sectors_per_cluster();
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(StrataError::InvalidData(format!(
                "Invalid sectors per cluster: {}",
                sectors_per_cluster
            )));
        }
        let segment = self.bytes_per_file_record_segment();
        if segment < self.bytes_per_sector as u32 || !segment.is_power_of_two() {
            return Err(StrataError::InvalidData(format!(
                "Invalid file record segment size: {}",
                segment
            )));
        }
        let index = self.bytes_per_index_record();
        if index < 256 || !index.is_power_of_two() {
            return Err(StrataError::InvalidData(format!(
                "Invalid index record size: {}",
                index
            )));
        }
        if self.mft_start_lcn >= self.total_clusters()
            || self.mft_mirror_start_lcn >= self.total_clusters()
        {
            return Err(StrataError::InvalidData(
                "MFT location beyond end of volume".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; BOOT_SECTOR_SIZE];
        // jmp short 0x54; nop
        buffer[0x00..0x03].copy_from_slice(&[0xEB, 0x52, 0x90]);
        buffer[0x03..0x0B].copy_from_slice(NTFS_SIGNATURE);
        LittleEndian::write_u16(&mut buffer[0x0B..0x0D], self.bytes_per_sector);
        buffer[0x0D] = self.raw_sectors_per_cluster;
        buffer[0x15] = self.media_descriptor;
        LittleEndian::write_u16(&mut buffer[0x18..0x1A], self.sectors_per_track);
        LittleEndian::write_u16(&mut buffer[0x1A..0x1C], self.number_of_heads);
        LittleEndian::write_u32(&mut buffer[0x1C..0x20], self.hidden_sectors);
        buffer[0x24] = self.physical_drive_number;
        buffer[0x26] = 0x80;
        LittleEndian::write_u64(&mut buffer[0x28..0x30], self.total_sectors);
        LittleEndian::write_u64(&mut buffer[0x30..0x38], self.mft_start_lcn);
        LittleEndian::write_u64(&mut buffer[0x38..0x40], self.mft_mirror_start_lcn);
        buffer[0x40] = self.raw_clusters_per_file_record_segment as u8;
        buffer[0x44] = self.raw_clusters_per_index_record as u8;
        LittleEndian::write_u64(&mut buffer[0x48..0x50], self.volume_serial_number);
        LittleEndian::write_u32(&mut buffer[0x50..0x54], self.checksum);
        LittleEndian::write_u16(&mut buffer[0x1FE..0x200], BOOT_SECTOR_SIGNATURE);
        buffer
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        if self.raw_sectors_per_cluster > 0x80 {
            1u32 << (256 - self.raw_sectors_per_cluster as u32)
        } else {
            self.raw_sectors_per_cluster as u32
        }
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster()
    }

    pub fn bytes_per_file_record_segment(&self) -> u32 {
        decode_clusters_per_record(
            self.raw_clusters_per_file_record_segment,
            self.bytes_per_cluster(),
        )
    }

    pub fn bytes_per_index_record(&self) -> u32 {
        decode_clusters_per_record(self.raw_clusters_per_index_record, self.bytes_per_cluster())
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster() as u64
    }
}

fn encode_sectors_per_cluster(sectors_per_cluster: u32) -> u8 {
    if sectors_per_cluster <= 0x80 {
        sectors_per_cluster as u8
    } else {
        (256 - sectors_per_cluster.trailing_zeros()) as u8
    }
}

fn decode_clusters_per_record(raw: i8, bytes_per_cluster: u32) -> u32 {
    if raw > 0 {
        raw as u32 * bytes_per_cluster
    } else {
        1u32 << (-(raw as i32)) as u32
    }
}

/// Records at least one cluster long are counted in clusters,
/// smaller ones as a negative power of two.
pub fn encode_clusters_per_record(bytes_per_record: u32, bytes_per_cluster: u32) -> i8 {
    if bytes_per_record >= bytes_per_cluster {
        (bytes_per_record / bytes_per_cluster) as i8
    } else {
        -(bytes_per_record.trailing_zeros() as i8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NtfsBootRecord {
        NtfsBootRecord::new(512, 4096, 131_071, 4, 8192, 1024, 4096, 0x1122_3344_5566_7788)
    }

    #[test]
    fn test_boot_record_round_trip() {
        let record = sample();
        let bytes = record.to_bytes();
        assert_eq!(&bytes[3..11], b"NTFS    ");
        assert_eq!(bytes[0x1FE], 0x55);
        assert_eq!(bytes[0x1FF], 0xAA);
        let parsed = NtfsBootRecord::parse(&bytes).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.bytes_per_cluster(), 4096);
        assert_eq!(parsed.bytes_per_file_record_segment(), 1024);
        assert_eq!(parsed.bytes_per_index_record(), 4096);
        assert_eq!(parsed.total_clusters(), 16383);
    }

    #[test]
    fn test_record_size_encoding() {
        assert_eq!(encode_clusters_per_record(1024, 4096), -10);
        assert_eq!(encode_clusters_per_record(4096, 4096), 1);
        assert_eq!(encode_clusters_per_record(512, 4096), -9);
        assert_eq!(decode_clusters_per_record(-9, 4096), 512);
        assert_eq!(decode_clusters_per_record(2, 4096), 8192);
    }

    #[test]
    fn test_large_cluster_encoding() {
        // 128 KiB clusters on 512-byte sectors need 256 sectors per cluster
        assert_eq!(encode_sectors_per_cluster(256), 248);
        let mut record = sample();
        record.raw_sectors_per_cluster = 248;
        assert_eq!(record.sectors_per_cluster(), 256);
    }

    #[test]
    fn test_rejects_foreign_boot_sector() {
        let mut bytes = sample().to_bytes();
        bytes[3..11].copy_from_slice(b"MSDOS5.0");
        assert!(matches!(
            NtfsBootRecord::parse(&bytes),
            Err(StrataError::InvalidData(_))
        ));

        let mut bytes = sample().to_bytes();
        bytes[0x1FE] = 0;
        assert!(NtfsBootRecord::parse(&bytes).is_err());
    }
}
