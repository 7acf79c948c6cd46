// NTFS $LogFile Structures
// Restart pages (RSTR), record pages (RCRD) and log record headers

use super::lsn::Lsn;
use crate::ntfs::multi_sector::{apply_fixup, revert_fixup, update_sequence_count};
use crate::ntfs::structures::{align8, encode_utf16};
use byteorder::{ByteOrder, LittleEndian};
use strata_core::StrataError;

pub const RSTR_MAGIC: &[u8; 4] = b"RSTR";
pub const RCRD_MAGIC: &[u8; 4] = b"RCRD";

pub const DEFAULT_LOG_PAGE_SIZE: u32 = 4096;
/// Both restart pages precede the record pages
pub const RESTART_PAGE_COUNT: u64 = 2;

/// Restart area flag: the volume was shut down cleanly
pub const RESTART_AREA_CLEAN: u16 = 0x0002;
const NO_CLIENT: u16 = 0xFFFF;
const RESTART_USA_OFFSET: usize = 0x1E;
const RESTART_AREA_LENGTH: usize = 0x30;
const CLIENT_RECORD_LENGTH: usize = 0xA0;
const CLIENT_NAME: &str = "NTFS";

/// Log record types
pub const LOG_RECORD_CLIENT: u32 = 0x0001;
pub const LOG_RECORD_CLIENT_RESTART: u32 = 0x0002;

/// Log record flags
pub const LOG_RECORD_MULTI_PAGE: u16 = 0x0001;

/// Record page flag: a record ends on this page
pub const LOG_PAGE_RECORD_END: u32 = 0x0001;

pub const LOG_RECORD_HEADER_LENGTH: usize = 0x30;
pub const NTFS_LOG_RECORD_HEADER_LENGTH: usize = 0x20;
const RECORD_PAGE_USA_OFFSET: usize = 0x28;

/// Start of the data area of a record page
pub fn record_page_data_offset(page_size: u32) -> usize {
    align8(RECORD_PAGE_USA_OFFSET + update_sequence_count(page_size as usize) as usize * 2)
}

/// Restart page, stored twice at the start of `$LogFile`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPage {
    pub chkdsk_lsn: Lsn,
    pub system_page_size: u32,
    pub log_page_size: u32,
    pub current_lsn: Lsn,
    pub flags: u16,
    pub sequence_number_bits: u32,
    pub file_size: u64,
    pub last_lsn_data_length: u32,
    pub restart_log_open_count: u32,
    /// Log client record
    pub oldest_lsn: Lsn,
    pub client_restart_lsn: Lsn,
    pub update_sequence_number: u16,
}

impl RestartPage {
    pub fn new(page_size: u32, file_size: u64, sequence_number_bits: u32) -> Self {
        Self {
            chkdsk_lsn: Lsn::INVALID,
            system_page_size: page_size,
            log_page_size: page_size,
            current_lsn: Lsn::INVALID,
            flags: RESTART_AREA_CLEAN,
            sequence_number_bits,
            file_size,
            last_lsn_data_length: 0,
            restart_log_open_count: 0,
            oldest_lsn: Lsn::INVALID,
            client_restart_lsn: Lsn::INVALID,
            update_sequence_number: 1,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.flags & RESTART_AREA_CLEAN != 0
    }

    fn restart_area_offset(page_size: u32) -> usize {
        align8(RESTART_USA_OFFSET + update_sequence_count(page_size as usize) as usize * 2)
    }

    pub fn parse(buffer: &[u8]) -> Result<Self, StrataError> {
        if buffer.len() < 0x200 || &buffer[0..4] != RSTR_MAGIC {
            return Err(StrataError::InvalidData(
                "$LogFile restart page has no RSTR signature".to_string(),
            ));
        }
        let log_page_size = LittleEndian::read_u32(&buffer[0x14..0x18]);
        if !log_page_size.is_power_of_two() || log_page_size < 0x200 || log_page_size as usize > buffer.len() {
            return Err(StrataError::InvalidData(format!(
                "invalid $LogFile page size {}",
                log_page_size
            )));
        }
        let mut page = buffer[..log_page_size as usize].to_vec();
        let update_sequence_number = revert_fixup(&mut page)?;

        let area = LittleEndian::read_u16(&page[0x18..0x1A]) as usize;
        if area + RESTART_AREA_LENGTH + CLIENT_RECORD_LENGTH > page.len() {
            return Err(StrataError::InvalidData(
                "restart area beyond restart page".to_string(),
            ));
        }
        let client = area + LittleEndian::read_u16(&page[area + 0x16..area + 0x18]) as usize;
        if client + CLIENT_RECORD_LENGTH > page.len() {
            return Err(StrataError::InvalidData(
                "log client record beyond restart page".to_string(),
            ));
        }
        let sequence_number_bits = LittleEndian::read_u32(&page[area + 0x10..area + 0x14]);
        if sequence_number_bits == 0 || sequence_number_bits > 63 {
            return Err(StrataError::InvalidData(format!(
                "invalid sequence number bits {}",
                sequence_number_bits
            )));
        }
        Ok(Self {
            chkdsk_lsn: Lsn(LittleEndian::read_u64(&page[0x08..0x10])),
            system_page_size: LittleEndian::read_u32(&page[0x10..0x14]),
            log_page_size,
            current_lsn: Lsn(LittleEndian::read_u64(&page[area..area + 0x08])),
            flags: LittleEndian::read_u16(&page[area + 0x0E..area + 0x10]),
            sequence_number_bits,
            file_size: LittleEndian::read_u64(&page[area + 0x18..area + 0x20]),
            last_lsn_data_length: LittleEndian::read_u32(&page[area + 0x20..area + 0x24]),
            restart_log_open_count: LittleEndian::read_u32(&page[area + 0x28..area + 0x2C]),
            oldest_lsn: Lsn(LittleEndian::read_u64(&page[client..client + 0x08])),
            client_restart_lsn: Lsn(LittleEndian::read_u64(&page[client + 0x08..client + 0x10])),
            update_sequence_number,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StrataError> {
        let page_size = self.log_page_size as usize;
        let mut page = vec![0u8; page_size];
        let area = Self::restart_area_offset(self.log_page_size);
        page[0..4].copy_from_slice(RSTR_MAGIC);
        LittleEndian::write_u16(&mut page[0x04..0x06], RESTART_USA_OFFSET as u16);
        LittleEndian::write_u16(&mut page[0x06..0x08], update_sequence_count(page_size));
        LittleEndian::write_u64(&mut page[0x08..0x10], self.chkdsk_lsn.0);
        LittleEndian::write_u32(&mut page[0x10..0x14], self.system_page_size);
        LittleEndian::write_u32(&mut page[0x14..0x18], self.log_page_size);
        LittleEndian::write_u16(&mut page[0x18..0x1A], area as u16);
        // Version 1.1
        LittleEndian::write_i16(&mut page[0x1A..0x1C], 1);
        LittleEndian::write_i16(&mut page[0x1C..0x1E], 1);

        let restart = &mut page[area..];
        LittleEndian::write_u64(&mut restart[0x00..0x08], self.current_lsn.0);
        LittleEndian::write_u16(&mut restart[0x08..0x0A], 1);
        LittleEndian::write_u16(&mut restart[0x0A..0x0C], NO_CLIENT);
        LittleEndian::write_u16(&mut restart[0x0C..0x0E], 0);
        LittleEndian::write_u16(&mut restart[0x0E..0x10], self.flags);
        LittleEndian::write_u32(&mut restart[0x10..0x14], self.sequence_number_bits);
        LittleEndian::write_u16(
            &mut restart[0x14..0x16],
            (RESTART_AREA_LENGTH + CLIENT_RECORD_LENGTH) as u16,
        );
        LittleEndian::write_u16(&mut restart[0x16..0x18], RESTART_AREA_LENGTH as u16);
        LittleEndian::write_u64(&mut restart[0x18..0x20], self.file_size);
        LittleEndian::write_u32(&mut restart[0x20..0x24], self.last_lsn_data_length);
        LittleEndian::write_u16(&mut restart[0x24..0x26], LOG_RECORD_HEADER_LENGTH as u16);
        LittleEndian::write_u16(
            &mut restart[0x26..0x28],
            record_page_data_offset(self.log_page_size) as u16,
        );
        LittleEndian::write_u32(&mut restart[0x28..0x2C], self.restart_log_open_count);

        let client = &mut restart[RESTART_AREA_LENGTH..];
        LittleEndian::write_u64(&mut client[0x00..0x08], self.oldest_lsn.0);
        LittleEndian::write_u64(&mut client[0x08..0x10], self.client_restart_lsn.0);
        LittleEndian::write_u16(&mut client[0x10..0x12], NO_CLIENT);
        LittleEndian::write_u16(&mut client[0x12..0x14], NO_CLIENT);
        let name = encode_utf16(CLIENT_NAME);
        LittleEndian::write_u32(&mut client[0x1C..0x20], name.len() as u32);
        client[0x20..0x20 + name.len()].copy_from_slice(&name);

        apply_fixup(&mut page, self.update_sequence_number)?;
        Ok(page)
    }
}

/// Header of a record page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordPageHeader {
    /// LSN of the last record starting on this page
    pub last_lsn: Lsn,
    pub flags: u32,
    pub page_count: u16,
    pub page_position: u16,
    pub next_record_offset: u16,
    /// LSN of the last record ending on this page
    pub last_end_lsn: Lsn,
}

impl RecordPageHeader {
    pub fn write(&self, page: &mut [u8]) {
        let usa_count = update_sequence_count(page.len());
        page[0..4].copy_from_slice(RCRD_MAGIC);
        LittleEndian::write_u16(&mut page[0x04..0x06], RECORD_PAGE_USA_OFFSET as u16);
        LittleEndian::write_u16(&mut page[0x06..0x08], usa_count);
        LittleEndian::write_u64(&mut page[0x08..0x10], self.last_lsn.0);
        LittleEndian::write_u32(&mut page[0x10..0x14], self.flags);
        LittleEndian::write_u16(&mut page[0x14..0x16], self.page_count);
        LittleEndian::write_u16(&mut page[0x16..0x18], self.page_position);
        LittleEndian::write_u16(&mut page[0x18..0x1A], self.next_record_offset);
        LittleEndian::write_u64(&mut page[0x20..0x28], self.last_end_lsn.0);
    }

    pub fn parse(page: &[u8]) -> Result<Self, StrataError> {
        if page.len() < RECORD_PAGE_USA_OFFSET || &page[0..4] != RCRD_MAGIC {
            return Err(StrataError::InvalidData(
                "$LogFile record page has no RCRD signature".to_string(),
            ));
        }
        Ok(Self {
            last_lsn: Lsn(LittleEndian::read_u64(&page[0x08..0x10])),
            flags: LittleEndian::read_u32(&page[0x10..0x14]),
            page_count: LittleEndian::read_u16(&page[0x14..0x16]),
            page_position: LittleEndian::read_u16(&page[0x16..0x18]),
            next_record_offset: LittleEndian::read_u16(&page[0x18..0x1A]),
            last_end_lsn: Lsn(LittleEndian::read_u64(&page[0x20..0x28])),
        })
    }
}

/// Generic log record header, followed by `client_data_length` bytes of client data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecordHeader {
    pub this_lsn: Lsn,
    pub client_previous_lsn: Lsn,
    pub client_undo_next_lsn: Lsn,
    pub client_data_length: u32,
    pub record_type: u32,
    pub transaction_id: u32,
    pub flags: u16,
}

impl LogRecordHeader {
    pub fn to_bytes(&self) -> [u8; LOG_RECORD_HEADER_LENGTH] {
        let mut buffer = [0u8; LOG_RECORD_HEADER_LENGTH];
        LittleEndian::write_u64(&mut buffer[0x00..0x08], self.this_lsn.0);
        LittleEndian::write_u64(&mut buffer[0x08..0x10], self.client_previous_lsn.0);
        LittleEndian::write_u64(&mut buffer[0x10..0x18], self.client_undo_next_lsn.0);
        LittleEndian::write_u32(&mut buffer[0x18..0x1C], self.client_data_length);
        // Client id: sequence 0, index 0
        LittleEndian::write_u32(&mut buffer[0x20..0x24], self.record_type);
        LittleEndian::write_u32(&mut buffer[0x24..0x28], self.transaction_id);
        LittleEndian::write_u16(&mut buffer[0x28..0x2A], self.flags);
        buffer
    }

    pub fn parse(buffer: &[u8]) -> Result<Self, StrataError> {
        if buffer.len() < LOG_RECORD_HEADER_LENGTH {
            return Err(StrataError::InvalidData("log record header truncated".to_string()));
        }
        Ok(Self {
            this_lsn: Lsn(LittleEndian::read_u64(&buffer[0x00..0x08])),
            client_previous_lsn: Lsn(LittleEndian::read_u64(&buffer[0x08..0x10])),
            client_undo_next_lsn: Lsn(LittleEndian::read_u64(&buffer[0x10..0x18])),
            client_data_length: LittleEndian::read_u32(&buffer[0x18..0x1C]),
            record_type: LittleEndian::read_u32(&buffer[0x20..0x24]),
            transaction_id: LittleEndian::read_u32(&buffer[0x24..0x28]),
            flags: LittleEndian::read_u16(&buffer[0x28..0x2A]),
        })
    }
}

/// NTFS client data of a normal log record: operation header, redo data, undo data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtfsLogRecord {
    pub redo_operation: u16,
    pub undo_operation: u16,
    pub target_attribute: u16,
    pub record_offset: u16,
    pub attribute_offset: u16,
    pub cluster_block_offset: u16,
    pub target_vcn: u64,
    pub redo_data: Vec<u8>,
    pub undo_data: Vec<u8>,
}

impl NtfsLogRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let redo_offset = NTFS_LOG_RECORD_HEADER_LENGTH;
        let undo_offset = redo_offset + align8(self.redo_data.len());
        let length = undo_offset + align8(self.undo_data.len());
        let mut buffer = vec![0u8; length];
        LittleEndian::write_u16(&mut buffer[0x00..0x02], self.redo_operation);
        LittleEndian::write_u16(&mut buffer[0x02..0x04], self.undo_operation);
        LittleEndian::write_u16(&mut buffer[0x04..0x06], redo_offset as u16);
        LittleEndian::write_u16(&mut buffer[0x06..0x08], self.redo_data.len() as u16);
        LittleEndian::write_u16(&mut buffer[0x08..0x0A], undo_offset as u16);
        LittleEndian::write_u16(&mut buffer[0x0A..0x0C], self.undo_data.len() as u16);
        LittleEndian::write_u16(&mut buffer[0x0C..0x0E], self.target_attribute);
        LittleEndian::write_u16(&mut buffer[0x10..0x12], self.record_offset);
        LittleEndian::write_u16(&mut buffer[0x12..0x14], self.attribute_offset);
        LittleEndian::write_u16(&mut buffer[0x14..0x16], self.cluster_block_offset);
        LittleEndian::write_u64(&mut buffer[0x18..0x20], self.target_vcn);
        buffer[redo_offset..redo_offset + self.redo_data.len()].copy_from_slice(&self.redo_data);
        buffer[undo_offset..undo_offset + self.undo_data.len()].copy_from_slice(&self.undo_data);
        buffer
    }

    pub fn parse(buffer: &[u8]) -> Result<Self, StrataError> {
        if buffer.len() < NTFS_LOG_RECORD_HEADER_LENGTH {
            return Err(StrataError::InvalidData("NTFS log record truncated".to_string()));
        }
        let slice = |offset: usize, length: usize| -> Result<Vec<u8>, StrataError> {
            buffer
                .get(offset..offset + length)
                .map(|data| data.to_vec())
                .ok_or_else(|| StrataError::InvalidData("log record data out of bounds".to_string()))
        };
        Ok(Self {
            redo_operation: LittleEndian::read_u16(&buffer[0x00..0x02]),
            undo_operation: LittleEndian::read_u16(&buffer[0x02..0x04]),
            target_attribute: LittleEndian::read_u16(&buffer[0x0C..0x0E]),
            record_offset: LittleEndian::read_u16(&buffer[0x10..0x12]),
            attribute_offset: LittleEndian::read_u16(&buffer[0x12..0x14]),
            cluster_block_offset: LittleEndian::read_u16(&buffer[0x14..0x16]),
            target_vcn: LittleEndian::read_u64(&buffer[0x18..0x20]),
            redo_data: slice(
                LittleEndian::read_u16(&buffer[0x04..0x06]) as usize,
                LittleEndian::read_u16(&buffer[0x06..0x08]) as usize,
            )?,
            undo_data: slice(
                LittleEndian::read_u16(&buffer[0x08..0x0A]) as usize,
                LittleEndian::read_u16(&buffer[0x0A..0x0C]) as usize,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::logfile::lsn::sequence_number_bits;

    #[test]
    fn test_restart_page_round_trip() {
        let mut page = RestartPage::new(4096, 1 << 20, sequence_number_bits(1 << 20));
        page.current_lsn = Lsn(0x1234);
        page.client_restart_lsn = Lsn(0x1200);
        page.flags = 0;
        let bytes = page.to_bytes().unwrap();
        assert_eq!(&bytes[0..4], b"RSTR");
        assert_eq!(bytes.len(), 4096);
        let parsed = RestartPage::parse(&bytes).unwrap();
        assert_eq!(parsed, page);
        assert!(!parsed.is_clean());
    }

    #[test]
    fn test_record_page_data_offset() {
        // 9 update sequence entries after the 0x28-byte header
        assert_eq!(record_page_data_offset(4096), 0x40);
    }

    #[test]
    fn test_record_page_header_round_trip() {
        let header = RecordPageHeader {
            last_lsn: Lsn(0x2000),
            flags: 1,
            page_count: 1,
            page_position: 1,
            next_record_offset: 0x98,
            last_end_lsn: Lsn(0x2000),
        };
        let mut page = vec![0u8; 4096];
        header.write(&mut page);
        assert_eq!(&page[0..4], b"RCRD");
        assert_eq!(LittleEndian::read_u16(&page[0x06..0x08]), 9);
        assert_eq!(RecordPageHeader::parse(&page).unwrap(), header);
    }

    #[test]
    fn test_ntfs_record_round_trip() {
        let record = NtfsLogRecord {
            redo_operation: 0x15,
            undo_operation: 0x16,
            target_attribute: 2,
            record_offset: 0,
            attribute_offset: 0,
            cluster_block_offset: 1,
            target_vcn: 7,
            redo_data: vec![1, 0, 0, 0, 3, 0, 0, 0],
            undo_data: vec![1, 0, 0, 0, 3, 0, 0, 0, 9],
        };
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), 0x20 + 8 + 16);
        assert_eq!(NtfsLogRecord::parse(&bytes).unwrap(), record);
    }
}
