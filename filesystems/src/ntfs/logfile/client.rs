// NTFS log client
// Appends redo/undo records to the circular record area of $LogFile and keeps the
// restart area pointing at the last checkpoint.

use super::lsn::{sequence_number_bits, Lsn};
use super::structures::*;
use super::{LogFileStats, LogOperation};
use crate::ntfs::data_runs::DataRunSequence;
use crate::ntfs::multi_sector::{apply_fixup, next_update_sequence_number};
use crate::ntfs::structures::{align8, AttributeType, MftSegmentReference};
use crate::ntfs::volume_io::VolumeIo;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, trace, warn};
use std::collections::BTreeMap;
use strata_core::StrataError;

pub type TransactionId = u32;

/// Stream a log record applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    pub segment: MftSegmentReference,
    pub attribute_type: AttributeType,
    pub attribute_name: String,
    /// Byte offset of the change within the attribute stream
    pub stream_offset: u64,
}

impl LogTarget {
    pub fn new(
        segment: MftSegmentReference,
        attribute_type: AttributeType,
        attribute_name: &str,
        stream_offset: u64,
    ) -> Self {
        Self {
            segment,
            attribute_type,
            attribute_name: attribute_name.to_string(),
            stream_offset,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TransactionState {
    first_lsn: Lsn,
    previous_lsn: Lsn,
    undo_next_lsn: Lsn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenAttribute {
    segment: MftSegmentReference,
    attribute_type: AttributeType,
    attribute_name: String,
}

/// Offset of an entry in the on-disk open attribute table
const OPEN_ATTRIBUTE_TABLE_HEADER: usize = 0x18;
const OPEN_ATTRIBUTE_ENTRY_LENGTH: usize = 0x28;
const CLIENT_RESTART_DATA_LENGTH: usize = 0x40;

pub struct LogClient {
    runs: DataRunSequence,
    file_size: u64,
    page_size: u32,
    bytes_per_sector: u32,
    sequence_bits: u32,
    sequence_number: u64,
    /// Byte offset in $LogFile where the next record starts
    next_offset: u64,
    /// Current record page, without fixups
    page: Vec<u8>,
    page_header: RecordPageHeader,
    page_update_sequence: u16,
    restart: RestartPage,
    open_attributes: Vec<OpenAttribute>,
    transactions: BTreeMap<TransactionId, TransactionState>,
    next_transaction_id: TransactionId,
    last_lsn: Lsn,
    stats: LogFileStats,
}

impl std::fmt::Debug for LogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogClient")
            .field("file_size", &self.file_size)
            .field("next_offset", &self.next_offset)
            .field("last_lsn", &self.last_lsn)
            .finish_non_exhaustive()
    }
}

impl LogClient {
    /// Fresh restart page pair for a newly formatted `$LogFile`
    pub fn initial_restart_pages(file_size: u64) -> Result<Vec<u8>, StrataError> {
        let page = RestartPage::new(DEFAULT_LOG_PAGE_SIZE, file_size, sequence_number_bits(file_size));
        let bytes = page.to_bytes()?;
        let mut pages = bytes.clone();
        pages.extend_from_slice(&bytes);
        Ok(pages)
    }

    /// Attach to `$LogFile`, continuing after the newest restart area
    pub fn open(io: &VolumeIo, runs: DataRunSequence, file_size: u64) -> Result<Self, StrataError> {
        let bytes_per_sector = io.geometry().bytes_per_sector;
        let page_sectors = DEFAULT_LOG_PAGE_SIZE as u64 / bytes_per_sector as u64;
        let first = io
            .read_mapped(&runs, 0, page_sectors)
            .and_then(|bytes| RestartPage::parse(&bytes));
        let second = io
            .read_mapped(&runs, page_sectors, page_sectors)
            .and_then(|bytes| RestartPage::parse(&bytes));

        let restart = match (first, second) {
            (Ok(a), Ok(b)) => {
                if b.current_lsn > a.current_lsn {
                    b
                } else {
                    a
                }
            }
            (Ok(a), Err(e)) | (Err(e), Ok(a)) => {
                warn!("One $LogFile restart page is unreadable: {}", e);
                a
            }
            (Err(e), Err(_)) => return Err(e),
        };

        if restart.file_size != file_size {
            return Err(StrataError::InvalidData(format!(
                "restart area describes a {}-byte log, $LogFile is {} bytes",
                restart.file_size, file_size
            )));
        }
        let page_size = restart.log_page_size;
        if page_size as u64 * (RESTART_PAGE_COUNT + 2) > file_size {
            return Err(StrataError::InvalidData(format!(
                "$LogFile of {} bytes is too small for {}-byte pages",
                file_size, page_size
            )));
        }
        if !restart.is_clean() {
            warn!("$LogFile was not shut down cleanly, records after {} are not replayed", restart.current_lsn);
        }

        let sequence_bits = restart.sequence_number_bits;
        let (sequence_number, next_page) = if restart.current_lsn.is_valid() {
            let offset = restart.current_lsn.file_offset(sequence_bits);
            (
                restart.current_lsn.sequence(sequence_bits),
                offset / page_size as u64 + 1,
            )
        } else {
            (1, RESTART_PAGE_COUNT)
        };

        let mut client = Self {
            runs,
            file_size,
            page_size,
            bytes_per_sector,
            sequence_bits,
            sequence_number,
            next_offset: 0,
            page: vec![0u8; page_size as usize],
            page_header: RecordPageHeader::default(),
            page_update_sequence: 1,
            last_lsn: restart.current_lsn,
            restart,
            open_attributes: Vec::new(),
            transactions: BTreeMap::new(),
            next_transaction_id: 1,
            stats: LogFileStats::default(),
        };
        client.restart.restart_log_open_count = client.restart.restart_log_open_count.wrapping_add(1);
        client.start_page(next_page);
        client.stats.current_lsn = client.last_lsn.0;
        client.stats.restart_lsn = client.restart.client_restart_lsn.0;
        info!(
            "Opened $LogFile ({} bytes, {}-byte pages), continuing after {}",
            file_size, page_size, client.last_lsn
        );
        Ok(client)
    }

    fn page_count(&self) -> u64 {
        self.file_size / self.page_size as u64
    }

    fn data_offset(&self) -> usize {
        record_page_data_offset(self.page_size)
    }

    /// Reset the page buffer to the start of record page `index`, wrapping when needed
    fn start_page(&mut self, mut index: u64) {
        if index >= self.page_count() {
            index = RESTART_PAGE_COUNT;
            self.sequence_number += 1;
            self.stats.wraps += 1;
            debug!("$LogFile wrapped, sequence number now {}", self.sequence_number);
        }
        self.page.iter_mut().for_each(|b| *b = 0);
        self.page_header = RecordPageHeader {
            page_count: 1,
            page_position: 1,
            ..RecordPageHeader::default()
        };
        self.next_offset = index * self.page_size as u64 + self.data_offset() as u64;
    }

    fn current_page_index(&self) -> u64 {
        self.next_offset / self.page_size as u64
    }

    fn flush_page(&mut self, io: &VolumeIo) -> Result<(), StrataError> {
        let offset_in_page = (self.next_offset % self.page_size as u64) as usize;
        self.page_header.next_record_offset = if offset_in_page == 0 {
            self.page_size as u16
        } else {
            offset_in_page as u16
        };
        let mut bytes = self.page.clone();
        self.page_header.write(&mut bytes);
        self.page_update_sequence = next_update_sequence_number(self.page_update_sequence);
        apply_fixup(&mut bytes, self.page_update_sequence)?;
        let page_start = if offset_in_page == 0 {
            self.next_offset - self.page_size as u64
        } else {
            self.current_page_index() * self.page_size as u64
        };
        io.write_mapped(&self.runs, page_start / self.bytes_per_sector as u64, &bytes)?;
        self.stats.bytes_written += self.page_size as u64;
        Ok(())
    }

    /// Append a record (header plus client data), returning its LSN
    fn append_record(
        &mut self,
        io: &VolumeIo,
        mut header: LogRecordHeader,
        client_data: &[u8],
    ) -> Result<Lsn, StrataError> {
        let page_size = self.page_size as u64;
        let data_offset = self.data_offset() as u64;
        let usable_per_page = page_size - data_offset;
        let total = (LOG_RECORD_HEADER_LENGTH + align8(client_data.len())) as u64;
        if total > usable_per_page * (self.page_count() - RESTART_PAGE_COUNT) {
            return Err(StrataError::InvalidInput(format!(
                "log record of {} bytes exceeds the $LogFile record area",
                total
            )));
        }

        // The header never straddles a page boundary
        let remaining = page_size - self.next_offset % page_size;
        if remaining < LOG_RECORD_HEADER_LENGTH as u64 {
            self.flush_page(io)?;
            let next = self.current_page_index() + 1;
            self.start_page(next);
        }

        let lsn = Lsn::new(self.sequence_number, self.next_offset, self.sequence_bits);
        header.this_lsn = lsn;
        let remaining = page_size - self.next_offset % page_size;
        let spans_pages = total > remaining;
        if spans_pages {
            header.flags |= LOG_RECORD_MULTI_PAGE;
        }

        let mut record = Vec::with_capacity(total as usize);
        record.extend_from_slice(&header.to_bytes());
        record.extend_from_slice(client_data);
        record.resize(total as usize, 0);

        self.page_header.last_lsn = lsn;
        if spans_pages {
            let later_pages = (total - remaining).div_ceil(usable_per_page);
            self.page_header.page_count = (1 + later_pages) as u16;
        }
        let mut written = 0usize;
        let mut position = 1u16;
        while written < record.len() {
            let in_page = (self.next_offset % page_size) as usize;
            let room = self.page_size as usize - in_page;
            let chunk = room.min(record.len() - written);
            self.page[in_page..in_page + chunk].copy_from_slice(&record[written..written + chunk]);
            written += chunk;
            self.next_offset += chunk as u64;
            if written < record.len() {
                self.flush_page(io)?;
                let next = self.current_page_index();
                let page_count = self.page_header.page_count;
                self.start_page(next);
                position += 1;
                self.page_header.page_count = page_count;
                self.page_header.page_position = position;
                self.page_header.last_lsn = lsn;
            }
        }
        self.page_header.flags |= LOG_PAGE_RECORD_END;
        self.page_header.last_end_lsn = lsn;
        self.flush_page(io)?;
        if self.next_offset % page_size == 0 {
            let next = self.current_page_index();
            self.start_page(next);
        }

        self.last_lsn = lsn;
        self.stats.current_lsn = lsn.0;
        self.stats.records_written += 1;
        let used = self.next_offset.saturating_sub(RESTART_PAGE_COUNT * page_size);
        let area = self.file_size - RESTART_PAGE_COUNT * page_size;
        self.stats.usage_percent = (used as f64 / area as f64 * 100.0) as f32;
        trace!("Appended {}-byte log record at {}", total, lsn);
        Ok(lsn)
    }

    /// Index of the target stream in the open attribute table
    fn open_attribute_offset(&mut self, target: &LogTarget) -> u16 {
        let key = OpenAttribute {
            segment: target.segment,
            attribute_type: target.attribute_type,
            attribute_name: target.attribute_name.clone(),
        };
        let index = match self.open_attributes.iter().position(|a| *a == key) {
            Some(index) => index,
            None => {
                self.open_attributes.push(key);
                self.open_attributes.len() - 1
            }
        };
        (OPEN_ATTRIBUTE_TABLE_HEADER + index * OPEN_ATTRIBUTE_ENTRY_LENGTH) as u16
    }

    pub fn allocate_transaction_id(&mut self) -> TransactionId {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1).max(1);
        self.transactions.insert(
            id,
            TransactionState {
                first_lsn: Lsn::INVALID,
                previous_lsn: Lsn::INVALID,
                undo_next_lsn: Lsn::INVALID,
            },
        );
        self.stats.active_transactions = self.transactions.len() as u32;
        id
    }

    fn ensure_dirty(&mut self, io: &VolumeIo) -> Result<(), StrataError> {
        if self.restart.is_clean() {
            self.restart.flags &= !RESTART_AREA_CLEAN;
            self.write_restart_pages(io)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_log_record(
        &mut self,
        io: &VolumeIo,
        target: &LogTarget,
        redo_operation: LogOperation,
        redo_data: &[u8],
        undo_operation: LogOperation,
        undo_data: &[u8],
        transaction_id: TransactionId,
    ) -> Result<Lsn, StrataError> {
        let state = *self.transactions.get(&transaction_id).ok_or_else(|| {
            StrataError::InvalidInput(format!("unknown transaction {}", transaction_id))
        })?;
        self.ensure_dirty(io)?;

        let bytes_per_cluster = io.geometry().bytes_per_cluster as u64;
        let bytes_per_sector = io.geometry().bytes_per_sector as u64;
        let record = NtfsLogRecord {
            redo_operation: redo_operation as u16,
            undo_operation: undo_operation as u16,
            target_attribute: self.open_attribute_offset(target),
            record_offset: 0,
            attribute_offset: 0,
            cluster_block_offset: ((target.stream_offset % bytes_per_cluster) / bytes_per_sector) as u16,
            target_vcn: target.stream_offset / bytes_per_cluster,
            redo_data: redo_data.to_vec(),
            undo_data: undo_data.to_vec(),
        };
        let client_data = record.to_bytes();
        let header = LogRecordHeader {
            this_lsn: Lsn::INVALID,
            client_previous_lsn: state.previous_lsn,
            client_undo_next_lsn: state.undo_next_lsn,
            client_data_length: client_data.len() as u32,
            record_type: LOG_RECORD_CLIENT,
            transaction_id,
            flags: 0,
        };
        let lsn = self.append_record(io, header, &client_data)?;
        if let Some(state) = self.transactions.get_mut(&transaction_id) {
            if !state.first_lsn.is_valid() {
                state.first_lsn = lsn;
            }
            state.previous_lsn = lsn;
            state.undo_next_lsn = lsn;
        }
        trace!(
            "{:?}/{:?} for {} {} at offset {} ({})",
            redo_operation,
            undo_operation,
            target.segment,
            target.attribute_type,
            target.stream_offset,
            lsn
        );
        Ok(lsn)
    }

    /// Commit point: the transaction's records no longer need undo
    pub fn write_forget_transaction_record(
        &mut self,
        io: &VolumeIo,
        transaction_id: TransactionId,
    ) -> Result<Lsn, StrataError> {
        let state = self.transactions.remove(&transaction_id).ok_or_else(|| {
            StrataError::InvalidInput(format!("unknown transaction {}", transaction_id))
        })?;
        self.stats.active_transactions = self.transactions.len() as u32;
        if !state.first_lsn.is_valid() {
            // Nothing was logged, nothing to forget
            return Ok(self.last_lsn);
        }
        let record = NtfsLogRecord {
            redo_operation: LogOperation::ForgetTransaction as u16,
            undo_operation: LogOperation::CompensationLogRecord as u16,
            target_attribute: 0,
            record_offset: 0,
            attribute_offset: 0,
            cluster_block_offset: 0,
            target_vcn: 0,
            redo_data: Vec::new(),
            undo_data: Vec::new(),
        };
        let client_data = record.to_bytes();
        let header = LogRecordHeader {
            this_lsn: Lsn::INVALID,
            client_previous_lsn: state.previous_lsn,
            client_undo_next_lsn: Lsn::INVALID,
            client_data_length: client_data.len() as u32,
            record_type: LOG_RECORD_CLIENT,
            transaction_id,
            flags: 0,
        };
        let lsn = self.append_record(io, header, &client_data)?;
        debug!("Forgot transaction {} ({})", transaction_id, lsn);
        Ok(lsn)
    }

    /// Write a checkpoint and point both restart areas at it.
    /// The restart area is marked clean only when asked and no transaction is open.
    pub fn write_restart_record(&mut self, io: &VolumeIo, clean: bool) -> Result<Lsn, StrataError> {
        if !self.transactions.is_empty() {
            warn!(
                "Writing restart record with {} open transaction(s)",
                self.transactions.len()
            );
        }
        let start_of_checkpoint = Lsn::new(self.sequence_number, self.next_offset, self.sequence_bits);
        let mut client_data = vec![0u8; CLIENT_RESTART_DATA_LENGTH];
        // Restart record version 1.0
        LittleEndian::write_u32(&mut client_data[0x00..0x04], 1);
        LittleEndian::write_u32(&mut client_data[0x04..0x08], 0);
        LittleEndian::write_u64(&mut client_data[0x08..0x10], start_of_checkpoint.0);
        let oldest = self
            .transactions
            .values()
            .map(|t| t.first_lsn)
            .filter(|l| l.is_valid())
            .min()
            .unwrap_or(start_of_checkpoint);

        let header = LogRecordHeader {
            this_lsn: Lsn::INVALID,
            client_previous_lsn: Lsn::INVALID,
            client_undo_next_lsn: Lsn::INVALID,
            client_data_length: client_data.len() as u32,
            record_type: LOG_RECORD_CLIENT_RESTART,
            transaction_id: 0,
            flags: 0,
        };
        let lsn = self.append_record(io, header, &client_data)?;

        self.restart.current_lsn = lsn;
        self.restart.client_restart_lsn = lsn;
        self.restart.oldest_lsn = oldest;
        self.restart.last_lsn_data_length = client_data.len() as u32;
        if clean && self.transactions.is_empty() {
            self.restart.flags |= RESTART_AREA_CLEAN;
        } else {
            self.restart.flags &= !RESTART_AREA_CLEAN;
        }
        self.write_restart_pages(io)?;
        self.stats.restart_lsn = lsn.0;
        self.stats.restart_records_written += 1;
        debug!("Restart record at {} (clean: {})", lsn, self.restart.is_clean());
        Ok(lsn)
    }

    fn write_restart_pages(&mut self, io: &VolumeIo) -> Result<(), StrataError> {
        self.restart.update_sequence_number = next_update_sequence_number(self.restart.update_sequence_number);
        let bytes = self.restart.to_bytes()?;
        let page_sectors = self.page_size as u64 / self.bytes_per_sector as u64;
        io.write_mapped(&self.runs, 0, &bytes)?;
        io.write_mapped(&self.runs, page_sectors, &bytes)?;
        Ok(())
    }

    pub fn current_lsn(&self) -> Lsn {
        self.last_lsn
    }

    pub fn is_clean(&self) -> bool {
        self.restart.is_clean()
    }

    pub fn has_transaction(&self, transaction_id: TransactionId) -> bool {
        self.transactions.contains_key(&transaction_id)
    }

    pub fn stats(&self) -> LogFileStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::data_runs::Extent;
    use crate::ntfs::volume_io::{VolumeGeometry, VolumeIo};
    use std::sync::Arc;
    use strata_core::{BlockDevice, MemoryBlockDevice};

    const LOG_SIZE: u64 = 64 * 1024;

    fn setup() -> (VolumeIo, DataRunSequence) {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::with_size(512, 1024 * 1024));
        let geometry = VolumeGeometry {
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            bytes_per_cluster: 4096,
            bytes_per_file_record_segment: 1024,
            bytes_per_index_record: 4096,
            mft_start_lcn: 4,
            mft_mirror_start_lcn: 2,
        };
        let io = VolumeIo::new(device, geometry, 256, false);
        let runs = DataRunSequence::from_extents(&[Extent::new(16, LOG_SIZE / 4096)]);
        let pages = LogClient::initial_restart_pages(LOG_SIZE).unwrap();
        io.write_mapped(&runs, 0, &pages).unwrap();
        (io, runs)
    }

    fn target() -> LogTarget {
        LogTarget::new(MftSegmentReference::new(6, 6), AttributeType::DATA, "", 4096)
    }

    #[test]
    fn test_lsns_increase_and_transactions_are_tracked() {
        let (io, runs) = setup();
        let mut client = LogClient::open(&io, runs, LOG_SIZE).unwrap();
        assert!(client.is_clean());
        let tx = client.allocate_transaction_id();
        let first = client
            .write_log_record(
                &io,
                &target(),
                LogOperation::SetBitsInNonResidentBitMap,
                &[0, 0, 0, 0, 1, 0, 0, 0],
                LogOperation::ClearBitsInNonResidentBitMap,
                &[0, 0, 0, 0, 1, 0, 0, 0],
                tx,
            )
            .unwrap();
        let second = client
            .write_log_record(&io, &target(), LogOperation::Noop, &[], LogOperation::Noop, &[], tx)
            .unwrap();
        assert!(second > first);
        assert!(!client.is_clean());
        assert_eq!(client.stats().active_transactions, 1);

        client.write_forget_transaction_record(&io, tx).unwrap();
        assert_eq!(client.stats().active_transactions, 0);
        assert!(client
            .write_log_record(&io, &target(), LogOperation::Noop, &[], LogOperation::Noop, &[], tx)
            .is_err());
    }

    #[test]
    fn test_wraps_back_to_first_record_page() {
        let (io, runs) = setup();
        let mut client = LogClient::open(&io, runs, LOG_SIZE).unwrap();
        let tx = client.allocate_transaction_id();
        let image = vec![0xABu8; 2048];
        let mut previous = Lsn::INVALID;
        for _ in 0..64 {
            let lsn = client
                .write_log_record(
                    &io,
                    &target(),
                    LogOperation::InitializeFileRecordSegment,
                    &image,
                    LogOperation::DeallocateFileRecordSegment,
                    &[],
                    tx,
                )
                .unwrap();
            assert!(lsn > previous);
            previous = lsn;
        }
        assert!(client.stats().wraps >= 1);
    }

    #[test]
    fn test_clean_restart_survives_reopen() {
        let (io, runs) = setup();
        let mut client = LogClient::open(&io, runs.clone(), LOG_SIZE).unwrap();
        let tx = client.allocate_transaction_id();
        client
            .write_log_record(&io, &target(), LogOperation::Noop, &[1], LogOperation::Noop, &[], tx)
            .unwrap();
        client.write_forget_transaction_record(&io, tx).unwrap();
        let restart_lsn = client.write_restart_record(&io, true).unwrap();
        assert!(client.is_clean());

        let reopened = LogClient::open(&io, runs, LOG_SIZE).unwrap();
        assert!(reopened.is_clean());
        assert_eq!(reopened.current_lsn(), restart_lsn);
    }
}
