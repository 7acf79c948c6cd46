// Record allocation bitmaps
// A bit vector stored in an attribute stream: the MFT's $BITMAP and the $BITMAP that
// accompanies every $INDEX_ALLOCATION.

use crate::ntfs::attribute_data::AttributeData;
use crate::ntfs::file_record::FileRecord;
use crate::ntfs::logfile::{LogOperation, LogTarget, TransactionId};
use crate::ntfs::structures::{align8, AttributeType};
use crate::ntfs::volume_io::{RecordStore, VolumeContext};
use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use strata_core::StrataError;

pub struct BitmapData<'a> {
    ctx: &'a VolumeContext,
    data: AttributeData<'a>,
    search_start_index: u64,
    number_of_usable_bits: u64,
    /// Counted on first use, then kept up to date by every bit change
    free_bits: Option<u64>,
}

impl<'a> BitmapData<'a> {
    pub fn new(
        ctx: &'a VolumeContext,
        record: &'a mut FileRecord,
        attribute_type: AttributeType,
        name: &str,
        number_of_usable_bits: u64,
    ) -> Result<Self, StrataError> {
        let data = AttributeData::new(ctx, record, attribute_type, name)?;
        let length = data.length()?;
        if number_of_usable_bits > length * 8 {
            return Err(StrataError::InvalidData(format!(
                "{} of {} bytes cannot hold {} bits",
                attribute_type, length, number_of_usable_bits
            )));
        }
        Ok(Self {
            ctx,
            data,
            search_start_index: 0,
            number_of_usable_bits,
            free_bits: None,
        })
    }

    pub fn with_search_start(mut self, index: u64) -> Self {
        self.search_start_index = index;
        self
    }

    /// Start from a free count kept by the owner of the bitmap
    pub fn with_free_count(mut self, free_bits: Option<u64>) -> Self {
        self.free_bits = free_bits;
        self
    }

    /// The free count if it has been computed
    pub fn cached_free_count(&self) -> Option<u64> {
        self.free_bits
    }

    /// Number of clear usable bits
    pub fn free_bit_count(&mut self) -> Result<u64, StrataError> {
        if let Some(free) = self.free_bits {
            return Ok(free);
        }
        let bytes = self.data.read_bytes(0, self.number_of_usable_bits.div_ceil(8) as usize)?;
        let mut set = 0u64;
        for (i, byte) in bytes.iter().enumerate() {
            let first_bit = i as u64 * 8;
            let bits = (self.number_of_usable_bits - first_bit).min(8);
            let mask = if bits == 8 { 0xFF } else { (1u8 << bits) - 1 };
            set += (byte & mask).count_ones() as u64;
        }
        let free = self.number_of_usable_bits - set;
        self.free_bits = Some(free);
        Ok(free)
    }

    pub fn search_start_index(&self) -> u64 {
        self.search_start_index
    }

    pub fn number_of_usable_bits(&self) -> u64 {
        self.number_of_usable_bits
    }

    pub fn record(&self) -> &FileRecord {
        self.data.record()
    }

    pub fn is_bit_set(&self, index: u64) -> Result<bool, StrataError> {
        if index >= self.number_of_usable_bits {
            return Err(StrataError::OutOfRange(format!(
                "bit {} beyond {} usable bits",
                index, self.number_of_usable_bits
            )));
        }
        let byte = self.data.read_bytes(index / 8, 1)?;
        Ok(byte.first().is_some_and(|b| b & (1 << (index % 8)) != 0))
    }

    /// First clear bit in `[start, end)`, read one cluster at a time
    fn find_clear_bit(&self, start: u64, end: u64) -> Result<Option<u64>, StrataError> {
        let end = end.min(self.number_of_usable_bits);
        let chunk_bits = self.ctx.geometry().bytes_per_cluster as u64 * 8;
        let mut index = start;
        while index < end {
            let chunk_start = index / chunk_bits * chunk_bits;
            let bytes = self.data.read_bytes(chunk_start / 8, (chunk_bits / 8) as usize)?;
            if bytes.is_empty() {
                break;
            }
            let chunk_end = end.min(chunk_start + bytes.len() as u64 * 8);
            while index < chunk_end {
                let relative = index - chunk_start;
                let byte = bytes[(relative / 8) as usize];
                if byte == 0xFF && relative % 8 == 0 {
                    index += 8;
                    continue;
                }
                if byte & (1 << (relative % 8)) == 0 {
                    return Ok(Some(index));
                }
                index += 1;
            }
        }
        Ok(None)
    }

    fn change_bit(
        &mut self,
        store: &mut dyn RecordStore,
        index: u64,
        set: bool,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let byte_offset = index / 8;
        let current = self.data.read_bytes(byte_offset, 1)?;
        let current = current.first().copied().unwrap_or(0);
        let mask = 1u8 << (index % 8);
        let updated = if set { current | mask } else { current & !mask };

        if !self.data.is_resident()? {
            // Resident bitmaps are covered by the file record image
            let stream_offset = byte_offset / 8 * 8;
            let mut range = [0u8; 8];
            LittleEndian::write_u32(&mut range[0..4], (index - stream_offset * 8) as u32);
            LittleEndian::write_u32(&mut range[4..8], 1);
            let (redo, undo) = if set {
                (LogOperation::SetBitsInNonResidentBitMap, LogOperation::ClearBitsInNonResidentBitMap)
            } else {
                (LogOperation::ClearBitsInNonResidentBitMap, LogOperation::SetBitsInNonResidentBitMap)
            };
            let target = LogTarget::new(
                self.data.record().reference(),
                self.data.attribute_type(),
                self.attribute_name(),
                stream_offset,
            );
            self.ctx
                .write_log_record(&target, redo, &range, undo, &range, transaction_id)?;
        }
        self.data.write_bytes(store, byte_offset, &[updated], transaction_id)
    }

    fn attribute_name(&self) -> &str {
        self.data.name()
    }

    /// Allocate the first clear bit in `[search_start, search_end)`
    pub fn allocate_in_range(
        &mut self,
        store: &mut dyn RecordStore,
        search_start: u64,
        search_end: u64,
        transaction_id: TransactionId,
    ) -> Result<Option<u64>, StrataError> {
        let Some(index) = self.find_clear_bit(search_start, search_end)? else {
            return Ok(None);
        };
        self.change_bit(store, index, true, transaction_id)?;
        self.free_bits = self.free_bits.map(|free| free.saturating_sub(1));
        self.search_start_index = index + 1;
        trace!("{} bit {} allocated", self.data.attribute_type(), index);
        Ok(Some(index))
    }

    /// Allocate from the search cursor to the end, then wrap to `floor`
    pub fn allocate_record(
        &mut self,
        store: &mut dyn RecordStore,
        floor: u64,
        transaction_id: TransactionId,
    ) -> Result<Option<u64>, StrataError> {
        if self.free_bits == Some(0) {
            return Ok(None);
        }
        let start = self.search_start_index.max(floor);
        if let Some(index) = self.allocate_in_range(store, start, self.number_of_usable_bits, transaction_id)? {
            return Ok(Some(index));
        }
        if start > floor {
            return self.allocate_in_range(store, floor, start, transaction_id);
        }
        Ok(None)
    }

    /// Clear a bit. Nothing is logged when it is already clear.
    pub fn deallocate_record(
        &mut self,
        store: &mut dyn RecordStore,
        index: u64,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        if !self.is_bit_set(index)? {
            return Ok(());
        }
        self.change_bit(store, index, false, transaction_id)?;
        self.free_bits = self.free_bits.map(|free| free + 1);
        trace!("{} bit {} released", self.data.attribute_type(), index);
        Ok(())
    }

    /// Add `additional_bits` usable bits, growing the stream in 8-byte steps.
    /// With `prewrite` the new bytes are written as zeros so the valid data length
    /// follows the stream length.
    pub fn extend_bitmap(
        &mut self,
        store: &mut dyn RecordStore,
        additional_bits: u64,
        prewrite: bool,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let usable = self.number_of_usable_bits + additional_bits;
        let needed = align8(usable.div_ceil(8) as usize) as u64;
        let length = self.data.length()?;
        if needed > length {
            if prewrite {
                let zeros = vec![0u8; (needed - length) as usize];
                self.data.write_bytes(store, length, &zeros, transaction_id)?;
            } else {
                self.data.extend(store, needed - length, transaction_id)?;
            }
        }
        self.number_of_usable_bits = usable;
        // New bits read as zero
        self.free_bits = self.free_bits.map(|free| free + additional_bits);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::attributes::AttributeRecord;
    use crate::test_helpers::{scratch_context, scratch_record, NullRecordStore};

    fn bitmap_record(bytes: usize) -> FileRecord {
        let mut record = scratch_record();
        record.add_attribute(AttributeRecord::new_resident(AttributeType::BITMAP, "$I30", vec![0u8; bytes]));
        record
    }

    #[test]
    fn test_exhaustion_and_first_fit_reuse() {
        let ctx = scratch_context(256);
        let tx = ctx.allocate_transaction_id().unwrap();
        let mut record = bitmap_record(8);
        let mut store = NullRecordStore::default();
        let mut bitmap = BitmapData::new(&ctx, &mut record, AttributeType::BITMAP, "$I30", 12).unwrap();
        for expected in 0..12 {
            assert_eq!(bitmap.allocate_record(&mut store, 0, tx).unwrap(), Some(expected));
        }
        assert_eq!(bitmap.allocate_record(&mut store, 0, tx).unwrap(), None);

        bitmap.deallocate_record(&mut store, 5, tx).unwrap();
        assert!(!bitmap.is_bit_set(5).unwrap());
        // The cursor is past 5, the wrapped search still finds it
        assert_eq!(bitmap.allocate_record(&mut store, 0, tx).unwrap(), Some(5));
    }

    #[test]
    fn test_free_count_follows_changes() {
        let ctx = scratch_context(256);
        let tx = ctx.allocate_transaction_id().unwrap();
        let mut record = bitmap_record(8);
        let mut store = NullRecordStore::default();
        let mut bitmap = BitmapData::new(&ctx, &mut record, AttributeType::BITMAP, "$I30", 20).unwrap();
        bitmap.allocate_in_range(&mut store, 0, 3, tx).unwrap();
        assert_eq!(bitmap.cached_free_count(), None);
        assert_eq!(bitmap.free_bit_count().unwrap(), 19);

        bitmap.allocate_record(&mut store, 0, tx).unwrap();
        bitmap.deallocate_record(&mut store, 0, tx).unwrap();
        bitmap.deallocate_record(&mut store, 0, tx).unwrap();
        bitmap.extend_bitmap(&mut store, 4, false, tx).unwrap();
        assert_eq!(bitmap.cached_free_count(), Some(23));
        for _ in 0..23 {
            assert!(bitmap.allocate_record(&mut store, 0, tx).unwrap().is_some());
        }
        assert_eq!(bitmap.free_bit_count().unwrap(), 0);
        assert_eq!(bitmap.allocate_record(&mut store, 0, tx).unwrap(), None);

        // A fresh count agrees with the maintained one
        let mut recounted = BitmapData::new(&ctx, &mut record, AttributeType::BITMAP, "$I30", 24).unwrap();
        assert_eq!(recounted.free_bit_count().unwrap(), 0);
    }

    #[test]
    fn test_floor_is_respected() {
        let ctx = scratch_context(256);
        let tx = ctx.allocate_transaction_id().unwrap();
        let mut record = bitmap_record(8);
        let mut store = NullRecordStore::default();
        let mut bitmap = BitmapData::new(&ctx, &mut record, AttributeType::BITMAP, "$I30", 64).unwrap();
        assert_eq!(bitmap.allocate_record(&mut store, 24, tx).unwrap(), Some(24));
        assert_eq!(bitmap.allocate_in_range(&mut store, 0, 2, tx).unwrap(), Some(0));
    }

    #[test]
    fn test_extend_grows_in_eight_byte_steps() {
        let ctx = scratch_context(256);
        let tx = ctx.allocate_transaction_id().unwrap();
        let mut record = bitmap_record(8);
        let mut store = NullRecordStore::default();
        {
            let mut bitmap = BitmapData::new(&ctx, &mut record, AttributeType::BITMAP, "$I30", 64).unwrap();
            bitmap.extend_bitmap(&mut store, 1, true, tx).unwrap();
            assert_eq!(bitmap.number_of_usable_bits(), 65);
            assert_eq!(bitmap.allocate_in_range(&mut store, 64, 65, tx).unwrap(), Some(64));
        }
        assert_eq!(record.get_attribute(AttributeType::BITMAP, "$I30").unwrap().data_length(), 16);
    }

    #[test]
    fn test_usable_bits_must_fit() {
        let ctx = scratch_context(256);
        let mut record = bitmap_record(8);
        assert!(BitmapData::new(&ctx, &mut record, AttributeType::BITMAP, "$I30", 65).is_err());
    }
}
