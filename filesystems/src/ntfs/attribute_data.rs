// Attribute stream access
// Byte-range read/write/extend/truncate over one attribute of a file record, whether its
// value lives inside the record or in clusters described by a run list.

use crate::ntfs::attributes::{AttributeRecord, NonResidentAttributeRecord};
use crate::ntfs::data_runs::DataRunSequence;
use crate::ntfs::file_record::FileRecord;
use crate::ntfs::logfile::TransactionId;
use crate::ntfs::structures::AttributeType;
use crate::ntfs::volume_io::{RecordStore, VolumeContext, VolumeIo};
use log::debug;
use strata_core::StrataError;

/// Zero-fill is written in pieces of this many sectors
const ZERO_FILL_CHUNK_SECTORS: u64 = 128;

fn find<'r>(record: &'r FileRecord, attribute_type: AttributeType, name: &str) -> Result<&'r AttributeRecord, StrataError> {
    record.get_attribute(attribute_type, name).ok_or_else(|| {
        StrataError::InvalidData(format!(
            "file record {} has no {} attribute named '{}'",
            record.segment_number(),
            attribute_type,
            name
        ))
    })
}

fn find_mut<'r>(
    record: &'r mut FileRecord,
    attribute_type: AttributeType,
    name: &str,
) -> Result<&'r mut AttributeRecord, StrataError> {
    let segment = record.segment_number();
    record.get_attribute_mut(attribute_type, name).ok_or_else(|| {
        StrataError::InvalidData(format!(
            "file record {} has no {} attribute named '{}'",
            segment, attribute_type, name
        ))
    })
}

/// Transient view of one attribute stream
pub struct AttributeData<'a> {
    ctx: &'a VolumeContext,
    record: &'a mut FileRecord,
    attribute_type: AttributeType,
    name: String,
}

impl<'a> AttributeData<'a> {
    pub fn new(
        ctx: &'a VolumeContext,
        record: &'a mut FileRecord,
        attribute_type: AttributeType,
        name: &str,
    ) -> Result<Self, StrataError> {
        find(record, attribute_type, name)?;
        Ok(Self {
            ctx,
            record,
            attribute_type,
            name: name.to_string(),
        })
    }

    pub fn record(&self) -> &FileRecord {
        self.record
    }

    pub fn attribute_type(&self) -> AttributeType {
        self.attribute_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn attribute(&self) -> Result<&AttributeRecord, StrataError> {
        find(self.record, self.attribute_type, &self.name)
    }

    pub fn length(&self) -> Result<u64, StrataError> {
        Ok(self.attribute()?.data_length())
    }

    pub fn allocated_length(&self) -> Result<u64, StrataError> {
        Ok(match self.attribute()? {
            AttributeRecord::Resident(r) => r.data.len() as u64,
            AttributeRecord::NonResident(r) => r.allocated_length,
        })
    }

    pub fn valid_data_length(&self) -> Result<u64, StrataError> {
        Ok(match self.attribute()? {
            AttributeRecord::Resident(r) => r.data.len() as u64,
            AttributeRecord::NonResident(r) => r.valid_data_length,
        })
    }

    pub fn is_resident(&self) -> Result<bool, StrataError> {
        Ok(self.attribute()?.is_resident())
    }

    /// Read whole stream sectors. Bytes past the valid data length read as zero.
    pub fn read_sectors(&self, first_sector: u64, count: u64) -> Result<Vec<u8>, StrataError> {
        read_stream_sectors(self.ctx.io(), self.attribute()?, first_sector, count)
    }

    /// Read up to `length` bytes at `offset`, clamped to the stream length
    pub fn read_bytes(&self, offset: u64, length: usize) -> Result<Vec<u8>, StrataError> {
        read_stream_bytes(self.ctx.io(), self.attribute()?, offset, length)
    }

    /// Write `data` at `offset`, growing the stream first when needed
    pub fn write_bytes(
        &mut self,
        store: &mut dyn RecordStore,
        offset: u64,
        data: &[u8],
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        if data.is_empty() {
            return Ok(());
        }
        self.ctx.io().check_writable()?;
        let end = offset + data.len() as u64;
        let length = self.length()?;
        if end > length {
            self.extend(store, end - length, transaction_id)?;
        }

        let attribute = find_mut(self.record, self.attribute_type, &self.name)?;
        let record_changed = match attribute {
            AttributeRecord::Resident(r) => {
                r.data[offset as usize..end as usize].copy_from_slice(data);
                true
            }
            AttributeRecord::NonResident(r) => {
                let valid = r.valid_data_length;
                if offset > valid {
                    let mut position = valid;
                    let chunk = ZERO_FILL_CHUNK_SECTORS * self.ctx.geometry().bytes_per_sector as u64;
                    while position < offset {
                        let piece = chunk.min(offset - position);
                        write_through(self.ctx, r, position, &vec![0u8; piece as usize], position)?;
                        position += piece;
                    }
                }
                write_through(self.ctx, r, offset, data, valid.max(offset))?;
                if end > valid {
                    r.valid_data_length = end;
                    true
                } else {
                    false
                }
            }
        };
        if record_changed {
            store.update_file_record(self.ctx, self.record, transaction_id)?;
        }
        Ok(())
    }

    /// Grow the stream by `additional` bytes. The new bytes read as zero.
    pub fn extend(
        &mut self,
        store: &mut dyn RecordStore,
        additional: u64,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        if additional == 0 {
            return Ok(());
        }
        let geometry = *self.ctx.geometry();
        let threshold = geometry.attribute_record_length_to_make_non_resident();
        let attribute = find_mut(self.record, self.attribute_type, &self.name)?;
        match attribute {
            AttributeRecord::Resident(r) => {
                let new_length = r.data.len() as u64 + additional;
                let mut grown = AttributeRecord::Resident(r.clone());
                if let AttributeRecord::Resident(g) = &mut grown {
                    g.data.resize(new_length as usize, 0);
                }
                let stays_resident = self.attribute_type == AttributeType::ATTRIBUTE_LIST
                    || grown.record_length() <= threshold;
                if stays_resident {
                    r.data.resize(new_length as usize, 0);
                } else {
                    let converted = self.make_non_resident(new_length, transaction_id)?;
                    self.record.replace_attribute(converted)?;
                }
            }
            AttributeRecord::NonResident(r) => {
                let new_size = r.file_size + additional;
                if new_size > r.allocated_length {
                    let have = r.allocated_length / geometry.bytes_per_cluster as u64;
                    let need = geometry.clusters_for(new_size) - have;
                    let extents = self.ctx.allocate_clusters(
                        r.data_runs.next_contiguous_lcn(),
                        need,
                        transaction_id,
                    )?;
                    for extent in extents {
                        r.data_runs.append_extent(extent);
                    }
                    r.allocated_length = (have + need) * geometry.bytes_per_cluster as u64;
                }
                r.file_size = new_size;
            }
        }
        store.update_file_record(self.ctx, self.record, transaction_id)
    }

    /// Copy the resident value into newly allocated clusters and build the record that replaces it
    fn make_non_resident(&self, new_length: u64, transaction_id: TransactionId) -> Result<AttributeRecord, StrataError> {
        let AttributeRecord::Resident(resident) = self.attribute()? else {
            return Err(StrataError::InvalidData("attribute is already non-resident".to_string()));
        };
        let geometry = self.ctx.geometry();
        let clusters = geometry.clusters_for(new_length);
        let extents = self.ctx.allocate_clusters(None, clusters, transaction_id)?;
        let data_runs = DataRunSequence::from_extents(&extents);

        let bytes_per_sector = geometry.bytes_per_sector as usize;
        if !resident.data.is_empty() {
            let mut padded = resident.data.clone();
            padded.resize(resident.data.len().div_ceil(bytes_per_sector) * bytes_per_sector, 0);
            self.ctx.io().write_mapped(&data_runs, 0, &padded)?;
        }
        debug!(
            "{} of file record {} moved to {} cluster(s)",
            self.attribute_type,
            self.record.segment_number(),
            clusters
        );
        Ok(AttributeRecord::NonResident(NonResidentAttributeRecord {
            flags: resident.flags,
            instance: resident.instance,
            allocated_length: clusters * geometry.bytes_per_cluster as u64,
            file_size: new_length,
            valid_data_length: resident.data.len() as u64,
            data_runs,
            ..NonResidentAttributeRecord::new(self.attribute_type, &self.name)
        }))
    }

    /// Shrink the stream to `new_length`, releasing clusters no longer needed
    pub fn truncate(
        &mut self,
        store: &mut dyn RecordStore,
        new_length: u64,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let geometry = *self.ctx.geometry();
        let attribute = find_mut(self.record, self.attribute_type, &self.name)?;
        let released = match attribute {
            AttributeRecord::Resident(r) => {
                if new_length > r.data.len() as u64 {
                    return Err(StrataError::InvalidInput(format!(
                        "cannot truncate {} bytes to {}",
                        r.data.len(),
                        new_length
                    )));
                }
                r.data.truncate(new_length as usize);
                Vec::new()
            }
            AttributeRecord::NonResident(r) => {
                if new_length > r.file_size {
                    return Err(StrataError::InvalidInput(format!(
                        "cannot truncate {} bytes to {}",
                        r.file_size, new_length
                    )));
                }
                let keep = geometry.clusters_for(new_length);
                let current = r.data_runs.data_cluster_count();
                let released = if keep < current {
                    let released = r.data_runs.translate_to_lcn(keep, current - keep)?;
                    r.data_runs.truncate(keep)?;
                    r.allocated_length = keep * geometry.bytes_per_cluster as u64;
                    released
                } else {
                    Vec::new()
                };
                r.file_size = new_length;
                r.valid_data_length = r.valid_data_length.min(new_length);
                released
            }
        };
        store.update_file_record(self.ctx, self.record, transaction_id)?;
        // Clusters go back only once no record points at them
        self.ctx.deallocate_clusters(&released, transaction_id)
    }

    pub fn set_length(
        &mut self,
        store: &mut dyn RecordStore,
        new_length: u64,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let length = self.length()?;
        if new_length > length {
            self.extend(store, new_length - length, transaction_id)
        } else if new_length < length {
            self.truncate(store, new_length, transaction_id)
        } else {
            Ok(())
        }
    }
}

/// Read whole sectors of an attribute's value. Bytes past the valid data length read as zero.
pub fn read_stream_sectors(
    io: &VolumeIo,
    attribute: &AttributeRecord,
    first_sector: u64,
    count: u64,
) -> Result<Vec<u8>, StrataError> {
    let bytes_per_sector = io.geometry().bytes_per_sector as u64;
    let start = first_sector * bytes_per_sector;
    let length = (count * bytes_per_sector) as usize;
    match attribute {
        AttributeRecord::Resident(r) => {
            let mut buffer = vec![0u8; length];
            if (start as usize) < r.data.len() {
                let available = (r.data.len() - start as usize).min(length);
                buffer[..available].copy_from_slice(&r.data[start as usize..start as usize + available]);
            }
            Ok(buffer)
        }
        AttributeRecord::NonResident(r) => {
            if start + length as u64 > r.allocated_length {
                return Err(StrataError::InvalidData(format!(
                    "read of {} bytes at {} beyond allocated length {}",
                    length, start, r.allocated_length
                )));
            }
            let mut buffer = io.read_mapped(&r.data_runs, first_sector, count)?;
            if start + length as u64 > r.valid_data_length {
                let keep = r.valid_data_length.saturating_sub(start) as usize;
                buffer[keep..].iter_mut().for_each(|b| *b = 0);
            }
            Ok(buffer)
        }
    }
}

/// Read up to `length` bytes of an attribute's value at `offset`, clamped to its length
pub fn read_stream_bytes(
    io: &VolumeIo,
    attribute: &AttributeRecord,
    offset: u64,
    length: usize,
) -> Result<Vec<u8>, StrataError> {
    let stream_length = attribute.data_length();
    if offset >= stream_length || length == 0 {
        return Ok(Vec::new());
    }
    let end = (offset + length as u64).min(stream_length);
    if let AttributeRecord::Resident(r) = attribute {
        return Ok(r.data[offset as usize..end as usize].to_vec());
    }
    let bytes_per_sector = io.geometry().bytes_per_sector as u64;
    let first_sector = offset / bytes_per_sector;
    let last_sector = (end - 1) / bytes_per_sector;
    let buffer = read_stream_sectors(io, attribute, first_sector, last_sector - first_sector + 1)?;
    let skip = (offset - first_sector * bytes_per_sector) as usize;
    Ok(buffer[skip..skip + (end - offset) as usize].to_vec())
}

/// Sector read-modify-write of `data` at `offset`. Bytes at or past `valid` inside the
/// touched sectors are zeroed rather than preserved.
fn write_through(
    ctx: &VolumeContext,
    record: &NonResidentAttributeRecord,
    offset: u64,
    data: &[u8],
    valid: u64,
) -> Result<(), StrataError> {
    let bytes_per_sector = ctx.geometry().bytes_per_sector as u64;
    let end = offset + data.len() as u64;
    let first_sector = offset / bytes_per_sector;
    let last_sector = (end - 1) / bytes_per_sector;
    let span_start = first_sector * bytes_per_sector;
    let mut buffer = if offset % bytes_per_sector == 0 && end % bytes_per_sector == 0 {
        vec![0u8; data.len()]
    } else {
        ctx.io()
            .read_mapped(&record.data_runs, first_sector, last_sector - first_sector + 1)?
    };
    if valid < span_start + buffer.len() as u64 {
        let keep = valid.saturating_sub(span_start) as usize;
        buffer[keep..].iter_mut().for_each(|b| *b = 0);
    }
    let skip = (offset - span_start) as usize;
    buffer[skip..skip + data.len()].copy_from_slice(data);
    ctx.io().write_mapped(&record.data_runs, first_sector, &buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{scratch_context, scratch_record, NullRecordStore};

    #[test]
    fn test_resident_write_and_read() {
        let ctx = scratch_context(256);
        let tx = ctx.allocate_transaction_id().unwrap();
        let mut record = scratch_record();
        let mut store = NullRecordStore::default();
        let mut data = AttributeData::new(&ctx, &mut record, AttributeType::DATA, "").unwrap();
        data.write_bytes(&mut store, 0, b"hello", tx).unwrap();
        data.write_bytes(&mut store, 3, b"p!", tx).unwrap();
        assert!(data.is_resident().unwrap());
        assert_eq!(data.read_bytes(0, 100).unwrap(), b"help!");
        assert!(data.read_bytes(5, 1).unwrap().is_empty());
        assert!(store.updates > 0);
    }

    #[test]
    fn test_promotion_keeps_bytes() {
        let ctx = scratch_context(256);
        let tx = ctx.allocate_transaction_id().unwrap();
        let mut record = scratch_record();
        let mut store = NullRecordStore::default();
        let mut data = AttributeData::new(&ctx, &mut record, AttributeType::DATA, "").unwrap();
        let head: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        data.write_bytes(&mut store, 0, &head, tx).unwrap();
        assert!(data.is_resident().unwrap());
        let before = data.read_bytes(10, 150).unwrap();

        let tail = vec![0x5Au8; 3000];
        data.write_bytes(&mut store, 200, &tail, tx).unwrap();
        assert!(!data.is_resident().unwrap());
        assert_eq!(data.length().unwrap(), 3200);
        assert_eq!(data.read_bytes(10, 150).unwrap(), before);
        assert_eq!(data.read_bytes(200, 3000).unwrap(), tail);
    }

    #[test]
    fn test_gap_past_valid_length_reads_zero() {
        let ctx = scratch_context(256);
        let tx = ctx.allocate_transaction_id().unwrap();
        let mut record = scratch_record();
        let mut store = NullRecordStore::default();
        let mut data = AttributeData::new(&ctx, &mut record, AttributeType::DATA, "").unwrap();
        data.write_bytes(&mut store, 0, &[1u8; 1000], tx).unwrap();
        data.write_bytes(&mut store, 9000, &[2u8; 100], tx).unwrap();
        assert_eq!(data.valid_data_length().unwrap(), 9100);
        let middle = data.read_bytes(1000, 8000).unwrap();
        assert!(middle.iter().all(|b| *b == 0));
        assert_eq!(data.read_bytes(990, 20).unwrap()[..10], [1u8; 10]);
        assert_eq!(data.read_bytes(9000, 200).unwrap(), vec![2u8; 100]);
    }

    #[test]
    fn test_extend_then_truncate_restores_length() {
        let ctx = scratch_context(256);
        let tx = ctx.allocate_transaction_id().unwrap();
        let mut record = scratch_record();
        let mut store = NullRecordStore::default();
        let mut data = AttributeData::new(&ctx, &mut record, AttributeType::DATA, "").unwrap();
        data.write_bytes(&mut store, 0, &[7u8; 5000], tx).unwrap();
        let free = ctx.free_clusters().unwrap();

        data.extend(&mut store, 20_000, tx).unwrap();
        assert_eq!(data.length().unwrap(), 25_000);
        assert!(ctx.free_clusters().unwrap() < free);
        // Extended bytes are beyond the valid data length
        assert!(data.read_bytes(5000, 100).unwrap().iter().all(|b| *b == 0));

        data.truncate(&mut store, 5000, tx).unwrap();
        assert_eq!(data.length().unwrap(), 5000);
        assert_eq!(ctx.free_clusters().unwrap(), free);
        assert_eq!(data.read_bytes(0, 5000).unwrap(), vec![7u8; 5000]);
    }

    #[test]
    fn test_missing_attribute_is_invalid_data() {
        let ctx = scratch_context(256);
        let mut record = scratch_record();
        let err = AttributeData::new(&ctx, &mut record, AttributeType::DATA, "named")
            .err()
            .unwrap();
        assert!(matches!(err, StrataError::InvalidData(_)));
    }
}
