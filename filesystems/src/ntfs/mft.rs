// Master File Table
// Finds file record segments through the MFT's own $DATA run list, loads logical file
// records, persists them segment by segment and hands out segment numbers from the MFT
// $BITMAP. The MFT's file record lives here and is taken out while it is being modified.

use crate::ntfs::attribute_data::{read_stream_bytes, AttributeData};
use crate::ntfs::attributes::{
    AttributeListEntry, AttributeRecord, FileNameRecord, NonResidentAttributeRecord, ResidentAttributeRecord,
    StandardInformation,
};
use crate::ntfs::bitmap::BitmapData;
use crate::ntfs::data_runs::{DataRunSequence, Extent};
use crate::ntfs::file_record::{FileRecord, FileRecordSegment};
use crate::ntfs::index::{CollationRule, IndexRoot};
use crate::ntfs::logfile::{LogOperation, LogTarget, TransactionId};
use crate::ntfs::multi_sector::next_update_sequence_number;
use crate::ntfs::structures::*;
use crate::ntfs::volume_io::{RecordStore, VolumeContext, VolumeIo};
use log::{debug, info, trace};
use std::collections::HashSet;
use strata_core::StrataError;

const GIB: u64 = 1 << 30;
/// $MFTMirr never covers more than the first four records
const MAXIMUM_MIRRORED_SEGMENTS: u64 = 4;
/// New MFT segments are formatted in batches of this many records
const FORMAT_BATCH_SEGMENTS: u64 = 256;

/// How a segment write is described to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentChange {
    /// undo frees the segment again
    Create,
    /// full before and after images
    Update,
    /// redo frees the segment, undo restores the old image
    Deallocate,
}

/// Sequence numbers skip 0, which marks a reference that was never valid
fn next_sequence_number(current: u16) -> u16 {
    match current.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Records added per MFT extension: 256 up to 1 GiB, 4096 up to 64 GiB, 65536 beyond
pub(crate) fn extend_granularity(ctx: &VolumeContext) -> Result<u64, StrataError> {
    if let Some(records) = ctx.config().mft_extend_granularity {
        return Ok(records as u64);
    }
    let total_clusters = ctx.with_bitmap(|bitmap| Ok(bitmap.total_clusters()))?;
    let volume_bytes = total_clusters * ctx.geometry().bytes_per_cluster as u64;
    Ok(if volume_bytes <= GIB {
        256
    } else if volume_bytes <= 64 * GIB {
        4096
    } else {
        65536
    })
}

pub struct MasterFileTable {
    mft_record: Option<FileRecord>,
    mft_reference: MftSegmentReference,
    mft_runs: DataRunSequence,
    segment_count: u64,
    mirror_runs: DataRunSequence,
    mirror_segment_count: u64,
    search_start: u64,
    free_segments: Option<u64>,
}

impl std::fmt::Debug for MasterFileTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterFileTable")
            .field("segment_count", &self.segment_count)
            .field("mirror_segment_count", &self.mirror_segment_count)
            .field("runs", &self.mft_runs.len())
            .finish()
    }
}

impl MasterFileTable {
    /// Load `$MFT` starting from the boot record's MFT LCN, then `$MFTMirr`.
    /// Needs only sector I/O: the volume context is built from system files read here.
    pub fn open(io: &VolumeIo) -> Result<Self, StrataError> {
        let geometry = *io.geometry();
        let segment_size = geometry.bytes_per_file_record_segment as u64;
        if segment_size < geometry.bytes_per_sector as u64 || segment_size % geometry.bytes_per_sector as u64 != 0 {
            return Err(StrataError::NotSupported(format!(
                "file record segments of {} bytes on {}-byte sectors",
                segment_size, geometry.bytes_per_sector
            )));
        }

        // The MFT cannot be used to find itself: until its record is loaded the
        // system and reserved segments are assumed to lie contiguously at MftStartLCN
        let bootstrap_clusters = geometry.clusters_for(FIRST_USER_SEGMENT * segment_size);
        let mut mft = Self {
            mft_record: None,
            mft_reference: MftSegmentReference::new(MFT_SEGMENT, 0),
            mft_runs: DataRunSequence::from_extents(&[Extent::new(geometry.mft_start_lcn, bootstrap_clusters)]),
            segment_count: FIRST_USER_SEGMENT,
            mirror_runs: DataRunSequence::new(),
            mirror_segment_count: 0,
            search_start: FIRST_USER_SEGMENT,
            free_segments: None,
        };
        let base = mft.read_segment(io, MFT_SEGMENT)?;
        if !base.is_in_use() || !base.is_base_segment() {
            return Err(StrataError::InvalidData("$MFT base segment is not in use".to_string()));
        }
        mft.mft_reference = base.reference();
        let record = mft.load_record(io, base)?;
        mft.refresh_layout(io, &record)?;
        mft.mft_record = Some(record);

        let mirror = mft.get_file_record_by_number(io, MFT_MIRROR_SEGMENT)?;
        match mirror.get_attribute(AttributeType::DATA, "") {
            Some(AttributeRecord::NonResident(r)) => {
                mft.mirror_runs = r.data_runs.clone();
                mft.mirror_segment_count = (r.file_size / segment_size)
                    .min(MAXIMUM_MIRRORED_SEGMENTS)
                    .min(mft.segment_count);
            }
            _ => {
                return Err(StrataError::InvalidData(
                    "$MFTMirr has no non-resident $DATA".to_string(),
                ))
            }
        }
        info!(
            "MFT loaded: {} segments in {} run(s), {} mirrored",
            mft.segment_count,
            mft.mft_runs.len(),
            mft.mirror_segment_count
        );
        Ok(mft)
    }

    pub fn segment_count(&self) -> u64 {
        self.segment_count
    }

    pub fn mirror_segment_count(&self) -> u64 {
        self.mirror_segment_count
    }

    /// The MFT's own file record
    pub fn mft_record(&self) -> Result<&FileRecord, StrataError> {
        self.mft_record
            .as_ref()
            .ok_or_else(|| StrataError::InvalidData("$MFT record is being modified".to_string()))
    }

    fn take_mft_record(&mut self) -> Result<FileRecord, StrataError> {
        self.mft_record
            .take()
            .ok_or_else(|| StrataError::InvalidData("$MFT record is being modified".to_string()))
    }

    fn bytes_per_segment(ctx: &VolumeContext) -> usize {
        ctx.geometry().bytes_per_file_record_segment as usize
    }

    fn first_sector(io: &VolumeIo, segment_number: u64) -> u64 {
        let geometry = io.geometry();
        segment_number * geometry.bytes_per_file_record_segment as u64 / geometry.bytes_per_sector as u64
    }

    /// Follow the MFT's current `$DATA` run list after it changed
    fn refresh_layout(&mut self, io: &VolumeIo, record: &FileRecord) -> Result<(), StrataError> {
        match record.get_attribute(AttributeType::DATA, "") {
            Some(AttributeRecord::NonResident(r)) => {
                self.mft_runs = r.data_runs.clone();
                self.segment_count = r.file_size / io.geometry().bytes_per_file_record_segment as u64;
                Ok(())
            }
            _ => Err(StrataError::InvalidData("$MFT has no non-resident $DATA".to_string())),
        }
    }

    fn read_segment_bytes(&self, io: &VolumeIo, segment_number: u64) -> Result<Vec<u8>, StrataError> {
        if segment_number >= self.segment_count {
            return Err(StrataError::NotFound(format!(
                "file record segment {} (MFT holds {})",
                segment_number, self.segment_count
            )));
        }
        let geometry = io.geometry();
        let sectors = (geometry.bytes_per_file_record_segment / geometry.bytes_per_sector) as u64;
        io.read_mapped(&self.mft_runs, Self::first_sector(io, segment_number), sectors)
    }

    pub fn read_segment(&self, io: &VolumeIo, segment_number: u64) -> Result<FileRecordSegment, StrataError> {
        let bytes = self.read_segment_bytes(io, segment_number)?;
        FileRecordSegment::parse(&bytes, segment_number)
    }

    fn write_segment_bytes(&self, io: &VolumeIo, segment_number: u64, bytes: &[u8]) -> Result<(), StrataError> {
        let first_sector = Self::first_sector(io, segment_number);
        io.write_mapped(&self.mft_runs, first_sector, bytes)?;
        if segment_number < self.mirror_segment_count {
            io.write_mapped(&self.mirror_runs, first_sector, bytes)?;
        }
        Ok(())
    }

    /// Log the new image of `segment`, then write it
    fn write_segment(
        &self,
        ctx: &VolumeContext,
        segment: &mut FileRecordSegment,
        change: SegmentChange,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let segment_size = Self::bytes_per_segment(ctx);
        let offset = segment.segment_number * segment_size as u64;
        let previous = self.read_segment_bytes(ctx.io(), segment.segment_number)?;
        segment.update_sequence_number = next_update_sequence_number(segment.update_sequence_number);
        let image = segment.to_bytes(segment_size)?;

        let (redo_operation, redo, undo_operation, undo): (LogOperation, &[u8], LogOperation, &[u8]) = match change {
            SegmentChange::Create => (
                LogOperation::InitializeFileRecordSegment,
                &image,
                LogOperation::DeallocateFileRecordSegment,
                &[],
            ),
            SegmentChange::Update => (
                LogOperation::InitializeFileRecordSegment,
                &image,
                LogOperation::InitializeFileRecordSegment,
                &previous,
            ),
            SegmentChange::Deallocate => (
                LogOperation::DeallocateFileRecordSegment,
                &[],
                LogOperation::InitializeFileRecordSegment,
                &previous,
            ),
        };
        let target = LogTarget::new(self.mft_reference, AttributeType::DATA, "", offset);
        let lsn = ctx.write_log_record(&target, redo_operation, redo, undo_operation, undo, transaction_id)?;

        segment.lsn = lsn.0;
        let bytes = segment.to_bytes(segment_size)?;
        self.write_segment_bytes(ctx.io(), segment.segment_number, &bytes)?;
        trace!(
            "File record segment {} written ({:?}, LSN {})",
            segment.segment_number,
            change,
            lsn
        );
        Ok(())
    }

    /// Build the logical record from a base segment, reading the extension segments
    /// its attribute list names
    fn load_record(&self, io: &VolumeIo, base: FileRecordSegment) -> Result<FileRecord, StrataError> {
        let list_data = match base
            .attributes
            .iter()
            .find(|a| a.attribute_type() == AttributeType::ATTRIBUTE_LIST)
        {
            None => None,
            Some(AttributeRecord::Resident(r)) => Some(r.data.clone()),
            Some(list) => Some(read_stream_bytes(io, list, 0, list.data_length() as usize)?),
        };
        let Some(list_data) = list_data else {
            return FileRecord::from_segments(vec![base]);
        };

        let base_reference = base.reference();
        let mut seen = HashSet::new();
        let mut segments = vec![base];
        for entry in AttributeListEntry::parse_list(&list_data)? {
            let reference = entry.segment_reference;
            if reference.segment_number == base_reference.segment_number || !seen.insert(reference.segment_number) {
                continue;
            }
            let segment = self.read_segment(io, reference.segment_number)?;
            if !segment.is_in_use()
                || segment.sequence_number != reference.sequence_number
                || segment.base_segment_reference != base_reference
            {
                return Err(StrataError::InvalidData(format!(
                    "extension segment {} does not belong to file record {}",
                    reference, base_reference
                )));
            }
            segments.push(segment);
        }
        FileRecord::from_segments(segments)
    }

    /// Load the file record `reference` points at. A freed or reused segment is a
    /// stale reference, not corruption.
    pub fn get_file_record(
        &self,
        io: &VolumeIo,
        reference: MftSegmentReference,
    ) -> Result<FileRecord, StrataError> {
        if reference.segment_number == MFT_SEGMENT {
            let record = self.mft_record()?;
            if record.reference() != reference {
                return Err(StrataError::StaleReference(format!("file record {}", reference)));
            }
            return Ok(record.clone());
        }
        let base = self.read_segment(io, reference.segment_number)?;
        if !base.is_in_use() || base.sequence_number != reference.sequence_number {
            return Err(StrataError::StaleReference(format!(
                "file record {} (segment now holds sequence {})",
                reference, base.sequence_number
            )));
        }
        if !base.is_base_segment() {
            return Err(StrataError::InvalidData(format!(
                "file record {} is an extension segment of {}",
                reference, base.base_segment_reference
            )));
        }
        self.load_record(io, base)
    }

    /// Load a file record by segment number alone, for well-known system files
    pub fn get_file_record_by_number(&self, io: &VolumeIo, segment_number: u64) -> Result<FileRecord, StrataError> {
        if segment_number == MFT_SEGMENT {
            return Ok(self.mft_record()?.clone());
        }
        let base = self.read_segment(io, segment_number)?;
        if !base.is_in_use() || !base.is_base_segment() {
            return Err(StrataError::NotFound(format!("file record segment {}", segment_number)));
        }
        self.load_record(io, base)
    }

    /// Create the file record for a new file or directory named by `file_names`
    pub fn create_file(
        &mut self,
        ctx: &VolumeContext,
        file_names: &[FileNameRecord],
        is_directory: bool,
        transaction_id: TransactionId,
    ) -> Result<FileRecord, StrataError> {
        ctx.io().check_writable()?;
        let Some(first_name) = file_names.first() else {
            return Err(StrataError::InvalidInput("a file needs at least one name".to_string()));
        };
        let geometry = *ctx.geometry();
        let segment_number = self.allocate_segment(ctx, transaction_id)?;
        let previous = self.read_segment(ctx.io(), segment_number)?;

        let mut base = FileRecordSegment::new(segment_number, previous.sequence_number.max(1), MftSegmentReference::NULL);
        base.update_sequence_number = previous.update_sequence_number;
        if is_directory {
            base.flags |= FILE_RECORD_IS_DIRECTORY;
        }
        let mut record = FileRecord::new(base);

        let mut info = StandardInformation::new(if is_directory { 0 } else { FILE_ATTRIBUTE_ARCHIVE });
        info.timestamps = first_name.timestamps;
        record.set_standard_information(&info)?;
        for name in file_names {
            record.add_attribute(name.to_attribute());
        }
        if is_directory {
            let root = IndexRoot::new(
                AttributeType::FILE_NAME,
                CollationRule::FileName,
                geometry.bytes_per_index_record,
                geometry.bytes_per_cluster,
            );
            record.add_attribute(AttributeRecord::new_resident(
                AttributeType::INDEX_ROOT,
                FILE_NAME_INDEX_NAME,
                root.to_bytes(),
            ));
        } else {
            record.add_attribute(AttributeRecord::new_resident(AttributeType::DATA, "", Vec::new()));
        }

        record.layout_segments(geometry.bytes_per_file_record_segment as usize, None)?;
        self.write_segment(ctx, record.base_segment_mut(), SegmentChange::Create, transaction_id)?;
        debug!(
            "Created file record {} for '{}'{}",
            record.reference(),
            first_name.name,
            if is_directory { " (directory)" } else { "" }
        );
        Ok(record)
    }

    /// Free every segment of `record`. Extension segments go first, the base last.
    pub fn delete_file_record(
        &mut self,
        ctx: &VolumeContext,
        record: &mut FileRecord,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        ctx.io().check_writable()?;
        if record.segment_number() < FIRST_USER_SEGMENT {
            return Err(StrataError::InvalidInput(format!(
                "system file record {} cannot be deleted",
                record.segment_number()
            )));
        }
        let numbers: Vec<u64> = record.segments().iter().map(|s| s.segment_number).collect();
        for segment in record.segments_mut().iter_mut().rev() {
            segment.flags &= !FILE_RECORD_IN_USE;
            segment.sequence_number = next_sequence_number(segment.sequence_number);
            self.write_segment(ctx, segment, SegmentChange::Deallocate, transaction_id)?;
        }
        self.release_segments(ctx, &numbers, transaction_id)?;
        debug!("Deleted file record {} ({} segment(s))", numbers[0], numbers.len());
        Ok(())
    }

    /// Allocate a free segment at or above the first user segment, growing the MFT when full
    pub fn allocate_segment(&mut self, ctx: &VolumeContext, transaction_id: TransactionId) -> Result<u64, StrataError> {
        let mut record = self.take_mft_record()?;
        let result = self.allocate_segment_with(ctx, &mut record, transaction_id);
        self.mft_record = Some(record);
        result
    }

    fn allocate_segment_with(
        &mut self,
        ctx: &VolumeContext,
        record: &mut FileRecord,
        transaction_id: TransactionId,
    ) -> Result<u64, StrataError> {
        if let Some(segment_number) = self.allocate_from_bitmap(ctx, record, transaction_id)? {
            return Ok(segment_number);
        }
        self.extend_with(ctx, record, transaction_id)?;
        self.allocate_from_bitmap(ctx, record, transaction_id)?
            .ok_or_else(|| StrataError::DiskFull("no free file record segment after extending the MFT".to_string()))
    }

    fn allocate_from_bitmap(
        &mut self,
        ctx: &VolumeContext,
        record: &mut FileRecord,
        transaction_id: TransactionId,
    ) -> Result<Option<u64>, StrataError> {
        let mut bitmap = BitmapData::new(ctx, record, AttributeType::BITMAP, "", self.segment_count)?
            .with_search_start(self.search_start)
            .with_free_count(self.free_segments.take());
        bitmap.free_bit_count()?;
        let allocated = bitmap.allocate_record(&mut *self, FIRST_USER_SEGMENT, transaction_id)?;
        self.search_start = bitmap.search_start_index();
        self.free_segments = bitmap.cached_free_count();
        Ok(allocated)
    }

    /// Segments whose `$BITMAP` bit is clear, counted once and then kept as segments
    /// are allocated, released and added
    pub fn free_segment_count(&mut self, ctx: &VolumeContext) -> Result<u64, StrataError> {
        if let Some(free) = self.free_segments {
            return Ok(free);
        }
        let mut record = self.take_mft_record()?;
        let result = BitmapData::new(ctx, &mut record, AttributeType::BITMAP, "", self.segment_count)
            .and_then(|mut bitmap| bitmap.free_bit_count());
        self.mft_record = Some(record);
        let free = result?;
        self.free_segments = Some(free);
        Ok(free)
    }

    fn release_segments(
        &mut self,
        ctx: &VolumeContext,
        segment_numbers: &[u64],
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let mut record = self.take_mft_record()?;
        let result = self.release_segments_with(ctx, &mut record, segment_numbers, transaction_id);
        self.mft_record = Some(record);
        result
    }

    fn release_segments_with(
        &mut self,
        ctx: &VolumeContext,
        record: &mut FileRecord,
        segment_numbers: &[u64],
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let mut bitmap = BitmapData::new(ctx, record, AttributeType::BITMAP, "", self.segment_count)?
            .with_free_count(self.free_segments.take());
        for &segment_number in segment_numbers {
            bitmap.deallocate_record(&mut *self, segment_number, transaction_id)?;
        }
        self.free_segments = bitmap.cached_free_count();
        Ok(())
    }

    /// Free segment in 16..24 for the MFT's own extension segments
    fn allocate_reserved_segment(&self, ctx: &VolumeContext, claimed: &[u64]) -> Result<u64, StrataError> {
        for segment_number in FIRST_RESERVED_SEGMENT..FIRST_USER_SEGMENT {
            if claimed.contains(&segment_number) {
                continue;
            }
            if !self.read_segment(ctx.io(), segment_number)?.is_in_use() {
                return Ok(segment_number);
            }
        }
        Err(StrataError::NotSupported(
            "MFT too fragmented: reserved segments 16-23 are all in use".to_string(),
        ))
    }

    /// Grow the MFT by the size-tiered number of records
    pub fn extend(&mut self, ctx: &VolumeContext, transaction_id: TransactionId) -> Result<(), StrataError> {
        let mut record = self.take_mft_record()?;
        let result = self.extend_with(ctx, &mut record, transaction_id);
        self.mft_record = Some(record);
        result
    }

    fn extend_with(
        &mut self,
        ctx: &VolumeContext,
        record: &mut FileRecord,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        ctx.io().check_writable()?;
        let granularity = extend_granularity(ctx)?;
        let segment_size = Self::bytes_per_segment(ctx);
        let old_count = self.segment_count;
        let new_count = old_count + granularity;

        // Bitmap first: its zero-filled tail keeps the valid data length at the stream length
        {
            let mut bitmap = BitmapData::new(ctx, &mut *record, AttributeType::BITMAP, "", old_count)?
                .with_free_count(self.free_segments.take());
            bitmap.extend_bitmap(&mut *self, granularity, true, transaction_id)?;
            self.free_segments = bitmap.cached_free_count();
        }

        let mut data = AttributeData::new(ctx, &mut *record, AttributeType::DATA, "")?;
        data.extend(&mut *self, granularity * segment_size as u64, transaction_id)?;
        let mut first = old_count;
        while first < new_count {
            let last = new_count.min(first + FORMAT_BATCH_SEGMENTS);
            let mut image = Vec::with_capacity((last - first) as usize * segment_size);
            for segment_number in first..last {
                image.extend_from_slice(&FileRecordSegment::unused(segment_number).to_bytes(segment_size)?);
            }
            data.write_bytes(&mut *self, first * segment_size as u64, &image, transaction_id)?;
            first = last;
        }
        info!("MFT extended from {} to {} records", old_count, self.segment_count);
        Ok(())
    }

    /// A list record of `length` bytes to reserve space while segments are laid out.
    /// Large lists move to clusters, reusing the previous list's when they suffice.
    fn attribute_list_placeholder(
        &self,
        ctx: &VolumeContext,
        previous: Option<&AttributeRecord>,
        length: usize,
        transaction_id: TransactionId,
    ) -> Result<AttributeRecord, StrataError> {
        let geometry = *ctx.geometry();
        if ResidentAttributeRecord::record_length_for("", length) <= geometry.attribute_record_length_to_make_non_resident() {
            return Ok(AttributeRecord::new_resident(AttributeType::ATTRIBUTE_LIST, "", vec![0; length]));
        }
        let clusters = geometry.clusters_for(length as u64);
        let data_runs = match previous {
            Some(AttributeRecord::NonResident(r)) if r.data_runs.data_cluster_count() >= clusters => r.data_runs.clone(),
            _ => DataRunSequence::from_extents(&ctx.allocate_clusters(None, clusters, transaction_id)?),
        };
        Ok(AttributeRecord::NonResident(NonResidentAttributeRecord {
            allocated_length: data_runs.data_cluster_count() * geometry.bytes_per_cluster as u64,
            file_size: length as u64,
            valid_data_length: length as u64,
            data_runs,
            ..NonResidentAttributeRecord::new(AttributeType::ATTRIBUTE_LIST, "")
        }))
    }

    /// Fill the placeholder with the entries of the final layout
    fn finish_attribute_list(
        &self,
        ctx: &VolumeContext,
        record: &FileRecord,
        placeholder: AttributeRecord,
        transaction_id: TransactionId,
    ) -> Result<AttributeRecord, StrataError> {
        let data = AttributeListEntry::list_to_bytes(&record.attribute_list_entries());
        match placeholder {
            AttributeRecord::Resident(mut r) => {
                if data.len() != r.data.len() {
                    return Err(StrataError::InvalidData(format!(
                        "attribute list of file record {} is {} bytes, {} reserved",
                        record.reference(),
                        data.len(),
                        r.data.len()
                    )));
                }
                r.data = data;
                Ok(AttributeRecord::Resident(r))
            }
            AttributeRecord::NonResident(r) => {
                let bytes_per_sector = ctx.geometry().bytes_per_sector as usize;
                let mut padded = data;
                padded.resize(padded.len().div_ceil(bytes_per_sector) * bytes_per_sector, 0);
                let sectors = (padded.len() / bytes_per_sector) as u64;
                let previous = ctx.io().read_mapped(&r.data_runs, 0, sectors)?;
                let target = LogTarget::new(record.reference(), AttributeType::ATTRIBUTE_LIST, "", 0);
                ctx.write_log_record(
                    &target,
                    LogOperation::UpdateNonResidentValue,
                    &padded,
                    LogOperation::UpdateNonResidentValue,
                    &previous,
                    transaction_id,
                )?;
                ctx.io().write_mapped(&r.data_runs, 0, &padded)?;
                Ok(AttributeRecord::NonResident(r))
            }
        }
    }

    fn write_file_record(
        &mut self,
        ctx: &VolumeContext,
        record: &mut FileRecord,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        ctx.io().check_writable()?;
        let segment_size = Self::bytes_per_segment(ctx);
        let is_mft = record.segment_number() == MFT_SEGMENT;

        let previous_list = record.attribute_list().cloned();
        let placeholder = match record.required_attribute_list_length(segment_size)? {
            Some(length) => Some(self.attribute_list_placeholder(ctx, previous_list.as_ref(), length, transaction_id)?),
            None => None,
        };
        record.layout_segments(segment_size, placeholder.clone())?;

        // Number the segments the layout added
        let base_reference = record.reference();
        let mut created = Vec::new();
        for index in 1..record.segments().len() {
            if record.segments()[index].segment_number != 0 {
                continue;
            }
            let segment_number = if is_mft {
                self.allocate_reserved_segment(ctx, &created)?
            } else {
                self.allocate_segment(ctx, transaction_id)?
            };
            created.push(segment_number);
            let previous = self.read_segment(ctx.io(), segment_number)?;
            let segment = &mut record.segments_mut()[index];
            segment.segment_number = segment_number;
            segment.sequence_number = previous.sequence_number.max(1);
            segment.update_sequence_number = previous.update_sequence_number;
            segment.base_segment_reference = base_reference;
            segment.flags = FILE_RECORD_IN_USE;
            debug!("File record {} extended into segment {}", base_reference, segment_number);
        }

        if let Some(placeholder) = placeholder {
            let list = self.finish_attribute_list(ctx, record, placeholder, transaction_id)?;
            record.set_attribute_list_record(list);
        }

        // Extension segments before the base that references them
        let mut freed = Vec::new();
        for segment in record.segments_mut().iter_mut().skip(1) {
            if segment.attributes.is_empty() {
                segment.flags &= !FILE_RECORD_IN_USE;
                segment.sequence_number = next_sequence_number(segment.sequence_number);
                self.write_segment(ctx, segment, SegmentChange::Deallocate, transaction_id)?;
                freed.push(segment.segment_number);
            } else {
                let change = if created.contains(&segment.segment_number) {
                    SegmentChange::Create
                } else {
                    SegmentChange::Update
                };
                self.write_segment(ctx, segment, change, transaction_id)?;
            }
        }
        record.segments_mut().retain(|s| !freed.contains(&s.segment_number));
        self.write_segment(ctx, record.base_segment_mut(), SegmentChange::Update, transaction_id)?;

        if !freed.is_empty() {
            debug!("File record {} released segment(s) {:?}", base_reference, freed);
            // The MFT's reserved segments stay marked in its bitmap
            if !is_mft {
                self.release_segments(ctx, &freed, transaction_id)?;
            }
        }
        if let Some(AttributeRecord::NonResident(old)) = &previous_list {
            let reused = matches!(
                record.attribute_list(),
                Some(AttributeRecord::NonResident(new)) if new.data_runs == old.data_runs
            );
            if !reused {
                ctx.deallocate_clusters(&old.data_runs.to_extents()?, transaction_id)?;
            }
        }

        if is_mft {
            self.refresh_layout(ctx.io(), record)?;
            if self.mft_record.is_some() {
                self.mft_record = Some(record.clone());
            }
        }
        Ok(())
    }
}

impl RecordStore for MasterFileTable {
    /// Persist every segment of `record`: extension segments first, each logged with
    /// before and after images, then the base segment
    fn update_file_record(
        &mut self,
        ctx: &VolumeContext,
        record: &mut FileRecord,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        self.write_file_record(ctx, record, transaction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::timestamps::NtfsTimestamps;
    use crate::test_helpers::{formatted_volume, small_volume};
    use strata_core::FormatOptions;

    fn file_name(name: &str) -> FileNameRecord {
        FileNameRecord::new(
            MftSegmentReference::new(ROOT_DIRECTORY_SEGMENT, ROOT_DIRECTORY_SEGMENT as u16),
            name,
            false,
            NtfsTimestamps::now(),
        )
    }

    #[test]
    fn test_created_record_reloads() {
        let (_device, volume) = small_volume();
        volume
            .with_mft(|ctx, mft| {
                let tx = ctx.allocate_transaction_id()?;
                let record = mft.create_file(ctx, &[file_name("a.txt")], false, tx)?;
                ctx.forget_transaction(tx)?;
                assert!(record.segment_number() >= FIRST_USER_SEGMENT);

                let loaded = mft.get_file_record(ctx.io(), record.reference())?;
                assert!(loaded.is_in_use());
                assert!(!loaded.is_directory());
                assert_eq!(loaded.file_name_records()?[0].name, "a.txt");
                assert!(loaded.has_attribute(AttributeType::DATA, ""));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_deleted_reference_is_stale() {
        let (_device, volume) = small_volume();
        volume
            .with_mft(|ctx, mft| {
                let tx = ctx.allocate_transaction_id()?;
                let mut record = mft.create_file(ctx, &[file_name("gone.txt")], false, tx)?;
                let reference = record.reference();
                mft.delete_file_record(ctx, &mut record, tx)?;
                ctx.forget_transaction(tx)?;

                let result = mft.get_file_record(ctx.io(), reference);
                assert!(matches!(result, Err(StrataError::StaleReference(_))));

                let freed = mft.read_segment(ctx.io(), reference.segment_number)?;
                assert!(!freed.is_in_use());
                assert_eq!(freed.sequence_number, reference.sequence_number + 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_exhausted_bitmap_extends_mft() {
        let options = FormatOptions {
            initial_mft_records: 32,
            ..FormatOptions::default()
        };
        let (_device, volume) = formatted_volume(64 * 1024 * 1024, &options);
        volume
            .with_mft(|ctx, mft| {
                let before = mft.segment_count();
                assert_eq!(mft.free_segment_count(ctx)?, before - FIRST_USER_SEGMENT);
                let tx = ctx.allocate_transaction_id()?;
                let mut last = None;
                for i in 0..(before - FIRST_USER_SEGMENT + 1) {
                    last = Some(mft.create_file(ctx, &[file_name(&format!("f{}", i))], false, tx)?);
                }
                let mut last = last.unwrap();
                assert_eq!(mft.segment_count(), before + 256);
                assert_eq!(last.segment_number(), before);
                assert_eq!(mft.free_segment_count(ctx)?, 255);

                mft.delete_file_record(ctx, &mut last, tx)?;
                ctx.forget_transaction(tx)?;
                assert_eq!(mft.free_segment_count(ctx)?, 256);
                mft.free_segments = None;
                assert_eq!(mft.free_segment_count(ctx)?, 256);
                Ok(())
            })
            .unwrap();
    }

    fn data_with_runs(extents: &[Extent]) -> AttributeRecord {
        let clusters: u64 = extents.iter().map(|e| e.length).sum();
        AttributeRecord::NonResident(NonResidentAttributeRecord {
            allocated_length: clusters * 4096,
            file_size: clusters * 4096,
            valid_data_length: 0,
            data_runs: DataRunSequence::from_extents(extents),
            ..NonResidentAttributeRecord::new(AttributeType::DATA, "")
        })
    }

    #[test]
    fn test_fragmented_record_spills_into_extension_segments() {
        let (_device, volume) = small_volume();
        volume
            .with_mft(|ctx, mft| {
                let tx = ctx.allocate_transaction_id()?;
                let mut record = mft.create_file(ctx, &[file_name("frag.bin")], false, tx)?;
                // Too many mapping pairs for one 1 KiB segment
                let extents: Vec<Extent> = (0..600).map(|i| Extent::new(4000 + i * 3, 1)).collect();
                record.replace_attribute(data_with_runs(&extents))?;
                mft.update_file_record(ctx, &mut record, tx)?;
                assert!(record.segments().len() > 1, "{} segments", record.segments().len());
                let extensions: Vec<u64> = record.segments()[1..].iter().map(|s| s.segment_number).collect();

                let loaded = mft.get_file_record(ctx.io(), record.reference())?;
                assert_eq!(loaded.segments().len(), record.segments().len());
                assert!(loaded.attribute_list().is_some());
                match loaded.get_attribute(AttributeType::DATA, "") {
                    Some(AttributeRecord::NonResident(r)) => {
                        assert_eq!(r.data_runs, DataRunSequence::from_extents(&extents))
                    }
                    other => panic!("unexpected $DATA {:?}", other),
                }

                // Back to a single run: the extension segments are released
                let mut record = loaded;
                record.replace_attribute(data_with_runs(&[Extent::new(4000, 1)]))?;
                mft.update_file_record(ctx, &mut record, tx)?;
                ctx.forget_transaction(tx)?;

                let reloaded = mft.get_file_record(ctx.io(), record.reference())?;
                assert_eq!(reloaded.segments().len(), 1);
                assert!(reloaded.attribute_list().is_none());
                for segment_number in extensions {
                    assert!(!mft.read_segment(ctx.io(), segment_number)?.is_in_use());
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_mirror_follows_base_segment() {
        let (_device, volume) = small_volume();
        volume
            .with_mft(|ctx, mft| {
                let tx = ctx.allocate_transaction_id()?;
                mft.extend(ctx, tx)?;
                ctx.forget_transaction(tx)?;
                let primary = mft.read_segment_bytes(ctx.io(), MFT_SEGMENT)?;
                let mirror = ctx.io().read_mapped(&mft.mirror_runs, 0, 2)?;
                assert_eq!(primary, mirror);
                Ok(())
            })
            .unwrap();
    }
}
