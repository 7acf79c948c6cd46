// NTFS file records
// A FileRecordSegment is one fixed-size FILE block of the MFT. A FileRecord is the logical
// view of a file: its base segment, any extension segments, and the merged attribute set.

use crate::ntfs::attributes::{
    AttributeListEntry, AttributeRecord, FileNameNamespace, FileNameRecord, NonResidentAttributeRecord,
    StandardInformation,
};
use crate::ntfs::data_runs::DataRunSequence;
use crate::ntfs::multi_sector::{apply_fixup, revert_fixup, update_sequence_count};
use crate::ntfs::structures::*;
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use strata_core::StrataError;

pub const FILE_RECORD_SIGNATURE: &[u8; 4] = b"FILE";
const UPDATE_SEQUENCE_ARRAY_OFFSET: usize = 0x30;
/// END type code plus padding
const END_MARKER_LENGTH: usize = 8;

fn attribute_order(a: &AttributeRecord, b: &AttributeRecord) -> Ordering {
    a.attribute_type()
        .cmp(&b.attribute_type())
        .then_with(|| a.name().cmp(b.name()))
        .then_with(|| a.lowest_vcn().cmp(&b.lowest_vcn()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecordSegment {
    pub segment_number: u64,
    pub sequence_number: u16,
    pub lsn: u64,
    pub reference_count: u16,
    pub flags: u16,
    /// NULL for a base segment
    pub base_segment_reference: MftSegmentReference,
    pub next_attribute_instance: u16,
    pub update_sequence_number: u16,
    pub attributes: Vec<AttributeRecord>,
}

impl FileRecordSegment {
    pub fn new(segment_number: u64, sequence_number: u16, base: MftSegmentReference) -> Self {
        Self {
            segment_number,
            sequence_number,
            lsn: 0,
            reference_count: 0,
            flags: FILE_RECORD_IN_USE,
            base_segment_reference: base,
            next_attribute_instance: 0,
            update_sequence_number: 1,
            attributes: Vec::new(),
        }
    }

    /// A formatted segment that has never held a file
    pub fn unused(segment_number: u64) -> Self {
        Self {
            flags: 0,
            ..Self::new(segment_number, 1, MftSegmentReference::NULL)
        }
    }

    pub fn first_attribute_offset(bytes_per_segment: usize) -> usize {
        align8(UPDATE_SEQUENCE_ARRAY_OFFSET + update_sequence_count(bytes_per_segment) as usize * 2)
    }

    /// Room for attribute records once the header and end marker are accounted for
    pub fn attribute_capacity(bytes_per_segment: usize) -> usize {
        bytes_per_segment - Self::first_attribute_offset(bytes_per_segment) - END_MARKER_LENGTH
    }

    pub fn reference(&self) -> MftSegmentReference {
        MftSegmentReference::new(self.segment_number, self.sequence_number)
    }

    pub fn is_base_segment(&self) -> bool {
        self.base_segment_reference.is_null()
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & FILE_RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FILE_RECORD_IS_DIRECTORY != 0
    }

    pub fn attributes_length(&self) -> usize {
        self.attributes.iter().map(|a| a.record_length()).sum()
    }

    pub fn parse(buffer: &[u8], segment_number: u64) -> Result<Self, StrataError> {
        if buffer.len() < UPDATE_SEQUENCE_ARRAY_OFFSET || &buffer[0..4] != FILE_RECORD_SIGNATURE {
            return Err(StrataError::InvalidData(format!(
                "file record segment {} has no FILE signature",
                segment_number
            )));
        }
        let mut block = buffer.to_vec();
        let update_sequence_number = revert_fixup(&mut block)?;

        let first_attribute = LittleEndian::read_u16(&block[0x14..0x16]) as usize;
        let bytes_in_use = LittleEndian::read_u32(&block[0x18..0x1C]) as usize;
        if bytes_in_use > block.len() || first_attribute >= bytes_in_use {
            return Err(StrataError::InvalidData(format!(
                "file record segment {} has invalid length {}",
                segment_number, bytes_in_use
            )));
        }

        let mut attributes = Vec::new();
        let mut offset = first_attribute;
        loop {
            if offset + 4 > bytes_in_use {
                return Err(StrataError::InvalidData(format!(
                    "file record segment {} is missing its end marker",
                    segment_number
                )));
            }
            if LittleEndian::read_u32(&block[offset..offset + 4]) == AttributeType::END.0 {
                break;
            }
            let record = AttributeRecord::parse(&block[offset..bytes_in_use])?;
            offset += LittleEndian::read_u32(&block[offset + 4..offset + 8]) as usize;
            attributes.push(record);
        }

        Ok(Self {
            segment_number,
            sequence_number: LittleEndian::read_u16(&block[0x10..0x12]),
            lsn: LittleEndian::read_u64(&block[0x08..0x10]),
            reference_count: LittleEndian::read_u16(&block[0x12..0x14]),
            flags: LittleEndian::read_u16(&block[0x16..0x18]),
            base_segment_reference: MftSegmentReference::from_u64(LittleEndian::read_u64(
                &block[0x20..0x28],
            )),
            next_attribute_instance: LittleEndian::read_u16(&block[0x28..0x2A]),
            update_sequence_number,
            attributes,
        })
    }

    pub fn to_bytes(&self, bytes_per_segment: usize) -> Result<Vec<u8>, StrataError> {
        let usa_count = update_sequence_count(bytes_per_segment);
        let first_attribute = Self::first_attribute_offset(bytes_per_segment);
        let mut buffer = vec![0u8; bytes_per_segment];
        buffer[0..4].copy_from_slice(FILE_RECORD_SIGNATURE);
        LittleEndian::write_u16(&mut buffer[0x04..0x06], UPDATE_SEQUENCE_ARRAY_OFFSET as u16);
        LittleEndian::write_u16(&mut buffer[0x06..0x08], usa_count);
        LittleEndian::write_u64(&mut buffer[0x08..0x10], self.lsn);
        LittleEndian::write_u16(&mut buffer[0x10..0x12], self.sequence_number);
        LittleEndian::write_u16(&mut buffer[0x12..0x14], self.reference_count);
        LittleEndian::write_u16(&mut buffer[0x14..0x16], first_attribute as u16);
        LittleEndian::write_u16(&mut buffer[0x16..0x18], self.flags);

        let mut ordered: Vec<&AttributeRecord> = self.attributes.iter().collect();
        ordered.sort_by(|a, b| attribute_order(a, b));
        let mut offset = first_attribute;
        for attribute in ordered {
            let bytes = attribute.to_bytes();
            if offset + bytes.len() + END_MARKER_LENGTH > bytes_per_segment {
                return Err(StrataError::InvalidData(format!(
                    "attributes overflow file record segment {}",
                    self.segment_number
                )));
            }
            buffer[offset..offset + bytes.len()].copy_from_slice(&bytes);
            offset += bytes.len();
        }
        LittleEndian::write_u32(&mut buffer[offset..offset + 4], AttributeType::END.0);
        offset += END_MARKER_LENGTH;

        LittleEndian::write_u32(&mut buffer[0x18..0x1C], offset as u32);
        LittleEndian::write_u32(&mut buffer[0x1C..0x20], bytes_per_segment as u32);
        LittleEndian::write_u64(&mut buffer[0x20..0x28], self.base_segment_reference.to_u64());
        LittleEndian::write_u16(&mut buffer[0x28..0x2A], self.next_attribute_instance);
        LittleEndian::write_u32(&mut buffer[0x2C..0x30], self.segment_number as u32);
        apply_fixup(&mut buffer, self.update_sequence_number)?;
        Ok(buffer)
    }

    /// Place `record` here, keeping its instance unless it is already taken in this segment
    fn place(&mut self, mut record: AttributeRecord, keep_instance: bool) {
        let taken = |attributes: &[AttributeRecord], instance: u16| {
            attributes.iter().any(|a| a.instance() == instance)
        };
        if !keep_instance || taken(&self.attributes, record.instance()) {
            let mut instance = self.next_attribute_instance;
            while taken(&self.attributes, instance) {
                instance = instance.wrapping_add(1);
            }
            record.set_instance(instance);
            self.next_attribute_instance = instance.wrapping_add(1);
        } else if record.instance() >= self.next_attribute_instance {
            self.next_attribute_instance = record.instance().wrapping_add(1);
        }
        self.attributes.push(record);
    }
}

/// Logical view of one file: segment headers plus the merged attribute set.
///
/// `attributes` holds one record per attribute (non-resident fragments merged back
/// into one run list). Segment `attributes` vectors only reflect the on-disk placement
/// after `layout_segments` and are rebuilt on every update.
#[derive(Debug, Clone)]
pub struct FileRecord {
    segments: Vec<FileRecordSegment>,
    attributes: Vec<AttributeRecord>,
    attribute_list: Option<AttributeRecord>,
}

impl FileRecord {
    pub fn new(base_segment: FileRecordSegment) -> Self {
        Self {
            segments: vec![base_segment],
            attributes: Vec::new(),
            attribute_list: None,
        }
    }

    /// Build the logical record from a base segment followed by its extension segments
    pub fn from_segments(mut segments: Vec<FileRecordSegment>) -> Result<Self, StrataError> {
        match segments.first() {
            Some(base) if base.is_base_segment() => {}
            _ => {
                return Err(StrataError::InvalidData(
                    "file record does not start with a base segment".to_string(),
                ))
            }
        }

        let mut attribute_list = None;
        let mut records = Vec::new();
        for (index, segment) in segments.iter_mut().enumerate() {
            for attribute in segment.attributes.drain(..) {
                if attribute.attribute_type() == AttributeType::ATTRIBUTE_LIST {
                    if index != 0 {
                        return Err(StrataError::InvalidData(
                            "$ATTRIBUTE_LIST outside the base segment".to_string(),
                        ));
                    }
                    attribute_list = Some(attribute);
                } else {
                    records.push(attribute);
                }
            }
        }

        records.sort_by(attribute_order);
        let mut attributes: Vec<AttributeRecord> = Vec::with_capacity(records.len());
        for record in records {
            if let AttributeRecord::NonResident(fragment) = &record {
                if fragment.lowest_vcn > 0 {
                    let Some(AttributeRecord::NonResident(head)) = attributes.last_mut() else {
                        return Err(StrataError::InvalidData(format!(
                            "{} fragment without its first part",
                            fragment.attribute_type
                        )));
                    };
                    if head.attribute_type != fragment.attribute_type
                        || head.name != fragment.name
                        || head.data_runs.data_cluster_count() != fragment.lowest_vcn
                    {
                        return Err(StrataError::InvalidData(format!(
                            "{} fragment at VCN {} does not continue the run list",
                            fragment.attribute_type, fragment.lowest_vcn
                        )));
                    }
                    for extent in fragment.data_runs.to_extents()? {
                        head.data_runs.append_extent(extent);
                    }
                    continue;
                }
            }
            attributes.push(record);
        }

        Ok(Self {
            segments,
            attributes,
            attribute_list,
        })
    }

    pub fn base_segment(&self) -> &FileRecordSegment {
        &self.segments[0]
    }

    pub fn base_segment_mut(&mut self) -> &mut FileRecordSegment {
        &mut self.segments[0]
    }

    pub fn segments(&self) -> &[FileRecordSegment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut Vec<FileRecordSegment> {
        &mut self.segments
    }

    pub fn segment_number(&self) -> u64 {
        self.base_segment().segment_number
    }

    pub fn reference(&self) -> MftSegmentReference {
        self.base_segment().reference()
    }

    pub fn is_in_use(&self) -> bool {
        self.base_segment().is_in_use()
    }

    pub fn is_directory(&self) -> bool {
        self.base_segment().is_directory()
    }

    pub fn attributes(&self) -> &[AttributeRecord] {
        &self.attributes
    }

    pub fn attribute_list(&self) -> Option<&AttributeRecord> {
        self.attribute_list.as_ref()
    }

    pub fn take_attribute_list(&mut self) -> Option<AttributeRecord> {
        self.attribute_list.take()
    }

    pub fn get_attribute(&self, attribute_type: AttributeType, name: &str) -> Option<&AttributeRecord> {
        self.attributes.iter().find(|a| a.matches(attribute_type, name))
    }

    pub fn get_attribute_mut(
        &mut self,
        attribute_type: AttributeType,
        name: &str,
    ) -> Option<&mut AttributeRecord> {
        self.attributes.iter_mut().find(|a| a.matches(attribute_type, name))
    }

    pub fn has_attribute(&self, attribute_type: AttributeType, name: &str) -> bool {
        self.get_attribute(attribute_type, name).is_some()
    }

    /// Add a new attribute, returning the instance it was given
    pub fn add_attribute(&mut self, mut record: AttributeRecord) -> u16 {
        let base = &mut self.segments[0];
        let instance = base.next_attribute_instance;
        base.next_attribute_instance = instance.wrapping_add(1);
        record.set_instance(instance);
        let position = self
            .attributes
            .iter()
            .position(|a| attribute_order(a, &record) == Ordering::Greater)
            .unwrap_or(self.attributes.len());
        self.attributes.insert(position, record);
        instance
    }

    pub fn remove_attribute(&mut self, attribute_type: AttributeType, name: &str) -> Option<AttributeRecord> {
        let position = self.attributes.iter().position(|a| a.matches(attribute_type, name))?;
        Some(self.attributes.remove(position))
    }

    /// Swap in a new record for an existing attribute, keeping its instance
    pub fn replace_attribute(&mut self, mut record: AttributeRecord) -> Result<(), StrataError> {
        let attribute_type = record.attribute_type();
        let name = record.name().to_string();
        let existing = self.get_attribute_mut(attribute_type, &name).ok_or_else(|| {
            StrataError::InvalidData(format!("no {} attribute to replace", attribute_type))
        })?;
        record.set_instance(existing.instance());
        *existing = record;
        Ok(())
    }

    pub fn standard_information(&self) -> Result<StandardInformation, StrataError> {
        match self.get_attribute(AttributeType::STANDARD_INFORMATION, "") {
            Some(AttributeRecord::Resident(r)) => StandardInformation::parse(&r.data),
            _ => Err(StrataError::InvalidData(format!(
                "file record {} has no resident $STANDARD_INFORMATION",
                self.segment_number()
            ))),
        }
    }

    pub fn set_standard_information(&mut self, info: &StandardInformation) -> Result<(), StrataError> {
        match self.get_attribute_mut(AttributeType::STANDARD_INFORMATION, "") {
            Some(AttributeRecord::Resident(r)) => {
                r.data = info.to_bytes();
                Ok(())
            }
            _ => {
                self.add_attribute(AttributeRecord::new_resident(
                    AttributeType::STANDARD_INFORMATION,
                    "",
                    info.to_bytes(),
                ));
                Ok(())
            }
        }
    }

    pub fn file_name_records(&self) -> Result<Vec<FileNameRecord>, StrataError> {
        self.attributes
            .iter()
            .filter(|a| a.attribute_type() == AttributeType::FILE_NAME)
            .map(|a| match a {
                AttributeRecord::Resident(r) => FileNameRecord::parse(&r.data),
                AttributeRecord::NonResident(_) => Err(StrataError::InvalidData(
                    "$FILE_NAME must be resident".to_string(),
                )),
            })
            .collect()
    }

    /// The name shown in listings: anything but a DOS-only short name
    pub fn long_file_name(&self) -> Result<Option<FileNameRecord>, StrataError> {
        Ok(self
            .file_name_records()?
            .into_iter()
            .find(|f| f.namespace != FileNameNamespace::Dos))
    }

    /// Length of the unnamed data stream
    pub fn data_length(&self) -> u64 {
        self.get_attribute(AttributeType::DATA, "")
            .map(|a| a.data_length())
            .unwrap_or(0)
    }

    /// Split every attribute into records that fit one segment.
    /// Only non-resident run lists can be split.
    pub fn fragments(&self, bytes_per_segment: usize) -> Result<Vec<AttributeRecord>, StrataError> {
        let capacity = FileRecordSegment::attribute_capacity(bytes_per_segment);
        let mut fragments = Vec::with_capacity(self.attributes.len());
        for attribute in &self.attributes {
            if attribute.record_length() <= capacity {
                fragments.push(attribute.clone());
                continue;
            }
            match attribute {
                AttributeRecord::Resident(r) => {
                    return Err(StrataError::InvalidData(format!(
                        "resident {} of {} bytes cannot fit a file record segment",
                        r.attribute_type,
                        r.data.len()
                    )));
                }
                AttributeRecord::NonResident(r) => {
                    fragments.extend(split_run_list(r, capacity)?.into_iter().map(AttributeRecord::NonResident));
                }
            }
        }
        Ok(fragments)
    }

    /// Bytes of `$ATTRIBUTE_LIST` data needed, `None` when the base segment holds everything
    pub fn required_attribute_list_length(&self, bytes_per_segment: usize) -> Result<Option<usize>, StrataError> {
        let fragments = self.fragments(bytes_per_segment)?;
        let total: usize = fragments.iter().map(|f| f.record_length()).sum();
        if total <= FileRecordSegment::attribute_capacity(bytes_per_segment) {
            return Ok(None);
        }
        Ok(Some(
            fragments
                .iter()
                .map(|f| AttributeListEntry::length_for_name(f.name()))
                .sum(),
        ))
    }

    /// Distribute the attributes over the segments. With an attribute list the base
    /// segment takes `$STANDARD_INFORMATION` and the list, everything else goes first-fit.
    /// New segments are appended with segment number 0 until the MFT assigns one;
    /// existing extension segments that end up empty are left for the caller to free.
    pub fn layout_segments(
        &mut self,
        bytes_per_segment: usize,
        attribute_list: Option<AttributeRecord>,
    ) -> Result<(), StrataError> {
        let capacity = FileRecordSegment::attribute_capacity(bytes_per_segment);
        let fragments = self.fragments(bytes_per_segment)?;
        let base_reference = self.reference();
        for segment in &mut self.segments {
            segment.attributes.clear();
        }
        self.attribute_list = None;

        match attribute_list {
            None => {
                let total: usize = fragments.iter().map(|f| f.record_length()).sum();
                if total > capacity {
                    return Err(StrataError::InvalidData(format!(
                        "file record {} needs an attribute list",
                        base_reference
                    )));
                }
                for fragment in fragments {
                    let first = fragment.lowest_vcn() == 0;
                    self.segments[0].place(fragment, first);
                }
            }
            Some(list) => {
                let mut used = vec![0usize; self.segments.len()];
                let (standard, others): (Vec<_>, Vec<_>) = fragments
                    .into_iter()
                    .partition(|f| f.attribute_type() == AttributeType::STANDARD_INFORMATION);
                for fragment in standard {
                    used[0] += fragment.record_length();
                    self.segments[0].place(fragment, true);
                }
                used[0] += list.record_length();
                self.segments[0].place(list.clone(), true);
                if used[0] > capacity {
                    return Err(StrataError::InvalidData(format!(
                        "attribute list of file record {} does not fit the base segment",
                        base_reference
                    )));
                }

                for fragment in others {
                    let length = fragment.record_length();
                    let slot = match used.iter().position(|u| u + length <= capacity) {
                        Some(slot) => slot,
                        None => {
                            self.segments.push(FileRecordSegment::new(0, 0, base_reference));
                            used.push(0);
                            used.len() - 1
                        }
                    };
                    used[slot] += length;
                    let first = fragment.lowest_vcn() == 0;
                    self.segments[slot].place(fragment, first);
                }
                self.attribute_list = Some(list);
            }
        }

        // Instances may have been reassigned
        for segment in &self.segments {
            for placed in segment.attributes.iter().filter(|a| a.lowest_vcn() == 0) {
                if let Some(logical) = self
                    .attributes
                    .iter_mut()
                    .find(|a| a.matches(placed.attribute_type(), placed.name()))
                {
                    logical.set_instance(placed.instance());
                }
            }
            if let Some(list) = self.attribute_list.as_mut() {
                if let Some(placed) = segment
                    .attributes
                    .iter()
                    .find(|a| a.attribute_type() == AttributeType::ATTRIBUTE_LIST)
                {
                    list.set_instance(placed.instance());
                }
            }
        }

        let file_names = self
            .attributes
            .iter()
            .filter(|a| a.attribute_type() == AttributeType::FILE_NAME)
            .count();
        self.segments[0].reference_count = file_names as u16;
        Ok(())
    }

    /// Entries describing the current placement, once every segment has a number
    pub fn attribute_list_entries(&self) -> Vec<AttributeListEntry> {
        let mut entries: Vec<AttributeListEntry> = self
            .segments
            .iter()
            .flat_map(|segment| {
                segment
                    .attributes
                    .iter()
                    .filter(|a| a.attribute_type() != AttributeType::ATTRIBUTE_LIST)
                    .map(move |a| AttributeListEntry {
                        attribute_type: a.attribute_type(),
                        name: a.name().to_string(),
                        lowest_vcn: a.lowest_vcn(),
                        segment_reference: segment.reference(),
                        instance: a.instance(),
                    })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.attribute_type
                .cmp(&b.attribute_type)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.lowest_vcn.cmp(&b.lowest_vcn))
        });
        entries
    }

    /// Store the final list record in the base segment once its data is known
    pub fn set_attribute_list_record(&mut self, record: AttributeRecord) {
        let base = &mut self.segments[0];
        if let Some(existing) = base
            .attributes
            .iter_mut()
            .find(|a| a.attribute_type() == AttributeType::ATTRIBUTE_LIST)
        {
            let mut record = record.clone();
            record.set_instance(existing.instance());
            *existing = record;
        }
        self.attribute_list = Some(record);
    }
}

/// Cut a run list into pieces whose records fit `capacity` bytes
fn split_run_list(
    record: &NonResidentAttributeRecord,
    capacity: usize,
) -> Result<Vec<NonResidentAttributeRecord>, StrataError> {
    let header = record.mapping_pairs_offset();
    let mut fragments = Vec::new();
    let mut current = NonResidentAttributeRecord {
        data_runs: DataRunSequence::new(),
        ..record.clone()
    };
    let mut next_vcn = record.lowest_vcn;
    for extent in record.data_runs.to_extents()? {
        let mut candidate = current.data_runs.clone();
        candidate.append_extent(extent);
        if !current.data_runs.is_empty() && header + candidate.record_length() > capacity {
            let lowest_vcn = next_vcn;
            let finished = std::mem::replace(
                &mut current,
                NonResidentAttributeRecord {
                    lowest_vcn,
                    allocated_length: 0,
                    file_size: 0,
                    valid_data_length: 0,
                    data_runs: DataRunSequence::new(),
                    ..record.clone()
                },
            );
            fragments.push(finished);
            candidate = DataRunSequence::new();
            candidate.append_extent(extent);
        }
        if header + candidate.record_length() > capacity {
            return Err(StrataError::InvalidData(format!(
                "{} name too long to hold a run",
                record.attribute_type
            )));
        }
        current.data_runs = candidate;
        next_vcn += extent.length;
    }
    fragments.push(current);
    Ok(fragments)
}
