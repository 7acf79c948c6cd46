// NTFS attribute records
// Resident and non-resident attribute headers as stored inside a file record segment

pub mod attribute_list;
pub mod file_name;
pub mod standard_information;
pub mod volume_information;

pub use attribute_list::AttributeListEntry;
pub use file_name::{FileNameNamespace, FileNameRecord};
pub use standard_information::StandardInformation;
pub use volume_information::VolumeInformation;

use crate::ntfs::data_runs::DataRunSequence;
use crate::ntfs::structures::{align8, decode_utf16, encode_utf16, utf16_len, AttributeType};
use byteorder::{ByteOrder, LittleEndian};
use strata_core::StrataError;

const RESIDENT_HEADER_LENGTH: usize = 0x18;
const NON_RESIDENT_HEADER_LENGTH: usize = 0x40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentAttributeRecord {
    pub attribute_type: AttributeType,
    pub name: String,
    pub flags: u16,
    pub instance: u16,
    /// Set for attributes referenced by an index (e.g. `$FILE_NAME`)
    pub indexed_flag: u8,
    pub data: Vec<u8>,
}

impl ResidentAttributeRecord {
    /// Record length of a resident attribute with this name and value length
    pub fn record_length_for(name: &str, value_length: usize) -> usize {
        align8(align8(RESIDENT_HEADER_LENGTH + utf16_len(name) * 2) + value_length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonResidentAttributeRecord {
    pub attribute_type: AttributeType,
    pub name: String,
    pub flags: u16,
    pub instance: u16,
    pub lowest_vcn: u64,
    pub compression_unit: u16,
    pub allocated_length: u64,
    pub file_size: u64,
    pub valid_data_length: u64,
    pub data_runs: DataRunSequence,
}

impl NonResidentAttributeRecord {
    pub fn new(attribute_type: AttributeType, name: &str) -> Self {
        Self {
            attribute_type,
            name: name.to_string(),
            flags: 0,
            instance: 0,
            lowest_vcn: 0,
            compression_unit: 0,
            allocated_length: 0,
            file_size: 0,
            valid_data_length: 0,
            data_runs: DataRunSequence::new(),
        }
    }

    /// Last VCN mapped by this record, -1 when it maps nothing
    pub fn highest_vcn(&self) -> i64 {
        self.lowest_vcn as i64 + self.data_runs.data_cluster_count() as i64 - 1
    }

    pub fn mapping_pairs_offset(&self) -> usize {
        align8(NON_RESIDENT_HEADER_LENGTH + utf16_len(&self.name) * 2)
    }
}

/// One attribute record, stored either inline in the segment or as a run list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeRecord {
    Resident(ResidentAttributeRecord),
    NonResident(NonResidentAttributeRecord),
}

impl AttributeRecord {
    pub fn new_resident(attribute_type: AttributeType, name: &str, data: Vec<u8>) -> Self {
        AttributeRecord::Resident(ResidentAttributeRecord {
            attribute_type,
            name: name.to_string(),
            flags: 0,
            instance: 0,
            indexed_flag: 0,
            data,
        })
    }

    pub fn attribute_type(&self) -> AttributeType {
        match self {
            AttributeRecord::Resident(r) => r.attribute_type,
            AttributeRecord::NonResident(r) => r.attribute_type,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AttributeRecord::Resident(r) => &r.name,
            AttributeRecord::NonResident(r) => &r.name,
        }
    }

    pub fn flags(&self) -> u16 {
        match self {
            AttributeRecord::Resident(r) => r.flags,
            AttributeRecord::NonResident(r) => r.flags,
        }
    }

    pub fn instance(&self) -> u16 {
        match self {
            AttributeRecord::Resident(r) => r.instance,
            AttributeRecord::NonResident(r) => r.instance,
        }
    }

    pub fn set_instance(&mut self, instance: u16) {
        match self {
            AttributeRecord::Resident(r) => r.instance = instance,
            AttributeRecord::NonResident(r) => r.instance = instance,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, AttributeRecord::Resident(_))
    }

    /// Logical length of the attribute value
    pub fn data_length(&self) -> u64 {
        match self {
            AttributeRecord::Resident(r) => r.data.len() as u64,
            AttributeRecord::NonResident(r) => r.file_size,
        }
    }

    pub fn matches(&self, attribute_type: AttributeType, name: &str) -> bool {
        self.attribute_type() == attribute_type && self.name() == name
    }

    /// Lowest VCN of a non-resident fragment, 0 for resident records
    pub fn lowest_vcn(&self) -> u64 {
        match self {
            AttributeRecord::Resident(_) => 0,
            AttributeRecord::NonResident(r) => r.lowest_vcn,
        }
    }

    pub fn record_length(&self) -> usize {
        match self {
            AttributeRecord::Resident(r) => ResidentAttributeRecord::record_length_for(&r.name, r.data.len()),
            AttributeRecord::NonResident(r) => {
                align8(r.mapping_pairs_offset() + r.data_runs.record_length())
            }
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self, StrataError> {
        if buffer.len() < RESIDENT_HEADER_LENGTH {
            return Err(StrataError::InvalidData(
                "attribute record too small".to_string(),
            ));
        }
        let attribute_type = AttributeType(LittleEndian::read_u32(&buffer[0x00..0x04]));
        let record_length = LittleEndian::read_u32(&buffer[0x04..0x08]) as usize;
        let non_resident = buffer[0x08] != 0;
        let name_length = buffer[0x09] as usize;
        let name_offset = LittleEndian::read_u16(&buffer[0x0A..0x0C]) as usize;
        let flags = LittleEndian::read_u16(&buffer[0x0C..0x0E]);
        let instance = LittleEndian::read_u16(&buffer[0x0E..0x10]);

        if record_length < RESIDENT_HEADER_LENGTH || record_length > buffer.len() {
            return Err(StrataError::InvalidData(format!(
                "invalid {} record length {}",
                attribute_type, record_length
            )));
        }
        let record = &buffer[..record_length];
        if name_offset + name_length * 2 > record_length {
            return Err(StrataError::InvalidData(format!(
                "{} name beyond record end",
                attribute_type
            )));
        }
        let name = decode_utf16(&record[name_offset..name_offset + name_length * 2]);

        if !non_resident {
            let value_length = LittleEndian::read_u32(&record[0x10..0x14]) as usize;
            let value_offset = LittleEndian::read_u16(&record[0x14..0x16]) as usize;
            if value_offset + value_length > record_length {
                return Err(StrataError::InvalidData(format!(
                    "{} resident value beyond record end",
                    attribute_type
                )));
            }
            return Ok(AttributeRecord::Resident(ResidentAttributeRecord {
                attribute_type,
                name,
                flags,
                instance,
                indexed_flag: record[0x16],
                data: record[value_offset..value_offset + value_length].to_vec(),
            }));
        }

        if record_length < NON_RESIDENT_HEADER_LENGTH {
            return Err(StrataError::InvalidData(format!(
                "{} non-resident header truncated",
                attribute_type
            )));
        }
        let mapping_pairs_offset = LittleEndian::read_u16(&record[0x20..0x22]) as usize;
        if mapping_pairs_offset > record_length {
            return Err(StrataError::InvalidData(format!(
                "{} mapping pairs beyond record end",
                attribute_type
            )));
        }
        Ok(AttributeRecord::NonResident(NonResidentAttributeRecord {
            attribute_type,
            name,
            flags,
            instance,
            lowest_vcn: LittleEndian::read_u64(&record[0x10..0x18]),
            compression_unit: LittleEndian::read_u16(&record[0x22..0x24]),
            allocated_length: LittleEndian::read_u64(&record[0x28..0x30]),
            file_size: LittleEndian::read_u64(&record[0x30..0x38]),
            valid_data_length: LittleEndian::read_u64(&record[0x38..0x40]),
            data_runs: DataRunSequence::parse(&record[mapping_pairs_offset..])?,
        }))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let length = self.record_length();
        let mut buffer = vec![0u8; length];
        let name = encode_utf16(self.name());
        LittleEndian::write_u32(&mut buffer[0x00..0x04], self.attribute_type().0);
        LittleEndian::write_u32(&mut buffer[0x04..0x08], length as u32);
        buffer[0x09] = (name.len() / 2) as u8;
        LittleEndian::write_u16(&mut buffer[0x0C..0x0E], self.flags());
        LittleEndian::write_u16(&mut buffer[0x0E..0x10], self.instance());

        match self {
            AttributeRecord::Resident(r) => {
                let value_offset = align8(RESIDENT_HEADER_LENGTH + name.len());
                LittleEndian::write_u16(&mut buffer[0x0A..0x0C], RESIDENT_HEADER_LENGTH as u16);
                LittleEndian::write_u32(&mut buffer[0x10..0x14], r.data.len() as u32);
                LittleEndian::write_u16(&mut buffer[0x14..0x16], value_offset as u16);
                buffer[0x16] = r.indexed_flag;
                buffer[RESIDENT_HEADER_LENGTH..RESIDENT_HEADER_LENGTH + name.len()]
                    .copy_from_slice(&name);
                buffer[value_offset..value_offset + r.data.len()].copy_from_slice(&r.data);
            }
            AttributeRecord::NonResident(r) => {
                let mapping_pairs_offset = r.mapping_pairs_offset();
                let runs = r.data_runs.to_bytes();
                buffer[0x08] = 1;
                LittleEndian::write_u16(
                    &mut buffer[0x0A..0x0C],
                    NON_RESIDENT_HEADER_LENGTH as u16,
                );
                LittleEndian::write_u64(&mut buffer[0x10..0x18], r.lowest_vcn);
                LittleEndian::write_i64(&mut buffer[0x18..0x20], r.highest_vcn());
                LittleEndian::write_u16(&mut buffer[0x20..0x22], mapping_pairs_offset as u16);
                LittleEndian::write_u16(&mut buffer[0x22..0x24], r.compression_unit);
                LittleEndian::write_u64(&mut buffer[0x28..0x30], r.allocated_length);
                LittleEndian::write_u64(&mut buffer[0x30..0x38], r.file_size);
                LittleEndian::write_u64(&mut buffer[0x38..0x40], r.valid_data_length);
                buffer[NON_RESIDENT_HEADER_LENGTH..NON_RESIDENT_HEADER_LENGTH + name.len()]
                    .copy_from_slice(&name);
                buffer[mapping_pairs_offset..mapping_pairs_offset + runs.len()]
                    .copy_from_slice(&runs);
            }
        }
        buffer
    }
}
