// Index nodes
// The resident $INDEX_ROOT value and the INDX blocks stored in $INDEX_ALLOCATION.

use crate::ntfs::index::collation::CollationRule;
use crate::ntfs::index::index_entry::IndexEntry;
use crate::ntfs::multi_sector::{apply_fixup, revert_fixup, update_sequence_count};
use crate::ntfs::structures::{align8, AttributeType};
use byteorder::{ByteOrder, LittleEndian};
use strata_core::StrataError;

pub const INDEX_RECORD_SIGNATURE: &[u8; 4] = b"INDX";
const INDEX_ROOT_HEADER_OFFSET: usize = 0x10;
const INDEX_RECORD_HEADER_OFFSET: usize = 0x18;
const INDEX_RECORD_USA_OFFSET: usize = 0x28;
const INDEX_HEADER_LENGTH: usize = 0x10;
/// Index header flag: the node has subnodes
const INDEX_HEADER_PARENT_NODE: u8 = 0x01;

/// Unit of a VBN: the cluster, or 512-byte blocks when records are smaller than a cluster
pub fn vbn_unit(bytes_per_index_record: u32, bytes_per_cluster: u32) -> u32 {
    if bytes_per_index_record >= bytes_per_cluster {
        bytes_per_cluster
    } else {
        bytes_per_index_record.min(512)
    }
}

struct IndexHeader {
    entries_offset: usize,
    index_length: usize,
    is_parent_node: bool,
}

impl IndexHeader {
    fn parse(buffer: &[u8]) -> Result<Self, StrataError> {
        if buffer.len() < INDEX_HEADER_LENGTH {
            return Err(StrataError::InvalidData("truncated index header".to_string()));
        }
        let header = Self {
            entries_offset: LittleEndian::read_u32(&buffer[0x00..0x04]) as usize,
            index_length: LittleEndian::read_u32(&buffer[0x04..0x08]) as usize,
            is_parent_node: buffer[0x0C] & INDEX_HEADER_PARENT_NODE != 0,
        };
        if header.entries_offset < INDEX_HEADER_LENGTH
            || header.index_length < header.entries_offset
            || header.index_length > buffer.len()
        {
            return Err(StrataError::InvalidData(format!(
                "index header entries {}..{} outside {} bytes",
                header.entries_offset,
                header.index_length,
                buffer.len()
            )));
        }
        Ok(header)
    }

    fn write(buffer: &mut [u8], entries_offset: usize, index_length: usize, allocated: usize, parent: bool) {
        LittleEndian::write_u32(&mut buffer[0x00..0x04], entries_offset as u32);
        LittleEndian::write_u32(&mut buffer[0x04..0x08], index_length as u32);
        LittleEndian::write_u32(&mut buffer[0x08..0x0C], allocated as u32);
        buffer[0x0C] = if parent { INDEX_HEADER_PARENT_NODE } else { 0 };
    }
}

fn check_entries(entries: &[IndexEntry], is_parent_node: bool) -> Result<(), StrataError> {
    match entries.last() {
        Some(last) if last.is_last_entry => {}
        _ => return Err(StrataError::InvalidData("index node has no last entry".to_string())),
    }
    if entries.iter().any(|e| e.is_parent_entry() != is_parent_node) {
        return Err(StrataError::InvalidData(
            "index node mixes leaf and parent entries".to_string(),
        ));
    }
    Ok(())
}

/// `$INDEX_ROOT` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRoot {
    /// `$FILE_NAME` for directories, zero for view indexes
    pub indexed_attribute_type: AttributeType,
    pub collation_rule: CollationRule,
    pub bytes_per_index_record: u32,
    pub blocks_per_index_record: u8,
    pub is_parent_node: bool,
    pub entries: Vec<IndexEntry>,
}

impl IndexRoot {
    pub fn new(
        indexed_attribute_type: AttributeType,
        collation_rule: CollationRule,
        bytes_per_index_record: u32,
        bytes_per_cluster: u32,
    ) -> Self {
        Self {
            indexed_attribute_type,
            collation_rule,
            bytes_per_index_record,
            blocks_per_index_record: (bytes_per_index_record / vbn_unit(bytes_per_index_record, bytes_per_cluster))
                as u8,
            is_parent_node: false,
            entries: vec![IndexEntry::last(None)],
        }
    }

    pub fn length(&self) -> usize {
        INDEX_ROOT_HEADER_OFFSET + INDEX_HEADER_LENGTH + IndexEntry::list_length(&self.entries)
    }

    pub fn parse(buffer: &[u8]) -> Result<Self, StrataError> {
        if buffer.len() < INDEX_ROOT_HEADER_OFFSET + INDEX_HEADER_LENGTH {
            return Err(StrataError::InvalidData("$INDEX_ROOT too small".to_string()));
        }
        let header = IndexHeader::parse(&buffer[INDEX_ROOT_HEADER_OFFSET..])?;
        let entries = IndexEntry::parse_list(
            &buffer[INDEX_ROOT_HEADER_OFFSET + header.entries_offset..INDEX_ROOT_HEADER_OFFSET + header.index_length],
        )?;
        check_entries(&entries, header.is_parent_node)?;
        Ok(Self {
            indexed_attribute_type: AttributeType(LittleEndian::read_u32(&buffer[0x00..0x04])),
            collation_rule: CollationRule::from_u32(LittleEndian::read_u32(&buffer[0x04..0x08]))?,
            bytes_per_index_record: LittleEndian::read_u32(&buffer[0x08..0x0C]),
            blocks_per_index_record: buffer[0x0C],
            is_parent_node: header.is_parent_node,
            entries,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let entries = IndexEntry::list_to_bytes(&self.entries);
        let mut buffer = vec![0u8; INDEX_ROOT_HEADER_OFFSET + INDEX_HEADER_LENGTH];
        LittleEndian::write_u32(&mut buffer[0x00..0x04], self.indexed_attribute_type.0);
        LittleEndian::write_u32(&mut buffer[0x04..0x08], self.collation_rule as u32);
        LittleEndian::write_u32(&mut buffer[0x08..0x0C], self.bytes_per_index_record);
        buffer[0x0C] = self.blocks_per_index_record;
        let index_length = INDEX_HEADER_LENGTH + entries.len();
        IndexHeader::write(
            &mut buffer[INDEX_ROOT_HEADER_OFFSET..],
            INDEX_HEADER_LENGTH,
            index_length,
            index_length,
            self.is_parent_node,
        );
        buffer.extend_from_slice(&entries);
        buffer
    }
}

/// One INDX block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub record_vbn: u64,
    pub lsn: u64,
    pub update_sequence_number: u16,
    pub is_parent_node: bool,
    pub entries: Vec<IndexEntry>,
}

impl IndexRecord {
    pub fn new(record_vbn: u64, is_parent_node: bool, entries: Vec<IndexEntry>) -> Self {
        Self {
            record_vbn,
            lsn: 0,
            update_sequence_number: 1,
            is_parent_node,
            entries,
        }
    }

    /// Absolute offset of the first entry
    pub fn entries_start(bytes_per_index_record: usize) -> usize {
        align8(INDEX_RECORD_USA_OFFSET + update_sequence_count(bytes_per_index_record) as usize * 2)
    }

    pub fn entries_capacity(bytes_per_index_record: usize) -> usize {
        bytes_per_index_record - Self::entries_start(bytes_per_index_record)
    }

    pub fn parse(buffer: &[u8], expected_vbn: u64) -> Result<Self, StrataError> {
        if buffer.len() < INDEX_RECORD_USA_OFFSET || &buffer[0..4] != INDEX_RECORD_SIGNATURE {
            return Err(StrataError::InvalidData(format!(
                "index record at VBN {} has no INDX signature",
                expected_vbn
            )));
        }
        let mut block = buffer.to_vec();
        let update_sequence_number = revert_fixup(&mut block)?;
        let record_vbn = LittleEndian::read_u64(&block[0x10..0x18]);
        if record_vbn != expected_vbn {
            return Err(StrataError::InvalidData(format!(
                "index record at VBN {} claims VBN {}",
                expected_vbn, record_vbn
            )));
        }
        let header = IndexHeader::parse(&block[INDEX_RECORD_HEADER_OFFSET..])?;
        let entries = IndexEntry::parse_list(
            &block[INDEX_RECORD_HEADER_OFFSET + header.entries_offset
                ..INDEX_RECORD_HEADER_OFFSET + header.index_length],
        )?;
        check_entries(&entries, header.is_parent_node)?;
        Ok(Self {
            record_vbn,
            lsn: LittleEndian::read_u64(&block[0x08..0x10]),
            update_sequence_number,
            is_parent_node: header.is_parent_node,
            entries,
        })
    }

    pub fn to_bytes(&self, bytes_per_index_record: usize) -> Result<Vec<u8>, StrataError> {
        let entries = IndexEntry::list_to_bytes(&self.entries);
        let start = Self::entries_start(bytes_per_index_record);
        if start + entries.len() > bytes_per_index_record {
            return Err(StrataError::InvalidData(format!(
                "{} bytes of entries overflow index record at VBN {}",
                entries.len(),
                self.record_vbn
            )));
        }
        let mut buffer = vec![0u8; bytes_per_index_record];
        buffer[0..4].copy_from_slice(INDEX_RECORD_SIGNATURE);
        LittleEndian::write_u16(&mut buffer[0x04..0x06], INDEX_RECORD_USA_OFFSET as u16);
        LittleEndian::write_u16(&mut buffer[0x06..0x08], update_sequence_count(bytes_per_index_record));
        LittleEndian::write_u64(&mut buffer[0x08..0x10], self.lsn);
        LittleEndian::write_u64(&mut buffer[0x10..0x18], self.record_vbn);
        let entries_offset = start - INDEX_RECORD_HEADER_OFFSET;
        IndexHeader::write(
            &mut buffer[INDEX_RECORD_HEADER_OFFSET..],
            entries_offset,
            entries_offset + entries.len(),
            bytes_per_index_record - INDEX_RECORD_HEADER_OFFSET,
            self.is_parent_node,
        );
        buffer[start..start + entries.len()].copy_from_slice(&entries);
        apply_fixup(&mut buffer, self.update_sequence_number)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::structures::MftSegmentReference;

    fn leaf_entries() -> Vec<IndexEntry> {
        vec![
            IndexEntry::new(MftSegmentReference::new(30, 1), vec![0x11; 12]),
            IndexEntry::new(MftSegmentReference::new(31, 1), vec![0x22; 12]),
            IndexEntry::last(None),
        ]
    }

    #[test]
    fn test_index_record_layout() {
        let record = IndexRecord::new(8, false, leaf_entries());
        let bytes = record.to_bytes(4096).unwrap();
        assert_eq!(&bytes[0..4], b"INDX");
        assert_eq!(LittleEndian::read_u16(&bytes[0x06..0x08]), 9);
        // Entries start at 0x40, recorded relative to the header at 0x18
        assert_eq!(LittleEndian::read_u32(&bytes[0x18..0x1C]), 0x28);
        assert_eq!(LittleEndian::read_u32(&bytes[0x20..0x24]), 4096 - 0x18);
        assert_eq!(IndexRecord::parse(&bytes, 8).unwrap(), record);
        assert!(IndexRecord::parse(&bytes, 16).is_err());
    }

    #[test]
    fn test_small_index_record() {
        assert_eq!(IndexRecord::entries_start(256), 0x30);
        let record = IndexRecord::new(3, false, leaf_entries());
        let bytes = record.to_bytes(256).unwrap();
        assert_eq!(IndexRecord::parse(&bytes, 3).unwrap().entries, leaf_entries());

        let mut crowded = leaf_entries();
        for i in 0..6 {
            crowded.insert(0, IndexEntry::new(MftSegmentReference::new(40 + i, 1), vec![0x33; 12]));
        }
        assert!(IndexRecord::new(3, false, crowded).to_bytes(256).is_err());
    }

    #[test]
    fn test_index_root_round_trip() {
        let mut root = IndexRoot::new(AttributeType::FILE_NAME, CollationRule::FileName, 4096, 4096);
        assert_eq!(root.blocks_per_index_record, 1);
        assert_eq!(root.length(), 0x30);
        root.is_parent_node = true;
        let mut first = IndexEntry::new(MftSegmentReference::new(30, 1), vec![0x44; 8]);
        first.subnode_vbn = Some(0);
        root.entries = vec![first, IndexEntry::last(Some(1))];
        let bytes = root.to_bytes();
        assert_eq!(bytes.len(), root.length());
        assert_eq!(bytes[0x1C], 0x01);
        assert_eq!(IndexRoot::parse(&bytes).unwrap(), root);
    }

    #[test]
    fn test_mixed_node_rejected() {
        let mut root = IndexRoot::new(AttributeType::FILE_NAME, CollationRule::FileName, 4096, 4096);
        root.entries = vec![
            IndexEntry::new(MftSegmentReference::new(30, 1), vec![0x44; 8]),
            IndexEntry::last(Some(1)),
        ];
        assert!(IndexRoot::parse(&root.to_bytes()).is_err());
    }

    #[test]
    fn test_vbn_unit() {
        assert_eq!(vbn_unit(4096, 4096), 4096);
        assert_eq!(vbn_unit(4096, 512), 512);
        assert_eq!(vbn_unit(4096, 65536), 512);
        assert_eq!(vbn_unit(256, 4096), 256);
    }
}
