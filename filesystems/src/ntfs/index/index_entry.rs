// Index entries
// One key/reference pair of an index node. Entries in parent nodes also carry the VBN
// of the subnode holding the keys that collate before them.

use crate::ntfs::structures::{align8, MftSegmentReference};
use byteorder::{ByteOrder, LittleEndian};
use strata_core::StrataError;

pub const INDEX_ENTRY_HEADER_LENGTH: usize = 0x10;
pub const INDEX_ENTRY_SUBNODE: u16 = 0x0001;
pub const INDEX_ENTRY_LAST: u16 = 0x0002;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub file_reference: MftSegmentReference,
    pub key: Vec<u8>,
    pub subnode_vbn: Option<u64>,
    /// Terminates a node. Never carries a key.
    pub is_last_entry: bool,
}

impl IndexEntry {
    pub fn new(file_reference: MftSegmentReference, key: Vec<u8>) -> Self {
        Self {
            file_reference,
            key,
            subnode_vbn: None,
            is_last_entry: false,
        }
    }

    pub fn last(subnode_vbn: Option<u64>) -> Self {
        Self {
            file_reference: MftSegmentReference::NULL,
            key: Vec::new(),
            subnode_vbn,
            is_last_entry: true,
        }
    }

    pub fn is_parent_entry(&self) -> bool {
        self.subnode_vbn.is_some()
    }

    pub fn length(&self) -> usize {
        let base = align8(INDEX_ENTRY_HEADER_LENGTH + self.key.len());
        if self.subnode_vbn.is_some() {
            base + 8
        } else {
            base
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let length = self.length();
        let mut buffer = vec![0u8; length];
        LittleEndian::write_u64(&mut buffer[0x00..0x08], self.file_reference.to_u64());
        LittleEndian::write_u16(&mut buffer[0x08..0x0A], length as u16);
        LittleEndian::write_u16(&mut buffer[0x0A..0x0C], self.key.len() as u16);
        let mut flags = 0;
        if self.subnode_vbn.is_some() {
            flags |= INDEX_ENTRY_SUBNODE;
        }
        if self.is_last_entry {
            flags |= INDEX_ENTRY_LAST;
        }
        LittleEndian::write_u16(&mut buffer[0x0C..0x0E], flags);
        buffer[INDEX_ENTRY_HEADER_LENGTH..INDEX_ENTRY_HEADER_LENGTH + self.key.len()]
            .copy_from_slice(&self.key);
        if let Some(vbn) = self.subnode_vbn {
            LittleEndian::write_u64(&mut buffer[length - 8..length], vbn);
        }
        buffer
    }

    /// Parse one entry, returning it with its on-disk length
    pub fn parse(buffer: &[u8]) -> Result<(Self, usize), StrataError> {
        if buffer.len() < INDEX_ENTRY_HEADER_LENGTH {
            return Err(StrataError::InvalidData("truncated index entry".to_string()));
        }
        let length = LittleEndian::read_u16(&buffer[0x08..0x0A]) as usize;
        let key_length = LittleEndian::read_u16(&buffer[0x0A..0x0C]) as usize;
        let flags = LittleEndian::read_u16(&buffer[0x0C..0x0E]);
        let has_subnode = flags & INDEX_ENTRY_SUBNODE != 0;
        let minimum = INDEX_ENTRY_HEADER_LENGTH + key_length + if has_subnode { 8 } else { 0 };
        if length < minimum || length > buffer.len() || length % 8 != 0 {
            return Err(StrataError::InvalidData(format!(
                "index entry length {} invalid (key {} bytes)",
                length, key_length
            )));
        }
        let is_last_entry = flags & INDEX_ENTRY_LAST != 0;
        let key = if is_last_entry {
            Vec::new()
        } else {
            buffer[INDEX_ENTRY_HEADER_LENGTH..INDEX_ENTRY_HEADER_LENGTH + key_length].to_vec()
        };
        let entry = Self {
            file_reference: MftSegmentReference::from_u64(LittleEndian::read_u64(&buffer[0x00..0x08])),
            key,
            subnode_vbn: has_subnode.then(|| LittleEndian::read_u64(&buffer[length - 8..length])),
            is_last_entry,
        };
        Ok((entry, length))
    }

    /// Parse a node's entry list up to and including its last entry
    pub fn parse_list(buffer: &[u8]) -> Result<Vec<IndexEntry>, StrataError> {
        let mut entries = Vec::new();
        let mut offset = 0;
        loop {
            let (entry, length) = IndexEntry::parse(&buffer[offset..])?;
            offset += length;
            let last = entry.is_last_entry;
            entries.push(entry);
            if last {
                return Ok(entries);
            }
        }
    }

    pub fn list_to_bytes(entries: &[IndexEntry]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(Self::list_length(entries));
        for entry in entries {
            buffer.extend_from_slice(&entry.to_bytes());
        }
        buffer
    }

    pub fn list_length(entries: &[IndexEntry]) -> usize {
        entries.iter().map(|e| e.length()).sum()
    }
}
