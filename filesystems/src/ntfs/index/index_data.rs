// B+tree index
// Keys live in the resident $INDEX_ROOT and, once that overflows, in INDX records of
// $INDEX_ALLOCATION whose use is tracked by the $BITMAP of the same name.
//
// Parent nodes keep live keys: every keyed entry of a parent points at the subtree of
// keys that collate before it, and its last entry points at the keys after all of them.

use crate::ntfs::attribute_data::{read_stream_bytes, AttributeData};
use crate::ntfs::attributes::{AttributeRecord, FileNameRecord, NonResidentAttributeRecord, ResidentAttributeRecord};
use crate::ntfs::bitmap::BitmapData;
use crate::ntfs::file_record::FileRecord;
use crate::ntfs::index::collation::CollationRule;
use crate::ntfs::index::index_entry::IndexEntry;
use crate::ntfs::index::index_record::{vbn_unit, IndexRecord, IndexRoot};
use crate::ntfs::logfile::{LogOperation, LogTarget, TransactionId};
use crate::ntfs::multi_sector::next_update_sequence_number;
use crate::ntfs::structures::{AttributeType, MftSegmentReference};
use crate::ntfs::volume_io::{RecordStore, VolumeContext};
use log::{debug, trace};
use std::cmp::Ordering;
use std::collections::HashSet;
use strata_core::StrataError;

/// Deeper trees only come from corrupt subnode pointers
const MAX_INDEX_DEPTH: usize = 32;
/// Initial size of the `$BITMAP` that accompanies `$INDEX_ALLOCATION`
const INDEX_BITMAP_INITIAL_LENGTH: usize = 8;

/// A node held in memory while the tree is modified
#[derive(Debug, Clone)]
struct IndexNode {
    /// `None` for the root
    vbn: Option<u64>,
    is_parent: bool,
    entries: Vec<IndexEntry>,
    update_sequence_number: u16,
}

impl IndexNode {
    fn keyed_count(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    fn subnode(&self, position: usize) -> Result<u64, StrataError> {
        self.entries
            .get(position)
            .and_then(|e| e.subnode_vbn)
            .ok_or_else(|| StrataError::InvalidData(format!("index entry {} has no subnode", position)))
    }
}

/// Ancestors of the node being modified, with the position of the entry that points down
type IndexPath = Vec<(IndexNode, usize)>;

pub struct IndexData<'a> {
    ctx: &'a VolumeContext,
    record: &'a mut FileRecord,
    name: String,
    root: IndexRoot,
}

impl<'a> IndexData<'a> {
    pub fn new(ctx: &'a VolumeContext, record: &'a mut FileRecord, name: &str) -> Result<Self, StrataError> {
        let root = match record.get_attribute(AttributeType::INDEX_ROOT, name) {
            Some(AttributeRecord::Resident(r)) => IndexRoot::parse(&r.data)?,
            Some(AttributeRecord::NonResident(_)) => {
                return Err(StrataError::InvalidData(format!(
                    "$INDEX_ROOT '{}' of file record {} is non-resident",
                    name,
                    record.segment_number()
                )))
            }
            None => {
                return Err(StrataError::InvalidData(format!(
                    "file record {} has no $INDEX_ROOT '{}'",
                    record.segment_number(),
                    name
                )))
            }
        };
        if root.bytes_per_index_record == 0 || root.bytes_per_index_record % 256 != 0 {
            return Err(StrataError::InvalidData(format!(
                "index record size {} in $INDEX_ROOT '{}'",
                root.bytes_per_index_record, name
            )));
        }
        Ok(Self {
            ctx,
            record,
            name: name.to_string(),
            root,
        })
    }

    pub fn record(&self) -> &FileRecord {
        self.record
    }

    pub fn collation_rule(&self) -> CollationRule {
        self.root.collation_rule
    }

    pub fn root(&self) -> &IndexRoot {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        !self.root.is_parent_node && self.root.entries.len() == 1
    }

    fn bytes_per_index_record(&self) -> u64 {
        self.root.bytes_per_index_record as u64
    }

    fn vbn_unit(&self) -> u64 {
        vbn_unit(self.root.bytes_per_index_record, self.ctx.geometry().bytes_per_cluster) as u64
    }

    fn record_offset(&self, vbn: u64) -> u64 {
        vbn * self.vbn_unit()
    }

    fn record_index(&self, vbn: u64) -> u64 {
        self.record_offset(vbn) / self.bytes_per_index_record()
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.root.collation_rule.compare(a, b, self.ctx.upcase())
    }

    fn describe_key(&self, key: &[u8]) -> String {
        if self.root.collation_rule == CollationRule::FileName {
            if let Ok(name) = FileNameRecord::parse(key) {
                return name.name;
            }
        }
        format!("{:02x?}", key)
    }

    /// Index of the first entry whose key collates at or after `key`, the last entry
    /// standing in for everything greater. The flag tells whether the key matched.
    fn find_index_in_node(&self, entries: &[IndexEntry], key: &[u8]) -> (usize, bool) {
        for (position, entry) in entries.iter().enumerate() {
            if entry.is_last_entry {
                return (position, false);
            }
            match self.compare(key, &entry.key) {
                Ordering::Less => return (position, false),
                Ordering::Equal => return (position, true),
                Ordering::Greater => {}
            }
        }
        (entries.len().saturating_sub(1), false)
    }

    fn root_node(&self) -> IndexNode {
        IndexNode {
            vbn: None,
            is_parent: self.root.is_parent_node,
            entries: self.root.entries.clone(),
            update_sequence_number: 0,
        }
    }

    fn allocation(&self) -> Result<&AttributeRecord, StrataError> {
        self.record
            .get_attribute(AttributeType::INDEX_ALLOCATION, &self.name)
            .ok_or_else(|| {
                StrataError::InvalidData(format!(
                    "index '{}' of file record {} has subnodes but no $INDEX_ALLOCATION",
                    self.name,
                    self.record.segment_number()
                ))
            })
    }

    fn allocated_record_count(&self) -> Result<u64, StrataError> {
        match self.record.get_attribute(AttributeType::INDEX_ALLOCATION, &self.name) {
            Some(allocation) => Ok(allocation.data_length() / self.bytes_per_index_record()),
            None => Ok(0),
        }
    }

    fn read_node(&self, vbn: u64) -> Result<IndexNode, StrataError> {
        let size = self.bytes_per_index_record() as usize;
        let bytes = read_stream_bytes(self.ctx.io(), self.allocation()?, self.record_offset(vbn), size)?;
        if bytes.len() != size {
            return Err(StrataError::InvalidData(format!(
                "index record VBN {} lies beyond $INDEX_ALLOCATION '{}'",
                vbn, self.name
            )));
        }
        let record = IndexRecord::parse(&bytes, vbn)?;
        Ok(IndexNode {
            vbn: Some(vbn),
            is_parent: record.is_parent_node,
            entries: record.entries,
            update_sequence_number: record.update_sequence_number,
        })
    }

    fn fits(&self, node: &IndexNode) -> bool {
        let length = IndexEntry::list_length(&node.entries);
        match node.vbn {
            None => {
                let value_length = self.root.length() - IndexEntry::list_length(&self.root.entries) + length;
                ResidentAttributeRecord::record_length_for(&self.name, value_length)
                    <= self.ctx.geometry().attribute_record_length_to_make_non_resident()
            }
            Some(_) => length <= IndexRecord::entries_capacity(self.bytes_per_index_record() as usize),
        }
    }

    /// Persist the root through the owning file record
    fn save_root(&mut self, store: &mut dyn RecordStore, transaction_id: TransactionId) -> Result<(), StrataError> {
        let bytes = self.root.to_bytes();
        match self.record.get_attribute_mut(AttributeType::INDEX_ROOT, &self.name) {
            Some(AttributeRecord::Resident(r)) => r.data = bytes,
            _ => {
                return Err(StrataError::InvalidData(format!(
                    "$INDEX_ROOT '{}' disappeared from file record {}",
                    self.name,
                    self.record.segment_number()
                )))
            }
        }
        store.update_file_record(self.ctx, self.record, transaction_id)
    }

    fn write_node(
        &mut self,
        store: &mut dyn RecordStore,
        node: &mut IndexNode,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let Some(vbn) = node.vbn else {
            self.root.is_parent_node = node.is_parent;
            self.root.entries = node.entries.clone();
            return self.save_root(store, transaction_id);
        };

        let size = self.bytes_per_index_record() as usize;
        let offset = self.record_offset(vbn);
        let previous = read_stream_bytes(self.ctx.io(), self.allocation()?, offset, size)?;
        let mut index_record = IndexRecord::new(vbn, node.is_parent, node.entries.clone());
        index_record.update_sequence_number = next_update_sequence_number(node.update_sequence_number);
        let image = index_record.to_bytes(size)?;
        let target = LogTarget::new(self.record.reference(), AttributeType::INDEX_ALLOCATION, &self.name, offset);
        let lsn = self.ctx.write_log_record(
            &target,
            LogOperation::UpdateNonResidentValue,
            &image,
            LogOperation::UpdateNonResidentValue,
            &previous,
            transaction_id,
        )?;
        index_record.lsn = lsn.0;
        let bytes = index_record.to_bytes(size)?;
        node.update_sequence_number = index_record.update_sequence_number;
        trace!(
            "Index '{}' of file record {}: wrote VBN {} ({} entries)",
            self.name,
            self.record.segment_number(),
            vbn,
            node.entries.len()
        );
        let mut data = AttributeData::new(self.ctx, &mut *self.record, AttributeType::INDEX_ALLOCATION, &self.name)?;
        data.write_bytes(store, offset, &bytes, transaction_id)
    }

    /// Look up `key`, returning the stored key and file reference
    pub fn find_entry(&self, key: &[u8]) -> Result<Option<IndexEntry>, StrataError> {
        let mut node = self.root_node();
        for _ in 0..MAX_INDEX_DEPTH {
            let (position, found) = self.find_index_in_node(&node.entries, key);
            if found {
                let entry = &node.entries[position];
                return Ok(Some(IndexEntry::new(entry.file_reference, entry.key.clone())));
            }
            if !node.is_parent {
                return Ok(None);
            }
            node = self.read_node(node.subnode(position)?)?;
        }
        Err(StrataError::InvalidData(format!("index '{}' is deeper than {} levels", self.name, MAX_INDEX_DEPTH)))
    }

    /// Insert `key` in collation order. Fails with `AlreadyExists` on a duplicate key.
    pub fn add_entry(
        &mut self,
        store: &mut dyn RecordStore,
        file_reference: MftSegmentReference,
        key: Vec<u8>,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let mut path: IndexPath = Vec::new();
        let mut node = self.root_node();
        loop {
            if path.len() > MAX_INDEX_DEPTH {
                return Err(StrataError::InvalidData(format!(
                    "index '{}' is deeper than {} levels",
                    self.name, MAX_INDEX_DEPTH
                )));
            }
            let (position, found) = self.find_index_in_node(&node.entries, &key);
            if found {
                return Err(StrataError::AlreadyExists(self.describe_key(&key)));
            }
            if !node.is_parent {
                node.entries.insert(position, IndexEntry::new(file_reference, key));
                return self.store_node(store, path, node, transaction_id);
            }
            let child = self.read_node(node.subnode(position)?)?;
            path.push((node, position));
            node = child;
        }
    }

    /// Write `node`, splitting it first when it no longer fits
    fn store_node(
        &mut self,
        store: &mut dyn RecordStore,
        mut path: IndexPath,
        mut node: IndexNode,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        if self.fits(&node) {
            return self.write_node(store, &mut node, transaction_id);
        }
        if node.vbn.is_none() {
            let (mut root, mut child) = self.demote_root(store, node, transaction_id)?;
            if self.fits(&child) {
                self.write_node(store, &mut child, transaction_id)?;
            } else {
                self.split(store, child, &mut root, 0, transaction_id)?;
            }
            return self.store_node(store, Vec::new(), root, transaction_id);
        }
        let (mut parent, position) = path
            .pop()
            .ok_or_else(|| StrataError::InvalidData("index record without a parent".to_string()))?;
        self.split(store, node, &mut parent, position, transaction_id)?;
        self.store_node(store, path, parent, transaction_id)
    }

    /// Move every root entry into one new index record and leave a single pointer to it
    fn demote_root(
        &mut self,
        store: &mut dyn RecordStore,
        root: IndexNode,
        transaction_id: TransactionId,
    ) -> Result<(IndexNode, IndexNode), StrataError> {
        let vbn = self.allocate_index_record(store, transaction_id)?;
        debug!(
            "Index '{}' of file record {}: root demoted into VBN {}",
            self.name,
            self.record.segment_number(),
            vbn
        );
        let child = IndexNode {
            vbn: Some(vbn),
            is_parent: root.is_parent,
            entries: root.entries,
            update_sequence_number: 0,
        };
        let root = IndexNode {
            vbn: None,
            is_parent: true,
            entries: vec![IndexEntry::last(Some(vbn))],
            update_sequence_number: 0,
        };
        Ok((root, child))
    }

    /// Split an overflowing record. The lower half moves to a new left record, the middle
    /// entry is promoted into `parent` at `position`, the upper half keeps the record.
    fn split(
        &mut self,
        store: &mut dyn RecordStore,
        node: IndexNode,
        parent: &mut IndexNode,
        position: usize,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        if node.keyed_count() < 2 {
            return Err(StrataError::InvalidInput(format!(
                "index entry does not fit a {} byte index record",
                self.bytes_per_index_record()
            )));
        }
        let mut entries = node.entries;
        let last = entries
            .pop()
            .ok_or_else(|| StrataError::InvalidData("index node has no last entry".to_string()))?;
        let split_index = entries.len() / 2;
        let mut right_entries = entries.split_off(split_index);
        let mut middle = right_entries.remove(0);
        right_entries.push(last);
        let mut left_entries = entries;
        // A parent's left half ends in a pointer to the middle entry's old subtree
        left_entries.push(IndexEntry::last(if node.is_parent { middle.subnode_vbn } else { None }));

        let mut left = IndexNode {
            vbn: None,
            is_parent: node.is_parent,
            entries: left_entries,
            update_sequence_number: 0,
        };
        let mut right = IndexNode {
            vbn: node.vbn,
            is_parent: node.is_parent,
            entries: right_entries,
            update_sequence_number: node.update_sequence_number,
        };
        let capacity = IndexRecord::entries_capacity(self.bytes_per_index_record() as usize);
        if IndexEntry::list_length(&left.entries) > capacity || IndexEntry::list_length(&right.entries) > capacity {
            return Err(StrataError::InvalidInput(format!(
                "index entries do not fit a {} byte index record",
                self.bytes_per_index_record()
            )));
        }

        let left_vbn = self.allocate_index_record(store, transaction_id)?;
        left.vbn = Some(left_vbn);
        middle.subnode_vbn = Some(left_vbn);
        debug!(
            "Index '{}' of file record {}: split {:?} into VBN {} ({} entries) and {} entries",
            self.name,
            self.record.segment_number(),
            node.vbn,
            left_vbn,
            left.keyed_count(),
            right.keyed_count()
        );
        self.write_node(store, &mut left, transaction_id)?;
        self.write_node(store, &mut right, transaction_id)?;
        parent.entries.insert(position, middle);
        Ok(())
    }

    /// Remove `key`. Fails with `NotFound` when it is not in the index.
    pub fn remove_entry(
        &mut self,
        store: &mut dyn RecordStore,
        key: &[u8],
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let mut path: IndexPath = Vec::new();
        let mut node = self.root_node();
        loop {
            if path.len() > MAX_INDEX_DEPTH {
                return Err(StrataError::InvalidData(format!(
                    "index '{}' is deeper than {} levels",
                    self.name, MAX_INDEX_DEPTH
                )));
            }
            let (position, found) = self.find_index_in_node(&node.entries, key);
            if found && !node.is_parent {
                node.entries.remove(position);
                return self.after_leaf_removal(store, path, node, transaction_id);
            }
            if found {
                return self.remove_separator(store, path, node, position, transaction_id);
            }
            if !node.is_parent {
                return Err(StrataError::NotFound(self.describe_key(key)));
            }
            let child = self.read_node(node.subnode(position)?)?;
            path.push((node, position));
            node = child;
        }
    }

    /// Replace the keyed parent entry at `position` with the greatest key of its left subtree
    fn remove_separator(
        &mut self,
        store: &mut dyn RecordStore,
        mut path: IndexPath,
        mut node: IndexNode,
        position: usize,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let mut lower_path: IndexPath = Vec::new();
        let mut donor = self.read_node(node.subnode(position)?)?;
        while donor.is_parent {
            if lower_path.len() > MAX_INDEX_DEPTH {
                return Err(StrataError::InvalidData(format!(
                    "index '{}' is deeper than {} levels",
                    self.name, MAX_INDEX_DEPTH
                )));
            }
            let last = donor.entries.len() - 1;
            let child = self.read_node(donor.subnode(last)?)?;
            lower_path.push((donor, last));
            donor = child;
        }
        if donor.keyed_count() == 0 {
            return Err(StrataError::InvalidData(format!(
                "empty index record {:?} in index '{}'",
                donor.vbn, self.name
            )));
        }
        let replacement = donor.entries.remove(donor.keyed_count() - 1);
        node.entries[position].file_reference = replacement.file_reference;
        node.entries[position].key = replacement.key;

        // The separator is written before anything below it can re-insert keys
        self.write_node(store, &mut node, transaction_id)?;
        path.push((node, position));
        path.extend(lower_path);
        self.after_leaf_removal(store, path, donor, transaction_id)
    }

    /// Write a leaf that lost an entry, unlinking it from its parent once empty
    fn after_leaf_removal(
        &mut self,
        store: &mut dyn RecordStore,
        mut path: IndexPath,
        mut leaf: IndexNode,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let Some(vbn) = leaf.vbn.filter(|_| leaf.keyed_count() == 0) else {
            return self.write_node(store, &mut leaf, transaction_id);
        };
        self.deallocate_index_record(store, vbn, transaction_id)?;
        let (parent, position) = path
            .pop()
            .ok_or_else(|| StrataError::InvalidData("index record without a parent".to_string()))?;
        self.remove_pointer(store, path, parent, position, transaction_id)
    }

    /// Drop the pointer at `position` of `parent`, whose subtree is already freed.
    /// A separator key that loses its subtree is inserted again through `add_entry`.
    fn remove_pointer(
        &mut self,
        store: &mut dyn RecordStore,
        mut path: IndexPath,
        mut parent: IndexNode,
        position: usize,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let orphan = if !parent.entries[position].is_last_entry {
            Some(parent.entries.remove(position))
        } else if position > 0 {
            // The previous entry's subtree becomes the last pointer
            let previous = parent.entries.remove(position - 1);
            let last = parent.entries.len() - 1;
            parent.entries[last].subnode_vbn = previous.subnode_vbn;
            Some(previous)
        } else {
            None
        };

        match orphan {
            Some(orphan) => {
                self.write_node(store, &mut parent, transaction_id)?;
                trace!(
                    "Index '{}': re-inserting separator {}",
                    self.name,
                    self.describe_key(&orphan.key)
                );
                self.add_entry(store, orphan.file_reference, orphan.key, transaction_id)
            }
            None => match parent.vbn {
                // The only subtree is gone
                Some(vbn) => {
                    self.deallocate_index_record(store, vbn, transaction_id)?;
                    let (grandparent, parent_position) = path
                        .pop()
                        .ok_or_else(|| StrataError::InvalidData("index record without a parent".to_string()))?;
                    self.remove_pointer(store, path, grandparent, parent_position, transaction_id)
                }
                None => {
                    debug!(
                        "Index '{}' of file record {}: root is a leaf again",
                        self.name,
                        self.record.segment_number()
                    );
                    self.release_allocation(store, transaction_id)?;
                    let mut root = IndexNode {
                        vbn: None,
                        is_parent: false,
                        entries: vec![IndexEntry::last(None)],
                        update_sequence_number: 0,
                    };
                    self.write_node(store, &mut root, transaction_id)
                }
            },
        }
    }

    /// Every entry in collation order. Parent nodes contribute their keyed entries.
    pub fn get_all_entries(&self) -> Result<Vec<IndexEntry>, StrataError> {
        struct Frame {
            node: IndexNode,
            position: usize,
            descended: bool,
        }

        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![Frame {
            node: self.root_node(),
            position: 0,
            descended: false,
        }];
        while let Some(frame) = stack.last_mut() {
            let Some(entry) = frame.node.entries.get(frame.position) else {
                stack.pop();
                continue;
            };
            if !frame.descended {
                frame.descended = true;
                if let Some(vbn) = entry.subnode_vbn {
                    if !visited.insert(vbn) {
                        return Err(StrataError::InvalidData(format!(
                            "index '{}' references VBN {} twice",
                            self.name, vbn
                        )));
                    }
                    let child = self.read_node(vbn)?;
                    stack.push(Frame {
                        node: child,
                        position: 0,
                        descended: false,
                    });
                }
                continue;
            }
            if !entry.is_last_entry {
                result.push(IndexEntry::new(entry.file_reference, entry.key.clone()));
            }
            frame.position += 1;
            frame.descended = false;
        }
        Ok(result)
    }

    /// Walk every node and verify the shape of the tree. Keys must collate in order
    /// inside the bounds their parent sets, each node ends in one keyless last entry,
    /// parent entries and only parent entries carry subnodes, and every index record is
    /// reached once with exactly the reached records marked in `$BITMAP`.
    /// Returns the number of keys.
    pub fn check_structure(&self) -> Result<usize, StrataError> {
        struct Pending {
            node: IndexNode,
            lower: Option<Vec<u8>>,
            upper: Option<Vec<u8>>,
            depth: usize,
        }

        let corrupt = |what: String| StrataError::InvalidData(format!("index '{}': {}", self.name, what));
        let mut keys = 0;
        let mut reached = HashSet::new();
        let mut pending = vec![Pending {
            node: self.root_node(),
            lower: None,
            upper: None,
            depth: 0,
        }];
        while let Some(Pending { node, lower, upper, depth }) = pending.pop() {
            if depth > MAX_INDEX_DEPTH {
                return Err(corrupt(format!("deeper than {} levels", MAX_INDEX_DEPTH)));
            }
            let (last, keyed) = node
                .entries
                .split_last()
                .ok_or_else(|| corrupt(format!("node {:?} has no entries", node.vbn)))?;
            if !last.is_last_entry || !last.key.is_empty() {
                return Err(corrupt(format!("node {:?} does not end in a keyless last entry", node.vbn)));
            }
            let mut previous = lower.as_deref();
            for entry in keyed {
                if entry.is_last_entry {
                    return Err(corrupt(format!("node {:?} has a last entry before its end", node.vbn)));
                }
                if previous.is_some_and(|p| self.compare(p, &entry.key) != Ordering::Less) {
                    return Err(corrupt(format!(
                        "{} is out of order in node {:?}",
                        self.describe_key(&entry.key),
                        node.vbn
                    )));
                }
                previous = Some(entry.key.as_slice());
            }
            if let (Some(p), Some(u)) = (previous, upper.as_deref()) {
                if self.compare(p, u) != Ordering::Less {
                    return Err(corrupt(format!(
                        "{} in node {:?} does not collate before its parent separator",
                        self.describe_key(p),
                        node.vbn
                    )));
                }
            }

            for (position, entry) in node.entries.iter().enumerate() {
                match (node.is_parent, entry.subnode_vbn) {
                    (true, Some(vbn)) => {
                        if !reached.insert(vbn) {
                            return Err(corrupt(format!("VBN {} is referenced twice", vbn)));
                        }
                        let child_lower = match position {
                            0 => lower.clone(),
                            _ => Some(node.entries[position - 1].key.clone()),
                        };
                        let child_upper = if entry.is_last_entry {
                            upper.clone()
                        } else {
                            Some(entry.key.clone())
                        };
                        pending.push(Pending {
                            node: self.read_node(vbn)?,
                            lower: child_lower,
                            upper: child_upper,
                            depth: depth + 1,
                        });
                    }
                    (false, None) => {}
                    (true, None) => {
                        return Err(corrupt(format!("parent node {:?} has an entry without subnode", node.vbn)))
                    }
                    (false, Some(vbn)) => {
                        return Err(corrupt(format!("leaf node {:?} points at VBN {}", node.vbn, vbn)))
                    }
                }
            }
            keys += keyed.len();
        }

        let records = self.allocated_record_count()?;
        let bitmap = match self.record.get_attribute(AttributeType::BITMAP, &self.name) {
            Some(attribute) => read_stream_bytes(self.ctx.io(), attribute, 0, attribute.data_length() as usize)?,
            None => Vec::new(),
        };
        let mut in_use = HashSet::new();
        for vbn in &reached {
            let index = self.record_index(*vbn);
            if index >= records {
                return Err(corrupt(format!("VBN {} lies beyond $INDEX_ALLOCATION", vbn)));
            }
            in_use.insert(index);
        }
        if let Some(index) = in_use.iter().find(|i| **i >= bitmap.len() as u64 * 8) {
            return Err(corrupt(format!("index record {} has no $BITMAP bit", index)));
        }
        for index in 0..bitmap.len() as u64 * 8 {
            let allocated = bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0;
            if allocated != in_use.contains(&index) {
                return Err(corrupt(match allocated {
                    true => format!("index record {} is allocated but unreachable", index),
                    false => format!("index record {} is reachable but free", index),
                }));
            }
        }
        Ok(keys)
    }

    /// Add `$INDEX_ALLOCATION` and its `$BITMAP` the first time a record is needed
    fn ensure_allocation_attributes(&mut self) {
        if !self.record.has_attribute(AttributeType::INDEX_ALLOCATION, &self.name) {
            self.record.add_attribute(AttributeRecord::NonResident(NonResidentAttributeRecord::new(
                AttributeType::INDEX_ALLOCATION,
                &self.name,
            )));
        }
        if !self.record.has_attribute(AttributeType::BITMAP, &self.name) {
            self.record.add_attribute(AttributeRecord::new_resident(
                AttributeType::BITMAP,
                &self.name,
                vec![0u8; INDEX_BITMAP_INITIAL_LENGTH],
            ));
        }
    }

    /// Reserve an index record, growing `$INDEX_ALLOCATION` and `$BITMAP` together when full
    fn allocate_index_record(
        &mut self,
        store: &mut dyn RecordStore,
        transaction_id: TransactionId,
    ) -> Result<u64, StrataError> {
        self.ensure_allocation_attributes();
        let ctx = self.ctx;
        let name = self.name.clone();
        let size = self.bytes_per_index_record();
        let records = self.allocated_record_count()?;

        let found = {
            let mut bitmap = BitmapData::new(ctx, &mut *self.record, AttributeType::BITMAP, &name, records)?;
            bitmap.allocate_record(store, 0, transaction_id)?
        };
        let index = match found {
            Some(index) => index,
            None => {
                let granularity = ctx.config().index_extend_granularity.max(1) as u64;
                let mut allocation = AttributeData::new(ctx, &mut *self.record, AttributeType::INDEX_ALLOCATION, &name)?;
                allocation.extend(store, granularity * size, transaction_id)?;
                let mut bitmap = BitmapData::new(ctx, &mut *self.record, AttributeType::BITMAP, &name, records)?;
                bitmap.extend_bitmap(store, granularity, false, transaction_id)?;
                debug!("Index '{}': allocation grown to {} records", name, records + granularity);
                bitmap
                    .allocate_in_range(store, records, records + granularity, transaction_id)?
                    .ok_or_else(|| StrataError::DiskFull(format!("no free index record in '{}'", name)))?
            }
        };
        Ok(index * size / self.vbn_unit())
    }

    fn deallocate_index_record(
        &mut self,
        store: &mut dyn RecordStore,
        vbn: u64,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let index = self.record_index(vbn);
        let records = self.allocated_record_count()?;
        let ctx = self.ctx;
        let name = self.name.clone();
        let mut bitmap = BitmapData::new(ctx, &mut *self.record, AttributeType::BITMAP, &name, records)?;
        bitmap.deallocate_record(store, index, transaction_id)
    }

    /// Free `$INDEX_ALLOCATION` clusters and drop both allocation attributes
    fn release_allocation(&mut self, store: &mut dyn RecordStore, transaction_id: TransactionId) -> Result<(), StrataError> {
        if self.record.has_attribute(AttributeType::INDEX_ALLOCATION, &self.name) {
            let mut allocation =
                AttributeData::new(self.ctx, &mut *self.record, AttributeType::INDEX_ALLOCATION, &self.name)?;
            allocation.truncate(store, 0, transaction_id)?;
            self.record.remove_attribute(AttributeType::INDEX_ALLOCATION, &self.name);
        }
        self.record.remove_attribute(AttributeType::BITMAP, &self.name);
        Ok(())
    }
}
