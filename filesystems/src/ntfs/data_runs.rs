// NTFS Data Runs
// Encodes/decodes the mapping-pairs array of non-resident attributes and
// translates attribute-relative clusters (VCN) to volume clusters (LCN)

use strata_core::StrataError;

/// One entry of a mapping-pairs array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    /// Length in clusters
    pub run_length: i64,
    /// Start LCN relative to the start of the previous non-sparse run
    pub run_offset: i64,
    /// Reads as zero, no clusters behind it
    pub is_sparse: bool,
}

impl DataRun {
    pub fn new(run_length: i64, run_offset: i64) -> Self {
        Self {
            run_length,
            run_offset,
            is_sparse: false,
        }
    }

    pub fn sparse(run_length: i64) -> Self {
        Self {
            run_length,
            run_offset: 0,
            is_sparse: true,
        }
    }

    fn field_sizes(&self) -> (usize, usize) {
        let length_size = signed_size(self.run_length);
        // An offset size of zero is what marks a run as sparse
        let offset_size = if self.is_sparse {
            0
        } else {
            signed_size(self.run_offset)
        };
        (length_size, offset_size)
    }

    /// Encoded size in bytes, header included
    pub fn record_length(&self) -> usize {
        let (length_size, offset_size) = self.field_sizes();
        1 + length_size + offset_size
    }

    pub fn write_bytes(&self, out: &mut Vec<u8>) {
        let (length_size, offset_size) = self.field_sizes();
        out.push(((offset_size as u8) << 4) | length_size as u8);
        out.extend_from_slice(&self.run_length.to_le_bytes()[..length_size]);
        if !self.is_sparse {
            out.extend_from_slice(&self.run_offset.to_le_bytes()[..offset_size]);
        }
    }

    /// Decode one run. Returns `None` on the terminating zero header.
    pub fn read(buffer: &[u8]) -> Result<Option<(DataRun, usize)>, StrataError> {
        let header = match buffer.first() {
            Some(0) | None => return Ok(None),
            Some(header) => *header,
        };
        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(StrataError::InvalidData(format!(
                "invalid data run header {:#04x}",
                header
            )));
        }
        let end = 1 + length_size + offset_size;
        if end > buffer.len() {
            return Err(StrataError::InvalidData(
                "Data run extends beyond buffer".to_string(),
            ));
        }

        let run_length = read_signed(&buffer[1..1 + length_size]);
        if run_length <= 0 {
            return Err(StrataError::InvalidData(format!(
                "invalid data run length {}",
                run_length
            )));
        }
        let run = if offset_size == 0 {
            DataRun::sparse(run_length)
        } else {
            DataRun::new(run_length, read_signed(&buffer[1 + length_size..end]))
        };
        Ok(Some((run, end)))
    }
}

/// Smallest two's-complement width that holds `value`
fn signed_size(value: i64) -> usize {
    for size in 1..8 {
        let bits = size * 8;
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if value >= min && value <= max {
            return size;
        }
    }
    8
}

/// Read little-endian signed value with sign extension
fn read_signed(bytes: &[u8]) -> i64 {
    let mut value: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        value |= (*byte as i64) << (i * 8);
    }
    let bits = bytes.len() * 8;
    if bits > 0 && bits < 64 && bytes[bytes.len() - 1] & 0x80 != 0 {
        value |= -1i64 << bits;
    }
    value
}

/// A translated piece of a stream: `length` clusters starting at `lcn`,
/// or a hole when `lcn` is `None`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub lcn: Option<u64>,
    pub length: u64,
}

impl Extent {
    pub fn new(lcn: u64, length: u64) -> Self {
        Self {
            lcn: Some(lcn),
            length,
        }
    }

    pub fn sparse(length: u64) -> Self {
        Self { lcn: None, length }
    }

    pub fn is_sparse(&self) -> bool {
        self.lcn.is_none()
    }
}

/// Ordered run list of one non-resident attribute record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataRunSequence {
    runs: Vec<DataRun>,
}

impl DataRunSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> &[DataRun] {
        &self.runs
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn push(&mut self, run: DataRun) {
        self.runs.push(run);
    }

    /// Decode a mapping-pairs array up to its terminator
    pub fn parse(buffer: &[u8]) -> Result<Self, StrataError> {
        let mut sequence = DataRunSequence::new();
        let mut position = 0;
        let mut lcn: i64 = 0;
        while let Some((run, consumed)) = DataRun::read(&buffer[position..])? {
            if !run.is_sparse {
                lcn += run.run_offset;
                if lcn < 0 {
                    return Err(StrataError::InvalidData(format!("Invalid LCN: {}", lcn)));
                }
            }
            sequence.runs.push(run);
            position += consumed;
        }
        Ok(sequence)
    }

    /// Encoded mapping-pairs array including the terminating zero
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.record_length());
        for run in &self.runs {
            run.write_bytes(&mut bytes);
        }
        bytes.push(0);
        bytes
    }

    pub fn record_length(&self) -> usize {
        self.runs.iter().map(|run| run.record_length()).sum::<usize>() + 1
    }

    pub fn data_cluster_count(&self) -> u64 {
        self.runs.iter().map(|run| run.run_length as u64).sum()
    }

    /// Absolute extents in VCN order
    pub fn to_extents(&self) -> Result<Vec<Extent>, StrataError> {
        let mut extents = Vec::with_capacity(self.runs.len());
        let mut lcn: i64 = 0;
        for run in &self.runs {
            if run.is_sparse {
                extents.push(Extent::sparse(run.run_length as u64));
            } else {
                lcn += run.run_offset;
                if lcn < 0 {
                    return Err(StrataError::InvalidData(format!("Invalid LCN: {}", lcn)));
                }
                extents.push(Extent::new(lcn as u64, run.run_length as u64));
            }
        }
        Ok(extents)
    }

    /// Build a run list from absolute extents, merging neighbours that touch
    pub fn from_extents(extents: &[Extent]) -> Self {
        let mut sequence = DataRunSequence::new();
        for extent in extents {
            sequence.append_extent(*extent);
        }
        sequence
    }

    /// Start LCN of the last non-sparse run
    pub fn last_data_run_start_lcn(&self) -> Option<u64> {
        let mut lcn: i64 = 0;
        let mut found = false;
        for run in self.runs.iter().filter(|run| !run.is_sparse) {
            lcn += run.run_offset;
            found = true;
        }
        found.then_some(lcn as u64)
    }

    /// First LCN after the last run, the preferred place to grow the stream
    pub fn next_contiguous_lcn(&self) -> Option<u64> {
        match self.runs.last() {
            Some(last) if !last.is_sparse => self
                .last_data_run_start_lcn()
                .map(|start| start + last.run_length as u64),
            _ => None,
        }
    }

    /// Append clusters to the end of the stream. A data extent that starts
    /// right where the last run ends is folded into that run.
    pub fn append_extent(&mut self, extent: Extent) {
        if extent.length == 0 {
            return;
        }
        match extent.lcn {
            None => {
                if let Some(last) = self.runs.last_mut() {
                    if last.is_sparse {
                        last.run_length += extent.length as i64;
                        return;
                    }
                }
                self.runs.push(DataRun::sparse(extent.length as i64));
            }
            Some(lcn) => {
                if self.next_contiguous_lcn() == Some(lcn) {
                    if let Some(last) = self.runs.last_mut() {
                        last.run_length += extent.length as i64;
                        return;
                    }
                }
                let previous = self.last_data_run_start_lcn().unwrap_or(0) as i64;
                self.runs
                    .push(DataRun::new(extent.length as i64, lcn as i64 - previous));
            }
        }
    }

    /// Map `count` clusters starting at `first_vcn` (relative to the
    /// attribute's lowest VCN) to volume extents
    pub fn translate_to_lcn(&self, first_vcn: u64, count: u64) -> Result<Vec<Extent>, StrataError> {
        let total = self.data_cluster_count();
        if first_vcn.checked_add(count).map_or(true, |end| end > total) {
            return Err(StrataError::InvalidData(format!(
                "invalid cluster VCN: {}+{} beyond {} clusters",
                first_vcn, count, total
            )));
        }

        let mut result = Vec::new();
        let mut remaining = count;
        let mut position = first_vcn;
        let mut run_start_vcn = 0u64;
        let mut lcn: i64 = 0;
        for run in &self.runs {
            if remaining == 0 {
                break;
            }
            if !run.is_sparse {
                lcn += run.run_offset;
            }
            let run_length = run.run_length as u64;
            let run_end_vcn = run_start_vcn + run_length;
            if position < run_end_vcn {
                let skip = position - run_start_vcn;
                let take = (run_length - skip).min(remaining);
                if run.is_sparse {
                    result.push(Extent::sparse(take));
                } else {
                    result.push(Extent::new(lcn as u64 + skip, take));
                }
                position += take;
                remaining -= take;
            }
            run_start_vcn = run_end_vcn;
        }
        Ok(result)
    }

    /// Single cluster lookup, `None` inside a sparse run
    pub fn get_data_cluster_lcn(&self, vcn: u64) -> Result<Option<u64>, StrataError> {
        let extents = self.translate_to_lcn(vcn, 1)?;
        Ok(extents.first().and_then(|extent| extent.lcn))
    }

    /// Keep the first `clusters_to_keep` clusters
    pub fn truncate(&mut self, clusters_to_keep: u64) -> Result<(), StrataError> {
        if clusters_to_keep > self.data_cluster_count() {
            return Err(StrataError::InvalidData(format!(
                "cannot truncate run list of {} clusters to {}",
                self.data_cluster_count(),
                clusters_to_keep
            )));
        }
        let mut kept = 0u64;
        let mut runs = Vec::with_capacity(self.runs.len());
        for run in &self.runs {
            if kept >= clusters_to_keep {
                break;
            }
            let mut run = *run;
            let available = clusters_to_keep - kept;
            if run.run_length as u64 > available {
                run.run_length = available as i64;
            }
            kept += run.run_length as u64;
            runs.push(run);
        }
        self.runs = runs;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_run() {
        // length 0x18 clusters at LCN 0x5634
        let sequence = DataRunSequence::parse(&[0x21, 0x18, 0x34, 0x56, 0x00]).unwrap();
        assert_eq!(sequence.len(), 1);
        assert_eq!(sequence.runs()[0], DataRun::new(0x18, 0x5634));
        assert_eq!(sequence.to_extents().unwrap(), vec![Extent::new(0x5634, 0x18)]);
    }

    #[test]
    fn test_decode_negative_offset() {
        let bytes = [
            0x11, 0x30, 0x60, // 0x30 clusters at 0x60
            0x21, 0x10, 0x00, 0x01, // 0x10 clusters at +0x100
            0x11, 0x20, 0xE0, // 0x20 clusters at -0x20
            0x00,
        ];
        let sequence = DataRunSequence::parse(&bytes).unwrap();
        assert_eq!(
            sequence.to_extents().unwrap(),
            vec![
                Extent::new(0x60, 0x30),
                Extent::new(0x160, 0x10),
                Extent::new(0x140, 0x20),
            ]
        );
        assert_eq!(sequence.to_bytes(), bytes.to_vec());
        assert_eq!(sequence.record_length(), bytes.len());
    }

    #[test]
    fn test_decode_sparse_run() {
        let bytes = [0x11, 0x04, 0x10, 0x01, 0x08, 0x11, 0x04, 0x08, 0x00];
        let sequence = DataRunSequence::parse(&bytes).unwrap();
        assert!(sequence.runs()[1].is_sparse);
        assert_eq!(
            sequence.to_extents().unwrap(),
            vec![Extent::new(0x10, 4), Extent::sparse(8), Extent::new(0x18, 4)]
        );
    }

    #[test]
    fn test_negative_lcn_rejected() {
        assert!(matches!(
            DataRunSequence::parse(&[0x11, 0x01, 0xF0, 0x00]),
            Err(StrataError::InvalidData(_))
        ));
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        assert!(DataRunSequence::parse(&[0x31, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_run_encode_decode() {
        let runs = [
            DataRun::new(1, 0),
            DataRun::new(0x7F, 0x7F),
            DataRun::new(0x80, -0x80),
            DataRun::new(0x1_0000, -0x81),
            DataRun::new(0x12_3456_789A, 0x7FFF_FFFF_FFFF),
            DataRun::new(5, -0x7FFF_FFFF_FFFF),
            DataRun::sparse(0x4000),
        ];
        for run in runs {
            let mut bytes = Vec::new();
            run.write_bytes(&mut bytes);
            assert_eq!(bytes.len(), run.record_length());
            let (decoded, consumed) = DataRun::read(&bytes).unwrap().unwrap();
            assert_eq!(decoded, run);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_signed_size() {
        assert_eq!(signed_size(0), 1);
        assert_eq!(signed_size(127), 1);
        assert_eq!(signed_size(128), 2);
        assert_eq!(signed_size(-128), 1);
        assert_eq!(signed_size(-129), 2);
        assert_eq!(signed_size(i64::MAX), 8);
    }

    fn cluster_map(extents: &[Extent]) -> Vec<Option<u64>> {
        let mut map = Vec::new();
        for extent in extents {
            for i in 0..extent.length {
                map.push(extent.lcn.map(|lcn| lcn + i));
            }
        }
        map
    }

    #[test]
    fn test_translate_covers_requested_range() {
        let extents = vec![
            Extent::new(100, 3),
            Extent::new(40, 5),
            Extent::sparse(2),
            Extent::new(7, 1),
            Extent::new(300, 4),
        ];
        let sequence = DataRunSequence::from_extents(&extents);
        let expected = cluster_map(&extents);
        let total = sequence.data_cluster_count();
        assert_eq!(total, 15);

        for vcn in 0..total {
            for count in 1..=(total - vcn) {
                let translated = sequence.translate_to_lcn(vcn, count).unwrap();
                assert_eq!(translated.iter().map(|e| e.length).sum::<u64>(), count);
                assert_eq!(
                    cluster_map(&translated),
                    expected[vcn as usize..(vcn + count) as usize].to_vec()
                );
            }
        }
    }

    #[test]
    fn test_translate_out_of_range() {
        let sequence = DataRunSequence::from_extents(&[Extent::new(10, 4)]);
        assert!(sequence.translate_to_lcn(3, 2).is_err());
        assert!(sequence.get_data_cluster_lcn(4).is_err());
        assert_eq!(sequence.get_data_cluster_lcn(3).unwrap(), Some(13));
        assert!(sequence.translate_to_lcn(4, 0).unwrap().is_empty());
    }

    #[test]
    fn test_append_merges_contiguous_allocation() {
        // Last run covers LCN 91..=100
        let mut sequence = DataRunSequence::from_extents(&[Extent::new(20, 5), Extent::new(91, 10)]);
        assert_eq!(sequence.next_contiguous_lcn(), Some(101));
        let runs_before = sequence.len();

        sequence.append_extent(Extent::new(101, 10));
        assert_eq!(sequence.len(), runs_before);
        assert_eq!(sequence.runs().last().unwrap().run_length, 20);
        assert_eq!(sequence.data_cluster_count(), 25);

        // A gap means a new run
        sequence.append_extent(Extent::new(200, 1));
        assert_eq!(sequence.len(), runs_before + 1);
        assert_eq!(sequence.runs().last().unwrap().run_offset, 200 - 91);
    }

    #[test]
    fn test_append_after_sparse_run_is_relative_to_last_data_run() {
        let mut sequence = DataRunSequence::from_extents(&[Extent::new(50, 2), Extent::sparse(6)]);
        assert_eq!(sequence.next_contiguous_lcn(), None);
        sequence.append_extent(Extent::new(52, 3));
        assert_eq!(
            sequence.to_extents().unwrap(),
            vec![Extent::new(50, 2), Extent::sparse(6), Extent::new(52, 3)]
        );
    }

    #[test]
    fn test_truncate_splits_run() {
        let mut sequence =
            DataRunSequence::from_extents(&[Extent::new(10, 4), Extent::new(30, 6)]);
        sequence.truncate(7).unwrap();
        assert_eq!(
            sequence.to_extents().unwrap(),
            vec![Extent::new(10, 4), Extent::new(30, 3)]
        );
        sequence.truncate(0).unwrap();
        assert!(sequence.is_empty());
        assert!(sequence.truncate(1).is_err());
    }
}
