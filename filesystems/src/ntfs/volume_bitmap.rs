// Volume cluster bitmap
// First-fit cluster allocation over the $Bitmap data stream, one bit per cluster

use crate::ntfs::data_runs::{DataRunSequence, Extent};
use crate::ntfs::logfile::{LogOperation, LogTarget, TransactionId};
use crate::ntfs::structures::{AttributeType, MftSegmentReference};
use crate::ntfs::volume_io::{VolumeContext, VolumeIo};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use strata_core::StrataError;

/// Cached copy of one bitmap cluster while scanning
struct ScanBuffer {
    vcn: Option<u64>,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct VolumeBitmap {
    file_reference: MftSegmentReference,
    runs: DataRunSequence,
    total_clusters: u64,
    search_start: u64,
    free_clusters: Option<u64>,
}

impl VolumeBitmap {
    pub fn new(file_reference: MftSegmentReference, runs: DataRunSequence, total_clusters: u64) -> Self {
        Self {
            file_reference,
            runs,
            total_clusters,
            search_start: 0,
            free_clusters: None,
        }
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_clusters
    }

    pub fn runs(&self) -> &DataRunSequence {
        &self.runs
    }

    /// Point at a regrown `$Bitmap` after the volume was extended
    pub fn set_layout(&mut self, runs: DataRunSequence, total_clusters: u64) {
        self.runs = runs;
        self.total_clusters = total_clusters;
        self.free_clusters = None;
    }

    fn bits_per_cluster(io: &VolumeIo) -> u64 {
        io.geometry().bytes_per_cluster as u64 * 8
    }

    fn bit_is_set(&self, io: &VolumeIo, buffer: &mut ScanBuffer, lcn: u64) -> Result<bool, StrataError> {
        let bits_per_cluster = Self::bits_per_cluster(io);
        let vcn = lcn / bits_per_cluster;
        if buffer.vcn != Some(vcn) {
            let spc = io.geometry().sectors_per_cluster as u64;
            buffer.data = io.read_mapped(&self.runs, vcn * spc, spc)?;
            buffer.vcn = Some(vcn);
        }
        let bit = lcn % bits_per_cluster;
        Ok(buffer.data[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    pub fn is_cluster_free(&self, io: &VolumeIo, lcn: u64) -> Result<bool, StrataError> {
        if lcn >= self.total_clusters {
            return Err(StrataError::OutOfRange(format!("cluster {} beyond volume end", lcn)));
        }
        let mut buffer = ScanBuffer { vcn: None, data: Vec::new() };
        Ok(!self.bit_is_set(io, &mut buffer, lcn)?)
    }

    /// First run of clear bits in `[from, to)`, at most `max_length` long
    fn find_free_run(
        &self,
        io: &VolumeIo,
        buffer: &mut ScanBuffer,
        from: u64,
        to: u64,
        max_length: u64,
    ) -> Result<Option<(u64, u64)>, StrataError> {
        let mut lcn = from;
        while lcn < to {
            if !self.bit_is_set(io, buffer, lcn)? {
                let start = lcn;
                while lcn < to && lcn - start < max_length && !self.bit_is_set(io, buffer, lcn)? {
                    lcn += 1;
                }
                return Ok(Some((start, lcn - start)));
            }
            lcn += 1;
        }
        Ok(None)
    }

    /// Free cluster count, computed by a full scan the first time
    pub fn free_clusters(&mut self, ctx: &VolumeContext) -> Result<u64, StrataError> {
        if let Some(free) = self.free_clusters {
            return Ok(free);
        }
        let io = ctx.io();
        let bits_per_cluster = Self::bits_per_cluster(io);
        let spc = io.geometry().sectors_per_cluster as u64;
        let mut used = 0u64;
        let mut vcn = 0;
        while vcn * bits_per_cluster < self.total_clusters {
            let data = io.read_mapped(&self.runs, vcn * spc, spc)?;
            let bits = (self.total_clusters - vcn * bits_per_cluster).min(bits_per_cluster);
            let whole_bytes = (bits / 8) as usize;
            used += data[..whole_bytes].iter().map(|b| b.count_ones() as u64).sum::<u64>();
            for bit in (whole_bytes as u64 * 8)..bits {
                if data[(bit / 8) as usize] & (1 << (bit % 8)) != 0 {
                    used += 1;
                }
            }
            vcn += 1;
        }
        let free = self.total_clusters - used;
        debug!("Volume bitmap: {} of {} clusters free", free, self.total_clusters);
        self.free_clusters = Some(free);
        Ok(free)
    }

    /// Allocate `count` clusters. A run starting at `desired_lcn` is taken first when free,
    /// the rest comes first-fit from the search cursor with wraparound.
    pub fn allocate(
        &mut self,
        ctx: &VolumeContext,
        desired_lcn: Option<u64>,
        count: u64,
        transaction_id: TransactionId,
    ) -> Result<Vec<Extent>, StrataError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let free = self.free_clusters(ctx)?;
        if free < count {
            return Err(StrataError::DiskFull(format!(
                "{} clusters requested, {} free",
                count, free
            )));
        }

        let io = ctx.io();
        let mut buffer = ScanBuffer { vcn: None, data: Vec::new() };
        let mut extents: Vec<Extent> = Vec::new();
        let mut remaining = count;

        if let Some(desired) = desired_lcn.filter(|lcn| *lcn < self.total_clusters) {
            if let Some((start, length)) =
                self.find_free_run(io, &mut buffer, desired, self.total_clusters, remaining)?
            {
                if start == desired {
                    self.modify_bits(ctx, start, length, true, transaction_id)?;
                    buffer.vcn = None;
                    extents.push(Extent::new(start, length));
                    remaining -= length;
                }
            }
        }

        let mut cursor = self.search_start.min(self.total_clusters);
        let mut wrapped = false;
        while remaining > 0 {
            let limit = if wrapped { self.search_start } else { self.total_clusters };
            match self.find_free_run(io, &mut buffer, cursor, limit, remaining)? {
                Some((start, length)) => {
                    self.modify_bits(ctx, start, length, true, transaction_id)?;
                    buffer.vcn = None;
                    extents.push(Extent::new(start, length));
                    remaining -= length;
                    cursor = start + length;
                }
                None if !wrapped => {
                    wrapped = true;
                    cursor = 0;
                }
                None => {
                    return Err(StrataError::DiskFull(format!(
                        "{} clusters requested, only {} found",
                        count,
                        count - remaining
                    )));
                }
            }
        }

        if let Some(last) = extents.last().and_then(|e| e.lcn.map(|lcn| lcn + e.length)) {
            self.search_start = if last >= self.total_clusters { 0 } else { last };
        }
        if let Some(free) = self.free_clusters.as_mut() {
            *free -= count;
        }
        debug!("Allocated {} clusters in {} extent(s)", count, extents.len());
        Ok(extents)
    }

    pub fn deallocate(
        &mut self,
        ctx: &VolumeContext,
        lcn: u64,
        count: u64,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        if lcn + count > self.total_clusters {
            return Err(StrataError::InvalidData(format!(
                "clusters {}..{} beyond volume end",
                lcn,
                lcn + count
            )));
        }
        let io = ctx.io();
        let mut buffer = ScanBuffer { vcn: None, data: Vec::new() };
        let mut run_start = None;
        let mut released = 0u64;
        for cluster in lcn..=lcn + count {
            let set = cluster < lcn + count && self.bit_is_set(io, &mut buffer, cluster)?;
            match (set, run_start) {
                (true, None) => run_start = Some(cluster),
                (false, Some(start)) => {
                    self.modify_bits(ctx, start, cluster - start, false, transaction_id)?;
                    buffer.vcn = None;
                    released += cluster - start;
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(free) = self.free_clusters.as_mut() {
            *free += released;
        }
        trace!("Released {} of {} clusters at LCN {}", released, count, lcn);
        Ok(())
    }

    /// Set or clear `count` bits starting at `lcn`, logging each bitmap cluster touched
    fn modify_bits(
        &mut self,
        ctx: &VolumeContext,
        lcn: u64,
        count: u64,
        set: bool,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        let io = ctx.io();
        let bits_per_cluster = Self::bits_per_cluster(io);
        let bytes_per_cluster = io.geometry().bytes_per_cluster as u64;
        let bytes_per_sector = io.geometry().bytes_per_sector as u64;
        let (redo, undo) = if set {
            (LogOperation::SetBitsInNonResidentBitMap, LogOperation::ClearBitsInNonResidentBitMap)
        } else {
            (LogOperation::ClearBitsInNonResidentBitMap, LogOperation::SetBitsInNonResidentBitMap)
        };

        let mut bit = lcn;
        let end = lcn + count;
        while bit < end {
            let vcn = bit / bits_per_cluster;
            let chunk_end = end.min((vcn + 1) * bits_per_cluster);
            let offset_in_cluster = bit - vcn * bits_per_cluster;
            let mut range = [0u8; 8];
            LittleEndian::write_u32(&mut range[0..4], offset_in_cluster as u32);
            LittleEndian::write_u32(&mut range[4..8], (chunk_end - bit) as u32);
            let target = LogTarget::new(
                self.file_reference,
                AttributeType::DATA,
                "",
                vcn * bytes_per_cluster,
            );
            ctx.write_log_record(&target, redo, &range, undo, &range, transaction_id)?;

            let first_byte = bit / 8;
            let last_byte = (chunk_end - 1) / 8;
            let first_sector = first_byte / bytes_per_sector;
            let sector_count = last_byte / bytes_per_sector - first_sector + 1;
            let mut data = io.read_mapped(&self.runs, first_sector, sector_count)?;
            let base = first_sector * bytes_per_sector * 8;
            for b in bit..chunk_end {
                let relative = b - base;
                let mask = 1u8 << (relative % 8);
                if set {
                    data[(relative / 8) as usize] |= mask;
                } else {
                    data[(relative / 8) as usize] &= !mask;
                }
            }
            io.write_mapped(&self.runs, first_sector, &data)?;
            bit = chunk_end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ntfs::data_runs::Extent;
    use crate::test_helpers::scratch_context;

    #[test]
    fn test_first_fit_and_reuse() {
        let ctx = scratch_context(256);
        let tx = ctx.allocate_transaction_id().unwrap();
        let free_before = ctx.free_clusters().unwrap();

        let first = ctx.allocate_clusters(None, 10, tx).unwrap();
        assert_eq!(first.iter().map(|e| e.length).sum::<u64>(), 10);
        let second = ctx.allocate_clusters(None, 5, tx).unwrap();
        assert_eq!(ctx.free_clusters().unwrap(), free_before - 15);

        ctx.deallocate_clusters(&first, tx).unwrap();
        assert_eq!(ctx.free_clusters().unwrap(), free_before - 5);

        // Freed low clusters are found again after the cursor wrapped past them
        let rest = ctx.free_clusters().unwrap() - 10;
        ctx.allocate_clusters(None, rest, tx).unwrap();
        let again = ctx.allocate_clusters(None, 10, tx).unwrap();
        assert_eq!(again, first);
        assert!(ctx.allocate_clusters(None, 1, tx).unwrap_err().is_disk_full());
        drop(second);
    }

    #[test]
    fn test_desired_lcn_is_honoured() {
        let ctx = scratch_context(256);
        let tx = ctx.allocate_transaction_id().unwrap();
        let first = ctx.allocate_clusters(None, 4, tx).unwrap();
        let next = first[0].lcn.unwrap() + 4;
        // Something else takes clusters further out first
        ctx.allocate_clusters(Some(next + 50), 3, tx).unwrap();
        let grown = ctx.allocate_clusters(Some(next), 6, tx).unwrap();
        assert_eq!(grown, vec![Extent::new(next, 6)]);
    }

    #[test]
    fn test_deallocate_of_free_clusters_is_harmless() {
        let ctx = scratch_context(256);
        let tx = ctx.allocate_transaction_id().unwrap();
        let free = ctx.free_clusters().unwrap();
        let extents = ctx.allocate_clusters(None, 2, tx).unwrap();
        ctx.deallocate_clusters(&extents, tx).unwrap();
        ctx.deallocate_clusters(&extents, tx).unwrap();
        assert_eq!(ctx.free_clusters().unwrap(), free);
    }
}
