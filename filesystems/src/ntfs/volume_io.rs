// Volume I/O
// Sector and cluster access on top of a BlockDevice, stream-relative access through a
// run list, and the shared per-volume context (upcase table, cluster bitmap, log client).

use crate::ntfs::boot_sector::NtfsBootRecord;
use crate::ntfs::data_runs::{DataRunSequence, Extent};
use crate::ntfs::file_record::FileRecord;
use crate::ntfs::logfile::{LogClient, LogFileStats, LogOperation, LogTarget, Lsn, TransactionId};
use crate::ntfs::upcase::UpcaseTable;
use crate::ntfs::volume_bitmap::VolumeBitmap;
use log::trace;
use std::sync::{Arc, Mutex, MutexGuard};
use strata_core::{BlockDevice, StrataError, VolumeConfig};

/// Fixed geometry of a mounted volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub bytes_per_cluster: u32,
    pub bytes_per_file_record_segment: u32,
    pub bytes_per_index_record: u32,
    pub mft_start_lcn: u64,
    pub mft_mirror_start_lcn: u64,
}

impl VolumeGeometry {
    pub fn from_boot_record(boot: &NtfsBootRecord) -> Self {
        Self {
            bytes_per_sector: boot.bytes_per_sector as u32,
            sectors_per_cluster: boot.sectors_per_cluster(),
            bytes_per_cluster: boot.bytes_per_cluster(),
            bytes_per_file_record_segment: boot.bytes_per_file_record_segment(),
            bytes_per_index_record: boot.bytes_per_index_record(),
            mft_start_lcn: boot.mft_start_lcn,
            mft_mirror_start_lcn: boot.mft_mirror_start_lcn,
        }
    }

    /// Resident attributes whose record would grow past this are moved to clusters
    pub fn attribute_record_length_to_make_non_resident(&self) -> usize {
        self.bytes_per_file_record_segment as usize * 5 / 16
    }

    pub fn clusters_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.bytes_per_cluster as u64)
    }
}

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, StrataError> {
    mutex
        .lock()
        .map_err(|_| StrataError::IoError(std::io::Error::other(format!("{} lock poisoned", what))))
}

/// Sector I/O split into transfers of at most `max_transfer_sectors`
pub struct VolumeIo {
    device: Arc<dyn BlockDevice>,
    geometry: VolumeGeometry,
    max_transfer_sectors: u32,
    read_only: bool,
}

impl VolumeIo {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        geometry: VolumeGeometry,
        max_transfer_sectors: u32,
        read_only: bool,
    ) -> Self {
        let read_only = read_only || device.is_read_only();
        Self {
            device,
            geometry,
            max_transfer_sectors: max_transfer_sectors.max(1),
            read_only,
        }
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn check_writable(&self) -> Result<(), StrataError> {
        if self.read_only {
            return Err(StrataError::AccessDenied("volume is mounted read-only".to_string()));
        }
        Ok(())
    }

    pub fn read_sectors(&self, first_lba: u64, count: u64) -> Result<Vec<u8>, StrataError> {
        let mut buffer = Vec::with_capacity((count * self.geometry.bytes_per_sector as u64) as usize);
        let mut lba = first_lba;
        let end = first_lba + count;
        while lba < end {
            let chunk = (end - lba).min(self.max_transfer_sectors as u64) as u32;
            buffer.extend_from_slice(&self.device.read_sectors(lba, chunk)?);
            lba += chunk as u64;
        }
        Ok(buffer)
    }

    pub fn write_sectors(&self, first_lba: u64, data: &[u8]) -> Result<(), StrataError> {
        self.check_writable()?;
        let bytes_per_sector = self.geometry.bytes_per_sector as usize;
        let chunk_bytes = self.max_transfer_sectors as usize * bytes_per_sector;
        for (index, chunk) in data.chunks(chunk_bytes).enumerate() {
            let lba = first_lba + (index * self.max_transfer_sectors as usize) as u64;
            self.device.write_sectors(lba, chunk)?;
        }
        Ok(())
    }

    pub fn read_clusters(&self, lcn: u64, count: u64) -> Result<Vec<u8>, StrataError> {
        let spc = self.geometry.sectors_per_cluster as u64;
        self.read_sectors(lcn * spc, count * spc)
    }

    pub fn write_clusters(&self, lcn: u64, data: &[u8]) -> Result<(), StrataError> {
        self.write_sectors(lcn * self.geometry.sectors_per_cluster as u64, data)
    }

    /// Walk the extents covering stream sectors `[first_sector, first_sector + count)`,
    /// calling `visit(volume LBA or None for a hole, sector count)` for each piece
    fn for_each_mapped<F>(
        &self,
        runs: &DataRunSequence,
        first_sector: u64,
        sector_count: u64,
        mut visit: F,
    ) -> Result<(), StrataError>
    where
        F: FnMut(Option<u64>, u64) -> Result<(), StrataError>,
    {
        if sector_count == 0 {
            return Ok(());
        }
        let spc = self.geometry.sectors_per_cluster as u64;
        let end = first_sector + sector_count;
        let first_vcn = first_sector / spc;
        let last_vcn = (end - 1) / spc;
        let extents: Vec<Extent> = runs.translate_to_lcn(first_vcn, last_vcn - first_vcn + 1)?;
        let mut vcn = first_vcn;
        for extent in extents {
            let extent_start = vcn * spc;
            let extent_end = (vcn + extent.length) * spc;
            let from = first_sector.max(extent_start);
            let to = end.min(extent_end);
            let lba = extent.lcn.map(|lcn| lcn * spc + (from - extent_start));
            visit(lba, to - from)?;
            vcn += extent.length;
        }
        Ok(())
    }

    /// Read stream-relative sectors through a run list; holes read as zero
    pub fn read_mapped(
        &self,
        runs: &DataRunSequence,
        first_sector: u64,
        sector_count: u64,
    ) -> Result<Vec<u8>, StrataError> {
        let bytes_per_sector = self.geometry.bytes_per_sector as usize;
        let mut buffer = Vec::with_capacity(sector_count as usize * bytes_per_sector);
        self.for_each_mapped(runs, first_sector, sector_count, |lba, count| {
            match lba {
                Some(lba) => buffer.extend_from_slice(&self.read_sectors(lba, count)?),
                None => buffer.resize(buffer.len() + count as usize * bytes_per_sector, 0),
            }
            Ok(())
        })?;
        Ok(buffer)
    }

    /// Write stream-relative sectors through a run list
    pub fn write_mapped(&self, runs: &DataRunSequence, first_sector: u64, data: &[u8]) -> Result<(), StrataError> {
        self.check_writable()?;
        let bytes_per_sector = self.geometry.bytes_per_sector as usize;
        if data.len() % bytes_per_sector != 0 {
            return Err(StrataError::InvalidInput(format!(
                "mapped write of {} bytes is not sector aligned",
                data.len()
            )));
        }
        let mut position = 0usize;
        self.for_each_mapped(runs, first_sector, (data.len() / bytes_per_sector) as u64, |lba, count| {
            let length = count as usize * bytes_per_sector;
            match lba {
                Some(lba) => self.write_sectors(lba, &data[position..position + length])?,
                None => {
                    return Err(StrataError::NotSupported(
                        "writing into a sparse run is not supported".to_string(),
                    ))
                }
            }
            position += length;
            Ok(())
        })
    }

    pub fn flush(&self) -> Result<(), StrataError> {
        self.device.flush()
    }
}

/// Persists a modified file record. Attribute accessors call back into this after
/// changing sizes or run lists; the MFT is the production implementation.
pub trait RecordStore {
    fn update_file_record(
        &mut self,
        ctx: &VolumeContext,
        record: &mut FileRecord,
        transaction_id: TransactionId,
    ) -> Result<(), StrataError>;
}

/// State shared by every operation on one mounted volume.
///
/// Lock order: the volume's MFT lock, then `bitmap`, then `log`.
pub struct VolumeContext {
    io: VolumeIo,
    upcase: UpcaseTable,
    config: VolumeConfig,
    bitmap: Mutex<VolumeBitmap>,
    log: Mutex<LogClient>,
}

impl VolumeContext {
    pub fn new(
        io: VolumeIo,
        upcase: UpcaseTable,
        config: VolumeConfig,
        bitmap: VolumeBitmap,
        log: LogClient,
    ) -> Self {
        Self {
            io,
            upcase,
            config,
            bitmap: Mutex::new(bitmap),
            log: Mutex::new(log),
        }
    }

    pub fn io(&self) -> &VolumeIo {
        &self.io
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        self.io.geometry()
    }

    pub fn upcase(&self) -> &UpcaseTable {
        &self.upcase
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Allocate `count` clusters, preferring to start at `desired_lcn`
    pub fn allocate_clusters(
        &self,
        desired_lcn: Option<u64>,
        count: u64,
        transaction_id: TransactionId,
    ) -> Result<Vec<Extent>, StrataError> {
        self.io.check_writable()?;
        let mut bitmap = lock(&self.bitmap, "bitmap")?;
        bitmap.allocate(self, desired_lcn, count, transaction_id)
    }

    pub fn deallocate_clusters(&self, extents: &[Extent], transaction_id: TransactionId) -> Result<(), StrataError> {
        self.io.check_writable()?;
        let mut bitmap = lock(&self.bitmap, "bitmap")?;
        for extent in extents.iter().filter(|e| !e.is_sparse()) {
            if let Some(lcn) = extent.lcn {
                bitmap.deallocate(self, lcn, extent.length, transaction_id)?;
            }
        }
        Ok(())
    }

    pub fn free_clusters(&self) -> Result<u64, StrataError> {
        let mut bitmap = lock(&self.bitmap, "bitmap")?;
        bitmap.free_clusters(self)
    }

    pub fn with_bitmap<T, F>(&self, f: F) -> Result<T, StrataError>
    where
        F: FnOnce(&mut VolumeBitmap) -> Result<T, StrataError>,
    {
        let mut bitmap = lock(&self.bitmap, "bitmap")?;
        f(&mut bitmap)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_log_record(
        &self,
        target: &LogTarget,
        redo_operation: LogOperation,
        redo_data: &[u8],
        undo_operation: LogOperation,
        undo_data: &[u8],
        transaction_id: TransactionId,
    ) -> Result<Lsn, StrataError> {
        self.io.check_writable()?;
        let mut log = lock(&self.log, "log")?;
        log.write_log_record(
            &self.io,
            target,
            redo_operation,
            redo_data,
            undo_operation,
            undo_data,
            transaction_id,
        )
    }

    pub fn allocate_transaction_id(&self) -> Result<TransactionId, StrataError> {
        self.io.check_writable()?;
        let mut log = lock(&self.log, "log")?;
        let id = log.allocate_transaction_id();
        trace!("Allocated transaction {}", id);
        Ok(id)
    }

    pub fn forget_transaction(&self, transaction_id: TransactionId) -> Result<(), StrataError> {
        let mut log = lock(&self.log, "log")?;
        log.write_forget_transaction_record(&self.io, transaction_id)?;
        Ok(())
    }

    pub fn write_restart_record(&self, clean: bool) -> Result<Lsn, StrataError> {
        self.io.check_writable()?;
        let mut log = lock(&self.log, "log")?;
        log.write_restart_record(&self.io, clean)
    }

    pub fn log_stats(&self) -> Result<LogFileStats, StrataError> {
        Ok(lock(&self.log, "log")?.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::MemoryBlockDevice;

    fn geometry() -> VolumeGeometry {
        VolumeGeometry {
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            bytes_per_cluster: 4096,
            bytes_per_file_record_segment: 1024,
            bytes_per_index_record: 4096,
            mft_start_lcn: 4,
            mft_mirror_start_lcn: 2,
        }
    }

    #[test]
    fn test_transfers_are_chunked() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(512, 64));
        let io = VolumeIo::new(device, geometry(), 3, false);
        let data: Vec<u8> = (0..512 * 10).map(|i| (i % 251) as u8).collect();
        io.write_sectors(5, &data).unwrap();
        assert_eq!(io.read_sectors(5, 10).unwrap(), data);
    }

    #[test]
    fn test_mapped_io_follows_runs_and_holes() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(512, 256));
        let io = VolumeIo::new(device, geometry(), 256, false);
        // VCN 0 -> LCN 10, VCN 1 hole, VCN 2 -> LCN 3
        let runs = DataRunSequence::from_extents(&[
            Extent::new(10, 1),
            Extent::sparse(1),
            Extent::new(3, 1),
        ]);
        let first = vec![0x11u8; 4096];
        let third = vec![0x33u8; 4096];
        io.write_mapped(&runs, 0, &first).unwrap();
        io.write_mapped(&runs, 16, &third).unwrap();
        assert!(io.write_mapped(&runs, 8, &first[..512]).is_err());

        let read = io.read_mapped(&runs, 6, 12).unwrap();
        assert_eq!(&read[..1024], &first[..1024]);
        assert!(read[1024..1024 + 4096].iter().all(|b| *b == 0));
        assert_eq!(&read[5120..], &third[..1024]);
        assert_eq!(io.read_clusters(3, 1).unwrap(), third);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(512, 64));
        let io = VolumeIo::new(device, geometry(), 256, true);
        let err = io.write_sectors(0, &[0u8; 512]).unwrap_err();
        assert!(matches!(err, StrataError::AccessDenied(_)));
        assert!(io.read_sectors(0, 1).is_ok());
    }

    #[test]
    fn test_non_resident_threshold() {
        assert_eq!(geometry().attribute_record_length_to_make_non_resident(), 320);
    }
}
