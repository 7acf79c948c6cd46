// Test helpers for NTFS engine tests

use crate::ntfs::attributes::{AttributeRecord, StandardInformation};
use crate::ntfs::data_runs::{DataRunSequence, Extent};
use crate::ntfs::file_record::{FileRecord, FileRecordSegment};
use crate::ntfs::logfile::{LogClient, TransactionId};
use crate::ntfs::structures::{AttributeType, MftSegmentReference, FILE_ATTRIBUTE_ARCHIVE};
use crate::ntfs::upcase::UpcaseTable;
use crate::ntfs::volume_bitmap::VolumeBitmap;
use crate::ntfs::volume_io::{RecordStore, VolumeContext, VolumeGeometry, VolumeIo};
use crate::ntfs::{NtfsFormatter, NtfsVolume};
use std::sync::Arc;
use strata_core::{BlockDevice, FormatOptions, MemoryBlockDevice, StrataError, VolumeConfig, VolumeFormatter};

const SCRATCH_LOG_SIZE: u64 = 64 * 1024;
/// Clusters 0..18 hold the scratch bitmap and log
const SCRATCH_RESERVED_CLUSTERS: u64 = 18;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A bare context over a blank device: a one-cluster `$Bitmap` at LCN 1 and a
/// 64 KiB `$LogFile` at LCN 2, 4096-byte clusters on 512-byte sectors
pub fn scratch_context(total_clusters: u64) -> VolumeContext {
    init_logging();
    let device: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(512, total_clusters * 8));
    let geometry = VolumeGeometry {
        bytes_per_sector: 512,
        sectors_per_cluster: 8,
        bytes_per_cluster: 4096,
        bytes_per_file_record_segment: 1024,
        bytes_per_index_record: 4096,
        mft_start_lcn: 4,
        mft_mirror_start_lcn: 2,
    };
    let io = VolumeIo::new(device, geometry, 256, false);

    let mut bits = vec![0u8; 4096];
    for cluster in 0..SCRATCH_RESERVED_CLUSTERS {
        bits[(cluster / 8) as usize] |= 1 << (cluster % 8);
    }
    io.write_clusters(1, &bits).unwrap();
    let bitmap_runs = DataRunSequence::from_extents(&[Extent::new(1, 1)]);

    let log_runs = DataRunSequence::from_extents(&[Extent::new(2, SCRATCH_LOG_SIZE / 4096)]);
    io.write_mapped(&log_runs, 0, &LogClient::initial_restart_pages(SCRATCH_LOG_SIZE).unwrap())
        .unwrap();
    let log = LogClient::open(&io, log_runs, SCRATCH_LOG_SIZE).unwrap();

    VolumeContext::new(
        io,
        UpcaseTable::generate(),
        VolumeConfig::default(),
        VolumeBitmap::new(MftSegmentReference::new(6, 6), bitmap_runs, total_clusters),
        log,
    )
}

/// An in-memory file record with `$STANDARD_INFORMATION` and an empty unnamed `$DATA`
pub fn scratch_record() -> FileRecord {
    let mut record = FileRecord::new(FileRecordSegment::new(30, 1, MftSegmentReference::NULL));
    record.add_attribute(AttributeRecord::new_resident(
        AttributeType::STANDARD_INFORMATION,
        "",
        StandardInformation::new(FILE_ATTRIBUTE_ARCHIVE).to_bytes(),
    ));
    record.add_attribute(AttributeRecord::new_resident(AttributeType::DATA, "", Vec::new()));
    record
}

/// Record store that keeps updates in memory
#[derive(Debug, Default)]
pub struct NullRecordStore {
    pub updates: usize,
}

impl RecordStore for NullRecordStore {
    fn update_file_record(
        &mut self,
        _ctx: &VolumeContext,
        _record: &mut FileRecord,
        _transaction_id: TransactionId,
    ) -> Result<(), StrataError> {
        self.updates += 1;
        Ok(())
    }
}

/// Format a RAM device and mount it
pub fn formatted_volume(size: u64, options: &FormatOptions) -> (Arc<MemoryBlockDevice>, NtfsVolume) {
    init_logging();
    let device = Arc::new(MemoryBlockDevice::with_size(512, size));
    NtfsFormatter.format(device.clone(), options).unwrap();
    let volume = NtfsVolume::open(device.clone(), VolumeConfig::default()).unwrap();
    (device, volume)
}

pub fn small_volume() -> (Arc<MemoryBlockDevice>, NtfsVolume) {
    formatted_volume(64 * 1024 * 1024, &FormatOptions::default())
}
