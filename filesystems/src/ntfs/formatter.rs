// NTFS formatter
// Lays down an empty NTFS 3.1 volume: boot sectors, the system file records, their
// data, and a root directory that lists the system files. The root index is filled
// by mounting the fresh volume and inserting through the directory B+tree.

use crate::ntfs::attributes::{
    AttributeRecord, FileNameNamespace, FileNameRecord, NonResidentAttributeRecord, StandardInformation,
    VolumeInformation,
};
use crate::ntfs::boot_sector::{NtfsBootRecord, BOOT_SECTOR_SIZE};
use crate::ntfs::data_runs::{DataRunSequence, Extent};
use crate::ntfs::file_record::{FileRecord, FileRecordSegment};
use crate::ntfs::index::{CollationRule, IndexRoot};
use crate::ntfs::logfile::LogClient;
use crate::ntfs::path::validate_volume_label;
use crate::ntfs::structures::*;
use crate::ntfs::timestamps::NtfsTimestamps;
use crate::ntfs::upcase::UpcaseTable;
use crate::ntfs::volume::NtfsVolume;
use crate::ntfs::volume_io::{VolumeGeometry, VolumeIo};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use std::sync::Arc;
use strata_core::{BlockDevice, FormatOptions, StrataError, VolumeConfig, VolumeFormatter};

const DEFAULT_BYTES_PER_CLUSTER: u32 = 4096;
const BOOT_FILE_SIZE: u64 = 8192;
const MIRRORED_SEGMENTS: u64 = 4;
const MINIMUM_LOG_FILE_SIZE: u64 = 64 * 1024;
const MAXIMUM_LOG_FILE_SIZE: u64 = 64 * 1024 * 1024;
const DEFAULT_MINIMUM_LOG_FILE_SIZE: u64 = 1024 * 1024;
/// Log pages are this large whatever the cluster size
const LOG_PAGE_SIZE: u64 = 4096;
/// Free clusters a new volume must have beyond its system files
const MINIMUM_FREE_CLUSTERS: u64 = 256;
const ZERO_FILL_CHUNK: usize = 1024 * 1024;

const ATTR_DEF_ENTRY_LENGTH: usize = 0xA0;
const ATTR_DEF_INDEXED: u32 = 0x02;
const ATTR_DEF_RESIDENT: u32 = 0x40;
const ATTR_DEF_LOG_NON_RESIDENT: u32 = 0x80;

/// Contiguous cluster range of one system file
#[derive(Debug, Clone, Copy)]
struct Region {
    lcn: u64,
    clusters: u64,
}

impl Region {
    fn runs(&self) -> DataRunSequence {
        DataRunSequence::from_extents(&[Extent::new(self.lcn, self.clusters)])
    }
}

/// Where everything goes on the new volume
#[derive(Debug)]
struct FormatLayout {
    bytes_per_sector: u32,
    bytes_per_cluster: u32,
    bytes_per_segment: u32,
    bytes_per_index_record: u32,
    total_sectors: u64,
    total_clusters: u64,
    mft_records: u64,
    mft_bitmap_size: u64,
    bitmap_size: u64,
    log_file_size: u64,
    boot: Region,
    mft: Region,
    mft_bitmap: Region,
    mirror: Region,
    log_file: Region,
    attr_def: Region,
    bitmap: Region,
    upcase: Region,
    used_clusters: u64,
}

fn check_power_of_two(what: &str, value: u32, minimum: u32, maximum: u32) -> Result<(), StrataError> {
    if !value.is_power_of_two() || value < minimum || value > maximum {
        return Err(StrataError::InvalidInput(format!(
            "{} of {} must be a power of two from {} to {}",
            what, value, minimum, maximum
        )));
    }
    Ok(())
}

impl FormatLayout {
    fn plan(device: &dyn BlockDevice, options: &FormatOptions) -> Result<Self, StrataError> {
        let bytes_per_sector = device.bytes_per_sector();
        check_power_of_two("sector size", bytes_per_sector, 512, 4096)?;
        let bytes_per_cluster = options.bytes_per_cluster.unwrap_or(DEFAULT_BYTES_PER_CLUSTER);
        check_power_of_two("cluster size", bytes_per_cluster, bytes_per_sector, 64 * 1024)?;
        let bytes_per_segment = options.bytes_per_file_record_segment;
        check_power_of_two("file record segment size", bytes_per_segment, bytes_per_sector.max(1024), 4096)?;
        let bytes_per_index_record = options.bytes_per_index_record;
        check_power_of_two("index record size", bytes_per_index_record, 256, 64 * 1024)?;
        if let Some(label) = &options.label {
            validate_volume_label(label)?;
        }

        // The sector after the volume holds the backup boot sector
        let total_sectors = device.total_sectors().saturating_sub(1);
        let sectors_per_cluster = (bytes_per_cluster / bytes_per_sector) as u64;
        let total_clusters = total_sectors / sectors_per_cluster;
        let volume_bytes = total_clusters * bytes_per_cluster as u64;
        let clusters_for = |bytes: u64| bytes.div_ceil(bytes_per_cluster as u64);

        let mft_records = (options.initial_mft_records as u64).max(FIRST_USER_SEGMENT + 8).next_multiple_of(8);
        let mft_bitmap_size = align8(mft_records.div_ceil(8) as usize) as u64;
        let bitmap_size = align8(total_clusters.div_ceil(8) as usize) as u64;
        let log_page = LOG_PAGE_SIZE.max(bytes_per_cluster as u64);
        let log_file_size = options
            .log_file_size
            .unwrap_or_else(|| (volume_bytes / 64).clamp(DEFAULT_MINIMUM_LOG_FILE_SIZE, MAXIMUM_LOG_FILE_SIZE))
            .next_multiple_of(log_page);
        if !(MINIMUM_LOG_FILE_SIZE..=MAXIMUM_LOG_FILE_SIZE).contains(&log_file_size) {
            return Err(StrataError::InvalidInput(format!(
                "log file size of {} bytes is outside {}..={}",
                log_file_size, MINIMUM_LOG_FILE_SIZE, MAXIMUM_LOG_FILE_SIZE
            )));
        }

        let mut next_lcn = 0;
        let mut place = |bytes: u64| {
            let region = Region {
                lcn: next_lcn,
                clusters: clusters_for(bytes).max(1),
            };
            next_lcn += region.clusters;
            region
        };
        let boot = place(BOOT_FILE_SIZE);
        let mft = place(mft_records * bytes_per_segment as u64);
        let mft_bitmap = place(mft_bitmap_size);
        let mirror = place(MIRRORED_SEGMENTS * bytes_per_segment as u64);
        let log_file = place(log_file_size);
        let attr_def = place(attribute_definitions().len() as u64);
        let bitmap = place(bitmap_size);
        let upcase = place(UpcaseTable::BYTE_LENGTH as u64);
        let used_clusters = next_lcn;

        if used_clusters + MINIMUM_FREE_CLUSTERS > total_clusters {
            return Err(StrataError::InvalidInput(format!(
                "device of {} bytes is too small for NTFS: system files need {} clusters of {} bytes",
                device.size(),
                used_clusters + MINIMUM_FREE_CLUSTERS,
                bytes_per_cluster
            )));
        }

        Ok(Self {
            bytes_per_sector,
            bytes_per_cluster,
            bytes_per_segment,
            bytes_per_index_record,
            total_sectors,
            total_clusters,
            mft_records,
            mft_bitmap_size,
            bitmap_size,
            log_file_size,
            boot,
            mft,
            mft_bitmap,
            mirror,
            log_file,
            attr_def,
            bitmap,
            upcase,
            used_clusters,
        })
    }

    fn non_resident(&self, attribute_type: AttributeType, name: &str, region: Region, size: u64) -> AttributeRecord {
        AttributeRecord::NonResident(NonResidentAttributeRecord {
            allocated_length: region.clusters * self.bytes_per_cluster as u64,
            file_size: size,
            valid_data_length: size,
            data_runs: region.runs(),
            ..NonResidentAttributeRecord::new(attribute_type, name)
        })
    }

    fn directory_index_root(&self, indexed_attribute_type: AttributeType, collation_rule: CollationRule) -> Vec<u8> {
        IndexRoot::new(
            indexed_attribute_type,
            collation_rule,
            self.bytes_per_index_record,
            self.bytes_per_cluster,
        )
        .to_bytes()
    }
}

/// `$AttrDef` contents: one 0xA0-byte entry per attribute type, then a zero entry
fn attribute_definitions() -> Vec<u8> {
    let definitions: [(&str, AttributeType, CollationRule, u32, u64, u64); 15] = [
        ("$STANDARD_INFORMATION", AttributeType::STANDARD_INFORMATION, CollationRule::Binary, ATTR_DEF_RESIDENT, 0x30, 0x48),
        ("$ATTRIBUTE_LIST", AttributeType::ATTRIBUTE_LIST, CollationRule::Binary, ATTR_DEF_LOG_NON_RESIDENT, 0, u64::MAX),
        ("$FILE_NAME", AttributeType::FILE_NAME, CollationRule::Binary, ATTR_DEF_INDEXED | ATTR_DEF_RESIDENT, 0x44, 0x242),
        ("$OBJECT_ID", AttributeType::OBJECT_ID, CollationRule::Binary, ATTR_DEF_RESIDENT, 0, 0x100),
        ("$SECURITY_DESCRIPTOR", AttributeType::SECURITY_DESCRIPTOR, CollationRule::Binary, ATTR_DEF_LOG_NON_RESIDENT, 0, u64::MAX),
        ("$VOLUME_NAME", AttributeType::VOLUME_NAME, CollationRule::Binary, ATTR_DEF_RESIDENT, 2, 0x100),
        ("$VOLUME_INFORMATION", AttributeType::VOLUME_INFORMATION, CollationRule::Binary, ATTR_DEF_RESIDENT, 0x0C, 0x0C),
        ("$DATA", AttributeType::DATA, CollationRule::Binary, 0, 0, u64::MAX),
        ("$INDEX_ROOT", AttributeType::INDEX_ROOT, CollationRule::Binary, ATTR_DEF_RESIDENT, 0, u64::MAX),
        ("$INDEX_ALLOCATION", AttributeType::INDEX_ALLOCATION, CollationRule::Binary, ATTR_DEF_LOG_NON_RESIDENT, 0, u64::MAX),
        ("$BITMAP", AttributeType::BITMAP, CollationRule::Binary, ATTR_DEF_LOG_NON_RESIDENT, 0, u64::MAX),
        ("$REPARSE_POINT", AttributeType::REPARSE_POINT, CollationRule::Binary, ATTR_DEF_LOG_NON_RESIDENT, 0, 0x4000),
        ("$EA_INFORMATION", AttributeType::EA_INFORMATION, CollationRule::Binary, ATTR_DEF_RESIDENT, 8, 8),
        ("$EA", AttributeType::EA, CollationRule::Binary, 0, 0, 0x10000),
        ("$LOGGED_UTILITY_STREAM", AttributeType::LOGGED_UTILITY_STREAM, CollationRule::Binary, ATTR_DEF_LOG_NON_RESIDENT, 0, 0x10000),
    ];
    let mut table = vec![0u8; (definitions.len() + 1) * ATTR_DEF_ENTRY_LENGTH];
    for (entry, (name, attribute_type, collation_rule, flags, minimum, maximum)) in
        table.chunks_exact_mut(ATTR_DEF_ENTRY_LENGTH).zip(definitions)
    {
        let name = encode_utf16(name);
        entry[..name.len()].copy_from_slice(&name);
        LittleEndian::write_u32(&mut entry[0x80..0x84], attribute_type.0);
        LittleEndian::write_u32(&mut entry[0x88..0x8C], collation_rule as u32);
        LittleEndian::write_u32(&mut entry[0x8C..0x90], flags);
        LittleEndian::write_u64(&mut entry[0x90..0x98], minimum);
        LittleEndian::write_u64(&mut entry[0x98..0xA0], maximum);
    }
    table
}

/// Bitmap with bits `[0, count)` set, padded to `length` bytes
fn leading_bits(count: u64, length: usize) -> Vec<u8> {
    let mut bits = vec![0u8; length];
    for bit in 0..count {
        bits[(bit / 8) as usize] |= 1 << (bit % 8);
    }
    bits
}

fn pad_to(mut data: Vec<u8>, multiple: usize) -> Vec<u8> {
    data.resize(data.len().next_multiple_of(multiple), 0);
    data
}

/// A system file record named in the root directory. `$MFT` has sequence number 1,
/// every other system file its own segment number.
fn system_record(
    segment_number: u64,
    name: &str,
    is_directory: bool,
    timestamps: NtfsTimestamps,
) -> Result<FileRecord, StrataError> {
    let sequence_number = if segment_number == MFT_SEGMENT { 1 } else { segment_number as u16 };
    let mut base = FileRecordSegment::new(segment_number, sequence_number, MftSegmentReference::NULL);
    if is_directory {
        base.flags |= FILE_RECORD_IS_DIRECTORY;
    }
    let mut record = FileRecord::new(base);

    let file_attributes = FILE_ATTRIBUTE_HIDDEN | FILE_ATTRIBUTE_SYSTEM;
    let mut info = StandardInformation::new(file_attributes);
    info.timestamps = timestamps;
    record.set_standard_information(&info)?;

    let root = MftSegmentReference::new(ROOT_DIRECTORY_SEGMENT, ROOT_DIRECTORY_SEGMENT as u16);
    let mut file_name = FileNameRecord::new(root, name, is_directory, timestamps);
    file_name.file_attributes |= file_attributes;
    file_name.namespace = FileNameNamespace::Win32AndDos;
    record.add_attribute(file_name.to_attribute());
    Ok(record)
}

/// NTFS 3.1 formatter
#[derive(Debug, Default, Clone, Copy)]
pub struct NtfsFormatter;

impl NtfsFormatter {
    fn build_system_records(layout: &FormatLayout, label: &str) -> Result<Vec<FileRecord>, StrataError> {
        let now = NtfsTimestamps::now();
        let mut records = Vec::new();

        let mut mft = system_record(MFT_SEGMENT, "$MFT", false, now)?;
        mft.add_attribute(layout.non_resident(
            AttributeType::DATA,
            "",
            layout.mft,
            layout.mft_records * layout.bytes_per_segment as u64,
        ));
        mft.add_attribute(layout.non_resident(AttributeType::BITMAP, "", layout.mft_bitmap, layout.mft_bitmap_size));
        records.push(mft);

        let mut mirror = system_record(MFT_MIRROR_SEGMENT, "$MFTMirr", false, now)?;
        mirror.add_attribute(layout.non_resident(
            AttributeType::DATA,
            "",
            layout.mirror,
            MIRRORED_SEGMENTS * layout.bytes_per_segment as u64,
        ));
        records.push(mirror);

        let mut log_file = system_record(LOG_FILE_SEGMENT, "$LogFile", false, now)?;
        log_file.add_attribute(layout.non_resident(AttributeType::DATA, "", layout.log_file, layout.log_file_size));
        records.push(log_file);

        let mut volume = system_record(VOLUME_SEGMENT, "$Volume", false, now)?;
        if !label.is_empty() {
            volume.add_attribute(AttributeRecord::new_resident(AttributeType::VOLUME_NAME, "", encode_utf16(label)));
        }
        volume.add_attribute(AttributeRecord::new_resident(
            AttributeType::VOLUME_INFORMATION,
            "",
            VolumeInformation::new(3, 1).to_bytes(),
        ));
        volume.add_attribute(AttributeRecord::new_resident(AttributeType::DATA, "", Vec::new()));
        records.push(volume);

        let mut attr_def = system_record(ATTR_DEF_SEGMENT, "$AttrDef", false, now)?;
        attr_def.add_attribute(layout.non_resident(
            AttributeType::DATA,
            "",
            layout.attr_def,
            attribute_definitions().len() as u64,
        ));
        records.push(attr_def);

        let mut root = system_record(ROOT_DIRECTORY_SEGMENT, ".", true, now)?;
        root.add_attribute(AttributeRecord::new_resident(
            AttributeType::INDEX_ROOT,
            FILE_NAME_INDEX_NAME,
            layout.directory_index_root(AttributeType::FILE_NAME, CollationRule::FileName),
        ));
        records.push(root);

        let mut bitmap = system_record(BITMAP_SEGMENT, "$Bitmap", false, now)?;
        bitmap.add_attribute(layout.non_resident(AttributeType::DATA, "", layout.bitmap, layout.bitmap_size));
        records.push(bitmap);

        let mut boot = system_record(BOOT_SEGMENT, "$Boot", false, now)?;
        boot.add_attribute(layout.non_resident(AttributeType::DATA, "", layout.boot, BOOT_FILE_SIZE));
        records.push(boot);

        // $Bad spans the whole volume as one hole; bad clusters would be mapped into it
        let mut bad_clusters = system_record(BAD_CLUSTER_SEGMENT, "$BadClus", false, now)?;
        bad_clusters.add_attribute(AttributeRecord::new_resident(AttributeType::DATA, "", Vec::new()));
        let volume_bytes = layout.total_clusters * layout.bytes_per_cluster as u64;
        bad_clusters.add_attribute(AttributeRecord::NonResident(NonResidentAttributeRecord {
            allocated_length: volume_bytes,
            file_size: volume_bytes,
            valid_data_length: volume_bytes,
            data_runs: DataRunSequence::from_extents(&[Extent::sparse(layout.total_clusters)]),
            ..NonResidentAttributeRecord::new(AttributeType::DATA, "$Bad")
        }));
        records.push(bad_clusters);

        let mut secure = system_record(SECURE_SEGMENT, "$Secure", false, now)?;
        secure.base_segment_mut().flags |= FILE_RECORD_IS_VIEW_INDEX;
        secure.add_attribute(AttributeRecord::new_resident(AttributeType::DATA, "$SDS", Vec::new()));
        secure.add_attribute(AttributeRecord::new_resident(
            AttributeType::INDEX_ROOT,
            "$SDH",
            layout.directory_index_root(AttributeType(0), CollationRule::SecurityHash),
        ));
        secure.add_attribute(AttributeRecord::new_resident(
            AttributeType::INDEX_ROOT,
            "$SII",
            layout.directory_index_root(AttributeType(0), CollationRule::Ulong),
        ));
        records.push(secure);

        let mut upcase = system_record(UPCASE_SEGMENT, "$UpCase", false, now)?;
        upcase.add_attribute(layout.non_resident(
            AttributeType::DATA,
            "",
            layout.upcase,
            UpcaseTable::BYTE_LENGTH as u64,
        ));
        records.push(upcase);

        let mut extend = system_record(EXTEND_SEGMENT, "$Extend", true, now)?;
        extend.add_attribute(AttributeRecord::new_resident(
            AttributeType::INDEX_ROOT,
            FILE_NAME_INDEX_NAME,
            layout.directory_index_root(AttributeType::FILE_NAME, CollationRule::FileName),
        ));
        records.push(extend);

        Ok(records)
    }

    /// Serialized MFT: system records, reserved segments, then unused segments
    fn build_mft(layout: &FormatLayout, label: &str) -> Result<Vec<u8>, StrataError> {
        let segment_size = layout.bytes_per_segment as usize;
        let mut mft = Vec::with_capacity(layout.mft_records as usize * segment_size);
        for mut record in Self::build_system_records(layout, label)? {
            record.layout_segments(segment_size, None)?;
            mft.extend_from_slice(&record.base_segment().to_bytes(segment_size)?);
        }
        for segment_number in (EXTEND_SEGMENT + 1)..layout.mft_records {
            let mut segment = FileRecordSegment::unused(segment_number);
            if segment_number < FIRST_USER_SEGMENT {
                segment.sequence_number = segment_number as u16;
            }
            mft.extend_from_slice(&segment.to_bytes(segment_size)?);
        }
        Ok(mft)
    }

    fn write_zeros(io: &VolumeIo, region: Region, bytes_per_cluster: u32) -> Result<(), StrataError> {
        let chunk_clusters = (ZERO_FILL_CHUNK / bytes_per_cluster as usize).max(1) as u64;
        let zeros = vec![0u8; chunk_clusters as usize * bytes_per_cluster as usize];
        let mut cluster = 0;
        while cluster < region.clusters {
            let count = chunk_clusters.min(region.clusters - cluster);
            io.write_clusters(region.lcn + cluster, &zeros[..count as usize * bytes_per_cluster as usize])?;
            cluster += count;
        }
        Ok(())
    }
}

impl VolumeFormatter for NtfsFormatter {
    fn name(&self) -> &'static str {
        "NTFS"
    }

    fn validate_options(&self, device: &dyn BlockDevice, options: &FormatOptions) -> Result<(), StrataError> {
        FormatLayout::plan(device, options).map(|_| ())
    }

    fn format(&self, device: Arc<dyn BlockDevice>, options: &FormatOptions) -> Result<(), StrataError> {
        if device.is_read_only() {
            return Err(StrataError::AccessDenied("cannot format a read-only device".to_string()));
        }
        let layout = FormatLayout::plan(device.as_ref(), options)?;
        let label = options.label.clone().unwrap_or_default();
        let serial_number = options.serial_number.unwrap_or_else(rand::random);
        info!(
            "Formatting NTFS: {} clusters of {} bytes, {} MFT records, {}-byte log",
            layout.total_clusters, layout.bytes_per_cluster, layout.mft_records, layout.log_file_size
        );
        debug!("Format layout: {:?}", layout);

        let boot = NtfsBootRecord::new(
            layout.bytes_per_sector as u16,
            layout.bytes_per_cluster,
            layout.total_sectors,
            layout.mft.lcn,
            layout.mirror.lcn,
            layout.bytes_per_segment,
            layout.bytes_per_index_record,
            serial_number,
        );
        boot.validate()?;
        let io = VolumeIo::new(device.clone(), VolumeGeometry::from_boot_record(&boot), 256, false);
        let cluster = layout.bytes_per_cluster as usize;

        // Step 1: MFT and its mirror
        let mft = Self::build_mft(&layout, &label)?;
        let mirror_length = MIRRORED_SEGMENTS as usize * layout.bytes_per_segment as usize;
        io.write_clusters(layout.mft.lcn, &pad_to(mft.clone(), cluster))?;
        io.write_clusters(layout.mirror.lcn, &pad_to(mft[..mirror_length].to_vec(), cluster))?;
        let mft_bitmap = leading_bits(FIRST_USER_SEGMENT, layout.mft_bitmap.clusters as usize * cluster);
        io.write_clusters(layout.mft_bitmap.lcn, &mft_bitmap)?;

        // Step 2: $LogFile with a fresh restart area
        Self::write_zeros(&io, layout.log_file, layout.bytes_per_cluster)?;
        let log_file_runs = layout.log_file.runs();
        io.write_mapped(&log_file_runs, 0, &LogClient::initial_restart_pages(layout.log_file_size)?)?;

        // Step 3: the other system file contents
        io.write_clusters(layout.attr_def.lcn, &pad_to(attribute_definitions(), cluster))?;
        let bitmap = leading_bits(layout.used_clusters, layout.bitmap.clusters as usize * cluster);
        io.write_clusters(layout.bitmap.lcn, &bitmap)?;
        io.write_clusters(layout.upcase.lcn, &pad_to(UpcaseTable::generate().to_bytes(), cluster))?;

        // Step 4: boot sectors, primary and backup
        let mut sector = vec![0u8; layout.bytes_per_sector as usize];
        sector[..BOOT_SECTOR_SIZE].copy_from_slice(&boot.to_bytes());
        let boot_file = vec![0u8; layout.boot.clusters as usize * cluster];
        io.write_clusters(layout.boot.lcn, &boot_file)?;
        io.write_sectors(0, &sector)?;
        io.write_sectors(layout.total_sectors, &sector)?;
        io.flush()?;

        // Step 5: list the system files in the root directory
        let volume = NtfsVolume::open(device, VolumeConfig::default())?;
        volume.index_system_files()?;
        volume.close()?;

        info!("NTFS format complete, serial number {:016X}", serial_number);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use strata_core::MemoryBlockDevice;

    #[test]
    fn test_format_small_volume() {
        let (device, volume) = small_volume();
        assert_eq!(volume.version(), (3, 1));
        let boot = NtfsBootRecord::parse(&device.read_sectors(0, 1).unwrap()).unwrap();
        let backup = NtfsBootRecord::parse(&device.read_sectors(device.total_sectors() - 1, 1).unwrap()).unwrap();
        assert_eq!(boot, backup);
        assert_eq!(boot.total_sectors, device.total_sectors() - 1);

        let mft = volume.get_file_record("\\$MFT").unwrap();
        assert_eq!(mft.reference(), MftSegmentReference::new(MFT_SEGMENT, 1));
        let upcase = volume.get_file_record("\\$UpCase").unwrap();
        assert_eq!(upcase.reference(), MftSegmentReference::new(UPCASE_SEGMENT, UPCASE_SEGMENT as u16));
        assert!(volume.free_space().unwrap() > 50 * 1024 * 1024);
    }

    #[test]
    fn test_label_and_serial_are_applied() {
        let options = FormatOptions {
            label: Some("DATA".to_string()),
            serial_number: Some(0x1234_5678_9ABC_DEF0),
            ..FormatOptions::default()
        };
        let (device, volume) = formatted_volume(32 * 1024 * 1024, &options);
        assert_eq!(volume.volume_label().unwrap(), "DATA");
        let boot = NtfsBootRecord::parse(&device.read_sectors(0, 1).unwrap()).unwrap();
        assert_eq!(boot.volume_serial_number, 0x1234_5678_9ABC_DEF0);
    }

    #[test]
    fn test_too_small_device_is_rejected() {
        let device = MemoryBlockDevice::with_size(512, 512 * 1024);
        let result = NtfsFormatter.validate_options(&device, &FormatOptions::default());
        assert!(matches!(result, Err(StrataError::InvalidInput(_))));
    }

    #[test]
    fn test_bad_geometry_is_rejected() {
        let device = MemoryBlockDevice::with_size(512, 64 * 1024 * 1024);
        let options = FormatOptions {
            bytes_per_cluster: Some(3000),
            ..FormatOptions::default()
        };
        assert!(NtfsFormatter.validate_options(&device, &options).is_err());
        let options = FormatOptions {
            bytes_per_index_record: 128,
            ..FormatOptions::default()
        };
        assert!(NtfsFormatter.validate_options(&device, &options).is_err());
    }

    #[test]
    fn test_attribute_definitions_are_terminated() {
        let table = attribute_definitions();
        assert_eq!(table.len() % ATTR_DEF_ENTRY_LENGTH, 0);
        let last = &table[table.len() - ATTR_DEF_ENTRY_LENGTH..];
        assert!(last.iter().all(|b| *b == 0));
        assert_eq!(LittleEndian::read_u32(&table[0x80..0x84]), 0x10);
    }
}
