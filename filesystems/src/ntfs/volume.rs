// Mounted NTFS volume
// Ties the MFT, the cluster bitmap, the log and directory indexes together behind
// path and reference based file operations. Every mutation runs as one logged
// transaction under the MFT lock.

use crate::ntfs::attribute_data::{read_stream_bytes, AttributeData};
use crate::ntfs::attributes::{
    AttributeRecord, FileNameNamespace, FileNameRecord, NonResidentAttributeRecord, VolumeInformation,
};
use crate::ntfs::boot_sector::{NtfsBootRecord, BOOT_SECTOR_SIZE};
use crate::ntfs::data_runs::Extent;
use crate::ntfs::file_record::FileRecord;
use crate::ntfs::index::IndexData;
use crate::ntfs::logfile::{LogClient, LogFileStats, TransactionId};
use crate::ntfs::mft::{extend_granularity, MasterFileTable};
use crate::ntfs::path::{split_parent, split_path, validate_file_name, validate_volume_label};
use crate::ntfs::structures::*;
use crate::ntfs::timestamps::NtfsTimestamps;
use crate::ntfs::upcase::UpcaseTable;
use crate::ntfs::volume_bitmap::VolumeBitmap;
use crate::ntfs::volume_io::{lock, RecordStore, VolumeContext, VolumeGeometry, VolumeIo};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use strata_core::{BlockDevice, StrataError, VolumeConfig};

/// Ancestor walks give up past this depth
const MAXIMUM_DIRECTORY_DEPTH: usize = 4096;

/// Spare clusters for attribute lists and bitmap growth when sizing a create
const CREATE_SPARE_CLUSTERS: u64 = 2;

fn system_data<'r>(record: &'r FileRecord, what: &str) -> Result<&'r NonResidentAttributeRecord, StrataError> {
    match record.get_attribute(AttributeType::DATA, "") {
        Some(AttributeRecord::NonResident(r)) => Ok(r),
        _ => Err(StrataError::InvalidData(format!("{} has no non-resident $DATA", what))),
    }
}

fn read_system_stream(io: &VolumeIo, record: &FileRecord, what: &str) -> Result<Vec<u8>, StrataError> {
    let attribute = record
        .get_attribute(AttributeType::DATA, "")
        .ok_or_else(|| StrataError::InvalidData(format!("{} has no $DATA", what)))?;
    read_stream_bytes(io, attribute, 0, attribute.data_length() as usize)
}

/// Key used to look a name up in a directory index. Only the name takes part in collation.
fn lookup_key(name: &str) -> Vec<u8> {
    FileNameRecord::new(MftSegmentReference::NULL, name, false, NtfsTimestamps::default()).to_bytes()
}

fn require_directory(record: &FileRecord) -> Result<(), StrataError> {
    if !record.is_directory() {
        return Err(StrataError::InvalidInput(format!(
            "file record {} is not a directory",
            record.segment_number()
        )));
    }
    Ok(())
}

fn require_file(record: &FileRecord) -> Result<(), StrataError> {
    if record.is_directory() {
        return Err(StrataError::InvalidInput(format!(
            "file record {} is a directory",
            record.segment_number()
        )));
    }
    Ok(())
}

pub struct NtfsVolume {
    device: Arc<dyn BlockDevice>,
    ctx: VolumeContext,
    mft: Mutex<MasterFileTable>,
    /// Taken only while the MFT lock is held
    boot_record: Mutex<NtfsBootRecord>,
    version: VolumeInformation,
}

impl std::fmt::Debug for NtfsVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtfsVolume")
            .field("geometry", self.ctx.geometry())
            .field("version", &self.version)
            .field("read_only", &self.ctx.io().is_read_only())
            .finish_non_exhaustive()
    }
}

impl NtfsVolume {
    /// Mount the NTFS volume on `device`
    pub fn open(device: Arc<dyn BlockDevice>, config: VolumeConfig) -> Result<Self, StrataError> {
        config.validate()?;
        let boot_sector = device.read_sectors(0, 1)?;
        let boot = NtfsBootRecord::parse(&boot_sector)?;
        boot.validate()?;
        if boot.bytes_per_sector as u32 != device.bytes_per_sector() {
            return Err(StrataError::InvalidData(format!(
                "boot sector describes {}-byte sectors, device has {}-byte sectors",
                boot.bytes_per_sector,
                device.bytes_per_sector()
            )));
        }
        if boot.total_sectors > device.total_sectors() {
            return Err(StrataError::InvalidData(format!(
                "boot sector describes {} sectors, device has {}",
                boot.total_sectors,
                device.total_sectors()
            )));
        }

        let geometry = VolumeGeometry::from_boot_record(&boot);
        let io = VolumeIo::new(device.clone(), geometry, config.max_transfer_sectors, config.read_only);
        let mft = MasterFileTable::open(&io)?;

        let volume_record = mft.get_file_record_by_number(&io, VOLUME_SEGMENT)?;
        let version = match volume_record.get_attribute(AttributeType::VOLUME_INFORMATION, "") {
            Some(AttributeRecord::Resident(r)) => VolumeInformation::parse(&r.data)?,
            _ => {
                return Err(StrataError::InvalidData(
                    "$Volume has no resident $VOLUME_INFORMATION".to_string(),
                ))
            }
        };
        if !version.is_supported() {
            return Err(StrataError::NotSupported(format!(
                "NTFS version {}.{}",
                version.major_version, version.minor_version
            )));
        }

        let upcase_record = mft.get_file_record_by_number(&io, UPCASE_SEGMENT)?;
        let upcase = UpcaseTable::from_bytes(&read_system_stream(&io, &upcase_record, "$UpCase")?)?;

        let bitmap_record = mft.get_file_record_by_number(&io, BITMAP_SEGMENT)?;
        let bitmap_runs = system_data(&bitmap_record, "$Bitmap")?.data_runs.clone();
        let bitmap = VolumeBitmap::new(bitmap_record.reference(), bitmap_runs, boot.total_clusters());

        let log_record = mft.get_file_record_by_number(&io, LOG_FILE_SEGMENT)?;
        let log_data = system_data(&log_record, "$LogFile")?;
        let log = LogClient::open(&io, log_data.data_runs.clone(), log_data.file_size)?;

        info!(
            "Mounted NTFS {}.{} volume: {} clusters of {} bytes, {} MFT segments{}",
            version.major_version,
            version.minor_version,
            boot.total_clusters(),
            geometry.bytes_per_cluster,
            mft.segment_count(),
            if config.read_only { " (read-only)" } else { "" }
        );
        let ctx = VolumeContext::new(io, upcase, config, bitmap, log);
        Ok(Self {
            device,
            ctx,
            mft: Mutex::new(mft),
            boot_record: Mutex::new(boot),
            version,
        })
    }

    pub fn version(&self) -> (u8, u8) {
        (self.version.major_version, self.version.minor_version)
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        self.ctx.geometry()
    }

    pub fn is_read_only(&self) -> bool {
        self.ctx.io().is_read_only()
    }

    pub fn root_directory_reference(&self) -> Result<MftSegmentReference, StrataError> {
        let mft = self.lock_mft()?;
        Ok(mft.get_file_record_by_number(self.ctx.io(), ROOT_DIRECTORY_SEGMENT)?.reference())
    }

    fn lock_mft(&self) -> Result<MutexGuard<'_, MasterFileTable>, StrataError> {
        lock(&self.mft, "MFT")
    }

    pub(crate) fn with_mft<T, F>(&self, f: F) -> Result<T, StrataError>
    where
        F: FnOnce(&VolumeContext, &mut MasterFileTable) -> Result<T, StrataError>,
    {
        let mut mft = self.lock_mft()?;
        f(&self.ctx, &mut mft)
    }

    /// Run `f` as one transaction under the MFT lock. The transaction is forgotten and a
    /// restart record written only when `f` succeeds; a failed transaction stays open in
    /// the log so its records keep their undo meaning.
    fn transact<T, F>(&self, f: F) -> Result<T, StrataError>
    where
        F: FnOnce(&VolumeContext, &mut MasterFileTable, TransactionId) -> Result<T, StrataError>,
    {
        self.ctx.io().check_writable()?;
        let mut mft = self.lock_mft()?;
        let transaction_id = self.ctx.allocate_transaction_id()?;
        match f(&self.ctx, &mut mft, transaction_id) {
            Ok(value) => {
                self.ctx.forget_transaction(transaction_id)?;
                self.ctx.write_restart_record(true)?;
                Ok(value)
            }
            Err(e) => {
                warn!("Transaction {} failed and is left open: {}", transaction_id, e);
                Err(e)
            }
        }
    }

    /// Fail with `DiskFull` unless the worst case of a create (an MFT extension and an
    /// index extension) fits in the free clusters
    fn check_create_headroom(&self) -> Result<(), StrataError> {
        let geometry = *self.ctx.geometry();
        let mft_records = extend_granularity(&self.ctx)?;
        let index_records = self.ctx.config().index_extend_granularity as u64;
        let needed = geometry.clusters_for(mft_records * geometry.bytes_per_file_record_segment as u64)
            + geometry.clusters_for(index_records * geometry.bytes_per_index_record as u64)
            + CREATE_SPARE_CLUSTERS;
        let free = self.ctx.free_clusters()?;
        if free < needed {
            return Err(StrataError::DiskFull(format!(
                "{} free clusters, a create may need {}",
                free, needed
            )));
        }
        Ok(())
    }

    fn find_in_directory(
        ctx: &VolumeContext,
        directory: &mut FileRecord,
        name: &str,
    ) -> Result<Option<MftSegmentReference>, StrataError> {
        require_directory(directory)?;
        let index = IndexData::new(ctx, directory, FILE_NAME_INDEX_NAME)?;
        Ok(index.find_entry(&lookup_key(name))?.map(|entry| entry.file_reference))
    }

    fn resolve(ctx: &VolumeContext, mft: &MasterFileTable, components: &[&str]) -> Result<FileRecord, StrataError> {
        let mut record = mft.get_file_record_by_number(ctx.io(), ROOT_DIRECTORY_SEGMENT)?;
        for (depth, component) in components.iter().enumerate() {
            if !record.is_directory() {
                return Err(StrataError::NotFound(format!(
                    "'{}' is not a directory",
                    components[..depth].join("\\")
                )));
            }
            let reference = Self::find_in_directory(ctx, &mut record, component)?.ok_or_else(|| {
                StrataError::NotFound(format!("'{}' not found", components[..=depth].join("\\")))
            })?;
            record = mft.get_file_record(ctx.io(), reference)?;
        }
        Ok(record)
    }

    /// Look up the file record a path names
    pub fn get_file_record(&self, path: &str) -> Result<FileRecord, StrataError> {
        let components = split_path(path)?;
        let mft = self.lock_mft()?;
        Self::resolve(&self.ctx, &mft, &components)
    }

    pub fn get_file_record_by_reference(&self, reference: MftSegmentReference) -> Result<FileRecord, StrataError> {
        let mft = self.lock_mft()?;
        mft.get_file_record(self.ctx.io(), reference)
    }

    /// Create a file or directory named `name` in directory `parent`
    pub fn create_file(
        &self,
        parent: MftSegmentReference,
        name: &str,
        is_directory: bool,
    ) -> Result<FileRecord, StrataError> {
        validate_file_name(name)?;
        self.ctx.io().check_writable()?;
        self.check_create_headroom()?;
        self.transact(|ctx, mft, transaction_id| {
            let mut directory = mft.get_file_record(ctx.io(), parent)?;
            if Self::find_in_directory(ctx, &mut directory, name)?.is_some() {
                return Err(StrataError::AlreadyExists(format!(
                    "'{}' already exists in directory {}",
                    name, parent
                )));
            }
            let file_name = FileNameRecord::new(directory.reference(), name, is_directory, NtfsTimestamps::now());
            let record = mft.create_file(ctx, std::slice::from_ref(&file_name), is_directory, transaction_id)?;
            let mut index = IndexData::new(ctx, &mut directory, FILE_NAME_INDEX_NAME)?;
            index.add_entry(&mut *mft, record.reference(), file_name.to_bytes(), transaction_id)?;
            debug!("Created '{}' as {} in directory {}", name, record.reference(), parent);
            Ok(record)
        })
    }

    /// Create the file or directory a path names. Its parent must exist.
    pub fn create_file_at_path(&self, path: &str, is_directory: bool) -> Result<FileRecord, StrataError> {
        let (parent_components, name) = split_parent(path)?;
        let parent = {
            let mft = self.lock_mft()?;
            Self::resolve(&self.ctx, &mft, &parent_components)?.reference()
        };
        self.create_file(parent, name, is_directory)
    }

    /// Fail when `directory` is `file` or lies below it
    fn check_not_within(
        ctx: &VolumeContext,
        mft: &MasterFileTable,
        file: MftSegmentReference,
        directory: &FileRecord,
    ) -> Result<(), StrataError> {
        let mut current = directory.reference();
        for _ in 0..MAXIMUM_DIRECTORY_DEPTH {
            if current.segment_number == file.segment_number {
                return Err(StrataError::InvalidInput(format!(
                    "cannot move directory {} into its own subtree",
                    file
                )));
            }
            if current.segment_number == ROOT_DIRECTORY_SEGMENT {
                return Ok(());
            }
            let record = mft.get_file_record(ctx.io(), current)?;
            current = record
                .long_file_name()?
                .ok_or_else(|| StrataError::InvalidData(format!("directory {} has no name", current)))?
                .parent_directory;
        }
        Err(StrataError::InvalidData(format!(
            "directory {} is deeper than {} levels",
            directory.reference(),
            MAXIMUM_DIRECTORY_DEPTH
        )))
    }

    /// Move `file` into `new_parent` as `new_name`. The new `$FILE_NAME` keeps the
    /// timestamps, sizes and attributes of the one it replaces.
    pub fn move_file(
        &self,
        file: MftSegmentReference,
        new_parent: MftSegmentReference,
        new_name: &str,
    ) -> Result<(), StrataError> {
        validate_file_name(new_name)?;
        self.transact(|ctx, mft, transaction_id| {
            let mut record = mft.get_file_record(ctx.io(), file)?;
            if record.segment_number() < FIRST_USER_SEGMENT {
                return Err(StrataError::InvalidInput(format!("system file {} cannot be moved", file)));
            }
            let old_names = record.file_name_records()?;
            let carried = old_names
                .iter()
                .find(|n| n.namespace != FileNameNamespace::Dos)
                .or_else(|| old_names.first())
                .cloned()
                .ok_or_else(|| StrataError::InvalidData(format!("file record {} has no $FILE_NAME", file)))?;

            let mut destination = mft.get_file_record(ctx.io(), new_parent)?;
            if record.is_directory() {
                Self::check_not_within(ctx, mft, record.reference(), &destination)?;
            }
            if let Some(existing) = Self::find_in_directory(ctx, &mut destination, new_name)? {
                if existing.segment_number != record.segment_number() {
                    return Err(StrataError::AlreadyExists(format!(
                        "'{}' already exists in directory {}",
                        new_name, new_parent
                    )));
                }
            }

            for old_name in &old_names {
                let mut old_parent = mft.get_file_record(ctx.io(), old_name.parent_directory)?;
                let mut index = IndexData::new(ctx, &mut old_parent, FILE_NAME_INDEX_NAME)?;
                index.remove_entry(&mut *mft, &old_name.to_bytes(), transaction_id)?;
            }

            let moved = FileNameRecord {
                parent_directory: destination.reference(),
                namespace: FileNameNamespace::Win32,
                name: new_name.to_string(),
                ..carried
            };
            while record.remove_attribute(AttributeType::FILE_NAME, "").is_some() {}
            record.add_attribute(moved.to_attribute());
            mft.update_file_record(ctx, &mut record, transaction_id)?;

            // The destination may be one of the directories just edited
            let mut destination = mft.get_file_record(ctx.io(), new_parent)?;
            let mut index = IndexData::new(ctx, &mut destination, FILE_NAME_INDEX_NAME)?;
            index.add_entry(&mut *mft, record.reference(), moved.to_bytes(), transaction_id)?;
            debug!("Moved {} to '{}' in directory {}", file, new_name, new_parent);
            Ok(())
        })
    }

    /// Delete the file or empty directory `name` in directory `parent`
    pub fn delete_file(&self, parent: MftSegmentReference, name: &str) -> Result<(), StrataError> {
        validate_file_name(name)?;
        self.transact(|ctx, mft, transaction_id| {
            let mut directory = mft.get_file_record(ctx.io(), parent)?;
            let reference = Self::find_in_directory(ctx, &mut directory, name)?
                .ok_or_else(|| StrataError::NotFound(format!("'{}' not found in directory {}", name, parent)))?;
            let mut record = mft.get_file_record(ctx.io(), reference)?;
            if record.segment_number() < FIRST_USER_SEGMENT {
                return Err(StrataError::InvalidInput(format!("system file '{}' cannot be deleted", name)));
            }
            if record.is_directory() {
                let index = IndexData::new(ctx, &mut record, FILE_NAME_INDEX_NAME)?;
                if !index.is_empty() {
                    return Err(StrataError::DirectoryNotEmpty(name.to_string()));
                }
            }

            for file_name in record.file_name_records()? {
                // Reloaded each time: removing a name can rewrite the parent's index
                let mut name_parent = mft.get_file_record(ctx.io(), file_name.parent_directory)?;
                let mut index = IndexData::new(ctx, &mut name_parent, FILE_NAME_INDEX_NAME)?;
                index.remove_entry(&mut *mft, &file_name.to_bytes(), transaction_id)?;
            }

            let mut extents: Vec<Extent> = Vec::new();
            for attribute in record.attributes().iter().chain(record.attribute_list()) {
                if let AttributeRecord::NonResident(r) = attribute {
                    extents.extend(r.data_runs.to_extents()?);
                }
            }
            ctx.deallocate_clusters(&extents, transaction_id)?;
            mft.delete_file_record(ctx, &mut record, transaction_id)?;
            debug!("Deleted '{}' ({}) from directory {}", name, reference, parent);
            Ok(())
        })
    }

    /// Delete the file or empty directory a path names
    pub fn delete_file_at_path(&self, path: &str) -> Result<(), StrataError> {
        let (parent_components, name) = split_parent(path)?;
        let parent = {
            let mft = self.lock_mft()?;
            Self::resolve(&self.ctx, &mft, &parent_components)?.reference()
        };
        self.delete_file(parent, name)
    }

    fn directory_names(
        ctx: &VolumeContext,
        mft: &MasterFileTable,
        directory: MftSegmentReference,
    ) -> Result<Vec<(MftSegmentReference, FileNameRecord)>, StrataError> {
        let mut record = mft.get_file_record(ctx.io(), directory)?;
        require_directory(&record)?;
        let index = IndexData::new(ctx, &mut record, FILE_NAME_INDEX_NAME)?;
        let mut names = Vec::new();
        for entry in index.get_all_entries()? {
            let file_name = FileNameRecord::parse(&entry.key)?;
            // A short name is always paired with a long one naming the same record
            if file_name.namespace == FileNameNamespace::Dos {
                continue;
            }
            names.push((entry.file_reference, file_name));
        }
        Ok(names)
    }

    /// Records of everything in `directory`, in collation order
    pub fn get_file_records_in_directory(&self, directory: MftSegmentReference) -> Result<Vec<FileRecord>, StrataError> {
        let mft = self.lock_mft()?;
        Self::directory_names(&self.ctx, &mft, directory)?
            .into_iter()
            .map(|(reference, _)| mft.get_file_record(self.ctx.io(), reference))
            .collect()
    }

    /// Index copies of the `$FILE_NAME` of everything in `directory`, in collation order
    pub fn get_file_name_records_in_directory(
        &self,
        directory: MftSegmentReference,
    ) -> Result<Vec<FileNameRecord>, StrataError> {
        let mft = self.lock_mft()?;
        Ok(Self::directory_names(&self.ctx, &mft, directory)?
            .into_iter()
            .map(|(_, name)| name)
            .collect())
    }

    /// Verify the B+tree of a directory's `$I30` index, returning the number of entries.
    /// A malformed tree is reported as `InvalidData`.
    pub fn check_directory_index(&self, directory: MftSegmentReference) -> Result<usize, StrataError> {
        let mft = self.lock_mft()?;
        let mut record = mft.get_file_record(self.ctx.io(), directory)?;
        require_directory(&record)?;
        IndexData::new(&self.ctx, &mut record, FILE_NAME_INDEX_NAME)?.check_structure()
    }

    /// Read up to `length` bytes of a file's unnamed data stream at `offset`
    pub fn read_file(&self, file: MftSegmentReference, offset: u64, length: usize) -> Result<Vec<u8>, StrataError> {
        let mft = self.lock_mft()?;
        let mut record = mft.get_file_record(self.ctx.io(), file)?;
        require_file(&record)?;
        let data = AttributeData::new(&self.ctx, &mut record, AttributeType::DATA, "")?;
        data.read_bytes(offset, length)
    }

    /// Write `data` into a file's unnamed data stream at `offset`, growing it as needed
    pub fn write_file(&self, file: MftSegmentReference, offset: u64, data: &[u8]) -> Result<(), StrataError> {
        self.transact(|ctx, mft, transaction_id| {
            let mut record = mft.get_file_record(ctx.io(), file)?;
            require_file(&record)?;
            let mut info = record.standard_information()?;
            info.timestamps.touch_modified();
            record.set_standard_information(&info)?;
            mft.update_file_record(ctx, &mut record, transaction_id)?;
            let mut stream = AttributeData::new(ctx, &mut record, AttributeType::DATA, "")?;
            stream.write_bytes(&mut *mft, offset, data, transaction_id)
        })
    }

    /// Grow (zero-filled) or shrink a file's unnamed data stream
    pub fn set_file_length(&self, file: MftSegmentReference, length: u64) -> Result<(), StrataError> {
        self.transact(|ctx, mft, transaction_id| {
            let mut record = mft.get_file_record(ctx.io(), file)?;
            require_file(&record)?;
            let mut stream = AttributeData::new(ctx, &mut record, AttributeType::DATA, "")?;
            stream.set_length(&mut *mft, length, transaction_id)
        })
    }

    /// Index the `$FILE_NAME` of each system file in the root directory
    pub(crate) fn index_system_files(&self) -> Result<(), StrataError> {
        self.transact(|ctx, mft, transaction_id| {
            let mut root = mft.get_file_record_by_number(ctx.io(), ROOT_DIRECTORY_SEGMENT)?;
            for segment_number in MFT_SEGMENT..=EXTEND_SEGMENT {
                let record = mft.get_file_record_by_number(ctx.io(), segment_number)?;
                for file_name in record.file_name_records()? {
                    if file_name.parent_directory.segment_number != ROOT_DIRECTORY_SEGMENT {
                        continue;
                    }
                    let mut index = IndexData::new(ctx, &mut root, FILE_NAME_INDEX_NAME)?;
                    index.add_entry(&mut *mft, record.reference(), file_name.to_bytes(), transaction_id)?;
                }
            }
            Ok(())
        })
    }

    pub fn volume_label(&self) -> Result<String, StrataError> {
        let mft = self.lock_mft()?;
        let record = mft.get_file_record_by_number(self.ctx.io(), VOLUME_SEGMENT)?;
        match record.get_attribute(AttributeType::VOLUME_NAME, "") {
            Some(AttributeRecord::Resident(r)) => Ok(decode_utf16(&r.data)),
            Some(AttributeRecord::NonResident(_)) => {
                Err(StrataError::InvalidData("$VOLUME_NAME is non-resident".to_string()))
            }
            None => Ok(String::new()),
        }
    }

    /// Replace the volume label. An empty label removes `$VOLUME_NAME`.
    pub fn set_volume_label(&self, label: &str) -> Result<(), StrataError> {
        validate_volume_label(label)?;
        self.transact(|ctx, mft, transaction_id| {
            let mut record = mft.get_file_record_by_number(ctx.io(), VOLUME_SEGMENT)?;
            record.remove_attribute(AttributeType::VOLUME_NAME, "");
            if !label.is_empty() {
                record.add_attribute(AttributeRecord::new_resident(
                    AttributeType::VOLUME_NAME,
                    "",
                    encode_utf16(label),
                ));
            }
            mft.update_file_record(ctx, &mut record, transaction_id)?;
            info!("Volume label set to '{}'", label);
            Ok(())
        })
    }

    /// Volume size in bytes, excluding the backup boot sector
    pub fn size(&self) -> Result<u64, StrataError> {
        let _mft = self.lock_mft()?;
        let boot = lock(&self.boot_record, "boot record")?;
        Ok(boot.total_sectors * boot.bytes_per_sector as u64)
    }

    pub fn total_clusters(&self) -> Result<u64, StrataError> {
        self.ctx.with_bitmap(|bitmap| Ok(bitmap.total_clusters()))
    }

    pub fn free_clusters(&self) -> Result<u64, StrataError> {
        self.ctx.free_clusters()
    }

    pub fn free_space(&self) -> Result<u64, StrataError> {
        Ok(self.ctx.free_clusters()? * self.ctx.geometry().bytes_per_cluster as u64)
    }

    /// File record segments the MFT can hand out before it has to grow
    pub fn free_file_records(&self) -> Result<u64, StrataError> {
        let mut mft = self.lock_mft()?;
        mft.free_segment_count(&self.ctx)
    }

    pub fn log_stats(&self) -> Result<LogFileStats, StrataError> {
        self.ctx.log_stats()
    }

    /// Grow the volume by `additional_sectors` into space the device already has.
    /// The backup boot sector moves to the new last sector.
    pub fn extend(&self, additional_sectors: u64) -> Result<(), StrataError> {
        if additional_sectors == 0 {
            return Ok(());
        }
        self.transact(|ctx, mft, transaction_id| {
            let mut boot = lock(&self.boot_record, "boot record")?;
            let geometry = *ctx.geometry();
            let new_total_sectors = boot.total_sectors + additional_sectors;
            // One sector past the volume holds the backup boot sector
            if new_total_sectors >= self.device.total_sectors() {
                return Err(StrataError::OutOfRange(format!(
                    "cannot grow to {} sectors on a device of {}",
                    new_total_sectors,
                    self.device.total_sectors()
                )));
            }
            let old_total_clusters = boot.total_clusters();
            let new_total_clusters = new_total_sectors / geometry.sectors_per_cluster as u64;

            let mut bitmap_record = mft.get_file_record_by_number(ctx.io(), BITMAP_SEGMENT)?;
            let needed = align8(new_total_clusters.div_ceil(8) as usize) as u64;
            let mut stream = AttributeData::new(ctx, &mut bitmap_record, AttributeType::DATA, "")?;
            let length = stream.length()?;
            if needed > length {
                stream.write_bytes(&mut *mft, length, &vec![0u8; (needed - length) as usize], transaction_id)?;
            }
            let runs = system_data(&bitmap_record, "$Bitmap")?.data_runs.clone();
            ctx.with_bitmap(|bitmap| {
                bitmap.set_layout(runs, new_total_clusters);
                Ok(())
            })?;

            boot.total_sectors = new_total_sectors;
            let mut sector = vec![0u8; geometry.bytes_per_sector as usize];
            sector[..BOOT_SECTOR_SIZE].copy_from_slice(&boot.to_bytes());
            ctx.io().write_sectors(0, &sector)?;
            ctx.io().write_sectors(new_total_sectors, &sector)?;
            info!(
                "Extended volume from {} to {} clusters",
                old_total_clusters, new_total_clusters
            );
            Ok(())
        })
    }

    /// Flush and unmount. A clean restart area is written first unless configured off.
    pub fn close(self) -> Result<(), StrataError> {
        let _mft = self.lock_mft()?;
        if !self.ctx.io().is_read_only() && self.ctx.config().write_restart_on_close {
            self.ctx.write_restart_record(true)?;
        }
        self.ctx.io().flush()?;
        info!("Volume closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use strata_core::FormatOptions;

    #[test]
    fn test_system_files_are_listed_in_root() {
        let (_device, volume) = small_volume();
        let root = volume.root_directory_reference().unwrap();
        let names: Vec<String> = volume
            .get_file_name_records_in_directory(root)
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        for expected in ["$MFT", "$MFTMirr", "$LogFile", "$Volume", "$Bitmap", "$UpCase", "."] {
            assert!(names.iter().any(|n| n == expected), "{} missing from {:?}", expected, names);
        }
    }

    #[test]
    fn test_create_rejects_duplicate_names_case_insensitively() {
        let (_device, volume) = small_volume();
        let root = volume.root_directory_reference().unwrap();
        volume.create_file(root, "Report.txt", false).unwrap();
        let result = volume.create_file(root, "REPORT.TXT", false);
        assert!(matches!(result, Err(StrataError::AlreadyExists(_))));
    }

    #[test]
    fn test_failed_create_is_not_forgotten() {
        let options = FormatOptions {
            bytes_per_index_record: 256,
            ..FormatOptions::default()
        };
        let (_device, volume) = formatted_volume(64 * 1024 * 1024, &options);
        let root = volume.root_directory_reference().unwrap();
        let directory = volume.create_file(root, "narrow", true).unwrap().reference();
        let before = volume.log_stats().unwrap();
        assert_eq!(before.active_transactions, 0);

        // The record is created and logged before its index entry turns out not to fit
        let long_name = "n".repeat(255);
        let result = volume.create_file(directory, &long_name, false);
        assert!(matches!(result, Err(StrataError::InvalidInput(_))));

        let after = volume.log_stats().unwrap();
        assert!(after.records_written > before.records_written);
        assert_eq!(after.active_transactions, 1);
        assert_eq!(after.restart_records_written, before.restart_records_written);
    }

    #[test]
    fn test_each_operation_writes_restart_record() {
        let (_device, volume) = small_volume();
        let root = volume.root_directory_reference().unwrap();
        let before = volume.log_stats().unwrap();
        volume.create_file(root, "a.txt", false).unwrap();
        let created = volume.log_stats().unwrap();
        assert_eq!(created.restart_records_written, before.restart_records_written + 1);
        assert!(created.restart_lsn > before.restart_lsn);
        volume.delete_file(root, "a.txt").unwrap();
        let deleted = volume.log_stats().unwrap();
        assert_eq!(deleted.restart_records_written, created.restart_records_written + 1);
        assert_eq!(deleted.active_transactions, 0);
    }

    #[test]
    fn test_create_fails_early_when_disk_is_nearly_full() {
        let (_device, volume) = small_volume();
        let root = volume.root_directory_reference().unwrap();
        let file = volume.create_file(root, "filler", false).unwrap();
        let free = volume.free_space().unwrap();
        let cluster = volume.geometry().bytes_per_cluster as u64;
        volume.set_file_length(file.reference(), free - 8 * cluster).unwrap();

        let before = volume.with_mft(|_, mft| Ok(mft.segment_count())).unwrap();
        let result = volume.create_file(root, "one-more", false);
        assert!(matches!(result, Err(StrataError::DiskFull(_))));
        assert_eq!(volume.with_mft(|_, mft| Ok(mft.segment_count())).unwrap(), before);
        assert!(volume.get_file_record("\\one-more").unwrap_err().is_not_found());
    }

    #[test]
    fn test_directory_cannot_move_into_itself() {
        let (_device, volume) = small_volume();
        let root = volume.root_directory_reference().unwrap();
        let a = volume.create_file(root, "A", true).unwrap();
        let b = volume.create_file(a.reference(), "B", true).unwrap();
        let result = volume.move_file(a.reference(), b.reference(), "A");
        assert!(matches!(result, Err(StrataError::InvalidInput(_))));
        assert!(volume.get_file_record("\\A\\B").is_ok());
    }

    #[test]
    fn test_non_empty_directory_is_not_deleted() {
        let (_device, volume) = small_volume();
        let root = volume.root_directory_reference().unwrap();
        let a = volume.create_file(root, "A", true).unwrap();
        volume.create_file(a.reference(), "inner", false).unwrap();
        assert!(matches!(
            volume.delete_file(root, "A"),
            Err(StrataError::DirectoryNotEmpty(_))
        ));
        volume.delete_file(a.reference(), "inner").unwrap();
        volume.delete_file(root, "A").unwrap();
        assert!(volume.get_file_record("\\A").unwrap_err().is_not_found());
    }

    #[test]
    fn test_system_files_cannot_be_deleted() {
        let (_device, volume) = small_volume();
        let root = volume.root_directory_reference().unwrap();
        assert!(matches!(volume.delete_file(root, "$MFT"), Err(StrataError::InvalidInput(_))));
    }

    #[test]
    fn test_label_round_trips_through_remount() {
        let (device, volume) = small_volume();
        assert_eq!(volume.volume_label().unwrap(), "");
        volume.set_volume_label("Archive").unwrap();
        volume.close().unwrap();

        let volume = NtfsVolume::open(device, VolumeConfig::default()).unwrap();
        assert_eq!(volume.volume_label().unwrap(), "Archive");
        volume.set_volume_label("").unwrap();
        assert_eq!(volume.volume_label().unwrap(), "");
    }

    #[test]
    fn test_extend_adds_free_clusters() {
        let (device, volume) = small_volume();
        device.extend(16 * 1024 * 1024 / 512).unwrap();
        let clusters = volume.total_clusters().unwrap();
        let free = volume.free_clusters().unwrap();

        volume.extend(16 * 1024 * 1024 / 512).unwrap();
        let added = volume.total_clusters().unwrap() - clusters;
        assert_eq!(added, 16 * 1024 * 1024 / 4096);
        assert!(volume.free_clusters().unwrap() + 1 >= free + added);
        volume.close().unwrap();

        let volume = NtfsVolume::open(device.clone(), VolumeConfig::default()).unwrap();
        assert_eq!(volume.total_clusters().unwrap(), clusters + added);
        let backup = device.read_sectors(device.total_sectors() - 1, 1).unwrap();
        assert_eq!(NtfsBootRecord::parse(&backup).unwrap().total_sectors, device.total_sectors() - 1);
    }
}
