// Sector-addressable block devices
// The storage engine only ever talks to a volume through this contract.

use crate::StrataError;
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

/// Read/write N sectors at LBA X.
///
/// Implementations must be safe to share between threads and must fail with
/// `OutOfRange` instead of truncating when a request crosses the device end.
pub trait BlockDevice: Send + Sync {
    fn bytes_per_sector(&self) -> u32;

    fn total_sectors(&self) -> u64;

    fn read_sectors(&self, first_lba: u64, count: u32) -> Result<Vec<u8>, StrataError>;

    /// `data.len()` must be a multiple of the sector size.
    fn write_sectors(&self, first_lba: u64, data: &[u8]) -> Result<(), StrataError>;

    fn flush(&self) -> Result<(), StrataError> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        false
    }

    /// Total size in bytes
    fn size(&self) -> u64 {
        self.total_sectors() * self.bytes_per_sector() as u64
    }
}

fn check_range(
    first_lba: u64,
    sector_count: u64,
    total_sectors: u64,
) -> Result<(), StrataError> {
    let end = first_lba
        .checked_add(sector_count)
        .ok_or_else(|| StrataError::OutOfRange(format!("LBA {} overflows", first_lba)))?;
    if end > total_sectors {
        return Err(StrataError::OutOfRange(format!(
            "sectors {}..{} beyond device end {}",
            first_lba, end, total_sectors
        )));
    }
    Ok(())
}

fn sector_count_of(data: &[u8], bytes_per_sector: u32) -> Result<u64, StrataError> {
    if data.len() % bytes_per_sector as usize != 0 {
        return Err(StrataError::InvalidInput(format!(
            "write of {} bytes is not a multiple of the {}-byte sector",
            data.len(),
            bytes_per_sector
        )));
    }
    Ok((data.len() / bytes_per_sector as usize) as u64)
}

fn lock_poisoned() -> StrataError {
    StrataError::IoError(std::io::Error::other("device lock poisoned"))
}

/// RAM-backed device, used by tests and scratch volumes
pub struct MemoryBlockDevice {
    bytes_per_sector: u32,
    data: RwLock<Vec<u8>>,
}

impl MemoryBlockDevice {
    pub fn new(bytes_per_sector: u32, total_sectors: u64) -> Self {
        Self {
            bytes_per_sector,
            data: RwLock::new(vec![0u8; (total_sectors * bytes_per_sector as u64) as usize]),
        }
    }

    pub fn with_size(bytes_per_sector: u32, size: u64) -> Self {
        Self::new(bytes_per_sector, size / bytes_per_sector as u64)
    }

    /// Grow the device, the new tail reads as zero
    pub fn extend(&self, additional_sectors: u64) -> Result<(), StrataError> {
        let mut data = self.data.write().map_err(|_| lock_poisoned())?;
        let new_len = data.len() + (additional_sectors * self.bytes_per_sector as u64) as usize;
        data.resize(new_len, 0);
        debug!("Memory device grown to {} bytes", new_len);
        Ok(())
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector
    }

    /// A poisoned lock still guards a complete buffer, so the size is read through it
    fn total_sectors(&self) -> u64 {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.len() as u64 / self.bytes_per_sector as u64
    }

    fn read_sectors(&self, first_lba: u64, count: u32) -> Result<Vec<u8>, StrataError> {
        let data = self
            .data
            .read()
            .map_err(|_| lock_poisoned())?;
        let total = data.len() as u64 / self.bytes_per_sector as u64;
        check_range(first_lba, count as u64, total)?;
        let start = (first_lba * self.bytes_per_sector as u64) as usize;
        let end = start + count as usize * self.bytes_per_sector as usize;
        Ok(data[start..end].to_vec())
    }

    fn write_sectors(&self, first_lba: u64, buffer: &[u8]) -> Result<(), StrataError> {
        let count = sector_count_of(buffer, self.bytes_per_sector)?;
        let mut data = self
            .data
            .write()
            .map_err(|_| lock_poisoned())?;
        let total = data.len() as u64 / self.bytes_per_sector as u64;
        check_range(first_lba, count, total)?;
        let start = (first_lba * self.bytes_per_sector as u64) as usize;
        data[start..start + buffer.len()].copy_from_slice(buffer);
        Ok(())
    }
}

/// Disk image file
pub struct FileBlockDevice {
    file: Mutex<File>,
    bytes_per_sector: u32,
    total_sectors: u64,
    read_only: bool,
}

impl FileBlockDevice {
    pub fn open<P: AsRef<Path>>(
        path: P,
        bytes_per_sector: u32,
        read_only: bool,
    ) -> Result<Self, StrataError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;
        let size = file.metadata()?.len();
        debug!(
            "Opened image {} ({} bytes, read_only={})",
            path.as_ref().display(),
            size,
            read_only
        );
        Ok(Self {
            file: Mutex::new(file),
            bytes_per_sector,
            total_sectors: size / bytes_per_sector as u64,
            read_only,
        })
    }

    /// Create (or truncate) an image file of `size` bytes
    pub fn create<P: AsRef<Path>>(
        path: P,
        bytes_per_sector: u32,
        size: u64,
    ) -> Result<Self, StrataError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size)?;
        Ok(Self {
            file: Mutex::new(file),
            bytes_per_sector,
            total_sectors: size / bytes_per_sector as u64,
            read_only: false,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, File>, StrataError> {
        self.file
            .lock()
            .map_err(|_| StrataError::IoError(std::io::Error::other("image lock poisoned")))
    }
}

impl BlockDevice for FileBlockDevice {
    fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_sectors(&self, first_lba: u64, count: u32) -> Result<Vec<u8>, StrataError> {
        check_range(first_lba, count as u64, self.total_sectors)?;
        let mut buffer = vec![0u8; count as usize * self.bytes_per_sector as usize];
        let mut file = self.lock()?;
        file.seek(SeekFrom::Start(first_lba * self.bytes_per_sector as u64))?;
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write_sectors(&self, first_lba: u64, data: &[u8]) -> Result<(), StrataError> {
        if self.read_only {
            return Err(StrataError::AccessDenied(
                "image was opened read-only".to_string(),
            ));
        }
        let count = sector_count_of(data, self.bytes_per_sector)?;
        check_range(first_lba, count, self.total_sectors)?;
        let mut file = self.lock()?;
        file.seek(SeekFrom::Start(first_lba * self.bytes_per_sector as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StrataError> {
        let mut file = self.lock()?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_device_round_trip() {
        let device = MemoryBlockDevice::new(512, 16);
        let pattern: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        device.write_sectors(3, &pattern).unwrap();
        assert_eq!(device.read_sectors(3, 2).unwrap(), pattern);
        assert_eq!(device.read_sectors(0, 1).unwrap(), vec![0u8; 512]);
    }

    #[test]
    fn test_memory_device_rejects_out_of_range() {
        let device = MemoryBlockDevice::new(512, 8);
        assert!(matches!(
            device.read_sectors(7, 2),
            Err(StrataError::OutOfRange(_))
        ));
        assert!(matches!(
            device.write_sectors(8, &[0u8; 512]),
            Err(StrataError::OutOfRange(_))
        ));
        assert!(matches!(
            device.write_sectors(0, &[0u8; 100]),
            Err(StrataError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_memory_device_extend() {
        let device = MemoryBlockDevice::new(512, 8);
        device.extend(8).unwrap();
        assert_eq!(device.total_sectors(), 16);
        assert_eq!(device.read_sectors(15, 1).unwrap(), vec![0u8; 512]);
    }

    #[test]
    fn test_poisoned_memory_device_reports_errors() {
        let device = std::sync::Arc::new(MemoryBlockDevice::new(512, 8));
        let holder = device.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.data.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();

        assert!(matches!(device.extend(8), Err(StrataError::IoError(_))));
        assert!(matches!(device.read_sectors(0, 1), Err(StrataError::IoError(_))));
        assert_eq!(device.total_sectors(), 8);
    }

    #[test]
    fn test_file_device_round_trip() {
        let temp = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let device = FileBlockDevice::create(temp.path(), 512, 64 * 512).unwrap();
        device.write_sectors(10, &[0xABu8; 512]).unwrap();
        device.flush().unwrap();
        drop(device);

        let reopened = FileBlockDevice::open(temp.path(), 512, true).unwrap();
        assert_eq!(reopened.total_sectors(), 64);
        assert_eq!(reopened.read_sectors(10, 1).unwrap(), vec![0xABu8; 512]);
        assert!(matches!(
            reopened.write_sectors(0, &[0u8; 512]),
            Err(StrataError::AccessDenied(_))
        ));
    }
}
