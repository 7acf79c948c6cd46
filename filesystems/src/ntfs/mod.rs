// NTFS engine
// User-mode read/write access to NTFS volumes on any block device.
// Fully portable - no OS-specific dependencies

pub mod attribute_data;
pub mod attributes;
pub mod bitmap;
pub mod boot_sector;
pub mod data_runs;
pub mod file_record;
pub mod formatter;
pub mod index;
pub mod logfile;
pub mod mft;
pub mod multi_sector;
pub mod path;
pub mod structures;
pub mod timestamps;
pub mod upcase;
pub mod volume;
pub mod volume_bitmap;
pub mod volume_io;

// Re-export main types
pub use attributes::{FileNameNamespace, FileNameRecord, StandardInformation};
pub use file_record::FileRecord;
pub use formatter::NtfsFormatter;
pub use logfile::LogFileStats;
pub use structures::MftSegmentReference;
pub use volume::NtfsVolume;
