// Strata filesystem engines

pub mod ntfs;

#[cfg(test)]
pub mod test_helpers;

// Re-export the NTFS entry points
pub use ntfs::{FileNameRecord, FileRecord, MftSegmentReference, NtfsFormatter, NtfsVolume};
