use crate::{BlockDevice, StrataError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub label: Option<String>,
    /// Defaults to 4096
    pub bytes_per_cluster: Option<u32>,
    pub bytes_per_file_record_segment: u32,
    pub bytes_per_index_record: u32,
    /// Records created in the initial MFT, rounded up to a multiple of 8
    pub initial_mft_records: u32,
    /// Defaults to a size derived from the volume size
    pub log_file_size: Option<u64>,
    /// Random when not given
    pub serial_number: Option<u64>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            label: None,
            bytes_per_cluster: None,
            bytes_per_file_record_segment: 1024,
            bytes_per_index_record: 4096,
            initial_mft_records: 64,
            log_file_size: None,
            serial_number: None,
        }
    }
}

/// Lays down an empty filesystem on a block device.
///
/// `format` takes shared ownership so a formatter can mount what it just wrote.
pub trait VolumeFormatter: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate_options(
        &self,
        device: &dyn BlockDevice,
        options: &FormatOptions,
    ) -> Result<(), StrataError>;

    fn format(&self, device: Arc<dyn BlockDevice>, options: &FormatOptions) -> Result<(), StrataError>;
}
