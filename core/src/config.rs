// Volume mount configuration
// Threaded through the volume constructor instead of living in process-wide settings.

use crate::StrataError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Reject every write at the sector I/O boundary
    pub read_only: bool,
    /// Largest single device transfer, in sectors
    pub max_transfer_sectors: u32,
    /// Index records added to `$INDEX_ALLOCATION` each time it runs out
    pub index_extend_granularity: u32,
    /// Overrides the size-tiered number of records added when the MFT grows
    pub mft_extend_granularity: Option<u32>,
    /// Write a clean restart area when the volume is closed
    pub write_restart_on_close: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            max_transfer_sectors: 256,
            index_extend_granularity: 16,
            mft_extend_granularity: None,
            write_restart_on_close: true,
        }
    }
}

impl VolumeConfig {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, StrataError> {
        let config: VolumeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, StrataError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), StrataError> {
        if self.max_transfer_sectors == 0 {
            return Err(StrataError::Configuration(
                "max_transfer_sectors must be at least 1".to_string(),
            ));
        }
        if self.index_extend_granularity == 0 {
            return Err(StrataError::Configuration(
                "index_extend_granularity must be at least 1".to_string(),
            ));
        }
        if self.mft_extend_granularity == Some(0) {
            return Err(StrataError::Configuration(
                "mft_extend_granularity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = VolumeConfig::from_json_str(r#"{ "read_only": true }"#).unwrap();
        assert!(config.read_only);
        assert_eq!(config.max_transfer_sectors, 256);
        assert_eq!(config.index_extend_granularity, 16);
    }

    #[test]
    fn test_zero_transfer_size_rejected() {
        let result = VolumeConfig::from_json_str(r#"{ "max_transfer_sectors": 0 }"#);
        assert!(matches!(result, Err(StrataError::Configuration(_))));
    }

    #[test]
    fn test_bad_json_is_serialization_error() {
        let result = VolumeConfig::from_json_str("{ read_only: ");
        assert!(matches!(result, Err(StrataError::SerializationError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        std::fs::write(temp.path(), r#"{ "mft_extend_granularity": 64 }"#).unwrap();
        let config = VolumeConfig::from_json_file(temp.path()).unwrap();
        assert_eq!(config.mft_extend_granularity, Some(64));
    }
}
