use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Stale reference: {0}")]
    StaleReference(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl StrataError {
    /// A stale reference points at a record that was freed and reused,
    /// so callers treat it the same way as a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StrataError::NotFound(_) | StrataError::StaleReference(_))
    }

    pub fn is_disk_full(&self) -> bool {
        matches!(self, StrataError::DiskFull(_))
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
