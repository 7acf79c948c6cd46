pub mod config;
pub mod device;
pub mod error;
pub mod filesystem;

pub use config::VolumeConfig;
pub use device::{BlockDevice, FileBlockDevice, MemoryBlockDevice};
pub use error::{Result, StrataError};
pub use filesystem::{FormatOptions, VolumeFormatter};
