// NTFS $LogFile
// Write-ahead logging of redo/undo pairs for every structural change.
// Records are written before the change they describe; replay on mount is not performed.

pub mod client;
pub mod lsn;
pub mod structures;

pub use client::{LogClient, LogTarget, TransactionId};
pub use lsn::Lsn;

use serde::{Deserialize, Serialize};

/// NTFS log operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LogOperation {
    Noop = 0x00,
    CompensationLogRecord = 0x01,
    InitializeFileRecordSegment = 0x02,
    DeallocateFileRecordSegment = 0x03,
    WriteEndOfFileRecordSegment = 0x04,
    CreateAttribute = 0x05,
    DeleteAttribute = 0x06,
    UpdateResidentValue = 0x07,
    UpdateNonResidentValue = 0x08,
    UpdateMappingPairs = 0x09,
    DeleteDirtyClusters = 0x0A,
    SetNewAttributeSizes = 0x0B,
    AddIndexEntryRoot = 0x0C,
    DeleteIndexEntryRoot = 0x0D,
    AddIndexEntryAllocation = 0x0E,
    DeleteIndexEntryAllocation = 0x0F,
    WriteEndOfIndexBuffer = 0x10,
    SetIndexEntryVcnRoot = 0x11,
    SetIndexEntryVcnAllocation = 0x12,
    UpdateFileNameRoot = 0x13,
    UpdateFileNameAllocation = 0x14,
    SetBitsInNonResidentBitMap = 0x15,
    ClearBitsInNonResidentBitMap = 0x16,
    HotFix = 0x17,
    EndTopLevelAction = 0x18,
    PrepareTransaction = 0x19,
    CommitTransaction = 0x1A,
    ForgetTransaction = 0x1B,
    OpenNonResidentAttribute = 0x1C,
    OpenAttributeTableDump = 0x1D,
    AttributeNamesDump = 0x1E,
    DirtyPageTableDump = 0x1F,
    TransactionTableDump = 0x20,
    UpdateRecordDataRoot = 0x21,
    UpdateRecordDataAllocation = 0x22,
}

/// Log file statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogFileStats {
    /// Last LSN written
    pub current_lsn: u64,
    /// LSN of the last client restart record
    pub restart_lsn: u64,
    /// Transactions allocated but not yet forgotten
    pub active_transactions: u32,
    pub records_written: u64,
    pub restart_records_written: u64,
    /// Times the log wrapped back to its first record page
    pub wraps: u64,
    pub bytes_written: u64,
    /// Position of the write cursor within the record pages
    pub usage_percent: f32,
}
