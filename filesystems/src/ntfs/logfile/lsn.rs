// LSN (Log Sequence Number) handling for NTFS
// An LSN packs the wrap count of the log and the record's byte offset (in 8-byte units)

/// Log Sequence Number
/// High `sequence_bits` bits = wrap count, the rest = file offset / 8
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Invalid/null LSN
    pub const INVALID: Lsn = Lsn(0);

    pub fn new(sequence: u64, file_offset: u64, sequence_bits: u32) -> Self {
        Lsn((sequence << (64 - sequence_bits)) | (file_offset >> 3))
    }

    /// Wrap count of the log when the record was written
    pub fn sequence(&self, sequence_bits: u32) -> u64 {
        self.0 >> (64 - sequence_bits)
    }

    /// Byte offset of the record in `$LogFile`
    pub fn file_offset(&self, sequence_bits: u32) -> u64 {
        let offset_bits = 64 - sequence_bits;
        (self.0 & ((1u64 << offset_bits) - 1)) << 3
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LSN({:#x})", self.0)
    }
}

/// Bits left for the sequence number once the file offset (in 8-byte units) is stored
pub fn sequence_number_bits(file_size: u64) -> u32 {
    let file_offset_bits = 64 - file_size.leading_zeros();
    67 - file_offset_bits
}
