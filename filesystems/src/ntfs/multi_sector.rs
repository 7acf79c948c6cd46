// Update sequence array handling
// FILE, INDX, RCRD and RSTR blocks protect every 512-byte stride against torn writes.

use crate::ntfs::structures::UPDATE_SEQUENCE_STRIDE;
use byteorder::{ByteOrder, LittleEndian};
use strata_core::StrataError;

/// Number of USA entries (sequence number + one per stride) for a block size
pub fn update_sequence_count(block_size: usize) -> u16 {
    (block_size / UPDATE_SEQUENCE_STRIDE + 1) as u16
}

/// Next update sequence number, never 0 and never 0xFFFF
pub fn next_update_sequence_number(current: u16) -> u16 {
    let next = current.wrapping_add(1);
    if next == 0 || next == 0xFFFF {
        1
    } else {
        next
    }
}

/// Swap the last two bytes of every stride for the sequence number and stash
/// the originals in the array. The block header must already hold the array
/// offset (0x04) and count (0x06).
pub fn apply_fixup(block: &mut [u8], sequence_number: u16) -> Result<(), StrataError> {
    let (offset, count) = usa_location(block)?;
    LittleEndian::write_u16(&mut block[offset..offset + 2], sequence_number);
    for stride in 1..count {
        let end = stride * UPDATE_SEQUENCE_STRIDE;
        let slot = offset + stride * 2;
        let original = LittleEndian::read_u16(&block[end - 2..end]);
        LittleEndian::write_u16(&mut block[slot..slot + 2], original);
        LittleEndian::write_u16(&mut block[end - 2..end], sequence_number);
    }
    Ok(())
}

/// Verify every stride carries the sequence number and restore the original bytes.
/// Returns the sequence number that was in use.
pub fn revert_fixup(block: &mut [u8]) -> Result<u16, StrataError> {
    let (offset, count) = usa_location(block)?;
    let sequence_number = LittleEndian::read_u16(&block[offset..offset + 2]);
    for stride in 1..count {
        let end = stride * UPDATE_SEQUENCE_STRIDE;
        let slot = offset + stride * 2;
        if LittleEndian::read_u16(&block[end - 2..end]) != sequence_number {
            return Err(StrataError::InvalidData(format!(
                "torn write detected in stride {} (expected sequence {:#06x})",
                stride, sequence_number
            )));
        }
        let original = LittleEndian::read_u16(&block[slot..slot + 2]);
        LittleEndian::write_u16(&mut block[end - 2..end], original);
    }
    Ok(sequence_number)
}

fn usa_location(block: &[u8]) -> Result<(usize, usize), StrataError> {
    if block.len() < 8 {
        return Err(StrataError::InvalidData("block too small for fixups".to_string()));
    }
    let offset = LittleEndian::read_u16(&block[4..6]) as usize;
    let count = LittleEndian::read_u16(&block[6..8]) as usize;
    if count == 0
        || (count - 1) * UPDATE_SEQUENCE_STRIDE > block.len()
        || offset + count * 2 > block.len()
    {
        return Err(StrataError::InvalidData(format!(
            "update sequence array ({} entries at {:#x}) does not fit a {}-byte block",
            count,
            offset,
            block.len()
        )));
    }
    Ok((offset, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Vec<u8> {
        let mut block: Vec<u8> = (0..1024).map(|i| (i % 253) as u8).collect();
        LittleEndian::write_u16(&mut block[4..6], 0x30);
        LittleEndian::write_u16(&mut block[6..8], update_sequence_count(1024));
        block
    }

    #[test]
    fn test_fixup_round_trip() {
        let original = block();
        let mut protected = original.clone();
        apply_fixup(&mut protected, 0x0042).unwrap();
        assert_eq!(LittleEndian::read_u16(&protected[510..512]), 0x0042);
        assert_eq!(LittleEndian::read_u16(&protected[1022..1024]), 0x0042);

        let sequence = revert_fixup(&mut protected).unwrap();
        assert_eq!(sequence, 0x0042);
        // The array itself keeps the stashed bytes, everything else is restored
        assert_eq!(&protected[..0x30], &original[..0x30]);
        assert_eq!(&protected[0x36..], &original[0x36..]);
    }

    #[test]
    fn test_torn_write_detected() {
        let mut protected = block();
        apply_fixup(&mut protected, 7).unwrap();
        protected[1023] ^= 0xFF;
        assert!(matches!(
            revert_fixup(&mut protected),
            Err(StrataError::InvalidData(_))
        ));
    }

    #[test]
    fn test_sequence_number_skips_reserved_values() {
        assert_eq!(next_update_sequence_number(1), 2);
        assert_eq!(next_update_sequence_number(0xFFFE), 1);
        assert_eq!(next_update_sequence_number(0xFFFF), 1);
    }
}
