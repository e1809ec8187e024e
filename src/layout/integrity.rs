//! CRC32 integrity checks for pages.
//!
//! The checksum is stored inside the page it covers, the checksum field
//! itself is treated as zero while hashing.

use std::ops::Range;

/// Compute the checksum of `buffer` with the bytes in `checksum_field` treated as zero.
pub fn checksum_excluding(buffer: &[u8], checksum_field: Range<usize>) -> u32 {
    let zeroes = [0u8; 4];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buffer[..checksum_field.start]);
    hasher.update(&zeroes[..checksum_field.len()]);
    hasher.update(&buffer[checksum_field.end..]);
    hasher.finalize()
}

/// Write the checksum of `buffer` into `checksum_field`.
pub fn write_check_bytes(buffer: &mut [u8], checksum_field: Range<usize>) {
    let checksum = checksum_excluding(buffer, checksum_field.clone());
    buffer[checksum_field].copy_from_slice(&checksum.to_le_bytes());
}

/// Verify the checksum held in `checksum_field` matches the buffer.
///
/// Returns `false` if the checksums did not match
pub fn verify(buffer: &[u8], checksum_field: Range<usize>) -> bool {
    let mut expected = [0; 4];
    expected.copy_from_slice(&buffer[checksum_field.clone()]);
    checksum_excluding(buffer, checksum_field) == u32::from_le_bytes(expected)
}
