//! Self-checksummed packet generation and verification.
//!
//! A packet occupies `length` bytes of a buffer starting at `offset`:
//!
//! ```text
//! +------------------+--------------------------------+
//! | xxh64 (8, BE)    | content (length - 8 bytes)     |
//! +------------------+--------------------------------+
//! ```
//!
//! Content byte at absolute buffer index `i` is `(i ^ seed) as u8`. The index
//! is the position in the whole buffer, not within the content, so a given
//! `(offset, seed)` pair always produces the same bytes. The checksum is
//! XXH64 (seed 0) over the content only.

use xxhash_rust::xxh64::xxh64;

use crate::error::{NetsumError, Result};
use crate::framing::{check_range, decode_i64, encode_i64};

/// Size of the checksum header.
pub const HASH_LENGTH: usize = 8;

/// Fill `buffer[offset..offset + length]` with a packet derived from `seed`.
pub fn create_packet(buffer: &mut [u8], offset: usize, length: usize, seed: u64) -> Result<()> {
    check_packet_length(length)?;
    check_range(offset, length, buffer.len())?;

    let end = offset + length;
    for (i, byte) in buffer
        .iter_mut()
        .enumerate()
        .take(end)
        .skip(offset + HASH_LENGTH)
    {
        *byte = (i as u64 ^ seed) as u8;
    }

    let hash = content_hash(buffer, offset, length);
    encode_i64(hash as i64, buffer, offset);
    Ok(())
}

/// Check that the stored checksum of the packet at `offset` matches its content.
pub fn verify_packet(buffer: &[u8], offset: usize, length: usize) -> Result<()> {
    check_packet_length(length)?;
    check_range(offset, length, buffer.len())?;

    let expected = decode_i64(buffer, offset) as u64;
    let computed = content_hash(buffer, offset, length);
    if expected != computed {
        return Err(NetsumError::ChecksumMismatch {
            expected,
            computed,
            packet: hex::encode_upper(&buffer[offset..offset + length]),
        });
    }
    Ok(())
}

fn content_hash(buffer: &[u8], offset: usize, length: usize) -> u64 {
    xxh64(&buffer[offset + HASH_LENGTH..offset + length], 0)
}

fn check_packet_length(length: usize) -> Result<()> {
    if length < HASH_LENGTH {
        return Err(NetsumError::InvalidArgument(format!(
            "packet length {length} is shorter than the {HASH_LENGTH} byte checksum"
        )));
    }
    Ok(())
}
