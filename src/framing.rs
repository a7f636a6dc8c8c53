//! Length-prefixed framing over byte streams.
//!
//! Every transfer on the wire is a frame:
//!
//! ```text
//! +----------------+------------------------+
//! | length (4, BE) | payload (length bytes) |
//! +----------------+------------------------+
//! ```
//!
//! The length is a signed 32-bit big-endian integer. A negative length is a
//! protocol violation. No maximum is enforced by the framing itself; readers
//! supply a buffer sized to the largest payload they expect.

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetsumError, Result};

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Encode `value` big-endian into `bytes[offset..offset + 4]`.
///
/// # Panics
/// Panics if the buffer is too short.
pub fn encode_i32(value: i32, bytes: &mut [u8], offset: usize) {
    (&mut bytes[offset..offset + 4]).put_i32(value);
}

/// Decode a big-endian `i32` from `bytes[offset..offset + 4]`.
///
/// # Panics
/// Panics if the buffer is too short.
pub fn decode_i32(bytes: &[u8], offset: usize) -> i32 {
    (&bytes[offset..offset + 4]).get_i32()
}

/// Encode `value` big-endian into `bytes[offset..offset + 8]`.
///
/// # Panics
/// Panics if the buffer is too short.
pub fn encode_i64(value: i64, bytes: &mut [u8], offset: usize) {
    (&mut bytes[offset..offset + 8]).put_i64(value);
}

/// Decode a big-endian `i64` from `bytes[offset..offset + 8]`.
///
/// # Panics
/// Panics if the buffer is too short.
pub fn decode_i64(bytes: &[u8], offset: usize) -> i64 {
    (&bytes[offset..offset + 8]).get_i64()
}

/// Check that `[offset, offset + length)` lies within a buffer of `capacity` bytes.
pub fn check_range(offset: usize, length: usize, capacity: usize) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(NetsumError::InvalidRange {
            offset,
            length,
            capacity,
        }),
    }
}

/// Write all of `bytes` or fail.
pub async fn write_fully<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    Ok(())
}

/// Fill all of `buffer` from the stream or fail.
///
/// An early end of stream is reported as [`NetsumError::Truncated`].
pub async fn read_fully<R>(reader: &mut R, buffer: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buffer).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(NetsumError::Truncated {
            expected: buffer.len(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Write `data[offset..offset + length]` as one frame.
pub async fn write_frame<W>(writer: &mut W, data: &[u8], offset: usize, length: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    check_range(offset, length, data.len())?;
    let prefix = i32::try_from(length).map_err(|_| {
        NetsumError::InvalidArgument(format!("frame length {length} exceeds i32::MAX"))
    })?;

    let mut header = [0u8; LENGTH_PREFIX_LEN];
    encode_i32(prefix, &mut header, 0);
    write_fully(writer, &header).await?;
    write_fully(writer, &data[offset..offset + length]).await
}

/// Read a frame's length prefix, leaving the payload unread.
///
/// An end of stream before the first prefix byte is
/// [`NetsumError::ConnectionClosed`]; one inside the prefix is
/// [`NetsumError::Truncated`].
pub async fn read_frame_header<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_PREFIX_LEN];
    if reader.read(&mut header[..1]).await? == 0 {
        return Err(NetsumError::ConnectionClosed);
    }
    read_fully(reader, &mut header[1..]).await.map_err(|e| match e {
        NetsumError::Truncated { .. } => NetsumError::Truncated {
            expected: LENGTH_PREFIX_LEN,
        },
        other => other,
    })?;
    let length = decode_i32(&header, 0);
    usize::try_from(length).map_err(|_| NetsumError::ProtocolViolation(length))
}

/// Read one frame into the start of `buffer`, returning the payload length.
///
/// Bytes following the frame are left in the stream.
pub async fn read_frame<R>(reader: &mut R, buffer: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let length = read_frame_header(reader).await?;
    if length > buffer.len() {
        return Err(NetsumError::FrameTooLarge {
            length,
            capacity: buffer.len(),
        });
    }
    read_fully(reader, &mut buffer[..length]).await?;
    Ok(length)
}
