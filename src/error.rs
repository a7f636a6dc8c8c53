//! Error types shared by the codecs, the client and the server.

use thiserror::Error;

/// Errors raised while exchanging or verifying packets.
#[derive(Debug, Error)]
pub enum NetsumError {
    /// A caller-supplied size violates a precondition.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A buffer region does not fit in the buffer.
    #[error("Invalid range: offset {offset}, length {length}, buffer {capacity}")]
    InvalidRange {
        offset: usize,
        length: usize,
        capacity: usize,
    },

    /// The peer sent a frame with a negative length prefix.
    #[error("Protocol violation: negative length: {0}")]
    ProtocolViolation(i32),

    /// The peer declared a frame larger than the receive buffer.
    #[error("Frame of {length} bytes does not fit in a {capacity} byte buffer")]
    FrameTooLarge { length: usize, capacity: usize },

    /// The peer closed the stream on a frame boundary.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The stream ended before the expected number of bytes arrived.
    #[error("Stream truncated: expected {expected} bytes")]
    Truncated { expected: usize },

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The content hash does not match the packet header.
    #[error(
        "Checksum failed: readHash: {}, computedHash: {}, full packet: {packet}",
        signed(.expected),
        signed(.computed)
    )]
    ChecksumMismatch {
        expected: u64,
        computed: u64,
        packet: String,
    },

    /// The echoed frame has a different length than the request.
    #[error("Lengths off: sent {expected} bytes, received {actual}")]
    ResponseLengthMismatch { expected: usize, actual: usize },

    /// The echoed bytes are not the reversal of the request.
    #[error("Malformed response at position {position}\nSent: {sent}\nRecv: {received}")]
    MalformedResponse {
        position: usize,
        sent: String,
        received: String,
    },

    /// The server refused to start a handler for an accepted connection.
    #[error("Connection handler rejected: server is shutting down")]
    HandlerRejected,

    /// A worker task panicked or was cancelled.
    #[error("Worker failed: {0}")]
    WorkerPanicked(#[from] tokio::task::JoinError),

    /// The client wait was interrupted.
    #[error("Interrupted")]
    Interrupted,

    /// The throughput counter produced a non-finite rate.
    #[error("Rate unavailable: {0}")]
    RateUnavailable(f64),
}

/// Hashes are reported as signed 64-bit values.
fn signed(hash: &u64) -> i64 {
    *hash as i64
}

/// Result type alias using NetsumError.
pub type Result<T> = std::result::Result<T, NetsumError>;
