use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GridError>;

/// Errors surfaced by the wire layer and the circuit engine.
///
/// Inbound parse errors are handled at the per-datagram boundary (logged, datagram
///  dropped), so most of these only reach callers on the encode / send path.
#[derive(Error, Debug)]
pub enum GridError {
    /// wire parse failed: unknown message id, truncated block, zero-coding violation,
    ///  or an OSD document that does not conform to its format
    #[error("malformed wire data: {0}")]
    Malformed(String),

    /// a byte-aligned bit-packer operation was invoked while the bit cursor was mid-byte
    #[error("bit packer is not on a byte boundary")]
    Misaligned,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// operation requires a circuit in `Connected` state
    #[error("circuit is not connected")]
    NotConnected,

    /// a fixed or variable field was handed more data than its wire representation can carry
    #[error("field {field} overflows its wire capacity: {len} > {max}")]
    CapacityExceeded {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GridError {
    pub fn malformed(msg: impl Into<String>) -> GridError {
        GridError::Malformed(msg.into())
    }
}

impl From<bytes::TryGetError> for GridError {
    fn from(e: bytes::TryGetError) -> Self {
        GridError::Malformed(format!(
            "truncated buffer: needed {} more bytes, {} available",
            e.requested, e.available
        ))
    }
}
