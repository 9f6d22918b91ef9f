//! The datagram-level wire layer: primitive field codec, per-datagram header with
//!  appended acks, and the zero-coder.

pub mod codec;
pub mod header;
pub mod zerocode;

/// application-level maximum transmission unit, in payload bytes
pub const MTU: usize = 1200;
