//! Per-datagram header and the appended-ack tail.
//!
//! Layout on the wire:
//! ```ascii
//! 0:  flags (u8): 0x80 zerocoded, 0x40 reliable, 0x20 resent, 0x10 appended-acks
//! 1:  sequence number (u32 BE)
//! 5:  extra-bytes length e (u8), followed by e bytes of opaque extra header data
//! *:  message id (1, 2 or 4 bytes depending on frequency class)
//! *:  payload, zero-coded iff the 0x80 flag is set
//! ```
//! When the appended-acks flag is set, the datagram ends with `4n` bytes of
//!  big-endian u32 acks followed by a one-byte ack count `n`. The ack tail is
//!  never zero-coded.

use bytes::{Buf, BufMut};

use crate::error::{GridError, Result};

pub const FLAG_ZEROCODED: u8 = 0x80;
pub const FLAG_RELIABLE: u8 = 0x40;
pub const FLAG_RESENT: u8 = 0x20;
pub const FLAG_APPENDED_ACKS: u8 = 0x10;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub zerocoded: bool,
    pub reliable: bool,
    pub resent: bool,
    pub appended_acks: bool,
    pub sequence: u32,
    pub extra: Vec<u8>,
}

impl FrameHeader {
    pub fn new(sequence: u32) -> FrameHeader {
        FrameHeader {
            zerocoded: false,
            reliable: false,
            resent: false,
            appended_acks: false,
            sequence,
            extra: Vec::new(),
        }
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.zerocoded {
            flags |= FLAG_ZEROCODED;
        }
        if self.reliable {
            flags |= FLAG_RELIABLE;
        }
        if self.resent {
            flags |= FLAG_RESENT;
        }
        if self.appended_acks {
            flags |= FLAG_APPENDED_ACKS;
        }
        flags
    }

    pub fn serialized_len(&self) -> usize {
        1 + 4 + 1 + self.extra.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags());
        buf.put_u32(self.sequence);
        buf.put_u8(self.extra.len() as u8);
        buf.put_slice(&self.extra);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<FrameHeader> {
        let flags = buf.try_get_u8()?;
        let sequence = buf.try_get_u32()?;
        let extra_len = buf.try_get_u8()? as usize;
        if buf.remaining() < extra_len {
            return Err(GridError::malformed("truncated extra header bytes"));
        }
        let mut extra = vec![0u8; extra_len];
        buf.copy_to_slice(&mut extra);

        Ok(FrameHeader {
            zerocoded: flags & FLAG_ZEROCODED != 0,
            reliable: flags & FLAG_RELIABLE != 0,
            resent: flags & FLAG_RESENT != 0,
            appended_acks: flags & FLAG_APPENDED_ACKS != 0,
            sequence,
            extra,
        })
    }
}

/// Split the appended-ack tail off a full datagram, returning the datagram without
///  the tail plus the acked sequence numbers in wire order.
///
/// The caller has already checked the appended-acks flag; a datagram too short for
///  its declared ack count is malformed.
pub fn split_appended_acks(datagram: &[u8]) -> Result<(&[u8], Vec<u32>)> {
    let Some((&count, _)) = datagram.split_last() else {
        return Err(GridError::malformed("empty datagram with appended-acks flag"));
    };
    let tail_len = 1 + 4 * count as usize;
    if datagram.len() < tail_len {
        return Err(GridError::malformed("datagram shorter than its ack tail"));
    }

    let (rest, tail) = datagram.split_at(datagram.len() - tail_len);
    let mut acks = Vec::with_capacity(count as usize);
    let mut tail = &tail[..tail.len() - 1];
    while tail.has_remaining() {
        acks.push(tail.get_u32());
    }
    Ok((rest, acks))
}

/// Append up to `max_count` acks to an outgoing datagram: `4n` big-endian u32 values
///  followed by the count byte. Returns the number of acks actually written; the
///  caller sets the appended-acks flag iff this is non-zero.
pub fn append_acks(buf: &mut Vec<u8>, acks: &[u32], max_count: usize) -> usize {
    let count = acks.len().min(max_count).min(u8::MAX as usize);
    if count == 0 {
        return 0;
    }
    for &ack in &acks[..count] {
        buf.put_u32(ack);
    }
    buf.put_u8(count as u8);
    count
}
