//! Primitive wire codec: endian-aware scalar I/O plus the protocol's composite
//!  field types (UUID, vectors, packed quaternions, length-prefixed byte fields).
//!
//! All integers are little-endian on the wire except `IPPort` (big-endian) and the
//!  sequence number in the datagram header (big-endian, handled in [`super::header`]).
//!  `IPAddr` is an opaque 4-byte field - it is never byte-swapped.

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::types::{Quaternion, Vector3, Vector3d, Vector4};

/// Failable reads for inbound parsing. Every method consumes from the buffer on
///  success and surfaces [`GridError::Malformed`] on truncation.
pub trait WireReadExt: Buf {
    fn try_uuid(&mut self) -> Result<Uuid> {
        if self.remaining() < 16 {
            return Err(GridError::malformed("truncated UUID field"));
        }
        let mut raw = [0u8; 16];
        self.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    fn try_vector3(&mut self) -> Result<Vector3> {
        Ok(Vector3::new(
            self.try_get_f32_le()?,
            self.try_get_f32_le()?,
            self.try_get_f32_le()?,
        ))
    }

    fn try_vector3d(&mut self) -> Result<Vector3d> {
        Ok(Vector3d::new(
            self.try_get_f64_le()?,
            self.try_get_f64_le()?,
            self.try_get_f64_le()?,
        ))
    }

    fn try_vector4(&mut self) -> Result<Vector4> {
        Ok(Vector4::new(
            self.try_get_f32_le()?,
            self.try_get_f32_le()?,
            self.try_get_f32_le()?,
            self.try_get_f32_le()?,
        ))
    }

    /// quaternions are carried as X/Y/Z only; W is reconstructed from unit length
    fn try_quaternion(&mut self) -> Result<Quaternion> {
        Ok(Quaternion::from_packed_xyz(
            self.try_get_f32_le()?,
            self.try_get_f32_le()?,
            self.try_get_f32_le()?,
        ))
    }

    /// 4 bytes, in the order the sending socket stack presented them
    fn try_ip_addr(&mut self) -> Result<[u8; 4]> {
        if self.remaining() < 4 {
            return Err(GridError::malformed("truncated IPAddr field"));
        }
        let mut raw = [0u8; 4];
        self.copy_to_slice(&mut raw);
        Ok(raw)
    }

    /// big-endian, unlike every other u16 on the wire
    fn try_ip_port(&mut self) -> Result<u16> {
        Ok(self.try_get_u16()?)
    }

    /// exactly `len` raw bytes
    fn try_fixed(&mut self, len: usize) -> Result<Vec<u8>> {
        if self.remaining() < len {
            return Err(GridError::malformed("truncated fixed field"));
        }
        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        Ok(raw)
    }

    /// variable field with a one-byte length prefix
    fn try_variable1(&mut self) -> Result<Vec<u8>> {
        let len = self.try_get_u8()? as usize;
        self.try_fixed(len)
    }

    /// variable field with a two-byte (little-endian) length prefix
    fn try_variable2(&mut self) -> Result<Vec<u8>> {
        let len = self.try_get_u16_le()? as usize;
        self.try_fixed(len)
    }
}

impl<B: Buf + ?Sized> WireReadExt for B {}

pub trait WireWriteExt: BufMut {
    fn put_uuid(&mut self, value: &Uuid) {
        self.put_slice(value.as_bytes());
    }

    fn put_vector3(&mut self, value: &Vector3) {
        self.put_f32_le(value.x);
        self.put_f32_le(value.y);
        self.put_f32_le(value.z);
    }

    fn put_vector3d(&mut self, value: &Vector3d) {
        self.put_f64_le(value.x);
        self.put_f64_le(value.y);
        self.put_f64_le(value.z);
    }

    fn put_vector4(&mut self, value: &Vector4) {
        self.put_f32_le(value.x);
        self.put_f32_le(value.y);
        self.put_f32_le(value.z);
        self.put_f32_le(value.w);
    }

    fn put_quaternion(&mut self, value: &Quaternion) {
        self.put_f32_le(value.x);
        self.put_f32_le(value.y);
        self.put_f32_le(value.z);
    }

    fn put_ip_addr(&mut self, value: &[u8; 4]) {
        self.put_slice(value);
    }

    fn put_ip_port(&mut self, value: u16) {
        self.put_u16(value);
    }

    fn put_variable1(&mut self, field: &'static str, data: &[u8]) -> Result<()> {
        if data.len() > u8::MAX as usize {
            return Err(GridError::CapacityExceeded {
                field,
                len: data.len(),
                max: u8::MAX as usize,
            });
        }
        self.put_u8(data.len() as u8);
        self.put_slice(data);
        Ok(())
    }

    fn put_variable2(&mut self, field: &'static str, data: &[u8]) -> Result<()> {
        if data.len() > u16::MAX as usize {
            return Err(GridError::CapacityExceeded {
                field,
                len: data.len(),
                max: u16::MAX as usize,
            });
        }
        self.put_u16_le(data.len() as u16);
        self.put_slice(data);
        Ok(())
    }

    fn put_fixed(&mut self, field: &'static str, len: usize, data: &[u8]) -> Result<()> {
        if data.len() != len {
            return Err(GridError::CapacityExceeded {
                field,
                len: data.len(),
                max: len,
            });
        }
        self.put_slice(data);
        Ok(())
    }
}

impl<B: BufMut + ?Sized> WireWriteExt for B {}
