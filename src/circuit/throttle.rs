//! The seven-channel bandwidth schedule advertised to the simulator.
//!
//! The wire form is 28 bytes: seven little-endian f32 byte/sec rates in the order
//!  resend, land, wind, cloud, task, texture, asset. The engine does not police
//!  inbound rates (the simulator does); outbound retransmissions are capped at the
//!  resend channel.

use bytes::{Buf, BufMut};

use crate::error::{GridError, Result};

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ThrottleRates {
    pub resend: f32,
    pub land: f32,
    pub wind: f32,
    pub cloud: f32,
    pub task: f32,
    pub texture: f32,
    pub asset: f32,
}

/// per-channel `[min, max]` bytes/sec, applied by the channel setters
const CLAMPS: [(f32, f32); 7] = [
    (10_000.0, 150_000.0), // resend
    (0.0, 170_000.0),      // land
    (0.0, 34_000.0),       // wind
    (0.0, 34_000.0),       // cloud
    (4_000.0, 446_000.0),  // task
    (4_000.0, 446_000.0),  // texture
    (10_000.0, 220_000.0), // asset
];

impl ThrottleRates {
    pub const DEFAULT_TOTAL: f32 = 1_536_000.0;

    pub const WIRE_LEN: usize = 28;

    /// Split a total rate across the channels by the standard fractions. The
    ///  split happens in f64 so the default total produces the well-known channel
    ///  values exactly; clamping only happens when a channel is set explicitly.
    pub fn from_total(total: f32) -> ThrottleRates {
        let total = total as f64;
        ThrottleRates {
            resend: (total * 0.1) as f32,
            land: (total * 0.52 / 3.0) as f32,
            wind: (total * 0.05) as f32,
            cloud: (total * 0.05) as f32,
            task: (total * 0.704 / 3.0) as f32,
            texture: (total * 0.704 / 3.0) as f32,
            asset: (total * 0.484 / 3.0) as f32,
        }
    }

    pub fn total(&self) -> f32 {
        self.resend + self.land + self.wind + self.cloud + self.task + self.texture + self.asset
    }

    /// every channel forced into its advertised `[min, max]` range
    pub fn clamped(&self) -> ThrottleRates {
        let c = |value: f32, idx: usize| value.clamp(CLAMPS[idx].0, CLAMPS[idx].1);
        ThrottleRates {
            resend: c(self.resend, 0),
            land: c(self.land, 1),
            wind: c(self.wind, 2),
            cloud: c(self.cloud, 3),
            task: c(self.task, 4),
            texture: c(self.texture, 5),
            asset: c(self.asset, 6),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        let mut slice = &mut buf[..];
        slice.put_f32_le(self.resend);
        slice.put_f32_le(self.land);
        slice.put_f32_le(self.wind);
        slice.put_f32_le(self.cloud);
        slice.put_f32_le(self.task);
        slice.put_f32_le(self.texture);
        slice.put_f32_le(self.asset);
        buf
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<ThrottleRates> {
        if data.len() < Self::WIRE_LEN {
            return Err(GridError::malformed("throttle vector shorter than 28 bytes"));
        }
        Ok(ThrottleRates {
            resend: data.get_f32_le(),
            land: data.get_f32_le(),
            wind: data.get_f32_le(),
            cloud: data.get_f32_le(),
            task: data.get_f32_le(),
            texture: data.get_f32_le(),
            asset: data.get_f32_le(),
        })
    }
}

impl Default for ThrottleRates {
    fn default() -> ThrottleRates {
        ThrottleRates::from_total(Self::DEFAULT_TOTAL)
    }
}
