use std::fmt::{Display, Formatter};

/// Single-precision vector, the workhorse of position / velocity / scale fields.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Vector3 {
        Vector3 { x, y, z }
    }
}

impl Display for Vector3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}, {}, {}>", self.x, self.y, self.z)
    }
}

/// Double-precision vector, used for global (grid-wide) positions.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Vector3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3d {
    pub const ZERO: Vector3d = Vector3d { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Vector3d {
        Vector3d { x, y, z }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Vector4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Vector4 {
    pub const ZERO: Vector4 = Vector4 { x: 0.0, y: 0.0, z: 0.0, w: 0.0 };

    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Vector4 {
        Vector4 { x, y, z, w }
    }
}

/// Rotation quaternion.
///
/// On the wire only X, Y and Z are carried; W is reconstructed from the unit-length
///  invariant as `+sqrt(max(0, 1 - x^2 - y^2 - z^2))`. The sign of W is never
///  re-derived - senders are expected to normalize so that W >= 0.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Quaternion {
        Quaternion { x, y, z, w }
    }

    /// reconstruct a quaternion from its packed X/Y/Z wire form
    pub fn from_packed_xyz(x: f32, y: f32, z: f32) -> Quaternion {
        let w_sq = 1.0 - x * x - y * y - z * z;
        Quaternion {
            x,
            y,
            z,
            w: w_sq.max(0.0).sqrt(),
        }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Quaternion::IDENTITY
    }
}

impl Display for Quaternion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}, {}, {}, {}>", self.x, self.y, self.z, self.w)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::identity(0.0, 0.0, 0.0, 1.0)]
    #[case::half(0.5, 0.5, 0.5, 0.5)]
    #[case::axis(1.0, 0.0, 0.0, 0.0)]
    fn test_quaternion_from_packed(#[case] x: f32, #[case] y: f32, #[case] z: f32, #[case] expected_w: f32) {
        let q = Quaternion::from_packed_xyz(x, y, z);
        assert!((q.w - expected_w).abs() < 1e-6);
    }

    #[test]
    fn test_quaternion_from_packed_clamps_negative_radicand() {
        // slightly over unit length due to rounding must not produce NaN
        let q = Quaternion::from_packed_xyz(0.8, 0.8, 0.8);
        assert_eq!(q.w, 0.0);
    }
}
