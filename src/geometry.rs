//! Rotation helpers for the pose annotations.
//!
//! LINEMOD stores `cam_R_m2c` as a row-major 3x3 matrix. Quaternions are
//! emitted scalar first, `(w, x, y, z)`, with `w >= 0`.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};

/// Tolerance used by [`check_rotation`] for both the determinant and the
/// orthogonality residual. Ground-truth files carry ~7 significant digits.
pub const ROTATION_TOLERANCE: f64 = 1e-3;

/// Unit quaternion, scalar part first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.w, self.x, self.y, self.z]
    }

    /// Round every component to `decimals` places (the consolidated dump uses 8).
    pub fn rounded(&self, decimals: i32) -> Self {
        let scale = 10f64.powi(decimals);
        let round = |v: f64| {
            let r = (v * scale).round() / scale;
            // avoid printing "-0"
            if r == 0.0 {
                0.0
            } else {
                r
            }
        };
        Self {
            w: round(self.w),
            x: round(self.x),
            y: round(self.y),
            z: round(self.z),
        }
    }
}

/// Build a matrix from the nine row-major values stored in `cam_R_m2c`.
pub fn matrix_from_row_major(values: &[f64; 9]) -> Matrix3<f64> {
    Matrix3::from_row_slice(values)
}

/// Check that `m` is a proper rotation: `det(m) ≈ +1` and `mᵀm ≈ I`.
pub fn check_rotation(m: &Matrix3<f64>) -> Result<()> {
    let det = m.determinant();
    let orthogonality_error = (m.transpose() * m - Matrix3::identity()).amax();
    if (det - 1.0).abs() > ROTATION_TOLERANCE || orthogonality_error > ROTATION_TOLERANCE {
        return Err(DatasetError::InvalidRotation {
            det,
            orthogonality_error,
        });
    }
    Ok(())
}

/// Convert a rotation matrix to a unit quaternion `(w, x, y, z)`.
///
/// `q` and `-q` are the same rotation; the sign is fixed so that `w > 0`, or
/// for half turns (`w == 0`) so that the first non-zero of `x, y, z` is
/// positive.
///
/// The matrix is not re-orthonormalized. For inputs rejected by
/// [`check_rotation`] the result is whatever the decomposition yields and
/// must not be relied upon.
pub fn rotation_to_quaternion(m: &Matrix3<f64>) -> Quaternion {
    let rotation = Rotation3::from_matrix_unchecked(*m);
    let q = UnitQuaternion::from_rotation_matrix(&rotation);
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    let leading = if w != 0.0 {
        w
    } else {
        [x, y, z].into_iter().find(|v| *v != 0.0).unwrap_or(0.0)
    };
    if leading < 0.0 {
        Quaternion {
            w: -w,
            x: -x,
            y: -y,
            z: -z,
        }
    } else {
        Quaternion { w, x, y, z }
    }
}
