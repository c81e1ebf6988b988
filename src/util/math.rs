//! Alignment helpers and the packed 3x4 transform used by device records.

pub use glam::{Affine3A, Mat3, Mat4, Vec3, Vec4};

use bytemuck::{Pod, Zeroable};

/// Round `value` up to a multiple of `alignment` (alignment 0 is treated as 1).
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Texel count of a `width` x `height` image, `None` if it overflows `usize`.
#[inline]
pub fn pixel_count(width: u32, height: u32) -> Option<usize> {
    (width as usize).checked_mul(height as usize)
}

/// Row-major 3x4 affine transform, the layout acceleration structure
/// instances and instance records use (48 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Transform3x4 {
    pub rows: [[f32; 4]; 3],
}

impl Transform3x4 {
    pub const IDENTITY: Self = Self {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Drop the projective row of a column-major glam matrix.
    pub fn from_mat4(m: &Mat4) -> Self {
        let t = m.transpose();
        Self {
            rows: [t.x_axis.to_array(), t.y_axis.to_array(), t.z_axis.to_array()],
        }
    }

    pub fn from_affine(a: &Affine3A) -> Self {
        Self::from_mat4(&Mat4::from(*a))
    }

    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&[
            self.rows[0],
            self.rows[1],
            self.rows[2],
            [0.0, 0.0, 0.0, 1.0],
        ])
        .transpose()
    }

    pub fn to_affine(&self) -> Affine3A {
        Affine3A::from_mat4(self.to_mat4())
    }

    #[inline]
    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        let r = &self.rows;
        Vec3::new(
            r[0][0] * p.x + r[0][1] * p.y + r[0][2] * p.z + r[0][3],
            r[1][0] * p.x + r[1][1] * p.y + r[1][2] * p.z + r[1][3],
            r[2][0] * p.x + r[2][1] * p.y + r[2][2] * p.z + r[2][3],
        )
    }

    #[inline]
    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        let r = &self.rows;
        Vec3::new(
            r[0][0] * v.x + r[0][1] * v.y + r[0][2] * v.z,
            r[1][0] * v.x + r[1][1] * v.y + r[1][2] * v.z,
            r[2][0] * v.x + r[2][1] * v.y + r[2][2] * v.z,
        )
    }

    /// Composition `self * rhs` (apply `rhs` first).
    pub fn mul(&self, rhs: &Self) -> Self {
        Self::from_mat4(&(self.to_mat4() * rhs.to_mat4()))
    }

    /// Inverse, or `None` for a singular matrix.
    pub fn inverse(&self) -> Option<Self> {
        let m = self.to_mat4();
        let det = m.determinant();
        if det.abs() < 1e-12 || !det.is_finite() {
            return None;
        }
        Some(Self::from_mat4(&m.inverse()))
    }

    /// Normal matrix (inverse transpose of the linear part), zero translation.
    pub fn normal_matrix(&self) -> Self {
        let linear = Mat3::from_mat4(self.to_mat4());
        let n = if linear.determinant().abs() < 1e-12 {
            Mat3::IDENTITY
        } else {
            linear.inverse().transpose()
        };
        Self::from_mat4(&Mat4::from_mat3(n))
    }
}

impl Default for Transform3x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<Mat4> for Transform3x4 {
    fn from(m: Mat4) -> Self {
        Self::from_mat4(&m)
    }
}
