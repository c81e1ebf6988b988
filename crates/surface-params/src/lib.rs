//! Material type tags and parameter blocks for the rtcore path tracer.
//!
//! A material is a [`MaterialType`] tag plus one [`SurfaceParams`] block.
//! The tag decides which hit program runs for the material; its ordinal is
//! part of the dispatch table layout, so the declaration order of
//! [`MaterialType`] is a wire-format decision.
//!
//! ## Usage
//!
//! ```ignore
//! use surface_params::{MaterialType, SurfaceParams};
//!
//! let gold = SurfaceParams::metal(Vec3::new(1.0, 0.8, 0.3), 0.3);
//! let ty = MaterialType::Metal;
//! assert_eq!(ty.ordinal(), 1);
//! ```

mod params;

pub use params::SurfaceParams;

use serde::{Deserialize, Serialize};

/// Material type tag.
///
/// Ordinals are dense and start at zero. Adding a type appends it; reordering
/// changes every hit-group offset.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterialType {
    Lambert = 0,
    Metal = 1,
    Dielectric = 2,
    Emissive = 3,
}

impl MaterialType {
    /// All types in ordinal order.
    pub const ALL: [MaterialType; 4] = [
        MaterialType::Lambert,
        MaterialType::Metal,
        MaterialType::Dielectric,
        MaterialType::Emissive,
    ];

    /// Number of material types.
    pub const COUNT: usize = Self::ALL.len();

    #[inline]
    pub const fn ordinal(self) -> u32 {
        self as u32
    }

    /// Inverse of [`ordinal`](Self::ordinal).
    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            MaterialType::Lambert => "lambert",
            MaterialType::Metal => "metal",
            MaterialType::Dielectric => "dielectric",
            MaterialType::Emissive => "emissive",
        }
    }
}

impl std::fmt::Display for MaterialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_params_size() {
        // 4 Vec4s = 64 bytes (material records index by this size)
        assert_eq!(std::mem::size_of::<SurfaceParams>(), 64);
    }

    #[test]
    fn test_params_alignment() {
        assert_eq!(std::mem::align_of::<SurfaceParams>(), 16);
    }

    #[test]
    fn test_params_pod() {
        let params = SurfaceParams::default();
        let bytes = bytemuck::bytes_of(&params);
        assert_eq!(bytes.len(), 64);
    }

    #[test]
    fn test_ordinals_dense() {
        for (i, ty) in MaterialType::ALL.iter().enumerate() {
            assert_eq!(ty.ordinal() as usize, i);
            assert_eq!(MaterialType::from_ordinal(i as u32), Some(*ty));
        }
        assert_eq!(MaterialType::from_ordinal(MaterialType::COUNT as u32), None);
    }

    #[test]
    fn test_lambert() {
        let p = SurfaceParams::lambert(Vec3::new(0.5, 0.25, 1.0));
        assert_eq!(p.albedo(), Vec3::new(0.5, 0.25, 1.0));
        assert_eq!(p.emission(), Vec3::ZERO);
    }

    #[test]
    fn test_emissive() {
        let p = SurfaceParams::emissive(Vec3::ONE, 4.0);
        assert_eq!(p.emission(), Vec3::splat(4.0));
        assert_eq!(p.albedo(), Vec3::ZERO);
    }

    #[test]
    fn test_metal_clamps_roughness() {
        let p = SurfaceParams::metal(Vec3::ONE, 2.0);
        assert_eq!(p.roughness(), 1.0);
        assert_eq!(p.params.y, 1.0);
    }

    #[test]
    fn test_serde_name() {
        assert_eq!(MaterialType::Dielectric.to_string(), "dielectric");
    }
}
