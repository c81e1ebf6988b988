//! Surface parameter blocks
//!
//! Every material, whatever its type, stores the same 64-byte block so the
//! material table can be indexed with a single stride. How the fields are
//! interpreted depends on the [`MaterialType`](crate::MaterialType) the
//! material is tagged with.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

/// Surface parameters shared by all material types.
///
/// Uses vec4 packing for GPU alignment:
/// - Colors use rgb, the alpha lane carries a weight or intensity
/// - Scalar params packed into vec4
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SurfaceParams {
    /// Base color (rgb) and weight (a)
    pub base_color_weight: Vec4,
    /// Emission color (rgb) and intensity (a)
    pub emission_color_intensity: Vec4,
    /// Packed params: x=roughness, y=metalness, z=IOR, w=opacity
    pub params: Vec4,
    /// Reserved for per-type extensions, zero for the built-in types
    pub extra: Vec4,
}

impl Default for SurfaceParams {
    fn default() -> Self {
        Self {
            base_color_weight: Vec4::new(0.8, 0.8, 0.8, 1.0),
            emission_color_intensity: Vec4::new(1.0, 1.0, 1.0, 0.0),
            // x=roughness, y=metalness, z=IOR, w=opacity
            params: Vec4::new(1.0, 0.0, 1.5, 1.0),
            extra: Vec4::ZERO,
        }
    }
}

impl SurfaceParams {
    /// Create a simple diffuse material
    pub fn lambert(color: Vec3) -> Self {
        let mut p = Self::default();
        p.base_color_weight = color.extend(1.0);
        p
    }

    /// Create a metallic material
    pub fn metal(color: Vec3, roughness: f32) -> Self {
        let mut p = Self::default();
        p.base_color_weight = color.extend(1.0);
        p.params.x = roughness.clamp(0.0, 1.0);
        p.params.y = 1.0;
        p
    }

    /// Create a glass-like material
    pub fn glass(color: Vec3, ior: f32) -> Self {
        let mut p = Self::default();
        p.base_color_weight = color.extend(1.0);
        p.params.x = 0.0;
        p.params.z = ior.max(1.0);
        p
    }

    /// Create an emissive material
    pub fn emissive(color: Vec3, intensity: f32) -> Self {
        let mut p = Self::default();
        p.base_color_weight.w = 0.0;
        p.emission_color_intensity = color.extend(intensity);
        p
    }

    /// Set opacity
    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.params.w = opacity;
        self
    }

    /// Base color scaled by its weight.
    pub fn albedo(&self) -> Vec3 {
        self.base_color_weight.truncate() * self.base_color_weight.w
    }

    /// Emitted radiance (color * intensity).
    pub fn emission(&self) -> Vec3 {
        self.emission_color_intensity.truncate() * self.emission_color_intensity.w
    }

    pub fn roughness(&self) -> f32 {
        self.params.x
    }

    pub fn ior(&self) -> f32 {
        self.params.z
    }

    // Convenience setters

    /// Set base color
    pub fn set_base_color(&mut self, color: Vec3) {
        self.base_color_weight.x = color.x;
        self.base_color_weight.y = color.y;
        self.base_color_weight.z = color.z;
    }

    /// Set specular roughness
    pub fn set_roughness(&mut self, roughness: f32) {
        self.params.x = roughness;
    }
}
