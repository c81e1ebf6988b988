//! Device-visible record layouts.
//!
//! These structs are the binary agreement between the CPU side and the
//! programs that run on the device. Device code indexes every table by
//! `WIRE_SIZE`, so a layout change here must be mirrored there; the stride
//! check in [`BlockAllocator::new`](crate::alloc::BlockAllocator::new) and the
//! size tests below catch the CPU half of such a change.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use surface_params::{MaterialType, SurfaceParams};

use crate::device::DeviceAddress;
use crate::util::Transform3x4;

/// Fixed-size record stored in a block allocator.
pub trait GpuRecord: Pod {
    /// Name used in diagnostics and buffer labels.
    const NAME: &'static str;
    /// Byte stride the device programs index by.
    const WIRE_SIZE: usize;
}

/// Per-material record (80 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MaterialRecord {
    pub surface: SurfaceParams,
    /// [`MaterialType`] ordinal
    pub material_type: u32,
    pub flags: u32,
    pub _pad: [u32; 2],
}

impl MaterialRecord {
    pub fn new(ty: MaterialType, surface: SurfaceParams) -> Self {
        Self {
            surface,
            material_type: ty.ordinal(),
            flags: 0,
            _pad: [0; 2],
        }
    }

    pub fn material_type(&self) -> Option<MaterialType> {
        MaterialType::from_ordinal(self.material_type)
    }
}

impl GpuRecord for MaterialRecord {
    const NAME: &'static str = "MaterialRecord";
    const WIRE_SIZE: usize = 80;
}

/// Per-instance record (128 bytes), found through the top-level instance's
/// custom index.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    pub object_to_world: Transform3x4,
    /// Maps mesh-space normals to world space (includes the mesh's local transform)
    pub normal_to_world: Transform3x4,
    pub vertex_address: u64,
    pub index_address: u64,
    /// Slot in the material table
    pub material_index: u32,
    pub material_type: u32,
    pub vertex_stride: u32,
    pub _pad: u32,
}

impl InstanceRecord {
    pub fn new(
        world: &Mat4,
        local: &Transform3x4,
        vertex_address: DeviceAddress,
        index_address: DeviceAddress,
        vertex_stride: u32,
        material_index: u32,
        material_type: MaterialType,
    ) -> Self {
        let object_to_world = Transform3x4::from_mat4(world);
        let normal_to_world = object_to_world.mul(local).normal_matrix();
        Self {
            object_to_world,
            normal_to_world,
            vertex_address: vertex_address.0,
            index_address: index_address.0,
            material_index,
            material_type: material_type.ordinal(),
            vertex_stride,
            _pad: 0,
        }
    }
}

impl GpuRecord for InstanceRecord {
    const NAME: &'static str = "InstanceRecord";
    const WIRE_SIZE: usize = 128;
}

/// Light kinds understood by the device programs.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LightKind {
    Point = 0,
    Directional = 1,
}

/// Light record (64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct LightRecord {
    /// xyz = position (point) or direction towards the light (directional)
    pub position_or_direction: [f32; 4],
    /// rgb = color, a = intensity
    pub color_intensity: [f32; 4],
    pub kind: u32,
    pub _pad: [u32; 3],
    pub _reserved: [f32; 4],
}

impl LightRecord {
    pub fn point(position: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            position_or_direction: position.extend(1.0).to_array(),
            color_intensity: color.extend(intensity).to_array(),
            kind: LightKind::Point as u32,
            _pad: [0; 3],
            _reserved: [0.0; 4],
        }
    }

    pub fn directional(direction_to_light: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            position_or_direction: direction_to_light.normalize_or_zero().extend(0.0).to_array(),
            color_intensity: color.extend(intensity).to_array(),
            kind: LightKind::Directional as u32,
            _pad: [0; 3],
            _reserved: [0.0; 4],
        }
    }

    pub fn kind(&self) -> Option<LightKind> {
        match self.kind {
            0 => Some(LightKind::Point),
            1 => Some(LightKind::Directional),
            _ => None,
        }
    }

    pub fn radiance(&self) -> Vec3 {
        let c = self.color_intensity;
        Vec3::new(c[0], c[1], c[2]) * c[3]
    }
}

impl GpuRecord for LightRecord {
    const NAME: &'static str = "LightRecord";
    const WIRE_SIZE: usize = 64;
}

/// Per-batch state, rewritten before every batch dispatch (16 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BatchState {
    pub batch_index: u32,
    pub samples_this_batch: u32,
    pub total_batches: u32,
    pub max_depth: u32,
}

impl BatchState {
    /// Samples accumulated before this batch.
    #[inline]
    pub fn samples_before(&self) -> u32 {
        self.batch_index * self.samples_this_batch
    }
}

/// Auxiliary outputs requested from the ray generation program.
pub mod frame_flags {
    pub const WRITE_ALBEDO: u32 = 1 << 0;
    pub const WRITE_NORMAL: u32 = 1 << 1;
}

/// Per-render constants (176 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FrameConstants {
    /// World from view
    pub inv_view: [[f32; 4]; 4],
    /// View from clip
    pub inv_proj: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    /// rgb = background radiance seen by missed rays
    pub background: [f32; 4],
    pub light_count: u32,
    pub flags: u32,
    pub frame_index: u32,
    pub seed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_sizes() {
        assert_eq!(std::mem::size_of::<MaterialRecord>(), MaterialRecord::WIRE_SIZE);
        assert_eq!(std::mem::size_of::<InstanceRecord>(), InstanceRecord::WIRE_SIZE);
        assert_eq!(std::mem::size_of::<LightRecord>(), LightRecord::WIRE_SIZE);
        assert_eq!(std::mem::size_of::<BatchState>(), 16);
        assert_eq!(std::mem::size_of::<FrameConstants>(), 176);
    }

    #[test]
    fn test_material_type_roundtrip() {
        let rec = MaterialRecord::new(MaterialType::Dielectric, SurfaceParams::default());
        assert_eq!(rec.material_type(), Some(MaterialType::Dielectric));
    }

    #[test]
    fn test_light_radiance() {
        let l = LightRecord::point(Vec3::new(0.0, 2.0, 0.0), Vec3::new(1.0, 0.5, 0.25), 4.0);
        assert_eq!(l.kind(), Some(LightKind::Point));
        assert_eq!(l.radiance(), Vec3::new(4.0, 2.0, 1.0));
    }

    #[test]
    fn test_instance_normal_matrix_includes_local() {
        let world = Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0));
        let local = Transform3x4::IDENTITY;
        let rec = InstanceRecord::new(
            &world,
            &local,
            DeviceAddress(1),
            DeviceAddress(2),
            32,
            0,
            MaterialType::Lambert,
        );
        // Inverse transpose of a non-uniform scale shrinks the scaled axis
        let n = rec.normal_to_world.transform_vector(Vec3::X);
        assert!((n.x - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_samples_before() {
        let b = BatchState {
            batch_index: 3,
            samples_this_batch: 64,
            total_batches: 4,
            max_depth: 2,
        };
        assert_eq!(b.samples_before(), 192);
    }
}
