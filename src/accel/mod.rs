//! Acceleration structures.
//!
//! Two levels, as on ray tracing hardware:
//! - [`BottomLevelStructure`] - triangles of one mesh, built once per mesh
//! - [`TopLevelStructure`] - instances of bottom-level structures, rebuilt
//!   from scratch for every render
//!
//! Both own their device memory and release it on drop.

mod builder;

pub use builder::{AccelerationStructureBuilder, DEFAULT_BUILD_TIMEOUT};

use std::sync::{Arc, Weak};

use glam::Mat4;

use crate::device::{AccelHandle, DeviceAddress, DeviceBuffer, DeviceRef};
use crate::util::Transform3x4;

/// Indexed triangle mesh already resident on the device.
#[derive(Clone, Copy, Debug)]
pub struct BottomLevelInput {
    pub vertex_address: DeviceAddress,
    /// Byte stride between vertices; the position is the first 12 bytes
    pub vertex_stride: u32,
    pub vertex_count: u32,
    /// `u32` indices, three per triangle
    pub index_address: DeviceAddress,
    pub triangle_count: u32,
    /// Static mesh-local transform baked into the structure
    pub transform: Transform3x4,
}

/// Built bottom-level structure. Immutable.
pub struct BottomLevelStructure {
    device: DeviceRef,
    handle: AccelHandle,
    address: DeviceAddress,
    triangle_count: u32,
    // Released after the structure itself
    _storage: DeviceBuffer,
}

impl BottomLevelStructure {
    pub fn handle(&self) -> AccelHandle {
        self.handle
    }

    /// Address top-level instances reference.
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }
}

impl Drop for BottomLevelStructure {
    fn drop(&mut self) {
        self.device.destroy_accel(self.handle);
    }
}

impl std::fmt::Debug for BottomLevelStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BottomLevelStructure")
            .field("handle", &self.handle)
            .field("triangles", &self.triangle_count)
            .finish()
    }
}

/// One placement of a bottom-level structure in the top level.
#[derive(Clone, Debug)]
pub struct Instance {
    /// Not owned; a dropped structure fails the top-level build
    pub blas: Weak<BottomLevelStructure>,
    pub transform: Mat4,
    /// Visible to hit programs; selects the instance record (24 bits)
    pub custom_index: u32,
    pub mask: u8,
    /// First hit-group record for this instance (24 bits)
    pub dispatch_offset: u32,
}

impl Instance {
    pub fn new(blas: &Arc<BottomLevelStructure>, transform: Mat4, custom_index: u32, dispatch_offset: u32) -> Self {
        Self {
            blas: Arc::downgrade(blas),
            transform,
            custom_index,
            mask: 0xff,
            dispatch_offset,
        }
    }
}

/// Built top-level structure, bound to trace dispatches.
pub struct TopLevelStructure {
    device: DeviceRef,
    handle: AccelHandle,
    instance_count: u32,
    _storage: DeviceBuffer,
    _instances: DeviceBuffer,
    /// Bottom levels referenced by this build stay alive with it
    referenced: Vec<Arc<BottomLevelStructure>>,
}

impl TopLevelStructure {
    pub fn handle(&self) -> AccelHandle {
        self.handle
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Distinct bottom levels the instances point at.
    pub fn bottom_level_count(&self) -> usize {
        self.referenced.len()
    }
}

impl Drop for TopLevelStructure {
    fn drop(&mut self) {
        self.device.destroy_accel(self.handle);
    }
}

impl std::fmt::Debug for TopLevelStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopLevelStructure")
            .field("handle", &self.handle)
            .field("instances", &self.instance_count)
            .finish()
    }
}
