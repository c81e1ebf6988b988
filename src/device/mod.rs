//! Device abstraction for ray tracing work.
//!
//! Everything the allocators, builders and the render loop ask of a GPU goes
//! through [`RayTracingDevice`]. The trait mirrors the explicit APIs (Vulkan
//! KHR ray tracing, DXR) closely enough that a hardware backend is a thin
//! translation layer:
//!
//! ```text
//! buffers + device addresses → accel size query / build → RT pipeline + group handles
//!                                                       → trace submit → fence wait → image copy
//! ```
//!
//! Calls return the device's raw [`DeviceStatus`] on failure; the typed
//! [`Error`](crate::Error) variants are chosen by the caller, which knows what
//! the call was for.
//!
//! [`host::HostDevice`] implements the trait on the CPU.

mod buffer;
pub mod host;

pub use buffer::DeviceBuffer;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use surface_params::MaterialType;

use crate::util::Transform3x4;

/// Raw device status code (Vulkan `VkResult` numbering).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceStatus(pub i32);

impl DeviceStatus {
    pub const SUCCESS: Self = Self(0);
    pub const NOT_READY: Self = Self(1);
    pub const TIMEOUT: Self = Self(2);
    pub const OUT_OF_HOST_MEMORY: Self = Self(-1);
    pub const OUT_OF_DEVICE_MEMORY: Self = Self(-2);
    pub const INITIALIZATION_FAILED: Self = Self(-3);
    pub const DEVICE_LOST: Self = Self(-4);
    pub const FEATURE_NOT_PRESENT: Self = Self(-8);
    pub const FORMAT_NOT_SUPPORTED: Self = Self(-11);
    pub const UNKNOWN: Self = Self(-13);
    pub const INVALID_DEVICE_ADDRESS: Self = Self(-1_000_257_000);

    pub fn name(self) -> &'static str {
        match self {
            Self::SUCCESS => "SUCCESS",
            Self::NOT_READY => "NOT_READY",
            Self::TIMEOUT => "TIMEOUT",
            Self::OUT_OF_HOST_MEMORY => "ERROR_OUT_OF_HOST_MEMORY",
            Self::OUT_OF_DEVICE_MEMORY => "ERROR_OUT_OF_DEVICE_MEMORY",
            Self::INITIALIZATION_FAILED => "ERROR_INITIALIZATION_FAILED",
            Self::DEVICE_LOST => "ERROR_DEVICE_LOST",
            Self::FEATURE_NOT_PRESENT => "ERROR_FEATURE_NOT_PRESENT",
            Self::FORMAT_NOT_SUPPORTED => "ERROR_FORMAT_NOT_SUPPORTED",
            Self::INVALID_DEVICE_ADDRESS => "ERROR_INVALID_DEVICE_ADDRESS",
            _ => "ERROR_UNKNOWN",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceStatus>;

/// GPU virtual address of a byte inside a buffer.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    pub const NULL: Self = Self(0);

    #[inline]
    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

macro_rules! device_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub $inner);
    };
}

device_id!(
    /// Buffer object.
    BufferId(u32)
);
device_id!(
    /// Acceleration structure object.
    AccelHandle(u32)
);
device_id!(
    /// Compiled ray tracing pipeline.
    PipelineHandle(u32)
);
device_id!(
    /// 2D storage image.
    ImageId(u32)
);
device_id!(
    /// Completion fence for one submission.
    FenceId(u64)
);

/// What a buffer is going to be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Shader-readable storage (records, constants)
    Storage,
    /// Vertex/index/instance input to an acceleration structure build
    AccelInput,
    /// Backing memory of an acceleration structure
    AccelStorage,
    /// Build scratch memory
    Scratch,
    /// Shader binding table region
    ShaderBindingTable,
    /// Host-readable copy destination
    Readback,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Storage image formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Rgba32Float,
    Rgba8Unorm,
}

impl ImageFormat {
    pub fn texel_size(self) -> u32 {
        match self {
            ImageFormat::Rgba32Float => 16,
            ImageFormat::Rgba8Unorm => 4,
        }
    }
}

/// Static device limits and feature bits.
#[derive(Clone, Debug)]
pub struct DeviceCapabilities {
    pub name: String,
    /// Ray tracing pipelines (raygen/miss/hit programs)
    pub ray_tracing_pipeline: bool,
    /// Bottom/top-level acceleration structures
    pub acceleration_structure: bool,
    pub max_ray_recursion_depth: u32,
    /// Size of one program-group identity handle in bytes
    pub shader_group_handle_size: u32,
    /// Stride alignment inside a table region
    pub shader_group_handle_alignment: u32,
    /// Start alignment of a table region
    pub shader_group_base_alignment: u32,
    pub min_storage_buffer_offset_alignment: u32,
    /// Row pitch alignment of image-to-buffer copies
    pub optimal_row_pitch_alignment: u32,
    pub storage_image_formats: Vec<ImageFormat>,
}

impl DeviceCapabilities {
    pub fn supports_storage_format(&self, format: ImageFormat) -> bool {
        self.storage_image_formats.contains(&format)
    }
}

/// Bottom or top level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelLevel {
    Bottom,
    Top,
}

/// Indexed triangle geometry for a bottom-level build.
///
/// Positions are three `f32` at the start of each vertex; indices are `u32`.
#[derive(Clone, Copy, Debug)]
pub struct TriangleGeometry {
    pub vertex_address: DeviceAddress,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    pub index_address: DeviceAddress,
    pub triangle_count: u32,
    /// Static transform baked into the structure
    pub transform: Transform3x4,
}

#[derive(Clone, Copy, Debug)]
pub enum AccelGeometry {
    Triangles(TriangleGeometry),
    /// Array of [`AccelInstance`] records
    Instances { address: DeviceAddress, count: u32 },
}

impl AccelGeometry {
    pub fn level(&self) -> AccelLevel {
        match self {
            AccelGeometry::Triangles(_) => AccelLevel::Bottom,
            AccelGeometry::Instances { .. } => AccelLevel::Top,
        }
    }
}

/// Memory the device needs for one build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccelBuildSizes {
    pub storage_size: u64,
    pub scratch_size: u64,
}

/// Device-side top-level instance (64 bytes, `VkAccelerationStructureInstanceKHR` layout).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct AccelInstance {
    pub transform: Transform3x4,
    /// Low 24 bits: custom index, high 8 bits: visibility mask
    pub custom_index_and_mask: u32,
    /// Low 24 bits: hit-group offset, high 8 bits: flags
    pub sbt_offset_and_flags: u32,
    /// Device address of the bottom-level structure
    pub blas_address: u64,
}

impl AccelInstance {
    pub const MAX_FIELD: u32 = (1 << 24) - 1;

    /// Pack fields; values above 24 bits are truncated, callers validate first.
    pub fn new(
        transform: Transform3x4,
        custom_index: u32,
        mask: u8,
        sbt_offset: u32,
        flags: u8,
        blas_address: DeviceAddress,
    ) -> Self {
        Self {
            transform,
            custom_index_and_mask: (custom_index & Self::MAX_FIELD) | ((mask as u32) << 24),
            sbt_offset_and_flags: (sbt_offset & Self::MAX_FIELD) | ((flags as u32) << 24),
            blas_address: blas_address.0,
        }
    }

    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & Self::MAX_FIELD
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    #[inline]
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & Self::MAX_FIELD
    }
}

/// Ray types traced by the path tracer. The ordinal is the hit-group
/// sub-index and the miss index.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RayType {
    /// Camera rays
    Primary = 0,
    /// Bounce rays
    Secondary = 1,
    /// Next-event estimation (shadow) rays
    NextEvent = 2,
}

impl RayType {
    pub const ALL: [RayType; 3] = [RayType::Primary, RayType::Secondary, RayType::NextEvent];
    pub const COUNT: usize = Self::ALL.len();

    #[inline]
    pub const fn ordinal(self) -> u32 {
        self as u32
    }
}

/// One program group of a ray tracing pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderGroup {
    RayGen,
    Miss(RayType),
    Hit { material: MaterialType, ray: RayType },
}

#[derive(Clone, Debug)]
pub struct RayTracingPipelineDesc {
    pub label: String,
    pub groups: Vec<ShaderGroup>,
    pub max_recursion_depth: u32,
}

/// One strided table region as passed to a trace call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtRegion {
    pub address: DeviceAddress,
    pub stride: u64,
    pub size: u64,
}

/// Resources bound to a trace dispatch.
#[derive(Clone, Copy, Debug)]
pub struct TraceBindings {
    /// [`FrameConstants`](crate::records::FrameConstants)
    pub frame_constants: DeviceAddress,
    /// [`BatchState`](crate::records::BatchState)
    pub batch_state: DeviceAddress,
    pub materials: DeviceAddress,
    pub instances: DeviceAddress,
    pub lights: DeviceAddress,
    /// `u32` slot indices into `lights`, `light_count` entries
    pub light_indices: DeviceAddress,
    pub radiance: ImageId,
    pub albedo: Option<ImageId>,
    pub normal: Option<ImageId>,
}

#[derive(Clone, Copy, Debug)]
pub struct TraceDispatch {
    pub pipeline: PipelineHandle,
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub tlas: AccelHandle,
    pub width: u32,
    pub height: u32,
    pub bindings: TraceBindings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

/// Linear layout of an image copied into a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageCopyLayout {
    /// Bytes between row starts, at least `width * texel_size`
    pub row_pitch: u64,
    pub rows: u32,
    /// Total bytes the destination buffer needs
    pub size: u64,
}

/// Device operations used by rtcore.
///
/// All submissions complete in order on a single queue. Fences are one-shot.
pub trait RayTracingDevice: Send + Sync {
    fn capabilities(&self) -> &DeviceCapabilities;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> DeviceResult<BufferId>;
    fn destroy_buffer(&self, buffer: BufferId);
    fn buffer_address(&self, buffer: BufferId) -> DeviceResult<DeviceAddress>;
    /// Queue-ordered write (visible to every later submission).
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()>;
    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> DeviceResult<Vec<u8>>;

    fn accel_build_sizes(&self, geometry: &AccelGeometry) -> DeviceResult<AccelBuildSizes>;
    fn create_accel(&self, level: AccelLevel, storage: BufferId, size: u64) -> DeviceResult<AccelHandle>;
    fn accel_address(&self, accel: AccelHandle) -> DeviceResult<DeviceAddress>;
    fn submit_accel_build(
        &self,
        accel: AccelHandle,
        geometry: &AccelGeometry,
        scratch: BufferId,
    ) -> DeviceResult<FenceId>;
    fn destroy_accel(&self, accel: AccelHandle);

    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc) -> DeviceResult<PipelineHandle>;
    /// Identity handles of `group_count` groups, tightly packed.
    fn shader_group_handles(
        &self,
        pipeline: PipelineHandle,
        first_group: u32,
        group_count: u32,
    ) -> DeviceResult<Vec<u8>>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    fn create_storage_image(&self, width: u32, height: u32, format: ImageFormat) -> DeviceResult<ImageId>;
    fn destroy_image(&self, image: ImageId);
    fn image_copy_layout(&self, image: ImageId) -> DeviceResult<ImageCopyLayout>;
    fn submit_image_copy(&self, image: ImageId, buffer: BufferId) -> DeviceResult<FenceId>;

    fn submit_trace(&self, dispatch: &TraceDispatch) -> DeviceResult<FenceId>;

    /// Block until `fence` signals or `timeout` elapses.
    fn wait_for_fence(&self, fence: FenceId, timeout: Duration) -> DeviceResult<FenceStatus>;
    fn wait_idle(&self) -> DeviceResult<()>;
}

/// Shared device handle.
pub type DeviceRef = Arc<dyn RayTracingDevice>;

/// Capability probe for callers deciding whether to offer path tracing.
pub fn is_hardware_ray_tracing_supported(device: &dyn RayTracingDevice) -> bool {
    let caps = device.capabilities();
    caps.ray_tracing_pipeline && caps.acceleration_structure
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_layout() {
        assert_eq!(std::mem::size_of::<AccelInstance>(), 64);
    }

    #[test]
    fn test_instance_packing() {
        let inst = AccelInstance::new(
            Transform3x4::IDENTITY,
            0x12_3456,
            0xff,
            9,
            0,
            DeviceAddress(0x1_0000_0000),
        );
        assert_eq!(inst.custom_index(), 0x12_3456);
        assert_eq!(inst.mask(), 0xff);
        assert_eq!(inst.sbt_offset(), 9);
        assert_eq!(inst.blas_address, 0x1_0000_0000);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DeviceStatus::DEVICE_LOST.to_string(), "ERROR_DEVICE_LOST (-4)");
        assert_eq!(DeviceStatus(-999).name(), "ERROR_UNKNOWN");
    }

    #[test]
    fn test_ray_ordinals() {
        for (i, ray) in RayType::ALL.iter().enumerate() {
            assert_eq!(ray.ordinal() as usize, i);
        }
    }
}
