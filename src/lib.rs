//! # rtcore
//!
//! Execution core of a hardware ray traced path tracer: device record
//! allocation, acceleration structure builds, the shader dispatch table and
//! the batched progressive render loop.
//!
//! Everything talks to the GPU through the [`device::RayTracingDevice`]
//! trait. [`device::host::HostDevice`] implements it on the CPU, so the whole
//! pipeline runs (and is tested) without a GPU.
//!
//! ## Modules
//!
//! - [`util`] - Errors and device layout math
//! - [`device`] - Device trait, ids, buffers and the host device
//! - [`records`] - Device record layouts (materials, instances, lights, frame state)
//! - [`alloc`] - Block and interned record allocators
//! - [`accel`] - Bottom/top-level acceleration structure builds
//! - [`sbt`] - Ray tracing pipeline and shader dispatch table
//! - [`scene`] - Meshes, materials, lights and camera handed to a render
//! - [`render`] - Progressive render loop, readback, denoise and output
//!
//! ## Example
//!
//! ```ignore
//! use rtcore::prelude::*;
//!
//! let device: DeviceRef = Arc::new(HostDevice::default());
//! let renderer = ProgressiveRenderer::new(device.clone(), RendererConfig::default())?;
//! let outcome = renderer.render(&scene, &RenderParams::default())?;
//! ```

pub mod accel;
pub mod alloc;
pub mod device;
pub mod records;
pub mod render;
pub mod sbt;
pub mod scene;
pub mod util;

// Re-export commonly used types
pub use device::is_hardware_ray_tracing_supported;
pub use util::{Error, Result};

/// Build date and time stamped by the build script.
pub const BUILD_DATE: &str = env!("RTCORE_BUILD_DATE");
pub const BUILD_TIME: &str = env!("RTCORE_BUILD_TIME");

/// Prelude module for convenient imports
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::accel::{AccelerationStructureBuilder, BottomLevelInput, Instance};
    pub use crate::alloc::{BlockAllocator, InternedBlockAllocator, SlotHandle};
    pub use crate::device::host::HostDevice;
    pub use crate::device::{is_hardware_ray_tracing_supported, DeviceRef, RayTracingDevice, RayType};
    pub use crate::records::{GpuRecord, InstanceRecord, LightRecord, MaterialRecord};
    pub use crate::render::{
        ProgressiveRenderer, RenderOutcome, RenderParams, RenderState, RenderWorker, RendererConfig,
    };
    pub use crate::sbt::{RayTracingPipeline, ShaderDispatchTableBuilder};
    pub use crate::scene::{Camera, LightDesc, MaterialStore, MeshBuffers, SceneSnapshot};
    pub use crate::util::{Error, Result};
    pub use surface_params::{MaterialType, SurfaceParams};
}
