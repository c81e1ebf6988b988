//! Ray tracing pipeline and shader dispatch table (shader binding table).
//!
//! Group order of the path tracing pipeline is fixed:
//!
//! ```text
//! 0        ray generation
//! 1..=3    miss: primary, secondary, next-event
//! 4..      hit(material, ray) for material in ordinal order, for ray in ray order
//! ```
//!
//! The hit region holds one record per `(material, ray)` pair in the same
//! order, so an instance whose dispatch offset is [`offset_for`]`(material)`
//! reaches the hit program for ray `r` at record `offset + r`.

use surface_params::MaterialType;

use crate::device::{
    is_hardware_ray_tracing_supported, BufferUsage, DeviceBuffer, DeviceRef, PipelineHandle, RayTracingPipelineDesc,
    RayType, SbtRegion, ShaderGroup,
};
use crate::util::{align_up, Error, Result};

/// Hit records per material: one per [`RayType`].
pub const RAYS_PER_MATERIAL: u32 = RayType::COUNT as u32;

/// Recursion the path tracer needs: camera/bounce ray plus its shadow ray.
pub const REQUIRED_RECURSION_DEPTH: u32 = 2;

/// Dispatch offset of a material type's first hit record.
#[inline]
pub const fn offset_for(material: MaterialType) -> u32 {
    material.ordinal() * RAYS_PER_MATERIAL
}

/// Canonical group list of the path tracing pipeline.
pub fn path_tracing_groups() -> Vec<ShaderGroup> {
    let mut groups = Vec::with_capacity(1 + RayType::COUNT + MaterialType::COUNT * RayType::COUNT);
    groups.push(ShaderGroup::RayGen);
    groups.extend(RayType::ALL.iter().map(|&ray| ShaderGroup::Miss(ray)));
    for material in MaterialType::ALL {
        for ray in RayType::ALL {
            groups.push(ShaderGroup::Hit { material, ray });
        }
    }
    groups
}

/// Compiled ray tracing pipeline, destroyed on drop.
pub struct RayTracingPipeline {
    device: DeviceRef,
    handle: PipelineHandle,
    groups: Vec<ShaderGroup>,
}

impl RayTracingPipeline {
    /// Compile the path tracing pipeline. `max_recursion_depth` is raised to
    /// the required minimum and capped at the device limit.
    pub fn path_tracing(device: &DeviceRef, max_recursion_depth: u32) -> Result<Self> {
        check_capabilities(device)?;
        let depth = max_recursion_depth
            .max(REQUIRED_RECURSION_DEPTH)
            .min(device.capabilities().max_ray_recursion_depth);
        let groups = path_tracing_groups();
        let handle = device
            .create_ray_tracing_pipeline(&RayTracingPipelineDesc {
                label: "path tracing".into(),
                groups: groups.clone(),
                max_recursion_depth: depth,
            })
            .map_err(Error::PipelineCreationFailed)?;
        tracing::debug!(groups = groups.len(), depth, "path tracing pipeline compiled");
        Ok(Self {
            device: device.clone(),
            handle,
            groups,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle
    }

    pub fn groups(&self) -> &[ShaderGroup] {
        &self.groups
    }

    /// Position of `group` in the pipeline.
    pub fn group_index(&self, group: ShaderGroup) -> Option<u32> {
        self.groups.iter().position(|g| *g == group).map(|i| i as u32)
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.handle);
    }
}

fn check_capabilities(device: &DeviceRef) -> Result<()> {
    let caps = device.capabilities();
    if !is_hardware_ray_tracing_supported(device.as_ref()) {
        return Err(Error::RayTracingUnsupported(caps.name.clone()));
    }
    if caps.max_ray_recursion_depth < REQUIRED_RECURSION_DEPTH {
        return Err(Error::RecursionUnsupported {
            required: REQUIRED_RECURSION_DEPTH,
            supported: caps.max_ray_recursion_depth,
        });
    }
    Ok(())
}

/// The three regions bound into a trace dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtRegions {
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
}

/// Device-resident dispatch table. Immutable after build.
pub struct DispatchTable {
    buffer: DeviceBuffer,
    regions: SbtRegions,
    handle_size: u32,
    pipeline: PipelineHandle,
}

impl DispatchTable {
    pub fn regions(&self) -> SbtRegions {
        self.regions
    }

    pub fn pipeline(&self) -> PipelineHandle {
        self.pipeline
    }

    /// Size of one identity handle.
    pub fn handle_size(&self) -> u32 {
        self.handle_size
    }

    /// Byte stride between records in every region.
    pub fn stride(&self) -> u64 {
        self.regions.hit.stride
    }

    pub fn offset_for(&self, material: MaterialType) -> u32 {
        offset_for(material)
    }

    /// Hit record reached by an instance of `material` tracing `ray`.
    pub fn hit_group_index(&self, material: MaterialType, ray: RayType) -> u32 {
        offset_for(material) + ray.ordinal()
    }

    /// Read back hit record `index` (identity handle bytes only).
    pub fn read_hit_record(&self, index: u32) -> Result<Vec<u8>> {
        let offset = self.regions.hit.address.0 - self.buffer.address().0 + index as u64 * self.stride();
        self.buffer.read(offset, self.handle_size as u64)
    }

    /// Read back the miss record for `ray`.
    pub fn read_miss_record(&self, ray: RayType) -> Result<Vec<u8>> {
        let offset = self.regions.miss.address.0 - self.buffer.address().0 + ray.ordinal() as u64 * self.stride();
        self.buffer.read(offset, self.handle_size as u64)
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("regions", &self.regions)
            .field("handle_size", &self.handle_size)
            .finish()
    }
}

pub struct ShaderDispatchTableBuilder {
    device: DeviceRef,
}

impl ShaderDispatchTableBuilder {
    pub fn new(device: &DeviceRef) -> Self {
        Self { device: device.clone() }
    }

    /// Lay out the group handles of `pipeline` into raygen/miss/hit regions.
    pub fn compile(&self, pipeline: &RayTracingPipeline) -> Result<DispatchTable> {
        check_capabilities(&self.device)?;
        if pipeline.groups() != path_tracing_groups().as_slice() {
            return Err(Error::other("pipeline groups are not in path tracing order"));
        }

        let caps = self.device.capabilities();
        if caps.shader_group_handle_size == 0 {
            return Err(Error::InvalidCapability("shader group handle size is 0".into()));
        }
        let handle_size = caps.shader_group_handle_size as u64;
        let stride = align_up(handle_size, caps.shader_group_handle_alignment as u64);
        let base = caps.shader_group_base_alignment as u64;

        let miss_count = RayType::COUNT as u64;
        let hit_count = (MaterialType::COUNT * RayType::COUNT) as u64;
        let raygen_offset = 0;
        let miss_offset = align_up(raygen_offset + stride, base);
        let hit_offset = align_up(miss_offset + miss_count * stride, base);
        let total = hit_offset + hit_count * stride;

        let group_count = pipeline.groups().len() as u32;
        let handles = self
            .device
            .shader_group_handles(pipeline.handle(), 0, group_count)
            .map_err(|s| Error::device("shader_group_handles", s))?;
        if handles.len() as u64 != group_count as u64 * handle_size {
            return Err(Error::InvalidCapability(format!(
                "device returned {} handle bytes for {group_count} groups of {handle_size}",
                handles.len()
            )));
        }

        let mut table = vec![0u8; total as usize];
        for (group, handle) in handles.chunks_exact(handle_size as usize).enumerate() {
            let at = match group as u64 {
                0 => raygen_offset,
                g if g <= miss_count => miss_offset + (g - 1) * stride,
                g => hit_offset + (g - 1 - miss_count) * stride,
            } as usize;
            table[at..at + handle.len()].copy_from_slice(handle);
        }

        let buffer = DeviceBuffer::with_data(&self.device, "dispatch table", &table, BufferUsage::ShaderBindingTable)?;
        let address = buffer.address();
        let regions = SbtRegions {
            raygen: SbtRegion {
                address: address.offset(raygen_offset),
                stride,
                size: stride,
            },
            miss: SbtRegion {
                address: address.offset(miss_offset),
                stride,
                size: miss_count * stride,
            },
            hit: SbtRegion {
                address: address.offset(hit_offset),
                stride,
                size: hit_count * stride,
            },
        };
        tracing::debug!(stride, total, "dispatch table compiled");

        Ok(DispatchTable {
            buffer,
            regions,
            handle_size: handle_size as u32,
            pipeline: pipeline.handle(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::{HostDevice, HostDeviceConfig};
    use std::sync::Arc;

    fn device_with(edit: impl FnOnce(&mut crate::device::DeviceCapabilities)) -> DeviceRef {
        let mut caps = HostDevice::default_capabilities();
        edit(&mut caps);
        Arc::new(HostDevice::new(HostDeviceConfig {
            capabilities: caps,
            ..Default::default()
        }))
    }

    #[test]
    fn test_offsets() {
        assert_eq!(offset_for(MaterialType::Lambert), 0);
        assert_eq!(offset_for(MaterialType::Metal), 3);
        assert_eq!(offset_for(MaterialType::Emissive), 9);
    }

    #[test]
    fn test_group_order() {
        let groups = path_tracing_groups();
        assert_eq!(groups.len(), 1 + 3 + 4 * 3);
        assert_eq!(groups[0], ShaderGroup::RayGen);
        assert_eq!(groups[3], ShaderGroup::Miss(RayType::NextEvent));
        assert_eq!(
            groups[4 + offset_for(MaterialType::Dielectric) as usize + 1],
            ShaderGroup::Hit {
                material: MaterialType::Dielectric,
                ray: RayType::Secondary
            }
        );
    }

    #[test]
    fn test_region_alignment() {
        let device = device_with(|c| {
            c.shader_group_handle_size = 32;
            c.shader_group_handle_alignment = 48;
            c.shader_group_base_alignment = 128;
        });
        let pipeline = RayTracingPipeline::path_tracing(&device, REQUIRED_RECURSION_DEPTH).unwrap();
        let table = ShaderDispatchTableBuilder::new(&device).compile(&pipeline).unwrap();
        let r = table.regions();
        assert_eq!(r.hit.stride, 48);
        assert_eq!(r.miss.address.0 % 128, 0);
        assert_eq!(r.hit.address.0 % 128, 0);
        assert_eq!(r.hit.size, 12 * 48);
    }

    #[test]
    fn test_recursion_unsupported() {
        let device = device_with(|c| c.max_ray_recursion_depth = 1);
        assert!(matches!(
            RayTracingPipeline::path_tracing(&device, REQUIRED_RECURSION_DEPTH),
            Err(Error::RecursionUnsupported {
                required: 2,
                supported: 1
            })
        ));
    }

    #[test]
    fn test_ray_tracing_unsupported() {
        let device = device_with(|c| c.ray_tracing_pipeline = false);
        assert!(matches!(
            RayTracingPipeline::path_tracing(&device, REQUIRED_RECURSION_DEPTH),
            Err(Error::RayTracingUnsupported(_))
        ));
    }

    #[test]
    fn test_zero_handle_size_rejected() {
        let device = device_with(|c| c.shader_group_handle_size = 0);
        let pipeline = RayTracingPipeline::path_tracing(&device, REQUIRED_RECURSION_DEPTH).unwrap();
        assert!(matches!(
            ShaderDispatchTableBuilder::new(&device).compile(&pipeline),
            Err(Error::InvalidCapability(_))
        ));
    }

    #[test]
    fn test_small_handles_fill_exactly() {
        let device = device_with(|c| {
            c.shader_group_handle_size = 8;
            c.shader_group_handle_alignment = 8;
        });
        let pipeline = RayTracingPipeline::path_tracing(&device, REQUIRED_RECURSION_DEPTH).unwrap();
        let table = ShaderDispatchTableBuilder::new(&device).compile(&pipeline).unwrap();
        assert_eq!(table.stride(), 8);
        let index = table.hit_group_index(MaterialType::Metal, RayType::Secondary);
        let group = pipeline
            .group_index(ShaderGroup::Hit {
                material: MaterialType::Metal,
                ray: RayType::Secondary,
            })
            .unwrap();
        let expected = device.shader_group_handles(pipeline.handle(), group, 1).unwrap();
        assert_eq!(expected.len(), 8);
        assert_eq!(table.read_hit_record(index).unwrap(), expected);
    }

    #[test]
    fn test_miss_records_match_handles() {
        let device = device_with(|_| {});
        let pipeline = RayTracingPipeline::path_tracing(&device, REQUIRED_RECURSION_DEPTH).unwrap();
        let table = ShaderDispatchTableBuilder::new(&device).compile(&pipeline).unwrap();
        for ray in RayType::ALL {
            let group = pipeline.group_index(ShaderGroup::Miss(ray)).unwrap();
            let expected = device.shader_group_handles(pipeline.handle(), group, 1).unwrap();
            assert_eq!(table.read_miss_record(ray).unwrap(), expected);
        }
    }
}
