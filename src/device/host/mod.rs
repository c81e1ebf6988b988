//! Software ray tracing device.
//!
//! Implements [`RayTracingDevice`] on the CPU so the allocators, builders and
//! render loop run unchanged without a GPU:
//! - buffers are byte vectors addressed as `(buffer id << 32) | offset`
//! - acceleration structure builds produce real two-level BVHs
//! - trace dispatches run a path tracer whose programs are chosen by decoding
//!   the identity handles found in the shader binding table regions
//!
//! [`FaultPlan`] injects stalled fences, device loss and failing size queries.

mod build;
mod bvh;
mod trace;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use glam::Vec3;
use parking_lot::Mutex;

use crate::records::{LightRecord, MaterialRecord};
use crate::util::{align_up, pixel_count, Transform3x4};

use super::{
    AccelBuildSizes, AccelGeometry, AccelHandle, AccelInstance, AccelLevel, BufferDesc, BufferId,
    BufferUsage, DeviceAddress, DeviceCapabilities, DeviceResult, DeviceStatus, FenceId,
    FenceStatus, ImageCopyLayout, ImageFormat, ImageId, PipelineHandle, RayTracingDevice,
    RayTracingPipelineDesc, ShaderGroup, TraceDispatch, TriangleGeometry,
};

use bvh::{Aabb, Bvh};

/// Marks the first word of every identity handle this device hands out.
const HANDLE_MAGIC: u32 = 0x5254_4731;

/// Faults injected into otherwise healthy operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Trace submissions with this 0-based index or later never signal their fence
    pub stall_traces_from: Option<u32>,
    /// The trace submission with this 0-based index loses the device
    pub lose_device_on_trace: Option<u32>,
    /// Acceleration structure size queries fail with `ERROR_OUT_OF_DEVICE_MEMORY`
    pub fail_size_query: bool,
    /// Image-to-buffer copies never signal their fence
    pub stall_image_copies: bool,
}

#[derive(Clone, Debug)]
pub struct HostDeviceConfig {
    pub capabilities: DeviceCapabilities,
    pub faults: FaultPlan,
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        Self {
            capabilities: HostDevice::default_capabilities(),
            faults: FaultPlan::default(),
        }
    }
}

struct HostBuffer {
    data: Vec<u8>,
    usage: BufferUsage,
}

/// Built bottom-level structure: triangles in structure space.
pub(crate) struct BottomData {
    pub triangles: Vec<[Vec3; 3]>,
    pub bvh: Bvh,
}

pub(crate) struct TopInstance {
    pub blas: Arc<BottomData>,
    pub object_to_world: Transform3x4,
    pub world_to_object: Transform3x4,
    pub normal_to_world: Transform3x4,
    pub custom_index: u32,
    pub mask: u8,
    pub sbt_offset: u32,
}

/// Built top-level structure: BVH over world-space instance bounds.
pub(crate) struct TopData {
    pub instances: Vec<TopInstance>,
    pub bvh: Bvh,
}

enum Built {
    Bottom(Arc<BottomData>),
    Top(Arc<TopData>),
}

struct HostAccel {
    level: AccelLevel,
    storage: BufferId,
    built: Option<Built>,
}

pub(crate) struct HostPipeline {
    pub groups: Vec<ShaderGroup>,
}

pub(crate) struct HostImage {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub texels: Vec<[f32; 4]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Stalled,
    /// Stalled, and a wait on it already timed out; no longer holds up `wait_idle`
    Abandoned,
    Lost,
}

#[derive(Default)]
pub(crate) struct State {
    next_id: u32,
    next_fence: u64,
    buffers: HashMap<u32, HostBuffer>,
    accels: HashMap<u32, HostAccel>,
    pipelines: HashMap<u32, HostPipeline>,
    images: HashMap<u32, HostImage>,
    fences: HashMap<u64, FenceState>,
    traces_submitted: u32,
    faults: FaultPlan,
    lost: bool,
}

impl State {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn fence(&mut self, state: FenceState) -> FenceId {
        self.next_fence += 1;
        self.fences.insert(self.next_fence, state);
        FenceId(self.next_fence)
    }

    fn check_alive(&self) -> DeviceResult<()> {
        if self.lost {
            Err(DeviceStatus::DEVICE_LOST)
        } else {
            Ok(())
        }
    }

    /// Bytes `[address, address + len)` of a live buffer.
    pub(crate) fn bytes(&self, address: DeviceAddress, len: u64) -> DeviceResult<&[u8]> {
        let id = (address.0 >> 32) as u32;
        let offset = address.0 & 0xffff_ffff;
        let buffer = self.buffers.get(&id).ok_or(DeviceStatus::INVALID_DEVICE_ADDRESS)?;
        let end = offset.checked_add(len).ok_or(DeviceStatus::INVALID_DEVICE_ADDRESS)?;
        if end > buffer.data.len() as u64 {
            return Err(DeviceStatus::INVALID_DEVICE_ADDRESS);
        }
        Ok(&buffer.data[offset as usize..end as usize])
    }

    pub(crate) fn read_pod<T: bytemuck::Pod>(&self, address: DeviceAddress) -> DeviceResult<T> {
        let bytes = self.bytes(address, std::mem::size_of::<T>() as u64)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub(crate) fn pipeline(&self, pipeline: PipelineHandle) -> DeviceResult<&HostPipeline> {
        self.pipelines.get(&pipeline.0).ok_or(DeviceStatus::UNKNOWN)
    }

    fn top_level(&self, accel: AccelHandle) -> DeviceResult<Arc<TopData>> {
        match self.accels.get(&accel.0).and_then(|a| a.built.as_ref()) {
            Some(Built::Top(top)) => Ok(top.clone()),
            _ => Err(DeviceStatus::UNKNOWN),
        }
    }

    /// Bottom-level structure whose storage starts at `address`.
    fn bottom_at(&self, address: DeviceAddress) -> DeviceResult<Arc<BottomData>> {
        if address.0 & 0xffff_ffff != 0 {
            return Err(DeviceStatus::INVALID_DEVICE_ADDRESS);
        }
        let storage = BufferId((address.0 >> 32) as u32);
        self.accels
            .values()
            .find_map(|a| match &a.built {
                Some(Built::Bottom(b)) if a.storage == storage => Some(b.clone()),
                _ => None,
            })
            .ok_or(DeviceStatus::INVALID_DEVICE_ADDRESS)
    }

    fn build_bottom(&self, geometry: &TriangleGeometry) -> DeviceResult<BottomData> {
        let tri_count = geometry.triangle_count as u64;
        let index_bytes = self.bytes(geometry.index_address, tri_count * 12)?;
        let indices: Vec<u32> = bytemuck::pod_collect_to_vec(index_bytes);

        let vertex_count = geometry.vertex_count as u64;
        let stride = geometry.vertex_stride.max(12) as u64;
        if vertex_count == 0 {
            return Err(DeviceStatus::UNKNOWN);
        }
        let vertex_bytes = self.bytes(geometry.vertex_address, (vertex_count - 1) * stride + 12)?;
        let position = |i: u32| -> DeviceResult<Vec3> {
            if i as u64 >= vertex_count {
                return Err(DeviceStatus::UNKNOWN);
            }
            let at = (i as u64 * stride) as usize;
            let p: [f32; 3] = bytemuck::pod_read_unaligned(&vertex_bytes[at..at + 12]);
            Ok(geometry.transform.transform_point(Vec3::from_array(p)))
        };

        let mut triangles = Vec::with_capacity(geometry.triangle_count as usize);
        for tri in indices.chunks_exact(3) {
            triangles.push([position(tri[0])?, position(tri[1])?, position(tri[2])?]);
        }
        let bounds: Vec<Aabb> = triangles.iter().map(|t| Aabb::from_points(t)).collect();
        let bvh = build::build_bvh(&bounds);
        Ok(BottomData { triangles, bvh })
    }

    fn build_top(&self, address: DeviceAddress, count: u32) -> DeviceResult<TopData> {
        let bytes = self.bytes(address, count as u64 * std::mem::size_of::<AccelInstance>() as u64)?;
        let records: Vec<AccelInstance> = bytemuck::pod_collect_to_vec(bytes);

        let mut instances = Vec::with_capacity(records.len());
        let mut bounds = Vec::with_capacity(records.len());
        for rec in &records {
            let blas = self.bottom_at(DeviceAddress(rec.blas_address))?;
            let world_to_object = rec.transform.inverse().ok_or(DeviceStatus::UNKNOWN)?;
            bounds.push(blas.bvh.bounds().transformed(&rec.transform));
            instances.push(TopInstance {
                blas,
                object_to_world: rec.transform,
                world_to_object,
                normal_to_world: rec.transform.normal_matrix(),
                custom_index: rec.custom_index(),
                mask: rec.mask(),
                sbt_offset: rec.sbt_offset(),
            });
        }
        let bvh = build::build_bvh(&bounds);
        Ok(TopData { instances, bvh })
    }
}

/// CPU implementation of [`RayTracingDevice`].
pub struct HostDevice {
    caps: DeviceCapabilities,
    state: Mutex<State>,
}

impl HostDevice {
    pub fn new(config: HostDeviceConfig) -> Self {
        let state = State {
            faults: config.faults,
            ..Default::default()
        };
        tracing::debug!(name = %config.capabilities.name, "host device created");
        Self {
            caps: config.capabilities,
            state: Mutex::new(state),
        }
    }

    /// Limits modelled on a typical discrete GPU.
    pub fn default_capabilities() -> DeviceCapabilities {
        DeviceCapabilities {
            name: "rtcore host device".into(),
            ray_tracing_pipeline: true,
            acceleration_structure: true,
            max_ray_recursion_depth: 31,
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            min_storage_buffer_offset_alignment: 16,
            optimal_row_pitch_alignment: 256,
            storage_image_formats: vec![ImageFormat::Rgba32Float],
        }
    }

    /// Replace the fault plan (applies to later submissions).
    pub fn set_faults(&self, faults: FaultPlan) {
        self.state.lock().faults = faults;
    }

    /// Number of trace dispatches submitted so far.
    pub fn traces_submitted(&self) -> u32 {
        self.state.lock().traces_submitted
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_accels(&self) -> usize {
        self.state.lock().accels.len()
    }

    pub fn is_lost(&self) -> bool {
        self.state.lock().lost
    }

    fn handle_bytes(&self, pipeline: u32, group: u32) -> Vec<u8> {
        let size = self.caps.shader_group_handle_size as usize;
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&HANDLE_MAGIC.to_le_bytes());
        out.extend_from_slice(&pipeline.to_le_bytes());
        out.extend_from_slice(&group.to_le_bytes());
        out.extend_from_slice(&(!group).to_le_bytes());
        let mut fill = pipeline.wrapping_mul(0x9e37_79b9) ^ group;
        while out.len() < size {
            fill = trace::pcg_hash(fill);
            out.push(fill as u8);
        }
        out.truncate(size);
        out
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new(HostDeviceConfig::default())
    }
}

/// Group index encoded in an identity handle of `pipeline`, if the bytes are one.
pub(crate) fn decode_handle(bytes: &[u8], pipeline: PipelineHandle) -> Option<u32> {
    if bytes.len() < 16 {
        return None;
    }
    let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
    let (magic, owner, group, check) = (word(0), word(4), word(8), word(12));
    (magic == HANDLE_MAGIC && owner == pipeline.0 && check == !group).then_some(group)
}

impl RayTracingDevice for HostDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> DeviceResult<BufferId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        if desc.size > u32::MAX as u64 {
            return Err(DeviceStatus::OUT_OF_DEVICE_MEMORY);
        }
        let id = state.alloc_id();
        state.buffers.insert(
            id,
            HostBuffer {
                data: vec![0; desc.size as usize],
                usage: desc.usage,
            },
        );
        tracing::trace!(id, label = desc.label, size = desc.size, "create_buffer");
        Ok(BufferId(id))
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        self.state.lock().buffers.remove(&buffer.0);
    }

    fn buffer_address(&self, buffer: BufferId) -> DeviceResult<DeviceAddress> {
        let state = self.state.lock();
        if state.buffers.contains_key(&buffer.0) {
            Ok(DeviceAddress((buffer.0 as u64) << 32))
        } else {
            Err(DeviceStatus::UNKNOWN)
        }
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let buf = state.buffers.get_mut(&buffer.0).ok_or(DeviceStatus::UNKNOWN)?;
        let end = offset as usize + data.len();
        if end > buf.data.len() {
            return Err(DeviceStatus::UNKNOWN);
        }
        buf.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> DeviceResult<Vec<u8>> {
        let state = self.state.lock();
        state.check_alive()?;
        let buf = state.buffers.get(&buffer.0).ok_or(DeviceStatus::UNKNOWN)?;
        let end = (offset + len) as usize;
        if end > buf.data.len() {
            return Err(DeviceStatus::UNKNOWN);
        }
        Ok(buf.data[offset as usize..end].to_vec())
    }

    fn accel_build_sizes(&self, geometry: &AccelGeometry) -> DeviceResult<AccelBuildSizes> {
        let state = self.state.lock();
        state.check_alive()?;
        if state.faults.fail_size_query {
            return Err(DeviceStatus::OUT_OF_DEVICE_MEMORY);
        }
        let node_size = std::mem::size_of::<bvh::BvhNode>() as u64;
        let (prims, prim_size) = match geometry {
            AccelGeometry::Triangles(t) => (t.triangle_count as u64, 36),
            AccelGeometry::Instances { count, .. } => (*count as u64, 64),
        };
        Ok(AccelBuildSizes {
            storage_size: align_up(prims * prim_size + prims.max(1) * 2 * node_size, 256),
            scratch_size: align_up(prims.max(1) * 16, 256),
        })
    }

    fn create_accel(&self, level: AccelLevel, storage: BufferId, size: u64) -> DeviceResult<AccelHandle> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let buf = state.buffers.get(&storage.0).ok_or(DeviceStatus::UNKNOWN)?;
        if buf.usage != BufferUsage::AccelStorage || (buf.data.len() as u64) < size {
            return Err(DeviceStatus::UNKNOWN);
        }
        let id = state.alloc_id();
        state.accels.insert(
            id,
            HostAccel {
                level,
                storage,
                built: None,
            },
        );
        Ok(AccelHandle(id))
    }

    fn accel_address(&self, accel: AccelHandle) -> DeviceResult<DeviceAddress> {
        let state = self.state.lock();
        let a = state.accels.get(&accel.0).ok_or(DeviceStatus::UNKNOWN)?;
        Ok(DeviceAddress((a.storage.0 as u64) << 32))
    }

    fn submit_accel_build(
        &self,
        accel: AccelHandle,
        geometry: &AccelGeometry,
        scratch: BufferId,
    ) -> DeviceResult<FenceId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        if !state.buffers.contains_key(&scratch.0) {
            return Err(DeviceStatus::UNKNOWN);
        }
        let level = state.accels.get(&accel.0).ok_or(DeviceStatus::UNKNOWN)?.level;
        if level != geometry.level() {
            return Err(DeviceStatus::UNKNOWN);
        }
        let built = match geometry {
            AccelGeometry::Triangles(t) => Built::Bottom(Arc::new(state.build_bottom(t)?)),
            AccelGeometry::Instances { address, count } => Built::Top(Arc::new(state.build_top(*address, *count)?)),
        };
        if let Some(a) = state.accels.get_mut(&accel.0) {
            a.built = Some(built);
        }
        Ok(state.fence(FenceState::Signaled))
    }

    fn destroy_accel(&self, accel: AccelHandle) {
        self.state.lock().accels.remove(&accel.0);
    }

    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc) -> DeviceResult<PipelineHandle> {
        let mut state = self.state.lock();
        state.check_alive()?;
        if !self.caps.ray_tracing_pipeline || desc.max_recursion_depth > self.caps.max_ray_recursion_depth {
            return Err(DeviceStatus::FEATURE_NOT_PRESENT);
        }
        if desc.groups.first() != Some(&ShaderGroup::RayGen) {
            return Err(DeviceStatus::INITIALIZATION_FAILED);
        }
        let id = state.alloc_id();
        state.pipelines.insert(
            id,
            HostPipeline {
                groups: desc.groups.clone(),
            },
        );
        tracing::debug!(id, label = %desc.label, groups = desc.groups.len(), "pipeline created");
        Ok(PipelineHandle(id))
    }

    fn shader_group_handles(
        &self,
        pipeline: PipelineHandle,
        first_group: u32,
        group_count: u32,
    ) -> DeviceResult<Vec<u8>> {
        let state = self.state.lock();
        let groups = state.pipeline(pipeline)?.groups.len() as u32;
        if first_group.checked_add(group_count).is_none_or(|end| end > groups) {
            return Err(DeviceStatus::UNKNOWN);
        }
        Ok((first_group..first_group + group_count)
            .flat_map(|g| self.handle_bytes(pipeline.0, g))
            .collect())
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.state.lock().pipelines.remove(&pipeline.0);
    }

    fn create_storage_image(&self, width: u32, height: u32, format: ImageFormat) -> DeviceResult<ImageId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        if !self.caps.supports_storage_format(format) {
            return Err(DeviceStatus::FORMAT_NOT_SUPPORTED);
        }
        if width == 0 || height == 0 {
            return Err(DeviceStatus::UNKNOWN);
        }
        let texels = pixel_count(width, height).ok_or(DeviceStatus::OUT_OF_HOST_MEMORY)?;
        let id = state.alloc_id();
        state.images.insert(
            id,
            HostImage {
                width,
                height,
                format,
                texels: vec![[0.0; 4]; texels],
            },
        );
        Ok(ImageId(id))
    }

    fn destroy_image(&self, image: ImageId) {
        self.state.lock().images.remove(&image.0);
    }

    fn image_copy_layout(&self, image: ImageId) -> DeviceResult<ImageCopyLayout> {
        let state = self.state.lock();
        let img = state.images.get(&image.0).ok_or(DeviceStatus::UNKNOWN)?;
        let row_pitch = align_up(
            img.width as u64 * img.format.texel_size() as u64,
            self.caps.optimal_row_pitch_alignment as u64,
        );
        Ok(ImageCopyLayout {
            row_pitch,
            rows: img.height,
            size: row_pitch * img.height as u64,
        })
    }

    fn submit_image_copy(&self, image: ImageId, buffer: BufferId) -> DeviceResult<FenceId> {
        let layout = self.image_copy_layout(image)?;
        let mut state = self.state.lock();
        state.check_alive()?;
        if state.faults.stall_image_copies {
            tracing::warn!(image = image.0, "injected image copy stall");
            return Ok(state.fence(FenceState::Stalled));
        }
        let state = &mut *state;
        let img = state.images.get(&image.0).ok_or(DeviceStatus::UNKNOWN)?;
        let buf = state.buffers.get_mut(&buffer.0).ok_or(DeviceStatus::UNKNOWN)?;
        if (buf.data.len() as u64) < layout.size {
            return Err(DeviceStatus::UNKNOWN);
        }
        for (y, row) in img.texels.chunks_exact(img.width as usize).enumerate() {
            let start = y * layout.row_pitch as usize;
            match img.format {
                ImageFormat::Rgba32Float => {
                    let bytes: &[u8] = bytemuck::cast_slice(row);
                    buf.data[start..start + bytes.len()].copy_from_slice(bytes);
                }
                ImageFormat::Rgba8Unorm => {
                    for (x, t) in row.iter().enumerate() {
                        for c in 0..4 {
                            buf.data[start + x * 4 + c] = (t[c].clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
                        }
                    }
                }
            }
        }
        Ok(state.fence(FenceState::Signaled))
    }

    fn submit_trace(&self, dispatch: &TraceDispatch) -> DeviceResult<FenceId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let index = state.traces_submitted;
        state.traces_submitted += 1;

        if state.faults.lose_device_on_trace == Some(index) {
            tracing::warn!(trace = index, "injected device loss");
            state.lost = true;
            return Ok(state.fence(FenceState::Lost));
        }
        if state.faults.stall_traces_from.is_some_and(|from| index >= from) {
            tracing::warn!(trace = index, "injected fence stall");
            return Ok(state.fence(FenceState::Stalled));
        }

        let tlas = state.top_level(dispatch.tlas)?;
        let handle_size = self.caps.shader_group_handle_size as u64;
        let outputs = trace::run(&state, dispatch, &tlas, handle_size)?;
        trace::store(&mut state, dispatch, outputs)?;
        Ok(state.fence(FenceState::Signaled))
    }

    fn wait_for_fence(&self, fence: FenceId, timeout: Duration) -> DeviceResult<FenceStatus> {
        let current = {
            let mut state = self.state.lock();
            match state.fences.get(&fence.0).copied() {
                Some(FenceState::Signaled) => {
                    state.fences.remove(&fence.0);
                    return Ok(FenceStatus::Signaled);
                }
                Some(other) => other,
                None => return Err(DeviceStatus::UNKNOWN),
            }
        };
        match current {
            FenceState::Lost => Err(DeviceStatus::DEVICE_LOST),
            _ => {
                std::thread::sleep(timeout);
                if let Some(f) = self.state.lock().fences.get_mut(&fence.0) {
                    if *f == FenceState::Stalled {
                        *f = FenceState::Abandoned;
                    }
                }
                Ok(FenceStatus::TimedOut)
            }
        }
    }

    fn wait_idle(&self) -> DeviceResult<()> {
        let state = self.state.lock();
        state.check_alive()?;
        if state.fences.values().any(|f| *f == FenceState::Stalled) {
            return Err(DeviceStatus::TIMEOUT);
        }
        Ok(())
    }
}

/// Material record stride the trace programs index by.
pub(crate) const MATERIAL_STRIDE: u64 = <MaterialRecord as crate::records::GpuRecord>::WIRE_SIZE as u64;
pub(crate) const LIGHT_STRIDE: u64 = <LightRecord as crate::records::GpuRecord>::WIRE_SIZE as u64;
