//! Progressive render loop.
//!
//! One call to [`ProgressiveRenderer::render`] walks the whole state machine:
//! build the per-render records and the top-level structure, dispatch the
//! trace batch by batch (each batch waits on its fence before the next
//! `BatchState` is written), read the targets back, optionally denoise, and
//! write the files. Nothing is written unless every earlier step succeeded.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::accel::{AccelerationStructureBuilder, BottomLevelStructure, Instance, TopLevelStructure};
use crate::alloc::{BlockAllocator, InternedBlockAllocator, SlotHandle};
use crate::device::{
    is_hardware_ray_tracing_supported, BufferUsage, DeviceBuffer, DeviceRef, DeviceStatus, FenceStatus, ImageFormat,
    TraceBindings, TraceDispatch,
};
use crate::records::{frame_flags, FrameConstants, InstanceRecord, LightRecord};
use crate::sbt::{offset_for, DispatchTable, RayTracingPipeline, ShaderDispatchTableBuilder};
use crate::scene::SceneSnapshot;
use crate::util::{Error, Result};

use super::batch::BatchPlan;
use super::denoise::{BilateralDenoiser, Denoiser};
use super::output::{intermediate_path, FileImageWriter, FloatImage, ImageWriter, StagedOutputs};
use super::readback::RenderTarget;
use super::{FailureReason, OutputKind, RenderObserver, RenderParams, RenderState, RenderStatus, RendererConfig};

/// Summary of a completed render.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderReport {
    pub batches: u32,
    pub samples: u32,
    /// Every file written, final image last
    pub files: Vec<PathBuf>,
    pub elapsed: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RenderOutcome {
    Completed(RenderReport),
    /// Another render was in progress
    Ignored,
}

/// Record tables and per-frame buffers owned by the renderer.
struct FrameResources {
    instances: BlockAllocator<InstanceRecord>,
    lights: InternedBlockAllocator<LightRecord>,
    frame_constants: Vec<DeviceBuffer>,
    batch_state: Vec<DeviceBuffer>,
    light_indices: Vec<DeviceBuffer>,
    frame_counter: u64,
}

impl FrameResources {
    fn new(device: &DeviceRef, config: &RendererConfig) -> Result<Self> {
        let frames = config.frames_in_flight;
        let per_frame = |label: &str, size: u64| -> Result<Vec<DeviceBuffer>> {
            (0..frames)
                .map(|f| DeviceBuffer::new(device, &format!("{label}[{f}]"), size, BufferUsage::Storage))
                .collect()
        };
        Ok(Self {
            instances: BlockAllocator::new(device, "instances", config.instance_capacity, frames)?,
            lights: InternedBlockAllocator::new(device, "lights", config.light_capacity, frames)?,
            frame_constants: per_frame("frame constants", std::mem::size_of::<FrameConstants>() as u64)?,
            batch_state: per_frame("batch state", 16)?,
            light_indices: per_frame("light indices", config.light_capacity as u64 * 4)?,
            frame_counter: 0,
        })
    }
}

/// Slots taken for one render; returned whatever the outcome.
#[derive(Default)]
struct RenderSlots {
    instances: SmallVec<[SlotHandle; 16]>,
    lights: SmallVec<[SlotHandle; 8]>,
}

impl RenderSlots {
    fn release(self, res: &mut FrameResources) {
        for slot in self.instances {
            if let Err(e) = res.instances.free(slot) {
                tracing::warn!(error = %e, "instance slot release failed");
            }
        }
        for slot in self.lights {
            if let Err(e) = res.lights.release(slot) {
                tracing::warn!(error = %e, "light slot release failed");
            }
        }
    }
}

/// Device state held for the batches of one render.
struct PreparedRender {
    _tlas: TopLevelStructure,
    dispatch: TraceDispatch,
    radiance: RenderTarget,
    albedo: Option<RenderTarget>,
    normal: Option<RenderTarget>,
}

/// Host images after readback.
struct Readback {
    radiance: FloatImage,
    albedo: Option<FloatImage>,
    normal: Option<FloatImage>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Batched progressive path tracer over a [`RayTracingDevice`](crate::device::RayTracingDevice).
pub struct ProgressiveRenderer {
    device: DeviceRef,
    config: RendererConfig,
    pipeline: RayTracingPipeline,
    table: DispatchTable,
    accel: AccelerationStructureBuilder,
    status: Arc<RenderStatus>,
    busy: AtomicBool,
    observer: Option<Arc<dyn RenderObserver>>,
    denoiser: Box<dyn Denoiser>,
    writer: Box<dyn ImageWriter>,
    resources: Mutex<FrameResources>,
}

impl ProgressiveRenderer {
    /// Check capabilities, compile the pipeline and lay out its dispatch table.
    pub fn new(device: DeviceRef, config: RendererConfig) -> Result<Self> {
        if !is_hardware_ray_tracing_supported(device.as_ref()) {
            return Err(Error::RayTracingUnsupported(device.capabilities().name.clone()));
        }
        let format = ImageFormat::Rgba32Float;
        if !device.capabilities().supports_storage_format(format) {
            return Err(Error::UnsupportedFormat(format!("{format:?}")));
        }
        if config.frames_in_flight == 0 {
            return Err(Error::other("frames in flight must be at least 1"));
        }
        let pipeline = RayTracingPipeline::path_tracing(&device, config.max_recursion_depth)?;
        let table = ShaderDispatchTableBuilder::new(&device).compile(&pipeline)?;
        let accel = AccelerationStructureBuilder::new(&device).with_build_timeout(config.build_timeout());
        let resources = FrameResources::new(&device, &config)?;
        tracing::info!(
            device = %device.capabilities().name,
            frames = config.frames_in_flight,
            "progressive renderer ready"
        );
        Ok(Self {
            device,
            config,
            pipeline,
            table,
            accel,
            status: Arc::new(RenderStatus::new()),
            busy: AtomicBool::new(false),
            observer: None,
            denoiser: Box::new(BilateralDenoiser::default()),
            writer: Box::new(FileImageWriter),
            resources: Mutex::new(resources),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn RenderObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_denoiser(mut self, denoiser: Box<dyn Denoiser>) -> Self {
        self.denoiser = denoiser;
        self
    }

    pub fn with_writer(mut self, writer: Box<dyn ImageWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.table
    }

    pub fn state(&self) -> RenderState {
        self.status.state()
    }

    /// Fraction of batches completed in the current (or last) render.
    pub fn render_progress(&self) -> f32 {
        self.status.progress()
    }

    /// Shared status for polling from other threads.
    pub fn status(&self) -> Arc<RenderStatus> {
        self.status.clone()
    }

    /// Render `scene` and write the requested files.
    ///
    /// Returns [`RenderOutcome::Ignored`] without touching anything when a
    /// render is already running. Invalid parameters are rejected before any
    /// device work and leave the state unchanged.
    pub fn render(&self, scene: &SceneSnapshot, params: &RenderParams) -> Result<RenderOutcome> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("render already in progress, request ignored");
            return Ok(RenderOutcome::Ignored);
        }
        let _busy = BusyGuard(&self.busy);
        let plan = BatchPlan::new(params)?;
        let material_frames = scene.materials.read().frames();
        if material_frames < self.config.frames_in_flight {
            return Err(Error::InvalidScene(format!(
                "material store keeps {material_frames} frame replicas, renderer cycles {}",
                self.config.frames_in_flight
            )));
        }

        let span = tracing::info_span!("render", width = params.width, height = params.height, samples = params.samples);
        let _enter = span.enter();

        let start = Instant::now();
        self.status.reset_progress();
        let mut res = self.resources.lock();
        let mut slots = RenderSlots::default();
        let result = self.run(scene, params, &plan, &mut res, &mut slots);
        slots.release(&mut res);
        drop(res);

        match result {
            Ok(files) => {
                self.transition(RenderState::Done);
                let elapsed = start.elapsed();
                tracing::info!(?elapsed, files = files.len(), "render done");
                Ok(RenderOutcome::Completed(RenderReport {
                    batches: plan.total_batches,
                    samples: params.samples,
                    files,
                    elapsed,
                }))
            }
            Err(e) => {
                let reason = failure_reason(&e);
                self.transition(RenderState::Failed(reason));
                match e.remediation() {
                    Some(hint) => tracing::error!(error = %e, %reason, "render failed: {hint}"),
                    None => tracing::error!(error = %e, %reason, "render failed"),
                }
                Err(e)
            }
        }
    }

    fn run(
        &self,
        scene: &SceneSnapshot,
        params: &RenderParams,
        plan: &BatchPlan,
        res: &mut FrameResources,
        slots: &mut RenderSlots,
    ) -> Result<Vec<PathBuf>> {
        self.transition(RenderState::Building);
        let frame = (res.frame_counter % res.frame_constants.len() as u64) as usize;
        let prepared = self.prepare(scene, params, frame, res, slots)?;
        res.frame_counter += 1;

        for state in plan.batches() {
            let (batch, total) = (state.batch_index, state.total_batches);
            self.transition(RenderState::Batching { batch, total });
            res.batch_state[frame].write(0, bytemuck::bytes_of(&state))?;
            self.dispatch_batch(&prepared.dispatch, batch, total)?;
            let progress = plan.progress_after(batch);
            self.status.advance(progress);
            tracing::debug!(batch = batch + 1, total, progress, "batch complete");
            if let Some(observer) = &self.observer {
                observer.batch_completed(batch, total, progress);
            }
        }

        self.transition(RenderState::ReadBack);
        let timeout = self.config.readback_timeout();
        let mut images = Readback {
            radiance: prepared.radiance.read(timeout)?,
            albedo: prepared.albedo.as_ref().map(|t| t.read(timeout)).transpose()?,
            normal: prepared.normal.as_ref().map(|t| t.read(timeout)).transpose()?,
        };
        let raw = params.write_all_intermediate.then(|| images.radiance.clone());

        if params.denoise {
            self.transition(RenderState::Denoise);
            let _span = tracing::info_span!("denoise", denoiser = self.denoiser.name()).entered();
            self.denoiser
                .denoise(&mut images.radiance, images.albedo.as_ref(), images.normal.as_ref())?;
        }

        self.device.wait_idle().map_err(|s| Error::device("wait_idle", s))?;
        self.write_outputs(params, raw.as_ref(), &images)
    }

    /// Building phase: records, acceleration structures, targets and bindings.
    fn prepare(
        &self,
        scene: &SceneSnapshot,
        params: &RenderParams,
        frame: usize,
        res: &mut FrameResources,
        slots: &mut RenderSlots,
    ) -> Result<PreparedRender> {
        let _span = tracing::info_span!("build", objects = scene.objects.len(), lights = scene.lights.len()).entered();

        let mut blas_cache: HashMap<u64, Arc<BottomLevelStructure>> = HashMap::new();
        let mut instances = Vec::with_capacity(scene.objects.len());
        {
            let materials = scene.materials.read();
            for object in &scene.objects {
                // Catches materials destroyed after the snapshot was taken
                materials.get(object.material)?;
                let mesh = &object.mesh;
                let blas = match blas_cache.get(&mesh.id()) {
                    Some(blas) => blas.clone(),
                    None => {
                        let blas = self.accel.build_bottom_level(&mesh.blas_input())?;
                        blas_cache.insert(mesh.id(), blas.clone());
                        blas
                    }
                };
                let ty = object.material.material_type();
                let slot = res.instances.insert(InstanceRecord::new(
                    &object.transform,
                    mesh.local_transform(),
                    mesh.vertex_address(),
                    mesh.index_address(),
                    mesh.vertex_stride(),
                    object.material.slot().index(),
                    ty,
                ))?;
                slots.instances.push(slot);
                instances.push(Instance::new(&blas, object.transform, slot.index(), offset_for(ty)));
            }
            materials.upload(frame)?;
        }
        let tlas = self.accel.build_top_level(&instances)?;
        drop(blas_cache);

        // Identical lights share a slot; only distinct ones count against capacity
        let mut light_indices: SmallVec<[u32; 8]> = SmallVec::new();
        for light in &scene.lights {
            let slot = res.lights.lookup_or_insert(&light.record())?;
            slots.lights.push(slot);
            light_indices.push(slot.index());
        }
        let index_bytes = light_indices.len() as u64 * 4;
        if index_bytes > res.light_indices[frame].size() {
            res.light_indices[frame] = DeviceBuffer::new(
                &self.device,
                &format!("light indices[{frame}]"),
                index_bytes,
                BufferUsage::Storage,
            )?;
        }

        res.instances.upload_range(frame, 0..res.instances.high_water())?;
        res.lights.upload_range(frame, 0..res.lights.high_water())?;
        if !light_indices.is_empty() {
            res.light_indices[frame].write(0, bytemuck::cast_slice(&light_indices))?;
        }

        let radiance = RenderTarget::new(&self.device, params.width, params.height)?;
        let (albedo, normal) = if params.wants_aux() {
            (
                Some(RenderTarget::new(&self.device, params.width, params.height)?),
                Some(RenderTarget::new(&self.device, params.width, params.height)?),
            )
        } else {
            (None, None)
        };

        let camera = &scene.camera;
        let mut flags = 0;
        if albedo.is_some() {
            flags |= frame_flags::WRITE_ALBEDO;
        }
        if normal.is_some() {
            flags |= frame_flags::WRITE_NORMAL;
        }
        let [r, g, b] = params.background;
        let constants = FrameConstants {
            inv_view: camera.view().inverse().to_cols_array_2d(),
            inv_proj: camera.projection(params.aspect()).inverse().to_cols_array_2d(),
            camera_position: camera.position.extend(1.0).to_array(),
            background: [r, g, b, 1.0],
            light_count: light_indices.len() as u32,
            flags,
            frame_index: res.frame_counter as u32,
            seed: params.seed,
        };
        res.frame_constants[frame].write(0, bytemuck::bytes_of(&constants))?;

        let regions = self.table.regions();
        let materials = scene.materials.read().replica_address(frame)?;
        let dispatch = TraceDispatch {
            pipeline: self.pipeline.handle(),
            raygen: regions.raygen,
            miss: regions.miss,
            hit: regions.hit,
            tlas: tlas.handle(),
            width: params.width,
            height: params.height,
            bindings: TraceBindings {
                frame_constants: res.frame_constants[frame].address(),
                batch_state: res.batch_state[frame].address(),
                materials,
                instances: res.instances.replica_address(frame)?,
                lights: res.lights.replica_address(frame)?,
                light_indices: res.light_indices[frame].address(),
                radiance: radiance.id(),
                albedo: albedo.as_ref().map(RenderTarget::id),
                normal: normal.as_ref().map(RenderTarget::id),
            },
        };
        tracing::info!(
            instances = tlas.instance_count(),
            lights = light_indices.len(),
            aux = params.wants_aux(),
            "render inputs built"
        );
        Ok(PreparedRender {
            _tlas: tlas,
            dispatch,
            radiance,
            albedo,
            normal,
        })
    }

    fn dispatch_batch(&self, dispatch: &TraceDispatch, batch: u32, total: u32) -> Result<()> {
        let fence = self
            .device
            .submit_trace(dispatch)
            .map_err(|s| Error::device("submit_trace", s))?;
        let timeout = self.config.batch_timeout();
        match self.device.wait_for_fence(fence, timeout) {
            Ok(FenceStatus::Signaled) => Ok(()),
            Ok(FenceStatus::TimedOut) => Err(Error::BatchTimeout { batch, total, timeout }),
            Err(DeviceStatus::TIMEOUT) => Err(Error::BatchTimeout { batch, total, timeout }),
            Err(s) => Err(Error::device("batch fence", s)),
        }
    }

    /// Either every requested file appears, or none does.
    fn write_outputs(&self, params: &RenderParams, raw: Option<&FloatImage>, images: &Readback) -> Result<Vec<PathBuf>> {
        let writer = self.writer.as_ref();
        let mut staged = StagedOutputs::default();
        if params.write_all_intermediate {
            let aux = [
                ("radiance", raw),
                ("albedo", images.albedo.as_ref()),
                ("normal", images.normal.as_ref()),
            ];
            for (suffix, image) in aux {
                if let Some(image) = image {
                    let path = intermediate_path(&params.output, suffix);
                    staged.write(writer, &path, image, OutputKind::Hdr, 1.0)?;
                }
            }
        }
        staged.write(
            writer,
            &params.output,
            &images.radiance,
            params.output_kind,
            params.exposure,
        )?;
        staged.commit()
    }

    fn transition(&self, state: RenderState) {
        self.status.set_state(state);
        tracing::debug!(%state, "render state");
        if let Some(observer) = &self.observer {
            observer.state_changed(state);
        }
    }
}

impl std::fmt::Debug for ProgressiveRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressiveRenderer")
            .field("device", &self.device.capabilities().name)
            .field("state", &self.state())
            .field("denoiser", &self.denoiser.name())
            .finish()
    }
}

fn failure_reason(error: &Error) -> FailureReason {
    match error {
        Error::BatchTimeout { .. } | Error::ReadbackTimeout(_) => FailureReason::Timeout,
        Error::DeviceLost(_) => FailureReason::DeviceLost,
        Error::BuildSizeQueryFailed(_)
        | Error::DeviceBuildFailed(_)
        | Error::EmptyGeometry
        | Error::DanglingInstance { .. }
        | Error::InstanceFieldOverflow { .. }
        | Error::CapacityExceeded { .. }
        | Error::StaleHandle { .. }
        | Error::InvalidScene(_) => FailureReason::Build,
        Error::ImageWrite { .. } | Error::Io(_) => FailureReason::Output,
        _ => FailureReason::Device,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::{FaultPlan, HostDevice, HostDeviceConfig};
    use crate::scene::{quad_geometry, Camera, LightDesc, MaterialStore, MeshBuffers};
    use glam::{Mat4, Vec3};
    use parking_lot::RwLock;
    use surface_params::{MaterialType, SurfaceParams};

    fn renderer() -> (Arc<HostDevice>, ProgressiveRenderer) {
        let host = Arc::new(HostDevice::default());
        let device: DeviceRef = host.clone();
        (host, ProgressiveRenderer::new(device, RendererConfig::default()).unwrap())
    }

    fn scene(device: &DeviceRef) -> SceneSnapshot {
        scene_with_frames(device, 2)
    }

    fn scene_with_frames(device: &DeviceRef, frames: usize) -> SceneSnapshot {
        let mut store = MaterialStore::new(device, 16, frames).unwrap();
        let mat = store
            .create(MaterialType::Lambert, SurfaceParams::lambert(Vec3::splat(0.8)))
            .unwrap();
        let (v, i) = quad_geometry(2.0);
        let mesh = MeshBuffers::upload(device, "quad", &v, &i, Mat4::IDENTITY).unwrap();
        let mut scene = SceneSnapshot::new(Arc::new(RwLock::new(store)), Camera::default());
        scene.add_object(&mesh, mat, Mat4::IDENTITY);
        scene.add_light(LightDesc::Point {
            position: Vec3::new(0.0, 0.0, 2.0),
            color: Vec3::ONE,
            intensity: 4.0,
        });
        scene
    }

    fn params(dir: &std::path::Path) -> RenderParams {
        RenderParams {
            width: 8,
            height: 8,
            samples: 4,
            batch_size: 2,
            max_depth: 2,
            output: dir.join("out.png"),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_releases_slots() {
        let dir = tempfile::tempdir().unwrap();
        let (_host, r) = renderer();
        let scene = scene(r.device());
        let outcome = r.render(&scene, &params(dir.path())).unwrap();
        assert!(matches!(outcome, RenderOutcome::Completed(ref rep) if rep.batches == 2));
        let res = r.resources.lock();
        assert_eq!(res.instances.live_count(), 0);
        assert_eq!(res.lights.live_count(), 0);
    }

    #[test]
    fn test_invalid_params_leave_state() {
        let dir = tempfile::tempdir().unwrap();
        let (host, r) = renderer();
        let scene = scene(r.device());
        let bad = RenderParams {
            samples: 3,
            ..params(dir.path())
        };
        assert!(matches!(r.render(&scene, &bad), Err(Error::InvalidRenderParams(_))));
        assert_eq!(r.state(), RenderState::Idle);
        assert_eq!(host.traces_submitted(), 0);
    }

    #[test]
    fn test_material_replicas_checked_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let (host, r) = renderer();
        let short = scene_with_frames(r.device(), 1);
        for _ in 0..2 {
            assert!(matches!(r.render(&short, &params(dir.path())), Err(Error::InvalidScene(_))));
            assert_eq!(r.state(), RenderState::Idle);
        }
        assert_eq!(host.traces_submitted(), 0);

        // Every frame index in the cycle is reachable with a matching store
        let scene = scene(r.device());
        for _ in 0..3 {
            r.render(&scene, &params(dir.path())).unwrap();
        }
        assert_eq!(r.state(), RenderState::Done);
    }

    #[test]
    fn test_duplicate_lights_share_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let device: DeviceRef = Arc::new(HostDevice::default());
        let config = RendererConfig {
            light_capacity: 2,
            ..Default::default()
        };
        let r = ProgressiveRenderer::new(device.clone(), config).unwrap();
        let mut scene = scene(&device);
        let light = scene.lights[0];
        scene.add_light(light);
        scene.add_light(light);
        scene.add_light(LightDesc::Point {
            position: Vec3::new(1.0, 0.0, 2.0),
            color: Vec3::ONE,
            intensity: 1.0,
        });
        // Four lights, two distinct
        r.render(&scene, &params(dir.path())).unwrap();

        scene.add_light(LightDesc::Point {
            position: Vec3::new(-1.0, 0.0, 2.0),
            color: Vec3::ONE,
            intensity: 1.0,
        });
        let err = r.render(&scene, &params(dir.path())).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { capacity: 2 }), "{err}");
        assert_eq!(r.state(), RenderState::Failed(FailureReason::Build));
        assert_eq!(r.resources.lock().lights.live_count(), 0);
    }

    #[test]
    fn test_device_lost_classified() {
        let dir = tempfile::tempdir().unwrap();
        let (host, r) = renderer();
        let scene = scene(r.device());
        host.set_faults(FaultPlan {
            lose_device_on_trace: Some(1),
            ..Default::default()
        });
        let err = r.render(&scene, &params(dir.path())).unwrap_err();
        assert!(matches!(err, Error::DeviceLost(_)), "{err}");
        assert_eq!(r.state(), RenderState::Failed(FailureReason::DeviceLost));
        assert_eq!(r.render_progress(), 0.5);
        assert!(!dir.path().join("out.png").exists());
    }

    #[test]
    fn test_unsupported_format() {
        let mut caps = HostDevice::default_capabilities();
        caps.storage_image_formats = vec![ImageFormat::Rgba8Unorm];
        let device: DeviceRef = Arc::new(HostDevice::new(HostDeviceConfig {
            capabilities: caps,
            ..Default::default()
        }));
        assert!(matches!(
            ProgressiveRenderer::new(device, RendererConfig::default()),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_failure_reasons() {
        assert_eq!(
            failure_reason(&Error::BatchTimeout {
                batch: 0,
                total: 1,
                timeout: Duration::from_millis(1)
            }),
            FailureReason::Timeout
        );
        assert_eq!(failure_reason(&Error::EmptyGeometry), FailureReason::Build);
        assert_eq!(failure_reason(&Error::DeviceLost("x")), FailureReason::DeviceLost);
    }
}
