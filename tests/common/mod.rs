//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use glam::{Mat4, Vec3};
use parking_lot::{Mutex, RwLock};

use rtcore::device::host::{FaultPlan, HostDevice, HostDeviceConfig};
use rtcore::device::DeviceRef;
use rtcore::render::{RenderObserver, RenderParams, RenderState, RenderStatus};
use rtcore::scene::{quad_geometry, Camera, LightDesc, MaterialStore, SceneSnapshot};
use rtcore::scene::MeshBuffers;
use surface_params::{MaterialType, SurfaceParams};

pub fn host_device() -> (Arc<HostDevice>, DeviceRef) {
    host_device_with(FaultPlan::default())
}

pub fn host_device_with(faults: FaultPlan) -> (Arc<HostDevice>, DeviceRef) {
    let host = Arc::new(HostDevice::new(HostDeviceConfig {
        faults,
        ..Default::default()
    }));
    let device: DeviceRef = host.clone();
    (host, device)
}

/// One 2-triangle quad, one Lambert material, one point light.
pub fn quad_scene(device: &DeviceRef) -> SceneSnapshot {
    let mut store = MaterialStore::new(device, 8, 2).unwrap();
    let material = store
        .create(MaterialType::Lambert, SurfaceParams::lambert(Vec3::new(0.8, 0.8, 0.8)))
        .unwrap();
    let (vertices, indices) = quad_geometry(2.0);
    let mesh = MeshBuffers::upload(device, "quad", &vertices, &indices, Mat4::IDENTITY).unwrap();

    let mut scene = SceneSnapshot::new(Arc::new(RwLock::new(store)), Camera::look_at(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO));
    scene.add_object(&mesh, material, Mat4::IDENTITY);
    scene.add_light(LightDesc::Point {
        position: Vec3::new(0.0, 0.0, 2.0),
        color: Vec3::ONE,
        intensity: 4.0,
    });
    scene
}

pub fn small_params(dir: &Path, samples: u32, batch_size: u32) -> RenderParams {
    RenderParams {
        width: 16,
        height: 16,
        samples,
        batch_size,
        max_depth: 2,
        output: dir.join("render.png"),
        ..Default::default()
    }
}

/// Records every callback with the progress seen at that moment.
#[derive(Default)]
pub struct Recorder {
    pub states: Mutex<Vec<RenderState>>,
    pub batches: Mutex<Vec<(u32, u32, f32)>>,
    /// Renderer progress read when each render entered `Building`
    pub building_progress: Mutex<Vec<f32>>,
    status: Option<Arc<RenderStatus>>,
}

impl Recorder {
    /// Also sample `status` progress on every `Building` transition.
    pub fn watching(status: Arc<RenderStatus>) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

impl RenderObserver for Recorder {
    fn state_changed(&self, state: RenderState) {
        if let (RenderState::Building, Some(status)) = (state, &self.status) {
            self.building_progress.lock().push(status.progress());
        }
        self.states.lock().push(state);
    }

    fn batch_completed(&self, batch: u32, total: u32, progress: f32) {
        self.batches.lock().push((batch, total, progress));
    }
}

/// Files directly inside `dir`.
pub fn files_in(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    files
}
