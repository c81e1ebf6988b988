//! Scene inputs handed to the render loop.
//!
//! The scene graph itself lives elsewhere; what arrives here is already
//! flattened: meshes resident on the device, material records in a
//! [`MaterialStore`], `(mesh, material, world transform)` triples, lights and
//! a camera.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use surface_params::{MaterialType, SurfaceParams};

use crate::accel::BottomLevelInput;
use crate::alloc::{BlockAllocator, SlotHandle};
use crate::device::{BufferUsage, DeviceAddress, DeviceBuffer, DeviceRef};
use crate::records::{LightRecord, MaterialRecord};
use crate::util::{Error, Result, Transform3x4};

/// Interleaved vertex (32 bytes). Position first, as acceleration structure
/// builds expect.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub u: f32,
    pub normal: [f32; 3],
    pub v: f32,
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            u: uv.x,
            normal: normal.to_array(),
            v: uv.y,
        }
    }
}

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

/// Vertex and index buffers of one mesh.
pub struct MeshBuffers {
    id: u64,
    label: String,
    vertices: DeviceBuffer,
    indices: DeviceBuffer,
    vertex_count: u32,
    triangle_count: u32,
    local_transform: Transform3x4,
}

impl MeshBuffers {
    /// Upload a triangle mesh. `local_transform` is baked into its acceleration structure.
    pub fn upload(
        device: &DeviceRef,
        label: &str,
        vertices: &[Vertex],
        indices: &[u32],
        local_transform: Mat4,
    ) -> Result<Arc<Self>> {
        if indices.len() % 3 != 0 {
            return Err(Error::InvalidScene(format!(
                "mesh '{label}': index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(Error::InvalidScene(format!(
                "mesh '{label}': index {bad} out of range ({} vertices)",
                vertices.len()
            )));
        }
        let vb = DeviceBuffer::with_data(device, label, bytemuck::cast_slice(vertices), BufferUsage::AccelInput)?;
        let ib = DeviceBuffer::with_data(device, label, bytemuck::cast_slice(indices), BufferUsage::AccelInput)?;
        Ok(Arc::new(Self {
            id: NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed),
            label: label.to_string(),
            vertices: vb,
            indices: ib,
            vertex_count: vertices.len() as u32,
            triangle_count: (indices.len() / 3) as u32,
            local_transform: Transform3x4::from_mat4(&local_transform),
        }))
    }

    /// Process-unique id, stable for the mesh's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn vertex_address(&self) -> DeviceAddress {
        self.vertices.address()
    }

    pub fn index_address(&self) -> DeviceAddress {
        self.indices.address()
    }

    pub fn vertex_stride(&self) -> u32 {
        std::mem::size_of::<Vertex>() as u32
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    pub fn local_transform(&self) -> &Transform3x4 {
        &self.local_transform
    }

    pub fn blas_input(&self) -> BottomLevelInput {
        BottomLevelInput {
            vertex_address: self.vertex_address(),
            vertex_stride: self.vertex_stride(),
            vertex_count: self.vertex_count,
            index_address: self.index_address(),
            triangle_count: self.triangle_count,
            transform: self.local_transform,
        }
    }
}

impl std::fmt::Debug for MeshBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshBuffers")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("triangles", &self.triangle_count)
            .finish()
    }
}

/// Material reference held by scene objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MaterialHandle {
    slot: SlotHandle,
    ty: MaterialType,
}

impl MaterialHandle {
    pub fn slot(&self) -> SlotHandle {
        self.slot
    }

    pub fn material_type(&self) -> MaterialType {
        self.ty
    }
}

/// Owns the material record table.
pub struct MaterialStore {
    records: BlockAllocator<MaterialRecord>,
}

impl MaterialStore {
    pub fn new(device: &DeviceRef, capacity: u32, frames: usize) -> Result<Self> {
        Ok(Self {
            records: BlockAllocator::new(device, "materials", capacity, frames)?,
        })
    }

    pub fn create(&mut self, ty: MaterialType, surface: SurfaceParams) -> Result<MaterialHandle> {
        let slot = self.records.insert(MaterialRecord::new(ty, surface))?;
        Ok(MaterialHandle { slot, ty })
    }

    /// Replace parameters; the type tag is fixed at creation.
    pub fn update(&mut self, handle: MaterialHandle, surface: SurfaceParams) -> Result<()> {
        self.records.get_mut(handle.slot)?.surface = surface;
        Ok(())
    }

    pub fn destroy(&mut self, handle: MaterialHandle) -> Result<()> {
        self.records.free(handle.slot)
    }

    pub fn get(&self, handle: MaterialHandle) -> Result<&MaterialRecord> {
        self.records.get(handle.slot)
    }

    pub fn upload(&self, frame: usize) -> Result<()> {
        self.records.upload_range(frame, 0..self.records.high_water())
    }

    pub fn replica_address(&self, frame: usize) -> Result<DeviceAddress> {
        self.records.replica_address(frame)
    }

    pub fn live_count(&self) -> u32 {
        self.records.live_count()
    }

    /// Device replicas kept, one per frame in flight.
    pub fn frames(&self) -> usize {
        self.records.frames()
    }

    pub fn records(&self) -> &BlockAllocator<MaterialRecord> {
        &self.records
    }
}

/// Light as described by the scene.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LightDesc {
    Point { position: Vec3, color: Vec3, intensity: f32 },
    /// `direction` points from the scene towards the light
    Directional { direction: Vec3, color: Vec3, intensity: f32 },
}

impl LightDesc {
    pub fn record(&self) -> LightRecord {
        match *self {
            LightDesc::Point {
                position,
                color,
                intensity,
            } => LightRecord::point(position, color, intensity),
            LightDesc::Directional {
                direction,
                color,
                intensity,
            } => LightRecord::directional(direction, color, intensity),
        }
    }
}

/// Pinhole camera.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees
    pub fov_y: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 3.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y: 45.0,
        }
    }
}

impl Camera {
    pub fn look_at(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            ..Default::default()
        }
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y.to_radians(), aspect, 0.01, 1000.0)
    }
}

/// One instance of a mesh.
#[derive(Clone, Debug)]
pub struct SceneObject {
    pub mesh: Arc<MeshBuffers>,
    pub material: MaterialHandle,
    pub transform: Mat4,
}

/// Everything one render reads. Cheap to clone and safe to send to a worker.
#[derive(Clone)]
pub struct SceneSnapshot {
    pub materials: Arc<RwLock<MaterialStore>>,
    pub objects: Vec<SceneObject>,
    pub lights: Vec<LightDesc>,
    pub camera: Camera,
}

impl SceneSnapshot {
    pub fn new(materials: Arc<RwLock<MaterialStore>>, camera: Camera) -> Self {
        Self {
            materials,
            objects: Vec::new(),
            lights: Vec::new(),
            camera,
        }
    }

    pub fn add_object(&mut self, mesh: &Arc<MeshBuffers>, material: MaterialHandle, transform: Mat4) {
        self.objects.push(SceneObject {
            mesh: mesh.clone(),
            material,
            transform,
        });
    }

    pub fn add_light(&mut self, light: LightDesc) {
        self.lights.push(light);
    }
}

/// Two-triangle square in the XY plane facing +Z, `size` wide.
pub fn quad_geometry(size: f32) -> (Vec<Vertex>, Vec<u32>) {
    let h = size * 0.5;
    let n = Vec3::Z;
    let vertices = vec![
        Vertex::new(Vec3::new(-h, -h, 0.0), n, Vec2::new(0.0, 0.0)),
        Vertex::new(Vec3::new(h, -h, 0.0), n, Vec2::new(1.0, 0.0)),
        Vertex::new(Vec3::new(h, h, 0.0), n, Vec2::new(1.0, 1.0)),
        Vertex::new(Vec3::new(-h, h, 0.0), n, Vec2::new(0.0, 1.0)),
    ];
    (vertices, vec![0, 1, 2, 0, 2, 3])
}
