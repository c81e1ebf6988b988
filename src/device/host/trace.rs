//! CPU path tracer behind [`HostDevice::submit_trace`](super::HostDevice).
//!
//! Plays the role of the device programs. The ray generation program
//! accumulates `samples_this_batch` paths per pixel into the radiance target;
//! closest-hit and miss programs are looked up per ray through the miss and
//! hit regions of the dispatch table, so a wrong dispatch offset shades with
//! the wrong program exactly as it would on hardware.
//!
//! Ray types:
//! - primary / secondary: closest hit shades with the program's material type,
//!   miss returns the background
//! - next-event: any hit means occluded, miss means the light is visible

use std::f32::consts::PI;

use glam::{Mat4, Vec3, Vec4};
use rayon::prelude::*;
use surface_params::MaterialType;

use crate::device::{
    DeviceAddress, DeviceResult, DeviceStatus, ImageId, RayType, SbtRegion, ShaderGroup, TraceBindings,
    TraceDispatch,
};
use crate::records::{frame_flags, BatchState, FrameConstants, GpuRecord, InstanceRecord, LightKind, LightRecord, MaterialRecord};

use super::bvh::{intersect_triangle, Ray};
use super::{decode_handle, HostPipeline, State, TopData, LIGHT_STRIDE, MATERIAL_STRIDE};

/// Self-intersection offset along the normal.
const RAY_EPSILON: f32 = 1e-3;
const T_MIN: f32 = 1e-4;

/// Hash from "Hash Functions for GPU Rendering" (Jarzynski, Olano).
#[inline]
pub(crate) fn pcg_hash(input: u32) -> u32 {
    let state = input.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

struct Rng(u32);

impl Rng {
    fn new(pixel: u32, frame_seed: u32, sample: u32) -> Self {
        Self(pcg_hash(pixel ^ pcg_hash(frame_seed ^ pcg_hash(sample))))
    }

    /// Uniform in `[0, 1)`.
    #[inline]
    fn next_f32(&mut self) -> f32 {
        self.0 = pcg_hash(self.0);
        (self.0 >> 8) as f32 / (1u32 << 24) as f32
    }
}

/// Texels produced by one dispatch.
pub(super) struct TraceOutput {
    radiance: Vec<[f32; 4]>,
    albedo: Option<Vec<[f32; 4]>>,
    normal: Option<Vec<[f32; 4]>>,
}

/// Programs reachable through the dispatch table regions.
struct ProgramTable {
    miss: Vec<Option<RayType>>,
    hit: Vec<Option<MaterialType>>,
}

impl ProgramTable {
    fn resolve(state: &State, dispatch: &TraceDispatch, handle_size: u64) -> DeviceResult<Self> {
        let pipeline = state.pipeline(dispatch.pipeline)?;
        let entry = |region: &SbtRegion, i: u64| -> DeviceResult<Option<ShaderGroup>> {
            let bytes = state.bytes(region.address.offset(i * region.stride), handle_size)?;
            Ok(group_of(pipeline, decode_handle(bytes, dispatch.pipeline)))
        };

        let raygen = SbtRegion {
            stride: dispatch.raygen.stride.max(handle_size),
            ..dispatch.raygen
        };
        if entry(&raygen, 0)? != Some(ShaderGroup::RayGen) {
            return Err(DeviceStatus::UNKNOWN);
        }

        let mut miss = Vec::new();
        for i in 0..region_entries(&dispatch.miss)? {
            miss.push(match entry(&dispatch.miss, i)? {
                Some(ShaderGroup::Miss(ray)) => Some(ray),
                _ => None,
            });
        }
        let mut hit = Vec::new();
        for i in 0..region_entries(&dispatch.hit)? {
            hit.push(match entry(&dispatch.hit, i)? {
                Some(ShaderGroup::Hit { material, .. }) => Some(material),
                _ => None,
            });
        }
        Ok(Self { miss, hit })
    }

    fn miss(&self, ray: RayType) -> Option<RayType> {
        self.miss.get(ray.ordinal() as usize).copied().flatten()
    }

    fn hit(&self, sbt_offset: u32, ray: RayType) -> Option<MaterialType> {
        self.hit
            .get((sbt_offset + ray.ordinal()) as usize)
            .copied()
            .flatten()
    }
}

fn region_entries(region: &SbtRegion) -> DeviceResult<u64> {
    if region.stride == 0 {
        return Err(DeviceStatus::UNKNOWN);
    }
    Ok(region.size / region.stride)
}

fn group_of(pipeline: &HostPipeline, index: Option<u32>) -> Option<ShaderGroup> {
    index.and_then(|i| pipeline.groups.get(i as usize).copied())
}

struct Hit {
    instance: usize,
    prim: u32,
    t: f32,
    u: f32,
    v: f32,
}

/// Shading inputs at a hit point.
struct Surface {
    position: Vec3,
    /// Shading normal facing the incoming ray
    normal: Vec3,
    front_face: bool,
    params: surface_params::SurfaceParams,
}

/// Everything one dispatch reads, resolved up front.
struct Scene<'a> {
    state: &'a State,
    top: &'a TopData,
    bindings: &'a TraceBindings,
    programs: ProgramTable,
    frame: FrameConstants,
    batch: BatchState,
    lights: Vec<LightRecord>,
}

impl Scene<'_> {
    fn intersect(&self, ray: &Ray, t_max: f32, any_hit: bool) -> Option<Hit> {
        let mut found = None;
        self.top.bvh.traverse(ray, T_MIN, t_max, any_hit, |inst_idx, t_max| {
            let inst = &self.top.instances[inst_idx as usize];
            if inst.mask == 0 {
                return None;
            }
            let local = Ray::new(
                inst.world_to_object.transform_point(ray.origin),
                inst.world_to_object.transform_vector(ray.dir),
            );
            let mut bary = (0.0, 0.0);
            let hit = inst.blas.bvh.traverse(&local, T_MIN, t_max, any_hit, |prim, t_max| {
                intersect_triangle(&local, &inst.blas.triangles[prim as usize], T_MIN, t_max).map(|(t, u, v)| {
                    bary = (u, v);
                    t
                })
            });
            hit.map(|(prim, t)| {
                found = Some(Hit {
                    instance: inst_idx as usize,
                    prim,
                    t,
                    u: bary.0,
                    v: bary.1,
                });
                t
            })
        });
        found
    }

    /// Shadow ray; visibility is decided by which program runs.
    fn visible(&self, origin: Vec3, dir: Vec3, distance: f32) -> bool {
        let ray = Ray::new(origin, dir);
        match self.intersect(&ray, distance, true) {
            Some(hit) => {
                let inst = &self.top.instances[hit.instance];
                self.programs.hit(inst.sbt_offset, RayType::NextEvent).is_none()
            }
            None => self.programs.miss(RayType::NextEvent) == Some(RayType::NextEvent),
        }
    }

    fn surface(&self, ray: &Ray, hit: &Hit) -> DeviceResult<Surface> {
        let inst = &self.top.instances[hit.instance];
        let record: InstanceRecord = self.state.read_pod(
            self.bindings
                .instances
                .offset(inst.custom_index as u64 * InstanceRecord::WIRE_SIZE as u64),
        )?;
        let material: MaterialRecord = self
            .state
            .read_pod(self.bindings.materials.offset(record.material_index as u64 * MATERIAL_STRIDE))?;

        let tri = &inst.blas.triangles[hit.prim as usize];
        let geometric = inst
            .normal_to_world
            .transform_vector((tri[1] - tri[0]).cross(tri[2] - tri[0]))
            .normalize_or_zero();
        let front_face = ray.dir.dot(geometric) < 0.0;
        let facing = if front_face { geometric } else { -geometric };

        let mut normal = self.vertex_normal(&record, hit)?.unwrap_or(facing);
        if normal.dot(facing) < 0.0 {
            normal = -normal;
        }

        Ok(Surface {
            position: ray.at(hit.t),
            normal,
            front_face,
            params: material.surface,
        })
    }

    /// Interpolated vertex normal in world space, when the vertex layout has one.
    fn vertex_normal(&self, record: &InstanceRecord, hit: &Hit) -> DeviceResult<Option<Vec3>> {
        let stride = record.vertex_stride as u64;
        if stride < 28 || record.vertex_address == 0 {
            return Ok(None);
        }
        let idx: [u32; 3] = self
            .state
            .read_pod(DeviceAddress(record.index_address).offset(hit.prim as u64 * 12))?;
        let mut n = Vec3::ZERO;
        let weights = [1.0 - hit.u - hit.v, hit.u, hit.v];
        for (i, w) in idx.iter().zip(weights) {
            let vn: [f32; 3] = self
                .state
                .read_pod(DeviceAddress(record.vertex_address).offset(*i as u64 * stride + 16))?;
            n += Vec3::from_array(vn) * w;
        }
        let n = record.normal_to_world.transform_vector(n).normalize_or_zero();
        Ok((n != Vec3::ZERO).then_some(n))
    }

    /// Direct light from every bound light at a diffuse surface.
    fn direct_light(&self, surface: &Surface) -> Vec3 {
        let origin = surface.position + surface.normal * RAY_EPSILON;
        let mut total = Vec3::ZERO;
        for light in &self.lights {
            let p = Vec4::from_array(light.position_or_direction).truncate();
            let (dir, distance, falloff) = match light.kind() {
                Some(LightKind::Point) => {
                    let to_light = p - origin;
                    let d2 = to_light.length_squared();
                    if d2 <= 0.0 {
                        continue;
                    }
                    let d = d2.sqrt();
                    (to_light / d, d - RAY_EPSILON, 1.0 / d2)
                }
                Some(LightKind::Directional) => (p.normalize_or_zero(), f32::INFINITY, 1.0),
                None => continue,
            };
            let cos = surface.normal.dot(dir);
            if cos <= 0.0 || !self.visible(origin, dir, distance) {
                continue;
            }
            total += light.radiance() * falloff * cos;
        }
        total
    }

    fn camera_ray(&self, x: u32, y: u32, width: u32, height: u32, rng: &mut Rng) -> Ray {
        let inv_view = Mat4::from_cols_array_2d(&self.frame.inv_view);
        let inv_proj = Mat4::from_cols_array_2d(&self.frame.inv_proj);
        let px = (x as f32 + rng.next_f32()) / width as f32;
        let py = (y as f32 + rng.next_f32()) / height as f32;
        let ndc = Vec4::new(px * 2.0 - 1.0, 1.0 - py * 2.0, 1.0, 1.0);
        let target = inv_proj * ndc;
        let view_dir = (target.truncate() / target.w).normalize();
        let dir = (inv_view * view_dir.extend(0.0)).truncate().normalize();
        let origin = Vec4::from_array(self.frame.camera_position).truncate();
        Ray::new(origin, dir)
    }

    fn background(&self) -> Vec3 {
        Vec4::from_array(self.frame.background).truncate()
    }

    /// One path. Returns radiance and the first-hit albedo/normal.
    fn path(&self, mut ray: Ray, rng: &mut Rng) -> DeviceResult<(Vec3, Option<(Vec3, Vec3)>)> {
        let mut radiance = Vec3::ZERO;
        let mut throughput = Vec3::ONE;
        let mut first = None;

        for depth in 0..self.batch.max_depth {
            let ray_type = if depth == 0 { RayType::Primary } else { RayType::Secondary };
            let Some(hit) = self.intersect(&ray, f32::INFINITY, false) else {
                if self.programs.miss(ray_type).is_some() {
                    radiance += throughput * self.background();
                }
                break;
            };
            let inst = &self.top.instances[hit.instance];
            let Some(program) = self.programs.hit(inst.sbt_offset, ray_type) else {
                break;
            };
            let surface = self.surface(&ray, &hit)?;
            let albedo = surface.params.albedo();
            if first.is_none() {
                first = Some((albedo, surface.normal));
            }

            let next_dir = match program {
                MaterialType::Emissive => {
                    radiance += throughput * surface.params.emission();
                    break;
                }
                MaterialType::Lambert => {
                    radiance += throughput * albedo / PI * self.direct_light(&surface);
                    Some(cosine_hemisphere(surface.normal, rng))
                }
                MaterialType::Metal => {
                    let reflected = reflect(ray.dir, surface.normal);
                    let fuzz = random_unit_vector(rng) * surface.params.roughness();
                    let dir = (reflected + fuzz).normalize_or_zero();
                    (dir.dot(surface.normal) > 0.0).then_some(dir)
                }
                MaterialType::Dielectric => Some(dielectric_scatter(ray.dir, &surface, rng)),
            };
            let Some(dir) = next_dir else {
                break;
            };
            throughput *= albedo;
            if throughput.max_element() <= 0.0 {
                break;
            }
            let side = if dir.dot(surface.normal) >= 0.0 { 1.0 } else { -1.0 };
            ray = Ray::new(surface.position + surface.normal * (RAY_EPSILON * side), dir);
        }
        Ok((radiance, first))
    }
}

fn reflect(d: Vec3, n: Vec3) -> Vec3 {
    d - 2.0 * d.dot(n) * n
}

fn random_unit_vector(rng: &mut Rng) -> Vec3 {
    let z = rng.next_f32() * 2.0 - 1.0;
    let a = rng.next_f32() * 2.0 * PI;
    let r = (1.0 - z * z).max(0.0).sqrt();
    Vec3::new(r * a.cos(), r * a.sin(), z)
}

fn cosine_hemisphere(n: Vec3, rng: &mut Rng) -> Vec3 {
    let dir = n + random_unit_vector(rng);
    if dir.length_squared() < 1e-8 {
        n
    } else {
        dir.normalize()
    }
}

/// Schlick approximation for Fresnel reflectance.
fn schlick(cosine: f32, ref_idx: f32) -> f32 {
    let r0 = ((1.0 - ref_idx) / (1.0 + ref_idx)).powi(2);
    r0 + (1.0 - r0) * (1.0 - cosine).powi(5)
}

fn dielectric_scatter(d: Vec3, surface: &Surface, rng: &mut Rng) -> Vec3 {
    let ior = surface.params.ior().max(1.0);
    let eta = if surface.front_face { 1.0 / ior } else { ior };
    let d = d.normalize();
    let cos = (-d).dot(surface.normal).min(1.0);
    let sin = (1.0 - cos * cos).max(0.0).sqrt();
    if eta * sin > 1.0 || schlick(cos, eta) > rng.next_f32() {
        return reflect(d, surface.normal);
    }
    let perp = eta * (d + cos * surface.normal);
    let parallel = -(1.0 - perp.length_squared()).abs().sqrt() * surface.normal;
    (perp + parallel).normalize()
}

/// Execute one dispatch against the current state.
pub(super) fn run(state: &State, dispatch: &TraceDispatch, top: &TopData, handle_size: u64) -> DeviceResult<TraceOutput> {
    let bindings = &dispatch.bindings;
    let frame: FrameConstants = state.read_pod(bindings.frame_constants)?;
    let batch: BatchState = state.read_pod(bindings.batch_state)?;

    let mut lights = Vec::with_capacity(frame.light_count as usize);
    for i in 0..frame.light_count as u64 {
        let slot: u32 = state.read_pod(bindings.light_indices.offset(i * 4))?;
        lights.push(state.read_pod::<LightRecord>(bindings.lights.offset(slot as u64 * LIGHT_STRIDE))?);
    }

    let scene = Scene {
        state,
        top,
        bindings,
        programs: ProgramTable::resolve(state, dispatch, handle_size)?,
        frame,
        batch,
        lights,
    };

    let (width, height) = (dispatch.width, dispatch.height);
    let previous = image(state, bindings.radiance, width, height)?;
    let write_aux = batch.batch_index == 0;
    let want_albedo = write_aux && frame.flags & frame_flags::WRITE_ALBEDO != 0 && bindings.albedo.is_some();
    let want_normal = write_aux && frame.flags & frame_flags::WRITE_NORMAL != 0 && bindings.normal.is_some();

    let samples = batch.samples_this_batch.max(1);
    let before = if batch.batch_index == 0 { 0 } else { batch.samples_before() };
    let first_sample = batch.batch_index * batch.samples_this_batch;

    let row = width as usize;
    let pixels: Vec<([f32; 4], Vec3, Vec3)> = (0..previous.len())
        .into_par_iter()
        .map(|i| {
            let (x, y) = ((i % row) as u32, (i / row) as u32);
            let mut sum = Vec3::ZERO;
            let mut aux = (Vec3::ZERO, Vec3::ZERO);
            for s in 0..samples {
                let mut rng = Rng::new(i as u32, frame.seed ^ frame.frame_index, first_sample + s);
                let ray = scene.camera_ray(x, y, width, height, &mut rng);
                let (l, first) = scene.path(ray, &mut rng)?;
                sum += l;
                if s == 0 {
                    aux = first.unwrap_or_default();
                }
            }
            let old = Vec4::from_array(previous[i]).truncate();
            let accumulated = (old * before as f32 + sum) / (before + samples) as f32;
            Ok::<_, DeviceStatus>((accumulated.extend(1.0).to_array(), aux.0, aux.1))
        })
        .collect::<DeviceResult<_>>()?;

    let radiance = pixels.iter().map(|p| p.0).collect();
    let albedo = want_albedo.then(|| pixels.iter().map(|p| p.1.extend(1.0).to_array()).collect());
    let normal = want_normal.then(|| pixels.iter().map(|p| p.2.extend(0.0).to_array()).collect());
    Ok(TraceOutput { radiance, albedo, normal })
}

fn image(state: &State, id: ImageId, width: u32, height: u32) -> DeviceResult<&[[f32; 4]]> {
    let img = state.images.get(&id.0).ok_or(DeviceStatus::UNKNOWN)?;
    if img.width != width || img.height != height {
        return Err(DeviceStatus::UNKNOWN);
    }
    Ok(&img.texels)
}

/// Write dispatch results into the bound images.
pub(super) fn store(state: &mut State, dispatch: &TraceDispatch, out: TraceOutput) -> DeviceResult<()> {
    let bindings = &dispatch.bindings;
    let targets = [
        (Some(bindings.radiance), Some(out.radiance)),
        (bindings.albedo, out.albedo),
        (bindings.normal, out.normal),
    ];
    for (id, texels) in targets {
        if let (Some(id), Some(texels)) = (id, texels) {
            let img = state.images.get_mut(&id.0).ok_or(DeviceStatus::UNKNOWN)?;
            if img.texels.len() != texels.len() {
                return Err(DeviceStatus::UNKNOWN);
            }
            img.texels = texels;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_range() {
        let mut rng = Rng::new(7, 3, 1);
        for _ in 0..1000 {
            let x = rng.next_f32();
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn test_schlick_limits() {
        assert!((schlick(1.0, 1.5) - 0.04).abs() < 1e-3);
        assert!((schlick(0.0, 1.5) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_hemisphere_stays_above() {
        let mut rng = Rng::new(1, 2, 3);
        for _ in 0..256 {
            let d = cosine_hemisphere(Vec3::Y, &mut rng);
            assert!(d.y >= -1e-5);
            assert!((d.length() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_reflect() {
        let r = reflect(Vec3::new(1.0, -1.0, 0.0), Vec3::Y);
        assert_eq!(r, Vec3::new(1.0, 1.0, 0.0));
    }
}
