//! BVH node layout and traversal for the host device.
//!
//! Flat array layout, same as a GPU traversal would read it:
//! - 32-byte nodes, index 0 = root
//! - leaves reference a contiguous range of the reordered primitive list

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn from_points(points: &[Vec3]) -> Self {
        let mut b = Self::EMPTY;
        for p in points {
            b.grow_point(*p);
        }
        b
    }

    /// Grow to include a point.
    #[inline]
    pub fn grow_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Grow to include another AABB.
    #[inline]
    pub fn grow(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Surface area (for SAH cost).
    #[inline]
    pub fn area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.max - self.min;
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Centroid of the AABB.
    #[inline]
    pub fn centroid(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Slab test; entry distance when the ray overlaps `[t_min, t_max]`.
    #[inline]
    pub fn hit(&self, ray: &Ray, t_min: f32, t_max: f32) -> Option<f32> {
        let t0 = (self.min - ray.origin) * ray.inv_dir;
        let t1 = (self.max - ray.origin) * ray.inv_dir;
        let near = t0.min(t1).max_element().max(t_min);
        let far = t0.max(t1).min_element().min(t_max);
        (near <= far).then_some(near)
    }

    /// Bounds of this box after an affine transform (8 corners).
    pub fn transformed(&self, xf: &crate::util::Transform3x4) -> Aabb {
        let mut out = Aabb::EMPTY;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.grow_point(xf.transform_point(corner));
        }
        out
    }
}

/// BVH node (32 bytes).
///
/// Internal node: left_or_first = left child index (right = left + 1), count = 0
/// Leaf node: left_or_first = first primitive slot, count > 0
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BvhNode {
    pub aabb_min: [f32; 3],
    pub left_or_first: u32,
    pub aabb_max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    #[inline]
    pub fn bounds(&self) -> Aabb {
        Aabb {
            min: Vec3::from_array(self.aabb_min),
            max: Vec3::from_array(self.aabb_max),
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }
}

/// Built BVH.
#[derive(Debug, Clone)]
pub struct Bvh {
    /// Flat node array (index 0 = root).
    pub nodes: Vec<BvhNode>,
    /// Reordered primitive indices (leaves reference into this).
    pub prim_indices: Vec<u32>,
}

/// Ray with cached reciprocal direction.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec3,
    pub dir: Vec3,
    pub inv_dir: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, dir: Vec3) -> Self {
        Self {
            origin,
            dir,
            inv_dir: dir.recip(),
        }
    }

    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.dir * t
    }
}

const STACK_DEPTH: usize = 64;

impl Bvh {
    /// Bounds of the whole tree.
    pub fn bounds(&self) -> Aabb {
        self.nodes.first().map(BvhNode::bounds).unwrap_or(Aabb::EMPTY)
    }

    /// Walk every leaf the ray overlaps.
    ///
    /// `test(prim, t_max)` returns the hit distance when the primitive is hit
    /// closer than `t_max`. With `first_hit` traversal stops at the first
    /// accepted hit (shadow rays). Returns the closest accepted primitive.
    pub fn traverse(
        &self,
        ray: &Ray,
        t_min: f32,
        t_max: f32,
        first_hit: bool,
        mut test: impl FnMut(u32, f32) -> Option<f32>,
    ) -> Option<(u32, f32)> {
        if self.prim_indices.is_empty() {
            return None;
        }
        let mut closest: Option<(u32, f32)> = None;
        let mut t_max = t_max;
        let mut stack = [0u32; STACK_DEPTH];
        let mut sp = 0usize;
        stack[sp] = 0;
        sp += 1;

        while sp > 0 {
            sp -= 1;
            let node = &self.nodes[stack[sp] as usize];
            if node.bounds().hit(ray, t_min, t_max).is_none() {
                continue;
            }
            if node.is_leaf() {
                let first = node.left_or_first as usize;
                for &prim in &self.prim_indices[first..first + node.count as usize] {
                    if let Some(t) = test(prim, t_max) {
                        t_max = t;
                        closest = Some((prim, t));
                        if first_hit {
                            return closest;
                        }
                    }
                }
                continue;
            }
            let left = node.left_or_first;
            let right = left + 1;
            // Near child last so it is popped first
            let near_left = {
                let l = self.nodes[left as usize].bounds().hit(ray, t_min, t_max);
                let r = self.nodes[right as usize].bounds().hit(ray, t_min, t_max);
                match (l, r) {
                    (Some(a), Some(b)) => a <= b,
                    (Some(_), None) => true,
                    _ => false,
                }
            };
            if sp + 2 > STACK_DEPTH {
                // Pathological depth; degrade to the near child only
                stack[sp] = if near_left { left } else { right };
                sp += 1;
                continue;
            }
            if near_left {
                stack[sp] = right;
                stack[sp + 1] = left;
            } else {
                stack[sp] = left;
                stack[sp + 1] = right;
            }
            sp += 2;
        }
        closest
    }
}

/// Möller-Trumbore ray/triangle test. Returns `(t, u, v)`.
#[inline]
pub fn intersect_triangle(ray: &Ray, tri: &[Vec3; 3], t_min: f32, t_max: f32) -> Option<(f32, f32, f32)> {
    let e1 = tri[1] - tri[0];
    let e2 = tri[2] - tri[0];
    let p = ray.dir.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1e-10 {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = ray.origin - tri[0];
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = ray.dir.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    (t > t_min && t < t_max).then_some((t, u, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_size() {
        assert_eq!(std::mem::size_of::<BvhNode>(), 32);
    }

    #[test]
    fn test_aabb_hit() {
        let b = Aabb {
            min: Vec3::splat(-1.0),
            max: Vec3::splat(1.0),
        };
        let ray = Ray::new(Vec3::new(0.0, 0.0, -5.0), Vec3::Z);
        let t = b.hit(&ray, 0.0, f32::INFINITY).expect("hit");
        assert!((t - 4.0).abs() < 1e-5);

        let miss = Ray::new(Vec3::new(3.0, 0.0, -5.0), Vec3::Z);
        assert!(b.hit(&miss, 0.0, f32::INFINITY).is_none());
    }

    #[test]
    fn test_triangle_hit() {
        let tri = [Vec3::new(-1.0, -1.0, 0.0), Vec3::new(1.0, -1.0, 0.0), Vec3::new(0.0, 1.0, 0.0)];
        let ray = Ray::new(Vec3::new(0.0, 0.0, -2.0), Vec3::Z);
        let (t, u, v) = intersect_triangle(&ray, &tri, 1e-4, f32::INFINITY).expect("hit");
        assert!((t - 2.0).abs() < 1e-5);
        assert!(u >= 0.0 && v >= 0.0 && u + v <= 1.0);

        let away = Ray::new(Vec3::new(0.0, 0.0, -2.0), -Vec3::Z);
        assert!(intersect_triangle(&away, &tri, 1e-4, f32::INFINITY).is_none());
    }

    #[test]
    fn test_transformed_bounds() {
        let b = Aabb {
            min: Vec3::ZERO,
            max: Vec3::ONE,
        };
        let xf = crate::util::Transform3x4::from_mat4(&glam::Mat4::from_translation(Vec3::new(2.0, 0.0, 0.0)));
        let t = b.transformed(&xf);
        assert_eq!(t.min, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(t.max, Vec3::new(3.0, 1.0, 1.0));
    }
}
