//! SAH-based BVH builder.
//!
//! Constructs a flat BVH array from primitive bounds. The same builder serves
//! bottom-level structures (triangles) and top-level structures (instance
//! bounds in world space).

use super::bvh::{Aabb, Bvh, BvhNode};

/// Number of SAH bins for split evaluation.
const NUM_BINS: usize = 12;

/// Cost ratio: traversal vs intersection.
const TRAVERSAL_COST: f32 = 1.0;
const INTERSECT_COST: f32 = 1.0;

/// Maximum primitives per leaf before forcing a split.
const MAX_LEAF_SIZE: usize = 4;

/// SAH bin for evaluating split candidates.
struct Bin {
    bounds: Aabb,
    count: usize,
}

impl Bin {
    fn new() -> Self {
        Self {
            bounds: Aabb::EMPTY,
            count: 0,
        }
    }
}

const EMPTY_NODE: BvhNode = BvhNode {
    aabb_min: [0.0; 3],
    left_or_first: 0,
    aabb_max: [0.0; 3],
    count: 0,
};

fn leaf(bounds: &Aabb, first: usize, count: usize) -> BvhNode {
    BvhNode {
        aabb_min: bounds.min.to_array(),
        left_or_first: first as u32,
        aabb_max: bounds.max.to_array(),
        count: count as u32,
    }
}

/// Build a BVH over primitive bounds using SAH.
///
/// Returns a flat node array + reordered primitive index list.
/// Bounds are NOT modified; indices map into the original slice.
#[tracing::instrument(skip_all, fields(prim_count = bounds.len()))]
pub fn build_bvh(bounds: &[Aabb]) -> Bvh {
    let n = bounds.len();
    if n == 0 {
        return Bvh {
            nodes: vec![EMPTY_NODE],
            prim_indices: vec![],
        };
    }

    let centroids: Vec<[f32; 3]> = bounds.iter().map(|b| b.centroid().to_array()).collect();

    // Working index array (reordered by partitioning)
    let mut indices: Vec<u32> = (0..n as u32).collect();

    // Worst case: 2*n - 1 for a full binary tree
    let mut nodes: Vec<BvhNode> = Vec::with_capacity(2 * n);
    nodes.push(EMPTY_NODE);

    // Explicit stack instead of recursion for large scenes
    struct Task {
        node_idx: usize,
        start: usize,
        end: usize, // exclusive
    }

    let mut stack = vec![Task {
        node_idx: 0,
        start: 0,
        end: n,
    }];

    while let Some(task) = stack.pop() {
        let start = task.start;
        let end = task.end;
        let count = end - start;

        let mut node_aabb = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            node_aabb.grow(&bounds[idx as usize]);
        }

        if count <= MAX_LEAF_SIZE {
            nodes[task.node_idx] = leaf(&node_aabb, start, count);
            continue;
        }

        let mut centroid_bounds = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            centroid_bounds.grow_point(glam::Vec3::from_array(centroids[idx as usize]));
        }

        let (best_axis, best_split_pos, best_cost) =
            find_best_split(&indices[start..end], bounds, &centroids, &centroid_bounds);

        // Cost of not splitting (leaf cost), normalized by parent area
        let parent_area = node_aabb.area();
        let leaf_cost = count as f32 * INTERSECT_COST * parent_area;

        if best_cost >= leaf_cost || best_axis == usize::MAX {
            nodes[task.node_idx] = leaf(&node_aabb, start, count);
            continue;
        }

        let mid = partition(&mut indices[start..end], |&idx| {
            centroids[idx as usize][best_axis] < best_split_pos
        }) + start;

        // Degenerate partition: split in the middle
        let mid = if mid == start || mid == end {
            (start + end) / 2
        } else {
            mid
        };

        let left_idx = nodes.len();
        let right_idx = left_idx + 1;
        nodes.push(EMPTY_NODE);
        nodes.push(EMPTY_NODE);

        nodes[task.node_idx] = BvhNode {
            aabb_min: node_aabb.min.to_array(),
            left_or_first: left_idx as u32,
            aabb_max: node_aabb.max.to_array(),
            count: 0,
        };

        // Right first so left is processed first (depth-first)
        stack.push(Task {
            node_idx: right_idx,
            start: mid,
            end,
        });
        stack.push(Task {
            node_idx: left_idx,
            start,
            end: mid,
        });
    }

    Bvh {
        nodes,
        prim_indices: indices,
    }
}

/// SAH binned split search across all 3 axes.
/// Returns (best_axis, split_position, cost). axis=usize::MAX if no valid split.
fn find_best_split(
    indices: &[u32],
    bounds: &[Aabb],
    centroids: &[[f32; 3]],
    centroid_bounds: &Aabb,
) -> (usize, f32, f32) {
    let mut best_axis = usize::MAX;
    let mut best_pos = 0.0f32;
    let mut best_cost = f32::INFINITY;

    for axis in 0..3 {
        let extent = centroid_bounds.max[axis] - centroid_bounds.min[axis];
        if extent < 1e-8 {
            continue; // degenerate axis
        }

        let mut bins: Vec<Bin> = (0..NUM_BINS).map(|_| Bin::new()).collect();
        let inv_extent = NUM_BINS as f32 / extent;

        for &idx in indices {
            let idx = idx as usize;
            let bin_id = ((centroids[idx][axis] - centroid_bounds.min[axis]) * inv_extent) as usize;
            let bin_id = bin_id.min(NUM_BINS - 1);
            bins[bin_id].bounds.grow(&bounds[idx]);
            bins[bin_id].count += 1;
        }

        // Sweep from left: prefix areas and counts
        let mut left_area = [0.0f32; NUM_BINS - 1];
        let mut left_count = [0usize; NUM_BINS - 1];
        let mut sweep = Aabb::EMPTY;
        let mut sweep_count = 0;
        for i in 0..NUM_BINS - 1 {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            left_area[i] = sweep.area();
            left_count[i] = sweep_count;
        }

        // Sweep from right and evaluate SAH cost
        sweep = Aabb::EMPTY;
        sweep_count = 0;
        for i in (1..NUM_BINS).rev() {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            let cost = TRAVERSAL_COST
                + INTERSECT_COST
                    * (left_count[i - 1] as f32 * left_area[i - 1] + sweep_count as f32 * sweep.area());

            if cost < best_cost {
                best_cost = cost;
                best_axis = axis;
                best_pos = centroid_bounds.min[axis] + (i as f32 / NUM_BINS as f32) * extent;
            }
        }
    }

    (best_axis, best_pos, best_cost)
}

/// Partition slice in-place. Returns count of elements where predicate is true.
fn partition<T, F>(slice: &mut [T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();
    while left < right {
        if pred(&slice[left]) {
            left += 1;
        } else {
            right -= 1;
            slice.swap(left, right);
        }
    }
    left
}
