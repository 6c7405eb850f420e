//! # Bucketed k-d tree (3D)
//!
//! This module implements the spatial index every smoothing operation runs
//! against. It is built once from a host position buffer and never changes
//! afterwards; any number of threads may query it at the same time.
//!
//! ## Build
//!
//! - Every particle gets a `Particle` record (original row, active flag and a
//!   position snapshot). The records live in one flat array whose physical
//!   order the build permutes freely.
//! - A node covers a contiguous range of that array. If the range holds at
//!   most `bucket_capacity` particles it becomes a leaf (bucket).
//! - Otherwise the node's tight bounding box picks the axis of greatest
//!   extent, the range is partitioned around its median along that axis
//!   (`select_nth_unstable_by`, ties on coordinate broken by original index)
//!   and both halves are built recursively.
//!
//! ## Queries
//!
//! Both query kinds walk down from the root and skip any subtree whose box is
//! farther from the query point than the current acceptance radius:
//!
//! - **k-nearest**: the acceptance radius is the k-th best distance found so
//!   far (a bounded max-heap). Results come back nearest first, ties broken
//!   by original index.
//! - **ball**: the acceptance radius is fixed; every active particle with
//!   `d² <= r²` is reported in traversal order.
//!
//! Distances use the minimum-image convention on any axis with a finite
//! period, and the subtree bound wraps the same way.

use tracing::{debug, info_span};

use crate::error::{KdError, KdResult};
use crate::fields::bindings::validate_positions;
use crate::fields::SharedBuffer;
use crate::index::neighbors::{KnnHeap, Neighbor, NeighborList};
use crate::index::states::{open_boundaries, periodic_dist2, Aabb, NVec3, Particle};

/// A single node of the tree.
///
/// Leaves have `children == None` and own the particles
/// `particles[lower..upper]`. Internal nodes cover the same range through
/// their two children and record the axis/value they were split on.
#[derive(Debug, Clone)]
pub struct KdNode {
    pub bbox: Aabb,
    pub split_axis: usize,
    pub split_value: f64,
    pub children: Option<[usize; 2]>, // indices into KdTree::nodes
    pub lower: usize,
    pub upper: usize,
}

impl KdNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn len(&self) -> usize {
        self.upper - self.lower
    }
}

/// The built index: particle store plus node array.
#[derive(Debug)]
pub struct KdTree {
    nodes: Vec<KdNode>,
    particles: Vec<Particle>,
    bucket_capacity: usize,
    n_active: usize,
    positions: Option<SharedBuffer>,
    root: usize,
}

impl KdTree {
    /// Build a tree over every row of `positions`, all particles active.
    ///
    /// # Parameters
    /// - `positions`: host buffer of shape (n, 3), `f64` elements. The tree
    ///   keeps a reference to it until [`KdTree::teardown`].
    /// - `bucket_capacity`: maximum particles per leaf, at least 1.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero bucket capacity or an empty buffer,
    /// `TypeMismatch` if the buffer is not an (n, 3) `f64` array.
    pub fn build(positions: SharedBuffer, bucket_capacity: usize) -> KdResult<Self> {
        Self::build_masked(positions, bucket_capacity, None)
    }

    /// Same as [`KdTree::build`], with an optional per-row active mask.
    /// Inactive particles are stored but never returned by a query.
    pub fn build_masked(
        positions: SharedBuffer,
        bucket_capacity: usize,
        active: Option<&[bool]>,
    ) -> KdResult<Self> {
        if bucket_capacity < 1 {
            return Err(KdError::invalid("bucket capacity must be at least 1"));
        }
        let n = validate_positions(&positions)?;
        if n == 0 {
            return Err(KdError::invalid("cannot build a tree over zero particles"));
        }
        if let Some(mask) = active {
            if mask.len() != n {
                return Err(KdError::invalid(format!(
                    "active mask has {} entries for {} particles",
                    mask.len(),
                    n
                )));
            }
        }

        let _span = info_span!("KdTree::build", n, bucket_capacity).entered();

        let particles: Vec<Particle> = (0..n)
            .map(|i| Particle {
                original_index: i,
                active: active.map_or(true, |mask| mask[i]),
                r: positions.point(i),
            })
            .collect();
        let n_active = particles.iter().filter(|p| p.active).count();

        let mut tree = KdTree {
            nodes: Vec::with_capacity(2 * n.div_ceil(bucket_capacity)),
            particles,
            bucket_capacity,
            n_active,
            positions: Some(positions),
            root: 0,
        };
        tree.root = tree.build_node(0, n);

        debug!(nodes = tree.nodes.len(), n_active, "tree built");
        Ok(tree)
    }

    /// Recursively build the subtree over `particles[lower..upper]` and
    /// return the index of its root node.
    fn build_node(&mut self, lower: usize, upper: usize) -> usize {
        let bbox = Aabb::enclosing(&self.particles[lower..upper]);
        let node_idx = self.nodes.len();
        self.nodes.push(KdNode {
            bbox,
            split_axis: 0,
            split_value: 0.0,
            children: None,
            lower,
            upper,
        });

        if upper - lower <= self.bucket_capacity {
            return node_idx;
        }

        let axis = bbox.widest_axis();
        let mid = lower + (upper - lower) / 2;
        self.particles[lower..upper].select_nth_unstable_by(mid - lower, |a, b| {
            a.r[axis]
                .total_cmp(&b.r[axis])
                .then(a.original_index.cmp(&b.original_index))
        });
        let split_value = self.particles[mid].r[axis];

        let left = self.build_node(lower, mid);
        let right = self.build_node(mid, upper);

        let node = &mut self.nodes[node_idx];
        node.split_axis = axis;
        node.split_value = split_value;
        node.children = Some([left, right]);
        node_idx
    }

    /// Release node memory and the position buffer reference. Calling it
    /// again is a no-op.
    pub fn teardown(&mut self) {
        if self.is_torn_down() {
            return;
        }
        self.nodes = Vec::new();
        self.particles = Vec::new();
        self.positions = None;
        self.n_active = 0;
        self.root = 0;
    }

    pub fn is_torn_down(&self) -> bool {
        self.nodes.is_empty()
    }

    // queries ==============================================================================

    /// k-nearest search around `point` into caller-owned scratch.
    ///
    /// Fills `out` with `min(k, n_active)` results sorted by
    /// (squared distance, original index) and returns that count.
    ///
    /// # Parameters
    /// - `point`  : query position.
    /// - `k`      : number of neighbours wanted.
    /// - `period` : per-axis box length, infinite for open boundaries.
    /// - `heap`   : candidate heap, reset by this call.
    /// - `out`    : result list, cleared by this call.
    pub fn k_nearest_into(
        &self,
        point: &NVec3,
        k: usize,
        period: &NVec3,
        heap: &mut KnnHeap,
        out: &mut NeighborList,
    ) -> KdResult<usize> {
        heap.reset(k.min(self.n_active));
        out.clear();
        if self.is_torn_down() || heap.k() == 0 {
            return Ok(0);
        }
        self.search_knn(self.root, point, period, heap)?;
        heap.drain_sorted(out);
        Ok(out.len())
    }

    /// Allocating k-nearest search with open boundaries.
    pub fn k_nearest(&self, point: &NVec3, k: usize) -> KdResult<Vec<Neighbor>> {
        let mut heap = KnnHeap::new(k);
        let mut out = NeighborList::with_capacity(k);
        self.k_nearest_into(point, k, &open_boundaries(), &mut heap, &mut out)?;
        Ok(self.to_neighbors(&out))
    }

    /// Radius search around `point` into caller-owned scratch.
    ///
    /// Every active particle with squared distance `<= radius2` is appended
    /// to `out`. If `out` is bounded and too small the search still counts
    /// every match, then fails with `CapacityExceeded` carrying the true
    /// count; `out` holds the first `capacity` matches in that case.
    pub fn ball_into(
        &self,
        point: &NVec3,
        radius2: f64,
        period: &NVec3,
        out: &mut NeighborList,
    ) -> KdResult<usize> {
        out.clear();
        if self.is_torn_down() {
            return Ok(0);
        }
        let mut overflow = 0;
        self.search_ball(self.root, point, radius2, period, out, &mut overflow)?;
        if overflow > 0 {
            return Err(KdError::CapacityExceeded {
                capacity: out.limit().unwrap_or(out.len()),
                required: out.len() + overflow,
            });
        }
        Ok(out.len())
    }

    /// Allocating radius search with open boundaries.
    pub fn ball(&self, point: &NVec3, radius2: f64) -> KdResult<Vec<Neighbor>> {
        let mut out = NeighborList::growable();
        self.ball_into(point, radius2, &open_boundaries(), &mut out)?;
        Ok(self.to_neighbors(&out))
    }

    fn to_neighbors(&self, list: &NeighborList) -> Vec<Neighbor> {
        list.iter()
            .map(|(index, dist2)| Neighbor {
                index,
                original: self.particles[index].original_index,
                dist2,
            })
            .collect()
    }

    // traversal ============================================================================

    fn search_knn(
        &self,
        node_idx: usize,
        point: &NVec3,
        period: &NVec3,
        heap: &mut KnnHeap,
    ) -> KdResult<()> {
        let node = self.node(node_idx)?;

        let Some([left, right]) = node.children else {
            let bucket = self.bucket(node)?;
            for (offset, p) in bucket.iter().enumerate() {
                if !p.active {
                    continue;
                }
                heap.offer(Neighbor {
                    index: node.lower + offset,
                    original: p.original_index,
                    dist2: periodic_dist2(&p.r, point, period),
                });
            }
            return Ok(());
        };

        // Nearer child first so the bound shrinks as early as possible
        let d_left = self.node(left)?.bbox.min_dist2(point, period);
        let d_right = self.node(right)?.bbox.min_dist2(point, period);
        let visits = if d_left <= d_right {
            [(left, d_left), (right, d_right)]
        } else {
            [(right, d_right), (left, d_left)]
        };

        for (child, d2) in visits {
            // `<=`: an equally distant particle may still win on original index
            if d2 <= heap.bound() {
                self.search_knn(child, point, period, heap)?;
            }
        }
        Ok(())
    }

    fn search_ball(
        &self,
        node_idx: usize,
        point: &NVec3,
        radius2: f64,
        period: &NVec3,
        out: &mut NeighborList,
        overflow: &mut usize,
    ) -> KdResult<()> {
        let node = self.node(node_idx)?;
        if node.bbox.min_dist2(point, period) > radius2 {
            return Ok(());
        }

        match node.children {
            None => {
                let bucket = self.bucket(node)?;
                for (offset, p) in bucket.iter().enumerate() {
                    if !p.active {
                        continue;
                    }
                    let d2 = periodic_dist2(&p.r, point, period);
                    if d2 <= radius2 && !out.push(node.lower + offset, d2) {
                        *overflow += 1;
                    }
                }
            }
            Some([left, right]) => {
                self.search_ball(left, point, radius2, period, out, overflow)?;
                self.search_ball(right, point, radius2, period, out, overflow)?;
            }
        }
        Ok(())
    }

    fn node(&self, node_idx: usize) -> KdResult<&KdNode> {
        self.nodes
            .get(node_idx)
            .ok_or_else(|| KdError::internal(format!("node {node_idx} does not exist")))
    }

    fn bucket(&self, node: &KdNode) -> KdResult<&[Particle]> {
        self.particles.get(node.lower..node.upper).ok_or_else(|| {
            KdError::internal(format!(
                "leaf range {}..{} outside particle store of {}",
                node.lower,
                node.upper,
                self.particles.len()
            ))
        })
    }

    // introspection ========================================================================

    /// Number of particles stored (active or not).
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn n_active(&self) -> usize {
        self.n_active
    }

    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[KdNode] {
        &self.nodes
    }

    pub fn root(&self) -> Option<&KdNode> {
        self.nodes.get(self.root)
    }

    /// Particle store in physical order.
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn particle(&self, physical: usize) -> Option<&Particle> {
        self.particles.get(physical)
    }

    pub fn original_index(&self, physical: usize) -> Option<usize> {
        self.particles.get(physical).map(|p| p.original_index)
    }

    /// Host position buffer, `None` after teardown.
    pub fn positions(&self) -> Option<&SharedBuffer> {
        self.positions.as_ref()
    }

    /// Particle counts of every leaf, in node order.
    pub fn leaf_sizes(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|node| node.is_leaf())
            .map(KdNode::len)
            .collect()
    }

    /// Walk the whole tree and confirm the structural invariants: children
    /// split their parent's range exactly, every box is tight, and no leaf
    /// exceeds the bucket capacity.
    pub fn validate(&self) -> KdResult<()> {
        if self.is_torn_down() {
            return Ok(());
        }
        let root = self.node(self.root)?;
        if root.lower != 0 || root.upper != self.particles.len() {
            return Err(KdError::internal("root does not cover every particle"));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            let tight = Aabb::enclosing(self.bucket(node)?);
            if tight != node.bbox {
                return Err(KdError::internal(format!("node {idx} bounds are not tight")));
            }
            match node.children {
                None if node.len() > self.bucket_capacity => {
                    return Err(KdError::internal(format!(
                        "leaf {idx} holds {} particles, capacity is {}",
                        node.len(),
                        self.bucket_capacity
                    )));
                }
                None => {}
                Some([left, right]) => {
                    let (l, r) = (self.node(left)?, self.node(right)?);
                    if l.lower != node.lower || l.upper != r.lower || r.upper != node.upper {
                        return Err(KdError::internal(format!(
                            "children of node {idx} do not partition its range"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
