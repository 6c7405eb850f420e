//! Host-facing index handle.
//!
//! `KdIndex` is what an embedding host holds: the built tree, the buffers
//! bound to it, and the decomposition prepared for the next pass. Arguments
//! coming from the host (counts as signed integers, slot and property ids)
//! are validated here so the algorithms below only ever see checked values.
//!
//! Typical use:
//! - `create` from positions and masses,
//! - `bind_field` the smoothing-length and density outputs,
//! - `open_session`, then either drive it with `step_session` or hand it to
//!   `populate` / `compute_property`,
//! - `close_session`, `destroy`.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{KdError, KdResult};
use crate::fields::{FieldBindings, FieldSlot, SharedBuffer};
use crate::index::kd_tree::KdTree;
use crate::smoothing::context::SmoothingContext;
use crate::smoothing::decomposition::{ClaimStrategy, Decomposition};
use crate::smoothing::params::SmoothingParams;
use crate::smoothing::pipeline::{run_parallel, run_worker, Property, WorkerReport};

/// One particle's neighbours as reported to the host. Every index is an
/// original (host row) index.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStep {
    pub original_index: usize,
    pub smoothing_length: f64,
    pub neighbors: Vec<usize>,
    pub dist2: Vec<f64>,
}

#[derive(Debug)]
pub struct KdIndex {
    tree: Arc<KdTree>,
    bindings: RwLock<FieldBindings>,
    decomposition: Mutex<Option<Arc<Decomposition>>>,
    strategy: ClaimStrategy,
}

fn count_from_host(value: i64, what: &str) -> KdResult<usize> {
    usize::try_from(value).map_err(|_| KdError::invalid(format!("{what} must be non-negative, got {value}")))
}

impl KdIndex {
    /// Build the index over `positions` and bind `masses` to the mass slot.
    ///
    /// # Parameters
    /// - `positions`      : (n, 3) `f64` buffer, kept by reference.
    /// - `masses`         : (n,) `f64` buffer, kept by reference.
    /// - `bucket_capacity`: particles per leaf, at least 1.
    pub fn create(positions: SharedBuffer, masses: SharedBuffer, bucket_capacity: i64) -> KdResult<Self> {
        Self::create_masked(positions, masses, bucket_capacity, None)
    }

    /// [`KdIndex::create`] with a per-row active mask.
    pub fn create_masked(
        positions: SharedBuffer,
        masses: SharedBuffer,
        bucket_capacity: i64,
        active: Option<&[bool]>,
    ) -> KdResult<Self> {
        let bucket_capacity = count_from_host(bucket_capacity, "bucket capacity")?;
        let tree = KdTree::build_masked(positions, bucket_capacity, active)?;
        let mut bindings = FieldBindings::new(tree.len());
        bindings.bind(FieldSlot::Mass, masses)?;
        info!(
            particles = tree.len(),
            active = tree.n_active(),
            nodes = tree.node_count(),
            "index created"
        );
        Ok(Self {
            tree: Arc::new(tree),
            bindings: RwLock::new(bindings),
            decomposition: Mutex::new(None),
            strategy: ClaimStrategy::default(),
        })
    }

    /// Use `strategy` for every decomposition made from now on.
    pub fn with_claim_strategy(mut self, strategy: ClaimStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn claim_strategy(&self) -> ClaimStrategy {
        self.strategy
    }

    pub fn tree(&self) -> &Arc<KdTree> {
        &self.tree
    }

    pub fn n_particles(&self) -> usize {
        self.tree.len()
    }

    /// Release the tree and every buffer reference. Sessions still open keep
    /// their own reference to the tree; it is freed when the last one closes.
    pub fn destroy(self) {
        let KdIndex { tree, bindings, decomposition, .. } = self;
        bindings.write().release_all();
        decomposition.lock().take();
        match Arc::try_unwrap(tree) {
            Ok(mut tree) => tree.teardown(),
            Err(shared) => debug!(
                sessions = Arc::strong_count(&shared) - 1,
                "index destroyed with sessions still open"
            ),
        }
    }

    // fields ===============================================================================

    /// Attach `buffer` to `slot`, returning the buffer it replaces.
    pub fn bind_field(&self, slot: FieldSlot, buffer: SharedBuffer) -> KdResult<Option<SharedBuffer>> {
        let previous = self.bindings.write().bind(slot, buffer)?;
        debug!(%slot, replaced = previous.is_some(), "field bound");
        Ok(previous)
    }

    /// [`KdIndex::bind_field`] addressed by numeric slot id.
    pub fn bind_field_id(&self, slot: i64, buffer: SharedBuffer) -> KdResult<Option<SharedBuffer>> {
        self.bind_field(FieldSlot::from_id(slot)?, buffer)
    }

    /// Buffer bound to `slot`, `None` when unbound.
    pub fn get_field(&self, slot: FieldSlot) -> Option<SharedBuffer> {
        self.bindings.read().get(slot).cloned()
    }

    pub fn unbind_field(&self, slot: FieldSlot) -> Option<SharedBuffer> {
        self.bindings.write().unbind(slot)
    }

    fn snapshot(&self) -> FieldBindings {
        self.bindings.read().clone()
    }

    // sessions =============================================================================

    pub fn open_session(&self, n_smooth: i64) -> KdResult<SmoothingContext> {
        let n_smooth = count_from_host(n_smooth, "target neighbour count")?;
        self.open_session_with(SmoothingParams::new(n_smooth))
    }

    pub fn open_session_with(&self, params: SmoothingParams) -> KdResult<SmoothingContext> {
        SmoothingContext::new(Arc::clone(&self.tree), params)
    }

    /// Next particle of a host-driven sweep, or `None` once every active
    /// particle has been visited.
    pub fn step_session(&self, session: &mut SmoothingContext) -> KdResult<Option<SessionStep>> {
        self.check_session(session)?;
        let tree = Arc::clone(&self.tree);
        let Some(step) = session.step()? else {
            if session.completed_sweep() {
                debug!(particles = tree.n_active(), "session sweep complete");
            }
            return Ok(None);
        };
        let neighbors = step
            .neighbors
            .iter()
            .map(|&j| {
                tree.original_index(j)
                    .ok_or_else(|| KdError::internal(format!("neighbour {j} is not in the tree")))
            })
            .collect::<KdResult<Vec<_>>>()?;
        Ok(Some(SessionStep {
            original_index: step.original_index,
            smoothing_length: step.smoothing_length,
            neighbors,
            dist2: step.dist2.to_vec(),
        }))
    }

    pub fn rewind_session(&self, session: &mut SmoothingContext) {
        session.rewind();
    }

    pub fn close_session(&self, mut session: SmoothingContext) {
        session.finish();
    }

    fn check_session(&self, session: &SmoothingContext) -> KdResult<()> {
        if !Arc::ptr_eq(session.tree(), &self.tree) {
            return Err(KdError::invalid("session was opened on a different index"));
        }
        Ok(())
    }

    // pipeline =============================================================================

    fn decomposition_for(&self, bindings: &FieldBindings, num_workers: i64) -> KdResult<Option<Arc<Decomposition>>> {
        let workers = count_from_host(num_workers, "worker count")?;
        bindings.require(FieldSlot::Smoothing)?;
        if workers == 0 {
            return Ok(None);
        }
        Ok(Some(Arc::new(Decomposition::new(&self.tree, workers, self.strategy))))
    }

    /// Prepare the work split for the next `compute_property` calls.
    /// Zero workers means no split: worker 0 scans every particle itself.
    /// Claims are consumed by a pass, so every pass needs a fresh call.
    pub fn decompose(&self, num_workers: i64) -> KdResult<Option<Arc<Decomposition>>> {
        let decomposition = self.decomposition_for(&self.bindings.read(), num_workers)?;
        *self.decomposition.lock() = decomposition.clone();
        debug!(workers = num_workers, strategy = ?self.strategy, "decomposed");
        Ok(decomposition)
    }

    /// Run worker `worker_id`'s share of `property` on the calling thread,
    /// against the decomposition from the last [`KdIndex::decompose`].
    pub fn compute_property(
        &self,
        session: &SmoothingContext,
        property: Property,
        worker_id: i64,
    ) -> KdResult<WorkerReport> {
        self.check_session(session)?;
        let worker = count_from_host(worker_id, "worker id")?;
        let bindings = self.snapshot();
        let decomposition = self.decomposition.lock().clone();
        run_worker(session, &bindings, decomposition, property, worker)
    }

    /// [`KdIndex::compute_property`] addressed by numeric property id.
    pub fn compute_property_id(
        &self,
        session: &SmoothingContext,
        property: i64,
        worker_id: i64,
    ) -> KdResult<WorkerReport> {
        self.compute_property(session, Property::from_id(property)?, worker_id)
    }

    /// Decompose, run every worker on its own thread, and wait for all of
    /// them. The stored decomposition used by `compute_property` is left
    /// alone.
    pub fn populate(&self, session: &SmoothingContext, property: Property, workers: i64) -> KdResult<Vec<WorkerReport>> {
        self.check_session(session)?;
        let bindings = self.snapshot();
        match self.decomposition_for(&bindings, workers)? {
            Some(decomposition) => run_parallel(session, &bindings, decomposition, property),
            None => run_worker(session, &bindings, None, property, 0).map(|report| vec![report]),
        }
    }
}
