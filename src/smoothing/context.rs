//! Smoothing context: a resumable neighbour-query session over a built tree.
//!
//! The context owns a cursor and private scratch (k-best heap, result list)
//! and shares the tree through an `Arc`. `step` processes one particle and
//! returns to the caller, so a host loop can interleave its own bookkeeping
//! with the search. A context is driven by one thread at a time (`step`
//! takes `&mut self`); parallel runs give each worker its own
//! [`SmoothingContext::thread_local_copy`].

use std::sync::Arc;

use tracing::warn;

use crate::error::{KdError, KdResult};
use crate::index::kd_tree::KdTree;
use crate::index::neighbors::{KnnHeap, NeighborList};
use crate::index::states::NVec3;
use crate::smoothing::decomposition::Decomposition;
use crate::smoothing::params::SmoothingParams;

/// Where the next particle comes from.
#[derive(Debug, Clone)]
enum Cursor {
    /// Private scan over physical indices.
    Local { next: usize },
    /// Claims from a decomposition shared with other workers.
    Claim {
        decomposition: Arc<Decomposition>,
        worker: usize,
    },
}

/// Neighbours of one particle, borrowed from the context's scratch.
/// Indices are physical tree slots; the list is sorted nearest first.
#[derive(Debug)]
pub struct Step<'a> {
    pub particle: usize,
    pub original_index: usize,
    pub smoothing_length: f64,
    pub neighbors: &'a [usize],
    pub dist2: &'a [f64],
}

#[derive(Debug)]
pub struct SmoothingContext {
    tree: Arc<KdTree>,
    params: SmoothingParams,
    cursor: Cursor,
    heap: KnnHeap,
    list: NeighborList,
    steps_since_rewind: usize,
    finished: bool,
}

impl SmoothingContext {
    /// Open a session on `tree`. Fails on an invalid parameter set or a tree
    /// that has been torn down.
    pub fn new(tree: Arc<KdTree>, params: SmoothingParams) -> KdResult<Self> {
        params.validate()?;
        if tree.is_torn_down() {
            return Err(KdError::invalid("cannot open a session on a torn-down tree"));
        }
        Ok(Self::with_cursor(tree, params, Cursor::Local { next: 0 }))
    }

    fn with_cursor(tree: Arc<KdTree>, params: SmoothingParams, cursor: Cursor) -> Self {
        let list = match params.ball_capacity {
            Some(cap) => NeighborList::bounded(cap.max(params.n_smooth)),
            None => NeighborList::with_capacity(params.n_smooth),
        };
        Self {
            heap: KnnHeap::new(params.n_smooth),
            list,
            tree,
            params,
            cursor,
            steps_since_rewind: 0,
            finished: false,
        }
    }

    /// Independent context for one worker: same tree and parameters, fresh
    /// scratch, and a cursor that claims from `decomposition` (or scans
    /// privately from the start when there is none).
    pub fn thread_local_copy(&self, decomposition: Option<Arc<Decomposition>>, worker: usize) -> Self {
        let cursor = match decomposition {
            Some(decomposition) => Cursor::Claim { decomposition, worker },
            None => Cursor::Local { next: 0 },
        };
        Self::with_cursor(Arc::clone(&self.tree), self.params.clone(), cursor)
    }

    pub fn tree(&self) -> &Arc<KdTree> {
        &self.tree
    }

    pub fn params(&self) -> &SmoothingParams {
        &self.params
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn ensure_open(&self) -> KdResult<()> {
        if self.finished {
            return Err(KdError::invalid("session has been finished"));
        }
        Ok(())
    }

    /// Next active physical index to process, `None` when done.
    pub fn claim_next(&mut self) -> Option<usize> {
        match &mut self.cursor {
            Cursor::Local { next } => {
                let particles = self.tree.particles();
                while *next < particles.len() {
                    let i = *next;
                    *next += 1;
                    if particles[i].active {
                        return Some(i);
                    }
                }
                None
            }
            Cursor::Claim { decomposition, worker } => decomposition.claim(*worker),
        }
    }

    /// Advance to the next particle and find its `n_smooth` nearest
    /// neighbours. Returns `None` once every particle has been visited.
    pub fn step(&mut self) -> KdResult<Option<Step<'_>>> {
        self.ensure_open()?;
        let Some(particle) = self.claim_next() else {
            return Ok(None);
        };
        self.steps_since_rewind += 1;
        self.neighbors_of(particle).map(Some)
    }

    /// k-nearest search around physical particle `particle` into the scratch
    /// list. The smoothing length is the distance to the farthest neighbour.
    pub fn neighbors_of(&mut self, particle: usize) -> KdResult<Step<'_>> {
        self.ensure_open()?;
        let p = *self
            .tree
            .particle(particle)
            .ok_or_else(|| KdError::internal(format!("particle {particle} is not in the tree")))?;
        self.tree
            .k_nearest_into(&p.r, self.params.n_smooth, &self.params.period, &mut self.heap, &mut self.list)?;
        Ok(Step {
            particle,
            original_index: p.original_index,
            smoothing_length: self.list.max_dist2().unwrap_or(0.0).sqrt(),
            neighbors: &self.list.indices,
            dist2: &self.list.dist2,
        })
    }

    /// Ball search into the scratch list without retrying; a bounded list
    /// that is too small surfaces `CapacityExceeded`.
    pub fn ball(&mut self, point: &NVec3, radius2: f64) -> KdResult<&NeighborList> {
        self.ensure_open()?;
        self.tree.ball_into(point, radius2, &self.params.period, &mut self.list)?;
        Ok(&self.list)
    }

    /// Ball search that grows bounded scratch to the reported size and
    /// retries when it overflows.
    pub fn gather(&mut self, point: &NVec3, radius2: f64) -> KdResult<&NeighborList> {
        self.ensure_open()?;
        loop {
            match self.tree.ball_into(point, radius2, &self.params.period, &mut self.list) {
                Ok(_) => return Ok(&self.list),
                Err(KdError::CapacityExceeded { capacity, required }) => {
                    warn!(capacity, required, "ball gather overflowed, growing scratch");
                    self.list.set_limit(Some(required));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Restart iteration from the first particle. Tree and scratch are kept;
    /// a worker copy becomes a private scan.
    pub fn rewind(&mut self) {
        self.cursor = Cursor::Local { next: 0 };
        self.steps_since_rewind = 0;
        self.finished = false;
    }

    /// Whether a private scan has visited every active particle since the
    /// last rewind.
    pub fn completed_sweep(&self) -> bool {
        matches!(self.cursor, Cursor::Local { .. }) && self.steps_since_rewind == self.tree.n_active()
    }

    /// Release scratch buffers. The tree is untouched.
    pub fn finish(&mut self) {
        self.heap.release();
        self.list.release();
        self.finished = true;
    }
}
