//! Work assignment for the parallel pipeline.
//!
//! A `Decomposition` is built from the tree's active particles in physical
//! order and hands them out to workers through atomic counters:
//!
//! - `Shared`: one cursor for everybody; each `claim` takes the next
//!   unclaimed particle, so fast workers simply take more.
//! - `Contiguous`: worker `w` owns the `w`-th equal block of the order.
//! - `Interleaved`: worker `w` owns every `P`-th particle starting at `w`.
//!
//! Each position in the order is returned by exactly one `fetch_add`, so no
//! particle is claimed twice or skipped regardless of thread timing. The set
//! of work is the same for every worker count; only the split differs.
//!
//! Workers report how many particles they finished. A pass is complete once
//! those reports add up to the whole order, however many times each worker
//! id was run.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;

use crate::error::{KdError, KdResult};
use crate::index::kd_tree::KdTree;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStrategy {
    #[default]
    Shared,
    Contiguous,
    Interleaved,
}

#[derive(Debug)]
pub struct Decomposition {
    strategy: ClaimStrategy,
    requested: usize,
    order: Vec<usize>,
    shared: AtomicUsize,
    per_worker: Vec<AtomicUsize>,
    completed: AtomicUsize,
}

impl Decomposition {
    /// Assignment of `tree`'s active particles to `num_workers` workers.
    /// Zero workers means one worker and no split.
    pub fn new(tree: &KdTree, num_workers: usize, strategy: ClaimStrategy) -> Self {
        let order: Vec<usize> = tree
            .particles()
            .iter()
            .enumerate()
            .filter(|(_, p)| p.active)
            .map(|(i, _)| i)
            .collect();
        let workers = num_workers.max(1);
        Self {
            strategy,
            requested: num_workers,
            order,
            shared: AtomicUsize::new(0),
            per_worker: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> ClaimStrategy {
        self.strategy
    }

    /// Worker count as requested (possibly zero).
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Number of workers that will actually run.
    pub fn workers(&self) -> usize {
        self.per_worker.len()
    }

    /// Particles to be handed out in total.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn check_worker(&self, worker: usize) -> KdResult<()> {
        if worker >= self.workers() {
            return Err(KdError::invalid(format!(
                "worker {worker} out of range for {} workers",
                self.workers()
            )));
        }
        Ok(())
    }

    /// Next physical index for `worker`, or `None` once its share (or the
    /// shared cursor) is exhausted.
    pub fn claim(&self, worker: usize) -> Option<usize> {
        let n = self.order.len();
        let p = self.workers();
        let slot = match self.strategy {
            ClaimStrategy::Shared => self.shared.fetch_add(1, Ordering::Relaxed),
            ClaimStrategy::Contiguous => {
                let block = n.div_ceil(p);
                let start = worker * block;
                let k = self.per_worker.get(worker)?.fetch_add(1, Ordering::Relaxed);
                let i = start + k;
                if i >= (start + block).min(n) {
                    return None;
                }
                i
            }
            ClaimStrategy::Interleaved => {
                let k = self.per_worker.get(worker)?.fetch_add(1, Ordering::Relaxed);
                worker + k * p
            }
        };
        self.order.get(slot).copied()
    }

    /// Static share of `worker` for the block strategies, `None` for the
    /// shared cursor where the split is only known after the run.
    pub fn assignment(&self, worker: usize) -> Option<Vec<usize>> {
        let n = self.order.len();
        let p = self.workers();
        match self.strategy {
            ClaimStrategy::Shared => None,
            ClaimStrategy::Contiguous => {
                let block = n.div_ceil(p);
                let start = (worker * block).min(n);
                let end = (start + block).min(n);
                Some(self.order[start..end].to_vec())
            }
            ClaimStrategy::Interleaved => {
                Some(self.order.iter().copied().skip(worker).step_by(p).collect())
            }
        }
    }

    /// Record that a worker ran out of work after finishing `processed`
    /// particles. Returns true for the report that completes the order.
    pub fn report_exhausted(&self, processed: usize) -> bool {
        let n = self.order.len();
        if n == 0 {
            return true;
        }
        let before = self.completed.fetch_add(processed, Ordering::AcqRel);
        before < n && before + processed >= n
    }

    /// Particles finished and reported so far.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }
}
