//! Neighbour-result scratch used by the tree queries.
//!
//! `KnnHeap` keeps the k best candidates seen so far during a k-nearest
//! search. `NeighborList` is the flat result buffer (parallel arrays of
//! physical index and squared distance) filled by both query kinds. A list is
//! either growable or bounded; a bounded list makes ball queries fail with
//! `CapacityExceeded` instead of reallocating.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One query result. `index` is the physical slot in the tree, `original`
/// the host row; ordering is by distance, then by original index.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub index: usize,
    pub original: usize,
    pub dist2: f64,
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist2
            .total_cmp(&other.dist2)
            .then(self.original.cmp(&other.original))
    }
}

/// Bounded max-heap of the best `k` candidates.
#[derive(Debug, Clone, Default)]
pub struct KnnHeap {
    k: usize,
    heap: BinaryHeap<Neighbor>,
}

impl KnnHeap {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    /// Empty the heap and retarget it, keeping the allocation.
    pub fn reset(&mut self, k: usize) {
        self.heap.clear();
        self.k = k;
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Squared distance a subtree must beat to be worth visiting.
    pub fn bound(&self) -> f64 {
        if self.is_full() {
            self.heap.peek().map_or(f64::INFINITY, |worst| worst.dist2)
        } else {
            f64::INFINITY
        }
    }

    /// Offer a candidate; returns whether it was kept.
    pub fn offer(&mut self, cand: Neighbor) -> bool {
        if self.k == 0 {
            return false;
        }
        if !self.is_full() {
            self.heap.push(cand);
            return true;
        }
        match self.heap.peek() {
            Some(worst) if cand < *worst => {
                self.heap.pop();
                self.heap.push(cand);
                true
            }
            _ => false,
        }
    }

    /// Move the contents into `out`, nearest first. The heap is left empty.
    pub fn drain_sorted(&mut self, out: &mut NeighborList) {
        out.clear();
        let mut sorted = std::mem::take(&mut self.heap).into_sorted_vec();
        for n in &sorted {
            out.indices.push(n.index);
            out.dist2.push(n.dist2);
        }
        sorted.clear();
        self.heap = BinaryHeap::from(sorted);
    }

    pub fn release(&mut self) {
        self.heap = BinaryHeap::new();
    }
}

#[derive(Debug, Clone, Default)]
pub struct NeighborList {
    pub indices: Vec<usize>,
    pub dist2: Vec<f64>,
    limit: Option<usize>,
}

impl NeighborList {
    /// List that reallocates as needed.
    pub fn growable() -> Self {
        Self::default()
    }

    /// Growable list with room for `capacity` entries up front.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            indices: Vec::with_capacity(capacity),
            dist2: Vec::with_capacity(capacity),
            limit: None,
        }
    }

    /// List that never holds more than `capacity` entries.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            limit: Some(capacity),
            ..Self::with_capacity(capacity)
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Raise (or remove) the bound, reserving the extra space immediately.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        if let Some(cap) = limit {
            self.indices.reserve(cap.saturating_sub(self.indices.len()));
            self.dist2.reserve(cap.saturating_sub(self.dist2.len()));
        }
        self.limit = limit;
    }

    pub fn clear(&mut self) {
        self.indices.clear();
        self.dist2.clear();
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Append a result; returns false (and stores nothing) once a bounded
    /// list is full.
    pub fn push(&mut self, index: usize, dist2: f64) -> bool {
        if let Some(cap) = self.limit {
            if self.indices.len() >= cap {
                return false;
            }
        }
        self.indices.push(index);
        self.dist2.push(dist2);
        true
    }

    pub fn max_dist2(&self) -> Option<f64> {
        self.dist2.iter().copied().reduce(f64::max)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + Clone + '_ {
        self.indices.iter().copied().zip(self.dist2.iter().copied())
    }

    /// Drop the backing allocations.
    pub fn release(&mut self) {
        self.indices = Vec::new();
        self.dist2 = Vec::new();
    }
}
