//! Parallel property pipeline.
//!
//! One call to [`run_worker`] is one worker's share of a pass: it clones the
//! session into a thread-local context, then loops
//! claim -> query -> reduce -> write until the claim cursor runs dry.
//! [`run_parallel`] starts one OS thread per worker on a shared
//! decomposition and joins them all before returning.
//!
//! Every property validates its buffers before the first claim, so a pass
//! that fails validation writes nothing. Each output row is written only by
//! the worker that claimed the particle, so workers never write the same
//! element.

use std::fmt;
use std::sync::Arc;
use std::thread;

use serde::Deserialize;
use tracing::{debug, info_span, trace, warn};

use crate::error::{KdError, KdResult};
use crate::fields::{FieldBindings, FieldSlot, SharedBuffer};
use crate::smoothing::context::SmoothingContext;
use crate::smoothing::decomposition::Decomposition;
use crate::smoothing::kernels;

/// Quantity a pass computes for every particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    /// Distance to the farthest of the `n_smooth` nearest neighbours.
    SmoothingLength,
    /// Kernel-weighted mass sum inside `sqrt(ball_factor) * h`.
    Density,
    /// Kernel-weighted mean of the quantity buffer (every column).
    QuantityMean,
    /// Kernel-weighted dispersion of the quantity buffer about its mean.
    QuantityDispersion,
}

impl Property {
    /// Property from its numeric id as used by host bindings (1..=4).
    pub fn from_id(id: i64) -> KdResult<Self> {
        match id {
            1 => Ok(Property::SmoothingLength),
            2 => Ok(Property::Density),
            3 => Ok(Property::QuantityMean),
            4 => Ok(Property::QuantityDispersion),
            _ => Err(KdError::invalid(format!("unknown property id {id}"))),
        }
    }

    pub fn id(self) -> i64 {
        match self {
            Property::SmoothingLength => 1,
            Property::Density => 2,
            Property::QuantityMean => 3,
            Property::QuantityDispersion => 4,
        }
    }

    /// Slot the pass writes into.
    pub fn output_slot(self) -> FieldSlot {
        match self {
            Property::SmoothingLength => FieldSlot::Smoothing,
            Property::Density => FieldSlot::Density,
            Property::QuantityMean | Property::QuantityDispersion => FieldSlot::QuantitySmoothed,
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Property::SmoothingLength => "smoothing_length",
            Property::Density => "density",
            Property::QuantityMean => "quantity_mean",
            Property::QuantityDispersion => "quantity_dispersion",
        };
        f.write_str(name)
    }
}

/// Lifecycle of one worker:
/// `Idle -> Claiming -> Querying -> Reducing -> Writing -> Claiming -> ... -> Exhausted`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Querying,
    Reducing,
    Writing,
    Exhausted,
}

impl WorkerState {
    fn can_enter(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Claiming)
                | (Claiming, Querying)
                | (Claiming, Exhausted)
                | (Querying, Reducing)
                | (Reducing, Writing)
                | (Writing, Claiming)
        )
    }
}

/// Summary returned by every worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub worker: usize,
    pub property: Property,
    pub processed: usize,
    pub state: WorkerState,
}

struct Worker {
    id: usize,
    property: Property,
    state: WorkerState,
    processed: usize,
}

impl Worker {
    fn new(id: usize, property: Property) -> Self {
        Self {
            id,
            property,
            state: WorkerState::Idle,
            processed: 0,
        }
    }

    fn enter(&mut self, next: WorkerState) -> KdResult<()> {
        if !self.state.can_enter(next) {
            return Err(KdError::internal(format!(
                "worker {} cannot go from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        trace!(worker = self.id, from = ?self.state, to = ?next, "worker state");
        self.state = next;
        Ok(())
    }

    fn report(&self) -> WorkerReport {
        WorkerReport {
            worker: self.id,
            property: self.property,
            processed: self.processed,
            state: self.state,
        }
    }
}

/// Buffers a pass reads and writes, resolved and checked up front.
#[derive(Clone)]
struct PassBuffers {
    output: SharedBuffer,
    smoothing: Option<SharedBuffer>,
    mass: Option<SharedBuffer>,
    density: Option<SharedBuffer>,
    quantity: Option<SharedBuffer>,
}

fn resolve_buffers(property: Property, bindings: &FieldBindings) -> KdResult<PassBuffers> {
    let output = bindings.require(property.output_slot())?.clone();
    let mut buffers = PassBuffers {
        output,
        smoothing: None,
        mass: None,
        density: None,
        quantity: None,
    };
    if property == Property::SmoothingLength {
        return Ok(buffers);
    }

    buffers.smoothing = Some(bindings.require_populated(FieldSlot::Smoothing)?.clone());
    buffers.mass = Some(bindings.require_populated(FieldSlot::Mass)?.clone());
    if property == Property::Density {
        return Ok(buffers);
    }

    buffers.density = Some(bindings.require_populated(FieldSlot::Density)?.clone());
    let quantity = bindings.require_populated(FieldSlot::Quantity)?.clone();
    let expected_cols = match property {
        Property::QuantityMean => quantity.cols(),
        _ => 1,
    };
    if buffers.output.cols() != expected_cols {
        return Err(KdError::TypeMismatch {
            field: FieldSlot::QuantitySmoothed.name(),
            reason: format!(
                "{} needs {} output columns, buffer has {}",
                property,
                expected_cols,
                buffers.output.cols()
            ),
        });
    }
    buffers.quantity = Some(quantity);
    Ok(buffers)
}

fn required(buffer: &Option<SharedBuffer>, slot: FieldSlot) -> KdResult<&SharedBuffer> {
    buffer
        .as_ref()
        .ok_or_else(|| KdError::internal(format!("{slot} buffer was not resolved")))
}

/// Check that `property` could run against `bindings` without touching any
/// buffer.
pub fn validate_property(property: Property, bindings: &FieldBindings) -> KdResult<()> {
    resolve_buffers(property, bindings).map(|_| ())
}

/// Run one worker's share of a pass.
///
/// # Parameters
/// - `session`      : global session; only its tree and parameters are used.
/// - `bindings`     : field bindings, snapshotted by the caller.
/// - `decomposition`: shared assignment, or `None` for a single private scan.
/// - `property`     : what to compute.
/// - `worker`       : worker id within the decomposition.
///
/// The output buffer is marked populated once the workers of the
/// decomposition have together finished every particle in it. A worker that
/// fails never reports, so a failed pass leaves the output unpopulated.
pub fn run_worker(
    session: &SmoothingContext,
    bindings: &FieldBindings,
    decomposition: Option<Arc<Decomposition>>,
    property: Property,
    worker: usize,
) -> KdResult<WorkerReport> {
    let buffers = resolve_buffers(property, bindings)?;
    match &decomposition {
        Some(d) => d.check_worker(worker)?,
        None if worker != 0 => {
            return Err(KdError::invalid(format!(
                "worker {worker} requested without a decomposition"
            )))
        }
        None => {}
    }

    let mut local = session.thread_local_copy(decomposition.clone(), worker);
    let mut state = Worker::new(worker, property);
    debug!(worker, %property, "worker started");

    match property {
        Property::SmoothingLength => smoothing_length_loop(&mut local, &mut state, &buffers)?,
        _ => gather_loop(&mut local, &mut state, &buffers)?,
    }
    local.finish();

    let last = decomposition
        .as_ref()
        .map_or(true, |d| d.report_exhausted(state.processed));
    if last {
        buffers.output.mark_populated();
    }
    debug!(worker, %property, processed = state.processed, "worker exhausted");
    Ok(state.report())
}

fn smoothing_length_loop(
    local: &mut SmoothingContext,
    state: &mut Worker,
    buffers: &PassBuffers,
) -> KdResult<()> {
    loop {
        state.enter(WorkerState::Claiming)?;
        let Some(i) = local.claim_next() else {
            return state.enter(WorkerState::Exhausted);
        };

        state.enter(WorkerState::Querying)?;
        let step = local.neighbors_of(i)?;

        state.enter(WorkerState::Reducing)?;
        let (row, h) = (step.original_index, step.smoothing_length);

        state.enter(WorkerState::Writing)?;
        buffers.output.set(row, h);
        state.processed += 1;
    }
}

fn gather_loop(local: &mut SmoothingContext, state: &mut Worker, buffers: &PassBuffers) -> KdResult<()> {
    let tree = Arc::clone(local.tree());
    let kernel = local.params().kernel;
    let ball_factor = local.params().ball_factor;
    let smoothing = required(&buffers.smoothing, FieldSlot::Smoothing)?;
    let mass = required(&buffers.mass, FieldSlot::Mass)?;
    let mut mean = vec![0.0; buffers.quantity.as_ref().map_or(0, |q| q.cols())];
    let mut warned_zero_h = false;

    loop {
        state.enter(WorkerState::Claiming)?;
        let Some(i) = local.claim_next() else {
            return state.enter(WorkerState::Exhausted);
        };
        let p = *tree
            .particle(i)
            .ok_or_else(|| KdError::internal(format!("claimed particle {i} is not in the tree")))?;
        let h = smoothing.get(p.original_index);
        if h <= 0.0 && !warned_zero_h {
            warn!(
                worker = state.id,
                particle = p.original_index,
                "smoothing length is zero, every kernel weight vanishes"
            );
            warned_zero_h = true;
        }

        state.enter(WorkerState::Querying)?;
        let list = local.gather(&p.r, ball_factor * h * h)?;
        let neighbors = list
            .iter()
            .map(|(j, d2)| (tree.particles()[j].original_index, d2));

        state.enter(WorkerState::Reducing)?;
        match state.property {
            Property::Density => {
                let rho = kernels::density(kernel, h, neighbors, mass);
                state.enter(WorkerState::Writing)?;
                buffers.output.set(p.original_index, rho);
            }
            Property::QuantityMean => {
                let rho = required(&buffers.density, FieldSlot::Density)?;
                let qty = required(&buffers.quantity, FieldSlot::Quantity)?;
                kernels::quantity_mean(kernel, h, neighbors, mass, rho, qty, &mut mean);
                state.enter(WorkerState::Writing)?;
                for (col, v) in mean.iter().enumerate() {
                    buffers.output.set2(p.original_index, col, *v);
                }
            }
            Property::QuantityDispersion => {
                let rho = required(&buffers.density, FieldSlot::Density)?;
                let qty = required(&buffers.quantity, FieldSlot::Quantity)?;
                kernels::quantity_mean(kernel, h, neighbors.clone(), mass, rho, qty, &mut mean);
                let sigma = kernels::quantity_dispersion(kernel, h, neighbors, mass, rho, qty, &mean);
                state.enter(WorkerState::Writing)?;
                buffers.output.set(p.original_index, sigma);
            }
            Property::SmoothingLength => {
                return Err(KdError::internal("smoothing length does not use the gather loop"));
            }
        }
        state.processed += 1;
    }
}

/// Run a whole pass on `decomposition.workers()` OS threads and wait for all
/// of them. Any worker error (or panic) fails the run.
pub fn run_parallel(
    session: &SmoothingContext,
    bindings: &FieldBindings,
    decomposition: Arc<Decomposition>,
    property: Property,
) -> KdResult<Vec<WorkerReport>> {
    let workers = decomposition.workers();
    let _span = info_span!("populate", %property, workers, particles = decomposition.len()).entered();
    validate_property(property, bindings)?;

    let results: Vec<KdResult<WorkerReport>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let decomposition = Arc::clone(&decomposition);
                thread::Builder::new()
                    .name(format!("kdsmooth-worker-{worker}"))
                    .spawn_scoped(scope, move || {
                        run_worker(session, bindings, Some(decomposition), property, worker)
                    })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(KdError::internal("worker thread panicked"))),
                Err(e) => Err(KdError::internal(format!("could not spawn worker: {e}"))),
            })
            .collect()
    });

    results.into_iter().collect()
}
