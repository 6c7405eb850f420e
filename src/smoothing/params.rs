//! Runtime smoothing parameters
//!
//! `SmoothingParams` holds the per-session settings:
//! - target neighbour count for the smoothing-length search,
//! - periodic box lengths (infinite = open boundary),
//! - kernel and ball over-search factor used by the gather kernels,
//! - optional fixed capacity for ball-gather scratch

use crate::error::{KdError, KdResult};
use crate::index::states::{open_boundaries, NVec3};
use crate::smoothing::kernels::Kernel;

/// Gather radius² is `DEFAULT_BALL_FACTOR * h²`, i.e. radius `2h`: the
/// support of both kernels.
pub const DEFAULT_BALL_FACTOR: f64 = 4.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SmoothingParams {
    pub n_smooth: usize,               // neighbours per smoothing length
    pub period: NVec3,                 // box length per axis
    pub kernel: Kernel,                // weighting used by density/quantity passes
    pub ball_factor: f64,              // gather radius² = ball_factor * h²
    pub ball_capacity: Option<usize>,  // None = growable gather scratch
}

impl SmoothingParams {
    pub fn new(n_smooth: usize) -> Self {
        Self {
            n_smooth,
            period: open_boundaries(),
            kernel: Kernel::default(),
            ball_factor: DEFAULT_BALL_FACTOR,
            ball_capacity: None,
        }
    }

    pub fn with_period(mut self, period: NVec3) -> Self {
        self.period = period;
        self
    }

    pub fn with_kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_ball_factor(mut self, ball_factor: f64) -> Self {
        self.ball_factor = ball_factor;
        self
    }

    pub fn with_ball_capacity(mut self, capacity: usize) -> Self {
        self.ball_capacity = Some(capacity);
        self
    }

    pub fn is_periodic(&self) -> bool {
        self.period.iter().any(|p| p.is_finite())
    }

    /// Reject parameter sets no session can run with.
    ///
    /// `n_smooth == 1` is accepted but degenerate: a particle is its own
    /// nearest neighbour, so every smoothing length is 0 and the density and
    /// quantity passes produce zeros (the gather logs a warning).
    pub fn validate(&self) -> KdResult<()> {
        if self.n_smooth < 1 {
            return Err(KdError::invalid("target neighbour count must be at least 1"));
        }
        if self.period.iter().any(|&p| p.is_nan() || p <= 0.0) {
            return Err(KdError::invalid(format!(
                "periodic box lengths must be positive, got {:?}",
                self.period.as_slice()
            )));
        }
        if !(self.ball_factor.is_finite() && self.ball_factor > 0.0) {
            return Err(KdError::invalid(format!(
                "ball factor must be positive and finite, got {}",
                self.ball_factor
            )));
        }
        if self.ball_capacity == Some(0) {
            return Err(KdError::invalid("ball capacity must be at least 1"));
        }
        Ok(())
    }
}
