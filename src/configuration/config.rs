//! Configuration types for loading smoothing runs from YAML.
//!
//! A run consists of:
//!
//! - [`TreeConfig`]      – tree build options
//! - [`SmoothingConfig`] – neighbour count, kernel, periodic box, workers
//! - [`ParticlesConfig`] – explicit particles or a seeded uniform cube
//! - [`RunConfig`]       – top-level wrapper used to load a run from YAML
//!
//! # YAML format
//!
//! ```yaml
//! tree:
//!   bucket_size: 8
//!
//! smoothing:
//!   n_smooth: 32
//!   kernel: "cubic_spline"    # or "wendland_c2"
//!   ball_factor: 4.0          # gather radius^2 = ball_factor * h^2
//!   period: [1.0, 1.0, 1.0]   # omit for open boundaries
//!   workers: 4
//!   strategy: "shared"        # or "contiguous", "interleaved"
//!
//! particles:
//!   uniform:
//!     count: 1000
//!     seed: 42
//!     box_size: 1.0
//!     mass: 1.0
//! ```
//!
//! An explicit particle list replaces `uniform` with
//! `explicit: [ { x: [0.0, 0.0, 0.0], m: 1.0 }, ... ]`.
//!
//! The driver maps this into runtime types ([`SmoothingParams`], host
//! buffers) before touching the index.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::error::{KdError, KdResult};
use crate::index::states::{open_boundaries, NVec3};
use crate::smoothing::decomposition::ClaimStrategy;
use crate::smoothing::kernels::Kernel;
use crate::smoothing::params::{SmoothingParams, DEFAULT_BALL_FACTOR};

#[derive(Deserialize, Debug, Clone)]
pub struct TreeConfig {
    pub bucket_size: i64, // maximum particles per leaf
}

#[derive(Deserialize, Debug, Clone)]
pub struct SmoothingConfig {
    pub n_smooth: i64,                   // neighbours per smoothing length
    #[serde(default)]
    pub kernel: Kernel,                  // defaults to the cubic spline
    pub ball_factor: Option<f64>,        // defaults to DEFAULT_BALL_FACTOR
    pub period: Option<[f64; 3]>,        // box lengths, None = open
    pub ball_capacity: Option<usize>,    // fixed gather scratch, None = growable
    #[serde(default = "default_workers")]
    pub workers: i64,                    // 0 = run on the calling thread
    #[serde(default)]
    pub strategy: ClaimStrategy,         // how workers pick up particles
}

fn default_workers() -> i64 {
    1
}

/// One particle in an explicit list.
#[derive(Deserialize, Debug, Clone)]
pub struct ParticleConfig {
    pub x: Vec<f64>, // position, three components
    pub m: f64,      // mass
}

/// `count` particles drawn uniformly from `[0, box_size)^3`.
#[derive(Deserialize, Debug, Clone)]
pub struct UniformConfig {
    pub count: usize,
    pub seed: u64,     // deterministic seed to make runs reproducible
    pub box_size: f64,
    pub mass: f64,     // every particle gets the same mass
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub enum ParticlesConfig {
    Explicit(Vec<ParticleConfig>),
    Uniform(UniformConfig),
}

/// Top-level run configuration loaded from YAML.
#[derive(Deserialize, Debug, Clone)]
pub struct RunConfig {
    pub tree: TreeConfig,
    pub smoothing: SmoothingConfig,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub particles: ParticlesConfig,
}

impl SmoothingConfig {
    /// Runtime parameters for a session; optional fields fall back to
    /// their defaults.
    pub fn to_params(&self) -> KdResult<SmoothingParams> {
        let n_smooth = usize::try_from(self.n_smooth)
            .map_err(|_| KdError::invalid(format!("n_smooth must be non-negative, got {}", self.n_smooth)))?;
        let period = self.period.map_or_else(open_boundaries, |[x, y, z]| NVec3::new(x, y, z));

        let mut params = SmoothingParams::new(n_smooth)
            .with_period(period)
            .with_kernel(self.kernel)
            .with_ball_factor(self.ball_factor.unwrap_or(DEFAULT_BALL_FACTOR));
        if let Some(cap) = self.ball_capacity {
            params = params.with_ball_capacity(cap);
        }
        params.validate()?;
        Ok(params)
    }
}

impl ParticlesConfig {
    /// Positions and masses, in host row order.
    pub fn generate(&self) -> KdResult<(Vec<NVec3>, Vec<f64>)> {
        match self {
            ParticlesConfig::Explicit(list) => {
                let mut positions = Vec::with_capacity(list.len());
                let mut masses = Vec::with_capacity(list.len());
                for (i, p) in list.iter().enumerate() {
                    let [x, y, z] = <[f64; 3]>::try_from(p.x.as_slice()).map_err(|_| {
                        KdError::invalid(format!("particle {i} has {} coordinates, expected 3", p.x.len()))
                    })?;
                    positions.push(NVec3::new(x, y, z));
                    masses.push(p.m);
                }
                Ok((positions, masses))
            }
            ParticlesConfig::Uniform(u) => {
                if !(u.box_size.is_finite() && u.box_size > 0.0) {
                    return Err(KdError::invalid(format!("box_size must be positive, got {}", u.box_size)));
                }
                Ok((uniform_cube(u.count, u.seed, u.box_size), vec![u.mass; u.count]))
            }
        }
    }
}

/// `n` points drawn uniformly from `[0, box_size)^3` with a seeded generator.
pub fn uniform_cube(n: usize, seed: u64, box_size: f64) -> Vec<NVec3> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            NVec3::new(
                rng.gen_range(0.0..box_size),
                rng.gen_range(0.0..box_size),
                rng.gen_range(0.0..box_size),
            )
        })
        .collect()
}
