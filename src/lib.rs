pub mod error;
pub mod index;
pub mod fields;
pub mod smoothing;
pub mod engine;
pub mod configuration;
pub mod benchmark;

pub use error::{KdError, KdResult};

pub use index::states::{Aabb, NVec3, Particle};
pub use index::neighbors::{KnnHeap, Neighbor, NeighborList};
pub use index::kd_tree::{KdNode, KdTree};

pub use fields::{ElementType, FieldBindings, FieldBuffer, FieldSlot, SharedBuffer};

pub use smoothing::params::{SmoothingParams, DEFAULT_BALL_FACTOR};
pub use smoothing::kernels::Kernel;
pub use smoothing::context::{SmoothingContext, Step};
pub use smoothing::decomposition::{ClaimStrategy, Decomposition};
pub use smoothing::pipeline::{run_parallel, run_worker, Property, WorkerReport, WorkerState};

pub use engine::index::{KdIndex, SessionStep};

pub use configuration::config::{ParticlesConfig, RunConfig, SmoothingConfig, TreeConfig, UniformConfig};

pub use benchmark::benchmark::{bench_pipeline, bench_pipeline_curve, bench_tree_build};
