pub mod params;
pub mod kernels;
pub mod context;
pub mod decomposition;
pub mod pipeline;
