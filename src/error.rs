//! Error taxonomy for the index and the smoothing pipeline.
//!
//! Validation failures (`InvalidArgument`, `TypeMismatch`, `UnboundField`,
//! `UnmetDependency`) are raised before any traversal work starts, so an
//! operation that fails with one of them has not touched any output buffer.
//! `CapacityExceeded` is recoverable by retrying with larger scratch.
//! `InternalInvariant` means the tree or a worker is broken and the whole
//! run must be discarded.

use thiserror::Error;

use crate::fields::FieldSlot;

pub type KdResult<T> = Result<T, KdError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum KdError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("type mismatch for {field} buffer: {reason}")]
    TypeMismatch { field: &'static str, reason: String },

    #[error("no buffer bound to the {0} slot")]
    UnboundField(FieldSlot),

    #[error("the {0} buffer is bound but has not been populated yet")]
    UnmetDependency(FieldSlot),

    #[error("neighbour scratch holds {capacity} entries but the query found {required}")]
    CapacityExceeded { capacity: usize, required: usize },

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl KdError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        KdError::InvalidArgument(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        KdError::InternalInvariant(msg.into())
    }

    /// True for errors a caller can fix by retrying with more scratch space.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, KdError::CapacityExceeded { .. })
    }
}
