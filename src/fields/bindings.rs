//! Named slots for host buffers and the checks applied when filling them.

use std::fmt;

use crate::error::{KdError, KdResult};
use crate::fields::buffer::{ElementType, FieldBuffer, SharedBuffer};

/// The buffers a smoothing pass can read from or write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldSlot {
    Smoothing,
    Density,
    Mass,
    Quantity,
    QuantitySmoothed,
}

impl FieldSlot {
    pub const ALL: [FieldSlot; 5] = [
        FieldSlot::Smoothing,
        FieldSlot::Density,
        FieldSlot::Mass,
        FieldSlot::Quantity,
        FieldSlot::QuantitySmoothed,
    ];

    /// Slot from its numeric id as used by host bindings (0..=4).
    pub fn from_id(id: i64) -> KdResult<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or_else(|| KdError::invalid(format!("unknown field slot id {id}")))
    }

    pub fn id(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldSlot::Smoothing => "smooth",
            FieldSlot::Density => "rho",
            FieldSlot::Mass => "mass",
            FieldSlot::Quantity => "qty",
            FieldSlot::QuantitySmoothed => "qty_sm",
        }
    }

    /// Slots that must hold exactly one value per particle.
    fn is_scalar(self) -> bool {
        matches!(self, FieldSlot::Smoothing | FieldSlot::Density | FieldSlot::Mass)
    }
}

impl fmt::Display for FieldSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn check_element_type(field: &'static str, buffer: &FieldBuffer) -> KdResult<()> {
    if buffer.element_type() != ElementType::F64 {
        return Err(KdError::TypeMismatch {
            field,
            reason: format!("elements are {}, expected f64", buffer.element_type()),
        });
    }
    Ok(())
}

/// Check a position buffer and return its particle count.
pub fn validate_positions(buffer: &FieldBuffer) -> KdResult<usize> {
    check_element_type("position", buffer)?;
    if buffer.cols() != 3 {
        return Err(KdError::TypeMismatch {
            field: "position",
            reason: format!("expected 3 columns, found {}", buffer.cols()),
        });
    }
    Ok(buffer.rows())
}

/// Check that `buffer` can be bound to `slot` for `n_particles` particles.
pub fn validate_field(slot: FieldSlot, buffer: &FieldBuffer, n_particles: usize) -> KdResult<()> {
    check_element_type(slot.name(), buffer)?;
    if buffer.rows() != n_particles {
        return Err(KdError::TypeMismatch {
            field: slot.name(),
            reason: format!("{} rows for {} particles", buffer.rows(), n_particles),
        });
    }
    if buffer.cols() == 0 || (slot.is_scalar() && buffer.cols() != 1) {
        return Err(KdError::TypeMismatch {
            field: slot.name(),
            reason: format!("{} columns is not a valid shape", buffer.cols()),
        });
    }
    Ok(())
}

/// Buffers currently attached to an index, one optional entry per slot.
///
/// Cloning is cheap (reference counts only); the pipeline snapshots the
/// bindings once per run so workers never contend on them.
#[derive(Debug, Clone)]
pub struct FieldBindings {
    n_particles: usize,
    slots: [Option<SharedBuffer>; 5],
}

impl FieldBindings {
    pub fn new(n_particles: usize) -> Self {
        Self {
            n_particles,
            slots: Default::default(),
        }
    }

    pub fn n_particles(&self) -> usize {
        self.n_particles
    }

    /// Validate and attach `buffer`, returning the binding it replaces.
    pub fn bind(&mut self, slot: FieldSlot, buffer: SharedBuffer) -> KdResult<Option<SharedBuffer>> {
        validate_field(slot, &buffer, self.n_particles)?;
        Ok(self.slots[slot.id()].replace(buffer))
    }

    pub fn unbind(&mut self, slot: FieldSlot) -> Option<SharedBuffer> {
        self.slots[slot.id()].take()
    }

    pub fn get(&self, slot: FieldSlot) -> Option<&SharedBuffer> {
        self.slots[slot.id()].as_ref()
    }

    /// Bound buffer or `UnboundField`.
    pub fn require(&self, slot: FieldSlot) -> KdResult<&SharedBuffer> {
        self.get(slot).ok_or(KdError::UnboundField(slot))
    }

    /// Bound and populated buffer, else `UnboundField` / `UnmetDependency`.
    pub fn require_populated(&self, slot: FieldSlot) -> KdResult<&SharedBuffer> {
        let buffer = self.require(slot)?;
        if !buffer.is_populated() {
            return Err(KdError::UnmetDependency(slot));
        }
        Ok(buffer)
    }

    /// Drop every reference held.
    pub fn release_all(&mut self) {
        self.slots = Default::default();
    }
}
