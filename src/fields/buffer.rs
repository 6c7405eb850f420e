//! Host-owned numeric buffers shared with the engine.
//!
//! A `FieldBuffer` is a 2-D (rows x cols) array owned by the host and handed
//! to the engine as an `Arc`. Elements are stored in atomic cells so that the
//! pipeline's workers can write disjoint rows of the same buffer at the same
//! time without a lock; relaxed loads and stores compile to plain moves.
//!
//! Besides values a buffer records whether its contents are populated:
//! buffers created from values are, zero-allocated ones are not until a
//! pipeline pass finishes writing them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{KdError, KdResult};
use crate::index::states::NVec3;

pub type SharedBuffer = Arc<FieldBuffer>;

/// Element type of a host buffer. The engine only computes with `F64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    F64,
    I32,
    I64,
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
enum Storage {
    F32(Box<[AtomicU32]>),
    F64(Box<[AtomicU64]>),
    I32(Box<[AtomicI32]>),
    I64(Box<[AtomicI64]>),
}

#[derive(Debug)]
pub struct FieldBuffer {
    rows: usize,
    cols: usize,
    storage: Storage,
    populated: AtomicBool,
}

impl FieldBuffer {
    /// Buffer holding `values` in row-major order; marked populated.
    pub fn from_values(rows: usize, cols: usize, values: Vec<f64>) -> KdResult<SharedBuffer> {
        if values.len() != rows * cols {
            return Err(KdError::invalid(format!(
                "{} values do not fill a {rows}x{cols} buffer",
                values.len()
            )));
        }
        let cells = values.into_iter().map(|v| AtomicU64::new(v.to_bits())).collect();
        Ok(Arc::new(Self::with_storage(rows, cols, Storage::F64(cells), true)))
    }

    /// Single-column buffer, one value per particle; marked populated.
    pub fn from_column(values: Vec<f64>) -> SharedBuffer {
        let rows = values.len();
        let cells = values.into_iter().map(|v| AtomicU64::new(v.to_bits())).collect();
        Arc::new(Self::with_storage(rows, 1, Storage::F64(cells), true))
    }

    /// (n, 3) buffer from a slice of points; marked populated.
    pub fn from_points(points: &[NVec3]) -> SharedBuffer {
        let cells = points
            .iter()
            .flat_map(|p| [p.x, p.y, p.z])
            .map(|v| AtomicU64::new(v.to_bits()))
            .collect();
        Arc::new(Self::with_storage(points.len(), 3, Storage::F64(cells), true))
    }

    /// Zero-filled `f64` buffer, not yet populated. Used for outputs.
    pub fn zeros(rows: usize, cols: usize) -> SharedBuffer {
        Self::zeros_typed(ElementType::F64, rows, cols)
    }

    /// Zero-filled buffer of an arbitrary element type.
    pub fn zeros_typed(element_type: ElementType, rows: usize, cols: usize) -> SharedBuffer {
        let len = rows * cols;
        let storage = match element_type {
            ElementType::F32 => Storage::F32((0..len).map(|_| AtomicU32::new(0)).collect()),
            ElementType::F64 => Storage::F64((0..len).map(|_| AtomicU64::new(0)).collect()),
            ElementType::I32 => Storage::I32((0..len).map(|_| AtomicI32::new(0)).collect()),
            ElementType::I64 => Storage::I64((0..len).map(|_| AtomicI64::new(0)).collect()),
        };
        Arc::new(Self::with_storage(rows, cols, storage, false))
    }

    fn with_storage(rows: usize, cols: usize, storage: Storage, populated: bool) -> Self {
        Self {
            rows,
            cols,
            storage,
            populated: AtomicBool::new(populated),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self.storage {
            Storage::F32(_) => ElementType::F32,
            Storage::F64(_) => ElementType::F64,
            Storage::I32(_) => ElementType::I32,
            Storage::I64(_) => ElementType::I64,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    pub fn mark_populated(&self) {
        self.populated.store(true, Ordering::Release);
    }

    /// Element at (`row`, `col`) widened to `f64`. Panics when out of range.
    pub fn get2(&self, row: usize, col: usize) -> f64 {
        let i = row * self.cols + col;
        match &self.storage {
            Storage::F32(c) => f32::from_bits(c[i].load(Ordering::Relaxed)) as f64,
            Storage::F64(c) => f64::from_bits(c[i].load(Ordering::Relaxed)),
            Storage::I32(c) => c[i].load(Ordering::Relaxed) as f64,
            Storage::I64(c) => c[i].load(Ordering::Relaxed) as f64,
        }
    }

    pub fn get(&self, row: usize) -> f64 {
        self.get2(row, 0)
    }

    /// Store `value` at (`row`, `col`), narrowing to the element type.
    pub fn set2(&self, row: usize, col: usize, value: f64) {
        let i = row * self.cols + col;
        match &self.storage {
            Storage::F32(c) => c[i].store((value as f32).to_bits(), Ordering::Relaxed),
            Storage::F64(c) => c[i].store(value.to_bits(), Ordering::Relaxed),
            Storage::I32(c) => c[i].store(value as i32, Ordering::Relaxed),
            Storage::I64(c) => c[i].store(value as i64, Ordering::Relaxed),
        }
    }

    pub fn set(&self, row: usize, value: f64) {
        self.set2(row, 0, value)
    }

    /// Row `row` of a three-column buffer as a vector.
    pub fn point(&self, row: usize) -> NVec3 {
        NVec3::new(self.get2(row, 0), self.get2(row, 1), self.get2(row, 2))
    }

    /// Snapshot of the whole buffer in row-major order.
    pub fn to_vec(&self) -> Vec<f64> {
        (0..self.rows)
            .flat_map(|row| (0..self.cols).map(move |col| (row, col)))
            .map(|(row, col)| self.get2(row, col))
            .collect()
    }
}
