//! Core particle-store types for the spatial index.
//!
//! Defines the vector alias used throughout the crate and the `Particle`
//! record the tree reorders in place during build. `original_index` is the
//! only handle the host buffers understand; the physical position of a record
//! in the tree's array is free to change.

use nalgebra::Vector3;
pub type NVec3 = Vector3<f64>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub original_index: usize, // row in every host buffer
    pub active: bool,          // takes part in queries and claims
    pub r: NVec3,              // position snapshot taken at build
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: NVec3,
    pub max: NVec3,
}

impl Aabb {
    /// Box that contains nothing; growing it by any point yields that point.
    pub fn empty() -> Self {
        Self {
            min: NVec3::repeat(f64::INFINITY),
            max: NVec3::repeat(f64::NEG_INFINITY),
        }
    }

    /// Tight box around a slice of particles.
    pub fn enclosing(particles: &[Particle]) -> Self {
        let mut bbox = Self::empty();
        for p in particles {
            bbox.grow(&p.r);
        }
        bbox
    }

    pub fn grow(&mut self, p: &NVec3) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn extent(&self) -> NVec3 {
        self.max - self.min
    }

    /// Axis of greatest extent. Equal extents resolve to the lowest axis
    /// (x, then y, then z) so identical inputs always split the same way.
    pub fn widest_axis(&self) -> usize {
        let e = self.extent();
        let mut axis = 0;
        for d in 1..3 {
            if e[d] > e[axis] {
                axis = d;
            }
        }
        axis
    }

    pub fn contains(&self, p: &NVec3) -> bool {
        (0..3).all(|d| p[d] >= self.min[d] && p[d] <= self.max[d])
    }

    /// Squared distance from `p` to the closest point of the box, with
    /// per-axis wraparound where `period` is finite. Neither `p` nor the box
    /// has to lie inside `[0, period)`.
    pub fn min_dist2(&self, p: &NVec3, period: &NVec3) -> f64 {
        let mut d2 = 0.0;
        for d in 0..3 {
            let gap = interval_gap(p[d], self.min[d], self.max[d]);
            let gap = if period[d].is_finite() {
                gap.min(periodic_gap(p[d], self.min[d], self.max[d], period[d]))
            } else {
                gap
            };
            d2 += gap * gap;
        }
        d2
    }
}

/// Minimum-image distance from `x` to the interval `[lo, hi]` on a circle of
/// length `period`.
fn periodic_gap(x: f64, lo: f64, hi: f64, period: f64) -> f64 {
    let width = hi - lo;
    if width >= period {
        return 0.0;
    }
    let offset = (x - lo).rem_euclid(period);
    if offset <= width {
        0.0
    } else {
        (offset - width).min(period - offset)
    }
}

fn interval_gap(x: f64, lo: f64, hi: f64) -> f64 {
    if x < lo {
        lo - x
    } else if x > hi {
        x - hi
    } else {
        0.0
    }
}

/// Squared minimum-image distance between two points.
pub fn periodic_dist2(a: &NVec3, b: &NVec3, period: &NVec3) -> f64 {
    let mut d2 = 0.0;
    for d in 0..3 {
        let mut dx = (a[d] - b[d]).abs();
        if period[d].is_finite() {
            dx = dx.rem_euclid(period[d]);
            dx = dx.min(period[d] - dx);
        }
        d2 += dx * dx;
    }
    d2
}

/// Period vector meaning "no wraparound on any axis".
pub fn open_boundaries() -> NVec3 {
    NVec3::repeat(f64::INFINITY)
}
