//! SPH kernels and the neighbour reductions built on them.
//!
//! Both kernels are normalised in 3D and have compact support `2h`. The
//! reductions take neighbours as `(host row, squared distance)` pairs so
//! they never see the tree's physical ordering.

use std::f64::consts::PI;

use serde::Deserialize;

use crate::fields::FieldBuffer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kernel {
    /// Monaghan M4 cubic spline.
    #[default]
    CubicSpline,
    /// Wendland C2 (Dehnen & Aly 2012 normalisation).
    WendlandC2,
}

impl Kernel {
    /// Support radius in units of h.
    pub fn support(self) -> f64 {
        2.0
    }

    /// W(r, h). Zero for `h <= 0` and outside the support.
    #[inline]
    pub fn weight(self, r: f64, h: f64) -> f64 {
        if h <= 0.0 {
            return 0.0;
        }
        let q = r / h;
        if q >= self.support() {
            return 0.0;
        }
        let h3 = h * h * h;
        match self {
            Kernel::CubicSpline => {
                let w = if q < 1.0 {
                    1.0 - 1.5 * q * q + 0.75 * q * q * q
                } else {
                    let t = 2.0 - q;
                    0.25 * t * t * t
                };
                w / (PI * h3)
            }
            Kernel::WendlandC2 => {
                let t = 1.0 - 0.5 * q;
                let t2 = t * t;
                21.0 / (16.0 * PI * h3) * t2 * t2 * (1.0 + 2.0 * q)
            }
        }
    }
}

/// rho_i = sum_j m_j W(r_ij, h_i)
pub fn density(
    kernel: Kernel,
    h: f64,
    neighbors: impl Iterator<Item = (usize, f64)>,
    mass: &FieldBuffer,
) -> f64 {
    neighbors
        .map(|(j, d2)| mass.get(j) * kernel.weight(d2.sqrt(), h))
        .sum()
}

/// Kernel-weighted mean of every column of `qty`:
/// Q_i = sum_j (m_j / rho_j) Q_j W(r_ij, h_i)
///
/// Neighbours with zero density carry no volume and are skipped.
pub fn quantity_mean(
    kernel: Kernel,
    h: f64,
    neighbors: impl Iterator<Item = (usize, f64)>,
    mass: &FieldBuffer,
    rho: &FieldBuffer,
    qty: &FieldBuffer,
    out: &mut [f64],
) {
    out.fill(0.0);
    for (j, d2) in neighbors {
        let rho_j = rho.get(j);
        if rho_j == 0.0 {
            continue;
        }
        let w = mass.get(j) / rho_j * kernel.weight(d2.sqrt(), h);
        for (col, acc) in out.iter_mut().enumerate() {
            *acc += w * qty.get2(j, col);
        }
    }
}

/// Kernel-weighted dispersion of `qty` about `mean`, summed over columns:
/// sigma_i = sqrt( sum_j (m_j / rho_j) W(r_ij, h_i) |Q_j - Q_i|^2 )
pub fn quantity_dispersion(
    kernel: Kernel,
    h: f64,
    neighbors: impl Iterator<Item = (usize, f64)>,
    mass: &FieldBuffer,
    rho: &FieldBuffer,
    qty: &FieldBuffer,
    mean: &[f64],
) -> f64 {
    let mut acc = 0.0;
    for (j, d2) in neighbors {
        let rho_j = rho.get(j);
        if rho_j == 0.0 {
            continue;
        }
        let w = mass.get(j) / rho_j * kernel.weight(d2.sqrt(), h);
        let dev2: f64 = mean
            .iter()
            .enumerate()
            .map(|(col, m)| {
                let d = qty.get2(j, col) - m;
                d * d
            })
            .sum();
        acc += w * dev2;
    }
    acc.max(0.0).sqrt()
}
