//! Pairwise Stokes kernel formulas.
//!
//! Separations are `target - source`. Two regularization rules are in use:
//! the Oseen tensor switches to a smoothed kernel below `epsilon_distance`, the
//! stresslet inflates the distance below the same threshold.

use crate::params::KernelOptions;
use num::traits::FloatConst;

/// Regularization constants of a kernel evaluation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Regularization {
    pub reg2: f64,
    pub epsilon: f64,
}

impl Regularization {
    pub(crate) fn new(options: &KernelOptions) -> Self {
        Self {
            reg2: options.regularization() * options.regularization(),
            epsilon: options.epsilon_distance(),
        }
    }

    /// `(1/r, 1/r^3)` of the Oseen tensor, `None` for coincident points.
    #[inline]
    pub(crate) fn oseen(&self, r2: f64) -> Option<(f64, f64)> {
        if r2 == 0.0 {
            return None;
        }
        let r = r2.sqrt();
        if r > self.epsilon {
            let inv_r = 1.0 / r;
            Some((inv_r, inv_r * inv_r * inv_r))
        } else {
            let denom_inv = 1.0 / (r2 + self.reg2).sqrt();
            Some((denom_inv, denom_inv * denom_inv * denom_inv))
        }
    }

    /// Stresslet distance, inflated below the threshold.
    #[inline]
    pub(crate) fn stresslet_distance(&self, r2: f64) -> f64 {
        let r = r2.sqrt();
        if r < self.epsilon {
            (r2 + self.reg2).sqrt()
        } else {
            r
        }
    }
}

/// Prefactor of the Oseen tensor.
#[inline]
pub fn oseen_factor(eta: f64) -> f64 {
    0.125 * f64::FRAC_1_PI() / eta
}

/// Prefactor of the stresslet.
#[inline]
pub fn stresslet_factor(eta: f64) -> f64 {
    -0.75 * f64::FRAC_1_PI() / eta
}

/// Difference `target - source` and its squared norm.
#[inline]
pub(crate) fn separation(target: &[f64], source: &[f64]) -> ([f64; 3], f64) {
    let dr = [
        target[0] - source[0],
        target[1] - source[1],
        target[2] - source[2],
    ];
    (dr, dr[0] * dr[0] + dr[1] * dr[1] + dr[2] * dr[2])
}

/// Add the stokeslet of `force` to `result` (`[u, v, w]` or `[p, u, v, w]`).
#[inline]
pub(crate) fn add_stokeslet(
    factor: f64,
    dr: &[f64; 3],
    inv_r: f64,
    inv_r3: f64,
    force: &[f64],
    result: &mut [f64],
) {
    let rf = dr[0] * force[0] + dr[1] * force[1] + dr[2] * force[2];
    let offset = result.len() - 3;
    if offset == 1 {
        result[0] += 0.25 * f64::FRAC_1_PI() * rf * inv_r3;
    }
    for c in 0..3 {
        result[offset + c] += factor * (force[c] * inv_r + dr[c] * rf * inv_r3);
    }
}

/// Add the double layer of a density `q` on a surface element with normal `n`.
#[inline]
pub(crate) fn add_double_layer(
    factor: f64,
    dr: &[f64; 3],
    r: f64,
    normal: &[f64],
    density: &[f64],
    result: &mut [f64],
) {
    let rn = dr[0] * normal[0] + dr[1] * normal[1] + dr[2] * normal[2];
    let rq = dr[0] * density[0] + dr[1] * density[1] + dr[2] * density[2];
    let inv_r2 = 1.0 / (r * r);
    let inv_r3 = inv_r2 / r;
    let inv_r5 = inv_r3 * inv_r2;
    let offset = result.len() - 3;
    if offset == 1 {
        let qn = density[0] * normal[0] + density[1] * normal[1] + density[2] * normal[2];
        result[0] += 0.5 * f64::FRAC_1_PI() * (qn * inv_r3 - 3.0 * rq * rn * inv_r5);
    }
    let f0 = factor * rq * rn * inv_r5;
    for c in 0..3 {
        result[offset + c] += f0 * dr[c];
    }
}

/// Add the double layer of a full strength tensor `q n^T`, stored row major.
///
/// Used by the treecode where proxy strengths are no longer rank one.
#[inline]
pub(crate) fn add_double_layer_tensor(
    factor: f64,
    dr: &[f64; 3],
    r: f64,
    strength: &[f64],
    result: &mut [f64],
) {
    let mut rqr = 0.0;
    for j in 0..3 {
        for k in 0..3 {
            rqr += dr[j] * strength[3 * j + k] * dr[k];
        }
    }
    let inv_r2 = 1.0 / (r * r);
    let inv_r3 = inv_r2 / r;
    let inv_r5 = inv_r3 * inv_r2;
    let offset = result.len() - 3;
    if offset == 1 {
        let trace = strength[0] + strength[4] + strength[8];
        result[0] += 0.5 * f64::FRAC_1_PI() * (trace * inv_r3 - 3.0 * rqr * inv_r5);
    }
    let f0 = factor * rqr * inv_r5;
    for c in 0..3 {
        result[offset + c] += f0 * dr[c];
    }
}
