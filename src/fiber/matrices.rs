//! Spectral collocation matrices of a fiber, tabulated by node count.
//!
//! Nodes are Chebyshev points of the second kind on `[-1, 1]`, ascending. The
//! matrices here are on the reference interval; derivatives along a fiber of length
//! `L` pick up a factor `(2 / L)^k`.
use crate::linalg::{entry, from_fn, matmul, set, Matrix};
use crate::types::{Error, Result};
use num::traits::FloatConst;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Smallest supported number of nodes per fiber.
pub const MIN_NODES: usize = 6;

lazy_static! {
    static ref TABLE: Mutex<HashMap<usize, Arc<FiberMatrices>>> = Mutex::new(HashMap::new());
}

/// Differentiation, quadrature and downsampling matrices for one node count.
#[derive(Debug)]
pub struct FiberMatrices {
    /// Collocation nodes on `[-1, 1]`.
    pub alpha: Vec<f64>,
    /// Clenshaw-Curtis weights on `[-1, 1]`.
    pub weights_0: Vec<f64>,
    /// Derivative matrices of order 1 to 4.
    pub d: [Matrix; 4],
    /// Interpolation to the `n - 4` first kind points used by the position equations.
    pub p_x: Matrix,
    /// Interpolation to the `n - 2` first kind points used by the tension equations.
    pub p_t: Matrix,
}

/// Spectral matrices for `n_nodes` nodes, computed once per node count.
pub fn matrices(n_nodes: usize) -> Result<Arc<FiberMatrices>> {
    if n_nodes < MIN_NODES {
        return Err(Error::InvalidParameter(format!(
            "fibers need at least {MIN_NODES} nodes, got {n_nodes}"
        )));
    }
    let mut table = TABLE.lock().unwrap_or_else(|e| e.into_inner());
    Ok(table
        .entry(n_nodes)
        .or_insert_with(|| Arc::new(FiberMatrices::new(n_nodes)))
        .clone())
}

fn barycentric_weights(n: usize) -> Vec<f64> {
    (0..n)
        .map(|j| {
            let sign = if j % 2 == 0 { 1.0 } else { -1.0 };
            if j == 0 || j == n - 1 {
                0.5 * sign
            } else {
                sign
            }
        })
        .collect()
}

fn clenshaw_curtis(n: usize) -> Vec<f64> {
    let order = n - 1;
    let nf = order as f64;
    let mut w = vec![0.0; n];
    let mut v = vec![1.0; n - 2];
    let theta = |k: usize| f64::PI() * k as f64 / nf;

    if order % 2 == 0 {
        w[0] = 1.0 / (nf * nf - 1.0);
        for k in 1..order / 2 {
            let kf = k as f64;
            for (i, vi) in v.iter_mut().enumerate() {
                *vi -= 2.0 * (2.0 * kf * theta(i + 1)).cos() / (4.0 * kf * kf - 1.0);
            }
        }
        for (i, vi) in v.iter_mut().enumerate() {
            *vi -= (nf * theta(i + 1)).cos() / (nf * nf - 1.0);
        }
    } else {
        w[0] = 1.0 / (nf * nf);
        for k in 1..=(order - 1) / 2 {
            let kf = k as f64;
            for (i, vi) in v.iter_mut().enumerate() {
                *vi -= 2.0 * (2.0 * kf * theta(i + 1)).cos() / (4.0 * kf * kf - 1.0);
            }
        }
    }
    w[order] = w[0];
    for (i, vi) in v.iter().enumerate() {
        w[i + 1] = 2.0 * vi / nf;
    }
    w
}

/// Barycentric interpolation from `nodes` to `points`.
fn interpolation_matrix(nodes: &[f64], weights: &[f64], points: &[f64]) -> Matrix {
    from_fn(points.len(), nodes.len(), |i, j| {
        let y = points[i];
        if let Some(k) = nodes.iter().position(|x| *x == y) {
            return if k == j { 1.0 } else { 0.0 };
        }
        let denominator: f64 = nodes
            .iter()
            .zip(weights)
            .map(|(x, w)| w / (y - x))
            .sum();
        weights[j] / (y - nodes[j]) / denominator
    })
}

fn first_kind_points(m: usize) -> Vec<f64> {
    (0..m)
        .map(|i| -(f64::PI() * (2 * i + 1) as f64 / (2 * m) as f64).cos())
        .collect()
}

impl FiberMatrices {
    fn new(n: usize) -> Self {
        let alpha: Vec<f64> = (0..n)
            .map(|j| -(f64::PI() * j as f64 / (n - 1) as f64).cos())
            .collect();
        let weights = barycentric_weights(n);

        let mut d1 = from_fn(n, n, |i, j| {
            if i == j {
                0.0
            } else {
                weights[j] / weights[i] / (alpha[i] - alpha[j])
            }
        });
        for i in 0..n {
            let row_sum: f64 = (0..n).map(|j| entry(&d1, i, j)).sum();
            set(&mut d1, i, i, -row_sum);
        }
        let d2 = matmul(&d1, &d1);
        let d3 = matmul(&d2, &d1);
        let d4 = matmul(&d3, &d1);

        let p_x = interpolation_matrix(&alpha, &weights, &first_kind_points(n - 4));
        let p_t = interpolation_matrix(&alpha, &weights, &first_kind_points(n - 2));

        Self {
            weights_0: clenshaw_curtis(n),
            alpha,
            d: [d1, d2, d3, d4],
            p_x,
            p_t,
        }
    }

    /// Number of nodes.
    pub fn n_nodes(&self) -> usize {
        self.alpha.len()
    }
}
