//! Direct O(N^2) evaluation of the Stokes kernels.
use crate::kernel::helpers::{
    add_double_layer, add_stokeslet, oseen_factor, separation, stresslet_factor, Regularization,
};
use crate::kernel::{check_dimensions, check_result};
use crate::linalg::{zeros, Matrix};
use crate::params::KernelOptions;
use crate::traits::StokesEvaluator;
use crate::types::EvalType;
use itertools::izip;
use rayon::prelude::*;
use rlst::RawAccessMut;

/// Direct evaluator of the regularized Stokes kernels.
#[derive(Debug, Clone)]
pub struct DirectEvaluator {
    eta: f64,
    regularization: Regularization,
    use_multithreaded: bool,
}

impl DirectEvaluator {
    /// Create a new direct evaluator.
    pub fn new(eta: f64, options: &KernelOptions) -> Self {
        Self {
            eta,
            regularization: Regularization::new(options),
            use_multithreaded: options.use_multithreaded(),
        }
    }

    /// Viscosity.
    pub fn eta(&self) -> f64 {
        self.eta
    }

    fn for_each_target<F>(&self, eval_type: EvalType, targets: &[f64], result: &mut [f64], f: F)
    where
        F: Fn(&[f64], &mut [f64]) + Sync + Send,
    {
        let range_dim = eval_type.component_count();
        result.fill(0.0);
        if self.use_multithreaded {
            result
                .par_chunks_exact_mut(range_dim)
                .enumerate()
                .for_each(|(target_index, my_chunk)| {
                    f(&targets[3 * target_index..3 * target_index + 3], my_chunk)
                });
        } else {
            result
                .chunks_exact_mut(range_dim)
                .enumerate()
                .for_each(|(target_index, my_chunk)| {
                    f(&targets[3 * target_index..3 * target_index + 3], my_chunk)
                });
        }
    }
}

impl StokesEvaluator for DirectEvaluator {
    fn evaluate_single_layer(
        &self,
        eval_type: EvalType,
        sources: &[f64],
        forces: &[f64],
        targets: &[f64],
        result: &mut [f64],
    ) {
        check_dimensions(sources, &[forces], targets);
        check_result(eval_type, targets, result);
        let factor = oseen_factor(self.eta);
        let reg = self.regularization;

        self.for_each_target(eval_type, targets, result, |target, my_chunk| {
            for (source, force) in sources.chunks_exact(3).zip(forces.chunks_exact(3)) {
                let (dr, r2) = separation(target, source);
                if let Some((inv_r, inv_r3)) = reg.oseen(r2) {
                    add_stokeslet(factor, &dr, inv_r, inv_r3, force, my_chunk);
                }
            }
        });
    }

    fn evaluate_double_layer(
        &self,
        eval_type: EvalType,
        sources: &[f64],
        normals: &[f64],
        densities: &[f64],
        targets: &[f64],
        result: &mut [f64],
    ) {
        check_dimensions(sources, &[normals, densities], targets);
        check_result(eval_type, targets, result);
        let factor = stresslet_factor(self.eta);
        let reg = self.regularization;

        self.for_each_target(eval_type, targets, result, |target, my_chunk| {
            for (source, normal, density) in izip!(
                sources.chunks_exact(3),
                normals.chunks_exact(3),
                densities.chunks_exact(3)
            ) {
                let (dr, r2) = separation(target, source);
                if r2 == 0.0 {
                    continue;
                }
                let r = reg.stresslet_distance(r2);
                add_double_layer(factor, &dr, r, normal, density, my_chunk);
            }
        });
    }
}

/// Velocity at `r_trg` induced by point forces `density` at `r_src`.
pub fn oseen_tensor_contract_direct(
    r_src: &[f64],
    r_trg: &[f64],
    density: &[f64],
    eta: f64,
    options: &KernelOptions,
) -> Vec<f64> {
    let mut result = vec![0.0; r_trg.len()];
    DirectEvaluator::new(eta, options).evaluate_single_layer(
        EvalType::Velocity,
        r_src,
        density,
        r_trg,
        &mut result,
    );
    result
}

/// Dense Oseen tensor of shape `(3 n_trg) x (3 n_src)`.
///
/// Blocks of coincident points are zero.
pub fn oseen_tensor_direct(
    r_src: &[f64],
    r_trg: &[f64],
    eta: f64,
    options: &KernelOptions,
) -> Matrix {
    check_dimensions(r_src, &[], r_trg);
    let n_src = r_src.len() / 3;
    let n_trg = r_trg.len() / 3;
    let factor = oseen_factor(eta);
    let reg = Regularization::new(options);

    let mut mat = zeros(3 * n_trg, 3 * n_src);
    let rows = 3 * n_trg;
    let data = mat.data_mut();
    for (i_src, source) in r_src.chunks_exact(3).enumerate() {
        for (i_trg, target) in r_trg.chunks_exact(3).enumerate() {
            let (dr, r2) = separation(target, source);
            let Some((inv_r, inv_r3)) = reg.oseen(r2) else {
                continue;
            };
            let fr = factor * inv_r;
            let gr = factor * inv_r3;
            for b in 0..3 {
                for a in 0..3 {
                    let diag = if a == b { fr } else { 0.0 };
                    data[(3 * i_trg + a) + (3 * i_src + b) * rows] = diag + gr * dr[a] * dr[b];
                }
            }
        }
    }
    mat
}

/// Stresslet contracted with the source normals, shape `3n x 3n`.
///
/// Block `(i, j)` maps a density at node `j` to the velocity at node `i`. Diagonal
/// blocks are zero.
pub fn stresslet_times_normal(
    r_src: &[f64],
    normals: &[f64],
    eta: f64,
    options: &KernelOptions,
) -> Matrix {
    check_dimensions(r_src, &[normals], r_src);
    let n = r_src.len() / 3;
    let factor = stresslet_factor(eta);
    let reg = Regularization::new(options);

    let mut mat = zeros(3 * n, 3 * n);
    let rows = 3 * n;
    let data = mat.data_mut();
    for (j, (source, normal)) in r_src.chunks_exact(3).zip(normals.chunks_exact(3)).enumerate() {
        for (i, target) in r_src.chunks_exact(3).enumerate() {
            if i == j {
                continue;
            }
            let (dr, r2) = separation(target, source);
            let r = reg.stresslet_distance(r2);
            let rn = dr[0] * normal[0] + dr[1] * normal[1] + dr[2] * normal[2];
            let scale = factor * rn / r.powi(5);
            for b in 0..3 {
                for a in 0..3 {
                    data[(3 * i + a) + (3 * j + b) * rows] = scale * dr[a] * dr[b];
                }
            }
        }
    }
    mat
}

/// Stresslet contracted with normals and a density, evaluated at the source nodes.
///
/// Self interactions are skipped.
pub fn stresslet_times_normal_times_density(
    r_src: &[f64],
    normals: &[f64],
    density: &[f64],
    eta: f64,
    options: &KernelOptions,
) -> Vec<f64> {
    check_dimensions(r_src, &[normals, density], r_src);
    let factor = stresslet_factor(eta);
    let reg = Regularization::new(options);
    let mut result = vec![0.0; r_src.len()];

    let evaluate = |(i, my_chunk): (usize, &mut [f64])| {
        let target = &r_src[3 * i..3 * i + 3];
        for (j, (source, normal, q)) in izip!(
            r_src.chunks_exact(3),
            normals.chunks_exact(3),
            density.chunks_exact(3)
        )
        .enumerate()
        {
            if i == j {
                continue;
            }
            let (dr, r2) = separation(target, source);
            let r = reg.stresslet_distance(r2);
            add_double_layer(factor, &dr, r, normal, q, my_chunk);
        }
    };
    if options.use_multithreaded() {
        result.par_chunks_exact_mut(3).enumerate().for_each(evaluate);
    } else {
        result.chunks_exact_mut(3).enumerate().for_each(evaluate);
    }
    result
}

/// Velocity at `r_trg` induced by point torques at `r_src`.
pub fn rotlet(
    r_src: &[f64],
    r_trg: &[f64],
    torques: &[f64],
    eta: f64,
    options: &KernelOptions,
) -> Vec<f64> {
    check_dimensions(r_src, &[torques], r_trg);
    let factor = oseen_factor(eta);
    let reg = Regularization::new(options);
    let mut result = vec![0.0; r_trg.len()];

    for (target, u) in r_trg.chunks_exact(3).zip(result.chunks_exact_mut(3)) {
        for (source, torque) in r_src.chunks_exact(3).zip(torques.chunks_exact(3)) {
            let (dr, r2) = separation(target, source);
            let Some((_, inv_r3)) = reg.oseen(r2) else {
                continue;
            };
            let txr = crate::geometry::cross(torque, &dr);
            for c in 0..3 {
                u[c] += factor * txr[c] * inv_r3;
            }
        }
    }
    result
}
