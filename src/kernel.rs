//! Stokes kernels
//!
//! The [KernelProvider] picks between the [DirectEvaluator] and the [Treecode]
//! depending on the size of the interaction.
pub mod direct;
pub mod helpers;
pub mod treecode;

pub use direct::{
    oseen_tensor_contract_direct, oseen_tensor_direct, rotlet, stresslet_times_normal,
    stresslet_times_normal_times_density, DirectEvaluator,
};
pub use treecode::Treecode;

use crate::params::KernelOptions;
use crate::traits::StokesEvaluator;
use crate::types::EvalType;
use log::debug;

pub(crate) fn check_dimensions(sources: &[f64], per_source: &[&[f64]], targets: &[f64]) {
    assert!(
        sources.len() % 3 == 0,
        "Length of sources {} is not a multiple of 3.",
        sources.len()
    );
    assert!(
        targets.len() % 3 == 0,
        "Length of targets {} is not a multiple of 3.",
        targets.len()
    );
    for values in per_source {
        assert_eq!(
            values.len(),
            sources.len(),
            "Wrong dimension of source data. {} != {}",
            values.len(),
            sources.len()
        );
    }
}

pub(crate) fn check_result(eval_type: EvalType, targets: &[f64], result: &[f64]) {
    assert_eq!(
        result.len(),
        eval_type.component_count() * targets.len() / 3,
        "Wrong dimension for `result`. {} != {}",
        result.len(),
        eval_type.component_count() * targets.len() / 3
    );
}

/// Stokes kernel evaluation with automatic choice of method.
#[derive(Debug)]
pub struct KernelProvider {
    options: KernelOptions,
    direct: DirectEvaluator,
    treecode: Treecode,
}

impl KernelProvider {
    /// Create a new kernel provider for a fluid with viscosity `eta`.
    pub fn new(eta: f64, options: &KernelOptions) -> Self {
        Self {
            options: options.clone(),
            direct: DirectEvaluator::new(eta, options),
            treecode: Treecode::new(eta, options),
        }
    }

    /// Viscosity.
    pub fn eta(&self) -> f64 {
        self.direct.eta()
    }

    /// Kernel options.
    pub fn options(&self) -> &KernelOptions {
        &self.options
    }

    /// Whether an interaction of this size is evaluated directly.
    pub fn uses_direct(&self, n_sources: usize, n_targets: usize) -> bool {
        let crossover = self.options.direct_crossover();
        n_sources.saturating_mul(n_targets) <= crossover.saturating_mul(crossover)
    }

    /// The direct evaluator.
    pub fn direct(&self) -> &DirectEvaluator {
        &self.direct
    }

    /// The accelerated evaluator.
    pub fn treecode(&self) -> &Treecode {
        &self.treecode
    }

    fn select(&self, sources: &[f64], targets: &[f64]) -> &dyn StokesEvaluator {
        let (n_src, n_trg) = (sources.len() / 3, targets.len() / 3);
        if self.uses_direct(n_src, n_trg) {
            debug!("Direct Stokes evaluation: {n_src} sources, {n_trg} targets");
            &self.direct
        } else {
            debug!("Treecode Stokes evaluation: {n_src} sources, {n_trg} targets");
            &self.treecode
        }
    }

    /// Velocity at `targets` induced by point forces.
    pub fn stokeslet_velocity(&self, sources: &[f64], forces: &[f64], targets: &[f64]) -> Vec<f64> {
        let mut result = vec![0.0; targets.len()];
        self.evaluate_single_layer(EvalType::Velocity, sources, forces, targets, &mut result);
        result
    }

    /// Velocity at `targets` induced by a double layer density.
    pub fn stresslet_velocity(
        &self,
        sources: &[f64],
        normals: &[f64],
        densities: &[f64],
        targets: &[f64],
    ) -> Vec<f64> {
        let mut result = vec![0.0; targets.len()];
        self.evaluate_double_layer(
            EvalType::Velocity,
            sources,
            normals,
            densities,
            targets,
            &mut result,
        );
        result
    }
}

impl StokesEvaluator for KernelProvider {
    fn evaluate_single_layer(
        &self,
        eval_type: EvalType,
        sources: &[f64],
        forces: &[f64],
        targets: &[f64],
        result: &mut [f64],
    ) {
        self.select(sources, targets)
            .evaluate_single_layer(eval_type, sources, forces, targets, result);
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
        self.select(sources, targets).evaluate_double_layer(
            eval_type, sources, normals, densities, targets, result,
        );
    }

    fn clear(&self) {
        self.treecode.clear();
    }
}
