//! Trait definitions

use crate::types::{EvalType, Result};

/// Evaluator of Stokes potentials between point sets.
///
/// Points, forces, normals and densities are interleaved 3-vectors. The result
/// holds `eval_type.component_count()` values per target and is overwritten. For
/// [EvalType::PressureVelocity] the pressure comes first.
pub trait StokesEvaluator {
    /// Velocity induced at `targets` by point forces at `sources` (stokeslet sum).
    ///
    /// Coincident source/target pairs contribute nothing.
    fn evaluate_single_layer(
        &self,
        eval_type: EvalType,
        sources: &[f64],
        forces: &[f64],
        targets: &[f64],
        result: &mut [f64],
    );

    /// Velocity induced at `targets` by a double layer with the given normals and densities.
    ///
    /// Coincident source/target pairs contribute nothing.
    fn evaluate_double_layer(
        &self,
        eval_type: EvalType,
        sources: &[f64],
        normals: &[f64],
        densities: &[f64],
        targets: &[f64],
        result: &mut [f64],
    );

    /// Drop any acceleration state kept from a previous evaluation.
    fn clear(&self) {}
}

/// Local operator of a group of entities as seen by the outer Krylov solver.
///
/// `x` is the slice of the global unknown vector the operator acts on. For the
/// periphery this is the gathered global density, for fibers and bodies it is the
/// locally owned slice. `v_on_nodes` is the velocity induced by all other sources at
/// the local nodes, interleaved.
pub trait LocalOperator {
    /// Number of unknowns owned by this process.
    fn local_solution_size(&self) -> usize;

    /// Number of nodes owned by this process.
    fn local_node_count(&self) -> usize;

    /// Right hand side of the owned unknowns.
    ///
    /// Fails if the right hand side has not been built for the current geometry.
    fn rhs(&self) -> Result<Vec<f64>>;

    /// Apply the block diagonal preconditioner.
    fn apply_preconditioner(&self, x: &[f64]) -> Result<Vec<f64>>;

    /// Apply the forward operator including the externally induced velocity.
    fn matvec(&self, x: &[f64], v_on_nodes: &[f64]) -> Result<Vec<f64>>;
}
