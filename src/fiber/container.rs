//! Collections of fibers.
use crate::fiber::Fiber;
use crate::kernel::KernelProvider;
use crate::linalg::matvec;
use crate::traits::LocalOperator;
use crate::types::{Error, Result};
use rayon::prelude::*;

/// The fibers owned by this process.
#[derive(Debug, Default)]
pub struct FiberContainer {
    fibers: Vec<Fiber>,
}

/// Offsets of consecutive blocks with the given sizes.
fn offsets(sizes: impl Iterator<Item = usize>) -> Vec<usize> {
    let mut result = vec![0];
    for size in sizes {
        result.push(result[result.len() - 1] + size);
    }
    result
}

impl FiberContainer {
    /// Create a container from a set of fibers.
    pub fn new(fibers: Vec<Fiber>) -> Self {
        Self { fibers }
    }

    /// The fibers.
    pub fn fibers(&self) -> &[Fiber] {
        &self.fibers
    }

    /// Mutable access to the fibers.
    pub fn fibers_mut(&mut self) -> &mut [Fiber] {
        &mut self.fibers
    }

    /// Number of fibers.
    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    /// Whether there are no fibers.
    pub fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }

    /// Add a fiber.
    pub fn push(&mut self, fiber: Fiber) {
        self.fibers.push(fiber);
    }

    fn node_offsets(&self) -> Vec<usize> {
        offsets(self.fibers.iter().map(|f| 3 * f.n_nodes()))
    }

    fn solution_offsets(&self) -> Vec<usize> {
        offsets(self.fibers.iter().map(|f| f.solution_size()))
    }

    fn check_len(&self, what: &'static str, values: &[f64], expected: usize) -> Result<()> {
        if values.len() != expected {
            return Err(Error::SizeMismatch {
                what,
                expected,
                found: values.len(),
            });
        }
        Ok(())
    }

    /// Node positions of all fibers, interleaved.
    pub fn node_positions(&self) -> Vec<f64> {
        self.fibers
            .iter()
            .flat_map(|f| f.positions().iter().copied())
            .collect()
    }

    /// Recompute the arclength derivatives of all fibers.
    pub fn update_derivatives(&mut self) -> Result<()> {
        self.fibers
            .par_iter_mut()
            .try_for_each(|fiber| fiber.update_derivatives())
    }

    /// Recompute the self interaction tensors of all fibers.
    pub fn update_stokeslets(&mut self, eta: f64) -> Result<()> {
        self.fibers
            .par_iter_mut()
            .try_for_each(|fiber| fiber.update_stokeslet(eta))
    }

    /// Form the linear operators of all fibers.
    pub fn form_linear_operators(&mut self, dt: f64, eta: f64) -> Result<()> {
        self.fibers
            .par_iter_mut()
            .try_for_each(|fiber| fiber.form_linear_operator(dt, eta))
    }

    /// Compute right hand sides, apply boundary conditions and build preconditioners.
    ///
    /// `flow` and `f_external` hold one 3-vector per fiber node.
    pub fn update_rhs(&mut self, flow: &[f64], f_external: &[f64]) -> Result<()> {
        let total = 3 * self.local_node_count();
        self.check_len("fiber flow", flow, total)?;
        self.check_len("fiber external force", f_external, total)?;
        let offsets = self.node_offsets();
        self.fibers
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(i, fiber)| {
                let range = offsets[i]..offsets[i + 1];
                fiber.compute_rhs(&flow[range.clone()], &f_external[range])?;
                fiber.apply_bc_rectangular()?;
                fiber.build_preconditioner()
            })
    }

    /// Subtract the minus end link velocities, 7 per fiber, from the fiber block `y`.
    ///
    /// Fibers without a binding site are left untouched.
    pub fn apply_link_velocities(&self, velocities: &[f64], y: &mut [f64]) -> Result<()> {
        let offsets = self.solution_offsets();
        self.check_len("fiber link velocities", velocities, 7 * self.fibers.len())?;
        self.check_len("fiber block", y, offsets[offsets.len() - 1])?;
        for (i, (fiber, link)) in self.fibers.iter().zip(velocities.chunks_exact(7)).enumerate() {
            if fiber.binding_site().is_none() {
                continue;
            }
            let link: [f64; 7] = [link[0], link[1], link[2], link[3], link[4], link[5], link[6]];
            fiber.apply_link_velocity(&link, &mut y[offsets[i]..offsets[i + 1]])?;
        }
        Ok(())
    }

    /// Constant force density along the tangent of every fiber.
    pub fn generate_constant_force(&self, force_scale: f64) -> Vec<f64> {
        self.fibers
            .iter()
            .flat_map(|f| f.xs().iter().map(move |t| force_scale * t))
            .collect()
    }

    /// Point forces at all fiber nodes for the fiber slice `x` of a solution.
    pub fn apply_fiber_force(&self, x: &[f64]) -> Result<Vec<f64>> {
        let offsets = self.solution_offsets();
        self.check_len("fiber solution", x, offsets[offsets.len() - 1])?;
        let forces = self
            .fibers
            .par_iter()
            .enumerate()
            .map(|(i, fiber)| fiber.apply_fiber_force(&x[offsets[i]..offsets[i + 1]]))
            .collect::<Result<Vec<_>>>()?;
        Ok(forces.concat())
    }

    /// Point forces from a force density given at every fiber node.
    pub fn point_forces(&self, force_density: &[f64]) -> Result<Vec<f64>> {
        self.check_len("fiber force density", force_density, 3 * self.local_node_count())?;
        let weights = self
            .fibers
            .iter()
            .flat_map(|f| f.quadrature_weights());
        Ok(force_density
            .chunks_exact(3)
            .zip(weights)
            .flat_map(|(f, w)| [f[0] * w, f[1] * w, f[2] * w])
            .collect())
    }

    /// Velocity at `r_trg` induced by point forces at all fiber nodes.
    pub fn flow(&self, kernel: &KernelProvider, forces: &[f64], r_trg: &[f64]) -> Result<Vec<f64>> {
        self.check_len("fiber forces", forces, 3 * self.local_node_count())?;
        Ok(kernel.stokeslet_velocity(&self.node_positions(), forces, r_trg))
    }

    /// Velocity at each fiber's nodes due to its own point forces.
    ///
    /// This part of [FiberContainer::flow] is already described by the local mobility of
    /// each fiber and is removed from the velocity at its own nodes.
    pub fn self_flow(&self, forces: &[f64]) -> Result<Vec<f64>> {
        let offsets = self.node_offsets();
        self.check_len("fiber forces", forces, offsets[offsets.len() - 1])?;
        let blocks = self
            .fibers
            .par_iter()
            .enumerate()
            .map(|(i, fiber)| Ok(matvec(fiber.stokeslet()?, &forces[offsets[i]..offsets[i + 1]])))
            .collect::<Result<Vec<_>>>()?;
        Ok(blocks.concat())
    }
}

impl LocalOperator for FiberContainer {
    fn local_solution_size(&self) -> usize {
        self.fibers.iter().map(|f| f.solution_size()).sum()
    }

    fn local_node_count(&self) -> usize {
        self.fibers.iter().map(|f| f.n_nodes()).sum()
    }

    fn rhs(&self) -> Result<Vec<f64>> {
        let mut rhs = Vec::with_capacity(self.local_solution_size());
        for fiber in &self.fibers {
            rhs.extend_from_slice(fiber.rhs()?);
        }
        Ok(rhs)
    }

    fn apply_preconditioner(&self, x: &[f64]) -> Result<Vec<f64>> {
        let offsets = self.solution_offsets();
        self.check_len("fiber solution", x, offsets[offsets.len() - 1])?;
        let blocks = self
            .fibers
            .par_iter()
            .enumerate()
            .map(|(i, fiber)| fiber.apply_preconditioner(&x[offsets[i]..offsets[i + 1]]))
            .collect::<Result<Vec<_>>>()?;
        Ok(blocks.concat())
    }

    fn matvec(&self, x: &[f64], v_on_nodes: &[f64]) -> Result<Vec<f64>> {
        let offsets = self.solution_offsets();
        let node_offsets = self.node_offsets();
        self.check_len("fiber solution", x, offsets[offsets.len() - 1])?;
        self.check_len("velocity on fibers", v_on_nodes, node_offsets[node_offsets.len() - 1])?;
        let blocks = self
            .fibers
            .par_iter()
            .enumerate()
            .map(|(i, fiber)| {
                fiber.matvec(
                    &x[offsets[i]..offsets[i + 1]],
                    &v_on_nodes[node_offsets[i]..node_offsets[i + 1]],
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(blocks.concat())
    }
}

#[cfg(test)]
mod test {
    extern crate blas_src;
    extern crate lapack_src;

    use super::FiberContainer;
    use crate::fiber::{Fiber, FiberStage};
    use crate::kernel::KernelProvider;
    use crate::params::{FiberOptions, KernelOptions};
    use crate::traits::LocalOperator;
    use crate::types::Error;
    use approx::assert_relative_eq;

    fn container() -> FiberContainer {
        let options = FiberOptions::default();
        let kernel_options = KernelOptions::default();
        let mut fibers = Vec::new();
        for k in 0..3 {
            let mut fiber = Fiber::new(8 + 2 * k, 1.0, 0.05, 1.0, &options, &kernel_options).unwrap();
            fiber.translate(&[0.0, k as f64, 0.0]);
            fibers.push(fiber);
        }
        FiberContainer::new(fibers)
    }

    #[test]
    fn test_sizes() {
        let fc = container();
        assert_eq!(fc.local_node_count(), 8 + 10 + 12);
        assert_eq!(fc.local_solution_size(), 4 * 30);
        assert_eq!(fc.node_positions().len(), 90);
    }

    #[test]
    fn test_rhs_requires_boundary_conditions() {
        let mut fc = container();
        assert!(matches!(
            fc.rhs(),
            Err(Error::StageOrder {
                operation: "rhs",
                required: FiberStage::BoundaryApplied,
                current: FiberStage::GeometrySet,
            })
        ));

        let zeros = vec![0.0; 90];
        fc.update_derivatives().unwrap();
        fc.update_stokeslets(1.0).unwrap();
        fc.form_linear_operators(0.01, 1.0).unwrap();
        fc.update_rhs(&zeros, &zeros).unwrap();
        assert_eq!(fc.rhs().unwrap().len(), 120);

        fc.fibers_mut()[1].translate(&[0.0, 0.0, 1.0]);
        assert!(matches!(fc.rhs(), Err(Error::StageOrder { .. })));
    }

    #[test]
    fn test_self_flow_matches_kernel_on_own_nodes() {
        let mut fc = container();
        fc.update_derivatives().unwrap();
        fc.update_stokeslets(1.0).unwrap();
        let kernel = KernelProvider::new(1.0, &KernelOptions::default());

        // Forces only on the first fiber: after removing the self part its own nodes
        // see no velocity.
        let mut forces = vec![0.0; 90];
        for v in forces[..24].iter_mut() {
            *v = 1.0;
        }
        let velocity = fc.flow(&kernel, &forces, &fc.node_positions()).unwrap();
        let self_flow = fc.self_flow(&forces).unwrap();
        assert_eq!(velocity.len(), 90);
        for (v, s) in velocity[..24].iter().zip(&self_flow[..24]) {
            assert_relative_eq!(*v, *s, epsilon = 1e-12);
        }
        assert!(self_flow[24..].iter().all(|v| *v == 0.0));
        assert!(velocity[24..].iter().any(|v| v.abs() > 1e-6));
    }

    #[test]
    fn test_point_forces_integrate_density() {
        let mut fc = container();
        fc.update_derivatives().unwrap();
        let density = vec![1.0; 90];
        let forces = fc.point_forces(&density).unwrap();
        let total: f64 = forces.iter().step_by(3).sum();
        assert_relative_eq!(total, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_force_follows_tangent() {
        let mut fc = container();
        fc.update_derivatives().unwrap();
        let force = fc.generate_constant_force(2.0);
        assert_eq!(force.len(), 90);
        for f in force.chunks_exact(3) {
            assert_relative_eq!(f[0], 2.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_block_preconditioner_roundtrip() {
        let mut fc = container();
        fc.update_derivatives().unwrap();
        fc.update_stokeslets(1.0).unwrap();
        fc.form_linear_operators(0.01, 1.0).unwrap();
        let zeros = vec![0.0; 90];
        let force = fc.generate_constant_force(1.0);
        fc.update_rhs(&zeros, &force).unwrap();

        let rhs = fc.rhs().unwrap();
        let x = fc.apply_preconditioner(&rhs).unwrap();
        let y = fc.matvec(&x, &zeros).unwrap();
        let scale = rhs.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        for (a, b) in rhs.iter().zip(y.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-6 * scale);
        }
    }
}
