//! The coupled fiber, body and periphery system seen by the outer Krylov solver.
//!
//! Global vectors are ordered as `[fibers | bodies | periphery]`. Within the fiber
//! block each fiber holds its `3n` positions followed by its `n` tensions, within the
//! body block each body holds its `3n` densities followed by its six rigid velocities.
use crate::body::BodyContainer;
use crate::distribution::{Communicator, SingleProcess};
use crate::fiber::FiberContainer;
use crate::geometry::cross;
use crate::kernel::KernelProvider;
use crate::linalg::axpy;
use crate::params::Parameters;
use crate::periphery::Periphery;
use crate::traits::{LocalOperator, StokesEvaluator};
use crate::types::{Error, Result};
use log::info;
use std::ops::Range;

/// Sizes of the three blocks of the local solution vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SolutionLayout {
    fibers: usize,
    bodies: usize,
    periphery: usize,
}

impl SolutionLayout {
    /// Create a layout from the block sizes.
    pub fn new(fibers: usize, bodies: usize, periphery: usize) -> Self {
        Self {
            fibers,
            bodies,
            periphery,
        }
    }

    /// Size of the fiber block.
    pub fn fibers(&self) -> usize {
        self.fibers
    }

    /// Size of the body block.
    pub fn bodies(&self) -> usize {
        self.bodies
    }

    /// Size of the periphery block.
    pub fn periphery(&self) -> usize {
        self.periphery
    }

    /// Total size.
    pub fn total(&self) -> usize {
        self.fibers + self.bodies + self.periphery
    }

    /// Split `x` into its fiber, body and periphery blocks.
    pub fn split<'a>(&self, x: &'a [f64]) -> Result<(&'a [f64], &'a [f64], &'a [f64])> {
        if x.len() != self.total() {
            return Err(Error::SizeMismatch {
                what: "solution vector",
                expected: self.total(),
                found: x.len(),
            });
        }
        let (fibers, rest) = x.split_at(self.fibers);
        let (bodies, periphery) = rest.split_at(self.bodies);
        Ok((fibers, bodies, periphery))
    }

    /// Join blocks into one vector.
    pub fn concatenate(&self, fibers: &[f64], bodies: &[f64], periphery: &[f64]) -> Result<Vec<f64>> {
        for (what, values, expected) in [
            ("fiber block", fibers, self.fibers),
            ("body block", bodies, self.bodies),
            ("periphery block", periphery, self.periphery),
        ] {
            if values.len() != expected {
                return Err(Error::SizeMismatch {
                    what,
                    expected,
                    found: values.len(),
                });
            }
        }
        Ok([fibers, bodies, periphery].concat())
    }
}

/// Background flow and forces of one timestep.
///
/// Empty vectors stand for zero.
#[derive(Debug, Clone, Default)]
pub struct ExternalForcing {
    /// Background velocity at the local fiber nodes.
    pub fiber_flow: Vec<f64>,
    /// External force density at the local fiber nodes.
    pub fiber_force: Vec<f64>,
    /// Background velocity at the local body nodes.
    pub body_flow: Vec<f64>,
    /// Background velocity at the local periphery nodes.
    pub periphery_flow: Vec<f64>,
}

fn or_zeros(values: &[f64], len: usize, what: &'static str) -> Result<Vec<f64>> {
    match values.len() {
        0 => Ok(vec![0.0; len]),
        n if n == len => Ok(values.to_vec()),
        n => Err(Error::SizeMismatch {
            what,
            expected: len,
            found: n,
        }),
    }
}

/// Coupling of fibers whose minus end is bound to a body nucleation site.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConditions {
    /// Force and torque about the centroid exerted by bound fibers on every body, 6 per body.
    pub force_torque_on_bodies: Vec<f64>,
    /// Minus end velocity terms of every local fiber, 7 per fiber, zero for unbound fibers.
    ///
    /// Site velocity, `Omega x x_s` and the tangential site velocity.
    pub velocities_on_fibers: Vec<f64>,
}

/// Targets of all processes, gathered in rank order.
struct GatheredTargets {
    points: Vec<f64>,
    local: Range<usize>,
}

/// The coupled system on one process.
#[derive(Debug)]
pub struct System<C: Communicator = SingleProcess> {
    params: Parameters,
    comm: C,
    kernel: KernelProvider,
    fibers: FiberContainer,
    bodies: BodyContainer,
    periphery: Periphery,
}

impl<C: Communicator> System<C> {
    /// Assemble a system from its parts.
    pub fn new(
        params: Parameters,
        comm: C,
        fibers: FiberContainer,
        bodies: BodyContainer,
        periphery: Periphery,
    ) -> Result<Self> {
        params.validate()?;
        let plan = periphery.plan();
        if plan.n_nodes_global() > 0
            && (plan.rank() != comm.rank() || plan.world_size() != comm.size())
        {
            return Err(Error::InvalidParameter(format!(
                "periphery planned for rank {} of {}, running as rank {} of {}",
                plan.rank(),
                plan.world_size(),
                comm.rank(),
                comm.size()
            )));
        }
        if bodies.is_owner() != (comm.rank() == 0) {
            return Err(Error::InvalidParameter(format!(
                "body container ownership does not match rank {}",
                comm.rank()
            )));
        }
        for fiber in fibers.fibers() {
            if let Some((body, site)) = fiber.binding_site() {
                bodies.nucleation_site(body, site)?;
            }
        }
        let kernel = KernelProvider::new(params.eta, &params.kernel);
        info!(
            "System on rank {}: {} fibers, {} bodies, {} periphery nodes",
            comm.rank(),
            fibers.len(),
            bodies.len(),
            periphery.n_nodes_global()
        );
        Ok(Self {
            params,
            comm,
            kernel,
            fibers,
            bodies,
            periphery,
        })
    }

    /// Parameters.
    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Communicator.
    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Kernel provider used for all cross-entity interactions.
    pub fn kernel(&self) -> &KernelProvider {
        &self.kernel
    }

    /// Fibers.
    pub fn fibers(&self) -> &FiberContainer {
        &self.fibers
    }

    /// Mutable access to the fibers.
    pub fn fibers_mut(&mut self) -> &mut FiberContainer {
        &mut self.fibers
    }

    /// Bodies.
    pub fn bodies(&self) -> &BodyContainer {
        &self.bodies
    }

    /// Mutable access to the bodies.
    pub fn bodies_mut(&mut self) -> &mut BodyContainer {
        &mut self.bodies
    }

    /// Periphery.
    pub fn periphery(&self) -> &Periphery {
        &self.periphery
    }

    /// Sizes of the local solution blocks.
    pub fn layout(&self) -> SolutionLayout {
        SolutionLayout::new(
            self.fibers.local_solution_size(),
            self.bodies.local_solution_size(),
            self.periphery.local_solution_size(),
        )
    }

    /// Number of unknowns on this process.
    pub fn local_solution_size(&self) -> usize {
        self.layout().total()
    }

    /// Number of nodes on this process.
    pub fn local_node_count(&self) -> usize {
        self.fibers.local_node_count()
            + self.bodies.local_node_count()
            + self.periphery.local_node_count()
    }

    /// Local nodes ordered as fibers, bodies, periphery.
    pub fn local_node_positions(&self) -> Vec<f64> {
        let mut points = self.fibers.node_positions();
        points.extend(self.bodies.local_node_positions());
        points.extend_from_slice(self.periphery.local_node_positions());
        points
    }

    /// Nodes of all processes in rank order.
    pub fn global_node_positions(&self) -> Result<Vec<f64>> {
        Ok(self.gather_targets(&self.local_node_positions())?.points)
    }

    fn gather_targets(&self, local: &[f64]) -> Result<GatheredTargets> {
        let mut counts = vec![0.0; self.comm.size()];
        counts[self.comm.rank()] = local.len() as f64;
        let counts: Vec<usize> = self
            .comm
            .all_reduce_sum(&counts)?
            .iter()
            .map(|c| *c as usize)
            .collect();
        let offset: usize = counts[..self.comm.rank()].iter().sum();
        let points = self.comm.all_gather_varcount(local, &counts)?;
        Ok(GatheredTargets {
            points,
            local: offset..offset + local.len(),
        })
    }

    /// The periphery density of all processes.
    fn gather_shell(&self, x_shell: &[f64]) -> Result<Vec<f64>> {
        if self.periphery.n_nodes_global() == 0 {
            return Ok(Vec::new());
        }
        self.comm
            .all_gather_varcount(x_shell, self.periphery.plan().nodes().counts())
    }

    /// Sum velocities computed from local sources at gathered targets and keep the local part.
    fn reduce_to_local(&self, velocity: &[f64], targets: &GatheredTargets) -> Result<Vec<f64>> {
        let summed = self.comm.all_reduce_sum(velocity)?;
        Ok(summed[targets.local.clone()].to_vec())
    }

    /// Recompute every per-entity operator after the geometry changed.
    pub fn update_operators(&mut self) -> Result<()> {
        let (eta, dt) = (self.params.eta, self.params.dt);
        self.fibers.update_derivatives()?;
        self.fibers.update_stokeslets(eta)?;
        self.fibers.form_linear_operators(dt, eta)?;
        self.bodies.update_cache_variables(eta, &self.params.kernel)
    }

    /// Build the right hand side of every entity.
    ///
    /// Requires [System::update_operators] since the last change of geometry. The velocities induced by external fiber forces and applied body forces and
    /// torques are added to the background flow. Fiber preconditioners are built here.
    pub fn update_rhs(&mut self, forcing: &ExternalForcing) -> Result<()> {
        let n_fib = 3 * self.fibers.local_node_count();
        let n_body = 3 * self.bodies.local_node_count();
        let n_shell = 3 * self.periphery.local_node_count();

        let fiber_force = or_zeros(&forcing.fiber_force, n_fib, "fiber external force")?;
        let mut v_fibers = or_zeros(&forcing.fiber_flow, n_fib, "fiber background flow")?;
        let mut v_bodies = or_zeros(&forcing.body_flow, n_body, "body background flow")?;
        let mut v_shell = or_zeros(&forcing.periphery_flow, n_shell, "periphery background flow")?;

        let targets = self.gather_targets(&self.local_node_positions())?;
        let point_forces = self.fibers.point_forces(&fiber_force)?;
        let force_torque = self.bodies.local_force_torque();
        let mut velocity = self
            .fibers
            .flow(&self.kernel, &point_forces, &targets.points)?;
        axpy(
            1.0,
            &self
                .bodies
                .force_torque_flow(&self.kernel, &targets.points, &force_torque)?,
            &mut velocity,
        );
        let mut induced = self.reduce_to_local(&velocity, &targets)?;
        let (v_fib_induced, rest) = induced.split_at_mut(n_fib);
        let (v_body_induced, v_shell_induced) = rest.split_at_mut(n_body);
        axpy(
            -1.0,
            &self.bodies.self_force_torque_flow(&self.kernel, &force_torque)?,
            v_body_induced,
        );

        // A fiber's own external force enters its right hand side through its mobility.
        axpy(-1.0, &self.fibers.self_flow(&point_forces)?, v_fib_induced);

        axpy(1.0, v_fib_induced, &mut v_fibers);
        axpy(1.0, v_body_induced, &mut v_bodies);
        axpy(1.0, v_shell_induced, &mut v_shell);

        self.fibers.update_rhs(&v_fibers, &fiber_force)?;
        self.bodies.update_rhs(&v_bodies)?;
        self.periphery.update_rhs(&v_shell)?;
        self.kernel.clear();
        Ok(())
    }

    /// Right hand side of the local unknowns.
    pub fn rhs(&self) -> Result<Vec<f64>> {
        self.layout().concatenate(
            &self.fibers.rhs()?,
            &self.bodies.rhs()?,
            &self.periphery.rhs()?,
        )
    }

    /// Apply the block diagonal preconditioner.
    pub fn apply_preconditioner(&self, x: &[f64]) -> Result<Vec<f64>> {
        let layout = self.layout();
        let (x_fibers, x_bodies, x_shell) = layout.split(x)?;
        let shell_global = self.gather_shell(x_shell)?;
        layout.concatenate(
            &self.fibers.apply_preconditioner(x_fibers)?,
            &self.bodies.apply_preconditioner(x_bodies)?,
            &self.periphery.apply_preconditioner(&shell_global)?,
        )
    }

    /// Apply the coupled forward operator.
    ///
    /// Every entity's sources are evaluated at the nodes of every process. Parts
    /// already described by a local operator are removed: the self interaction of
    /// fibers and bodies, and the periphery acting on itself.
    pub fn matvec(&self, x: &[f64]) -> Result<Vec<f64>> {
        let layout = self.layout();
        let (x_fibers, x_bodies, x_shell) = layout.split(x)?;
        let n_fib = 3 * self.fibers.local_node_count();

        let point_forces = self.fibers.apply_fiber_force(x_fibers)?;
        let (densities, _) = self.bodies.unpack_solution_vector(x_bodies)?;
        let shell_global = self.gather_shell(x_shell)?;

        let mut local_targets = self.fibers.node_positions();
        local_targets.extend(self.bodies.local_node_positions());
        let coupled = self.gather_targets(&local_targets)?;
        let shell = self.gather_targets(self.periphery.local_node_positions())?;
        let mut all_targets = coupled.points.clone();
        all_targets.extend_from_slice(&shell.points);
        let split = coupled.points.len();

        let mut velocity = self.fibers.flow(&self.kernel, &point_forces, &all_targets)?;
        axpy(
            1.0,
            &self.bodies.flow(&self.kernel, &all_targets, &densities, None)?,
            &mut velocity,
        );
        axpy(
            1.0,
            &self
                .periphery
                .flow(&self.kernel, &coupled.points, x_shell)?,
            &mut velocity[..split],
        );

        let mut v_coupled = self.reduce_to_local(&velocity[..split], &coupled)?;
        let v_shell = self.reduce_to_local(&velocity[split..], &shell)?;
        let (v_fibers, v_bodies) = v_coupled.split_at_mut(n_fib);
        axpy(-1.0, &self.fibers.self_flow(&point_forces)?, v_fibers);
        axpy(-1.0, &self.bodies.self_flow(&densities)?, v_bodies);

        let link = self
            .body_fiber_link_conditions(x_fibers, &self.global_body_velocities(x_bodies)?)?;
        let mut y_fibers = self.fibers.matvec(x_fibers, v_fibers)?;
        self.fibers
            .apply_link_velocities(&link.velocities_on_fibers, &mut y_fibers)?;
        let mut y_bodies = self.bodies.matvec(x_bodies, v_bodies)?;
        self.bodies
            .apply_link_force_torque(&link.force_torque_on_bodies, &mut y_bodies)?;

        let result = layout.concatenate(
            &y_fibers,
            &y_bodies,
            &self.periphery.matvec(&shell_global, &v_shell)?,
        );
        self.kernel.clear();
        result
    }

    /// Rigid velocities of all bodies, 6 per body, from the local body block of a solution.
    pub fn global_body_velocities(&self, x_bodies: &[f64]) -> Result<Vec<f64>> {
        let (_, local) = self.bodies.unpack_solution_vector(x_bodies)?;
        let mut velocities = vec![0.0; 6 * self.bodies.len()];
        if self.bodies.is_owner() {
            velocities.copy_from_slice(&local);
        }
        self.comm.all_reduce_sum(&velocities)
    }

    /// Coupling between bound fibers and their bodies.
    ///
    /// `x_fibers` is the local fiber block of a solution and `body_velocities` holds the
    /// rigid velocities of all bodies. The minus end of a bound fiber moves with its
    /// nucleation site, the fiber's end force and torque act on the body. Forces and
    /// torques are summed over all processes.
    pub fn body_fiber_link_conditions(
        &self,
        x_fibers: &[f64],
        body_velocities: &[f64],
    ) -> Result<LinkConditions> {
        let n_bodies = self.bodies.len();
        for (what, values, expected) in [
            ("fiber solution", x_fibers, self.fibers.local_solution_size()),
            ("body velocities", body_velocities, 6 * n_bodies),
        ] {
            if values.len() != expected {
                return Err(Error::SizeMismatch {
                    what,
                    expected,
                    found: values.len(),
                });
            }
        }

        let mut force_torque = vec![0.0; 6 * n_bodies];
        let mut velocities = vec![0.0; 7 * self.fibers.len()];
        let mut offset = 0;
        for (i, fiber) in self.fibers.fibers().iter().enumerate() {
            let x = &x_fibers[offset..offset + fiber.solution_size()];
            offset += fiber.solution_size();
            let Some((i_body, i_site)) = fiber.binding_site() else {
                continue;
            };
            let site = self.bodies.nucleation_site(i_body, i_site)?;
            let center = self.bodies.bodies()[i_body].position();
            let arm = [site[0] - center[0], site[1] - center[1], site[2] - center[2]];

            let end = fiber.minus_end_force_torque(x)?;
            let moment = cross(&arm, &end[..3]);
            let on_body = &mut force_torque[6 * i_body..6 * i_body + 6];
            for c in 0..3 {
                on_body[c] += end[c];
                on_body[3 + c] += end[3 + c] + moment[c];
            }

            let rigid = &body_velocities[6 * i_body..6 * i_body + 6];
            let omega = [rigid[3], rigid[4], rigid[5]];
            let spin = cross(&omega, &arm);
            let velocity = [rigid[0] + spin[0], rigid[1] + spin[1], rigid[2] + spin[2]];
            velocities[7 * i..7 * i + 7]
                .copy_from_slice(&fiber.minus_end_link_velocity(&velocity, &omega));
        }

        Ok(LinkConditions {
            force_torque_on_bodies: self.comm.all_reduce_sum(&force_torque)?,
            velocities_on_fibers: velocities,
        })
    }
}

#[cfg(test)]
mod test {
    use super::SolutionLayout;
    use crate::types::Error;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_split_concatenate_roundtrip() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            let layout = SolutionLayout::new(
                rng.gen_range(0..50),
                rng.gen_range(0..50),
                rng.gen_range(0..50),
            );
            let x: Vec<f64> = (0..layout.total()).map(|_| rng.gen()).collect();
            let (f, b, p) = layout.split(&x).unwrap();
            assert_eq!(layout.concatenate(f, b, p).unwrap(), x);
        }
    }

    #[test]
    fn test_wrong_sizes() {
        let layout = SolutionLayout::new(2, 3, 4);
        assert!(matches!(
            layout.split(&[0.0; 8]),
            Err(Error::SizeMismatch { expected: 9, .. })
        ));
        assert!(layout.concatenate(&[0.0; 2], &[0.0; 4], &[0.0; 3]).is_err());
    }
}
