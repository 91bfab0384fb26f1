//! Collections of rigid bodies.
use crate::body::Body;
use crate::kernel::{oseen_tensor_contract_direct, rotlet, KernelProvider};
use crate::params::KernelOptions;
use crate::traits::LocalOperator;
use crate::types::{Error, Result};
use rayon::prelude::*;

/// All bodies of the simulation.
///
/// Every rank holds the full set of bodies for geometric queries, but only rank 0
/// owns their unknowns.
#[derive(Debug)]
pub struct BodyContainer {
    bodies: Vec<Body>,
    owner: bool,
}

impl BodyContainer {
    /// Create a container on process `rank`.
    pub fn new(bodies: Vec<Body>, rank: usize) -> Self {
        let mut container = Self {
            bodies: Vec::with_capacity(bodies.len()),
            owner: rank == 0,
        };
        for body in bodies {
            container.push(body);
        }
        container
    }

    /// Add a body.
    pub fn push(&mut self, mut body: Body) {
        body.set_index(self.bodies.len());
        self.bodies.push(body);
    }

    /// The bodies.
    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    /// Mutable access to the bodies.
    pub fn bodies_mut(&mut self) -> &mut [Body] {
        &mut self.bodies
    }

    /// Number of bodies.
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// Whether there are no bodies.
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Whether this process owns the body unknowns.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    fn local_bodies(&self) -> &[Body] {
        if self.owner {
            &self.bodies
        } else {
            &[]
        }
    }

    /// Total number of nucleation sites over all bodies.
    pub fn global_site_count(&self) -> usize {
        self.bodies.iter().map(|b| b.n_nucleation_sites()).sum()
    }

    /// Lab frame position of nucleation site `site` of body `body`.
    pub fn nucleation_site(&self, body: usize, site: usize) -> Result<[f64; 3]> {
        self.bodies
            .get(body)
            .ok_or(Error::IndexOutOfRange {
                what: "body",
                index: body,
                len: self.bodies.len(),
            })?
            .nucleation_site(site)
    }

    /// Total number of body nodes, on any process.
    pub fn global_node_count(&self) -> usize {
        self.bodies.iter().map(|b| b.n_nodes()).sum()
    }

    /// Node positions of the bodies owned by this process.
    pub fn local_node_positions(&self) -> Vec<f64> {
        self.local_bodies()
            .iter()
            .flat_map(|b| b.node_positions().iter().copied())
            .collect()
    }

    /// Node positions of all bodies.
    pub fn global_node_positions(&self) -> Vec<f64> {
        self.bodies
            .iter()
            .flat_map(|b| b.node_positions().iter().copied())
            .collect()
    }

    /// Node normals of the bodies owned by this process.
    pub fn local_node_normals(&self) -> Vec<f64> {
        self.local_bodies()
            .iter()
            .flat_map(|b| b.node_normals().iter().copied())
            .collect()
    }

    /// Centroids of the bodies owned by this process.
    pub fn local_center_positions(&self) -> Vec<f64> {
        self.local_bodies()
            .iter()
            .flat_map(|b| b.position().iter().copied())
            .collect()
    }

    /// Centroids of all bodies.
    pub fn global_center_positions(&self) -> Vec<f64> {
        self.bodies
            .iter()
            .flat_map(|b| b.position().iter().copied())
            .collect()
    }

    /// Applied forces and torques of the bodies owned by this process, 6 per body.
    pub fn local_force_torque(&self) -> Vec<f64> {
        self.local_bodies()
            .iter()
            .flat_map(|b| b.force_torque())
            .collect()
    }

    fn solution_offsets(&self) -> Vec<usize> {
        let mut offsets = vec![0];
        for body in self.local_bodies() {
            offsets.push(offsets[offsets.len() - 1] + body.solution_size());
        }
        offsets
    }

    fn node_offsets(&self) -> Vec<usize> {
        let mut offsets = vec![0];
        for body in self.local_bodies() {
            offsets.push(offsets[offsets.len() - 1] + 3 * body.n_nodes());
        }
        offsets
    }

    fn check_len(what: &'static str, values: &[f64], expected: usize) -> Result<()> {
        if values.len() != expected {
            return Err(Error::SizeMismatch {
                what,
                expected,
                found: values.len(),
            });
        }
        Ok(())
    }

    /// Refresh the cached operators of every body.
    pub fn update_cache_variables(&mut self, eta: f64, options: &KernelOptions) -> Result<()> {
        self.bodies
            .par_iter_mut()
            .try_for_each(|body| body.update_cache_variables(eta, options))
    }

    /// Set the right hand side from the velocity at the local body nodes.
    pub fn update_rhs(&mut self, v_on_bodies: &[f64]) -> Result<()> {
        let offsets = self.node_offsets();
        Self::check_len("velocity on bodies", v_on_bodies, offsets[offsets.len() - 1])?;
        if !self.owner {
            return Ok(());
        }
        for (i, body) in self.bodies.iter_mut().enumerate() {
            body.update_rhs(&v_on_bodies[offsets[i]..offsets[i + 1]])?;
        }
        Ok(())
    }

    /// Subtract forces and torques exerted by bound fibers, 6 per body, from the rigid
    /// rows of the local body block `y`.
    pub fn apply_link_force_torque(&self, force_torque: &[f64], y: &mut [f64]) -> Result<()> {
        let offsets = self.solution_offsets();
        Self::check_len("body link force and torque", force_torque, 6 * self.bodies.len())?;
        Self::check_len("body block", y, offsets[offsets.len() - 1])?;
        for (i, (body, ft)) in self
            .local_bodies()
            .iter()
            .zip(force_torque.chunks_exact(6))
            .enumerate()
        {
            let rigid = offsets[i] + 3 * body.n_nodes();
            for (value, link) in y[rigid..rigid + 6].iter_mut().zip(ft) {
                *value -= link;
            }
        }
        Ok(())
    }

    /// Split the local body slice of a solution into densities and rigid velocities.
    pub fn unpack_solution_vector(&self, x: &[f64]) -> Result<(Vec<f64>, Vec<f64>)> {
        let offsets = self.solution_offsets();
        Self::check_len("body solution", x, offsets[offsets.len() - 1])?;
        let mut densities = Vec::with_capacity(3 * self.local_node_count());
        let mut velocities = Vec::with_capacity(6 * self.local_bodies().len());
        for (i, body) in self.local_bodies().iter().enumerate() {
            let block = &x[offsets[i]..offsets[i + 1]];
            let n = 3 * body.n_nodes();
            densities.extend_from_slice(&block[..n]);
            velocities.extend_from_slice(&block[n..]);
        }
        Ok((densities, velocities))
    }

    /// Velocity at `r_trg` induced by the local body densities.
    ///
    /// If `force_torque` is given (6 values per local body) the stokeslet and rotlet of
    /// each body's force and torque at its centroid are added.
    pub fn flow(
        &self,
        kernel: &KernelProvider,
        r_trg: &[f64],
        densities: &[f64],
        force_torque: Option<&[f64]>,
    ) -> Result<Vec<f64>> {
        Self::check_len("body densities", densities, 3 * self.local_node_count())?;
        let mut velocity = kernel.stresslet_velocity(
            &self.local_node_positions(),
            &self.local_node_normals(),
            densities,
            r_trg,
        );

        if let Some(force_torque) = force_torque {
            let extra = self.force_torque_flow(kernel, r_trg, force_torque)?;
            for (v, e) in velocity.iter_mut().zip(extra) {
                *v += e;
            }
        }
        Ok(velocity)
    }

    /// Stokeslet and rotlet at `r_trg` of forces and torques applied at the local centroids.
    pub fn force_torque_flow(
        &self,
        kernel: &KernelProvider,
        r_trg: &[f64],
        force_torque: &[f64],
    ) -> Result<Vec<f64>> {
        Self::check_len(
            "body force and torque",
            force_torque,
            6 * self.local_bodies().len(),
        )?;
        let centers = self.local_center_positions();
        let (forces, torques): (Vec<_>, Vec<_>) = force_torque
            .chunks_exact(6)
            .map(|ft| ([ft[0], ft[1], ft[2]], [ft[3], ft[4], ft[5]]))
            .unzip();
        let mut velocity = kernel.stokeslet_velocity(&centers, &forces.concat(), r_trg);
        let rotation = rotlet(
            &centers,
            r_trg,
            &torques.concat(),
            kernel.eta(),
            kernel.options(),
        );
        for (v, r) in velocity.iter_mut().zip(rotation) {
            *v += r;
        }
        Ok(velocity)
    }

    /// Part of [BodyContainer::force_torque_flow] at each body's own nodes due to its own
    /// force and torque.
    pub fn self_force_torque_flow(
        &self,
        kernel: &KernelProvider,
        force_torque: &[f64],
    ) -> Result<Vec<f64>> {
        Self::check_len(
            "body force and torque",
            force_torque,
            6 * self.local_bodies().len(),
        )?;
        let mut velocity = Vec::with_capacity(3 * self.local_node_count());
        for (body, ft) in self.local_bodies().iter().zip(force_torque.chunks_exact(6)) {
            let mut v = oseen_tensor_contract_direct(
                body.position(),
                body.node_positions(),
                &ft[..3],
                kernel.eta(),
                kernel.options(),
            );
            let rotation = rotlet(
                body.position(),
                body.node_positions(),
                &ft[3..],
                kernel.eta(),
                kernel.options(),
            );
            for (a, r) in v.iter_mut().zip(rotation) {
                *a += r;
            }
            velocity.extend(v);
        }
        Ok(velocity)
    }

    /// Velocity at each local body's nodes due to its own density.
    pub fn self_flow(&self, densities: &[f64]) -> Result<Vec<f64>> {
        let offsets = self.node_offsets();
        Self::check_len("body densities", densities, offsets[offsets.len() - 1])?;
        let blocks = self
            .local_bodies()
            .par_iter()
            .enumerate()
            .map(|(i, body)| body.self_flow(&densities[offsets[i]..offsets[i + 1]]))
            .collect::<Result<Vec<_>>>()?;
        Ok(blocks.concat())
    }
}

impl LocalOperator for BodyContainer {
    fn local_solution_size(&self) -> usize {
        self.local_bodies().iter().map(|b| b.solution_size()).sum()
    }

    fn local_node_count(&self) -> usize {
        self.local_bodies().iter().map(|b| b.n_nodes()).sum()
    }

    fn rhs(&self) -> Result<Vec<f64>> {
        Ok(self
            .local_bodies()
            .iter()
            .flat_map(|b| b.rhs().iter().copied())
            .collect())
    }

    fn apply_preconditioner(&self, x: &[f64]) -> Result<Vec<f64>> {
        let offsets = self.solution_offsets();
        Self::check_len("body solution", x, offsets[offsets.len() - 1])?;
        let blocks = self
            .local_bodies()
            .par_iter()
            .enumerate()
            .map(|(i, body)| body.apply_preconditioner(&x[offsets[i]..offsets[i + 1]]))
            .collect::<Result<Vec<_>>>()?;
        Ok(blocks.concat())
    }

    fn matvec(&self, x: &[f64], v_on_nodes: &[f64]) -> Result<Vec<f64>> {
        let offsets = self.solution_offsets();
        let node_offsets = self.node_offsets();
        Self::check_len("body solution", x, offsets[offsets.len() - 1])?;
        Self::check_len(
            "velocity on bodies",
            v_on_nodes,
            node_offsets[node_offsets.len() - 1],
        )?;
        let blocks = self
            .local_bodies()
            .par_iter()
            .enumerate()
            .map(|(i, body)| {
                body.matvec(
                    &x[offsets[i]..offsets[i + 1]],
                    &v_on_nodes[node_offsets[i]..node_offsets[i + 1]],
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(blocks.concat())
    }
}
