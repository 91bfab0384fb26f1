//! Slender elastic fibers.
//!
//! A fiber carries `n` collocation nodes along its arclength. Its unknowns are the
//! node positions at the next timestep, interleaved, followed by the `n` node
//! tensions. The position equations are implicit Euler steps of local slender body
//! theory, the tension equations enforce inextensibility with a penalty. The square
//! system is obtained by downsampling the collocation equations and appending the
//! boundary conditions of both ends.
pub mod container;
pub mod matrices;

pub use container::FiberContainer;
pub use matrices::FiberMatrices;

use crate::geometry::{cross, dot};
use crate::kernel::oseen_tensor_direct;
use crate::linalg::{duplicate, entry, invert, matvec, matvec_add, zeros, Matrix};
use crate::params::{FiberOptions, KernelOptions};
use crate::types::{Error, FiberEnd, Result};
use log::{debug, warn};
use num::traits::FloatConst;
use rlst::{RawAccess, RawAccessMut};
use std::sync::Arc;

/// Fibers with fewer nodes than this are accepted but poorly resolved.
const FEW_NODES: usize = 8;

/// Progress of a fiber through one timestep. Later stages imply earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FiberStage {
    /// Node positions are set.
    GeometrySet,
    /// Arclength derivatives match the node positions.
    DerivativesUpdated,
    /// Self interaction Oseen tensor is up to date.
    StokesletUpdated,
    /// Collocation operator and force operator are formed.
    OperatorFormed,
    /// Collocation right hand side is computed.
    RhsComputed,
    /// Boundary conditions are applied to the operator and right hand side.
    BoundaryApplied,
    /// Inverse of the square operator is available.
    PreconditionerBuilt,
}

/// Boundary condition at a fiber end with its prescribed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundaryCondition {
    /// Force applied at the end.
    Force([f64; 3]),
    /// Torque applied at the end.
    Torque([f64; 3]),
    /// Velocity of the end.
    Velocity([f64; 3]),
    /// Angular velocity of the end tangent.
    AngularVelocity([f64; 3]),
    /// Position of the end.
    Position([f64; 3]),
    /// Tangent direction at the end.
    Angle([f64; 3]),
}

impl BoundaryCondition {
    fn name(&self) -> &'static str {
        match self {
            BoundaryCondition::Force(_) => "Force",
            BoundaryCondition::Torque(_) => "Torque",
            BoundaryCondition::Velocity(_) => "Velocity",
            BoundaryCondition::AngularVelocity(_) => "AngularVelocity",
            BoundaryCondition::Position(_) => "Position",
            BoundaryCondition::Angle(_) => "Angle",
        }
    }
}

/// Condition on the translation of a fiber end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TranslationalCondition {
    /// Force applied at the end.
    Force([f64; 3]),
    /// Velocity of the end.
    Velocity([f64; 3]),
    /// Position of the end.
    Position([f64; 3]),
}

impl TranslationalCondition {
    /// Whether the end moves with a prescribed velocity.
    pub fn is_kinematic(&self) -> bool {
        !matches!(self, TranslationalCondition::Force(_))
    }
}

impl TryFrom<BoundaryCondition> for TranslationalCondition {
    type Error = BoundaryCondition;

    fn try_from(condition: BoundaryCondition) -> std::result::Result<Self, Self::Error> {
        match condition {
            BoundaryCondition::Force(v) => Ok(TranslationalCondition::Force(v)),
            BoundaryCondition::Velocity(v) => Ok(TranslationalCondition::Velocity(v)),
            BoundaryCondition::Position(v) => Ok(TranslationalCondition::Position(v)),
            other => Err(other),
        }
    }
}

/// Condition on the rotation of the tangent at a fiber end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RotationalCondition {
    /// Torque applied at the end.
    Torque([f64; 3]),
    /// Angular velocity of the end tangent.
    AngularVelocity([f64; 3]),
    /// Tangent direction at the end.
    Angle([f64; 3]),
}

impl TryFrom<BoundaryCondition> for RotationalCondition {
    type Error = BoundaryCondition;

    fn try_from(condition: BoundaryCondition) -> std::result::Result<Self, Self::Error> {
        match condition {
            BoundaryCondition::Torque(v) => Ok(RotationalCondition::Torque(v)),
            BoundaryCondition::AngularVelocity(v) => Ok(RotationalCondition::AngularVelocity(v)),
            BoundaryCondition::Angle(v) => Ok(RotationalCondition::Angle(v)),
            other => Err(other),
        }
    }
}

/// The pair of boundary conditions at one fiber end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndConditions {
    translational: TranslationalCondition,
    rotational: RotationalCondition,
}

impl EndConditions {
    /// Pair two conditions, failing unless the first constrains translation and the
    /// second rotation.
    pub fn new(
        end: FiberEnd,
        translational: BoundaryCondition,
        rotational: BoundaryCondition,
    ) -> Result<Self> {
        let incompatible = || Error::IncompatibleBoundaryConditions {
            end,
            first: translational.name(),
            second: rotational.name(),
        };
        Ok(Self::from_parts(
            translational.try_into().map_err(|_| incompatible())?,
            rotational.try_into().map_err(|_| incompatible())?,
        ))
    }

    /// Pair a translational and a rotational condition.
    pub fn from_parts(translational: TranslationalCondition, rotational: RotationalCondition) -> Self {
        Self {
            translational,
            rotational,
        }
    }

    /// Clamped end at rest.
    pub fn clamped() -> Self {
        Self::from_parts(
            TranslationalCondition::Velocity([0.0; 3]),
            RotationalCondition::AngularVelocity([0.0; 3]),
        )
    }

    /// Force and torque free end.
    pub fn free() -> Self {
        Self::from_parts(
            TranslationalCondition::Force([0.0; 3]),
            RotationalCondition::Torque([0.0; 3]),
        )
    }

    /// Translational condition.
    pub fn translational(&self) -> &TranslationalCondition {
        &self.translational
    }

    /// Rotational condition.
    pub fn rotational(&self) -> &RotationalCondition {
        &self.rotational
    }
}

/// An elastic fiber.
pub struct Fiber {
    n_nodes: usize,
    length: f64,
    bending_rigidity: f64,
    stall_force: f64,
    options: FiberOptions,
    kernel_options: KernelOptions,
    c_0: f64,
    c_1: f64,
    dt: f64,
    bc_minus: EndConditions,
    bc_plus: EndConditions,
    binding_site: Option<(usize, usize)>,
    matrices: Arc<FiberMatrices>,
    x: Vec<f64>,
    xs: Vec<f64>,
    xss: Vec<f64>,
    xsss: Vec<f64>,
    xssss: Vec<f64>,
    stokeslet: Matrix,
    a: Matrix,
    force_operator: Matrix,
    rhs: Vec<f64>,
    flow_and_forcing: Vec<f64>,
    a_bc: Matrix,
    rhs_bc: Vec<f64>,
    a_inv: Matrix,
    stage: FiberStage,
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Fiber with {} nodes, length {} at stage {:?}",
            self.n_nodes, self.length, self.stage
        )
    }
}

fn slender_body_constants(slenderness: f64, eta: f64) -> (f64, f64) {
    let c_0 = -(f64::E() * slenderness * slenderness).ln() / (8.0 * f64::PI() * eta);
    let c_1 = 2.0 / (8.0 * f64::PI() * eta);
    (c_0, c_1)
}

impl Fiber {
    /// Straight fiber along the x axis starting at the origin.
    ///
    /// The minus end is clamped and the plus end is free.
    pub fn new(
        n_nodes: usize,
        length: f64,
        bending_rigidity: f64,
        eta: f64,
        options: &FiberOptions,
        kernel_options: &KernelOptions,
    ) -> Result<Self> {
        let matrices = matrices::matrices(n_nodes)?;
        if !(length > 0.0) || !(bending_rigidity >= 0.0) {
            return Err(Error::InvalidParameter(format!(
                "fiber length ({length}) must be positive and bending rigidity ({bending_rigidity}) non-negative"
            )));
        }
        if n_nodes < FEW_NODES {
            warn!("Fiber with only {n_nodes} nodes is poorly resolved.");
        }

        let mut x = vec![0.0; 3 * n_nodes];
        for (i, alpha) in matrices.alpha.iter().enumerate() {
            x[3 * i] = 0.5 * length * (alpha + 1.0);
        }
        let (c_0, c_1) = slender_body_constants(options.slenderness(), eta);

        Ok(Self {
            n_nodes,
            length,
            bending_rigidity,
            stall_force: 0.0,
            options: options.clone(),
            kernel_options: kernel_options.clone(),
            c_0,
            c_1,
            dt: 0.0,
            bc_minus: EndConditions::clamped(),
            bc_plus: EndConditions::free(),
            binding_site: None,
            matrices,
            x,
            xs: vec![0.0; 3 * n_nodes],
            xss: vec![0.0; 3 * n_nodes],
            xsss: vec![0.0; 3 * n_nodes],
            xssss: vec![0.0; 3 * n_nodes],
            stokeslet: zeros(0, 0),
            a: zeros(0, 0),
            force_operator: zeros(0, 0),
            rhs: Vec::new(),
            flow_and_forcing: Vec::new(),
            a_bc: zeros(0, 0),
            rhs_bc: Vec::new(),
            a_inv: zeros(0, 0),
            stage: FiberStage::GeometrySet,
        })
    }

    /// Number of nodes.
    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    /// Number of unknowns, positions and tensions.
    pub fn solution_size(&self) -> usize {
        4 * self.n_nodes
    }

    /// Arclength.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Bending rigidity.
    pub fn bending_rigidity(&self) -> f64 {
        self.bending_rigidity
    }

    /// Stall force of a motor attached to the plus end.
    pub fn stall_force(&self) -> f64 {
        self.stall_force
    }

    /// Set the stall force.
    pub fn set_stall_force(&mut self, stall_force: f64) -> &mut Self {
        self.stall_force = stall_force;
        self
    }

    /// Current stage.
    pub fn stage(&self) -> FiberStage {
        self.stage
    }

    /// Node positions, interleaved.
    pub fn positions(&self) -> &[f64] {
        &self.x
    }

    /// First arclength derivative at the nodes.
    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    /// Second arclength derivative at the nodes.
    pub fn xss(&self) -> &[f64] {
        &self.xss
    }

    /// Third arclength derivative at the nodes.
    pub fn xsss(&self) -> &[f64] {
        &self.xsss
    }

    /// Fourth arclength derivative at the nodes.
    pub fn xssss(&self) -> &[f64] {
        &self.xssss
    }

    /// Boundary conditions at one end.
    pub fn end_conditions(&self, end: FiberEnd) -> &EndConditions {
        match end {
            FiberEnd::Minus => &self.bc_minus,
            FiberEnd::Plus => &self.bc_plus,
        }
    }

    /// Set the boundary conditions at one end. Invalidates the formed operator.
    pub fn set_end_conditions(&mut self, end: FiberEnd, conditions: EndConditions) {
        match end {
            FiberEnd::Minus => self.bc_minus = conditions,
            FiberEnd::Plus => self.bc_plus = conditions,
        }
        self.stage = self.stage.min(FiberStage::RhsComputed);
    }

    /// Body and nucleation site the minus end is bound to.
    pub fn binding_site(&self) -> Option<(usize, usize)> {
        self.binding_site
    }

    /// Bind the minus end to nucleation site `site` of body `body`.
    ///
    /// The minus end becomes clamped to the site and moves with the body. Invalidates the
    /// formed operator.
    pub fn bind_to_body(&mut self, body: usize, site: usize) {
        self.binding_site = Some((body, site));
        self.set_end_conditions(FiberEnd::Minus, EndConditions::clamped());
    }

    /// Release the minus end from its body.
    pub fn unbind(&mut self) {
        self.binding_site = None;
    }

    /// Quadrature weights along the arclength.
    pub fn quadrature_weights(&self) -> Vec<f64> {
        self.matrices
            .weights_0
            .iter()
            .map(|w| 0.5 * self.length * w)
            .collect()
    }

    /// Self interaction Oseen tensor.
    pub fn stokeslet(&self) -> Result<&Matrix> {
        self.require("stokeslet", FiberStage::StokesletUpdated)?;
        Ok(&self.stokeslet)
    }

    /// Right hand side with boundary conditions applied.
    pub fn rhs(&self) -> Result<&[f64]> {
        self.require("rhs", FiberStage::BoundaryApplied)?;
        Ok(&self.rhs_bc)
    }

    /// Shift the fiber by `r`.
    pub fn translate(&mut self, r: &[f64; 3]) {
        for p in self.x.chunks_exact_mut(3) {
            p[0] += r[0];
            p[1] += r[1];
            p[2] += r[2];
        }
        self.stage = FiberStage::GeometrySet;
    }

    /// Replace the node positions.
    pub fn set_positions(&mut self, x: &[f64]) -> Result<()> {
        if x.len() != 3 * self.n_nodes {
            return Err(Error::SizeMismatch {
                what: "fiber positions",
                expected: 3 * self.n_nodes,
                found: x.len(),
            });
        }
        self.x.copy_from_slice(x);
        self.stage = FiberStage::GeometrySet;
        Ok(())
    }

    fn require(&self, operation: &'static str, required: FiberStage) -> Result<()> {
        if self.stage < required {
            Err(Error::StageOrder {
                operation,
                required,
                current: self.stage,
            })
        } else {
            Ok(())
        }
    }

    /// Entry `(i, j)` of the arclength derivative matrix of the given order.
    #[inline]
    fn d(&self, order: usize, i: usize, j: usize) -> f64 {
        entry(&self.matrices.d[order - 1], i, j) * (2.0 / self.length).powi(order as i32)
    }

    /// Arclength derivative of an interleaved node field.
    fn differentiate(&self, order: usize, values: &[f64]) -> Vec<f64> {
        let n = self.n_nodes;
        let mut result = vec![0.0; 3 * n];
        for i in 0..n {
            for j in 0..n {
                let dij = self.d(order, i, j);
                for c in 0..3 {
                    result[3 * i + c] += dij * values[3 * j + c];
                }
            }
        }
        result
    }

    /// Local slender body mobility at node `i` applied to `v`.
    fn mobility(&self, i: usize, v: &[f64]) -> [f64; 3] {
        let t = &self.xs[3 * i..3 * i + 3];
        let tv = dot(t, v);
        let mut result = [0.0; 3];
        for c in 0..3 {
            result[c] = (self.c_0 + self.c_1) * v[c] + (self.c_0 - self.c_1) * t[c] * tv;
        }
        result
    }

    /// Recompute the arclength derivatives from the node positions.
    pub fn update_derivatives(&mut self) -> Result<()> {
        self.require("update_derivatives", FiberStage::GeometrySet)?;
        self.xs = self.differentiate(1, &self.x);
        self.xss = self.differentiate(2, &self.x);
        self.xsss = self.differentiate(3, &self.x);
        self.xssss = self.differentiate(4, &self.x);
        self.stage = FiberStage::DerivativesUpdated;
        Ok(())
    }

    /// Recompute the self interaction Oseen tensor.
    pub fn update_stokeslet(&mut self, eta: f64) -> Result<()> {
        self.require("update_stokeslet", FiberStage::DerivativesUpdated)?;
        self.stokeslet = oseen_tensor_direct(&self.x, &self.x, eta, &self.kernel_options);
        self.stage = FiberStage::StokesletUpdated;
        Ok(())
    }

    /// Form the collocation operator and the force operator for timestep `dt`.
    pub fn form_linear_operator(&mut self, dt: f64, eta: f64) -> Result<()> {
        self.require("form_linear_operator", FiberStage::StokesletUpdated)?;
        if !(dt > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "timestep must be positive, got {dt}"
            )));
        }
        let (c_0, c_1) = slender_body_constants(self.options.slenderness(), eta);
        self.c_0 = c_0;
        self.c_1 = c_1;
        self.dt = dt;

        let n = self.n_nodes;
        let size = 4 * n;
        let e = self.bending_rigidity;
        let beta = self.options.beta_tstep();
        let penalty = self.options.penalty_param();

        let mut a = zeros(size, size);
        let mut force_operator = zeros(3 * n, size);
        {
            let data = a.data_mut();
            let idx = |r: usize, c: usize| r + c * size;
            for i in 0..n {
                let xs_i = &self.xs[3 * i..3 * i + 3];
                let xss_i = &self.xss[3 * i..3 * i + 3];
                let xsss_i = &self.xsss[3 * i..3 * i + 3];
                let m_xs = self.mobility(i, xs_i);
                let m_xss = self.mobility(i, xss_i);
                let mut m_cols = [[0.0; 3]; 3];
                for (d, col) in m_cols.iter_mut().enumerate() {
                    let mut unit = [0.0; 3];
                    unit[d] = 1.0;
                    *col = self.mobility(i, &unit);
                }
                let xss_norm2 = dot(xss_i, xss_i);

                for j in 0..n {
                    let d1 = self.d(1, i, j);
                    let d2 = self.d(2, i, j);
                    let d3 = self.d(3, i, j);
                    let d4 = self.d(4, i, j);
                    let delta = if i == j { 1.0 } else { 0.0 };

                    for c in 0..3 {
                        for d in 0..3 {
                            let mut value = e * m_cols[d][c] * d4;
                            if c == d {
                                value += beta / dt * delta;
                            }
                            data[idx(3 * i + c, 3 * j + d)] = value;
                        }
                        data[idx(3 * i + c, 3 * n + j)] = -m_xs[c] * d1 - m_xss[c] * delta;
                    }

                    for d in 0..3 {
                        data[idx(3 * n + i, 3 * j + d)] = e * (7.0 * c_0 + c_1) * xss_i[d] * d4
                            + 6.0 * c_0 * e * xsss_i[d] * d3
                            + penalty * xs_i[d] * d1;
                    }
                    data[idx(3 * n + i, 3 * n + j)] =
                        2.0 * c_0 * d2 - (c_0 + c_1) * xss_norm2 * delta;
                }
            }
        }
        {
            let rows = 3 * n;
            let data = force_operator.data_mut();
            for i in 0..n {
                for j in 0..n {
                    let d1 = self.d(1, i, j);
                    let d4 = self.d(4, i, j);
                    let delta = if i == j { 1.0 } else { 0.0 };
                    for c in 0..3 {
                        data[(3 * i + c) + (3 * j + c) * rows] = -e * d4;
                        data[(3 * i + c) + (3 * n + j) * rows] =
                            self.xs[3 * i + c] * d1 + self.xss[3 * i + c] * delta;
                    }
                }
            }
        }

        self.a = a;
        self.force_operator = force_operator;
        self.stage = FiberStage::OperatorFormed;
        Ok(())
    }

    /// Collocation right hand side for a background `flow` and external force density.
    pub fn compute_rhs(&mut self, flow: &[f64], f_external: &[f64]) -> Result<()> {
        self.require("compute_rhs", FiberStage::OperatorFormed)?;
        let n = self.n_nodes;
        for (what, values) in [("fiber flow", flow), ("fiber external force", f_external)] {
            if values.len() != 3 * n {
                return Err(Error::SizeMismatch {
                    what,
                    expected: 3 * n,
                    found: values.len(),
                });
            }
        }
        let beta = self.options.beta_tstep();

        let mut w = flow.to_vec();
        for i in 0..n {
            let mf = self.mobility(i, &f_external[3 * i..3 * i + 3]);
            for c in 0..3 {
                w[3 * i + c] += mf[c];
            }
        }
        let ws = self.differentiate(1, &w);

        let mut rhs = vec![0.0; 4 * n];
        for i in 0..n {
            for c in 0..3 {
                rhs[3 * i + c] = beta * self.x[3 * i + c] / self.dt + w[3 * i + c];
            }
            rhs[3 * n + i] =
                self.options.penalty_param() - dot(&self.xs[3 * i..3 * i + 3], &ws[3 * i..3 * i + 3]);
        }
        self.rhs = rhs;
        self.flow_and_forcing = w;
        self.stage = FiberStage::RhsComputed;
        Ok(())
    }

    fn end_node(&self, end: FiberEnd) -> usize {
        match end {
            FiberEnd::Minus => 0,
            FiberEnd::Plus => self.n_nodes - 1,
        }
    }

    /// Write the boundary rows of one end into the square system.
    fn apply_end_conditions(&self, end: FiberEnd, a_bc: &mut Matrix, rhs_bc: &mut [f64]) {
        let n = self.n_nodes;
        let size = 4 * n;
        let k = self.end_node(end);
        let end_index = match end {
            FiberEnd::Minus => 0,
            FiberEnd::Plus => 1,
        };
        let x_row = 3 * (n - 4) + 6 * end_index;
        let t_row = 4 * n - 2 + end_index;
        let e = self.bending_rigidity;
        let beta = self.options.beta_tstep();
        let dt = self.dt;
        let c_0 = self.c_0;
        let xs_k = [self.xs[3 * k], self.xs[3 * k + 1], self.xs[3 * k + 2]];
        let xss_k = &self.xss[3 * k..3 * k + 3];
        let xsss_k = &self.xsss[3 * k..3 * k + 3];
        let x_k = &self.x[3 * k..3 * k + 3];
        let conditions = self.end_conditions(end);

        let data = a_bc.data_mut();
        let idx = |r: usize, c: usize| r + c * size;

        let tangential_velocity_row = |data: &mut [f64], velocity: &[f64; 3]| -> f64 {
            for j in 0..n {
                data[idx(t_row, 3 * n + j)] = 2.0 * c_0 * self.d(1, k, j);
                let d3 = self.d(3, k, j);
                for d in 0..3 {
                    data[idx(t_row, 3 * j + d)] = 6.0 * c_0 * e * xss_k[d] * d3;
                }
            }
            let w_k = &self.flow_and_forcing[3 * k..3 * k + 3];
            (0..3).map(|c| xs_k[c] * (velocity[c] - w_k[c])).sum()
        };

        match conditions.translational {
            TranslationalCondition::Force(force) => {
                for c in 0..3 {
                    for j in 0..n {
                        data[idx(x_row + c, 3 * j + c)] = -e * self.d(3, k, j);
                    }
                    data[idx(x_row + c, 3 * n + k)] = xs_k[c];
                    rhs_bc[x_row + c] = force[c];
                }
                data[idx(t_row, 3 * n + k)] = 1.0;
                rhs_bc[t_row] = dot(&force, &xs_k) + e * dot(&xs_k, xsss_k);
            }
            TranslationalCondition::Velocity(velocity) => {
                for c in 0..3 {
                    data[idx(x_row + c, 3 * k + c)] = beta / dt;
                    rhs_bc[x_row + c] = beta * x_k[c] / dt + velocity[c];
                }
                rhs_bc[t_row] = tangential_velocity_row(&mut *data, &velocity);
            }
            TranslationalCondition::Position(position) => {
                for c in 0..3 {
                    data[idx(x_row + c, 3 * k + c)] = 1.0;
                    rhs_bc[x_row + c] = position[c];
                }
                let velocity = [
                    (position[0] - x_k[0]) / dt,
                    (position[1] - x_k[1]) / dt,
                    (position[2] - x_k[2]) / dt,
                ];
                rhs_bc[t_row] = tangential_velocity_row(&mut *data, &velocity);
            }
        }

        let r_row = x_row + 3;
        match conditions.rotational {
            RotationalCondition::Torque(torque) => {
                let rhs = cross(&torque, &xs_k);
                for c in 0..3 {
                    for j in 0..n {
                        data[idx(r_row + c, 3 * j + c)] = e * self.d(2, k, j);
                    }
                    rhs_bc[r_row + c] = rhs[c];
                }
            }
            RotationalCondition::AngularVelocity(omega) => {
                let rhs = cross(&omega, &xs_k);
                for c in 0..3 {
                    for j in 0..n {
                        data[idx(r_row + c, 3 * j + c)] = beta / dt * self.d(1, k, j);
                    }
                    rhs_bc[r_row + c] = beta * xs_k[c] / dt + rhs[c];
                }
            }
            RotationalCondition::Angle(direction) => {
                for c in 0..3 {
                    for j in 0..n {
                        data[idx(r_row + c, 3 * j + c)] = self.d(1, k, j);
                    }
                    rhs_bc[r_row + c] = direction[c];
                }
            }
        }
    }

    /// Downsample the collocation system and append the end conditions.
    ///
    /// Row layout: position equations at `n - 4` points, 6 boundary rows per end,
    /// tension equations at `n - 2` points, one tension boundary row per end.
    pub fn apply_bc_rectangular(&mut self) -> Result<()> {
        self.require("apply_bc_rectangular", FiberStage::RhsComputed)?;
        let n = self.n_nodes;
        let size = 4 * n;
        let p_x = &self.matrices.p_x;
        let p_t = &self.matrices.p_t;

        let mut a_bc = zeros(size, size);
        let mut rhs_bc = vec![0.0; size];
        {
            let a_data = self.a.data();
            let data = a_bc.data_mut();
            for i in 0..n - 4 {
                for j in 0..n {
                    let p = entry(p_x, i, j);
                    if p == 0.0 {
                        continue;
                    }
                    for c in 0..3 {
                        let (row, source) = (3 * i + c, 3 * j + c);
                        for col in 0..size {
                            data[row + col * size] += p * a_data[source + col * size];
                        }
                        rhs_bc[row] += p * self.rhs[source];
                    }
                }
            }
            for i in 0..n - 2 {
                let row = 3 * n + i;
                for j in 0..n {
                    let p = entry(p_t, i, j);
                    if p == 0.0 {
                        continue;
                    }
                    let source = 3 * n + j;
                    for col in 0..size {
                        data[row + col * size] += p * a_data[source + col * size];
                    }
                    rhs_bc[row] += p * self.rhs[source];
                }
            }
        }
        self.apply_end_conditions(FiberEnd::Minus, &mut a_bc, &mut rhs_bc);
        self.apply_end_conditions(FiberEnd::Plus, &mut a_bc, &mut rhs_bc);

        self.a_bc = a_bc;
        self.rhs_bc = rhs_bc;
        self.stage = FiberStage::BoundaryApplied;
        Ok(())
    }

    /// Invert the square operator for use as a preconditioner block.
    pub fn build_preconditioner(&mut self) -> Result<()> {
        self.require("build_preconditioner", FiberStage::BoundaryApplied)?;
        self.a_inv = invert(duplicate(&self.a_bc))?;
        self.stage = FiberStage::PreconditionerBuilt;
        debug!("Built preconditioner for fiber with {} nodes", self.n_nodes);
        Ok(())
    }

    /// Apply the inverse of the square operator.
    pub fn apply_preconditioner(&self, x: &[f64]) -> Result<Vec<f64>> {
        self.require("apply_preconditioner", FiberStage::PreconditionerBuilt)?;
        self.check_solution_len(x)?;
        Ok(matvec(&self.a_inv, x))
    }

    /// Residual contribution of the velocity `v_on_fiber` induced by other sources.
    fn flow_residual(&self, v_on_fiber: &[f64], y: &mut [f64]) {
        let n = self.n_nodes;
        for i in 0..n - 4 {
            for j in 0..n {
                let p = entry(&self.matrices.p_x, i, j);
                for c in 0..3 {
                    y[3 * i + c] -= p * v_on_fiber[3 * j + c];
                }
            }
        }

        let vs = self.differentiate(1, v_on_fiber);
        let xs_vs: Vec<f64> = (0..n)
            .map(|j| dot(&self.xs[3 * j..3 * j + 3], &vs[3 * j..3 * j + 3]))
            .collect();
        for i in 0..n - 2 {
            for (j, value) in xs_vs.iter().enumerate() {
                y[3 * n + i] += entry(&self.matrices.p_t, i, j) * value;
            }
        }

        for (end_index, end) in [FiberEnd::Minus, FiberEnd::Plus].into_iter().enumerate() {
            if self.end_conditions(end).translational.is_kinematic() {
                let k = self.end_node(end);
                y[4 * n - 2 + end_index] +=
                    dot(&self.xs[3 * k..3 * k + 3], &v_on_fiber[3 * k..3 * k + 3]);
            }
        }
    }

    /// Apply the square operator to `x` including the externally induced velocity.
    pub fn matvec(&self, x: &[f64], v_on_fiber: &[f64]) -> Result<Vec<f64>> {
        self.require("matvec", FiberStage::BoundaryApplied)?;
        self.check_solution_len(x)?;
        if v_on_fiber.len() != 3 * self.n_nodes {
            return Err(Error::SizeMismatch {
                what: "velocity on fiber",
                expected: 3 * self.n_nodes,
                found: v_on_fiber.len(),
            });
        }
        let mut y = vec![0.0; self.solution_size()];
        matvec_add(&self.a_bc, x, &mut y);
        self.flow_residual(v_on_fiber, &mut y);
        Ok(y)
    }

    /// Force and torque the fiber exerts through its minus end for a solution `x`.
    ///
    /// The force is `-E x_sss + T x_s` and the torque `E x_s x x_ss`, evaluated at the
    /// minus end with the new positions and tension and the current tangent.
    pub fn minus_end_force_torque(&self, x: &[f64]) -> Result<[f64; 6]> {
        self.require("minus_end_force_torque", FiberStage::DerivativesUpdated)?;
        self.check_solution_len(x)?;
        let n = self.n_nodes;
        let e = self.bending_rigidity;
        let mut xss = [0.0; 3];
        let mut xsss = [0.0; 3];
        for j in 0..n {
            let (d2, d3) = (self.d(2, 0, j), self.d(3, 0, j));
            for c in 0..3 {
                xss[c] += d2 * x[3 * j + c];
                xsss[c] += d3 * x[3 * j + c];
            }
        }
        let xs = [self.xs[0], self.xs[1], self.xs[2]];
        let tension = x[3 * n];
        let bending = cross(&xs, &xss);
        let mut force_torque = [0.0; 6];
        for c in 0..3 {
            force_torque[c] = -e * xsss[c] + tension * xs[c];
            force_torque[3 + c] = e * bending[c];
        }
        Ok(force_torque)
    }

    /// Velocity terms of the minus end rows for a site moving with `velocity` and
    /// rotating with `angular_velocity`.
    pub fn minus_end_link_velocity(&self, velocity: &[f64; 3], angular_velocity: &[f64; 3]) -> [f64; 7] {
        let xs = &self.xs[0..3];
        let rotation = cross(angular_velocity, xs);
        [
            velocity[0],
            velocity[1],
            velocity[2],
            rotation[0],
            rotation[1],
            rotation[2],
            dot(xs, velocity),
        ]
    }

    /// Move the velocity of the site the minus end is bound to into the operator.
    ///
    /// `link` holds the site velocity, `Omega x x_s` at the minus end and the tangential
    /// site velocity. They are subtracted from the rows of the clamped minus end in `y`.
    pub fn apply_link_velocity(&self, link: &[f64; 7], y: &mut [f64]) -> Result<()> {
        self.check_solution_len(y)?;
        let n = self.n_nodes;
        let x_row = 3 * (n - 4);
        for c in 0..6 {
            y[x_row + c] -= link[c];
        }
        y[4 * n - 2] -= link[6];
        Ok(())
    }

    /// Force density `-E x_ssss + (T x_s)_s` at the nodes for a solution `x`.
    pub fn force_density(&self, x: &[f64]) -> Result<Vec<f64>> {
        self.require("force_density", FiberStage::OperatorFormed)?;
        self.check_solution_len(x)?;
        Ok(matvec(&self.force_operator, x))
    }

    /// Point forces at the nodes, the force density times the quadrature weights.
    pub fn apply_fiber_force(&self, x: &[f64]) -> Result<Vec<f64>> {
        let mut forces = self.force_density(x)?;
        for (f, w) in forces.chunks_exact_mut(3).zip(self.quadrature_weights()) {
            f[0] *= w;
            f[1] *= w;
            f[2] *= w;
        }
        Ok(forces)
    }

    fn check_solution_len(&self, x: &[f64]) -> Result<()> {
        if x.len() != self.solution_size() {
            return Err(Error::SizeMismatch {
                what: "fiber solution",
                expected: self.solution_size(),
                found: x.len(),
            });
        }
        Ok(())
    }

    /// Run all per-timestep updates up to the preconditioner.
    pub fn update(
        &mut self,
        dt: f64,
        eta: f64,
        flow: &[f64],
        f_external: &[f64],
    ) -> Result<()> {
        if self.stage < FiberStage::DerivativesUpdated {
            self.update_derivatives()?;
        }
        self.update_stokeslet(eta)?;
        self.form_linear_operator(dt, eta)?;
        self.compute_rhs(flow, f_external)?;
        self.apply_bc_rectangular()?;
        self.build_preconditioner()
    }
}

#[cfg(test)]
mod test {
    extern crate blas_src;
    extern crate lapack_src;

    use super::{
        BoundaryCondition, EndConditions, Fiber, FiberStage, RotationalCondition,
        TranslationalCondition,
    };
    use crate::params::{FiberOptions, KernelOptions};
    use crate::types::{Error, FiberEnd};
    use approx::assert_relative_eq;

    fn straight_fiber(n: usize) -> Fiber {
        Fiber::new(n, 1.0, 0.1, 1.0, &FiberOptions::default(), &KernelOptions::default()).unwrap()
    }

    #[test]
    fn test_incompatible_pairs_are_rejected() {
        let err = EndConditions::new(
            FiberEnd::Plus,
            BoundaryCondition::Force([0.0; 3]),
            BoundaryCondition::Velocity([0.0; 3]),
        );
        assert!(matches!(
            err,
            Err(Error::IncompatibleBoundaryConditions {
                end: FiberEnd::Plus,
                ..
            })
        ));
        assert!(EndConditions::new(
            FiberEnd::Minus,
            BoundaryCondition::Position([0.0; 3]),
            BoundaryCondition::Angle([1.0, 0.0, 0.0]),
        )
        .is_ok());
    }

    #[test]
    fn test_conditions_are_typed_by_slot() {
        let conditions = EndConditions::new(
            FiberEnd::Minus,
            BoundaryCondition::Position([1.0, 0.0, 0.0]),
            BoundaryCondition::Angle([0.0, 1.0, 0.0]),
        )
        .unwrap();
        assert_eq!(
            *conditions.translational(),
            TranslationalCondition::Position([1.0, 0.0, 0.0])
        );
        assert_eq!(
            *conditions.rotational(),
            RotationalCondition::Angle([0.0, 1.0, 0.0])
        );
        assert!(conditions.translational().is_kinematic());
        assert!(!EndConditions::free().translational().is_kinematic());

        assert!(matches!(
            EndConditions::new(
                FiberEnd::Minus,
                BoundaryCondition::Torque([0.0; 3]),
                BoundaryCondition::Force([0.0; 3]),
            ),
            Err(Error::IncompatibleBoundaryConditions {
                first: "Torque",
                second: "Force",
                ..
            })
        ));
        assert_eq!(
            TranslationalCondition::try_from(BoundaryCondition::Angle([0.0; 3])),
            Err(BoundaryCondition::Angle([0.0; 3]))
        );
        assert_eq!(
            RotationalCondition::try_from(BoundaryCondition::AngularVelocity([0.0, 0.0, 2.0])),
            Ok(RotationalCondition::AngularVelocity([0.0, 0.0, 2.0]))
        );
    }

    #[test]
    fn test_prescribed_position_and_angle() {
        let n = 16;
        let mut fiber = straight_fiber(n);
        fiber.set_end_conditions(
            FiberEnd::Minus,
            EndConditions::from_parts(
                TranslationalCondition::Position([0.0, 0.01, 0.0]),
                RotationalCondition::Angle([1.0, 0.0, 0.0]),
            ),
        );
        let zeros = vec![0.0; 3 * n];
        fiber.update(0.005, 1.0, &zeros, &zeros).unwrap();
        let rhs = fiber.rhs().unwrap().to_vec();
        let solution = fiber.apply_preconditioner(&rhs).unwrap();
        assert_relative_eq!(solution[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(solution[1], 0.01, epsilon = 1e-6);
        assert_relative_eq!(solution[2], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_binding_clamps_minus_end() {
        let n = 12;
        let mut fiber = straight_fiber(n);
        fiber.set_end_conditions(FiberEnd::Minus, EndConditions::free());
        assert!(matches!(
            fiber.minus_end_force_torque(&vec![0.0; 4 * n]),
            Err(Error::StageOrder { .. })
        ));

        fiber.bind_to_body(2, 5);
        assert_eq!(fiber.binding_site(), Some((2, 5)));
        assert_eq!(*fiber.end_conditions(FiberEnd::Minus), EndConditions::clamped());

        fiber.update_derivatives().unwrap();
        let mut x = fiber.positions().to_vec();
        x.extend(vec![3.0; n]);
        let end = fiber.minus_end_force_torque(&x).unwrap();
        for (value, expected) in end.iter().zip([3.0, 0.0, 0.0, 0.0, 0.0, 0.0]) {
            assert_relative_eq!(*value, expected, epsilon = 1e-8);
        }

        let link = fiber.minus_end_link_velocity(&[0.5, 1.0, 0.0], &[0.0, 0.0, 2.0]);
        assert_relative_eq!(link[4], 2.0, epsilon = 1e-10);
        assert_relative_eq!(link[6], 0.5, epsilon = 1e-10);

        fiber.unbind();
        assert_eq!(fiber.binding_site(), None);
    }

    #[test]
    fn test_derivatives_of_straight_fiber() {
        let mut fiber = straight_fiber(16);
        fiber.update_derivatives().unwrap();
        for i in 0..16 {
            assert_relative_eq!(fiber.xs()[3 * i], 1.0, epsilon = 1e-10);
            assert_relative_eq!(fiber.xs()[3 * i + 1], 0.0, epsilon = 1e-10);
            assert_relative_eq!(fiber.xss()[3 * i], 0.0, epsilon = 1e-7);
        }
        let total: f64 = fiber.quadrature_weights().iter().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-13);
    }

    #[test]
    fn test_stage_order_is_enforced() {
        let mut fiber = straight_fiber(12);
        assert!(matches!(
            fiber.form_linear_operator(0.01, 1.0),
            Err(Error::StageOrder {
                required: FiberStage::StokesletUpdated,
                current: FiberStage::GeometrySet,
                ..
            })
        ));
        fiber.update_derivatives().unwrap();
        fiber.update_stokeslet(1.0).unwrap();
        fiber.form_linear_operator(0.01, 1.0).unwrap();
        assert!(fiber.matvec(&vec![0.0; 48], &vec![0.0; 36]).is_err());

        fiber.translate(&[1.0, 0.0, 0.0]);
        assert_eq!(fiber.stage(), FiberStage::GeometrySet);
        assert!(fiber.apply_preconditioner(&vec![0.0; 48]).is_err());
    }

    #[test]
    fn test_preconditioner_inverts_isolated_fiber() {
        let n = 16;
        let mut fiber = straight_fiber(n);
        let flow = vec![0.0; 3 * n];
        let mut force = vec![0.0; 3 * n];
        for i in 0..n {
            force[3 * i + 1] = 1.0;
        }
        fiber.update(0.005, 1.0, &flow, &force).unwrap();

        let rhs = fiber.rhs().unwrap().to_vec();
        let solution = fiber.apply_preconditioner(&rhs).unwrap();
        let reproduced = fiber.matvec(&solution, &vec![0.0; 3 * n]).unwrap();

        let scale = rhs.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        for (r, p) in rhs.iter().zip(reproduced.iter()) {
            assert_relative_eq!(r, p, epsilon = 1e-6 * scale);
        }
    }

    #[test]
    fn test_clamped_fiber_at_rest_stays_put() {
        let n = 12;
        let mut fiber = straight_fiber(n);
        let zeros = vec![0.0; 3 * n];
        fiber.update(0.005, 1.0, &zeros, &zeros).unwrap();
        let rhs = fiber.rhs().unwrap().to_vec();
        let solution = fiber.apply_preconditioner(&rhs).unwrap();
        for i in 0..3 * n {
            assert_relative_eq!(solution[i], fiber.positions()[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_force_operator_of_tension() {
        let n = 12;
        let mut fiber = straight_fiber(n);
        let zeros = vec![0.0; 3 * n];
        fiber.update(0.005, 1.0, &zeros, &zeros).unwrap();
        // Straight configuration with a linear tension profile T = s gives f = x_s.
        let mut x = fiber.positions().to_vec();
        x.extend((0..n).map(|i| fiber.positions()[3 * i]));
        assert_relative_eq!(x[4 * n - 1], 1.0, epsilon = 1e-14);
        let f = fiber.force_density(&x).unwrap();
        for i in 0..n {
            assert_relative_eq!(f[3 * i], 1.0, epsilon = 1e-6);
            assert_relative_eq!(f[3 * i + 1], 0.0, epsilon = 1e-8);
        }
    }
}
