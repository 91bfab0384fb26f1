//! The confining periphery.
//!
//! The periphery operator and its inverse are computed once, outside of this crate,
//! and loaded as dense matrices. Each process keeps the rows belonging to its nodes.
use crate::distribution::DistributionPlan;
use crate::kernel::KernelProvider;
use crate::linalg::{from_fn, matvec, matvec_add, rows, zeros, Matrix};
use crate::traits::LocalOperator;
use crate::types::{Error, Result};
use log::info;

/// Shape of the periphery, used by the collision tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PeripheryShape {
    /// Arbitrary surface without analytic collision test.
    Generic,
    /// Sphere centred at the origin.
    Spherical {
        /// Radius.
        radius: f64,
    },
}

impl PeripheryShape {
    /// Name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            PeripheryShape::Generic => "generic periphery",
            PeripheryShape::Spherical { .. } => "spherical periphery",
        }
    }
}

/// Precomputed global periphery data.
///
/// Matrices are `3n x 3n`, stored row by row. Normals face into the fluid.
#[derive(Debug, Clone, Default)]
pub struct PeripheryPrecompute {
    node_positions: Vec<f64>,
    node_normals: Vec<f64>,
    quadrature_weights: Vec<f64>,
    m_inv: Vec<f64>,
    stresslet_plus_complementary: Vec<f64>,
}

impl PeripheryPrecompute {
    /// Validate and wrap precomputed data.
    pub fn new(
        node_positions: Vec<f64>,
        node_normals: Vec<f64>,
        quadrature_weights: Vec<f64>,
        m_inv: Vec<f64>,
        stresslet_plus_complementary: Vec<f64>,
    ) -> Result<Self> {
        let n = quadrature_weights.len();
        let check = |what: &str, len: usize, expected: usize| {
            if len == expected {
                Ok(())
            } else {
                Err(Error::MalformedPrecompute(format!(
                    "periphery {what} has {len} values, expected {expected} for {n} nodes"
                )))
            }
        };
        check("node positions", node_positions.len(), 3 * n)?;
        check("node normals", node_normals.len(), 3 * n)?;
        check("inverse operator", m_inv.len(), 9 * n * n)?;
        check(
            "stresslet operator",
            stresslet_plus_complementary.len(),
            9 * n * n,
        )?;
        Ok(Self {
            node_positions,
            node_normals,
            quadrature_weights,
            m_inv,
            stresslet_plus_complementary,
        })
    }

    /// Number of nodes.
    pub fn n_nodes(&self) -> usize {
        self.quadrature_weights.len()
    }
}

/// The locally owned part of the periphery.
pub struct Periphery {
    shape: PeripheryShape,
    plan: DistributionPlan,
    node_positions: Vec<f64>,
    node_normals: Vec<f64>,
    quadrature_weights: Vec<f64>,
    m_inv: Matrix,
    stresslet_plus_complementary: Matrix,
    rhs: Vec<f64>,
}

impl std::fmt::Debug for Periphery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Periphery ({}) with {} of {} nodes on rank {}",
            self.shape.name(),
            self.plan.n_nodes_local(),
            self.plan.n_nodes_global(),
            self.plan.rank()
        )
    }
}

impl Periphery {
    /// Take the rows of `precompute` owned by the rank of `plan`.
    pub fn new(
        precompute: &PeripheryPrecompute,
        shape: PeripheryShape,
        plan: DistributionPlan,
    ) -> Result<Self> {
        if plan.n_nodes_global() != precompute.n_nodes() {
            return Err(Error::MalformedPrecompute(format!(
                "distribution plan for {} nodes, precompute has {}",
                plan.n_nodes_global(),
                precompute.n_nodes()
            )));
        }
        let node_range = plan.nodes().range(plan.rank());
        let quad_range = plan.quadrature().range(plan.rank());
        let n_cols = 3 * plan.n_nodes_global();
        let local_rows = |global: &[f64]| {
            from_fn(node_range.len(), n_cols, |i, j| {
                global[(node_range.start + i) * n_cols + j]
            })
        };

        let periphery = Self {
            shape,
            node_positions: precompute.node_positions[node_range.clone()].to_vec(),
            node_normals: precompute.node_normals[node_range.clone()].to_vec(),
            quadrature_weights: precompute.quadrature_weights[quad_range].to_vec(),
            m_inv: local_rows(&precompute.m_inv),
            stresslet_plus_complementary: local_rows(&precompute.stresslet_plus_complementary),
            rhs: vec![0.0; node_range.len()],
            plan,
        };
        info!("{periphery:?}");
        Ok(periphery)
    }

    /// An empty periphery, for unconfined systems.
    pub fn empty() -> Self {
        let plan = DistributionPlan::single_process(0);
        Self {
            shape: PeripheryShape::Generic,
            plan,
            node_positions: Vec::new(),
            node_normals: Vec::new(),
            quadrature_weights: Vec::new(),
            m_inv: zeros(0, 0),
            stresslet_plus_complementary: zeros(0, 0),
            rhs: Vec::new(),
        }
    }

    /// Shape.
    pub fn shape(&self) -> &PeripheryShape {
        &self.shape
    }

    /// Distribution of the nodes.
    pub fn plan(&self) -> &DistributionPlan {
        &self.plan
    }

    /// Number of nodes on all processes.
    pub fn n_nodes_global(&self) -> usize {
        self.plan.n_nodes_global()
    }

    /// Local node positions.
    pub fn local_node_positions(&self) -> &[f64] {
        &self.node_positions
    }

    /// Local node normals.
    pub fn local_node_normals(&self) -> &[f64] {
        &self.node_normals
    }

    /// Local quadrature weights.
    pub fn local_quadrature_weights(&self) -> &[f64] {
        &self.quadrature_weights
    }

    /// Set the right hand side from the velocity at the local nodes.
    pub fn update_rhs(&mut self, v_on_shell: &[f64]) -> Result<()> {
        if v_on_shell.len() != self.rhs.len() {
            return Err(Error::SizeMismatch {
                what: "velocity on periphery",
                expected: self.rhs.len(),
                found: v_on_shell.len(),
            });
        }
        for (r, v) in self.rhs.iter_mut().zip(v_on_shell) {
            *r = -v;
        }
        Ok(())
    }

    fn check_global(&self, x: &[f64]) -> Result<()> {
        let expected = self.plan.nodes().total();
        if x.len() != expected {
            return Err(Error::SizeMismatch {
                what: "gathered periphery density",
                expected,
                found: x.len(),
            });
        }
        Ok(())
    }

    /// Velocity at `r_trg` induced by the local part of the density.
    pub fn flow(&self, kernel: &KernelProvider, r_trg: &[f64], density: &[f64]) -> Result<Vec<f64>> {
        if density.len() != self.node_positions.len() {
            return Err(Error::SizeMismatch {
                what: "periphery density",
                expected: self.node_positions.len(),
                found: density.len(),
            });
        }
        Ok(kernel.stresslet_velocity(&self.node_positions, &self.node_normals, density, r_trg))
    }
}

impl LocalOperator for Periphery {
    fn local_solution_size(&self) -> usize {
        rows(&self.m_inv)
    }

    fn local_node_count(&self) -> usize {
        self.local_solution_size() / 3
    }

    fn rhs(&self) -> Result<Vec<f64>> {
        Ok(self.rhs.clone())
    }

    fn apply_preconditioner(&self, x: &[f64]) -> Result<Vec<f64>> {
        self.check_global(x)?;
        Ok(matvec(&self.m_inv, x))
    }

    fn matvec(&self, x: &[f64], v_on_nodes: &[f64]) -> Result<Vec<f64>> {
        self.check_global(x)?;
        if v_on_nodes.len() != self.local_solution_size() {
            return Err(Error::SizeMismatch {
                what: "velocity on periphery",
                expected: self.local_solution_size(),
                found: v_on_nodes.len(),
            });
        }
        let mut y = v_on_nodes.to_vec();
        matvec_add(&self.stresslet_plus_complementary, x, &mut y);
        Ok(y)
    }
}

#[cfg(test)]
mod test {
    use super::{Periphery, PeripheryPrecompute, PeripheryShape};
    use crate::distribution::DistributionPlan;
    use crate::traits::LocalOperator;
    use crate::types::Error;
    use approx::assert_relative_eq;

    fn precompute(n: usize) -> PeripheryPrecompute {
        let size = 3 * n;
        let mut m_inv = vec![0.0; size * size];
        let mut spc = vec![0.0; size * size];
        for i in 0..size {
            m_inv[i * size + i] = 0.5;
            spc[i * size + i] = 2.0;
            spc[i * size + (i + 1) % size] = 1.0;
        }
        PeripheryPrecompute::new(
            (0..size).map(|i| i as f64).collect(),
            vec![1.0; size],
            vec![0.1; n],
            m_inv,
            spc,
        )
        .unwrap()
    }

    #[test]
    fn test_local_rows() {
        let pre = precompute(5);
        let plan = DistributionPlan::new(1, 2, 5).unwrap();
        let shell = Periphery::new(&pre, PeripheryShape::Generic, plan).unwrap();
        assert_eq!(shell.local_node_count(), 2);
        assert_eq!(shell.local_solution_size(), 6);
        assert_eq!(shell.local_node_positions(), [9.0, 10.0, 11.0, 12.0, 13.0, 14.0]);

        let x: Vec<f64> = (0..15).map(|i| i as f64).collect();
        let y = shell.matvec(&x, &[1.0; 6]).unwrap();
        for (k, v) in y.iter().enumerate() {
            let row = 9 + k;
            assert_relative_eq!(*v, 1.0 + 2.0 * row as f64 + ((row + 1) % 15) as f64);
        }
        let z = shell.apply_preconditioner(&x).unwrap();
        assert_eq!(z, [4.5, 5.0, 5.5, 6.0, 6.5, 7.0]);
        assert!(matches!(
            shell.apply_preconditioner(&x[..6]),
            Err(Error::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_rhs_is_negated_velocity() {
        let pre = precompute(2);
        let mut shell =
            Periphery::new(&pre, PeripheryShape::Generic, DistributionPlan::single_process(2))
                .unwrap();
        shell.update_rhs(&[1.0, -2.0, 0.0, 0.0, 0.0, 3.0]).unwrap();
        assert_eq!(shell.rhs().unwrap(), [-1.0, 2.0, 0.0, 0.0, 0.0, -3.0]);
    }

    #[test]
    fn test_empty_periphery() {
        let shell = Periphery::empty();
        assert_eq!(shell.local_solution_size(), 0);
        assert_eq!(shell.n_nodes_global(), 0);
        assert!(shell.apply_preconditioner(&[]).unwrap().is_empty());
        assert!(shell.matvec(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_precompute() {
        assert!(matches!(
            PeripheryPrecompute::new(vec![0.0; 6], vec![0.0; 6], vec![1.0; 2], vec![0.0; 35], vec![0.0; 36]),
            Err(Error::MalformedPrecompute(_))
        ));
        let plan = DistributionPlan::single_process(3);
        assert!(Periphery::new(&precompute(2), PeripheryShape::Generic, plan).is_err());
    }
}
