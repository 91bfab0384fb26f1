//! Rigid bodies.
//!
//! A body is a closed surface discretized by nodes with outward normals and
//! quadrature weights. Its unknowns are the quadrature weighted double layer density
//! at the nodes followed by the six rigid body velocities.
pub mod container;

pub use container::BodyContainer;

use crate::geometry::{fibonacci_sphere, point, rotate};
use crate::kernel::{stresslet_times_normal, stresslet_times_normal_times_density};
use crate::linalg::{
    add, duplicate, entry, invert, matvec, matvec_add, set, set_block, zeros, Matrix,
};
use crate::params::KernelOptions;
use crate::types::{Error, Result};
use log::{debug, warn};
use nalgebra::UnitQuaternion;
use num::traits::FloatConst;

/// Shape of a body, used by the collision tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BodyShape {
    /// Arbitrary surface without analytic collision test.
    Generic,
    /// Sphere of the given radius centred at the body position.
    Spherical {
        /// Radius.
        radius: f64,
    },
}

impl BodyShape {
    /// Name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            BodyShape::Generic => "generic body",
            BodyShape::Spherical { .. } => "spherical body",
        }
    }
}

/// Reference frame geometry of a body.
#[derive(Debug, Clone)]
pub struct BodyPrecompute {
    node_positions_ref: Vec<f64>,
    node_normals_ref: Vec<f64>,
    node_weights: Vec<f64>,
    nucleation_sites_ref: Vec<f64>,
}

impl BodyPrecompute {
    /// Validate and wrap reference frame geometry.
    pub fn new(
        node_positions_ref: Vec<f64>,
        node_normals_ref: Vec<f64>,
        node_weights: Vec<f64>,
    ) -> Result<Self> {
        let n_nodes = node_weights.len();
        if n_nodes == 0 {
            return Err(Error::MalformedPrecompute(
                "body has no nodes".to_string(),
            ));
        }
        if node_positions_ref.len() != 3 * n_nodes || node_normals_ref.len() != 3 * n_nodes {
            return Err(Error::MalformedPrecompute(format!(
                "{} weights but {} position and {} normal values",
                n_nodes,
                node_positions_ref.len(),
                node_normals_ref.len()
            )));
        }
        if let Some(w) = node_weights.iter().find(|w| !(**w > 0.0)) {
            return Err(Error::MalformedPrecompute(format!(
                "node weights must be positive, found {w}"
            )));
        }
        let centroid = (0..3)
            .map(|c| {
                node_positions_ref.iter().skip(c).step_by(3).sum::<f64>() / n_nodes as f64
            })
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt();
        let extent = node_positions_ref.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        if centroid > 1e-3 * extent.max(f64::MIN_POSITIVE) {
            warn!("Reference nodes of body are centred at distance {centroid:e} from its origin.");
        }
        Ok(Self {
            node_positions_ref,
            node_normals_ref,
            node_weights,
            nucleation_sites_ref: Vec::new(),
        })
    }

    /// Attach fiber nucleation sites given in the body frame.
    pub fn with_nucleation_sites(mut self, sites_ref: Vec<f64>) -> Result<Self> {
        if sites_ref.len() % 3 != 0 {
            return Err(Error::MalformedPrecompute(format!(
                "{} nucleation site coordinates is not a multiple of three",
                sites_ref.len()
            )));
        }
        if let Some(v) = sites_ref.iter().find(|v| !v.is_finite()) {
            return Err(Error::MalformedPrecompute(format!(
                "nucleation site coordinate {v} is not finite"
            )));
        }
        self.nucleation_sites_ref = sites_ref;
        Ok(self)
    }

    /// Quasi-uniform nodes on a sphere with equal weights.
    pub fn sphere(n_nodes: usize, radius: f64) -> Result<Self> {
        if !(radius > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "sphere radius must be positive, got {radius}"
            )));
        }
        let (positions, normals) = fibonacci_sphere(n_nodes, radius);
        let weight = 4.0 * f64::PI() * radius * radius / n_nodes.max(1) as f64;
        Self::new(positions, normals, vec![weight; n_nodes])
    }

    /// Number of nodes.
    pub fn n_nodes(&self) -> usize {
        self.node_weights.len()
    }

    /// Node positions in the body frame.
    pub fn node_positions_ref(&self) -> &[f64] {
        &self.node_positions_ref
    }

    /// Node normals in the body frame.
    pub fn node_normals_ref(&self) -> &[f64] {
        &self.node_normals_ref
    }

    /// Quadrature weights.
    pub fn node_weights(&self) -> &[f64] {
        &self.node_weights
    }

    /// Nucleation sites in the body frame.
    pub fn nucleation_sites_ref(&self) -> &[f64] {
        &self.nucleation_sites_ref
    }
}

/// A rigid body.
///
/// Lab frame nodes and normals always match the pose. Operators depending on them
/// are refreshed by [Body::update_cache_variables]; between a move and that call
/// they are stale and any use fails with [Error::StaleOperator].
pub struct Body {
    index: usize,
    shape: BodyShape,
    precompute: BodyPrecompute,
    position: [f64; 3],
    orientation: UnitQuaternion<f64>,
    node_positions: Vec<f64>,
    node_normals: Vec<f64>,
    nucleation_sites: Vec<f64>,
    external_force: [f64; 3],
    external_torque: [f64; 3],
    ex: Vec<f64>,
    ey: Vec<f64>,
    ez: Vec<f64>,
    k: Matrix,
    stresslet: Matrix,
    a: Matrix,
    a_inv: Matrix,
    rhs: Vec<f64>,
    cache_valid: bool,
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Body {} ({}) with {} nodes at {:?}",
            self.index,
            self.shape.name(),
            self.n_nodes(),
            self.position
        )
    }
}

impl Body {
    /// Create a body from its reference geometry and initial pose.
    ///
    /// Cached operators are not computed.
    pub fn new(
        precompute: BodyPrecompute,
        position: [f64; 3],
        orientation: UnitQuaternion<f64>,
        shape: BodyShape,
    ) -> Self {
        let n = precompute.n_nodes();
        let n_sites = precompute.nucleation_sites_ref().len();
        let mut body = Self {
            index: 0,
            shape,
            precompute,
            position,
            orientation,
            node_positions: vec![0.0; 3 * n],
            node_normals: vec![0.0; 3 * n],
            nucleation_sites: vec![0.0; n_sites],
            external_force: [0.0; 3],
            external_torque: [0.0; 3],
            ex: Vec::new(),
            ey: Vec::new(),
            ez: Vec::new(),
            k: zeros(0, 0),
            stresslet: zeros(0, 0),
            a: zeros(0, 0),
            a_inv: zeros(0, 0),
            rhs: vec![0.0; 3 * n + 6],
            cache_valid: false,
        };
        body.move_to(position, orientation);
        body
    }

    /// Number of nodes.
    pub fn n_nodes(&self) -> usize {
        self.precompute.n_nodes()
    }

    /// Number of unknowns, densities and rigid velocities.
    pub fn solution_size(&self) -> usize {
        3 * self.n_nodes() + 6
    }

    /// Index of the body in its container.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    /// Shape.
    pub fn shape(&self) -> &BodyShape {
        &self.shape
    }

    /// Centroid position.
    pub fn position(&self) -> &[f64; 3] {
        &self.position
    }

    /// Orientation.
    pub fn orientation(&self) -> &UnitQuaternion<f64> {
        &self.orientation
    }

    /// Lab frame node positions.
    pub fn node_positions(&self) -> &[f64] {
        &self.node_positions
    }

    /// Lab frame node normals.
    pub fn node_normals(&self) -> &[f64] {
        &self.node_normals
    }

    /// Quadrature weights.
    pub fn node_weights(&self) -> &[f64] {
        self.precompute.node_weights()
    }

    /// Number of fiber nucleation sites.
    pub fn n_nucleation_sites(&self) -> usize {
        self.nucleation_sites.len() / 3
    }

    /// Lab frame nucleation sites.
    pub fn nucleation_sites(&self) -> &[f64] {
        &self.nucleation_sites
    }

    /// Lab frame position of nucleation site `site`.
    pub fn nucleation_site(&self, site: usize) -> Result<[f64; 3]> {
        if site >= self.n_nucleation_sites() {
            return Err(Error::IndexOutOfRange {
                what: "nucleation site",
                index: site,
                len: self.n_nucleation_sites(),
            });
        }
        Ok(point(&self.nucleation_sites, site))
    }

    /// Whether the cached operators match the current pose.
    pub fn is_cache_valid(&self) -> bool {
        self.cache_valid
    }

    /// External force and torque about the centroid.
    pub fn force_torque(&self) -> [f64; 6] {
        let (f, t) = (self.external_force, self.external_torque);
        [f[0], f[1], f[2], t[0], t[1], t[2]]
    }

    /// Set the external force.
    pub fn set_external_force(&mut self, force: [f64; 3]) -> &mut Self {
        self.external_force = force;
        self
    }

    /// Set the external torque.
    pub fn set_external_torque(&mut self, torque: [f64; 3]) -> &mut Self {
        self.external_torque = torque;
        self
    }

    /// Move the body and recompute its lab frame nodes and normals.
    ///
    /// Cached operators become stale.
    pub fn move_to(&mut self, position: [f64; 3], orientation: UnitQuaternion<f64>) {
        self.position = position;
        self.orientation = orientation;
        for i in 0..self.n_nodes() {
            let r = rotate(&orientation, &point(self.precompute.node_positions_ref(), i));
            let n = rotate(&orientation, &point(self.precompute.node_normals_ref(), i));
            for c in 0..3 {
                self.node_positions[3 * i + c] = position[c] + r[c];
                self.node_normals[3 * i + c] = n[c];
            }
        }
        for (site, lab) in self
            .precompute
            .nucleation_sites_ref()
            .chunks_exact(3)
            .zip(self.nucleation_sites.chunks_exact_mut(3))
        {
            let r = rotate(&orientation, site);
            for c in 0..3 {
                lab[c] = position[c] + r[c];
            }
        }
        self.cache_valid = false;
    }

    fn require_cache(&self) -> Result<()> {
        if self.cache_valid {
            Ok(())
        } else {
            Err(Error::StaleOperator(self.index))
        }
    }

    /// Rigid motion matrix mapping `[U, Omega]` to minus the node velocity.
    pub fn k_matrix(&self) -> Result<&Matrix> {
        self.require_cache()?;
        Ok(&self.k)
    }

    /// The `(3n + 6)` square operator of the body.
    pub fn operator(&self) -> Result<&Matrix> {
        self.require_cache()?;
        Ok(&self.a)
    }

    /// Node velocities of a rigid motion `[U, Omega]`.
    pub fn rigid_velocity(&self, velocities: &[f64]) -> Result<Vec<f64>> {
        self.require_cache()?;
        let mut v = matvec(&self.k, velocities);
        v.iter_mut().for_each(|c| *c = -*c);
        Ok(v)
    }

    fn update_k_matrix(&mut self) {
        let n = self.n_nodes();
        let mut k = zeros(3 * n, 6);
        for i in 0..n {
            let r = [
                self.node_positions[3 * i] - self.position[0],
                self.node_positions[3 * i + 1] - self.position[1],
                self.node_positions[3 * i + 2] - self.position[2],
            ];
            for c in 0..3 {
                set(&mut k, 3 * i + c, c, -1.0);
            }
            let rows = [[0.0, r[2], -r[1]], [-r[2], 0.0, r[0]], [r[1], -r[0], 0.0]];
            for (c, row) in rows.iter().enumerate() {
                for (d, value) in row.iter().enumerate() {
                    set(&mut k, 3 * i + c, 3 + d, -value);
                }
            }
        }
        self.k = k;
    }

    fn update_singularity_subtraction_vecs(&mut self, eta: f64, options: &KernelOptions) {
        let n = self.n_nodes();
        let along = |axis: usize| {
            let mut density = vec![0.0; 3 * n];
            for (i, w) in self.node_weights().iter().enumerate() {
                density[3 * i + axis] = *w;
            }
            stresslet_times_normal_times_density(
                &self.node_positions,
                &self.node_normals,
                &density,
                eta,
                options,
            )
        };
        let (ex, ey, ez) = (along(0), along(1), along(2));
        self.ex = ex;
        self.ey = ey;
        self.ez = ez;
    }

    fn update_preconditioner(&mut self, eta: f64, options: &KernelOptions) -> Result<()> {
        let n = self.n_nodes();
        let size = 3 * n + 6;
        let stresslet = stresslet_times_normal(&self.node_positions, &self.node_normals, eta, options);

        let mut a = zeros(size, size);
        set_block(&mut a, 0, 0, &stresslet);
        for (i, w) in self.node_weights().iter().enumerate() {
            for c in 0..3 {
                let row = 3 * i + c;
                for (d, e) in [&self.ex, &self.ey, &self.ez].iter().enumerate() {
                    add(&mut a, row, 3 * i + d, -e[row] / w);
                }
            }
        }
        for row in 0..3 * n {
            for col in 0..6 {
                let value = entry(&self.k, row, col);
                set(&mut a, row, 3 * n + col, -value);
                set(&mut a, 3 * n + col, row, -value);
            }
        }
        for c in 0..6 {
            set(&mut a, 3 * n + c, 3 * n + c, 1.0);
        }

        self.a_inv = invert(duplicate(&a))?;
        self.a = a;
        self.stresslet = stresslet;
        Ok(())
    }

    /// Recompute the rigid motion matrix, singularity subtraction and preconditioner.
    pub fn update_cache_variables(&mut self, eta: f64, options: &KernelOptions) -> Result<()> {
        self.update_singularity_subtraction_vecs(eta, options);
        self.update_k_matrix();
        self.update_preconditioner(eta, options)?;
        self.cache_valid = true;
        debug!("Updated operators of body {} with {} nodes", self.index, self.n_nodes());
        Ok(())
    }

    /// Right hand side for the velocity `v_on_body` at the nodes.
    pub fn update_rhs(&mut self, v_on_body: &[f64]) -> Result<()> {
        let n = self.n_nodes();
        if v_on_body.len() != 3 * n {
            return Err(Error::SizeMismatch {
                what: "velocity on body",
                expected: 3 * n,
                found: v_on_body.len(),
            });
        }
        for (r, v) in self.rhs.iter_mut().zip(v_on_body) {
            *r = -v;
        }
        let ft = self.force_torque();
        self.rhs[3 * n..].copy_from_slice(&ft);
        Ok(())
    }

    /// Current right hand side.
    pub fn rhs(&self) -> &[f64] {
        &self.rhs
    }

    fn check_solution_len(&self, x: &[f64]) -> Result<()> {
        if x.len() != self.solution_size() {
            return Err(Error::SizeMismatch {
                what: "body solution",
                expected: self.solution_size(),
                found: x.len(),
            });
        }
        Ok(())
    }

    /// Apply the body operator to `x` and add the externally induced node velocity.
    pub fn matvec(&self, x: &[f64], v_on_body: &[f64]) -> Result<Vec<f64>> {
        self.require_cache()?;
        self.check_solution_len(x)?;
        if v_on_body.len() != 3 * self.n_nodes() {
            return Err(Error::SizeMismatch {
                what: "velocity on body",
                expected: 3 * self.n_nodes(),
                found: v_on_body.len(),
            });
        }
        let mut y = v_on_body.to_vec();
        y.extend_from_slice(&[0.0; 6]);
        matvec_add(&self.a, x, &mut y);
        Ok(y)
    }

    /// Apply the inverse of the body operator.
    pub fn apply_preconditioner(&self, x: &[f64]) -> Result<Vec<f64>> {
        self.require_cache()?;
        self.check_solution_len(x)?;
        Ok(matvec(&self.a_inv, x))
    }

    /// Velocity at the body's own nodes due to its density, excluding coincident pairs.
    pub fn self_flow(&self, densities: &[f64]) -> Result<Vec<f64>> {
        self.require_cache()?;
        Ok(matvec(&self.stresslet, densities))
    }
}

#[cfg(test)]
mod test {
    extern crate blas_src;
    extern crate lapack_src;

    use super::{Body, BodyPrecompute, BodyShape};
    use crate::linalg::{cols, entry, rows};
    use crate::params::KernelOptions;
    use crate::types::Error;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn single_node_body() -> Body {
        let precompute = BodyPrecompute::new(
            vec![0.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![4.0 * std::f64::consts::PI],
        )
        .unwrap();
        Body::new(
            precompute,
            [0.0; 3],
            UnitQuaternion::identity(),
            BodyShape::Spherical { radius: 1.0 },
        )
    }

    #[test]
    fn test_single_node_operator() {
        let mut body = single_node_body();
        body.update_cache_variables(1.0, &KernelOptions::default())
            .unwrap();
        body.update_rhs(&[0.0; 3]).unwrap();

        let a = body.operator().unwrap();
        assert_eq!((rows(a), cols(a)), (9, 9));
        for i in 0..6 {
            for j in 0..6 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_eq!(entry(a, 3 + i, 3 + j), expected);
            }
        }
        assert!(body.rhs().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_malformed_precompute() {
        assert!(matches!(
            BodyPrecompute::new(vec![0.0; 6], vec![0.0; 3], vec![1.0, 1.0]),
            Err(Error::MalformedPrecompute(_))
        ));
        assert!(matches!(
            BodyPrecompute::new(vec![0.0; 3], vec![0.0; 3], vec![0.0]),
            Err(Error::MalformedPrecompute(_))
        ));
    }

    #[test]
    fn test_stale_operators_are_rejected() {
        let mut body = Body::new(
            BodyPrecompute::sphere(20, 1.0).unwrap(),
            [0.0; 3],
            UnitQuaternion::identity(),
            BodyShape::Spherical { radius: 1.0 },
        );
        assert!(matches!(body.operator(), Err(Error::StaleOperator(0))));
        body.update_cache_variables(1.0, &KernelOptions::default())
            .unwrap();
        assert!(body.apply_preconditioner(&vec![0.0; 66]).is_ok());

        body.move_to([1.0, 0.0, 0.0], UnitQuaternion::identity());
        assert!(!body.is_cache_valid());
        assert!(matches!(
            body.matvec(&vec![0.0; 66], &vec![0.0; 60]),
            Err(Error::StaleOperator(0))
        ));
    }

    #[test]
    fn test_rigid_rotation_velocity() {
        let mut body = Body::new(
            BodyPrecompute::sphere(10, 2.0).unwrap(),
            [1.0, -1.0, 0.5],
            UnitQuaternion::identity(),
            BodyShape::Generic,
        );
        body.update_cache_variables(1.0, &KernelOptions::default())
            .unwrap();
        let v = body
            .rigid_velocity(&[0.0, 0.0, 0.0, 0.0, 0.0, 1.0])
            .unwrap();
        for i in 0..10 {
            let r = [
                body.node_positions()[3 * i] - 1.0,
                body.node_positions()[3 * i + 1] + 1.0,
            ];
            assert_relative_eq!(v[3 * i], -r[1], epsilon = 1e-12);
            assert_relative_eq!(v[3 * i + 1], r[0], epsilon = 1e-12);
            assert_relative_eq!(v[3 * i + 2], 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_nucleation_sites_follow_pose() {
        let precompute = BodyPrecompute::sphere(20, 1.0)
            .unwrap()
            .with_nucleation_sites(vec![1.0, 0.0, 0.0, 0.0, 0.0, -1.0])
            .unwrap();
        let mut body = Body::new(
            precompute,
            [0.0; 3],
            UnitQuaternion::identity(),
            BodyShape::Spherical { radius: 1.0 },
        );
        assert_eq!(body.n_nucleation_sites(), 2);
        assert_eq!(body.nucleation_site(0).unwrap(), [1.0, 0.0, 0.0]);

        let quarter_turn = UnitQuaternion::from_axis_angle(
            &Vector3::z_axis(),
            std::f64::consts::FRAC_PI_2,
        );
        body.move_to([2.0, 0.0, 1.0], quarter_turn);
        let site = body.nucleation_site(0).unwrap();
        assert_relative_eq!(site[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(site[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(site[2], 1.0, epsilon = 1e-12);
        let site = body.nucleation_site(1).unwrap();
        assert_relative_eq!(site[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(site[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(site[2], 0.0, epsilon = 1e-12);

        assert!(matches!(
            body.nucleation_site(2),
            Err(Error::IndexOutOfRange { index: 2, len: 2, .. })
        ));
        assert!(matches!(
            BodyPrecompute::sphere(4, 1.0)
                .unwrap()
                .with_nucleation_sites(vec![0.0; 4]),
            Err(Error::MalformedPrecompute(_))
        ));
    }
}
