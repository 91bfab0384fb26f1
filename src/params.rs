//! Simulation parameters consumed by the operators.
//!
//! Parsing of input files happens outside this crate. The structures here only
//! carry values and check that they are in range.

use crate::types::{Error, Result};

/// Options of the hierarchical (treecode) kernel evaluator.
#[derive(Debug, Clone)]
pub struct TreecodeOptions {
    /// Opening angle: a cluster of radius `r` is approximated at distance `d` if `r < theta * d`.
    theta: f64,
    /// Degree of the tensor Chebyshev interpolant per cluster.
    degree: usize,
    /// Maximum number of sources in a leaf cluster.
    max_leaf_size: usize,
}

impl Default for TreecodeOptions {
    fn default() -> Self {
        Self {
            theta: 0.5,
            degree: 6,
            max_leaf_size: 64,
        }
    }
}

impl TreecodeOptions {
    /// Opening angle.
    pub fn theta(&self) -> f64 {
        self.theta
    }

    /// Interpolation degree.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Maximum leaf size.
    pub fn max_leaf_size(&self) -> usize {
        self.max_leaf_size
    }

    /// Set the opening angle.
    pub fn set_theta(&mut self, theta: f64) -> &mut Self {
        self.theta = theta;
        self
    }

    /// Set the interpolation degree.
    pub fn set_degree(&mut self, degree: usize) -> &mut Self {
        self.degree = degree;
        self
    }

    /// Set the maximum leaf size.
    pub fn set_max_leaf_size(&mut self, max_leaf_size: usize) -> &mut Self {
        self.max_leaf_size = max_leaf_size;
        self
    }

    /// Number of proxy points per cluster.
    pub fn proxy_count(&self) -> usize {
        (self.degree + 1).pow(3)
    }

    fn validate(&self) -> Result<()> {
        if !(self.theta > 0.0 && self.theta < 1.0) {
            return Err(Error::InvalidParameter(format!(
                "treecode theta must lie in (0, 1), got {}",
                self.theta
            )));
        }
        if self.degree == 0 {
            return Err(Error::InvalidParameter(
                "treecode degree must be at least 1".to_string(),
            ));
        }
        if self.max_leaf_size == 0 {
            return Err(Error::InvalidParameter(
                "treecode leaf size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options shared by all Stokes kernel evaluations.
#[derive(Debug, Clone)]
pub struct KernelOptions {
    /// Regularization length used below `epsilon_distance`.
    regularization: f64,
    /// Distance below which the regularized kernels are used.
    epsilon_distance: f64,
    /// Direct evaluation is used while `sources * targets <= direct_crossover^2`.
    direct_crossover: usize,
    /// Parallelize evaluations over targets.
    use_multithreaded: bool,
    /// Options of the accelerated evaluator.
    treecode: TreecodeOptions,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            regularization: 5e-3,
            epsilon_distance: 1e-10,
            direct_crossover: 4096,
            use_multithreaded: true,
            treecode: TreecodeOptions::default(),
        }
    }
}

impl KernelOptions {
    /// Regularization length.
    pub fn regularization(&self) -> f64 {
        self.regularization
    }

    /// Regularization threshold distance.
    pub fn epsilon_distance(&self) -> f64 {
        self.epsilon_distance
    }

    /// Crossover between direct and accelerated evaluation.
    pub fn direct_crossover(&self) -> usize {
        self.direct_crossover
    }

    /// Whether evaluations are multithreaded.
    pub fn use_multithreaded(&self) -> bool {
        self.use_multithreaded
    }

    /// Treecode options.
    pub fn treecode(&self) -> &TreecodeOptions {
        &self.treecode
    }

    /// Mutable treecode options.
    pub fn treecode_mut(&mut self) -> &mut TreecodeOptions {
        &mut self.treecode
    }

    /// Set the regularization length.
    pub fn set_regularization(&mut self, regularization: f64) -> &mut Self {
        self.regularization = regularization;
        self
    }

    /// Set the regularization threshold distance.
    pub fn set_epsilon_distance(&mut self, epsilon_distance: f64) -> &mut Self {
        self.epsilon_distance = epsilon_distance;
        self
    }

    /// Set the crossover between direct and accelerated evaluation.
    pub fn set_direct_crossover(&mut self, direct_crossover: usize) -> &mut Self {
        self.direct_crossover = direct_crossover;
        self
    }

    /// Enable or disable multithreading.
    pub fn set_use_multithreaded(&mut self, use_multithreaded: bool) -> &mut Self {
        self.use_multithreaded = use_multithreaded;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.regularization >= 0.0) || !(self.epsilon_distance >= 0.0) {
            return Err(Error::InvalidParameter(format!(
                "regularization ({}) and epsilon distance ({}) must be non-negative",
                self.regularization, self.epsilon_distance
            )));
        }
        self.treecode.validate()
    }
}

/// Material and discretization constants of the fiber model.
#[derive(Debug, Clone)]
pub struct FiberOptions {
    /// Weight of the inextensibility penalty.
    penalty_param: f64,
    /// Coefficient of the implicit time derivative.
    beta_tstep: f64,
    /// Slenderness ratio (radius over length).
    slenderness: f64,
}

impl Default for FiberOptions {
    fn default() -> Self {
        Self {
            penalty_param: 500.0,
            beta_tstep: 1.0,
            slenderness: 1e-3,
        }
    }
}

impl FiberOptions {
    /// Inextensibility penalty.
    pub fn penalty_param(&self) -> f64 {
        self.penalty_param
    }

    /// Time derivative coefficient.
    pub fn beta_tstep(&self) -> f64 {
        self.beta_tstep
    }

    /// Slenderness ratio.
    pub fn slenderness(&self) -> f64 {
        self.slenderness
    }

    /// Set the inextensibility penalty.
    pub fn set_penalty_param(&mut self, penalty_param: f64) -> &mut Self {
        self.penalty_param = penalty_param;
        self
    }

    /// Set the time derivative coefficient.
    pub fn set_beta_tstep(&mut self, beta_tstep: f64) -> &mut Self {
        self.beta_tstep = beta_tstep;
        self
    }

    /// Set the slenderness ratio.
    pub fn set_slenderness(&mut self, slenderness: f64) -> &mut Self {
        self.slenderness = slenderness;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.slenderness > 0.0 && self.slenderness < 1.0) {
            return Err(Error::InvalidParameter(format!(
                "fiber slenderness must lie in (0, 1), got {}",
                self.slenderness
            )));
        }
        if !(self.beta_tstep > 0.0) || !(self.penalty_param >= 0.0) {
            return Err(Error::InvalidParameter(format!(
                "fiber beta_tstep ({}) must be positive and penalty ({}) non-negative",
                self.beta_tstep, self.penalty_param
            )));
        }
        Ok(())
    }
}

/// Top level parameters.
#[derive(Debug, Clone)]
pub struct Parameters {
    /// Fluid viscosity.
    pub eta: f64,
    /// Timestep size.
    pub dt: f64,
    /// Kernel options.
    pub kernel: KernelOptions,
    /// Fiber options.
    pub fiber: FiberOptions,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            eta: 1.0,
            dt: 0.005,
            kernel: KernelOptions::default(),
            fiber: FiberOptions::default(),
        }
    }
}

impl Parameters {
    /// Check that all values are in range.
    pub fn validate(&self) -> Result<()> {
        if !(self.eta > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "viscosity must be positive, got {}",
                self.eta
            )));
        }
        if !(self.dt > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "timestep must be positive, got {}",
                self.dt
            )));
        }
        self.kernel.validate()?;
        self.fiber.validate()
    }
}
