//! Types specific to stokes-mobility

/// Error type for operator construction and application.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Boundary conditions at one fiber end do not form a translational/rotational pair.
    #[error("Incompatible boundary conditions at {end} end: {first} and {second}")]
    IncompatibleBoundaryConditions {
        /// Fiber end.
        end: FiberEnd,
        /// First condition of the pair.
        first: &'static str,
        /// Second condition of the pair.
        second: &'static str,
    },
    /// Precomputed geometry or operator data is missing or inconsistent.
    #[error("Malformed precompute data: {0}")]
    MalformedPrecompute(String),
    /// An input does not have the size implied by the discretization.
    #[error("Size mismatch for {what}: expected {expected}, found {found}")]
    SizeMismatch {
        /// Description of the mismatched quantity.
        what: &'static str,
        /// Expected length.
        expected: usize,
        /// Actual length.
        found: usize,
    },
    /// An index does not refer to an existing item.
    #[error("Index {index} out of range for {what} with {len} entries")]
    IndexOutOfRange {
        /// Kind of item indexed.
        what: &'static str,
        /// Requested index.
        index: usize,
        /// Number of items.
        len: usize,
    },
    /// A collision test was requested for a pair of shapes with no implementation.
    #[error("Collision test undefined for shape pair ({0}, {1})")]
    UnsupportedShapePair(&'static str, &'static str),
    /// A fiber operation was called before its prerequisites were computed.
    #[error("Fiber operation `{operation}` requires stage {required:?}, but fiber is at {current:?}")]
    StageOrder {
        /// Operation that was attempted.
        operation: &'static str,
        /// Minimum stage required.
        required: crate::fiber::FiberStage,
        /// Current stage.
        current: crate::fiber::FiberStage,
    },
    /// A body was moved and its cached operators were not refreshed.
    #[error("Cached operators of body {0} are stale, call update_cache_variables after moving it")]
    StaleOperator(usize),
    /// Inversion of a local operator failed.
    #[error("Factorization failed: {0}")]
    Factorization(String),
    /// A configuration value is out of range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// A collective operation failed.
    #[error("Communication error: {0}")]
    Communication(String),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Evaluation mode of a Stokes kernel.
///
/// - `Velocity`: three velocity components per target.
/// - `PressureVelocity`: pressure followed by the three velocity components per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalType {
    /// Velocity only.
    Velocity,
    /// Pressure and velocity.
    PressureVelocity,
}

impl EvalType {
    /// Number of values written per target.
    pub fn component_count(&self) -> usize {
        match self {
            EvalType::Velocity => 3,
            EvalType::PressureVelocity => 4,
        }
    }
}

/// The two ends of a fiber. The minus end is at arclength zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberEnd {
    /// Arclength zero.
    Minus,
    /// Arclength equal to the fiber length.
    Plus,
}

impl std::fmt::Display for FiberEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FiberEnd::Minus => write!(f, "minus"),
            FiberEnd::Plus => write!(f, "plus"),
        }
    }
}
