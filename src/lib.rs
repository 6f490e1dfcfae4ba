//! # factor-qp
//!
//! Active-set solver for convex quadratic programs expressed as Gaussian factor graphs.
//!
//! Quadratic costs are stored as Hessian factors or least-squares Jacobian factors; linear
//! equality and inequality constraints are Jacobian factors tagged per row with a
//! [`ConstraintKind`]. The solver repeatedly eliminates the equality-constrained sub-problem
//! defined by a working set of active inequality rows, and recovers Lagrange multipliers from a
//! dual factor graph to decide which rows to release.
//!
//! ## Features
//!
//! - **Factor-graph problem model**: Hessian, least-squares and constraint factors over
//!   vector-valued variables
//! - **Row-level working set**: a single constraint factor may carry many inequality rows
//! - **Dual recovery**: multipliers of equality and active inequality rows at every stationary
//!   point
//! - **Sparse linear algebra**: sub-problems are assembled into `faer` sparse matrices and
//!   solved with sparse Cholesky or sparse QR
//! - **Observers**: per-iteration hooks for tracing the primal iterates and working sets
//!
//! ## Example
//!
//! ```
//! use factor_qp::{GaussianFactorGraph, HessianFactor, JacobianFactor, QpSolver, VectorValues};
//! use nalgebra::{DMatrix, dvector};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // min x1² − x1·x2 + x2² − 3·x1  s.t.  x1 + x2 ≤ 2, x1, x2 ≥ 0, x1 ≤ 1.5
//! let mut graph = GaussianFactorGraph::new();
//! graph.push(HessianFactor::binary(
//!     "x1".to_string(),
//!     "x2".to_string(),
//!     DMatrix::from_element(1, 1, 2.0),
//!     DMatrix::from_element(1, 1, -1.0),
//!     dvector![3.0],
//!     DMatrix::from_element(1, 1, 2.0),
//!     dvector![0.0],
//!     10.0,
//! )?);
//! graph.push(JacobianFactor::inequality(
//!     vec![
//!         ("x1".to_string(), DMatrix::from_column_slice(4, 1, &[1.0, -1.0, 0.0, 1.0])),
//!         ("x2".to_string(), DMatrix::from_column_slice(4, 1, &[1.0, 0.0, -1.0, 0.0])),
//!     ],
//!     dvector![2.0, 0.0, 0.0, 1.5],
//! )?);
//!
//! let initial: VectorValues = [("x1".to_string(), dvector![0.0]), ("x2".to_string(), dvector![0.0])]
//!     .into_iter()
//!     .collect();
//!
//! let result = QpSolver::new(graph).optimize(&initial)?;
//! assert!((result.solution.try_get(&"x1".to_string())?[0] - 1.5).abs() < 1e-9);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod factors;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod observers;
pub mod optimizer;

// Re-export core types
pub use core::{GaussianFactorGraph, Key, VectorValues, symbol};
pub use error::{FactorQpError, FactorQpResult};

// Re-export factor types
pub use factors::{ConstraintKind, GaussianFactor, HessianFactor, JacobianFactor, LinearFactor};

pub use linalg::{
    GraphEliminator, LinearSolverType, SparseCholeskySolver, SparseEliminator,
    SparseLinearSolver, SparseQRSolver,
};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level, init_test_logger};
pub use observers::TraceRecorder;
pub use optimizer::{
    ConstraintRow, OptimizationStatus, QpObserver, QpObserverVec, QpSolver, QpSolverConfig,
    QpSolverResult, WorkingSet,
};
