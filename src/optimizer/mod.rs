//! Active-set solver for quadratic programs over Gaussian factor graphs.
//!
//! A problem is a [`GaussianFactorGraph`](crate::core::GaussianFactorGraph) whose cost factors
//! (Hessian factors and least-squares Jacobian factors) define a convex quadratic objective and
//! whose constraint factors carry linear equality and inequality rows:
//!
//! ```text
//! min  ½ xᵀGx − xᵀg + ½f
//! s.t. a_r·x = b_r   (equality rows)
//!      a_r·x ≤ b_r   (inequality rows)
//! ```
//!
//! The solver keeps a working set of inequality rows enforced as equalities, solves the
//! equality-constrained sub-problem by graph elimination, and either steps towards its solution
//! or adjusts the working set using Lagrange multipliers recovered from a dual graph.
//!
//! - [`constraints`]: classification of constraint factors and the [`WorkingSet`]
//! - [`dual`]: dual graph construction and multiplier-based row selection
//! - [`active_set`]: the [`QpSolver`] iterator and driver

use std::fmt::{self, Display, Formatter};

use thiserror::Error;
use tracing::{debug, error};
use web_time as time;

use crate::core::{CoreError, Key, VectorValues};
use crate::factors::FactorError;
use crate::linalg;

pub mod active_set;
pub mod constraints;
pub mod dual;

pub use active_set::{IterationOutcome, QpSolver, QpSolverConfig};
pub use constraints::{
    ConstraintRow, WorkingSet, constraint_indices, equality_indices, inequality_rows, row_kind,
};
pub use dual::{build_dual_graph, check_active_rank, find_worst_violated_active_ineq};

// Re-export observer types from the observers module
pub use crate::observers::{QpObserver, QpObserverVec};

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// The initial assignment violates a constraint row
    #[error(
        "Initial values violate row {row} of constraint factor {factor} by {violation:.6e}"
    )]
    InfeasibleStart {
        factor: usize,
        row: usize,
        violation: f64,
    },

    /// Equality and working-set rows are linearly dependent
    #[error("Active constraint rows are linearly dependent: rank {rank} < {rows} rows")]
    DegenerateActiveSet { rank: usize, rows: usize },

    /// Maximum iterations reached without achieving convergence
    #[error("Maximum iterations ({max_iters}) reached without convergence")]
    MaxIterationsReached { max_iters: usize },

    /// A working set was revisited at a stationary point
    #[error("Active-set cycling detected at iteration {iteration}")]
    Cycling { iteration: usize },

    /// A caller-provided working set names something other than an inequality row
    #[error("Invalid working set: {0}")]
    InvalidWorkingSet(String),

    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),

    /// Graph or assignment error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Factor evaluation error
    #[error("Factor error: {0}")]
    Factor(#[from] FactorError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| OptimizerError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Status of a finished optimization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// KKT conditions hold with at least one active constraint row
    Converged,
    /// The unconstrained minimizer is feasible; no constraint row is active
    InteriorOptimum,
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::InteriorOptimum => write!(f, "Interior optimum"),
        }
    }
}

/// Per-iteration statistics for detailed logging.
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number (0-indexed)
    pub iteration: usize,
    /// Cost after the iteration
    pub cost: f64,
    /// Change in cost from the previous iteration
    pub cost_change: f64,
    /// Fraction of the step taken, `None` when the point did not move
    pub step_fraction: Option<f64>,
    /// Working set size after the iteration
    pub working_set_size: usize,
    /// What the iteration did to the working set
    pub action: String,
    /// Time taken for this iteration in milliseconds
    pub iter_time_ms: f64,
    /// Total elapsed time since optimization started in milliseconds
    pub total_time_ms: f64,
}

impl IterationStats {
    /// Print table header
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>8}  {:>6}  {:>18}  {:>11}  {:>13}",
            "iter", "cost", "cost_change", "alpha", "|W|", "action", "iter_time", "total_time"
        );
    }

    pub fn print_line(&self) {
        let alpha = self
            .step_fraction
            .map_or_else(|| "-".to_string(), |alpha| format!("{alpha:.4}"));
        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>8}  {:>6}  {:>18}  {:>9.2}ms  {:>11.2}ms",
            self.iteration,
            self.cost,
            self.cost_change,
            alpha,
            self.working_set_size,
            self.action,
            self.iter_time_ms,
            self.total_time_ms,
        );
    }
}

/// Result of a solver execution.
#[derive(Debug, Clone)]
pub struct QpSolverResult<K: Key = String> {
    /// Optimal primal assignment
    pub solution: VectorValues<K>,
    /// Multipliers at the optimum, keyed by constraint factor index
    pub duals: VectorValues<usize>,
    /// Inequality rows active at the optimum
    pub working_set: WorkingSet,
    /// Final optimization status
    pub status: OptimizationStatus,
    /// Cost at the initial assignment
    pub initial_cost: f64,
    /// Cost at the optimum
    pub final_cost: f64,
    /// Number of outer iterations performed
    pub iterations: usize,
    /// Total time elapsed
    pub elapsed_time: time::Duration,
}

impl<K: Key> Display for QpSolverResult<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Active-Set QP Final Result")?;
        writeln!(f, "{}", self.status)?;
        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(f, "  Reduction: {:.6e}", self.initial_cost - self.final_cost)?;
        writeln!(f)?;
        writeln!(f, "Iterations:    {}", self.iterations)?;
        writeln!(f, "Active rows:   {}", self.working_set)?;
        writeln!(
            f,
            "Total time:    {:.2}ms",
            self.elapsed_time.as_secs_f64() * 1000.0
        )?;
        Ok(())
    }
}
