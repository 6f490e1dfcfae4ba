//! Primal active-set method for convex quadratic programs.
//!
//! Every outer iteration solves the equality-constrained sub-problem made of the cost factors,
//! the equality rows, and the working-set inequality rows enforced as equalities:
//!
//! 1. If the sub-problem solution `p` differs from the current point, move towards it. The
//!    primal ratio test over the inactive inequality rows limits the step, and the first row
//!    reached joins the working set.
//! 2. If `p` equals the current point, the point is stationary for the working set. The
//!    multipliers of the active rows are recovered from the dual graph; a negative inequality
//!    multiplier means the objective improves by leaving that row, so it is dropped.
//! 3. With no negative multiplier left the KKT conditions hold and the point is optimal.
//!
//! # Example
//!
//! ```
//! use factor_qp::core::{GaussianFactorGraph, VectorValues};
//! use factor_qp::factors::{HessianFactor, JacobianFactor};
//! use factor_qp::optimizer::QpSolver;
//! use nalgebra::{DMatrix, dvector};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // min x² − 4x subject to x ≤ 1
//! let mut graph = GaussianFactorGraph::new();
//! graph.push(HessianFactor::unary(
//!     "x".to_string(),
//!     DMatrix::from_element(1, 1, 2.0),
//!     dvector![4.0],
//!     0.0,
//! )?);
//! graph.push(JacobianFactor::inequality(
//!     vec![("x".to_string(), DMatrix::from_element(1, 1, 1.0))],
//!     dvector![1.0],
//! )?);
//!
//! let mut initial = VectorValues::new();
//! initial.insert("x".to_string(), dvector![0.0]);
//!
//! let mut solver = QpSolver::new(graph);
//! let result = solver.optimize(&initial)?;
//! assert!((result.solution.try_get(&"x".to_string())?[0] - 1.0).abs() < 1e-9);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;

use tracing::{debug, warn};
use web_time as time;

use crate::core::{CoreError, GaussianFactorGraph, Key, VectorValues};
use crate::error::FactorQpResult;
use crate::factors::{ConstraintKind, GaussianFactor, LinearFactor};
use crate::linalg::{GraphEliminator, LinearSolverType, SparseEliminator};
use crate::observers::{QpObserver, QpObserverVec};
use crate::optimizer::{
    ConstraintRow, IterationStats, OptimizationStatus, OptimizerError, OptimizerResult,
    QpSolverResult, WorkingSet, check_active_rank, constraint_indices, dual, equality_indices,
    inequality_rows, row_kind,
};

/// Configuration parameters for the active-set QP solver.
///
/// ```
/// use factor_qp::linalg::LinearSolverType;
/// use factor_qp::optimizer::QpSolverConfig;
///
/// let config = QpSolverConfig::new()
///     .with_max_iterations(200)
///     .with_solution_tolerance(1e-8)
///     .with_linear_solver_type(LinearSolverType::SparseQR);
/// ```
#[derive(Debug, Clone)]
pub struct QpSolverConfig {
    /// Linear solver for unconstrained sub-problems and dual systems.
    ///
    /// Sub-problems with equality rows always go through sparse QR.
    pub linear_solver_type: LinearSolverType,
    /// Maximum number of outer iterations
    pub max_iterations: usize,
    /// Max-abs distance under which the sub-problem solution equals the current point
    pub solution_tolerance: f64,
    /// Constraint violation tolerated in the ratio test and the initial feasibility check
    pub feasibility_tolerance: f64,
    /// Multipliers below `-dual_tolerance` are dual infeasible
    pub dual_tolerance: f64,
    /// Relative singular value threshold of the active-row rank check
    pub rank_tolerance: f64,
    /// Reject infeasible initial values
    pub check_initial_feasibility: bool,
    /// Fail when a working set repeats at a stationary point
    pub detect_cycling: bool,
}

impl Default for QpSolverConfig {
    fn default() -> Self {
        Self {
            linear_solver_type: LinearSolverType::default(),
            max_iterations: 1000,
            solution_tolerance: 1e-5,
            feasibility_tolerance: 1e-9,
            dual_tolerance: 0.0,
            rank_tolerance: 1e-10,
            check_initial_feasibility: true,
            detect_cycling: true,
        }
    }
}

impl QpSolverConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the linear solver type
    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    /// Set the maximum number of iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the stationarity tolerance
    pub fn with_solution_tolerance(mut self, solution_tolerance: f64) -> Self {
        self.solution_tolerance = solution_tolerance;
        self
    }

    /// Set the feasibility tolerance
    pub fn with_feasibility_tolerance(mut self, feasibility_tolerance: f64) -> Self {
        self.feasibility_tolerance = feasibility_tolerance;
        self
    }

    /// Set the dual feasibility tolerance
    pub fn with_dual_tolerance(mut self, dual_tolerance: f64) -> Self {
        self.dual_tolerance = dual_tolerance;
        self
    }

    /// Set the rank tolerance
    pub fn with_rank_tolerance(mut self, rank_tolerance: f64) -> Self {
        self.rank_tolerance = rank_tolerance;
        self
    }

    /// Enable or disable the initial feasibility check.
    ///
    /// When disabled the caller guarantees a feasible start; the ratio test assumes it.
    pub fn with_initial_feasibility_check(mut self, enabled: bool) -> Self {
        self.check_initial_feasibility = enabled;
        self
    }

    /// Enable or disable working-set cycling detection
    pub fn with_cycling_detection(mut self, enabled: bool) -> Self {
        self.detect_cycling = enabled;
        self
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "\nConfiguration:\n  Solver:        Active-set QP\n  Linear solver: {}\n  Max iterations:        {}\n  Solution tolerance:    {:.2e}\n  Feasibility tolerance: {:.2e}\n  Dual tolerance:        {:.2e}\n  Rank tolerance:        {:.2e}\n  Initial feasibility:   {}\n  Cycling detection:     {}",
            self.linear_solver_type,
            self.max_iterations,
            self.solution_tolerance,
            self.feasibility_tolerance,
            self.dual_tolerance,
            self.rank_tolerance,
            if self.check_initial_feasibility {
                "checked"
            } else {
                "unchecked"
            },
            if self.detect_cycling {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
}

/// What one outer iteration did
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// The current point satisfies the KKT conditions
    Converged {
        /// Multipliers keyed by constraint factor index
        duals: VectorValues<usize>,
    },
    /// The point moved a fraction `alpha` towards the sub-problem solution.
    ///
    /// `blocking` is the row that stopped the step and joined the working set.
    StepTaken {
        alpha: f64,
        blocking: Option<ConstraintRow>,
    },
    /// The point was stationary and a row with a negative multiplier left the working set
    ConstraintDropped(ConstraintRow),
}

impl IterationOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, IterationOutcome::Converged { .. })
    }

    fn step_fraction(&self) -> Option<f64> {
        match self {
            IterationOutcome::StepTaken { alpha, .. } => Some(*alpha),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            IterationOutcome::Converged { .. } => "converged".to_string(),
            IterationOutcome::StepTaken {
                blocking: Some(row),
                ..
            } => format!("add {row}"),
            IterationOutcome::StepTaken { blocking: None, .. } => "full step".to_string(),
            IterationOutcome::ConstraintDropped(row) => format!("drop {row}"),
        }
    }
}

/// Active-set solver for a quadratic program stored as a Gaussian factor graph.
///
/// The solver owns its graph, which is never modified. Working sets and iterates belong to
/// the caller of [`QpSolver::iterate_in_place`] or to a single [`QpSolver::optimize`] call.
pub struct QpSolver<K: Key = String, E: GraphEliminator = SparseEliminator> {
    graph: GaussianFactorGraph<K>,
    constraint_indices: Vec<usize>,
    config: QpSolverConfig,
    eliminator: E,
    observers: QpObserverVec<K>,
}

impl<K: Key> QpSolver<K> {
    /// Create a solver with the default configuration
    pub fn new(graph: GaussianFactorGraph<K>) -> Self {
        Self::with_config(graph, QpSolverConfig::default())
    }

    pub fn with_config(graph: GaussianFactorGraph<K>, config: QpSolverConfig) -> Self {
        let eliminator = SparseEliminator::new(config.linear_solver_type);
        Self::with_eliminator(graph, config, eliminator)
    }
}

impl<K: Key, E: GraphEliminator> QpSolver<K, E> {
    /// Create a solver that eliminates sub-problems with a caller-provided eliminator
    pub fn with_eliminator(
        graph: GaussianFactorGraph<K>,
        config: QpSolverConfig,
        eliminator: E,
    ) -> Self {
        let constraint_indices = constraint_indices(&graph);
        Self {
            graph,
            constraint_indices,
            config,
            eliminator,
            observers: QpObserverVec::new(),
        }
    }

    pub fn graph(&self) -> &GaussianFactorGraph<K> {
        &self.graph
    }

    pub fn config(&self) -> &QpSolverConfig {
        &self.config
    }

    /// Factors carrying at least one inequality row, computed once at construction
    pub fn constraint_indices(&self) -> &[usize] {
        &self.constraint_indices
    }

    /// Add an observer notified after every outer iteration of [`QpSolver::optimize`]
    pub fn add_observer(&mut self, observer: impl QpObserver<K> + 'static) {
        self.observers.add(observer);
    }

    /// Equality-constrained sub-problem for `working_set`.
    ///
    /// Cost factors are kept as is. Each constraint factor contributes its equality rows and
    /// its working-set rows, all enforced as equalities; the remaining inequality rows are left
    /// out.
    pub fn build_working_graph(
        &self,
        working_set: &WorkingSet,
    ) -> OptimizerResult<GaussianFactorGraph<K>> {
        let mut working = GaussianFactorGraph::new();
        for (index, factor) in self.graph.enumerate() {
            let Some(constraint) = factor.as_constraint() else {
                working.push(factor.clone());
                continue;
            };
            let mut rows: Vec<usize> = constraint.equality_rows().collect();
            rows.extend(working_set.rows_of(index));
            rows.sort_unstable();
            rows.dedup();
            if rows.is_empty() {
                continue;
            }
            working.push(constraint.select_rows(&rows, ConstraintKind::Equality)?);
        }
        Ok(working)
    }

    /// Dual graph of the active rows at `values`, see [`dual::build_dual_graph`]
    pub fn build_dual_graph(
        &self,
        working_set: &WorkingSet,
        values: &VectorValues<K>,
    ) -> OptimizerResult<GaussianFactorGraph<usize>> {
        dual::build_dual_graph(&self.graph, working_set, values)
    }

    /// Multipliers of the equality and working-set rows at `values`.
    ///
    /// Keys are constraint factor indices. Factors without an active row are absent.
    pub fn compute_duals(
        &mut self,
        working_set: &WorkingSet,
        values: &VectorValues<K>,
    ) -> OptimizerResult<VectorValues<usize>> {
        check_active_rank(&self.graph, working_set, self.config.rank_tolerance)?;
        let dual_graph = self.build_dual_graph(working_set, values)?;
        if dual_graph.is_empty() {
            return Ok(VectorValues::new());
        }
        Ok(self.eliminator.eliminate(&dual_graph)?)
    }

    /// Working-set inequality row with the most negative multiplier, if any is below
    /// `-dual_tolerance`
    pub fn find_worst_violated_active_ineq(
        &self,
        working_set: &WorkingSet,
        duals: &VectorValues<usize>,
    ) -> Option<ConstraintRow> {
        dual::find_worst_violated_active_ineq(
            &self.graph,
            working_set,
            duals,
            self.config.dual_tolerance,
        )
    }

    /// Same as [`QpSolver::find_worst_violated_active_ineq`], returning `(factor, row)` or
    /// `(-1, -1)` when the multipliers are dual feasible
    pub fn find_worst_violated_active_ineq_indices(
        &self,
        working_set: &WorkingSet,
        duals: &VectorValues<usize>,
    ) -> (isize, isize) {
        self.find_worst_violated_active_ineq(working_set, duals)
            .and_then(|row| {
                Some((
                    isize::try_from(row.factor).ok()?,
                    isize::try_from(row.row).ok()?,
                ))
            })
            .unwrap_or((-1, -1))
    }

    /// Primal ratio test from `current` towards `candidate`.
    ///
    /// Returns the inactive inequality row reached first along the segment together with the
    /// step fraction, or `None` when `candidate` is feasible. Ties keep the first row in
    /// factor then row order.
    pub fn compute_step_size(
        &self,
        working_set: &WorkingSet,
        current: &VectorValues<K>,
        candidate: &VectorValues<K>,
    ) -> OptimizerResult<Option<(ConstraintRow, f64)>> {
        let mut blocking: Option<(ConstraintRow, f64)> = None;
        for row in inequality_rows(&self.graph) {
            if working_set.contains(&row) {
                continue;
            }
            let Some(constraint) = self.graph.at(row.factor).and_then(|f| f.as_constraint())
            else {
                continue;
            };
            let rhs = constraint.rhs()[row.row];
            let slack_after = rhs - constraint.row_value(row.row, candidate)?;
            if slack_after >= -self.config.feasibility_tolerance {
                continue;
            }
            let slack_before = rhs - constraint.row_value(row.row, current)?;
            let denominator = slack_before - slack_after;
            let alpha = if denominator > 0.0 {
                (slack_before / denominator).clamp(0.0, 1.0)
            } else {
                0.0
            };
            if blocking.is_none_or(|(_, best)| alpha < best) {
                blocking = Some((row, alpha));
            }
        }
        Ok(blocking)
    }

    /// Run one outer iteration, updating `working_set` and `current` in place.
    pub fn iterate(
        &mut self,
        working_set: &mut WorkingSet,
        current: &mut VectorValues<K>,
    ) -> OptimizerResult<IterationOutcome> {
        check_active_rank(&self.graph, working_set, self.config.rank_tolerance)?;
        let working_graph = self.build_working_graph(working_set)?;
        let solution = self.eliminator.eliminate(&working_graph)?;

        let mut candidate = current.clone();
        candidate.update(&solution);

        if let Some((row, alpha)) = self.compute_step_size(working_set, current, &candidate)? {
            current.step_towards(&candidate, alpha)?;
            working_set.insert(row);
            debug!("Step blocked by {} at alpha = {:.6}", row, alpha);
            return Ok(IterationOutcome::StepTaken {
                alpha,
                blocking: Some(row),
            });
        }

        // A feasible sub-problem solution is always taken, even when it lies within
        // `solution_tolerance` of the current point
        let stationary = current.max_abs_diff(&candidate)? <= self.config.solution_tolerance;
        current.update(&candidate);
        if !stationary {
            return Ok(IterationOutcome::StepTaken {
                alpha: 1.0,
                blocking: None,
            });
        }

        let duals = self.compute_duals(working_set, current)?;
        Ok(match self.find_worst_violated_active_ineq(working_set, &duals) {
            None => IterationOutcome::Converged { duals },
            Some(row) => {
                working_set.remove(&row);
                debug!("Dropping {} from the working set", row);
                IterationOutcome::ConstraintDropped(row)
            }
        })
    }

    /// Run one outer iteration; `Ok(true)` when `current` is optimal.
    ///
    /// At an optimum `current` only moves onto the sub-problem solution, which is within
    /// `solution_tolerance` of it.
    pub fn iterate_in_place(
        &mut self,
        working_set: &mut WorkingSet,
        current: &mut VectorValues<K>,
    ) -> OptimizerResult<bool> {
        Ok(self.iterate(working_set, current)?.is_converged())
    }

    /// Solve the QP from a feasible initial assignment with an empty working set
    pub fn optimize(&mut self, initial: &VectorValues<K>) -> FactorQpResult<QpSolverResult<K>> {
        self.optimize_with_working_set(initial, WorkingSet::new())
    }

    /// Solve the QP from a feasible initial assignment and a caller-chosen working set
    pub fn optimize_with_working_set(
        &mut self,
        initial: &VectorValues<K>,
        mut working_set: WorkingSet,
    ) -> FactorQpResult<QpSolverResult<K>> {
        let start_time = time::Instant::now();

        self.validate_working_set(&working_set)?;
        let mut current = self.restrict_to_graph(initial)?;
        if self.config.check_initial_feasibility {
            self.check_feasibility(&current)?;
        }

        let initial_cost = self.graph.error(&current)?;
        let mut previous_cost = initial_cost;
        let mut stationary_sets: BTreeSet<WorkingSet> = BTreeSet::new();

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
            IterationStats::print_header();
        }

        for iteration in 0..self.config.max_iterations {
            let iter_start = time::Instant::now();
            let working_set_before = working_set.clone();

            let outcome = self.iterate(&mut working_set, &mut current)?;
            let cost = self.graph.error(&current)?;
            let step_fraction = outcome.step_fraction();

            if tracing::enabled!(tracing::Level::DEBUG) {
                let stats = IterationStats {
                    iteration,
                    cost,
                    cost_change: previous_cost - cost,
                    step_fraction,
                    working_set_size: working_set.len(),
                    action: outcome.describe(),
                    iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                    total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                };
                stats.print_line();
            }
            previous_cost = cost;

            self.observers.set_iteration_metrics(cost, step_fraction);
            self.observers.notify(&current, &working_set, iteration);

            match outcome {
                IterationOutcome::Converged { duals } => {
                    let status = if working_set.is_empty()
                        && equality_indices(&self.graph).is_empty()
                    {
                        OptimizationStatus::InteriorOptimum
                    } else {
                        OptimizationStatus::Converged
                    };
                    let result = QpSolverResult {
                        solution: current,
                        duals,
                        working_set,
                        status,
                        initial_cost,
                        final_cost: cost,
                        iterations: iteration + 1,
                        elapsed_time: start_time.elapsed(),
                    };
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        debug!("{}", result);
                    }
                    return Ok(result);
                }
                IterationOutcome::ConstraintDropped(_) if self.config.detect_cycling => {
                    if !stationary_sets.insert(working_set_before) {
                        return Err(OptimizerError::Cycling { iteration }.log().into());
                    }
                }
                _ => {}
            }
        }

        Err(OptimizerError::MaxIterationsReached {
            max_iters: self.config.max_iterations,
        }
        .log()
        .into())
    }

    /// Hessian factors touching a variable that appears in any constraint factor.
    ///
    /// Factors keep their graph order and have their constant term reset to zero.
    pub fn free_hessians_of_constrained_vars(&self) -> GaussianFactorGraph<K> {
        let constrained_keys: BTreeSet<&K> = self
            .graph
            .iter()
            .filter_map(|factor| factor.as_constraint())
            .flat_map(|constraint| constraint.keys())
            .collect();

        self.graph
            .iter()
            .filter_map(|factor| factor.as_hessian())
            .filter(|hessian| hessian.keys().iter().any(|key| constrained_keys.contains(key)))
            .map(|hessian| GaussianFactor::from(hessian.with_constant_term(0.0)))
            .collect()
    }

    fn validate_working_set(&self, working_set: &WorkingSet) -> OptimizerResult<()> {
        for row in working_set {
            if row_kind(&self.graph, row) != Some(ConstraintKind::Inequality) {
                return Err(OptimizerError::InvalidWorkingSet(format!(
                    "{row} is not an inequality row of the graph"
                ))
                .log());
            }
        }
        Ok(())
    }

    /// Copy of `initial` holding exactly the keys of the graph
    fn restrict_to_graph(&self, initial: &VectorValues<K>) -> OptimizerResult<VectorValues<K>> {
        let dimensions = self.graph.key_dimensions()?;
        let mut values = VectorValues::new();
        for (key, dim) in dimensions {
            let value = initial
                .get(&key)
                .ok_or_else(|| CoreError::MissingValue(key.to_string()).log())?;
            if value.len() != dim {
                return Err(CoreError::DimensionMismatch(format!(
                    "initial value of {key} has dimension {} but the graph uses {dim}",
                    value.len()
                ))
                .log()
                .into());
            }
            values.insert(key, value.clone());
        }
        let extra = initial.len().saturating_sub(values.len());
        if extra > 0 {
            warn!("Ignoring {} initial values for keys outside the graph", extra);
        }
        Ok(values)
    }

    fn check_feasibility(&self, values: &VectorValues<K>) -> OptimizerResult<()> {
        let tolerance = self.config.feasibility_tolerance;
        for (factor, constraint) in self
            .graph
            .enumerate()
            .filter_map(|(index, factor)| factor.as_constraint().map(|c| (index, c)))
        {
            let residual = constraint.residual(values)?;
            for (row, value) in residual.iter().enumerate() {
                let violation = match constraint.row_kind(row) {
                    Some(ConstraintKind::Equality) => value.abs(),
                    Some(ConstraintKind::Inequality) => *value,
                    None => continue,
                };
                if violation > tolerance {
                    return Err(OptimizerError::InfeasibleStart {
                        factor,
                        row,
                        violation,
                    }
                    .log());
                }
            }
        }
        Ok(())
    }
}
