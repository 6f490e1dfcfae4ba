//! Lagrange multiplier recovery.
//!
//! At a stationary point of the working sub-problem the multipliers of the active rows solve
//! the stationarity condition of the Lagrangian, one block row per primal variable `v`:
//!
//! ```text
//! ∇_v f(x) + Σ_{active inequality rows r} a_{r,v}ᵀ μ_r − Σ_{equality rows r} a_{r,v}ᵀ λ_r = 0
//! ```
//!
//! With this convention equality multipliers satisfy `∇f = Aᵀλ` and the multipliers of binding
//! inequality rows are non-negative at a KKT point. A negative `μ_r` means the objective
//! decreases by moving off row `r` into the interior.
//!
//! The condition is written as a least-squares graph whose keys are constraint factor indices.
//! Each key holds one multiplier per row of its factor; rows that are not active are pinned to
//! zero by unit prior rows so the system keeps full column rank.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::core::{GaussianFactorGraph, Key, VectorValues};
use crate::factors::{ConstraintKind, JacobianFactor, LinearFactor};
use crate::optimizer::{ConstraintRow, OptimizerError, OptimizerResult, WorkingSet};

/// Constraint factors taking part in the dual problem: every factor with an equality row and
/// every factor with a row in the working set.
fn participating_factors<K: Key>(
    graph: &GaussianFactorGraph<K>,
    working_set: &WorkingSet,
) -> Vec<usize> {
    let active_factors = working_set.factors();
    graph
        .enumerate()
        .filter(|(index, factor)| {
            factor.as_constraint().is_some_and(|constraint| {
                constraint.has_equality() || active_factors.contains(index)
            })
        })
        .map(|(index, _)| index)
        .collect()
}

/// Sign of a row's multiplier in the stationarity condition, `None` for inactive rows
fn row_sign(kind: Option<ConstraintKind>, in_working_set: bool) -> Option<f64> {
    match kind {
        Some(ConstraintKind::Equality) => Some(-1.0),
        Some(ConstraintKind::Inequality) if in_working_set => Some(1.0),
        _ => None,
    }
}

/// Check that the equality rows and working-set rows are linearly independent.
///
/// The rank is that of the dense stacked active-row matrix, counting singular values above
/// `rank_tolerance · max(1, σ_max)`.
pub fn check_active_rank<K: Key>(
    graph: &GaussianFactorGraph<K>,
    working_set: &WorkingSet,
    rank_tolerance: f64,
) -> OptimizerResult<()> {
    let dimensions = graph.key_dimensions()?;
    let mut offsets = BTreeMap::new();
    let mut total = 0;
    for (key, dim) in &dimensions {
        offsets.insert(key.clone(), total);
        total += dim;
    }

    let mut rows: Vec<DVector<f64>> = Vec::new();
    for index in participating_factors(graph, working_set) {
        let Some(constraint) = graph.at(index).and_then(|factor| factor.as_constraint()) else {
            continue;
        };
        for row in 0..constraint.rows() {
            let active = row_sign(
                constraint.row_kind(row),
                working_set.contains(&ConstraintRow::new(index, row)),
            );
            if active.is_none() {
                continue;
            }
            let mut dense = DVector::zeros(total);
            for (position, key) in constraint.keys().iter().enumerate() {
                let offset = offsets.get(key).copied().ok_or_else(|| {
                    OptimizerError::InvalidParameters(format!("key {key} has no dimension"))
                })?;
                dense
                    .rows_mut(offset, constraint.dimension_at(position))
                    .copy_from(&constraint.row_coefficients(row, position));
            }
            rows.push(dense);
        }
    }

    if rows.is_empty() {
        return Ok(());
    }

    let count = rows.len();
    let matrix = DMatrix::from_fn(count, total, |i, j| rows[i][j]);
    let singular_values = matrix.svd(false, false).singular_values;
    let largest = singular_values.iter().copied().fold(0.0_f64, f64::max);
    let threshold = rank_tolerance * largest.max(1.0);
    let rank = singular_values.iter().filter(|&&s| s > threshold).count();

    if rank < count {
        return Err(OptimizerError::DegenerateActiveSet { rank, rows: count }.log());
    }
    Ok(())
}

/// Build the least-squares graph whose solution holds the multipliers of the active rows.
///
/// Keys of the returned graph are the indices of participating constraint factors. The caller
/// is responsible for linear independence of the active rows, see [`check_active_rank`].
pub fn build_dual_graph<K: Key>(
    graph: &GaussianFactorGraph<K>,
    working_set: &WorkingSet,
    values: &VectorValues<K>,
) -> OptimizerResult<GaussianFactorGraph<usize>> {
    let participating = participating_factors(graph, working_set);
    let mut dual = GaussianFactorGraph::new();
    if participating.is_empty() {
        return Ok(dual);
    }

    let gradient = graph.gradient(values)?;

    // Stationarity of the Lagrangian, one factor per primal variable
    for (key, key_gradient) in gradient.iter() {
        let mut terms: Vec<(usize, DMatrix<f64>)> = Vec::new();
        for &index in &participating {
            let Some(constraint) = graph.at(index).and_then(|factor| factor.as_constraint())
            else {
                continue;
            };
            let Some(position) = constraint.keys().iter().position(|k| k == key) else {
                continue;
            };
            let mut block = DMatrix::zeros(key_gradient.len(), constraint.rows());
            for row in 0..constraint.rows() {
                let sign = row_sign(
                    constraint.row_kind(row),
                    working_set.contains(&ConstraintRow::new(index, row)),
                );
                if let Some(sign) = sign {
                    block
                        .column_mut(row)
                        .copy_from(&(constraint.row_coefficients(row, position) * sign));
                }
            }
            terms.push((index, block));
        }
        if terms.is_empty() {
            continue;
        }
        dual.push(JacobianFactor::new(terms, -key_gradient)?);
    }

    // Inactive rows of participating factors have zero multipliers
    for &index in &participating {
        let Some(constraint) = graph.at(index).and_then(|factor| factor.as_constraint()) else {
            continue;
        };
        for row in 0..constraint.rows() {
            let sign = row_sign(
                constraint.row_kind(row),
                working_set.contains(&ConstraintRow::new(index, row)),
            );
            if sign.is_none() {
                let mut selector = DMatrix::zeros(1, constraint.rows());
                selector[(0, row)] = 1.0;
                dual.push(JacobianFactor::new(
                    vec![(index, selector)],
                    DVector::zeros(1),
                )?);
            }
        }
    }

    debug!(
        "Dual graph: {} factors over {} constraint factors",
        dual.len(),
        participating.len()
    );
    Ok(dual)
}

/// Find the working-set inequality row with the most negative multiplier.
///
/// Only multipliers strictly below `-dual_tolerance` count as violations; on ties the first row
/// in factor then row order wins. Rows without a multiplier in `duals` are skipped. `None`
/// means the multipliers are dual feasible.
pub fn find_worst_violated_active_ineq<K: Key>(
    graph: &GaussianFactorGraph<K>,
    working_set: &WorkingSet,
    duals: &VectorValues<usize>,
    dual_tolerance: f64,
) -> Option<ConstraintRow> {
    let mut worst: Option<(ConstraintRow, f64)> = None;
    for row in working_set {
        let is_inequality = graph
            .at(row.factor)
            .and_then(|factor| factor.as_constraint())
            .and_then(|constraint| constraint.row_kind(row.row))
            == Some(ConstraintKind::Inequality);
        if !is_inequality {
            continue;
        }
        let Some(multiplier) = duals
            .get(&row.factor)
            .and_then(|lambdas| lambdas.get(row.row).copied())
        else {
            continue;
        };
        if multiplier < -dual_tolerance
            && worst.is_none_or(|(_, worst_value)| multiplier < worst_value)
        {
            worst = Some((*row, multiplier));
        }
    }
    worst.map(|(row, _)| row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::HessianFactor;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn scalar(value: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, value)
    }

    fn key(name: &str) -> String {
        name.to_string()
    }

    /// x1² − x1·x2 + x2² − 3·x1 with the four inequality rows of one factor
    fn canonical_graph() -> Result<GaussianFactorGraph, Box<dyn std::error::Error>> {
        let mut graph = GaussianFactorGraph::new();
        graph.push(HessianFactor::binary(
            key("x1"),
            key("x2"),
            scalar(2.0),
            scalar(-1.0),
            dvector![3.0],
            scalar(2.0),
            dvector![0.0],
            10.0,
        )?);
        graph.push(JacobianFactor::inequality(
            vec![
                (key("x1"), DMatrix::from_column_slice(4, 1, &[1.0, -1.0, 0.0, 1.0])),
                (key("x2"), DMatrix::from_column_slice(4, 1, &[1.0, 0.0, -1.0, 0.0])),
            ],
            dvector![2.0, 0.0, 0.0, 1.5],
        )?);
        Ok(graph)
    }

    fn point(x1: f64, x2: f64) -> VectorValues {
        [(key("x1"), dvector![x1]), (key("x2"), dvector![x2])]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_equality_multiplier() -> TestResult {
        // x1² + x2² subject to x1 + x2 = 1, evaluated at (1, 1)
        let mut graph = GaussianFactorGraph::new();
        graph.push(HessianFactor::binary(
            key("x1"),
            key("x2"),
            scalar(2.0),
            scalar(0.0),
            dvector![0.0],
            scalar(2.0),
            dvector![0.0],
            0.0,
        )?);
        graph.push(JacobianFactor::equality(
            vec![(key("x1"), scalar(1.0)), (key("x2"), scalar(1.0))],
            dvector![1.0],
        )?);

        let dual = build_dual_graph(&graph, &WorkingSet::new(), &point(1.0, 1.0))?;
        let duals = dual.optimize()?;
        assert_eq!(duals.len(), 1);
        assert!((duals.try_get(&1)?[0] - 2.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_active_inequality_multiplier() -> TestResult {
        let graph = canonical_graph()?;
        let working_set: WorkingSet = [ConstraintRow::new(1, 0)].into_iter().collect();

        let dual = build_dual_graph(&graph, &working_set, &point(1.5, 0.5))?;
        let duals = dual.optimize()?;
        let multipliers = duals.try_get(&1)?;
        assert_eq!(multipliers.len(), 4);
        assert!((multipliers[0] - 0.5).abs() < 1e-9);
        for row in 1..4 {
            assert!(multipliers[row].abs() < 1e-9, "inactive row {row} must be zero");
        }
        Ok(())
    }

    #[test]
    fn test_no_active_constraints_gives_empty_dual() -> TestResult {
        let graph = canonical_graph()?;
        let dual = build_dual_graph(&graph, &WorkingSet::new(), &point(0.0, 0.0))?;
        assert!(dual.is_empty());
        assert!(dual.optimize()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_worst_violated_row() -> TestResult {
        let graph = canonical_graph()?;
        let working_set: WorkingSet = (0..4).map(|row| ConstraintRow::new(1, row)).collect();

        let mut duals = VectorValues::new();
        duals.insert(1, dvector![0.5, 0.0, -0.3, 0.1]);
        assert_eq!(
            find_worst_violated_active_ineq(&graph, &working_set, &duals, 0.0),
            Some(ConstraintRow::new(1, 2))
        );

        duals.insert(1, dvector![0.5, -0.7, -0.3, 0.1]);
        assert_eq!(
            find_worst_violated_active_ineq(&graph, &working_set, &duals, 0.0),
            Some(ConstraintRow::new(1, 1))
        );
        Ok(())
    }

    #[test]
    fn test_dual_feasible_and_ties() -> TestResult {
        let graph = canonical_graph()?;
        let working_set: WorkingSet = (0..4).map(|row| ConstraintRow::new(1, row)).collect();

        let mut duals = VectorValues::new();
        duals.insert(1, dvector![0.5, 0.0, 0.0, 0.1]);
        assert_eq!(
            find_worst_violated_active_ineq(&graph, &working_set, &duals, 0.0),
            None
        );

        duals.insert(1, dvector![-0.2, 0.0, -0.2, 0.1]);
        assert_eq!(
            find_worst_violated_active_ineq(&graph, &working_set, &duals, 0.0),
            Some(ConstraintRow::new(1, 0)),
            "first row wins on ties"
        );

        // Within tolerance counts as feasible
        assert_eq!(
            find_worst_violated_active_ineq(&graph, &working_set, &duals, 0.5),
            None
        );

        // Rows missing from the dual solution are skipped
        assert_eq!(
            find_worst_violated_active_ineq(&graph, &working_set, &VectorValues::new(), 0.0),
            None
        );
        Ok(())
    }

    #[test]
    fn test_rank_check() -> TestResult {
        let graph = canonical_graph()?;

        let independent: WorkingSet = [ConstraintRow::new(1, 0), ConstraintRow::new(1, 3)]
            .into_iter()
            .collect();
        check_active_rank(&graph, &independent, 1e-10)?;

        // Three active rows on two variables cannot be independent
        let degenerate: WorkingSet = (0..3).map(|row| ConstraintRow::new(1, row)).collect();
        assert!(matches!(
            check_active_rank(&graph, &degenerate, 1e-10),
            Err(OptimizerError::DegenerateActiveSet { rank: 2, rows: 3 })
        ));
        Ok(())
    }
}
