//! Solving Gaussian factor graphs as sparse linear systems.
//!
//! The eliminator stacks every factor into one system over the concatenated variable vector
//! (variables ordered by key):
//!
//! - **Least-squares graphs** (only least-squares Jacobian factors, e.g. dual graphs) are solved
//!   through the normal equation `JᵀJ x = Jᵀb`.
//! - **Unconstrained graphs** are solved as `H x = g`, where `H` and `g` collect the Hessian
//!   factors' information and the least-squares factors' `AᵀA`, `Aᵀb`.
//! - **Equality-constrained graphs** are solved through the KKT system
//!
//! ```text
//! [ H  Cᵀ ] [ x ]   [ g ]
//! [ C  0  ] [ ν ] = [ d ]
//! ```
//!
//! which is symmetric indefinite and therefore always factored with sparse QR.
//!
//! Inequality rows are treated as inactive and ignored. Every solution is checked for
//! finiteness and for its residual before it is returned.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

use crate::core::{GaussianFactorGraph, Key, VectorValues};
use crate::factors::{GaussianFactor, LinearFactor};
use crate::linalg::{
    GraphEliminator, LinAlgError, LinAlgResult, LinearSolverType, SparseCholeskySolver,
    SparseLinearSolver, SparseQRSolver, from_column, sparse_from_entries, to_column,
};

/// Relative residual accepted for a solved linear system
const RESIDUAL_TOLERANCE: f64 = 1e-8;

type Entries = BTreeMap<(usize, usize), f64>;

/// Default [`GraphEliminator`] backed by faer's sparse factorizations.
#[derive(Debug, Clone, Default)]
pub struct SparseEliminator {
    linear_solver_type: LinearSolverType,
    cholesky: SparseCholeskySolver,
    qr: SparseQRSolver,
}

impl SparseEliminator {
    /// Create an eliminator using `linear_solver_type` for positive definite systems
    pub fn new(linear_solver_type: LinearSolverType) -> Self {
        Self {
            linear_solver_type,
            ..Self::default()
        }
    }

    pub fn linear_solver_type(&self) -> LinearSolverType {
        self.linear_solver_type
    }

    fn configured_solver(&mut self) -> &mut dyn SparseLinearSolver {
        match self.linear_solver_type {
            LinearSolverType::SparseCholesky => &mut self.cholesky,
            LinearSolverType::SparseQR => &mut self.qr,
        }
    }

    fn solve_least_squares<K: Key>(
        &mut self,
        graph: &GaussianFactorGraph<K>,
        offsets: &BTreeMap<K, usize>,
        dimension: usize,
    ) -> LinAlgResult<DVector<f64>> {
        let mut jacobian = Entries::new();
        let mut rhs = Vec::new();
        for factor in graph {
            let Some(factor) = factor.as_jacobian() else {
                continue;
            };
            let first_row = rhs.len();
            for (key, block) in factor.terms() {
                let offset = column_offset(offsets, key)?;
                add_block(&mut jacobian, first_row, offset, block);
            }
            rhs.extend(factor.rhs().iter().copied());
        }
        if rhs.len() < dimension {
            return Err(LinAlgError::SystemAssembly(format!(
                "least-squares graph has {} rows for {} unknowns",
                rhs.len(),
                dimension
            ))
            .log());
        }

        let b = DVector::from_vec(rhs);
        let sparse = sparse_from_entries(b.len(), dimension, &jacobian)?;
        let solution = from_column(
            &self
                .configured_solver()
                .solve_normal_equation(&to_column(&b), &sparse)?,
        );

        // Optimality of the least-squares solution: Jᵀ(Jx − b) = 0
        let residual = multiply(&jacobian, &solution, b.len()) - &b;
        let gradient = multiply_transposed(&jacobian, &residual, dimension);
        let projected = multiply_transposed(&jacobian, &b, dimension);
        verify_solution(
            &solution,
            gradient.norm(),
            projected.norm() + frobenius(&jacobian).powi(2) * solution.norm(),
        )?;
        Ok(solution)
    }

    fn solve_constrained<K: Key>(
        &mut self,
        graph: &GaussianFactorGraph<K>,
        offsets: &BTreeMap<K, usize>,
        dimension: usize,
    ) -> LinAlgResult<DVector<f64>> {
        let mut hessian = Entries::new();
        let mut linear = DVector::zeros(dimension);
        let mut constraints = Entries::new();
        let mut constraint_rhs = Vec::new();

        for factor in graph {
            match factor {
                GaussianFactor::Hessian(cost) => {
                    for (i, key_i) in cost.keys().iter().enumerate() {
                        let offset_i = column_offset(offsets, key_i)?;
                        for (j, key_j) in cost.keys().iter().enumerate() {
                            let offset_j = column_offset(offsets, key_j)?;
                            add_block(&mut hessian, offset_i, offset_j, &cost.block(i, j));
                        }
                        let mut segment = linear.rows_mut(offset_i, cost.dimension_at(i));
                        segment += cost.linear_term(i);
                    }
                }
                GaussianFactor::Jacobian(jacobian) if jacobian.is_least_squares() => {
                    for (key_i, block_i) in jacobian.terms() {
                        let offset_i = column_offset(offsets, key_i)?;
                        for (key_j, block_j) in jacobian.terms() {
                            let offset_j = column_offset(offsets, key_j)?;
                            let product = block_i.transpose() * block_j;
                            add_block(&mut hessian, offset_i, offset_j, &product);
                        }
                        let mut segment = linear.rows_mut(offset_i, block_i.ncols());
                        segment += block_i.transpose() * jacobian.rhs();
                    }
                }
                GaussianFactor::Jacobian(jacobian) => {
                    for row in jacobian.equality_rows() {
                        let constraint_row = constraint_rhs.len();
                        for (key, block) in jacobian.terms() {
                            let offset = column_offset(offsets, key)?;
                            add_block(
                                &mut constraints,
                                constraint_row,
                                offset,
                                &block.rows(row, 1).into_owned(),
                            );
                        }
                        constraint_rhs.push(jacobian.rhs()[row]);
                    }
                }
            }
        }

        if constraint_rhs.is_empty() {
            let system = sparse_from_entries(dimension, dimension, &hessian)?;
            let solution = from_column(
                &self
                    .configured_solver()
                    .solve_system(&system, &to_column(&linear))?,
            );
            let residual = multiply(&hessian, &solution, dimension) - &linear;
            verify_solution(
                &solution,
                residual.norm(),
                linear.norm() + frobenius(&hessian) * solution.norm(),
            )?;
            return Ok(solution);
        }

        let size = dimension + constraint_rhs.len();
        let mut kkt = hessian;
        for (&(row, col), &value) in &constraints {
            *kkt.entry((dimension + row, col)).or_insert(0.0) += value;
            *kkt.entry((col, dimension + row)).or_insert(0.0) += value;
        }
        let mut rhs = DVector::zeros(size);
        rhs.rows_mut(0, dimension).copy_from(&linear);
        rhs.rows_mut(dimension, constraint_rhs.len())
            .copy_from(&DVector::from_vec(constraint_rhs));

        let system = sparse_from_entries(size, size, &kkt)?;
        let full = from_column(&self.qr.solve_system(&system, &to_column(&rhs))?);
        let residual = multiply(&kkt, &full, size) - &rhs;
        verify_solution(
            &full,
            residual.norm(),
            rhs.norm() + frobenius(&kkt) * full.norm(),
        )?;
        Ok(full.rows(0, dimension).into_owned())
    }
}

impl GraphEliminator for SparseEliminator {
    fn eliminate<K: Key>(
        &mut self,
        graph: &GaussianFactorGraph<K>,
    ) -> LinAlgResult<VectorValues<K>> {
        let dimensions = graph
            .key_dimensions()
            .map_err(|e| LinAlgError::SystemAssembly(e.to_string()).log())?;

        let mut offsets = BTreeMap::new();
        let mut dimension = 0;
        for (key, dim) in &dimensions {
            offsets.insert(key.clone(), dimension);
            dimension += dim;
        }
        if dimension == 0 {
            return Ok(VectorValues::zeros(dimensions));
        }

        let solution = if graph.is_least_squares() {
            self.solve_least_squares(graph, &offsets, dimension)?
        } else {
            self.solve_constrained(graph, &offsets, dimension)?
        };

        Ok(offsets
            .into_iter()
            .zip(dimensions.into_values())
            .map(|((key, offset), dim)| (key, solution.rows(offset, dim).into_owned()))
            .collect())
    }
}

fn column_offset<K: Key>(offsets: &BTreeMap<K, usize>, key: &K) -> LinAlgResult<usize> {
    offsets.get(key).copied().ok_or_else(|| {
        LinAlgError::SystemAssembly(format!("key {key} has no column offset")).log()
    })
}

/// Accumulate a dense block at `(row_offset, col_offset)`
fn add_block(entries: &mut Entries, row_offset: usize, col_offset: usize, block: &DMatrix<f64>) {
    for i in 0..block.nrows() {
        for j in 0..block.ncols() {
            let value = block[(i, j)];
            if value != 0.0 {
                *entries.entry((row_offset + i, col_offset + j)).or_insert(0.0) += value;
            }
        }
    }
}

fn multiply(entries: &Entries, x: &DVector<f64>, nrows: usize) -> DVector<f64> {
    let mut result = DVector::zeros(nrows);
    for (&(row, col), &value) in entries {
        result[row] += value * x[col];
    }
    result
}

fn multiply_transposed(entries: &Entries, y: &DVector<f64>, ncols: usize) -> DVector<f64> {
    let mut result = DVector::zeros(ncols);
    for (&(row, col), &value) in entries {
        result[col] += value * y[row];
    }
    result
}

fn frobenius(entries: &Entries) -> f64 {
    entries.values().map(|v| v * v).sum::<f64>().sqrt()
}

fn verify_solution(solution: &DVector<f64>, residual: f64, scale: f64) -> LinAlgResult<()> {
    if !solution.iter().all(|v| v.is_finite()) {
        return Err(LinAlgError::NonFiniteSolution.log());
    }
    if !residual.is_finite() || residual > RESIDUAL_TOLERANCE * (1.0 + scale) {
        return Err(LinAlgError::SingularMatrix.log_with_source(format!(
            "residual {residual:.3e} exceeds tolerance at scale {scale:.3e}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{HessianFactor, JacobianFactor};
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn scalar(value: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, value)
    }

    fn key(name: &str) -> String {
        name.to_string()
    }

    /// x1² − x1·x2 + x2² − 3·x1 with its minimum at (2, 1)
    fn quadratic_graph() -> Result<GaussianFactorGraph, Box<dyn std::error::Error>> {
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
        Ok(graph)
    }

    fn assert_value(values: &VectorValues, name: &str, expected: f64) -> TestResult {
        let actual = values.try_get(&key(name))?[0];
        assert!(
            (actual - expected).abs() < 1e-9,
            "{name}: expected {expected}, got {actual}"
        );
        Ok(())
    }

    #[test]
    fn test_unconstrained_minimum() -> TestResult {
        let solution = SparseEliminator::default().eliminate(&quadratic_graph()?)?;
        assert_value(&solution, "x1", 2.0)?;
        assert_value(&solution, "x2", 1.0)?;
        Ok(())
    }

    #[test]
    fn test_qr_matches_cholesky() -> TestResult {
        let graph = quadratic_graph()?;
        let cholesky = SparseEliminator::new(LinearSolverType::SparseCholesky).eliminate(&graph)?;
        let qr = SparseEliminator::new(LinearSolverType::SparseQR).eliminate(&graph)?;
        assert!(cholesky.equals(&qr, 1e-9));
        Ok(())
    }

    #[test]
    fn test_inequality_rows_are_ignored() -> TestResult {
        let mut graph = quadratic_graph()?;
        graph.push(JacobianFactor::inequality(
            vec![(key("x1"), scalar(1.0))],
            dvector![1.5],
        )?);
        let solution = graph.optimize()?;
        assert_value(&solution, "x1", 2.0)?;
        Ok(())
    }

    #[test]
    fn test_equality_constrained_minimum() -> TestResult {
        let mut graph = quadratic_graph()?;
        graph.push(JacobianFactor::equality(
            vec![(key("x1"), scalar(1.0)), (key("x2"), scalar(1.0))],
            dvector![2.0],
        )?);
        let solution = graph.optimize()?;
        assert_value(&solution, "x1", 1.5)?;
        assert_value(&solution, "x2", 0.5)?;
        Ok(())
    }

    #[test]
    fn test_least_squares_terms_join_the_cost() -> TestResult {
        // x² + (y − 1)² written as a Hessian factor on x and a Jacobian factor on y
        let mut graph = GaussianFactorGraph::new();
        graph.push(HessianFactor::unary(key("x"), scalar(2.0), dvector![0.0], 0.0)?);
        graph.push(JacobianFactor::new(vec![(key("y"), scalar(1.0))], dvector![1.0])?);
        graph.push(JacobianFactor::equality(
            vec![(key("x"), scalar(1.0)), (key("y"), scalar(1.0))],
            dvector![0.0],
        )?);
        // min x² + ½(y − 1)² with x = −y  =>  x = −1/3, y = 1/3
        let solution = graph.optimize()?;
        assert_value(&solution, "x", -1.0 / 3.0)?;
        assert_value(&solution, "y", 1.0 / 3.0)?;
        Ok(())
    }

    #[test]
    fn test_least_squares_graph() -> TestResult {
        // Overdetermined: m0 = 1, m1 = 2, m0 + m1 = 4
        let mut graph = GaussianFactorGraph::<usize>::new();
        graph.push(JacobianFactor::new(vec![(0, scalar(1.0))], dvector![1.0])?);
        graph.push(JacobianFactor::new(vec![(1, scalar(1.0))], dvector![2.0])?);
        graph.push(JacobianFactor::new(
            vec![(0, scalar(1.0)), (1, scalar(1.0))],
            dvector![4.0],
        )?);
        // JᵀJ = [[2, 1], [1, 2]], Jᵀb = [5, 6]  =>  (4/3, 7/3)
        let solution = graph.optimize()?;
        assert!((solution.try_get(&0)?[0] - 4.0 / 3.0).abs() < 1e-9);
        assert!((solution.try_get(&1)?[0] - 7.0 / 3.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_underdetermined_least_squares_rejected() -> TestResult {
        let mut graph = GaussianFactorGraph::<usize>::new();
        graph.push(JacobianFactor::new(
            vec![(0, scalar(1.0)), (1, scalar(1.0))],
            dvector![1.0],
        )?);
        assert!(matches!(
            graph.optimize(),
            Err(LinAlgError::SystemAssembly(_))
        ));
        Ok(())
    }

    #[test]
    fn test_singular_cost_rejected() -> TestResult {
        let mut graph = GaussianFactorGraph::new();
        graph.push(HessianFactor::unary(key("x"), scalar(0.0), dvector![1.0], 0.0)?);
        assert!(graph.optimize().is_err());
        Ok(())
    }

    #[test]
    fn test_empty_graph() -> TestResult {
        let graph = GaussianFactorGraph::<String>::new();
        assert!(graph.optimize()?.is_empty());
        Ok(())
    }
}
