use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};
use std::ops::Mul;

use crate::linalg::{LinAlgError, LinAlgResult, SparseLinearSolver};

/// Sparse Cholesky (`LLᵀ`) solver for symmetric positive definite systems.
///
/// Used for unconstrained sub-problems and the normal equations of least-squares graphs.
/// The sparsity pattern changes whenever the working set changes, so the symbolic
/// factorization is recomputed on every solve.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver;

impl SparseCholeskySolver {
    pub fn new() -> Self {
        SparseCholeskySolver
    }

    fn factor_and_solve(
        &self,
        system: &SparseColMat<usize, f64>,
        rhs: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let symbolic = SymbolicLlt::try_new(system.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed("Symbolic Cholesky decomposition failed".to_string())
                .log_with_source(e)
        })?;

        let cholesky = Llt::try_new_with_symbolic(symbolic, system.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

        Ok(cholesky.solve(rhs.clone()))
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_system(
        &mut self,
        system: &SparseColMat<usize, f64>,
        rhs: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        self.factor_and_solve(system, rhs)
    }

    fn solve_normal_equation(
        &mut self,
        rhs: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>> {
        // Form the normal equations: H = J^T * J
        let jt = jacobian.as_ref().transpose();
        let normal = jt
            .to_col_major()
            .map_err(|e| {
                LinAlgError::MatrixConversion(
                    "Failed to convert transposed Jacobian to column-major format".to_string(),
                )
                .log_with_source(e)
            })?
            .mul(jacobian.as_ref());

        // J^T * b
        let projected = jacobian.as_ref().transpose().mul(rhs);

        self.factor_and_solve(&normal, &projected)
    }
}
