use faer::{
    Mat,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Qr, SymbolicQr},
};
use std::ops::Mul;

use crate::linalg::{LinAlgError, LinAlgResult, SparseLinearSolver};

/// Sparse QR solver.
///
/// Unlike Cholesky it does not need a positive definite matrix, so it handles the symmetric
/// indefinite KKT systems of equality-constrained sub-problems.
#[derive(Debug, Clone, Default)]
pub struct SparseQRSolver;

impl SparseQRSolver {
    pub fn new() -> Self {
        SparseQRSolver
    }

    fn factor_and_solve(
        &self,
        system: &SparseColMat<usize, f64>,
        rhs: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let symbolic = SymbolicQr::try_new(system.symbolic()).map_err(|e| {
            LinAlgError::FactorizationFailed("Symbolic QR decomposition failed".to_string())
                .log_with_source(e)
        })?;

        let qr = Qr::try_new_with_symbolic(symbolic, system.as_ref())
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

        Ok(qr.solve(rhs.clone()))
    }
}

impl SparseLinearSolver for SparseQRSolver {
    fn solve_system(
        &mut self,
        system: &SparseColMat<usize, f64>,
        rhs: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        if system.nrows() != system.ncols() {
            return Err(LinAlgError::SystemAssembly(format!(
                "QR system must be square, got {}x{}",
                system.nrows(),
                system.ncols()
            ))
            .log());
        }
        self.factor_and_solve(system, rhs)
    }

    fn solve_normal_equation(
        &mut self,
        rhs: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>> {
        // Form the normal equations explicitly: H = J^T * J
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
