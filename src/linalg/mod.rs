pub mod cholesky;
pub mod elimination;
pub mod qr;

use std::{
    collections::BTreeMap,
    fmt,
    fmt::{Display, Formatter},
};

use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use nalgebra::DVector;
use thiserror::Error;
use tracing::error;

use crate::core::{GaussianFactorGraph, Key, VectorValues};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    #[default]
    SparseCholesky,
    SparseQR,
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::SparseQR => write!(f, "Sparse QR"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (Cholesky, QR, etc.)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// The factor graph could not be turned into a linear system
    #[error("System assembly failed: {0}")]
    SystemAssembly(String),

    /// The solve produced NaN or infinite entries
    #[error("Solution contains non-finite values")]
    NonFiniteSolution,
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| LinAlgError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// This logs both the LinAlgError and the underlying error from external libraries
    /// (e.g., faer's LltError, CreationError).
    ///
    /// # Example
    /// ```ignore
    /// SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed(
    ///             "Symbolic Cholesky decomposition failed".to_string()
    ///         )
    ///         .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Trait for sparse linear solvers used to solve the systems assembled from factor graphs
pub trait SparseLinearSolver {
    /// Solve the square system `A x = rhs`
    ///
    /// # Errors
    /// Returns `LinAlgError` if:
    /// - Matrix factorization fails
    /// - Matrix is singular or ill-conditioned
    fn solve_system(
        &mut self,
        system: &SparseColMat<usize, f64>,
        rhs: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>>;

    /// Solve the least-squares problem `min ‖J x − b‖²` through the normal equation
    /// `(JᵀJ) x = Jᵀb`
    ///
    /// # Errors
    /// Returns `LinAlgError` if:
    /// - Matrix factorization fails
    /// - `J` does not have full column rank
    fn solve_normal_equation(
        &mut self,
        rhs: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>>;
}

/// Something that can solve a Gaussian factor graph.
///
/// Cost factors are minimized subject to the equality rows of constraint factors.
/// Inequality rows are inactive and ignored.
pub trait GraphEliminator {
    fn eliminate<K: Key>(&mut self, graph: &GaussianFactorGraph<K>)
    -> LinAlgResult<VectorValues<K>>;
}

pub use cholesky::SparseCholeskySolver;
pub use elimination::SparseEliminator;
pub use qr::SparseQRSolver;

/// Build a sparse matrix from accumulated `(row, col) -> value` entries.
pub(crate) fn sparse_from_entries(
    nrows: usize,
    ncols: usize,
    entries: &BTreeMap<(usize, usize), f64>,
) -> LinAlgResult<SparseColMat<usize, f64>> {
    let triplets: Vec<Triplet<usize, usize, f64>> = entries
        .iter()
        .map(|(&(row, col), &value)| Triplet::new(row, col, value))
        .collect();
    SparseColMat::try_new_from_triplets(nrows, ncols, &triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation(format!(
            "Failed to create {nrows}x{ncols} matrix from {} entries",
            entries.len()
        ))
        .log_with_source(e)
    })
}

pub(crate) fn to_column(vector: &DVector<f64>) -> Mat<f64> {
    Mat::from_fn(vector.len(), 1, |i, _| vector[i])
}

pub(crate) fn from_column(column: &Mat<f64>) -> DVector<f64> {
    DVector::from_fn(column.nrows(), |i, _| column[(i, 0)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_solver_type_display() {
        assert_eq!(LinearSolverType::default(), LinearSolverType::SparseCholesky);
        assert_eq!(LinearSolverType::SparseQR.to_string(), "Sparse QR");
    }

    #[test]
    fn test_column_conversion() {
        let vector = DVector::from_vec(vec![1.0, -2.0, 3.5]);
        let column = to_column(&vector);
        assert_eq!(column.nrows(), 3);
        assert_eq!(from_column(&column), vector);
    }
}
