//! Error types for the factor-qp library
//!
//! The library uses a hierarchical error system where:
//! - **`FactorQpError`** is the top-level error returned by the solver driver
//! - **Module errors** (`CoreError`, `OptimizerError`, etc.) are wrapped inside FactorQpError
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! Example error chain:
//! ```text
//! FactorQpError::Optimizer(
//!     OptimizerError::LinAlg(LinAlgError::SingularMatrix)
//! )
//! ```

use crate::{
    core::CoreError, factors::FactorError, linalg::LinAlgError, observers::ObserverError,
    optimizer::OptimizerError,
};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the factor-qp library
pub type FactorQpResult<T> = Result<T, FactorQpError>;

/// Main error type for the factor-qp library
///
/// # Error Chain Access
///
/// ```rust,ignore
/// if let Err(e) = solver.optimize(&initial) {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum FactorQpError {
    /// Graph and assignment errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Factor construction and evaluation errors
    #[error(transparent)]
    Factor(#[from] FactorError),

    /// Active-set algorithm errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Observer errors
    #[error(transparent)]
    Observer(#[from] ObserverError),
}

impl FactorQpError {
    /// Get the full error chain as a string for logging and debugging.
    ///
    /// ```rust,ignore
    /// match solver.optimize(&initial) {
    ///     Ok(result) => { /* ... */ }
    ///     Err(e) => {
    ///         warn!("Error chain: {}", e.chain());
    ///         // Output: "Linear algebra error: Singular matrix detected
    ///         //            → Singular matrix detected"
    ///     }
    /// }
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}
