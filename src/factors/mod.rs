//! Linear Gaussian factors for quadratic programs on factor graphs.
//!
//! Two factor types make up a QP:
//!
//! - [`HessianFactor`]: a quadratic cost in information form,
//!   `0.5 xᵀGx − xᵀg + 0.5 f`, over one or more variables.
//! - [`JacobianFactor`]: a linear factor `Ax − b`, used either as a least-squares cost
//!   `0.5 ‖Ax − b‖²` or as a set of constraint rows, each tagged with a [`ConstraintKind`].
//!
//! Both implement [`LinearFactor`] and are stored in a graph as the [`GaussianFactor`] enum.
//!
//! # QP formulation
//!
//! ```text
//! minimize    Σ_i 0.5 xᵀG_i x − xᵀg_i + Σ_j 0.5 ‖A_j x − b_j‖²
//! subject to  a_r · x = b_r    (equality rows)
//!             a_r · x ≤ b_r    (inequality rows)
//! ```

use nalgebra::DVector;
use thiserror::Error;
use tracing::error;

use crate::core::{Key, VectorValues};

pub mod hessian_factor;
pub mod jacobian_factor;

pub use hessian_factor::HessianFactor;
pub use jacobian_factor::{ConstraintKind, JacobianFactor};

/// Factor-specific error types
#[derive(Debug, Clone, Error)]
pub enum FactorError {
    /// Invalid dimension mismatch between expected and actual
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    /// Information matrix that is not symmetric
    #[error("Information matrix is not symmetric (max asymmetry {0:.3e})")]
    AsymmetricInformation(f64),

    /// A value needed to evaluate the factor is missing
    #[error("Missing value for key {0}")]
    MissingValue(String),

    /// Invalid parameter values
    #[error("Invalid parameter values: {0}")]
    InvalidParameters(String),
}

impl FactorError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| FactorError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error for debugging context
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for factor operations
pub type FactorResult<T> = Result<T, FactorError>;

/// Common interface of the linear factors stored in a [`crate::core::GaussianFactorGraph`].
///
/// A linear factor touches an ordered list of keys, each with a fixed dimension, and
/// contributes a quadratic cost (possibly zero for pure constraints).
pub trait LinearFactor<K: Key> {
    /// Keys touched by this factor, in factor order
    fn keys(&self) -> &[K];

    /// Dimension of the variable at position `position` of [`LinearFactor::keys`]
    fn dimension_at(&self, position: usize) -> usize;

    /// Cost contributed by this factor at `values`.
    ///
    /// Constraint rows contribute nothing.
    fn error(&self, values: &VectorValues<K>) -> FactorResult<f64>;

    /// Gradient of the cost with respect to each key, in key order.
    fn gradient(&self, values: &VectorValues<K>) -> FactorResult<Vec<(K, DVector<f64>)>>;

    /// Iterate `(key, dimension)` pairs
    fn key_dimensions(&self) -> Vec<(K, usize)> {
        self.keys()
            .iter()
            .enumerate()
            .map(|(position, key)| (key.clone(), self.dimension_at(position)))
            .collect()
    }

    /// Whether the factor touches `key`
    fn involves(&self, key: &K) -> bool {
        self.keys().contains(key)
    }
}

/// A factor stored in a Gaussian factor graph
#[derive(Debug, Clone, PartialEq)]
pub enum GaussianFactor<K: Key = String> {
    Hessian(HessianFactor<K>),
    Jacobian(JacobianFactor<K>),
}

impl<K: Key> GaussianFactor<K> {
    pub fn as_hessian(&self) -> Option<&HessianFactor<K>> {
        match self {
            GaussianFactor::Hessian(factor) => Some(factor),
            GaussianFactor::Jacobian(_) => None,
        }
    }

    pub fn as_jacobian(&self) -> Option<&JacobianFactor<K>> {
        match self {
            GaussianFactor::Jacobian(factor) => Some(factor),
            GaussianFactor::Hessian(_) => None,
        }
    }

    /// Linear factor carrying at least one constraint row
    pub fn as_constraint(&self) -> Option<&JacobianFactor<K>> {
        self.as_jacobian().filter(|factor| factor.is_constrained())
    }

    pub fn is_constrained(&self) -> bool {
        self.as_constraint().is_some()
    }

    fn inner(&self) -> &dyn LinearFactor<K> {
        match self {
            GaussianFactor::Hessian(factor) => factor,
            GaussianFactor::Jacobian(factor) => factor,
        }
    }
}

impl<K: Key> LinearFactor<K> for GaussianFactor<K> {
    fn keys(&self) -> &[K] {
        self.inner().keys()
    }

    fn dimension_at(&self, position: usize) -> usize {
        self.inner().dimension_at(position)
    }

    fn error(&self, values: &VectorValues<K>) -> FactorResult<f64> {
        self.inner().error(values)
    }

    fn gradient(&self, values: &VectorValues<K>) -> FactorResult<Vec<(K, DVector<f64>)>> {
        self.inner().gradient(values)
    }
}

impl<K: Key> From<HessianFactor<K>> for GaussianFactor<K> {
    fn from(factor: HessianFactor<K>) -> Self {
        GaussianFactor::Hessian(factor)
    }
}

impl<K: Key> From<JacobianFactor<K>> for GaussianFactor<K> {
    fn from(factor: JacobianFactor<K>) -> Self {
        GaussianFactor::Jacobian(factor)
    }
}

/// Fetch the value of `key` from `values` and check its dimension.
pub(crate) fn value_of<'a, K: Key>(
    values: &'a VectorValues<K>,
    key: &K,
    dim: usize,
) -> FactorResult<&'a DVector<f64>> {
    let value = values
        .get(key)
        .ok_or_else(|| FactorError::MissingValue(key.to_string()))?;
    if value.len() != dim {
        return Err(FactorError::InvalidDimension {
            expected: dim,
            actual: value.len(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_enum_dispatch_and_classification() -> TestResult {
        let cost: GaussianFactor =
            HessianFactor::unary("x1".to_string(), DMatrix::identity(1, 1), dvector![1.0], 0.0)?
                .into();
        let constraint: GaussianFactor = JacobianFactor::inequality(
            vec![("x1".to_string(), DMatrix::from_element(1, 1, 1.0))],
            dvector![2.0],
        )?
        .into();

        assert!(!cost.is_constrained());
        assert!(constraint.is_constrained());
        assert!(cost.as_hessian().is_some());
        assert!(constraint.as_constraint().is_some());
        assert_eq!(cost.keys(), constraint.keys());
        assert_eq!(constraint.key_dimensions(), vec![("x1".to_string(), 1)]);
        Ok(())
    }

    #[test]
    fn test_missing_value_reported() -> TestResult {
        let cost: GaussianFactor =
            HessianFactor::unary("x1".to_string(), DMatrix::identity(1, 1), dvector![1.0], 0.0)?
                .into();
        let result = cost.error(&VectorValues::new());
        assert!(matches!(result, Err(FactorError::MissingValue(ref key)) if key == "x1"));
        Ok(())
    }

    #[test]
    fn test_factor_error_display() {
        let error = FactorError::InvalidDimension {
            expected: 2,
            actual: 3,
        };
        assert_eq!(error.to_string(), "Invalid dimension: expected 2, got 3");
    }
}
