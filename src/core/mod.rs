//! Core data structures for factor-graph quadratic programs
//!
//! This module contains the containers the solver operates on:
//! - Keys naming vector-valued unknowns
//! - Assignments mapping keys to vectors ([`VectorValues`])
//! - The Gaussian factor graph holding cost and constraint factors ([`GaussianFactorGraph`])

pub mod factor_graph;
pub mod vector_values;

pub use factor_graph::GaussianFactorGraph;
pub use vector_values::VectorValues;

use crate::factors::FactorError;
use std::fmt;
use thiserror::Error;
use tracing::error;

/// Identifier of an unknown in a factor graph.
///
/// Primal problems use symbol keys such as `"x1"`; dual problems use `usize` keys holding the
/// index of the constraint factor a multiplier belongs to. Only a total order is required, the
/// order of keys has no influence on the solution.
pub trait Key: Clone + Ord + fmt::Debug + fmt::Display {}

impl<T> Key for T where T: Clone + Ord + fmt::Debug + fmt::Display {}

/// Build a symbol key from a character and an index, e.g. `symbol('x', 1) == "x1"`.
pub fn symbol(chr: char, index: u64) -> String {
    format!("{chr}{index}")
}

/// Core module error types for graphs and assignments
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A key required by an operation has no value in the assignment
    #[error("Missing value for key {0}")]
    MissingValue(String),

    /// The same key appears with different dimensions
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Invalid input parameter or graph structure
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Factor evaluation failed
    #[error(transparent)]
    Factor(#[from] FactorError),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the error that caused it
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_formatting() {
        assert_eq!(symbol('x', 1), "x1");
        assert_eq!(symbol('l', 42), "l42");
    }

    #[test]
    fn test_keys_are_ordered() {
        let mut keys = vec![symbol('x', 2), symbol('x', 1), symbol('l', 7)];
        keys.sort();
        assert_eq!(keys, vec!["l7", "x1", "x2"]);
    }

    #[test]
    fn test_core_error_display() {
        let error = CoreError::MissingValue("x3".to_string());
        assert!(error.to_string().contains("x3"));
    }
}
