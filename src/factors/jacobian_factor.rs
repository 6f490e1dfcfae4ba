//! Linear factor `Ax − b`, used as a least-squares cost or as constraint rows.

use std::fmt;

use nalgebra::{DMatrix, DVector};

use super::hessian_factor::check_unique;
use super::{FactorError, FactorResult, LinearFactor, value_of};
use crate::core::{Key, VectorValues};

/// How a single row `a·x` relates to its right-hand side `b`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    /// `a·x = b`
    Equality,
    /// `a·x ≤ b`
    Inequality,
}

impl ConstraintKind {
    /// Interpret a per-row constrained-noise sigma.
    ///
    /// Negative sigmas mark inequality rows, zero and positive sigmas equality rows.
    pub fn from_sigma(sigma: f64) -> Self {
        if sigma < 0.0 {
            ConstraintKind::Inequality
        } else {
            ConstraintKind::Equality
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::Equality => write!(f, "="),
            ConstraintKind::Inequality => write!(f, "<="),
        }
    }
}

/// Linear factor over several variables: `A x − b` with one coefficient block `A_k` per key.
///
/// Without row kinds the factor is the least-squares cost `0.5 ‖Ax − b‖²`. With row kinds every
/// row is a constraint, either `a·x = b` or `a·x ≤ b`, and the factor contributes no cost.
///
/// # Example
///
/// ```
/// use factor_qp::factors::{ConstraintKind, JacobianFactor};
/// use nalgebra::{DMatrix, dvector};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// // x1 + x2 <= 2 and x1 = 1
/// let constraint = JacobianFactor::constrained(
///     vec![
///         ("x1".to_string(), DMatrix::from_column_slice(2, 1, &[1.0, 1.0])),
///         ("x2".to_string(), DMatrix::from_column_slice(2, 1, &[1.0, 0.0])),
///     ],
///     dvector![2.0, 1.0],
///     vec![ConstraintKind::Inequality, ConstraintKind::Equality],
/// )?;
///
/// assert!(constraint.has_inequality());
/// assert_eq!(constraint.inequality_rows().collect::<Vec<_>>(), vec![0]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianFactor<K: Key = String> {
    keys: Vec<K>,
    blocks: Vec<DMatrix<f64>>,
    rhs: DVector<f64>,
    kinds: Option<Vec<ConstraintKind>>,
}

impl<K: Key> JacobianFactor<K> {
    /// Least-squares cost `0.5 ‖Σ_k A_k x_k − b‖²`
    pub fn new(terms: Vec<(K, DMatrix<f64>)>, rhs: DVector<f64>) -> FactorResult<Self> {
        Self::build(terms, rhs, None)
    }

    /// Constraint factor with an explicit kind per row
    pub fn constrained(
        terms: Vec<(K, DMatrix<f64>)>,
        rhs: DVector<f64>,
        kinds: Vec<ConstraintKind>,
    ) -> FactorResult<Self> {
        if kinds.len() != rhs.len() {
            return Err(FactorError::InvalidDimension {
                expected: rhs.len(),
                actual: kinds.len(),
            }
            .log());
        }
        Self::build(terms, rhs, Some(kinds))
    }

    /// Constraint factor with row kinds given as constrained-noise sigmas
    pub fn constrained_with_sigmas(
        terms: Vec<(K, DMatrix<f64>)>,
        rhs: DVector<f64>,
        sigmas: &[f64],
    ) -> FactorResult<Self> {
        let kinds = sigmas.iter().copied().map(ConstraintKind::from_sigma).collect();
        Self::constrained(terms, rhs, kinds)
    }

    /// Constraint factor whose rows are all equalities
    pub fn equality(terms: Vec<(K, DMatrix<f64>)>, rhs: DVector<f64>) -> FactorResult<Self> {
        let kinds = vec![ConstraintKind::Equality; rhs.len()];
        Self::constrained(terms, rhs, kinds)
    }

    /// Constraint factor whose rows are all inequalities
    pub fn inequality(terms: Vec<(K, DMatrix<f64>)>, rhs: DVector<f64>) -> FactorResult<Self> {
        let kinds = vec![ConstraintKind::Inequality; rhs.len()];
        Self::constrained(terms, rhs, kinds)
    }

    fn build(
        terms: Vec<(K, DMatrix<f64>)>,
        rhs: DVector<f64>,
        kinds: Option<Vec<ConstraintKind>>,
    ) -> FactorResult<Self> {
        let (keys, blocks): (Vec<K>, Vec<DMatrix<f64>>) = terms.into_iter().unzip();
        if keys.is_empty() {
            return Err(
                FactorError::InvalidParameters("linear factor without keys".to_string()).log(),
            );
        }
        check_unique(&keys)?;
        for block in &blocks {
            if block.nrows() != rhs.len() {
                return Err(FactorError::InvalidDimension {
                    expected: rhs.len(),
                    actual: block.nrows(),
                }
                .log());
            }
        }
        Ok(Self {
            keys,
            blocks,
            rhs,
            kinds,
        })
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rhs.len()
    }

    pub fn rhs(&self) -> &DVector<f64> {
        &self.rhs
    }

    pub fn blocks(&self) -> &[DMatrix<f64>] {
        &self.blocks
    }

    /// Coefficient block `A_k` of the variable at position `position`
    pub fn block(&self, position: usize) -> &DMatrix<f64> {
        &self.blocks[position]
    }

    /// Iterate `(key, A_k)` pairs
    pub fn terms(&self) -> impl Iterator<Item = (&K, &DMatrix<f64>)> {
        self.keys.iter().zip(self.blocks.iter())
    }

    pub fn row_kind(&self, row: usize) -> Option<ConstraintKind> {
        self.kinds.as_ref().and_then(|kinds| kinds.get(row).copied())
    }

    pub fn is_constrained(&self) -> bool {
        self.kinds.is_some()
    }

    pub fn is_least_squares(&self) -> bool {
        self.kinds.is_none()
    }

    pub fn has_equality(&self) -> bool {
        self.equality_rows().next().is_some()
    }

    pub fn has_inequality(&self) -> bool {
        self.inequality_rows().next().is_some()
    }

    /// Indices of the rows marked as inequalities
    pub fn inequality_rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows_of_kind(ConstraintKind::Inequality)
    }

    /// Indices of the rows marked as equalities
    pub fn equality_rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows_of_kind(ConstraintKind::Equality)
    }

    fn rows_of_kind(&self, kind: ConstraintKind) -> impl Iterator<Item = usize> + '_ {
        self.kinds
            .iter()
            .flatten()
            .enumerate()
            .filter(move |(_, row_kind)| **row_kind == kind)
            .map(|(row, _)| row)
    }

    /// Coefficients of one row for the variable at `position`, as a column vector
    pub fn row_coefficients(&self, row: usize, position: usize) -> DVector<f64> {
        self.blocks[position].row(row).transpose()
    }

    /// Value of `a_row · x`
    pub fn row_value(&self, row: usize, values: &VectorValues<K>) -> FactorResult<f64> {
        if row >= self.rows() {
            return Err(FactorError::InvalidDimension {
                expected: self.rows(),
                actual: row,
            }
            .log());
        }
        let mut total = 0.0;
        for (position, (key, block)) in self.terms().enumerate() {
            let value = value_of(values, key, self.dimension_at(position))?;
            total += block.row(row).dot(&value.transpose());
        }
        Ok(total)
    }

    /// Residual `Ax − b`
    pub fn residual(&self, values: &VectorValues<K>) -> FactorResult<DVector<f64>> {
        let mut residual = -self.rhs.clone();
        for (position, (key, block)) in self.terms().enumerate() {
            let value = value_of(values, key, self.dimension_at(position))?;
            residual += block * value;
        }
        Ok(residual)
    }

    /// Constraint factor made of the given rows, all re-tagged as `kind`.
    ///
    /// Used to enforce working-set inequality rows as equalities.
    pub fn select_rows(&self, rows: &[usize], kind: ConstraintKind) -> FactorResult<Self> {
        if let Some(&row) = rows.iter().find(|&&row| row >= self.rows()) {
            return Err(FactorError::InvalidDimension {
                expected: self.rows(),
                actual: row,
            }
            .log());
        }
        let blocks = self
            .blocks
            .iter()
            .map(|block| block.select_rows(rows))
            .collect();
        let rhs = DVector::from_iterator(rows.len(), rows.iter().map(|&row| self.rhs[row]));
        Ok(Self {
            keys: self.keys.clone(),
            blocks,
            rhs,
            kinds: Some(vec![kind; rows.len()]),
        })
    }
}

impl<K: Key> LinearFactor<K> for JacobianFactor<K> {
    fn keys(&self) -> &[K] {
        &self.keys
    }

    fn dimension_at(&self, position: usize) -> usize {
        self.blocks[position].ncols()
    }

    fn error(&self, values: &VectorValues<K>) -> FactorResult<f64> {
        if self.is_constrained() {
            return Ok(0.0);
        }
        Ok(0.5 * self.residual(values)?.norm_squared())
    }

    fn gradient(&self, values: &VectorValues<K>) -> FactorResult<Vec<(K, DVector<f64>)>> {
        if self.is_constrained() {
            return Ok(self
                .key_dimensions()
                .into_iter()
                .map(|(key, dim)| (key, DVector::zeros(dim)))
                .collect());
        }
        let residual = self.residual(values)?;
        Ok(self
            .terms()
            .map(|(key, block)| (key.clone(), block.transpose() * &residual))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// x1 + x2 <= 2, −x1 <= 0, −x2 <= 0, x1 <= 1.5
    fn canonical_constraints() -> FactorResult<JacobianFactor> {
        JacobianFactor::constrained_with_sigmas(
            vec![
                (
                    "x1".to_string(),
                    DMatrix::from_column_slice(4, 1, &[1.0, -1.0, 0.0, 1.0]),
                ),
                (
                    "x2".to_string(),
                    DMatrix::from_column_slice(4, 1, &[1.0, 0.0, -1.0, 0.0]),
                ),
            ],
            dvector![2.0, 0.0, 0.0, 1.5],
            &[-1.0; 4],
        )
    }

    fn point(x1: f64, x2: f64) -> VectorValues {
        let mut values = VectorValues::new();
        values.insert("x1".to_string(), dvector![x1]);
        values.insert("x2".to_string(), dvector![x2]);
        values
    }

    #[test]
    fn test_sigma_sign_convention() {
        assert_eq!(ConstraintKind::from_sigma(-1.0), ConstraintKind::Inequality);
        assert_eq!(ConstraintKind::from_sigma(0.0), ConstraintKind::Equality);
        assert_eq!(ConstraintKind::from_sigma(1.0), ConstraintKind::Equality);
    }

    #[test]
    fn test_row_classification() -> TestResult {
        let factor = canonical_constraints()?;
        assert!(factor.is_constrained());
        assert!(factor.has_inequality());
        assert!(!factor.has_equality());
        assert_eq!(factor.inequality_rows().collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        let least_squares = JacobianFactor::new(
            vec![("x1".to_string(), DMatrix::identity(1, 1))],
            dvector![1.0],
        )?;
        assert!(least_squares.is_least_squares());
        assert_eq!(least_squares.row_kind(0), None);
        assert_eq!(least_squares.inequality_rows().count(), 0);
        Ok(())
    }

    #[test]
    fn test_row_value_and_residual() -> TestResult {
        let factor = canonical_constraints()?;
        let values = point(1.5, 0.5);
        assert!((factor.row_value(0, &values)? - 2.0).abs() < 1e-12);
        assert!((factor.row_value(1, &values)? + 1.5).abs() < 1e-12);

        let residual = factor.residual(&values)?;
        assert!((residual - dvector![0.0, -1.5, -0.5, 0.0]).amax() < 1e-12);
        assert!(factor.row_value(4, &values).is_err());
        Ok(())
    }

    #[test]
    fn test_constraint_has_no_cost() -> TestResult {
        let factor = canonical_constraints()?;
        assert_eq!(factor.error(&point(10.0, 10.0))?, 0.0);
        let gradient = factor.gradient(&point(10.0, 10.0))?;
        assert!(gradient.iter().all(|(_, g)| g.amax() == 0.0));
        Ok(())
    }

    #[test]
    fn test_least_squares_error_and_gradient() -> TestResult {
        let factor = JacobianFactor::new(
            vec![("x1".to_string(), DMatrix::from_element(1, 1, 2.0))],
            dvector![1.0],
        )?;
        let mut values = VectorValues::new();
        values.insert("x1".to_string(), dvector![2.0]);
        // r = 2·2 − 1 = 3
        assert!((factor.error(&values)? - 4.5).abs() < 1e-12);
        assert!((factor.gradient(&values)?[0].1[0] - 6.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_select_rows_as_equalities() -> TestResult {
        let factor = canonical_constraints()?;
        let selected = factor.select_rows(&[0, 3], ConstraintKind::Equality)?;
        assert_eq!(selected.rows(), 2);
        assert_eq!(selected.rhs(), &dvector![2.0, 1.5]);
        assert_eq!(selected.block(0)[(1, 0)], 1.0);
        assert_eq!(selected.block(1)[(1, 0)], 0.0);
        assert!(selected.has_equality());
        assert!(!selected.has_inequality());
        assert!(factor.select_rows(&[7], ConstraintKind::Equality).is_err());
        Ok(())
    }

    #[test]
    fn test_construction_errors() {
        let wrong_rows = JacobianFactor::new(
            vec![("x1".to_string(), DMatrix::identity(2, 1))],
            dvector![1.0],
        );
        assert!(matches!(
            wrong_rows,
            Err(FactorError::InvalidDimension { .. })
        ));

        let wrong_kinds = JacobianFactor::constrained(
            vec![("x1".to_string(), DMatrix::identity(1, 1))],
            dvector![1.0],
            vec![ConstraintKind::Equality, ConstraintKind::Inequality],
        );
        assert!(wrong_kinds.is_err());

        let empty = JacobianFactor::<String>::new(vec![], dvector![1.0]);
        assert!(matches!(empty, Err(FactorError::InvalidParameters(_))));
    }
}
