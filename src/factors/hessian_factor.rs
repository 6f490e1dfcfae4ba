//! Quadratic cost factor in information form.

use nalgebra::{DMatrix, DVector};

use super::{FactorError, FactorResult, LinearFactor, value_of};
use crate::core::{Key, VectorValues};

/// Maximum allowed asymmetry of an information matrix before it is rejected.
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Quadratic cost factor `0.5 xᵀGx − xᵀg + 0.5 f`.
///
/// `G` is the symmetric information matrix over the stacked variables of the factor, `g` the
/// linear term and `f` a constant. The gradient with respect to key `i` is
/// `Σ_j G_ij x_j − g_i`.
///
/// # Example
///
/// ```
/// use factor_qp::factors::HessianFactor;
/// use nalgebra::{DMatrix, dvector};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// // x1² − x1·x2 + x2² − 3·x1 + 5
/// let cost = HessianFactor::binary(
///     "x1".to_string(),
///     "x2".to_string(),
///     DMatrix::from_element(1, 1, 2.0),
///     DMatrix::from_element(1, 1, -1.0),
///     dvector![3.0],
///     DMatrix::from_element(1, 1, 2.0),
///     dvector![0.0],
///     10.0,
/// )?;
///
/// assert_eq!(cost.block(0, 1)[(0, 0)], -1.0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HessianFactor<K: Key = String> {
    keys: Vec<K>,
    dims: Vec<usize>,
    offsets: Vec<usize>,
    information: DMatrix<f64>,
    linear: DVector<f64>,
    constant: f64,
}

impl<K: Key> HessianFactor<K> {
    /// Cost on a single variable
    pub fn unary(
        key: K,
        g11: DMatrix<f64>,
        g1: DVector<f64>,
        constant: f64,
    ) -> FactorResult<Self> {
        let dim = g1.len();
        Self::from_information(vec![(key, dim)], g11, g1, constant)
    }

    /// Cost on two variables given its blocks.
    ///
    /// `g12` is the off-diagonal block coupling `key1` (rows) to `key2` (columns); the lower
    /// block is its transpose.
    #[allow(clippy::too_many_arguments)]
    pub fn binary(
        key1: K,
        key2: K,
        g11: DMatrix<f64>,
        g12: DMatrix<f64>,
        g1: DVector<f64>,
        g22: DMatrix<f64>,
        g2: DVector<f64>,
        constant: f64,
    ) -> FactorResult<Self> {
        let (d1, d2) = (g1.len(), g2.len());
        check_shape(&g12, d1, d2)?;
        check_shape(&g11, d1, d1)?;
        check_shape(&g22, d2, d2)?;

        let mut information = DMatrix::zeros(d1 + d2, d1 + d2);
        information.view_mut((0, 0), (d1, d1)).copy_from(&g11);
        information.view_mut((0, d1), (d1, d2)).copy_from(&g12);
        information
            .view_mut((d1, 0), (d2, d1))
            .copy_from(&g12.transpose());
        information.view_mut((d1, d1), (d2, d2)).copy_from(&g22);

        let mut linear = DVector::zeros(d1 + d2);
        linear.rows_mut(0, d1).copy_from(&g1);
        linear.rows_mut(d1, d2).copy_from(&g2);

        Self::from_information(vec![(key1, d1), (key2, d2)], information, linear, constant)
    }

    /// General form from a full information matrix over the stacked variables.
    ///
    /// Rejects duplicate keys, shape mismatches and asymmetric information matrices.
    pub fn from_information(
        keys_with_dims: Vec<(K, usize)>,
        information: DMatrix<f64>,
        linear: DVector<f64>,
        constant: f64,
    ) -> FactorResult<Self> {
        let (keys, dims): (Vec<K>, Vec<usize>) = keys_with_dims.into_iter().unzip();
        check_unique(&keys)?;

        let total: usize = dims.iter().sum();
        check_shape(&information, total, total)?;
        if linear.len() != total {
            return Err(FactorError::InvalidDimension {
                expected: total,
                actual: linear.len(),
            }
            .log());
        }

        let asymmetry = (&information - information.transpose()).amax();
        if asymmetry > SYMMETRY_TOLERANCE * (1.0 + information.amax()) {
            return Err(FactorError::AsymmetricInformation(asymmetry).log());
        }

        let offsets = dims
            .iter()
            .scan(0, |offset, dim| {
                let start = *offset;
                *offset += dim;
                Some(start)
            })
            .collect();

        Ok(Self {
            keys,
            dims,
            offsets,
            information,
            linear,
            constant,
        })
    }

    /// Information block `G_ij` between the variables at positions `i` and `j`
    pub fn block(&self, i: usize, j: usize) -> DMatrix<f64> {
        self.information
            .view((self.offsets[i], self.offsets[j]), (self.dims[i], self.dims[j]))
            .into_owned()
    }

    /// Linear term `g_i` of the variable at position `i`
    pub fn linear_term(&self, i: usize) -> DVector<f64> {
        self.linear.rows(self.offsets[i], self.dims[i]).into_owned()
    }

    pub fn constant_term(&self) -> f64 {
        self.constant
    }

    pub fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    /// Copy of this factor with a different constant term
    pub fn with_constant_term(&self, constant: f64) -> Self {
        Self {
            constant,
            ..self.clone()
        }
    }

    fn stacked(&self, values: &VectorValues<K>) -> FactorResult<DVector<f64>> {
        let mut x = DVector::zeros(self.linear.len());
        for (position, key) in self.keys.iter().enumerate() {
            let value = value_of(values, key, self.dims[position])?;
            x.rows_mut(self.offsets[position], self.dims[position])
                .copy_from(value);
        }
        Ok(x)
    }
}

impl<K: Key> LinearFactor<K> for HessianFactor<K> {
    fn keys(&self) -> &[K] {
        &self.keys
    }

    fn dimension_at(&self, position: usize) -> usize {
        self.dims[position]
    }

    fn error(&self, values: &VectorValues<K>) -> FactorResult<f64> {
        let x = self.stacked(values)?;
        let quadratic = x.dot(&(&self.information * &x));
        Ok(0.5 * quadratic - x.dot(&self.linear) + 0.5 * self.constant)
    }

    fn gradient(&self, values: &VectorValues<K>) -> FactorResult<Vec<(K, DVector<f64>)>> {
        let x = self.stacked(values)?;
        let full = &self.information * &x - &self.linear;
        Ok(self
            .keys
            .iter()
            .enumerate()
            .map(|(position, key)| {
                (
                    key.clone(),
                    full.rows(self.offsets[position], self.dims[position])
                        .into_owned(),
                )
            })
            .collect())
    }
}

fn check_shape(matrix: &DMatrix<f64>, rows: usize, cols: usize) -> FactorResult<()> {
    if matrix.nrows() != rows {
        return Err(FactorError::InvalidDimension {
            expected: rows,
            actual: matrix.nrows(),
        }
        .log());
    }
    if matrix.ncols() != cols {
        return Err(FactorError::InvalidDimension {
            expected: cols,
            actual: matrix.ncols(),
        }
        .log());
    }
    Ok(())
}

pub(crate) fn check_unique<K: Key>(keys: &[K]) -> FactorResult<()> {
    for (i, key) in keys.iter().enumerate() {
        if keys[..i].contains(key) {
            return Err(
                FactorError::InvalidParameters(format!("duplicate key {key} in factor")).log(),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn scalar(value: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, value)
    }

    /// x1² − x1·x2 + x2² − 3·x1 + 5
    fn canonical_cost() -> FactorResult<HessianFactor> {
        HessianFactor::binary(
            "x1".to_string(),
            "x2".to_string(),
            scalar(2.0),
            scalar(-1.0),
            dvector![3.0],
            scalar(2.0),
            dvector![0.0],
            10.0,
        )
    }

    fn point(x1: f64, x2: f64) -> VectorValues {
        let mut values = VectorValues::new();
        values.insert("x1".to_string(), dvector![x1]);
        values.insert("x2".to_string(), dvector![x2]);
        values
    }

    #[test]
    fn test_binary_blocks() -> TestResult {
        let cost = canonical_cost()?;
        assert_eq!(cost.block(0, 0), scalar(2.0));
        assert_eq!(cost.block(0, 1), scalar(-1.0));
        assert_eq!(cost.block(1, 0), scalar(-1.0));
        assert_eq!(cost.linear_term(0), dvector![3.0]);
        assert_eq!(cost.constant_term(), 10.0);
        Ok(())
    }

    #[test]
    fn test_error_matches_polynomial() -> TestResult {
        let cost = canonical_cost()?;
        // 1.5² − 1.5·0.5 + 0.5² − 4.5 + 5 = 2.25
        let error = cost.error(&point(1.5, 0.5))?;
        assert!((error - 2.25).abs() < 1e-12, "error was {error}");
        Ok(())
    }

    #[test]
    fn test_gradient() -> TestResult {
        let cost = canonical_cost()?;
        let gradient = cost.gradient(&point(1.5, 0.5))?;
        // ∂/∂x1 = 2·1.5 − 0.5 − 3 = −0.5, ∂/∂x2 = −1.5 + 1 = −0.5
        assert_eq!(gradient[0].0, "x1");
        assert!((gradient[0].1[0] + 0.5).abs() < 1e-12);
        assert!((gradient[1].1[0] + 0.5).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_with_constant_term() -> TestResult {
        let cost = canonical_cost()?.with_constant_term(0.0);
        assert_eq!(cost.constant_term(), 0.0);
        assert_eq!(cost.block(1, 1), scalar(2.0));
        Ok(())
    }

    #[test]
    fn test_rejects_asymmetric_information() {
        let information = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 1.0]);
        let result = HessianFactor::from_information(
            vec![("x1".to_string(), 2)],
            information,
            dvector![0.0, 0.0],
            0.0,
        );
        assert!(matches!(result, Err(FactorError::AsymmetricInformation(_))));
    }

    #[test]
    fn test_rejects_bad_shapes_and_duplicates() {
        let bad_block = HessianFactor::binary(
            "x1".to_string(),
            "x2".to_string(),
            scalar(2.0),
            DMatrix::zeros(1, 2),
            dvector![0.0],
            scalar(2.0),
            dvector![0.0],
            0.0,
        );
        assert!(matches!(
            bad_block,
            Err(FactorError::InvalidDimension { .. })
        ));

        let duplicate = HessianFactor::binary(
            "x1".to_string(),
            "x1".to_string(),
            scalar(2.0),
            scalar(0.0),
            dvector![0.0],
            scalar(2.0),
            dvector![0.0],
            0.0,
        );
        assert!(matches!(
            duplicate,
            Err(FactorError::InvalidParameters(_))
        ));
    }
}
