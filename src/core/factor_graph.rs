//! Gaussian factor graph: an ordered collection of linear factors over shared keys.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::{CoreError, CoreResult, Key, VectorValues};
use crate::factors::{GaussianFactor, LinearFactor};
use crate::linalg::{GraphEliminator, LinAlgResult, SparseEliminator};

/// Ordered collection of [`GaussianFactor`]s.
///
/// Factor indices are positions in insertion order and are stable: they are used to name
/// constraint factors in working sets and dual solutions.
///
/// # Example
///
/// ```
/// use factor_qp::core::GaussianFactorGraph;
/// use factor_qp::factors::HessianFactor;
/// use nalgebra::{DMatrix, dvector};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut graph: GaussianFactorGraph = GaussianFactorGraph::new();
/// // (x − 2)² up to a constant
/// graph.push(HessianFactor::unary(
///     "x".to_string(),
///     DMatrix::from_element(1, 1, 2.0),
///     dvector![4.0],
///     0.0,
/// )?);
///
/// let solution = graph.optimize()?;
/// assert!((solution.try_get(&"x".to_string())?[0] - 2.0).abs() < 1e-9);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianFactorGraph<K: Key = String> {
    factors: Vec<GaussianFactor<K>>,
}

impl<K: Key> Default for GaussianFactorGraph<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> GaussianFactorGraph<K> {
    pub fn new() -> Self {
        Self {
            factors: Vec::new(),
        }
    }

    /// Append a factor and return its index
    pub fn push(&mut self, factor: impl Into<GaussianFactor<K>>) -> usize {
        self.factors.push(factor.into());
        self.factors.len() - 1
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn at(&self, index: usize) -> Option<&GaussianFactor<K>> {
        self.factors.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GaussianFactor<K>> {
        self.factors.iter()
    }

    /// Iterate `(index, factor)` pairs in graph order
    pub fn enumerate(&self) -> impl Iterator<Item = (usize, &GaussianFactor<K>)> {
        self.factors.iter().enumerate()
    }

    /// All keys touched by any factor
    pub fn keys(&self) -> BTreeSet<K> {
        self.factors
            .iter()
            .flat_map(|factor| factor.keys().iter().cloned())
            .collect()
    }

    /// Dimension of every key, checking that all factors agree
    pub fn key_dimensions(&self) -> CoreResult<BTreeMap<K, usize>> {
        let mut dimensions = BTreeMap::new();
        for (index, factor) in self.enumerate() {
            for (key, dim) in factor.key_dimensions() {
                match dimensions.get(&key) {
                    Some(&known) if known != dim => {
                        return Err(CoreError::DimensionMismatch(format!(
                            "factor {index} uses key {key} with dimension {dim}, \
                             other factors use {known}"
                        ))
                        .log());
                    }
                    Some(_) => {}
                    None => {
                        dimensions.insert(key, dim);
                    }
                }
            }
        }
        Ok(dimensions)
    }

    /// True when every factor is a least-squares Jacobian factor
    pub fn is_least_squares(&self) -> bool {
        self.factors.iter().all(|factor| {
            factor
                .as_jacobian()
                .is_some_and(|jacobian| jacobian.is_least_squares())
        })
    }

    /// Total cost of the graph at `values`; constraints contribute nothing
    pub fn error(&self, values: &VectorValues<K>) -> CoreResult<f64> {
        let mut total = 0.0;
        for factor in &self.factors {
            total += factor.error(values)?;
        }
        Ok(total)
    }

    /// Gradient of the total cost at `values`.
    ///
    /// Every key of the graph gets an entry, zero for keys touched only by constraints.
    pub fn gradient(&self, values: &VectorValues<K>) -> CoreResult<VectorValues<K>> {
        let mut gradient = VectorValues::zeros(self.key_dimensions()?);
        for factor in &self.factors {
            for (key, contribution) in factor.gradient(values)? {
                let entry = gradient
                    .get_mut(&key)
                    .ok_or_else(|| CoreError::MissingValue(key.to_string()))?;
                *entry += contribution;
            }
        }
        Ok(gradient)
    }

    /// Solve the graph with the default sparse eliminator
    pub fn optimize(&self) -> LinAlgResult<VectorValues<K>> {
        self.optimize_with(&mut SparseEliminator::default())
    }

    /// Solve the graph with a caller-provided eliminator
    pub fn optimize_with<E: GraphEliminator>(
        &self,
        eliminator: &mut E,
    ) -> LinAlgResult<VectorValues<K>> {
        eliminator.eliminate(self)
    }

    /// Zero vector for each key of the graph
    pub fn zero_values(&self) -> CoreResult<VectorValues<K>> {
        Ok(VectorValues::zeros(self.key_dimensions()?))
    }
}

impl<K: Key> FromIterator<GaussianFactor<K>> for GaussianFactorGraph<K> {
    fn from_iter<I: IntoIterator<Item = GaussianFactor<K>>>(iter: I) -> Self {
        Self {
            factors: iter.into_iter().collect(),
        }
    }
}

impl<'a, K: Key> IntoIterator for &'a GaussianFactorGraph<K> {
    type Item = &'a GaussianFactor<K>;
    type IntoIter = std::slice::Iter<'a, GaussianFactor<K>>;

    fn into_iter(self) -> Self::IntoIter {
        self.factors.iter()
    }
}
