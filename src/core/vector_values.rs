//! Assignments of vectors to keys.
//!
//! [`VectorValues`] is used for three things in the solver:
//! - the primal candidate solution (keys are variables),
//! - the solution returned by eliminating a factor graph,
//! - the dual solution, where keys are constraint factor indices and each vector holds one
//!   Lagrange multiplier per row of that constraint factor.
//!
//! Entries are kept in key order so iteration, printing and comparison are deterministic.

use std::collections::{BTreeMap, btree_map};

use nalgebra::DVector;

use crate::core::{CoreError, CoreResult, Key};

/// Ordered mapping from key to a real vector.
///
/// # Example
///
/// ```
/// use factor_qp::core::VectorValues;
/// use nalgebra::dvector;
///
/// let mut values = VectorValues::new();
/// values.insert("x1".to_string(), dvector![1.0, 2.0]);
/// values.insert("x2".to_string(), dvector![3.0]);
///
/// assert_eq!(values.len(), 2);
/// assert_eq!(values.total_dimension(), 3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct VectorValues<K: Key = String> {
    values: BTreeMap<K, DVector<f64>>,
}

impl<K: Key> Default for VectorValues<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> VectorValues<K> {
    /// Create an empty assignment
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Create an assignment with a zero vector of the given dimension for every key
    pub fn zeros<I>(dimensions: I) -> Self
    where
        I: IntoIterator<Item = (K, usize)>,
    {
        dimensions
            .into_iter()
            .map(|(key, dim)| (key, DVector::zeros(dim)))
            .collect()
    }

    /// Insert a value, returning the previous value stored under the key
    pub fn insert(&mut self, key: K, value: DVector<f64>) -> Option<DVector<f64>> {
        self.values.insert(key, value)
    }

    pub fn get(&self, key: &K) -> Option<&DVector<f64>> {
        self.values.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut DVector<f64>> {
        self.values.get_mut(key)
    }

    /// Look up a value, reporting a missing key as an error
    pub fn try_get(&self, key: &K) -> CoreResult<&DVector<f64>> {
        self.values
            .get(key)
            .ok_or_else(|| CoreError::MissingValue(key.to_string()))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<DVector<f64>> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.values.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, DVector<f64>> {
        self.values.iter()
    }

    /// Sum of the dimensions of all stored vectors
    pub fn total_dimension(&self) -> usize {
        self.values.values().map(|v| v.len()).sum()
    }

    /// Overwrite the entries of `self` with every entry of `other`.
    ///
    /// Keys only present in `self` are left untouched.
    pub fn update(&mut self, other: &VectorValues<K>) {
        for (key, value) in other.iter() {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Keep only the entries whose key satisfies the predicate
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&K) -> bool,
    {
        self.values.retain(|key, _| keep(key));
    }

    /// Move a fraction `alpha` of the way from `self` towards `target`: `self + alpha (target - self)`.
    ///
    /// Only the keys of `target` are modified.
    pub fn step_towards(&mut self, target: &VectorValues<K>, alpha: f64) -> CoreResult<()> {
        for (key, goal) in target.iter() {
            let current = self.checked_entry(key, goal.len())?.clone();
            let next = &current + (goal - &current) * alpha;
            self.values.insert(key.clone(), next);
        }
        Ok(())
    }

    /// Largest absolute element-wise difference over the keys of `other`
    pub fn max_abs_diff(&self, other: &VectorValues<K>) -> CoreResult<f64> {
        let mut max_diff: f64 = 0.0;
        for (key, value) in other.iter() {
            let current = self.checked_entry(key, value.len())?;
            let diff = (current - value).amax();
            max_diff = max_diff.max(diff);
        }
        Ok(max_diff)
    }

    /// Check whether both assignments hold the same keys with values equal within `tolerance`
    pub fn equals(&self, other: &VectorValues<K>, tolerance: f64) -> bool {
        self.len() == other.len()
            && self
                .max_abs_diff(other)
                .is_ok_and(|max_diff| max_diff <= tolerance)
    }

    /// L2 norm of all stacked values
    pub fn norm(&self) -> f64 {
        self.values
            .values()
            .map(|v| v.norm_squared())
            .sum::<f64>()
            .sqrt()
    }

    /// Check that every value is finite
    pub fn is_finite(&self) -> bool {
        self.values
            .values()
            .all(|v| v.iter().all(|entry| entry.is_finite()))
    }

    fn checked_entry(&self, key: &K, dim: usize) -> CoreResult<&DVector<f64>> {
        let current = self.try_get(key)?;
        if current.len() != dim {
            return Err(CoreError::DimensionMismatch(format!(
                "key {} has dimension {} but {} was expected",
                key,
                current.len(),
                dim
            )));
        }
        Ok(current)
    }
}

impl<K: Key> FromIterator<(K, DVector<f64>)> for VectorValues<K> {
    fn from_iter<I: IntoIterator<Item = (K, DVector<f64>)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl<K: Key> IntoIterator for VectorValues<K> {
    type Item = (K, DVector<f64>);
    type IntoIter = btree_map::IntoIter<K, DVector<f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a, K: Key> IntoIterator for &'a VectorValues<K> {
    type Item = (&'a K, &'a DVector<f64>);
    type IntoIter = btree_map::Iter<'a, K, DVector<f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn sample() -> VectorValues {
        let mut values = VectorValues::new();
        values.insert("x1".to_string(), dvector![0.0, 0.0]);
        values.insert("x2".to_string(), dvector![1.0]);
        values
    }

    #[test]
    fn test_step_towards_partial_fraction() -> TestResult {
        let mut current = sample();
        let mut target = VectorValues::new();
        target.insert("x1".to_string(), dvector![3.0, -6.0]);
        target.insert("x2".to_string(), dvector![4.0]);

        current.step_towards(&target, 1.0 / 3.0)?;

        let x1 = current.try_get(&"x1".to_string())?;
        assert!((x1[0] - 1.0).abs() < 1e-12);
        assert!((x1[1] + 2.0).abs() < 1e-12);
        assert!((current.try_get(&"x2".to_string())?[0] - 2.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_step_towards_missing_key_fails() {
        let mut current = sample();
        let mut target = VectorValues::new();
        target.insert("x9".to_string(), dvector![1.0]);

        let result = current.step_towards(&target, 0.5);
        assert!(matches!(result, Err(CoreError::MissingValue(_))));
    }

    #[test]
    fn test_max_abs_diff_dimension_mismatch() {
        let current = sample();
        let mut other = VectorValues::new();
        other.insert("x2".to_string(), dvector![1.0, 2.0]);

        let result = current.max_abs_diff(&other);
        assert!(matches!(result, Err(CoreError::DimensionMismatch(_))));
    }

    #[test]
    fn test_equals_with_tolerance() {
        let a = sample();
        let mut b = sample();
        if let Some(v) = b.get_mut(&"x2".to_string()) {
            v[0] += 1e-7;
        }

        assert!(a.equals(&b, 1e-6));
        assert!(!a.equals(&b, 1e-8));

        b.insert("x3".to_string(), dvector![0.0]);
        assert!(!a.equals(&b, 1.0), "different key sets never compare equal");
    }

    #[test]
    fn test_update_keeps_untouched_keys() {
        let mut current = sample();
        let mut partial = VectorValues::new();
        partial.insert("x2".to_string(), dvector![5.0]);

        current.update(&partial);
        assert_eq!(current.len(), 2);
        assert_eq!(current.get(&"x2".to_string()), Some(&dvector![5.0]));
        assert_eq!(current.get(&"x1".to_string()), Some(&dvector![0.0, 0.0]));
    }

    #[test]
    fn test_integer_keys_and_norm() {
        let values: VectorValues<usize> =
            [(1, dvector![3.0]), (4, dvector![4.0])].into_iter().collect();
        assert_eq!(values.keys().copied().collect::<Vec<_>>(), vec![1, 4]);
        assert!((values.norm() - 5.0).abs() < 1e-12);
        assert!(values.is_finite());
    }
}
