//! Constraint classification and the active-set working set.

use std::collections::{BTreeSet, btree_set};
use std::fmt;

use crate::core::{GaussianFactorGraph, Key};
use crate::factors::ConstraintKind;

/// One row of a constraint factor, identified by factor index and row index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstraintRow {
    pub factor: usize,
    pub row: usize,
}

impl ConstraintRow {
    pub fn new(factor: usize, row: usize) -> Self {
        Self { factor, row }
    }
}

impl fmt::Display for ConstraintRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.factor, self.row)
    }
}

/// Inequality rows currently enforced as equalities.
///
/// Ordered by factor index, then row index. Set semantics rule out duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkingSet {
    rows: BTreeSet<ConstraintRow>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row, returning false if it was already present
    pub fn insert(&mut self, row: ConstraintRow) -> bool {
        self.rows.insert(row)
    }

    /// Remove a row, returning false if it was absent
    pub fn remove(&mut self, row: &ConstraintRow) -> bool {
        self.rows.remove(row)
    }

    pub fn contains(&self, row: &ConstraintRow) -> bool {
        self.rows.contains(row)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, ConstraintRow> {
        self.rows.iter()
    }

    /// Row indices of `factor` in the working set, ascending
    pub fn rows_of(&self, factor: usize) -> Vec<usize> {
        self.rows
            .range(ConstraintRow::new(factor, 0)..=ConstraintRow::new(factor, usize::MAX))
            .map(|row| row.row)
            .collect()
    }

    /// Factors with at least one row in the working set
    pub fn factors(&self) -> BTreeSet<usize> {
        self.rows.iter().map(|row| row.factor).collect()
    }
}

impl FromIterator<ConstraintRow> for WorkingSet {
    fn from_iter<I: IntoIterator<Item = ConstraintRow>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a WorkingSet {
    type Item = &'a ConstraintRow;
    type IntoIter = btree_set::Iter<'a, ConstraintRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl fmt::Display for WorkingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{row}")?;
        }
        write!(f, "}}")
    }
}

/// Indices of the factors carrying at least one inequality row, in graph order.
pub fn constraint_indices<K: Key>(graph: &GaussianFactorGraph<K>) -> Vec<usize> {
    graph
        .enumerate()
        .filter(|(_, factor)| {
            factor
                .as_constraint()
                .is_some_and(|constraint| constraint.has_inequality())
        })
        .map(|(index, _)| index)
        .collect()
}

/// Indices of the factors carrying at least one equality row, in graph order.
pub fn equality_indices<K: Key>(graph: &GaussianFactorGraph<K>) -> Vec<usize> {
    graph
        .enumerate()
        .filter(|(_, factor)| {
            factor
                .as_constraint()
                .is_some_and(|constraint| constraint.has_equality())
        })
        .map(|(index, _)| index)
        .collect()
}

/// Every inequality row of the graph, in factor then row order.
pub fn inequality_rows<K: Key>(graph: &GaussianFactorGraph<K>) -> Vec<ConstraintRow> {
    graph
        .enumerate()
        .filter_map(|(index, factor)| factor.as_constraint().map(|c| (index, c)))
        .flat_map(|(index, constraint)| {
            constraint
                .inequality_rows()
                .map(move |row| ConstraintRow::new(index, row))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Kind of the row named by `row`, `None` if the graph has no such constraint row
pub fn row_kind<K: Key>(
    graph: &GaussianFactorGraph<K>,
    row: &ConstraintRow,
) -> Option<ConstraintKind> {
    graph
        .at(row.factor)
        .and_then(|factor| factor.as_constraint())
        .and_then(|constraint| constraint.row_kind(row.row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{HessianFactor, JacobianFactor};
    use nalgebra::{DMatrix, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn mixed_graph() -> Result<GaussianFactorGraph, Box<dyn std::error::Error>> {
        let mut graph = GaussianFactorGraph::new();
        graph.push(HessianFactor::unary(
            "x".to_string(),
            DMatrix::identity(1, 1),
            dvector![0.0],
            0.0,
        )?);
        graph.push(JacobianFactor::equality(
            vec![("x".to_string(), DMatrix::identity(1, 1))],
            dvector![1.0],
        )?);
        graph.push(JacobianFactor::constrained_with_sigmas(
            vec![("x".to_string(), DMatrix::from_column_slice(3, 1, &[1.0, 2.0, 3.0]))],
            dvector![1.0, 2.0, 3.0],
            &[-1.0, 0.0, -1.0],
        )?);
        graph.push(JacobianFactor::new(
            vec![("x".to_string(), DMatrix::identity(1, 1))],
            dvector![0.0],
        )?);
        Ok(graph)
    }

    #[test]
    fn test_classification() -> TestResult {
        let graph = mixed_graph()?;
        assert_eq!(constraint_indices(&graph), vec![2]);
        assert_eq!(equality_indices(&graph), vec![1, 2]);
        assert_eq!(
            inequality_rows(&graph),
            vec![ConstraintRow::new(2, 0), ConstraintRow::new(2, 2)]
        );
        assert_eq!(
            row_kind(&graph, &ConstraintRow::new(2, 1)),
            Some(ConstraintKind::Equality)
        );
        assert_eq!(row_kind(&graph, &ConstraintRow::new(0, 0)), None);
        assert_eq!(row_kind(&graph, &ConstraintRow::new(9, 0)), None);
        Ok(())
    }

    #[test]
    fn test_working_set_is_a_set() {
        let mut working_set = WorkingSet::new();
        assert!(working_set.insert(ConstraintRow::new(3, 1)));
        assert!(working_set.insert(ConstraintRow::new(1, 2)));
        assert!(!working_set.insert(ConstraintRow::new(3, 1)));
        assert!(working_set.insert(ConstraintRow::new(3, 0)));

        assert_eq!(working_set.len(), 3);
        assert_eq!(working_set.rows_of(3), vec![0, 1]);
        assert_eq!(working_set.rows_of(2), Vec::<usize>::new());
        assert_eq!(working_set.factors().into_iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(working_set.to_string(), "{(1, 2), (3, 0), (3, 1)}");

        assert!(working_set.remove(&ConstraintRow::new(3, 1)));
        assert!(!working_set.remove(&ConstraintRow::new(3, 1)));
        assert!(!working_set.contains(&ConstraintRow::new(3, 1)));
    }
}
