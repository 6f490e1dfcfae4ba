//! Observer pattern for monitoring active-set iterations.
//!
//! Observers are notified after every outer iteration of
//! [`QpSolver::optimize`](crate::optimizer::QpSolver::optimize) with the current primal
//! assignment and working set. They are used for logging, recording traces and debugging.
//!
//! # Example
//!
//! ```
//! use factor_qp::core::VectorValues;
//! use factor_qp::observers::QpObserver;
//! use factor_qp::optimizer::WorkingSet;
//!
//! struct PrintObserver;
//!
//! impl QpObserver<String> for PrintObserver {
//!     fn on_step(&self, values: &VectorValues, working_set: &WorkingSet, iteration: usize) {
//!         println!("#{iteration}: {} active rows, |x| = {:.3}", working_set.len(), values.norm());
//!     }
//! }
//! ```

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::error;

use crate::core::{Key, VectorValues};
use crate::optimizer::WorkingSet;

/// Observer-specific error types
#[derive(Debug, Clone, Error)]
pub enum ObserverError {
    /// Mutex was poisoned (a thread panicked while holding the lock)
    #[error("Mutex poisoned in {context}: {reason}")]
    MutexPoisoned { context: String, reason: String },
}

impl ObserverError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for observer operations
pub type ObserverResult<T> = Result<T, ObserverError>;

/// Observer notified after each active-set iteration.
pub trait QpObserver<K: Key>: Send {
    /// Called once per outer iteration with the state after the iteration
    fn on_step(&self, values: &VectorValues<K>, working_set: &WorkingSet, iteration: usize);

    /// Receive the scalar metrics of the iteration, before [`QpObserver::on_step`].
    ///
    /// `step_fraction` is `None` for iterations that did not move the primal point.
    fn set_iteration_metrics(&self, _cost: f64, _step_fraction: Option<f64>) {
        // Default implementation does nothing
    }
}

/// Collection of observers notified in registration order
pub struct QpObserverVec<K: Key> {
    observers: Vec<Box<dyn QpObserver<K>>>,
}

impl<K: Key> Default for QpObserverVec<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> QpObserverVec<K> {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    pub fn add(&mut self, observer: impl QpObserver<K> + 'static) {
        self.observers.push(Box::new(observer));
    }

    #[inline]
    pub fn set_iteration_metrics(&self, cost: f64, step_fraction: Option<f64>) {
        for observer in &self.observers {
            observer.set_iteration_metrics(cost, step_fraction);
        }
    }

    #[inline]
    pub fn notify(&self, values: &VectorValues<K>, working_set: &WorkingSet, iteration: usize) {
        for observer in &self.observers {
            observer.on_step(values, working_set, iteration);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observers.len()
    }
}

/// One recorded iteration
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry<K: Key> {
    pub iteration: usize,
    pub values: VectorValues<K>,
    pub working_set: WorkingSet,
}

/// Observer recording the primal iterates and working sets of a run.
///
/// Clones share the same trace, so a clone can be registered with the solver and the
/// original inspected afterwards.
#[derive(Debug, Clone)]
pub struct TraceRecorder<K: Key> {
    entries: Arc<Mutex<Vec<TraceEntry<K>>>>,
}

impl<K: Key> Default for TraceRecorder<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> TraceRecorder<K> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of the recorded iterations
    pub fn entries(&self) -> ObserverResult<Vec<TraceEntry<K>>> {
        let guard = self.entries.lock().map_err(|e| {
            ObserverError::MutexPoisoned {
                context: "TraceRecorder::entries".to_string(),
                reason: e.to_string(),
            }
            .log()
        })?;
        Ok(guard.clone())
    }
}

impl<K: Key + Send + 'static> QpObserver<K> for TraceRecorder<K> {
    fn on_step(&self, values: &VectorValues<K>, working_set: &WorkingSet, iteration: usize) {
        // The entry is dropped if the lock is poisoned
        if let Ok(mut guard) = self.entries.lock().map_err(|e| {
            ObserverError::MutexPoisoned {
                context: "TraceRecorder::on_step".to_string(),
                reason: e.to_string(),
            }
            .log()
        }) {
            guard.push(TraceEntry {
                iteration,
                values: values.clone(),
                working_set: working_set.clone(),
            });
        }
    }
}
