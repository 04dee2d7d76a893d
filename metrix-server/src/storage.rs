use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use metrix_proto::{Metric, MetricValue};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage lock poisoned")]
    Poisoned,
    #[error("counter {0} would overflow")]
    Overflow(String),
}

impl<T> From<PoisonError<T>> for StorageError {
    fn from(_: PoisonError<T>) -> Self {
        StorageError::Poisoned
    }
}

/// Storage capability the collector writes metrics into.
///
/// Shared between the ingest path and the query routes, hence `Send + Sync`.
pub trait Storager: Send + Sync {
    fn set_gauge(&self, name: &str, value: f64) -> Result<(), StorageError>;

    fn get_gauge(&self, name: &str) -> Option<f64>;

    /// Adds `delta` to the stored counter, starting from zero.
    fn add_counter(&self, name: &str, delta: i64) -> Result<(), StorageError>;

    fn get_counter(&self, name: &str) -> Option<i64>;

    fn gauges(&self) -> HashMap<String, f64>;

    fn counters(&self) -> HashMap<String, i64>;

    /// Writes every metric or none of them.
    fn apply(&self, metrics: &[Metric]) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemStorage {
    gauges: RwLock<HashMap<String, f64>>,
    counters: RwLock<HashMap<String, i64>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storager for MemStorage {
    fn set_gauge(&self, name: &str, value: f64) -> Result<(), StorageError> {
        self.gauges.write()?.insert(name.to_owned(), value);
        Ok(())
    }

    fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().ok()?.get(name).copied()
    }

    fn add_counter(&self, name: &str, delta: i64) -> Result<(), StorageError> {
        let mut counters = self.counters.write()?;
        let counter = counters.entry(name.to_owned()).or_insert(0);
        *counter = counter
            .checked_add(delta)
            .ok_or_else(|| StorageError::Overflow(name.to_owned()))?;
        Ok(())
    }

    fn get_counter(&self, name: &str) -> Option<i64> {
        self.counters.read().ok()?.get(name).copied()
    }

    fn gauges(&self) -> HashMap<String, f64> {
        self.gauges
            .read()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    fn counters(&self) -> HashMap<String, i64> {
        self.counters
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn apply(&self, metrics: &[Metric]) -> Result<(), StorageError> {
        // both locks are held for the whole batch, always gauges first
        let mut gauges = self.gauges.write()?;
        let mut counters = self.counters.write()?;

        // stage counter totals so an overflow aborts before anything is written
        let mut staged: HashMap<&str, i64> = HashMap::new();
        for metric in metrics {
            if let MetricValue::Counter(delta) = metric.value {
                let current = match staged.get(metric.id.as_str()) {
                    Some(v) => *v,
                    None => counters.get(&metric.id).copied().unwrap_or(0),
                };
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| StorageError::Overflow(metric.id.clone()))?;
                staged.insert(&metric.id, next);
            }
        }

        for metric in metrics {
            if let MetricValue::Gauge(value) = metric.value {
                gauges.insert(metric.id.clone(), value);
            }
        }
        for (name, total) in staged {
            counters.insert(name.to_owned(), total);
        }
        Ok(())
    }
}
