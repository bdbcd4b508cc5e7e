// Storage module - latest value per metric, shared by the poller and scrapes
//
// This module is responsible for:
// 1. Holding one snapshot per enabled metric behind its own lock
// 2. Letting polling tasks replace a snapshot as a single unit
// 3. Letting scrapes copy snapshots out without blocking unrelated metrics
//
// The key set is fixed when the store is built, so the map itself is never
// mutated and needs no lock. Locks are only held to clone or assign.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error};

use crate::scheduler::PollError;

/// Errors that can occur when accessing snapshots
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("no snapshot slot for metric '{0}'")]
    UnknownMetric(String),

    #[error("snapshot lock for metric '{0}' is poisoned")]
    Poisoned(String),
}

/// Last known state of one metric
///
/// Before the first successful poll the value is `0.0` and `last_updated`
/// is `None`; such a snapshot is still exposed on scrape.
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    pub value: f64,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_error: Option<Arc<PollError>>,
}

impl MetricSnapshot {
    /// Whether at least one poll has succeeded for this metric
    pub fn is_populated(&self) -> bool {
        self.last_updated.is_some()
    }
}

/// Per-metric snapshot slots
pub struct SnapshotStore {
    entries: HashMap<String, RwLock<MetricSnapshot>>,
}

impl SnapshotStore {
    /// Creates one empty slot per identifier
    pub fn new<'a>(identifiers: impl IntoIterator<Item = &'a str>) -> Self {
        let entries = identifiers
            .into_iter()
            .map(|id| (id.to_string(), RwLock::new(MetricSnapshot::default())))
            .collect();

        SnapshotStore { entries }
    }

    fn slot(&self, identifier: &str) -> Result<&RwLock<MetricSnapshot>, StorageError> {
        self.entries
            .get(identifier)
            .ok_or_else(|| StorageError::UnknownMetric(identifier.to_string()))
    }

    /// Stores a freshly computed value and clears the last error.
    pub fn record_success(
        &self,
        identifier: &str,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let snapshot = MetricSnapshot {
            value,
            last_updated: Some(at),
            last_error: None,
        };

        let slot = self.slot(identifier)?;
        let mut guard = slot
            .write()
            .map_err(|_| StorageError::Poisoned(identifier.to_string()))?;
        *guard = snapshot;
        drop(guard);

        debug!("Stored {} = {}", identifier, value);
        Ok(())
    }

    /// Records a failed poll; the previous value stays in place.
    pub fn record_failure(
        &self,
        identifier: &str,
        error: Arc<PollError>,
    ) -> Result<(), StorageError> {
        let slot = self.slot(identifier)?;
        let mut guard = slot
            .write()
            .map_err(|_| StorageError::Poisoned(identifier.to_string()))?;
        guard.last_error = Some(error);
        Ok(())
    }

    /// Copies out the current snapshot of one metric
    pub fn read(&self, identifier: &str) -> Result<MetricSnapshot, StorageError> {
        let slot = self.slot(identifier)?;
        match slot.read() {
            Ok(guard) => Ok(guard.clone()),
            Err(_) => {
                error!("Snapshot lock for '{}' is poisoned", identifier);
                Err(StorageError::Poisoned(identifier.to_string()))
            }
        }
    }

    /// Copies out every snapshot, keyed by identifier.
    ///
    /// Each entry is read under its own lock; entries whose lock is poisoned
    /// are reported alongside the readable ones.
    pub fn read_all(&self) -> (HashMap<String, MetricSnapshot>, Vec<StorageError>) {
        let mut snapshots = HashMap::with_capacity(self.entries.len());
        let mut faults = Vec::new();

        for identifier in self.entries.keys() {
            match self.read(identifier) {
                Ok(snapshot) => {
                    snapshots.insert(identifier.clone(), snapshot);
                }
                Err(e) => faults.push(e),
            }
        }

        (snapshots, faults)
    }
}
