//! Lazily-created, per-database permit brokers.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::AdmissionConfig;

use super::PermitBroker;

/// Stable identifier of a backend database.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct DatabaseId(pub i64);

impl From<i64> for DatabaseId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps database ids to their permit brokers.
///
/// Insertion-only: brokers are created on first use and live for the rest of
/// the process. Not a singleton; construct one per server (or per test) and
/// share it.
pub struct BrokerRegistry {
    brokers: DashMap<DatabaseId, Arc<PermitBroker>>,
    config: AdmissionConfig,
}

impl BrokerRegistry {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            brokers: DashMap::new(),
            config,
        }
    }

    /// The broker for `db_id`, created on first use.
    ///
    /// Creation runs under the map's shard lock, so racing callers all
    /// observe the same broker and its constructor runs exactly once.
    /// Capacity is read from the config at creation time; later config
    /// changes do not resize existing brokers.
    pub fn broker_for(&self, db_id: DatabaseId) -> Arc<PermitBroker> {
        if let Some(broker) = self.brokers.get(&db_id) {
            return Arc::clone(&broker);
        }
        match self.brokers.entry(db_id) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let capacity = self.config.max_simultaneous_queries_per_db;
                tracing::debug!(db = %db_id, capacity, "creating permit broker");
                let broker = Arc::new(PermitBroker::new(capacity));
                entry.insert(Arc::clone(&broker));
                broker
            }
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }
}
