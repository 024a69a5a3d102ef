//! Per-database admission permits.
//!
//! A [`PermitBroker`] caps concurrent query execution against one database;
//! the [`BrokerRegistry`] creates brokers lazily per database id. Abandoned
//! permits (dropped without release) are recovered by the broker's weak
//! reference sweep.

mod broker;
mod registry;

pub use broker::{AcquireError, Permit, PermitBroker, PermitId};
pub use registry::{BrokerRegistry, DatabaseId};
