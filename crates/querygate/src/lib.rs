//! querygate: asynchronous query admission and streaming-response core.
//!
//! Bounds concurrent query execution per backend database with recoverable
//! permits, returns a closeable [`ResultHandle`] for the pending result, and
//! adapts that handle into a long-poll HTTP response that heartbeats until
//! the result lands. Closing the handle, explicitly or implicitly when the
//! client drops the response body, cancels the worker and frees its permit.

mod config;
mod handle;
mod service;

pub mod permit;
pub mod relay;
pub mod transport;

pub use config::{
    AdmissionConfig, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_MAX_SIMULTANEOUS_QUERIES_PER_DB,
};
pub use handle::{QueryError, QueryOutcome, ResultHandle};
pub use permit::{AcquireError, BrokerRegistry, DatabaseId, Permit, PermitBroker, PermitId};
pub use service::QueryService;
pub use transport::http::{
    default_error_formatter, streaming_response, ErrorFormatter, StreamingOptions,
};
