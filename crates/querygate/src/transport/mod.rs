//! Transport adapters.
//!
//! Currently HTTP: a response whose body keeps a long-polling client alive
//! until the query result lands.

pub mod http;
