//! Keep-alive relay between a pending result and the response body.

pub mod sliding;

mod keepalive;

pub use keepalive::{spawn, RelayItem};
