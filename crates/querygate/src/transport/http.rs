//! HTTP response adapter: long-poll body with keep-alive heartbeats.
//!
//! The body is a stream of zero or more newline bytes followed by exactly
//! one JSON document. Intermediate newlines are JSON whitespace, so clients
//! parse the stream with no extra framing while intermediate proxies see
//! regular traffic and keep the connection open.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderValue;
use axum::response::Response;
use bytes::Bytes;
use futures::stream;

use crate::config::DEFAULT_KEEPALIVE_INTERVAL;
use crate::handle::{QueryError, ResultHandle};
use crate::relay::{self, RelayItem};

/// Produces the JSON error envelope sent to clients.
pub type ErrorFormatter = Arc<dyn Fn(&QueryError) -> serde_json::Value + Send + Sync>;

/// Default envelope: `{"status":"failed","message":...}`.
pub fn default_error_formatter() -> ErrorFormatter {
    Arc::new(|error| {
        serde_json::json!({
            "status": "failed",
            "message": error.to_string(),
        })
    })
}

/// Tunables for a streaming query response.
#[derive(Clone)]
pub struct StreamingOptions {
    /// Interval between heartbeat bytes while the result is pending.
    pub heartbeat: Duration,
    /// Shapes the error payload written for failed queries.
    pub format_error: ErrorFormatter,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_KEEPALIVE_INTERVAL,
            format_error: default_error_formatter(),
        }
    }
}

impl StreamingOptions {
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Build the `application/json` response for a pending query.
///
/// Dropping the body before the terminal frame (client disconnect) closes
/// the handle, cancelling the query and releasing its permit.
pub fn streaming_response(handle: ResultHandle, options: StreamingOptions) -> Response {
    let writer = BodyWriter {
        relay: relay::spawn(handle.clone(), options.heartbeat),
        guard: DisconnectGuard::new(handle),
        format_error: options.format_error,
        done: false,
    };
    let body = Body::from_stream(stream::unfold(writer, |mut writer| async move {
        writer
            .next_frame()
            .await
            .map(|frame| (Ok::<Bytes, std::convert::Infallible>(frame), writer))
    }));

    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Consumes relay items and serialises them into body frames.
struct BodyWriter {
    relay: relay::sliding::Receiver<RelayItem>,
    guard: DisconnectGuard,
    format_error: ErrorFormatter,
    done: bool,
}

impl BodyWriter {
    async fn next_frame(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }
        match self.relay.recv().await {
            Some(RelayItem::Heartbeat) => Some(Bytes::from_static(b"\n")),
            Some(RelayItem::Terminal(outcome)) => {
                self.done = true;
                self.guard.disarm();
                let document = match outcome {
                    Ok(payload) => payload,
                    Err(error) => (self.format_error)(&error),
                };
                match serde_json::to_vec(&document) {
                    Ok(encoded) => Some(Bytes::from(encoded)),
                    Err(error) => {
                        tracing::error!(error = %error, "failed to encode terminal payload");
                        None
                    }
                }
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Closes the handle when the body is dropped before the terminal frame,
/// propagating cancellation to the worker.
struct DisconnectGuard {
    handle: Option<ResultHandle>,
}

impl DisconnectGuard {
    fn new(handle: ResultHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_settled() && !handle.is_closed() {
                tracing::info!("client disconnected before query completion; cancelling");
            }
            handle.close();
        }
    }
}
