//! Single-shot result handle returned to query submitters.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Terminal outcome of a query: the row payload, or an error descriptor.
pub type QueryOutcome = Result<serde_json::Value, QueryError>;

/// Errors that can land in a [`ResultHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The database's permit broker was closed before admission.
    #[error("query broker is closed")]
    BrokerClosed,

    /// The worker returned an error or panicked.
    #[error("{message}")]
    Worker { message: String },

    /// The producer side vanished without delivering a value.
    #[error("query result channel closed unexpectedly")]
    ChannelClosed,
}

impl QueryError {
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }
}

struct HandleState {
    outcome: Option<QueryOutcome>,
    closed: bool,
}

struct Inner {
    state: Mutex<HandleState>,
    settled_tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

/// Consumer-facing, closeable, single-shot receptacle for a worker's outcome.
///
/// Clones share the underlying slot: the producer side delivers, the consumer
/// side awaits or closes. Closing before delivery is the cancellation signal;
/// the worker observes it through [`ResultHandle::cancellation`].
///
/// Exactly one of {value, error, closed-without-value} is the terminal state.
#[derive(Clone)]
pub struct ResultHandle {
    inner: Arc<Inner>,
}

impl ResultHandle {
    pub fn new() -> Self {
        let (settled_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HandleState {
                    outcome: None,
                    closed: false,
                }),
                settled_tx,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Publish the terminal outcome. The first delivery wins; anything after
    /// a delivery or a close is dropped silently.
    ///
    /// Returns whether the delivery landed.
    pub fn deliver(&self, outcome: QueryOutcome) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed || state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
        }
        self.inner.settled_tx.send_replace(true);
        true
    }

    /// Await the outcome. `None` means the handle was closed before a value
    /// arrived.
    ///
    /// A settled outcome is retained: repeated calls observe the same value.
    pub async fn recv(&self) -> Option<QueryOutcome> {
        let mut settled_rx = self.inner.settled_tx.subscribe();
        loop {
            {
                let state = self.inner.state.lock().unwrap();
                if let Some(outcome) = state.outcome.clone() {
                    return Some(outcome);
                }
                if state.closed {
                    return None;
                }
            }
            tokio::select! {
                changed = settled_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = self.inner.cancel.cancelled() => {}
            }
        }
    }

    /// Close the handle. No-op once settled; otherwise marks it closed and
    /// fires the cancellation token. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed || state.outcome.is_some() {
                return;
            }
            state.closed = true;
        }
        self.inner.cancel.cancel();
    }

    pub fn is_settled(&self) -> bool {
        self.inner.state.lock().unwrap().outcome.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// The cancellation signal fired when the consumer closes the handle
    /// before delivery. Handed to workers for cooperative abort.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Completes when the handle is closed without a value.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }
}

impl Default for ResultHandle {
    fn default() -> Self {
        Self::new()
    }
}
