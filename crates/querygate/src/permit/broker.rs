//! Per-database permit broker with abandoned-permit recovery.
//!
//! Permits are handed out as `Arc<Permit>`; the broker keeps only weak
//! references in its live set. A holder that drops its permit without
//! releasing shows up as a dead weak reference, and the next time the free
//! queue runs dry the broker task sweeps the live set and mints
//! replacements, so buggy callers cannot permanently shrink capacity.
//!
//! Releases and recoveries always mint a fresh permit under a new id; an old
//! id can never re-credit the broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Broker-local permit identifier, monotonic within one broker.
pub type PermitId = u64;

/// A unit of admission; possession entitles the holder to run one query.
///
/// Single-use: the first `release` returns it to the broker, later calls are
/// no-ops. Dropping a permit without releasing it does not credit the broker
/// on its own; the broker's sweep recovers it.
#[derive(Debug)]
pub struct Permit {
    id: PermitId,
    released: AtomicBool,
    return_tx: mpsc::UnboundedSender<PermitId>,
}

impl Permit {
    pub fn id(&self) -> PermitId {
        self.id
    }

    /// Return this permit to its broker. Idempotent; a release after the
    /// broker has closed is silently ignored.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            let _ = self.return_tx.send(self.id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    /// The broker was closed; no permit was consumed.
    #[error("permit broker is closed")]
    Closed,
}

/// Counting-semaphore manager for one database.
///
/// Must be created from within a Tokio runtime: construction spawns the
/// housekeeping task that serialises release and sweep events.
pub struct PermitBroker {
    capacity: usize,
    free_rx: Mutex<mpsc::Receiver<Arc<Permit>>>,
    available: Arc<AtomicUsize>,
    recovered: Arc<AtomicU64>,
    sweep: Arc<Notify>,
    shutdown: CancellationToken,
}

impl PermitBroker {
    /// Create a broker holding `capacity` permits.
    ///
    /// Capacity 0 is legal: nothing is ever handed out and every acquire
    /// parks until the broker is closed.
    pub fn new(capacity: usize) -> Self {
        let (free_tx, free_rx) = mpsc::channel(capacity.max(1));
        let (return_tx, return_rx) = mpsc::unbounded_channel();
        let available = Arc::new(AtomicUsize::new(0));
        let recovered = Arc::new(AtomicU64::new(0));
        let sweep = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let task = BrokerTask {
            live: HashMap::new(),
            next_id: 0,
            free_tx,
            return_tx,
            return_rx,
            available: Arc::clone(&available),
            recovered: Arc::clone(&recovered),
            sweep: Arc::clone(&sweep),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(task.run(capacity));

        Self {
            capacity,
            free_rx: Mutex::new(free_rx),
            available,
            recovered,
            sweep,
            shutdown,
        }
    }

    /// Take a permit, waiting until one is available.
    ///
    /// Cancel-safe: dropping the future before it resolves consumes nothing.
    /// Waiters are served roughly in arrival order via the receiver lock.
    pub async fn acquire(&self) -> Result<Arc<Permit>, AcquireError> {
        if self.shutdown.is_cancelled() {
            return Err(AcquireError::Closed);
        }
        let mut rx = self.free_rx.lock().await;
        match rx.try_recv() {
            Ok(permit) => {
                self.available.fetch_sub(1, Ordering::AcqRel);
                return Ok(permit);
            }
            Err(TryRecvError::Empty) => {
                // Free queue ran dry: nudge the broker task to sweep for
                // abandoned permits before we park.
                self.sweep.notify_one();
            }
            Err(TryRecvError::Disconnected) => return Err(AcquireError::Closed),
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(AcquireError::Closed),
            permit = rx.recv() => match permit {
                Some(permit) => {
                    self.available.fetch_sub(1, Ordering::AcqRel);
                    Ok(permit)
                }
                None => Err(AcquireError::Closed),
            }
        }
    }

    /// Non-blocking acquire. An empty free queue still triggers a sweep, so
    /// a caller retrying shortly after may succeed.
    pub fn try_acquire(&self) -> Option<Arc<Permit>> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        let mut rx = self.free_rx.try_lock().ok()?;
        match rx.try_recv() {
            Ok(permit) => {
                self.available.fetch_sub(1, Ordering::AcqRel);
                Some(permit)
            }
            Err(TryRecvError::Empty) => {
                self.sweep.notify_one();
                None
            }
            Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Number of abandoned permits recovered by sweeps.
    pub fn abandoned_recovered(&self) -> u64 {
        self.recovered.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close the broker: pending and future acquires fail with
    /// [`AcquireError::Closed`]. Permits already handed out stay valid for
    /// their holders; releasing them becomes a no-op.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Owns the live set; the sole mutator of broker state.
struct BrokerTask {
    live: HashMap<PermitId, Weak<Permit>>,
    next_id: PermitId,
    free_tx: mpsc::Sender<Arc<Permit>>,
    return_tx: mpsc::UnboundedSender<PermitId>,
    return_rx: mpsc::UnboundedReceiver<PermitId>,
    available: Arc<AtomicUsize>,
    recovered: Arc<AtomicU64>,
    sweep: Arc<Notify>,
    shutdown: CancellationToken,
}

impl BrokerTask {
    async fn run(mut self, capacity: usize) {
        for _ in 0..capacity {
            self.mint();
        }
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(id) = self.return_rx.recv() => self.handle_return(id),
                _ = self.sweep.notified() => self.sweep_live(),
            }
        }
        tracing::debug!("permit broker task exiting");
    }

    fn handle_return(&mut self, id: PermitId) {
        // Only ids still in the live set credit the broker; a stale release
        // for a reclaimed permit is ignored.
        if self.live.remove(&id).is_some() {
            tracing::trace!(permit = id, "permit returned");
            self.mint();
        } else {
            tracing::debug!(permit = id, "ignoring release of reclaimed permit");
        }
    }

    fn sweep_live(&mut self) {
        // Drain pending returns first so a released-then-dropped permit is
        // credited through the release path, not counted as abandoned.
        while let Ok(id) = self.return_rx.try_recv() {
            self.handle_return(id);
        }

        let dead: Vec<PermitId> = self
            .live
            .iter()
            .filter(|(_, weak)| weak.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.live.remove(&id);
            self.recovered.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(permit = id, "recovered permit abandoned by its holder");
            self.mint();
        }
    }

    fn mint(&mut self) {
        let id = self.next_id;
        self.next_id += 1;

        let permit = Arc::new(Permit {
            id,
            released: AtomicBool::new(false),
            return_tx: self.return_tx.clone(),
        });
        self.live.insert(id, Arc::downgrade(&permit));
        self.available.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.free_tx.try_send(permit) {
            self.available.fetch_sub(1, Ordering::AcqRel);
            self.live.remove(&id);
            tracing::error!(permit = id, error = %err, "failed to queue freed permit");
        }
    }
}
