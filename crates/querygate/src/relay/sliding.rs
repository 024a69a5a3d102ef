//! Single-slot collapsing channel.
//!
//! The staging area between the keep-alive loop and the response body: a
//! newer item overwrites an undelivered predecessor, so a slow client never
//! accumulates heartbeats. The newest item wins; nothing queues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Returned by [`Sender::send`] when the receiver is gone; carries the
/// rejected item.
#[derive(Debug, thiserror::Error)]
#[error("sliding channel receiver dropped")]
pub struct SendError<T>(pub T);

struct Shared<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
    rx_dropped: AtomicBool,
    tx_dropped: AtomicBool,
}

pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(None),
        notify: Notify::new(),
        rx_dropped: AtomicBool::new(false),
        tx_dropped: AtomicBool::new(false),
    });
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Stage `item`, replacing any undelivered predecessor.
    pub fn send(&self, item: T) -> Result<(), SendError<T>> {
        if self.shared.rx_dropped.load(Ordering::Acquire) {
            return Err(SendError(item));
        }
        *self.shared.slot.lock().unwrap() = Some(item);
        self.shared.notify.notify_one();
        Ok(())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.shared.tx_dropped.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Take the latest staged item. `None` once the sender is gone and the
    /// slot is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking, so a send racing the check still
            // wakes us.
            notified.as_mut().enable();

            if let Some(item) = self.shared.slot.lock().unwrap().take() {
                return Some(item);
            }
            if self.shared.tx_dropped.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Take the staged item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.shared.slot.lock().unwrap().take()
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.rx_dropped.store(true, Ordering::Release);
    }
}
