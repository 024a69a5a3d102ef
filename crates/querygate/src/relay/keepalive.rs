//! Keep-alive loop bridging a pending result to the response body.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};

use crate::handle::{QueryError, QueryOutcome, ResultHandle};

use super::sliding;

/// Items staged for the body writer.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayItem {
    /// Periodic liveness byte for the client.
    Heartbeat,
    /// The terminal payload: query rows or error descriptor. Always the last
    /// item.
    Terminal(QueryOutcome),
}

/// Spawn the keep-alive loop over `handle`.
///
/// Until the handle settles, a heartbeat is staged every `heartbeat`;
/// undelivered heartbeats collapse in the single-slot channel. A heartbeat
/// that cannot be staged means the downstream consumer is gone, so the
/// handle is closed and cancellation reaches the worker. A handle closed
/// without a value is reported downstream as
/// [`QueryError::ChannelClosed`].
pub fn spawn(handle: ResultHandle, heartbeat: Duration) -> sliding::Receiver<RelayItem> {
    let (tx, rx) = sliding::channel();
    tokio::spawn(async move {
        let mut ticks = time::interval_at(time::Instant::now() + heartbeat, heartbeat);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                outcome = handle.recv() => {
                    let terminal = match outcome {
                        Some(outcome) => outcome,
                        None => Err(QueryError::ChannelClosed),
                    };
                    if tx.send(RelayItem::Terminal(terminal)).is_err() {
                        tracing::debug!("response body gone before terminal payload");
                    }
                    break;
                }
                _ = ticks.tick() => {
                    if tx.send(RelayItem::Heartbeat).is_err() {
                        tracing::debug!("client gone; cancelling pending query");
                        handle.close();
                        break;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn settled_handle_yields_terminal_without_heartbeats() {
        let handle = ResultHandle::new();
        handle.deliver(Ok(serde_json::json!([1, 2, 3])));

        let mut rx = spawn(handle, Duration::from_millis(100));
        assert_eq!(
            rx.recv().await,
            Some(RelayItem::Terminal(Ok(serde_json::json!([1, 2, 3]))))
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_until_delivery() {
        let handle = ResultHandle::new();
        let producer = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            producer.deliver(Ok(serde_json::json!({"ok": true})));
        });

        let mut rx = spawn(handle, Duration::from_millis(100));
        let mut heartbeats = 0;
        loop {
            match rx.recv().await {
                Some(RelayItem::Heartbeat) => heartbeats += 1,
                Some(RelayItem::Terminal(outcome)) => {
                    assert_eq!(outcome, Ok(serde_json::json!({"ok": true})));
                    break;
                }
                None => panic!("relay ended without terminal"),
            }
        }
        assert_eq!(heartbeats, 3);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unconsumed_heartbeats_collapse() {
        let handle = ResultHandle::new();
        let producer = handle.clone();

        let mut rx = spawn(handle, Duration::from_millis(100));

        // Let several ticks elapse without reading, then deliver: the
        // terminal payload replaces whatever heartbeat is still staged.
        tokio::time::sleep(Duration::from_millis(450)).await;
        producer.deliver(Ok(serde_json::json!("late")));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            rx.recv().await,
            Some(RelayItem::Terminal(Ok(serde_json::json!("late"))))
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_handle_synthesises_channel_closed() {
        let handle = ResultHandle::new();
        handle.close();

        let mut rx = spawn(handle, Duration::from_millis(100));
        assert_eq!(
            rx.recv().await,
            Some(RelayItem::Terminal(Err(QueryError::ChannelClosed)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_receiver_cancels_the_handle() {
        let handle = ResultHandle::new();
        let rx = spawn(handle.clone(), Duration::from_millis(100));
        drop(rx);

        // The next tick's failed send closes the handle.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(handle.is_closed());
        assert!(handle.cancellation().is_cancelled());
    }
}
