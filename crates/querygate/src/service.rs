//! Query admission: couples a worker invocation to a permit and a handle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::handle::{QueryError, QueryOutcome, ResultHandle};
use crate::permit::{AcquireError, BrokerRegistry, DatabaseId, PermitBroker};

/// Admits queries against their database's permit broker and runs them on
/// the blocking worker pool.
pub struct QueryService {
    registry: Arc<BrokerRegistry>,
}

impl QueryService {
    pub fn new(registry: Arc<BrokerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<BrokerRegistry> {
        &self.registry
    }

    /// Admit and run `query` against `db_id`.
    ///
    /// Returns immediately with the handle for the future outcome. Closing
    /// the handle is the cancellation signal: it abandons a queued
    /// acquisition, or cancels the running worker and frees its permit.
    ///
    /// The worker runs on the blocking pool and may block arbitrarily; it
    /// should poll the supplied token at convenient points to honour
    /// cancellation.
    pub fn submit<F>(&self, db_id: DatabaseId, query: F) -> ResultHandle
    where
        F: FnOnce(&CancellationToken) -> QueryOutcome + Send + 'static,
    {
        let handle = ResultHandle::new();
        let broker = self.registry.broker_for(db_id);
        let driver = handle.clone();
        tokio::spawn(async move {
            run_admitted(db_id, broker, driver, query).await;
        });
        handle
    }
}

async fn run_admitted<F>(
    db_id: DatabaseId,
    broker: Arc<PermitBroker>,
    handle: ResultHandle,
    query: F,
) where
    F: FnOnce(&CancellationToken) -> QueryOutcome + Send + 'static,
{
    let permit = tokio::select! {
        _ = handle.closed() => {
            debug!(db = %db_id, "query abandoned while waiting for a permit");
            return;
        }
        acquired = broker.acquire() => match acquired {
            Ok(permit) => permit,
            Err(AcquireError::Closed) => {
                handle.deliver(Err(QueryError::BrokerClosed));
                return;
            }
        }
    };

    // Last look before paying for a worker thread: the caller may have lost
    // interest, or the broker may have closed, while we were queued.
    if broker.is_closed() || handle.is_closed() || handle.is_settled() {
        permit.release();
        return;
    }

    let cancel = handle.cancellation();
    let worker = tokio::task::spawn_blocking(move || query(&cancel));

    tokio::select! {
        finished = worker => {
            let outcome = match finished {
                Ok(outcome) => outcome,
                Err(join_error) => Err(QueryError::worker(panic_message(join_error))),
            };
            if let Err(ref error) = outcome {
                debug!(db = %db_id, error = %error, "query worker failed");
            }
            handle.deliver(outcome);
            permit.release();
        }
        _ = handle.closed() => {
            // The worker thread keeps running until it notices the token;
            // its late delivery lands on a closed handle and is dropped.
            debug!(db = %db_id, permit = permit.id(), "query cancelled; releasing permit");
            permit.release();
        }
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if join_error.is_panic() {
        let payload = join_error.into_panic();
        if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "query worker panicked".to_string()
        }
    } else {
        "query worker was aborted".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn service_with_capacity(capacity: usize) -> QueryService {
        QueryService::new(Arc::new(BrokerRegistry::new(AdmissionConfig {
            max_simultaneous_queries_per_db: capacity,
            ..AdmissionConfig::default()
        })))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_result_lands_in_handle() {
        let service = service_with_capacity(2);

        let handle = service.submit(DatabaseId(1), |_| Ok(serde_json::json!([1, 2, 3])));

        assert_eq!(handle.recv().await, Some(Ok(serde_json::json!([1, 2, 3]))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_error_lands_in_handle() {
        let service = service_with_capacity(2);

        let handle = service.submit(DatabaseId(1), |_| Err(QueryError::worker("boom")));

        assert_eq!(handle.recv().await, Some(Err(QueryError::worker("boom"))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_panic_becomes_error() {
        let service = service_with_capacity(2);

        let handle = service.submit(DatabaseId(1), |_| panic!("boom"));

        assert_eq!(handle.recv().await, Some(Err(QueryError::worker("boom"))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn permit_released_after_completion() {
        let service = service_with_capacity(1);
        let broker = service.registry().broker_for(DatabaseId(1));

        let handle = service.submit(DatabaseId(1), |_| Ok(serde_json::json!(null)));
        handle.recv().await;

        wait_until(|| broker.available() == 1).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn capacity_one_serialises_workers() {
        let service = service_with_capacity(1);
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let running = Arc::clone(&running);
            let overlapped = Arc::clone(&overlapped);
            handles.push(service.submit(DatabaseId(1), move |_| {
                if running.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(serde_json::json!("done"))
            }));
        }

        for handle in handles {
            assert_eq!(handle.recv().await, Some(Ok(serde_json::json!("done"))));
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closing_the_handle_cancels_the_worker() {
        let service = service_with_capacity(1);
        let broker = service.registry().broker_for(DatabaseId(1));
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));

        let handle = {
            let saw_cancel = Arc::clone(&saw_cancel);
            let started = Arc::clone(&started);
            service.submit(DatabaseId(1), move |cancel| {
                started.store(true, Ordering::SeqCst);
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(2));
                }
                saw_cancel.store(true, Ordering::SeqCst);
                Err(QueryError::worker("cancelled"))
            })
        };

        wait_until(|| started.load(Ordering::SeqCst)).await;
        handle.close();

        assert_eq!(handle.recv().await, None);
        wait_until(|| saw_cancel.load(Ordering::SeqCst)).await;
        wait_until(|| broker.available() == 1).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handle_closed_while_queued_consumes_no_permit() {
        let service = service_with_capacity(1);
        let broker = service.registry().broker_for(DatabaseId(1));
        let blocker_started = Arc::new(AtomicBool::new(false));

        // Occupy the only permit.
        let blocker = {
            let blocker_started = Arc::clone(&blocker_started);
            service.submit(DatabaseId(1), move |cancel| {
                blocker_started.store(true, Ordering::SeqCst);
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(serde_json::json!(null))
            })
        };
        wait_until(|| blocker_started.load(Ordering::SeqCst)).await;

        let ran = Arc::new(AtomicBool::new(false));
        let queued = {
            let ran = Arc::clone(&ran);
            service.submit(DatabaseId(1), move |_| {
                ran.store(true, Ordering::SeqCst);
                Ok(serde_json::json!(null))
            })
        };
        queued.close();

        blocker.close();
        wait_until(|| broker.available() == 1).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_broker_surfaces_in_handle() {
        let service = service_with_capacity(1);
        let broker = service.registry().broker_for(DatabaseId(1));
        broker.close();

        let handle = service.submit(DatabaseId(1), |_| Ok(serde_json::json!(null)));

        assert_eq!(handle.recv().await, Some(Err(QueryError::BrokerClosed)));
    }
}
