//! Background queue for document pulls.
//!
//! Requests are handled one at a time in the order they were queued. A
//! failing request is logged and the worker moves on to the next one. The
//! task ends when every [`SyncWorker`] handle has been dropped.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
  /// Pull the document of a local object, overwriting local changes when
  /// `force` is set
  Pull { local_id: i64, force: bool },
}

/// Totals of a finished worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
  pub succeeded: usize,
  pub failed: usize,
}

#[derive(Clone)]
pub struct SyncWorker {
  sender: mpsc::UnboundedSender<SyncRequest>,
}

impl SyncWorker {
  /// Start the worker task. `handler` runs for every queued request.
  pub fn spawn<F, Fut>(handler: F) -> (Self, JoinHandle<WorkerReport>)
  where
    F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let (sender, mut receiver) = mpsc::unbounded_channel::<SyncRequest>();

    let handle = tokio::spawn(async move {
      let mut report = WorkerReport::default();
      while let Some(request) = receiver.recv().await {
        debug!(?request, "sync request started");
        match handler(request).await {
          Ok(()) => report.succeeded += 1,
          Err(e) => {
            warn!(?request, error = %e, "sync request failed");
            report.failed += 1;
          }
        }
      }
      debug!(succeeded = report.succeeded, failed = report.failed, "sync worker stopped");
      report
    });

    (Self { sender }, handle)
  }

  pub fn enqueue(&self, request: SyncRequest) -> Result<()> {
    self
      .sender
      .send(request)
      .map_err(|e| eyre!("Sync worker has stopped, dropped {:?}", e.0))
  }

  /// Drop this handle. The worker finishes the queued requests and stops
  /// once no other handle is left.
  pub fn shutdown(self) {
    drop(self.sender);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Mutex};

  #[tokio::test]
  async fn test_requests_run_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let (worker, handle) = SyncWorker::spawn(move |request| {
      let seen = seen_clone.clone();
      async move {
        seen.lock().unwrap().push(request);
        Ok(())
      }
    });

    for local_id in 1..=3 {
      worker.enqueue(SyncRequest::Pull { local_id, force: false }).unwrap();
    }
    worker.shutdown();

    let report = handle.await.unwrap();
    assert_eq!(report.succeeded, 3);
    let ids: Vec<i64> = seen
      .lock()
      .unwrap()
      .iter()
      .map(|SyncRequest::Pull { local_id, .. }| *local_id)
      .collect();
    assert_eq!(ids, vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_failures_do_not_stop_the_worker() {
    let (worker, handle) = SyncWorker::spawn(|request| async move {
      match request {
        SyncRequest::Pull { local_id: 2, .. } => Err(eyre!("server unavailable")),
        _ => Ok(()),
      }
    });

    for local_id in 1..=3 {
      worker.enqueue(SyncRequest::Pull { local_id, force: true }).unwrap();
    }
    worker.shutdown();

    assert_eq!(
      handle.await.unwrap(),
      WorkerReport {
        succeeded: 2,
        failed: 1
      }
    );
  }

  #[tokio::test]
  async fn test_enqueue_after_stop_fails() {
    let (worker, handle) = SyncWorker::spawn(|_| async { Ok(()) });
    handle.abort();
    let _ = handle.await;

    assert!(worker
      .enqueue(SyncRequest::Pull {
        local_id: 1,
        force: false
      })
      .is_err());
  }
}
