//! Progress reporting: the caller's callback and the broadcast event bus.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, trace};
use uuid::Uuid;

use batchflow_core::{BatchStatus, ErrorKind, ItemStatus};

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub batch_id: Uuid,
    pub item_id: Uuid,
    /// Human-readable item label.
    pub label: String,
    /// Stage reported by the processor, or the item status after a transition.
    pub stage: String,
    pub processed: i32,
    pub total: i32,
}

/// Caller-supplied progress callback.
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Event emitted by the batch scheduler.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    /// A run started.
    BatchStarted { batch_id: Uuid, items: usize },
    /// An item was dequeued and marked processing.
    ItemStarted { batch_id: Uuid, item_id: Uuid },
    /// A processor reported a stage.
    ItemStage {
        batch_id: Uuid,
        item_id: Uuid,
        stage: String,
    },
    /// An attempt failed with a transient error and will be retried.
    ItemRetrying {
        batch_id: Uuid,
        item_id: Uuid,
        attempt: u32,
        error: String,
    },
    /// An item completed.
    ItemCompleted {
        batch_id: Uuid,
        item_id: Uuid,
        duration_ms: i64,
    },
    /// An item ended failed or skipped.
    ItemFailed {
        batch_id: Uuid,
        item_id: Uuid,
        status: ItemStatus,
        kind: ErrorKind,
        error: String,
    },
    /// The persisted processed count changed.
    Progress {
        batch_id: Uuid,
        processed: i32,
        total: i32,
    },
    /// A run finished. `status` is `processing` when items outside the run
    /// are still queued and the record was left open.
    BatchFinished {
        batch_id: Uuid,
        status: BatchStatus,
        cancelled: bool,
    },
}

/// Fan-out point for progress of one run.
///
/// Holds the last processed count so that stage reports can quote it without
/// touching the store.
pub struct ProgressSink {
    batch_id: Uuid,
    total: i32,
    processed: AtomicI32,
    callback: Option<ProgressCallback>,
    event_tx: broadcast::Sender<BatchEvent>,
}

impl ProgressSink {
    pub fn new(
        batch_id: Uuid,
        total: i32,
        processed: i32,
        callback: Option<ProgressCallback>,
        event_tx: broadcast::Sender<BatchEvent>,
    ) -> Self {
        Self {
            batch_id,
            total,
            processed: AtomicI32::new(processed),
            callback,
            event_tx,
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn total(&self) -> i32 {
        self.total
    }

    pub fn processed(&self) -> i32 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Raise the processed count; lower values are ignored.
    pub fn set_processed(&self, processed: i32) -> i32 {
        let previous = self.processed.fetch_max(processed, Ordering::SeqCst);
        previous.max(processed)
    }

    /// Send an event. Having no subscribers is not an error.
    pub fn emit(&self, event: BatchEvent) {
        if self.event_tx.send(event).is_err() {
            trace!(batch_id = %self.batch_id, "No event subscribers");
        }
    }

    /// Invoke the caller's callback. A panicking callback is logged and
    /// otherwise ignored.
    pub fn notify(&self, item_id: Uuid, label: &str, stage: &str) {
        let Some(callback) = &self.callback else {
            return;
        };
        let update = ProgressUpdate {
            batch_id: self.batch_id,
            item_id,
            label: label.to_string(),
            stage: stage.to_string(),
            processed: self.processed(),
            total: self.total,
        };
        if catch_unwind(AssertUnwindSafe(|| callback(&update))).is_err() {
            error!(
                subsystem = "jobs",
                component = "progress",
                batch_id = %self.batch_id,
                %item_id,
                "Progress callback panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sink(callback: Option<ProgressCallback>) -> (ProgressSink, broadcast::Receiver<BatchEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (ProgressSink::new(Uuid::new_v4(), 4, 1, callback, tx), rx)
    }

    #[test]
    fn test_processed_never_decreases() {
        let (sink, _rx) = sink(None);
        assert_eq!(sink.set_processed(3), 3);
        assert_eq!(sink.set_processed(2), 3);
        assert_eq!(sink.processed(), 3);
    }

    #[test]
    fn test_notify_passes_current_counts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let (sink, _rx) = sink(Some(Arc::new(move |u: &ProgressUpdate| {
            s.lock().unwrap().push((u.label.clone(), u.stage.clone(), u.processed, u.total));
        })));

        sink.notify(Uuid::new_v4(), "a.mp4", "downloading");
        sink.set_processed(2);
        sink.notify(Uuid::new_v4(), "a.mp4", "completed");

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], ("a.mp4".into(), "downloading".into(), 1, 4));
        assert_eq!(seen[1].2, 2);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let (sink, _rx) = sink(Some(Arc::new(|_: &ProgressUpdate| panic!("ui gone"))));
        sink.notify(Uuid::new_v4(), "x", "processing");
        assert_eq!(sink.processed(), 1);
    }

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let (sink, mut rx) = sink(None);
        sink.emit(BatchEvent::Progress {
            batch_id: sink.batch_id(),
            processed: 1,
            total: 4,
        });
        match rx.recv().await.unwrap() {
            BatchEvent::Progress { processed, total, .. } => {
                assert_eq!((processed, total), (1, 4));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
