//! Batch scheduler: a bounded worker pool over the items of one batch.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use batchflow_core::{
    defaults, new_v7, stages, BatchDisposition, BatchItem, BatchRecord, BatchRecordUpdate,
    BatchStatus, BatchStore, CreateBatchRequest, Error, ErrorKind, ItemError, ItemStatus,
    ItemStatusCounts, ItemTransition, ListBatchesRequest, NewBatchItem, Result,
};
use batchflow_db::Database;

use crate::processor::{ItemContext, ItemProcessor};
use crate::progress::{BatchEvent, ProgressCallback, ProgressSink, ProgressUpdate};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

/// Configuration for the batch scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Items processed concurrently when the caller does not say.
    pub concurrency: usize,
    /// Concurrency of `retry_failed_items` runs.
    pub retry_concurrency: usize,
    /// Deadline for a single processor attempt.
    pub item_timeout: Duration,
    /// Items whose `size_bytes` exceeds this are skipped without processing.
    pub max_item_bytes: Option<i64>,
    /// Rate limiter units taken before each attempt.
    pub permits_per_item: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::BATCH_CONCURRENCY,
            retry_concurrency: defaults::RETRY_CONCURRENCY,
            item_timeout: Duration::from_secs(defaults::ITEM_TIMEOUT_SECS),
            max_item_bytes: None,
            permits_per_item: defaults::PERMITS_PER_ITEM,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `BATCH_CONCURRENCY` | `1` | Items processed concurrently |
    /// | `BATCH_RETRY_CONCURRENCY` | `1` | Concurrency of retry runs |
    /// | `BATCH_ITEM_TIMEOUT_SECS` | `300` | Per-attempt deadline |
    /// | `BATCH_MAX_ITEM_BYTES` | unset | Size limit for the "too large" pre-check |
    /// | `BATCH_PERMITS_PER_ITEM` | `1` | Rate limiter units per attempt |
    pub fn from_env() -> Self {
        let concurrency = std::env::var("BATCH_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::BATCH_CONCURRENCY)
            .max(1);

        let retry_concurrency = std::env::var("BATCH_RETRY_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::RETRY_CONCURRENCY)
            .max(1);

        let item_timeout_secs = std::env::var("BATCH_ITEM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::ITEM_TIMEOUT_SECS);

        let max_item_bytes = std::env::var("BATCH_MAX_ITEM_BYTES")
            .ok()
            .and_then(|v| v.parse::<i64>().ok());

        let permits_per_item = std::env::var("BATCH_PERMITS_PER_ITEM")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::PERMITS_PER_ITEM);

        Self {
            concurrency,
            retry_concurrency,
            item_timeout: Duration::from_secs(item_timeout_secs),
            max_item_bytes,
            permits_per_item,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry_concurrency(mut self, concurrency: usize) -> Self {
        self.retry_concurrency = concurrency.max(1);
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn with_max_item_bytes(mut self, limit: i64) -> Self {
        self.max_item_bytes = Some(limit);
        self
    }

    pub fn with_permits_per_item(mut self, permits: u32) -> Self {
        self.permits_per_item = permits;
        self
    }
}

/// Per-run options.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Overrides [`SchedulerConfig::concurrency`].
    pub concurrency: Option<usize>,
    /// Called after every item transition and every processor stage report.
    pub on_progress: Option<ProgressCallback>,
    /// Cancels this run only.
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Final state of one item in a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub item_id: Uuid,
    pub source_id: String,
    pub label: String,
    pub processing_order: i32,
    pub status: ItemStatus,
    pub attempts: u32,
    pub duration_ms: i64,
    pub error: Option<ItemError>,
    pub result: Option<JsonValue>,
}

/// Summary returned by a run.
///
/// Counts cover the whole batch, including items finished by earlier runs.
/// `per_item_results` covers only the items of this run, in processing
/// order. `status` stays `processing` while items outside the run are
/// still queued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRunResult {
    pub batch_id: Uuid,
    pub total: i32,
    pub processed: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub skipped: i32,
    pub status: BatchStatus,
    pub cancelled: bool,
    pub error_message: Option<String>,
    pub per_item_results: Vec<ItemOutcome>,
}

impl BatchRunResult {
    /// Summary of a batch as currently stored, without running anything.
    fn from_record(record: &BatchRecord, counts: &ItemStatusCounts) -> Self {
        Self {
            batch_id: record.id,
            total: record.total_items,
            processed: counts.processed() as i32,
            succeeded: counts.succeeded() as i32,
            failed: counts.failed as i32,
            skipped: counts.skipped as i32,
            status: record.status,
            cancelled: false,
            error_message: record.error_message.clone(),
            per_item_results: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BatchStatus::Completed && self.error_message.is_none()
    }
}

/// Runs batches of items through an [`ItemProcessor`].
#[derive(Clone)]
pub struct BatchScheduler {
    store: Arc<dyn BatchStore>,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryPolicy,
    config: SchedulerConfig,
    event_tx: broadcast::Sender<BatchEvent>,
}

impl BatchScheduler {
    /// Create a scheduler with default configuration and no rate limiter.
    pub fn new(store: Arc<dyn BatchStore>) -> Self {
        SchedulerBuilder::new(store).build()
    }

    pub fn builder(store: Arc<dyn BatchStore>) -> SchedulerBuilder {
        SchedulerBuilder::new(store)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<BatchEvent> {
        self.event_tx.subscribe()
    }

    /// Create a batch record in `processing` with no progress.
    pub async fn create_batch(&self, request: CreateBatchRequest) -> Result<Uuid> {
        request.validate()?;
        let record = BatchRecord::from_request(new_v7(), request, chrono::Utc::now());
        self.store.save_batch_record(&record).await?;

        info!(
            subsystem = "jobs",
            component = "scheduler",
            op = "create_batch",
            batch_id = %record.id,
            batch_type = %record.batch_type,
            total_items = record.total_items,
            "Batch created"
        );
        Ok(record.id)
    }

    /// Create the item set of a batch, one queued item per entry.
    ///
    /// The number of entries must match `total_items`, and a batch gets its
    /// items only once.
    pub async fn create_items(
        &self,
        batch_id: Uuid,
        items: Vec<NewBatchItem>,
    ) -> Result<Vec<BatchItem>> {
        let record = self.get_batch(batch_id).await?;
        if items.len() != record.total_items as usize {
            return Err(Error::InvalidInput(format!(
                "batch {} expects {} items, got {}",
                batch_id,
                record.total_items,
                items.len()
            )));
        }
        if !self.store.get_batch_items(batch_id).await?.is_empty() {
            return Err(Error::InvalidInput(format!(
                "batch {batch_id} already has items"
            )));
        }

        let now = chrono::Utc::now();
        let items: Vec<BatchItem> = items
            .into_iter()
            .enumerate()
            .map(|(order, new)| BatchItem::from_new(new_v7(), batch_id, order as i32, new, now))
            .collect();
        self.store.save_batch_items(&items).await?;

        debug!(
            subsystem = "jobs",
            component = "scheduler",
            op = "create_items",
            %batch_id,
            count = items.len(),
            "Batch items created"
        );
        Ok(items)
    }

    /// Get a batch record.
    pub async fn get_batch(&self, batch_id: Uuid) -> Result<BatchRecord> {
        self.store
            .get_batch_record(batch_id)
            .await?
            .ok_or(Error::BatchNotFound(batch_id))
    }

    /// Items of a batch in processing order.
    pub async fn get_batch_items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>> {
        self.store.get_batch_items(batch_id).await
    }

    /// List batch records, newest first.
    pub async fn list_batches(&self, req: ListBatchesRequest) -> Result<Vec<BatchRecord>> {
        self.store.list_batch_records(req).await
    }

    /// Bring a record in line with its persisted items.
    ///
    /// Raises `processed_items` to the number of terminal items. A record
    /// left `processing` by an interrupted run whose items are all terminal
    /// is closed with the usual disposition. `processed_items` is never
    /// lowered.
    pub async fn reconcile(&self, batch_id: Uuid) -> Result<BatchRecord> {
        let record = self.get_batch(batch_id).await?;
        let counts = self.store.query_item_status_counts(batch_id).await?;
        let processed = (counts.processed() as i32).min(record.total_items);
        let all_terminal =
            counts.total() == record.total_items as i64 && counts.queued + counts.processing == 0;

        let update = if all_terminal && !record.status.is_terminal() {
            let details: Vec<String> = self
                .store
                .get_batch_items(batch_id)
                .await?
                .into_iter()
                .filter(|it| matches!(it.status, ItemStatus::Failed | ItemStatus::Skipped))
                .filter_map(|it| it.error_message)
                .collect();
            let disposition = BatchDisposition::resolve(&counts, false, &details);
            BatchRecordUpdate::finish(disposition.status, processed, disposition.error_message)
        } else if processed > record.processed_items {
            BatchRecordUpdate::progress(processed)
        } else {
            if processed < record.processed_items {
                warn!(
                    subsystem = "jobs",
                    component = "scheduler",
                    op = "reconcile",
                    %batch_id,
                    recorded = record.processed_items,
                    counted = processed,
                    "Recorded progress ahead of item state, leaving it"
                );
            }
            return Ok(record);
        };

        let updated = self.store.update_batch_record(batch_id, update).await?;
        info!(
            subsystem = "jobs",
            component = "scheduler",
            op = "reconcile",
            %batch_id,
            status = %updated.status,
            processed = updated.processed_items,
            "Batch record reconciled"
        );
        Ok(updated)
    }

    /// Run every queued item of a batch.
    pub async fn run_pending(
        &self,
        batch_id: Uuid,
        processor: Arc<dyn ItemProcessor>,
        options: RunOptions,
    ) -> Result<BatchRunResult> {
        let queued: Vec<BatchItem> = self
            .store
            .get_batch_items(batch_id)
            .await?
            .into_iter()
            .filter(|item| item.status == ItemStatus::Queued)
            .collect();
        self.run_batch(batch_id, queued, processor, options).await
    }

    /// Process `items` with at most `concurrency` in flight and close the
    /// batch record once no item of the batch is left queued.
    ///
    /// Batch-level problems (unknown batch, empty or foreign item list, items
    /// not queued, closed record) are returned before anything runs. Item
    /// failures never abort the run. On return every item of the run is in a
    /// terminal state.
    #[instrument(skip(self, items, processor, options), fields(batch_id = %batch_id, items = items.len()))]
    pub async fn run_batch(
        &self,
        batch_id: Uuid,
        items: Vec<BatchItem>,
        processor: Arc<dyn ItemProcessor>,
        options: RunOptions,
    ) -> Result<BatchRunResult> {
        let record = self.get_batch(batch_id).await?;
        if items.is_empty() {
            return Err(Error::InvalidInput(format!(
                "batch {batch_id}: no items to run"
            )));
        }

        let persisted: HashMap<Uuid, BatchItem> = self
            .store
            .get_batch_items(batch_id)
            .await?
            .into_iter()
            .map(|item| (item.id, item))
            .collect();

        let mut run_items = Vec::with_capacity(items.len());
        let mut seen = HashSet::new();
        for item in items {
            if item.batch_id != batch_id {
                return Err(Error::InvalidInput(format!(
                    "item {} belongs to batch {}, not {}",
                    item.id, item.batch_id, batch_id
                )));
            }
            let stored = persisted.get(&item.id).ok_or(Error::ItemNotFound(item.id))?;
            if stored.status != ItemStatus::Queued {
                return Err(Error::InvalidTransition(format!(
                    "item {} is {}, expected queued",
                    item.id, stored.status
                )));
            }
            if !seen.insert(item.id) {
                return Err(Error::InvalidInput(format!("item {} listed twice", item.id)));
            }
            run_items.push(stored.clone());
        }

        match record.status {
            BatchStatus::Processing => {}
            BatchStatus::Queued => {
                self.store
                    .update_batch_record(
                        batch_id,
                        BatchRecordUpdate {
                            status: Some(BatchStatus::Processing),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            status => {
                return Err(Error::InvalidTransition(format!(
                    "batch {batch_id} is {status}; use retry_failed_items to reopen it"
                )));
            }
        }

        let base = self.store.query_item_status_counts(batch_id).await?;
        let concurrency = options.concurrency.unwrap_or(self.config.concurrency).max(1);
        let workers = concurrency.min(run_items.len());

        info!(
            subsystem = "jobs",
            component = "scheduler",
            op = "run_batch",
            items = run_items.len(),
            total_items = record.total_items,
            workers,
            "Batch run started"
        );

        let progress = Arc::new(ProgressSink::new(
            batch_id,
            record.total_items,
            base.processed() as i32,
            options.on_progress.clone(),
            self.event_tx.clone(),
        ));
        progress.emit(BatchEvent::BatchStarted {
            batch_id,
            items: run_items.len(),
        });

        let state = Arc::new(RunState {
            batch_id,
            store: self.store.clone(),
            limiter: self.limiter.clone(),
            retry: self.retry,
            config: self.config.clone(),
            processor,
            progress,
            cancel: options.cancel.clone(),
            queue: Mutex::new(run_items.iter().cloned().collect()),
            counter: Mutex::new(Counter {
                in_memory: base.processed() as i32,
                persisted: record.processed_items,
            }),
            deferred: Mutex::new(Deferred::default()),
            outcomes: Mutex::new(Vec::with_capacity(run_items.len())),
        });

        let mut tasks = JoinSet::new();
        for worker_id in 0..workers {
            let state = state.clone();
            tasks.spawn(async move { state.worker(worker_id).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = ?e, "Batch worker task failed");
            }
        }

        state.finalize(&run_items, base).await
    }

    /// Re-run the `failed` items of a finished batch.
    ///
    /// Failed items go back to `queued` and the record is reopened; completed
    /// and skipped items are left alone. Runs with the configured retry
    /// concurrency. With nothing to retry, returns the current summary.
    pub async fn retry_failed_items(
        &self,
        batch_id: Uuid,
        processor: Arc<dyn ItemProcessor>,
        options: RunOptions,
    ) -> Result<BatchRunResult> {
        let record = self.get_batch(batch_id).await?;
        let counts = self.store.query_item_status_counts(batch_id).await?;

        let unfinished = counts.queued + counts.processing;
        if unfinished > 0 {
            return Err(Error::InvalidInput(format!(
                "batch {batch_id} still has {unfinished} unfinished items"
            )));
        }
        if counts.failed == 0 {
            info!(
                subsystem = "jobs",
                component = "scheduler",
                op = "retry_failed",
                %batch_id,
                "No failed items to retry"
            );
            return Ok(BatchRunResult::from_record(&record, &counts));
        }

        // reopen before touching items: a closed record with queued items
        // cannot be run or reconciled
        if record.status.is_terminal() {
            let processed = counts.processed() - counts.failed;
            self.store
                .update_batch_record(batch_id, BatchRecordUpdate::reopen(processed as i32))
                .await?;
        }
        let reset = self.store.reset_failed_items(batch_id).await?;

        info!(
            subsystem = "jobs",
            component = "scheduler",
            op = "retry_failed",
            %batch_id,
            items = reset.len(),
            "Retrying failed items"
        );

        let options = RunOptions {
            concurrency: Some(self.config.retry_concurrency.max(1)),
            ..options
        };
        self.run_batch(batch_id, reset, processor, options).await
    }
}

// =============================================================================
// RUN STATE
// =============================================================================

/// Single-writer state of the `processed_items` counter.
struct Counter {
    /// Terminal items known to this run, used when the store cannot count.
    in_memory: i32,
    /// Last value written to the record.
    persisted: i32,
}

/// Item writes that failed and will be replayed at the end of the run.
#[derive(Default)]
struct Deferred {
    items: HashSet<Uuid>,
    writes: Vec<(Uuid, ItemTransition)>,
}

/// Everything the workers of one run share.
struct RunState {
    batch_id: Uuid,
    store: Arc<dyn BatchStore>,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryPolicy,
    config: SchedulerConfig,
    processor: Arc<dyn ItemProcessor>,
    progress: Arc<ProgressSink>,
    cancel: CancellationToken,
    queue: Mutex<VecDeque<BatchItem>>,
    counter: Mutex<Counter>,
    deferred: Mutex<Deferred>,
    outcomes: Mutex<Vec<ItemOutcome>>,
}

impl RunState {
    async fn worker(&self, worker_id: usize) {
        loop {
            if self.cancel.is_cancelled() {
                debug!(worker_id, "Run cancelled, worker stopping");
                break;
            }
            let next = self.queue.lock().await.pop_front();
            let Some(item) = next else {
                break;
            };
            self.process_item(item).await;
        }
    }

    async fn process_item(&self, item: BatchItem) {
        let started = Instant::now();

        if let (Some(limit), Some(size)) = (self.config.max_item_bytes, item.size_bytes) {
            if size > limit {
                self.finish_item(&item, Err(ItemError::too_large(size, limit)), 0, started)
                    .await;
                return;
            }
        }

        self.persist(item.id, ItemTransition::processing()).await;
        self.progress.emit(BatchEvent::ItemStarted {
            batch_id: self.batch_id,
            item_id: item.id,
        });
        self.record_progress(&item, stages::PROCESSING, false).await;

        let attempts = AtomicU32::new(0);
        let result = self
            .retry
            .execute(
                |attempt| {
                    attempts.store(attempt + 1, Ordering::SeqCst);
                    self.attempt(&item, attempt)
                },
                &self.cancel,
            )
            .await;

        self.finish_item(&item, result, attempts.load(Ordering::SeqCst), started)
            .await;
    }

    /// One processor call: rate limit, deadline, panic containment.
    async fn attempt(
        &self,
        item: &BatchItem,
        attempt: u32,
    ) -> std::result::Result<Option<JsonValue>, ItemError> {
        if attempt > 0 {
            self.set_stage(item, stages::RETRYING).await;
        }

        if let Some(limiter) = &self.limiter {
            limiter
                .acquire_cancellable(self.config.permits_per_item, &self.cancel)
                .await
                .map_err(ItemError::from)?;
        }

        let ctx = ItemContext::new(
            item.clone(),
            attempt,
            self.store.clone(),
            self.progress.clone(),
        );
        let call = AssertUnwindSafe(self.processor.process(ctx)).catch_unwind();

        let result = match tokio::time::timeout(self.config.item_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ItemError::unknown(format!(
                "processor panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(ItemError::timeout(format!(
                "attempt exceeded {}s",
                self.config.item_timeout.as_secs()
            ))),
        };

        if let Err(err) = &result {
            if err.kind == ErrorKind::RateLimit {
                if let Some(limiter) = &self.limiter {
                    limiter.throttle(self.retry.backoff_for(err, attempt));
                }
            }
            if self.retry.should_retry(err, attempt) {
                warn!(
                    subsystem = "jobs",
                    component = "scheduler",
                    batch_id = %self.batch_id,
                    item_id = %item.id,
                    attempt = attempt + 1,
                    error = %err,
                    "Item attempt failed, will retry"
                );
                self.progress.emit(BatchEvent::ItemRetrying {
                    batch_id: self.batch_id,
                    item_id: item.id,
                    attempt: attempt + 1,
                    error: err.to_string(),
                });
            }
        }
        result
    }

    async fn set_stage(&self, item: &BatchItem, stage: &str) {
        if let Err(e) = self.store.update_batch_item_stage(item.id, stage).await {
            warn!(
                subsystem = "jobs",
                component = "scheduler",
                item_id = %item.id,
                stage,
                error = %e,
                "Failed to persist item stage"
            );
        }
        self.progress.notify(item.id, &item.label, stage);
    }

    /// Persist the terminal transition and report progress.
    async fn finish_item(
        &self,
        item: &BatchItem,
        result: std::result::Result<Option<JsonValue>, ItemError>,
        attempts: u32,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_millis() as i64;
        let outcome = match result {
            Ok(value) => {
                info!(
                    subsystem = "jobs",
                    component = "scheduler",
                    batch_id = %self.batch_id,
                    item_id = %item.id,
                    label = %item.label,
                    attempts,
                    duration_ms,
                    "Item completed"
                );
                self.persist(
                    item.id,
                    ItemTransition::completed(attempts as i32, duration_ms, value.clone()),
                )
                .await;
                self.progress.emit(BatchEvent::ItemCompleted {
                    batch_id: self.batch_id,
                    item_id: item.id,
                    duration_ms,
                });
                ItemOutcome {
                    item_id: item.id,
                    source_id: item.source_id.clone(),
                    label: item.label.clone(),
                    processing_order: item.processing_order,
                    status: ItemStatus::Completed,
                    attempts,
                    duration_ms,
                    error: None,
                    result: value,
                }
            }
            Err(err) => {
                let status = ItemStatus::for_error(err.kind);
                warn!(
                    subsystem = "jobs",
                    component = "scheduler",
                    batch_id = %self.batch_id,
                    item_id = %item.id,
                    label = %item.label,
                    %status,
                    kind = %err.kind,
                    attempts,
                    error = %err,
                    "Item failed"
                );
                self.persist(
                    item.id,
                    ItemTransition::failed(err.clone(), attempts as i32, duration_ms),
                )
                .await;
                self.progress.emit(BatchEvent::ItemFailed {
                    batch_id: self.batch_id,
                    item_id: item.id,
                    status,
                    kind: err.kind,
                    error: err.to_string(),
                });
                ItemOutcome {
                    item_id: item.id,
                    source_id: item.source_id.clone(),
                    label: item.label.clone(),
                    processing_order: item.processing_order,
                    status,
                    attempts,
                    duration_ms,
                    error: Some(err),
                    result: None,
                }
            }
        };

        let status = outcome.status;
        self.outcomes.lock().await.push(outcome);
        self.record_progress(item, status.as_str(), true).await;
    }

    /// Write an item transition, deferring it when the store fails.
    ///
    /// Once an item has a deferred write, later writes for it queue behind
    /// so they replay in order.
    async fn persist(&self, item_id: Uuid, transition: ItemTransition) {
        let already_deferred = self.deferred.lock().await.items.contains(&item_id);
        if !already_deferred {
            match self
                .store
                .update_batch_item_status(item_id, transition.clone())
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "scheduler",
                        batch_id = %self.batch_id,
                        %item_id,
                        status = %transition.status,
                        error = %e,
                        "Failed to persist item status, deferring"
                    );
                }
            }
        }
        let mut deferred = self.deferred.lock().await;
        deferred.items.insert(item_id);
        deferred.writes.push((item_id, transition));
    }

    /// Recompute `processed_items` from persisted item state and report it.
    ///
    /// Runs under the counter lock so that reports are ordered and the
    /// persisted value never goes backwards.
    async fn record_progress(&self, item: &BatchItem, stage: &str, terminal: bool) {
        let mut counter = self.counter.lock().await;
        if terminal {
            counter.in_memory += 1;
        }

        let counted = match self.store.query_item_status_counts(self.batch_id).await {
            Ok(counts) => counts.processed() as i32,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "scheduler",
                    batch_id = %self.batch_id,
                    error = %e,
                    "Failed to count items, using in-memory count"
                );
                counter.in_memory
            }
        };
        let processed = counted
            .min(self.progress.total())
            .max(self.progress.processed());

        if processed > counter.persisted {
            match self
                .store
                .update_batch_record(self.batch_id, BatchRecordUpdate::progress(processed))
                .await
            {
                Ok(_) => counter.persisted = processed,
                Err(e) => warn!(
                    subsystem = "jobs",
                    component = "scheduler",
                    batch_id = %self.batch_id,
                    processed,
                    error = %e,
                    "Failed to persist batch progress"
                ),
            }
        }

        let processed = self.progress.set_processed(processed);
        if terminal {
            self.progress.emit(BatchEvent::Progress {
                batch_id: self.batch_id,
                processed,
                total: self.progress.total(),
            });
        }
        self.progress.notify(item.id, &item.label, stage);
    }

    /// Replay deferred item writes once.
    async fn flush_deferred(&self) {
        let writes = std::mem::take(&mut self.deferred.lock().await.writes);
        if writes.is_empty() {
            return;
        }
        info!(
            subsystem = "jobs",
            component = "scheduler",
            batch_id = %self.batch_id,
            count = writes.len(),
            "Replaying deferred item writes"
        );
        for (item_id, transition) in writes {
            if let Err(e) = self.store.update_batch_item_status(item_id, transition).await {
                error!(
                    subsystem = "jobs",
                    component = "scheduler",
                    batch_id = %self.batch_id,
                    %item_id,
                    error = %e,
                    "Deferred item write failed again"
                );
            }
        }
    }

    /// Close out the run: terminate leftovers, reconcile counts, then close
    /// the record, or only record progress while other items are queued.
    async fn finalize(
        &self,
        run_items: &[BatchItem],
        base: ItemStatusCounts,
    ) -> Result<BatchRunResult> {
        let cancelled = self.cancel.is_cancelled();

        // items never dequeued (cancellation) or lost with a failed worker
        let finished: HashSet<Uuid> = self
            .outcomes
            .lock()
            .await
            .iter()
            .map(|o| o.item_id)
            .collect();
        for item in run_items.iter().filter(|it| !finished.contains(&it.id)) {
            let err = if cancelled {
                ItemError::cancelled("run stopped before the item was processed")
            } else {
                ItemError::unknown("worker stopped before the item finished")
            };
            self.finish_item(item, Err(err), 0, Instant::now()).await;
        }

        self.flush_deferred().await;

        let mut outcomes = std::mem::take(&mut *self.outcomes.lock().await);
        outcomes.sort_by_key(|o| o.processing_order);

        let mut in_memory = base;
        in_memory.queued -= run_items.len() as i64;
        for outcome in &outcomes {
            in_memory.add(outcome.status, 1);
        }
        let counts = match self.store.query_item_status_counts(self.batch_id).await {
            Ok(counts) if counts.processed() >= in_memory.processed() => counts,
            Ok(_) => in_memory,
            Err(e) => {
                warn!(
                    batch_id = %self.batch_id,
                    error = %e,
                    "Failed to count items at close, using in-memory counts"
                );
                in_memory
            }
        };

        let details: Vec<String> = match self.store.get_batch_items(self.batch_id).await {
            Ok(items) => items
                .into_iter()
                .filter(|it| matches!(it.status, ItemStatus::Failed | ItemStatus::Skipped))
                .filter_map(|it| it.error_message)
                .collect(),
            Err(_) => outcomes
                .iter()
                .filter_map(|o| o.error.as_ref().map(ToString::to_string))
                .collect(),
        };

        let processed = counts.processed() as i32;

        // items outside this run still queued: the record stays open
        let open = counts.queued + counts.processing;
        let disposition = if open > 0 {
            BatchDisposition {
                status: BatchStatus::Processing,
                error_message: None,
            }
        } else {
            BatchDisposition::resolve(&counts, cancelled, &details)
        };
        let update = if open > 0 {
            BatchRecordUpdate::progress(processed)
        } else {
            BatchRecordUpdate::finish(
                disposition.status,
                processed,
                disposition.error_message.clone(),
            )
        };
        if let Err(first) = self
            .store
            .update_batch_record(self.batch_id, update.clone())
            .await
        {
            warn!(
                batch_id = %self.batch_id,
                error = %first,
                "Failed to write batch record at close, retrying once"
            );
            if let Err(e) = self.store.update_batch_record(self.batch_id, update).await {
                error!(
                    subsystem = "jobs",
                    component = "scheduler",
                    batch_id = %self.batch_id,
                    error = %e,
                    "Failed to write batch record at close"
                );
            }
        }

        self.progress.set_processed(processed);
        self.progress.emit(BatchEvent::BatchFinished {
            batch_id: self.batch_id,
            status: disposition.status,
            cancelled,
        });

        info!(
            subsystem = "jobs",
            component = "scheduler",
            op = "run_batch",
            batch_id = %self.batch_id,
            status = %disposition.status,
            processed,
            open,
            succeeded = counts.succeeded(),
            failed = counts.failed,
            skipped = counts.skipped,
            cancelled,
            "Batch run finished"
        );

        Ok(BatchRunResult {
            batch_id: self.batch_id,
            total: self.progress.total(),
            processed,
            succeeded: counts.succeeded() as i32,
            failed: counts.failed as i32,
            skipped: counts.skipped as i32,
            status: disposition.status,
            cancelled,
            error_message: disposition.error_message,
            per_item_results: outcomes,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for a [`BatchScheduler`].
pub struct SchedulerBuilder {
    store: Arc<dyn BatchStore>,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryPolicy,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn new(store: Arc<dyn BatchStore>) -> Self {
        Self {
            store,
            limiter: None,
            retry: RetryPolicy::default(),
            config: SchedulerConfig::default(),
        }
    }

    /// Use the PostgreSQL batch store of `db`.
    pub fn from_database(db: &Database) -> Self {
        Self::new(Arc::new(db.batches.clone()))
    }

    /// Configure from `BATCH_*` environment variables.
    ///
    /// The rate limiter is enabled only when `BATCH_RATE_LIMIT_PERMITS` is
    /// set.
    pub fn from_env(store: Arc<dyn BatchStore>) -> Result<Self> {
        let mut builder = Self::new(store)
            .with_config(SchedulerConfig::from_env())
            .with_retry_policy(RetryPolicy::from_env());
        if std::env::var("BATCH_RATE_LIMIT_PERMITS").is_ok() {
            builder = builder.with_rate_limiter(RateLimiter::from_env()?);
        }
        Ok(builder)
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limiter(self, limiter: RateLimiter) -> Self {
        self.with_shared_rate_limiter(Arc::new(limiter))
    }

    /// Share one limiter between several schedulers.
    pub fn with_shared_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn build(self) -> BatchScheduler {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        BatchScheduler {
            store: self.store,
            limiter: self.limiter,
            retry: self.retry,
            config: self.config,
            event_tx,
        }
    }
}
