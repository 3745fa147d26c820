//! Item processors: the caller-supplied work done for each batch item.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

use batchflow_core::{BatchItem, BatchStore, ItemError};

use crate::progress::{BatchEvent, ProgressSink};

/// Context provided to item processors.
#[derive(Clone)]
pub struct ItemContext {
    /// The item being processed, as it was when dequeued.
    pub item: BatchItem,
    /// Zero-based attempt number.
    pub attempt: u32,
    store: Arc<dyn BatchStore>,
    progress: Arc<ProgressSink>,
}

impl ItemContext {
    pub fn new(
        item: BatchItem,
        attempt: u32,
        store: Arc<dyn BatchStore>,
        progress: Arc<ProgressSink>,
    ) -> Self {
        Self {
            item,
            attempt,
            store,
            progress,
        }
    }

    pub fn item_id(&self) -> Uuid {
        self.item.id
    }

    pub fn batch_id(&self) -> Uuid {
        self.item.batch_id
    }

    pub fn source_id(&self) -> &str {
        &self.item.source_id
    }

    pub fn label(&self) -> &str {
        &self.item.label
    }

    pub fn metadata(&self) -> Option<&JsonValue> {
        self.item.metadata.as_ref()
    }

    /// Record a sub-phase ("downloading", "extracting", ...).
    ///
    /// Stages are observability only: a failed write is logged, never
    /// returned.
    pub async fn set_stage(&self, stage: &str) {
        if let Err(e) = self.store.update_batch_item_stage(self.item.id, stage).await {
            warn!(
                subsystem = "jobs",
                component = "processor",
                item_id = %self.item.id,
                stage,
                error = %e,
                "Failed to persist item stage"
            );
        }
        self.progress.emit(BatchEvent::ItemStage {
            batch_id: self.item.batch_id,
            item_id: self.item.id,
            stage: stage.to_string(),
        });
        self.progress.notify(self.item.id, &self.item.label, stage);
    }
}

/// Per-item processing function.
///
/// Return `Ok` with an optional JSON result on success, or a classified
/// [`ItemError`]. The error kind decides whether the scheduler retries.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, ctx: ItemContext) -> Result<Option<JsonValue>, ItemError>;
}

/// Adapter turning an async closure into an [`ItemProcessor`].
pub struct FnProcessor<F> {
    f: F,
}

impl<F, Fut> FnProcessor<F>
where
    F: Fn(ItemContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<JsonValue>, ItemError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ItemProcessor for FnProcessor<F>
where
    F: Fn(ItemContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<JsonValue>, ItemError>> + Send + 'static,
{
    async fn process(&self, ctx: ItemContext) -> Result<Option<JsonValue>, ItemError> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable processor.
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn ItemProcessor>
where
    F: Fn(ItemContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<JsonValue>, ItemError>> + Send + 'static,
{
    Arc::new(FnProcessor::new(f))
}
