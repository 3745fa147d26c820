//! Core traits for batchflow abstractions.
//!
//! The engine never talks to a database directly; everything goes through
//! [`BatchStore`] so that Postgres and in-memory backends are interchangeable.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// BATCH STORE
// =============================================================================

/// Request for listing batch records.
#[derive(Debug, Clone, Default)]
pub struct ListBatchesRequest {
    /// Filter by status
    pub status: Option<BatchStatus>,
    /// Filter by batch type tag
    pub batch_type: Option<String>,
    /// Maximum results (defaults to [`crate::defaults::PAGE_LIMIT`])
    pub limit: Option<i64>,
    /// Pagination offset
    pub offset: Option<i64>,
}

/// Persistence port for batch records and their items.
///
/// Implementations must enforce the state machines in [`BatchStatus`] and
/// [`ItemStatus`]: a write that would move a terminal item, or close an
/// already-closed record, fails with [`crate::Error::InvalidTransition`].
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Persist a new batch record.
    async fn save_batch_record(&self, record: &BatchRecord) -> Result<()>;

    /// Apply a partial update to a batch record and return the stored result.
    ///
    /// The store stamps `completed_at` the first time the status becomes
    /// terminal and clears it when the record is reopened.
    async fn update_batch_record(
        &self,
        batch_id: Uuid,
        update: BatchRecordUpdate,
    ) -> Result<BatchRecord>;

    /// Get a batch record by id.
    async fn get_batch_record(&self, batch_id: Uuid) -> Result<Option<BatchRecord>>;

    /// List batch records, newest first.
    async fn list_batch_records(&self, req: ListBatchesRequest) -> Result<Vec<BatchRecord>>;

    /// Persist the full item set of a batch.
    async fn save_batch_items(&self, items: &[BatchItem]) -> Result<()>;

    /// Apply a status transition to one item.
    async fn update_batch_item_status(
        &self,
        item_id: Uuid,
        transition: ItemTransition,
    ) -> Result<()>;

    /// Record a processor-reported stage on a non-terminal item.
    ///
    /// Stage writes against a terminal item are ignored, not errors.
    async fn update_batch_item_stage(&self, item_id: Uuid, stage: &str) -> Result<()>;

    /// Items of a batch ordered by `processing_order`.
    async fn get_batch_items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>>;

    /// Reset every `failed` item of a batch to `queued` and return the reset
    /// items. `skipped` and `completed` items are left alone.
    async fn reset_failed_items(&self, batch_id: Uuid) -> Result<Vec<BatchItem>>;

    /// Per-status item counts, computed from persisted state.
    async fn query_item_status_counts(&self, batch_id: Uuid) -> Result<ItemStatusCounts>;
}
