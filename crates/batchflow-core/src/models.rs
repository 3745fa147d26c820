//! Core data models for batchflow.
//!
//! These types are shared across all batchflow crates and represent the batch
//! record, its items, and the state machines that govern them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::Error;
use crate::item_error::{ErrorKind, ItemError};

// =============================================================================
// WELL-KNOWN TAGS
// =============================================================================

/// Batch type tags used by existing callers. The engine treats `batch_type`
/// as opaque; these only avoid typos at call sites.
pub mod batch_types {
    pub const GOOGLE_EXTRACTION: &str = "google_extraction";
    pub const AUDIO_EXTRACTION: &str = "audio_extraction";
    pub const TRANSCRIPTION: &str = "transcription";
    pub const DIARIZATION: &str = "diarization";
    pub const SUMMARIZATION: &str = "summarization";
    pub const DOCUMENT_CLASSIFICATION: &str = "document_classification";
}

/// Stage labels reported by processors. Observability only.
pub mod stages {
    pub const QUEUED: &str = "queued";
    pub const DOWNLOADING: &str = "downloading";
    pub const EXTRACTING: &str = "extracting";
    pub const PROCESSING: &str = "processing";
    pub const SAVING: &str = "saving";
    pub const RETRYING: &str = "retrying";
}

// =============================================================================
// STATUS ENUMS
// =============================================================================

/// Status of a batch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the record may move from `self` to `next`.
    ///
    /// `Completed`/`Failed -> Processing` is the reopen performed by a retry
    /// run; every other exit from a terminal state, including re-closing an
    /// already closed record, is rejected.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        match (self, next) {
            (Queued, Processing) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            (Completed, Processing) | (Failed, Processing) => true,
            (a, b) => *a == b && !a.is_terminal(),
        }
    }

    /// Whether moving to `next` reopens a closed record.
    pub fn is_reopen(&self, next: BatchStatus) -> bool {
        self.is_terminal() && next == BatchStatus::Processing
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Serialization(format!("unknown batch status: {other}"))),
        }
    }
}

/// Status of a single batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    /// Terminal variant of `Failed`: rejected by a validation or size check.
    Skipped,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 5] = [
        ItemStatus::Queued,
        ItemStatus::Processing,
        ItemStatus::Completed,
        ItemStatus::Failed,
        ItemStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether the item may move from `self` to `next`.
    ///
    /// Terminal states are final. `Failed -> Queued` is not listed here: it is
    /// only performed by the explicit retry reset in the store.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        match (self, next) {
            (Queued, Processing) | (Queued, Skipped) | (Queued, Failed) => true,
            (Processing, Completed) | (Processing, Failed) | (Processing, Skipped) => true,
            // stage updates while processing re-assert the same status
            (Processing, Processing) => true,
            _ => false,
        }
    }

    /// Terminal status for a failed item with the given error.
    pub fn for_error(kind: ErrorKind) -> Self {
        if kind.skips_item() {
            Self::Skipped
        } else {
            Self::Failed
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::Serialization(format!("unknown item status: {s}")))
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// A named run over a fixed set of items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub batch_type: String,
    pub status: BatchStatus,
    pub priority: i32,
    pub total_items: i32,
    pub processed_items: i32,
    pub parameters: JsonValue,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchRecord {
    /// Build a new record in `processing` with no progress.
    pub fn from_request(id: Uuid, request: CreateBatchRequest, now: DateTime<Utc>) -> Self {
        let name = request
            .name
            .unwrap_or_else(|| format!("{} - {}", request.batch_type, now.to_rfc3339()));
        Self {
            id,
            name,
            description: request.description,
            batch_type: request.batch_type,
            status: BatchStatus::Processing,
            priority: request.priority,
            total_items: request.total_items,
            processed_items: 0,
            parameters: request.parameters,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Apply a partial update in memory, enforcing the record state machine.
    ///
    /// `processed_items` never decreases except on reopen, where it is reset
    /// to the count supplied by the caller.
    pub fn apply(&mut self, update: &BatchRecordUpdate, now: DateTime<Utc>) -> Result<(), Error> {
        let mut reopening = false;
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err(Error::InvalidTransition(format!(
                    "batch {}: {} -> {}",
                    self.id, self.status, next
                )));
            }
            reopening = self.status.is_reopen(next);
        }

        if let Some(processed) = update.processed_items {
            if processed < 0 || processed > self.total_items {
                return Err(Error::InvalidInput(format!(
                    "processed_items {} out of range 0..={}",
                    processed, self.total_items
                )));
            }
            self.processed_items = if reopening {
                processed
            } else {
                self.processed_items.max(processed)
            };
        }

        if let Some(next) = update.status {
            if reopening {
                self.completed_at = None;
            } else if next.is_terminal() && self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
            self.status = next;
        }
        if let Some(message) = &update.error_message {
            self.error_message = message.clone();
        }
        self.updated_at = now;
        Ok(())
    }

    /// Fraction of items in a terminal state, in `[0, 100]`.
    pub fn percent_complete(&self) -> i32 {
        if self.total_items == 0 {
            return 100;
        }
        ((self.processed_items as i64 * 100) / self.total_items as i64) as i32
    }
}

/// One unit of work within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub source_id: String,
    pub label: String,
    pub processing_order: i32,
    pub status: ItemStatus,
    pub stage: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub attempts: i32,
    pub processing_time_ms: Option<i64>,
    pub size_bytes: Option<i64>,
    pub metadata: Option<JsonValue>,
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchItem {
    /// Build a new queued item.
    pub fn from_new(
        id: Uuid,
        batch_id: Uuid,
        processing_order: i32,
        new: NewBatchItem,
        now: DateTime<Utc>,
    ) -> Self {
        let label = new.label.unwrap_or_else(|| new.source_id.clone());
        Self {
            id,
            batch_id,
            source_id: new.source_id,
            label,
            processing_order,
            status: ItemStatus::Queued,
            stage: Some(stages::QUEUED.to_string()),
            error_message: None,
            error_kind: None,
            attempts: 0,
            processing_time_ms: None,
            size_bytes: new.size_bytes,
            metadata: new.metadata,
            result: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a transition in memory, enforcing the item state machine.
    ///
    /// Stores call this so that every backend shares the same rules.
    pub fn apply(&mut self, transition: &ItemTransition, now: DateTime<Utc>) -> Result<(), Error> {
        if !self.status.can_transition_to(transition.status) {
            return Err(Error::InvalidTransition(format!(
                "item {}: {} -> {}",
                self.id, self.status, transition.status
            )));
        }

        if transition.status == ItemStatus::Processing && self.status == ItemStatus::Queued {
            self.started_at = Some(now);
        }
        if transition.status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }

        self.status = transition.status;
        if let Some(stage) = &transition.stage {
            self.stage = Some(stage.clone());
        }
        if let Some(err) = &transition.error {
            self.error_message = Some(err.to_string());
            self.error_kind = Some(err.kind);
        }
        if let Some(attempts) = transition.attempts {
            self.attempts = attempts;
        }
        if let Some(ms) = transition.processing_time_ms {
            self.processing_time_ms = Some(ms);
        }
        if transition.result.is_some() {
            self.result = transition.result.clone();
        }
        Ok(())
    }

    /// Return a failed item to the queue for another run.
    pub fn reset_for_retry(&mut self) {
        self.status = ItemStatus::Queued;
        self.stage = Some(stages::QUEUED.to_string());
        self.error_message = None;
        self.error_kind = None;
        self.attempts = 0;
        self.processing_time_ms = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

// =============================================================================
// REQUESTS AND UPDATES
// =============================================================================

/// Request for creating a batch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBatchRequest {
    pub batch_type: String,
    pub total_items: i32,
    #[serde(default)]
    pub parameters: JsonValue,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

impl CreateBatchRequest {
    pub fn new(batch_type: impl Into<String>, total_items: i32) -> Self {
        Self {
            batch_type: batch_type.into(),
            total_items,
            parameters: JsonValue::Object(Default::default()),
            name: None,
            description: None,
            priority: 0,
        }
    }

    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Validate the request before anything is persisted.
    pub fn validate(&self) -> Result<(), Error> {
        if self.total_items < 1 {
            return Err(Error::InvalidInput(format!(
                "a batch needs at least one item, got {}",
                self.total_items
            )));
        }
        if self.batch_type.trim().is_empty() {
            return Err(Error::InvalidInput("batch_type must not be empty".into()));
        }
        if !self.parameters.is_object() && !self.parameters.is_null() {
            return Err(Error::InvalidInput(
                "parameters must be a JSON object".into(),
            ));
        }
        Ok(())
    }
}

/// Source facts for one item to be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBatchItem {
    pub source_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<i64>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

impl NewBatchItem {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            label: None,
            size_bytes: None,
            metadata: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_size_bytes(mut self, size: i64) -> Self {
        self.size_bytes = Some(size);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl From<&str> for NewBatchItem {
    fn from(source_id: &str) -> Self {
        Self::new(source_id)
    }
}

impl From<String> for NewBatchItem {
    fn from(source_id: String) -> Self {
        Self::new(source_id)
    }
}

/// Partial update of a batch record.
///
/// `completed_at` is managed by the store: it is stamped when the status
/// first becomes terminal and cleared when a record is reopened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRecordUpdate {
    pub status: Option<BatchStatus>,
    pub processed_items: Option<i32>,
    /// `Some(None)` clears the message.
    pub error_message: Option<Option<String>>,
}

impl BatchRecordUpdate {
    /// Progress-only update.
    pub fn progress(processed_items: i32) -> Self {
        Self {
            processed_items: Some(processed_items),
            ..Default::default()
        }
    }

    /// Terminal update written once at the end of a run.
    pub fn finish(
        status: BatchStatus,
        processed_items: i32,
        error_message: Option<String>,
    ) -> Self {
        Self {
            status: Some(status),
            processed_items: Some(processed_items),
            error_message: Some(error_message),
        }
    }

    /// Reopen a terminal record for a retry run.
    pub fn reopen(processed_items: i32) -> Self {
        Self {
            status: Some(BatchStatus::Processing),
            processed_items: Some(processed_items),
            error_message: Some(None),
        }
    }
}

/// One item state transition, as persisted by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemTransition {
    pub status: ItemStatus,
    pub stage: Option<String>,
    pub error: Option<ItemError>,
    pub attempts: Option<i32>,
    pub processing_time_ms: Option<i64>,
    pub result: Option<JsonValue>,
}

impl ItemTransition {
    /// `queued -> processing`.
    pub fn processing() -> Self {
        Self {
            status: ItemStatus::Processing,
            stage: Some(stages::PROCESSING.to_string()),
            error: None,
            attempts: None,
            processing_time_ms: None,
            result: None,
        }
    }

    /// `processing -> completed`.
    pub fn completed(attempts: i32, processing_time_ms: i64, result: Option<JsonValue>) -> Self {
        Self {
            status: ItemStatus::Completed,
            stage: Some(ItemStatus::Completed.as_str().to_string()),
            error: None,
            attempts: Some(attempts),
            processing_time_ms: Some(processing_time_ms),
            result,
        }
    }

    /// `-> failed` or `-> skipped`, depending on the error kind.
    pub fn failed(error: ItemError, attempts: i32, processing_time_ms: i64) -> Self {
        let status = ItemStatus::for_error(error.kind);
        Self {
            status,
            stage: Some(status.as_str().to_string()),
            error: Some(error),
            attempts: Some(attempts),
            processing_time_ms: Some(processing_time_ms),
            result: None,
        }
    }
}

/// Per-status item counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStatusCounts {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl ItemStatusCounts {
    /// Tally statuses.
    pub fn from_statuses<I: IntoIterator<Item = ItemStatus>>(statuses: I) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.add(status, 1);
        }
        counts
    }

    pub fn add(&mut self, status: ItemStatus, n: i64) {
        match status {
            ItemStatus::Queued => self.queued += n,
            ItemStatus::Processing => self.processing += n,
            ItemStatus::Completed => self.completed += n,
            ItemStatus::Failed => self.failed += n,
            ItemStatus::Skipped => self.skipped += n,
        }
    }

    /// Items in a terminal state.
    pub fn processed(&self) -> i64 {
        self.completed + self.failed + self.skipped
    }

    pub fn total(&self) -> i64 {
        self.queued + self.processing + self.processed()
    }

    pub fn succeeded(&self) -> i64 {
        self.completed
    }

    /// Items that ended in `failed` or `skipped`.
    pub fn unsuccessful(&self) -> i64 {
        self.failed + self.skipped
    }
}

// =============================================================================
// DISPOSITION
// =============================================================================

/// Final status and summary of a batch whose items are all terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDisposition {
    pub status: BatchStatus,
    pub error_message: Option<String>,
}

impl BatchDisposition {
    /// Resolve the record's terminal status.
    ///
    /// - aborted by caller: `failed`, summary says so
    /// - no successes: `failed`
    /// - some failures: `completed` with a partial-failure summary
    /// - all succeeded: `completed`, no message
    ///
    /// `error_details` are the item error messages in processing order; the
    /// first few are quoted in the summary.
    pub fn resolve(counts: &ItemStatusCounts, cancelled: bool, error_details: &[String]) -> Self {
        let total = counts.total();
        let details = summarize_details(error_details);

        if cancelled {
            let mut msg = format!(
                "aborted by caller: {} of {} items completed",
                counts.succeeded(),
                total
            );
            push_details(&mut msg, &details);
            return Self {
                status: BatchStatus::Failed,
                error_message: Some(msg),
            };
        }

        if counts.succeeded() == 0 {
            let mut msg = format!("all {} items failed", total);
            push_details(&mut msg, &details);
            return Self {
                status: BatchStatus::Failed,
                error_message: Some(msg),
            };
        }

        if counts.unsuccessful() > 0 {
            let mut msg = format!(
                "partial failure: {} of {} items failed ({} skipped)",
                counts.unsuccessful(),
                total,
                counts.skipped
            );
            push_details(&mut msg, &details);
            return Self {
                status: BatchStatus::Completed,
                error_message: Some(msg),
            };
        }

        Self {
            status: BatchStatus::Completed,
            error_message: None,
        }
    }
}

fn summarize_details(details: &[String]) -> Vec<String> {
    details
        .iter()
        .take(defaults::ERROR_SUMMARY_LIMIT)
        .map(|d| {
            if d.chars().count() > defaults::ERROR_SUMMARY_MAX_CHARS {
                let truncated: String = d.chars().take(defaults::ERROR_SUMMARY_MAX_CHARS).collect();
                format!("{truncated}...")
            } else {
                d.clone()
            }
        })
        .collect()
}

fn push_details(msg: &mut String, details: &[String]) {
    if !details.is_empty() {
        msg.push_str(": ");
        msg.push_str(&details.join("; "));
    }
}
