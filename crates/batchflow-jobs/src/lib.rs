//! # batchflow-jobs
//!
//! Batch execution engine for batchflow.
//!
//! This crate provides:
//! - A batch scheduler running items through a bounded worker pool
//! - A shared token-bucket rate limiter for downstream calls
//! - Retry with exponential backoff for transient item errors
//! - Progress callbacks and scheduler events via broadcast channels
//! - Cooperative cancellation of a run
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use batchflow_jobs::{
//!     processor_fn, BatchScheduler, CreateBatchRequest, ItemContext, NewBatchItem,
//!     RateLimiter, RunOptions, SchedulerBuilder,
//! };
//! use batchflow_db::Database;
//!
//! let db = Database::connect("postgres://...").await?;
//!
//! let scheduler = SchedulerBuilder::from_database(&db)
//!     .with_rate_limiter(RateLimiter::from_env()?)
//!     .build();
//!
//! let batch_id = scheduler
//!     .create_batch(CreateBatchRequest::new("video_import", 2))
//!     .await?;
//! let items = scheduler
//!     .create_items(batch_id, vec!["a.mp4".into(), "b.mp4".into()])
//!     .await?;
//!
//! let processor = processor_fn(|ctx: ItemContext| async move {
//!     ctx.set_stage("downloading").await;
//!     Ok(None)
//! });
//!
//! let result = scheduler
//!     .run_batch(batch_id, items, processor, RunOptions::new().with_concurrency(2))
//!     .await?;
//! println!("{} of {} items succeeded", result.succeeded, result.total);
//! ```

pub mod processor;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;

// Re-export core types
pub use batchflow_core::*;

pub use processor::{processor_fn, FnProcessor, ItemContext, ItemProcessor};
pub use progress::{BatchEvent, ProgressCallback, ProgressSink, ProgressUpdate};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::RetryPolicy;
pub use scheduler::{
    BatchRunResult, BatchScheduler, ItemOutcome, RunOptions, SchedulerBuilder, SchedulerConfig,
};

// Cancellation token type accepted by `RunOptions`.
pub use tokio_util::sync::CancellationToken;
