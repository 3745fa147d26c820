//! Centralized default constants for batchflow.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers. Organized by component.

// =============================================================================
// SCHEDULER
// =============================================================================

/// Default number of items processed concurrently by one run.
///
/// Sequential by default: most downstream services this engine drives
/// (transcoders, LLM endpoints) are resource-constrained.
pub const BATCH_CONCURRENCY: usize = 1;

/// Concurrency used by `retry_failed_items` runs.
pub const RETRY_CONCURRENCY: usize = 1;

/// Per-attempt deadline for the item processor in seconds (5 minutes).
pub const ITEM_TIMEOUT_SECS: u64 = 300;

/// Rate limiter units consumed per processing attempt.
pub const PERMITS_PER_ITEM: u32 = 1;

/// Capacity of the scheduler's broadcast event channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Number of item error messages included in a batch summary.
pub const ERROR_SUMMARY_LIMIT: usize = 3;

/// Maximum characters kept from a single item error in a batch summary.
pub const ERROR_SUMMARY_MAX_CHARS: usize = 200;

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Maximum retries after the first attempt (4 attempts total).
pub const MAX_RETRIES: u32 = 3;

/// Base backoff delay in milliseconds; attempt `n` waits `base * 2^n`.
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Upper bound on a single backoff delay in milliseconds.
pub const RETRY_MAX_DELAY_MS: u64 = 60_000;

// =============================================================================
// RATE LIMITER
// =============================================================================

/// Default permits granted per rate-limit period.
pub const RATE_LIMIT_PERMITS: u32 = 10;

/// Default rate-limit period in milliseconds.
pub const RATE_LIMIT_PERIOD_MS: u64 = 1_000;

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for batch listings.
pub const PAGE_LIMIT: i64 = 50;
