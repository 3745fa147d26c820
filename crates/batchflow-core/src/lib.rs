//! # batchflow-core
//!
//! Core types, traits, and abstractions for the batchflow batch engine.
//!
//! This crate provides the foundational data structures (batch records, batch
//! items, their state machines), the item error taxonomy, and the
//! [`BatchStore`] persistence port that the other batchflow crates depend on.

pub mod defaults;
pub mod error;
pub mod item_error;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use item_error::{ErrorKind, ItemError};
pub use models::*;
pub use traits::*;
pub use uuid_utils::{is_v7, new_v7};
