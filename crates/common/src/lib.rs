//! Shared types used across the task-list backend crates.

pub mod error;
pub mod types;

pub use error::{BoxError, StorageError};
pub use types::{AggregateId, IsolationLevel, Version};
