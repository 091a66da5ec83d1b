//! Domain layer for the task-list backend.
//!
//! This crate provides:
//! - the `Aggregate` trait and `AggregateMeta` (identity, version, pending events)
//! - `DomainEvent` and its `Payload`
//! - the `TaskList` aggregate with its status lifecycle and the `Task` aggregate
//! - the `TaskDao` port used for bulk task migrations

pub mod aggregate;
pub mod error;
pub mod task_list;

pub use aggregate::{Aggregate, AggregateMeta, DomainEvent, Payload};
pub use error::{DomainError, ErrorKind};
pub use task_list::{ARCHIVED_STATUS, Task, TaskDao, TaskList};
