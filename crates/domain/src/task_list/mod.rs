//! Task lists, their status vocabulary and the tasks filed under them.

mod aggregate;
mod dao;
pub mod events;
mod task;

pub use aggregate::TaskList;
pub use dao::TaskDao;
pub use task::Task;

/// Status present on every list; it can never be removed.
pub const ARCHIVED_STATUS: &str = "ARCHIVED";
