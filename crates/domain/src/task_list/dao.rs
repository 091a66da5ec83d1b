//! Bulk task collaborator.

use async_trait::async_trait;
use common::{AggregateId, StorageError};

/// Bulk operations on the tasks of a list that avoid loading them into the aggregate.
///
/// Implementations must run inside the storage transaction of the surrounding
/// unit of work so that a rollback undoes the update.
#[async_trait]
pub trait TaskDao: Send + Sync {
    /// Moves every task of `task_list_id` currently at `old_status` to `new_status`.
    async fn update_all_tasks_with_status(
        &self,
        task_list_id: AggregateId,
        old_status: &str,
        new_status: &str,
    ) -> Result<(), StorageError>;
}
