//! Task list aggregate and its status lifecycle.

use std::collections::BTreeSet;

use common::{AggregateId, Version};

use crate::aggregate::{Aggregate, AggregateMeta};
use crate::error::DomainError;

use super::{ARCHIVED_STATUS, TaskDao, events};

/// A named list with its own vocabulary of task statuses.
///
/// The list owns its status set only; its tasks live in their own aggregates
/// and are migrated in bulk through a [`TaskDao`] when a status goes away.
#[derive(Debug, Clone)]
pub struct TaskList {
    meta: AggregateMeta,
    name: String,
    statuses: BTreeSet<String>,
    default_status: Option<String>,
}

impl Aggregate for TaskList {
    fn aggregate_type() -> &'static str {
        "TaskList"
    }

    fn meta(&self) -> &AggregateMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut AggregateMeta {
        &mut self.meta
    }
}

impl TaskList {
    /// Creates a new list. [`ARCHIVED_STATUS`] is always added to `statuses`.
    ///
    /// `default_status`, when given, must be one of the resulting statuses.
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        statuses: impl IntoIterator<Item = S>,
        default_status: Option<&str>,
    ) -> Result<Self, DomainError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::EmptyName);
        }

        let mut set = BTreeSet::new();
        for status in statuses {
            let status = status.into();
            if status.is_empty() {
                return Err(DomainError::EmptyStatus);
            }
            set.insert(status);
        }
        set.insert(ARCHIVED_STATUS.to_string());

        if let Some(status) = default_status
            && !set.contains(status)
        {
            return Err(DomainError::InvalidStatus {
                status: status.to_string(),
            });
        }

        let mut list = Self {
            meta: AggregateMeta::new(),
            name,
            statuses: set,
            default_status: default_status.map(str::to_string),
        };
        let created = events::task_list_created(
            &list.name,
            &list.statuses,
            list.default_status.as_deref(),
        );
        list.meta.emit(created);
        Ok(list)
    }

    /// Rebuilds a list from stored state without emitting events.
    pub fn restore(
        id: AggregateId,
        version: Version,
        name: String,
        statuses: impl IntoIterator<Item = String>,
        default_status: Option<String>,
    ) -> Self {
        let mut statuses: BTreeSet<String> = statuses.into_iter().collect();
        statuses.insert(ARCHIVED_STATUS.to_string());
        Self {
            meta: AggregateMeta::restore(id, version),
            name,
            statuses,
            default_status,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn statuses(&self) -> &BTreeSet<String> {
        &self.statuses
    }

    pub fn default_status(&self) -> Option<&str> {
        self.default_status.as_deref()
    }

    pub fn has_status(&self, status: &str) -> bool {
        self.statuses.contains(status)
    }

    pub fn rename(&mut self, name: impl Into<String>) -> Result<(), DomainError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::EmptyName);
        }
        if name == self.name {
            return Ok(());
        }

        let event = events::task_list_renamed(self.id(), &self.name, &name);
        self.name = name;
        self.meta.emit(event);
        Ok(())
    }

    /// Sets or clears the default status. A new default must be a current member.
    pub fn set_default_status(&mut self, status: Option<&str>) -> Result<(), DomainError> {
        if let Some(status) = status
            && !self.statuses.contains(status)
        {
            return Err(DomainError::InvalidStatus {
                status: status.to_string(),
            });
        }
        if self.default_status.as_deref() == status {
            return Ok(());
        }

        self.default_status = status.map(str::to_string);
        self.meta
            .emit(events::default_status_changed(self.id(), status));
        Ok(())
    }

    /// Adds a status to the vocabulary. Adding an existing label is a no-op.
    pub fn add_status(&mut self, status: impl Into<String>) -> Result<(), DomainError> {
        let status = status.into();
        if status.is_empty() {
            return Err(DomainError::EmptyStatus);
        }

        let event = events::status_added(self.id(), &status);
        if self.statuses.insert(status) {
            self.meta.emit(event);
        }
        Ok(())
    }

    /// Removes `status`, moving every task still at it to `migration_status`
    /// (or [`ARCHIVED_STATUS`] when none is given).
    ///
    /// The tasks are moved through `dao` in one bulk update; the label leaves
    /// the vocabulary only once that update has succeeded. Removing an absent
    /// label does nothing and never calls the DAO.
    pub async fn remove_status<D>(
        &mut self,
        status: &str,
        dao: &D,
        migration_status: Option<&str>,
    ) -> Result<(), DomainError>
    where
        D: TaskDao + ?Sized,
    {
        if status == ARCHIVED_STATUS {
            return Err(DomainError::ProtectedStatus {
                status: status.to_string(),
            });
        }

        if !self.statuses.contains(status) {
            return Ok(());
        }

        if let Some(target) = migration_status
            && (target == status || !self.statuses.contains(target))
        {
            return Err(DomainError::InvalidMigrationStatus {
                status: target.to_string(),
            });
        }

        let id = self.id().ok_or(DomainError::NotPersisted {
            aggregate_type: Self::aggregate_type(),
        })?;
        let target = migration_status.unwrap_or(ARCHIVED_STATUS);

        tracing::debug!(task_list_id = %id, status, target, "migrating tasks off removed status");
        dao.update_all_tasks_with_status(id, status, target).await?;

        self.statuses.remove(status);
        if self.default_status.as_deref() == Some(status) {
            self.default_status = None;
        }
        self.meta.emit(events::status_removed(id, status, target));
        Ok(())
    }
}
