//! Task aggregate.

use std::collections::BTreeSet;

use common::{AggregateId, Version};

use crate::aggregate::{Aggregate, AggregateMeta};
use crate::error::DomainError;

use super::{TaskList, events};

/// A unit of work filed under a [`TaskList`].
///
/// The task keeps only the id of its owning list. Status changes are checked
/// against the in-memory list passed in at the time of assignment.
#[derive(Debug, Clone)]
pub struct Task {
    meta: AggregateMeta,
    task_list_id: AggregateId,
    title: String,
    description: Option<String>,
    status: String,
    tags: BTreeSet<String>,
}

impl Aggregate for Task {
    fn aggregate_type() -> &'static str {
        "Task"
    }

    fn meta(&self) -> &AggregateMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut AggregateMeta {
        &mut self.meta
    }
}

impl Task {
    /// Creates a task in `list` with the given status.
    pub fn new(
        list: &TaskList,
        title: impl Into<String>,
        status: impl Into<String>,
        description: Option<String>,
        tags: impl IntoIterator<Item = String>,
    ) -> Result<Self, DomainError> {
        let task_list_id = list.id().ok_or(DomainError::NotPersisted {
            aggregate_type: TaskList::aggregate_type(),
        })?;

        let title = title.into();
        if title.trim().is_empty() {
            return Err(DomainError::EmptyTitle);
        }

        let status = status.into();
        if !list.has_status(&status) {
            return Err(DomainError::InvalidStatus { status });
        }

        let mut tags_set = BTreeSet::new();
        for tag in tags {
            if tag.is_empty() {
                return Err(DomainError::EmptyTag);
            }
            tags_set.insert(tag);
        }

        let mut task = Self {
            meta: AggregateMeta::new(),
            task_list_id,
            title,
            description,
            status,
            tags: tags_set,
        };
        let created = events::task_created(task_list_id, &task.title, &task.status);
        task.meta.emit(created);
        Ok(task)
    }

    /// Rebuilds a task from stored state without emitting events.
    pub fn restore(
        id: AggregateId,
        version: Version,
        task_list_id: AggregateId,
        title: String,
        description: Option<String>,
        status: String,
        tags: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            meta: AggregateMeta::restore(id, version),
            task_list_id,
            title,
            description,
            status,
            tags: tags.into_iter().collect(),
        }
    }

    /// Returns the id of the owning list. It cannot be changed.
    pub fn task_list_id(&self) -> AggregateId {
        self.task_list_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Moves the task to `status`, which must belong to the owning `list`.
    pub fn set_status(
        &mut self,
        list: &TaskList,
        status: impl Into<String>,
    ) -> Result<(), DomainError> {
        if list.id() != Some(self.task_list_id) {
            return Err(DomainError::ForeignTaskList);
        }

        let status = status.into();
        if !list.has_status(&status) {
            return Err(DomainError::InvalidStatus { status });
        }
        if status == self.status {
            return Ok(());
        }

        let event = events::task_status_changed(self.id(), &self.status, &status);
        self.status = status;
        self.meta.emit(event);
        Ok(())
    }

    /// Applies a status chosen by a bulk migration.
    ///
    /// Only for [`super::TaskDao`] implementations: the owning list has
    /// already validated the target.
    pub fn apply_bulk_status(&mut self, status: &str) {
        self.status = status.to_string();
    }

    pub fn set_title(&mut self, title: impl Into<String>) -> Result<(), DomainError> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(DomainError::EmptyTitle);
        }
        self.title = title;
        Ok(())
    }

    pub fn set_description(&mut self, description: Option<String>) {
        self.description = description;
    }

    /// Adds a tag; returns false when it was already present.
    pub fn add_tag(&mut self, tag: impl Into<String>) -> Result<bool, DomainError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(DomainError::EmptyTag);
        }
        Ok(self.tags.insert(tag))
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        self.tags.remove(tag)
    }
}
