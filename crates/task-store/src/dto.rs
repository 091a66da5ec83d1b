//! Service inputs and views.

use std::collections::BTreeSet;

use common::{AggregateId, Version};
use domain::{Aggregate, DomainError, Task, TaskList};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTaskList {
    pub name: String,
    #[serde(default)]
    pub statuses: Vec<String>,
    #[serde(default)]
    pub default_status: Option<String>,
}

/// Fields left as `None` are kept. An empty name is treated as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTaskList {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub default_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTaskListStatus {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveTaskListStatus {
    pub status: String,
    #[serde(default)]
    pub migration_status: Option<String>,
}

/// A task with no `status` gets its list's default status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTask {
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Fields left as `None` are kept. `tags`, when given, replaces the tag set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTask {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskListView {
    pub id: AggregateId,
    pub name: String,
    pub statuses: BTreeSet<String>,
    pub default_status: Option<String>,
    pub version: Version,
}

impl TryFrom<&TaskList> for TaskListView {
    type Error = DomainError;

    fn try_from(list: &TaskList) -> Result<Self, Self::Error> {
        Ok(Self {
            id: list.id().ok_or(DomainError::NotPersisted {
                aggregate_type: TaskList::aggregate_type(),
            })?,
            name: list.name().to_string(),
            statuses: list.statuses().clone(),
            default_status: list.default_status().map(str::to_string),
            version: list.version(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: AggregateId,
    pub task_list_id: AggregateId,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub tags: BTreeSet<String>,
    pub version: Version,
}

impl TryFrom<&Task> for TaskView {
    type Error = DomainError;

    fn try_from(task: &Task) -> Result<Self, Self::Error> {
        Ok(Self {
            id: task.id().ok_or(DomainError::NotPersisted {
                aggregate_type: Task::aggregate_type(),
            })?,
            task_list_id: task.task_list_id(),
            title: task.title().to_string(),
            description: task.description().map(str::to_string),
            status: task.status().to_string(),
            tags: task.tags().clone(),
            version: task.version(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_task_list_accepts_minimal_json() {
        let input: CreateTaskList = serde_json::from_str(r#"{"name":"todo"}"#).unwrap();
        assert_eq!(input.name, "todo");
        assert!(input.statuses.is_empty());
        assert!(input.default_status.is_none());
    }

    #[test]
    fn view_requires_identity() {
        let list = TaskList::new("todo", ["ready"], None).unwrap();
        assert!(TaskListView::try_from(&list).is_err());

        let list = TaskList::restore(
            AggregateId::new(),
            Version::new(3),
            "todo".to_string(),
            ["ready".to_string()],
            Some("ready".to_string()),
        );
        let view = TaskListView::try_from(&list).unwrap();
        assert_eq!(view.version, Version::new(3));
        assert_eq!(view.statuses.len(), 2);
    }
}
