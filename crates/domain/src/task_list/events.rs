//! Channels and payload builders for task-list events.

use common::AggregateId;
use serde_json::json;

use crate::aggregate::DomainEvent;

pub const TASK_LIST_CREATED: &str = "TaskListCreated";
pub const TASK_LIST_RENAMED: &str = "TaskListRenamed";
pub const TASK_LIST_DEFAULT_STATUS_CHANGED: &str = "TaskListDefaultStatusChanged";
pub const TASK_LIST_STATUS_ADDED: &str = "TaskListStatusAdded";
pub const TASK_LIST_STATUS_REMOVED: &str = "TaskListStatusRemoved";
pub const TASK_CREATED: &str = "TaskCreated";
pub const TASK_STATUS_CHANGED: &str = "TaskStatusChanged";

pub(crate) fn task_list_created<'a>(
    name: &str,
    statuses: impl IntoIterator<Item = &'a String>,
    default_status: Option<&str>,
) -> DomainEvent {
    let statuses: Vec<&String> = statuses.into_iter().collect();
    DomainEvent::new(
        TASK_LIST_CREATED,
        json!({
            "name": name,
            "statuses": statuses,
            "default_status": default_status,
        }),
    )
}

pub(crate) fn task_list_renamed(id: Option<AggregateId>, old: &str, new: &str) -> DomainEvent {
    DomainEvent::new(
        TASK_LIST_RENAMED,
        json!({ "task_list_id": id, "old_name": old, "new_name": new }),
    )
}

pub(crate) fn default_status_changed(id: Option<AggregateId>, status: Option<&str>) -> DomainEvent {
    DomainEvent::new(
        TASK_LIST_DEFAULT_STATUS_CHANGED,
        json!({ "task_list_id": id, "default_status": status }),
    )
}

pub(crate) fn status_added(id: Option<AggregateId>, status: &str) -> DomainEvent {
    DomainEvent::new(
        TASK_LIST_STATUS_ADDED,
        json!({ "task_list_id": id, "status": status }),
    )
}

pub(crate) fn status_removed(id: AggregateId, status: &str, migrated_to: &str) -> DomainEvent {
    DomainEvent::new(
        TASK_LIST_STATUS_REMOVED,
        json!({ "task_list_id": id, "status": status, "migrated_to": migrated_to }),
    )
}

pub(crate) fn task_created(task_list_id: AggregateId, title: &str, status: &str) -> DomainEvent {
    DomainEvent::new(
        TASK_CREATED,
        json!({ "task_list_id": task_list_id, "title": title, "status": status }),
    )
}

pub(crate) fn task_status_changed(
    id: Option<AggregateId>,
    old_status: &str,
    new_status: &str,
) -> DomainEvent {
    DomainEvent::new(
        TASK_STATUS_CHANGED,
        json!({ "task_id": id, "old_status": old_status, "new_status": new_status }),
    )
}
