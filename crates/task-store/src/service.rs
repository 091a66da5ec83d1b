//! Write-side task list service.
//!
//! Every operation runs in its own unit of work, which is closed on every
//! exit path.

use std::sync::Arc;

use common::{AggregateId, IsolationLevel};
use domain::{Aggregate, DomainError, Task, TaskList};
use unit_of_work::{Backend, Publisher, Repository, Shared, UnitOfWork};

use crate::dto::{
    AddTaskListStatus, CreateTask, CreateTaskList, RemoveTaskListStatus, TaskListView, TaskView,
    UpdateTask, UpdateTaskList,
};
use crate::error::{Result, ServiceError};
use crate::repository::{TaskFilter, TaskListFilter, TaskListRepository, TaskStore};

const TASK_LIST: &str = "Task list";
const TASK: &str = "Task";

/// Creates and changes task lists and their tasks.
pub struct TaskListService<B: Backend> {
    backend: Arc<B>,
    publisher: Arc<dyn Publisher>,
}

impl<B: Backend> Clone for TaskListService<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            publisher: Arc::clone(&self.publisher),
        }
    }
}

impl<B> TaskListService<B>
where
    B: Backend,
    B::Repositories: TaskStore,
{
    pub fn new(backend: Arc<B>, publisher: Arc<dyn Publisher>) -> Self {
        Self { backend, publisher }
    }

    async fn begin(&self, isolation: IsolationLevel) -> Result<UnitOfWork<B>> {
        let mut uow = UnitOfWork::new(Arc::clone(&self.backend), Arc::clone(&self.publisher));
        uow.begin(isolation).await?;
        Ok(uow)
    }

    /// Closes `uow` and returns `outcome`, preferring the operation's own error.
    async fn finish<T>(mut uow: UnitOfWork<B>, outcome: Result<T>) -> Result<T> {
        let closed = uow.close().await;
        match (outcome, closed) {
            (Err(err), Err(close_err)) => {
                tracing::warn!(error = %close_err, "Closing unit of work failed after an error");
                Err(err)
            }
            (Ok(_), Err(close_err)) => Err(close_err.into()),
            (outcome, Ok(())) => outcome,
        }
    }

    #[tracing::instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_task_list(&self, input: CreateTaskList) -> Result<AggregateId> {
        let mut uow = self.begin(IsolationLevel::ReadCommitted).await?;
        let outcome = create_task_list(&mut uow, input).await;
        Self::finish(uow, outcome).await
    }

    #[tracing::instrument(skip(self, input))]
    pub async fn update_task_list(
        &self,
        task_list_id: AggregateId,
        input: UpdateTaskList,
    ) -> Result<TaskListView> {
        let mut uow = self.begin(IsolationLevel::ReadCommitted).await?;
        let outcome = update_task_list(&mut uow, task_list_id, input).await;
        Self::finish(uow, outcome).await
    }

    #[tracing::instrument(skip(self, input), fields(status = %input.status))]
    pub async fn add_task_list_status(
        &self,
        task_list_id: AggregateId,
        input: AddTaskListStatus,
    ) -> Result<TaskListView> {
        let mut uow = self.begin(IsolationLevel::ReadCommitted).await?;
        let outcome = add_task_list_status(&mut uow, task_list_id, input).await;
        Self::finish(uow, outcome).await
    }

    /// Removes a status and migrates its tasks in one repeatable-read scope.
    #[tracing::instrument(skip(self, input), fields(status = %input.status))]
    pub async fn remove_task_list_status(
        &self,
        task_list_id: AggregateId,
        input: RemoveTaskListStatus,
    ) -> Result<TaskListView> {
        let mut uow = self.begin(IsolationLevel::RepeatableRead).await?;
        let outcome = remove_task_list_status(&mut uow, task_list_id, input).await;
        Self::finish(uow, outcome).await
    }

    #[tracing::instrument(skip(self, input), fields(title = %input.title))]
    pub async fn create_task(
        &self,
        task_list_id: AggregateId,
        input: CreateTask,
    ) -> Result<AggregateId> {
        let mut uow = self.begin(IsolationLevel::ReadCommitted).await?;
        let outcome = create_task(&mut uow, task_list_id, input).await;
        Self::finish(uow, outcome).await
    }

    #[tracing::instrument(skip(self, input))]
    pub async fn update_task(&self, task_id: AggregateId, input: UpdateTask) -> Result<TaskView> {
        let mut uow = self.begin(IsolationLevel::ReadCommitted).await?;
        let outcome = update_task(&mut uow, task_id, input).await;
        Self::finish(uow, outcome).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_task(&self, task_id: AggregateId) -> Result<()> {
        let mut uow = self.begin(IsolationLevel::ReadCommitted).await?;
        let outcome = delete_task(&mut uow, task_id).await;
        Self::finish(uow, outcome).await
    }
}

async fn create_task_list<B>(uow: &mut UnitOfWork<B>, input: CreateTaskList) -> Result<AggregateId>
where
    B: Backend,
    B::Repositories: TaskStore,
{
    let repos = uow.repositories()?;
    if !repos.task_lists().find_by_name(&input.name).await?.is_empty() {
        return Err(ServiceError::AlreadyExists {
            resource: TASK_LIST,
            key: input.name,
        });
    }

    let list = TaskList::new(input.name, input.statuses, input.default_status.as_deref())?;
    let handle = Shared::new(list);
    repos.task_lists().add_one(handle.clone()).await?;
    uow.commit().await?;

    let id = handle.id().await.ok_or(DomainError::NotPersisted {
        aggregate_type: TaskList::aggregate_type(),
    })?;
    tracing::info!(task_list_id = %id, "Task list created");
    Ok(id)
}

async fn update_task_list<B>(
    uow: &mut UnitOfWork<B>,
    task_list_id: AggregateId,
    input: UpdateTaskList,
) -> Result<TaskListView>
where
    B: Backend,
    B::Repositories: TaskStore,
{
    let list = find_task_list(uow.repositories()?, task_list_id).await?;
    {
        let mut list = list.lock().await;
        if let Some(name) = input.name.filter(|name| !name.is_empty()) {
            list.rename(name)?;
        }
        if let Some(status) = input.default_status.as_deref() {
            list.set_default_status(Some(status))?;
        }
    }
    uow.commit().await?;

    let list = list.lock().await;
    Ok(TaskListView::try_from(&*list)?)
}

async fn add_task_list_status<B>(
    uow: &mut UnitOfWork<B>,
    task_list_id: AggregateId,
    input: AddTaskListStatus,
) -> Result<TaskListView>
where
    B: Backend,
    B::Repositories: TaskStore,
{
    let list = find_task_list(uow.repositories()?, task_list_id).await?;
    list.lock().await.add_status(input.status)?;
    uow.commit().await?;

    let list = list.lock().await;
    Ok(TaskListView::try_from(&*list)?)
}

async fn remove_task_list_status<B>(
    uow: &mut UnitOfWork<B>,
    task_list_id: AggregateId,
    input: RemoveTaskListStatus,
) -> Result<TaskListView>
where
    B: Backend,
    B::Repositories: TaskStore,
{
    let repos = uow.repositories()?;
    let list = find_task_list(repos, task_list_id).await?;
    {
        let mut list = list.lock().await;
        list.remove_status(
            &input.status,
            repos.task_dao(),
            input.migration_status.as_deref(),
        )
        .await?;
    }
    uow.commit().await?;

    let list = list.lock().await;
    Ok(TaskListView::try_from(&*list)?)
}

async fn create_task<B>(
    uow: &mut UnitOfWork<B>,
    task_list_id: AggregateId,
    input: CreateTask,
) -> Result<AggregateId>
where
    B: Backend,
    B::Repositories: TaskStore,
{
    let repos = uow.repositories()?;
    let list = find_task_list(repos, task_list_id).await?;
    let task = {
        let list = list.lock().await;
        let status = input
            .status
            .or_else(|| list.default_status().map(str::to_string))
            .ok_or(DomainError::EmptyStatus)?;
        Task::new(&list, input.title, status, input.description, input.tags)?
    };

    let handle = Shared::new(task);
    repos.task_lists().add_tasks(vec![handle.clone()]).await?;
    uow.commit().await?;

    let id = handle.id().await.ok_or(DomainError::NotPersisted {
        aggregate_type: Task::aggregate_type(),
    })?;
    tracing::info!(task_id = %id, %task_list_id, "Task created");
    Ok(id)
}

async fn update_task<B>(
    uow: &mut UnitOfWork<B>,
    task_id: AggregateId,
    input: UpdateTask,
) -> Result<TaskView>
where
    B: Backend,
    B::Repositories: TaskStore,
{
    let repos = uow.repositories()?;
    let task = find_task(repos, task_id).await?;
    let task_list_id = task.lock().await.task_list_id();
    let list = find_task_list(repos, task_list_id).await?;
    {
        let mut task = task.lock().await;
        if let Some(title) = input.title {
            task.set_title(title)?;
        }
        if let Some(description) = input.description {
            task.set_description(Some(description));
        }
        if let Some(status) = input.status {
            let list = list.lock().await;
            task.set_status(&list, status)?;
        }
        if let Some(tags) = input.tags {
            let current: Vec<String> = task.tags().iter().cloned().collect();
            for tag in &current {
                task.remove_tag(tag);
            }
            for tag in tags {
                task.add_tag(tag)?;
            }
        }
    }
    uow.commit().await?;

    let task = task.lock().await;
    Ok(TaskView::try_from(&*task)?)
}

async fn delete_task<B>(uow: &mut UnitOfWork<B>, task_id: AggregateId) -> Result<()>
where
    B: Backend,
    B::Repositories: TaskStore,
{
    let removed = uow
        .repositories()?
        .tasks()
        .remove(&TaskFilter::Id(task_id))
        .await?;
    if removed.is_empty() {
        return Err(ServiceError::NotFound {
            resource: TASK,
            id: task_id,
        });
    }
    uow.commit().await?;
    tracing::info!(%task_id, "Task deleted");
    Ok(())
}

async fn find_task_list<S: TaskStore>(repos: &mut S, id: AggregateId) -> Result<Shared<TaskList>> {
    let mut found = repos.task_lists().find(&TaskListFilter::Id(id)).await?;
    single(&mut found, TASK_LIST, id)
}

async fn find_task<S: TaskStore>(repos: &mut S, id: AggregateId) -> Result<Shared<Task>> {
    let mut found = repos.tasks().find(&TaskFilter::Id(id)).await?;
    single(&mut found, TASK, id)
}

fn single<A: Aggregate>(
    found: &mut Vec<Shared<A>>,
    resource: &'static str,
    id: AggregateId,
) -> Result<Shared<A>> {
    match found.len() {
        0 => Err(ServiceError::NotFound { resource, id }),
        1 => Ok(found.remove(0)),
        _ => Err(ServiceError::Ambiguous { resource, id }),
    }
}
