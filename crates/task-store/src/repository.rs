//! Task repositories and the per-session registry.

use async_trait::async_trait;
use common::{AggregateId, StorageError};
use domain::{Aggregate, Task, TaskDao, TaskList};
use unit_of_work::{Repository, RepositoryRegistry, SeenSet, Shared, Tracked};

/// Criteria for finding task lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskListFilter {
    All,
    Id(AggregateId),
    Name(String),
}

impl TaskListFilter {
    pub fn matches(&self, list: &TaskList) -> bool {
        match self {
            TaskListFilter::All => true,
            TaskListFilter::Id(id) => list.id() == Some(*id),
            TaskListFilter::Name(name) => list.name() == name,
        }
    }
}

/// Criteria for finding tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFilter {
    Id(AggregateId),
    TaskList(AggregateId),
    Status {
        task_list_id: AggregateId,
        status: String,
    },
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            TaskFilter::Id(id) => task.id() == Some(*id),
            TaskFilter::TaskList(list_id) => task.task_list_id() == *list_id,
            TaskFilter::Status {
                task_list_id,
                status,
            } => task.task_list_id() == *task_list_id && task.status() == status,
        }
    }
}

/// Task list storage with the list-specific operations.
#[async_trait]
pub trait TaskListRepository:
    Repository<Aggregate = TaskList, Criteria = TaskListFilter> + 'static
{
    async fn find_by_name(&mut self, name: &str) -> Result<Vec<Shared<TaskList>>, StorageError> {
        self.find(&TaskListFilter::Name(name.to_string())).await
    }

    /// Stages new tasks filed under lists held by this repository.
    async fn add_tasks(&mut self, tasks: Vec<Shared<Task>>) -> Result<(), StorageError>;
}

/// Task storage.
pub trait TaskRepository: Repository<Aggregate = Task, Criteria = TaskFilter> + 'static {}

impl<R> TaskRepository for R where R: Repository<Aggregate = Task, Criteria = TaskFilter> + 'static {}

#[async_trait]
impl<R: TaskListRepository> TaskListRepository for Tracked<R> {
    async fn find_by_name(&mut self, name: &str) -> Result<Vec<Shared<TaskList>>, StorageError> {
        let found = self.inner_mut().find_by_name(name).await?;
        self.track(&found);
        Ok(found)
    }

    async fn add_tasks(&mut self, tasks: Vec<Shared<Task>>) -> Result<(), StorageError> {
        self.track(&tasks);
        self.inner_mut().add_tasks(tasks).await
    }
}

/// Repositories and the bulk DAO bound to one storage session.
pub struct TaskRepositories<L, T, D> {
    task_lists: Tracked<L>,
    tasks: Tracked<T>,
    task_dao: D,
}

impl<L, T, D> TaskRepositories<L, T, D> {
    pub fn new(task_lists: L, tasks: T, task_dao: D) -> Self {
        Self {
            task_lists: Tracked::new(task_lists),
            tasks: Tracked::new(tasks),
            task_dao,
        }
    }
}

impl<L, T, D> RepositoryRegistry for TaskRepositories<L, T, D>
where
    L: Send + 'static,
    T: Send + 'static,
    D: Send + 'static,
{
    fn seen_sets(&mut self) -> Vec<&mut SeenSet> {
        vec![self.task_lists.seen_mut(), self.tasks.seen_mut()]
    }
}

/// Access to the task repositories of a session, whatever the backend.
pub trait TaskStore: RepositoryRegistry {
    type TaskLists: TaskListRepository;
    type Tasks: TaskRepository;
    type Dao: TaskDao;

    fn task_lists(&mut self) -> &mut Tracked<Self::TaskLists>;

    fn tasks(&mut self) -> &mut Tracked<Self::Tasks>;

    fn task_dao(&self) -> &Self::Dao;
}

impl<L, T, D> TaskStore for TaskRepositories<L, T, D>
where
    L: TaskListRepository,
    T: TaskRepository,
    D: TaskDao + 'static,
{
    type TaskLists = L;
    type Tasks = T;
    type Dao = D;

    fn task_lists(&mut self) -> &mut Tracked<L> {
        &mut self.task_lists
    }

    fn tasks(&mut self) -> &mut Tracked<T> {
        &mut self.tasks
    }

    fn task_dao(&self) -> &D {
        &self.task_dao
    }
}
