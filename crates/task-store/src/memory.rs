//! In-memory storage backend.
//!
//! Committed rows live behind a shared lock. Each session stages its work in
//! its own identity maps and publishes it to the shared rows on commit.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use common::{AggregateId, IsolationLevel, StorageError};
use domain::{Task, TaskDao, TaskList};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use unit_of_work::{Backend, MemoryTable, Repository, Shared, StagedTable, StorageSession};

use crate::repository::{TaskFilter, TaskListFilter, TaskListRepository, TaskRepositories};

#[derive(Debug, Clone, Default)]
struct Tables {
    task_lists: MemoryTable<TaskList>,
    tasks: MemoryTable<Task>,
}

/// In-memory task storage for tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tables: Arc<RwLock<Tables>>,
    open_sessions: Arc<AtomicUsize>,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Makes the next native commit fail.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub async fn task_list(&self, id: AggregateId) -> Option<TaskList> {
        self.tables.read().await.task_lists.get(&id).cloned()
    }

    pub async fn task(&self, id: AggregateId) -> Option<Task> {
        self.tables.read().await.tasks.get(&id).cloned()
    }

    /// Committed tasks of one list.
    pub async fn tasks_of(&self, task_list_id: AggregateId) -> Vec<Task> {
        self.tables
            .read()
            .await
            .tasks
            .rows()
            .filter(|t| t.task_list_id() == task_list_id)
            .cloned()
            .collect()
    }

    pub async fn task_list_count(&self) -> usize {
        self.tables.read().await.task_lists.len()
    }

    pub async fn task_count(&self) -> usize {
        self.tables.read().await.tasks.len()
    }
}

struct SessionState {
    snapshot: Option<Tables>,
    task_lists: StagedTable<TaskList>,
    tasks: StagedTable<Task>,
    closed: bool,
}

impl SessionState {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::SessionClosed);
        }
        Ok(())
    }

    fn discard(&mut self) {
        self.task_lists.discard();
        self.tasks.discard();
    }
}

/// Rows a session reads: its snapshot, or the live committed rows.
enum ReadView<'a> {
    Snapshot(&'a Tables),
    Live(RwLockReadGuard<'a, Tables>),
}

impl Deref for ReadView<'_> {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        match self {
            ReadView::Snapshot(tables) => tables,
            ReadView::Live(guard) => guard,
        }
    }
}

async fn read_view<'a>(snapshot: &'a Option<Tables>, live: &'a RwLock<Tables>) -> ReadView<'a> {
    match snapshot {
        Some(tables) => ReadView::Snapshot(tables),
        None => ReadView::Live(live.read().await),
    }
}

#[derive(Clone)]
struct SessionHandle {
    tables: Arc<RwLock<Tables>>,
    state: Arc<Mutex<SessionState>>,
}

/// Native transaction of the in-memory store.
pub struct MemorySession {
    handle: SessionHandle,
    open_sessions: Arc<AtomicUsize>,
    fail_next_commit: Arc<AtomicBool>,
}

#[async_trait]
impl StorageSession for MemorySession {
    async fn commit(&mut self) -> Result<(), StorageError> {
        let mut guard = self.handle.state.lock().await;
        let state = &mut *guard;
        state.ensure_open()?;
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StorageError::database(std::io::Error::other(
                "injected commit failure",
            )));
        }

        let mut tables = self.handle.tables.write().await;
        let lists = state.task_lists.prepare(&tables.task_lists).await?;
        let tasks = state.tasks.prepare(&tables.tasks).await?;
        let dropped: Vec<AggregateId> = lists.deleted().to_vec();

        state.task_lists.apply(&mut tables.task_lists, lists);
        state.tasks.apply(&mut tables.tasks, tasks);
        if !dropped.is_empty() {
            tables
                .tasks
                .retain(|_, task| !dropped.contains(&task.task_list_id()));
        }

        if state.snapshot.is_some() {
            state.snapshot = Some(tables.clone());
        }
        tracing::trace!(
            task_lists = tables.task_lists.len(),
            tasks = tables.tasks.len(),
            "In-memory commit applied"
        );
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        let mut state = self.handle.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.discard();
        if state.snapshot.is_some() {
            state.snapshot = Some(self.handle.tables.read().await.clone());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        let mut state = self.handle.state.lock().await;
        if !state.closed {
            state.closed = true;
            state.discard();
            state.snapshot = None;
            self.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Task list repository of an in-memory session.
pub struct MemoryTaskListRepository(SessionHandle);

#[async_trait]
impl Repository for MemoryTaskListRepository {
    type Aggregate = TaskList;
    type Criteria = TaskListFilter;

    async fn find(
        &mut self,
        criteria: &TaskListFilter,
    ) -> Result<Vec<Shared<TaskList>>, StorageError> {
        let mut guard = self.0.state.lock().await;
        let state = &mut *guard;
        state.ensure_open()?;
        let view = read_view(&state.snapshot, &self.0.tables).await;
        Ok(state
            .task_lists
            .find(&view.task_lists, |list| criteria.matches(list))
            .await)
    }

    async fn add(&mut self, aggregates: Vec<Shared<TaskList>>) -> Result<(), StorageError> {
        let mut state = self.0.state.lock().await;
        state.ensure_open()?;
        for list in aggregates {
            state.task_lists.add(list).await;
        }
        Ok(())
    }

    async fn remove(
        &mut self,
        criteria: &TaskListFilter,
    ) -> Result<Vec<Shared<TaskList>>, StorageError> {
        let mut guard = self.0.state.lock().await;
        let state = &mut *guard;
        state.ensure_open()?;
        let view = read_view(&state.snapshot, &self.0.tables).await;
        let removed = state
            .task_lists
            .remove(&view.task_lists, |list| criteria.matches(list))
            .await;

        let mut dropped = Vec::with_capacity(removed.len());
        for list in &removed {
            dropped.extend(list.id().await);
        }
        if !dropped.is_empty() {
            state
                .tasks
                .remove(&view.tasks, |task| dropped.contains(&task.task_list_id()))
                .await;
        }
        Ok(removed)
    }
}

#[async_trait]
impl TaskListRepository for MemoryTaskListRepository {
    async fn add_tasks(&mut self, tasks: Vec<Shared<Task>>) -> Result<(), StorageError> {
        let mut state = self.0.state.lock().await;
        state.ensure_open()?;
        for task in tasks {
            state.tasks.add(task).await;
        }
        Ok(())
    }
}

/// Task repository of an in-memory session.
pub struct MemoryTaskRepository(SessionHandle);

#[async_trait]
impl Repository for MemoryTaskRepository {
    type Aggregate = Task;
    type Criteria = TaskFilter;

    async fn find(&mut self, criteria: &TaskFilter) -> Result<Vec<Shared<Task>>, StorageError> {
        let mut guard = self.0.state.lock().await;
        let state = &mut *guard;
        state.ensure_open()?;
        let view = read_view(&state.snapshot, &self.0.tables).await;
        Ok(state
            .tasks
            .find(&view.tasks, |task| criteria.matches(task))
            .await)
    }

    async fn add(&mut self, aggregates: Vec<Shared<Task>>) -> Result<(), StorageError> {
        let mut state = self.0.state.lock().await;
        state.ensure_open()?;
        for task in aggregates {
            state.tasks.add(task).await;
        }
        Ok(())
    }

    async fn remove(&mut self, criteria: &TaskFilter) -> Result<Vec<Shared<Task>>, StorageError> {
        let mut guard = self.0.state.lock().await;
        let state = &mut *guard;
        state.ensure_open()?;
        let view = read_view(&state.snapshot, &self.0.tables).await;
        Ok(state
            .tasks
            .remove(&view.tasks, |task| criteria.matches(task))
            .await)
    }
}

/// Bulk task updates staged in an in-memory session.
///
/// Affected rows are pulled into the session's identity map and changed
/// there, so they are written on commit and dropped on rollback.
pub struct MemoryTaskDao(SessionHandle);

#[async_trait]
impl TaskDao for MemoryTaskDao {
    async fn update_all_tasks_with_status(
        &self,
        task_list_id: AggregateId,
        old_status: &str,
        new_status: &str,
    ) -> Result<(), StorageError> {
        let mut guard = self.0.state.lock().await;
        let state = &mut *guard;
        state.ensure_open()?;
        let view = read_view(&state.snapshot, &self.0.tables).await;
        let affected = state
            .tasks
            .find(&view.tasks, |task| {
                task.task_list_id() == task_list_id && task.status() == old_status
            })
            .await;

        for task in &affected {
            task.lock().await.apply_bulk_status(new_status);
        }
        metrics::counter!("task_store_bulk_migrated_tasks_total").increment(affected.len() as u64);
        tracing::debug!(
            %task_list_id,
            old_status,
            new_status,
            tasks = affected.len(),
            "Tasks migrated in session"
        );
        Ok(())
    }
}

/// Repositories bound to an in-memory session.
pub type MemoryRepositories =
    TaskRepositories<MemoryTaskListRepository, MemoryTaskRepository, MemoryTaskDao>;

#[async_trait]
impl Backend for InMemoryTaskStore {
    type Session = MemorySession;
    type Repositories = MemoryRepositories;

    async fn open(
        &self,
        isolation: IsolationLevel,
    ) -> Result<(MemorySession, MemoryRepositories), StorageError> {
        let snapshot = match isolation {
            IsolationLevel::RepeatableRead => Some(self.tables.read().await.clone()),
            IsolationLevel::ReadCommitted => None,
        };
        let handle = SessionHandle {
            tables: Arc::clone(&self.tables),
            state: Arc::new(Mutex::new(SessionState {
                snapshot,
                task_lists: StagedTable::new(),
                tasks: StagedTable::new(),
                closed: false,
            })),
        };
        self.open_sessions.fetch_add(1, Ordering::SeqCst);

        let repositories = TaskRepositories::new(
            MemoryTaskListRepository(handle.clone()),
            MemoryTaskRepository(handle.clone()),
            MemoryTaskDao(handle.clone()),
        );
        let session = MemorySession {
            handle,
            open_sessions: Arc::clone(&self.open_sessions),
            fail_next_commit: Arc::clone(&self.fail_next_commit),
        };
        Ok((session, repositories))
    }
}
