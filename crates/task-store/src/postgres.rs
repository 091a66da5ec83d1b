//! PostgreSQL storage backend.
//!
//! A session runs one `sqlx` transaction at a time and begins the next one on
//! first use after a commit or rollback. Loaded rows go through identity
//! maps; staged changes are flushed into the open transaction before every
//! query and on commit, with an optimistic version check on each update.

use std::sync::Arc;

use async_trait::async_trait;
use common::{AggregateId, IsolationLevel, StorageError, Version};
use domain::{Aggregate, Task, TaskDao, TaskList};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use unit_of_work::{Backend, IdentityMap, Repository, Shared, StorageSession};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::repository::{TaskFilter, TaskListFilter, TaskListRepository, TaskRepositories};

const TASK_LIST_COLUMNS: &str = "id, name, statuses, default_status, version";
const TASK_COLUMNS: &str = "id, task_list_id, title, description, status, tags, version";

/// PostgreSQL-backed task storage.
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool sized from `config`. Requires `database_url`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StorageError> {
        let url = config.database_url.as_deref().ok_or_else(|| {
            StorageError::database(std::io::Error::other("DATABASE_URL is not set"))
        })?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await
            .map_err(StorageError::database)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

fn db(err: sqlx::Error) -> StorageError {
    StorageError::database(err)
}

fn row_to_task_list(row: &PgRow) -> Result<(AggregateId, TaskList), sqlx::Error> {
    let id = AggregateId::from_uuid(row.try_get::<Uuid, _>("id")?);
    let list = TaskList::restore(
        id,
        Version::new(row.try_get("version")?),
        row.try_get("name")?,
        row.try_get::<Vec<String>, _>("statuses")?,
        row.try_get("default_status")?,
    );
    Ok((id, list))
}

fn row_to_task(row: &PgRow) -> Result<(AggregateId, Task), sqlx::Error> {
    let id = AggregateId::from_uuid(row.try_get::<Uuid, _>("id")?);
    let task = Task::restore(
        id,
        Version::new(row.try_get("version")?),
        AggregateId::from_uuid(row.try_get::<Uuid, _>("task_list_id")?),
        row.try_get("title")?,
        row.try_get("description")?,
        row.try_get("status")?,
        row.try_get::<Vec<String>, _>("tags")?,
    );
    Ok((id, task))
}

#[derive(Debug, Clone, Copy)]
enum Table {
    TaskLists,
    Tasks,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::TaskLists => "task_lists",
            Table::Tasks => "tasks",
        }
    }
}

async fn begin_transaction(
    pool: &PgPool,
    isolation: IsolationLevel,
) -> Result<Transaction<'static, Postgres>, StorageError> {
    let mut tx = pool.begin().await.map_err(db)?;
    sqlx::query(&format!(
        "SET TRANSACTION ISOLATION LEVEL {}",
        isolation.as_sql()
    ))
    .execute(&mut *tx)
    .await
    .map_err(db)?;
    Ok(tx)
}

/// Reads the stored version after a guarded write matched no row.
async fn conflict(
    conn: &mut PgConnection,
    table: Table,
    id: AggregateId,
    expected: Version,
) -> StorageError {
    let actual: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(&format!(
        "SELECT version FROM {} WHERE id = $1",
        table.name()
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut *conn)
    .await;
    match actual {
        Ok(actual) => StorageError::VersionConflict {
            aggregate_id: id,
            expected,
            actual: Version::new(actual.unwrap_or_default()),
        },
        Err(e) => db(e),
    }
}

struct PgState {
    pool: PgPool,
    isolation: IsolationLevel,
    /// `None` between a native commit or rollback and the next statement.
    tx: Option<Transaction<'static, Postgres>>,
    closed: bool,
    task_lists: IdentityMap<TaskList>,
    tasks: IdentityMap<Task>,
}

impl PgState {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::SessionClosed);
        }
        Ok(())
    }

    /// Starts the next native transaction if none is open.
    async fn begin_if_needed(&mut self) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.tx.is_none() {
            self.tx = Some(begin_transaction(&self.pool, self.isolation).await?);
        }
        Ok(())
    }

    async fn conn(&mut self) -> Result<&mut PgConnection, StorageError> {
        self.begin_if_needed().await?;
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(StorageError::SessionClosed),
        }
    }

    async fn flush(&mut self) -> Result<(), StorageError> {
        self.flush_task_lists().await?;
        self.flush_tasks().await
    }

    async fn flush_task_lists(&mut self) -> Result<(), StorageError> {
        self.begin_if_needed().await?;
        let Self { tx, task_lists, .. } = self;
        let conn: &mut PgConnection = tx.as_mut().ok_or(StorageError::SessionClosed)?;

        let mut written = Vec::with_capacity(task_lists.len());
        for entry in task_lists.iter() {
            let list = entry.handle.lock().await;
            let statuses: Vec<String> = list.statuses().iter().cloned().collect();
            match entry.persisted {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO task_lists (id, name, statuses, default_status, version)
                        VALUES ($1, $2, $3, $4, $5)
                        "#,
                    )
                    .bind(entry.id.as_uuid())
                    .bind(list.name())
                    .bind(&statuses)
                    .bind(list.default_status())
                    .bind(list.version().as_i64())
                    .execute(&mut *conn)
                    .await
                    .map_err(db)?;
                }
                Some(expected) => {
                    let result = sqlx::query(
                        r#"
                        UPDATE task_lists
                        SET name = $2, statuses = $3, default_status = $4, version = $5
                        WHERE id = $1 AND version = $6
                        "#,
                    )
                    .bind(entry.id.as_uuid())
                    .bind(list.name())
                    .bind(&statuses)
                    .bind(list.default_status())
                    .bind(list.version().as_i64())
                    .bind(expected.as_i64())
                    .execute(&mut *conn)
                    .await
                    .map_err(db)?;
                    if result.rows_affected() == 0 {
                        return Err(conflict(conn, Table::TaskLists, entry.id, expected).await);
                    }
                }
            }
            written.push((entry.id, list.version()));
        }

        for (id, version) in written {
            task_lists.mark_persisted(&id, version);
        }
        Ok(())
    }

    async fn flush_tasks(&mut self) -> Result<(), StorageError> {
        self.begin_if_needed().await?;
        let Self { tx, tasks, .. } = self;
        let conn: &mut PgConnection = tx.as_mut().ok_or(StorageError::SessionClosed)?;

        let mut written = Vec::with_capacity(tasks.len());
        for entry in tasks.iter() {
            let task = entry.handle.lock().await;
            let tags: Vec<String> = task.tags().iter().cloned().collect();
            match entry.persisted {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO tasks (id, task_list_id, title, description, status, tags, version)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        "#,
                    )
                    .bind(entry.id.as_uuid())
                    .bind(task.task_list_id().as_uuid())
                    .bind(task.title())
                    .bind(task.description())
                    .bind(task.status())
                    .bind(&tags)
                    .bind(task.version().as_i64())
                    .execute(&mut *conn)
                    .await
                    .map_err(db)?;
                }
                Some(expected) => {
                    let result = sqlx::query(
                        r#"
                        UPDATE tasks
                        SET title = $2, description = $3, status = $4, tags = $5, version = $6
                        WHERE id = $1 AND version = $7
                        "#,
                    )
                    .bind(entry.id.as_uuid())
                    .bind(task.title())
                    .bind(task.description())
                    .bind(task.status())
                    .bind(&tags)
                    .bind(task.version().as_i64())
                    .bind(expected.as_i64())
                    .execute(&mut *conn)
                    .await
                    .map_err(db)?;
                    if result.rows_affected() == 0 {
                        return Err(conflict(conn, Table::Tasks, entry.id, expected).await);
                    }
                }
            }
            written.push((entry.id, task.version()));
        }

        for (id, version) in written {
            tasks.mark_persisted(&id, version);
        }
        Ok(())
    }

    async fn query_task_lists(
        &mut self,
        criteria: &TaskListFilter,
    ) -> Result<Vec<Shared<TaskList>>, StorageError> {
        self.flush().await?;
        let conn = self.conn().await?;
        let rows = match criteria {
            TaskListFilter::All => {
                sqlx::query(&format!(
                    "SELECT {TASK_LIST_COLUMNS} FROM task_lists ORDER BY name"
                ))
                .fetch_all(&mut *conn)
                .await
            }
            TaskListFilter::Id(id) => {
                sqlx::query(&format!(
                    "SELECT {TASK_LIST_COLUMNS} FROM task_lists WHERE id = $1"
                ))
                .bind(id.as_uuid())
                .fetch_all(&mut *conn)
                .await
            }
            TaskListFilter::Name(name) => {
                sqlx::query(&format!(
                    "SELECT {TASK_LIST_COLUMNS} FROM task_lists WHERE name = $1"
                ))
                .bind(name)
                .fetch_all(&mut *conn)
                .await
            }
        }
        .map_err(db)?;

        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            let (id, list) = row_to_task_list(row).map_err(db)?;
            found.push(self.task_lists.resolve(id, list.version(), || list));
        }
        Ok(found)
    }

    async fn query_tasks(&mut self, criteria: &TaskFilter) -> Result<Vec<Shared<Task>>, StorageError> {
        self.flush().await?;
        let conn = self.conn().await?;
        let rows = match criteria {
            TaskFilter::Id(id) => {
                sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                    .bind(id.as_uuid())
                    .fetch_all(&mut *conn)
                    .await
            }
            TaskFilter::TaskList(list_id) => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE task_list_id = $1 ORDER BY title"
                ))
                .bind(list_id.as_uuid())
                .fetch_all(&mut *conn)
                .await
            }
            TaskFilter::Status {
                task_list_id,
                status,
            } => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE task_list_id = $1 AND status = $2 ORDER BY title"
                ))
                .bind(task_list_id.as_uuid())
                .bind(status)
                .fetch_all(&mut *conn)
                .await
            }
        }
        .map_err(db)?;

        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            let (id, task) = row_to_task(row).map_err(db)?;
            found.push(self.tasks.resolve(id, task.version(), || task));
        }
        Ok(found)
    }

    /// Deletes a mapped row if storage holds it, checking its version.
    async fn delete(&mut self, table: Table, id: AggregateId) -> Result<(), StorageError> {
        let expected = match table {
            Table::TaskLists => self.task_lists.evict(&id).and_then(|e| e.persisted),
            Table::Tasks => self.tasks.evict(&id).and_then(|e| e.persisted),
        };
        let Some(expected) = expected else {
            return Ok(());
        };

        let conn = self.conn().await?;
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1 AND version = $2",
            table.name()
        ))
        .bind(id.as_uuid())
        .bind(expected.as_i64())
        .execute(&mut *conn)
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(conflict(conn, table, id, expected).await);
        }
        Ok(())
    }

    /// Forgets mapped tasks whose rows went with their list.
    async fn evict_tasks_of(&mut self, task_list_id: AggregateId) {
        let mut orphaned = Vec::new();
        for entry in self.tasks.iter() {
            if entry.handle.lock().await.task_list_id() == task_list_id {
                orphaned.push(entry.id);
            }
        }
        for id in orphaned {
            self.tasks.evict(&id);
        }
    }
}

/// Native transaction of the PostgreSQL store.
pub struct PostgresSession {
    state: Arc<Mutex<PgState>>,
}

#[async_trait]
impl StorageSession for PostgresSession {
    #[tracing::instrument(skip(self))]
    async fn commit(&mut self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.flush().await?;
        let tx = state.tx.take().ok_or(StorageError::SessionClosed)?;
        tx.commit().await.map_err(db)
    }

    #[tracing::instrument(skip(self))]
    async fn rollback(&mut self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.task_lists.clear();
        state.tasks.clear();
        match state.tx.take() {
            Some(tx) => tx.rollback().await.map_err(db),
            None => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.task_lists.clear();
        state.tasks.clear();
        if let Some(tx) = state.tx.take() {
            tx.rollback().await.map_err(db)?;
        }
        Ok(())
    }
}

/// Task list repository of a PostgreSQL session.
pub struct PgTaskListRepository(Arc<Mutex<PgState>>);

#[async_trait]
impl Repository for PgTaskListRepository {
    type Aggregate = TaskList;
    type Criteria = TaskListFilter;

    async fn find(
        &mut self,
        criteria: &TaskListFilter,
    ) -> Result<Vec<Shared<TaskList>>, StorageError> {
        self.0.lock().await.query_task_lists(criteria).await
    }

    async fn add(&mut self, aggregates: Vec<Shared<TaskList>>) -> Result<(), StorageError> {
        let mut state = self.0.lock().await;
        state.ensure_open()?;
        for list in aggregates {
            state.task_lists.register(list).await;
        }
        Ok(())
    }

    async fn remove(
        &mut self,
        criteria: &TaskListFilter,
    ) -> Result<Vec<Shared<TaskList>>, StorageError> {
        let mut state = self.0.lock().await;
        let found = state.query_task_lists(criteria).await?;
        for list in &found {
            if let Some(id) = list.id().await {
                state.delete(Table::TaskLists, id).await?;
                state.evict_tasks_of(id).await;
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl TaskListRepository for PgTaskListRepository {
    async fn add_tasks(&mut self, tasks: Vec<Shared<Task>>) -> Result<(), StorageError> {
        let mut state = self.0.lock().await;
        state.flush_task_lists().await?;
        for task in tasks {
            state.tasks.register(task).await;
        }
        Ok(())
    }
}

/// Task repository of a PostgreSQL session.
pub struct PgTaskRepository(Arc<Mutex<PgState>>);

#[async_trait]
impl Repository for PgTaskRepository {
    type Aggregate = Task;
    type Criteria = TaskFilter;

    async fn find(&mut self, criteria: &TaskFilter) -> Result<Vec<Shared<Task>>, StorageError> {
        self.0.lock().await.query_tasks(criteria).await
    }

    async fn add(&mut self, aggregates: Vec<Shared<Task>>) -> Result<(), StorageError> {
        let mut state = self.0.lock().await;
        state.flush_task_lists().await?;
        for task in aggregates {
            state.tasks.register(task).await;
        }
        Ok(())
    }

    async fn remove(&mut self, criteria: &TaskFilter) -> Result<Vec<Shared<Task>>, StorageError> {
        let mut state = self.0.lock().await;
        let found = state.query_tasks(criteria).await?;
        for task in &found {
            if let Some(id) = task.id().await {
                state.delete(Table::Tasks, id).await?;
            }
        }
        Ok(found)
    }
}

/// Bulk task updates issued inside the session's transaction.
pub struct PgTaskDao(Arc<Mutex<PgState>>);

#[async_trait]
impl TaskDao for PgTaskDao {
    #[tracing::instrument(skip(self))]
    async fn update_all_tasks_with_status(
        &self,
        task_list_id: AggregateId,
        old_status: &str,
        new_status: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.0.lock().await;
        // The owning list is locked by the caller. Lists were flushed when
        // their tasks were added, so flushing tasks alone keeps the FK intact.
        state.flush_tasks().await?;

        let conn = state.conn().await?;
        let result = sqlx::query(
            "UPDATE tasks SET status = $1 WHERE task_list_id = $2 AND status = $3",
        )
        .bind(new_status)
        .bind(task_list_id.as_uuid())
        .bind(old_status)
        .execute(&mut *conn)
        .await
        .map_err(db)?;

        for handle in state.tasks.handles() {
            let mut task = handle.lock().await;
            if task.task_list_id() == task_list_id && task.status() == old_status {
                task.apply_bulk_status(new_status);
            }
        }

        metrics::counter!("task_store_bulk_migrated_tasks_total").increment(result.rows_affected());
        tracing::debug!(rows = result.rows_affected(), "Tasks migrated in transaction");
        Ok(())
    }
}

/// Repositories bound to a PostgreSQL session.
pub type PgRepositories = TaskRepositories<PgTaskListRepository, PgTaskRepository, PgTaskDao>;

#[async_trait]
impl Backend for PostgresTaskStore {
    type Session = PostgresSession;
    type Repositories = PgRepositories;

    #[tracing::instrument(skip(self))]
    async fn open(
        &self,
        isolation: IsolationLevel,
    ) -> Result<(PostgresSession, PgRepositories), StorageError> {
        let tx = begin_transaction(&self.pool, isolation).await?;
        let state = Arc::new(Mutex::new(PgState {
            pool: self.pool.clone(),
            isolation,
            tx: Some(tx),
            closed: false,
            task_lists: IdentityMap::new(),
            tasks: IdentityMap::new(),
        }));

        let repositories = TaskRepositories::new(
            PgTaskListRepository(Arc::clone(&state)),
            PgTaskRepository(Arc::clone(&state)),
            PgTaskDao(Arc::clone(&state)),
        );
        Ok((PostgresSession { state }, repositories))
    }
}
