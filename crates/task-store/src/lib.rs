//! Task list storage and the write-side service built on the unit of work.

pub mod config;
pub mod dto;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod service;
pub mod telemetry;

pub use config::{ConfigError, Environment, StoreConfig};
pub use dto::{
    AddTaskListStatus, CreateTask, CreateTaskList, RemoveTaskListStatus, TaskListView, TaskView,
    UpdateTask, UpdateTaskList,
};
pub use error::{Result, ServiceError};
pub use memory::{InMemoryTaskStore, MemoryRepositories};
pub use postgres::{PgRepositories, PostgresTaskStore};
pub use repository::{
    TaskFilter, TaskListFilter, TaskListRepository, TaskRepositories, TaskRepository, TaskStore,
};
pub use service::TaskListService;
pub use telemetry::init_tracing;
