//! Unit of work over tracked repositories.
//!
//! Repositories wrapped in [`Tracked`] record every aggregate they hand out or
//! accept. On [`UnitOfWork::commit`] those aggregates' pending events are
//! published, their versions advanced and the storage session committed.

pub mod error;
pub mod identity;
pub mod memory;
pub mod publisher;
pub mod repository;
pub mod seen;
pub mod session;
pub mod shared;
pub mod uow;

pub use error::{PublishError, Result, UowError};
pub use identity::{IdentityEntry, IdentityMap};
pub use memory::{MemoryTable, StagedChanges, StagedTable};
pub use publisher::{InMemoryPublisher, PublishedMessage, Publisher, TracingPublisher};
pub use repository::{Repository, Tracked};
pub use seen::SeenSet;
pub use session::{Backend, RepositoryRegistry, StorageSession};
pub use shared::Shared;
pub use uow::{UnitOfWork, UowState};
