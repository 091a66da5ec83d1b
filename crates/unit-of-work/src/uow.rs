//! The unit of work and its commit protocol.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use common::{IsolationLevel, StorageError};

use crate::error::{Result, UowError};
use crate::publisher::Publisher;
use crate::seen::TrackedAggregate;
use crate::session::{Backend, RepositoryRegistry, StorageSession};

/// Lifecycle of a [`UnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UowState {
    /// Constructed, never begun.
    Idle,
    /// Inside a scope with work that has not been committed.
    Active,
    /// Inside a scope and nothing happened since the last commit.
    Committed,
    /// Inside a scope after an explicit rollback.
    RolledBack,
    /// A commit failed after harvesting. Only rollback or close are accepted.
    Failed,
    /// The scope was closed. `begin` starts a new one.
    Closed,
}

impl fmt::Display for UowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UowState::Idle => "idle",
            UowState::Active => "active",
            UowState::Committed => "committed",
            UowState::RolledBack => "rolled back",
            UowState::Failed => "failed",
            UowState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Coordinates one transaction scope at a time over a storage backend.
///
/// Commit drains pending events from every aggregate the repositories have
/// seen, publishes them, advances each of those aggregates' versions by one
/// and only then commits the native transaction.
///
/// Callers must `close` the scope on every exit path. A unit of work dropped
/// with an open scope rolls back and closes its session on the runtime.
pub struct UnitOfWork<B: Backend> {
    backend: Arc<B>,
    publisher: Arc<dyn Publisher>,
    state: UowState,
    isolation: IsolationLevel,
    session: Option<B::Session>,
    repositories: Option<B::Repositories>,
}

impl<B: Backend> UnitOfWork<B> {
    pub fn new(backend: Arc<B>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            backend,
            publisher,
            state: UowState::Idle,
            isolation: IsolationLevel::default(),
            session: None,
            repositories: None,
        }
    }

    pub fn state(&self) -> UowState {
        self.state
    }

    /// Isolation level of the current or most recent scope.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Opens a scope with fresh repositories and empty seen-sets.
    #[tracing::instrument(skip(self))]
    pub async fn begin(&mut self, isolation: IsolationLevel) -> Result<()> {
        match self.state {
            UowState::Idle | UowState::Closed => {}
            state => {
                return Err(UowError::InvalidState {
                    operation: "begin",
                    state,
                });
            }
        }

        let (session, repositories) = self.backend.open(isolation).await?;
        self.session = Some(session);
        self.repositories = Some(repositories);
        self.isolation = isolation;
        self.state = UowState::Active;
        tracing::debug!("Unit of work begun");
        Ok(())
    }

    /// Repositories bound to the current scope.
    pub fn repositories(&mut self) -> Result<&mut B::Repositories> {
        match self.state {
            UowState::Active | UowState::Committed => {}
            state => {
                return Err(UowError::InvalidState {
                    operation: "use repositories of",
                    state,
                });
            }
        }
        self.state = UowState::Active;
        self.repositories
            .as_mut()
            .ok_or(UowError::Storage(StorageError::SessionClosed))
    }

    /// Publishes pending events, advances versions and commits storage.
    ///
    /// Publishing happens before the native commit. A storage failure after
    /// anything was published or advanced is reported as
    /// [`UowError::DivergentCommit`].
    ///
    /// Any failure past the state check leaves the scope [`UowState::Failed`];
    /// it then accepts only rollback or close.
    #[tracing::instrument(skip(self), fields(isolation = %self.isolation))]
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_in_scope("commit")?;
        let outcome = self.run_commit().await;
        if outcome.is_err() {
            self.state = UowState::Failed;
        }
        outcome
    }

    async fn run_commit(&mut self) -> Result<()> {
        let seen = self.harvest_seen();
        let mut events = Vec::new();
        for aggregate in &seen {
            events.extend(aggregate.take_events().await);
        }

        for (published, event) in events.iter().enumerate() {
            if let Err(source) = self.publisher.publish(event.channel(), event.payload()).await {
                tracing::warn!(
                    published,
                    channel = event.channel(),
                    error = %source,
                    "Event publication failed; storage left uncommitted"
                );
                metrics::counter!("uow_events_published_total").increment(published as u64);
                return Err(UowError::Publish { published, source });
            }
        }
        metrics::counter!("uow_events_published_total").increment(events.len() as u64);

        for aggregate in &seen {
            aggregate.advance_version().await;
        }

        let session = self.session.as_mut().ok_or(StorageError::SessionClosed)?;
        if let Err(source) = session.commit().await {
            if seen.is_empty() {
                return Err(UowError::Storage(source));
            }
            metrics::counter!("uow_divergent_commits_total").increment(1);
            tracing::error!(
                events_published = events.len(),
                aggregates_advanced = seen.len(),
                error = %source,
                "Storage commit failed after events were published"
            );
            return Err(UowError::DivergentCommit {
                events_published: events.len(),
                aggregates_advanced: seen.len(),
                source,
            });
        }

        self.state = UowState::Committed;
        metrics::counter!("uow_commits_total").increment(1);
        tracing::debug!(
            aggregates = seen.len(),
            events = events.len(),
            "Unit of work committed"
        );
        Ok(())
    }

    /// Discards uncommitted storage work. Repeating it is a no-op.
    ///
    /// Pending events and in-memory aggregate state are not reverted.
    #[tracing::instrument(skip(self))]
    pub async fn rollback(&mut self) -> Result<()> {
        match self.state {
            UowState::Active | UowState::Committed | UowState::Failed => {}
            UowState::RolledBack => return Ok(()),
            state => {
                return Err(UowError::InvalidState {
                    operation: "roll back",
                    state,
                });
            }
        }

        let session = self.session.as_mut().ok_or(StorageError::SessionClosed)?;
        session.rollback().await?;
        self.state = UowState::RolledBack;
        metrics::counter!("uow_rollbacks_total").increment(1);
        tracing::debug!("Unit of work rolled back");
        Ok(())
    }

    /// Ends the scope: rolls back anything uncommitted and releases the session.
    ///
    /// Safe to call in any state and more than once.
    #[tracing::instrument(skip(self))]
    pub async fn close(&mut self) -> Result<()> {
        self.repositories = None;
        let Some(mut session) = self.session.take() else {
            if self.state != UowState::Idle {
                self.state = UowState::Closed;
            }
            return Ok(());
        };

        let rolled_back = if matches!(
            self.state,
            UowState::Active | UowState::Committed | UowState::Failed
        ) {
            metrics::counter!("uow_rollbacks_total").increment(1);
            session.rollback().await
        } else {
            Ok(())
        };
        let closed = session.close().await;
        self.state = UowState::Closed;

        rolled_back?;
        closed?;
        tracing::debug!("Unit of work closed");
        Ok(())
    }

    fn ensure_in_scope(&self, operation: &'static str) -> Result<()> {
        match self.state {
            UowState::Active | UowState::Committed => Ok(()),
            state => Err(UowError::InvalidState { operation, state }),
        }
    }

    /// Collects and clears every seen-set, keeping one entry per instance.
    fn harvest_seen(&mut self) -> Vec<Arc<dyn TrackedAggregate>> {
        let mut harvested: Vec<Arc<dyn TrackedAggregate>> = Vec::new();
        let Some(repositories) = self.repositories.as_mut() else {
            return harvested;
        };
        let mut keys = HashSet::new();
        for seen in repositories.seen_sets() {
            for aggregate in seen.take() {
                if keys.insert(aggregate.key()) {
                    harvested.push(aggregate);
                }
            }
        }
        harvested
    }
}

impl<B: Backend> Drop for UnitOfWork<B> {
    fn drop(&mut self) {
        self.repositories = None;
        let Some(mut session) = self.session.take() else {
            return;
        };
        let needs_rollback = matches!(
            self.state,
            UowState::Active | UowState::Committed | UowState::Failed
        );
        tracing::warn!(state = %self.state, "Unit of work dropped with an open scope");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if needs_rollback && let Err(e) = session.rollback().await {
                        tracing::warn!(error = %e, "Rollback of abandoned session failed");
                    }
                    if let Err(e) = session.close().await {
                        tracing::warn!(error = %e, "Close of abandoned session failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!("No async runtime to release an abandoned storage session");
            }
        }
    }
}

impl<B: Backend> fmt::Debug for UnitOfWork<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.state)
            .field("isolation", &self.isolation)
            .finish_non_exhaustive()
    }
}
