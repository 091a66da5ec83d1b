//! Commit protocol of the unit of work against a small in-memory backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{IsolationLevel, StorageError, Version};
use domain::{Aggregate, AggregateMeta, DomainEvent};
use tokio::sync::{Mutex, RwLock};
use unit_of_work::{
    Backend, InMemoryPublisher, MemoryTable, Repository, RepositoryRegistry, SeenSet, Shared,
    StagedTable, StorageSession, Tracked, UnitOfWork, UowError, UowState,
};

#[derive(Debug, Clone, Default)]
struct Note {
    meta: AggregateMeta,
    title: String,
}

impl Note {
    fn write(title: &str) -> Self {
        let mut note = Note {
            meta: AggregateMeta::new(),
            title: title.to_string(),
        };
        note.meta
            .emit(DomainEvent::new("NoteWritten", serde_json::json!({ "title": title })));
        note
    }

    fn edit(&mut self, title: &str) {
        self.title = title.to_string();
        self.meta.emit(DomainEvent::new("NoteEdited", title));
    }
}

impl Aggregate for Note {
    fn aggregate_type() -> &'static str {
        "Note"
    }

    fn meta(&self) -> &AggregateMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut AggregateMeta {
        &mut self.meta
    }
}

enum NoteFilter {
    All,
    Title(&'static str),
}

impl NoteFilter {
    fn matches(&self, note: &Note) -> bool {
        match self {
            NoteFilter::All => true,
            NoteFilter::Title(title) => note.title == *title,
        }
    }
}

#[derive(Clone, Default)]
struct NoteStore {
    committed: Arc<RwLock<MemoryTable<Note>>>,
    fail_commit: Arc<AtomicBool>,
    open_sessions: Arc<AtomicUsize>,
}

impl NoteStore {
    async fn stored_version(&self, title: &str) -> Option<Version> {
        self.committed
            .read()
            .await
            .rows()
            .find(|n| n.title == title)
            .map(|n| n.version())
    }
}

struct NoteSession {
    committed: Arc<RwLock<MemoryTable<Note>>>,
    staged: Arc<Mutex<StagedTable<Note>>>,
    fail_commit: Arc<AtomicBool>,
    open_sessions: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl StorageSession for NoteSession {
    async fn commit(&mut self) -> Result<(), StorageError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(StorageError::database(std::io::Error::other("disk full")));
        }
        let mut committed = self.committed.write().await;
        let mut staged = self.staged.lock().await;
        let changes = staged.prepare(&committed).await?;
        staged.apply(&mut committed, changes);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        self.staged.lock().await.discard();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        if !self.closed {
            self.closed = true;
            self.staged.lock().await.discard();
            self.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct NoteRepository {
    committed: Arc<RwLock<MemoryTable<Note>>>,
    staged: Arc<Mutex<StagedTable<Note>>>,
}

#[async_trait]
impl Repository for NoteRepository {
    type Aggregate = Note;
    type Criteria = NoteFilter;

    async fn find(&mut self, criteria: &NoteFilter) -> Result<Vec<Shared<Note>>, StorageError> {
        let committed = self.committed.read().await;
        let mut staged = self.staged.lock().await;
        Ok(staged.find(&committed, |n| criteria.matches(n)).await)
    }

    async fn add(&mut self, aggregates: Vec<Shared<Note>>) -> Result<(), StorageError> {
        let mut staged = self.staged.lock().await;
        for note in aggregates {
            staged.add(note).await;
        }
        Ok(())
    }

    async fn remove(&mut self, criteria: &NoteFilter) -> Result<Vec<Shared<Note>>, StorageError> {
        let committed = self.committed.read().await;
        let mut staged = self.staged.lock().await;
        Ok(staged.remove(&committed, |n| criteria.matches(n)).await)
    }
}

struct NoteRepositories {
    notes: Tracked<NoteRepository>,
}

impl RepositoryRegistry for NoteRepositories {
    fn seen_sets(&mut self) -> Vec<&mut SeenSet> {
        vec![self.notes.seen_mut()]
    }
}

#[async_trait]
impl Backend for NoteStore {
    type Session = NoteSession;
    type Repositories = NoteRepositories;

    async fn open(
        &self,
        _isolation: IsolationLevel,
    ) -> Result<(NoteSession, NoteRepositories), StorageError> {
        let staged = Arc::new(Mutex::new(StagedTable::new()));
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        let session = NoteSession {
            committed: Arc::clone(&self.committed),
            staged: Arc::clone(&staged),
            fail_commit: Arc::clone(&self.fail_commit),
            open_sessions: Arc::clone(&self.open_sessions),
            closed: false,
        };
        let repositories = NoteRepositories {
            notes: Tracked::new(NoteRepository {
                committed: Arc::clone(&self.committed),
                staged,
            }),
        };
        Ok((session, repositories))
    }
}

fn setup() -> (Arc<NoteStore>, InMemoryPublisher) {
    (Arc::new(NoteStore::default()), InMemoryPublisher::new())
}

fn uow(store: &Arc<NoteStore>, publisher: &InMemoryPublisher) -> UnitOfWork<NoteStore> {
    UnitOfWork::new(Arc::clone(store), Arc::new(publisher.clone()))
}

async fn seed(store: &Arc<NoteStore>, publisher: &InMemoryPublisher, title: &str) {
    let mut uow = uow(store, publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    uow.repositories()
        .unwrap()
        .notes
        .add_one(Shared::new(Note::write(title)))
        .await
        .unwrap();
    uow.commit().await.unwrap();
    uow.close().await.unwrap();
    publisher.clear().await;
}

#[tokio::test]
async fn commit_publishes_events_and_advances_versions_once() {
    let (store, publisher) = setup();
    let mut uow = uow(&store, &publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();

    let note = Shared::new(Note::write("groceries"));
    note.lock().await.edit("groceries for sunday");
    let repos = uow.repositories().unwrap();
    repos.notes.add_one(note.clone()).await.unwrap();
    repos.notes.find(&NoteFilter::All).await.unwrap();
    uow.commit().await.unwrap();
    uow.close().await.unwrap();

    assert_eq!(publisher.channels().await, vec!["NoteWritten", "NoteEdited"]);
    let note = note.lock().await;
    assert_eq!(note.version(), Version::new(1));
    assert!(note.pending_events().is_empty());
    assert_eq!(
        store.stored_version("groceries for sunday").await,
        Some(Version::new(1))
    );
}

#[tokio::test]
async fn read_only_find_still_advances_version() {
    let (store, publisher) = setup();
    seed(&store, &publisher, "readme").await;

    let mut uow = uow(&store, &publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let found = uow
        .repositories()
        .unwrap()
        .notes
        .find(&NoteFilter::Title("readme"))
        .await
        .unwrap();
    uow.commit().await.unwrap();
    uow.close().await.unwrap();

    assert_eq!(found[0].version().await, Version::new(2));
    assert_eq!(store.stored_version("readme").await, Some(Version::new(2)));
    assert_eq!(publisher.count().await, 0);
}

#[tokio::test]
async fn publish_failure_leaves_storage_and_versions_untouched() {
    let (store, publisher) = setup();
    let mut uow = uow(&store, &publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let note = Shared::new(Note::write("draft"));
    uow.repositories()
        .unwrap()
        .notes
        .add_one(note.clone())
        .await
        .unwrap();

    publisher.set_fail(true);
    let err = uow.commit().await.unwrap_err();
    uow.close().await.unwrap();

    assert!(matches!(err, UowError::Publish { published: 0, .. }));
    assert!(!err.is_divergent());
    assert_eq!(note.version().await, Version::initial());
    assert!(store.committed.read().await.is_empty());
}

#[tokio::test]
async fn failed_publish_blocks_further_commits() {
    let (store, publisher) = setup();
    let mut uow = uow(&store, &publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let note = Shared::new(Note::write("draft"));
    uow.repositories()
        .unwrap()
        .notes
        .add_one(note.clone())
        .await
        .unwrap();

    publisher.set_fail(true);
    assert!(uow.commit().await.is_err());
    assert_eq!(uow.state(), UowState::Failed);

    publisher.set_fail(false);
    assert!(matches!(
        uow.commit().await,
        Err(UowError::InvalidState {
            state: UowState::Failed,
            ..
        })
    ));
    assert!(uow.repositories().is_err());

    uow.rollback().await.unwrap();
    assert_eq!(uow.state(), UowState::RolledBack);
    uow.close().await.unwrap();

    assert!(store.committed.read().await.is_empty());
    assert_eq!(publisher.count().await, 0);
    assert_eq!(note.version().await, Version::initial());
    assert_eq!(store.open_sessions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_storage_commit_is_closed_with_a_rollback() {
    let (store, publisher) = setup();
    let mut uow = uow(&store, &publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    uow.repositories()
        .unwrap()
        .notes
        .add_one(Shared::new(Note::write("lost")))
        .await
        .unwrap();

    store.fail_commit.store(true, Ordering::SeqCst);
    assert!(uow.commit().await.unwrap_err().is_divergent());
    store.fail_commit.store(false, Ordering::SeqCst);

    assert!(uow.commit().await.is_err());
    uow.close().await.unwrap();

    assert_eq!(uow.state(), UowState::Closed);
    assert!(store.committed.read().await.is_empty());
    assert_eq!(store.open_sessions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn storage_failure_after_publish_is_divergent() {
    let (store, publisher) = setup();
    let mut uow = uow(&store, &publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    uow.repositories()
        .unwrap()
        .notes
        .add_one(Shared::new(Note::write("lost")))
        .await
        .unwrap();

    store.fail_commit.store(true, Ordering::SeqCst);
    let err = uow.commit().await.unwrap_err();
    uow.close().await.unwrap();

    assert!(matches!(
        err,
        UowError::DivergentCommit {
            events_published: 1,
            aggregates_advanced: 1,
            ..
        }
    ));
    assert!(err.is_divergent());
    assert_eq!(publisher.count().await, 1);
    assert!(store.committed.read().await.is_empty());
}

#[tokio::test]
async fn storage_failure_with_nothing_tracked_is_plain() {
    let (store, publisher) = setup();
    let mut uow = uow(&store, &publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();

    store.fail_commit.store(true, Ordering::SeqCst);
    let err = uow.commit().await.unwrap_err();
    uow.close().await.unwrap();

    assert!(matches!(err, UowError::Storage(_)));
}

#[tokio::test]
async fn close_without_commit_discards_work() {
    let (store, publisher) = setup();
    let mut uow = uow(&store, &publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    uow.repositories()
        .unwrap()
        .notes
        .add_one(Shared::new(Note::write("scratch")))
        .await
        .unwrap();
    uow.close().await.unwrap();
    uow.close().await.unwrap();

    assert_eq!(uow.state(), UowState::Closed);
    assert!(store.committed.read().await.is_empty());
    assert_eq!(publisher.count().await, 0);
    assert_eq!(store.open_sessions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn work_after_commit_is_committed_by_the_next_commit() {
    let (store, publisher) = setup();
    let mut uow = uow(&store, &publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let first = Shared::new(Note::write("first"));
    uow.repositories()
        .unwrap()
        .notes
        .add_one(first.clone())
        .await
        .unwrap();
    uow.commit().await.unwrap();

    let second = Shared::new(Note::write("second"));
    uow.repositories()
        .unwrap()
        .notes
        .add_one(second.clone())
        .await
        .unwrap();
    uow.commit().await.unwrap();
    uow.close().await.unwrap();

    assert_eq!(first.version().await, Version::new(1));
    assert_eq!(second.version().await, Version::new(1));
    assert_eq!(store.committed.read().await.len(), 2);
    assert_eq!(publisher.count().await, 2);
}

#[tokio::test]
async fn new_scope_starts_with_empty_seen_sets() {
    let (store, publisher) = setup();
    seed(&store, &publisher, "kept").await;
    let mut uow = uow(&store, &publisher);

    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    uow.repositories()
        .unwrap()
        .notes
        .find(&NoteFilter::All)
        .await
        .unwrap();
    uow.close().await.unwrap();

    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    assert!(uow.repositories().unwrap().notes.seen().is_empty());
    uow.commit().await.unwrap();
    uow.close().await.unwrap();

    assert_eq!(store.stored_version("kept").await, Some(Version::new(1)));
}

#[tokio::test]
async fn commit_clears_seen_sets() {
    let (store, publisher) = setup();
    let mut uow = uow(&store, &publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let note = Shared::new(Note::write("once"));
    uow.repositories()
        .unwrap()
        .notes
        .add_one(note.clone())
        .await
        .unwrap();
    assert_eq!(uow.repositories().unwrap().notes.seen().len(), 1);

    uow.commit().await.unwrap();
    uow.commit().await.unwrap();
    uow.close().await.unwrap();

    assert_eq!(note.version().await, Version::new(1));
}

#[tokio::test]
async fn removed_aggregates_are_published_and_deleted() {
    let (store, publisher) = setup();
    seed(&store, &publisher, "old").await;
    let mut uow = uow(&store, &publisher);
    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();

    let removed = uow
        .repositories()
        .unwrap()
        .notes
        .remove(&NoteFilter::Title("old"))
        .await
        .unwrap();
    removed[0].lock().await.edit("old (deleted)");
    uow.commit().await.unwrap();
    uow.close().await.unwrap();

    assert_eq!(publisher.channels().await, vec!["NoteEdited"]);
    assert_eq!(removed[0].version().await, Version::new(2));
    assert!(store.committed.read().await.is_empty());
}

#[tokio::test]
async fn lifecycle_misuse_is_rejected() {
    let (store, publisher) = setup();
    let mut uow = uow(&store, &publisher);

    assert!(matches!(
        uow.commit().await,
        Err(UowError::InvalidState {
            state: UowState::Idle,
            ..
        })
    ));
    assert!(uow.repositories().is_err());

    uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
    assert!(matches!(
        uow.begin(IsolationLevel::ReadCommitted).await,
        Err(UowError::InvalidState {
            state: UowState::Active,
            ..
        })
    ));

    uow.rollback().await.unwrap();
    uow.rollback().await.unwrap();
    assert_eq!(uow.state(), UowState::RolledBack);
    assert!(uow.commit().await.is_err());
    uow.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_writers_conflict_on_stale_version() {
    let (store, publisher) = setup();
    seed(&store, &publisher, "shared").await;
    let mut first = uow(&store, &publisher);
    let mut second = uow(&store, &publisher);
    first.begin(IsolationLevel::ReadCommitted).await.unwrap();
    second.begin(IsolationLevel::ReadCommitted).await.unwrap();

    for uow in [&mut first, &mut second] {
        let notes = uow
            .repositories()
            .unwrap()
            .notes
            .find(&NoteFilter::All)
            .await
            .unwrap();
        notes[0].lock().await.edit("edited");
    }

    first.commit().await.unwrap();
    let err = second.commit().await.unwrap_err();
    first.close().await.unwrap();
    second.close().await.unwrap();

    assert!(matches!(
        err,
        UowError::DivergentCommit {
            source: StorageError::VersionConflict { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn cancelled_scope_releases_its_session() {
    let (store, publisher) = setup();
    let scope = {
        let store = Arc::clone(&store);
        let publisher = publisher.clone();
        async move {
            let mut uow = uow(&store, &publisher);
            uow.begin(IsolationLevel::ReadCommitted).await.unwrap();
            uow.repositories()
                .unwrap()
                .notes
                .add_one(Shared::new(Note::write("abandoned")))
                .await
                .unwrap();
            std::future::pending::<()>().await;
        }
    };

    let outcome = tokio::time::timeout(Duration::from_millis(20), scope).await;
    assert!(outcome.is_err());

    for _ in 0..50 {
        if store.open_sessions.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(store.open_sessions.load(Ordering::SeqCst), 0);
    assert!(store.committed.read().await.is_empty());
    assert_eq!(publisher.count().await, 0);
}
