//! Durable store for repositories, builds, and per-ref enqueue state.
//!
//! # Architecture
//!
//! All entities live in one [`StoreState`] behind a single mutex. Every
//! mutating operation is a transaction run by [`Store::update`]:
//!
//! - **Atomic read-decide-write**: the closure runs against the locked state,
//!   so the enqueue decision and the build/ref-state writes it implies cannot
//!   interleave with another producer.
//! - **All or nothing**: the events the closure produced are appended to the
//!   event log and fsynced before the lock is released. If the closure fails
//!   or the append fails, the state is rolled back and the caller sees `Err`.
//! - **Bounded writes**: a transaction appends only the entities it touched.
//!   Every [`COMPACT_AFTER`] events the state is written as a snapshot and the
//!   log is emptied (see `events` for the recovery rules).
//!
//! Transactions and log reads run on the blocking pool. Build log text is kept
//! out of the snapshot in one file per build (see `logs`).
//!
//! A store opened without a directory never touches the filesystem.
//!
//! # Layout
//!
//! ```text
//! <dir>/snapshot.json
//! <dir>/events.log
//! <dir>/logs/<build id>.log
//! ```

mod events;
mod logs;
mod snapshot;
mod state;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{
    Build, BuildId, BuildStatus, NewRepository, RefKey, RefState, Repository, RepositoryId,
};

use events::EventLog;
use logs::BuildLogs;

pub use events::{EventRecord, StoreEvent};
pub use state::{BuildFilter, SCHEMA_VERSION, StoreState};

/// Events appended between snapshots.
pub const COMPACT_AFTER: usize = 1000;

const SNAPSHOT_FILE: &str = "snapshot.json";
const EVENTS_FILE: &str = "events.log";
const LOGS_DIR: &str = "logs";

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error reading or writing the snapshot, event log, or build logs.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot was written by an incompatible version.
    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },

    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("build not found: {0}")]
    BuildNotFound(BuildId),

    #[error("invalid repository: {0}")]
    InvalidRepository(String),

    #[error("repository {owner}/{name} is already registered")]
    RepositoryExists { owner: String, name: String },

    #[error("repository not found: {0}")]
    RepositoryNotFound(RepositoryId),

    /// A status change that would break the QUEUED -> RUNNING -> terminal order.
    #[error("build {id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        id: BuildId,
        from: BuildStatus,
        to: BuildStatus,
    },
}

/// Shared handle to the persisted entities. Clones share one store.
#[derive(Debug, Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<StoreState>,
    disk: Option<Disk>,
    logs: BuildLogs,
}

#[derive(Debug)]
struct Disk {
    dir: PathBuf,
    events: EventLog,
    /// Only touched under the state lock.
    since_compaction: AtomicUsize,
}

impl Disk {
    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Writes `state` as the new snapshot, then empties the log. A crash in
    /// between leaves events the snapshot already covers; replay skips them
    /// by sequence number.
    fn compact(&self, state: &StoreState) -> Result<(), StoreError> {
        snapshot::save_atomic(&self.snapshot_path(), state)?;
        self.events.truncate()?;
        self.since_compaction.store(0, Ordering::Relaxed);
        debug!(dir = %self.dir.display(), last_seq = state.last_seq, "Compacted store");
        Ok(())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // A panic while holding the lock leaves state that was valid at the
        // last completed transaction; keep serving it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transact<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.lock();
        let checkpoint = state.checkpoint();

        let value = match f(&mut state) {
            Ok(value) => value,
            Err(e) => {
                state.rollback(checkpoint);
                return Err(e);
            }
        };

        let Some(disk) = &self.disk else {
            state.commit();
            return Ok(value);
        };

        let ts = Utc::now();
        let records: Vec<EventRecord> = state
            .journaled()
            .cloned()
            .zip(state.last_seq + 1..)
            .map(|(event, seq)| EventRecord { seq, ts, event })
            .collect();
        if records.is_empty() {
            return Ok(value);
        }

        if let Err(e) = disk.events.append(&records) {
            state.rollback(checkpoint);
            return Err(e);
        }
        state.last_seq += records.len() as u64;
        state.commit();

        let pending = disk.since_compaction.fetch_add(records.len(), Ordering::Relaxed)
            + records.len();
        if pending >= COMPACT_AFTER
            && let Err(e) = disk.compact(&state)
        {
            // The events are durable in the log; compaction is retried later.
            warn!(error = %e, "Store compaction failed");
        }

        Ok(value)
    }
}

impl Store {
    /// Creates a store that is never persisted.
    pub fn in_memory() -> Self {
        Store {
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState::default()),
                disk: None,
                logs: BuildLogs::in_memory(),
            }),
        }
    }

    /// Opens the store in `dir`: loads the snapshot, replays the event log on
    /// top of it, and compacts if anything was replayed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let disk = Disk {
            events: EventLog::new(dir.join(EVENTS_FILE)),
            dir,
            since_compaction: AtomicUsize::new(0),
        };

        let mut state = match snapshot::try_load(&disk.snapshot_path())? {
            Some(state) => {
                info!(dir = %disk.dir.display(), last_seq = state.last_seq, "Loaded store snapshot");
                state
            }
            None => {
                info!(dir = %disk.dir.display(), "No store snapshot, starting empty");
                StoreState::default()
            }
        };

        let records = disk.events.replay(state.last_seq)?;
        if !records.is_empty() {
            let replayed = records.len();
            for record in records {
                state.last_seq = record.seq;
                state.apply(record.event);
            }
            disk.compact(&state)?;
            info!(replayed, "Replayed store event log");
        }

        let logs = BuildLogs::in_dir(disk.dir.join(LOGS_DIR))?;
        Ok(Store {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                disk: Some(disk),
                logs,
            }),
        })
    }

    /// Returns the store directory, if persistent.
    pub fn dir(&self) -> Option<&Path> {
        self.shared.disk.as_ref().map(|disk| disk.dir.as_path())
    }

    /// Runs `f` on the blocking pool when the store touches disk.
    async fn blocking<T: Send + 'static>(
        &self,
        f: impl FnOnce(&Shared) -> Result<T, StoreError> + Send + 'static,
    ) -> Result<T, StoreError> {
        if self.shared.disk.is_none() {
            return f(self.shared.as_ref());
        }
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || f(shared.as_ref())).await?
    }

    /// Runs a read-only closure against the current state.
    pub fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        let state = self.shared.lock();
        f(&state)
    }

    /// Runs a closure as one transaction.
    ///
    /// The result is returned once the closure's changes are durable. If the
    /// closure returns `Err`, or the changes cannot be written, nothing it did
    /// remains visible.
    pub async fn update<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreState) -> Result<T, StoreError> + Send + 'static,
    {
        self.blocking(move |shared| shared.transact(f)).await
    }

    // ─── Repositories ───

    /// Registers a repository. `(owner, name)` must be valid path segments
    /// and must not match an active repository.
    pub async fn create_repository(&self, input: NewRepository) -> Result<Repository, StoreError> {
        input.validate().map_err(StoreError::InvalidRepository)?;
        self.update(|state| {
            if state.find_active_repository(&input.owner, &input.name).is_some() {
                return Err(StoreError::RepositoryExists {
                    owner: input.owner,
                    name: input.name,
                });
            }
            Ok(state.insert_repository(input, Utc::now()))
        })
        .await
    }

    /// All repositories, newest first.
    pub fn list_repositories(&self) -> Vec<Repository> {
        self.read(|state| state.repositories().rev().cloned().collect())
    }

    pub fn active_repositories(&self) -> Vec<Repository> {
        self.read(|state| state.repositories().filter(|r| r.is_active).cloned().collect())
    }

    pub fn get_repository(&self, id: RepositoryId) -> Option<Repository> {
        self.read(|state| state.repository(id).cloned())
    }

    /// An active repository by id; inactive ones are treated as absent.
    pub fn get_active_repository(&self, id: RepositoryId) -> Option<Repository> {
        self.get_repository(id).filter(|r| r.is_active)
    }

    pub fn find_active_repository(&self, owner: &str, name: &str) -> Option<Repository> {
        self.read(|state| state.find_active_repository(owner, name).cloned())
    }

    /// Soft-deletes a repository.
    pub async fn deactivate_repository(&self, id: RepositoryId) -> Result<Repository, StoreError> {
        self.update(move |state| state.set_repository_active(id, false, Utc::now()))
            .await
    }

    // ─── Builds ───

    /// A build with its full log.
    pub async fn get_build(&self, id: BuildId) -> Result<Option<Build>, StoreError> {
        let Some(mut build) = self.read(|state| state.build(id).cloned()) else {
            return Ok(None);
        };
        build.log = self.blocking(move |shared| Ok(shared.logs.read(id)?)).await?;
        Ok(Some(build))
    }

    /// Builds matching `filter`, newest first. Logs are not loaded.
    pub fn list_builds(&self, filter: BuildFilter, limit: usize) -> Vec<Build> {
        self.read(|state| state.list_builds(filter, limit))
    }

    /// Claims the oldest queued build, marking it running before returning.
    ///
    /// The owning repository is loaded alongside. A build whose repository has
    /// disappeared is failed on the spot and the next one is tried.
    pub async fn claim_next_queued(&self) -> Result<Option<(Build, Repository)>, StoreError> {
        let (claimed, orphans) = self
            .update(|state| {
                let now = Utc::now();
                let mut orphans = Vec::new();
                loop {
                    let Some(build_id) = state.oldest_queued().map(|b| b.id) else {
                        return Ok((None, orphans));
                    };
                    let build = state.transition(build_id, BuildStatus::Running, now)?;

                    match state.repository(build.repo_id).cloned() {
                        Some(repo) => return Ok((Some((build, repo)), orphans)),
                        None => {
                            state.transition(build_id, BuildStatus::Failed, now)?;
                            orphans.push(build);
                        }
                    }
                }
            })
            .await?;

        for orphan in orphans {
            let line = format!("repository {} no longer exists", orphan.repo_id);
            if let Err(e) = self.append_log(orphan.id, line).await {
                warn!(build_id = %orphan.id, error = %e, "Could not log orphaned build");
            }
        }
        if let Some((build, repo)) = &claimed {
            debug!(build_id = %build.id, repo = %repo.full_name(), "Claimed build");
        }
        Ok(claimed)
    }

    pub async fn set_status(&self, id: BuildId, status: BuildStatus) -> Result<Build, StoreError> {
        self.update(move |state| state.transition(id, status, Utc::now()))
            .await
    }

    /// Marks a running build successful and records where its artifact went.
    pub async fn complete_success(
        &self,
        id: BuildId,
        artifact_path: String,
    ) -> Result<Build, StoreError> {
        self.update(move |state| {
            let now = Utc::now();
            state.transition(id, BuildStatus::Success, now)?;
            state.set_artifact_path(id, artifact_path, now)
        })
        .await
    }

    /// Appends one line to a build's log.
    pub async fn append_log(&self, id: BuildId, entry: impl Into<String>) -> Result<(), StoreError> {
        if self.read(|state| state.build(id).is_none()) {
            return Err(StoreError::BuildNotFound(id));
        }
        let entry = entry.into();
        self.blocking(move |shared| Ok(shared.logs.append(id, &entry)?))
            .await
    }

    /// Fails every build left running, appending `reason` to each log.
    ///
    /// Used at startup: nothing can be running before the scheduler starts, so
    /// these were interrupted by a previous process exiting.
    pub async fn fail_running_builds(&self, reason: &str) -> Result<Vec<BuildId>, StoreError> {
        let failed = self
            .update(|state| {
                let now = Utc::now();
                let running = state.builds_with_status(BuildStatus::Running);
                for id in &running {
                    state.transition(*id, BuildStatus::Failed, now)?;
                }
                Ok(running)
            })
            .await?;

        for id in &failed {
            if let Err(e) = self.append_log(*id, reason).await {
                warn!(build_id = %id, error = %e, "Could not log interrupted build");
            }
        }
        Ok(failed)
    }

    // ─── Ref state ───

    pub fn get_ref_state(&self, repo_id: RepositoryId, key: &RefKey) -> Option<RefState> {
        self.read(|state| state.ref_state(repo_id, key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuildTrigger, NewBuild, Sha};
    use tempfile::tempdir;

    async fn queue(store: &Store, repo_id: RepositoryId, sha: &str) -> Build {
        let sha = Sha::new(sha);
        store
            .update(move |state| {
                Ok(state.insert_build(
                    NewBuild {
                        repo_id,
                        trigger: BuildTrigger::Merge,
                        ref_name: "main".to_string(),
                        commit_sha: sha,
                        pr_number: None,
                    },
                    Utc::now(),
                ))
            })
            .await
            .unwrap()
    }

    async fn store_with_repo() -> (Store, Repository) {
        let store = Store::in_memory();
        let repo = store
            .create_repository(NewRepository::new("acme", "app"))
            .await
            .unwrap();
        (store, repo)
    }

    async fn status(store: &Store, id: BuildId) -> BuildStatus {
        store.get_build(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn reopening_restores_persisted_state() {
        let dir = tempdir().unwrap();

        let build_id = {
            let store = Store::open(dir.path()).unwrap();
            let repo = store
                .create_repository(NewRepository::new("acme", "app"))
                .await
                .unwrap();
            let build = queue(&store, repo.id, "abc123").await;
            store.append_log(build.id, "hello").await.unwrap();
            build.id
        };

        let store = Store::open(dir.path()).unwrap();
        let build = store.get_build(build_id).await.unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Queued);
        assert_eq!(build.log, "hello");
        assert!(store.find_active_repository("acme", "app").is_some());

        // Replay was folded into a fresh snapshot.
        assert_eq!(std::fs::metadata(dir.path().join(EVENTS_FILE)).unwrap().len(), 0);
        let next = queue(&store, RepositoryId(1), "def456").await;
        assert_eq!(next.id.0, build_id.0 + 1);
    }

    #[tokio::test]
    async fn events_covered_by_the_snapshot_are_not_reapplied() {
        let dir = tempdir().unwrap();
        let events = dir.path().join(EVENTS_FILE);

        let stale_log = {
            let store = Store::open(dir.path()).unwrap();
            let repo = store
                .create_repository(NewRepository::new("acme", "app"))
                .await
                .unwrap();
            let build = queue(&store, repo.id, "a").await;
            store.claim_next_queued().await.unwrap();
            store.set_status(build.id, BuildStatus::Failed).await.unwrap();
            std::fs::read(&events).unwrap()
        };

        // Reopening compacts. Putting the covered events back mimics a crash
        // between the snapshot write and the log truncation.
        drop(Store::open(dir.path()).unwrap());
        std::fs::write(&events, &stale_log).unwrap();

        let store = Store::open(dir.path()).unwrap();
        let builds = store.list_builds(BuildFilter::default(), 10);
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].status, BuildStatus::Failed);
        assert_eq!(store.list_repositories().len(), 1);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_the_claim() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let repo = store
            .create_repository(NewRepository::new("acme", "app"))
            .await
            .unwrap();
        let build = queue(&store, repo.id, "a").await;

        // A directory where the log should be makes every append fail.
        let events = dir.path().join(EVENTS_FILE);
        let aside = dir.path().join("events.aside");
        std::fs::rename(&events, &aside).unwrap();
        std::fs::create_dir(&events).unwrap();

        assert!(matches!(
            store.claim_next_queued().await,
            Err(StoreError::Io(_))
        ));
        assert_eq!(status(&store, build.id).await, BuildStatus::Queued);

        std::fs::remove_dir(&events).unwrap();
        std::fs::rename(&aside, &events).unwrap();
        let (claimed, _) = store.claim_next_queued().await.unwrap().unwrap();
        assert_eq!(claimed.id, build.id);

        drop(store);
        let reopened = Store::open(dir.path()).unwrap();
        assert_eq!(status(&reopened, build.id).await, BuildStatus::Running);
        assert!(reopened.get_active_repository(repo.id).is_some());
    }

    #[tokio::test]
    async fn failing_closure_leaves_no_trace() {
        let (store, repo) = store_with_repo().await;
        let repo_id = repo.id;

        let result: Result<(), StoreError> = store
            .update(move |state| {
                state.insert_build(
                    NewBuild {
                        repo_id,
                        trigger: BuildTrigger::Merge,
                        ref_name: "main".to_string(),
                        commit_sha: Sha::new("a"),
                        pr_number: None,
                    },
                    Utc::now(),
                );
                Err(StoreError::BuildNotFound(BuildId(42)))
            })
            .await;

        assert!(result.is_err());
        assert!(store.list_builds(BuildFilter::default(), 10).is_empty());
        let next = queue(&store, repo.id, "b").await;
        assert_eq!(next.id, BuildId(1));
    }

    #[tokio::test]
    async fn claim_marks_running_and_loads_repository() {
        let (store, repo) = store_with_repo().await;
        let first = queue(&store, repo.id, "a").await;
        queue(&store, repo.id, "b").await;

        let (claimed, claimed_repo) = store.claim_next_queued().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, BuildStatus::Running);
        assert_eq!(claimed_repo.id, repo.id);
        assert_eq!(status(&store, first.id).await, BuildStatus::Running);
    }

    #[tokio::test]
    async fn claim_never_returns_the_same_build_twice() {
        let (store, repo) = store_with_repo().await;
        queue(&store, repo.id, "a").await;

        assert!(store.claim_next_queued().await.unwrap().is_some());
        assert!(store.claim_next_queued().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_fails_builds_of_missing_repositories() {
        let store = Store::in_memory();
        let orphan = queue(&store, RepositoryId(99), "a").await;
        let repo = store
            .create_repository(NewRepository::new("acme", "app"))
            .await
            .unwrap();
        let good = queue(&store, repo.id, "b").await;

        let (claimed, _) = store.claim_next_queued().await.unwrap().unwrap();
        assert_eq!(claimed.id, good.id);

        let orphan = store.get_build(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, BuildStatus::Failed);
        assert!(orphan.log.contains("no longer exists"));
    }

    #[tokio::test]
    async fn complete_success_records_artifact() {
        let (store, repo) = store_with_repo().await;
        queue(&store, repo.id, "a").await;
        let (build, _) = store.claim_next_queued().await.unwrap().unwrap();

        let done = store
            .complete_success(build.id, "/artifacts/app/main/app.exe".to_string())
            .await
            .unwrap();
        assert_eq!(done.status, BuildStatus::Success);
        assert_eq!(
            done.artifact_path.as_deref(),
            Some("/artifacts/app/main/app.exe")
        );
    }

    #[tokio::test]
    async fn fail_running_builds_only_touches_running() {
        let (store, repo) = store_with_repo().await;
        queue(&store, repo.id, "a").await;
        let queued = queue(&store, repo.id, "b").await;
        let (running, _) = store.claim_next_queued().await.unwrap().unwrap();

        let failed = store.fail_running_builds("interrupted").await.unwrap();

        assert_eq!(failed, vec![running.id]);
        let running = store.get_build(running.id).await.unwrap().unwrap();
        assert_eq!(running.status, BuildStatus::Failed);
        assert_eq!(running.log, "interrupted");
        assert_eq!(status(&store, queued.id).await, BuildStatus::Queued);
    }

    #[tokio::test]
    async fn set_status_rejects_illegal_transition() {
        let store = Store::in_memory();
        let build = queue(&store, RepositoryId(1), "a").await;

        let err = store
            .set_status(build.id, BuildStatus::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn log_lines_stay_out_of_listings() {
        let (store, repo) = store_with_repo().await;
        let build = queue(&store, repo.id, "a").await;
        store.append_log(build.id, "one").await.unwrap();
        store.append_log(build.id, "two").await.unwrap();

        assert_eq!(store.list_builds(BuildFilter::default(), 1)[0].log, "");
        let fetched = store.get_build(build.id).await.unwrap().unwrap();
        assert_eq!(fetched.log, "one\ntwo");

        assert!(matches!(
            store.append_log(BuildId(99), "x").await,
            Err(StoreError::BuildNotFound(_))
        ));
    }

    #[tokio::test]
    async fn lists_repositories_newest_first() {
        let store = Store::in_memory();
        store
            .create_repository(NewRepository::new("acme", "one"))
            .await
            .unwrap();
        let two = store
            .create_repository(NewRepository::new("acme", "two"))
            .await
            .unwrap();
        store.deactivate_repository(two.id).await.unwrap();

        let names: Vec<_> = store
            .list_repositories()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["two", "one"]);
        assert_eq!(store.active_repositories().len(), 1);
        assert!(store.get_active_repository(two.id).is_none());
    }

    #[tokio::test]
    async fn duplicate_active_repository_is_rejected() {
        let (store, first) = store_with_repo().await;

        let err = store
            .create_repository(NewRepository::new("acme", "app"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RepositoryExists { .. }));

        store.deactivate_repository(first.id).await.unwrap();
        let second = store
            .create_repository(NewRepository::new("acme", "app"))
            .await
            .unwrap();
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn path_like_names_are_rejected_at_registration() {
        let store = Store::in_memory();
        for (owner, name) in [("acme", "../escape"), ("a/b", "c"), ("..", "app")] {
            let err = store
                .create_repository(NewRepository::new(owner, name))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidRepository(_)));
        }
        assert!(store.list_repositories().is_empty());
    }
}
