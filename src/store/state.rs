//! In-memory contents of the store and the queries the core needs.
//!
//! `StoreState` is only ever touched under the store lock. Every mutation goes
//! through one of three `put_*` writers, each of which records the resulting
//! entity as a [`StoreEvent`] together with the value it replaced. The store
//! appends the events to disk and either commits them or rolls the state back
//! to the last checkpoint.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StoreError;
use super::events::StoreEvent;
use crate::types::{
    Build, BuildId, BuildStatus, NewBuild, NewRepository, PrNumber, RefKey, RefState, Repository,
    RepositoryId, Sha,
};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 2;

/// Everything the store persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreState {
    pub schema_version: u32,
    /// Sequence number of the last event folded into this state.
    pub(crate) last_seq: u64,
    next_repository_id: u64,
    next_build_id: u64,
    repositories: BTreeMap<RepositoryId, Repository>,
    builds: BTreeMap<BuildId, Build>,
    ref_states: Vec<RefState>,
    #[serde(skip)]
    journal: Vec<(StoreEvent, Undo)>,
}

impl Default for StoreState {
    fn default() -> Self {
        StoreState {
            schema_version: SCHEMA_VERSION,
            last_seq: 0,
            next_repository_id: 1,
            next_build_id: 1,
            repositories: BTreeMap::new(),
            builds: BTreeMap::new(),
            ref_states: Vec::new(),
            journal: Vec::new(),
        }
    }
}

/// The value a put replaced.
#[derive(Debug, Clone)]
enum Undo {
    Repository(RepositoryId, Option<Repository>),
    Build(BuildId, Option<Build>),
    RefState(RepositoryId, RefKey, Option<RefState>),
}

/// Id counters at the start of a transaction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint {
    next_repository_id: u64,
    next_build_id: u64,
}

/// Filter for build listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildFilter {
    pub repo_id: Option<RepositoryId>,
    pub status: Option<BuildStatus>,
}

impl StoreState {
    // ─── Transactions ───

    pub(crate) fn checkpoint(&mut self) -> Checkpoint {
        self.journal.clear();
        Checkpoint {
            next_repository_id: self.next_repository_id,
            next_build_id: self.next_build_id,
        }
    }

    /// Events recorded since the last checkpoint.
    pub(crate) fn journaled(&self) -> impl Iterator<Item = &StoreEvent> {
        self.journal.iter().map(|(event, _)| event)
    }

    /// Accepts the recorded events; they can no longer be rolled back.
    pub(crate) fn commit(&mut self) -> Vec<StoreEvent> {
        self.journal.drain(..).map(|(event, _)| event).collect()
    }

    /// Puts back every value replaced since `checkpoint`, newest first.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        while let Some((_, undo)) = self.journal.pop() {
            match undo {
                Undo::Repository(id, prior) => restore(&mut self.repositories, id, prior),
                Undo::Build(id, prior) => restore(&mut self.builds, id, prior),
                Undo::RefState(repo_id, key, prior) => {
                    self.ref_states
                        .retain(|s| !(s.repo_id == repo_id && s.ref_key == key));
                    if let Some(prior) = prior {
                        self.ref_states.push(prior);
                    }
                }
            }
        }
        self.next_repository_id = checkpoint.next_repository_id;
        self.next_build_id = checkpoint.next_build_id;
    }

    /// Folds a replayed event into the state without journaling it.
    pub(crate) fn apply(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::RepositoryPut(repo) => {
                self.next_repository_id = self.next_repository_id.max(repo.id.0 + 1);
                self.repositories.insert(repo.id, repo);
            }
            StoreEvent::BuildPut(build) => {
                self.next_build_id = self.next_build_id.max(build.id.0 + 1);
                self.builds.insert(build.id, build);
            }
            StoreEvent::RefStatePut(state) => {
                self.replace_ref_state(state);
            }
        }
    }

    fn put_repository(&mut self, repo: Repository) {
        let prior = self.repositories.insert(repo.id, repo.clone());
        self.journal.push((
            StoreEvent::RepositoryPut(repo.clone()),
            Undo::Repository(repo.id, prior),
        ));
    }

    fn put_build(&mut self, build: Build) {
        let prior = self.builds.insert(build.id, build.clone());
        self.journal
            .push((StoreEvent::BuildPut(build.clone()), Undo::Build(build.id, prior)));
    }

    fn replace_ref_state(&mut self, state: RefState) -> Option<RefState> {
        match self
            .ref_states
            .iter_mut()
            .find(|s| s.repo_id == state.repo_id && s.ref_key == state.ref_key)
        {
            Some(existing) => Some(std::mem::replace(existing, state)),
            None => {
                self.ref_states.push(state);
                None
            }
        }
    }

    // ─── Repositories ───

    pub fn repositories(&self) -> impl DoubleEndedIterator<Item = &Repository> {
        self.repositories.values()
    }

    pub fn repository(&self, id: RepositoryId) -> Option<&Repository> {
        self.repositories.get(&id)
    }

    /// Finds an active repository by `(owner, name)`.
    pub fn find_active_repository(&self, owner: &str, name: &str) -> Option<&Repository> {
        self.repositories
            .values()
            .find(|r| r.is_active && r.owner == owner && r.name == name)
    }

    pub fn insert_repository(&mut self, input: NewRepository, now: DateTime<Utc>) -> Repository {
        let id = RepositoryId(self.next_repository_id);
        self.next_repository_id += 1;

        let repo = input.into_repository(id, now);
        self.put_repository(repo.clone());
        repo
    }

    pub fn set_repository_active(
        &mut self,
        id: RepositoryId,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Repository, StoreError> {
        let mut repo = self
            .repositories
            .get(&id)
            .cloned()
            .ok_or(StoreError::RepositoryNotFound(id))?;
        if repo.is_active != active {
            repo.is_active = active;
            repo.updated_at = now;
            self.put_repository(repo.clone());
        }
        Ok(repo)
    }

    // ─── Builds ───

    pub fn build(&self, id: BuildId) -> Option<&Build> {
        self.builds.get(&id)
    }

    /// Builds matching `filter`, newest first, at most `limit`.
    pub fn list_builds(&self, filter: BuildFilter, limit: usize) -> Vec<Build> {
        self.builds
            .values()
            .rev()
            .filter(|b| filter.repo_id.is_none_or(|id| b.repo_id == id))
            .filter(|b| filter.status.is_none_or(|s| b.status == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// The oldest build still waiting to run.
    pub fn oldest_queued(&self) -> Option<&Build> {
        self.builds
            .values()
            .find(|b| b.status == BuildStatus::Queued)
    }

    /// A queued or running build of `sha` in `repo_id`, regardless of ref.
    pub fn active_build_for_commit(&self, repo_id: RepositoryId, sha: &Sha) -> Option<&Build> {
        self.builds
            .values()
            .find(|b| b.repo_id == repo_id && &b.commit_sha == sha && b.status.is_active())
    }

    /// Whether a build of exactly `(repo, ref, pr, sha)` has succeeded.
    pub fn has_successful_build(
        &self,
        repo_id: RepositoryId,
        ref_name: &str,
        pr: Option<PrNumber>,
        sha: &Sha,
    ) -> bool {
        self.builds.values().any(|b| {
            b.repo_id == repo_id
                && b.ref_name == ref_name
                && b.pr_number == pr
                && &b.commit_sha == sha
                && b.status == BuildStatus::Success
        })
    }

    /// Builds in a given status, oldest first.
    pub fn builds_with_status(&self, status: BuildStatus) -> Vec<BuildId> {
        self.builds
            .values()
            .filter(|b| b.status == status)
            .map(|b| b.id)
            .collect()
    }

    pub fn insert_build(&mut self, input: NewBuild, now: DateTime<Utc>) -> Build {
        let id = BuildId(self.next_build_id);
        self.next_build_id += 1;

        let build = Build {
            id,
            repo_id: input.repo_id,
            trigger: input.trigger,
            ref_name: input.ref_name,
            commit_sha: input.commit_sha,
            pr_number: input.pr_number,
            status: BuildStatus::Queued,
            log: String::new(),
            artifact_path: None,
            created_at: now,
            updated_at: now,
        };
        self.put_build(build.clone());
        build
    }

    /// Moves a build to `next`, rejecting non-monotonic transitions.
    pub fn transition(
        &mut self,
        id: BuildId,
        next: BuildStatus,
        now: DateTime<Utc>,
    ) -> Result<Build, StoreError> {
        let mut build = self
            .builds
            .get(&id)
            .cloned()
            .ok_or(StoreError::BuildNotFound(id))?;
        if !build.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id,
                from: build.status,
                to: next,
            });
        }
        build.status = next;
        build.updated_at = now;
        self.put_build(build.clone());
        Ok(build)
    }

    pub fn set_artifact_path(
        &mut self,
        id: BuildId,
        path: String,
        now: DateTime<Utc>,
    ) -> Result<Build, StoreError> {
        let mut build = self
            .builds
            .get(&id)
            .cloned()
            .ok_or(StoreError::BuildNotFound(id))?;
        build.artifact_path = Some(path);
        build.updated_at = now;
        self.put_build(build.clone());
        Ok(build)
    }

    // ─── Ref state ───

    pub fn ref_state(&self, repo_id: RepositoryId, key: &RefKey) -> Option<&RefState> {
        self.ref_states
            .iter()
            .find(|s| s.repo_id == repo_id && &s.ref_key == key)
    }

    /// Inserts or replaces the row for `(state.repo_id, state.ref_key)`.
    pub fn upsert_ref_state(&mut self, state: RefState) {
        let (repo_id, key) = (state.repo_id, state.ref_key.clone());
        let prior = self.replace_ref_state(state.clone());
        self.journal.push((
            StoreEvent::RefStatePut(state),
            Undo::RefState(repo_id, key, prior),
        ));
    }

    pub fn ref_states(&self) -> &[RefState] {
        &self.ref_states
    }
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, prior: Option<V>) {
    match prior {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}
