// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The storage port the algorithms run against.
//!
//! Durable storage of commits is the job of the embedding application. The algorithms only need
//! the narrow [`Repository`] interface defined here: loading commits, reading and atomically
//! updating the set of heads, and optional snapshot checkpoints. [`MemoryRepository`] is a
//! complete in-process implementation, useful for tests and for single-process setups.
//!
//! Implementations are expected to tolerate concurrent writers. In particular
//! [`Repository::update_heads`] must behave like a compare-and-swap: it adds the new heads and
//! removes exactly the excluded ones, without clobbering heads other writers added meanwhile.

use crate::{
    OtError,
    commit::{Commit, CommitId, Diff, DiffsWithLevel},
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

mod memory;

pub use memory::{Edge, MemoryRepository};

/// Creates commits that have not been stored yet.
#[async_trait]
pub trait CommitFactory<K, D>: Send + Sync {
    /// Creates a commit on top of `parents`, assigning it a fresh id and the current epoch.
    async fn create_commit(
        &self,
        parents: BTreeMap<K, DiffsWithLevel<D>>,
    ) -> Result<Commit<K, D>, OtError>;
}

/// Read and write access to a commit graph.
#[async_trait]
pub trait Repository<K, D>: CommitFactory<K, D>
where
    K: CommitId,
    D: Diff,
{
    /// Stores `commits`. Storing a commit that already exists does nothing.
    async fn push(&self, commits: Vec<Commit<K, D>>) -> Result<(), OtError>;

    /// Adds `new_heads` to the head set and removes `excluded_heads` from it, atomically.
    async fn update_heads(
        &self,
        new_heads: BTreeSet<K>,
        excluded_heads: BTreeSet<K>,
    ) -> Result<(), OtError>;

    /// Heads of the most recent epoch.
    async fn get_heads(&self) -> Result<BTreeSet<K>, OtError>;

    /// Heads of every epoch.
    async fn get_all_heads(&self) -> Result<BTreeSet<K>, OtError>;

    /// Loads a commit, failing with [`OtError::CommitNotFound`] for unknown ids.
    async fn load_commit(&self, id: &K) -> Result<Arc<Commit<K, D>>, OtError>;

    async fn has_commit(&self, id: &K) -> Result<bool, OtError>;

    async fn get_levels(&self, ids: &BTreeSet<K>) -> Result<BTreeMap<K, u64>, OtError> {
        let mut levels = BTreeMap::new();
        for id in ids {
            let commit = self.load_commit(id).await?;
            levels.insert(id.clone(), commit.level());
        }
        Ok(levels)
    }

    /// The state at commit `id`, as a diff sequence from the empty state, if one was saved.
    async fn load_snapshot(&self, id: &K) -> Result<Option<Vec<D>>, OtError>;

    async fn save_snapshot(&self, id: &K, diffs: Vec<D>) -> Result<(), OtError>;
}

/// Retention hooks used by garbage collection; the algorithms never call these.
#[async_trait]
pub trait RepositoryEx<K, D>: Repository<K, D>
where
    K: CommitId,
    D: Diff,
{
    /// Drops every commit below the level of `id`, together with its snapshot.
    async fn cleanup(&self, id: &K) -> Result<(), OtError>;

    /// Stores a commit together with its snapshot outside of the live graph.
    async fn backup(&self, commit: &Commit<K, D>, snapshot: Vec<D>) -> Result<(), OtError>;
}

#[async_trait]
impl<K, D, R> CommitFactory<K, D> for Arc<R>
where
    K: CommitId,
    D: Diff,
    R: CommitFactory<K, D> + ?Sized,
{
    async fn create_commit(
        &self,
        parents: BTreeMap<K, DiffsWithLevel<D>>,
    ) -> Result<Commit<K, D>, OtError> {
        (**self).create_commit(parents).await
    }
}

#[async_trait]
impl<K, D, R> Repository<K, D> for Arc<R>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
{
    async fn push(&self, commits: Vec<Commit<K, D>>) -> Result<(), OtError> {
        (**self).push(commits).await
    }

    async fn update_heads(
        &self,
        new_heads: BTreeSet<K>,
        excluded_heads: BTreeSet<K>,
    ) -> Result<(), OtError> {
        (**self).update_heads(new_heads, excluded_heads).await
    }

    async fn get_heads(&self) -> Result<BTreeSet<K>, OtError> {
        (**self).get_heads().await
    }

    async fn get_all_heads(&self) -> Result<BTreeSet<K>, OtError> {
        (**self).get_all_heads().await
    }

    async fn load_commit(&self, id: &K) -> Result<Arc<Commit<K, D>>, OtError> {
        (**self).load_commit(id).await
    }

    async fn has_commit(&self, id: &K) -> Result<bool, OtError> {
        (**self).has_commit(id).await
    }

    async fn get_levels(&self, ids: &BTreeSet<K>) -> Result<BTreeMap<K, u64>, OtError> {
        (**self).get_levels(ids).await
    }

    async fn load_snapshot(&self, id: &K) -> Result<Option<Vec<D>>, OtError> {
        (**self).load_snapshot(id).await
    }

    async fn save_snapshot(&self, id: &K, diffs: Vec<D>) -> Result<(), OtError> {
        (**self).save_snapshot(id, diffs).await
    }
}
