// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! An in-process [`Repository`].

use super::{CommitFactory, Repository, RepositoryEx};
use crate::{
    OtError, OtRandomState,
    commit::{Commit, CommitId, Diff, DiffsWithLevel},
    create_map,
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

/// One parent-to-child edge of a commit graph, used to build graphs in bulk.
///
/// See also the [`edges!`](crate::edges) macro.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge<K, D> {
    pub parent: K,
    pub child: K,
    pub diffs: Vec<D>,
}

impl<K, D> Edge<K, D> {
    pub fn new(parent: K, child: K, diffs: Vec<D>) -> Self {
        Self {
            parent,
            child,
            diffs,
        }
    }
}

struct Inner<K, D> {
    commits: HashMap<K, Arc<Commit<K, D>>, OtRandomState>,
    heads: BTreeSet<K>,
    snapshots: HashMap<K, Vec<D>, OtRandomState>,
    backups: HashMap<K, (Arc<Commit<K, D>>, Vec<D>), OtRandomState>,
    epoch: u64,
}

/// A complete [`Repository`] kept in memory.
///
/// Ids of new commits come from a caller-supplied generator. Besides the port itself, the
/// repository offers bulk graph construction ([`set_graph`](Self::set_graph),
/// [`add_graph`](Self::add_graph)) for tests and demos.
pub struct MemoryRepository<K, D> {
    inner: Mutex<Inner<K, D>>,
    next_id: Box<dyn Fn() -> K + Send + Sync>,
}

impl<K: CommitId, D: Diff> MemoryRepository<K, D> {
    pub fn new(next_id: impl Fn() -> K + Send + Sync + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner {
                commits: create_map(),
                heads: BTreeSet::new(),
                snapshots: create_map(),
                backups: create_map(),
                epoch: 0,
            }),
            next_id: Box::new(next_id),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, D>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The epoch stamped on commits created from now on.
    pub fn set_epoch(&self, epoch: u64) {
        self.lock().epoch = epoch;
    }

    /// Stores a root commit and makes it the only head.
    pub fn add_root(&self, id: K) {
        let mut inner = self.lock();
        let root = Commit::root(id.clone()).with_epoch(inner.epoch);
        inner.commits.insert(id.clone(), Arc::new(root));
        inner.heads = BTreeSet::from([id]);
    }

    /// Replaces the whole graph by the one described by `edges`.
    ///
    /// Heads become the commits that are nobody's parent.
    pub fn set_graph(&self, edges: impl IntoIterator<Item = Edge<K, D>>) {
        let mut inner = self.lock();
        inner.commits.clear();
        inner.heads.clear();
        inner.snapshots.clear();
        Self::insert_edges(&mut inner, edges);
    }

    /// Extends the graph by `edges`; parents may be existing commits.
    ///
    /// Existing commits that gain a child stop being heads, new commits without children
    /// become heads.
    pub fn add_graph(&self, edges: impl IntoIterator<Item = Edge<K, D>>) {
        let mut inner = self.lock();
        Self::insert_edges(&mut inner, edges);
    }

    fn insert_edges(inner: &mut Inner<K, D>, edges: impl IntoIterator<Item = Edge<K, D>>) {
        let mut parents: BTreeMap<K, BTreeMap<K, Vec<D>>> = BTreeMap::new();
        let mut referenced = BTreeSet::new();
        for edge in edges {
            referenced.insert(edge.parent.clone());
            parents.entry(edge.parent.clone()).or_default();
            parents
                .entry(edge.child)
                .or_default()
                .insert(edge.parent, edge.diffs);
        }

        let mut levels = BTreeMap::new();
        for id in parents.keys() {
            Self::level_of(inner, &parents, &mut levels, id);
        }

        for (id, commit_parents) in parents {
            if inner.commits.contains_key(&id) {
                continue;
            }
            let commit = Commit::new(id.clone(), commit_parents, levels[&id]).with_epoch(inner.epoch);
            inner.commits.insert(id.clone(), Arc::new(commit));
            if !referenced.contains(&id) {
                inner.heads.insert(id);
            }
        }
        inner.heads.retain(|head| !referenced.contains(head));
    }

    fn level_of(
        inner: &Inner<K, D>,
        parents: &BTreeMap<K, BTreeMap<K, Vec<D>>>,
        levels: &mut BTreeMap<K, u64>,
        id: &K,
    ) -> u64 {
        if let Some(level) = levels.get(id) {
            return *level;
        }
        let level = match inner.commits.get(id) {
            Some(existing) => existing.level(),
            None => {
                let mut max = 0;
                for parent in parents[id].keys() {
                    max = max.max(Self::level_of(inner, parents, levels, parent));
                }
                max + 1
            }
        };
        levels.insert(id.clone(), level);
        level
    }

    pub fn commit_ids(&self) -> BTreeSet<K> {
        self.lock().commits.keys().cloned().collect()
    }

    pub fn backup_of(&self, id: &K) -> Option<(Arc<Commit<K, D>>, Vec<D>)> {
        self.lock().backups.get(id).cloned()
    }
}

impl<D: Diff> MemoryRepository<u64, D> {
    /// A repository handing out increasing numeric ids starting at `first`.
    pub fn sequential(first: u64) -> Self {
        let next = AtomicU64::new(first);
        Self::new(move || next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(feature = "ulid")]
impl<D: Diff> MemoryRepository<ulid::Ulid, D> {
    /// A repository handing out fresh ULIDs.
    pub fn with_ulids() -> Self {
        Self::new(ulid::Ulid::new)
    }
}

impl<K: fmt::Debug, D> fmt::Debug for MemoryRepository<K, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Ok(inner) => f
                .debug_struct("MemoryRepository")
                .field("commits", &inner.commits.len())
                .field("heads", &inner.heads)
                .field("epoch", &inner.epoch)
                .finish_non_exhaustive(),
            Err(_) => f.debug_struct("MemoryRepository").finish_non_exhaustive(),
        }
    }
}

#[async_trait]
impl<K: CommitId, D: Diff> CommitFactory<K, D> for MemoryRepository<K, D> {
    async fn create_commit(
        &self,
        parents: BTreeMap<K, DiffsWithLevel<D>>,
    ) -> Result<Commit<K, D>, OtError> {
        let id = (self.next_id)();
        let epoch = self.lock().epoch;
        Ok(Commit::of(id, parents).with_epoch(epoch))
    }
}

#[async_trait]
impl<K: CommitId, D: Diff> Repository<K, D> for MemoryRepository<K, D> {
    async fn push(&self, commits: Vec<Commit<K, D>>) -> Result<(), OtError> {
        let mut inner = self.lock();
        for commit in commits {
            tracing::trace!(id = ?commit.id(), level = commit.level(), "storing commit");
            inner
                .commits
                .entry(commit.id().clone())
                .or_insert_with(|| Arc::new(commit));
        }
        Ok(())
    }

    async fn update_heads(
        &self,
        new_heads: BTreeSet<K>,
        excluded_heads: BTreeSet<K>,
    ) -> Result<(), OtError> {
        let mut inner = self.lock();
        tracing::debug!(?new_heads, ?excluded_heads, "updating heads");
        inner.heads.extend(new_heads);
        inner.heads.retain(|head| !excluded_heads.contains(head));
        Ok(())
    }

    async fn get_heads(&self) -> Result<BTreeSet<K>, OtError> {
        let inner = self.lock();
        let epoch_of = |id: &K| inner.commits.get(id).map_or(0, |c| c.epoch());
        let max_epoch = inner.heads.iter().map(epoch_of).max().unwrap_or(0);
        Ok(inner
            .heads
            .iter()
            .filter(|head| epoch_of(head) == max_epoch)
            .cloned()
            .collect())
    }

    async fn get_all_heads(&self) -> Result<BTreeSet<K>, OtError> {
        Ok(self.lock().heads.clone())
    }

    async fn load_commit(&self, id: &K) -> Result<Arc<Commit<K, D>>, OtError> {
        self.lock()
            .commits
            .get(id)
            .cloned()
            .ok_or_else(|| OtError::commit_not_found(id))
    }

    async fn has_commit(&self, id: &K) -> Result<bool, OtError> {
        Ok(self.lock().commits.contains_key(id))
    }

    async fn load_snapshot(&self, id: &K) -> Result<Option<Vec<D>>, OtError> {
        Ok(self.lock().snapshots.get(id).cloned())
    }

    async fn save_snapshot(&self, id: &K, diffs: Vec<D>) -> Result<(), OtError> {
        self.lock().snapshots.insert(id.clone(), diffs);
        Ok(())
    }
}

#[async_trait]
impl<K: CommitId, D: Diff> RepositoryEx<K, D> for MemoryRepository<K, D> {
    async fn cleanup(&self, id: &K) -> Result<(), OtError> {
        let mut inner = self.lock();
        let min_level = inner
            .commits
            .get(id)
            .ok_or_else(|| OtError::commit_not_found(id))?
            .level();
        let Inner {
            commits, snapshots, ..
        } = &mut *inner;
        commits.retain(|_, commit| commit.level() >= min_level);
        snapshots.retain(|id, _| commits.contains_key(id));
        tracing::debug!(?id, min_level, remaining = commits.len(), "cleaned up commits");
        Ok(())
    }

    async fn backup(&self, commit: &Commit<K, D>, snapshot: Vec<D>) -> Result<(), OtError> {
        self.lock()
            .backups
            .insert(commit.id().clone(), (Arc::new(commit.clone()), snapshot));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestOp, add};

    fn repository() -> MemoryRepository<u64, TestOp> {
        MemoryRepository::sequential(100)
    }

    #[tokio::test]
    async fn graph_helpers_compute_levels_and_heads() {
        let repository = repository();
        repository.set_graph(crate::edges![
            0 => 1: [add(1)],
            1 => 2: [add(2)],
            0 => 3: [add(3)],
            2 => 4: [add(4)],
            3 => 4: [add(5)],
        ]);
        assert_eq!(repository.get_heads().await.unwrap(), BTreeSet::from([4]));
        let levels = repository
            .get_levels(&BTreeSet::from([0, 1, 2, 3, 4]))
            .await
            .unwrap();
        assert_eq!(
            levels,
            BTreeMap::from([(0, 1), (1, 2), (2, 3), (3, 2), (4, 4)])
        );

        repository.add_graph(crate::edges![4 => 5: [add(6)], 4 => 6: [add(7)]]);
        assert_eq!(repository.get_heads().await.unwrap(), BTreeSet::from([5, 6]));
        assert_eq!(repository.load_commit(&6).await.unwrap().level(), 5);
    }

    #[tokio::test]
    async fn heads_of_older_epochs_are_hidden() {
        let repository = repository();
        repository.add_root(0);
        repository.set_epoch(1);
        let commit = repository
            .create_commit(BTreeMap::from([(0, DiffsWithLevel::new(1, vec![add(1)]))]))
            .await
            .unwrap();
        assert_eq!((*commit.id(), commit.epoch(), commit.level()), (100, 1, 2));
        repository.push(vec![commit]).await.unwrap();
        repository
            .update_heads(BTreeSet::from([100]), BTreeSet::new())
            .await
            .unwrap();

        assert_eq!(repository.get_heads().await.unwrap(), BTreeSet::from([100]));
        assert_eq!(
            repository.get_all_heads().await.unwrap(),
            BTreeSet::from([0, 100])
        );
    }

    #[tokio::test]
    async fn unknown_commits_are_reported() {
        let repository = repository();
        assert!(matches!(
            repository.load_commit(&42).await,
            Err(OtError::CommitNotFound(id)) if id == "42"
        ));
        assert!(!repository.has_commit(&42).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_drops_older_history() {
        let repository = repository();
        repository.set_graph(crate::edges![0 => 1: [add(1)], 1 => 2: [add(1)]]);
        repository.save_snapshot(&0, vec![]).await.unwrap();
        repository.save_snapshot(&2, vec![add(2)]).await.unwrap();

        repository.cleanup(&1).await.unwrap();
        assert_eq!(repository.commit_ids(), BTreeSet::from([1, 2]));
        assert_eq!(repository.load_snapshot(&0).await.unwrap(), None);
        assert_eq!(
            repository.load_snapshot(&2).await.unwrap(),
            Some(vec![add(2)])
        );

        let commit = repository.load_commit(&2).await.unwrap();
        repository.backup(&commit, vec![add(2)]).await.unwrap();
        assert_eq!(repository.backup_of(&2).map(|(c, s)| (*c.id(), s)), Some((2, vec![add(2)])));
    }
}
