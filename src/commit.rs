// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Commits: the immutable nodes of the history graph.
//!
//! A [`Commit`] records, for each of its parents, the diffs that lead from that parent to the
//! commit. A commit with several parents is a merge; a commit without parents is a root. Every
//! commit carries a *level* that is strictly greater than the level of any of its parents, which
//! is what lets traversals visit history in an order where all descendants of a commit (within
//! the traversed set) are seen before the commit itself.

use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    sync::OnceLock,
};

/// Types usable as commit identifiers.
pub trait CommitId: Clone + Ord + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> CommitId for T where T: Clone + Ord + Hash + fmt::Debug + Send + Sync + 'static {}

/// Types usable as diffs.
pub trait Diff: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Diff for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// Diffs from one parent together with that parent's level.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct DiffsWithLevel<D> {
    pub level: u64,
    pub diffs: Vec<D>,
}

impl<D> DiffsWithLevel<D> {
    pub fn new(level: u64, diffs: Vec<D>) -> Self {
        Self { level, diffs }
    }
}

/// A node of the history graph.
///
/// Commits are equal iff their ids are equal.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(
    feature = "serde",
    serde(bound(
        serialize = "K: ::serde::Serialize, D: ::serde::Serialize",
        deserialize = "K: Ord + ::serde::Deserialize<'de>, D: ::serde::Deserialize<'de>"
    ))
)]
pub struct Commit<K, D> {
    id: K,
    epoch: u64,
    parents: BTreeMap<K, Vec<D>>,
    level: u64,
    timestamp: DateTime<Utc>,
    snapshot_hint: Option<bool>,
    #[cfg_attr(feature = "serde", serde(skip))]
    serialized: OnceLock<Vec<u8>>,
}

impl<K: Ord, D> Commit<K, D> {
    /// Creates a commit at an explicit level.
    ///
    /// # Panics
    ///
    /// If `level` is zero, or if `parents` is empty and `level` is not 1.
    pub fn new(id: K, parents: BTreeMap<K, Vec<D>>, level: u64) -> Self {
        assert!(level > 0, "commit levels start at 1");
        assert!(
            !parents.is_empty() || level == 1,
            "root commits live on level 1"
        );
        Self {
            id,
            epoch: 0,
            parents,
            level,
            timestamp: Utc::now(),
            snapshot_hint: None,
            serialized: OnceLock::new(),
        }
    }

    /// Creates a root commit.
    pub fn root(id: K) -> Self {
        Self::new(id, BTreeMap::new(), 1)
    }

    /// Creates a commit one level above the highest of its parents.
    pub fn of(id: K, parents: BTreeMap<K, DiffsWithLevel<D>>) -> Self {
        let level = parents.values().map(|p| p.level).max().unwrap_or(0) + 1;
        let parents = parents.into_iter().map(|(k, p)| (k, p.diffs)).collect();
        Self::new(id, parents, level)
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Records whether a snapshot is known to exist for this commit.
    ///
    /// `Some(false)` lets snapshot lookups skip this commit without asking the repository.
    pub fn with_snapshot_hint(mut self, hint: Option<bool>) -> Self {
        self.snapshot_hint = hint;
        self
    }

    pub fn id(&self) -> &K {
        &self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn snapshot_hint(&self) -> Option<bool> {
        self.snapshot_hint
    }

    /// Diffs leading from each parent to this commit.
    pub fn parents(&self) -> &BTreeMap<K, Vec<D>> {
        &self.parents
    }

    pub fn parent_ids(&self) -> impl Iterator<Item = &K> + '_ {
        self.parents.keys()
    }

    /// Diffs leading from `parent` to this commit, if `parent` is one of its parents.
    pub fn diffs_from(&self, parent: &K) -> Option<&[D]> {
        self.parents.get(parent).map(Vec::as_slice)
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// The serialized form attached by a repository, if any.
    pub fn serialized(&self) -> Option<&[u8]> {
        self.serialized.get().map(Vec::as_slice)
    }

    /// Attaches the serialized form of this commit, computing it at most once.
    pub fn serialized_or_init(&self, serialize: impl FnOnce(&Self) -> Vec<u8>) -> &[u8] {
        self.serialized.get_or_init(|| serialize(self))
    }
}

impl<K: PartialEq, D> PartialEq for Commit<K, D> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K: Eq, D> Eq for Commit<K, D> {}

impl<K: Hash, D> Hash for Commit<K, D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<K: fmt::Debug, D: fmt::Debug> fmt::Debug for Commit<K, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commit")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .field("level", &self.level)
            .field("parents", &self.parents)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestOp, add};

    #[test]
    fn levels_follow_parents() {
        let root = Commit::<u64, TestOp>::of(1, BTreeMap::new());
        assert!(root.is_root());
        assert_eq!(root.level(), 1);

        let merge = Commit::of(
            4,
            BTreeMap::from([
                (2, DiffsWithLevel::new(2, vec![add(1)])),
                (3, DiffsWithLevel::new(5, vec![add(2)])),
            ]),
        );
        assert!(merge.is_merge());
        assert_eq!(merge.level(), 6);
        assert_eq!(merge.diffs_from(&3), Some(&[add(2)][..]));
        assert_eq!(merge.parent_ids().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn identity_is_the_id() {
        let a = Commit::<u64, TestOp>::root(1).with_epoch(3);
        let b = Commit::<u64, TestOp>::new(1, BTreeMap::from([(0, vec![add(1)])]), 2);
        assert_eq!(a, b);
    }

    #[test]
    fn serialized_payload_is_computed_once() {
        let commit = Commit::<u64, TestOp>::root(7);
        assert_eq!(commit.serialized(), None);
        assert_eq!(commit.serialized_or_init(|c| vec![*c.id() as u8]), &[7]);
        assert_eq!(commit.serialized_or_init(|_| vec![0]), &[7]);
    }

    #[test]
    #[should_panic(expected = "root commits live on level 1")]
    fn orphan_above_level_one_is_rejected() {
        let _ = Commit::<u64, TestOp>::new(1, BTreeMap::new(), 2);
    }
}
