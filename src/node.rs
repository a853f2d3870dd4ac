// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The server side of the sync protocol.
//!
//! An [`OtNode`] is what a [`StateManager`](crate::StateManager) talks to: it creates commits on
//! behalf of clients, accepts pushes, and answers checkout and fetch requests with a
//! [`FetchData`]. [`OtNodeImpl`] implements the protocol on top of any [`Repository`]; putting
//! an RPC layer in front of it is left to the application.

use crate::{
    OtError,
    algorithms,
    commit::{Commit, CommitId, Diff, DiffsWithLevel},
    config::NodeConfig,
    poll::PollSanitizer,
    repository::Repository,
    system::OtSystem,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

/// A position in history together with the diffs that lead there.
///
/// Depending on the request, `diffs` start at the empty state (checkout) or at the commit the
/// requester was at (fetch, push).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct FetchData<K, D> {
    pub commit_id: K,
    pub level: u64,
    pub diffs: Vec<D>,
}

impl<K, D> FetchData<K, D> {
    pub fn new(commit_id: K, level: u64, diffs: Vec<D>) -> Self {
        Self {
            commit_id,
            level,
            diffs,
        }
    }
}

/// The remote authority a state manager synchronizes with.
#[async_trait]
pub trait OtNode<K: CommitId, D: Diff>: Send + Sync {
    /// Creates, without storing it, a commit of `diffs` on top of `parent`.
    async fn create_proto_commit(
        &self,
        parent: K,
        diffs: Vec<D>,
        parent_level: u64,
    ) -> Result<Commit<K, D>, OtError>;

    /// Stores `commit`, merges it with concurrent heads and reports where that leaves the pusher.
    ///
    /// The returned diffs lead from `commit` to the returned head.
    async fn push(&self, commit: Commit<K, D>) -> Result<FetchData<K, D>, OtError>;

    /// The current head and the full state at it.
    async fn checkout(&self) -> Result<FetchData<K, D>, OtError>;

    /// The current head and the diffs leading there from `current`.
    async fn fetch(&self, current: &K) -> Result<FetchData<K, D>, OtError>;

    /// Like [`fetch`](Self::fetch), but waits until history has moved past `current`.
    async fn poll(&self, current: &K) -> Result<FetchData<K, D>, OtError> {
        self.fetch(current).await
    }
}

#[async_trait]
impl<K, D, N> OtNode<K, D> for std::sync::Arc<N>
where
    K: CommitId,
    D: Diff,
    N: OtNode<K, D> + ?Sized,
{
    async fn create_proto_commit(
        &self,
        parent: K,
        diffs: Vec<D>,
        parent_level: u64,
    ) -> Result<Commit<K, D>, OtError> {
        (**self)
            .create_proto_commit(parent, diffs, parent_level)
            .await
    }

    async fn push(&self, commit: Commit<K, D>) -> Result<FetchData<K, D>, OtError> {
        (**self).push(commit).await
    }

    async fn checkout(&self) -> Result<FetchData<K, D>, OtError> {
        (**self).checkout().await
    }

    async fn fetch(&self, current: &K) -> Result<FetchData<K, D>, OtError> {
        (**self).fetch(current).await
    }

    async fn poll(&self, current: &K) -> Result<FetchData<K, D>, OtError> {
        (**self).poll(current).await
    }
}

/// An [`OtNode`] serving a [`Repository`] directly.
///
/// Every push is merged into the repository right away, so the repository has a single head
/// after each successful push.
#[derive(Debug)]
pub struct OtNodeImpl<R, S> {
    repository: R,
    system: S,
    config: NodeConfig,
}

impl<R, S> OtNodeImpl<R, S> {
    pub fn new(repository: R, system: S) -> Self {
        Self {
            repository,
            system,
            config: NodeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn system(&self) -> &S {
        &self.system
    }
}

#[async_trait]
impl<K, D, R, S> OtNode<K, D> for OtNodeImpl<R, S>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D>,
    S: OtSystem<D>,
{
    async fn create_proto_commit(
        &self,
        parent: K,
        diffs: Vec<D>,
        parent_level: u64,
    ) -> Result<Commit<K, D>, OtError> {
        let parents = BTreeMap::from([(parent, DiffsWithLevel::new(parent_level, diffs))]);
        self.repository.create_commit(parents).await
    }

    async fn push(&self, commit: Commit<K, D>) -> Result<FetchData<K, D>, OtError> {
        let id = commit.id().clone();
        let parents: BTreeSet<_> = commit.parent_ids().cloned().collect();
        tracing::debug!(?id, ?parents, level = commit.level(), "accepting push");
        self.repository.push(vec![commit]).await?;
        self.repository
            .update_heads(BTreeSet::from([id.clone()]), parents)
            .await?;
        algorithms::merge_and_update_heads(&self.repository, &self.system).await?;
        self.fetch(&id).await
    }

    async fn checkout(&self) -> Result<FetchData<K, D>, OtError> {
        algorithms::checkout(&self.repository, &self.system).await
    }

    async fn fetch(&self, current: &K) -> Result<FetchData<K, D>, OtError> {
        algorithms::fetch(&self.repository, &self.system, current).await
    }

    async fn poll(&self, current: &K) -> Result<FetchData<K, D>, OtError> {
        let mut heads = PollSanitizer::new(self.config.poll_retry)
            .with_last(BTreeSet::from([current.clone()]));
        heads.poll(|| self.repository.get_heads()).await?;
        self.fetch(current).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        edges,
        repository::MemoryRepository,
        test_util::{SYSTEM, TestOp, add},
    };
    use std::{sync::Arc, time::Duration};

    fn node() -> OtNodeImpl<Arc<MemoryRepository<u64, TestOp>>, crate::PairwiseSystem<TestOp>> {
        let repository = Arc::new(MemoryRepository::sequential(100));
        repository.set_graph(edges![0 => 1: [add(1)]]);
        OtNodeImpl::new(repository, SYSTEM)
    }

    #[tokio::test]
    async fn push_on_the_head_fast_forwards() {
        let node = node();
        let commit = node.create_proto_commit(1, vec![add(2)], 2).await.unwrap();
        assert_eq!((*commit.id(), commit.level()), (100, 3));
        assert!(!node.repository().has_commit(&100).await.unwrap());

        let data = node.push(commit).await.unwrap();
        assert_eq!(data, FetchData::new(100, 3, vec![]));
        assert_eq!(
            node.checkout().await.unwrap(),
            FetchData::new(100, 3, vec![add(3)])
        );
    }

    #[tokio::test]
    async fn concurrent_pushes_are_merged() {
        let node = node();
        let first = node.create_proto_commit(1, vec![add(2)], 2).await.unwrap();
        let second = node.create_proto_commit(1, vec![add(5)], 2).await.unwrap();
        node.push(first).await.unwrap();

        let data = node.push(second).await.unwrap();
        assert_eq!(data, FetchData::new(102, 4, vec![add(2)]));
        assert_eq!(
            node.repository().get_heads().await.unwrap(),
            BTreeSet::from([102])
        );
        assert_eq!(
            node.fetch(&100).await.unwrap(),
            FetchData::new(102, 4, vec![add(5)])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_waits_for_new_heads() {
        let node = Arc::new(node());
        let poll = tokio::spawn({
            let node = Arc::clone(&node);
            async move { node.poll(&1).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!poll.is_finished());

        let commit = node.create_proto_commit(1, vec![add(2)], 2).await.unwrap();
        node.push(commit).await.unwrap();
        let data = poll.await.unwrap().unwrap();
        assert_eq!(data, FetchData::new(100, 3, vec![add(2)]));
    }
}
