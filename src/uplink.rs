// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Synchronizing a local diff ledger with a remote history.
//!
//! An [`Uplink`] is the narrow remote interface used by [`UplinkStorage`]: check out, fetch, and
//! push a batch of diffs on top of a known base. Unlike [`OtNode::push`], an uplink may refuse a
//! push whose base is no longer current ([`PushOutcome::Diverged`]); the storage then fetches,
//! transforms its pending diffs over what it fetched and tries again.

use crate::{
    OtError,
    algorithms,
    commit::{CommitId, Diff, DiffsWithLevel},
    node::{FetchData, OtNode},
    repository::Repository,
    system::{OtSystem, concat},
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

/// The result of [`Uplink::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome<K, D> {
    /// The diffs are part of the remote history now; the data tells where that left the pusher.
    Accepted(FetchData<K, D>),
    /// The remote history moved past the base; nothing was stored.
    Diverged,
}

#[async_trait]
pub trait Uplink<K: CommitId, D: Diff>: Send + Sync {
    async fn checkout(&self) -> Result<FetchData<K, D>, OtError>;

    async fn fetch(&self, current: &K) -> Result<FetchData<K, D>, OtError>;

    /// Pushes `diffs` as a commit on top of `base`, which is at `base_level`.
    async fn push(
        &self,
        base: &K,
        base_level: u64,
        diffs: Vec<D>,
    ) -> Result<PushOutcome<K, D>, OtError>;
}

/// Any [`OtNode`] used as an [`Uplink`]. Pushes are always accepted since the node merges.
#[derive(Debug, Clone)]
pub struct NodeUplink<N>(pub N);

#[async_trait]
impl<K, D, N> Uplink<K, D> for NodeUplink<N>
where
    K: CommitId,
    D: Diff,
    N: OtNode<K, D>,
{
    async fn checkout(&self) -> Result<FetchData<K, D>, OtError> {
        self.0.checkout().await
    }

    async fn fetch(&self, current: &K) -> Result<FetchData<K, D>, OtError> {
        self.0.fetch(current).await
    }

    async fn push(
        &self,
        base: &K,
        base_level: u64,
        diffs: Vec<D>,
    ) -> Result<PushOutcome<K, D>, OtError> {
        let commit = self
            .0
            .create_proto_commit(base.clone(), diffs, base_level)
            .await?;
        Ok(PushOutcome::Accepted(self.0.push(commit).await?))
    }
}

/// An [`Uplink`] over a [`Repository`] that never merges.
///
/// A push is accepted only if its base is the one and only head.
#[derive(Debug)]
pub struct FastForwardUplink<R, S> {
    repository: R,
    system: S,
}

impl<R, S> FastForwardUplink<R, S> {
    pub fn new(repository: R, system: S) -> Self {
        Self { repository, system }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }
}

#[async_trait]
impl<K, D, R, S> Uplink<K, D> for FastForwardUplink<R, S>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D>,
    S: OtSystem<D>,
{
    async fn checkout(&self) -> Result<FetchData<K, D>, OtError> {
        algorithms::checkout(&self.repository, &self.system).await
    }

    async fn fetch(&self, current: &K) -> Result<FetchData<K, D>, OtError> {
        algorithms::fetch(&self.repository, &self.system, current).await
    }

    async fn push(
        &self,
        base: &K,
        base_level: u64,
        diffs: Vec<D>,
    ) -> Result<PushOutcome<K, D>, OtError> {
        let heads = self.repository.get_heads().await?;
        if heads.len() != 1 || !heads.contains(base) {
            tracing::debug!(?base, ?heads, "rejecting push on a stale base");
            return Ok(PushOutcome::Diverged);
        }
        let commit = self
            .repository
            .create_commit(BTreeMap::from([(
                base.clone(),
                DiffsWithLevel::new(base_level, diffs),
            )]))
            .await?;
        let data = FetchData::new(commit.id().clone(), commit.level(), Vec::new());
        self.repository.push(vec![commit]).await?;
        self.repository
            .update_heads(BTreeSet::from([data.commit_id.clone()]), heads)
            .await?;
        Ok(PushOutcome::Accepted(data))
    }
}

/// A local ledger of diffs not yet known to an [`Uplink`].
///
/// The storage remembers the remote position it is based on and the local diffs recorded on
/// top of it. [`sync`](Self::sync) pushes those diffs, rebasing them over remote changes for as
/// long as the uplink reports divergence, and hands back the remote diffs the local side has to
/// apply.
#[derive(Debug)]
pub struct UplinkStorage<K, D, U, S> {
    uplink: U,
    system: S,
    base: Option<(K, u64)>,
    pending: Vec<D>,
    /// Remote diffs rebased over already but not yet handed back by a sync.
    unapplied: Vec<D>,
}

impl<K, D, U, S> UplinkStorage<K, D, U, S>
where
    K: CommitId,
    D: Diff,
    U: Uplink<K, D>,
    S: OtSystem<D>,
{
    pub fn new(uplink: U, system: S) -> Self {
        Self {
            uplink,
            system,
            base: None,
            pending: Vec::new(),
            unapplied: Vec::new(),
        }
    }

    /// The remote commit and level the pending diffs are based on.
    pub fn base(&self) -> Option<(&K, u64)> {
        self.base.as_ref().map(|(id, level)| (id, *level))
    }

    pub fn pending(&self) -> &[D] {
        &self.pending
    }

    pub fn uplink(&self) -> &U {
        &self.uplink
    }

    /// Starts over from the current remote state, returning the diffs that build it.
    pub async fn checkout(&mut self) -> Result<Vec<D>, OtError> {
        let data = self.uplink.checkout().await?;
        self.base = Some((data.commit_id, data.level));
        self.pending.clear();
        self.unapplied.clear();
        Ok(data.diffs)
    }

    /// Records local diffs; empty ones are dropped.
    pub fn add(&mut self, diffs: impl IntoIterator<Item = D>) {
        let system = &self.system;
        self.pending
            .extend(diffs.into_iter().filter(|diff| !system.is_empty(diff)));
    }

    /// Publishes the pending diffs and catches up with the remote history.
    ///
    /// Returns the diffs that bring a local state, which has all pending diffs applied, to the
    /// new remote head. A failed sync keeps the remote diffs it has rebased over so far and the
    /// next successful one returns them.
    ///
    /// # Panics
    ///
    /// If the storage has not been checked out.
    pub async fn sync(&mut self) -> Result<Vec<D>, OtError> {
        loop {
            let Some((base, level)) = self.base.clone() else {
                panic!("sync before checkout");
            };

            if self.pending.is_empty() {
                let data = self.uplink.fetch(&base).await?;
                self.base = Some((data.commit_id, data.level));
                return Ok(self.take_unapplied(&data.diffs));
            }

            let diffs = self.system.squash(&self.pending);
            match self.uplink.push(&base, level, diffs).await? {
                PushOutcome::Accepted(data) => {
                    tracing::debug!(head = ?data.commit_id, "pushed pending diffs");
                    self.pending.clear();
                    self.base = Some((data.commit_id, data.level));
                    return Ok(self.take_unapplied(&data.diffs));
                }
                PushOutcome::Diverged => {
                    let data = self.uplink.fetch(&base).await?;
                    tracing::debug!(
                        ?base,
                        head = ?data.commit_id,
                        "uplink diverged, rebasing pending diffs"
                    );
                    let transformed = self.system.transform(&self.pending, &data.diffs)?;
                    self.unapplied.extend(transformed.left);
                    self.pending = self.system.squash(&transformed.right);
                    self.base = Some((data.commit_id, data.level));
                }
            }
        }
    }

    fn take_unapplied(&mut self, fetched: &[D]) -> Vec<D> {
        let unapplied = std::mem::take(&mut self.unapplied);
        self.system.squash(&concat(&unapplied, fetched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        OtNodeImpl, edges,
        repository::MemoryRepository,
        test_util::{SYSTEM, TestOp, TestState, add, set},
    };
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    type Storage<U> = UplinkStorage<u64, TestOp, U, crate::PairwiseSystem<TestOp>>;

    fn repository() -> Arc<MemoryRepository<u64, TestOp>> {
        let repository = Arc::new(MemoryRepository::sequential(100));
        repository.set_graph(edges![0 => 1: [add(1)]]);
        repository
    }

    #[tokio::test]
    async fn diverged_pushes_are_rebased_and_retried() {
        let repository = repository();
        let mut one: Storage<_> =
            UplinkStorage::new(FastForwardUplink::new(Arc::clone(&repository), SYSTEM), SYSTEM);
        let mut two: Storage<_> =
            UplinkStorage::new(FastForwardUplink::new(Arc::clone(&repository), SYSTEM), SYSTEM);

        let mut state_one = TestState::replay(&one.checkout().await.unwrap());
        let mut state_two = TestState::replay(&two.checkout().await.unwrap());
        assert_eq!(state_one.value(), 1);

        one.add([add(10), add(0)]);
        assert_eq!(one.pending(), &[add(10)]);
        state_one.apply_all(&[add(10)]).unwrap();
        state_one.apply_all(&one.sync().await.unwrap()).unwrap();
        assert_eq!(one.base(), Some((&100, 3)));

        two.add([set(1, 5)]);
        state_two.apply_all(&[set(1, 5)]).unwrap();
        state_two.apply_all(&two.sync().await.unwrap()).unwrap();
        assert!(two.pending().is_empty());
        assert_eq!(two.base(), Some((&101, 4)));
        assert_eq!(repository.get_heads().await.unwrap(), BTreeSet::from([101]));

        state_one.apply_all(&one.sync().await.unwrap()).unwrap();
        assert_eq!(one.base(), Some((&101, 4)));
        assert_eq!(state_one, state_two);
        // The set was rebased over the add and overrides it.
        assert_eq!(state_one.value(), 5);
    }

    /// Delegates to a [`FastForwardUplink`] but fails the `fail_on`-th push.
    struct FailingPush {
        uplink: FastForwardUplink<Arc<MemoryRepository<u64, TestOp>>, crate::PairwiseSystem<TestOp>>,
        pushes: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl Uplink<u64, TestOp> for FailingPush {
        async fn checkout(&self) -> Result<FetchData<u64, TestOp>, OtError> {
            self.uplink.checkout().await
        }

        async fn fetch(&self, current: &u64) -> Result<FetchData<u64, TestOp>, OtError> {
            self.uplink.fetch(current).await
        }

        async fn push(
            &self,
            base: &u64,
            base_level: u64,
            diffs: Vec<TestOp>,
        ) -> Result<PushOutcome<u64, TestOp>, OtError> {
            if self.pushes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(OtError::repository("network down"));
            }
            self.uplink.push(base, base_level, diffs).await
        }
    }

    #[tokio::test]
    async fn failed_retry_keeps_the_rebased_remote_diffs() {
        let repository = repository();
        let mut storage: Storage<_> = UplinkStorage::new(
            FailingPush {
                uplink: FastForwardUplink::new(Arc::clone(&repository), SYSTEM),
                pushes: AtomicUsize::new(0),
                fail_on: 2,
            },
            SYSTEM,
        );
        let mut state = TestState::replay(&storage.checkout().await.unwrap());

        repository.add_graph(edges![1 => 2: [add(10)]]);
        storage.add([add(5)]);
        state.apply_all(&[add(5)]).unwrap();

        // Diverges, rebases over the remote add, then fails to push again.
        assert!(storage.sync().await.is_err());
        assert_eq!(storage.base(), Some((&2, 3)));
        assert_eq!(storage.pending(), &[add(5)]);

        state.apply_all(&storage.sync().await.unwrap()).unwrap();
        assert!(storage.pending().is_empty());
        let remote = algorithms::checkout(storage.uplink().uplink.repository(), &SYSTEM)
            .await
            .unwrap();
        assert_eq!(state, TestState::replay(&remote.diffs));
        assert_eq!(state.value(), 16);
    }

    #[tokio::test]
    async fn node_uplink_merges_on_the_server() {
        let repository = repository();
        let node = Arc::new(OtNodeImpl::new(Arc::clone(&repository), SYSTEM));
        let mut one: Storage<_> = UplinkStorage::new(NodeUplink(Arc::clone(&node)), SYSTEM);
        let mut two: Storage<_> = UplinkStorage::new(NodeUplink(Arc::clone(&node)), SYSTEM);
        one.checkout().await.unwrap();
        two.checkout().await.unwrap();

        one.add([add(2)]);
        two.add([add(3)]);
        assert!(one.sync().await.unwrap().is_empty());
        assert_eq!(two.sync().await.unwrap(), vec![add(2)]);
        assert_eq!(one.sync().await.unwrap(), vec![add(3)]);
        assert_eq!(one.base(), two.base());
    }
}
