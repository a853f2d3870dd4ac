// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The client side of the sync protocol.
//!
//! A [`StateManager`] keeps an application projection ([`OtState`]) in sync with the history
//! served by an [`OtNode`]. Local edits are applied to the projection immediately and recorded
//! as *working diffs*. [`StateManager::sync`] then
//!
//! 1. pushes a commit left over from an earlier, failed sync,
//! 2. fetches remote changes and rebases the working diffs over them (unless polling already
//!    does that),
//! 3. turns the working diffs into a proto-commit,
//! 4. and pushes it.
//!
//! A failing step aborts the sync and leaves everything in place for the next attempt. Failures
//! that make the projection untrustworthy (a transform error, or the projection rejecting a
//! diff) *invalidate* the manager instead: it forgets its position and has to be checked out
//! again.
//!
//! The commit id reported by [`StateManager::commit_id`] moves to a proto-commit as soon as it
//! is created, since the projection includes its diffs. Until the commit has been pushed, fetched
//! data is not rebased and polling pauses.

use crate::{
    BoxError, OtError,
    commit::{Commit, CommitId, Diff},
    config::StateManagerConfig,
    node::{FetchData, OtNode},
    system::OtSystem,
};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use std::{
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::task::JoinHandle;

/// The application model a [`StateManager`] keeps in sync.
pub trait OtState<D>: Send {
    /// Resets to the empty state.
    fn init(&mut self);

    /// Applies one diff. An error invalidates the state manager.
    fn apply(&mut self, diff: &D) -> Result<(), BoxError>;
}

struct Pending<K, D> {
    commit: Commit<K, D>,
    diffs: Vec<D>,
    parent: K,
    parent_level: u64,
}

struct Local<K, D, St> {
    state: St,
    commit_id: Option<K>,
    level: u64,
    working: Vec<D>,
    pending: Option<Pending<K, D>>,
    polling: bool,
}

impl<K: CommitId, D: Diff, St: OtState<D>> Local<K, D, St> {
    fn invalidate(&mut self, reason: &OtError) {
        tracing::warn!(%reason, commit = ?self.commit_id, "invalidating state manager");
        self.commit_id = None;
        self.level = 0;
        self.working.clear();
        self.pending = None;
    }

    /// Applies `diffs` to the projection, invalidating on the first failure.
    fn apply_all(&mut self, diffs: &[D]) -> Result<(), OtError> {
        for diff in diffs {
            if let Err(err) = self.state.apply(diff) {
                let err = OtError::state(err);
                self.invalidate(&err);
                return Err(err);
            }
        }
        Ok(())
    }
}

type SyncFuture = Shared<BoxFuture<'static, Result<(), OtError>>>;

struct Inner<K, D, St> {
    node: Arc<dyn OtNode<K, D>>,
    system: Arc<dyn OtSystem<D>>,
    config: StateManagerConfig,
    local: Mutex<Local<K, D, St>>,
    in_flight: Mutex<Option<SyncFuture>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Keeps an [`OtState`] in sync with an [`OtNode`].
///
/// The manager is a cheap handle; clones share the same state.
pub struct StateManager<K, D, St> {
    inner: Arc<Inner<K, D, St>>,
}

impl<K, D, St> Clone for StateManager<K, D, St> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, D, St> StateManager<K, D, St>
where
    K: CommitId,
    D: Diff,
    St: OtState<D> + 'static,
{
    pub fn new(
        node: impl OtNode<K, D> + 'static,
        system: impl OtSystem<D> + 'static,
        state: St,
    ) -> Self {
        Self::with_config(node, system, state, StateManagerConfig::default())
    }

    pub fn with_config(
        node: impl OtNode<K, D> + 'static,
        system: impl OtSystem<D> + 'static,
        state: St,
        config: StateManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                node: Arc::new(node),
                system: Arc::new(system),
                config,
                local: Mutex::new(Local {
                    state,
                    commit_id: None,
                    level: 0,
                    working: Vec::new(),
                    pending: None,
                    polling: false,
                }),
                in_flight: Mutex::new(None),
                poll_task: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// The commit the projection corresponds to, minus the working diffs.
    ///
    /// `None` before the first checkout and after invalidation.
    pub fn commit_id(&self) -> Option<K> {
        self.inner.local().commit_id.clone()
    }

    pub fn level(&self) -> u64 {
        self.inner.local().level
    }

    pub fn is_valid(&self) -> bool {
        self.inner.local().commit_id.is_some()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.is_syncing()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.local().polling
    }

    pub fn has_working_diffs(&self) -> bool {
        !self.inner.local().working.is_empty()
    }

    pub fn working_diffs(&self) -> Vec<D> {
        self.inner.local().working.clone()
    }

    pub fn has_pending_commit(&self) -> bool {
        self.inner.local().pending.is_some()
    }

    /// Runs `f` on the projection.
    pub fn with_state<T>(&self, f: impl FnOnce(&St) -> T) -> T {
        f(&self.inner.local().state)
    }

    /// Loads the current remote state into the projection.
    ///
    /// # Panics
    ///
    /// If the manager is checked out already, i.e. [`is_valid`](Self::is_valid).
    pub async fn checkout(&self) -> Result<K, OtError> {
        assert!(
            !self.is_valid(),
            "checkout of a state manager that is checked out already"
        );
        let data = self.inner.node.checkout().await?;

        let mut local = self.inner.local();
        local.state.init();
        local.working.clear();
        local.pending = None;
        local.apply_all(&data.diffs)?;
        local.commit_id = Some(data.commit_id.clone());
        local.level = data.level;
        tracing::info!(commit = ?data.commit_id, level = data.level, "checked out");
        Ok(data.commit_id)
    }

    pub fn add(&self, diff: D) -> Result<(), OtError> {
        self.add_all([diff])
    }

    /// Applies local edits to the projection and records them for the next sync.
    ///
    /// Diffs that do nothing are dropped. If the projection rejects a diff, the manager is
    /// invalidated.
    pub fn add_all(&self, diffs: impl IntoIterator<Item = D>) -> Result<(), OtError> {
        let mut local = self.inner.local();
        if local.commit_id.is_none() {
            return Err(OtError::Invalidated);
        }
        for diff in diffs {
            if self.inner.system.is_empty(&diff) {
                continue;
            }
            local.apply_all(std::slice::from_ref(&diff))?;
            local.working.push(diff);
        }
        Ok(())
    }

    /// Exchanges local and remote changes with the node.
    ///
    /// Calls made while a sync is in flight share its outcome instead of starting another one.
    /// The sync runs on its own task and completes even if the returned future is dropped.
    ///
    /// # Panics
    ///
    /// If called outside of a tokio runtime.
    pub fn sync(&self) -> impl Future<Output = Result<(), OtError>> + Send + 'static {
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some(sync) = in_flight.as_ref() {
            tracing::trace!("joining in-flight sync");
            return sync.clone();
        }
        let inner = Arc::clone(&self.inner);
        // Clearing `in_flight` waits for the lock held here, so it cannot overtake the store below.
        let task = tokio::spawn(async move {
            let result = inner.run_sync().await;
            if let Err(err) = &result {
                tracing::warn!(%err, "sync failed");
            }
            *lock(&inner.in_flight) = None;
            result
        });
        let sync = async move {
            match task.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(err) => Err(OtError::repository(err)),
            }
        }
        .boxed()
        .shared();
        *in_flight = Some(sync.clone());
        sync
    }

    /// Rolls the projection back to the last state acknowledged by the node.
    ///
    /// Working diffs and an unpushed proto-commit are undone and dropped.
    ///
    /// # Panics
    ///
    /// If a sync is in flight.
    pub fn reset(&self) -> Result<(), OtError> {
        assert!(!self.is_syncing(), "reset while a sync is in flight");
        let mut local = self.inner.local();
        let mut undone = local
            .pending
            .as_ref()
            .map(|pending| pending.diffs.clone())
            .unwrap_or_default();
        undone.extend(local.working.iter().cloned());
        let inverse = self.inner.system.invert(&undone);
        local.apply_all(&inverse)?;

        local.working.clear();
        if let Some(pending) = local.pending.take() {
            tracing::debug!(dropped = ?pending.commit.id(), "dropping unpushed commit");
            local.commit_id = Some(pending.parent);
            local.level = pending.parent_level;
        }
        Ok(())
    }

    /// Starts following remote changes in a background task.
    ///
    /// While polling, [`sync`](Self::sync) does not fetch on its own.
    ///
    /// # Panics
    ///
    /// If called outside of a tokio runtime.
    pub fn start_polling(&self) {
        let mut task = lock(&self.inner.poll_task);
        if task.is_some() {
            return;
        }
        self.inner.stopped.store(false, Ordering::Release);
        self.inner.local().polling = true;
        *task = Some(tokio::spawn(poll_loop(Arc::downgrade(&self.inner))));
    }

    /// Stops polling once an in-flight sync has finished.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let in_flight = lock(&self.inner.in_flight).clone();
        if let Some(sync) = in_flight {
            if let Err(err) = sync.await {
                tracing::debug!(%err, "in-flight sync failed while stopping");
            }
        }
        let task = lock(&self.inner.poll_task).take();
        if let Some(task) = task {
            task.abort();
        }
        self.inner.local().polling = false;
    }
}

impl<K, D, St> Inner<K, D, St>
where
    K: CommitId,
    D: Diff,
    St: OtState<D> + 'static,
{
    fn local(&self) -> MutexGuard<'_, Local<K, D, St>> {
        lock(&self.local)
    }

    fn is_syncing(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    async fn run_sync(&self) -> Result<(), OtError> {
        let polling = {
            let local = self.local();
            if local.commit_id.is_none() {
                return Err(OtError::Invalidated);
            }
            local.polling
        };
        self.push().await?;
        if !polling {
            self.fetch().await?;
        }
        self.commit().await?;
        self.push().await
    }

    async fn push(&self) -> Result<(), OtError> {
        let commit = match &self.local().pending {
            Some(pending) => pending.commit.clone(),
            None => return Ok(()),
        };
        let id = commit.id().clone();
        tracing::debug!(commit = ?id, "pushing");
        let data = self.node.push(commit).await?;

        let mut local = self.local();
        local.pending = None;
        self.rebase(&mut local, &id, data)
    }

    async fn fetch(&self) -> Result<(), OtError> {
        let current = self
            .local()
            .commit_id
            .clone()
            .ok_or(OtError::Invalidated)?;
        let data = self.node.fetch(&current).await?;
        let mut local = self.local();
        self.rebase(&mut local, &current, data)
    }

    async fn commit(&self) -> Result<(), OtError> {
        let (parent, parent_level, diffs, committed) = {
            let mut local = self.local();
            if local.working.is_empty() {
                return Ok(());
            }
            assert!(
                local.pending.is_none(),
                "commit while a proto-commit is pending"
            );
            let parent = local.commit_id.clone().ok_or(OtError::Invalidated)?;
            let diffs = self.system.squash(&local.working);
            if diffs.is_empty() {
                // The working diffs cancel out.
                local.working.clear();
                return Ok(());
            }
            (parent, local.level, diffs, local.working.len())
        };

        let commit = self
            .node
            .create_proto_commit(parent.clone(), diffs.clone(), parent_level)
            .await?;

        let mut local = self.local();
        if local.commit_id.as_ref() != Some(&parent) || local.working.len() < committed {
            tracing::debug!(commit = ?commit.id(), "state moved on, dropping proto-commit");
            return Ok(());
        }
        local.working.drain(..committed);
        local.commit_id = Some(commit.id().clone());
        local.level = commit.level();
        tracing::debug!(commit = ?commit.id(), ?parent, "created proto-commit");
        local.pending = Some(Pending {
            commit,
            diffs,
            parent,
            parent_level,
        });
        Ok(())
    }

    /// Moves the projection to the position described by `data`, which was obtained for
    /// `original`.
    fn rebase(
        &self,
        local: &mut Local<K, D, St>,
        original: &K,
        data: FetchData<K, D>,
    ) -> Result<(), OtError> {
        if local.commit_id.as_ref() != Some(original) || local.pending.is_some() {
            tracing::trace!(?original, current = ?local.commit_id, "skipping stale rebase");
            return Ok(());
        }
        let fetched = self.system.squash(&data.diffs);
        if !fetched.is_empty() {
            let working = self.system.squash(&local.working);
            let transformed = match self.system.transform(&working, &fetched) {
                Ok(transformed) => transformed,
                Err(err) => {
                    let err = OtError::from(err);
                    local.invalidate(&err);
                    return Err(err);
                }
            };
            local.apply_all(&transformed.left)?;
            local.working = transformed.right;
        }
        tracing::debug!(from = ?original, to = ?data.commit_id, "rebased");
        local.commit_id = Some(data.commit_id);
        local.level = data.level;
        Ok(())
    }
}

impl<K, D, St> Drop for Inner<K, D, St> {
    fn drop(&mut self) {
        let task = self
            .poll_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Follows remote changes until the manager is stopped, invalidated or dropped.
///
/// Only a [`Weak`] reference is kept while waiting, so dropping every handle ends the loop.
async fn poll_loop<K, D, St>(weak: Weak<Inner<K, D, St>>)
where
    K: CommitId,
    D: Diff,
    St: OtState<D> + 'static,
{
    let mut backoff = match weak.upgrade() {
        Some(inner) => inner.config.poll_error_retry.backoff(),
        None => return,
    };
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.stopped.load(Ordering::Acquire) {
            return;
        }
        let (current, pending) = {
            let local = inner.local();
            (local.commit_id.clone(), local.pending.is_some())
        };
        let Some(current) = current else {
            tracing::debug!("state manager invalidated, polling stops");
            return;
        };
        if pending {
            // The node does not know the proto-commit until a sync pushes it.
            let delay = backoff.next_delay();
            tracing::trace!(commit = ?current, ?delay, "waiting for the pending commit");
            drop(inner);
            tokio::time::sleep(delay).await;
            continue;
        }

        let node = Arc::clone(&inner.node);
        drop(inner);
        let result = node.poll(&current).await;
        drop(node);
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let data = match result {
            Ok(data) => {
                backoff.reset();
                data
            }
            Err(err) => {
                let delay = backoff.next_delay();
                tracing::warn!(%err, ?delay, "poll failed");
                drop(inner);
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let in_flight = lock(&inner.in_flight).clone();
        if let Some(sync) = in_flight {
            // The sync rebases on its own; wait for it instead of racing it.
            drop(inner);
            let _ = sync.await;
            continue;
        }
        let result = {
            let mut local = inner.local();
            inner.rebase(&mut local, &current, data)
        };
        if let Err(err) = result {
            tracing::warn!(%err, "applying polled changes failed");
            if err.is_fatal() {
                return;
            }
        }
    }
}
