// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Level-ordered traversal of the commit graph.
//!
//! Every search over history in this crate is a [`GraphReducer`] driven by [`reduce`]. The
//! driver starts from a set of heads and always visits the highest-level commit that has not
//! been visited yet. Because a commit's level is greater than the level of each of its parents,
//! a commit is visited only after every higher-level commit reachable from the same heads. That
//! ordering is what makes common-ancestor and cut searches correct without revisiting commits.
//!
//! On each visit the reducer decides to
//!
//! - [`Step::Resume`]: continue through the commit's parents,
//! - [`Step::Skip`]: drop the commit and do not walk its parents,
//! - [`Step::Complete`]: stop with a result.
//!
//! If the traversal runs out of commits without completing, [`reduce`] fails with
//! [`OtError::GraphExhausted`].
//!
//! Most searches accumulate something along the paths from each head downwards. The
//! [`AccumulatingReducer`] does the bookkeeping for them: it keeps, for each pending commit, one
//! accumulator per head that reaches it, and asks a [`Probe`] on every visit whether the search
//! is done. What gets accumulated is defined by a [`DiffsReducer`].

use crate::{
    OtError, OtRandomState,
    commit::{Commit, CommitId, Diff},
    create_map, create_set,
    repository::Repository,
    system::OtSystem,
};
use async_trait::async_trait;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap},
    marker::PhantomData,
    sync::Arc,
};

/// What the traversal does after visiting a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<R> {
    Resume,
    Skip,
    Complete(R),
}

struct Queued<K, D> {
    commit: Arc<Commit<K, D>>,
    seq: u64,
}

impl<K: Ord, D> Ord for Queued<K, D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.commit
            .level()
            .cmp(&other.commit.level())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K: Ord, D> PartialOrd for Queued<K, D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, D> PartialEq for Queued<K, D> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord, D> Eq for Queued<K, D> {}

/// The commits waiting to be visited, including the one being visited right now.
pub struct Frontier<'a, K, D> {
    queue: &'a BinaryHeap<Queued<K, D>>,
}

impl<K: CommitId, D> Frontier<'_, K, D> {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn commits(&self) -> impl Iterator<Item = &Arc<Commit<K, D>>> + '_ {
        self.queue.iter().map(|q| &q.commit)
    }

    pub fn ids(&self) -> BTreeSet<K> {
        self.commits().map(|c| c.id().clone()).collect()
    }

    pub fn contains(&self, id: &K) -> bool {
        self.commits().any(|c| c.id() == id)
    }
}

/// A visitor driven by [`reduce`].
#[async_trait]
pub trait GraphReducer<K: CommitId, D: Diff>: Send {
    type Output: Send;

    /// Called once with the loaded head commits before the first visit.
    #[expect(unused_variables)]
    fn on_start(&mut self, heads: &[Arc<Commit<K, D>>]) {}

    async fn on_commit(
        &mut self,
        commit: &Arc<Commit<K, D>>,
        frontier: &Frontier<'_, K, D>,
    ) -> Result<Step<Self::Output>, OtError>;
}

/// Walks the graph below `heads` in descending level order until `reducer` completes.
pub async fn reduce<K, D, R, G>(
    repository: &R,
    heads: &BTreeSet<K>,
    reducer: &mut G,
) -> Result<G::Output, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    G: GraphReducer<K, D>,
{
    let mut visited = create_set();
    let mut head_commits = Vec::with_capacity(heads.len());
    for head in heads {
        visited.insert(head.clone());
        head_commits.push(repository.load_commit(head).await?);
    }
    reducer.on_start(&head_commits);

    let mut seq = 0;
    let mut queue = BinaryHeap::with_capacity(head_commits.len());
    for commit in head_commits {
        queue.push(Queued { commit, seq });
        seq += 1;
    }

    while let Some(next) = queue.peek() {
        let commit = Arc::clone(&next.commit);
        let step = reducer
            .on_commit(&commit, &Frontier { queue: &queue })
            .await?;
        queue.pop();
        match step {
            Step::Complete(result) => return Ok(result),
            Step::Skip => {
                tracing::trace!(id = ?commit.id(), "skipping commit");
            }
            Step::Resume => {
                for parent in commit.parent_ids() {
                    if visited.insert(parent.clone()) {
                        let commit = repository.load_commit(parent).await?;
                        queue.push(Queued { commit, seq });
                        seq += 1;
                    }
                }
            }
        }
    }

    tracing::debug!(?heads, visited = visited.len(), "graph exhausted");
    Err(OtError::GraphExhausted)
}

/// How diffs are folded along a path from a head down to an ancestor.
pub trait DiffsReducer<A, D>: Send + Sync {
    fn initial(&self) -> A;

    /// Extends `accumulated` (from some head down to a commit) by the `diffs` leading from one of
    /// that commit's parents to the commit.
    fn accumulate(&self, accumulated: &A, diffs: &[D]) -> A;

    /// Picks the value for a commit reached from the same head along two different paths.
    #[expect(unused_variables)]
    fn combine(&self, existing: A, other: A) -> A {
        existing
    }
}

/// Accumulates nothing; useful for searches that only care about reachability.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToVoid;

impl<D> DiffsReducer<(), D> for ToVoid {
    fn initial(&self) {}

    fn accumulate(&self, _: &(), _: &[D]) {}
}

/// Accumulates the full diff sequence from the ancestor up to the head.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToList;

impl<D: Clone> DiffsReducer<Vec<D>, D> for ToList {
    fn initial(&self) -> Vec<D> {
        Vec::new()
    }

    fn accumulate(&self, accumulated: &Vec<D>, diffs: &[D]) -> Vec<D> {
        crate::system::concat(diffs, accumulated)
    }
}

/// Like [`ToList`], but keeps the sequence squashed.
pub struct ToSquashedList<'s, S: ?Sized>(pub &'s S);

impl<D, S> DiffsReducer<Vec<D>, D> for ToSquashedList<'_, S>
where
    D: Clone,
    S: OtSystem<D> + ?Sized,
{
    fn initial(&self) -> Vec<D> {
        Vec::new()
    }

    fn accumulate(&self, accumulated: &Vec<D>, diffs: &[D]) -> Vec<D> {
        self.0.squash(&crate::system::concat(diffs, accumulated))
    }
}

/// Per-commit, per-head accumulated values of an [`AccumulatingReducer`].
pub struct Accumulators<K, A> {
    by_commit: HashMap<K, BTreeMap<K, A>, OtRandomState>,
}

impl<K: CommitId, A> Accumulators<K, A> {
    /// Accumulated values from each head that reaches `id` so far.
    pub fn of(&self, id: &K) -> Option<&BTreeMap<K, A>> {
        self.by_commit.get(id)
    }

    /// Every commit with pending accumulated values.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &BTreeMap<K, A>)> + '_ {
        self.by_commit.iter()
    }
}

/// Decides when an [`AccumulatingReducer`] is done.
#[async_trait]
pub trait Probe<K: CommitId, D: Diff, A>: Send {
    type Output: Send;

    #[expect(unused_variables)]
    fn on_start(&mut self, heads: &[Arc<Commit<K, D>>]) {}

    /// Inspects `commit` before its accumulated values move on to its parents.
    async fn probe(
        &mut self,
        commit: &Arc<Commit<K, D>>,
        accumulators: &Accumulators<K, A>,
        heads: &BTreeSet<K>,
    ) -> Result<Option<Self::Output>, OtError>;
}

/// A [`GraphReducer`] that folds diffs per head and stops when its [`Probe`] says so.
pub struct AccumulatingReducer<K, D, A, R, P> {
    diffs_reducer: R,
    probe: P,
    heads: BTreeSet<K>,
    accumulators: Accumulators<K, A>,
    _diff: PhantomData<fn(&D)>,
}

impl<K, D, A, R, P> AccumulatingReducer<K, D, A, R, P>
where
    K: CommitId,
    D: Diff,
    R: DiffsReducer<A, D>,
    P: Probe<K, D, A>,
{
    pub fn new(diffs_reducer: R, probe: P) -> Self {
        Self {
            diffs_reducer,
            probe,
            heads: BTreeSet::new(),
            accumulators: Accumulators {
                by_commit: create_map(),
            },
            _diff: PhantomData,
        }
    }
}

#[async_trait]
impl<K, D, A, R, P> GraphReducer<K, D> for AccumulatingReducer<K, D, A, R, P>
where
    K: CommitId,
    D: Diff,
    A: Send + Sync,
    R: DiffsReducer<A, D>,
    P: Probe<K, D, A>,
{
    type Output = P::Output;

    fn on_start(&mut self, heads: &[Arc<Commit<K, D>>]) {
        for head in heads {
            let id = head.id().clone();
            self.heads.insert(id.clone());
            self.accumulators.by_commit.insert(
                id.clone(),
                BTreeMap::from([(id, self.diffs_reducer.initial())]),
            );
        }
        self.probe.on_start(heads);
    }

    async fn on_commit(
        &mut self,
        commit: &Arc<Commit<K, D>>,
        _: &Frontier<'_, K, D>,
    ) -> Result<Step<Self::Output>, OtError> {
        if let Some(result) = self
            .probe
            .probe(commit, &self.accumulators, &self.heads)
            .await?
        {
            return Ok(Step::Complete(result));
        }

        let per_head = self
            .accumulators
            .by_commit
            .remove(commit.id())
            .unwrap_or_default();
        for (parent, diffs) in commit.parents() {
            let into = self
                .accumulators
                .by_commit
                .entry(parent.clone())
                .or_default();
            for (head, accumulated) in &per_head {
                let value = self.diffs_reducer.accumulate(accumulated, diffs);
                let value = match into.remove(head) {
                    Some(existing) => self.diffs_reducer.combine(existing, value),
                    None => value,
                };
                into.insert(head.clone(), value);
            }
        }
        Ok(Step::Resume)
    }
}
