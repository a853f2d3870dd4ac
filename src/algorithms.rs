// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Searches and merges over a [`Repository`].
//!
//! Everything here is a thin policy on top of [`reduce`]: an [`AccumulatingReducer`] with a
//! specific [`Probe`], or a small dedicated [`GraphReducer`]. All functions are generic over the
//! repository and the diff algebra and never hold on to either beyond the call.

use crate::{
    OtError,
    commit::{Commit, CommitId, Diff, DiffsWithLevel},
    graph::{GraphNode, LoadedGraph},
    node::FetchData,
    reducer::{
        Accumulators, AccumulatingReducer, DiffsReducer, Frontier, GraphReducer, Probe, Step,
        ToList, ToSquashedList, ToVoid, reduce,
    },
    repository::Repository,
    system::{OtSystem, concat},
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet},
    convert::Infallible,
    sync::Arc,
};

/// A test applied to commits during [`find_parent`].
#[async_trait]
pub trait CommitPredicate<K: CommitId, D: Diff>: Send {
    async fn test(&mut self, commit: &Arc<Commit<K, D>>) -> Result<bool, OtError>;
}

#[async_trait]
impl<K, D, F> CommitPredicate<K, D> for F
where
    K: CommitId,
    D: Diff,
    F: FnMut(&Commit<K, D>) -> bool + Send,
{
    async fn test(&mut self, commit: &Arc<Commit<K, D>>) -> Result<bool, OtError> {
        Ok(self(&**commit))
    }
}

/// Matches commits that have a saved snapshot, remembering the last snapshot found.
///
/// Root commits without a saved snapshot match with the empty snapshot.
pub struct SnapshotLookup<'r, R: ?Sized, D> {
    repository: &'r R,
    found: Option<Vec<D>>,
}

impl<'r, R: ?Sized, D> SnapshotLookup<'r, R, D> {
    pub fn new(repository: &'r R) -> Self {
        Self {
            repository,
            found: None,
        }
    }

    pub fn into_snapshot(self) -> Option<Vec<D>> {
        self.found
    }
}

#[async_trait]
impl<'r, K, D, R> CommitPredicate<K, D> for SnapshotLookup<'r, R, D>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
{
    async fn test(&mut self, commit: &Arc<Commit<K, D>>) -> Result<bool, OtError> {
        if commit.snapshot_hint() == Some(false) {
            return Ok(false);
        }
        match self.repository.load_snapshot(commit.id()).await? {
            Some(snapshot) => self.found = Some(snapshot),
            None if commit.is_root() => self.found = Some(Vec::new()),
            None => return Ok(false),
        }
        Ok(true)
    }
}

/// The outcome of [`find_parent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindResult<K, A> {
    /// The commit that satisfied the predicate.
    pub commit: K,
    pub commit_parents: BTreeSet<K>,
    pub commit_level: u64,
    /// A head the commit was reached from.
    pub child: K,
    pub child_level: u64,
    /// What was accumulated on the way from `commit` up to `child`.
    pub accumulated: A,
}

struct FindParentProbe<'p, K, P: ?Sized> {
    predicate: &'p mut P,
    head_levels: BTreeMap<K, u64>,
}

#[async_trait]
impl<'p, K, D, A, P> Probe<K, D, A> for FindParentProbe<'p, K, P>
where
    K: CommitId,
    D: Diff,
    A: Clone + Send + Sync,
    P: CommitPredicate<K, D> + ?Sized,
{
    type Output = FindResult<K, A>;

    fn on_start(&mut self, heads: &[Arc<Commit<K, D>>]) {
        self.head_levels = heads
            .iter()
            .map(|head| (head.id().clone(), head.level()))
            .collect();
    }

    async fn probe(
        &mut self,
        commit: &Arc<Commit<K, D>>,
        accumulators: &Accumulators<K, A>,
        _: &BTreeSet<K>,
    ) -> Result<Option<Self::Output>, OtError> {
        if !self.predicate.test(commit).await? {
            return Ok(None);
        }
        let Some((child, accumulated)) = accumulators.of(commit.id()).and_then(|a| a.iter().next())
        else {
            return Ok(None);
        };
        Ok(Some(FindResult {
            commit: commit.id().clone(),
            commit_parents: commit.parent_ids().cloned().collect(),
            commit_level: commit.level(),
            child: child.clone(),
            child_level: self.head_levels.get(child).copied().unwrap_or_default(),
            accumulated: accumulated.clone(),
        }))
    }
}

/// Walks down from `heads` until a commit satisfies `predicate`.
///
/// Fails with [`OtError::GraphExhausted`] if no commit below the heads matches.
pub async fn find_parent<K, D, R, A, DR, P>(
    repository: &R,
    heads: &BTreeSet<K>,
    diffs_reducer: DR,
    predicate: &mut P,
) -> Result<FindResult<K, A>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    A: Clone + Send + Sync,
    DR: DiffsReducer<A, D>,
    P: CommitPredicate<K, D> + ?Sized,
{
    let probe = FindParentProbe {
        predicate,
        head_levels: BTreeMap::new(),
    };
    let mut reducer = AccumulatingReducer::new(diffs_reducer, probe);
    reduce(repository, heads, &mut reducer).await
}

struct AnyCommonParent;

#[async_trait]
impl<K: CommitId, D: Diff, A: Clone + Send + Sync> Probe<K, D, A> for AnyCommonParent {
    type Output = (K, BTreeMap<K, A>);

    async fn probe(
        &mut self,
        commit: &Arc<Commit<K, D>>,
        accumulators: &Accumulators<K, A>,
        heads: &BTreeSet<K>,
    ) -> Result<Option<Self::Output>, OtError> {
        Ok(accumulators
            .of(commit.id())
            .filter(|per_head| per_head.keys().eq(heads.iter()))
            .map(|per_head| (commit.id().clone(), per_head.clone())))
    }
}

struct AllCommonParents;

#[async_trait]
impl<K: CommitId, D: Diff, A: Send + Sync> Probe<K, D, A> for AllCommonParents {
    type Output = BTreeSet<K>;

    async fn probe(
        &mut self,
        _: &Arc<Commit<K, D>>,
        accumulators: &Accumulators<K, A>,
        heads: &BTreeSet<K>,
    ) -> Result<Option<Self::Output>, OtError> {
        let done = accumulators
            .iter()
            .all(|(_, per_head)| per_head.keys().eq(heads.iter()));
        Ok(done.then(|| accumulators.iter().map(|(id, _)| id.clone()).collect()))
    }
}

/// Some commit reachable from every one of `heads`, with what `diffs_reducer` accumulated from it
/// up to each head.
pub async fn find_any_common_parent_with<K, D, R, A, DR>(
    repository: &R,
    heads: &BTreeSet<K>,
    diffs_reducer: DR,
) -> Result<(K, BTreeMap<K, A>), OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    A: Clone + Send + Sync,
    DR: DiffsReducer<A, D>,
{
    let mut reducer = AccumulatingReducer::new(diffs_reducer, AnyCommonParent);
    reduce(repository, heads, &mut reducer).await
}

/// Some commit reachable from every one of `heads`.
pub async fn find_any_common_parent<K, D, R>(
    repository: &R,
    heads: &BTreeSet<K>,
) -> Result<K, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
{
    let (id, _) = find_any_common_parent_with(repository, heads, ToVoid).await?;
    Ok(id)
}

/// The first frontier in which every pending commit is reachable from all of `heads`.
pub async fn find_all_common_parents<K, D, R>(
    repository: &R,
    heads: &BTreeSet<K>,
) -> Result<BTreeSet<K>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
{
    let mut reducer = AccumulatingReducer::new(ToVoid, AllCommonParents);
    reduce(repository, heads, &mut reducer).await
}

struct FindCut<P> {
    predicate: P,
}

#[async_trait]
impl<K, D, P> GraphReducer<K, D> for FindCut<P>
where
    K: CommitId,
    D: Diff,
    P: FnMut(&[Arc<Commit<K, D>>]) -> bool + Send,
{
    type Output = BTreeSet<K>;

    async fn on_commit(
        &mut self,
        _: &Arc<Commit<K, D>>,
        frontier: &Frontier<'_, K, D>,
    ) -> Result<Step<Self::Output>, OtError> {
        let commits: Vec<_> = frontier.commits().cloned().collect();
        Ok(if (self.predicate)(&commits) {
            Step::Complete(frontier.ids())
        } else {
            Step::Resume
        })
    }
}

/// The first traversal frontier below `heads` that satisfies `predicate`.
///
/// The frontier passed to `predicate` includes the commit about to be visited.
pub async fn find_cut<K, D, R, P>(
    repository: &R,
    heads: &BTreeSet<K>,
    predicate: P,
) -> Result<BTreeSet<K>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    P: FnMut(&[Arc<Commit<K, D>>]) -> bool + Send,
{
    reduce(repository, heads, &mut FindCut { predicate }).await
}

struct ExcludeParents<K> {
    result: BTreeSet<K>,
    min_level: u64,
}

#[async_trait]
impl<K: CommitId, D: Diff> GraphReducer<K, D> for ExcludeParents<K> {
    type Output = BTreeSet<K>;

    fn on_start(&mut self, heads: &[Arc<Commit<K, D>>]) {
        self.min_level = heads.iter().map(|h| h.level()).min().unwrap_or_default();
    }

    async fn on_commit(
        &mut self,
        commit: &Arc<Commit<K, D>>,
        _: &Frontier<'_, K, D>,
    ) -> Result<Step<Self::Output>, OtError> {
        for parent in commit.parent_ids() {
            self.result.remove(parent);
        }
        Ok(if commit.level() <= self.min_level {
            Step::Complete(std::mem::take(&mut self.result))
        } else {
            Step::Resume
        })
    }
}

/// Drops from `nodes` every commit that is an ancestor of another one of them.
///
/// # Panics
///
/// If `nodes` is empty.
pub async fn exclude_parents<K, D, R>(
    repository: &R,
    nodes: &BTreeSet<K>,
) -> Result<BTreeSet<K>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
{
    assert!(!nodes.is_empty(), "cannot exclude parents of no commits");
    if nodes.len() == 1 {
        return Ok(nodes.clone());
    }
    let mut reducer = ExcludeParents {
        result: nodes.clone(),
        min_level: 0,
    };
    reduce(repository, nodes, &mut reducer).await
}

/// The diffs that turn the state at `from` into the state at `to`.
pub async fn diff<K, D, R, S>(
    repository: &R,
    system: &S,
    from: &K,
    to: &K,
) -> Result<Vec<D>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    S: OtSystem<D> + ?Sized,
{
    if from == to {
        return Ok(Vec::new());
    }
    let heads = BTreeSet::from([from.clone(), to.clone()]);
    let (ancestor, mut paths) = find_any_common_parent_with(repository, &heads, ToList).await?;
    tracing::trace!(?from, ?to, ?ancestor, "found common ancestor");
    let to_from = paths.remove(from).unwrap_or_default();
    let to_to = paths.remove(to).unwrap_or_default();
    Ok(system.squash(&concat(&system.invert(&to_from), &to_to)))
}

struct ReduceEdges<K> {
    parent: K,
}

#[async_trait]
impl<K: CommitId, D: Diff, A: Clone + Send + Sync> Probe<K, D, A> for ReduceEdges<K> {
    type Output = BTreeMap<K, A>;

    async fn probe(
        &mut self,
        _: &Arc<Commit<K, D>>,
        accumulators: &Accumulators<K, A>,
        heads: &BTreeSet<K>,
    ) -> Result<Option<Self::Output>, OtError> {
        Ok(accumulators
            .of(&self.parent)
            .filter(|per_head| per_head.keys().eq(heads.iter()))
            .cloned())
    }
}

/// What `diffs_reducer` accumulates from `parent` up to each of `heads`.
///
/// Fails with [`OtError::GraphExhausted`] unless `parent` is an ancestor of every head.
pub async fn reduce_edges<K, D, R, A, DR>(
    repository: &R,
    heads: &BTreeSet<K>,
    parent: K,
    diffs_reducer: DR,
) -> Result<BTreeMap<K, A>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    A: Clone + Send + Sync,
    DR: DiffsReducer<A, D>,
{
    let mut reducer = AccumulatingReducer::new(diffs_reducer, ReduceEdges { parent });
    reduce(repository, heads, &mut reducer).await
}

struct LoadForMerge<'s, K, D, S: ?Sized> {
    system: &'s S,
    heads: BTreeSet<K>,
    head_roots: BTreeMap<K, BTreeSet<GraphNode<K>>>,
    root_heads: BTreeMap<GraphNode<K>, BTreeSet<K>>,
    graph: LoadedGraph<K, D>,
}

#[async_trait]
impl<'s, K, D, S> GraphReducer<K, D> for LoadForMerge<'s, K, D, S>
where
    K: CommitId,
    D: Diff,
    S: OtSystem<D> + ?Sized,
{
    type Output = LoadedGraph<K, D>;

    fn on_start(&mut self, heads: &[Arc<Commit<K, D>>]) {
        for head in heads {
            let id = head.id().clone();
            self.heads.insert(id.clone());
            self.head_roots
                .insert(id.clone(), BTreeSet::from([GraphNode::Commit(id.clone())]));
            self.root_heads
                .insert(GraphNode::Commit(id.clone()), BTreeSet::from([id]));
        }
    }

    async fn on_commit(
        &mut self,
        commit: &Arc<Commit<K, D>>,
        _: &Frontier<'_, K, D>,
    ) -> Result<Step<Self::Output>, OtError> {
        let node = GraphNode::Commit(commit.id().clone());
        let affected = self.root_heads.remove(&node).unwrap_or_default();
        for head in &affected {
            if let Some(roots) = self.head_roots.get_mut(head) {
                roots.remove(&node);
            }
        }

        let parents: Vec<_> = if commit.is_root() {
            vec![node.clone()]
        } else {
            commit.parent_ids().cloned().map(GraphNode::Commit).collect()
        };
        for parent in &parents {
            for root in self.graph.find_roots(parent) {
                for head in &affected {
                    self.head_roots
                        .entry(head.clone())
                        .or_default()
                        .insert(root.clone());
                }
                self.root_heads
                    .entry(root)
                    .or_default()
                    .extend(affected.iter().cloned());
            }
        }

        self.graph.add_node(commit);
        if !self.heads.contains(commit.id()) {
            self.graph.compact(self.system, &node);
        }

        let all_roots: BTreeSet<_> = self.root_heads.keys().cloned().collect();
        if self.head_roots.values().any(|roots| *roots == all_roots) {
            tracing::debug!(
                heads = ?self.heads,
                nodes = self.graph.len(),
                "loaded graph for merge"
            );
            return Ok(Step::Complete(std::mem::take(&mut self.graph)));
        }
        Ok(Step::Resume)
    }
}

/// Loads the part of history that a merge of `heads` needs into a [`LoadedGraph`].
///
/// Loading stops as soon as some head reaches every root reached so far, i.e. once the graph
/// spans down to the common ancestors. Linear chains are compacted on the way.
pub async fn load_for_merge<K, D, R, S>(
    repository: &R,
    system: &S,
    heads: &BTreeSet<K>,
) -> Result<LoadedGraph<K, D>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    S: OtSystem<D> + ?Sized,
{
    let mut reducer = LoadForMerge {
        system,
        heads: BTreeSet::new(),
        head_roots: BTreeMap::new(),
        root_heads: BTreeMap::new(),
        graph: LoadedGraph::new(),
    };
    reduce(repository, heads, &mut reducer).await
}

struct LoadAll<K, D> {
    graph: LoadedGraph<K, D>,
}

#[async_trait]
impl<K: CommitId, D: Diff> GraphReducer<K, D> for LoadAll<K, D> {
    type Output = Infallible;

    async fn on_commit(
        &mut self,
        commit: &Arc<Commit<K, D>>,
        _: &Frontier<'_, K, D>,
    ) -> Result<Step<Self::Output>, OtError> {
        if self.graph.has_visited(commit.id()) {
            return Ok(Step::Skip);
        }
        self.graph.add_node(commit);
        Ok(Step::Resume)
    }
}

/// Adds all history below `heads` to `graph`, skipping commits it already holds.
pub async fn load_graph<K, D, R>(
    repository: &R,
    heads: &BTreeSet<K>,
    graph: LoadedGraph<K, D>,
) -> Result<LoadedGraph<K, D>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
{
    let mut reducer = LoadAll { graph };
    match reduce(repository, heads, &mut reducer).await {
        Ok(never) => match never {},
        Err(OtError::GraphExhausted) => Ok(reducer.graph),
        Err(err) => Err(err),
    }
}

/// Creates (but does not store) a merge commit of `heads`.
///
/// The commit has every head as a parent, each annotated with the diffs that bring that head
/// to the merged state.
///
/// # Panics
///
/// If fewer than two heads are given.
pub async fn merge<K, D, R, S>(
    repository: &R,
    system: &S,
    heads: &BTreeSet<K>,
) -> Result<Commit<K, D>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    S: OtSystem<D> + ?Sized,
{
    assert!(heads.len() >= 2, "merging needs at least two heads");
    tracing::info!(?heads, "merging");
    let levels = repository.get_levels(heads).await?;
    let mut graph = load_for_merge(repository, system, heads).await?;
    let mut merged = match graph.merge(system, heads) {
        Ok(merged) => merged,
        Err(err) => {
            if tracing::enabled!(tracing::Level::TRACE) {
                tracing::warn!(?heads, %err, graph = %graph.to_graphviz(), "merge failed");
            } else {
                tracing::warn!(?heads, %err, "merge failed");
            }
            return Err(err);
        }
    };
    tracing::trace!(graph = %graph.to_graphviz(), "merged");

    let mut parents = BTreeMap::new();
    for head in heads {
        let level = levels
            .get(head)
            .copied()
            .ok_or_else(|| OtError::commit_not_found(head))?;
        let diffs = merged.remove(head).unwrap_or_default();
        parents.insert(head.clone(), DiffsWithLevel::new(level, diffs));
    }
    let commit = repository.create_commit(parents).await?;
    tracing::info!(id = ?commit.id(), level = commit.level(), "created merge commit");
    Ok(commit)
}

/// Merges `heads` and stores the merge commit, returning its id.
///
/// A single head needs no merge and is returned as is.
pub async fn merge_and_push<K, D, R, S>(
    repository: &R,
    system: &S,
    heads: &BTreeSet<K>,
) -> Result<K, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    S: OtSystem<D> + ?Sized,
{
    if heads.len() == 1 {
        if let Some(head) = heads.first() {
            tracing::debug!(?head, "nothing to merge");
            return Ok(head.clone());
        }
    }
    let commit = merge(repository, system, heads).await?;
    let id = commit.id().clone();
    repository.push(vec![commit]).await?;
    Ok(id)
}

/// Merges the current heads of `repository` and makes the result the only head.
pub async fn merge_and_update_heads<K, D, R, S>(repository: &R, system: &S) -> Result<K, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    S: OtSystem<D> + ?Sized,
{
    let heads = repository.get_heads().await?;
    let id = merge_and_push(repository, system, &heads).await?;
    if !heads.contains(&id) {
        repository
            .update_heads(BTreeSet::from([id.clone()]), heads)
            .await?;
    }
    Ok(id)
}

/// The current head together with the full state at it.
///
/// The state is the nearest saved snapshot below the heads followed by the diffs from that
/// snapshot up to the head.
pub async fn checkout<K, D, R, S>(repository: &R, system: &S) -> Result<FetchData<K, D>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    S: OtSystem<D> + ?Sized,
{
    let heads = repository.get_heads().await?;
    let mut lookup = SnapshotLookup::new(repository);
    let found = find_parent(repository, &heads, ToSquashedList(system), &mut lookup).await?;
    let snapshot = lookup.into_snapshot().unwrap_or_default();
    tracing::debug!(snapshot = ?found.commit, head = ?found.child, "checked out");
    Ok(FetchData::new(
        found.child,
        found.child_level,
        system.squash(&concat(&snapshot, &found.accumulated)),
    ))
}

/// The full state at an arbitrary commit.
pub async fn checkout_at<K, D, R, S>(repository: &R, system: &S, id: &K) -> Result<Vec<D>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    S: OtSystem<D> + ?Sized,
{
    let mut heads = repository.get_heads().await?;
    heads.insert(id.clone());
    let mut lookup = SnapshotLookup::new(repository);
    let found = find_parent(repository, &heads, ToVoid, &mut lookup).await?;
    let snapshot = lookup.into_snapshot().unwrap_or_default();
    let rest = diff(repository, system, &found.commit, id).await?;
    Ok(system.squash(&concat(&snapshot, &rest)))
}

/// Computes and stores the snapshot of commit `id`.
pub async fn save_snapshot<K, D, R, S>(repository: &R, system: &S, id: &K) -> Result<(), OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    S: OtSystem<D> + ?Sized,
{
    let snapshot = checkout_at(repository, system, id).await?;
    repository.save_snapshot(id, snapshot).await
}

/// The current head and the squashed diffs leading to it from `current`.
pub async fn fetch<K, D, R, S>(
    repository: &R,
    system: &S,
    current: &K,
) -> Result<FetchData<K, D>, OtError>
where
    K: CommitId,
    D: Diff,
    R: Repository<K, D> + ?Sized,
    S: OtSystem<D> + ?Sized,
{
    let heads = repository.get_heads().await?;
    let mut is_current = |commit: &Commit<K, D>| commit.id() == current;
    let found = find_parent(repository, &heads, ToSquashedList(system), &mut is_current).await?;
    Ok(FetchData::new(found.child, found.child_level, found.accumulated))
}

struct Missing<'t, T: ?Sized, K, D> {
    target: &'t T,
    commits: Vec<Arc<Commit<K, D>>>,
}

#[async_trait]
impl<'t, K, D, T> GraphReducer<K, D> for Missing<'t, T, K, D>
where
    K: CommitId,
    D: Diff,
    T: Repository<K, D> + ?Sized,
{
    type Output = Infallible;

    async fn on_commit(
        &mut self,
        commit: &Arc<Commit<K, D>>,
        _: &Frontier<'_, K, D>,
    ) -> Result<Step<Self::Output>, OtError> {
        if self.target.has_commit(commit.id()).await? {
            return Ok(Step::Skip);
        }
        self.commits.push(Arc::clone(commit));
        Ok(Step::Resume)
    }
}

/// Replicates the history of `from` into `to` and mirrors its heads.
///
/// Commits `to` already has are not copied, and neither is anything below them.
pub async fn copy<K, D, F, T>(from: &F, to: &T) -> Result<(), OtError>
where
    K: CommitId,
    D: Diff,
    F: Repository<K, D> + ?Sized,
    T: Repository<K, D> + ?Sized,
{
    let heads = from.get_heads().await?;
    let mut missing = Missing {
        target: to,
        commits: Vec::new(),
    };
    match reduce(from, &heads, &mut missing).await {
        Ok(never) => match never {},
        Err(OtError::GraphExhausted) => {}
        Err(err) => return Err(err),
    }

    // Parents before children.
    let mut commits = missing.commits;
    commits.sort_by_key(|commit| commit.level());
    tracing::debug!(copied = commits.len(), ?heads, "copying commits");
    to.push(commits.iter().map(|commit| (**commit).clone()).collect())
        .await?;

    let stale = to.get_heads().await?.difference(&heads).cloned().collect();
    to.update_heads(heads, stale).await
}
