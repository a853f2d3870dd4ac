// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The in-memory graph that merges are computed on.
//!
//! A [`LoadedGraph`] mirrors the part of the commit graph between a set of heads and their common
//! ancestors. Nodes are either commits or synthetic merge nodes created while resolving a merge.
//! Each node knows its parents (with the diffs leading from them) and its children.
//!
//! Linear chains are compacted while loading: a commit with exactly one parent and exactly one
//! child is spliced out, and the diffs of its two edges are squashed into one edge. Merge cost
//! therefore grows with how much history *branches*, not with how long it is.
//!
//! # The merge
//!
//! [`LoadedGraph::merge`] reduces a set of heads pairwise. Among the heads that are not ancestors
//! of other heads, it picks the one reaching the fewest roots as the *pivot*, recursively merges
//! the pivot's parents together with the remaining heads, and then joins the pivot with that
//! merge:
//!
//! - for a pivot with one parent, the edge `parent -> pivot` is transformed against the path
//!   `parent -> merge`, which yields the edges of a new merge node,
//! - for a pivot with several parents (itself a merge), the pivot is rewound to one of its parents
//!   and replayed forward to the merge.
//!
//! Finally the diffs from every original head to the last merge node are collected and squashed.

use crate::{
    OtError, OtRandomState,
    commit::{Commit, CommitId, Diff},
    create_set,
    repository::Edge,
    system::{OtSystem, concat},
};
use smallvec::SmallVec;
use std::{
    collections::{BTreeMap, BTreeSet, BinaryHeap, HashSet},
    fmt::{self, Write as _},
};

/// A node of a [`LoadedGraph`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GraphNode<K> {
    /// A commit loaded from (or referenced by) the repository.
    Commit(K),
    /// A merge node created while resolving a merge.
    Merge(u32),
}

impl<K> GraphNode<K> {
    pub fn as_commit(&self) -> Option<&K> {
        match self {
            Self::Commit(id) => Some(id),
            Self::Merge(_) => None,
        }
    }
}

impl<K: fmt::Debug> fmt::Display for GraphNode<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit(id) => write!(f, "{id:?}"),
            Self::Merge(n) => write!(f, "merge{n}"),
        }
    }
}

struct Node<K, D> {
    level: Option<u64>,
    parents: SmallVec<[(GraphNode<K>, Vec<D>); 2]>,
    children: SmallVec<[GraphNode<K>; 2]>,
}

impl<K, D> Default for Node<K, D> {
    fn default() -> Self {
        Self {
            level: None,
            parents: SmallVec::new(),
            children: SmallVec::new(),
        }
    }
}

/// An in-memory, compactable mirror of part of a commit graph.
pub struct LoadedGraph<K, D> {
    nodes: BTreeMap<GraphNode<K>, Node<K, D>>,
    visited: HashSet<K, OtRandomState>,
    next_merge: u32,
}

impl<K: CommitId, D: Diff> Default for LoadedGraph<K, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CommitId, D: Diff> LoadedGraph<K, D> {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            visited: create_set(),
            next_merge: 0,
        }
    }

    /// Builds a graph from explicit edges, computing levels from the roots up.
    pub fn from_edges(edges: impl IntoIterator<Item = Edge<K, D>>) -> Self {
        let mut graph = Self::new();
        for edge in edges {
            graph.add_edge(
                GraphNode::Commit(edge.parent),
                GraphNode::Commit(edge.child),
                edge.diffs,
            );
        }
        let ids: Vec<_> = graph.nodes.keys().cloned().collect();
        for id in &ids {
            graph.compute_level(id);
        }
        graph
    }

    fn compute_level(&mut self, node: &GraphNode<K>) -> u64 {
        if let Some(level) = self.nodes.get(node).and_then(|n| n.level) {
            return level;
        }
        let parents: Vec<_> = self.parent_nodes(node).cloned().collect();
        let mut level = 1;
        for parent in &parents {
            level = level.max(self.compute_level(parent) + 1);
        }
        self.set_level(node, level);
        level
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &GraphNode<K>) -> bool {
        self.nodes.contains_key(node)
    }

    /// Whether `id` was added through [`add_node`](Self::add_node), even if it has been
    /// compacted away since.
    pub fn has_visited(&self, id: &K) -> bool {
        self.visited.contains(id)
    }

    pub fn level(&self, node: &GraphNode<K>) -> Option<u64> {
        self.nodes.get(node).and_then(|n| n.level)
    }

    pub fn set_level(&mut self, node: &GraphNode<K>, level: u64) {
        self.nodes.entry(node.clone()).or_default().level = Some(level);
    }

    /// Adds a loaded commit together with the edges from all of its parents.
    pub fn add_node(&mut self, commit: &Commit<K, D>) {
        let node = GraphNode::Commit(commit.id().clone());
        self.visited.insert(commit.id().clone());
        self.set_level(&node, commit.level());
        for (parent, diffs) in commit.parents() {
            self.add_edge(GraphNode::Commit(parent.clone()), node.clone(), diffs.clone());
        }
    }

    /// Adds the edge `parent -> child`, creating missing nodes. An existing edge between the two
    /// is replaced.
    pub fn add_edge(&mut self, parent: GraphNode<K>, child: GraphNode<K>, diffs: Vec<D>) {
        let child_node = self.nodes.entry(child.clone()).or_default();
        match child_node.parents.iter_mut().find(|(p, _)| *p == parent) {
            Some((_, existing)) => *existing = diffs,
            None => child_node.parents.push((parent.clone(), diffs)),
        }
        let parent_node = self.nodes.entry(parent).or_default();
        if !parent_node.children.contains(&child) {
            parent_node.children.push(child);
        }
    }

    /// Removes `node` and every edge touching it.
    pub fn remove_node(&mut self, node: &GraphNode<K>) {
        let Some(removed) = self.nodes.remove(node) else {
            return;
        };
        for (parent, _) in &removed.parents {
            if let Some(parent) = self.nodes.get_mut(parent) {
                parent.children.retain(|c| c != node);
            }
        }
        for child in &removed.children {
            if let Some(child) = self.nodes.get_mut(child) {
                child.parents.retain(|(p, _)| p != node);
            }
        }
    }

    /// Parents of `node` with the diffs leading from each of them to `node`.
    ///
    /// Nodes that are unknown or have no parents yield nothing.
    pub fn parents<'a>(
        &'a self,
        node: &GraphNode<K>,
    ) -> impl Iterator<Item = (&'a GraphNode<K>, &'a [D])> + use<'a, K, D> {
        self.nodes
            .get(node)
            .into_iter()
            .flat_map(|n| n.parents.iter().map(|(p, d)| (p, d.as_slice())))
    }

    fn parent_nodes<'a>(
        &'a self,
        node: &GraphNode<K>,
    ) -> impl Iterator<Item = &'a GraphNode<K>> + use<'a, K, D> {
        self.parents(node).map(|(p, _)| p)
    }

    pub fn children<'a>(
        &'a self,
        node: &GraphNode<K>,
    ) -> impl Iterator<Item = &'a GraphNode<K>> + use<'a, K, D> {
        self.nodes
            .get(node)
            .into_iter()
            .flat_map(|n| n.children.iter())
    }

    /// Nodes without children.
    pub fn tips(&self) -> BTreeSet<GraphNode<K>> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.children.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The parentless ancestors of `node`. A node that is unknown or has no parents is its own
    /// root.
    pub fn find_roots(&self, node: &GraphNode<K>) -> BTreeSet<GraphNode<K>> {
        let mut roots = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut stack = vec![node.clone()];
        while let Some(node) = stack.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            let mut parents = self.parent_nodes(&node).peekable();
            if parents.peek().is_none() {
                roots.insert(node);
            } else {
                stack.extend(parents.cloned());
            }
        }
        roots
    }

    /// Drops from `nodes` every node that is an ancestor of another node of the set.
    pub fn exclude_parents(&self, nodes: BTreeSet<GraphNode<K>>) -> BTreeSet<GraphNode<K>> {
        if nodes.len() <= 1 {
            return nodes;
        }
        let mut result = nodes.clone();
        let mut visited = BTreeSet::new();
        let mut stack: Vec<_> = nodes.into_iter().collect();
        while let Some(node) = stack.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            for parent in self.parent_nodes(&node) {
                result.remove(parent);
                if !visited.contains(parent) {
                    stack.push(parent.clone());
                }
            }
        }
        result
    }

    /// Splices `node` out if it has exactly one parent and one child, squashing the diffs of the
    /// two edges into a single edge. Returns whether the node was removed.
    pub fn compact<S>(&mut self, system: &S, node: &GraphNode<K>) -> bool
    where
        S: OtSystem<D> + ?Sized,
    {
        let Some(data) = self.nodes.get(node) else {
            return false;
        };
        let ([(parent, to_node)], [child]) = (data.parents.as_slice(), data.children.as_slice())
        else {
            return false;
        };
        let Some(child_node) = self.nodes.get(child) else {
            return false;
        };
        if child_node.parents.iter().any(|(p, _)| p == parent) {
            return false;
        }
        let Some((_, from_node)) = child_node.parents.iter().find(|(p, _)| p == node) else {
            return false;
        };

        let (parent, child) = (parent.clone(), child.clone());
        let diffs = system.squash(&concat(to_node, from_node));
        tracing::trace!(%node, %parent, %child, "compacting chain");

        self.nodes.remove(node);
        if let Some(child_node) = self.nodes.get_mut(&child) {
            for entry in child_node.parents.iter_mut().filter(|(p, _)| p == node) {
                *entry = (parent.clone(), diffs.clone());
            }
        }
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            for entry in parent_node.children.iter_mut().filter(|c| *c == node) {
                *entry = child.clone();
            }
        }
        true
    }

    /// Diffs along some path from `parent` up to `child`.
    pub fn find_path(&self, parent: &GraphNode<K>, child: &GraphNode<K>) -> Option<Vec<D>> {
        if parent == child {
            return Some(Vec::new());
        }
        let mut paths = BTreeMap::from([(child.clone(), Vec::new())]);
        let mut visited = BTreeSet::new();
        let mut queue = BinaryHeap::from([(self.level(child), child.clone())]);
        while let Some((_, node)) = queue.pop() {
            let Some(to_child) = paths.remove(&node) else {
                continue;
            };
            if !visited.insert(node.clone()) {
                continue;
            }
            for (node_parent, diffs) in self.parents(&node) {
                if visited.contains(node_parent) || paths.contains_key(node_parent) {
                    continue;
                }
                let path = concat(diffs, &to_child);
                if node_parent == parent {
                    return Some(path);
                }
                paths.insert(node_parent.clone(), path);
                queue.push((self.level(node_parent), node_parent.clone()));
            }
        }
        None
    }

    /// Computes, for each of `heads`, the diffs that bring it to the merged state.
    ///
    /// Heads that are ancestors of other heads get a result too.
    ///
    /// # Panics
    ///
    /// If fewer than two heads are given.
    pub fn merge<S>(
        &mut self,
        system: &S,
        heads: &BTreeSet<K>,
    ) -> Result<BTreeMap<K, Vec<D>>, OtError>
    where
        S: OtSystem<D> + ?Sized,
    {
        assert!(heads.len() >= 2, "merging needs at least two heads");
        let nodes: BTreeSet<_> = heads.iter().cloned().map(GraphNode::Commit).collect();
        if let Some(missing) = nodes.iter().find(|node| !self.contains(node)) {
            return Err(OtError::Merge(format!("head {missing} is not loaded")));
        }

        let merge_node = self.do_merge(system, self.exclude_parents(nodes.clone()))?;

        let mut paths = BTreeMap::from([(merge_node.clone(), Vec::new())]);
        let mut visited = BTreeSet::new();
        let mut result = BTreeMap::new();
        let mut queue = BinaryHeap::from([(self.level(&merge_node), merge_node)]);
        while let Some((_, node)) = queue.pop() {
            let Some(path) = paths.remove(&node) else {
                continue;
            };
            if !visited.insert(node.clone()) {
                continue;
            }
            for (parent, diffs) in self.parents(&node) {
                if visited.contains(parent) || paths.contains_key(parent) {
                    continue;
                }
                paths.insert(parent.clone(), concat(diffs, &path));
                queue.push((self.level(parent), parent.clone()));
            }
            if let GraphNode::Commit(id) = &node {
                if heads.contains(id) {
                    result.insert(id.clone(), system.squash(&path));
                    if result.len() == heads.len() {
                        return Ok(result);
                    }
                }
            }
        }
        Err(OtError::Merge(format!(
            "heads {:?} do not reach the merge",
            heads.iter().filter(|h| !result.contains_key(*h)).collect::<Vec<_>>()
        )))
    }

    fn do_merge<S>(
        &mut self,
        system: &S,
        nodes: BTreeSet<GraphNode<K>>,
    ) -> Result<GraphNode<K>, OtError>
    where
        S: OtSystem<D> + ?Sized,
    {
        let Some(pivot) = nodes.iter().min_by_key(|n| self.find_roots(n).len()).cloned() else {
            return Err(OtError::Merge("nothing to merge".to_owned()));
        };
        if nodes.len() == 1 {
            return Ok(pivot);
        }

        let pivot_parents: SmallVec<[(GraphNode<K>, Vec<D>); 2]> = self
            .parents(&pivot)
            .map(|(p, d)| (p.clone(), d.to_vec()))
            .collect();
        let Some((parent, parent_to_pivot)) = pivot_parents.first().cloned() else {
            return Err(OtError::Merge(format!(
                "graph cannot be merged: {pivot} has no common ancestor with the other heads"
            )));
        };

        let mut recursive: BTreeSet<_> = pivot_parents.iter().map(|(p, _)| p.clone()).collect();
        recursive.extend(nodes.into_iter().filter(|n| *n != pivot));
        let merge_node = self.do_merge(system, self.exclude_parents(recursive))?;
        let parent_to_merge = self.find_path(&parent, &merge_node).ok_or_else(|| {
            OtError::Merge(format!("no path from {parent} to {merge_node}"))
        })?;

        let result = GraphNode::Merge(self.next_merge);
        self.next_merge += 1;
        if pivot_parents.len() > 1 {
            let rewind = concat(&system.invert(&parent_to_pivot), &parent_to_merge);
            self.add_edge(merge_node.clone(), result.clone(), Vec::new());
            self.add_edge(pivot.clone(), result.clone(), system.squash(&rewind));
        } else {
            let transformed = system.transform(&parent_to_pivot, &parent_to_merge)?;
            self.add_edge(merge_node.clone(), result.clone(), transformed.right);
            self.add_edge(pivot.clone(), result.clone(), transformed.left);
        }
        let level = self.level(&pivot).max(self.level(&merge_node)).unwrap_or(0) + 1;
        self.set_level(&result, level);
        tracing::trace!(%pivot, %merge_node, %result, "merged pivot");
        Ok(result)
    }

    /// Renders the graph in GraphViz `dot` syntax, edges pointing from parent to child.
    pub fn to_graphviz(&self) -> String {
        fn quoted(s: impl fmt::Display) -> String {
            format!("{:?}", s.to_string())
        }

        let mut out = String::from("digraph {\n");
        for (node, data) in &self.nodes {
            if let GraphNode::Merge(_) = node {
                let _ = writeln!(out, "    {} [shape=box];", quoted(node));
            }
            for (parent, diffs) in &data.parents {
                let _ = writeln!(
                    out,
                    "    {} -> {} [label={:?}];",
                    quoted(parent),
                    quoted(node),
                    format!("{diffs:?}")
                );
            }
        }
        out.push('}');
        out
    }
}

impl<K: fmt::Debug, D> fmt::Debug for LoadedGraph<K, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedGraph")
            .field("nodes", &self.nodes.len())
            .field("visited", &self.visited.len())
            .finish_non_exhaustive()
    }
}
