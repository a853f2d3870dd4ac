// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The diff algebra.
//!
//! An [`OtSystem`] knows how to reconcile two diff sequences that were applied to the same base
//! state. The crate never looks inside a diff; everything it needs is expressed through the four
//! operations of this trait:
//!
//! - [`transform`](OtSystem::transform) turns two divergent sequences `L` and `R` into a pair
//!   `(left, right)` such that applying `L ++ left` and `R ++ right` to the base state yields the
//!   same state,
//! - [`squash`](OtSystem::squash) compacts a sequence into an equivalent, usually shorter one,
//! - [`invert`](OtSystem::invert) produces the sequence that undoes a sequence,
//! - [`is_empty`](OtSystem::is_empty) recognizes diffs that do nothing.
//!
//! Most algebras are written as a closed enum of diff variants with one `match` per operation.
//! See [`DiffAlgebra`] and [`PairwiseSystem`] for that route, and [`MergedSystem`] for combining
//! independent algebras over a composite diff type.

use std::fmt;

mod merged;
mod pairwise;

pub use merged::MergedSystem;
pub use pairwise::{DiffAlgebra, PairwiseSystem};

/// Which side wins when two diffs cannot be commuted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum Resolution {
    /// Keep the left side and discard the right one.
    TakeLeft,
    /// Keep the right side and discard the left one.
    TakeRight,
}

impl Resolution {
    pub fn swap(self) -> Self {
        match self {
            Self::TakeLeft => Self::TakeRight,
            Self::TakeRight => Self::TakeLeft,
        }
    }
}

/// Complementary diff sequences that make two divergent sides converge.
///
/// `left` is appended after the left input and `right` after the right input.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct Transformed<D> {
    pub left: Vec<D>,
    pub right: Vec<D>,
}

impl<D> Transformed<D> {
    pub fn new(left: Vec<D>, right: Vec<D>) -> Self {
        Self { left, right }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }
}

/// Outcome of transforming two diffs (or diff sequences) against each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformResult<D> {
    /// The diffs commute; see [`Transformed`].
    Resolved(Transformed<D>),
    /// The diffs cannot be commuted; one side has to be discarded.
    Conflict(Resolution),
}

impl<D> TransformResult<D> {
    /// Both sides need extra diffs to converge.
    pub fn of(left: Vec<D>, right: Vec<D>) -> Self {
        Self::Resolved(Transformed::new(left, right))
    }

    /// Only the left side needs to catch up.
    pub fn left(left: Vec<D>) -> Self {
        Self::of(left, Vec::new())
    }

    /// Only the right side needs to catch up.
    pub fn right(right: Vec<D>) -> Self {
        Self::of(Vec::new(), right)
    }

    /// Both sides already agree.
    pub fn empty() -> Self {
        Self::of(Vec::new(), Vec::new())
    }

    pub fn conflict(resolution: Resolution) -> Self {
        Self::Conflict(resolution)
    }

    /// Mirrors a result computed for `(a, b)` into the result for `(b, a)`.
    pub fn swap(self) -> Self {
        match self {
            Self::Resolved(Transformed { left, right }) => Self::of(right, left),
            Self::Conflict(resolution) => Self::Conflict(resolution.swap()),
        }
    }
}

/// Raised when two diffs cannot be transformed against each other at all, for example because
/// they were not applied to the same base state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot transform {left} against {right}")]
pub struct TransformError {
    left: String,
    right: String,
}

impl TransformError {
    pub fn new(left: &impl fmt::Debug, right: &impl fmt::Debug) -> Self {
        Self {
            left: format!("{left:?}"),
            right: format!("{right:?}"),
        }
    }
}

/// The operations the commit graph algorithms need from a diff type.
pub trait OtSystem<D>: Send + Sync {
    /// Transforms two divergent diff sequences against each other.
    ///
    /// Conflicts are resolved by discarding the losing side: its diffs are inverted and the
    /// winning side is replayed on top.
    fn transform(&self, left: &[D], right: &[D]) -> Result<Transformed<D>, TransformError>;

    /// Compacts adjacent diffs, dropping those that end up empty.
    fn squash(&self, ops: &[D]) -> Vec<D>;

    /// Returns the sequence that, appended after `ops`, undoes it.
    fn invert(&self, ops: &[D]) -> Vec<D>;

    fn is_empty(&self, op: &D) -> bool;

    /// Whether every diff of `ops` is empty.
    fn all_empty(&self, ops: &[D]) -> bool {
        ops.iter().all(|op| self.is_empty(op))
    }
}

impl<D, S> OtSystem<D> for std::sync::Arc<S>
where
    S: OtSystem<D> + ?Sized,
{
    fn transform(&self, left: &[D], right: &[D]) -> Result<Transformed<D>, TransformError> {
        (**self).transform(left, right)
    }

    fn squash(&self, ops: &[D]) -> Vec<D> {
        (**self).squash(ops)
    }

    fn invert(&self, ops: &[D]) -> Vec<D> {
        (**self).invert(ops)
    }

    fn is_empty(&self, op: &D) -> bool {
        (**self).is_empty(op)
    }
}

/// Applies a conflict resolution to the two inputs of a transform.
pub(crate) fn resolve_conflict<D: Clone, S: OtSystem<D> + ?Sized>(
    system: &S,
    left: &[D],
    right: &[D],
    resolution: Resolution,
) -> Transformed<D> {
    match resolution {
        Resolution::TakeLeft => {
            let mut ops = system.invert(right);
            ops.extend_from_slice(left);
            Transformed::new(Vec::new(), system.squash(&ops))
        }
        Resolution::TakeRight => {
            let mut ops = system.invert(left);
            ops.extend_from_slice(right);
            Transformed::new(system.squash(&ops), Vec::new())
        }
    }
}

/// Concatenates two diff sequences.
pub(crate) fn concat<D: Clone>(first: &[D], second: &[D]) -> Vec<D> {
    let mut ops = Vec::with_capacity(first.len() + second.len());
    ops.extend_from_slice(first);
    ops.extend_from_slice(second);
    ops
}
