// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Lifting per-diff rules into a full [`OtSystem`].
//!
//! A [`DiffAlgebra`] describes how *two single diffs* interact. [`PairwiseSystem`] turns that into
//! the sequence-level operations by recursing over both sequences while preserving application
//! order:
//!
//! - a single left diff is transformed against the head of the right sequence, and whatever the
//!   left side still has to apply is then transformed against the rest of the right sequence,
//! - longer left sequences are split into their first diff and the remainder, the remainder being
//!   transformed against what the first diff produced.
//!
//! A conflict anywhere in the recursion aborts it and is resolved once, on the whole input.

use super::{OtSystem, TransformError, TransformResult, Transformed, concat, resolve_conflict};
use crate::commit::Diff;
use std::{fmt, marker::PhantomData};

/// Rules for a closed set of diff variants, written as explicit matches over variant pairs.
///
/// Pairs that only differ by order are usually written once; the mirrored arm can reuse it
/// through [`TransformResult::swap`]:
///
/// ```rust
/// # use otkit::{DiffAlgebra, TransformError, TransformResult};
/// #[derive(Debug, Clone, PartialEq)]
/// enum Op {
///     Add(i64),
///     Set { prev: i64, next: i64 },
/// }
///
/// fn add_vs_set(add: i64, prev: i64, next: i64) -> TransformResult<Op> {
///     TransformResult::left(vec![Op::Set { prev: prev + add, next }])
/// }
///
/// impl DiffAlgebra for Op {
///     fn transform_pair(left: &Self, right: &Self) -> Result<TransformResult<Self>, TransformError> {
///         Ok(match (left, right) {
///             (Op::Add(l), Op::Add(r)) => TransformResult::of(vec![Op::Add(*r)], vec![Op::Add(*l)]),
///             (Op::Add(a), Op::Set { prev, next }) => add_vs_set(*a, *prev, *next),
///             (Op::Set { prev, next }, Op::Add(a)) => add_vs_set(*a, *prev, *next).swap(),
///             (Op::Set { .. }, Op::Set { .. }) => return Err(TransformError::new(left, right)),
///         })
///     }
///
///     fn inverse(&self) -> Self {
///         match self {
///             Op::Add(delta) => Op::Add(-delta),
///             Op::Set { prev, next } => Op::Set { prev: *next, next: *prev },
///         }
///     }
/// }
/// ```
pub trait DiffAlgebra: Diff {
    /// Transforms `left` against `right`, both applied to the same base state.
    fn transform_pair(left: &Self, right: &Self) -> Result<TransformResult<Self>, TransformError>;

    /// Combines `first` followed by `second` into a single diff, if the pair allows it.
    #[expect(unused_variables)]
    fn squash_pair(first: &Self, second: &Self) -> Option<Self> {
        None
    }

    /// The diff undoing `self`.
    fn inverse(&self) -> Self;

    /// Whether applying `self` changes nothing.
    fn is_empty(&self) -> bool {
        false
    }
}

/// The [`OtSystem`] of a [`DiffAlgebra`].
pub struct PairwiseSystem<D> {
    _diff: PhantomData<fn() -> D>,
}

impl<D> PairwiseSystem<D> {
    pub const fn new() -> Self {
        Self { _diff: PhantomData }
    }
}

impl<D> Default for PairwiseSystem<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Clone for PairwiseSystem<D> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<D> Copy for PairwiseSystem<D> {}

impl<D> fmt::Debug for PairwiseSystem<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairwiseSystem")
            .field("diff", &std::any::type_name::<D>())
            .finish()
    }
}

impl<D: DiffAlgebra> PairwiseSystem<D> {
    fn do_transform(left: &[D], right: &[D]) -> Result<TransformResult<D>, TransformError> {
        match (left, right) {
            ([], []) => Ok(TransformResult::empty()),
            ([], right) => Ok(TransformResult::left(right.to_vec())),
            (left, []) => Ok(TransformResult::right(left.to_vec())),
            ([single], [first, rest @ ..]) => {
                let head = match D::transform_pair(single, first)? {
                    TransformResult::Resolved(t) => t,
                    conflict => return Ok(conflict),
                };
                let tail = match Self::do_transform(&head.right, rest)? {
                    TransformResult::Resolved(t) => t,
                    conflict => return Ok(conflict),
                };
                Ok(TransformResult::of(concat(&head.left, &tail.left), tail.right))
            }
            ([first, rest @ ..], right) => {
                let head = match Self::do_transform(std::slice::from_ref(first), right)? {
                    TransformResult::Resolved(t) => t,
                    conflict => return Ok(conflict),
                };
                let tail = match Self::do_transform(rest, &head.left)? {
                    TransformResult::Resolved(t) => t,
                    conflict => return Ok(conflict),
                };
                Ok(TransformResult::of(tail.left, concat(&head.right, &tail.right)))
            }
        }
    }
}

impl<D: DiffAlgebra> OtSystem<D> for PairwiseSystem<D> {
    fn transform(&self, left: &[D], right: &[D]) -> Result<Transformed<D>, TransformError> {
        match Self::do_transform(left, right)? {
            TransformResult::Resolved(transformed) => Ok(transformed),
            TransformResult::Conflict(resolution) => {
                tracing::debug!(?resolution, "resolving transform conflict");
                Ok(resolve_conflict(self, left, right, resolution))
            }
        }
    }

    fn squash(&self, ops: &[D]) -> Vec<D> {
        let mut result = Vec::with_capacity(ops.len());
        let mut ops = ops.iter();
        let Some(first) = ops.next() else {
            return result;
        };
        let mut current = first.clone();
        for op in ops {
            match D::squash_pair(&current, op) {
                Some(squashed) => current = squashed,
                None => {
                    let done = std::mem::replace(&mut current, op.clone());
                    if !done.is_empty() {
                        result.push(done);
                    }
                }
            }
        }
        if !current.is_empty() {
            result.push(current);
        }
        result
    }

    fn invert(&self, ops: &[D]) -> Vec<D> {
        ops.iter().rev().map(D::inverse).collect()
    }

    fn is_empty(&self, op: &D) -> bool {
        op.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{
        TestOp::{self, Add, Set},
        History, TestState, add, set,
    };

    const SYSTEM: PairwiseSystem<TestOp> = PairwiseSystem::new();

    fn converges(history: &[TestOp], left: &[TestOp], right: &[TestOp]) -> bool {
        let Ok(t) = SYSTEM.transform(left, right) else {
            return false;
        };
        let base = TestState::replay(history);
        let mut l = base.clone();
        let mut r = base;
        l.apply_all(left).is_ok()
            && l.apply_all(&t.left).is_ok()
            && r.apply_all(right).is_ok()
            && r.apply_all(&t.right).is_ok()
            && l == r
    }

    #[test]
    fn empty_sides_are_complements() {
        let t = SYSTEM.transform(&[], &[add(1), add(2)]).unwrap();
        assert_eq!(t.left, vec![add(1), add(2)]);
        assert!(t.right.is_empty());

        let t = SYSTEM.transform(&[add(3)], &[]).unwrap();
        assert!(t.left.is_empty());
        assert_eq!(t.right, vec![add(3)]);

        assert!(SYSTEM.transform(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn adds_commute() {
        let t = SYSTEM.transform(&[add(5)], &[add(3)]).unwrap();
        assert_eq!(t.left, vec![add(3)]);
        assert_eq!(t.right, vec![add(5)]);
    }

    #[test]
    fn set_wins_over_add() {
        let t = SYSTEM.transform(&[add(5)], &[set(0, 10)]).unwrap();
        assert_eq!(t.left, vec![set(5, 10)]);
        assert!(t.right.is_empty());

        let t = SYSTEM.transform(&[set(0, 10)], &[add(5)]).unwrap();
        assert!(t.left.is_empty());
        assert_eq!(t.right, vec![set(5, 10)]);
    }

    #[test]
    fn smaller_set_wins() {
        let t = SYSTEM.transform(&[set(0, 15)], &[set(0, 10)]).unwrap();
        assert_eq!(t.left, vec![set(15, 10)]);
        assert!(t.right.is_empty());
        assert!(converges(&[], &[set(0, 15)], &[set(0, 10)]));
    }

    #[test]
    fn mismatched_sets_fail() {
        assert!(SYSTEM.transform(&[set(1, 2)], &[set(0, 3)]).is_err());
    }

    #[test]
    fn sequences_converge() {
        let left = [add(1), set(1, 7), add(2)];
        let right = [add(10), add(-3), set(7, 4)];
        assert!(converges(&[], &left, &right));
        assert!(converges(&[], &right, &left));
    }

    #[test]
    fn squash_folds_adjacent_diffs() {
        assert_eq!(SYSTEM.squash(&[add(1), add(2), add(3)]), vec![add(6)]);
        assert_eq!(SYSTEM.squash(&[add(2), set(2, 5)]), vec![set(0, 5)]);
        assert_eq!(SYSTEM.squash(&[set(0, 5), add(1)]), vec![set(0, 6)]);
        assert_eq!(SYSTEM.squash(&[add(1), add(-1)]), Vec::<TestOp>::new());
        assert_eq!(SYSTEM.squash(&[]), Vec::<TestOp>::new());
    }

    #[test]
    fn invert_reverses_and_inverts() {
        assert_eq!(
            SYSTEM.invert(&[add(1), set(1, 4)]),
            vec![Set { prev: 4, next: 1 }, Add(-1)]
        );
    }

    #[quickcheck]
    fn transform_converges(base: History, left_seed: u64, right_seed: u64) -> bool {
        let start = TestState::replay(&base.0).value();
        let left = History::continue_from(start, left_seed);
        let right = History::continue_from(start, right_seed);
        converges(&base.0, &left.0, &right.0)
    }

    #[quickcheck]
    fn invert_cancels(history: History) -> bool {
        let ops = history.0;
        let mut forward = ops.clone();
        forward.extend(SYSTEM.invert(&ops));
        let mut backward = SYSTEM.invert(&ops);
        backward.extend(ops);
        SYSTEM.all_empty(&SYSTEM.squash(&forward)) && SYSTEM.all_empty(&SYSTEM.squash(&backward))
    }

    #[quickcheck]
    fn squash_is_idempotent(history: History) -> bool {
        let once = SYSTEM.squash(&history.0);
        SYSTEM.squash(&once) == once
    }

    #[quickcheck]
    fn squash_preserves_effect(history: History) -> bool {
        TestState::replay(&history.0) == TestState::replay(&SYSTEM.squash(&history.0))
    }
}
