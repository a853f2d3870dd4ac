// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! A counter algebra shared by the unit tests.
//!
//! The document is a single integer. `Add` commutes with everything, `Set` records the value it
//! overwrites so that it can be inverted, and concurrent `Set`s resolve to the smaller value.

use crate::{
    BoxError, DiffAlgebra, OtState, TransformError, TransformResult,
    system::PairwiseSystem,
};
use quickcheck::{Arbitrary, Gen};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TestOp {
    Add(i64),
    Set { prev: i64, next: i64 },
}

pub(crate) fn add(delta: i64) -> TestOp {
    TestOp::Add(delta)
}

pub(crate) fn set(prev: i64, next: i64) -> TestOp {
    TestOp::Set { prev, next }
}

pub(crate) const SYSTEM: PairwiseSystem<TestOp> = PairwiseSystem::new();

fn add_vs_set(delta: i64, prev: i64, next: i64) -> TransformResult<TestOp> {
    TransformResult::left(vec![set(prev + delta, next)])
}

impl DiffAlgebra for TestOp {
    fn transform_pair(left: &Self, right: &Self) -> Result<TransformResult<Self>, TransformError> {
        use TestOp::{Add, Set};
        Ok(match (*left, *right) {
            (Add(l), Add(r)) => TransformResult::of(vec![add(r)], vec![add(l)]),
            (Add(delta), Set { prev, next }) => add_vs_set(delta, prev, next),
            (Set { prev, next }, Add(delta)) => add_vs_set(delta, prev, next).swap(),
            (Set { prev: lp, next: ln }, Set { prev: rp, next: rn }) => {
                if lp != rp {
                    return Err(TransformError::new(left, right));
                }
                if ln > rn {
                    TransformResult::left(vec![set(ln, rn)])
                } else if ln < rn {
                    TransformResult::right(vec![set(rn, ln)])
                } else {
                    TransformResult::empty()
                }
            }
        })
    }

    fn squash_pair(first: &Self, second: &Self) -> Option<Self> {
        use TestOp::{Add, Set};
        Some(match (*first, *second) {
            (Add(a), Add(b)) => add(a + b),
            (Set { prev, .. }, Set { next, .. }) => set(prev, next),
            (Add(delta), Set { prev, next }) => set(prev - delta, next),
            (Set { prev, next }, Add(delta)) => set(prev, next + delta),
        })
    }

    fn inverse(&self) -> Self {
        match *self {
            TestOp::Add(delta) => add(-delta),
            TestOp::Set { prev, next } => set(next, prev),
        }
    }

    fn is_empty(&self) -> bool {
        match *self {
            TestOp::Add(delta) => delta == 0,
            TestOp::Set { prev, next } => prev == next,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct TestState {
    value: i64,
}

impl TestState {
    pub(crate) fn replay(ops: &[TestOp]) -> Self {
        let mut state = Self::default();
        state.apply_all(ops).expect("history is consistent");
        state
    }

    pub(crate) fn apply_all(&mut self, ops: &[TestOp]) -> Result<(), BoxError> {
        ops.iter().try_for_each(|op| self.apply(op))
    }

    pub(crate) fn value(&self) -> i64 {
        self.value
    }
}

impl OtState<TestOp> for TestState {
    fn init(&mut self) {
        self.value = 0;
    }

    fn apply(&mut self, diff: &TestOp) -> Result<(), BoxError> {
        match *diff {
            TestOp::Add(delta) => self.value += delta,
            TestOp::Set { prev, next } => {
                if prev != self.value {
                    return Err(format!("expected {prev}, found {}", self.value).into());
                }
                self.value = next;
            }
        }
        Ok(())
    }
}

/// A diff sequence that applies cleanly to the state it starts from.
#[derive(Debug, Clone)]
pub(crate) struct History(pub Vec<TestOp>);

impl History {
    fn generate(mut value: i64, len: usize, mut next: impl FnMut() -> i64) -> Self {
        let mut ops = Vec::with_capacity(len);
        for _ in 0..len {
            let op = if next().rem_euclid(2) == 0 {
                add(next())
            } else {
                set(value, next())
            };
            value = match op {
                TestOp::Add(delta) => value + delta,
                TestOp::Set { next, .. } => next,
            };
            ops.push(op);
        }
        Self(ops)
    }

    /// A short history starting at `start`, derived deterministically from `seed`.
    pub(crate) fn continue_from(start: i64, seed: u64) -> Self {
        let mut state = seed;
        let mut next = move || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) % 41) as i64 - 20
        };
        let len = next().rem_euclid(6) as usize;
        Self::generate(start, len, next)
    }
}

impl Arbitrary for History {
    fn arbitrary(g: &mut Gen) -> Self {
        let len = usize::arbitrary(g) % g.size().max(1);
        Self::generate(0, len, || i64::from(i8::arbitrary(g)))
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        // Every prefix of a consistent history is consistent.
        let ops = self.0.clone();
        Box::new((0..ops.len()).rev().map(move |len| Self(ops[..len].to_vec())))
    }
}
