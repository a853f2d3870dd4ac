// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Composite algebra over independent document parts.

use super::{OtSystem, TransformError, Transformed};

/// An [`OtSystem`] over a composite diff `D` made of two independent parts.
///
/// Every operation splits the composite diffs into their parts, hands each part to its own
/// algebra, and joins the results back into at most one composite diff. Parts never interact, so
/// a transform succeeds iff both part transforms succeed.
pub struct MergedSystem<D, D1, D2, S1, S2> {
    split: fn(&D) -> (&[D1], &[D2]),
    join: fn(Vec<D1>, Vec<D2>) -> D,
    first: S1,
    second: S2,
}

impl<D, D1, D2, S1, S2> MergedSystem<D, D1, D2, S1, S2>
where
    D1: Clone,
    D2: Clone,
    S1: OtSystem<D1>,
    S2: OtSystem<D2>,
{
    /// Creates the composite algebra.
    ///
    /// `split` exposes the two parts of a composite diff and `join` builds one from its parts.
    pub fn new(
        split: fn(&D) -> (&[D1], &[D2]),
        join: fn(Vec<D1>, Vec<D2>) -> D,
        first: S1,
        second: S2,
    ) -> Self {
        Self {
            split,
            join,
            first,
            second,
        }
    }

    fn unzip(&self, ops: &[D]) -> (Vec<D1>, Vec<D2>) {
        let mut first = Vec::new();
        let mut second = Vec::new();
        for op in ops {
            let (a, b) = (self.split)(op);
            first.extend_from_slice(a);
            second.extend_from_slice(b);
        }
        (first, second)
    }

    fn zip(&self, first: Vec<D1>, second: Vec<D2>) -> Vec<D> {
        if first.is_empty() && second.is_empty() {
            Vec::new()
        } else {
            vec![(self.join)(first, second)]
        }
    }
}

impl<D, D1, D2, S1, S2> OtSystem<D> for MergedSystem<D, D1, D2, S1, S2>
where
    D1: Clone,
    D2: Clone,
    S1: OtSystem<D1>,
    S2: OtSystem<D2>,
{
    fn transform(&self, left: &[D], right: &[D]) -> Result<Transformed<D>, TransformError> {
        let (left1, left2) = self.unzip(left);
        let (right1, right2) = self.unzip(right);
        let t1 = self.first.transform(&left1, &right1)?;
        let t2 = self.second.transform(&left2, &right2)?;
        Ok(Transformed::new(
            self.zip(t1.left, t2.left),
            self.zip(t1.right, t2.right),
        ))
    }

    fn squash(&self, ops: &[D]) -> Vec<D> {
        let (first, second) = self.unzip(ops);
        self.zip(self.first.squash(&first), self.second.squash(&second))
    }

    fn invert(&self, ops: &[D]) -> Vec<D> {
        let (first, second) = self.unzip(ops);
        self.zip(self.first.invert(&first), self.second.invert(&second))
    }

    fn is_empty(&self, op: &D) -> bool {
        let (first, second) = (self.split)(op);
        self.first.all_empty(first) && self.second.all_empty(second)
    }
}
