//! A key/value document shared by the integration tests.
//!
//! Every diff puts one key, remembering the value it replaces. Puts on different keys commute;
//! concurrent puts on the same key conflict and the larger value wins.

#![allow(dead_code)]

use otkit::{
    BoxError, DiffAlgebra, OtState, PairwiseSystem, Resolution, TransformError, TransformResult,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Put {
    pub key: String,
    pub prev: Option<String>,
    pub next: Option<String>,
}

pub fn put(key: &str, prev: Option<&str>, next: Option<&str>) -> Put {
    Put {
        key: key.to_owned(),
        prev: prev.map(str::to_owned),
        next: next.map(str::to_owned),
    }
}

pub fn insert(key: &str, value: &str) -> Put {
    put(key, None, Some(value))
}

pub const KV: PairwiseSystem<Put> = PairwiseSystem::new();

impl DiffAlgebra for Put {
    fn transform_pair(left: &Self, right: &Self) -> Result<TransformResult<Self>, TransformError> {
        if left.key != right.key {
            return Ok(TransformResult::of(vec![right.clone()], vec![left.clone()]));
        }
        if left.prev != right.prev {
            return Err(TransformError::new(left, right));
        }
        Ok(if left.next == right.next {
            TransformResult::empty()
        } else if left.next > right.next {
            TransformResult::conflict(Resolution::TakeLeft)
        } else {
            TransformResult::conflict(Resolution::TakeRight)
        })
    }

    fn squash_pair(first: &Self, second: &Self) -> Option<Self> {
        (first.key == second.key).then(|| Put {
            key: first.key.clone(),
            prev: first.prev.clone(),
            next: second.next.clone(),
        })
    }

    fn inverse(&self) -> Self {
        Put {
            key: self.key.clone(),
            prev: self.next.clone(),
            next: self.prev.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        self.prev == self.next
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Document(pub BTreeMap<String, String>);

impl Document {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// A put that moves `key` from its current value to `value`.
    pub fn put(&self, key: &str, value: &str) -> Put {
        put(key, self.get(key), Some(value))
    }
}

impl OtState<Put> for Document {
    fn init(&mut self) {
        self.0.clear();
    }

    fn apply(&mut self, diff: &Put) -> Result<(), BoxError> {
        let current = self.0.get(&diff.key);
        if current != diff.prev.as_ref() {
            return Err(format!("{}: expected {:?}, found {current:?}", diff.key, diff.prev).into());
        }
        match &diff.next {
            Some(next) => self.0.insert(diff.key.clone(), next.clone()),
            None => self.0.remove(&diff.key),
        };
        Ok(())
    }
}

/// Installs a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
