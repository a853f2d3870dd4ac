// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # otkit: Operational Transformation over a commit graph
//!
//! This crate keeps many replicas of one document consistent by recording every change as a
//! *diff* inside a directed acyclic graph of commits, and by reconciling divergent branches of
//! that graph with **operational transformation** (OT).
//!
//! The crate does not know what a diff means. The application supplies an algebra over its own
//! diff type (see [`OtSystem`], or the more convenient [`DiffAlgebra`]) and the crate provides
//! everything built on top of it:
//!
//! - the [`Commit`] model and the [`Repository`] port through which commits are stored,
//! - level-ordered graph traversal ([`reducer`]) and the searches built from it
//!   ([`algorithms`]): common ancestors, cuts, diffs between commits, snapshots,
//! - the N-way merge of diverged heads, computed over a compacted in-memory [`LoadedGraph`],
//! - a server-side [`OtNode`] exposing push, fetch and checkout to clients,
//! - and the client-side [`StateManager`], which applies local edits optimistically and keeps
//!   them in sync with a remote history through an [`Uplink`].
//!
//! ## Transform orientation
//!
//! Throughout the crate, `transform(L, R)` returns a pair `(left, right)` such that applying
//! `L ++ left` and `R ++ right` to the same base state gives the same result. When two diffs
//! cannot be commuted, the algebra reports a [`Resolution`] and the losing side is undone:
//!
//! ```rust
//! use otkit::{OtSystem, PairwiseSystem};
//! # use otkit::{DiffAlgebra, TransformError, TransformResult};
//! # #[derive(Debug, Clone, PartialEq)]
//! # struct Add(i64);
//! # impl DiffAlgebra for Add {
//! #     fn transform_pair(l: &Self, r: &Self) -> Result<TransformResult<Self>, TransformError> {
//! #         Ok(TransformResult::of(vec![r.clone()], vec![l.clone()]))
//! #     }
//! #     fn squash_pair(a: &Self, b: &Self) -> Option<Self> {
//! #         Some(Add(a.0 + b.0))
//! #     }
//! #     fn inverse(&self) -> Self {
//! #         Add(-self.0)
//! #     }
//! #     fn is_empty(&self) -> bool {
//! #         self.0 == 0
//! #     }
//! # }
//! let system = PairwiseSystem::<Add>::new();
//! let t = system.transform(&[Add(1)], &[Add(2), Add(3)]).unwrap();
//! assert_eq!(system.squash(&t.left), vec![Add(5)]);
//! assert_eq!(t.right, vec![Add(1)]);
//! ```
//!
//! ## Getting started
//!
//! A minimal setup keeps the history in a [`MemoryRepository`], serves it through an
//! [`OtNodeImpl`] and synchronizes a projection through a [`StateManager`]. See the
//! `tests/` directory of this crate for complete end-to-end scenarios, including two state
//! managers editing the same document concurrently.
//!
//! ## Features
//!
//! - `ulid`: ready-made ULID commit ids for [`MemoryRepository`]. Enabled by default.
//! - `serde`: `Serialize`/`Deserialize` for commits, [`FetchData`] and the configuration types.
//!
//! ## License
//!
//! This project is licensed under either of
//!
//! - Apache License, Version 2.0, ([LICENSE-APACHE](LICENSE-APACHE) or http://www.apache.org/licenses/LICENSE-2.0)
//! - MIT license ([LICENSE-MIT](LICENSE-MIT) or http://opensource.org/licenses/MIT)
//!
//! at your option.

#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

use ahash::RandomState;
use std::{
    hash::BuildHasher,
    sync::atomic::{AtomicBool, Ordering},
};

// Use a constant seed for hashing to make traversal-order dependent tests reproducible.
pub(crate) const DETERMINISTIC_HASHER: RandomState = RandomState::with_seeds(48, 1516, 23, 42);

pub mod algorithms;
pub mod commit;
pub use commit::{Commit, CommitId, Diff, DiffsWithLevel};
pub mod config;
pub use config::{Backoff, NodeConfig, RetryPolicy, StateManagerConfig};
mod error;
pub use error::{BoxError, OtError};
pub mod graph;
pub use graph::{GraphNode, LoadedGraph};
/// Macros usable for tests and initialization
pub mod macros;
pub mod node;
pub use node::{FetchData, OtNode, OtNodeImpl};
pub mod poll;
pub use poll::PollSanitizer;
pub mod reducer;
pub use reducer::{DiffsReducer, GraphReducer, Step, ToList, ToSquashedList, ToVoid};
pub mod repository;
pub use repository::{CommitFactory, Edge, MemoryRepository, Repository, RepositoryEx};
pub mod state;
pub use state::{OtState, StateManager};
pub mod system;
pub use system::{
    DiffAlgebra, MergedSystem, OtSystem, PairwiseSystem, Resolution, TransformError,
    TransformResult, Transformed,
};
pub mod uplink;
pub use uplink::{FastForwardUplink, NodeUplink, PushOutcome, Uplink, UplinkStorage};

#[cfg(test)]
pub(crate) mod test_util;

static ENABLE_DETERMINISM: AtomicBool = AtomicBool::new(false);

/// Switches every hash map created afterwards to a fixed seed.
///
/// Only meant for tests that depend on iteration order; a fixed seed makes hash flooding easy.
#[doc(hidden)]
pub fn enable_determinism() {
    ENABLE_DETERMINISM.store(true, Ordering::Release);
}

#[doc(hidden)]
pub fn determinism_enabled() -> bool {
    ENABLE_DETERMINISM.load(Ordering::Acquire)
}

pub(crate) fn create_map<K, V>() -> std::collections::HashMap<K, V, OtRandomState> {
    std::collections::HashMap::with_hasher(OtRandomState::default())
}

pub(crate) fn create_set<K>() -> std::collections::HashSet<K, OtRandomState> {
    std::collections::HashSet::with_hasher(OtRandomState::default())
}

/// The hasher of the crate's internal maps: a random `ahash` state, or the fixed one once
/// [`enable_determinism`] has been called.
#[derive(Clone)]
pub struct OtRandomState {
    inner: RandomState,
}

impl Default for OtRandomState {
    #[inline]
    fn default() -> Self {
        let inner = if determinism_enabled() {
            DETERMINISTIC_HASHER
        } else {
            RandomState::new()
        };
        Self { inner }
    }
}

impl BuildHasher for OtRandomState {
    type Hasher = <RandomState as BuildHasher>::Hasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        self.inner.build_hasher()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determinism_fixes_map_iteration_order() {
        enable_determinism();
        assert!(determinism_enabled());
        assert_eq!(
            OtRandomState::default().hash_one(42u64),
            OtRandomState::default().hash_one(42u64)
        );

        let fill = || {
            let mut map = create_map();
            map.extend((0..64u64).map(|i| (i, i * 2)));
            map.into_iter().collect::<Vec<_>>()
        };
        assert_eq!(fill(), fill());
    }
}
