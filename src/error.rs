// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Errors surfaced by the algorithms, the node and the state manager.

use crate::system::TransformError;
use std::{error::Error, fmt, sync::Arc};

/// Boxed error as produced by external ports (repositories, uplinks, projections).
pub type BoxError = Box<dyn Error + Send + Sync>;

/// The error type shared by every fallible operation of this crate.
///
/// The type is cheap to clone so that the outcome of one in-flight
/// [`StateManager::sync`](crate::StateManager::sync) can be handed to every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OtError {
    /// A traversal reached every root without the reducer producing a result.
    #[error("commit graph exhausted before a result was found")]
    GraphExhausted,

    /// The diff algebra could not transform two diff sequences against each other.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// A set of heads could not be merged.
    #[error("cannot merge heads: {0}")]
    Merge(String),

    /// The repository does not know the requested commit.
    #[error("commit {0} not found")]
    CommitNotFound(String),

    /// Opaque I/O failure reported by a repository or an uplink.
    #[error("repository failure: {0}")]
    Repository(Arc<dyn Error + Send + Sync>),

    /// The application projection refused to apply a diff.
    #[error("state update failed: {0}")]
    State(Arc<dyn Error + Send + Sync>),

    /// The state manager no longer trusts its local state and must be checked out again.
    #[error("state manager is invalidated")]
    Invalidated,
}

impl OtError {
    pub fn commit_not_found(id: &impl fmt::Debug) -> Self {
        Self::CommitNotFound(format!("{id:?}"))
    }

    pub fn repository(err: impl Into<BoxError>) -> Self {
        Self::Repository(Arc::from(err.into()))
    }

    pub fn state(err: impl Into<BoxError>) -> Self {
        Self::State(Arc::from(err.into()))
    }

    /// Whether this error leaves the local state of a state manager untrustworthy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transform(_) | Self::State(_) | Self::Invalidated)
    }
}
