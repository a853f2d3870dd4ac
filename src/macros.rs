// (c) Copyright 2025 Helsing GmbH. All rights reserved.
/// Convenience macro for describing a commit graph as a list of [`Edge`](crate::Edge)s.
///
/// Each entry reads `parent => child: [diffs]`, where the diffs lead from `parent` to `child`.
/// Commits that appear only as parents become roots. Ids must be single tokens (literals or
/// identifiers); wrap anything longer in parentheses.
///
/// ```rust
/// # use otkit::{edges, MemoryRepository};
/// let repository = MemoryRepository::<u64, i64>::sequential(100);
/// repository.set_graph(edges![
///     0 => 1: [1, 2],
///     0 => 2: [3],
///     1 => 3: [],
///     2 => 3: [-1],
/// ]);
/// assert_eq!(repository.commit_ids().len(), 4);
/// ```
#[macro_export]
macro_rules! edges {
    ($($parent:tt => $child:tt : [$($diff:expr),* $(,)?]),* $(,)?) => {
        ::std::vec![
            $($crate::Edge::new($parent, $child, ::std::vec![$($diff),*])),*
        ]
    };
}
