//! Merging, checking out and replicating diverged histories of a key/value document.

mod common;

use common::{Document, KV, Put, init_tracing, insert, put};
use otkit::{Edge, MemoryRepository, OtState, Repository, RepositoryEx, algorithms};
use std::collections::BTreeSet;

fn replay(diffs: &[Put]) -> Document {
    let mut document = Document::default();
    for diff in diffs {
        document.apply(diff).unwrap();
    }
    document
}

/// Three branches on top of a common commit, one of them touching a key the base wrote.
fn diverged() -> MemoryRepository<u64, Put> {
    init_tracing();
    otkit::enable_determinism();
    let repository = MemoryRepository::sequential(100);
    repository.set_graph([
        Edge::new(0, 1, vec![insert("a", "1")]),
        Edge::new(1, 2, vec![insert("b", "2")]),
        Edge::new(1, 3, vec![insert("c", "3")]),
        Edge::new(1, 4, vec![put("a", Some("1"), Some("9"))]),
    ]);
    repository
}

fn expected() -> Document {
    let mut document = Document::default();
    for (key, value) in [("a", "9"), ("b", "2"), ("c", "3")] {
        document.0.insert(key.to_owned(), value.to_owned());
    }
    document
}

#[tokio::test]
async fn merging_three_branches_converges() {
    let repository = diverged();
    assert_eq!(
        algorithms::find_any_common_parent(&repository, &BTreeSet::from([2, 3, 4]))
            .await
            .unwrap(),
        1
    );

    let merged = algorithms::merge_and_update_heads(&repository, &KV).await.unwrap();
    assert_eq!(merged, 100);
    assert_eq!(repository.get_heads().await.unwrap(), BTreeSet::from([100]));

    let data = algorithms::checkout(&repository, &KV).await.unwrap();
    assert_eq!((data.commit_id, data.level), (100, 4));
    assert_eq!(replay(&data.diffs), expected());

    // Every former head reaches the merged state through its own diffs.
    for head in [2, 3, 4] {
        let mut document = replay(&algorithms::checkout_at(&repository, &KV, &head).await.unwrap());
        for diff in algorithms::diff(&repository, &KV, &head, &100).await.unwrap() {
            document.apply(&diff).unwrap();
        }
        assert_eq!(document, expected(), "from {head}");
    }
}

#[tokio::test]
async fn merging_a_single_head_is_a_no_op() {
    let repository = diverged();
    repository.set_graph([Edge::new(0, 1, vec![insert("a", "1")])]);
    assert_eq!(
        algorithms::merge_and_update_heads(&repository, &KV).await.unwrap(),
        1
    );
    assert!(!repository.has_commit(&100).await.unwrap());
}

#[tokio::test]
async fn conflicting_branches_keep_the_larger_value() {
    init_tracing();
    let repository = MemoryRepository::sequential(100);
    repository.set_graph([
        Edge::new(0, 1, vec![insert("k", "x")]),
        Edge::new(0, 2, vec![insert("k", "y")]),
    ]);
    algorithms::merge_and_update_heads(&repository, &KV).await.unwrap();

    let data = algorithms::checkout(&repository, &KV).await.unwrap();
    assert_eq!(replay(&data.diffs).get("k"), Some("y"));
    assert_eq!(
        algorithms::fetch(&repository, &KV, &2).await.unwrap().diffs,
        Vec::<Put>::new()
    );
    assert_eq!(
        algorithms::fetch(&repository, &KV, &1).await.unwrap().diffs,
        vec![put("k", Some("x"), Some("y"))]
    );
}

#[tokio::test]
async fn snapshots_survive_cleanup() {
    let repository = diverged();
    let head = algorithms::merge_and_update_heads(&repository, &KV).await.unwrap();
    algorithms::save_snapshot(&repository, &KV, &head).await.unwrap();

    repository.cleanup(&head).await.unwrap();
    assert!(!repository.has_commit(&1).await.unwrap());

    let data = algorithms::checkout(&repository, &KV).await.unwrap();
    assert_eq!(data.commit_id, head);
    assert_eq!(replay(&data.diffs), expected());
}

#[tokio::test]
async fn copies_check_out_the_same_state() {
    let source = diverged();
    algorithms::merge_and_update_heads(&source, &KV).await.unwrap();

    let replica = MemoryRepository::sequential(500);
    algorithms::copy(&source, &replica).await.unwrap();
    assert_eq!(replica.commit_ids(), source.commit_ids());

    let original = algorithms::checkout(&source, &KV).await.unwrap();
    let copied = algorithms::checkout(&replica, &KV).await.unwrap();
    assert_eq!(copied, original);
}
