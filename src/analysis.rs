//! Aggregation queries over a finished tree.
//!
//! Both queries walk the tree in discovery order, so the node lists
//! inside each bucket preserve the order records were read from the
//! MFT. Results use `BTreeMap` keyed on the grouping value, which gives
//! callers ascending iteration for free.

use crate::tree::{NodeId, Tree};
use std::collections::BTreeMap;

/// Group nodes by the physical fragment count of their default data
/// stream, keeping only nodes at or above `min_fragments`. Sparse runs
/// occupy no clusters and do not count as fragments. Nodes without a
/// default stream (directories, usually) are skipped.
pub fn group_by_fragment_count(tree: &Tree, min_fragments: usize) -> BTreeMap<usize, Vec<NodeId>> {
    let mut groups: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();
    for (id, node) in tree.iter() {
        let Some(stream) = node.default_stream() else {
            continue;
        };
        let fragments = stream.fragment_count();
        if fragments >= min_fragments {
            groups.entry(fragments).or_default().push(id);
        }
    }
    groups
}

/// Group files by the logical size of their default data stream,
/// keeping only files at or above `min_size` bytes. Directories are
/// excluded; zero-length files land in the `0` bucket when `min_size`
/// is zero.
pub fn group_by_size(tree: &Tree, min_size: u64) -> BTreeMap<u64, Vec<NodeId>> {
    let mut groups: BTreeMap<u64, Vec<NodeId>> = BTreeMap::new();
    for (id, node) in tree.iter() {
        if node.is_directory || node.default_stream().is_none() {
            continue;
        }
        let size = node.size();
        if size >= min_size {
            groups.entry(size).or_default().push(id);
        }
    }
    groups
}

/// The `n` largest files by default-stream size, largest first. Ties
/// keep discovery order.
pub fn largest_files(tree: &Tree, n: usize) -> Vec<NodeId> {
    let mut files: Vec<(u64, NodeId)> = tree
        .iter()
        .filter(|(_, node)| !node.is_directory && node.default_stream().is_some())
        .map(|(id, node)| (node.size(), id))
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));
    files.truncate(n);
    files.into_iter().map(|(_, id)| id).collect()
}

/// Sum of default-stream sizes across every file in the tree. Equals
/// the sum over all buckets of `group_by_size(tree, 0)`.
pub fn total_file_bytes(tree: &Tree) -> u64 {
    tree.iter()
        .filter(|(_, node)| !node.is_directory)
        .map(|(_, node)| node.size())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{FileReference, Fragment, Node, Stream, TreeBuilder, ROOT_RECORD};

    fn file(record: u64, name: &str, size: u64, fragments: Vec<Fragment>) -> Node {
        let resident = fragments.is_empty();
        Node {
            reference: FileReference::new(record, 1),
            parent_reference: FileReference::new(ROOT_RECORD, 5),
            name: name.to_string(),
            streams: vec![Stream {
                name: String::new(),
                size,
                allocated_size: size.next_multiple_of(4096),
                fragments,
                resident,
            }],
            ..Default::default()
        }
    }

    fn root() -> Node {
        Node {
            reference: FileReference::new(ROOT_RECORD, 5),
            parent_reference: FileReference::new(ROOT_RECORD, 5),
            name: ".".to_string(),
            is_directory: true,
            ..Default::default()
        }
    }

    fn alloc(start_lcn: u64, clusters: u64) -> Fragment {
        Fragment::Allocated { start_lcn, clusters }
    }

    fn build(nodes: Vec<Node>) -> Tree {
        let mut builder = TreeBuilder::new();
        for node in nodes {
            builder.insert(node);
        }
        builder.finish()
    }

    #[test]
    fn fragment_grouping_respects_threshold() {
        let tree = build(vec![
            root(),
            file(64, "one.bin", 100, vec![alloc(10, 1)]),
            file(65, "two.bin", 200, vec![alloc(10, 1), alloc(50, 1)]),
            file(66, "three.bin", 300, vec![alloc(10, 1), alloc(50, 1), alloc(90, 1)]),
        ]);
        let groups = group_by_fragment_count(&tree, 2);
        assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(groups[&2].len(), 1);
        assert_eq!(groups[&3].len(), 1);
    }

    #[test]
    fn sparse_runs_do_not_count_as_fragments() {
        let tree = build(vec![
            root(),
            file(
                64,
                "sparse.bin",
                8192,
                vec![alloc(10, 1), Fragment::Sparse { clusters: 16 }, alloc(40, 1)],
            ),
        ]);
        let groups = group_by_fragment_count(&tree, 1);
        assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn streamless_nodes_are_skipped_by_fragment_grouping() {
        let mut streamless = file(64, "empty", 0, vec![]);
        streamless.streams.clear();
        let tree = build(vec![root(), streamless, file(65, "a.bin", 10, vec![alloc(2, 1)])]);
        let groups = group_by_fragment_count(&tree, 0);
        assert_eq!(groups.values().map(Vec::len).sum::<usize>(), 1);
    }

    #[test]
    fn size_grouping_excludes_directories() {
        let mut dir = file(64, "subdir", 0, vec![]);
        dir.is_directory = true;
        let tree = build(vec![root(), dir, file(65, "a.bin", 5000, vec![alloc(2, 2)])]);
        let groups = group_by_size(&tree, 0);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&5000].len(), 1);
    }

    #[test]
    fn zero_length_files_land_in_the_zero_bucket() {
        let tree = build(vec![root(), file(64, "empty.txt", 0, vec![])]);
        let groups = group_by_size(&tree, 0);
        assert_eq!(groups[&0].len(), 1);
        // And a positive threshold filters them out.
        assert!(group_by_size(&tree, 1).is_empty());
    }

    #[test]
    fn size_buckets_sum_to_total_bytes() {
        let tree = build(vec![
            root(),
            file(64, "a.bin", 100, vec![alloc(2, 1)]),
            file(65, "b.bin", 100, vec![alloc(4, 1)]),
            file(66, "c.bin", 250, vec![alloc(6, 1)]),
        ]);
        let bucket_total: u64 = group_by_size(&tree, 0)
            .iter()
            .map(|(size, ids)| size * ids.len() as u64)
            .sum();
        assert_eq!(bucket_total, total_file_bytes(&tree));
        assert_eq!(bucket_total, 450);
    }

    #[test]
    fn largest_files_orders_descending() {
        let tree = build(vec![
            root(),
            file(64, "small.bin", 10, vec![alloc(2, 1)]),
            file(65, "big.bin", 9000, vec![alloc(4, 3)]),
            file(66, "mid.bin", 500, vec![alloc(8, 1)]),
        ]);
        let top = largest_files(&tree, 2);
        assert_eq!(tree.node(top[0]).name, "big.bin");
        assert_eq!(tree.node(top[1]).name, "mid.bin");
    }
}
