//! File Tree Management
//!
//! Assembles the flat MFT record stream into a rooted tree. Records
//! arrive in slot order, so a child is routinely seen before its parent;
//! the builder therefore materializes every node into a flat arena first
//! and resolves parent links in a second pass. Nodes whose parent cannot
//! be resolved (or whose parent slot was reused by a different file) are
//! attached under a synthetic orphan root rather than dropped, so size
//! accounting never silently loses bytes.

use crate::ntfs::structs::{file_attributes, filetime_to_datetime};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// NTFS root directory is always MFT record 5.
pub const ROOT_RECORD: u64 = 5;

/// Record index of the synthetic orphan root. 48-bit MFT record indices
/// can never reach this value, so it cannot collide with a real file.
pub const ORPHAN_RECORD: u64 = u64::MAX;

// ============================================================================
// File Reference
// ============================================================================

/// A (record index, sequence number) pair uniquely identifying an MFT
/// record across slot-reuse cycles. Two references are equal only if both
/// fields match; a stale reference must never resolve to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileReference {
    /// MFT record index (48 bits on disk)
    pub record: u64,
    /// Sequence number, bumped each time the slot is reused
    pub sequence: u16,
}

impl FileReference {
    pub fn new(record: u64, sequence: u16) -> Self {
        Self { record, sequence }
    }

    /// Decode the packed on-disk form: low 48 bits record index,
    /// high 16 bits sequence number.
    pub fn from_raw(raw: u64) -> Self {
        Self {
            record: raw & 0x0000_FFFF_FFFF_FFFF,
            sequence: (raw >> 48) as u16,
        }
    }

    /// Re-pack into the on-disk form.
    pub fn to_raw(self) -> u64 {
        (self.sequence as u64) << 48 | (self.record & 0x0000_FFFF_FFFF_FFFF)
    }

    /// The synthetic orphan root reference.
    pub fn orphan_root() -> Self {
        Self {
            record: ORPHAN_RECORD,
            sequence: 0,
        }
    }
}

// ============================================================================
// Fragments and Streams
// ============================================================================

/// One allocation fragment of a non-resident stream: a contiguous cluster
/// range, or a sparse hole with no physical backing. Ordering within a
/// stream is the physical layout order and is significant for
/// fragmentation counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fragment {
    /// Physically allocated clusters starting at an absolute LCN.
    Allocated { start_lcn: u64, clusters: u64 },
    /// Sparse run: contributes to logical size but owns no clusters.
    Sparse { clusters: u64 },
}

impl Fragment {
    pub fn clusters(&self) -> u64 {
        match *self {
            Fragment::Allocated { clusters, .. } => clusters,
            Fragment::Sparse { clusters } => clusters,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Fragment::Sparse { .. })
    }
}

/// A named data stream belonging to a node. The default stream has an
/// empty name. Resident streams are stored inline in the MFT record and
/// carry no fragments.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    /// Stream name; empty for the default $DATA stream
    pub name: String,
    /// Logical size in bytes
    pub size: u64,
    /// Allocated size on disk in bytes (0 for resident streams)
    pub allocated_size: u64,
    /// Allocation fragments in physical layout order
    pub fragments: Vec<Fragment>,
    /// True if the payload lives inline in the MFT record
    pub resident: bool,
}

impl Stream {
    /// Number of physical fragments. Sparse runs contribute to size but
    /// not to fragmentation.
    pub fn fragment_count(&self) -> usize {
        self.fragments.iter().filter(|f| !f.is_sparse()).count()
    }

    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }
}

// ============================================================================
// Node
// ============================================================================

/// Index into the tree's node arena. Parent/child links are indices, not
/// owning pointers, since parents may be discovered after children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A file or directory reconstructed from one MFT record. File vs
/// directory vs reparse point is an attribute-flag distinction, not a
/// type distinction: almost all fields are shared.
#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Identity of the backing MFT record
    pub reference: FileReference,
    /// Parent directory reference as recorded in $FILE_NAME
    pub parent_reference: FileReference,
    /// Best available name (long/primary, never an 8.3 alias)
    pub name: String,
    /// $STANDARD_INFORMATION attribute flags
    pub attributes: u32,
    /// Is this a directory (record header flag)?
    pub is_directory: bool,
    /// Data streams; index 0 is the default stream when present
    pub streams: Vec<Stream>,
    /// Creation time (Windows FILETIME)
    pub creation_time: u64,
    /// Last modification time (Windows FILETIME)
    pub modification_time: u64,
    /// Last access time (Windows FILETIME)
    pub access_time: u64,
    /// Parent link after resolution; None only for the root and the
    /// orphan root themselves
    pub parent: Option<NodeId>,
    /// Children in discovery order
    pub children: Vec<NodeId>,
    /// The recorded parent reference could not be resolved, or a cycle
    /// was broken at this node; re-parented under the orphan root
    pub broken_parent_link: bool,
    /// Logical size of self plus all descendants
    pub total_size: u64,
    /// Allocated size of self plus all descendants
    pub total_allocated: u64,
}

impl Node {
    /// Size of the default data stream, in bytes. Directories and
    /// streamless nodes report 0.
    pub fn size(&self) -> u64 {
        self.default_stream().map_or(0, |s| s.size)
    }

    /// Allocated bytes across all streams.
    pub fn allocated_size(&self) -> u64 {
        self.streams.iter().map(|s| s.allocated_size).sum()
    }

    pub fn default_stream(&self) -> Option<&Stream> {
        self.streams.iter().find(|s| s.is_default())
    }

    pub fn is_hidden(&self) -> bool {
        (self.attributes & file_attributes::HIDDEN) != 0
    }

    pub fn is_system(&self) -> bool {
        (self.attributes & file_attributes::SYSTEM) != 0
    }

    pub fn is_compressed(&self) -> bool {
        (self.attributes & file_attributes::COMPRESSED) != 0
    }

    pub fn is_reparse_point(&self) -> bool {
        (self.attributes & file_attributes::REPARSE_POINT) != 0
    }

    pub fn modified(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.modification_time)
    }

    pub fn created(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.creation_time)
    }
}

// ============================================================================
// Tree
// ============================================================================

/// Aggregate counters accumulated over a scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanStats {
    pub total_files: u64,
    pub total_directories: u64,
    /// Sum of default-stream sizes of all non-directory nodes
    pub total_size: u64,
    /// Sum of allocated bytes across all nodes
    pub total_allocated: u64,
    /// Records skipped for failed fix-up / malformed attributes
    pub corrupt_records: u64,
    /// Nodes re-parented under the orphan root
    pub orphaned_nodes: u64,
}

/// The finished, immutable node graph for one volume. Exactly one root;
/// every other node's parent chain terminates at the root or at the
/// synthetic orphan root.
pub struct Tree {
    nodes: Vec<Node>,
    /// record index -> arena slot
    index: HashMap<u64, NodeId>,
    root: NodeId,
    orphan_root: NodeId,
    pub stats: ScanStats,
}

impl Tree {
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The synthetic bucket collecting nodes with unresolvable parents.
    pub fn orphan_root(&self) -> NodeId {
        self.orphan_root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Look up a node by reference. A stale reference (sequence
    /// mismatch) never resolves.
    pub fn get(&self, reference: FileReference) -> Option<NodeId> {
        let id = *self.index.get(&reference.record)?;
        (self.nodes[id.index()].reference == reference).then_some(id)
    }

    /// All nodes in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Build the full path of a node by walking the parent chain.
    /// Nodes under the orphan root are prefixed with "[orphaned]".
    pub fn path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            if cur == self.root {
                break;
            }
            let node = self.node(cur);
            if cur == self.orphan_root {
                parts.push("[orphaned]".to_string());
                break;
            }
            parts.push(node.name.clone());
            current = node.parent;
        }
        parts.reverse();
        format!("\\{}", parts.join("\\"))
    }
}

// ============================================================================
// Tree Builder
// ============================================================================

/// Assembles the record stream into a `Tree`. First pass: insert every
/// node into the arena as it arrives (parents may not exist yet). Second
/// pass (`finish`): resolve parent links with sequence checks, break
/// cycles, roll up sizes, compute stats.
pub struct TreeBuilder {
    nodes: Vec<Node>,
    index: HashMap<u64, NodeId>,
    corrupt_records: u64,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            corrupt_records: 0,
        }
    }

    /// Insert one parsed node. Later records for the same slot replace
    /// earlier ones (the MFT is read once, so this only happens when an
    /// extension merge re-emits a base record).
    pub fn insert(&mut self, node: Node) {
        let record = node.reference.record;
        match self.index.get(&record) {
            Some(&id) => self.nodes[id.index()] = node,
            None => {
                let id = NodeId(self.nodes.len() as u32);
                self.nodes.push(node);
                self.index.insert(record, id);
            }
        }
    }

    /// Record that a record slot was skipped as corrupt.
    pub fn note_corrupt_record(&mut self) {
        self.corrupt_records += 1;
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Finalize into an immutable `Tree`.
    pub fn finish(mut self) -> Tree {
        let orphan_root = self.ensure_orphan_root();
        let root = self.ensure_root();

        self.resolve_parents(root, orphan_root);
        self.break_cycles(root, orphan_root);
        self.link_children(root, orphan_root);
        self.roll_up_sizes(root, orphan_root);

        let stats = self.compute_stats(orphan_root);
        Tree {
            nodes: self.nodes,
            index: self.index,
            root,
            orphan_root,
            stats,
        }
    }

    /// The root directory should always be present (record 5); if the
    /// scan never produced it, synthesize one so the tree invariant of
    /// exactly one root still holds.
    fn ensure_root(&mut self) -> NodeId {
        if let Some(&id) = self.index.get(&ROOT_RECORD) {
            return id;
        }
        warn!("root directory record missing from MFT stream; synthesizing");
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            reference: FileReference::new(ROOT_RECORD, 0),
            name: String::new(),
            is_directory: true,
            ..Default::default()
        });
        self.index.insert(ROOT_RECORD, id);
        id
    }

    fn ensure_orphan_root(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            reference: FileReference::orphan_root(),
            name: "[orphaned]".to_string(),
            is_directory: true,
            ..Default::default()
        });
        self.index.insert(ORPHAN_RECORD, id);
        id
    }

    /// Second pass: resolve each node's recorded parent reference. A
    /// missing parent, or one whose sequence number no longer matches (a
    /// reused slot now holding a different file), flags the node and
    /// re-parents it under the orphan root.
    fn resolve_parents(&mut self, root: NodeId, orphan_root: NodeId) {
        for i in 0..self.nodes.len() {
            let id = NodeId(i as u32);
            if id == root || id == orphan_root {
                continue;
            }
            let parent_ref = self.nodes[i].parent_reference;
            let resolved = self
                .index
                .get(&parent_ref.record)
                .copied()
                .filter(|pid| self.nodes[pid.index()].reference == parent_ref)
                .filter(|pid| *pid != id);
            match resolved {
                Some(pid) => self.nodes[i].parent = Some(pid),
                None => {
                    self.nodes[i].parent = Some(orphan_root);
                    self.nodes[i].broken_parent_link = true;
                }
            }
        }
    }

    /// Walk each parent chain with a visited set bounded by the node
    /// count. A chain that revisits a node is a cycle; break it by
    /// re-parenting the offending node onto the orphan root.
    fn break_cycles(&mut self, root: NodeId, orphan_root: NodeId) {
        let mut cleared: HashSet<NodeId> = HashSet::new();
        cleared.insert(root);
        cleared.insert(orphan_root);

        for i in 0..self.nodes.len() {
            let start = NodeId(i as u32);
            if cleared.contains(&start) {
                continue;
            }
            let mut chain = Vec::new();
            let mut seen: HashSet<NodeId> = HashSet::new();
            let mut current = start;
            loop {
                if cleared.contains(&current) {
                    break;
                }
                if !seen.insert(current) {
                    // `current` closes the loop; cut it here.
                    warn!(
                        record = self.nodes[current.index()].reference.record,
                        "parent cycle detected; re-parenting to orphan root"
                    );
                    self.nodes[current.index()].parent = Some(orphan_root);
                    self.nodes[current.index()].broken_parent_link = true;
                    break;
                }
                chain.push(current);
                match self.nodes[current.index()].parent {
                    Some(next) => current = next,
                    None => break,
                }
            }
            cleared.extend(chain);
        }
    }

    fn link_children(&mut self, root: NodeId, orphan_root: NodeId) {
        for i in 0..self.nodes.len() {
            let id = NodeId(i as u32);
            if id == root || id == orphan_root {
                continue;
            }
            if let Some(parent) = self.nodes[i].parent {
                self.nodes[parent.index()].children.push(id);
            }
        }
    }

    /// Aggregate sizes bottom-up. Iterative post-order to stay off the
    /// call stack for deep trees.
    fn roll_up_sizes(&mut self, root: NodeId, orphan_root: NodeId) {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![root, orphan_root];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.index()].children.iter().copied());
        }

        for &id in order.iter().rev() {
            let own_size = self.nodes[id.index()].size();
            let own_allocated = self.nodes[id.index()].allocated_size();
            let (child_size, child_allocated) = self.nodes[id.index()]
                .children
                .clone()
                .iter()
                .fold((0u64, 0u64), |acc, c| {
                    let child = &self.nodes[c.index()];
                    (acc.0 + child.total_size, acc.1 + child.total_allocated)
                });
            let node = &mut self.nodes[id.index()];
            node.total_size = own_size + child_size;
            node.total_allocated = own_allocated + child_allocated;
        }
    }

    fn compute_stats(&self, orphan_root: NodeId) -> ScanStats {
        let mut stats = ScanStats {
            corrupt_records: self.corrupt_records,
            ..Default::default()
        };
        for (i, node) in self.nodes.iter().enumerate() {
            let id = NodeId(i as u32);
            // The orphan bucket is synthetic; the root directory is real
            // and counts like any other directory.
            if id == orphan_root {
                continue;
            }
            if node.is_directory {
                stats.total_directories += 1;
            } else {
                stats.total_files += 1;
                stats.total_size += node.size();
            }
            stats.total_allocated += node.allocated_size();
            if node.broken_parent_link {
                stats.orphaned_nodes += 1;
            }
        }
        stats
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
