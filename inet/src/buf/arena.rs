//! Backing storage of the pool: segments and the chain node descriptors pointing into them.
//!
//! Everything in here works on plain indices and explicit reference counts. The safe handles in
//! the parent module are the only owners of those counts.
use alloc::{boxed::Box, vec, vec::Vec};
use core::mem;

use super::Config;

pub(crate) type NodeId = usize;
pub(crate) type SegmentId = usize;

/// Every segment starts on a boundary of this many bytes.
pub const SEGMENT_ALIGN: usize = mem::align_of::<u64>();

pub(crate) struct Arena {
    classes: Vec<Class>,
    segments: Vec<Segment>,
    nodes: Vec<Node>,
    free_nodes: Vec<NodeId>,
    /// Scratch space of `release`, kept to avoid allocating on every free.
    worklist: Vec<NodeId>,
}

struct Class {
    size: usize,
    total: usize,
    free: Vec<SegmentId>,
}

struct Segment {
    class: usize,
    refs: usize,
    words: Box<[u64]>,
}

/// A window into one segment, the unit that chains are made of.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Node {
    pub(crate) segment: SegmentId,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) refs: usize,
    pub(crate) next: Option<NodeId>,
    /// Queue link owned by whoever put the chain into a queue.
    pub(crate) link: Option<NodeId>,
}

/// Occupancy of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassStats {
    pub size: usize,
    pub total: usize,
    pub free: usize,
}

impl Arena {
    pub(crate) fn new(config: &Config) -> Self {
        let mut sizes: Vec<_> = config.classes.iter()
            .filter(|class| class.count > 0)
            .map(|class| (round_up(class.size), class.count))
            .collect();
        sizes.sort_by_key(|&(size, _)| size);
        assert!(!sizes.is_empty(), "a pool needs at least one segment");
        assert!(config.nodes > 0, "a pool needs chain nodes");

        let mut classes = Vec::with_capacity(sizes.len());
        let mut segments = Vec::new();
        for (class, &(size, count)) in sizes.iter().enumerate() {
            let first = segments.len();
            segments.extend((0..count).map(|_| Segment {
                class,
                refs: 0,
                words: vec![0u64; size / SEGMENT_ALIGN].into_boxed_slice(),
            }));
            classes.push(Class {
                size,
                total: count,
                // Popped from the back, so the lowest index is handed out first.
                free: (first..segments.len()).rev().collect(),
            });
        }

        Arena {
            classes,
            segments,
            nodes: vec![Node::default(); config.nodes],
            free_nodes: (0..config.nodes).rev().collect(),
            worklist: Vec::new(),
        }
    }

    /// Take a free segment for a request of `want` bytes.
    ///
    /// Prefers the smallest class that covers the request by itself and otherwise the largest
    /// class that still has a free segment. The segment is returned unreferenced.
    pub(crate) fn take_segment(&mut self, want: usize) -> Option<SegmentId> {
        let class = self.classes.iter()
            .position(|class| class.size >= want && !class.free.is_empty())
            .or_else(|| self.classes.iter().rposition(|class| !class.free.is_empty()))?;
        self.classes[class].free.pop()
    }

    /// Take a free segment that holds at least `want` bytes.
    pub(crate) fn take_covering(&mut self, want: usize) -> Option<SegmentId> {
        let class = self.classes.iter()
            .position(|class| class.size >= want && !class.free.is_empty())?;
        self.classes[class].free.pop()
    }

    pub(crate) fn largest_segment(&self) -> usize {
        self.classes.last().map_or(0, |class| class.size)
    }

    pub(crate) fn segment_size(&self, segment: SegmentId) -> usize {
        self.classes[self.segments[segment].class].size
    }

    pub(crate) fn segment_refs(&self, segment: SegmentId) -> usize {
        self.segments[segment].refs
    }

    /// Create a node with one reference, taking a new reference on `segment`.
    ///
    /// Ownership of the reference to `next` moves into the node.
    pub(crate) fn new_node(
        &mut self,
        segment: SegmentId,
        offset: usize,
        len: usize,
        next: Option<NodeId>,
    ) -> Option<NodeId> {
        debug_assert!(offset + len <= self.segment_size(segment));
        let id = self.free_nodes.pop()?;
        self.segments[segment].refs += 1;
        self.nodes[id] = Node { segment, offset, len, refs: 1, next, link: None };
        Some(id)
    }

    pub(crate) fn incref(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        assert!(node.refs > 0, "reference taken on a free chain node");
        node.refs += 1;
    }

    /// Drop one reference to a node.
    ///
    /// A node reaching zero drops its segment reference and the references it holds on its
    /// successor and queue link, iteratively.
    pub(crate) fn release(&mut self, id: NodeId) {
        let mut work = mem::replace(&mut self.worklist, Vec::new());
        work.push(id);
        while let Some(id) = work.pop() {
            let node = &mut self.nodes[id];
            assert!(node.refs > 0, "chain node released more often than referenced");
            node.refs -= 1;
            if node.refs > 0 {
                continue;
            }

            let Node { segment, next, link, .. } = *node;
            node.next = None;
            node.link = None;
            self.free_nodes.push(id);

            let storage = &mut self.segments[segment];
            assert!(storage.refs > 0, "segment released more often than referenced");
            storage.refs -= 1;
            if storage.refs == 0 {
                self.classes[storage.class].free.push(segment);
            }

            work.extend(next);
            work.extend(link);
        }
        self.worklist = work;
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Node ids of a chain, in order.
    pub(crate) fn walk(&self, head: NodeId) -> Walk<'_> {
        Walk { arena: self, cursor: Some(head) }
    }

    /// Both the node and its segment are referenced exactly once.
    pub(crate) fn is_private(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        node.refs == 1 && self.segments[node.segment].refs == 1
    }

    pub(crate) fn bytes(&self, id: NodeId) -> &[u8] {
        let node = &self.nodes[id];
        &self.segment_bytes(node.segment)[node.offset..node.offset + node.len]
    }

    pub(crate) fn bytes_mut(&mut self, id: NodeId) -> &mut [u8] {
        let Node { segment, offset, len, .. } = self.nodes[id];
        &mut self.segment_bytes_mut(segment)[offset..offset + len]
    }

    fn segment_bytes(&self, segment: SegmentId) -> &[u8] {
        bytemuck::cast_slice(&self.segments[segment].words[..])
    }

    fn segment_bytes_mut(&mut self, segment: SegmentId) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.segments[segment].words[..])
    }

    /// Copy bytes between two distinct segments.
    pub(crate) fn copy_between(
        &mut self,
        src: SegmentId,
        src_offset: usize,
        dst: SegmentId,
        dst_offset: usize,
        len: usize,
    ) {
        assert_ne!(src, dst, "copy within a single segment");
        let (from, to) = if src < dst {
            let (low, high) = self.segments.split_at_mut(dst);
            (&low[src], &mut high[0])
        } else {
            let (low, high) = self.segments.split_at_mut(src);
            (&high[0], &mut low[dst])
        };
        let from: &[u8] = bytemuck::cast_slice(&from.words[..]);
        let to: &mut [u8] = bytemuck::cast_slice_mut(&mut to.words[..]);
        to[dst_offset..dst_offset + len].copy_from_slice(&from[src_offset..src_offset + len]);
    }

    pub(crate) fn class_stats(&self) -> Vec<ClassStats> {
        self.classes.iter()
            .map(|class| ClassStats {
                size: class.size,
                total: class.total,
                free: class.free.len(),
            })
            .collect()
    }

    pub(crate) fn free_nodes(&self) -> usize {
        self.free_nodes.len()
    }

    pub(crate) fn total_nodes(&self) -> usize {
        self.nodes.len()
    }
}

pub(crate) struct Walk<'a> {
    arena: &'a Arena,
    cursor: Option<NodeId>,
}

impl Iterator for Walk<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cursor?;
        self.cursor = self.arena.node(id).next;
        Some(id)
    }
}

fn round_up(size: usize) -> usize {
    let size = size.max(SEGMENT_ALIGN);
    (size + SEGMENT_ALIGN - 1) / SEGMENT_ALIGN * SEGMENT_ALIGN
}
