use alloc::{rc::Rc, vec::Vec};
use core::cell::{Ref, RefMut};
use core::fmt;

use super::arena::{Arena, NodeId, SegmentId, SEGMENT_ALIGN};
use super::{Pool, Shared};

/// A reference counted byte stream made of segment windows.
///
/// See the [module documentation](index.html) for the ownership rules.
pub struct Chain {
    shared: Rc<Shared>,
    head: NodeId,
}

/// One window of a planned cut.
#[derive(Clone, Copy)]
struct Piece {
    segment: SegmentId,
    offset: usize,
    len: usize,
}

impl Chain {
    pub(crate) fn from_raw(shared: Rc<Shared>, head: NodeId) -> Self {
        Chain { shared, head }
    }

    /// Give up the handle but keep its reference, which the caller now owns.
    pub(crate) fn into_raw(self) -> (Rc<Shared>, NodeId) {
        let shared = self.shared.clone();
        let head = self.head;
        shared.arena.borrow_mut().incref(head);
        drop(self);
        (shared, head)
    }

    fn arena(&self) -> Ref<'_, Arena> {
        self.shared.arena.borrow()
    }

    fn arena_mut(&self) -> RefMut<'_, Arena> {
        self.shared.arena.borrow_mut()
    }

    /// The pool this chain was allocated from.
    pub fn pool(&self) -> Pool {
        Pool { shared: self.shared.clone() }
    }

    /// The total number of bytes in the chain.
    pub fn len(&self) -> usize {
        let arena = self.arena();
        arena.walk(self.head).map(|id| arena.node(id).len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of descriptors the chain is made of.
    pub fn node_count(&self) -> usize {
        self.arena().walk(self.head).count()
    }

    /// Reference counts of every descriptor and its segment, in chain order.
    pub fn ref_counts(&self) -> Vec<(usize, usize)> {
        let arena = self.arena();
        arena.walk(self.head)
            .map(|id| {
                let node = arena.node(id);
                (node.refs, arena.segment_refs(node.segment))
            })
            .collect()
    }

    /// Check that no other handle can observe a write through this one.
    pub fn is_unique(&self) -> bool {
        let arena = self.arena();
        arena.walk(self.head).all(|id| arena.is_private(id))
    }

    /// A new head descriptor over the same bytes.
    ///
    /// The successors of the head are shared with `self`, nothing is copied.
    pub fn duplicate(&self) -> Chain {
        let node = *self.arena().node(self.head);
        let id = self.shared.reserve("chain nodes", |arena| {
            let id = arena.new_node(node.segment, node.offset, node.len, node.next)?;
            if let Some(next) = node.next {
                arena.incref(next);
            }
            Some(id)
        });
        Chain::from_raw(self.shared.clone(), id)
    }

    /// A new chain over exactly the bytes `offset..offset + len`.
    ///
    /// Only the descriptors at the boundaries of the range are created anew, a tail that reaches
    /// the end of `self` is shared as is. `self` is not modified.
    ///
    /// # Panics
    /// If the range is not within the chain.
    pub fn cut(&self, offset: usize, len: usize) -> Chain {
        let total = self.len();
        assert!(offset.checked_add(len).map_or(false, |end| end <= total),
            "cut of {}+{} bytes out of a {} byte chain", offset, len, total);

        let (pieces, suffix) = self.plan_cut(offset, len, total);
        let mut next = suffix;
        for piece in pieces.iter().rev() {
            next = Some(self.shared.node(piece.segment, piece.offset, piece.len, next));
        }

        match next {
            Some(head) => Chain::from_raw(self.shared.clone(), head),
            None => unreachable!("a cut always covers at least one window"),
        }
    }

    /// Collect the windows of a cut. A shared suffix is returned with a reference taken.
    fn plan_cut(&self, start: usize, len: usize, total: usize) -> (Vec<Piece>, Option<NodeId>) {
        let mut arena = self.arena_mut();
        let mut pieces = Vec::new();

        if len == 0 {
            let head = *arena.node(self.head);
            pieces.push(Piece { segment: head.segment, offset: head.offset, len: 0 });
            return (pieces, None);
        }

        let end = start + len;
        let mut pos = 0;
        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            let node = *arena.node(id);
            let node_end = pos + node.len;
            if pos >= end {
                break;
            }

            if pos >= start && end == total {
                arena.incref(id);
                return (pieces, Some(id));
            }

            if node_end > start {
                let from = start.max(pos) - pos;
                let to = end.min(node_end) - pos;
                pieces.push(Piece {
                    segment: node.segment,
                    offset: node.offset + from,
                    len: to - from,
                });
            }

            pos = node_end;
            cursor = node.next;
        }

        (pieces, None)
    }

    /// Remove the first `count` bytes.
    ///
    /// The first retained descriptor is adjusted in place if this chain is its only user and
    /// replaced by a private copy of it otherwise.
    ///
    /// # Panics
    /// If `count` exceeds the length of the chain.
    pub fn delete_head(self, count: usize) -> Chain {
        if count == 0 {
            return self;
        }
        let total = self.len();
        assert!(count <= total, "removing {} bytes of a {} byte chain", count, total);

        let (shared, head) = self.into_raw();
        let (target, skip, node) = {
            let mut arena = shared.arena.borrow_mut();
            let mut rest = count;
            let mut id = head;
            loop {
                let node = arena.node(id);
                match node.next {
                    Some(next) if rest >= node.len => {
                        rest -= node.len;
                        id = next;
                    },
                    _ => break,
                }
            }

            arena.incref(id);
            arena.release(head);
            if arena.node(id).refs == 1 {
                let node = arena.node_mut(id);
                node.offset += rest;
                node.len -= rest;
                drop(arena);
                return Chain::from_raw(shared, id);
            }
            (id, rest, *arena.node(id))
        };

        let copy = shared.reserve("chain nodes", |arena| {
            let copy = arena.new_node(node.segment, node.offset + skip, node.len - skip, node.next)?;
            if let Some(next) = node.next {
                arena.incref(next);
            }
            Some(copy)
        });
        shared.arena.borrow_mut().release(target);
        Chain::from_raw(shared, copy)
    }

    /// Concatenate two chains.
    ///
    /// When the tail of `self` is private and its segment has room for the head window of
    /// `other`, those bytes are copied over instead of linking another descriptor.
    pub fn append(self, other: Chain) -> Chain {
        assert!(Rc::ptr_eq(&self.shared, &other.shared), "appending chains of distinct pools");
        if other.is_empty() {
            return self;
        }
        if self.is_empty() {
            return other;
        }

        let mut this = self;
        this.own_spine();
        let (shared, head) = this.into_raw();
        let (_, other_head) = other.into_raw();
        {
            let mut arena = shared.arena.borrow_mut();
            let mut tail = head;
            while let Some(next) = arena.node(tail).next {
                tail = next;
            }

            let last = *arena.node(tail);
            let first = *arena.node(other_head);
            let room = arena.segment_size(last.segment) - (last.offset + last.len);
            let coalesce = arena.segment_refs(last.segment) == 1
                && first.len <= room
                && first.segment != last.segment;

            if coalesce {
                arena.copy_between(first.segment, first.offset, last.segment, last.offset + last.len, first.len);
                if let Some(next) = first.next {
                    arena.incref(next);
                }
                let node = arena.node_mut(tail);
                node.len += first.len;
                node.next = first.next;
                arena.release(other_head);
            } else {
                arena.node_mut(tail).next = Some(other_head);
            }
        }
        Chain::from_raw(shared, head)
    }

    /// Make every descriptor of the chain private, so that relinking its tail is unobservable.
    fn own_spine(&mut self) {
        self.own_head();
        let mut cursor = self.head;
        loop {
            let next = match self.arena().node(cursor).next {
                Some(next) => next,
                None => break,
            };
            if self.arena().node(next).refs == 1 {
                cursor = next;
                continue;
            }

            let node = *self.arena().node(next);
            let copy = self.shared.reserve("chain nodes", |arena| {
                let copy = arena.new_node(node.segment, node.offset, node.len, node.next)?;
                if let Some(after) = node.next {
                    arena.incref(after);
                }
                Some(copy)
            });
            let mut arena = self.arena_mut();
            arena.node_mut(cursor).next = Some(copy);
            arena.release(next);
            cursor = copy;
        }
    }

    /// Make the head descriptor private, without copying any data.
    pub(crate) fn own_head(&mut self) {
        if self.arena().node(self.head).refs > 1 {
            *self = self.duplicate();
        }
    }

    /// A chain with all bytes in one privately owned window.
    ///
    /// Returns `self` unchanged if it already is one.
    ///
    /// # Panics
    /// If the chain is longer than the largest segment.
    pub fn pack(self) -> Chain {
        let packed = {
            let arena = self.arena();
            arena.node(self.head).next.is_none() && arena.is_private(self.head)
        };
        if packed {
            self
        } else {
            self.copied()
        }
    }

    /// Copy all bytes into a single fresh segment.
    fn copied(&self) -> Chain {
        let len = self.len();
        let largest = self.arena().largest_segment();
        assert!(len <= largest, "cannot pack {} bytes into segments of {} bytes", len, largest);

        let segment = self.shared.reserve("contiguous segments", |arena| arena.take_covering(len));
        let id = self.shared.node(segment, 0, len, None);
        {
            let mut arena = self.arena_mut();
            let mut at = 0;
            let mut cursor = Some(self.head);
            while let Some(src) = cursor {
                let node = *arena.node(src);
                if node.len > 0 {
                    arena.copy_between(node.segment, node.offset, segment, at, node.len);
                }
                at += node.len;
                cursor = node.next;
            }
        }
        Chain::from_raw(self.shared.clone(), id)
    }

    /// Ensure the first `size` bytes are contiguous and start at a multiple of `alignment`.
    ///
    /// Alignment is relative to the segment start, which itself is aligned to `SEGMENT_ALIGN`.
    ///
    /// # Panics
    /// If `alignment` is not a power of two up to `SEGMENT_ALIGN` or `size` exceeds the chain.
    pub fn align(self, size: usize, alignment: usize) -> Chain {
        assert!(alignment.is_power_of_two() && alignment <= SEGMENT_ALIGN,
            "unsupported alignment {}", alignment);
        let total = self.len();
        assert!(size <= total, "aligning {} bytes of a {} byte chain", size, total);

        let aligned = {
            let arena = self.arena();
            let head = arena.node(self.head);
            head.len >= size && head.offset % alignment == 0
        };
        if aligned {
            return self;
        }
        if size == total {
            return self.copied();
        }

        let front = self.cut(0, size).pack();
        let rest = self.delete_head(size);
        front.append(rest)
    }

    /// Replace the chain by a private copy unless it is unique already.
    pub fn make_unique(&mut self) {
        if !self.is_unique() {
            *self = self.copied();
        }
    }

    /// Read the bytes of the head window.
    ///
    /// The pool is borrowed while `f` runs; it must not allocate or drop chains.
    pub fn with_head<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let arena = self.arena();
        f(arena.bytes(self.head))
    }

    /// Write the bytes of the head window, copying the chain first if it is shared.
    pub fn with_head_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.make_unique();
        let mut arena = self.arena_mut();
        f(arena.bytes_mut(self.head))
    }

    /// Fold over all windows in order.
    pub fn fold<B>(&self, init: B, mut f: impl FnMut(B, &[u8]) -> B) -> B {
        let arena = self.arena();
        arena.walk(self.head).fold(init, |acc, id| f(acc, arena.bytes(id)))
    }

    /// Copy bytes starting at `offset` into `buf`, returning how many were copied.
    pub fn copy_out(&self, offset: usize, buf: &mut [u8]) -> usize {
        let mut skip = offset;
        let mut written = 0;
        let arena = self.arena();
        for id in arena.walk(self.head) {
            if written == buf.len() {
                break;
            }
            let bytes = arena.bytes(id);
            if skip >= bytes.len() {
                skip -= bytes.len();
                continue;
            }
            let bytes = &bytes[skip..];
            skip = 0;
            let count = bytes.len().min(buf.len() - written);
            buf[written..written + count].copy_from_slice(&bytes[..count]);
            written += count;
        }
        written
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.fold(Vec::with_capacity(self.len()), |mut vec, bytes| {
            vec.extend_from_slice(bytes);
            vec
        })
    }

    /// Overwrite bytes starting at `offset`, copying the chain first if it is shared.
    ///
    /// # Panics
    /// If the written range is not within the chain.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        let total = self.len();
        assert!(offset + data.len() <= total, "writing {}+{} bytes of a {} byte chain",
            offset, data.len(), total);
        self.make_unique();

        let mut arena = self.arena_mut();
        let mut skip = offset;
        let mut data = data;
        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            if data.is_empty() {
                break;
            }
            cursor = arena.node(id).next;
            let bytes = arena.bytes_mut(id);
            if skip >= bytes.len() {
                skip -= bytes.len();
                continue;
            }
            let count = (bytes.len() - skip).min(data.len());
            bytes[skip..skip + count].copy_from_slice(&data[..count]);
            data = &data[count..];
            skip = 0;
        }
    }

    /// Set the queue link of the head descriptor, returning the previous one.
    pub(crate) fn set_link(&mut self, link: Option<Chain>) -> Option<Chain> {
        self.own_head();
        let new = link.map(|chain| chain.into_raw().1);
        let old = core::mem::replace(&mut self.arena_mut().node_mut(self.head).link, new);
        old.map(|id| Chain::from_raw(self.shared.clone(), id))
    }

    /// Unhook the chain linked from the head descriptor, even one shared with other handles.
    pub(crate) fn take_link(&self) -> Option<Chain> {
        let old = self.arena_mut().node_mut(self.head).link.take();
        old.map(|id| Chain::from_raw(self.shared.clone(), id))
    }

    pub(crate) fn head_id(&self) -> NodeId {
        self.head
    }

    /// Hang `link` off the descriptor `at`, which must belong to the same pool and be unlinked.
    pub(crate) fn attach_link(&self, at: NodeId, link: Chain) {
        assert!(Rc::ptr_eq(&self.shared, &link.shared), "linking chains of distinct pools");
        let (_, id) = link.into_raw();
        let mut arena = self.arena_mut();
        let node = arena.node_mut(at);
        assert!(node.link.is_none(), "descriptor is already linked");
        node.link = Some(id);
    }
}

impl Clone for Chain {
    /// Another handle to the same descriptors.
    fn clone(&self) -> Self {
        self.arena_mut().incref(self.head);
        Chain::from_raw(self.shared.clone(), self.head)
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.shared.arena.borrow_mut().release(self.head);
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Chain")
            .field("len", &self.len())
            .field("nodes", &self.node_count())
            .finish()
    }
}
