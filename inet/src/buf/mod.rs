//! The segment pool.
//!
//! All packet data lives in fixed size *segments* that are allocated once, when the [`Pool`] is
//! created, and never move. A [`Chain`] is an ordered list of windows into segments and stands
//! for one contiguous byte stream, usually a packet or a connection's queued data. Windows are
//! reference counted, both the descriptor itself and the segment it points into, so that cutting
//! a packet apart, putting it back together or handing the same bytes to two consumers never
//! copies data.
//!
//! ## Ownership
//!
//! A `Chain` is a handle. Cloning it shares the very same descriptors; [`Chain::duplicate`]
//! creates a fresh head descriptor over the same bytes. Dropping the last handle returns every
//! descriptor and segment that became unreferenced to the free lists of the pool. Data can be
//! read through any handle but is only written through one that owns every descriptor and segment
//! it touches exclusively; the mutating methods make a private copy first otherwise.
//!
//! ## Exhaustion
//!
//! Running out of segments is not an error that is returned to callers. Instead, layers register
//! callbacks with a [`Priority`] that free buffers they can live without. These are called in
//! ascending priority order until the allocation can be served. If all of them have run and there
//! is still no room, the pool is misconfigured for its load and the process panics.
//!
//! [`Pool`]: struct.Pool.html
//! [`Chain`]: struct.Chain.html
//! [`Chain::duplicate`]: struct.Chain.html#method.duplicate
//! [`Priority`]: struct.Priority.html
use alloc::{boxed::Box, rc::Rc, vec, vec::Vec};
use core::cell::RefCell;
use core::fmt;

mod arena;
mod chain;
mod queue;
mod reclaim;


use self::arena::{Arena, NodeId, SegmentId};

pub use self::arena::{ClassStats, SEGMENT_ALIGN};
pub use self::chain::Chain;
pub use self::queue::ChainQueue;
pub use self::reclaim::Priority;

/// The number and size of segments of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Class {
    /// Bytes per segment, rounded up to a multiple of `SEGMENT_ALIGN`.
    pub size: usize,
    /// Number of segments preallocated.
    pub count: usize,
}

/// Start-of-day dimensions of a pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub classes: Vec<Class>,
    /// Number of chain node descriptors, shared by all classes.
    pub nodes: usize,
}

/// A snapshot of pool occupancy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stats {
    pub classes: Vec<ClassStats>,
    pub total_nodes: usize,
    pub free_nodes: usize,
}

/// The handle to one segment pool.
///
/// Cheap to clone, every clone refers to the same storage. The engine and every chain carry one.
#[derive(Clone)]
pub struct Pool {
    shared: Rc<Shared>,
}

pub(crate) struct Shared {
    arena: RefCell<Arena>,
    registry: RefCell<reclaim::Registry>,
}

impl Pool {
    /// Preallocate all segments and descriptors.
    pub fn new(config: &Config) -> Self {
        let shared = Shared {
            arena: RefCell::new(Arena::new(config)),
            registry: RefCell::new(reclaim::Registry::new()),
        };
        Pool { shared: Rc::new(shared) }
    }

    /// Allocate a chain of exactly `size` bytes.
    ///
    /// The content is unspecified. A request larger than any segment is served by several
    /// segments; a request of zero bytes still yields a (zero length) chain.
    ///
    /// # Panics
    /// When the pool stays exhausted after running every reclamation callback.
    pub fn alloc(&self, size: usize) -> Chain {
        let (head, len) = self.shared.grab(size);
        let mut tail = head;
        let mut remaining = size - len;
        while remaining > 0 {
            let (id, len) = self.shared.grab(remaining);
            self.shared.arena.borrow_mut().node_mut(tail).next = Some(id);
            tail = id;
            remaining -= len;
        }
        Chain::from_raw(self.shared.clone(), head)
    }

    /// Allocate a chain holding a copy of `data`.
    pub fn alloc_from(&self, data: &[u8]) -> Chain {
        let mut chain = self.alloc(data.len());
        chain.write_at(0, data);
        chain
    }

    /// Register a reclamation callback.
    ///
    /// The callback should free buffers of its class and must tolerate being called when there
    /// is nothing left to free. It must not allocate nor register further callbacks.
    pub fn register<F>(&self, priority: Priority, callback: F)
        where F: FnMut() + 'static,
    {
        self.shared.registry.borrow_mut().register(priority, Box::new(callback));
    }

    /// The number of bytes the largest segment holds.
    ///
    /// This bounds every contiguous view, see `Chain::pack`.
    pub fn largest_segment(&self) -> usize {
        self.shared.arena.borrow().largest_segment()
    }

    pub fn stats(&self) -> Stats {
        let arena = self.shared.arena.borrow();
        Stats {
            classes: arena.class_stats(),
            total_nodes: arena.total_nodes(),
            free_nodes: arena.free_nodes(),
        }
    }

    pub(crate) fn same(&self, other: &Pool) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Shared {
    /// Run `attempt` against the arena, reclaiming memory between failed attempts.
    pub(crate) fn reserve<T>(&self, what: &str, mut attempt: impl FnMut(&mut Arena) -> Option<T>) -> T {
        if let Some(value) = attempt(&mut *self.arena.borrow_mut()) {
            return value;
        }

        let count = self.registry.borrow().len();
        for idx in 0..count {
            let priority = self.registry.borrow_mut().invoke(idx);
            net_debug!("pool: out of {}, reclaimed at {}", what, priority);
            if let Some(value) = attempt(&mut *self.arena.borrow_mut()) {
                return value;
            }
        }

        net_warn!("pool: out of {} after reclaiming at every priority", what);
        panic!("segment pool exhausted: out of {}", what)
    }

    /// Allocate one node over a fresh segment, for up to `want` bytes.
    fn grab(&self, want: usize) -> (NodeId, usize) {
        let segment = self.reserve("segments", |arena| arena.take_segment(want));
        let len = want.min(self.arena.borrow().segment_size(segment));
        let id = self.node(segment, 0, len, None);
        (id, len)
    }

    /// Allocate one node, moving the caller's reference of `next` into it.
    pub(crate) fn node(&self, segment: SegmentId, offset: usize, len: usize, next: Option<NodeId>) -> NodeId {
        self.reserve("chain nodes", |arena| arena.new_node(segment, offset, len, next))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            classes: vec![
                Class { size: 512, count: 256 },
                Class { size: 2048, count: 64 },
                Class { size: 32 * 1024, count: 4 },
            ],
            nodes: 1024,
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pool")
            .field("stats", &self.stats())
            .finish()
    }
}
