//! The single-threaded substrate the engine runs on.
//!
//! Nothing here blocks or spawns. An [`Events`] queue holds keys of work that was deferred to a
//! later turn of the caller's loop, and [`Timers`] holds deadlines keyed the same way. Both only
//! store keys; the owner interprets a key when it pops one, so no callback ever runs while its
//! owner is borrowed.
//!
//! [`Events`]: struct.Events.html
//! [`Timers`]: struct.Timers.html
use alloc::collections::VecDeque;

mod clock;

pub use self::clock::Timers;

/// A FIFO of deferred work items.
///
/// Each key is queued at most once; enqueueing a key that is already waiting keeps its original
/// position.
#[derive(Debug, Clone)]
pub struct Events<K> {
    queue: VecDeque<K>,
}

impl<K: PartialEq> Events<K> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Events { queue: VecDeque::new() }
    }

    /// Queue a key, returning `false` if it was already waiting.
    pub fn enqueue(&mut self, key: K) -> bool {
        if self.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Take the oldest key.
    pub fn pop(&mut self) -> Option<K> {
        self.queue.pop_front()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.queue.iter().any(|k| k == key)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<K: PartialEq> Default for Events<K> {
    fn default() -> Self {
        Events::new()
    }
}
