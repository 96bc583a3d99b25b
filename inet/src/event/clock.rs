use alloc::vec::Vec;

use crate::time::{Expiration, Instant};

/// A sorted list of deadlines.
///
/// Every key owns at most one deadline. Timers fire in deadline order and timers with equal
/// deadlines fire in the order they were set; the list is never reordered otherwise.
#[derive(Debug, Clone)]
pub struct Timers<K> {
    list: Vec<Timer<K>>,
}

#[derive(Debug, Clone, Copy)]
struct Timer<K> {
    deadline: Instant,
    key: K,
}

impl<K: Copy + PartialEq> Timers<K> {
    pub fn new() -> Self {
        Timers { list: Vec::new() }
    }

    /// Arm the timer of `key`, replacing its previous deadline.
    pub fn set(&mut self, key: K, deadline: Instant) {
        self.cancel(key);
        let idx = self.list.iter()
            .position(|timer| timer.deadline > deadline)
            .unwrap_or(self.list.len());
        self.list.insert(idx, Timer { deadline, key });
    }

    /// Disarm the timer of `key`. Returns whether it was armed.
    pub fn cancel(&mut self, key: K) -> bool {
        match self.list.iter().position(|timer| timer.key == key) {
            Some(idx) => {
                self.list.remove(idx);
                true
            },
            None => false,
        }
    }

    pub fn deadline(&self, key: K) -> Option<Instant> {
        self.list.iter()
            .find(|timer| timer.key == key)
            .map(|timer| timer.deadline)
    }

    /// The earliest armed deadline.
    pub fn next(&self) -> Expiration {
        self.list.first()
            .map(|timer| Expiration::When(timer.deadline))
            .unwrap_or(Expiration::Never)
    }

    /// Take the earliest timer that has expired at `now`.
    pub fn expire(&mut self, now: Instant) -> Option<K> {
        match self.list.first() {
            Some(timer) if timer.deadline <= now => Some(self.list.remove(0).key),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl<K: Copy + PartialEq> Default for Timers<K> {
    fn default() -> Self {
        Timers::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: i64) -> Instant {
        Instant::from_millis(millis)
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = Timers::new();
        timers.set('a', at(30));
        timers.set('b', at(10));
        timers.set('c', at(30));
        timers.set('d', at(20));
        assert_eq!(timers.next(), Expiration::When(at(10)));

        assert_eq!(timers.expire(at(5)), None);
        assert_eq!(timers.expire(at(40)), Some('b'));
        assert_eq!(timers.expire(at(40)), Some('d'));
        // Equal deadlines keep their insertion order.
        assert_eq!(timers.expire(at(40)), Some('a'));
        assert_eq!(timers.expire(at(40)), Some('c'));
        assert_eq!(timers.expire(at(40)), None);
        assert_eq!(timers.next(), Expiration::Never);
    }

    #[test]
    fn rearm_and_cancel() {
        let mut timers = Timers::new();
        timers.set(1u8, at(10));
        timers.set(2u8, at(20));
        timers.set(1u8, at(25));
        assert_eq!(timers.len(), 2);
        assert_eq!(timers.deadline(1), Some(at(25)));
        assert!(timers.cancel(2));
        assert!(!timers.cancel(2));
        assert_eq!(timers.expire(at(20)), None);
        assert_eq!(timers.expire(at(25)), Some(1));
        assert!(timers.is_empty());
    }
}
