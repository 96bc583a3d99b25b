use core::fmt;

use super::arena::NodeId;
use super::Chain;

/// A FIFO of chains threaded through the queue link of their head descriptors.
///
/// Queueing needs no storage besides the chains themselves, so it can never fail for lack of
/// memory. Dropping the queue drops all chains in it.
#[derive(Default)]
pub struct ChainQueue {
    head: Option<Chain>,
    /// Head descriptor of the last chain, owned through the link of its predecessor.
    tail: Option<NodeId>,
    len: usize,
}

impl ChainQueue {
    pub fn new() -> Self {
        ChainQueue::default()
    }

    /// Queue a chain at the back.
    pub fn push(&mut self, mut chain: Chain) {
        chain.own_head();
        let id = chain.head_id();
        match self.tail {
            None => self.head = Some(chain),
            Some(tail) => if let Some(head) = &self.head {
                head.attach_link(tail, chain);
            },
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Take the chain at the front.
    pub fn pop(&mut self) -> Option<Chain> {
        let head = self.head.take()?;
        self.head = head.take_link();
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }

    /// Put a chain back at the front.
    pub fn push_front(&mut self, mut chain: Chain) {
        chain.own_head();
        match self.head.take() {
            None => self.tail = Some(chain.head_id()),
            Some(old) => {
                let previous = chain.set_link(Some(old));
                debug_assert!(previous.is_none());
            },
        }
        self.head = Some(chain);
        self.len += 1;
    }

    pub fn front(&self) -> Option<&Chain> {
        self.head.as_ref()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl fmt::Debug for ChainQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChainQueue")
            .field("len", &self.len)
            .finish()
    }
}
