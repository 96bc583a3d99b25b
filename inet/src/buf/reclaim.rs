use alloc::{boxed::Box, vec::Vec};
use core::fmt;

/// The urgency class of a reclamation callback.
///
/// When the pool runs dry it calls the registered callbacks from the lowest priority value
/// upwards, so low values should free whatever hurts least to lose: cached fragments before
/// reassembly data, data of abandoned connections before that of live ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

pub(crate) struct Registry {
    entries: Vec<Entry>,
}

struct Entry {
    priority: Priority,
    callback: Box<dyn FnMut()>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry { entries: Vec::new() }
    }

    /// Add a callback, after all callbacks of the same or lower priority.
    pub(crate) fn register(&mut self, priority: Priority, callback: Box<dyn FnMut()>) {
        let idx = self.entries.iter()
            .position(|entry| entry.priority > priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(idx, Entry { priority, callback });
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Run the `idx`-th callback in priority order.
    pub(crate) fn invoke(&mut self, idx: usize) -> Priority {
        let entry = &mut self.entries[idx];
        (entry.callback)();
        entry.priority
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "priority {}", self.0)
    }
}
