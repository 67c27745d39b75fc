use std::collections::HashMap;

/// In-flight commands keyed by correlation id.
///
/// `T` is whatever the caller needs to resume when the reply arrives. Ids are
/// handed out sequentially, wrap around, skip `0`, and never collide with an id
/// that is still outstanding.
#[derive(Debug)]
pub struct PendingTable<T> {
    next_id: u32,
    pending: HashMap<u32, T>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start allocation at `first_id`; mainly useful to exercise wrap-around.
    pub fn starting_at(first_id: u32) -> Self {
        Self {
            next_id: first_id,
            pending: HashMap::new(),
        }
    }

    fn alloc_id(&mut self) -> u32 {
        loop {
            let current = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if current != 0 && !self.pending.contains_key(&current) {
                return current;
            }
        }
    }

    /// Register `value` and return the correlation id to put on the wire.
    pub fn insert(&mut self, value: T) -> u32 {
        let id = self.alloc_id();
        self.pending.insert(id, value);
        id
    }

    /// Remove and return the entry for a reply. `None` means the reply is
    /// unmatched.
    pub fn complete(&mut self, id: u32) -> Option<T> {
        self.pending.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (u32, T)> + '_ {
        self.pending.drain()
    }
}
