use std::collections::BTreeMap;

use sdb_wire::{FrameId, Location, ThreadId};

/// One resolved stack frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: FrameId,
    pub location: Location,
    pub method_name: Option<String>,
    pub source_file: Option<String>,
    pub line: Option<u32>,
}

impl Frame {
    /// Bare frame for a location whose method could not be looked up.
    pub(crate) fn unresolved(id: FrameId, location: Location) -> Self {
        Self {
            id,
            location,
            method_name: None,
            source_file: None,
            line: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: Option<String>,
    pub suspended: bool,
    /// Innermost frame first. Only populated while the thread is stopped.
    pub call_stack: Vec<Frame>,
}

/// The frame the session is currently focused on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveFrame {
    pub thread: ThreadId,
    pub frame: Frame,
}

/// Threads as reported by the agent. Entries are only added in response to
/// agent events and replies.
#[derive(Debug, Clone, Default)]
pub struct ThreadTable {
    threads: BTreeMap<ThreadId, ThreadInfo>,
}

impl ThreadTable {
    pub fn get(&self, id: ThreadId) -> Option<&ThreadInfo> {
        self.threads.get(&id)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.threads.values()
    }

    /// Record a thread the agent told us about. Returns `true` if it was new.
    pub(crate) fn observe(&mut self, id: ThreadId) -> bool {
        if self.threads.contains_key(&id) {
            return false;
        }
        self.threads.insert(
            id,
            ThreadInfo {
                id,
                name: None,
                suspended: false,
                call_stack: Vec::new(),
            },
        );
        true
    }

    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<ThreadInfo> {
        self.threads.remove(&id)
    }

    pub(crate) fn set_name(&mut self, id: ThreadId, name: String) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.name = Some(name);
        }
    }

    pub(crate) fn suspend(&mut self, id: ThreadId) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.suspended = true;
        }
    }

    pub(crate) fn suspend_all(&mut self) {
        for thread in self.threads.values_mut() {
            thread.suspended = true;
        }
    }

    /// Everything resumes together; stacks from the last stop are stale.
    pub(crate) fn resume_all(&mut self) {
        for thread in self.threads.values_mut() {
            thread.suspended = false;
            thread.call_stack.clear();
        }
    }

    pub(crate) fn set_call_stack(&mut self, id: ThreadId, frames: Vec<Frame>) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.call_stack = frames;
        }
    }

    /// Thread to report when the whole VM is paused rather than one thread
    /// stopping on its own.
    pub(crate) fn first(&self) -> Option<ThreadId> {
        self.threads.keys().next().copied()
    }
}
