//! Shared table of thread records.
//!
//! The registry is the single owner of task memory. Queues and the
//! scheduler refer to tasks by [`ThreadId`] and lock the registry only for
//! brief record reads and writes; no lock is ever held across a channel
//! operation or a user callback.

use crate::types::{ScheduleHint, ThreadId, ThreadPriority, ThreadState};
use crate::util::Arena;
use parking_lot::Mutex;
use std::sync::Arc;

#[cfg(feature = "queue-waittime")]
use std::time::Instant;

/// Registry shared between the scheduler and its per-worker queues.
pub(crate) type SharedRegistry = Arc<Mutex<ThreadRegistry>>;

/// Bookkeeping record for one task.
#[derive(Debug)]
pub(crate) struct ThreadRecord {
    /// Current lifecycle state.
    pub state: ThreadState,
    /// Priority tag the task was created with.
    pub priority: ThreadPriority,
    /// Sticky placement hint; always `Worker` after creation.
    pub hint: ScheduleHint,
    /// Index of the worker whose queue owns this task's membership.
    pub owner: usize,
    /// Description supplied at creation, for diagnostics.
    pub description: &'static str,
    /// When the task last entered a pending queue.
    #[cfg(feature = "queue-waittime")]
    pub enqueued_at: Option<Instant>,
}

impl ThreadRecord {
    pub(crate) fn new(
        state: ThreadState,
        priority: ThreadPriority,
        hint: ScheduleHint,
        owner: usize,
        description: &'static str,
    ) -> Self {
        Self {
            state,
            priority,
            hint,
            owner,
            description,
            #[cfg(feature = "queue-waittime")]
            enqueued_at: None,
        }
    }
}

/// Arena of live [`ThreadRecord`]s.
#[derive(Debug, Default)]
pub(crate) struct ThreadRegistry {
    records: Arena<ThreadRecord>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self {
            records: Arena::new(),
        }
    }

    pub(crate) fn insert(&mut self, record: ThreadRecord) -> ThreadId {
        ThreadId(self.records.insert(record))
    }

    pub(crate) fn get(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.records.get(id.arena_index())
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadRecord> {
        self.records.get_mut(id.arena_index())
    }

    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<ThreadRecord> {
        self.records.remove(id.arena_index())
    }

    pub(crate) fn contains(&self, id: ThreadId) -> bool {
        self.records.contains(id.arena_index())
    }
}
