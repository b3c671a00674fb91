//! Core types for the scheduler.
//!
//! This module contains the vocabulary shared by the queue and scheduler
//! layers:
//!
//! - [`ThreadId`]: generation-checked task handle
//! - [`ThreadState`]: task lifecycle states plus the `Unknown` query sentinel
//! - [`ThreadPriority`]: recognized priority tags (one shared queue)
//! - [`ScheduleHint`]: sticky worker placement hint
//! - [`ThreadInitData`]: parameter bundle for task creation

pub mod mask;

pub use mask::Mask;

use crate::util::ArenaIndex;
use core::fmt;

/// Handle of a task managed by the scheduler.
///
/// Tasks are stored in a registry arena; the handle is an index plus a
/// generation, never a pointer, which keeps the task → queue → scheduler
/// reference graph acyclic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) ArenaIndex);

impl ThreadId {
    /// Returns the raw arena slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0.index()
    }

    #[inline]
    pub(crate) const fn arena_index(self) -> ArenaIndex {
        self.0
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({}:{})", self.0.index(), self.0.generation())
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadState {
    /// Query sentinel: matches any state in counting and enumeration.
    #[default]
    Unknown,
    /// Queued and runnable.
    Pending,
    /// Currently executing on a worker.
    Active,
    /// Waiting on an external event; not queued.
    Suspended,
    /// Finished normally; awaiting reclamation.
    Terminated,
    /// Forced to a terminal error state by `abort_all_suspended_threads`.
    Aborted,
}

impl ThreadState {
    /// Returns true for states from which a task can never run again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Aborted)
    }
}

/// Scheduling priority of a task.
///
/// This scheduler is single-priority internally: every recognized tag maps
/// to the same per-worker queue and thread counts are reported identically.
/// The tags exist for interface compatibility with multi-priority
/// schedulers; only [`ThreadPriority::Unknown`] is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadPriority {
    /// Use the scheduler's default priority.
    #[default]
    Default,
    /// Below-normal priority.
    Low,
    /// Normal priority.
    Normal,
    /// Temporarily boosted priority.
    Boost,
    /// High priority.
    High,
    /// High priority, inherited by child tasks.
    HighRecursive,
    /// Invalid tag; rejected with an argument error.
    Unknown,
}

impl ThreadPriority {
    /// Returns true for every tag except [`ThreadPriority::Unknown`].
    #[must_use]
    pub const fn is_recognized(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// How a [`ScheduleHint`] should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleHintMode {
    /// No placement preference; round-robin assignment applies.
    #[default]
    None,
    /// `hint` is a worker index. Out-of-range values wrap by modulo.
    Worker,
}

/// Sticky worker placement hint.
///
/// The scheduler writes the chosen worker back into the creating task's
/// hint so later reschedules land on the same queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleHint {
    /// Interpretation of `hint`.
    pub mode: ScheduleHintMode,
    /// Worker index when `mode` is [`ScheduleHintMode::Worker`].
    pub hint: usize,
}

impl ScheduleHint {
    /// A hint with no placement preference.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            mode: ScheduleHintMode::None,
            hint: 0,
        }
    }

    /// A hint naming a specific worker.
    #[must_use]
    pub const fn worker(index: usize) -> Self {
        Self {
            mode: ScheduleHintMode::Worker,
            hint: index,
        }
    }
}

/// Parameter bundle for task creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadInitData {
    /// Placement hint; updated in place with the chosen worker.
    pub schedule_hint: ScheduleHint,
    /// Priority tag; must be recognized.
    pub priority: ThreadPriority,
    /// Human-readable description for diagnostics.
    pub description: &'static str,
}

impl ThreadInitData {
    /// Creates init data with the given description and default placement.
    #[must_use]
    pub const fn new(description: &'static str) -> Self {
        Self {
            schedule_hint: ScheduleHint::none(),
            priority: ThreadPriority::Default,
            description,
        }
    }

    /// Sets the placement hint.
    #[must_use]
    pub const fn with_hint(mut self, hint: ScheduleHint) -> Self {
        self.schedule_hint = hint;
        self
    }

    /// Sets the priority tag.
    #[must_use]
    pub const fn with_priority(mut self, priority: ThreadPriority) -> Self {
        self.priority = priority;
        self
    }
}
