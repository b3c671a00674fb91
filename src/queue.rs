//! Per-worker thread queue.
//!
//! Each worker owns one [`ThreadQueue`] with three sub-queues:
//!
//! - **pending**: runnable tasks, served strictly FIFO;
//! - **staged**: freshly created tasks not yet admitted to pending;
//! - **terminated**: finished tasks awaiting reclamation.
//!
//! Admission is always at the tail, including re-admission of stolen
//! batches, so pending order is insertion order. Any thread may push onto
//! the sub-queues (task creation routes across workers), but only the
//! owning worker pops pending, which keeps the hot path free of cross-core
//! contention beyond the queue cells themselves.
//!
//! The queue also tracks membership: every task created here stays
//! accounted to this queue until `cleanup_terminated` reclaims it, no
//! matter which worker's pending list the task currently sits in.

use crate::error::{Error, Result};
use crate::registry::{SharedRegistry, ThreadRecord};
use crate::types::{ScheduleHint, ThreadId, ThreadInitData, ThreadState};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::{error, trace};

#[cfg(any(feature = "queue-timing", feature = "queue-waittime"))]
use std::time::Instant;

/// Tuning knobs for a worker's thread queue.
#[derive(Debug, Clone)]
pub struct QueueInitParams {
    /// Staged tasks admitted to pending per `wait_or_add_new` call.
    pub max_add_new_count: usize,
    /// Records reclaimed per partial `cleanup_terminated` call.
    pub max_delete_count: usize,
    /// Terminated backlog that triggers an inline partial cleanup on
    /// `destroy`.
    pub max_terminated_threads: usize,
}

impl Default for QueueInitParams {
    fn default() -> Self {
        Self {
            max_add_new_count: 64,
            max_delete_count: 1000,
            max_terminated_threads: 100,
        }
    }
}

/// Per-worker task container with pending, staged, and terminated
/// sub-queues plus the counters the scheduler reports.
#[derive(Debug)]
pub struct ThreadQueue {
    registry: SharedRegistry,
    params: QueueInitParams,

    pending: SegQueue<ThreadId>,
    staged: SegQueue<ThreadId>,
    terminated: SegQueue<ThreadId>,

    /// Every live task created by this queue, across all states.
    members: Mutex<HashSet<ThreadId>>,

    pending_accesses: AtomicI64,
    pending_misses: AtomicI64,
    stolen_from_pending: AtomicI64,
    stolen_to_pending: AtomicI64,
    stolen_from_staged: AtomicI64,
    stolen_to_staged: AtomicI64,
    creation_time_ns: AtomicU64,
    cleanup_time_ns: AtomicU64,
    pending_wait_ns: AtomicU64,
    pending_wait_samples: AtomicU64,
}

fn read_counter(counter: &AtomicI64, reset: bool) -> i64 {
    if reset {
        counter.swap(0, Ordering::Relaxed)
    } else {
        counter.load(Ordering::Relaxed)
    }
}

fn read_time(counter: &AtomicU64, reset: bool) -> u64 {
    if reset {
        counter.swap(0, Ordering::Relaxed)
    } else {
        counter.load(Ordering::Relaxed)
    }
}

impl ThreadQueue {
    pub(crate) fn new(registry: SharedRegistry, params: QueueInitParams) -> Self {
        Self {
            registry,
            params,
            pending: SegQueue::new(),
            staged: SegQueue::new(),
            terminated: SegQueue::new(),
            members: Mutex::new(HashSet::new()),
            pending_accesses: AtomicI64::new(0),
            pending_misses: AtomicI64::new(0),
            stolen_from_pending: AtomicI64::new(0),
            stolen_to_pending: AtomicI64::new(0),
            stolen_from_staged: AtomicI64::new(0),
            stolen_to_staged: AtomicI64::new(0),
            creation_time_ns: AtomicU64::new(0),
            cleanup_time_ns: AtomicU64::new(0),
            pending_wait_ns: AtomicU64::new(0),
            pending_wait_samples: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Creation and admission
    // ------------------------------------------------------------------

    /// Creates a task record owned by this queue.
    ///
    /// A `Pending` task goes straight to the pending queue when `run_now`
    /// is set and to the staged queue otherwise; a `Suspended` task joins
    /// the membership only. Other initial states are rejected.
    pub(crate) fn create(
        &self,
        init: ThreadInitData,
        initial_state: ThreadState,
        run_now: bool,
        owner: usize,
    ) -> Result<ThreadId> {
        if !init.priority.is_recognized() {
            return Err(Error::UnknownPriority {
                operation: "create_thread",
            });
        }
        if !matches!(initial_state, ThreadState::Pending | ThreadState::Suspended) {
            return Err(Error::InvalidState {
                state: initial_state,
            });
        }

        #[cfg(feature = "queue-timing")]
        let started = Instant::now();

        let id = {
            let mut registry = self.registry.lock();
            registry.insert(ThreadRecord::new(
                initial_state,
                init.priority,
                ScheduleHint::worker(owner),
                owner,
                init.description,
            ))
        };
        self.members.lock().insert(id);

        if initial_state == ThreadState::Pending {
            if run_now {
                self.push_pending(id);
            } else {
                self.staged.push(id);
            }
        }

        #[cfg(feature = "queue-timing")]
        self.creation_time_ns
            .fetch_add(elapsed_ns(started), Ordering::Relaxed);

        trace!(?id, owner, ?initial_state, run_now, "created thread");
        Ok(id)
    }

    /// Admits a task to the pending queue (tail insertion).
    ///
    /// The record's state becomes `Pending`. Used both for normal
    /// scheduling and for re-admission of stolen batches; the tail
    /// insertion preserves extraction order either way.
    pub(crate) fn schedule(&self, id: ThreadId) {
        {
            let mut registry = self.registry.lock();
            let record = registry.get_mut(id);
            debug_assert!(record.is_some(), "scheduling unknown thread {id:?}");
            if let Some(record) = record {
                debug_assert!(!record.state.is_terminal());
                record.state = ThreadState::Pending;
            }
        }
        self.push_pending(id);
    }

    fn push_pending(&self, id: ThreadId) {
        #[cfg(feature = "queue-waittime")]
        {
            let mut registry = self.registry.lock();
            if let Some(record) = registry.get_mut(id) {
                record.enqueued_at = Some(Instant::now());
            }
        }
        self.pending.push(id);
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Pops one pending task.
    ///
    /// With `for_steal` set the caller is extracting work to satisfy a
    /// steal request; the draw is recorded in `stolen_from_pending` instead
    /// of the access/miss counters.
    pub(crate) fn get_next(&self, for_steal: bool) -> Option<ThreadId> {
        let popped = self.pending.pop();
        if for_steal {
            if popped.is_some() {
                self.increment_stolen_from_pending();
            }
        } else {
            self.pending_accesses.fetch_add(1, Ordering::Relaxed);
            if popped.is_none() {
                self.pending_misses.fetch_add(1, Ordering::Relaxed);
            }
        }

        #[cfg(feature = "queue-waittime")]
        if let Some(id) = popped {
            let mut registry = self.registry.lock();
            if let Some(waited) = registry
                .get_mut(id)
                .and_then(|record| record.enqueued_at.take())
            {
                self.pending_wait_ns
                    .fetch_add(elapsed_ns(waited), Ordering::Relaxed);
                self.pending_wait_samples.fetch_add(1, Ordering::Relaxed);
            }
        }

        popped
    }

    /// Approximate pending length; advisory under concurrent mutation.
    #[must_use]
    pub fn pending_length(&self) -> usize {
        self.pending.len()
    }

    /// Combined pending and staged length.
    #[must_use]
    pub fn queue_length(&self) -> i64 {
        (self.pending.len() + self.staged.len()) as i64
    }

    /// Moves staged tasks into pending, recording how many in `added`.
    ///
    /// Returns the termination verdict: `true` only when shutdown was
    /// requested (`running == false`) and this queue has nothing left to
    /// run.
    pub(crate) fn wait_or_add_new(&self, running: bool, added: &mut usize) -> bool {
        let mut admitted = 0;
        while admitted < self.params.max_add_new_count {
            let Some(id) = self.staged.pop() else { break };
            self.push_pending(id);
            admitted += 1;
        }
        *added += admitted;

        !running && self.pending.is_empty() && self.staged.is_empty()
    }

    // ------------------------------------------------------------------
    // Termination and reclamation
    // ------------------------------------------------------------------

    /// Records a task's termination and queues it for reclamation.
    ///
    /// `busy_count` is the caller's count of live tasks and is decremented
    /// once per destroyed task. An oversized terminated backlog triggers an
    /// inline partial cleanup.
    pub(crate) fn destroy(&self, id: ThreadId, busy_count: &mut i64) -> Result<()> {
        {
            let mut registry = self.registry.lock();
            let record = registry.get_mut(id).ok_or(Error::UnknownThread(id))?;
            if !record.state.is_terminal() {
                record.state = ThreadState::Terminated;
            }
        }
        self.terminated.push(id);
        *busy_count -= 1;

        if self.terminated.len() > self.params.max_terminated_threads {
            self.cleanup_terminated(false);
        }
        Ok(())
    }

    /// Drains the terminated list, reclaiming records and membership.
    ///
    /// A partial pass (`delete_all == false`) reclaims at most
    /// `max_delete_count` tasks. Returns `true` only when there was nothing
    /// to reclaim, so a call that performed work reports `false` and the
    /// next call confirms quiescence.
    pub(crate) fn cleanup_terminated(&self, delete_all: bool) -> bool {
        #[cfg(feature = "queue-timing")]
        let started = Instant::now();

        let cap = if delete_all {
            usize::MAX
        } else {
            self.params.max_delete_count
        };

        let mut reclaimed = 0usize;
        while reclaimed < cap {
            let Some(id) = self.terminated.pop() else { break };
            self.members.lock().remove(&id);
            let removed = self.registry.lock().remove(id);
            debug_assert!(removed.is_some(), "terminated thread {id:?} had no record");
            reclaimed += 1;
        }

        #[cfg(feature = "queue-timing")]
        self.cleanup_time_ns
            .fetch_add(elapsed_ns(started), Ordering::Relaxed);

        if reclaimed > 0 {
            trace!(reclaimed, delete_all, "cleaned up terminated threads");
        }
        self.terminated.is_empty() && reclaimed == 0
    }

    /// Moves every suspended member to the `Aborted` terminal state and
    /// queues it for reclamation.
    pub(crate) fn abort_all_suspended(&self) {
        let snapshot: Vec<ThreadId> = self.members.lock().iter().copied().collect();
        let mut aborted = Vec::new();
        {
            let mut registry = self.registry.lock();
            for id in snapshot {
                if let Some(record) = registry.get_mut(id) {
                    if record.state == ThreadState::Suspended {
                        record.state = ThreadState::Aborted;
                        aborted.push(id);
                    }
                }
            }
        }
        for id in &aborted {
            self.terminated.push(*id);
        }
        if !aborted.is_empty() {
            trace!(count = aborted.len(), "aborted suspended threads");
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Counts member tasks in `state`; `ThreadState::Unknown` counts all.
    #[must_use]
    pub fn thread_count(&self, state: ThreadState) -> i64 {
        if state == ThreadState::Unknown {
            return self.members.lock().len() as i64;
        }
        let snapshot: Vec<ThreadId> = self.members.lock().iter().copied().collect();
        let registry = self.registry.lock();
        snapshot
            .into_iter()
            .filter(|&id| registry.get(id).is_some_and(|record| record.state == state))
            .count() as i64
    }

    /// Applies `f` to every member task in `state`, stopping at the first
    /// `false`. No internal lock is held while `f` runs.
    pub(crate) fn enumerate(&self, f: &mut dyn FnMut(ThreadId) -> bool, state: ThreadState) -> bool {
        let snapshot: Vec<ThreadId> = self.members.lock().iter().copied().collect();
        let matching: Vec<ThreadId> = {
            let registry = self.registry.lock();
            snapshot
                .into_iter()
                .filter(|&id| {
                    registry.get(id).is_some_and(|record| {
                        state == ThreadState::Unknown || record.state == state
                    })
                })
                .collect()
        };
        for id in matching {
            if !f(id) {
                return false;
            }
        }
        true
    }

    /// True when this queue can make no progress: nothing runnable and at
    /// least one member suspended.
    #[cfg(feature = "deadlock-detection")]
    pub(crate) fn suspended_only(&self) -> bool {
        self.pending.is_empty()
            && self.staged.is_empty()
            && self.thread_count(ThreadState::Suspended) > 0
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    pub(crate) fn increment_stolen_from_pending(&self) {
        #[cfg(feature = "steal-stats")]
        self.stolen_from_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_stolen_to_pending(&self) {
        #[cfg(feature = "steal-stats")]
        self.stolen_to_pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Pending pop attempts.
    #[must_use]
    pub fn get_num_pending_accesses(&self, reset: bool) -> i64 {
        read_counter(&self.pending_accesses, reset)
    }

    /// Pending pop attempts that found the queue empty.
    #[must_use]
    pub fn get_num_pending_misses(&self, reset: bool) -> i64 {
        read_counter(&self.pending_misses, reset)
    }

    /// Tasks extracted from this queue's pending list by steal responses.
    #[must_use]
    pub fn get_num_stolen_from_pending(&self, reset: bool) -> i64 {
        read_counter(&self.stolen_from_pending, reset)
    }

    /// Stolen tasks admitted to this queue's pending list.
    #[must_use]
    pub fn get_num_stolen_to_pending(&self, reset: bool) -> i64 {
        read_counter(&self.stolen_to_pending, reset)
    }

    /// Tasks stolen out of this queue's staged list. Always zero for this
    /// scheduler: steal responses only ever draw from pending.
    #[must_use]
    pub fn get_num_stolen_from_staged(&self, reset: bool) -> i64 {
        read_counter(&self.stolen_from_staged, reset)
    }

    /// Stolen tasks admitted to this queue's staged list. Always zero for
    /// this scheduler.
    #[must_use]
    pub fn get_num_stolen_to_staged(&self, reset: bool) -> i64 {
        read_counter(&self.stolen_to_staged, reset)
    }

    /// Accumulated task-creation time in nanoseconds.
    ///
    /// Reads zero unless the `queue-timing` feature is enabled.
    #[must_use]
    pub fn get_creation_time(&self, reset: bool) -> u64 {
        read_time(&self.creation_time_ns, reset)
    }

    /// Accumulated reclamation time in nanoseconds.
    ///
    /// Reads zero unless the `queue-timing` feature is enabled.
    #[must_use]
    pub fn get_cleanup_time(&self, reset: bool) -> u64 {
        read_time(&self.cleanup_time_ns, reset)
    }

    /// Average time tasks spent in pending before being popped, in
    /// nanoseconds. Reads zero unless `queue-waittime` is enabled.
    #[must_use]
    pub fn get_average_thread_wait_time(&self) -> u64 {
        let total = self.pending_wait_ns.load(Ordering::Relaxed);
        let samples = self.pending_wait_samples.load(Ordering::Relaxed);
        total / (samples + 1)
    }

    // ------------------------------------------------------------------
    // Lifecycle hooks
    // ------------------------------------------------------------------

    pub(crate) fn on_start(&self, worker: usize) {
        trace!(worker, "thread queue started");
    }

    pub(crate) fn on_stop(&self, worker: usize) {
        trace!(worker, "thread queue stopped");
    }

    pub(crate) fn on_error(&self, worker: usize, error: &Error) {
        error!(worker, %error, "worker reported an error");
    }
}

#[cfg(any(feature = "queue-timing", feature = "queue-waittime"))]
#[allow(clippy::cast_possible_truncation)]
fn elapsed_ns(since: Instant) -> u64 {
    since.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ThreadRegistry;
    use crate::types::ThreadPriority;
    use std::sync::Arc;

    fn queue() -> ThreadQueue {
        let registry = Arc::new(Mutex::new(ThreadRegistry::new()));
        ThreadQueue::new(registry, QueueInitParams::default())
    }

    fn init() -> ThreadInitData {
        ThreadInitData::new("queue test")
    }

    #[test]
    fn run_now_tasks_are_immediately_pending() {
        let queue = queue();
        let a = queue.create(init(), ThreadState::Pending, true, 0).unwrap();
        let b = queue.create(init(), ThreadState::Pending, true, 0).unwrap();

        assert_eq!(queue.pending_length(), 2);
        assert_eq!(queue.get_next(false), Some(a));
        assert_eq!(queue.get_next(false), Some(b));
        assert_eq!(queue.get_next(false), None);
    }

    #[test]
    fn staged_tasks_need_admission() {
        let queue = queue();
        let a = queue.create(init(), ThreadState::Pending, false, 0).unwrap();

        assert_eq!(queue.pending_length(), 0);
        assert_eq!(queue.get_next(false), None);

        let mut added = 0;
        let terminate = queue.wait_or_add_new(true, &mut added);
        assert!(!terminate);
        assert_eq!(added, 1);
        assert_eq!(queue.get_next(false), Some(a));
    }

    #[test]
    fn admission_respects_batch_cap() {
        let registry = Arc::new(Mutex::new(ThreadRegistry::new()));
        let queue = ThreadQueue::new(
            registry,
            QueueInitParams {
                max_add_new_count: 2,
                ..QueueInitParams::default()
            },
        );
        for _ in 0..5 {
            queue.create(init(), ThreadState::Pending, false, 0).unwrap();
        }

        let mut added = 0;
        queue.wait_or_add_new(true, &mut added);
        assert_eq!(added, 2);

        queue.wait_or_add_new(true, &mut added);
        queue.wait_or_add_new(true, &mut added);
        assert_eq!(added, 5);
        assert_eq!(queue.pending_length(), 5);
    }

    #[test]
    fn verdict_requires_shutdown_and_drained_queue() {
        let queue = queue();
        let mut added = 0;

        // Running: never terminate.
        assert!(!queue.wait_or_add_new(true, &mut added));

        // Shutdown with an empty queue: terminate.
        assert!(queue.wait_or_add_new(false, &mut added));

        // Shutdown with local work left: keep going.
        queue.create(init(), ThreadState::Pending, true, 0).unwrap();
        assert!(!queue.wait_or_add_new(false, &mut added));
    }

    #[test]
    fn suspended_tasks_are_members_but_not_queued() {
        let queue = queue();
        queue.create(init(), ThreadState::Suspended, false, 0).unwrap();

        assert_eq!(queue.pending_length(), 0);
        assert_eq!(queue.thread_count(ThreadState::Suspended), 1);
        assert_eq!(queue.thread_count(ThreadState::Unknown), 1);
        assert_eq!(queue.thread_count(ThreadState::Pending), 0);
    }

    #[test]
    fn abort_then_cleanup_reclaims_everything() {
        let queue = queue();
        for _ in 0..3 {
            queue.create(init(), ThreadState::Suspended, false, 0).unwrap();
        }

        queue.abort_all_suspended();
        assert_eq!(queue.thread_count(ThreadState::Aborted), 3);
        assert_eq!(queue.thread_count(ThreadState::Suspended), 0);

        // The reclaiming call reports work done; the next call confirms.
        assert!(!queue.cleanup_terminated(true));
        assert!(queue.cleanup_terminated(true));
        assert_eq!(queue.thread_count(ThreadState::Unknown), 0);
    }

    #[test]
    fn destroy_decrements_busy_count() {
        let queue = queue();
        let id = queue.create(init(), ThreadState::Pending, true, 0).unwrap();
        let _ = queue.get_next(false);

        let mut busy = 5;
        queue.destroy(id, &mut busy).unwrap();
        assert_eq!(busy, 4);
        assert_eq!(queue.thread_count(ThreadState::Terminated), 1);
    }

    #[test]
    fn steal_extraction_counts_separately() {
        let queue = queue();
        for _ in 0..4 {
            queue.create(init(), ThreadState::Pending, true, 0).unwrap();
        }

        let _ = queue.get_next(false);
        let _ = queue.get_next(true);
        let _ = queue.get_next(true);

        assert_eq!(queue.get_num_pending_accesses(false), 1);
        assert_eq!(queue.get_num_pending_misses(false), 0);
        #[cfg(feature = "steal-stats")]
        assert_eq!(queue.get_num_stolen_from_pending(false), 2);
    }

    #[test]
    fn counter_reset_is_read_and_clear() {
        let queue = queue();
        let _ = queue.get_next(false);
        let _ = queue.get_next(false);

        assert_eq!(queue.get_num_pending_misses(true), 2);
        assert_eq!(queue.get_num_pending_misses(false), 0);
    }

    #[test]
    fn unknown_priority_rejected_at_creation() {
        let queue = queue();
        let err = queue
            .create(
                init().with_priority(ThreadPriority::Unknown),
                ThreadState::Pending,
                true,
                0,
            )
            .unwrap_err();
        assert!(err.to_string().contains("unknown thread priority value"));
    }

    #[test]
    fn invalid_initial_state_rejected() {
        let queue = queue();
        let err = queue
            .create(init(), ThreadState::Terminated, true, 0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }
}
