//! Work-requesting scheduler.
//!
//! One queue of tasks per worker, one worker per processing unit. Idle
//! workers do not probe peers' queues; they post a [`StealRequest`] message
//! onto a victim's request channel and wait for a [`TaskBatch`] on their own
//! reply channel. Victims answer requests whenever they obtain work of
//! their own, handing over half of their pending queue, or forward the
//! request to another worker.
//!
//! # Protocol invariants
//!
//! - Each worker has at most one steal request in flight (`outstanding`).
//! - A request visits each worker at most once per tour; after
//!   `worker_count - 1` forwards the selector routes it home.
//! - A request that runs out of eligible victims early is marked failed and
//!   swallowed by its originator.
//! - Request channels hold `worker_count` entries and the reply channel one
//!   entry, so channel sends cannot fail while the invariants hold.
//!
//! Only the owning worker mutates its queue, its `outstanding` flag, and
//! its counters; peers touch nothing but the owner's request channel.

pub mod steal;

pub use steal::{StealRequest, StealState, TaskBatch};

use crate::channel::{MpscChannel, SpscChannel};
use crate::error::{Error, Result};
use crate::queue::{QueueInitParams, ThreadQueue};
use crate::registry::{SharedRegistry, ThreadRegistry};
use crate::topology::{AffinitySource, SystemTopology};
use crate::types::{
    Mask, ScheduleHint, ScheduleHintMode, ThreadId, ThreadInitData, ThreadPriority, ThreadState,
};
use crate::util::DetRng;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::trace;

/// Steal responses hand over at most `1 / STEAL_FRACTION_DIVISOR` of the
/// victim's pending queue.
const STEAL_FRACTION_DIVISOR: usize = 2;

/// Sentinel for "no last victim recorded".
#[cfg(feature = "last-victim")]
const NO_VICTIM: usize = usize::MAX;

/// Default seed for the victim-selection PRNG. Victim choice is only a
/// hint, so a fixed seed is fine; override it via [`SchedulerInit`] when
/// distinct schedulers should diverge.
const DEFAULT_RNG_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Construction parameters for [`WorkRequestingScheduler`].
pub struct SchedulerInit {
    /// Number of workers (one per processing unit). Must be at least 1.
    pub worker_count: usize,
    /// Per-worker queue tuning.
    pub queue_init: QueueInitParams,
    /// Topology and affinity provider.
    pub topology: Arc<dyn AffinitySource>,
    /// Description used in diagnostics.
    pub description: &'static str,
    /// Enables the idle-suspended deadlock diagnostic (also requires the
    /// `deadlock-detection` feature).
    pub deadlock_detection: bool,
    /// Seed for the victim-selection PRNG.
    pub rng_seed: u64,
}

impl SchedulerInit {
    /// Creates init parameters with default tuning and an all-active
    /// topology of `worker_count` PUs.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            queue_init: QueueInitParams::default(),
            topology: Arc::new(SystemTopology::new(worker_count)),
            description: "work_requesting_scheduler",
            deadlock_detection: false,
            rng_seed: DEFAULT_RNG_SEED,
        }
    }

    /// Replaces the topology provider.
    #[must_use]
    pub fn with_topology(mut self, topology: Arc<dyn AffinitySource>) -> Self {
        self.topology = topology;
        self
    }

    /// Replaces the queue tuning parameters.
    #[must_use]
    pub fn with_queue_init(mut self, queue_init: QueueInitParams) -> Self {
        self.queue_init = queue_init;
        self
    }

    /// Replaces the PRNG seed.
    #[must_use]
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }
}

impl fmt::Debug for SchedulerInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerInit")
            .field("worker_count", &self.worker_count)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Outcome of one [`WorkRequestingScheduler::wait_or_add_new`] call.
#[derive(Debug, Clone, Copy)]
pub struct WaitResult {
    /// True when the worker should shut down: `running` was false and the
    /// local queue is drained.
    pub terminate: bool,
    /// Tasks admitted to the pending queue during this call (staged
    /// admissions plus re-queued stolen tasks).
    pub added: usize,
    /// The last task of a received steal batch, handed back for immediate
    /// execution without a round trip through the queue.
    pub next_thread: Option<ThreadId>,
}

/// Lazily initialized per-worker state.
struct SlotState {
    queue: ThreadQueue,
    /// Steal requests targeted at this worker; capacity = worker count.
    requests: MpscChannel<StealRequest>,
    /// Reply channel for this worker's own in-flight request.
    reply: Arc<SpscChannel<TaskBatch>>,
    /// Tour-start victim mask: the worker's own bit, sized to the topology.
    victims: Mask,
}

/// One worker's slot, padded to its own cache line.
struct WorkerSlot {
    state: OnceLock<SlotState>,
    /// In-flight steal requests issued by this worker; 0 or 1.
    outstanding: AtomicUsize,
    /// Worker that last supplied a stolen batch (`NO_VICTIM` if none).
    #[cfg(feature = "last-victim")]
    last_victim: AtomicUsize,
    sent: AtomicI64,
    received: AtomicI64,
    discarded: AtomicI64,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            state: OnceLock::new(),
            outstanding: AtomicUsize::new(0),
            #[cfg(feature = "last-victim")]
            last_victim: AtomicUsize::new(NO_VICTIM),
            sent: AtomicI64::new(0),
            received: AtomicI64::new(0),
            discarded: AtomicI64::new(0),
        }
    }
}

fn read_counter(counter: &AtomicI64, reset: bool) -> i64 {
    if reset {
        counter.swap(0, Ordering::Relaxed)
    } else {
        counter.load(Ordering::Relaxed)
    }
}

/// Per-core scheduler in which idle workers acquire work by circulating
/// steal-request messages.
pub struct WorkRequestingScheduler {
    slots: Box<[CachePadded<WorkerSlot>]>,
    registry: SharedRegistry,
    /// Round-robin cursor for tasks without a placement hint.
    curr_queue: AtomicUsize,
    rng: Mutex<DetRng>,
    topology: Arc<dyn AffinitySource>,
    queue_init: QueueInitParams,
    description: &'static str,
    #[cfg_attr(not(feature = "deadlock-detection"), allow(dead_code))]
    deadlock_detection: bool,
}

impl fmt::Debug for WorkRequestingScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkRequestingScheduler")
            .field("worker_count", &self.slots.len())
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl WorkRequestingScheduler {
    /// Creates a scheduler with one slot per worker.
    ///
    /// Slots are initialized lazily on first touch; [`Self::on_start_thread`]
    /// performs the initialization eagerly for a worker entering its loop.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` is zero or the topology is narrower than
    /// the worker count.
    #[must_use]
    pub fn new(init: SchedulerInit) -> Self {
        assert!(init.worker_count > 0, "scheduler needs at least one worker");
        assert!(
            init.topology.mask_size() >= init.worker_count,
            "topology narrower than worker count"
        );

        let slots: Vec<CachePadded<WorkerSlot>> = (0..init.worker_count)
            .map(|_| CachePadded::new(WorkerSlot::new()))
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            registry: Arc::new(Mutex::new(ThreadRegistry::new())),
            curr_queue: AtomicUsize::new(0),
            rng: Mutex::new(DetRng::new(init.rng_seed)),
            topology: init.topology,
            queue_init: init.queue_init,
            description: init.description,
            deadlock_detection: init.deadlock_detection,
        }
    }

    /// The scheduler's diagnostic name.
    #[must_use]
    pub fn scheduler_name(&self) -> &'static str {
        self.description
    }

    /// Number of workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    /// Maximum forwards a steal request performs before returning home.
    #[must_use]
    pub fn max_steal_attempts(&self) -> usize {
        self.worker_count() - 1
    }

    fn slot(&self, worker: usize) -> &WorkerSlot {
        &self.slots[worker]
    }

    fn slot_state(&self, worker: usize) -> &SlotState {
        self.slots[worker].state.get_or_init(|| {
            let mut victims = Mask::new(self.topology.mask_size());
            victims.set(worker);
            SlotState {
                queue: ThreadQueue::new(Arc::clone(&self.registry), self.queue_init.clone()),
                requests: MpscChannel::new(self.worker_count()),
                reply: Arc::new(SpscChannel::new(1)),
                victims,
            }
        })
    }

    fn check_worker(&self, worker: usize) -> Result<()> {
        if worker < self.slots.len() {
            Ok(())
        } else {
            Err(Error::InvalidWorker {
                worker,
                count: self.slots.len(),
            })
        }
    }

    // ------------------------------------------------------------------
    // Task routing
    // ------------------------------------------------------------------

    /// Resolves a placement hint to a worker index.
    ///
    /// Hinted placements may fall back to another active PU when
    /// `allow_fallback` is set; unhinted placements round-robin over all
    /// workers and never fall back.
    fn route(&self, hint: ScheduleHint, allow_fallback: bool) -> usize {
        let worker_count = self.worker_count();
        let (preferred, fallback) = match hint.mode {
            ScheduleHintMode::Worker => (hint.hint, allow_fallback),
            ScheduleHintMode::None => (
                self.curr_queue.fetch_add(1, Ordering::Relaxed),
                false,
            ),
        };
        let preferred = preferred % worker_count;

        let chosen = self.topology.select_active_pu(preferred, fallback);
        debug_assert!(chosen < worker_count);
        chosen
    }

    /// Creates a new task and, when its initial state is pending, schedules
    /// it.
    ///
    /// The chosen worker is written back into the task's schedule hint so
    /// reschedules are sticky.
    pub fn create_thread(
        &self,
        mut init: ThreadInitData,
        initial_state: ThreadState,
        run_now: bool,
    ) -> Result<ThreadId> {
        let worker = self.route(init.schedule_hint, false);
        init.schedule_hint = ScheduleHint::worker(worker);
        self.slot_state(worker)
            .queue
            .create(init, initial_state, run_now, worker)
    }

    /// Admits a task to a worker's pending queue.
    pub fn schedule_thread(
        &self,
        id: ThreadId,
        hint: ScheduleHint,
        allow_fallback: bool,
        priority: ThreadPriority,
    ) -> Result<()> {
        if !priority.is_recognized() {
            return Err(Error::UnknownPriority {
                operation: "schedule_thread",
            });
        }
        if !self.registry.lock().contains(id) {
            return Err(Error::UnknownThread(id));
        }
        let worker = self.route(hint, allow_fallback);
        self.slot_state(worker).queue.schedule(id);
        Ok(())
    }

    /// Admits a task at the tail of a worker's pending queue.
    ///
    /// Pending queues are strictly FIFO, so this is the same admission as
    /// [`Self::schedule_thread`]; the entry point exists for interface
    /// parity with schedulers that distinguish the two.
    pub fn schedule_thread_last(
        &self,
        id: ThreadId,
        hint: ScheduleHint,
        allow_fallback: bool,
        priority: ThreadPriority,
    ) -> Result<()> {
        if !priority.is_recognized() {
            return Err(Error::UnknownPriority {
                operation: "schedule_thread_last",
            });
        }
        if !self.registry.lock().contains(id) {
            return Err(Error::UnknownThread(id));
        }
        let worker = self.route(hint, allow_fallback);
        self.slot_state(worker).queue.schedule(id);
        Ok(())
    }

    /// Records a task's termination with its owning queue.
    ///
    /// `busy_count` is the caller's live-task count, decremented on
    /// success.
    pub fn destroy_thread(&self, id: ThreadId, busy_count: &mut i64) -> Result<()> {
        let owner = {
            let registry = self.registry.lock();
            registry.get(id).ok_or(Error::UnknownThread(id))?.owner
        };
        self.slot_state(owner).queue.destroy(id, busy_count)
    }

    // ------------------------------------------------------------------
    // Task state access (host-runtime hooks)
    // ------------------------------------------------------------------

    /// Sets a task's lifecycle state, returning the previous state.
    ///
    /// This is the host runtime's hook for marking tasks active, suspended,
    /// or terminated around execution; it does not queue or unqueue the
    /// task.
    pub fn set_thread_state(&self, id: ThreadId, state: ThreadState) -> Result<ThreadState> {
        if state == ThreadState::Unknown {
            return Err(Error::InvalidState { state });
        }
        let mut registry = self.registry.lock();
        let record = registry.get_mut(id).ok_or(Error::UnknownThread(id))?;
        Ok(std::mem::replace(&mut record.state, state))
    }

    /// Reads a task's lifecycle state.
    pub fn get_thread_state(&self, id: ThreadId) -> Result<ThreadState> {
        let registry = self.registry.lock();
        registry
            .get(id)
            .map(|record| record.state)
            .ok_or(Error::UnknownThread(id))
    }

    /// Reads a task's sticky placement hint.
    ///
    /// After creation the hint always names the worker the task was routed
    /// to, so reschedules without an explicit hint can stay local.
    pub fn get_thread_schedule_hint(&self, id: ThreadId) -> Result<ScheduleHint> {
        let registry = self.registry.lock();
        registry
            .get(id)
            .map(|record| record.hint)
            .ok_or(Error::UnknownThread(id))
    }

    /// Reads the priority tag a task was created with.
    pub fn get_thread_priority(&self, id: ThreadId) -> Result<ThreadPriority> {
        let registry = self.registry.lock();
        registry
            .get(id)
            .map(|record| record.priority)
            .ok_or(Error::UnknownThread(id))
    }

    /// Reads a task's diagnostic description.
    pub fn get_thread_description(&self, id: ThreadId) -> Result<&'static str> {
        let registry = self.registry.lock();
        registry
            .get(id)
            .map(|record| record.description)
            .ok_or(Error::UnknownThread(id))
    }

    // ------------------------------------------------------------------
    // Steal-request protocol
    // ------------------------------------------------------------------

    fn push_steal_request(&self, victim: usize, req: StealRequest) {
        // Capacity = worker count makes overflow a protocol violation.
        assert!(
            self.slot_state(victim).requests.set(req).is_ok(),
            "steal request channel overflow at worker {victim}"
        );
    }

    /// Picks the next worker to receive `req`, held right now by `worker`.
    ///
    /// A tour that has performed its maximum number of forwards is routed
    /// back to the thief.
    fn next_victim(&self, worker: usize, req: &StealRequest) -> usize {
        let worker_count = self.worker_count();
        if req.attempt == worker_count - 1 {
            return req.from;
        }
        debug_assert!(
            (req.attempt == 0 && req.from == worker) || (req.attempt > 0 && req.from != worker)
        );

        #[cfg(feature = "last-victim")]
        {
            let last = self.slot(worker).last_victim.load(Ordering::Relaxed);
            if last != NO_VICTIM && last != req.from && !req.victims.test(last) {
                return last;
            }
        }

        let mut rng = self.rng.lock();
        steal::random_victim(&mut rng, worker_count, req).unwrap_or(req.from)
    }

    /// Sends `req` onward from `worker`, marking it failed when the
    /// selector was forced to return it home before the tour completed.
    fn forward_steal_request(&self, worker: usize, mut req: StealRequest) {
        let victim = self.next_victim(worker, &req);
        if victim == req.from && req.attempt < self.worker_count() - 1 {
            // Out of eligible victims; send it home to be swallowed.
            req.state = StealState::Failed;
        }
        trace!(worker, victim, from = req.from, attempt = req.attempt, "forwarding steal request");
        self.push_steal_request(victim, req);
        self.slot(worker).sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Retrieves the next viable steal request from `worker`'s channel.
    ///
    /// Failed requests are swallowed on the way: they have completed an
    /// unsuccessful tour and only need the originator's `outstanding` flag
    /// cleared.
    fn try_receiving_steal_request(&self, worker: usize) -> Option<StealRequest> {
        let state = self.slot_state(worker);
        while let Some(req) = state.requests.get() {
            if req.state == StealState::Failed {
                debug_assert_eq!(req.from, worker, "failed request drained off-route");
                let prev = self.slot(req.from).outstanding.swap(0, Ordering::Relaxed);
                debug_assert_eq!(prev, 1);
                trace!(worker, from = req.from, "swallowed failed steal request");
                continue;
            }
            return Some(req);
        }
        None
    }

    /// Declines or forwards a request that cannot be satisfied here.
    ///
    /// Returns true when the request was our own (discarded or
    /// recirculated).
    fn decline_or_forward_steal_request(&self, worker: usize, mut req: StealRequest) -> bool {
        debug_assert!(req.attempt < self.worker_count());

        if req.from == worker {
            // Our own request came back around.
            let state = self.slot_state(worker);
            if state.queue.pending_length() > 0 || req.state == StealState::Idle {
                // Work arrived meanwhile, or an idle tour found nothing
                // anywhere; either way the request dies here.
                self.slot(worker).discarded.fetch_add(1, Ordering::Relaxed);
                let prev = self.slot(worker).outstanding.swap(0, Ordering::Relaxed);
                debug_assert_eq!(prev, 1);
                trace!(worker, "discarded own steal request");
            } else {
                // Still empty-handed: restart the tour as an idle request.
                req.attempt = 0;
                req.state = StealState::Idle;
                req.victims = state.victims.clone();
                self.forward_steal_request(worker, req);
            }
            return true;
        }

        req.attempt += 1;
        req.victims.set(worker); // don't ask a worker twice per tour
        self.forward_steal_request(worker, req);
        false
    }

    /// Handles one incoming steal request: satisfies it with up to half of
    /// the local pending queue, or passes it on.
    ///
    /// Returns true when the request was satisfied (consumed).
    fn handle_steal_request(&self, worker: usize, req: StealRequest) -> bool {
        self.slot(worker).received.fetch_add(1, Ordering::Relaxed);

        if req.from == worker {
            // Our own request; the decline path decides its fate.
            debug_assert!(req.state != StealState::Failed);
            self.decline_or_forward_steal_request(worker, req);
            return false;
        }

        let state = self.slot_state(worker);
        let max_num_to_steal = state.queue.pending_length() / STEAL_FRACTION_DIVISOR;
        if max_num_to_steal != 0 {
            let mut batch = TaskBatch::new(worker);
            while batch.len() < max_num_to_steal {
                let Some(id) = state.queue.get_next(true) else { break };
                batch.push(id);
            }
            if !batch.is_empty() {
                trace!(
                    victim = worker,
                    thief = req.from,
                    count = batch.len(),
                    "satisfying steal request"
                );
                // Reply capacity is 1 and the thief has exactly one request
                // in flight, so the slot must be free.
                assert!(
                    req.reply.set(batch).is_ok(),
                    "steal reply channel occupied for worker {}",
                    req.from
                );
                return true;
            }
        }

        self.decline_or_forward_steal_request(worker, req);
        false
    }

    /// Drains and handles every queued steal request for `worker`, stopping
    /// early once one is satisfied to bound the thief's latency.
    ///
    /// Returns the number of requests handled. The worker loop calls this
    /// implicitly through [`Self::get_next_thread`] and
    /// [`Self::wait_or_add_new`]; it is public so hosts can also relay
    /// requests from maintenance paths.
    pub fn process_steal_requests(&self, worker: usize) -> usize {
        let mut handled = 0;
        while let Some(req) = self.try_receiving_steal_request(worker) {
            handled += 1;
            if self.handle_steal_request(worker, req) {
                break;
            }
        }
        handled
    }

    /// Emits one steal request for `worker` if none is outstanding.
    ///
    /// The request starts idle when the worker has nothing pending,
    /// working otherwise.
    fn send_steal_request(&self, worker: usize) {
        let slot = self.slot(worker);
        if slot.outstanding.load(Ordering::Relaxed) != 0 {
            return;
        }
        let state = self.slot_state(worker);
        let idle = state.queue.pending_length() == 0;
        let req = StealRequest::new(
            worker,
            Arc::clone(&state.reply),
            state.victims.clone(),
            idle,
        );
        let victim = self.next_victim(worker, &req);
        slot.outstanding.store(1, Ordering::Relaxed);
        trace!(worker, victim, idle, "sending steal request");
        self.push_steal_request(victim, req);
        slot.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Tries to receive the reply to `worker`'s outstanding steal request.
    ///
    /// All batch tasks but the last are re-admitted at the tail of the
    /// local pending queue in extraction order; the last is returned for
    /// immediate execution.
    fn try_receiving_tasks(&self, worker: usize, added: &mut usize) -> Option<ThreadId> {
        let state = self.slot_state(worker);
        let batch = state.reply.get()?;

        let prev = self.slot(worker).outstanding.swap(0, Ordering::Relaxed);
        debug_assert_eq!(prev, 1, "reply received with no request outstanding");

        if batch.is_empty() {
            return None;
        }

        let count = batch.len();
        for &id in batch.tasks.iter().take(count - 1) {
            state.queue.schedule(id);
            state.queue.increment_stolen_to_pending();
            *added += 1;
        }
        state.queue.increment_stolen_to_pending();

        #[cfg(feature = "last-victim")]
        {
            debug_assert_ne!(batch.source, worker);
            self.slot(worker)
                .last_victim
                .store(batch.source, Ordering::Relaxed);
        }

        trace!(worker, source = batch.source, count, "received stolen tasks");
        Some(batch.tasks[count - 1])
    }

    // ------------------------------------------------------------------
    // Worker loop entry points
    // ------------------------------------------------------------------

    /// Pops the next task for `worker`.
    ///
    /// On success with stealing enabled, queued steal requests are answered
    /// before returning, on the grounds that more local work is likely
    /// available to share.
    pub fn get_next_thread(&self, worker: usize, enable_stealing: bool) -> Option<ThreadId> {
        let state = self.slot_state(worker);
        let result = state.queue.get_next(false);
        if enable_stealing && result.is_some() {
            let _ = self.process_steal_requests(worker);
        }
        result
    }

    /// Idle-path maintenance for `worker`: admit staged work, otherwise
    /// participate in the steal protocol.
    ///
    /// Steps: move staged tasks into pending; if none arrived and the
    /// scheduler is still running with stealing possible, emit a steal
    /// request (at most one outstanding), try to collect a reply, and
    /// failing that relay whatever requests are queued here.
    ///
    /// `idle_loop_count` is the host's idle-iteration counter, used only by
    /// the deadlock diagnostic.
    pub fn wait_or_add_new(
        &self,
        worker: usize,
        running: bool,
        idle_loop_count: i64,
        enable_stealing: bool,
    ) -> WaitResult {
        let state = self.slot_state(worker);
        let mut added = 0;
        let verdict = state.queue.wait_or_add_new(running, &mut added);

        // Work was available locally.
        if added != 0 {
            return WaitResult {
                terminate: verdict,
                added,
                next_thread: None,
            };
        }

        // Shutdown requested and nothing left to admit.
        if !running {
            return WaitResult {
                terminate: true,
                added,
                next_thread: None,
            };
        }

        // Nobody to steal from, or stealing disabled.
        if self.worker_count() == 1 || !enable_stealing {
            return WaitResult {
                terminate: verdict,
                added,
                next_thread: None,
            };
        }

        self.send_steal_request(worker);
        debug_assert_ne!(self.slot(worker).outstanding.load(Ordering::Relaxed), 0);

        let next_thread = self.try_receiving_tasks(worker, &mut added);
        if next_thread.is_none() {
            // No reply yet; relay whatever requests are parked here.
            let _ = self.process_steal_requests(worker);
        }

        self.check_for_deadlock(worker, idle_loop_count, running);

        WaitResult {
            terminate: verdict,
            added,
            next_thread,
        }
    }

    #[cfg(feature = "deadlock-detection")]
    fn check_for_deadlock(&self, worker: usize, idle_loop_count: i64, running: bool) {
        if !self.deadlock_detection || !tracing::enabled!(tracing::Level::ERROR) {
            return;
        }
        let suspended_only =
            (0..self.worker_count()).all(|i| self.slot_state(i).queue.suspended_only());
        if suspended_only {
            tracing::error!(
                worker,
                idle_loop_count,
                running,
                "no new work available, are we deadlocked?"
            );
        }
    }

    #[cfg(not(feature = "deadlock-detection"))]
    fn check_for_deadlock(&self, _worker: usize, _idle_loop_count: i64, _running: bool) {}

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Initializes `worker`'s slot (queue, channels, victim mask) and runs
    /// the queue's start hook.
    pub fn on_start_thread(&self, worker: usize) {
        let state = self.slot_state(worker);
        state.queue.on_start(worker);
    }

    /// Runs `worker`'s queue stop hook.
    pub fn on_stop_thread(&self, worker: usize) {
        self.slot_state(worker).queue.on_stop(worker);
    }

    /// Forwards a worker error to its queue.
    pub fn on_error(&self, worker: usize, error: &Error) {
        self.slot_state(worker).queue.on_error(worker, error);
    }

    /// Restarts round-robin placement at worker 0.
    pub fn reset_thread_distribution(&self) {
        self.curr_queue.store(0, Ordering::Release);
    }

    /// Aborts every suspended task on every worker.
    pub fn abort_all_suspended_threads(&self) {
        for worker in 0..self.worker_count() {
            self.slot_state(worker).queue.abort_all_suspended();
        }
    }

    /// Reclaims terminated tasks on every worker.
    ///
    /// Returns true only when every queue had nothing left to reclaim.
    pub fn cleanup_terminated(&self, delete_all: bool) -> bool {
        let mut empty = true;
        for worker in 0..self.worker_count() {
            empty = self.slot_state(worker).queue.cleanup_terminated(delete_all) && empty;
        }
        empty
    }

    /// Reclaims terminated tasks on one worker.
    pub fn cleanup_terminated_on(&self, worker: usize, delete_all: bool) -> bool {
        self.slot_state(worker).queue.cleanup_terminated(delete_all)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    fn queue_sum(&self, worker: Option<usize>, f: impl Fn(&ThreadQueue) -> i64) -> i64 {
        match worker {
            Some(worker) => f(&self.slot_state(worker).queue),
            None => (0..self.worker_count())
                .map(|i| f(&self.slot_state(i).queue))
                .sum(),
        }
    }

    fn slot_counter(&self, worker: Option<usize>, f: impl Fn(&WorkerSlot) -> i64) -> i64 {
        match worker {
            Some(worker) => f(self.slot(worker)),
            None => (0..self.worker_count()).map(|i| f(self.slot(i))).sum(),
        }
    }

    /// Combined pending and staged length of one worker's queue, or all.
    #[must_use]
    pub fn get_queue_length(&self, worker: Option<usize>) -> i64 {
        self.queue_sum(worker, ThreadQueue::queue_length)
    }

    /// Counts tasks in `state` on one worker, or across all workers.
    ///
    /// All recognized priorities share one queue, so the count is identical
    /// for each of them; [`ThreadPriority::Unknown`] is rejected.
    pub fn get_thread_count(
        &self,
        state: ThreadState,
        priority: ThreadPriority,
        worker: Option<usize>,
    ) -> Result<i64> {
        if !priority.is_recognized() {
            return Err(Error::UnknownPriority {
                operation: "get_thread_count",
            });
        }
        if let Some(worker) = worker {
            self.check_worker(worker)?;
        }
        Ok(self.queue_sum(worker, |queue| queue.thread_count(state)))
    }

    /// Applies `f` to every task in `state` across all workers, stopping at
    /// the first `false`.
    pub fn enumerate_threads<F>(&self, mut f: F, state: ThreadState) -> bool
    where
        F: FnMut(ThreadId) -> bool,
    {
        for worker in 0..self.worker_count() {
            if !self.slot_state(worker).queue.enumerate(&mut f, state) {
                return false;
            }
        }
        true
    }

    /// Number of in-flight steal requests issued by `worker` (0 or 1).
    #[must_use]
    pub fn outstanding_steal_requests(&self, worker: usize) -> usize {
        self.slot(worker).outstanding.load(Ordering::Relaxed)
    }

    /// Steal requests sent (fresh sends plus forwards) by a worker, or all.
    #[must_use]
    pub fn get_num_steal_requests_sent(&self, worker: Option<usize>, reset: bool) -> i64 {
        self.slot_counter(worker, |slot| read_counter(&slot.sent, reset))
    }

    /// Steal requests drained by a worker, or all.
    #[must_use]
    pub fn get_num_steal_requests_received(&self, worker: Option<usize>, reset: bool) -> i64 {
        self.slot_counter(worker, |slot| read_counter(&slot.received, reset))
    }

    /// Own steal requests a worker discarded after they returned home.
    #[must_use]
    pub fn get_num_steal_requests_discarded(&self, worker: Option<usize>, reset: bool) -> i64 {
        self.slot_counter(worker, |slot| read_counter(&slot.discarded, reset))
    }

    /// Pending-queue pop attempts.
    #[must_use]
    pub fn get_num_pending_accesses(&self, worker: Option<usize>, reset: bool) -> i64 {
        self.queue_sum(worker, |queue| queue.get_num_pending_accesses(reset))
    }

    /// Pending-queue pop attempts that found nothing.
    #[must_use]
    pub fn get_num_pending_misses(&self, worker: Option<usize>, reset: bool) -> i64 {
        self.queue_sum(worker, |queue| queue.get_num_pending_misses(reset))
    }

    /// Tasks extracted from pending queues by steal responses.
    #[must_use]
    pub fn get_num_stolen_from_pending(&self, worker: Option<usize>, reset: bool) -> i64 {
        self.queue_sum(worker, |queue| queue.get_num_stolen_from_pending(reset))
    }

    /// Stolen tasks admitted to pending queues.
    #[must_use]
    pub fn get_num_stolen_to_pending(&self, worker: Option<usize>, reset: bool) -> i64 {
        self.queue_sum(worker, |queue| queue.get_num_stolen_to_pending(reset))
    }

    /// Tasks extracted from staged queues by steal responses (always zero
    /// for this scheduler).
    #[must_use]
    pub fn get_num_stolen_from_staged(&self, worker: Option<usize>, reset: bool) -> i64 {
        self.queue_sum(worker, |queue| queue.get_num_stolen_from_staged(reset))
    }

    /// Stolen tasks admitted to staged queues (always zero for this
    /// scheduler).
    #[must_use]
    pub fn get_num_stolen_to_staged(&self, worker: Option<usize>, reset: bool) -> i64 {
        self.queue_sum(worker, |queue| queue.get_num_stolen_to_staged(reset))
    }

    /// Accumulated task-creation time in nanoseconds (zero unless the
    /// `queue-timing` feature is enabled).
    #[must_use]
    pub fn get_creation_time(&self, worker: Option<usize>, reset: bool) -> u64 {
        match worker {
            Some(worker) => self.slot_state(worker).queue.get_creation_time(reset),
            None => (0..self.worker_count())
                .map(|i| self.slot_state(i).queue.get_creation_time(reset))
                .sum(),
        }
    }

    /// Accumulated reclamation time in nanoseconds (zero unless the
    /// `queue-timing` feature is enabled).
    #[must_use]
    pub fn get_cleanup_time(&self, worker: Option<usize>, reset: bool) -> u64 {
        match worker {
            Some(worker) => self.slot_state(worker).queue.get_cleanup_time(reset),
            None => (0..self.worker_count())
                .map(|i| self.slot_state(i).queue.get_cleanup_time(reset))
                .sum(),
        }
    }

    /// Average pending wait in nanoseconds (zero unless the
    /// `queue-waittime` feature is enabled).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn get_average_thread_wait_time(&self, worker: Option<usize>) -> u64 {
        match worker {
            Some(worker) => self.slot_state(worker).queue.get_average_thread_wait_time(),
            None => {
                let total: u64 = (0..self.worker_count())
                    .map(|i| self.slot_state(i).queue.get_average_thread_wait_time())
                    .sum();
                total / (self.worker_count() as u64 + 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(workers: usize) -> WorkRequestingScheduler {
        WorkRequestingScheduler::new(SchedulerInit::new(workers))
    }

    fn pending_task(s: &WorkRequestingScheduler, worker: usize) -> ThreadId {
        s.create_thread(
            ThreadInitData::new("test").with_hint(ScheduleHint::worker(worker)),
            ThreadState::Pending,
            true,
        )
        .expect("create")
    }

    #[test]
    fn round_robin_after_reset_targets_workers_in_order() {
        let s = scheduler(4);
        // Skew the cursor; staged tasks stay out of the pending queues.
        for _ in 0..3 {
            let _ = s.create_thread(ThreadInitData::new("skew"), ThreadState::Pending, false);
        }
        s.reset_thread_distribution();

        let mut owners = Vec::new();
        for _ in 0..4 {
            let id = s
                .create_thread(ThreadInitData::new("rr"), ThreadState::Pending, true)
                .unwrap();
            let mut found = None;
            for worker in 0..4 {
                if s.get_next_thread(worker, false) == Some(id) {
                    found = Some(worker);
                    break;
                }
            }
            owners.push(found.expect("task landed on some worker"));
        }
        assert_eq!(owners, vec![0, 1, 2, 3]);
    }

    #[test]
    fn out_of_range_hint_wraps_by_modulo() {
        let s = scheduler(2);
        let id = s
            .create_thread(
                ThreadInitData::new("wrap").with_hint(ScheduleHint::worker(5)),
                ThreadState::Pending,
                true,
            )
            .unwrap();
        // 5 % 2 == 1
        assert_eq!(s.get_next_thread(1, false), Some(id));
    }

    #[test]
    fn creation_metadata_is_readable() {
        let s = scheduler(2);
        let id = s
            .create_thread(
                ThreadInitData::new("metadata probe")
                    .with_hint(ScheduleHint::worker(1))
                    .with_priority(ThreadPriority::High),
                ThreadState::Pending,
                true,
            )
            .unwrap();

        assert_eq!(s.get_thread_priority(id).unwrap(), ThreadPriority::High);
        assert_eq!(s.get_thread_description(id).unwrap(), "metadata probe");
        assert_eq!(s.get_thread_state(id).unwrap(), ThreadState::Pending);
    }

    #[test]
    fn hint_is_sticky_after_creation() {
        let s = scheduler(3);
        let id = pending_task(&s, 2);
        assert_eq!(s.get_next_thread(2, false), Some(id));

        // The chosen worker was written back into the task's hint.
        let hint = s.get_thread_schedule_hint(id).unwrap();
        assert_eq!(hint, ScheduleHint::worker(2));

        // Reschedule with the written-back hint: same queue.
        s.schedule_thread(id, hint, false, ThreadPriority::Normal)
            .unwrap();
        assert_eq!(s.get_next_thread(2, false), Some(id));
    }

    #[test]
    fn unknown_priority_is_rejected_everywhere() {
        let s = scheduler(2);
        let id = pending_task(&s, 0);

        let err = s
            .get_thread_count(ThreadState::Unknown, ThreadPriority::Unknown, None)
            .unwrap_err();
        assert!(err.to_string().contains("unknown thread priority value"));

        let err = s
            .schedule_thread(id, ScheduleHint::none(), false, ThreadPriority::Unknown)
            .unwrap_err();
        assert!(err.to_string().contains("unknown thread priority value"));
    }

    #[test]
    fn worker_bounds_checked_in_thread_count() {
        let s = scheduler(2);
        let err = s
            .get_thread_count(ThreadState::Unknown, ThreadPriority::Default, Some(7))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidWorker { worker: 7, count: 2 }));
    }

    #[test]
    fn single_worker_never_sends_steal_requests() {
        let s = scheduler(1);
        let _ = pending_task(&s, 0);

        let result = s.wait_or_add_new(0, true, 0, true);
        assert!(!result.terminate);
        assert_eq!(s.get_num_steal_requests_sent(None, false), 0);
        assert_eq!(s.outstanding_steal_requests(0), 0);
    }

    #[test]
    fn stealing_disabled_skips_the_protocol() {
        let s = scheduler(4);
        let result = s.wait_or_add_new(0, true, 0, false);
        assert!(!result.terminate);
        assert_eq!(s.get_num_steal_requests_sent(None, false), 0);
    }

    #[test]
    fn shutdown_verdict_when_drained() {
        let s = scheduler(2);
        let result = s.wait_or_add_new(0, false, 0, true);
        assert!(result.terminate);
        assert_eq!(result.added, 0);
    }

    #[test]
    fn destroy_unknown_thread_errors() {
        let s = scheduler(1);
        let id = pending_task(&s, 0);
        assert_eq!(s.get_next_thread(0, false), Some(id));
        let mut busy = 1;
        s.destroy_thread(id, &mut busy).unwrap();
        s.cleanup_terminated(true);

        let err = s.destroy_thread(id, &mut busy).unwrap_err();
        assert!(matches!(err, Error::UnknownThread(_)));
    }

    #[test]
    fn enumerate_short_circuits() {
        let s = scheduler(2);
        for worker in 0..2 {
            let _ = pending_task(&s, worker);
            let _ = pending_task(&s, worker);
        }

        let mut seen = 0;
        let completed = s.enumerate_threads(
            |_| {
                seen += 1;
                seen < 2
            },
            ThreadState::Pending,
        );
        assert!(!completed);
        assert_eq!(seen, 2);
    }
}
