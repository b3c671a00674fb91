//! taskmill — a per-core work-requesting task scheduler.
//!
//! Worker threads, each pinned to a processing unit, own private FIFO run
//! queues. An idle worker does not rummage through its peers' queues;
//! instead it posts a steal-request message onto one victim's bounded MPSC
//! channel and waits for a reply on its own single-slot SPSC channel.
//! Requests that cannot be satisfied circulate worker to worker until they
//! either find work or complete a full tour and return home.
//!
//! # Why messages instead of deques
//!
//! Exchanging requests keeps every queue single-consumer: only its owner
//! pops it, including on behalf of thieves. Victims hand over up to half
//! of their pending tasks per request, batched, which amortizes the
//! channel round trip and preserves FIFO order inside the batch.
//!
//! # Layers
//!
//! - [`types`]: task handles, states, priorities, placement hints, masks
//! - [`channel`]: the bounded lock-free request/reply channels
//! - [`queue`]: the per-worker pending/staged/terminated container
//! - [`scheduler`]: the [`WorkRequestingScheduler`] shell and the steal
//!   protocol
//! - [`topology`]: the affinity seam the host runtime plugs into
//!
//! The scheduler is a library component: task execution contexts, worker
//! OS threads, and pinning all belong to the host runtime, which drives
//! [`WorkRequestingScheduler::get_next_thread`] and
//! [`WorkRequestingScheduler::wait_or_add_new`] from its worker loops.

pub mod channel;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod topology;
pub mod types;
pub mod util;

mod registry;

pub use error::{Error, Result};
pub use queue::{QueueInitParams, ThreadQueue};
pub use scheduler::{SchedulerInit, WaitResult, WorkRequestingScheduler};
pub use topology::{AffinitySource, SystemTopology};
pub use types::{
    Mask, ScheduleHint, ScheduleHintMode, ThreadId, ThreadInitData, ThreadPriority, ThreadState,
};
