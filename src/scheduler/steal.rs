//! Steal-request and reply types, plus victim selection.
//!
//! A steal request circulates worker to worker until it is satisfied or
//! returns to its originator. The request owns everything a victim needs
//! to reply: the originator's index, a handle on the originator's reply
//! channel, and the mask of workers already visited on this tour.

use crate::channel::SpscChannel;
use crate::types::{Mask, ThreadId};
use crate::util::DetRng;
use smallvec::SmallVec;
use std::sync::Arc;

/// Inline capacity of a task batch; larger steals spill to the heap.
pub(crate) const BATCH_INLINE_CAP: usize = 8;

/// Progress state carried by a circulating steal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealState {
    /// The originator still had local work when it sent the request.
    Working,
    /// The originator was idle when it sent (or recirculated) the request.
    Idle,
    /// The tour ran out of eligible victims; the request is headed home to
    /// be swallowed.
    Failed,
}

/// A work request circulating between workers.
#[derive(Debug)]
pub struct StealRequest {
    /// Index of the originating worker (the thief).
    pub(crate) from: usize,
    /// The originator's reply channel.
    pub(crate) reply: Arc<SpscChannel<TaskBatch>>,
    /// Workers already visited on this tour; always contains `from`.
    pub(crate) victims: Mask,
    /// Number of forwards performed so far.
    pub(crate) attempt: usize,
    /// Progress state.
    pub(crate) state: StealState,
}

impl StealRequest {
    pub(crate) fn new(
        from: usize,
        reply: Arc<SpscChannel<TaskBatch>>,
        victims: Mask,
        idle: bool,
    ) -> Self {
        debug_assert!(victims.test(from), "victim mask must contain the originator");
        Self {
            from,
            reply,
            victims,
            attempt: 0,
            state: if idle { StealState::Idle } else { StealState::Working },
        }
    }
}

/// Tasks sent back to a thief, at most half of the victim's pending queue.
#[derive(Debug)]
pub struct TaskBatch {
    /// Worker the batch was extracted from; feeds last-victim tracking.
    pub(crate) source: usize,
    /// Extracted tasks in FIFO extraction order.
    pub(crate) tasks: SmallVec<[ThreadId; BATCH_INLINE_CAP]>,
}

impl TaskBatch {
    pub(crate) fn new(source: usize) -> Self {
        Self {
            source,
            tasks: SmallVec::new(),
        }
    }

    pub(crate) fn push(&mut self, id: ThreadId) {
        self.tasks.push(id);
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Picks a random victim for `req`, or `None` when every worker has been
/// visited.
///
/// Up to three uniform draws are tried first; if all land on visited
/// workers (or the originator), one more draw picks uniformly among the
/// unvisited set. The originator's bit is always set in the mask, so a
/// returned victim is never the originator.
pub(crate) fn random_victim(
    rng: &mut DetRng,
    worker_count: usize,
    req: &StealRequest,
) -> Option<usize> {
    for _ in 0..3 {
        let candidate = rng.next_usize(worker_count);
        if candidate != req.from && !req.victims.test(candidate) {
            return Some(candidate);
        }
    }

    let unvisited = worker_count - req.victims.count().min(worker_count);
    if unvisited == 0 {
        return None;
    }
    let mut remaining = rng.next_usize(unvisited);
    for candidate in 0..worker_count {
        if !req.victims.test(candidate) {
            if remaining == 0 {
                debug_assert_ne!(candidate, req.from);
                return Some(candidate);
            }
            remaining -= 1;
        }
    }
    None
}
