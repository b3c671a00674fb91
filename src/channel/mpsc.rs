//! Bounded multi-producer single-consumer channel.

use crossbeam_queue::ArrayQueue;

/// A bounded lock-free channel carrying messages from many producers to one
/// consumer.
///
/// Any worker may `set` onto another worker's channel; only the owning
/// worker calls `get`. The queue itself tolerates concurrent consumers, so
/// the single-consumer discipline is a protocol contract, not a memory
/// safety requirement.
#[derive(Debug)]
pub struct MpscChannel<T> {
    queue: ArrayQueue<T>,
}

impl<T> MpscChannel<T> {
    /// Creates a channel holding at most `capacity` messages.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Enqueues `value`, returning it back if the channel is full.
    #[inline]
    pub fn set(&self, value: T) -> Result<(), T> {
        self.queue.push(value)
    }

    /// Dequeues the oldest message, if any.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Returns the channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Returns true if no message is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
