//! Bounded single-producer single-consumer channel.

use crossbeam_queue::ArrayQueue;

/// A bounded lock-free channel with one producer and one consumer.
///
/// The scheduler uses a capacity-1 instance per worker to carry the reply
/// to that worker's in-flight steal request. Exclusivity of the producer
/// side is guaranteed by the protocol: a worker has at most one request
/// outstanding, and at most one victim holds that request at a time, so at
/// most one peer can be replying. `set` on an occupied channel therefore
/// signals a protocol violation at the call site.
#[derive(Debug)]
pub struct SpscChannel<T> {
    queue: ArrayQueue<T>,
}

impl<T> SpscChannel<T> {
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

    /// Returns true if no message is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_slot_round_trip() {
        let channel = SpscChannel::new(1);
        assert_eq!(channel.get(), None);

        assert!(channel.set(7).is_ok());
        assert_eq!(channel.set(8), Err(8));

        assert_eq!(channel.get(), Some(7));
        assert_eq!(channel.get(), None);

        // The slot is reusable after draining.
        assert!(channel.set(9).is_ok());
        assert_eq!(channel.get(), Some(9));
    }

    #[test]
    fn cross_thread_handoff() {
        let channel = std::sync::Arc::new(SpscChannel::new(1));
        let producer = {
            let channel = std::sync::Arc::clone(&channel);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    let mut value = i;
                    loop {
                        match channel.set(value) {
                            Ok(()) => break,
                            Err(back) => {
                                value = back;
                                std::hint::spin_loop();
                            }
                        }
                    }
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 1000 {
            if let Some(value) = channel.get() {
                received.push(value);
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().expect("producer join");

        for (expected, value) in received.into_iter().enumerate() {
            assert_eq!(value, expected);
        }
    }
}
