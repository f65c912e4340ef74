//! Serialized command queues for single-owner worker threads.
//!
//! Every stateful worker in the daemon (the playback engine, the audio
//! sink) owns exactly one [`CommandQueue`] and is the only consumer of it.
//! Producers on any thread push closures; the worker pops them in strict
//! FIFO order with a bounded wait, running an idle pass whenever the pop
//! times out.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Multi-producer, single-consumer FIFO with a timed blocking pop.
///
/// `C` is the command type; workers typically use a boxed `FnOnce` so
/// producers can capture whatever context the command needs.
pub struct CommandQueue<C> {
    inner: Mutex<VecDeque<C>>,
    ready: Condvar,
}

impl<C> CommandQueue<C> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Appends a command. Safe to call from any thread.
    pub fn push(&self, command: C) {
        self.inner.lock().push_back(command);
        self.ready.notify_one();
    }

    /// Removes and returns the oldest command, blocking up to `timeout`.
    ///
    /// Returns `None` if the queue is still empty when the timeout
    /// expires; the caller treats that as its idle tick.
    pub fn pop(&self, timeout: Duration) -> Option<C> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.lock();

        while queue.is_empty() {
            if self.ready.wait_until(&mut queue, deadline).timed_out() {
                // A push can still have slipped in between the timeout
                // firing and the lock being reacquired.
                return queue.pop_front();
            }
        }

        queue.pop_front()
    }

    /// Number of commands currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<C> Default for CommandQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pop_returns_commands_in_fifo_order() {
        let queue = CommandQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.pop(Duration::ZERO), Some(1));
        assert_eq!(queue.pop(Duration::ZERO), Some(2));
        assert_eq!(queue.pop(Duration::ZERO), Some(3));
        assert_eq!(queue.pop(Duration::ZERO), None);
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue: CommandQueue<u32> = CommandQueue::new();
        let start = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn push_from_another_thread_wakes_pop() {
        let queue = Arc::new(CommandQueue::new());
        let producer = queue.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(42);
        });

        assert_eq!(queue.pop(Duration::from_secs(5)), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn push_while_popping_interleaves_in_order() {
        let queue = Arc::new(CommandQueue::new());
        let producer = queue.clone();

        let handle = std::thread::spawn(move || {
            for i in 0..100 {
                producer.push(i);
            }
        });

        let mut received = Vec::new();
        while received.len() < 100 {
            if let Some(v) = queue.pop(Duration::from_secs(5)) {
                received.push(v);
            }
        }
        handle.join().unwrap();

        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }
}
