//! Work handoffs between the ingest path and the background workers.
//!
//! An [`EventChannel`] is a rendezvous: a producer publishes one value and
//! blocks until the consumer has fully processed it, the consumer blocks
//! until a value arrives. The engine wires three of these together:
//!
//! ```text
//! caller ──flush_buffer──▶ data worker ──update_index──▶ index worker
//!    ▲                                                        │
//!    └───────────────────── clear_buffer ◀────────────────────┘
//! ```
//!
//! The ordering this enforces is the durability contract: a batch has been
//! persisted before the index observes it, and the caller's staging memory
//! is only reclaimed once the index observes it.

use std::sync::{Condvar, Mutex};

struct ChannelState<T> {
    value: Option<T>,
    in_flight: bool,
    done: bool,
    closed: bool,
}

pub struct EventChannel<T> {
    state: Mutex<ChannelState<T>>,
    cv_start: Condvar,
    cv_done: Condvar,
}

impl<T> EventChannel<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                value: None,
                in_flight: false,
                done: false,
                closed: false,
            }),
            cv_start: Condvar::new(),
            cv_done: Condvar::new(),
        }
    }

    /// Publishes a value and blocks until the consumer calls [`done`].
    /// Concurrent producers serialize, one handoff at a time. Returns
    /// immediately if the channel has been closed.
    ///
    /// [`done`]: EventChannel::done
    pub fn start_and_block_until_done(&self, value: T) {
        let mut state = self.state.lock().unwrap();
        while state.in_flight && !state.closed {
            state = self.cv_done.wait(state).unwrap();
        }
        if state.closed {
            return;
        }
        state.in_flight = true;
        state.value = Some(value);
        self.cv_start.notify_one();
        while !state.done && !state.closed {
            state = self.cv_done.wait(state).unwrap();
        }
        state.done = false;
        state.in_flight = false;
        self.cv_done.notify_all();
    }

    /// Blocks until a value is published. Returns `None` once the channel is
    /// closed and drained, which is the worker shutdown signal.
    pub fn wait(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(value) = state.value.take() {
                return Some(value);
            }
            if state.closed {
                return None;
            }
            state = self.cv_start.wait(state).unwrap();
        }
    }

    /// Completes the in-flight handoff, unblocking the producer.
    pub fn done(&self) {
        let mut state = self.state.lock().unwrap();
        state.done = true;
        self.cv_done.notify_all();
    }

    /// Closes the channel: pending and future waiters wake up, producers
    /// return immediately.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.cv_start.notify_all();
        self.cv_done.notify_all();
    }
}

impl<T> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_handoff_blocks_until_done() {
        let channel = Arc::new(EventChannel::<u32>::new());
        let consumer_channel = channel.clone();

        let consumer = thread::spawn(move || {
            let value = consumer_channel.wait().expect("expected a value");
            assert_eq!(value, 42);
            consumer_channel.done();
        });

        // Returns only after the consumer called done().
        channel.start_and_block_until_done(42);
        consumer.join().unwrap();
    }

    #[test]
    fn test_close_wakes_waiter() {
        let channel = Arc::new(EventChannel::<u32>::new());
        let waiter_channel = channel.clone();

        let waiter = thread::spawn(move || waiter_channel.wait());

        channel.close();
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn test_producers_serialize() {
        let channel = Arc::new(EventChannel::<u32>::new());
        let consumer_channel = channel.clone();

        let consumer = thread::spawn(move || {
            let mut seen = Vec::new();
            for _ in 0..2 {
                let value = consumer_channel.wait().expect("expected a value");
                seen.push(value);
                consumer_channel.done();
            }
            seen
        });

        let producer_channel = channel.clone();
        let producer = thread::spawn(move || producer_channel.start_and_block_until_done(1));
        channel.start_and_block_until_done(2);
        producer.join().unwrap();

        let mut seen = consumer.join().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }
}
