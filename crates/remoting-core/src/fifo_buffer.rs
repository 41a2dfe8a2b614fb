//! A bounded, thread-safe byte queue with close semantics,
//! used by pipes and by transports' send queues. Head/tail bookkeeping is
//! centralized in one guarded structure rather than split across atomics,
//! specifically because naive pointer arithmetic at wrap boundaries and near
//! close is the documented failure mode for this kind of ring buffer.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct State {
    queue: VecDeque<u8>,
    capacity: usize,
    closed: bool,
    close_error: Option<String>,
}

impl State {
    fn free_space(&self) -> usize {
        self.capacity - self.queue.len()
    }
}

/// Cloning a `FifoBuffer` shares the same underlying queue (it is already an
/// `Arc` internally), mirroring how a pipe's reader and its producer both
/// hold a handle to one buffer.
#[derive(Clone)]
pub struct FifoBuffer {
    state: Arc<Mutex<State>>,
    not_full: Arc<Condvar>,
    not_empty: Arc<Condvar>,
}

impl FifoBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                queue: VecDeque::with_capacity(capacity.min(4096)),
                capacity,
                closed: false,
                close_error: None,
            })),
            not_full: Arc::new(Condvar::new()),
            not_empty: Arc::new(Condvar::new()),
        }
    }

    /// Blocks until there is room for at least one byte or the buffer
    /// closes, then writes as much of `bytes` as fits without blocking
    /// further, returning the number of bytes actually written.
    pub fn write(&self, bytes: &[u8]) -> std::io::Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(closed_error());
            }
            if state.free_space() > 0 {
                break;
            }
            self.not_full.wait(&mut state);
        }
        let take = bytes.len().min(state.free_space());
        state.queue.extend(&bytes[..take]);
        drop(state);
        self.not_empty.notify_all();
        Ok(take)
    }

    /// Read up to `buf.len()` bytes, blocking until at least one byte is
    /// available or the buffer is closed and drained. Returns `Ok(0)` only
    /// once the buffer is closed *and* empty (EOF), matching the "reads
    /// continue to drain" half of close semantics.
    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        loop {
            if !state.queue.is_empty() {
                break;
            }
            if state.closed {
                if let Some(msg) = &state.close_error {
                    return Err(std::io::Error::other(msg.clone()));
                }
                return Ok(0);
            }
            self.not_empty.wait(&mut state);
        }
        let take = buf.len().min(state.queue.len());
        for slot in buf.iter_mut().take(take) {
            *slot = state.queue.pop_front().expect("checked len above");
        }
        drop(state);
        self.not_full.notify_all();
        Ok(take)
    }

    /// No more writes accepted; reads continue to drain already-buffered
    /// bytes and then observe EOF.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Close with an error: `read` will surface it once the buffer drains.
    pub fn close_with_error(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        state.closed = true;
        state.close_error = Some(message.into());
        drop(state);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn closed_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "FifoBuffer is closed")
}
