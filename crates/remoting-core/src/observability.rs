//! Ambient instrumentation: a bounded "flight recorder" of raw bytes read on
//! a channel, dumped alongside the close event to aid post-mortem diagnosis
//! of protocol corruption, plus small helpers for attaching a
//! creation-site trace string to a [`crate::command::Command`].

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Ring buffer of the most recently observed raw bytes on a channel.
/// Capacity is bounded in bytes, not in entries: once full, the oldest
/// chunks are evicted to make room.
pub struct FlightRecorder {
    capacity: usize,
    len: usize,
    chunks: Mutex<VecDeque<Vec<u8>>>,
}

impl FlightRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            len: 0,
            chunks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, bytes: &[u8]) {
        if self.capacity == 0 || bytes.is_empty() {
            return;
        }
        let mut chunks = self.chunks.lock();
        chunks.push_back(bytes.to_vec());
        let mut total: usize = chunks.iter().map(Vec::len).sum();
        while total > self.capacity {
            if let Some(front) = chunks.pop_front() {
                total -= front.len();
            } else {
                break;
            }
        }
    }

    /// Concatenate the retained bytes in chronological order, capped to the
    /// configured capacity from the tail.
    pub fn dump(&self) -> Vec<u8> {
        let chunks = self.chunks.lock();
        let mut out = Vec::new();
        for chunk in chunks.iter() {
            out.extend_from_slice(chunk);
        }
        if out.len() > self.capacity {
            let start = out.len() - self.capacity;
            out.drain(..start);
        }
        out
    }
}

/// Emit a structured event for the flight recorder dump at channel close.
/// Kept as a free function (rather than inlined at every call site) so the
/// field names used for post-mortem search stay consistent.
pub fn trace_channel_closed(channel_name: &str, cause: &str, recorder: &FlightRecorder) {
    let bytes = recorder.dump();
    tracing::warn!(
        channel = channel_name,
        cause,
        recorded_bytes = bytes.len(),
        "channel closed; flight recorder dump available"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_once_over_capacity() {
        let recorder = FlightRecorder::new(4);
        recorder.record(b"ab");
        recorder.record(b"cd");
        recorder.record(b"ef");
        assert_eq!(recorder.dump(), b"cdef");
    }

    #[test]
    fn empty_recorder_dumps_nothing() {
        let recorder = FlightRecorder::new(16);
        assert!(recorder.dump().is_empty());
    }
}
