//! Unidirectional, flow-controlled byte streams between the two peers. A
//! pipe is built from two independent primitives: the writer side holds a
//! [`PipeWindow`] (a TCP-like credit counter mirroring the unread capacity
//! on the reader), the reader side holds a [`crate::fifo_buffer::FifoBuffer`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::command::Oid;
use crate::error::{Error, Result};
use crate::fifo_buffer::FifoBuffer;

/// Flow-control state on the writer side of a pipe.
pub struct PipeWindow {
    initial: u32,
    available: AtomicI64,
    written_total: AtomicI64,
    acked_total: AtomicI64,
    death: Mutex<Option<String>>,
    changed: Condvar,
    lock: Mutex<()>,
}

impl PipeWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            initial,
            available: AtomicI64::new(initial as i64),
            written_total: AtomicI64::new(0),
            acked_total: AtomicI64::new(0),
            death: Mutex::new(None),
            changed: Condvar::new(),
            lock: Mutex::new(()),
        }
    }

    /// Window implementation that never throttles, used when the peer's
    /// `Capability` does not report pipe-throttling support ("degenerate
    /// receivers").
    pub fn unbounded() -> Self {
        Self::new(u32::MAX)
    }

    /// Block until at least `min` bytes of credit are available, then
    /// reserve as many as are available up to `want`, returning the amount
    /// reserved. Fails if the window recorded a peer death.
    pub fn acquire(&self, min: u32, want: u32) -> Result<u32> {
        let mut guard = self.lock.lock();
        loop {
            if let Some(cause) = self.death.lock().clone() {
                return Err(Error::PipeClosed { cause: Some(cause) });
            }
            let available = self.available.load(Ordering::SeqCst);
            if available >= min as i64 {
                let take = available.min(want as i64).max(0) as u32;
                self.available.fetch_sub(take as i64, Ordering::SeqCst);
                self.written_total.fetch_add(take as i64, Ordering::SeqCst);
                return Ok(take);
            }
            self.changed.wait(&mut guard);
        }
    }

    /// Apply a `PipeAckCommand(delta)`: grant back credit and wake blocked
    /// writers.
    pub fn ack(&self, delta: u32) {
        self.available.fetch_add(delta as i64, Ordering::SeqCst);
        self.acked_total.fetch_add(delta as i64, Ordering::SeqCst);
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }

    /// Record that the remote reader died; wakes every blocked writer so
    /// they observe the failure instead of hanging.
    pub fn mark_dead(&self, cause: impl Into<String>) {
        *self.death.lock() = Some(cause.into());
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }

    pub fn available(&self) -> i64 {
        self.available.load(Ordering::SeqCst)
    }

    pub fn written_total(&self) -> i64 {
        self.written_total.load(Ordering::SeqCst)
    }

    pub fn acked_total(&self) -> i64 {
        self.acked_total.load(Ordering::SeqCst)
    }

    /// `initial == available + (written - acked)` (window
    /// conservation invariant).
    pub fn invariant_holds(&self) -> bool {
        self.initial as i64 == self.available() + (self.written_total() - self.acked_total())
    }
}

/// A sink a writer drains bytes into; in practice a channel's outbound
/// command queue, abstracted here so `Pipe` doesn't depend on `Channel`
/// directly.
pub trait PipeSink: Send + Sync {
    fn send_write(&self, oid: Oid, bytes: Vec<u8>);
    fn send_eof(&self, oid: Oid);
    fn send_ack(&self, oid: Oid, delta: u32);
}

/// The writer half of a pipe.
pub struct PipeWriter {
    oid: Oid,
    window: Arc<PipeWindow>,
    sink: Arc<dyn PipeSink>,
}

impl PipeWriter {
    pub fn new(oid: Oid, window: Arc<PipeWindow>, sink: Arc<dyn PipeSink>) -> Self {
        Self { oid, window, sink }
    }

    /// Blocks until window credit is available, consuming bytes from
    /// `bytes` in window-sized bursts until all of it has been transmitted.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < bytes.len() {
            let want = (bytes.len() - offset).min(u32::MAX as usize) as u32;
            let granted = self.window.acquire(1, want)?;
            let end = offset + granted as usize;
            self.sink.send_write(self.oid, bytes[offset..end].to_vec());
            offset = end;
        }
        Ok(())
    }

    pub fn close(&self) {
        self.sink.send_eof(self.oid);
    }
}

/// The reader half of a pipe.
pub struct PipeReader {
    oid: Oid,
    buffer: FifoBuffer,
    sink: Arc<dyn PipeSink>,
}

impl PipeReader {
    pub fn new(oid: Oid, buffer: FifoBuffer, sink: Arc<dyn PipeSink>) -> Self {
        Self { oid, buffer, sink }
    }

    /// Reads into `out` and, for every byte actually drained, asynchronously
    /// acks it back to the writer so its window credit is replenished.
    pub fn read(&self, out: &mut [u8]) -> std::io::Result<usize> {
        let n = self.buffer.read(out)?;
        if n > 0 {
            self.sink.send_ack(self.oid, n as u32);
        }
        Ok(n)
    }

    /// Drives the reader side of a pipe when a `PipeWriteCommand` arrives.
    pub fn on_write(&self, bytes: &[u8]) -> std::io::Result<usize> {
        self.buffer.write(bytes)
    }

    pub fn on_eof(&self) {
        self.buffer.close();
    }

    pub fn on_error(&self, message: impl Into<String>) {
        self.buffer.close_with_error(message);
    }
}

/// One full pipe: a paired writer credit window and reader buffer, plus the
/// OID the peer addresses `PipeWriteCommand`/`PipeAckCommand` to.
pub struct Pipe {
    pub oid: Oid,
    pub writer: PipeWriter,
    pub reader: Arc<PipeReader>,
    pub window: Arc<PipeWindow>,
}

impl Pipe {
    pub fn new(oid: Oid, window_capacity: u32, buffer_capacity: usize, sink: Arc<dyn PipeSink>) -> Self {
        let window = Arc::new(PipeWindow::new(window_capacity));
        let reader = Arc::new(PipeReader::new(oid, FifoBuffer::new(buffer_capacity), sink.clone()));
        let writer = PipeWriter::new(oid, window.clone(), sink);
        Self {
            oid,
            writer,
            reader,
            window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    struct RecordingSink {
        bytes_sent: AtomicUsize,
        bytes_acked: AtomicUsize,
        writes: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                bytes_sent: AtomicUsize::new(0),
                bytes_acked: AtomicUsize::new(0),
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    impl PipeSink for RecordingSink {
        fn send_write(&self, _oid: Oid, bytes: Vec<u8>) {
            self.bytes_sent.fetch_add(bytes.len(), Ordering::SeqCst);
            self.writes.lock().push(bytes);
        }
        fn send_eof(&self, _oid: Oid) {}
        fn send_ack(&self, _oid: Oid, delta: u32) {
            self.bytes_acked.fetch_add(delta as usize, Ordering::SeqCst);
        }
    }

    #[test]
    fn window_conservation_invariant_holds_after_acquire_and_ack() {
        let window = PipeWindow::new(100);
        window.acquire(1, 40).unwrap();
        assert!(window.invariant_holds());
        window.ack(40);
        assert!(window.invariant_holds());
        assert_eq!(window.available(), 100);
    }

    #[test]
    fn write_blocks_until_at_least_one_byte_of_window_is_available() {
        let window = Arc::new(PipeWindow::new(4));
        let sink = Arc::new(RecordingSink::new());
        let writer = PipeWriter::new(1, window.clone(), sink.clone());

        let payload = vec![1u8; 9];
        let writer_handle = {
            let window = window.clone();
            thread::spawn(move || {
                writer.write(&payload).unwrap();
                window
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.bytes_sent.load(Ordering::SeqCst), 4);

        window.ack(1);
        thread::sleep(Duration::from_millis(50));
        assert!(sink.bytes_sent.load(Ordering::SeqCst) >= 5);

        window.ack(100);
        writer_handle.join().unwrap();
        assert_eq!(sink.bytes_sent.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn reader_drains_in_write_order_and_acks_bytes_actually_read() {
        let sink = Arc::new(RecordingSink::new());
        let reader = PipeReader::new(1, FifoBuffer::new(64), sink.clone());
        reader.on_write(b"ab").unwrap();
        reader.on_write(b"cd").unwrap();
        let mut out = [0u8; 4];
        assert_eq!(reader.read(&mut out).unwrap(), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(sink.bytes_acked.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn death_wakes_a_blocked_writer() {
        let window = Arc::new(PipeWindow::new(1));
        let sink = Arc::new(RecordingSink::new());
        let writer = PipeWriter::new(1, window.clone(), sink);
        window.acquire(1, 1).unwrap(); // drain to zero
        let handle = thread::spawn(move || writer.write(b"xx"));
        thread::sleep(Duration::from_millis(30));
        window.mark_dead("reader gone");
        assert!(handle.join().unwrap().is_err());
    }
}
