//! Adapts a raw byte channel (normally a `mio::net::TcpStream`) to the
//! protocol stack. Maintains a bounded
//! send-queue and a recv-buffer; readiness events drive draining/filling
//! them, and upstream code (a `FilterLayer` chain or the application layer
//! directly) is notified via the [`NetworkLayerObserver`] callback.

use std::io::{self, Read, Write};
use std::sync::Arc;

use remoting_core::fifo_buffer::FifoBuffer;

const RECV_SCRATCH_SIZE: usize = 64 * 1024;

/// Upward notifications a `NetworkLayer` delivers as it processes readiness
/// events. Implemented by whatever owns the `FilterLayer`/`ApplicationLayer`
/// chain sitting above this byte stream.
pub trait NetworkLayerObserver: Send {
    /// Bytes received from the peer, in order.
    fn on_recv(&mut self, bytes: &[u8]);
    /// The peer half-closed or the connection failed; `cause` is `None` for
    /// a clean EOF.
    fn on_recv_closed(&mut self, cause: Option<io::Error>);
}

/// A `Read + Write` byte channel plus a bounded outbound queue and a
/// callback-driven inbound path.
pub struct NetworkLayer<S> {
    stream: S,
    send_queue: FifoBuffer,
    observer: Box<dyn NetworkLayerObserver>,
    recv_closed: bool,
}

impl<S> NetworkLayer<S>
where
    S: Read + Write,
{
    pub fn new(stream: S, send_queue_capacity: usize, observer: Box<dyn NetworkLayerObserver>) -> Self {
        Self {
            stream,
            send_queue: FifoBuffer::new(send_queue_capacity),
            observer,
            recv_closed: false,
        }
    }

    /// Enqueue bytes for transmission. Blocks the calling thread if the
    /// send queue is full; callers on the selector thread must never call
    /// this directly — only application threads pushing outbound commands
    /// should.
    pub fn enqueue_send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < bytes.len() {
            offset += self.send_queue.write(&bytes[offset..])?;
        }
        Ok(())
    }

    pub fn close_send(&self) {
        self.send_queue.close();
    }

    /// Drive the recv side: called when the selector reports the stream is
    /// readable. Repeatedly reads into a scratch buffer and pushes bytes
    /// upstream until the stream would block (re-arm read) or returns EOF.
    /// Returns `true` once read-interest should be re-armed (more data may
    /// still arrive), `false` if the recv side is now permanently closed.
    pub fn on_readable(&mut self) -> bool {
        if self.recv_closed {
            return false;
        }
        let mut scratch = vec![0u8; RECV_SCRATCH_SIZE];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => {
                    self.recv_closed = true;
                    self.observer.on_recv_closed(None);
                    return false;
                }
                Ok(n) => self.observer.on_recv(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.recv_closed = true;
                    self.observer.on_recv_closed(Some(e));
                    return false;
                }
            }
        }
    }

    /// Drive the send side: called when the selector reports the stream is
    /// writable. Drains the send queue until the stream would block
    /// (re-arm write) or the queue is empty and closed (write side done,
    /// no re-arm needed) or empty and still open (disarm write, nothing to
    /// send right now).
    pub fn on_writable(&mut self) -> WriteOutcome {
        let mut scratch = vec![0u8; RECV_SCRATCH_SIZE];
        loop {
            // `FifoBuffer::read` blocks until data is available, which would
            // stall the whole selector thread; only this method ever reads
            // from the send queue, so an empty check just before reading
            // cannot race with another reader.
            if self.send_queue.is_empty() {
                return if self.send_queue.is_closed() {
                    WriteOutcome::Done
                } else {
                    WriteOutcome::QueueDrained
                };
            }
            let n = match self.send_queue.read(&mut scratch) {
                Ok(n) => n,
                Err(e) => return WriteOutcome::Failed(e),
            };
            if let Err(e) = self.stream.write_all(&scratch[..n]) {
                if e.kind() == io::ErrorKind::WouldBlock {
                    return WriteOutcome::WouldBlock;
                }
                return WriteOutcome::Failed(e);
            }
        }
    }
}

#[derive(Debug)]
pub enum WriteOutcome {
    /// The stream would block; re-arm write interest.
    WouldBlock,
    /// The queue was drained but remains open; write interest can be
    /// disarmed until more is enqueued.
    QueueDrained,
    /// The queue was drained and closed: nothing further will ever be
    /// sent.
    Done,
    Failed(io::Error),
}

/// Convenience: a `NetworkLayer` whose observer is just a channel of
/// received byte chunks, useful for tests and for simple pass-through
/// pipelines that don't need filter-layer framing.
pub struct ChannelObserver {
    sender: std::sync::mpsc::Sender<Vec<u8>>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl ChannelObserver {
    pub fn new(sender: std::sync::mpsc::Sender<Vec<u8>>, closed: Arc<std::sync::atomic::AtomicBool>) -> Self {
        Self { sender, closed }
    }
}

impl NetworkLayerObserver for ChannelObserver {
    fn on_recv(&mut self, bytes: &[u8]) {
        let _ = self.sender.send(bytes.to_vec());
    }
    fn on_recv_closed(&mut self, _cause: Option<io::Error>) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    struct ReadWriteCursor {
        recv: Cursor<Vec<u8>>,
        sent: Vec<u8>,
    }
    impl Read for ReadWriteCursor {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.recv.read(buf)
        }
    }
    impl Write for ReadWriteCursor {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn on_readable_delivers_all_bytes_then_reports_eof() {
        let (tx, rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let observer = ChannelObserver::new(tx, closed.clone());
        let stream = ReadWriteCursor {
            recv: Cursor::new(b"hello world".to_vec()),
            sent: Vec::new(),
        };
        let mut layer = NetworkLayer::new(stream, 4096, Box::new(observer));
        let should_rearm = layer.on_readable();
        assert!(!should_rearm);
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        let mut received = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            received.extend(chunk);
        }
        assert_eq!(received, b"hello world");
    }

    #[test]
    fn enqueue_send_then_on_writable_drains_to_the_stream() {
        let (tx, _rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let observer = ChannelObserver::new(tx, closed);
        let stream = ReadWriteCursor {
            recv: Cursor::new(Vec::new()),
            sent: Vec::new(),
        };
        let layer = NetworkLayer::new(stream, 4096, Box::new(observer));
        layer.enqueue_send(b"outbound").unwrap();
        layer.close_send();
        let mut layer = layer;
        let outcome = layer.on_writable();
        assert!(matches!(outcome, WriteOutcome::Done));
        assert_eq!(layer.stream.sent, b"outbound");
    }
}
