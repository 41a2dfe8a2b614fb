//! Remote socket forwarding built on top of pipes ("PortForwarder,
//! misc"): bytes arriving on a local socket are pushed down a
//! [`crate::pipe::PipeWriter`] to the peer, and bytes the peer pushes back
//! arrive through a [`crate::pipe::PipeReader`]. This module is transport-
//! and socket-library agnostic; it only shuttles bytes between a pipe and
//! whatever the caller supplies as the local byte endpoint.

use std::io::{Read, Write};
use std::thread::{self, JoinHandle};

use crate::error::Result;
use crate::pipe::Pipe;

const COPY_CHUNK_SIZE: usize = 8192;

/// Pumps bytes in both directions between a local full-duplex byte endpoint
/// (`local`) and a remote `Pipe`. Each direction runs on its own thread so a
/// stalled direction never blocks the other, mirroring the independent
/// writer/reader halves of `Pipe` itself.
pub struct PortForwarder {
    to_remote: JoinHandle<()>,
    from_remote: JoinHandle<()>,
}

impl PortForwarder {
    /// Spawns both pump threads. `local` must be `Clone`-free but
    /// `Read + Write + Send + 'static` on its own handle type; callers
    /// typically pass one half of a split socket to each side via two
    /// separate owned handles (`local_reader`, `local_writer`).
    pub fn spawn<R, W>(local_reader: R, local_writer: W, pipe: Pipe) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let Pipe { writer, reader, .. } = pipe;

        let to_remote = thread::spawn(move || {
            pump_to_remote(local_reader, writer);
        });
        let from_remote = thread::spawn(move || {
            pump_from_remote(reader, local_writer);
        });

        Self {
            to_remote,
            from_remote,
        }
    }

    /// Blocks until both pump threads have exited (the local socket closed
    /// and the pipe closed, in either order).
    pub fn join(self) -> Result<()> {
        let _ = self.to_remote.join();
        let _ = self.from_remote.join();
        Ok(())
    }
}

fn pump_to_remote<R: Read>(mut local_reader: R, writer: crate::pipe::PipeWriter) {
    let mut buf = [0u8; COPY_CHUNK_SIZE];
    loop {
        match local_reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if writer.write(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    writer.close();
}

fn pump_from_remote<W: Write>(reader: std::sync::Arc<crate::pipe::PipeReader>, mut local_writer: W) {
    let mut buf = [0u8; COPY_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if local_writer.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = local_writer.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::PipeSink;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    struct LoopbackSink {
        reader: Arc<crate::pipe::PipeReader>,
    }

    impl PipeSink for LoopbackSink {
        fn send_write(&self, _oid: crate::command::Oid, bytes: Vec<u8>) {
            let _ = self.reader.on_write(&bytes);
        }
        fn send_eof(&self, _oid: crate::command::Oid) {
            self.reader.on_eof();
        }
        fn send_ack(&self, _oid: crate::command::Oid, _delta: u32) {}
    }

    #[test]
    fn forwards_local_bytes_through_a_loopback_pipe() {
        // Build a loopback pipe: writes made through the writer feed straight
        // back into the reader's own buffer via `LoopbackSink`.
        let loop_pipe = Pipe::new(2, crate::config::DEFAULT_PIPE_WINDOW, 64 * 1024, Arc::new(NoopSink));
        let sink = Arc::new(LoopbackSink {
            reader: loop_pipe.reader.clone(),
        });
        let writer = crate::pipe::PipeWriter::new(2, loop_pipe.window.clone(), sink);

        let input = Cursor::new(b"hello forwarder".to_vec());
        let output = Arc::new(Mutex::new(Vec::new()));
        let output_clone = output.clone();

        struct VecWriter(Arc<Mutex<Vec<u8>>>, AtomicUsize);
        impl Write for VecWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                self.1.fetch_add(buf.len(), std::sync::atomic::Ordering::SeqCst);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let forwarder = PortForwarder::spawn(
            input,
            VecWriter(output_clone, AtomicUsize::new(0)),
            Pipe {
                oid: 2,
                writer,
                reader: loop_pipe.reader,
                window: loop_pipe.window,
            },
        );
        forwarder.join().unwrap();

        assert_eq!(&*output.lock().unwrap(), b"hello forwarder");
    }

    struct NoopSink;
    impl PipeSink for NoopSink {
        fn send_write(&self, _oid: crate::command::Oid, _bytes: Vec<u8>) {}
        fn send_eof(&self, _oid: crate::command::Oid) {}
        fn send_ack(&self, _oid: crate::command::Oid, _delta: u32) {}
    }
}
