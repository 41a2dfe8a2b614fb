use std::io::{self, Read, Write};
use std::net::{Shutdown as StdShutdown, SocketAddr, TcpStream as StdTcpStream};
use std::time::Duration;

use socket2::SockRef;

use remoting_core::error::{Error, Result};
use remoting_core::stack::ByteChannel;

/// Socket-level knobs applied right after a connection is established
/// (either side). `linger` controls whether `close` waits for a graceful
/// FIN exchange or cuts the connection with an RST once the timeout
/// elapses; `nodelay` and `keepalive` follow the usual TCP semantics.
#[derive(Clone, Debug, Default)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
    nodelay: bool,
    keepalive: Option<Duration>,
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            linger: None,
            nodelay: false,
            keepalive: None,
        }
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    fn apply(&self, stream: &StdTcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        sock.set_linger(self.linger)?;
        sock.set_nodelay(self.nodelay)?;
        if let Some(interval) = self.keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(interval);
            sock.set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownDirection {
    Read,
    Write,
    Both,
}

/// A blocking TCP connection, used only for the handshake phase: the
/// protocol stack runs its filters synchronously
/// against this stream before data-plane traffic exists. Once negotiation
/// completes, call [`TcpChannel::into_nonblocking`] and hand the result to
/// `remoting-io`'s `IoHub`.
#[derive(Debug)]
pub struct TcpChannel {
    stream: StdTcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    config: TcpSocketConfig,
}

impl TcpChannel {
    pub(crate) fn from_std(stream: StdTcpStream, config: TcpSocketConfig) -> Result<Self> {
        config.apply(&stream).map_err(Error::Transport)?;
        let local_addr = stream.local_addr().map_err(Error::Transport)?;
        let peer_addr = stream.peer_addr().map_err(Error::Transport)?;
        Ok(Self {
            stream,
            local_addr,
            peer_addr,
            config,
        })
    }

    pub fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, TcpSocketConfig::default())
    }

    pub fn connect_with_config(addr: SocketAddr, config: TcpSocketConfig) -> Result<Self> {
        let stream = StdTcpStream::connect(addr).map_err(Error::Transport)?;
        Self::from_std(stream, config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn config(&self) -> &TcpSocketConfig {
        &self.config
    }

    pub fn linger(&self) -> Result<Option<Duration>> {
        SockRef::from(&self.stream).linger().map_err(Error::Transport)
    }

    pub fn shutdown(&self, direction: ShutdownDirection) -> Result<()> {
        let how = match direction {
            ShutdownDirection::Read => StdShutdown::Read,
            ShutdownDirection::Write => StdShutdown::Write,
            ShutdownDirection::Both => StdShutdown::Both,
        };
        self.stream.shutdown(how).map_err(Error::Transport)
    }

    /// Block until the peer's FIN arrives, draining whatever is still in
    /// flight. Used for an orderly close after the local
    /// side has already sent its own `CloseCommand` and half-shut the
    /// write side.
    pub fn await_peer_half_close(&mut self) -> Result<()> {
        let mut scratch = [0u8; 1024];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    /// Upcast to the generic byte-channel surface the protocol stack
    /// negotiates over.
    pub fn into_byte_channel(self) -> Box<dyn ByteChannel> {
        Box::new(self.stream)
    }

    /// Switch to non-blocking mode and hand back the raw `mio` stream for
    /// registration with an `IoHub`, once the blocking handshake phase is
    /// done.
    pub fn into_nonblocking(self) -> Result<mio::net::TcpStream> {
        self.stream.set_nonblocking(true).map_err(Error::Transport)?;
        Ok(mio::net::TcpStream::from_std(self.stream))
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
