use std::net::{SocketAddr, TcpListener as StdTcpListener};

use remoting_core::error::{Error, Result};

use crate::channel::{TcpChannel, TcpSocketConfig};

/// Blocking accept loop, used the same way `TcpChannel` is: each accepted
/// connection runs its handshake synchronously before the resulting stream
/// is handed to `remoting-io`'s `IoHub`.
#[derive(Debug)]
pub struct TcpListener {
    inner: StdTcpListener,
    local_addr: SocketAddr,
    config: TcpSocketConfig,
}

impl TcpListener {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(addr, TcpSocketConfig::default())
    }

    pub fn bind_with_config(addr: SocketAddr, config: TcpSocketConfig) -> Result<Self> {
        let inner = StdTcpListener::bind(addr).map_err(Error::Transport)?;
        let local_addr = inner.local_addr().map_err(Error::Transport)?;
        Ok(Self {
            inner,
            local_addr,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn accept(&self) -> Result<(TcpChannel, SocketAddr)> {
        let (stream, peer_addr) = self.inner.accept().map_err(Error::Transport)?;
        let channel = TcpChannel::from_std(stream, self.config.clone())?;
        Ok((channel, peer_addr))
    }

    /// Switch to non-blocking mode so the listener itself can be registered
    /// with an `IoHub` and drive `accept` from readiness events instead of
    /// a dedicated blocking thread.
    pub fn into_nonblocking(self) -> Result<mio::net::TcpListener> {
        self.inner.set_nonblocking(true).map_err(Error::Transport)?;
        Ok(mio::net::TcpListener::from_std(self.inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_to_port_zero_yields_a_routable_local_addr() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(listener.local_addr().ip().to_string(), "127.0.0.1");
        assert_ne!(listener.local_addr().port(), 0);
    }
}
