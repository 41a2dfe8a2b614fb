//! TLS filter layer, backed by `rustls`'s synchronous `StreamOwned` adapter.

use std::io::{Read, Write};
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection, StreamOwned};
use rustls_pki_types::ServerName;

use crate::error::{Error, Result};

use super::{ByteChannel, FilterLayer};

/// Which side of the TLS handshake this process plays.
pub enum TlsRole {
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

pub struct TlsFilter {
    role: TlsRole,
}

impl TlsFilter {
    pub fn new(role: TlsRole) -> Self {
        Self { role }
    }
}

/// A `Read + Write` stream wrapping an inner boxed channel, carrying the TLS
/// connection alongside it so `StreamOwned` (which needs ownership, not a
/// borrow) can be constructed once and then boxed up as a `ByteChannel`.
struct TlsChannel<C> {
    stream: StreamOwned<C, Box<dyn ByteChannel>>,
}

impl<C> Read for TlsChannel<C>
where
    StreamOwned<C, Box<dyn ByteChannel>>: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl<C> Write for TlsChannel<C>
where
    StreamOwned<C, Box<dyn ByteChannel>>: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl FilterLayer for TlsFilter {
    fn negotiate(&self, inner: Box<dyn ByteChannel>) -> Result<Box<dyn ByteChannel>> {
        match &self.role {
            TlsRole::Client { config, server_name } => {
                let conn = ClientConnection::new(config.clone(), server_name.clone())
                    .map_err(|e| Error::connection_refused(format!("TLS client setup: {e}")))?;
                let mut stream = StreamOwned::new(conn, inner);
                complete_handshake(&mut stream)?;
                Ok(Box::new(TlsChannel { stream }))
            }
            TlsRole::Server { config } => {
                let conn = ServerConnection::new(config.clone())
                    .map_err(|e| Error::connection_refused(format!("TLS server setup: {e}")))?;
                let mut stream = StreamOwned::new(conn, inner);
                complete_handshake(&mut stream)?;
                Ok(Box::new(TlsChannel { stream }))
            }
        }
    }

    fn name(&self) -> &'static str {
        "tls"
    }
}

/// Force the handshake to run to completion by issuing a zero-length write
/// flush followed by a read; `StreamOwned` drives `rustls`'s handshake state
/// machine as part of ordinary read/write calls, but we want handshake
/// failures to surface from `negotiate` rather than from the first
/// application read.
fn complete_handshake<C, T>(stream: &mut StreamOwned<C, T>) -> Result<()>
where
    StreamOwned<C, T>: Read + Write,
{
    stream
        .flush()
        .map_err(|e| Error::connection_refused(format!("TLS handshake failed: {e}")))?;
    // A zero-byte read forces rustls to exchange handshake records without
    // blocking on application data that has not arrived yet.
    let mut probe = [0u8; 0];
    match stream.read(&mut probe) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(Error::connection_refused(format!("TLS handshake failed: {e}"))),
    }
}
