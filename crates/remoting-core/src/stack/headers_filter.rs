//! Connection-headers filter: the last filter before the
//! application layer exchanges a [`ConnectionHeaders`] map with the peer.
//! Unlike the protocol handshake, mismatched headers are not inherently
//! fatal — the application layer decides what to do with them (e.g. reject
//! on a missing cookie) via [`HeadersFilter::into_peer_headers`].

use std::io::{Read, Write};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::headers::ConnectionHeaders;

use super::{ByteChannel, FilterLayer};

pub struct HeadersFilter {
    local_headers: ConnectionHeaders,
    /// Populated once negotiation completes, so callers can inspect what the
    /// peer sent after the filter has run.
    peer_headers: Mutex<Option<ConnectionHeaders>>,
}

impl HeadersFilter {
    pub fn new(local_headers: ConnectionHeaders) -> Self {
        Self {
            local_headers,
            peer_headers: Mutex::new(None),
        }
    }

    pub fn peer_headers(&self) -> Option<ConnectionHeaders> {
        self.peer_headers.lock().unwrap().clone()
    }
}

impl FilterLayer for HeadersFilter {
    fn negotiate(&self, mut inner: Box<dyn ByteChannel>) -> Result<Box<dyn ByteChannel>> {
        let payload = self.local_headers.encode()?;
        let len = u32::try_from(payload.len()).expect("connection headers payload always fits u32");
        inner.write_all(&len.to_be_bytes()).map_err(Error::Transport)?;
        inner.write_all(&payload).map_err(Error::Transport)?;
        inner.flush().map_err(Error::Transport)?;

        let mut len_bytes = [0u8; 4];
        inner.read_exact(&mut len_bytes).map_err(Error::Transport)?;
        let peer_len = u32::from_be_bytes(len_bytes) as usize;
        const MAX_HEADERS_PAYLOAD: usize = 1 << 20;
        if peer_len > MAX_HEADERS_PAYLOAD {
            return Err(Error::connection_refused(format!(
                "connection headers payload of {peer_len} bytes exceeds limit {MAX_HEADERS_PAYLOAD}"
            )));
        }
        let mut peer_payload = vec![0u8; peer_len];
        inner.read_exact(&mut peer_payload).map_err(Error::Transport)?;
        let peer_headers = ConnectionHeaders::decode(&peer_payload)?;
        *self.peer_headers.lock().unwrap() = Some(peer_headers);

        Ok(inner)
    }

    fn name(&self) -> &'static str {
        "connection-headers"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Clone)]
    struct DuplexHalf {
        inbound: Arc<StdMutex<Cursor<Vec<u8>>>>,
        outbound: Arc<StdMutex<Vec<u8>>>,
    }

    impl Read for DuplexHalf {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.lock().unwrap().read(buf)
        }
    }
    impl Write for DuplexHalf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reads_back_peer_headers_and_writes_local_ones() {
        let mut peer_headers = ConnectionHeaders::new();
        peer_headers.set("Remoting-Cookie", "abc123");
        let peer_payload = peer_headers.encode().unwrap();
        let mut seeded = Vec::new();
        seeded.extend_from_slice(&(peer_payload.len() as u32).to_be_bytes());
        seeded.extend_from_slice(&peer_payload);

        let channel = DuplexHalf {
            inbound: Arc::new(StdMutex::new(Cursor::new(seeded))),
            outbound: Arc::new(StdMutex::new(Vec::new())),
        };

        let mut local_headers = ConnectionHeaders::new();
        local_headers.set("Protocol-Name", "JNLP4-connect");
        let filter = HeadersFilter::new(local_headers);

        filter.negotiate(Box::new(channel.clone())).unwrap();

        let observed = filter.peer_headers().expect("peer headers set");
        assert_eq!(observed.get("Remoting-Cookie"), Some("abc123"));

        let sent = channel.outbound.lock().unwrap().clone();
        assert!(sent.len() > 4);
    }

    #[test]
    fn oversized_peer_payload_is_rejected() {
        let channel = DuplexHalf {
            inbound: Arc::new(StdMutex::new(Cursor::new((u32::MAX).to_be_bytes().to_vec()))),
            outbound: Arc::new(StdMutex::new(Vec::new())),
        };
        let filter = HeadersFilter::new(ConnectionHeaders::new());
        let err = filter.negotiate(Box::new(channel)).unwrap_err();
        assert!(matches!(err, Error::ConnectionRefusal { .. }));
    }
}
