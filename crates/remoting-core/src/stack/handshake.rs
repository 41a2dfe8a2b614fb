//! Protocol-handshake filter: exchanges a length-prefixed
//! protocol name and a [`crate::capability::Capability`] bitfield before
//! either side sends anything else. Both sides must agree on the protocol
//! name; capabilities are intersected rather than matched exactly so future
//! optional features degrade gracefully.

use std::io::{Read, Write};

use crate::capability::Capability;
use crate::config::MAX_PROTOCOL_NAME_LEN;
use crate::error::{Error, Result};

use super::{ByteChannel, FilterLayer};

pub struct HandshakeFilter {
    protocol_name: String,
    local_capability: Capability,
}

impl HandshakeFilter {
    pub fn new(protocol_name: impl Into<String>, local_capability: Capability) -> Self {
        Self {
            protocol_name: protocol_name.into(),
            local_capability,
        }
    }
}

/// Result of a completed handshake, attached to the returned channel so the
/// layer above (connection headers, or the application layer directly) can
/// read back what was negotiated.
pub struct NegotiatedChannel {
    inner: Box<dyn ByteChannel>,
    pub negotiated_capability: Capability,
}

impl Read for NegotiatedChannel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for NegotiatedChannel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl FilterLayer for HandshakeFilter {
    fn negotiate(&self, mut inner: Box<dyn ByteChannel>) -> Result<Box<dyn ByteChannel>> {
        if self.protocol_name.len() > MAX_PROTOCOL_NAME_LEN {
            return Err(Error::connection_refused(format!(
                "protocol name exceeds {MAX_PROTOCOL_NAME_LEN} bytes"
            )));
        }

        write_frame(&mut inner, self.protocol_name.as_bytes())?;
        write_frame(&mut inner, &self.local_capability.encode())?;

        let peer_name_bytes = read_frame(&mut inner, MAX_PROTOCOL_NAME_LEN)?;
        let peer_name = String::from_utf8(peer_name_bytes)
            .map_err(|_| Error::connection_refused("peer protocol name is not valid UTF-8"))?;
        if peer_name != self.protocol_name {
            return Err(Error::connection_refused(format!(
                "protocol name mismatch: local={} peer={peer_name}",
                self.protocol_name
            )));
        }

        let peer_cap_bytes = read_frame(&mut inner, 4)?;
        let peer_cap_array: [u8; 4] = peer_cap_bytes
            .try_into()
            .map_err(|_| Error::connection_refused("capability frame is not 4 bytes"))?;
        let peer_capability = Capability::decode(peer_cap_array);

        Ok(Box::new(NegotiatedChannel {
            inner,
            negotiated_capability: self.local_capability.intersect(peer_capability),
        }))
    }

    fn name(&self) -> &'static str {
        "protocol-handshake"
    }
}

fn write_frame(stream: &mut Box<dyn ByteChannel>, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).expect("handshake frames are always small");
    stream.write_all(&len.to_be_bytes()).map_err(Error::Transport)?;
    stream.write_all(payload).map_err(Error::Transport)?;
    stream.flush().map_err(Error::Transport)
}

fn read_frame(stream: &mut Box<dyn ByteChannel>, max_len: usize) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).map_err(Error::Transport)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(Error::connection_refused(format!(
            "handshake frame of {len} bytes exceeds limit {max_len}"
        )));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).map_err(Error::Transport)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// An in-memory duplex pipe so both sides of a handshake can run against
    /// each other synchronously within one test thread.
    #[derive(Clone)]
    struct DuplexHalf {
        inbound: Arc<Mutex<Cursor<Vec<u8>>>>,
        outbound: Arc<Mutex<Vec<u8>>>,
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

    fn duplex_pair() -> (DuplexHalf, DuplexHalf) {
        let a_to_b = Arc::new(Mutex::new(Vec::new()));
        let b_to_a = Arc::new(Mutex::new(Vec::new()));
        let a = DuplexHalf {
            inbound: Arc::new(Mutex::new(Cursor::new(Vec::new()))),
            outbound: a_to_b.clone(),
        };
        let b = DuplexHalf {
            inbound: Arc::new(Mutex::new(Cursor::new(Vec::new()))),
            outbound: b_to_a.clone(),
        };
        (a, b)
    }

    fn frame_bytes(name: &str, capability: Capability) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(name.len() as u32).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&4u32.to_be_bytes());
        out.extend_from_slice(&capability.encode());
        out
    }

    #[test]
    fn matching_protocol_names_negotiate_intersected_capability() {
        let (mut local, _peer) = duplex_pair();
        // Pre-seed what "the peer" would have sent: same protocol name, a
        // different capability bitfield than ours.
        *local.inbound.lock().unwrap() = Cursor::new(frame_bytes("JNLP4-connect", Capability::from_bits(0b0011)));

        let filter = HandshakeFilter::new("JNLP4-connect", Capability::from_bits(0b0111));
        let mut negotiated = filter.negotiate(Box::new(local.clone())).unwrap();
        let mut probe = [0u8; 0];
        let _ = negotiated.read(&mut probe);

        // What we sent out must match the wire format a peer would expect.
        let sent = local.outbound.lock().unwrap().clone();
        assert_eq!(sent, frame_bytes("JNLP4-connect", Capability::from_bits(0b0111)));
    }

    #[test]
    fn mismatched_protocol_name_is_rejected() {
        let (mut local, _peer) = duplex_pair();
        *local.inbound.lock().unwrap() = Cursor::new(frame_bytes("OtherProtocol", Capability::from_bits(0)));
        let filter = HandshakeFilter::new("JNLP4-connect", Capability::from_bits(0));
        let err = filter.negotiate(Box::new(local)).unwrap_err();
        assert!(matches!(err, Error::ConnectionRefusal { .. }));
    }

    #[test]
    fn overlong_protocol_name_is_rejected_before_any_io() {
        let filter = HandshakeFilter::new("x".repeat(MAX_PROTOCOL_NAME_LEN + 1), Capability::from_bits(0));
        let (a, _b) = duplex_pair();
        let err = filter.negotiate(Box::new(a)).unwrap_err();
        assert!(matches!(err, Error::ConnectionRefusal { .. }));
    }
}
