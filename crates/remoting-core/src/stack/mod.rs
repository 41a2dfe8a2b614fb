//! The layered protocol stack: a `NetworkLayer` byte
//! stream wrapped by zero or more `FilterLayer`s (TLS, protocol handshake,
//! connection headers) before the application layer ever sees a byte.
//!
//! Each filter owns the stream beneath it and presents the same
//! `Read + Write` surface upward, so the stack composes by simple nesting —
//! exactly the way the transport crate wraps a raw socket in a TLS stream
//! today.

mod handshake;
mod headers_filter;
mod tls;

pub use handshake::HandshakeFilter;
pub use headers_filter::HeadersFilter;
pub use tls::{TlsFilter, TlsRole};

use std::io::{Read, Write};

use crate::error::Result;

/// A live, already-negotiated byte stream. Blocking by design: the actual
/// non-blocking multiplexing happens in `remoting-io`'s selector loop, which
/// drives these reads/writes from readiness events. Filters only transform
/// bytes; they never themselves poll for readiness.
pub trait ByteChannel: Read + Write + Send {}
impl<T: Read + Write + Send + ?Sized> ByteChannel for T {}

/// One layer of the stack. `negotiate` consumes the layer beneath it and
/// returns a new channel that has completed whatever handshake this layer
/// requires (TLS handshake, protocol name + capability exchange, connection
/// header exchange), ready for the next layer up.
pub trait FilterLayer: Send + Sync {
    fn negotiate(&self, inner: Box<dyn ByteChannel>) -> Result<Box<dyn ByteChannel>>;

    fn name(&self) -> &'static str;
}

/// An ordered chain of filters applied to a raw `NetworkLayer` stream before
/// application traffic flows (NetworkLayer -> TLS filter ->
/// protocol-handshake filter -> connection-headers filter -> ApplicationLayer).
pub struct ProtocolStack {
    layers: Vec<Box<dyn FilterLayer>>,
}

impl ProtocolStack {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn with_layer(mut self, layer: Box<dyn FilterLayer>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Run every layer's negotiation in order, returning the fully
    /// negotiated application-layer channel. If any layer fails, the whole
    /// stack fails.
    pub fn build(&self, network: Box<dyn ByteChannel>) -> Result<Box<dyn ByteChannel>> {
        let mut current = network;
        for layer in &self.layers {
            current = layer
                .negotiate(current)
                .map_err(|e| {
                    tracing::warn!(layer = layer.name(), error = %e, "protocol stack layer aborted negotiation");
                    e
                })?;
        }
        Ok(current)
    }
}

impl Default for ProtocolStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Passthrough;
    impl FilterLayer for Passthrough {
        fn negotiate(&self, inner: Box<dyn ByteChannel>) -> Result<Box<dyn ByteChannel>> {
            Ok(inner)
        }
        fn name(&self) -> &'static str {
            "passthrough"
        }
    }

    struct AlwaysFails;
    impl FilterLayer for AlwaysFails {
        fn negotiate(&self, _inner: Box<dyn ByteChannel>) -> Result<Box<dyn ByteChannel>> {
            Err(crate::error::Error::connection_refused("always fails"))
        }
        fn name(&self) -> &'static str {
            "always-fails"
        }
    }

    #[test]
    fn empty_stack_returns_network_layer_unchanged() {
        let stack = ProtocolStack::new();
        let network: Box<dyn ByteChannel> = Box::new(Cursor::new(Vec::<u8>::new()));
        assert!(stack.build(network).is_ok());
    }

    #[test]
    fn a_failing_layer_aborts_the_whole_stack() {
        let stack = ProtocolStack::new().with_layer(Box::new(Passthrough)).with_layer(Box::new(AlwaysFails));
        let network: Box<dyn ByteChannel> = Box::new(Cursor::new(Vec::<u8>::new()));
        assert!(stack.build(network).is_err());
    }
}
