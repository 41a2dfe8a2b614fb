//! The feature bitfield negotiated once at connection start.
//! Both sides write and read exactly one `Capability` chunk before any
//! `Command`s are exchanged.

/// First bytes after the transport is ready are a single chunk containing a
/// length-prefixed UTF-8 payload which decodes to this bitfield (encoded
/// here as a plain big-endian `u32` preceded by the chunk framing in
/// [`crate::framing`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capability(u32);

impl Capability {
    pub const CHUNKED_ENCODING: u32 = 1 << 0;
    pub const MULTICLASSLOADER_RPC: u32 = 1 << 1;
    pub const PIPE_THROTTLING: u32 = 1 << 2;
    pub const NIO_SOCKET: u32 = 1 << 3;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// The capability set this implementation supports and advertises.
    pub const fn supported() -> Self {
        Self(
            Self::CHUNKED_ENCODING
                | Self::MULTICLASSLOADER_RPC
                | Self::PIPE_THROTTLING
                | Self::NIO_SOCKET,
        )
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub const fn with(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }

    /// The capability set actually usable on a channel: the intersection of
    /// what both sides advertised.
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn encode(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn decode(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let cap = Capability::supported();
        assert_eq!(Capability::decode(cap.encode()), cap);
    }

    #[test]
    fn intersect_keeps_only_shared_bits() {
        let a = Capability::from_bits(Capability::CHUNKED_ENCODING | Capability::PIPE_THROTTLING);
        let b = Capability::from_bits(Capability::CHUNKED_ENCODING | Capability::NIO_SOCKET);
        let shared = a.intersect(b);
        assert!(shared.has(Capability::CHUNKED_ENCODING));
        assert!(!shared.has(Capability::PIPE_THROTTLING));
        assert!(!shared.has(Capability::NIO_SOCKET));
    }
}
