//! The boundary between the channel runtime and whatever object-graph
//! serialization format an embedder chooses ("the core assumes a
//! serializer collaborator"). This crate carries opaque payload bytes; it
//! never inspects or constructs argument/return values itself.

use std::sync::Arc;

use crate::class_filter::ClassFilter;
use crate::command::Oid;
use crate::error::Result;

/// Resolves class names encountered while decoding a payload to bytecode
/// (served locally) or flags them as unknown, deferring to the
/// [`crate::classloader::ClassLoaderRegistry`] when the name belongs to a
/// proxy classloader. Implemented by the embedder; this crate only calls it.
pub trait ClassResolver: Send + Sync {
    fn resolve_local(&self, class_name: &str) -> Option<Vec<u8>>;
}

/// What a `Serializer` needs from the channel while encoding or decoding an
/// object graph: the export table (to turn live objects into OIDs and back)
/// and the class filter (to reject disallowed types before they are ever
/// materialized).
pub trait SerializationContext: Send + Sync {
    fn export(&self, object: Arc<dyn std::any::Any + Send + Sync>, pinned: bool) -> Oid;
    fn resolve_export(&self, oid: Oid) -> Result<Arc<dyn std::any::Any + Send + Sync>>;
    fn class_filter(&self) -> &dyn ClassFilter;
}

/// An embedder-supplied codec for request arguments and response values.
/// The channel treats both sides of this trait as opaque `Vec<u8>` payloads
/// carried inside [`crate::command::Command::Request`] /
/// [`crate::command::Command::Response`].
pub trait Serializer: Send + Sync {
    /// Encode `value` (an embedder-defined dynamic value, passed as `&dyn
    /// std::any::Any` since this crate has no concrete value type of its
    /// own) into wire bytes.
    fn serialize(&self, value: &dyn std::any::Any, ctx: &dyn SerializationContext) -> Result<Vec<u8>>;

    /// Decode wire bytes back into an embedder-defined dynamic value.
    fn deserialize(
        &self,
        bytes: &[u8],
        ctx: &dyn SerializationContext,
    ) -> Result<Box<dyn std::any::Any + Send>>;
}

/// A trivial serializer that treats the payload as opaque bytes with no
/// object graph, useful for tests and for embedders whose calls only ever
/// exchange raw byte arguments.
pub struct RawBytesSerializer;

impl Serializer for RawBytesSerializer {
    fn serialize(&self, value: &dyn std::any::Any, _ctx: &dyn SerializationContext) -> Result<Vec<u8>> {
        match value.downcast_ref::<Vec<u8>>() {
            Some(bytes) => Ok(bytes.clone()),
            None => Ok(Vec::new()),
        }
    }

    fn deserialize(
        &self,
        bytes: &[u8],
        _ctx: &dyn SerializationContext,
    ) -> Result<Box<dyn std::any::Any + Send>> {
        Ok(Box::new(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_filter::DefaultClassFilter;
    use crate::error::Error;

    struct NullContext {
        filter: DefaultClassFilter,
    }

    impl SerializationContext for NullContext {
        fn export(&self, _object: Arc<dyn std::any::Any + Send + Sync>, _pinned: bool) -> Oid {
            0
        }
        fn resolve_export(&self, oid: Oid) -> Result<Arc<dyn std::any::Any + Send + Sync>> {
            Err(Error::invalid_oid(oid, Default::default()))
        }
        fn class_filter(&self) -> &dyn ClassFilter {
            &self.filter
        }
    }

    #[test]
    fn raw_bytes_serializer_round_trips() {
        let serializer = RawBytesSerializer;
        let ctx = NullContext {
            filter: DefaultClassFilter::new(),
        };
        let payload: Vec<u8> = vec![1, 2, 3];
        let encoded = serializer.serialize(&payload, &ctx).unwrap();
        assert_eq!(encoded, payload);
        let decoded = serializer.deserialize(&encoded, &ctx).unwrap();
        assert_eq!(*decoded.downcast::<Vec<u8>>().unwrap(), payload);
    }
}
