//! The error domain shared across the channel runtime.
//!
//! Every infrastructure failure (handshake, transport I/O, filter abort) is
//! fatal to its [`crate::channel::Channel`] and crosses into user-visible API
//! as [`Error::ChannelClosed`] carrying the root cause; it never propagates
//! as a raw I/O or TLS error. User-operation failures thrown during `call`
//! propagate as-is via [`Error::RemoteInvocation`].

use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The reason a channel (or a transport beneath it) went away.
///
/// Kept separate from [`Error`] because several error variants need to
/// attach it as a `cause` without recursively boxing themselves.
#[derive(Debug, Clone)]
pub enum CloseCause {
    /// `Channel::close()` was called locally.
    LocalClose,
    /// The peer's `CloseCommand` was observed.
    PeerClose,
    /// The transport reported end-of-stream or a fatal I/O error before a
    /// `CloseCommand` was exchanged (unorderly shutdown).
    TransportEof(String),
    /// A filter layer aborted the stack (TLS fatal alert, rejected
    /// handshake, malformed frame).
    FilterAbort(String),
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::LocalClose => write!(f, "closed locally"),
            CloseCause::PeerClose => write!(f, "closed by peer"),
            CloseCause::TransportEof(msg) => write!(f, "transport closed: {msg}"),
            CloseCause::FilterAbort(msg) => write!(f, "protocol stack aborted: {msg}"),
        }
    }
}

/// Diagnostic context for an "invalid OID" failure: the export table keeps a
/// short ring of recent unexport events specifically to populate this
/// message.
#[derive(Debug, Clone, Default)]
pub struct UnexportHistory(pub Vec<String>);

impl fmt::Display for UnexportHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "(no recent unexport history)");
        }
        for (i, line) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{line}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The operation was attempted on a channel that is closing or closed.
    #[error("channel closed: {cause}")]
    ChannelClosed { cause: CloseCause },

    /// The channel is not available in the calling context (e.g. trying to
    /// serialize a remote-only object outside of any channel).
    #[error("no channel is available in this context")]
    ChannelState,

    /// The protocol handshake was rejected, either by the peer or by our own
    /// verifier.
    #[error("connection refused: {reason}")]
    ConnectionRefusal { reason: String },

    /// The peer executed the operation and it threw; `class_name` and
    /// `message` describe the peer-side exception (converted to a portable
    /// form if it could not cross the boundary as-is).
    #[error("remote invocation failed: {class_name}: {message}")]
    RemoteInvocation {
        class_name: String,
        message: String,
        stack_trace: Vec<String>,
    },

    /// Deserialization was refused by the [`crate::class_filter::ClassFilter`].
    #[error("class filtered: {class_name} is not allowed to cross the channel")]
    ClassFiltered { class_name: String },

    /// A read or write on a closed pipe.
    #[error("pipe closed{}", cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
    PipeClosed { cause: Option<String> },

    /// Low level I/O failure. Internal to the stack; always converted to
    /// `ChannelClosed` before crossing into user-visible API, but exposed so
    /// transport crates can build it.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// `ExportTable::get` found no entry for the given OID.
    #[error("invalid OID {oid}: recent history: {history}")]
    InvalidOid { oid: u32, history: UnexportHistory },

    /// A remote class or resource could not be resolved.
    #[error("class resolution failed for {class_name}: {reason}")]
    ClassResolution { class_name: String, reason: String },

    /// The JAR cache detected a checksum mismatch or a filesystem failure.
    #[error("jar cache error: {0}")]
    JarCache(String),

    /// `call` timed out waiting for a response.
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    pub fn channel_closed(cause: CloseCause) -> Self {
        Error::ChannelClosed { cause }
    }

    pub fn connection_refused(reason: impl Into<String>) -> Self {
        Error::ConnectionRefusal {
            reason: reason.into(),
        }
    }

    pub fn class_filtered(class_name: impl Into<String>) -> Self {
        Error::ClassFiltered {
            class_name: class_name.into(),
        }
    }

    pub fn invalid_oid(oid: u32, history: UnexportHistory) -> Self {
        Error::InvalidOid { oid, history }
    }

    /// Best-effort errors (pipe-ack delivery failure on a closing channel,
    /// an unexport callback throwing) are logged and swallowed rather than
    /// propagated; callers should route through this helper so the policy is
    /// visible at the call site instead of a bare `let _ = ...`.
    pub fn log_and_swallow(self, context: &str) {
        tracing::warn!(error = %self, context, "swallowing best-effort failure");
    }
}
