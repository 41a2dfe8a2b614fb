//! `Command` is the unit of message carried inside the chunked frames of
//! [`crate::framing`]. Variants mirror

use std::fmt;

/// A monotonically allocated request id, unique per [`crate::channel::Channel`]
/// (not globally).
pub type RequestId = u64;

/// A 32-bit export identifier. Parity is assigned per side (see
/// [`crate::export_table::ExportTable`]) so the two peers never mint the
/// same OID.
pub type Oid = u32;

/// Every command carries a creation-site trace string purely for
/// diagnostics: typically `format!("{}:{}", file!(), line!())`
/// captured at the call site that produced the command.
pub type Trace = std::borrow::Cow<'static, str>;

#[derive(Debug, Clone)]
pub enum Command {
    /// Execute a user-supplied operation on the peer.
    UserRequest {
        request_id: RequestId,
        /// Operation payload already encoded by the external `Serializer`.
        payload: Vec<u8>,
        trace: Trace,
    },
    /// Result or thrown-exception for an earlier request id.
    Response {
        request_id: RequestId,
        outcome: ResponseOutcome,
        trace: Trace,
    },
    /// Invoke a method on an object exported by the peer.
    RpcRequest {
        request_id: RequestId,
        oid: Oid,
        method_signature: String,
        args: Vec<u8>,
        trace: Trace,
    },
    /// Increment/decrement/ping an exported reference count.
    DgcRequest {
        oid: Oid,
        op: DgcOp,
        trace: Trace,
    },
    PipeWrite {
        oid: Oid,
        bytes: Vec<u8>,
        trace: Trace,
    },
    PipeEof {
        oid: Oid,
        trace: Trace,
    },
    PipeAck {
        oid: Oid,
        delta: u32,
        trace: Trace,
    },
    PipeError {
        oid: Oid,
        message: String,
        trace: Trace,
    },
    /// Last command ever written on a stream.
    Close {
        trace: Trace,
    },
}

#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    Success(Vec<u8>),
    Exception {
        class_name: String,
        message: String,
        stack_trace: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DgcOp {
    AddRef(u64),
    Release(u64),
    /// Best-effort cancellation of an in-flight `call`.
    CancelRequest(RequestId),
}

impl Command {
    pub fn trace(&self) -> &str {
        match self {
            Command::UserRequest { trace, .. }
            | Command::Response { trace, .. }
            | Command::RpcRequest { trace, .. }
            | Command::DgcRequest { trace, .. }
            | Command::PipeWrite { trace, .. }
            | Command::PipeEof { trace, .. }
            | Command::PipeAck { trace, .. }
            | Command::PipeError { trace, .. }
            | Command::Close { trace } => trace,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Command::Close { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Command::UserRequest { .. } => "UserRequest",
            Command::Response { .. } => "Response",
            Command::RpcRequest { .. } => "RpcRequest",
            Command::DgcRequest { .. } => "DgcRequest",
            Command::PipeWrite { .. } => "PipeWrite",
            Command::PipeEof { .. } => "PipeEof",
            Command::PipeAck { .. } => "PipeAck",
            Command::PipeError { .. } => "PipeError",
            Command::Close { .. } => "Close",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind_name())
    }
}

/// Capture `file!():line!()` as a [`Trace`] at the call site. A `macro_rules!`
/// rather than a function so `file!()`/`line!()` resolve to the caller.
#[macro_export]
macro_rules! trace_here {
    () => {
        std::borrow::Cow::Owned(format!("{}:{}", file!(), line!()))
    };
}
