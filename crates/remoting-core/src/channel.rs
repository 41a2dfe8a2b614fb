//! The Channel dispatcher: request/response multiplexing,
//! the property map, and the orderly/unorderly close protocol on top of a
//! command-oriented transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parking_lot::Condvar;

use crate::command::{Command, DgcOp, RequestId, ResponseOutcome, Trace};
use crate::error::{CloseCause, Error, Result};
use crate::export_table::{ExportTable, Side};

/// What the channel hands outbound `Command`s to. The transport crate
/// implements this by encoding each command with
/// `crate::command_codec::encode`, framing it with `crate::framing`, and
/// pushing the bytes to the network layer.
pub trait CommandSink: Send + Sync {
    fn send(&self, command: Command);
}

/// Dispatches an inbound `UserRequest` to user code. Implemented by the
/// embedder; wraps whatever `CallableDecorator` chain it wants around the
/// actual operation execution.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, payload: Vec<u8>) -> std::result::Result<Vec<u8>, (String, String, Vec<String>)>;
}

/// Dispatches an inbound `RpcRequest` against an exported object. Kept
/// separate from `RequestHandler` because invoking a method on an
/// `Arc<dyn Any>` by signature is an embedder concern this crate does not
/// know how to do generically.
pub trait RpcHandler: Send + Sync {
    fn invoke(
        &self,
        object: Arc<dyn std::any::Any + Send + Sync>,
        method_signature: &str,
        args: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, (String, String, Vec<String>)>;
}

struct PendingCall {
    lock: Mutex<Option<std::result::Result<Vec<u8>, Error>>>,
    condvar: Condvar,
}

impl PendingCall {
    fn new() -> Self {
        Self {
            lock: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    fn complete(&self, result: std::result::Result<Vec<u8>, Error>) {
        let mut guard = self.lock.lock().unwrap();
        *guard = Some(result);
        self.condvar.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> Option<std::result::Result<Vec<u8>, Error>> {
        let mut guard = self.lock.lock().unwrap();
        loop {
            if let Some(result) = guard.take() {
                return Some(result);
            }
            match timeout {
                None => guard = self.condvar.wait(guard).unwrap(),
                Some(d) => {
                    let (g, timed_out) = self.condvar.wait_timeout(guard, d).unwrap();
                    guard = g;
                    if timed_out.timed_out() {
                        return None;
                    }
                }
            }
        }
    }
}

/// A handle returned by `Channel::call_async`; `get` blocks (optionally with
/// a timeout) for the response.
pub struct CallHandle {
    shared: Arc<Shared>,
    request_id: RequestId,
    pending: Arc<PendingCall>,
}

impl CallHandle {
    pub fn get(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        match self.pending.wait(timeout) {
            Some(result) => result,
            None => {
                // On expiry, stop tracking the request ourselves and tell the
                // peer to stop running it; best-effort, since the response
                // may already be in flight on the wire.
                self.shared.pending.lock().unwrap().remove(&self.request_id);
                self.shared.sink.send(Command::DgcRequest {
                    oid: 0,
                    op: DgcOp::CancelRequest(self.request_id),
                    trace: Trace::Borrowed("channel:call-timeout"),
                });
                Err(Error::Timeout(timeout.unwrap_or_default()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    Open,
    /// Local close() called; CloseCommand sent, waiting for peer's.
    OutClosed,
    /// Peer's CloseCommand observed; ours not sent yet.
    InClosed,
    Closed,
}

struct Shared {
    name: String,
    side: Side,
    next_request_id: AtomicU64,
    pending: std::sync::Mutex<HashMap<RequestId, Arc<PendingCall>>>,
    /// Requests currently being executed on behalf of the peer, keyed by the
    /// peer's own request id (a separate namespace from `pending`, which
    /// tracks requests we ourselves issued).
    inbound_in_flight: std::sync::Mutex<HashMap<RequestId, Arc<AtomicBool>>>,
    export_table: ExportTable,
    properties: std::sync::Mutex<HashMap<String, Arc<dyn std::any::Any + Send + Sync>>>,
    property_changed: Condvar,
    property_lock: parking_lot::Mutex<()>,
    sink: Arc<dyn CommandSink>,
    close_state: parking_lot::Mutex<CloseState>,
    close_changed: Condvar,
    closed_flag: AtomicBool,
    default_call_timeout: Option<Duration>,
    flight_recorder: crate::observability::FlightRecorder,
}

/// One peer pairing. Cheap to clone: internally an `Arc`.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    pub fn new(
        name: impl Into<String>,
        side: Side,
        export_table: ExportTable,
        sink: Arc<dyn CommandSink>,
        default_call_timeout: Option<Duration>,
        flight_recorder_capacity: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                side,
                next_request_id: AtomicU64::new(0),
                pending: std::sync::Mutex::new(HashMap::new()),
                inbound_in_flight: std::sync::Mutex::new(HashMap::new()),
                export_table,
                properties: std::sync::Mutex::new(HashMap::new()),
                property_changed: Condvar::new(),
                property_lock: parking_lot::Mutex::new(()),
                sink,
                close_state: parking_lot::Mutex::new(CloseState::Open),
                close_changed: Condvar::new(),
                closed_flag: AtomicBool::new(false),
                default_call_timeout,
                flight_recorder: crate::observability::FlightRecorder::new(flight_recorder_capacity),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn export_table(&self) -> &ExportTable {
        &self.shared.export_table
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed_flag.load(Ordering::SeqCst)
    }

    fn next_request_id(&self) -> RequestId {
        self.shared.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn check_open_for_new_work(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::channel_closed(CloseCause::LocalClose));
        }
        let state = *self.shared.close_state.lock();
        if state != CloseState::Open {
            return Err(Error::channel_closed(CloseCause::LocalClose));
        }
        Ok(())
    }

    /// Synchronously invoke an operation on the peer.
    /// `payload` is already encoded by the external serializer.
    pub fn call(&self, payload: Vec<u8>, trace: Trace) -> Result<Vec<u8>> {
        let handle = self.call_async(payload, trace)?;
        handle.get(self.shared.default_call_timeout)
    }

    pub fn call_async(&self, payload: Vec<u8>, trace: Trace) -> Result<CallHandle> {
        self.check_open_for_new_work()?;
        let request_id = self.next_request_id();
        let pending = Arc::new(PendingCall::new());
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id, pending.clone());
        self.shared.sink.send(Command::UserRequest {
            request_id,
            payload,
            trace,
        });
        Ok(CallHandle {
            shared: self.shared.clone(),
            request_id,
            pending,
        })
    }

    /// Register `object` in the export table and return its OID; callers
    /// build the wire-facing proxy representation themselves (this crate
    /// does not know the embedder's proxy type). Rejected by the channel's
    /// `ClassFilter` if `class_name` is blacklisted.
    pub fn export(
        &self,
        class_name: &str,
        object: Arc<dyn std::any::Any + Send + Sync>,
        pinned: bool,
        trace: Trace,
    ) -> Result<u32> {
        self.shared.export_table.export(class_name, object, pinned, trace.into_owned())
    }

    pub fn set_property(&self, name: impl Into<String>, value: Arc<dyn std::any::Any + Send + Sync>) {
        let _guard = self.shared.property_lock.lock();
        self.shared.properties.lock().unwrap().insert(name.into(), value);
        self.shared.property_changed.notify_all();
    }

    /// Blocks until the peer publishes `name` (via an inbound property
    /// announcement the caller feeds through [`Channel::on_remote_property`])
    /// or the channel closes.
    pub fn get_remote_property(&self, name: &str, timeout: Option<Duration>) -> Result<Arc<dyn std::any::Any + Send + Sync>> {
        let mut guard = self.shared.property_lock.lock();
        loop {
            if let Some(value) = self.shared.properties.lock().unwrap().get(name) {
                return Ok(value.clone());
            }
            if self.is_closed() {
                return Err(Error::channel_closed(CloseCause::LocalClose));
            }
            match timeout {
                None => self.shared.property_changed.wait(&mut guard),
                Some(d) => {
                    if self.shared.property_changed.wait_for(&mut guard, d).timed_out() {
                        return Err(Error::Timeout(d));
                    }
                }
            }
        }
    }

    /// Feed a peer-published property announcement in (out of band from the
    /// `Command` enum in this design; embedders may carry it as a reserved
    /// `UserRequest` or a dedicated command of their own).
    pub fn on_remote_property(&self, name: impl Into<String>, value: Arc<dyn std::any::Any + Send + Sync>) {
        self.set_property(name, value);
    }

    /// Initiates orderly shutdown.
    pub fn close(&self) {
        let mut state = self.shared.close_state.lock();
        match *state {
            CloseState::Open => {
                *state = CloseState::OutClosed;
                drop(state);
                self.shared.sink.send(Command::Close { trace: "channel:close".into() });
            }
            CloseState::InClosed => {
                *state = CloseState::Closed;
                drop(state);
                self.shared.sink.send(Command::Close { trace: "channel:close".into() });
                self.finish_close(CloseCause::LocalClose);
            }
            CloseState::OutClosed | CloseState::Closed => {}
        }
    }

    /// Drive the close state machine on an inbound `CloseCommand`.
    fn on_close_command(&self) {
        let mut state = self.shared.close_state.lock();
        match *state {
            CloseState::Open => {
                *state = CloseState::Closed;
                drop(state);
                self.shared.sink.send(Command::Close { trace: "channel:peer-close".into() });
                self.finish_close(CloseCause::PeerClose);
            }
            CloseState::OutClosed => {
                *state = CloseState::Closed;
                drop(state);
                self.finish_close(CloseCause::PeerClose);
            }
            CloseState::InClosed | CloseState::Closed => {}
        }
    }

    /// Unorderly shutdown: transport EOF or a fatal I/O error observed
    /// before a `CloseCommand` was exchanged ("Unorderly
    /// shutdown").
    pub fn on_transport_failure(&self, description: impl Into<String>) {
        let mut state = self.shared.close_state.lock();
        if *state == CloseState::Closed {
            return;
        }
        *state = CloseState::Closed;
        drop(state);
        self.finish_close(CloseCause::TransportEof(description.into()));
    }

    fn finish_close(&self, cause: CloseCause) {
        self.shared.closed_flag.store(true, Ordering::SeqCst);
        let failed: Vec<Arc<PendingCall>> = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.drain().map(|(_, p)| p).collect()
        };
        for call in failed {
            call.complete(Err(Error::channel_closed(cause.clone())));
        }
        self.shared.export_table.clear();
        self.shared.close_changed.notify_all();
        crate::observability::trace_channel_closed(&self.shared.name, &cause.to_string(), &self.shared.flight_recorder);
    }

    /// Blocks until both close flags have been observed (step
    /// 3), or returns immediately if the channel is already closed.
    pub fn wait_closed(&self, timeout: Option<Duration>) -> bool {
        let mut guard = self.shared.close_state.lock();
        loop {
            if *guard == CloseState::Closed {
                return true;
            }
            match timeout {
                None => self.shared.close_changed.wait(&mut guard),
                Some(d) => {
                    if self.shared.close_changed.wait_for(&mut guard, d).timed_out() {
                        return false;
                    }
                }
            }
        }
    }

    /// Process one inbound command. Called
    /// from whatever thread is pumping frames off the transport.
    pub fn on_command(
        &self,
        command: Command,
        request_handler: &dyn RequestHandler,
        rpc_handler: &dyn RpcHandler,
        pipes: &dyn PipeRouter,
    ) {
        self.shared.flight_recorder.record(command.kind_name().as_bytes());
        match command {
            Command::Close { .. } => self.on_close_command(),
            Command::UserRequest { request_id, payload, trace } => {
                let cancelled = Arc::new(AtomicBool::new(false));
                self.shared
                    .inbound_in_flight
                    .lock()
                    .unwrap()
                    .insert(request_id, cancelled.clone());
                let outcome = match request_handler.handle(payload) {
                    Ok(result) => ResponseOutcome::Success(result),
                    Err((class_name, message, stack_trace)) => ResponseOutcome::Exception {
                        class_name,
                        message,
                        stack_trace,
                    },
                };
                self.shared.inbound_in_flight.lock().unwrap().remove(&request_id);
                if !cancelled.load(Ordering::SeqCst) {
                    self.shared.sink.send(Command::Response { request_id, outcome, trace });
                }
            }
            Command::Response { request_id, outcome, .. } => {
                if let Some(pending) = self.shared.pending.lock().unwrap().remove(&request_id) {
                    let result = match outcome {
                        ResponseOutcome::Success(bytes) => Ok(bytes),
                        ResponseOutcome::Exception { class_name, message, stack_trace } => {
                            Err(Error::RemoteInvocation { class_name, message, stack_trace })
                        }
                    };
                    pending.complete(result);
                }
            }
            Command::RpcRequest { request_id, oid, method_signature, args, trace } => {
                let outcome = match self.shared.export_table.get(oid) {
                    Ok(object) => match rpc_handler.invoke(object, &method_signature, args) {
                        Ok(result) => ResponseOutcome::Success(result),
                        Err((class_name, message, stack_trace)) => ResponseOutcome::Exception {
                            class_name,
                            message,
                            stack_trace,
                        },
                    },
                    Err(e) => ResponseOutcome::Exception {
                        class_name: "InvalidOid".into(),
                        message: e.to_string(),
                        stack_trace: Vec::new(),
                    },
                };
                self.shared.sink.send(Command::Response { request_id, outcome, trace });
            }
            Command::DgcRequest { oid, op, .. } => match op {
                DgcOp::AddRef(count) => self.shared.export_table.add_ref(oid, count),
                DgcOp::Release(count) => self.shared.export_table.release(oid, count),
                DgcOp::CancelRequest(request_id) => {
                    if let Some(flag) = self.shared.inbound_in_flight.lock().unwrap().get(&request_id) {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
            },
            Command::PipeWrite { oid, bytes, .. } => pipes.on_write(oid, bytes),
            Command::PipeEof { oid, .. } => pipes.on_eof(oid),
            Command::PipeAck { oid, delta, .. } => pipes.on_ack(oid, delta),
            Command::PipeError { oid, message, .. } => pipes.on_error(oid, message),
        }
    }

    /// Periodic maintenance: sweep the export table for garbage-collected
    /// entries.
    pub fn sweep(&self) {
        self.shared.export_table.sweep();
    }
}

/// Routes inbound pipe-related commands to the right `Pipe` by OID.
/// Implemented by whatever keeps the OID -> `Pipe` map (typically the same
/// embedder layer that owns exported objects).
pub trait PipeRouter: Send + Sync {
    fn on_write(&self, oid: u32, bytes: Vec<u8>);
    fn on_eof(&self, oid: u32);
    fn on_ack(&self, oid: u32, delta: u32);
    fn on_error(&self, oid: u32, message: String);
}
