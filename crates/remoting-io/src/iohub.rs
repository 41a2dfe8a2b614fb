//! The selector thread. A single `mio::Poll` instance is
//! driven by one dedicated thread; every other thread that wants to
//! register interest, change interest flags, or run a callback on the
//! selector thread does so by enqueuing a task and waking the poll via a
//! `mio::Waker`.
//!
//! Readiness dispatch policy: when a registration becomes ready for
//! operation *X*, the hub atomically clears *X* from its interest set
//! before invoking the listener. The listener must explicitly re-arm
//! whatever interest it still wants (`add_interest_*`), which is what
//! prevents one selector wakeup from being delivered twice for the same
//! readiness edge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token, Waker};

use crate::{IoError, Result};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Which operations a registration became ready for, mirroring
/// `listener.ready(accept, connect, read, write)` in
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// A callback invoked on the selector thread when a registration's interest
/// is satisfied, or when the hub aborts. Implementations must not block —
/// anything that might is expected to be handed to `IoHub::execute` instead.
pub trait Listener: Send {
    fn ready(&mut self, id: RegistrationId, readiness: Readiness);

    /// The hub itself failed (e.g. the OS selector errored); every listener
    /// still registered receives this instead of further `ready` calls.
    fn aborted(&mut self, cause: &IoError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(usize);

enum Task {
    Register {
        id: RegistrationId,
        source: Box<dyn mio::event::Source + Send>,
        interest: Interest,
        listener: Box<dyn Listener>,
    },
    AddInterest {
        id: RegistrationId,
        interest: Interest,
    },
    RemoveInterest {
        id: RegistrationId,
        interest: Interest,
    },
    Deregister {
        id: RegistrationId,
    },
    Execute {
        runnable: Box<dyn FnOnce() + Send>,
    },
    Shutdown,
}

struct Registration {
    source: Box<dyn mio::event::Source + Send>,
    interest: Interest,
    listener: Box<dyn Listener>,
}

/// Handle used by any thread to talk to the selector thread. Cheap to
/// clone.
#[derive(Clone)]
pub struct IoHub {
    next_id: Arc<AtomicUsize>,
    tasks: Arc<Mutex<Vec<Task>>>,
    waker: Arc<Waker>,
}

impl IoHub {
    /// Spawns the selector thread and returns a handle plus its
    /// `JoinHandle` (joinable once `shutdown` has been called).
    pub fn spawn() -> Result<(Self, JoinHandle<()>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let tasks: Arc<Mutex<Vec<Task>>> = Arc::new(Mutex::new(Vec::new()));

        let hub = Self {
            next_id: Arc::new(AtomicUsize::new(1)),
            tasks: tasks.clone(),
            waker: waker.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("remoting-io-selector".into())
            .spawn(move || run_selector_loop(poll, tasks))
            .expect("spawning the selector thread");

        Ok((hub, handle))
    }

    fn enqueue(&self, task: Task) {
        self.tasks.lock().unwrap().push(task);
        // Waking is best-effort: if the selector thread already exited, the
        // queued task is simply never drained (matches "hub terminated"
        // semantics in ).
        let _ = self.waker.wake();
    }

    /// Register a new source with the hub. Completion (including the first
    /// readiness callback) happens asynchronously on the selector thread.
    pub fn register(
        &self,
        source: impl mio::event::Source + Send + 'static,
        interest: Interest,
        listener: impl Listener + 'static,
    ) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.enqueue(Task::Register {
            id,
            source: Box::new(source),
            interest,
            listener: Box::new(listener),
        });
        id
    }

    pub fn add_interest(&self, id: RegistrationId, interest: Interest) {
        self.enqueue(Task::AddInterest { id, interest });
    }

    pub fn remove_interest(&self, id: RegistrationId, interest: Interest) {
        self.enqueue(Task::RemoveInterest { id, interest });
    }

    pub fn deregister(&self, id: RegistrationId) {
        self.enqueue(Task::Deregister { id });
    }

    /// Submit a callback to run off the selector thread's event loop
    /// iteration but still serialized with other hub tasks — 's
    /// `execute(runnable)`. This hub has no separate thread pool; callers
    /// needing true concurrency should hand the runnable to their own
    /// executor instead and only use this for short, non-blocking work.
    pub fn execute(&self, runnable: impl FnOnce() + Send + 'static) {
        self.enqueue(Task::Execute {
            runnable: Box::new(runnable),
        });
    }

    pub fn shutdown(&self) {
        self.enqueue(Task::Shutdown);
    }
}

fn run_selector_loop(mut poll: Poll, tasks: Arc<Mutex<Vec<Task>>>) {
    let mut events = Events::with_capacity(256);
    let mut registrations: HashMap<usize, Registration> = HashMap::new();

    'outer: loop {
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(250))) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            let cause = IoError::Selector(e);
            for reg in registrations.values_mut() {
                reg.listener.aborted(&cause);
            }
            tracing::error!(error = %cause, "selector failed; hub terminating");
            return;
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let id = event.token().0;
            if let Some(reg) = registrations.get_mut(&id) {
                let readiness = Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                };
                // Clear whichever interest just fired before invoking the
                // listener, per linearization rule.
                let mut remaining = Interest::READABLE.add(Interest::WRITABLE);
                if readiness.readable && !readiness.writable && reg.interest.is_writable() {
                    remaining = Interest::WRITABLE;
                } else if readiness.writable && !readiness.readable && reg.interest.is_readable() {
                    remaining = Interest::READABLE;
                } else if readiness.readable && readiness.writable {
                    // both fired: the listener must re-arm everything it
                    // still wants.
                }
                if reg.interest != remaining {
                    if poll
                        .registry()
                        .reregister(reg.source.as_mut(), event.token(), remaining)
                        .is_ok()
                    {
                        reg.interest = remaining;
                    }
                }
                reg.listener.ready(RegistrationId(id), readiness);
            }
        }

        let drained: Vec<Task> = std::mem::take(&mut *tasks.lock().unwrap());
        for task in drained {
            match task {
                Task::Register {
                    id,
                    mut source,
                    interest,
                    listener,
                } => {
                    if poll
                        .registry()
                        .register(source.as_mut(), Token(id.0), interest)
                        .is_ok()
                    {
                        registrations.insert(
                            id.0,
                            Registration {
                                source,
                                interest,
                                listener,
                            },
                        );
                    }
                }
                Task::AddInterest { id, interest } => {
                    if let Some(reg) = registrations.get_mut(&id.0) {
                        let combined = reg.interest.add(interest);
                        if poll
                            .registry()
                            .reregister(reg.source.as_mut(), Token(id.0), combined)
                            .is_ok()
                        {
                            reg.interest = combined;
                        }
                    }
                }
                Task::RemoveInterest { id, interest } => {
                    if let Some(reg) = registrations.get_mut(&id.0) {
                        let remaining = remove_interest(reg.interest, interest);
                        if let Some(remaining) = remaining {
                            if poll
                                .registry()
                                .reregister(reg.source.as_mut(), Token(id.0), remaining)
                                .is_ok()
                            {
                                reg.interest = remaining;
                            }
                        } else {
                            let _ = poll.registry().deregister(reg.source.as_mut());
                            registrations.remove(&id.0);
                        }
                    }
                }
                Task::Deregister { id } => {
                    if let Some(mut reg) = registrations.remove(&id.0) {
                        let _ = poll.registry().deregister(reg.source.as_mut());
                    }
                }
                Task::Execute { runnable } => runnable(),
                Task::Shutdown => break 'outer,
            }
        }
    }
}

fn remove_interest(current: Interest, remove: Interest) -> Option<Interest> {
    let readable = current.is_readable() && !remove.is_readable();
    let writable = current.is_writable() && !remove.is_writable();
    match (readable, writable) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;
    use std::sync::mpsc;

    struct RecordingListener {
        events: mpsc::Sender<Readiness>,
    }

    impl Listener for RecordingListener {
        fn ready(&mut self, _id: RegistrationId, readiness: Readiness) {
            let _ = self.events.send(readiness);
        }
        fn aborted(&mut self, _cause: &IoError) {}
    }

    #[test]
    fn accepts_a_connection_and_delivers_readable_event() {
        let (hub, _join) = IoHub::spawn().unwrap();
        let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let addr = std_listener.local_addr().unwrap();
        let mut mio_listener = mio::net::TcpListener::from_std(std_listener);

        let (tx, rx) = mpsc::channel();
        hub.register(
            mio_listener_source(&mut mio_listener),
            Interest::READABLE,
            RecordingListener { events: tx },
        );

        let _client = std::net::TcpStream::connect(addr).unwrap();

        let readiness = rx.recv_timeout(Duration::from_secs(2)).expect("expected a readable event");
        assert!(readiness.readable);
        hub.shutdown();
    }

    fn mio_listener_source(listener: &mut mio::net::TcpListener) -> mio::net::TcpListener {
        // mio::net::TcpListener doesn't implement Clone; tests only need one
        // owned value to register, so swap a throwaway placeholder in.
        let placeholder = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        std::mem::replace(listener, placeholder)
    }

    #[test]
    fn remove_interest_deregisters_when_nothing_remains() {
        assert_eq!(
            remove_interest(Interest::READABLE, Interest::READABLE),
            None
        );
        assert!(remove_interest(Interest::READABLE.add(Interest::WRITABLE), Interest::READABLE).is_some());
    }

    fn assert_send<T: Send>() {}
    #[test]
    fn io_hub_is_send() {
        assert_send::<IoHub>();
    }
}
