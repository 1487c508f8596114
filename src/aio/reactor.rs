use std::{
    collections::{HashMap, VecDeque, hash_map::Entry},
    io::{self, ErrorKind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use log::{debug, error, trace, warn};
use mio::{Events, Poll, Registry, Token, Waker, unix::SourceFd};

use crate::net::{Socket, SocketError};

use super::{Backend, Interest, Job, Operation, Progress, pool::ThreadPool};

const WAKER: Token = Token(usize::MAX);

/// Operations waiting on one socket. At most one read; writes queue up only for
/// datagram sends, which go out whole and in any order.
struct Parked {
    socket: Socket,
    read: Option<Operation>,
    writes: VecDeque<Operation>,
    registered: bool,
}

impl Parked {
    fn interest(&self) -> Option<mio::Interest> {
        match (self.read.is_some(), !self.writes.is_empty()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

struct Shared {
    registry: Registry,
    waker: Waker,
    parked: Mutex<HashMap<Token, Parked>>,
    workers: ThreadPool,
    stopped: AtomicBool,
}

/// Readiness-driven backend: a poller thread watches non-blocking sockets and
/// hands operations whose socket became ready back to the worker pool.
pub(crate) struct Reactor {
    shared: Arc<Shared>,
    poller: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Reactor {
    pub(crate) fn new(workers: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let shared = Arc::new(Shared {
            registry,
            waker,
            parked: Mutex::new(HashMap::new()),
            workers: ThreadPool::new("reactor", workers)?,
            stopped: AtomicBool::new(false),
        });

        let poller_shared = Arc::clone(&shared);
        let poller = thread::Builder::new()
            .name("poller".into())
            .spawn(move || poll_loop(poll, poller_shared))?;

        Ok(Self {
            shared,
            poller: Mutex::new(Some(poller)),
        })
    }
}

impl Backend for Reactor {
    fn submit(&self, socket: Socket, operation: Operation) {
        if self.shared.stopped.load(Ordering::Acquire) {
            trace!("dispatcher stopped, dropping {} on socket #{}", operation.name(), socket.id());
            return;
        }
        if !socket.is_nonblocking() {
            if let Err(e) = socket.set_blocking_mode(false) {
                self.shared.workers.execute(operation.abort(e));
                return;
            }
        }

        let shared = Arc::clone(&self.shared);
        self.shared
            .workers
            .execute(move || attempt(&shared, socket, operation));
    }

    fn execute(&self, job: Job) {
        self.shared.workers.execute(job);
    }

    fn is_nonblocking(&self) -> bool {
        true
    }

    fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.shared.waker.wake() {
            warn!("failed to wake poller: {e}");
        }

        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poller) = poller {
            if poller.thread().id() != thread::current().id() && poller.join().is_err() {
                warn!("poller thread panicked");
            }
        }

        self.shared
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.shared.workers.shutdown();
    }
}

fn attempt(shared: &Arc<Shared>, socket: Socket, operation: Operation) {
    if socket.is_closed() {
        operation.abort(SocketError::Closed)();
        return;
    }
    match operation.execute(&socket) {
        Progress::Complete(job) => job(),
        Progress::Wait(interest, operation) => park(shared, socket, interest, operation),
    }
}

fn park(shared: &Arc<Shared>, socket: Socket, interest: Interest, operation: Operation) {
    let token = Token(socket.id());
    let fd = socket.raw_fd();

    let mut parked = shared.parked.lock().unwrap_or_else(PoisonError::into_inner);
    let entry = parked.entry(token).or_insert_with(|| Parked {
        socket: socket.clone(),
        read: None,
        writes: VecDeque::new(),
        registered: false,
    });

    let busy = match interest {
        Interest::Read => entry.read.is_some(),
        Interest::Write => {
            !entry.writes.is_empty() && !matches!(operation, Operation::SendTo { .. })
        }
    };
    if busy {
        drop(parked);
        error!(
            "socket #{}: second {} submitted while one is pending",
            socket.id(),
            operation.name()
        );
        operation.abort(io::Error::from(ErrorKind::ResourceBusy).into())();
        return;
    }
    match interest {
        Interest::Read => entry.read = Some(operation),
        Interest::Write => entry.writes.push_back(operation),
    }

    let Some(wanted) = entry.interest() else {
        return;
    };
    let mut source = SourceFd(&fd);
    let result = if entry.registered {
        shared.registry.reregister(&mut source, token, wanted)
    } else {
        match shared.registry.register(&mut source, token, wanted) {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                shared.registry.reregister(&mut source, token, wanted)
            }
            other => other,
        }
    };

    match result {
        Ok(()) => entry.registered = true,
        Err(e) => {
            warn!("socket #{}: failed to register with poller: {e}", socket.id());
            let failed = match interest {
                Interest::Read => entry.read.take(),
                Interest::Write => entry.writes.pop_back(),
            };
            drop(parked);
            if let Some(operation) = failed {
                operation.abort(e.into())();
            }
        }
    }
}

fn poll_loop(mut poll: Poll, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(256);
    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!("poller failed: {e}");
            return;
        }
        if shared.stopped.load(Ordering::Acquire) {
            debug!("poller stopped");
            return;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER {
                continue;
            }

            let failed = event.is_error();
            let readable = event.is_readable() || event.is_read_closed() || failed;
            let writable = event.is_writable() || event.is_write_closed() || failed;

            let (socket, ready) = {
                let mut parked = shared.parked.lock().unwrap_or_else(PoisonError::into_inner);
                let Entry::Occupied(mut entry) = parked.entry(token) else {
                    continue;
                };
                let waiting = entry.get_mut();
                let mut ready = Vec::new();
                if readable {
                    ready.extend(waiting.read.take());
                }
                if writable {
                    ready.extend(waiting.writes.drain(..));
                }
                let socket = waiting.socket.clone();

                if waiting.interest().is_none() {
                    entry.remove();
                    let fd = socket.raw_fd();
                    if let Err(e) = shared.registry.deregister(&mut SourceFd(&fd)) {
                        trace!("socket #{}: deregister: {e}", socket.id());
                    }
                }
                (socket, ready)
            };

            for operation in ready {
                let socket = socket.clone();
                let worker_shared = Arc::clone(&shared);
                shared
                    .workers
                    .execute(move || attempt(&worker_shared, socket, operation));
            }
        }
    }
}
