//! Asynchronous completion dispatch.
//!
//! Socket operations are submitted here and their continuations run later on a worker
//! thread. A [`Dispatcher`] is an explicit handle: it is constructed once at start-up,
//! cloned into every client, server and socket that needs it, and torn down with
//! [`Dispatcher::shutdown`]. There is no process-wide instance.
//!
//! # Backends
//!
//! - [`BackendKind::CompletionQueue`]: each operation is staged on a blocking I/O thread;
//!   once it finishes, its continuation is queued for the worker pool, which dequeues
//!   completions the way threads service a completion port.
//! - [`BackendKind::Reactor`]: sockets are non-blocking. An operation is attempted on a
//!   worker; if the socket is not ready the operation is parked with a `mio` poller and
//!   retried on a worker once readiness is reported.
//!
//! Both backends deliver the same completions, so nothing above this module knows which
//! one is running.
//!
//! # Ordering
//!
//! Completions of different sockets are unordered. Callers keep at most one read and
//! one write outstanding per socket, which keeps each socket's completions in submission
//! order.
use std::{sync::Arc, time::Duration};

use log::info;

use crate::{
    config::{BackendKind, DispatcherConfig},
    net::{Socket, SocketError},
};

mod op;
pub mod pool;
mod queue;
#[cfg(unix)]
mod reactor;
mod timer;

pub(crate) use op::{Interest, MAX_DATAGRAM, Operation, Progress};
pub use timer::Timer;

use queue::CompletionQueue;
use timer::TimerQueue;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Continuation receiving the outcome of a single socket operation.
pub type Callback<T> = Box<dyn FnOnce(Result<T, SocketError>) + Send + 'static>;

/// The seam between sockets and whatever performs their I/O.
pub(crate) trait Backend: Send + Sync {
    fn submit(&self, socket: Socket, operation: Operation);

    /// Runs an arbitrary continuation on a worker thread.
    fn execute(&self, job: Job);

    /// Whether sockets driven by this backend must be in non-blocking mode.
    fn is_nonblocking(&self) -> bool;

    fn shutdown(&self);
}

struct Inner {
    kind: BackendKind,
    backend: Arc<dyn Backend>,
    timers: TimerQueue,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.timers.shutdown();
        self.backend.shutdown();
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.inner.kind)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(config: &DispatcherConfig) -> Result<Self, SocketError> {
        let workers = config.workers.max(1);
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::CompletionQueue => Arc::new(CompletionQueue::new(workers)?),
            #[cfg(unix)]
            BackendKind::Reactor => Arc::new(reactor::Reactor::new(workers)?),
            #[cfg(not(unix))]
            BackendKind::Reactor => {
                return Err(SocketError::Unsupported(
                    "the reactor backend requires a unix platform",
                ));
            }
        };
        let timers = TimerQueue::new(Arc::clone(&backend))?;
        info!("started {:?} dispatcher with {workers} workers", config.backend);

        Ok(Self {
            inner: Arc::new(Inner {
                kind: config.backend,
                backend,
                timers,
            }),
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.kind
    }

    /// Runs `f` on a worker thread.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.backend.execute(Box::new(f));
    }

    /// Runs `f` on a worker thread once `after` has elapsed, unless cancelled.
    pub fn schedule<F>(&self, after: Duration, f: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.timers.schedule(after, Box::new(f))
    }

    /// Stops timers, workers and pollers. Pending operations are dropped without
    /// their continuations running.
    pub fn shutdown(&self) {
        info!("shutting down {:?} dispatcher", self.inner.kind);
        self.inner.timers.shutdown();
        self.inner.backend.shutdown();
    }

    pub(crate) fn submit(&self, socket: Socket, operation: Operation) {
        self.inner.backend.submit(socket, operation);
    }

    pub(crate) fn is_nonblocking(&self) -> bool {
        self.inner.backend.is_nonblocking()
    }
}

/// One dispatcher per backend, so loopback tests cover both.
#[cfg(test)]
pub(crate) fn test_dispatchers() -> Vec<Dispatcher> {
    [BackendKind::CompletionQueue, BackendKind::Reactor]
        .into_iter()
        .map(|backend| Dispatcher::new(&DispatcherConfig { backend, workers: 2 }).unwrap())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;

    #[test]
    fn execute_runs_on_worker() {
        for dispatcher in test_dispatchers() {
            let (tx, rx) = channel();
            let caller = std::thread::current().id();
            dispatcher.execute(move || tx.send(std::thread::current().id()).unwrap());

            assert_ne!(rx.recv().unwrap(), caller);
            dispatcher.shutdown();
        }
    }

    #[test]
    fn schedule_fires_after_delay() {
        for dispatcher in test_dispatchers() {
            let (tx, rx) = channel();
            let start = std::time::Instant::now();
            dispatcher.schedule(Duration::from_millis(30), move || tx.send(()).unwrap());

            rx.recv().unwrap();
            assert!(start.elapsed() >= Duration::from_millis(30));
            dispatcher.shutdown();
        }
    }

    #[test]
    fn cancelled_schedule_is_silent() {
        let dispatcher = Dispatcher::new(&DispatcherConfig::default()).unwrap();
        let (tx, rx) = channel::<()>();
        let timer = dispatcher.schedule(Duration::from_millis(20), move || tx.send(()).unwrap());

        assert!(timer.cancel());
        assert!(rx.recv_timeout(Duration::from_millis(60)).is_err());
        dispatcher.shutdown();
    }
}
