use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use log::trace;

use crate::net::{Socket, SocketError};

use super::{
    Backend, Job, Operation, Progress,
    pool::{StagingPool, ThreadPool},
};

/// Completion-port style backend. Staging threads perform blocking I/O on behalf
/// of the submitter; each finished operation is posted to the completion queue
/// that the worker pool drains.
pub(crate) struct CompletionQueue {
    completions: Arc<ThreadPool>,
    staging: StagingPool,
    stopped: AtomicBool,
}

impl CompletionQueue {
    pub(crate) fn new(workers: usize) -> io::Result<Self> {
        Ok(Self {
            completions: Arc::new(ThreadPool::new("completion", workers)?),
            staging: StagingPool::new(),
            stopped: AtomicBool::new(false),
        })
    }
}

impl Backend for CompletionQueue {
    fn submit(&self, socket: Socket, operation: Operation) {
        if self.stopped.load(Ordering::Acquire) {
            // Nothing would ever run the continuation; drop it.
            trace!("dispatcher stopped, dropping {} on socket #{}", operation.name(), socket.id());
            return;
        }
        if socket.is_nonblocking() {
            // A socket handed over from a non-blocking owner would make staging spin.
            if let Err(e) = socket.set_blocking_mode(true) {
                self.completions.execute(operation.abort(e));
                return;
            }
        }

        let completions = Arc::clone(&self.completions);
        let staged = self.staging.stage(Box::new(move || {
            let job = run_to_completion(&socket, operation);
            completions.execute(job);
        }));
        if let Err(staged) = staged {
            // No staging thread to be had; a worker blocks on it instead.
            self.completions.execute(staged);
        }
    }

    fn execute(&self, job: Job) {
        self.completions.execute(job);
    }

    fn is_nonblocking(&self) -> bool {
        false
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.staging.shutdown();
        self.completions.shutdown();
    }
}

/// On a blocking socket an operation only asks to wait when a platform quirk
/// surfaces `WouldBlock`; retrying after a yield is enough.
fn run_to_completion(socket: &Socket, mut operation: Operation) -> Job {
    loop {
        if socket.is_closed() {
            return operation.abort(SocketError::Closed);
        }
        match operation.execute(socket) {
            Progress::Complete(job) => return job,
            Progress::Wait(_, pending) => {
                operation = pending;
                thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        sync::mpsc::channel,
    };

    use super::*;
    use crate::{
        aio::Dispatcher,
        config::{BackendKind, DispatcherConfig},
    };

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(&DispatcherConfig {
            backend: BackendKind::CompletionQueue,
            workers: 2,
        })
        .unwrap()
    }

    #[test]
    fn blocked_read_does_not_stall_other_sockets() {
        let dispatcher = dispatcher();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let idle = Socket::stream(&dispatcher, addr, false).unwrap();
        idle.connect(addr).unwrap();
        let (_idle_peer, _) = listener.accept().unwrap();

        let busy = Socket::stream(&dispatcher, addr, false).unwrap();
        busy.connect(addr).unwrap();
        let (mut busy_peer, _) = listener.accept().unwrap();

        // Nothing is ever written to `idle`, so its read parks a staging thread.
        idle.aio_read(Vec::new(), |_| {});

        let (tx, rx) = channel();
        busy.aio_read(Vec::new(), move |res| tx.send(res.unwrap()).unwrap());
        busy_peer.write_all(b"ping").unwrap();

        assert_eq!(rx.recv().unwrap(), b"ping");
        idle.close();
        dispatcher.shutdown();
    }

    #[test]
    fn write_completion_reports_length() {
        let dispatcher = dispatcher();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let socket = Socket::stream(&dispatcher, addr, false).unwrap();
        let (tx, rx) = channel();
        let writer = socket.clone();
        socket.aio_connect(addr, None, move |res| {
            res.unwrap();
            writer.aio_write(vec![7; 10_000], move |res| tx.send(res.unwrap()).unwrap());
        });

        let (mut peer, _) = listener.accept().unwrap();
        let mut received = vec![0; 10_000];
        peer.read_exact(&mut received).unwrap();

        assert_eq!(rx.recv().unwrap(), 10_000);
        assert!(received.iter().all(|b| *b == 7));
        dispatcher.shutdown();
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn operation_completes_without_staging_threads() {
        let dispatcher = dispatcher();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = Socket::stream(&dispatcher, addr, false).unwrap();
        socket.connect(addr).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let queue = CompletionQueue {
            completions: Arc::new(ThreadPool::new("completion", 1).unwrap()),
            staging: StagingPool::with_stack_size(1 << 62),
            stopped: AtomicBool::new(false),
        };
        let (tx, rx) = channel();
        queue.submit(
            socket,
            Operation::Write {
                buffer: b"fallback".to_vec(),
                written: 0,
                done: Box::new(move |res: Result<usize, SocketError>| tx.send(res.unwrap()).unwrap()),
            },
        );

        assert_eq!(rx.recv().unwrap(), 8);
        let mut received = [0u8; 8];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"fallback");
        queue.shutdown();
        dispatcher.shutdown();
    }
}
