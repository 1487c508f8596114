use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use log::{debug, warn};

use super::Job;

/// Fixed set of worker threads draining a shared job queue. Completions are
/// delivered by posting a job here, so the queue plays the part of the
/// completion port that workers dequeue from.
#[derive(Debug)]
pub struct ThreadPool {
    name: &'static str,
    workers: Mutex<Vec<Worker>>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

impl ThreadPool {
    pub fn new(name: &'static str, size: usize) -> io::Result<Self> {
        assert!(size > 0);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));

        for i in 0..size {
            workers.push(Worker::new(name, i, Arc::clone(&receiver))?);
        }

        Ok(Self {
            name,
            workers: Mutex::new(workers),
            sender: Mutex::new(Some(sender)),
        })
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(f);
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!("{} pool: all workers exited, dropping job", self.name);
                }
            }
            None => debug!("{} pool: shut down, dropping job", self.name),
        }
    }

    /// Stops accepting jobs and joins every worker once the queue drains. A worker
    /// that triggers the shutdown itself is detached rather than joined.
    pub fn shutdown(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for worker in workers {
            if worker.thread.thread().id() == current {
                continue;
            }
            debug!("shutting down {} worker {}", self.name, worker.id);
            if worker.thread.join().is_err() {
                warn!("{} worker {} panicked", self.name, worker.id);
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(
        name: &'static str,
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("{name}-{id}"))
            .spawn(move || {
                loop {
                    let msg = receiver
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .recv();
                    match msg {
                        Ok(job) => job(),
                        Err(_) => {
                            debug!("{name} worker {id} disconnected");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}

const STAGER_KEEPALIVE: Duration = Duration::from_secs(10);

/// Elastic set of threads that run blocking I/O. Every staged job is guaranteed a
/// thread of its own: an idle thread is reserved if one exists, otherwise a new
/// one is spawned. Threads exit after sitting idle for a while.
#[derive(Debug)]
pub(crate) struct StagingPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    idle: Arc<AtomicUsize>,
    spawned: AtomicUsize,
    stack_size: Option<usize>,
}

impl StagingPool {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(Mutex::new(receiver)),
            idle: Arc::new(AtomicUsize::new(0)),
            spawned: AtomicUsize::new(0),
            stack_size: None,
        }
    }

    /// A pool whose threads get `size` bytes of stack.
    #[cfg(test)]
    pub(crate) fn with_stack_size(size: usize) -> Self {
        Self {
            stack_size: Some(size),
            ..Self::new()
        }
    }

    /// Runs `job` on a thread of its own. When no thread can be had, the job is
    /// handed back so the caller can still run it somewhere.
    pub(crate) fn stage(&self, job: Job) -> Result<(), Job> {
        let reserved = self
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();

        if reserved {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            return match sender.as_ref() {
                Some(sender) => sender.send(job).map_err(|mpsc::SendError(job)| job),
                None => {
                    debug!("staging pool shut down, dropping operation");
                    Ok(())
                }
            };
        }

        let id = self.spawned.fetch_add(1, Ordering::Relaxed);
        let receiver = Arc::clone(&self.receiver);
        let idle = Arc::clone(&self.idle);
        let slot = Arc::new(Mutex::new(Some(job)));
        let first = Arc::clone(&slot);

        let mut builder = thread::Builder::new().name(format!("stager-{id}"));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let spawned = builder.spawn(move || {
            let job = first.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(job) = job {
                stager(job, receiver, idle);
            }
        });
        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("failed to spawn stager thread: {e}");
                match slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    Some(job) => Err(job),
                    None => Ok(()),
                }
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }
}

fn stager(first: Job, receiver: Arc<Mutex<mpsc::Receiver<Job>>>, idle: Arc<AtomicUsize>) {
    first();
    loop {
        idle.fetch_add(1, Ordering::AcqRel);
        loop {
            let msg = receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv_timeout(STAGER_KEEPALIVE);
            match msg {
                Ok(job) => {
                    job();
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // Only leave if no submitter has reserved this thread meanwhile.
                    let released = idle
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                        .is_ok();
                    if released {
                        return;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}
