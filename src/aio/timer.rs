use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{Arc, Condvar, Mutex, PoisonError, Weak},
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};

use super::{Backend, Job};

#[derive(Default)]
struct State {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    jobs: HashMap<u64, Job>,
    next_id: u64,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

/// One thread sleeping until the earliest deadline. Expired jobs are handed to
/// the backend so they run on a worker like any other completion.
pub(crate) struct TimerQueue {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Cancels the scheduled job when asked; dropping the handle leaves it armed.
#[derive(Debug, Clone)]
pub struct Timer {
    id: u64,
    shared: Weak<Shared>,
}

impl Timer {
    /// Returns `true` if the job had not fired yet.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.jobs.remove(&self.id).is_some()
    }
}

impl TimerQueue {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Result<Self, std::io::Error> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("timer".into())
            .spawn(move || run(worker, backend))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn schedule(&self, after: Duration, job: Job) -> Timer {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_id;
        state.next_id += 1;
        state.deadlines.push(Reverse((Instant::now() + after, id)));
        state.jobs.insert(id, job);
        self.shared.wakeup.notify_one();

        Timer {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.stopped = true;
            state.jobs.clear();
        }
        self.shared.wakeup.notify_all();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }
}

fn run(shared: Arc<Shared>, backend: Arc<dyn Backend>) {
    let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if state.stopped {
            debug!("timer queue stopped");
            return;
        }

        let now = Instant::now();
        let next = state.deadlines.peek().map(|Reverse((at, id))| (*at, *id));
        match next {
            Some((at, id)) if at <= now => {
                state.deadlines.pop();
                // Cancelled timers leave a stale deadline behind with no job.
                if let Some(job) = state.jobs.remove(&id) {
                    drop(state);
                    backend.execute(job);
                    state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
                }
            }
            Some((at, _)) => {
                state = shared
                    .wakeup
                    .wait_timeout(state, at - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            None => {
                state = shared
                    .wakeup
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{Sender, channel};

    use super::*;
    use crate::{aio::Operation, net::Socket};

    /// Runs jobs inline on the timer thread.
    struct Inline;

    impl Backend for Inline {
        fn submit(&self, _socket: Socket, _operation: Operation) {}
        fn execute(&self, job: Job) {
            job()
        }
        fn is_nonblocking(&self) -> bool {
            false
        }
        fn shutdown(&self) {}
    }

    fn send_after(queue: &TimerQueue, millis: u64, tx: &Sender<u64>) -> Timer {
        let tx = tx.clone();
        queue.schedule(
            Duration::from_millis(millis),
            Box::new(move || tx.send(millis).unwrap()),
        )
    }

    #[test]
    fn fires_in_deadline_order() {
        let queue = TimerQueue::new(Arc::new(Inline)).unwrap();
        let (tx, rx) = channel();

        send_after(&queue, 60, &tx);
        send_after(&queue, 10, &tx);
        send_after(&queue, 30, &tx);

        let fired: Vec<u64> = rx.iter().take(3).collect();
        assert_eq!(fired, vec![10, 30, 60]);
        queue.shutdown();
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let queue = TimerQueue::new(Arc::new(Inline)).unwrap();
        let (tx, rx) = channel();

        let timer = send_after(&queue, 20, &tx);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        send_after(&queue, 40, &tx);

        assert_eq!(rx.recv().unwrap(), 40);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        queue.shutdown();
    }
}
