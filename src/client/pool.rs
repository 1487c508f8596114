use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, PoisonError},
};

use crate::net::Socket;

/// One entry of the pool.
#[derive(Debug)]
pub(crate) enum Slot {
    Idle(Socket),
    /// No socket has been created for this slot yet, or its last one was discarded.
    Vacant,
}

/// Bounded queue of client sockets. It starts full of [`Slot::Vacant`] entries, so
/// the number of sockets alive at once never exceeds its capacity.
#[derive(Debug)]
pub(crate) struct SocketPool {
    slots: Mutex<VecDeque<Slot>>,
    available: Condvar,
    capacity: usize,
}

impl SocketPool {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new((0..capacity).map(|_| Slot::Vacant).collect()),
            available: Condvar::new(),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes the next entry, blocking until one is returned if the pool is empty.
    pub(crate) fn acquire(&self) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(slot) = slots.pop_front() {
                return slot;
            }
            slots = self
                .available
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns an entry taken with [`acquire`](Self::acquire). Never blocks.
    pub(crate) fn release(&self, slot: Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(slots.len() < self.capacity, "more slots released than acquired");
        // Idle sockets go first so warm connections are reused before new ones are made.
        match slot {
            Slot::Idle(_) => slots.push_front(slot),
            Slot::Vacant => slots.push_back(slot),
        }
        drop(slots);
        self.available.notify_one();
    }

    pub(crate) fn idle(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|slot| matches!(slot, Slot::Idle(_)))
            .count()
    }

    /// Closes every idle socket, leaving vacant entries in their place.
    pub(crate) fn drain(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut closed = 0;
        for slot in slots.iter_mut() {
            if let Slot::Idle(socket) = std::mem::replace(slot, Slot::Vacant) {
                socket.close();
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, mpsc::channel},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::aio::test_dispatchers;

    #[test]
    fn starts_vacant() {
        let pool = SocketPool::new(3);
        assert_eq!(pool.capacity(), 3);
        for _ in 0..3 {
            assert!(matches!(pool.acquire(), Slot::Vacant));
        }
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(SocketPool::new(1));
        let first = pool.acquire();

        let (tx, rx) = channel();
        let waiter = Arc::clone(&pool);
        let handle = thread::spawn(move || {
            let slot = waiter.acquire();
            tx.send(()).unwrap();
            slot
        });

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        pool.release(first);
        rx.recv().unwrap();
        assert!(matches!(handle.join().unwrap(), Slot::Vacant));
    }

    #[test]
    fn idle_sockets_are_preferred() {
        for dispatcher in test_dispatchers() {
            let pool = SocketPool::new(2);
            let _a = pool.acquire();
            let _b = pool.acquire();

            let socket = Socket::stream(&dispatcher, "127.0.0.1:1".parse().unwrap(), false).unwrap();
            let id = socket.id();
            pool.release(Slot::Vacant);
            pool.release(Slot::Idle(socket));
            assert_eq!(pool.idle(), 1);

            match pool.acquire() {
                Slot::Idle(socket) => assert_eq!(socket.id(), id),
                Slot::Vacant => panic!("expected the idle socket"),
            }
            dispatcher.shutdown();
        }
    }

    #[test]
    fn drain_closes_idle_sockets() {
        for dispatcher in test_dispatchers() {
            let pool = SocketPool::new(1);
            let _ = pool.acquire();
            let socket = Socket::stream(&dispatcher, "127.0.0.1:1".parse().unwrap(), false).unwrap();
            pool.release(Slot::Idle(socket.clone()));

            assert_eq!(pool.drain(), 1);
            assert!(socket.is_closed());
            assert_eq!(pool.idle(), 0);
            dispatcher.shutdown();
        }
    }
}
