use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// FIFO of outbound payloads shared by the connection's threads and by
/// whoever enqueues work for the peer.
#[derive(Debug, Default)]
pub struct RequestQueue {
    queue: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a payload and wakes one waiter.
    pub fn push(&self, payload: Vec<u8>) {
        self.lock().push_back(payload);
        self.available.notify_one();
    }

    /// Takes the oldest payload, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let queue = self.lock();
        let (mut queue, _) = self
            .available
            .wait_timeout_while(queue, timeout, |queue| queue.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes and returns everything queued, oldest first.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.lock().drain(..).collect()
    }
}
