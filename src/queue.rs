//! Bounded pacing queue.
//!
//! [`PacingQueue`] hands image indices between the application thread and a backend thread. It is
//! used as present queue (application to pacing thread) and as acquire queue (backend completion to
//! application).
//!
//! Shutdown is expressed by closing the queue instead of pushing a magic value: once
//! [`PacingQueue::close`] was called, every blocked and every future [`PacingQueue::pop`] returns
//! [`PopError::Closed`] and further pushes are rejected.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Condvar, Mutex},
};

use crate::{timeout::Timeout, Error};

/// Error returned by [`PacingQueue::pop`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// The queue was closed
    #[error("The queue was closed")]
    Closed,
    /// The timeout expired before an item was pushed
    #[error("Waiting on the queue timed out")]
    Timeout(Error),
}

/// Error returned by [`PacingQueue::push`], giving back the rejected item
#[derive(thiserror::Error, PartialEq, Eq)]
pub enum PushError<T> {
    /// The queue was closed
    #[error("The queue was closed")]
    Closed(T),
    /// The queue is at capacity
    #[error("The queue is full")]
    Full(T),
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Closed(_) => f.write_str("Closed(..)"),
            PushError::Full(_) => f.write_str("Full(..)"),
        }
    }
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer queue with an explicit closed state
#[derive(Debug)]
pub struct PacingQueue<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> PacingQueue<T> {
    /// Creates a new queue holding at most `capacity` items
    pub fn new(capacity: usize) -> PacingQueue<T> {
        PacingQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Pushes an item and wakes up a waiting consumer.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        self.cond.notify_one();
        Ok(())
    }

    /// Pops the oldest item, waiting according to `timeout`.
    ///
    /// A closed queue reports [`PopError::Closed`] even if items are left.
    pub fn pop(&self, timeout: &Timeout) -> Result<T, PopError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(PopError::Closed);
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            state = timeout.wait(&self.cond, state).map_err(PopError::Timeout)?;
        }
    }

    /// Closes the queue and wakes up every waiter
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.cond.notify_all();
    }

    /// Returns true once [`PacingQueue::close`] was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    /// Returns true if no item is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{PacingQueue, PopError, PushError};
    use crate::{timeout::Timeout, Error};
    use std::{
        sync::{mpsc, Arc},
        thread,
        time::Duration,
    };

    #[test]
    fn fifo_order() {
        let queue = PacingQueue::new(3);
        queue.push(2u32).unwrap();
        queue.push(0).unwrap();
        queue.push(1).unwrap();
        assert_eq!(queue.push(5), Err(PushError::Full(5)));
        assert_eq!(queue.pop(&Timeout::Poll), Ok(2));
        assert_eq!(queue.pop(&Timeout::Poll), Ok(0));
        assert_eq!(queue.pop(&Timeout::Poll), Ok(1));
    }

    #[test]
    fn empty_poll_is_not_ready() {
        let queue = PacingQueue::<u32>::new(2);
        assert_eq!(queue.pop(&Timeout::Poll), Err(PopError::Timeout(Error::NotReady)));
        assert_eq!(
            queue.pop(&Timeout::after(Duration::from_millis(5))),
            Err(PopError::Timeout(Error::Timeout))
        );
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue = Arc::new(PacingQueue::<u32>::new(2));
        let (tx, rx) = mpsc::channel();
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                tx.send(queue.pop(&Timeout::Infinite)).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        let result = rx.recv_timeout(Duration::from_secs(5)).expect("consumer stayed blocked");
        assert_eq!(result, Err(PopError::Closed));
        consumer.join().unwrap();
        assert_eq!(queue.push(1), Err(PushError::Closed(1)));
    }

    #[test]
    fn push_wakes_blocked_consumer() {
        let queue = Arc::new(PacingQueue::<u32>::new(2));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop(&Timeout::Infinite))
        };
        thread::sleep(Duration::from_millis(10));
        queue.push(7).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(7));
    }
}
