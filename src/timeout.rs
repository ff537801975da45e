//! Acquire timeouts.
//!
//! Timeouts are passed in nanoseconds, following the usual convention of graphics apis:
//! `0` polls, `u64::MAX` waits forever and every other value is converted once into an absolute
//! deadline. Waiting against a deadline is robust against spurious wake-ups, because the remaining
//! time is recomputed on every iteration.

use std::{
    sync::{Condvar, MutexGuard},
    time::{Duration, Instant},
};

use crate::Error;

/// How long an acquire operation may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Never block
    Poll,
    /// Block until the deadline has passed
    Deadline(Instant),
    /// Block until an image becomes available
    Infinite,
}

impl Timeout {
    /// Converts a relative timeout in nanoseconds into a [`Timeout`].
    pub fn from_nanos(nanos: u64) -> Timeout {
        match nanos {
            0 => Timeout::Poll,
            u64::MAX => Timeout::Infinite,
            nanos => Instant::now()
                .checked_add(Duration::from_nanos(nanos))
                .map(Timeout::Deadline)
                .unwrap_or(Timeout::Infinite),
        }
    }

    /// Converts a relative [`Duration`] into a [`Timeout`].
    pub fn after(duration: Duration) -> Timeout {
        Timeout::from_nanos(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX - 1).max(1))
    }

    /// Returns true if this timeout never blocks
    pub fn is_poll(&self) -> bool {
        matches!(self, Timeout::Poll)
    }

    /// Time left until the deadline.
    ///
    /// Returns `None` for [`Timeout::Infinite`] and a zero duration once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Timeout::Poll => Some(Duration::ZERO),
            Timeout::Deadline(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
            Timeout::Infinite => None,
        }
    }

    /// Returns true once no more waiting is allowed
    pub fn expired(&self) -> bool {
        self.remaining().map(|left| left.is_zero()).unwrap_or(false)
    }

    /// Caps the remaining time to `slice`, used by waits that need to wake up periodically.
    pub fn slice(&self, slice: Duration) -> Duration {
        self.remaining().map(|left| left.min(slice)).unwrap_or(slice)
    }

    /// The error reported when this timeout ran out without a result
    pub fn expired_error(&self) -> Error {
        match self {
            Timeout::Poll => Error::NotReady,
            _ => Error::Timeout,
        }
    }

    /// Waits once on `cond`.
    ///
    /// Returns the re-acquired guard, or the error to report if the timeout has already expired.
    /// Callers are expected to re-check their condition in a loop, as the wait may return early.
    pub fn wait<'a, T>(
        &self,
        cond: &Condvar,
        guard: MutexGuard<'a, T>,
    ) -> Result<MutexGuard<'a, T>, Error> {
        match self.remaining() {
            None => Ok(cond.wait(guard).unwrap()),
            Some(left) if left.is_zero() => Err(self.expired_error()),
            Some(left) => Ok(cond.wait_timeout(guard, left).unwrap().0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Timeout;
    use crate::Error;
    use std::{
        sync::{Condvar, Mutex},
        time::{Duration, Instant},
    };

    #[test]
    fn special_values() {
        assert_eq!(Timeout::from_nanos(0), Timeout::Poll);
        assert_eq!(Timeout::from_nanos(u64::MAX), Timeout::Infinite);
        assert!(matches!(Timeout::from_nanos(1_000), Timeout::Deadline(_)));
        assert_eq!(Timeout::Infinite.remaining(), None);
    }

    #[test]
    fn poll_expires_immediately() {
        let timeout = Timeout::Poll;
        assert!(timeout.expired());
        let lock = Mutex::new(());
        let cond = Condvar::new();
        let guard = lock.lock().unwrap();
        assert_eq!(timeout.wait(&cond, guard).err(), Some(Error::NotReady));
    }

    #[test]
    fn deadline_is_honored_despite_spurious_wakeups() {
        let timeout = Timeout::after(Duration::from_millis(30));
        let lock = Mutex::new(());
        let cond = Condvar::new();
        let start = Instant::now();
        let mut guard = lock.lock().unwrap();
        let err = loop {
            // nothing ever notifies, every return before the deadline counts as spurious
            match timeout.wait(&cond, guard) {
                Ok(g) => guard = g,
                Err(err) => break err,
            }
        };
        assert_eq!(err, Error::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn slice_caps_waits() {
        assert_eq!(
            Timeout::Infinite.slice(Duration::from_millis(5)),
            Duration::from_millis(5)
        );
        assert_eq!(Timeout::Poll.slice(Duration::from_millis(5)), Duration::ZERO);
    }
}
