//! Sticky swapchain status.
//!
//! Backends report the result of every operation to a [`StatusTracker`], which folds them into one
//! status following a *stickiest-wins* rule:
//!
//! - A terminal error is remembered and returned by every later call, no matter what the backend
//!   reports afterwards.
//! - [`Error::Timeout`] and [`Error::NotReady`] are returned to the caller but never remembered.
//! - A suboptimal result is remembered as well, later successes are reported as suboptimal.
//!
//! ```
//! # use wsi::{Error, status::{Outcome, StatusTracker}};
//! let status = StatusTracker::new();
//! assert_eq!(status.record(Ok(Outcome::Suboptimal)), Ok(Outcome::Suboptimal));
//! assert_eq!(status.record(Ok(Outcome::Optimal)), Ok(Outcome::Suboptimal));
//! assert_eq!(status.record(Err(Error::OutOfDate)), Err(Error::OutOfDate));
//! assert_eq!(status.record(Ok(Outcome::Optimal)), Err(Error::OutOfDate));
//! ```

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::Error;

/// Non-error result of a swapchain operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Outcome {
    /// Presentation works as intended
    #[default]
    Optimal,
    /// Presentation works, but the swapchain should be recreated for best results
    Suboptimal,
}

impl Outcome {
    /// Returns true for [`Outcome::Suboptimal`]
    pub fn is_suboptimal(&self) -> bool {
        *self == Outcome::Suboptimal
    }

    fn merge(self, other: Outcome) -> Outcome {
        if self.is_suboptimal() || other.is_suboptimal() {
            Outcome::Suboptimal
        } else {
            Outcome::Optimal
        }
    }
}

/// Current state of a swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Working, possibly suboptimal
    Ok(Outcome),
    /// Failed for good
    Failed(Error),
}

impl Default for Status {
    fn default() -> Self {
        Status::Ok(Outcome::Optimal)
    }
}

impl Status {
    /// Converts the status into the result reported to callers
    pub fn as_result(&self) -> Result<Outcome, Error> {
        match *self {
            Status::Ok(outcome) => Ok(outcome),
            Status::Failed(err) => Err(err),
        }
    }
}

/// Shared, monotonic status of a swapchain.
///
/// Cloning a tracker creates another handle to the same status, so background threads of a backend
/// can report into it.
#[derive(Debug, Clone, Default)]
pub struct StatusTracker(Arc<Mutex<Status>>);

impl StatusTracker {
    /// Create a new tracker in the optimal state
    pub fn new() -> StatusTracker {
        StatusTracker::default()
    }

    /// Returns the current status
    pub fn get(&self) -> Status {
        *self.0.lock().unwrap()
    }

    /// Returns the current status as result
    pub fn current(&self) -> Result<Outcome, Error> {
        self.get().as_result()
    }

    /// Returns true once a terminal error was recorded
    pub fn is_failed(&self) -> bool {
        matches!(self.get(), Status::Failed(_))
    }

    /// Folds a backend result into the status and returns what the caller should see.
    pub fn record(&self, result: Result<Outcome, Error>) -> Result<Outcome, Error> {
        let mut status = self.0.lock().unwrap();
        match (*status, result) {
            (Status::Failed(err), _) => Err(err),
            (Status::Ok(_), Err(err)) if err.is_transient() => Err(err),
            (Status::Ok(_), Err(err)) => {
                debug!(?err, "Swapchain entered terminal state");
                *status = Status::Failed(err);
                Err(err)
            }
            (Status::Ok(current), Ok(outcome)) => {
                let merged = current.merge(outcome);
                if merged != current {
                    debug!("Swapchain became suboptimal");
                }
                *status = Status::Ok(merged);
                Ok(merged)
            }
        }
    }

    /// Records an error and returns the one callers should see, shorthand for `record(Err(err))`
    pub fn fail(&self, err: Error) -> Error {
        match self.record(Err(err)) {
            Err(err) => err,
            Ok(_) => err,
        }
    }

    /// Marks the swapchain suboptimal
    pub fn mark_suboptimal(&self) {
        let _ = self.record(Ok(Outcome::Suboptimal));
    }
}

#[cfg(test)]
mod tests {
    use super::{Outcome, Status, StatusTracker};
    use crate::Error;

    #[test]
    fn terminal_error_sticks() {
        let status = StatusTracker::new();
        assert_eq!(status.record(Err(Error::SurfaceLost)), Err(Error::SurfaceLost));
        for _ in 0..3 {
            assert_eq!(status.record(Ok(Outcome::Optimal)), Err(Error::SurfaceLost));
        }
        // a different error does not replace the first one
        assert_eq!(status.record(Err(Error::OutOfDate)), Err(Error::SurfaceLost));
        assert_eq!(status.get(), Status::Failed(Error::SurfaceLost));
    }

    #[test]
    fn suboptimal_is_never_cleared() {
        let status = StatusTracker::new();
        assert_eq!(status.record(Ok(Outcome::Optimal)), Ok(Outcome::Optimal));
        status.mark_suboptimal();
        assert_eq!(status.record(Ok(Outcome::Optimal)), Ok(Outcome::Suboptimal));
        assert_eq!(status.current(), Ok(Outcome::Suboptimal));
    }

    #[test]
    fn transient_results_are_not_remembered() {
        let status = StatusTracker::new();
        assert_eq!(status.record(Err(Error::Timeout)), Err(Error::Timeout));
        assert_eq!(status.record(Err(Error::NotReady)), Err(Error::NotReady));
        assert_eq!(status.current(), Ok(Outcome::Optimal));
    }

    #[test]
    fn suboptimal_can_still_fail() {
        let status = StatusTracker::new();
        status.mark_suboptimal();
        assert_eq!(status.fail(Error::OutOfDate), Error::OutOfDate);
        assert_eq!(status.current(), Err(Error::OutOfDate));
    }

    #[test]
    fn clones_share_state() {
        let status = StatusTracker::new();
        let other = status.clone();
        other.fail(Error::DeviceLost);
        assert!(status.is_failed());
    }
}
