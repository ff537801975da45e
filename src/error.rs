use std::io;

use rustix::io::Errno;

/// Result codes returned by every swapchain and surface operation.
///
/// This is a closed set. [`Error::Timeout`] and [`Error::NotReady`] are temporary and never stick to a
/// swapchain, every other variant is terminal once a swapchain has reported it (see
/// [`StatusTracker`](crate::status::StatusTracker)).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// No image became available before the deadline
    #[error("Timed out waiting for an image")]
    Timeout,
    /// A non-blocking acquire found no available image
    #[error("No image is ready")]
    NotReady,
    /// Allocation of host memory or file descriptors failed
    #[error("Out of host memory")]
    OutOfHostMemory,
    /// Allocation of device memory failed
    #[error("Out of device memory")]
    OutOfDeviceMemory,
    /// The graphics device stopped working
    #[error("The device was lost")]
    DeviceLost,
    /// The surface is gone (window destroyed, display unplugged, connection lost)
    #[error("The surface was lost")]
    SurfaceLost,
    /// The surface changed in a way that requires the swapchain to be recreated
    #[error("The swapchain is out of date")]
    OutOfDate,
    /// The platform or device could not be initialized for presentation
    #[error("Initialization failed")]
    InitializationFailed,
    /// A requested feature is not supported by the backend
    #[error("Feature not present")]
    FeatureNotPresent,
    /// Any error that does not fit into another category
    #[error("Unknown error")]
    Unknown,
}

impl Error {
    /// Returns true for results that are only reported, never remembered.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout | Error::NotReady)
    }

    /// Classifies an os error of a failed allocation or system call.
    ///
    /// Resource exhaustion maps to [`Error::OutOfHostMemory`], everything else is reported as
    /// `fallback`.
    pub(crate) fn from_errno(errno: Option<Errno>, fallback: Error) -> Error {
        match errno {
            Some(Errno::NOMEM) | Some(Errno::MFILE) | Some(Errno::NFILE) => Error::OutOfHostMemory,
            _ => fallback,
        }
    }

    pub(crate) fn from_io(err: &io::Error, fallback: Error) -> Error {
        Error::from_errno(Errno::from_io_error(err), fallback)
    }
}
