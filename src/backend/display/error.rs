use std::{io, path::PathBuf};

use rustix::io::Errno;

use super::kms::ConnectorId;
use crate::{backend::allocator::format::ColorFormat, Error};

/// A failed ioctl on a DRM device
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

impl AccessError {
    /// The os error of the failed call
    pub fn errno(&self) -> Option<Errno> {
        Errno::from_io_error(&self.source)
    }
}

/// Errors of the display backend
#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    /// The device returned an error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The device was released, no display operations are possible anymore
    #[error("The display device was released")]
    Released,
    /// The connector is not known
    #[error("Unknown connector {0:?}")]
    UnknownConnector(ConnectorId),
    /// No crtc can drive the connector
    #[error("No crtc is available for connector {0:?}")]
    NoCrtc(ConnectorId),
    /// The monitor does not support the requested mode anymore
    #[error("The requested mode is not supported by connector {0:?}")]
    ModeNotFound(ConnectorId),
    /// The format cannot be scanned out
    #[error("Format {0:?} cannot be scanned out")]
    UnsupportedFormat(ColorFormat),
}

impl DisplayError {
    /// The os error behind this error, if any
    pub fn errno(&self) -> Option<Errno> {
        match self {
            DisplayError::Access(err) => err.errno(),
            _ => None,
        }
    }
}

impl From<DisplayError> for Error {
    fn from(err: DisplayError) -> Self {
        match err {
            DisplayError::Access(err) => Error::from_io(&err.source, Error::SurfaceLost),
            DisplayError::UnsupportedFormat(_) => Error::DeviceLost,
            DisplayError::Released
            | DisplayError::UnknownConnector(_)
            | DisplayError::NoCrtc(_)
            | DisplayError::ModeNotFound(_) => Error::SurfaceLost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessError, DisplayError};
    use crate::Error;
    use rustix::io::Errno;
    use std::io;

    fn access(errno: i32) -> DisplayError {
        DisplayError::Access(AccessError {
            errmsg: "test",
            dev: None,
            source: io::Error::from_raw_os_error(errno),
        })
    }

    #[test]
    fn errno_is_preserved() {
        assert_eq!(access(libc::EACCES).errno(), Some(Errno::ACCESS));
        assert_eq!(DisplayError::Released.errno(), None);
    }

    #[test]
    fn classification() {
        assert_eq!(Error::from(access(libc::ENOMEM)), Error::OutOfHostMemory);
        assert_eq!(Error::from(access(libc::ENODEV)), Error::SurfaceLost);
        assert_eq!(Error::from(DisplayError::Released), Error::SurfaceLost);
    }
}
