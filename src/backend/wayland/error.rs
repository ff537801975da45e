use std::io;

use crate::{backend::allocator::Fourcc, Error};

/// Errors of the wayland backend
#[derive(Debug, thiserror::Error)]
pub enum WaylandError {
    /// Failed to connect to a Wayland compositor.
    #[error("Failed to connect to the compositor: {0}")]
    Connect(String),

    /// A global required for presentation is missing.
    #[error("The compositor does not provide {0}")]
    MissingGlobal(&'static str),

    /// The surface is not known to the connection.
    #[error("Unknown surface {0}")]
    UnknownSurface(u32),

    /// The compositor cannot import buffers of this format.
    #[error("The compositor does not support format {0:?}")]
    UnsupportedFormat(Fourcc),

    /// An invalid object was operated on.
    #[error("Invalid object: {0}")]
    InvalidId(String),

    /// Error while dispatching events.
    #[error("Dispatching events failed: {0}")]
    Dispatch(String),

    /// The connection to the compositor broke.
    #[error("Connection to the compositor lost")]
    ConnectionLost(#[source] io::Error),
}

#[cfg(feature = "backend_wayland")]
mod conversions {
    use super::WaylandError;
    use wayland_client::{backend, backend::InvalidId, globals::GlobalError, ConnectError, DispatchError};

    impl From<ConnectError> for WaylandError {
        fn from(err: ConnectError) -> Self {
            WaylandError::Connect(err.to_string())
        }
    }

    impl From<InvalidId> for WaylandError {
        fn from(err: InvalidId) -> Self {
            WaylandError::InvalidId(err.to_string())
        }
    }

    impl From<DispatchError> for WaylandError {
        fn from(err: DispatchError) -> Self {
            match err {
                DispatchError::Backend(err) => err.into(),
                err => WaylandError::Dispatch(err.to_string()),
            }
        }
    }

    impl From<GlobalError> for WaylandError {
        fn from(err: GlobalError) -> Self {
            match err {
                GlobalError::Backend(err) => err.into(),
                GlobalError::InvalidId(err) => err.into(),
            }
        }
    }

    impl From<backend::WaylandError> for WaylandError {
        fn from(err: backend::WaylandError) -> Self {
            match err {
                backend::WaylandError::Io(err) => WaylandError::ConnectionLost(err),
                backend::WaylandError::Protocol(err) => WaylandError::Dispatch(err.to_string()),
            }
        }
    }
}

impl From<WaylandError> for Error {
    fn from(err: WaylandError) -> Self {
        match err {
            WaylandError::Connect(_) | WaylandError::MissingGlobal(_) | WaylandError::UnsupportedFormat(_) => {
                Error::InitializationFailed
            }
            WaylandError::ConnectionLost(err) => Error::from_io(&err, Error::SurfaceLost),
            WaylandError::UnknownSurface(_) | WaylandError::InvalidId(_) | WaylandError::Dispatch(_) => {
                Error::SurfaceLost
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WaylandError;
    use crate::Error;
    use std::io;

    #[test]
    fn classification() {
        assert_eq!(
            Error::from(WaylandError::MissingGlobal("wl_shm")),
            Error::InitializationFailed
        );
        assert_eq!(
            Error::from(WaylandError::ConnectionLost(io::Error::from_raw_os_error(libc::EPIPE))),
            Error::SurfaceLost
        );
        assert_eq!(
            Error::from(WaylandError::ConnectionLost(io::Error::from_raw_os_error(libc::ENOMEM))),
            Error::OutOfHostMemory
        );
    }
}
