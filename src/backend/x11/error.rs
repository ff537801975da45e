use std::io;

#[cfg(feature = "backend_x11")]
use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};

use crate::Error;

/// An error emitted by the X11 backend
#[derive(Debug, thiserror::Error)]
pub enum X11Error {
    /// Connecting to the X server failed.
    #[error("Connecting to the X server failed: {0}")]
    ConnectionFailed(String),

    /// Connection to X server was lost.
    #[error("Connection to the X server was lost")]
    ConnectionLost,

    /// A required X11 extension was not present or has the right version.
    #[error("{0}")]
    MissingExtension(#[from] MissingExtensionError),

    /// The X server answered a request with an error.
    #[error("The X server returned an error: {0}")]
    Protocol(String),

    /// The window presented to was destroyed.
    #[error("The window was destroyed")]
    WindowDestroyed,

    /// The X server ran out of ids or memory.
    #[error("The X server is out of resources")]
    OutOfResources,

    /// The buffer cannot be imported by the X server.
    #[error("The buffer cannot be imported by the X server")]
    UnsupportedBuffer,

    /// Creating or mapping a fence failed.
    #[error("Failed to set up a fence")]
    Fence(#[source] io::Error),
}

/// An error that occurs when a required X11 extension is not present.
#[derive(Debug, thiserror::Error)]
pub enum MissingExtensionError {
    /// An extension was not found.
    #[error("Extension \"{name}\" version {major}.{minor} was not found.")]
    NotFound {
        /// The name of the required extension.
        name: &'static str,
        /// The minimum required major version of extension.
        major: u32,
        /// The minimum required minor version of extension.
        minor: u32,
    },

    /// An extension was present, but the version is too low.
    #[error("Extension \"{name}\" version {required_major}.{required_minor} is required but only version {available_major}.{available_minor} is available.")]
    WrongVersion {
        /// The name of the extension.
        name: &'static str,
        /// The minimum required major version of extension.
        required_major: u32,
        /// The minimum required minor version of extension.
        required_minor: u32,
        /// The major version of the extension available on the X server.
        available_major: u32,
        /// The minor version of the extension available on the X server.
        available_minor: u32,
    },
}

#[cfg(feature = "backend_x11")]
impl From<ConnectError> for X11Error {
    fn from(err: ConnectError) -> Self {
        X11Error::ConnectionFailed(err.to_string())
    }
}

#[cfg(feature = "backend_x11")]
impl From<ConnectionError> for X11Error {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::InsufficientMemory => X11Error::OutOfResources,
            ConnectionError::UnknownError | ConnectionError::IoError(_) => X11Error::ConnectionLost,
            err => X11Error::Protocol(err.to_string()),
        }
    }
}

#[cfg(feature = "backend_x11")]
impl From<ReplyError> for X11Error {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::ConnectionError(err) => err.into(),
            ReplyError::X11Error(err) => X11Error::Protocol(format!("{:?}", err.error_kind)),
        }
    }
}

#[cfg(feature = "backend_x11")]
impl From<ReplyOrIdError> for X11Error {
    fn from(err: ReplyOrIdError) -> Self {
        match err {
            ReplyOrIdError::IdsExhausted => X11Error::OutOfResources,
            ReplyOrIdError::ConnectionError(err) => err.into(),
            ReplyOrIdError::X11Error(err) => X11Error::Protocol(format!("{:?}", err.error_kind)),
        }
    }
}

impl From<X11Error> for Error {
    fn from(err: X11Error) -> Self {
        match err {
            X11Error::ConnectionFailed(_) | X11Error::MissingExtension(_) => Error::InitializationFailed,
            X11Error::ConnectionLost | X11Error::WindowDestroyed | X11Error::Protocol(_) => Error::SurfaceLost,
            X11Error::OutOfResources | X11Error::UnsupportedBuffer => Error::OutOfHostMemory,
            X11Error::Fence(err) => Error::from_io(&err, Error::OutOfHostMemory),
        }
    }
}
