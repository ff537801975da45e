use crate::Error;

/// Errors of a [`GdiTarget`](super::GdiTarget)
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Win32Error {
    /// The window handle does not name a window anymore
    #[error("The window was destroyed")]
    WindowDestroyed,
    /// GDI ran out of objects or memory
    #[error("Out of GDI resources in {0}")]
    OutOfResources(&'static str),
    /// A GDI call failed
    #[error("GDI call {call} failed: {message}")]
    Gdi {
        /// Name of the failed function
        call: &'static str,
        /// System message of the failure
        message: String,
    },
}

impl From<Win32Error> for Error {
    fn from(err: Win32Error) -> Error {
        match err {
            Win32Error::WindowDestroyed => Error::SurfaceLost,
            Win32Error::OutOfResources(_) => Error::OutOfHostMemory,
            Win32Error::Gdi { .. } => Error::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Win32Error;
    use crate::Error;

    #[test]
    fn classification() {
        assert_eq!(Error::from(Win32Error::WindowDestroyed), Error::SurfaceLost);
        assert_eq!(
            Error::from(Win32Error::OutOfResources("CreateDIBSection")),
            Error::OutOfHostMemory
        );
        let err = Win32Error::Gdi {
            call: "StretchBlt",
            message: "The parameter is incorrect.".into(),
        };
        assert_eq!(err.to_string(), "GDI call StretchBlt failed: The parameter is incorrect.");
        assert_eq!(Error::from(err), Error::Unknown);
    }
}
