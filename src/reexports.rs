//! Reexports of crates, that are part of the public api, for convenience

#[cfg(feature = "backend_drm")]
pub use drm;
pub use drm_fourcc;
pub use rustix;
#[cfg(feature = "backend_wayland")]
pub use wayland_client;
#[cfg(feature = "backend_wayland")]
pub use wayland_protocols;
#[cfg(windows)]
pub use windows;
#[cfg(feature = "backend_x11")]
pub use x11rb;
