//! Platform adapters.
//!
//! Each submodule implements presentation for one platform:
//!
//! - [`display`]: direct scan-out through DRM/KMS page-flips
//! - [`x11`]: X11 windows through DRI3 and the Present extension, or MIT-SHM pixmaps
//! - [`wayland`]: Wayland surfaces through `zwp_linux_dmabuf_v1` or `wl_shm` buffers
//! - [`win32`]: Win32 windows through GDI
//! - [`software`]: any target accepting a copy of the pixels
//!
//! The protocol logic of every backend is written against a small trait describing the platform
//! ([`display::KmsDevice`], [`x11::PresentConnection`], [`wayland::WaylandConnection`],
//! [`win32::GdiTarget`], [`software::ImageSink`]). The implementations talking to the real platform
//! are enabled by cargo features:
//!
//! | Feature | Implementation |
//! |---|---|
//! | `backend_drm` | [`display::DrmCard`] using the `drm` crate |
//! | `backend_x11` | [`x11::XcbConnection`] and [`software::X11ImageSink`] using `x11rb` |
//! | `backend_wayland` | [`wayland::ClientDisplay`] using `wayland-client` |
//! | windows targets | `win32::GdiWindow` using the `windows` crate |
//!
//! [`allocator`] contains the image allocation shared by all backends.

use std::fmt;

use crate::{
    image::ImageState,
    status::StatusTracker,
    surface::{PresentMode, SurfaceCapabilities2, SurfaceFormat2, Wsi},
    timeout::Timeout,
    utils::Rect,
    Error,
};

pub mod allocator;
pub mod display;
pub mod software;
pub mod wayland;
pub mod win32;
pub mod x11;

use self::allocator::WsiImage;

/// Surface queries every backend answers
pub(crate) trait SurfaceBackend {
    fn support(&self, wsi: &Wsi, queue_family: u32) -> Result<bool, Error>;
    fn capabilities(&self, wsi: &Wsi) -> Result<SurfaceCapabilities2, Error>;
    fn formats(&self, wsi: &Wsi) -> Result<Vec<SurfaceFormat2>, Error>;
    fn present_modes(&self, wsi: &Wsi) -> Result<Vec<PresentMode>, Error>;
    fn present_rectangles(&self, wsi: &Wsi) -> Result<Vec<Rect>, Error>;
}

/// Operations of a created swapchain
///
/// Implementations report terminal errors of background work into their [`StatusTracker`], the
/// errors returned from `acquire` and `present` are folded into it by the caller.
pub(crate) trait PresentBackend: fmt::Debug + Send {
    fn images(&self) -> &[WsiImage];
    fn image_state(&self, index: u32) -> Option<ImageState>;
    fn status(&self) -> &StatusTracker;
    fn acquire(&self, timeout: &Timeout) -> Result<u32, Error>;
    fn present(&self, index: u32, damage: &[Rect]) -> Result<(), Error>;
    fn counter(&self) -> Result<u64, Error> {
        Err(Error::FeatureNotPresent)
    }
}
