//! Swapchains: acquiring and presenting images.
//!
//! A [`Swapchain`] owns the images of one presentation target and the backend state driving them.
//! The calling pattern is always the same:
//!
//! 1. [`Swapchain::acquire_next_image`] hands out an idle image. It blocks according to its timeout
//!    if every image is still used by the platform.
//! 2. The application renders into [`Swapchain::image`].
//! 3. [`Swapchain::queue_present`] gives the image back. The application must not touch it anymore.
//!
//! Every result passes through the [`StatusTracker`] of the swapchain. Once a terminal error was
//! reported, every later call returns it again, see [`crate::status`].

use std::sync::Arc;

use tracing::{trace, warn};

use crate::{
    backend::{
        allocator::{format::ColorFormat, WsiImage},
        display::DisplaySwapchain,
        software::SoftwareSwapchain,
        wayland::{WaylandDisplay, WaylandSwapchain},
        win32::Win32Swapchain,
        x11::X11Swapchain,
        PresentBackend,
    },
    image::ImageState,
    status::{Outcome, StatusTracker},
    surface::{PresentMode, SurfaceCounters},
    timeout::Timeout,
    utils::{Extent, Rect},
    Error,
};

/// An image handed to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    /// Index of the image, see [`Swapchain::image`]
    pub index: u32,
    /// The swapchain still works, but should be recreated
    pub suboptimal: bool,
}

/// Extended acquire parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireNextImageInfo {
    /// Timeout in nanoseconds, `0` polls and `u64::MAX` waits forever
    pub timeout: u64,
    /// Devices of a device group the image is acquired for
    pub device_mask: u32,
}

impl Default for AcquireNextImageInfo {
    fn default() -> Self {
        AcquireNextImageInfo {
            timeout: u64::MAX,
            device_mask: 1,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Backend {
    Display(DisplaySwapchain),
    X11(X11Swapchain),
    Wayland(WaylandSwapchain),
    Win32(Win32Swapchain),
    Software(SoftwareSwapchain),
}

/// A set of presentable images bound to one surface
#[derive(Debug)]
pub struct Swapchain {
    backend: Backend,
    present_mode: PresentMode,
    extent: Extent,
    format: ColorFormat,
}

impl Swapchain {
    pub(crate) fn new(backend: Backend, present_mode: PresentMode, extent: Extent, format: ColorFormat) -> Swapchain {
        Swapchain {
            backend,
            present_mode,
            extent,
            format,
        }
    }

    fn backend(&self) -> &dyn PresentBackend {
        match &self.backend {
            Backend::Display(chain) => chain,
            Backend::X11(chain) => chain,
            Backend::Wayland(chain) => chain,
            Backend::Win32(chain) => chain,
            Backend::Software(chain) => chain,
        }
    }

    fn status(&self) -> &StatusTracker {
        self.backend().status()
    }

    /// Present mode in use, after environment overrides were applied
    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    /// Size of the images
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Format of the images
    pub fn format(&self) -> ColorFormat {
        self.format
    }

    /// All images of the swapchain
    pub fn images(&self) -> &[WsiImage] {
        self.backend().images()
    }

    /// The image at `index`
    pub fn image(&self, index: u32) -> Option<&WsiImage> {
        self.images().get(index as usize)
    }

    /// Current ownership state of the image at `index`
    pub fn image_state(&self, index: u32) -> Option<ImageState> {
        self.backend().image_state(index)
    }

    /// Current status of the swapchain
    pub fn current_status(&self) -> Result<Outcome, Error> {
        self.status().current()
    }

    /// Acquires an idle image, waiting at most `timeout` nanoseconds.
    ///
    /// A timeout of `0` never blocks and returns [`Error::NotReady`] if no image is idle, an expired
    /// finite timeout returns [`Error::Timeout`].
    #[profiling::function]
    pub fn acquire_next_image(&self, timeout: u64) -> Result<AcquiredImage, Error> {
        let status = self.status();
        status.current()?;

        let timeout = Timeout::from_nanos(timeout);
        let index = self.backend().acquire(&timeout).map_err(|err| status.fail(err))?;
        let outcome = status.current()?;
        trace!(index, ?outcome, "Acquired image");
        Ok(AcquiredImage {
            index,
            suboptimal: outcome.is_suboptimal(),
        })
    }

    /// Acquires an image using extended parameters.
    pub fn acquire_next_image2(&self, info: &AcquireNextImageInfo) -> Result<AcquiredImage, Error> {
        if info.device_mask & 1 == 0 {
            return Err(Error::FeatureNotPresent);
        }
        self.acquire_next_image(info.timeout)
    }

    /// Presents the image at `index`, which must have been acquired before.
    ///
    /// `queue_family` names the queue the rendering was submitted on, it selects the pre-recorded
    /// copy of images that are blitted into a linear buffer for the platform. `damage` lists the
    /// changed areas of the image, an empty list means the whole image changed.
    ///
    /// An index out of range or an image the application does not own fails with
    /// [`Error::Unknown`] and leaves the status of the swapchain untouched.
    #[profiling::function]
    pub fn queue_present(&self, index: u32, queue_family: u32, damage: &[Rect]) -> Result<Outcome, Error> {
        let status = self.status();
        status.current()?;

        // misuse by the application is reported without poisoning the swapchain
        let image = self.image(index).ok_or_else(|| {
            warn!(index, "Presented an image index out of range");
            Error::Unknown
        })?;
        if self.backend().image_state(index) != Some(ImageState::Drawing) {
            warn!(index, "Presented an image not owned by the application");
            return Err(Error::Unknown);
        }
        if image.is_prime() {
            image.blit(queue_family).map_err(|err| status.fail(err))?;
        }

        let damage = damage
            .iter()
            .filter_map(|rect| rect.clamp_to(self.extent))
            .collect::<Vec<_>>();
        self.backend()
            .present(index, &damage)
            .map_err(|err| status.fail(err))?;
        status.current()
    }

    /// Reads a counter of the swapchain.
    ///
    /// Only swapchains of display surfaces support [`SurfaceCounters::VBLANK`].
    pub fn counter(&self, counter: SurfaceCounters) -> Result<u64, Error> {
        if counter != SurfaceCounters::VBLANK {
            return Err(Error::FeatureNotPresent);
        }
        self.backend().counter()
    }

    /// Destroys the swapchain.
    ///
    /// Background threads are stopped before the images are released. Dropping the swapchain has
    /// the same effect.
    pub fn destroy(self) {}

    /// The old swapchain of a recreation stops working
    pub(crate) fn retire(&self) {
        self.status().fail(Error::OutOfDate);
    }

    pub(crate) fn wayland_display(&self) -> Option<Arc<WaylandDisplay>> {
        match &self.backend {
            Backend::Wayland(chain) => Some(chain.display().clone()),
            _ => None,
        }
    }
}
