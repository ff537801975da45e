//! Surfaces and the driver-facing query api.
//!
//! A [`Surface`] names a presentation target of one of the supported platforms. [`Wsi`] binds a
//! [`Device`] to the engine and answers every surface query, and finally creates
//! [`Swapchain`]s for a surface.
//!
//! The backend of a surface is chosen when the surface is created and never changes. Every
//! [`Swapchain`] created for it uses the same backend.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use wsi::{device::{host::HostDevice, ImageUsage}, surface::*, backend::allocator::format::ColorFormat};
//! # fn surface() -> Surface { unimplemented!() }
//! let wsi = Wsi::new(Arc::new(HostDevice::new()));
//! let surface = surface();
//! let caps = wsi.get_capabilities(&surface)?;
//! let swapchain = wsi.create_swapchain(
//!     &surface,
//!     &SwapchainCreateInfo::new(caps.min_image_count, ColorFormat::B8g8r8a8Srgb, caps.current_extent),
//! )?;
//! let image = swapchain.acquire_next_image(u64::MAX)?;
//! // render into swapchain.image(image.index)
//! swapchain.queue_present(image.index, 0, &[])?;
//! # Ok::<(), wsi::Error>(())
//! ```

use std::{fmt, sync::Arc};

use tracing::{debug, info_span, warn};

use crate::{
    backend::{
        allocator::{format::ColorFormat, Fourcc},
        display::DisplaySurface,
        software::SoftwareSurface,
        wayland::WaylandSurface,
        win32::Win32Surface,
        x11::X11Surface,
        SurfaceBackend,
    },
    config::WsiOptions,
    device::{Device, ImageUsage},
    swapchain::{Backend, Swapchain},
    utils::{Extent, Rect},
    Error,
};

/// Presentation modes of a swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    /// Images are shown right away, tearing may be visible
    Immediate,
    /// Only the most recently presented image is shown on the next vertical blank
    Mailbox,
    /// Images are shown in present order, one per vertical blank
    Fifo,
    /// Like [`PresentMode::Fifo`], but late images are shown right away
    FifoRelaxed,
}

impl PresentMode {
    /// Returns true for the modes presenting every image in order
    pub fn is_fifo(&self) -> bool {
        matches!(self, PresentMode::Fifo | PresentMode::FifoRelaxed)
    }
}

/// Color space of surface formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorSpace {
    /// sRGB primaries with the sRGB transfer function
    #[default]
    SrgbNonlinear,
}

/// Pixel format and color space combination supported by a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceFormat {
    /// Format of the swapchain images
    pub format: ColorFormat,
    /// Color space the presentation engine interprets the pixels in
    pub color_space: ColorSpace,
}

/// [`SurfaceFormat`] together with the format the platform receives the buffers in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceFormat2 {
    /// The surface format
    pub surface_format: SurfaceFormat,
    /// DRM format of the buffers handed to the platform
    pub drm_format: Fourcc,
}

impl SurfaceFormat2 {
    pub(crate) fn new(format: ColorFormat, drm_format: Fourcc) -> SurfaceFormat2 {
        SurfaceFormat2 {
            surface_format: SurfaceFormat {
                format,
                color_space: ColorSpace::SrgbNonlinear,
            },
            drm_format,
        }
    }
}

bitflags::bitflags! {
    /// How the alpha channel of presented images is treated
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CompositeAlpha: u32 {
        /// Alpha is ignored
        const OPAQUE = 1;
        /// Colors are premultiplied with alpha
        const PRE_MULTIPLIED = 2;
        /// Colors are not premultiplied
        const POST_MULTIPLIED = 4;
        /// Decided by the platform
        const INHERIT = 8;
    }
}

bitflags::bitflags! {
    /// Transformations applied on presentation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SurfaceTransforms: u32 {
        /// Presented as is
        const IDENTITY = 1;
        /// Decided by the platform
        const INHERIT = 2;
    }
}

bitflags::bitflags! {
    /// Counters a swapchain of a surface can be queried for
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SurfaceCounters: u32 {
        /// Vertical blanks of the display
        const VBLANK = 1;
    }
}

/// Limits of swapchains created for a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    /// Smallest number of images a swapchain has
    pub min_image_count: u32,
    /// Largest number of images, `0` for no limit
    pub max_image_count: u32,
    /// Current size of the surface, [`Extent::UNDEFINED`] if decided by the swapchain
    pub current_extent: Extent,
    /// Smallest supported image size
    pub min_image_extent: Extent,
    /// Largest supported image size
    pub max_image_extent: Extent,
    /// Maximum number of array layers
    pub max_image_array_layers: u32,
    /// Supported transformations
    pub supported_transforms: SurfaceTransforms,
    /// Current transformation of the surface
    pub current_transform: SurfaceTransforms,
    /// Supported alpha modes
    pub supported_composite_alpha: CompositeAlpha,
    /// Supported image usage
    pub supported_usage: ImageUsage,
}

/// [`SurfaceCapabilities`] extended by the supported counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCapabilities2 {
    /// The base capabilities
    pub capabilities: SurfaceCapabilities,
    /// Counters a swapchain of this surface provides
    pub supported_counters: SurfaceCounters,
}

/// Image usage every surface supports
pub const DEFAULT_USAGE: ImageUsage = ImageUsage::TRANSFER_SRC
    .union(ImageUsage::SAMPLED)
    .union(ImageUsage::TRANSFER_DST)
    .union(ImageUsage::STORAGE)
    .union(ImageUsage::COLOR_ATTACHMENT);

/// A presentation target
#[derive(Debug)]
pub enum Surface {
    /// A display plane driven through DRM/KMS
    Display(DisplaySurface),
    /// An X11 window presented to through DRI3 and Present, or MIT-SHM
    X11(X11Surface),
    /// A Wayland surface
    Wayland(WaylandSurface),
    /// A Win32 window
    Win32(Win32Surface),
    /// A target receiving copies of the presented pixels
    Software(SoftwareSurface),
}

impl Surface {
    fn backend(&self) -> &dyn SurfaceBackend {
        match self {
            Surface::Display(surface) => surface,
            Surface::X11(surface) => surface,
            Surface::Wayland(surface) => surface,
            Surface::Win32(surface) => surface,
            Surface::Software(surface) => surface,
        }
    }

    fn platform(&self) -> &'static str {
        match self {
            Surface::Display(_) => "display",
            Surface::X11(_) => "x11",
            Surface::Wayland(_) => "wayland",
            Surface::Win32(_) => "win32",
            Surface::Software(_) => "software",
        }
    }
}

macro_rules! surface_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for Surface {
                #[inline]
                fn from(surface: $ty) -> Surface {
                    Surface::$variant(surface)
                }
            }
        )*
    };
}

surface_from! {
    Display(DisplaySurface),
    X11(X11Surface),
    Wayland(WaylandSurface),
    Win32(Win32Surface),
    Software(SoftwareSurface),
}

/// Parameters of a new swapchain
#[derive(Debug, Clone, Copy)]
pub struct SwapchainCreateInfo<'a> {
    /// Minimum number of images, backends may create more
    pub min_image_count: u32,
    /// Format of the images
    pub format: ColorFormat,
    /// Color space of the images
    pub color_space: ColorSpace,
    /// Size of the images
    pub extent: Extent,
    /// Usage of the images
    pub usage: ImageUsage,
    /// Requested presentation mode
    pub present_mode: PresentMode,
    /// Alpha mode
    pub composite_alpha: CompositeAlpha,
    /// Swapchain being replaced by the new one
    pub old_swapchain: Option<&'a Swapchain>,
}

impl<'a> SwapchainCreateInfo<'a> {
    /// Parameters of an opaque [`PresentMode::Fifo`] swapchain used as color attachment
    pub fn new(min_image_count: u32, format: ColorFormat, extent: Extent) -> SwapchainCreateInfo<'a> {
        SwapchainCreateInfo {
            min_image_count,
            format,
            color_space: ColorSpace::SrgbNonlinear,
            extent,
            usage: ImageUsage::COLOR_ATTACHMENT,
            present_mode: PresentMode::Fifo,
            composite_alpha: CompositeAlpha::OPAQUE,
            old_swapchain: None,
        }
    }

    /// Sets the present mode
    pub fn with_present_mode(mut self, present_mode: PresentMode) -> Self {
        self.present_mode = present_mode;
        self
    }

    /// Sets the swapchain to replace
    pub fn with_old_swapchain(mut self, old_swapchain: &'a Swapchain) -> Self {
        self.old_swapchain = Some(old_swapchain);
        self
    }

    /// Returns true if the platform should take the alpha channel into account
    pub fn uses_alpha(&self) -> bool {
        !self.composite_alpha.contains(CompositeAlpha::OPAQUE)
    }
}

/// Entry point of the presentation engine for one device
pub struct Wsi {
    device: Arc<dyn Device>,
    options: WsiOptions,
}

impl fmt::Debug for Wsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wsi")
            .field("device", &self.device)
            .field("options", &self.options)
            .finish()
    }
}

impl Wsi {
    /// Creates the engine for `device`, with options read from the environment
    pub fn new(device: Arc<dyn Device>) -> Wsi {
        Wsi::with_options(device, WsiOptions::from_env())
    }

    /// Creates the engine for `device` with explicit options
    pub fn with_options(device: Arc<dyn Device>, options: WsiOptions) -> Wsi {
        Wsi { device, options }
    }

    /// The device images are allocated on
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// The options in use
    pub fn options(&self) -> &WsiOptions {
        &self.options
    }

    /// Returns true if `queue_family` of the device can present to `surface`
    pub fn get_support(&self, surface: &Surface, queue_family: u32) -> Result<bool, Error> {
        if queue_family >= self.device.info().queue_family_count {
            return Ok(false);
        }
        surface.backend().support(self, queue_family)
    }

    /// Returns the limits of swapchains for `surface`
    pub fn get_capabilities(&self, surface: &Surface) -> Result<SurfaceCapabilities, Error> {
        self.get_capabilities2(surface).map(|caps| caps.capabilities)
    }

    /// Returns the limits of swapchains for `surface` including supported counters
    pub fn get_capabilities2(&self, surface: &Surface) -> Result<SurfaceCapabilities2, Error> {
        surface.backend().capabilities(self)
    }

    /// Returns the formats swapchains for `surface` can be created with, in order of preference
    pub fn get_formats(&self, surface: &Surface) -> Result<Vec<SurfaceFormat>, Error> {
        Ok(self
            .get_formats2(surface)?
            .into_iter()
            .map(|format| format.surface_format)
            .collect())
    }

    /// Like [`Wsi::get_formats`], with the format the platform receives the buffers in
    pub fn get_formats2(&self, surface: &Surface) -> Result<Vec<SurfaceFormat2>, Error> {
        let mut formats = surface.backend().formats(self)?;
        sort_formats(&mut formats, &self.options);
        Ok(formats)
    }

    /// Returns the present modes supported by `surface`
    pub fn get_present_modes(&self, surface: &Surface) -> Result<Vec<PresentMode>, Error> {
        surface.backend().present_modes(self)
    }

    /// Returns the areas of the platform output a swapchain of `surface` may update
    pub fn get_present_rectangles(&self, surface: &Surface) -> Result<Vec<Rect>, Error> {
        surface.backend().present_rectangles(self)
    }

    /// Creates a swapchain presenting to `surface`.
    ///
    /// A present mode forced through the environment replaces the requested one if the surface
    /// supports it. If `info` names an old swapchain, its platform connection is reused where the
    /// backend supports this, and the old swapchain may become out of date.
    #[profiling::function]
    pub fn create_swapchain(&self, surface: &Surface, info: &SwapchainCreateInfo<'_>) -> Result<Swapchain, Error> {
        let span = info_span!("wsi_create_swapchain", platform = surface.platform());
        let _guard = span.enter();

        if info.extent.is_empty() || info.extent.is_undefined() || info.min_image_count == 0 {
            warn!(extent = %info.extent, count = info.min_image_count, "Invalid swapchain parameters");
            return Err(Error::InitializationFailed);
        }

        let modes = self.get_present_modes(surface)?;
        let present_mode = self.options.select_present_mode(info.present_mode, &modes);
        if !modes.contains(&present_mode) {
            warn!(?present_mode, ?modes, "Present mode not supported by the surface");
            return Err(Error::FeatureNotPresent);
        }

        let backend = match surface {
            Surface::Display(surface) => Backend::Display(surface.create_swapchain(self, info, present_mode)?),
            Surface::X11(surface) => {
                let chain = surface.create_swapchain(self, info, present_mode)?;
                if let Some(old) = info.old_swapchain {
                    old.retire();
                }
                Backend::X11(chain)
            }
            Surface::Wayland(surface) => {
                let old_display = info.old_swapchain.and_then(Swapchain::wayland_display);
                Backend::Wayland(surface.create_swapchain(self, info, present_mode, old_display)?)
            }
            Surface::Win32(surface) => Backend::Win32(surface.create_swapchain(self, info, present_mode)?),
            Surface::Software(surface) => Backend::Software(surface.create_swapchain(self, info, present_mode)?),
        };

        debug!(
            ?present_mode,
            extent = %info.extent,
            format = ?info.format,
            "Swapchain created"
        );
        Ok(Swapchain::new(backend, present_mode, info.extent, info.format))
    }
}

/// Moves `B8G8R8A8_UNORM` to the front if configured
fn sort_formats(formats: &mut [SurfaceFormat2], options: &WsiOptions) {
    if !options.force_bgra8_unorm_first {
        return;
    }
    if let Some(pos) = formats
        .iter()
        .position(|format| format.surface_format.format == ColorFormat::B8g8r8a8Unorm)
    {
        formats[..=pos].rotate_right(1);
    }
}
