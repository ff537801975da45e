//! Presentation to X11 windows.
//!
//! Images are imported into the X server as pixmaps and shown with the Present extension.
//! Depending on the device and the server, a swapchain uses one of three paths:
//!
//! - DRI3: images are exported as dmabufs and imported with `PixmapFromBuffers`, with explicit
//!   modifiers if both sides support them.
//! - Prime: the server renders on a different GPU. Images are copied into linear dmabufs on
//!   present, which the server imports instead.
//! - MIT-SHM: the device cannot export dmabufs, images live in shared memory.
//!
//! Every pixmap has an idle fence living in shared memory (see [`ShmFence`]), which the server
//! triggers once it stopped reading from it.
//!
//! In [`PresentMode::Fifo`] and [`PresentMode::FifoRelaxed`] a manager thread sends one image per
//! frame and waits for its completion, handing images that became idle back to
//! [`acquire`](crate::swapchain::Swapchain::acquire_next_image). The other modes present on the
//! calling thread and read the events of the server while acquiring.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use wsi::backend::x11::{X11Surface, XcbConnection};
//! # fn window() -> u32 { unimplemented!() }
//! let conn = Arc::new(XcbConnection::connect(None)?);
//! let surface = X11Surface::new(conn, window());
//! # Ok::<(), wsi::backend::x11::X11Error>(())
//! ```

/*
Useful reading for this backend:

DRI3 protocol documentation: https://gitlab.freedesktop.org/xorg/proto/xorgproto/-/blob/master/dri3proto.txt

Present protocol documentation: https://gitlab.freedesktop.org/xorg/proto/xorgproto/-/blob/master/presentproto.txt
*/

pub mod conn;
mod error;
#[cfg(feature = "backend_x11")]
#[macro_use]
mod extension;
mod fence;
mod swapchain;
#[cfg(test)]
mod tests;
#[cfg(feature = "backend_x11")]
mod xcb;

use std::sync::Arc;

use tracing::{debug, warn};

pub use self::conn::{PresentConnection, Xid};
pub use self::error::*;
pub use self::fence::ShmFence;
pub use self::swapchain::X11Swapchain;
#[cfg(feature = "backend_x11")]
pub use self::xcb::XcbConnection;

use self::conn::{VisualInfo, WindowGeometry};
use super::{allocator::format::ColorFormat, SurfaceBackend};
use crate::{
    config::WsiOptions,
    device::ExternalMemoryTypes,
    surface::{
        CompositeAlpha, PresentMode, SurfaceCapabilities, SurfaceCapabilities2, SurfaceCounters,
        SurfaceFormat2, SurfaceTransforms, Wsi, DEFAULT_USAGE,
    },
    utils::{Extent, Rect},
    Error,
};

/// Images reported as minimum unless overridden
pub const DEFAULT_MIN_IMAGE_COUNT: u32 = 3;

/// Images needed to never block in [`PresentMode::Mailbox`]
pub const MAILBOX_IMAGE_COUNT: u32 = 5;

/// A window of an X server
#[derive(Debug, Clone)]
pub struct X11Surface {
    conn: Arc<dyn PresentConnection>,
    window: Xid,
}

impl X11Surface {
    /// Creates a surface for `window`
    pub fn new(conn: Arc<dyn PresentConnection>, window: Xid) -> X11Surface {
        X11Surface { conn, window }
    }

    /// The connection to the server
    pub fn connection(&self) -> &Arc<dyn PresentConnection> {
        &self.conn
    }

    /// The window
    pub fn window(&self) -> Xid {
        self.window
    }

    fn geometry(&self) -> Option<WindowGeometry> {
        match self.conn.window_geometry(self.window) {
            Ok(geometry) => Some(geometry),
            Err(err) => {
                debug!(window = self.window, %err, "Failed to query window geometry");
                None
            }
        }
    }
}

/// Minimum image count reported for X11 surfaces
pub(crate) fn min_image_count(options: &WsiOptions) -> u32 {
    options.x11_override_min_image_count.unwrap_or(DEFAULT_MIN_IMAGE_COUNT)
}

/// Number of images created for a swapchain requesting `requested` images
pub(crate) fn image_count(options: &WsiOptions, requested: u32, mode: PresentMode, is_xwayland: bool) -> u32 {
    if options.x11_strict_image_count {
        return requested;
    }
    let mut count = requested;
    if mode == PresentMode::Mailbox || (is_xwayland && mode == PresentMode::Immediate) {
        count = count.max(MAILBOX_IMAGE_COUNT);
    }
    if options.x11_ensure_min_image_count {
        count = count.max(min_image_count(options));
    }
    count
}

/// Formats matching the channel layout of `visual`
pub(crate) fn visual_formats(depth: u8, visual: &VisualInfo) -> Vec<SurfaceFormat2> {
    let formats: &[ColorFormat] = match (visual.red_mask, visual.green_mask, visual.blue_mask) {
        (0xff0000, 0xff00, 0xff) => &[ColorFormat::B8g8r8a8Srgb, ColorFormat::B8g8r8a8Unorm],
        (0xff, 0xff00, 0xff0000) => &[ColorFormat::R8g8b8a8Srgb, ColorFormat::R8g8b8a8Unorm],
        (0x3ff00000, 0xffc00, 0x3ff) => &[ColorFormat::A2r10g10b10Unorm],
        (0x3ff, 0xffc00, 0x3ff00000) => &[ColorFormat::A2b10g10r10Unorm],
        (0xf800, 0x7e0, 0x1f) => &[ColorFormat::R5g6b5Unorm],
        _ => &[],
    };
    let alpha = visual.has_alpha(depth);
    formats
        .iter()
        .map(|format| {
            let fourcc = if alpha { format.fourcc() } else { format.opaque_fourcc() };
            SurfaceFormat2::new(*format, fourcc)
        })
        .collect()
}

impl SurfaceBackend for X11Surface {
    fn support(&self, wsi: &Wsi, _queue_family: u32) -> Result<bool, Error> {
        let caps = self.conn.caps();
        let external = wsi.device().info().external_memory;

        if caps.dri3.is_none() {
            if !caps.is_proprietary {
                warn!("The X server does not support DRI3, presentation falls back to shared memory");
            }
            if !(caps.mit_shm && external.contains(ExternalMemoryTypes::SHM)) {
                return Ok(false);
            }
        }

        Ok(self
            .geometry()
            .and_then(|geometry| geometry.visual)
            .map(|visual| visual.is_supported())
            .unwrap_or(false))
    }

    fn capabilities(&self, wsi: &Wsi) -> Result<SurfaceCapabilities2, Error> {
        let max = wsi.device().info().max_image_dimension;
        let (current_extent, min_image_extent, max_image_extent, alpha) = match self.geometry() {
            Some(geometry) => {
                let alpha = geometry
                    .visual
                    .map(|visual| visual.has_alpha(geometry.depth))
                    .unwrap_or(false);
                (geometry.extent, geometry.extent, geometry.extent, alpha)
            }
            None => (Extent::UNDEFINED, Extent::new(1, 1), Extent::new(max, max), false),
        };

        let supported_composite_alpha = if alpha {
            CompositeAlpha::INHERIT | CompositeAlpha::PRE_MULTIPLIED
        } else {
            CompositeAlpha::INHERIT | CompositeAlpha::OPAQUE
        };

        Ok(SurfaceCapabilities2 {
            capabilities: SurfaceCapabilities {
                min_image_count: min_image_count(wsi.options()),
                max_image_count: 0,
                current_extent,
                min_image_extent,
                max_image_extent,
                max_image_array_layers: 1,
                supported_transforms: SurfaceTransforms::IDENTITY,
                current_transform: SurfaceTransforms::IDENTITY,
                supported_composite_alpha,
                supported_usage: DEFAULT_USAGE,
            },
            supported_counters: SurfaceCounters::empty(),
        })
    }

    fn formats(&self, _wsi: &Wsi) -> Result<Vec<SurfaceFormat2>, Error> {
        let geometry = self.geometry().ok_or(Error::SurfaceLost)?;
        Ok(geometry
            .visual
            .map(|visual| visual_formats(geometry.depth, &visual))
            .unwrap_or_default())
    }

    fn present_modes(&self, _wsi: &Wsi) -> Result<Vec<PresentMode>, Error> {
        Ok(vec![
            PresentMode::Immediate,
            PresentMode::Mailbox,
            PresentMode::Fifo,
            PresentMode::FifoRelaxed,
        ])
    }

    fn present_rectangles(&self, _wsi: &Wsi) -> Result<Vec<Rect>, Error> {
        let geometry = self.geometry().ok_or(Error::SurfaceLost)?;
        Ok(vec![Rect::from_extent(geometry.extent)])
    }
}
