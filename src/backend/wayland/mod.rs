//! Presentation to Wayland surfaces.
//!
//! Images are attached to the surface as `wl_buffer`s. Depending on the compositor and the device,
//! buffers are imported as dmabufs through `zwp_linux_dmabuf_v1`, with an explicit modifier if the
//! compositor announced some, or shared through `wl_shm`.
//!
//! There are no fences: an image can be reused once the compositor sent `wl_buffer.release` for
//! it. In [`PresentMode::Fifo`] every commit requests a frame callback and the next present waits
//! for it, so the compositor paces the application. Everything happens on the calling thread.
//!
//! The buffer globals are bound once per [`WaylandDisplay`]. A swapchain created with an old
//! swapchain of the same connection shares its display.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use wsi::backend::wayland::{ClientDisplay, WaylandSurface};
//! # fn wl_surface() -> wayland_client::protocol::wl_surface::WlSurface { unimplemented!() }
//! let conn = Arc::new(ClientDisplay::connect_to_env()?);
//! let id = conn.register_surface(wl_surface());
//! let surface = WaylandSurface::new(conn, id);
//! # Ok::<(), wsi::backend::wayland::WaylandError>(())
//! ```

#[cfg(feature = "backend_wayland")]
mod client;
pub mod conn;
mod error;
mod swapchain;

use std::sync::Arc;

use tracing::{debug, info};

#[cfg(feature = "backend_wayland")]
pub use self::client::ClientDisplay;
pub use self::conn::{SurfaceId, WaylandConnection, WaylandGlobals};
pub use self::error::WaylandError;
pub use self::swapchain::WaylandSwapchain;

use super::{
    allocator::{format::ColorFormat, Fourcc},
    SurfaceBackend,
};
use crate::{
    device::ExternalMemoryTypes,
    surface::{
        CompositeAlpha, PresentMode, SurfaceCapabilities, SurfaceCapabilities2, SurfaceCounters,
        SurfaceFormat2, SurfaceTransforms, Wsi, DEFAULT_USAGE,
    },
    utils::{Extent, Rect},
    Error,
};

/// Images reported as minimum, enough for [`PresentMode::Mailbox`] to never block
pub const MIN_IMAGE_COUNT: u32 = 4;

/// A connection with its buffer globals bound.
///
/// Shared between the swapchains of a surface chain, and dropped with the last of them.
#[derive(Debug)]
pub struct WaylandDisplay {
    conn: Arc<dyn WaylandConnection>,
    globals: WaylandGlobals,
}

impl WaylandDisplay {
    /// Binds the globals of `conn`
    pub fn new(conn: Arc<dyn WaylandConnection>) -> Result<Arc<WaylandDisplay>, WaylandError> {
        let globals = conn.query_globals()?;
        if globals.shm_formats.is_empty() && globals.dmabuf_formats.is_none() {
            return Err(WaylandError::MissingGlobal("wl_shm"));
        }
        info!(
            shm_formats = globals.shm_formats.len(),
            dmabuf = globals.dmabuf_formats.is_some(),
            "Bound wayland buffer globals"
        );
        Ok(Arc::new(WaylandDisplay { conn, globals }))
    }

    /// The connection
    pub fn connection(&self) -> &Arc<dyn WaylandConnection> {
        &self.conn
    }

    /// Globals announced by the compositor
    pub fn globals(&self) -> &WaylandGlobals {
        &self.globals
    }

    fn is_connection(&self, conn: &Arc<dyn WaylandConnection>) -> bool {
        Arc::as_ptr(&self.conn) as *const () == Arc::as_ptr(conn) as *const ()
    }

    /// Returns true if the device can share images with the compositor in `format`
    fn supports(&self, external: ExternalMemoryTypes, format: Fourcc) -> bool {
        (external.contains(ExternalMemoryTypes::DMA_BUF) && self.globals.supports_dmabuf(format))
            || (external.contains(ExternalMemoryTypes::SHM) && self.globals.supports_shm(format))
    }

    /// Surface formats both the device and the compositor support
    fn formats(&self, external: ExternalMemoryTypes) -> Vec<SurfaceFormat2> {
        ColorFormat::ALL
            .iter()
            .filter_map(|format| {
                if self.supports(external, format.fourcc()) {
                    Some(SurfaceFormat2::new(*format, format.fourcc()))
                } else if self.supports(external, format.opaque_fourcc()) {
                    Some(SurfaceFormat2::new(*format, format.opaque_fourcc()))
                } else {
                    None
                }
            })
            .collect()
    }
}

/// A `wl_surface` of a compositor
#[derive(Debug, Clone)]
pub struct WaylandSurface {
    conn: Arc<dyn WaylandConnection>,
    surface: SurfaceId,
}

impl WaylandSurface {
    /// Creates a surface for the `wl_surface` known to `conn` as `surface`
    pub fn new(conn: Arc<dyn WaylandConnection>, surface: SurfaceId) -> WaylandSurface {
        WaylandSurface { conn, surface }
    }

    /// The connection to the compositor
    pub fn connection(&self) -> &Arc<dyn WaylandConnection> {
        &self.conn
    }

    /// The surface id
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    fn display(&self) -> Result<Arc<WaylandDisplay>, Error> {
        WaylandDisplay::new(self.conn.clone()).map_err(|err| {
            debug!(%err, "Failed to bind wayland globals");
            Error::from(err)
        })
    }

    /// Reuses `old` if it belongs to the same connection
    pub(crate) fn display_for(&self, old: Option<Arc<WaylandDisplay>>) -> Result<Arc<WaylandDisplay>, Error> {
        match old {
            Some(display) if display.is_connection(&self.conn) => Ok(display),
            _ => self.display(),
        }
    }
}

impl SurfaceBackend for WaylandSurface {
    fn support(&self, wsi: &Wsi, _queue_family: u32) -> Result<bool, Error> {
        let external = wsi.device().info().external_memory;
        if !external.intersects(ExternalMemoryTypes::DMA_BUF | ExternalMemoryTypes::SHM) {
            return Ok(false);
        }
        Ok(self.display().is_ok())
    }

    fn capabilities(&self, wsi: &Wsi) -> Result<SurfaceCapabilities2, Error> {
        let max = wsi.device().info().max_image_dimension;
        Ok(SurfaceCapabilities2 {
            capabilities: SurfaceCapabilities {
                min_image_count: MIN_IMAGE_COUNT,
                max_image_count: 0,
                current_extent: Extent::UNDEFINED,
                min_image_extent: Extent::new(1, 1),
                max_image_extent: Extent::new(max, max),
                max_image_array_layers: 1,
                supported_transforms: SurfaceTransforms::IDENTITY,
                current_transform: SurfaceTransforms::IDENTITY,
                supported_composite_alpha: CompositeAlpha::OPAQUE | CompositeAlpha::PRE_MULTIPLIED,
                supported_usage: DEFAULT_USAGE,
            },
            supported_counters: SurfaceCounters::empty(),
        })
    }

    fn formats(&self, wsi: &Wsi) -> Result<Vec<SurfaceFormat2>, Error> {
        Ok(self.display()?.formats(wsi.device().info().external_memory))
    }

    fn present_modes(&self, _wsi: &Wsi) -> Result<Vec<PresentMode>, Error> {
        Ok(vec![PresentMode::Mailbox, PresentMode::Fifo])
    }

    fn present_rectangles(&self, _wsi: &Wsi) -> Result<Vec<Rect>, Error> {
        Ok(vec![Rect::from_extent(Extent::UNDEFINED)])
    }
}
