//! Presentation to Win32 windows through GDI.
//!
//! Every image lives in host visible memory and has a DIB section of the same size. Presenting
//! copies the mapped pixels into the DIB section and stretches it onto the client area of the
//! window with `StretchBlt`, before the present returns. There is no thread and no event from the
//! platform: an image is reusable as soon as its present returned, so only the window contents
//! act as scan-out.
//!
//! Windows of a different size than the swapchain still get the image, scaled, but the swapchain
//! reports itself suboptimal.

mod error;
#[cfg(windows)]
mod gdi;
mod swapchain;
#[cfg(test)]
mod tests;

use std::{fmt, sync::Arc};

use tracing::debug;

pub use self::error::Win32Error;
#[cfg(windows)]
pub use self::gdi::GdiWindow;
pub use self::swapchain::Win32Swapchain;

use super::{
    allocator::{format::ColorFormat, MappedImage},
    SurfaceBackend,
};
use crate::{
    surface::{
        CompositeAlpha, PresentMode, SurfaceCapabilities, SurfaceCapabilities2, SurfaceCounters,
        SurfaceFormat2, SurfaceTransforms, Wsi, DEFAULT_USAGE,
    },
    utils::{Extent, Rect},
    Error,
};

/// Handle of a DIB section created by a [`GdiTarget`]
pub type DibId = u32;

/// A window drawn to with GDI
pub trait GdiTarget: Send + Sync + fmt::Debug {
    /// Size of the client area
    fn client_extent(&self) -> Result<Extent, Win32Error>;
    /// Creates a top-down 32 bit DIB section of `extent`
    fn create_dib(&self, extent: Extent) -> Result<DibId, Win32Error>;
    /// Copies the pixels of `image` into the DIB section
    fn upload(&self, dib: DibId, image: &MappedImage<'_>) -> Result<(), Win32Error>;
    /// Stretches the `src` sized DIB section onto `dst` of the client area
    fn stretch_blt(&self, dib: DibId, src: Extent, dst: Extent) -> Result<(), Win32Error>;
    /// Destroys the DIB section
    fn destroy_dib(&self, dib: DibId);
}

/// A window of the Win32 desktop
#[derive(Debug, Clone)]
pub struct Win32Surface {
    target: Arc<dyn GdiTarget>,
}

impl Win32Surface {
    /// Creates a surface drawing to `target`
    pub fn new(target: Arc<dyn GdiTarget>) -> Win32Surface {
        Win32Surface { target }
    }

    /// The window
    pub fn target(&self) -> &Arc<dyn GdiTarget> {
        &self.target
    }

    fn client_extent(&self) -> Option<Extent> {
        match self.target.client_extent() {
            Ok(extent) => Some(extent),
            Err(err) => {
                debug!(%err, "Failed to query the client area");
                None
            }
        }
    }
}

impl SurfaceBackend for Win32Surface {
    fn support(&self, _wsi: &Wsi, _queue_family: u32) -> Result<bool, Error> {
        Ok(self.client_extent().is_some())
    }

    fn capabilities(&self, wsi: &Wsi) -> Result<SurfaceCapabilities2, Error> {
        let max = wsi.device().info().max_image_dimension;
        Ok(SurfaceCapabilities2 {
            capabilities: SurfaceCapabilities {
                min_image_count: 1,
                max_image_count: 0,
                current_extent: self.client_extent().unwrap_or(Extent::UNDEFINED),
                min_image_extent: Extent::new(1, 1),
                max_image_extent: Extent::new(max, max),
                max_image_array_layers: 1,
                supported_transforms: SurfaceTransforms::IDENTITY,
                current_transform: SurfaceTransforms::IDENTITY,
                supported_composite_alpha: CompositeAlpha::OPAQUE | CompositeAlpha::INHERIT,
                supported_usage: DEFAULT_USAGE,
            },
            supported_counters: SurfaceCounters::empty(),
        })
    }

    fn formats(&self, _wsi: &Wsi) -> Result<Vec<SurfaceFormat2>, Error> {
        // 32 bit DIB sections are BGRX
        Ok([ColorFormat::B8g8r8a8Srgb, ColorFormat::B8g8r8a8Unorm]
            .iter()
            .map(|format| SurfaceFormat2::new(*format, format.opaque_fourcc()))
            .collect())
    }

    fn present_modes(&self, _wsi: &Wsi) -> Result<Vec<PresentMode>, Error> {
        Ok(vec![PresentMode::Fifo])
    }

    fn present_rectangles(&self, _wsi: &Wsi) -> Result<Vec<Rect>, Error> {
        let extent = self.client_extent().ok_or(Error::SurfaceLost)?;
        Ok(vec![Rect::from_extent(extent)])
    }
}
