//! Presentation by copying pixels.
//!
//! The fallback for targets that cannot import device memory, for example an X server without
//! DRI3 and MIT-SHM. Images live in host memory and are copied to an [`ImageSink`] during the
//! present call. The target keeps its own copy, so no image stays in flight after a present
//! returned and acquiring never waits.

mod swapchain;
#[cfg(feature = "backend_x11")]
mod x11;

use std::{fmt, sync::Arc};

use tracing::debug;

pub use self::swapchain::SoftwareSwapchain;
#[cfg(feature = "backend_x11")]
pub use self::x11::X11ImageSink;

use super::{
    allocator::{format::ColorFormat, Fourcc, MappedImage},
    x11::X11Error,
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

/// Errors of an [`ImageSink`]
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    /// The target does not exist anymore
    #[error("The target of the image sink is gone")]
    TargetLost,
    /// Sending to an X server failed
    #[error(transparent)]
    X11(#[from] X11Error),
}

impl From<SinkError> for Error {
    fn from(err: SinkError) -> Error {
        match err {
            SinkError::TargetLost => Error::SurfaceLost,
            SinkError::X11(err) => err.into(),
        }
    }
}

/// A target receiving copies of presented images
pub trait ImageSink: Send + Sync + fmt::Debug {
    /// Current size of the target
    fn extent(&self) -> Result<Extent, SinkError>;
    /// Pixel layouts the target displays, as DRM formats
    fn formats(&self) -> Result<Vec<Fourcc>, SinkError>;
    /// Copies the `damage` regions of `image` to the same position of the target, all of it if
    /// `damage` is empty
    fn put_image(&self, image: &MappedImage<'_>, damage: &[Rect]) -> Result<(), SinkError>;
}

/// Splits `region` into runs of whole rows with at most `max_bytes` of pixel data each.
///
/// A single row is never split, even if it exceeds `max_bytes`.
#[cfg_attr(not(feature = "backend_x11"), allow(dead_code))]
pub(crate) fn split_rows(region: Rect, bytes_per_pixel: u32, max_bytes: usize) -> impl Iterator<Item = Rect> {
    let row_bytes = (region.extent.width as usize * bytes_per_pixel as usize).max(1);
    let rows_per_chunk = (max_bytes / row_bytes).max(1) as u32;
    let height = region.extent.height;
    (0..height).step_by(rows_per_chunk as usize).map(move |start| {
        Rect::new(
            region.offset.x,
            region.offset.y + start as i32,
            region.extent.width,
            rows_per_chunk.min(height - start),
        )
    })
}

/// Any target an [`ImageSink`] draws to
#[derive(Debug, Clone)]
pub struct SoftwareSurface {
    sink: Arc<dyn ImageSink>,
}

impl SoftwareSurface {
    /// Creates a surface copying to `sink`
    pub fn new(sink: Arc<dyn ImageSink>) -> SoftwareSurface {
        SoftwareSurface { sink }
    }

    /// The sink
    pub fn sink(&self) -> &Arc<dyn ImageSink> {
        &self.sink
    }

    fn extent(&self) -> Option<Extent> {
        match self.sink.extent() {
            Ok(extent) => Some(extent),
            Err(err) => {
                debug!(%err, "Failed to query the size of the image sink");
                None
            }
        }
    }
}

impl SurfaceBackend for SoftwareSurface {
    fn support(&self, _wsi: &Wsi, _queue_family: u32) -> Result<bool, Error> {
        Ok(self.extent().is_some())
    }

    fn capabilities(&self, wsi: &Wsi) -> Result<SurfaceCapabilities2, Error> {
        let max = wsi.device().info().max_image_dimension;
        let (current_extent, min_image_extent, max_image_extent) = match self.extent() {
            Some(extent) => (extent, extent, extent),
            None => (Extent::UNDEFINED, Extent::new(1, 1), Extent::new(max, max)),
        };
        Ok(SurfaceCapabilities2 {
            capabilities: SurfaceCapabilities {
                min_image_count: 1,
                max_image_count: 0,
                current_extent,
                min_image_extent,
                max_image_extent,
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
        let accepted = self.sink.formats()?;
        Ok(ColorFormat::ALL
            .iter()
            .filter_map(|format| {
                [format.opaque_fourcc(), format.fourcc()]
                    .into_iter()
                    .find(|fourcc| accepted.contains(fourcc))
                    .map(|fourcc| SurfaceFormat2::new(*format, fourcc))
            })
            .collect())
    }

    fn present_modes(&self, _wsi: &Wsi) -> Result<Vec<PresentMode>, Error> {
        Ok(vec![PresentMode::Immediate, PresentMode::Fifo])
    }

    fn present_rectangles(&self, _wsi: &Wsi) -> Result<Vec<Rect>, Error> {
        let extent = self.extent().ok_or(Error::SurfaceLost)?;
        Ok(vec![Rect::from_extent(extent)])
    }
}
