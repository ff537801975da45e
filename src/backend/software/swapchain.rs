use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info_span, instrument, trace, warn, Span};

use super::{ImageSink, SoftwareSurface};
use crate::{
    backend::{
        allocator::{create_host_image, ImageParams, WsiImage},
        PresentBackend,
    },
    image::{ImageState, ImageTable, Retention},
    status::StatusTracker,
    surface::{PresentMode, SwapchainCreateInfo, Wsi},
    timeout::Timeout,
    utils::{Extent, Rect},
    Error,
};

/// Swapchain copying every presented image into an [`ImageSink`]
#[derive(Debug)]
pub struct SoftwareSwapchain {
    sink: Arc<dyn ImageSink>,
    images: Vec<WsiImage>,
    extent: Extent,
    table: Mutex<ImageTable>,
    status: StatusTracker,
    span: Span,
}

impl SoftwareSurface {
    pub(crate) fn create_swapchain(
        &self,
        wsi: &Wsi,
        info: &SwapchainCreateInfo<'_>,
        present_mode: PresentMode,
    ) -> Result<SoftwareSwapchain, Error> {
        let span = info_span!("wsi_software");
        let _guard = span.enter();

        let target = self.sink.extent()?;
        debug!(count = info.min_image_count, ?present_mode, extent = %info.extent, "Creating software swapchain");

        let params = ImageParams::new(info.extent, info.format, info.usage);
        let images = (0..info.min_image_count)
            .map(|_| create_host_image(wsi.device(), &params))
            .collect::<Result<Vec<_>, _>>()?;

        let status = StatusTracker::new();
        if target != info.extent {
            debug!(sink = %target, swapchain = %info.extent, "Swapchain does not match the target size");
            status.mark_suboptimal();
        }

        drop(_guard);
        Ok(SoftwareSwapchain {
            sink: self.sink.clone(),
            table: Mutex::new(ImageTable::new(images.len(), Retention::Immediate)),
            images,
            extent: info.extent,
            status,
            span,
        })
    }
}

impl SoftwareSwapchain {
    fn lock(&self) -> MutexGuard<'_, ImageTable> {
        self.table.lock().unwrap()
    }

    fn put(&self, index: u32, damage: &[Rect]) -> Result<(), Error> {
        let target = self.sink.extent()?;
        if target != self.extent {
            trace!(sink = %target, "Copying to a resized target");
            self.status.mark_suboptimal();
        }
        let image = self.images[index as usize].map()?;
        self.sink.put_image(&image, damage)?;
        Ok(())
    }
}

impl PresentBackend for SoftwareSwapchain {
    fn images(&self) -> &[WsiImage] {
        &self.images
    }

    fn image_state(&self, index: u32) -> Option<ImageState> {
        self.lock().state(index)
    }

    fn status(&self) -> &StatusTracker {
        &self.status
    }

    #[instrument(level = "trace", parent = &self.span, skip(self))]
    fn acquire(&self, timeout: &Timeout) -> Result<u32, Error> {
        let mut table = self.lock();
        table
            .acquire()
            .or_else(|| table.reclaim_displaying())
            .ok_or_else(|| timeout.expired_error())
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, damage))]
    #[profiling::function]
    fn present(&self, index: u32, damage: &[Rect]) -> Result<(), Error> {
        let mut table = self.lock();
        table.queue(index).map_err(|err| {
            warn!(%err, "Presented an image not owned by the application");
            Error::Unknown
        })?;
        if let Err(err) = table.begin_flip(index) {
            warn!(%err, "Image state out of sync");
        }

        match self.put(index, damage) {
            Ok(()) => {
                table.complete(index);
                Ok(())
            }
            Err(err) => {
                table.reject(index);
                Err(err)
            }
        }
    }
}

impl Drop for SoftwareSwapchain {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        debug!("Software swapchain destroyed");
    }
}
