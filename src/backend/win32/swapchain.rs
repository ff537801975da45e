use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info_span, instrument, trace, warn, Span};

use super::{DibId, GdiTarget, Win32Surface};
use crate::{
    backend::{
        allocator::{create_host_image, ImageParams, WsiImage},
        PresentBackend,
    },
    image::{ImageState, ImageTable, Retention},
    status::StatusTracker,
    surface::{PresentMode, SwapchainCreateInfo, Wsi},
    timeout::Timeout,
    utils::Rect,
    Error,
};

/// Swapchain drawing to a Win32 window
#[derive(Debug)]
pub struct Win32Swapchain {
    target: Arc<dyn GdiTarget>,
    images: Vec<WsiImage>,
    dibs: Vec<DibId>,
    table: Mutex<ImageTable>,
    status: StatusTracker,
    span: Span,
}

impl Win32Surface {
    pub(crate) fn create_swapchain(
        &self,
        wsi: &Wsi,
        info: &SwapchainCreateInfo<'_>,
        present_mode: PresentMode,
    ) -> Result<Win32Swapchain, Error> {
        let span = info_span!("wsi_win32");
        let _guard = span.enter();

        let target = self.target.clone();
        let client = target.client_extent()?;
        debug!(count = info.min_image_count, ?present_mode, extent = %info.extent, "Creating win32 swapchain");

        let params = ImageParams::new(info.extent, info.format, info.usage);
        let mut dibs = scopeguard::guard(Vec::<DibId>::new(), |dibs| {
            for dib in dibs {
                target.destroy_dib(dib);
            }
        });
        let mut images = Vec::with_capacity(info.min_image_count as usize);
        for _ in 0..info.min_image_count {
            images.push(create_host_image(wsi.device(), &params)?);
            dibs.push(target.create_dib(info.extent)?);
        }
        let dibs = scopeguard::ScopeGuard::into_inner(dibs);

        let status = StatusTracker::new();
        if client != info.extent {
            debug!(window = %client, swapchain = %info.extent, "Swapchain does not match the client area");
            status.mark_suboptimal();
        }

        drop(_guard);
        Ok(Win32Swapchain {
            table: Mutex::new(ImageTable::new(images.len(), Retention::Immediate)),
            target: self.target.clone(),
            images,
            dibs,
            status,
            span,
        })
    }
}

impl Win32Swapchain {
    fn lock(&self) -> MutexGuard<'_, ImageTable> {
        self.table.lock().unwrap()
    }
}

impl PresentBackend for Win32Swapchain {
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
        // the window keeps its own copy, so the front buffer can be drawn to again
        table
            .acquire()
            .or_else(|| table.reclaim_displaying())
            .ok_or_else(|| timeout.expired_error())
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, _damage))]
    #[profiling::function]
    fn present(&self, index: u32, _damage: &[Rect]) -> Result<(), Error> {
        let mut table = self.lock();
        table.queue(index).map_err(|err| {
            warn!(%err, "Presented an image not owned by the application");
            Error::Unknown
        })?;
        if let Err(err) = table.begin_flip(index) {
            warn!(%err, "Image state out of sync");
        }

        let image = &self.images[index as usize];
        let dib = self.dibs[index as usize];
        let blitted = (|| {
            let client = self.target.client_extent()?;
            if client != image.extent() {
                trace!(window = %client, "Stretching to a resized window");
                self.status.mark_suboptimal();
            }
            let mapped = image.map()?;
            self.target.upload(dib, &mapped)?;
            self.target.stretch_blt(dib, image.extent(), client)?;
            Ok::<_, Error>(())
        })();

        match blitted {
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

impl Drop for Win32Swapchain {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        for dib in &self.dibs {
            self.target.destroy_dib(*dib);
        }
        debug!("Win32 swapchain destroyed");
    }
}
