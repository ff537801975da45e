use std::sync::MutexGuard;

use rustix::io::Errno;
use tracing::{debug, debug_span, trace, warn};

use super::{
    connector::setup_connector,
    kms::{ConnectorId, CrtcId, FramebufferId, KmsDevice},
    DisplayCore, DisplaySurface, DisplayState, DisplayWsi,
};
use crate::{
    backend::{
        allocator::{create_native_image, format::ColorFormat, Fourcc, ImageParams, WsiImage},
        PresentBackend,
    },
    device::ImageUsage,
    image::{ImageState, ImageTable, Retention},
    status::StatusTracker,
    surface::{PresentMode, SwapchainCreateInfo, Wsi},
    timeout::Timeout,
    utils::Rect,
    Error,
};

/// Per-swapchain state shared with the event thread
#[derive(Debug)]
pub(crate) struct Chain {
    pub connector: ConnectorId,
    pub mode: usize,
    pub table: ImageTable,
    pub framebuffers: Vec<FramebufferId>,
    pub status: StatusTracker,
}

/// Swapchain scanning out to a display
#[derive(Debug)]
pub struct DisplaySwapchain {
    display: DisplayWsi,
    id: u64,
    status: StatusTracker,
    images: Vec<WsiImage>,
}

impl DisplaySurface {
    pub(crate) fn create_swapchain(
        &self,
        wsi: &Wsi,
        info: &SwapchainCreateInfo<'_>,
        _present_mode: PresentMode,
    ) -> Result<DisplaySwapchain, Error> {
        if !matches!(info.format, ColorFormat::B8g8r8a8Srgb | ColorFormat::B8g8r8a8Unorm) {
            warn!(format = ?info.format, "Format cannot be scanned out");
            return Err(Error::DeviceLost);
        }

        let core = self.display().core();
        let params = ImageParams::new(info.extent, info.format, info.usage | ImageUsage::COLOR_ATTACHMENT);
        let images = (0..info.min_image_count)
            .map(|_| create_native_image(wsi.device(), &params))
            .collect::<Result<Vec<_>, _>>()?;

        let mut framebuffers = scopeguard::guard(Vec::with_capacity(images.len()), |fbs| {
            for fb in fbs {
                let _ = core.kms.remove_framebuffer(fb);
            }
        });
        for image in &images {
            let dmabuf = image.dmabuf().ok_or(Error::OutOfHostMemory)?;
            let fb = core.kms.add_framebuffer(dmabuf, Fourcc::Xrgb8888).map_err(|err| {
                warn!(?err, "Failed to create framebuffer");
                Error::OutOfHostMemory
            })?;
            framebuffers.push(fb);
        }
        let framebuffers = scopeguard::ScopeGuard::into_inner(framebuffers);

        let status = StatusTracker::new();
        let id = {
            let mut state = core.state.lock().unwrap();
            if state.released {
                for fb in framebuffers {
                    let _ = core.kms.remove_framebuffer(fb);
                }
                return Err(Error::SurfaceLost);
            }
            state.next_chain += 1;
            let id = state.next_chain;
            state.chains.insert(
                id,
                Chain {
                    connector: self.mode().display().connector(),
                    mode: self.mode().index,
                    table: ImageTable::new(images.len(), Retention::Immediate),
                    framebuffers,
                    status: status.clone(),
                },
            );
            id
        };

        let chain = DisplaySwapchain {
            display: self.display().clone(),
            id,
            status,
            images,
        };
        self.display().ensure_event_thread()?;
        debug!(id, images = chain.images.len(), "Display swapchain created");
        Ok(chain)
    }
}

impl PresentBackend for DisplaySwapchain {
    fn images(&self) -> &[WsiImage] {
        &self.images
    }

    fn image_state(&self, index: u32) -> Option<ImageState> {
        let state = self.display.core().state.lock().unwrap();
        state.chains.get(&self.id).and_then(|chain| chain.table.state(index))
    }

    fn status(&self) -> &StatusTracker {
        &self.status
    }

    fn acquire(&self, timeout: &Timeout) -> Result<u32, Error> {
        let core = self.display.core();
        let mut state = core.state.lock().unwrap();
        loop {
            let chain = state.chains.get_mut(&self.id).ok_or(Error::SurfaceLost)?;
            if let Some(index) = chain.table.acquire() {
                return Ok(index);
            }
            chain.status.current()?;
            if state.event_error || state.released {
                return Err(Error::SurfaceLost);
            }
            state = timeout.wait(&core.event, state)?;
        }
    }

    fn present(&self, index: u32, _damage: &[Rect]) -> Result<(), Error> {
        let core = self.display.core();
        let mut state = core.state.lock().unwrap();
        let chain = state.chains.get_mut(&self.id).ok_or(Error::SurfaceLost)?;
        chain.table.queue(index).map_err(|err| {
            warn!(%err, "Presented an image not owned by the application");
            Error::Unknown
        })?;
        let (_state, result) = queue_next(core, state, self.id);
        result
    }

    fn counter(&self) -> Result<u64, Error> {
        let core = self.display.core();
        let state = core.state.lock().unwrap();
        if state.released {
            return Err(Error::InitializationFailed);
        }
        let connector = state
            .chains
            .get(&self.id)
            .and_then(|chain| state.registry.get(chain.connector))
            .ok_or(Error::SurfaceLost)?;
        match (connector.active, connector.crtc) {
            (true, Some(crtc)) => Ok(core.kms.crtc_sequence(crtc).unwrap_or(0)),
            _ => Ok(0),
        }
    }
}

impl Drop for DisplaySwapchain {
    fn drop(&mut self) {
        let core = self.display.core();
        let chain = core.state.lock().unwrap().chains.remove(&self.id);
        if let Some(chain) = chain {
            for fb in chain.framebuffers {
                if let Err(err) = core.kms.remove_framebuffer(fb) {
                    warn!(?fb, ?err, "Failed to destroy framebuffer");
                }
            }
        }
        core.event.notify_all();
        debug!(id = self.id, "Display swapchain destroyed");
    }
}

enum Step {
    Done(Result<(), Error>),
    /// Another session holds the device
    Busy,
}

/// One attempt at putting the oldest queued image of chain `id` on screen
fn try_queue_next(kms: &dyn KmsDevice, state: &mut DisplayState, id: u64) -> Step {
    if state.released {
        return Step::Done(Err(Error::SurfaceLost));
    }
    let DisplayState { registry, chains, .. } = state;
    let Some(chain) = chains.get_mut(&id) else {
        return Step::Done(Ok(()));
    };
    let Some(connector) = registry.get_mut(chain.connector) else {
        return Step::Done(Err(Error::SurfaceLost));
    };

    if connector.current_mode != Some(chain.mode) {
        connector.active = false;
    }
    if chain.table.any(ImageState::Flipping) {
        return Step::Done(Ok(()));
    }
    let Some(index) = chain.table.oldest_queued() else {
        return Step::Done(Ok(()));
    };
    let fb = chain.framebuffers[index as usize];

    let mut errno = Some(Errno::INVAL);
    if let (true, Some(crtc)) = (connector.active, connector.crtc) {
        match kms.page_flip(crtc, fb) {
            Ok(()) => {
                trace!(index, ?fb, "Page flip scheduled");
                if let Err(err) = chain.table.begin_flip(index) {
                    warn!(%err, "Image state out of sync");
                }
                return Step::Done(Ok(()));
            }
            Err(err) => {
                debug!(?err, "Page flip failed");
                errno = err.errno();
            }
        }
    }

    if errno == Some(Errno::INVAL) {
        if let Err(err) = setup_connector(kms, connector, chain.mode) {
            warn!(?err, "Failed to set up connector");
            chain.table.reject(index);
            return Step::Done(Err(err.into()));
        }
        let (Some(crtc), Some(mode)) = (connector.crtc, connector.current_drm_mode.as_ref()) else {
            chain.table.reject(index);
            return Step::Done(Err(Error::SurfaceLost));
        };
        match kms.set_crtc(crtc, fb, connector.id, mode) {
            Ok(()) => {
                debug!(connector = %connector.name, mode = %mode.name, "Mode set");
                if let Err(err) = kms.hide_cursor(crtc) {
                    warn!(?err, "Failed to hide the cursor");
                }
                chain.table.complete(index);
                connector.active = true;
                return Step::Done(Ok(()));
            }
            Err(err) => {
                debug!(?err, "Mode set failed");
                errno = err.errno();
            }
        }
    }

    connector.active = false;
    if errno != Some(Errno::ACCESS) {
        chain.table.reject(index);
        return Step::Done(Err(Error::SurfaceLost));
    }
    Step::Busy
}

/// Puts the next queued image of chain `id` on screen, unless a flip is still pending.
///
/// Backs off while another session holds the device, the guard is released while waiting.
pub(super) fn queue_next<'a>(
    core: &'a DisplayCore,
    mut state: MutexGuard<'a, DisplayState>,
    id: u64,
) -> (MutexGuard<'a, DisplayState>, Result<(), Error>) {
    let mut retries = 0;
    loop {
        match try_queue_next(&*core.kms, &mut state, id) {
            Step::Done(result) => return (state, result),
            Step::Busy if retries >= core.options.access_retries => {
                warn!(retries, "Display stayed inaccessible, giving up");
                if let Some(chain) = state.chains.get_mut(&id) {
                    if let Some(index) = chain.table.oldest_queued() {
                        chain.table.reject(index);
                    }
                }
                return (state, Err(Error::SurfaceLost));
            }
            Step::Busy => {
                retries += 1;
                debug!(retries, "Display is used by another session, retrying");
                let backoff = Timeout::after(core.options.access_retry_interval);
                loop {
                    match backoff.wait(&core.event, state) {
                        Ok(guard) => state = guard,
                        Err(_) => {
                            state = core.state.lock().unwrap();
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Handles a completed page-flip on `crtc`
pub(super) fn flip_completed<'a>(
    core: &'a DisplayCore,
    mut state: MutexGuard<'a, DisplayState>,
    crtc: CrtcId,
) -> MutexGuard<'a, DisplayState> {
    let DisplayState { registry, chains, .. } = &mut *state;
    let flipped = chains.iter_mut().find_map(|(id, chain)| {
        let on_crtc = registry.get(chain.connector).and_then(|c| c.crtc) == Some(crtc);
        let index = (0..chain.table.len() as u32).find(|i| chain.table.state(*i) == Some(ImageState::Flipping));
        match (on_crtc, index) {
            (true, Some(index)) => {
                chain.table.complete(index);
                Some(*id)
            }
            _ => None,
        }
    });

    let Some(id) = flipped else {
        trace!(?crtc, "Flip of an unknown swapchain");
        return state;
    };

    let _span = debug_span!("display_flip", id).entered();
    let (state, result) = queue_next(core, state, id);
    if let Err(err) = result {
        if let Some(chain) = state.chains.get(&id) {
            chain.status.fail(err);
        }
    }
    state
}
