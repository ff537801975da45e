use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tracing::{debug, info_span, instrument, trace, warn, Span};

use super::{
    conn::{BufferId, Commit, SurfaceId, WaylandConnection, WaylandEvent},
    WaylandDisplay, WaylandError, WaylandSurface,
};
use crate::{
    backend::{
        allocator::{create_native_image, create_shm_image, Fourcc, ImageParams, WsiImage},
        PresentBackend,
    },
    device::ExternalMemoryTypes,
    image::{ImageState, ImageTable, Retention},
    status::StatusTracker,
    surface::{PresentMode, SwapchainCreateInfo, Wsi},
    timeout::Timeout,
    utils::Rect,
    Error,
};

/// Longest time a wait blocks on the socket before checking its timeout again
const EVENT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferKind {
    Dmabuf,
    Shm,
}

#[derive(Debug)]
struct State {
    table: ImageTable,
    /// A frame callback was requested and did not fire yet
    frame_pending: bool,
}

/// Swapchain presenting to a Wayland surface
#[derive(Debug)]
pub struct WaylandSwapchain {
    display: Arc<WaylandDisplay>,
    surface: SurfaceId,
    images: Vec<WsiImage>,
    buffers: Vec<BufferId>,
    state: Mutex<State>,
    status: StatusTracker,
    fifo: bool,
    span: Span,
}

/// Picks the format and buffer kind for `candidates`, in order of preference
fn select_buffer(
    display: &WaylandDisplay,
    external: ExternalMemoryTypes,
    candidates: &[Fourcc],
) -> Option<(Fourcc, BufferKind)> {
    let globals = display.globals();
    candidates.iter().find_map(|format| {
        if external.contains(ExternalMemoryTypes::DMA_BUF) && globals.supports_dmabuf(*format) {
            Some((*format, BufferKind::Dmabuf))
        } else if external.contains(ExternalMemoryTypes::SHM) && globals.supports_shm(*format) {
            Some((*format, BufferKind::Shm))
        } else {
            None
        }
    })
}

/// Failures of reading events leave the surface in an unknown state
fn dispatch_error(err: WaylandError) -> Error {
    warn!(%err, "Failed to dispatch wayland events");
    Error::OutOfDate
}

impl WaylandSurface {
    pub(crate) fn create_swapchain(
        &self,
        wsi: &Wsi,
        info: &SwapchainCreateInfo<'_>,
        present_mode: PresentMode,
        old_display: Option<Arc<WaylandDisplay>>,
    ) -> Result<WaylandSwapchain, Error> {
        let span = info_span!("wsi_wayland", surface = self.surface);
        let _guard = span.enter();

        let display = self.display_for(old_display)?;
        let device_info = wsi.device().info();

        let candidates = if info.uses_alpha() {
            [info.format.fourcc(), info.format.opaque_fourcc()]
        } else {
            [info.format.opaque_fourcc(), info.format.fourcc()]
        };
        let Some((format, kind)) = select_buffer(&display, device_info.external_memory, &candidates) else {
            warn!(format = ?info.format, "The compositor cannot import this format from the device");
            return Err(Error::InitializationFailed);
        };

        let modifiers = display.globals().modifiers(format);
        let params = ImageParams::new(info.extent, info.format, info.usage);
        let params = match kind {
            BufferKind::Dmabuf if device_info.supports_modifiers && !modifiers.is_empty() => {
                params.with_modifiers(vec![modifiers.to_vec()])
            }
            BufferKind::Dmabuf => params,
            BufferKind::Shm => params.with_handle_types(ExternalMemoryTypes::SHM),
        };
        debug!(?format, ?kind, count = info.min_image_count, ?present_mode, "Creating wayland swapchain");

        let conn = display.connection();
        let mut buffers = scopeguard::guard(Vec::<BufferId>::new(), |buffers| {
            for buffer in buffers {
                conn.destroy_buffer(buffer);
            }
        });
        let mut images = Vec::with_capacity(info.min_image_count as usize);
        for _ in 0..info.min_image_count {
            let image = match kind {
                BufferKind::Dmabuf => create_native_image(wsi.device(), &params)?,
                BufferKind::Shm => create_shm_image(wsi.device(), &params)?,
            };
            let buffer = match (image.dmabuf(), image.shm()) {
                (Some(dmabuf), _) => conn.create_dmabuf_buffer(self.surface, dmabuf, format)?,
                (None, Some(shm)) => conn.create_shm_buffer(self.surface, shm, image.extent(), format)?,
                (None, None) => return Err(Error::InitializationFailed),
            };
            buffers.push(buffer);
            images.push(image);
        }
        conn.flush()?;
        let buffers = scopeguard::ScopeGuard::into_inner(buffers);

        drop(_guard);
        Ok(WaylandSwapchain {
            surface: self.surface,
            state: Mutex::new(State {
                table: ImageTable::new(images.len(), Retention::UntilReleased),
                frame_pending: false,
            }),
            display,
            images,
            buffers,
            status: StatusTracker::new(),
            fifo: present_mode.is_fifo(),
            span,
        })
    }
}

impl WaylandSwapchain {
    /// The display shared with swapchains created from this one
    pub fn display(&self) -> &Arc<WaylandDisplay> {
        &self.display
    }

    fn conn(&self) -> &dyn WaylandConnection {
        &**self.display.connection()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn handle_event(&self, state: &mut State, event: WaylandEvent) {
        trace!(?event, "Wayland event");
        match event {
            WaylandEvent::Release(buffer) => {
                if let Some(index) = self.buffers.iter().position(|b| *b == buffer) {
                    state.table.release(index as u32);
                }
            }
            WaylandEvent::FrameDone => state.frame_pending = false,
        }
    }

    fn dispatch_pending(&self, state: &mut State) -> Result<(), Error> {
        while let Some(event) = self.conn().poll_event(self.surface).map_err(dispatch_error)? {
            self.handle_event(state, event);
        }
        Ok(())
    }

    /// Waits for events until `done` holds, dropping the lock while blocked
    fn wait_until<'a>(
        &'a self,
        mut state: MutexGuard<'a, State>,
        timeout: &Timeout,
        mut done: impl FnMut(&mut State) -> bool,
    ) -> Result<MutexGuard<'a, State>, Error> {
        loop {
            self.dispatch_pending(&mut state)?;
            if done(&mut state) {
                return Ok(state);
            }
            if timeout.is_poll() || timeout.expired() {
                return Err(timeout.expired_error());
            }
            drop(state);
            let event = self
                .conn()
                .wait_event(self.surface, timeout.slice(EVENT_SLICE))
                .map_err(dispatch_error)?;
            state = self.lock();
            if let Some(event) = event {
                self.handle_event(&mut state, event);
            }
        }
    }
}

impl PresentBackend for WaylandSwapchain {
    fn images(&self) -> &[WsiImage] {
        &self.images
    }

    fn image_state(&self, index: u32) -> Option<ImageState> {
        self.lock().table.state(index)
    }

    fn status(&self) -> &StatusTracker {
        &self.status
    }

    #[instrument(level = "trace", parent = &self.span, skip(self))]
    fn acquire(&self, timeout: &Timeout) -> Result<u32, Error> {
        let mut state = self.wait_until(self.lock(), timeout, |state| state.table.any(ImageState::Idle))?;
        state.table.acquire().ok_or(Error::Unknown)
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, damage))]
    fn present(&self, index: u32, damage: &[Rect]) -> Result<(), Error> {
        let mut state = self.lock();
        state.table.queue(index).map_err(|err| {
            warn!(%err, "Presented an image not owned by the application");
            Error::Unknown
        })?;

        if self.fifo {
            state = self.wait_until(state, &Timeout::Infinite, |state| !state.frame_pending)?;
        }

        if let Err(err) = state.table.begin_flip(index) {
            warn!(%err, "Image state out of sync");
        }
        let commit = Commit {
            buffer: self.buffers[index as usize],
            damage: damage.to_vec(),
            frame: self.fifo,
        };
        let committed = self
            .conn()
            .commit(self.surface, &commit)
            .and_then(|()| self.conn().flush());
        if let Err(err) = committed {
            state.table.reject(index);
            return Err(err.into());
        }
        state.table.complete(index);
        state.frame_pending = self.fifo;
        trace!(index, buffer = commit.buffer, "Buffer committed");
        Ok(())
    }
}

impl Drop for WaylandSwapchain {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        for buffer in &self.buffers {
            self.conn().destroy_buffer(*buffer);
        }
        if let Err(err) = self.conn().flush() {
            debug!(%err, "Failed to flush the wayland connection");
        }
        debug!("Wayland swapchain destroyed");
    }
}
