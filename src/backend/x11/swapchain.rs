use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, info_span, trace, warn, Span};

use super::{
    conn::{
        CompleteKind, CompleteMode, PresentConnection, PresentEvent, PresentRequest, XResource, Xid,
        PRESENT_OPTION_ASYNC, PRESENT_OPTION_SUBOPTIMAL,
    },
    fence::ShmFence,
    image_count, min_image_count, X11Error, X11Surface,
};
use crate::{
    backend::{
        allocator::{create_native_image, create_prime_image, create_shm_image, ImageParams, WsiImage},
        PresentBackend,
    },
    device::ExternalMemoryTypes,
    image::{ImageState, ImageTable, Retention},
    queue::{PacingQueue, PopError},
    status::StatusTracker,
    surface::{PresentMode, SwapchainCreateInfo, Wsi},
    timeout::Timeout,
    utils::{same_gpu, Extent, Rect},
    Error,
};

/// Longest time the manager thread blocks without checking for shutdown
const EVENT_SLICE: Duration = Duration::from_millis(100);

/// Damage with more rectangles updates the whole window
const MAX_DAMAGE_RECTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Native,
    Prime,
    Shm,
}

#[derive(Debug)]
struct X11Image {
    pixmap: Xid,
    segment: Option<Xid>,
    sync_fence: Xid,
    fence: ShmFence,
    region: Option<Xid>,
}

#[derive(Debug)]
struct PresentState {
    table: ImageTable,
    serials: Vec<u32>,
    damaged: Vec<bool>,
    send_sbc: u64,
    last_msc: u64,
    /// Pixmaps sent to the server and not idle yet
    sent: u32,
    copy_is_suboptimal: bool,
}

#[derive(Debug)]
struct Shared {
    conn: Arc<dyn PresentConnection>,
    window: Xid,
    eid: Xid,
    extent: Extent,
    options: u32,
    min_image_count: u32,
    images: Vec<X11Image>,
    state: Mutex<PresentState>,
    status: StatusTracker,
    /// Images handed to the manager thread, FIFO modes only
    present_queue: Option<PacingQueue<u32>>,
    /// Idle images handed back by the manager thread, FIFO modes only
    acquire_queue: Option<PacingQueue<u32>>,
    span: Span,
}

/// Swapchain presenting to an X11 window
#[derive(Debug)]
pub struct X11Swapchain {
    shared: Arc<Shared>,
    manager: Option<JoinHandle<()>>,
    images: Vec<WsiImage>,
}

impl X11Surface {
    pub(crate) fn create_swapchain(
        &self,
        wsi: &Wsi,
        info: &SwapchainCreateInfo<'_>,
        present_mode: PresentMode,
    ) -> Result<X11Swapchain, Error> {
        let span = info_span!("wsi_x11", window = self.window);
        let _guard = span.enter();

        let conn = &self.conn;
        let caps = conn.caps();
        let device_info = wsi.device().info();

        let geometry = conn.window_geometry(self.window).map_err(|err| {
            warn!(%err, "Failed to query the window");
            Error::SurfaceLost
        })?;

        let path = if caps.dri3.is_some() && device_info.external_memory.contains(ExternalMemoryTypes::DMA_BUF) {
            let server = conn.dri3_device(self.window)?;
            match (server, device_info.render_node) {
                (Some(server), Some(render)) if same_gpu(server, render) => Path::Native,
                _ => Path::Prime,
            }
        } else if caps.mit_shm && device_info.external_memory.contains(ExternalMemoryTypes::SHM) {
            Path::Shm
        } else {
            warn!(?caps, "Neither DRI3 nor MIT-SHM can be used");
            return Err(Error::InitializationFailed);
        };

        let depth = geometry.depth;
        let bpp = info.format.bpp() as u8;
        let modifiers = if path == Path::Native && caps.has_modifiers() && device_info.supports_modifiers {
            conn.dri3_modifiers(self.window, depth, bpp)?
        } else {
            Vec::new()
        };
        let use_modifiers = !modifiers.is_empty();

        let count = image_count(wsi.options(), info.min_image_count, present_mode, caps.is_xwayland);
        let params = ImageParams::new(info.extent, info.format, info.usage).with_modifiers(modifiers);
        let params = match path {
            Path::Shm => params.with_handle_types(ExternalMemoryTypes::SHM),
            _ => params,
        };
        debug!(?path, count, ?present_mode, "Creating X11 swapchain");

        let eid = conn.select_present_events(self.window)?;
        let mut x11_images = scopeguard::guard(Vec::<X11Image>::new(), |images| {
            free_images(&**conn, &images);
            conn.unselect_present_events(self.window, eid);
        });
        let mut images = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let image = match path {
                Path::Native => create_native_image(wsi.device(), &params)?,
                Path::Prime => create_prime_image(wsi.device(), &params)?,
                Path::Shm => create_shm_image(wsi.device(), &params)?,
            };
            x11_images.push(self.import_image(&image, depth, bpp, caps.xfixes)?);
            images.push(image);
        }
        conn.flush()?;
        let x11_images = scopeguard::ScopeGuard::into_inner(x11_images);

        let status = StatusTracker::new();
        if geometry.extent != info.extent {
            debug!(window = %geometry.extent, swapchain = %info.extent, "Swapchain does not match the window size");
            status.mark_suboptimal();
        }

        let mut options = 0;
        if matches!(present_mode, PresentMode::Immediate | PresentMode::FifoRelaxed)
            || (present_mode == PresentMode::Mailbox && caps.is_xwayland)
        {
            options |= PRESENT_OPTION_ASYNC;
        }
        if use_modifiers {
            options |= PRESENT_OPTION_SUBOPTIMAL;
        }

        let (present_queue, acquire_queue) = if present_mode.is_fifo() {
            let acquire_queue = PacingQueue::new(count as usize);
            for index in 0..count {
                let _ = acquire_queue.push(index);
            }
            (Some(PacingQueue::new(count as usize)), Some(acquire_queue))
        } else {
            (None, None)
        };

        let shared = Arc::new(Shared {
            conn: conn.clone(),
            window: self.window,
            eid,
            extent: info.extent,
            options,
            min_image_count: min_image_count(wsi.options()),
            state: Mutex::new(PresentState {
                table: ImageTable::new(count as usize, Retention::UntilReleased),
                serials: vec![0; count as usize],
                damaged: vec![false; count as usize],
                send_sbc: 0,
                last_msc: 0,
                sent: 0,
                copy_is_suboptimal: false,
            }),
            images: x11_images,
            status,
            present_queue,
            acquire_queue,
            span: span.clone(),
        });

        let mut chain = X11Swapchain {
            shared,
            manager: None,
            images,
        };
        if present_mode.is_fifo() {
            let shared = chain.shared.clone();
            let handle = thread::Builder::new()
                .name("wsi-x11-present".into())
                .spawn(move || manage_fifo(shared))
                .map_err(|err| {
                    warn!(?err, "Failed to spawn the present thread");
                    Error::OutOfHostMemory
                })?;
            chain.manager = Some(handle);
        }
        Ok(chain)
    }

    fn import_image(&self, image: &WsiImage, depth: u8, bpp: u8, xfixes: bool) -> Result<X11Image, X11Error> {
        let conn = &*self.conn;
        let (pixmap, segment) = match (image.dmabuf(), image.shm()) {
            (Some(dmabuf), _) => (conn.pixmap_from_dmabuf(self.window, dmabuf, depth, bpp)?, None),
            (None, Some(shm)) => {
                let pixmap = conn.pixmap_from_shm(self.window, shm, image.extent(), depth)?;
                (pixmap.pixmap, Some(pixmap.segment))
            }
            (None, None) => return Err(X11Error::UnsupportedBuffer),
        };
        let mut resources = scopeguard::guard(vec![XResource::Pixmap(pixmap)], |resources| {
            for resource in resources {
                conn.free(resource);
            }
        });
        if let Some(segment) = segment {
            resources.push(XResource::ShmSegment(segment));
        }

        let fence = ShmFence::new().map_err(X11Error::Fence)?;
        let sync_fence = conn.fence_from_fd(pixmap, fence.duplicate_fd().map_err(X11Error::Fence)?)?;
        resources.push(XResource::Fence(sync_fence));
        fence.trigger();

        let region = if xfixes { Some(conn.create_region()?) } else { None };
        scopeguard::ScopeGuard::into_inner(resources);
        Ok(X11Image {
            pixmap,
            segment,
            sync_fence,
            fence,
            region,
        })
    }
}

fn free_images(conn: &dyn PresentConnection, images: &[X11Image]) {
    for image in images {
        conn.free(XResource::Fence(image.sync_fence));
        conn.free(XResource::Pixmap(image.pixmap));
        if let Some(segment) = image.segment {
            conn.free(XResource::ShmSegment(segment));
        }
        if let Some(region) = image.region {
            conn.free(XResource::Region(region));
        }
    }
}

impl Shared {
    /// Applies a present event to the swapchain
    fn handle_event(&self, state: &mut PresentState, event: PresentEvent) -> Result<(), Error> {
        trace!(?event, "Present event");
        match event {
            PresentEvent::Configure {
                window_destroyed: true, ..
            } => Err(Error::SurfaceLost),
            PresentEvent::Configure { extent, .. } if extent != self.extent => {
                debug!(window = %extent, swapchain = %self.extent, "Window was resized");
                Err(Error::OutOfDate)
            }
            PresentEvent::Configure { .. } => Ok(()),
            PresentEvent::Complete { serial, msc, kind, mode } => {
                if kind == CompleteKind::Pixmap {
                    if let Some(index) = state.serials.iter().position(|s| *s == serial && serial != 0) {
                        state.table.complete(index as u32);
                    }
                    state.last_msc = msc;
                }
                match mode {
                    CompleteMode::Copy if state.copy_is_suboptimal => self.status.mark_suboptimal(),
                    CompleteMode::Flip => state.copy_is_suboptimal = true,
                    CompleteMode::SuboptimalCopy => self.status.mark_suboptimal(),
                    _ => {}
                }
                Ok(())
            }
            PresentEvent::Idle { pixmap, .. } => {
                if let Some(index) = self.images.iter().position(|image| image.pixmap == pixmap) {
                    state.table.release(index as u32);
                    state.sent = state.sent.saturating_sub(1);
                    if let Some(queue) = &self.acquire_queue {
                        let _ = queue.push(index as u32);
                    }
                }
                Ok(())
            }
        }
    }

    /// Sends the image at `index` to the server
    fn present_to_x11(&self, state: &mut PresentState, index: u32, target_msc: u64) -> Result<(), Error> {
        while let Some(event) = self.conn.poll_present_event(self.eid)? {
            self.handle_event(state, event)?;
        }

        let image = &self.images[index as usize];
        image.fence.reset();
        state.send_sbc += 1;
        let serial = state.send_sbc as u32;
        state.serials[index as usize] = serial;
        if let Err(err) = state.table.begin_flip(index) {
            warn!(%err, "Image state out of sync");
        }

        let request = PresentRequest {
            window: self.window,
            pixmap: image.pixmap,
            serial,
            update: image.region.filter(|_| state.damaged[index as usize]),
            idle_fence: image.sync_fence,
            options: self.options,
            target_msc,
        };
        let sent = self
            .conn
            .present_pixmap(&request)
            .and_then(|()| self.conn.flush());
        if let Err(err) = sent {
            state.table.reject(index);
            image.fence.trigger();
            return Err(err.into());
        }
        state.sent += 1;
        trace!(index, serial, target_msc, "Pixmap presented");
        Ok(())
    }

    /// Acquires an idle image, reading present events while none is available
    fn acquire_polling(&self, timeout: &Timeout) -> Result<u32, Error> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(index) = state.table.acquire() {
                    drop(state);
                    self.wait_idle(index)?;
                    return Ok(index);
                }
            }

            self.conn.flush()?;
            let event = if timeout.is_poll() {
                self.conn.poll_present_event(self.eid)?
            } else {
                self.conn.wait_present_event(self.eid, timeout.slice(EVENT_SLICE))?
            };
            match event {
                Some(event) => {
                    let mut state = self.state.lock().unwrap();
                    self.handle_event(&mut state, event)?;
                }
                None if timeout.is_poll() || timeout.expired() => return Err(timeout.expired_error()),
                None => {}
            }
        }
    }

    fn acquire_queued(&self, queue: &PacingQueue<u32>, timeout: &Timeout) -> Result<u32, Error> {
        let index = match queue.pop(timeout) {
            Ok(index) => index,
            Err(PopError::Timeout(err)) => return Err(err),
            Err(PopError::Closed) => return Err(self.status.current().err().unwrap_or(Error::SurfaceLost)),
        };
        self.state.lock().unwrap().table.acquire_index(index).map_err(|err| {
            warn!(%err, "Image state out of sync");
            Error::Unknown
        })?;
        self.wait_idle(index)?;
        Ok(index)
    }

    fn wait_idle(&self, index: u32) -> Result<(), Error> {
        self.images[index as usize]
            .fence
            .wait()
            .map_err(|err| Error::from_io(&err, Error::SurfaceLost))
    }
}

/// Body of the manager thread of FIFO swapchains
fn manage_fifo(shared: Arc<Shared>) {
    let span = shared.span.clone();
    let _guard = span.enter();
    let (Some(present_queue), Some(acquire_queue)) = (&shared.present_queue, &shared.acquire_queue) else {
        return;
    };

    if let Err(err) = run_fifo(&shared, present_queue) {
        warn!(?err, "Presentation failed");
        shared.status.fail(err);
    }
    acquire_queue.close();
    debug!("Present thread stopped");
}

fn run_fifo(shared: &Shared, present_queue: &PacingQueue<u32>) -> Result<(), Error> {
    let image_count = shared.images.len() as u32;
    // the application must always be able to acquire the images it may hold at once
    let forward_progress = image_count - shared.min_image_count.min(image_count) + 1;

    loop {
        let index = match present_queue.pop(&Timeout::Infinite) {
            Ok(index) => index,
            Err(PopError::Closed) => return Ok(()),
            Err(PopError::Timeout(err)) => return Err(err),
        };
        if shared.status.is_failed() {
            return Ok(());
        }

        let mut state = shared.state.lock().unwrap();
        let target_msc = state.last_msc + 1;
        shared.present_to_x11(&mut state, index, target_msc)?;

        while state.last_msc < target_msc || state.sent > forward_progress {
            drop(state);
            if present_queue.is_closed() {
                return Ok(());
            }
            let event = shared.conn.wait_present_event(shared.eid, EVENT_SLICE)?;
            state = shared.state.lock().unwrap();
            if let Some(event) = event {
                shared.handle_event(&mut state, event)?;
            }
        }
    }
}

impl PresentBackend for X11Swapchain {
    fn images(&self) -> &[WsiImage] {
        &self.images
    }

    fn image_state(&self, index: u32) -> Option<ImageState> {
        self.shared.state.lock().unwrap().table.state(index)
    }

    fn status(&self) -> &StatusTracker {
        &self.shared.status
    }

    fn acquire(&self, timeout: &Timeout) -> Result<u32, Error> {
        match &self.shared.acquire_queue {
            Some(queue) => self.shared.acquire_queued(queue, timeout),
            None => self.shared.acquire_polling(timeout),
        }
    }

    fn present(&self, index: u32, damage: &[Rect]) -> Result<(), Error> {
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();
        state.table.queue(index).map_err(|err| {
            warn!(%err, "Presented an image not owned by the application");
            Error::Unknown
        })?;

        let image = &shared.images[index as usize];
        let damaged = match image.region {
            Some(region) if !damage.is_empty() && damage.len() <= MAX_DAMAGE_RECTS => {
                shared.conn.set_region(region, damage)?;
                true
            }
            _ => false,
        };
        state.damaged[index as usize] = damaged;

        match &shared.present_queue {
            Some(queue) => {
                drop(state);
                queue
                    .push(index)
                    .map_err(|_| shared.status.current().err().unwrap_or(Error::OutOfDate))
            }
            None => shared.present_to_x11(&mut state, index, 0),
        }
    }
}

impl Drop for X11Swapchain {
    fn drop(&mut self) {
        let shared = &self.shared;
        if let Some(queue) = &shared.present_queue {
            queue.close();
        }
        if let Some(queue) = &shared.acquire_queue {
            queue.close();
        }
        if let Some(manager) = self.manager.take() {
            if manager.join().is_err() {
                warn!("Present thread panicked");
            }
        }
        free_images(&*shared.conn, &shared.images);
        shared.conn.unselect_present_events(shared.window, shared.eid);
        if let Err(err) = shared.conn.flush() {
            debug!(%err, "Failed to flush the X11 connection");
        }
        debug!(window = shared.window, "X11 swapchain destroyed");
    }
}
