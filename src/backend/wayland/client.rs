//! [`WaylandConnection`] on top of `wayland-client`.

use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    os::unix::io::AsFd,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use indexmap::IndexMap;
use rustix::{
    event::{poll, PollFd, PollFlags},
    io::Errno,
};
use tracing::{debug, info, trace};
use wayland_client::{
    backend,
    globals::{registry_queue_init, GlobalListContents},
    protocol::{wl_buffer, wl_callback, wl_registry, wl_shm, wl_shm_pool, wl_surface},
    Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::{zwp_linux_buffer_params_v1, zwp_linux_dmabuf_v1};

use super::{
    conn::{BufferId, Commit, SurfaceId, WaylandConnection, WaylandEvent, WaylandGlobals},
    WaylandError,
};
use crate::{
    backend::allocator::{dmabuf::Dmabuf, shm::ShmBuffer, Buffer, Fourcc, Modifier},
    utils::{Extent, Rect},
};

#[derive(Debug, Default)]
struct ClientState {
    shm_formats: Vec<Fourcc>,
    dmabuf_formats: IndexMap<Fourcc, Vec<Modifier>>,
    events: HashMap<SurfaceId, VecDeque<WaylandEvent>>,
}

impl ClientState {
    fn push(&mut self, surface: SurfaceId, event: WaylandEvent) {
        self.events.entry(surface).or_default().push_back(event);
    }
}

struct Inner {
    queue: EventQueue<ClientState>,
    state: ClientState,
    surfaces: HashMap<SurfaceId, wl_surface::WlSurface>,
    buffers: HashMap<BufferId, wl_buffer::WlBuffer>,
}

impl Inner {
    fn dispatch_pending(&mut self) -> Result<(), WaylandError> {
        self.queue.dispatch_pending(&mut self.state)?;
        Ok(())
    }

    fn pop(&mut self, surface: SurfaceId) -> Option<WaylandEvent> {
        self.state.events.get_mut(&surface).and_then(VecDeque::pop_front)
    }
}

/// A client connection to a Wayland compositor
pub struct ClientDisplay {
    conn: Connection,
    qh: QueueHandle<ClientState>,
    shm: Option<wl_shm::WlShm>,
    dmabuf: Option<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for ClientDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientDisplay")
            .field("conn", &self.conn)
            .field("shm", &self.shm)
            .field("dmabuf", &self.dmabuf)
            .finish_non_exhaustive()
    }
}

impl ClientDisplay {
    /// Connects to the compositor named by `$WAYLAND_DISPLAY`
    pub fn connect_to_env() -> Result<ClientDisplay, WaylandError> {
        let conn = Connection::connect_to_env()?;
        info!("Connected to Wayland compositor");
        ClientDisplay::new(conn)
    }

    /// Binds the buffer globals on an existing connection.
    ///
    /// The connection gets its own event queue, the events of the application are not touched.
    pub fn new(conn: Connection) -> Result<ClientDisplay, WaylandError> {
        let (globals, mut queue) = registry_queue_init::<ClientState>(&conn)?;
        let qh = queue.handle();

        let shm = globals.bind::<wl_shm::WlShm, _, _>(&qh, 1..=1, ()).ok();
        // version 3 announces modifiers through events, later versions through feedback objects
        let dmabuf = globals
            .bind::<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, _, _>(&qh, 3..=3, ())
            .ok();

        let mut state = ClientState::default();
        queue.roundtrip(&mut state)?;
        debug!(
            shm = shm.is_some(),
            dmabuf = dmabuf.is_some(),
            shm_formats = ?state.shm_formats,
            dmabuf_formats = state.dmabuf_formats.len(),
            "Wayland globals bound"
        );

        Ok(ClientDisplay {
            conn,
            qh,
            shm,
            dmabuf,
            inner: Mutex::new(Inner {
                queue,
                state,
                surfaces: HashMap::new(),
                buffers: HashMap::new(),
            }),
        })
    }

    /// The underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Makes `surface` available for presentation
    pub fn register_surface(&self, surface: wl_surface::WlSurface) -> SurfaceId {
        let id = surface.id().protocol_id();
        self.inner.lock().unwrap().surfaces.insert(id, surface);
        id
    }

    /// Forgets a surface registered before
    pub fn unregister_surface(&self, surface: SurfaceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.surfaces.remove(&surface);
        inner.state.events.remove(&surface);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Reads events from the socket, waiting at most `timeout` for them to arrive
    fn read_events<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        timeout: Duration,
    ) -> Result<MutexGuard<'a, Inner>, WaylandError> {
        inner.dispatch_pending()?;
        self.conn.flush()?;
        let Some(guard) = inner.queue.prepare_read() else {
            // events are queued already
            inner.dispatch_pending()?;
            return Ok(inner);
        };
        drop(inner);

        let ready = {
            let fd = guard.connection_fd();
            let mut fds = [PollFd::new(&fd, PollFlags::IN)];
            match poll(&mut fds, timeout.as_millis().min(i32::MAX as u128) as i32) {
                Ok(count) => count > 0,
                Err(Errno::INTR) => false,
                Err(err) => return Err(WaylandError::ConnectionLost(err.into())),
            }
        };
        if ready {
            match guard.read() {
                Ok(_) => {}
                Err(backend::WaylandError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
        }

        let mut inner = self.lock();
        inner.dispatch_pending()?;
        Ok(inner)
    }

    fn next_event(&self, surface: SurfaceId, timeout: Duration) -> Result<Option<WaylandEvent>, WaylandError> {
        let mut inner = self.lock();
        if let Some(event) = inner.pop(surface) {
            return Ok(Some(event));
        }
        let mut inner = self.read_events(inner, timeout)?;
        Ok(inner.pop(surface))
    }

    fn add_buffer(&self, inner: &mut Inner, buffer: wl_buffer::WlBuffer) -> BufferId {
        let id = buffer.id().protocol_id();
        trace!(id, "Buffer created");
        inner.buffers.insert(id, buffer);
        id
    }
}

fn shm_format(format: Fourcc) -> Result<wl_shm::Format, WaylandError> {
    match format {
        // the only formats with codes differing from their fourcc
        Fourcc::Argb8888 => Ok(wl_shm::Format::Argb8888),
        Fourcc::Xrgb8888 => Ok(wl_shm::Format::Xrgb8888),
        other => wl_shm::Format::try_from(other as u32).map_err(|_| WaylandError::UnsupportedFormat(format)),
    }
}

impl WaylandConnection for ClientDisplay {
    fn query_globals(&self) -> Result<WaylandGlobals, WaylandError> {
        let inner = self.lock();
        Ok(WaylandGlobals {
            shm_formats: self
                .shm
                .as_ref()
                .map(|_| inner.state.shm_formats.clone())
                .unwrap_or_default(),
            dmabuf_formats: self.dmabuf.as_ref().map(|_| inner.state.dmabuf_formats.clone()),
        })
    }

    fn create_dmabuf_buffer(
        &self,
        surface: SurfaceId,
        dmabuf: &Dmabuf,
        format: Fourcc,
    ) -> Result<BufferId, WaylandError> {
        let global = self
            .dmabuf
            .as_ref()
            .ok_or(WaylandError::MissingGlobal("zwp_linux_dmabuf_v1"))?;
        let mut inner = self.lock();
        if !inner.surfaces.contains_key(&surface) {
            return Err(WaylandError::UnknownSurface(surface));
        }

        let params = global.create_params(&self.qh, ());
        // modifier is sent in the platform's endianness
        let modifier: u64 = dmabuf.modifier().into();
        let planes = dmabuf.handles().zip(dmabuf.offsets()).zip(dmabuf.strides());
        for (index, ((fd, offset), stride)) in planes.enumerate() {
            params.add(fd, index as u32, offset, stride, (modifier >> 32) as u32, modifier as u32);
        }
        let (width, height) = dmabuf.size();
        let buffer = params.create_immed(
            width as i32,
            height as i32,
            format as u32,
            zwp_linux_buffer_params_v1::Flags::empty(),
            &self.qh,
            surface,
        );
        params.destroy();
        Ok(self.add_buffer(&mut inner, buffer))
    }

    fn create_shm_buffer(
        &self,
        surface: SurfaceId,
        shm: &ShmBuffer,
        extent: Extent,
        format: Fourcc,
    ) -> Result<BufferId, WaylandError> {
        let global = self.shm.as_ref().ok_or(WaylandError::MissingGlobal("wl_shm"))?;
        let shm_format = shm_format(format)?;
        let mut inner = self.lock();
        if !inner.surfaces.contains_key(&surface) {
            return Err(WaylandError::UnknownSurface(surface));
        }

        let pool = global.create_pool(shm.as_fd(), shm.pool_size() as i32, &self.qh, ());
        let buffer = pool.create_buffer(
            shm.offset() as i32,
            extent.width as i32,
            extent.height as i32,
            shm.stride() as i32,
            shm_format,
            &self.qh,
            surface,
        );
        // the buffer keeps the memory of the pool alive
        pool.destroy();
        Ok(self.add_buffer(&mut inner, buffer))
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        if let Some(buffer) = self.lock().buffers.remove(&buffer) {
            buffer.destroy();
        }
    }

    fn commit(&self, surface: SurfaceId, commit: &Commit) -> Result<(), WaylandError> {
        let inner = self.lock();
        let wl_surface = inner
            .surfaces
            .get(&surface)
            .ok_or(WaylandError::UnknownSurface(surface))?;
        let buffer = inner
            .buffers
            .get(&commit.buffer)
            .ok_or_else(|| WaylandError::InvalidId(format!("wl_buffer@{}", commit.buffer)))?;

        wl_surface.attach(Some(buffer), 0, 0);
        let full = [Rect::from_extent(Extent::new(i32::MAX as u32, i32::MAX as u32))];
        let damage = if commit.damage.is_empty() {
            &full[..]
        } else {
            &commit.damage[..]
        };
        for rect in damage {
            let (x, y) = (rect.offset.x, rect.offset.y);
            let (w, h) = (rect.extent.width as i32, rect.extent.height as i32);
            // damage_buffer needs version 4, buffer and surface coordinates match without scaling
            if wl_surface.version() >= 4 {
                wl_surface.damage_buffer(x, y, w, h);
            } else {
                wl_surface.damage(x, y, w, h);
            }
        }
        if commit.frame {
            wl_surface.frame(&self.qh, surface);
        }
        wl_surface.commit();
        Ok(())
    }

    fn poll_event(&self, surface: SurfaceId) -> Result<Option<WaylandEvent>, WaylandError> {
        self.next_event(surface, Duration::ZERO)
    }

    fn wait_event(&self, surface: SurfaceId, timeout: Duration) -> Result<Option<WaylandEvent>, WaylandError> {
        self.next_event(surface, timeout)
    }

    fn flush(&self) -> Result<(), WaylandError> {
        match self.conn.flush() {
            Err(backend::WaylandError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            result => Ok(result?),
        }
    }
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for ClientState {
    fn event(
        _: &mut Self,
        _: &wl_registry::WlRegistry,
        _: wl_registry::Event,
        _: &GlobalListContents,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_shm::WlShm, ()> for ClientState {
    fn event(
        state: &mut Self,
        _: &wl_shm::WlShm,
        event: wl_shm::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_shm::Event::Format { format } = event {
            let code = match format {
                WEnum::Value(wl_shm::Format::Argb8888) => Fourcc::Argb8888 as u32,
                WEnum::Value(wl_shm::Format::Xrgb8888) => Fourcc::Xrgb8888 as u32,
                WEnum::Value(format) => format.into(),
                WEnum::Unknown(code) => code,
            };
            if let Ok(format) = Fourcc::try_from(code) {
                state.shm_formats.push(format);
            }
        }
    }
}

impl Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for ClientState {
    fn event(
        state: &mut Self,
        _: &zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
        event: zwp_linux_dmabuf_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            zwp_linux_dmabuf_v1::Event::Format { format } => {
                if let Ok(format) = Fourcc::try_from(format) {
                    state.dmabuf_formats.entry(format).or_default();
                }
            }
            zwp_linux_dmabuf_v1::Event::Modifier {
                format,
                modifier_hi,
                modifier_lo,
            } => {
                if let Ok(format) = Fourcc::try_from(format) {
                    let modifier = Modifier::from(((modifier_hi as u64) << 32) | modifier_lo as u64);
                    state.dmabuf_formats.entry(format).or_default().push(modifier);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, ()> for ClientState {
    fn event(
        _: &mut Self,
        _: &wl_shm_pool::WlShmPool,
        _: wl_shm_pool::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1, ()> for ClientState {
    fn event(
        _: &mut Self,
        _: &zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        _: zwp_linux_buffer_params_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        // create_immed reports failures as protocol errors
    }
}

impl Dispatch<wl_buffer::WlBuffer, SurfaceId> for ClientState {
    fn event(
        state: &mut Self,
        buffer: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        surface: &SurfaceId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            state.push(*surface, WaylandEvent::Release(buffer.id().protocol_id()));
        }
    }
}

impl Dispatch<wl_callback::WlCallback, SurfaceId> for ClientState {
    fn event(
        state: &mut Self,
        _: &wl_callback::WlCallback,
        event: wl_callback::Event,
        surface: &SurfaceId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            state.push(*surface, WaylandEvent::FrameDone);
        }
    }
}
