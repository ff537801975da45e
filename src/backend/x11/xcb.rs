//! [`PresentConnection`] on top of `x11rb`.

use std::{
    collections::{HashMap, VecDeque},
    os::unix::io::OwnedFd,
    sync::Mutex,
    time::{Duration, Instant},
};

use rustix::{
    event::{poll, PollFd, PollFlags},
    io::Errno,
};
use tracing::{debug, info, trace, warn};
use x11rb::{
    connection::{Connection, RequestConnection},
    protocol::{
        dri3::ConnectionExt as _,
        present::{self, ConnectionExt as _},
        shm::ConnectionExt as _,
        sync::ConnectionExt as _,
        xfixes::ConnectionExt as _,
        xproto::{self, ConnectionExt as _},
        Event,
    },
    rust_connection::RustConnection,
};

use super::{
    conn::{
        CompleteKind, CompleteMode, ConnectionCaps, PresentConnection, PresentEvent, PresentRequest, ShmPixmap,
        VisualClass, VisualInfo, WindowGeometry, XResource, Xid,
    },
    extension::Extensions,
    X11Error,
};
use crate::{
    backend::allocator::{dmabuf::Dmabuf, shm::ShmBuffer, Buffer, Modifier},
    utils::{Extent, Rect},
};

/// `PresentWindowDestroyed` flag of configure events
const WINDOW_DESTROYED: u32 = 1;

/// A connection to an X server
#[derive(Debug)]
pub struct XcbConnection {
    conn: RustConnection,
    screen: usize,
    caps: ConnectionCaps,
    pending: Mutex<HashMap<Xid, VecDeque<PresentEvent>>>,
}

impl XcbConnection {
    /// Connects to the X server named by `display`, or `$DISPLAY`
    pub fn connect(display: Option<&str>) -> Result<XcbConnection, X11Error> {
        let (conn, screen) = x11rb::connect(display)?;
        XcbConnection::new(conn, screen)
    }

    /// Wraps an existing connection
    pub fn new(conn: RustConnection, screen: usize) -> Result<XcbConnection, X11Error> {
        let extensions = Extensions::check_extensions(&conn)?;
        let mit_shm = match conn.extension_information(x11rb::protocol::shm::X11_EXTENSION_NAME)? {
            Some(_) => {
                let version = conn.shm_query_version()?.reply()?;
                (version.major_version, version.minor_version) >= (1, 2)
            }
            None => false,
        };
        let is_xwayland = conn.extension_information("XWAYLAND")?.is_some();
        let is_proprietary =
            conn.extension_information("NV-GLX")?.is_some() || conn.extension_information("ATIFGLRXDRI")?.is_some();

        let caps = ConnectionCaps {
            dri3: extensions.dri3,
            present: extensions.present,
            xfixes: extensions.xfixes.is_some(),
            mit_shm,
            is_xwayland,
            is_proprietary,
        };
        info!(?caps, "Connected to the X server");

        Ok(XcbConnection {
            conn,
            screen,
            caps,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying connection
    pub fn connection(&self) -> &RustConnection {
        &self.conn
    }

    /// Root window of the default screen
    pub fn root(&self) -> Xid {
        self.conn.setup().roots[self.screen].root
    }

    fn visual(&self, visual_id: xproto::Visualid) -> Option<(u8, VisualInfo)> {
        self.conn.setup().roots.iter().find_map(|screen| {
            screen.allowed_depths.iter().find_map(|depth| {
                depth.visuals.iter().find(|visual| visual.visual_id == visual_id).map(|visual| {
                    let class = if visual.class == xproto::VisualClass::TRUE_COLOR {
                        VisualClass::TrueColor
                    } else if visual.class == xproto::VisualClass::DIRECT_COLOR {
                        VisualClass::DirectColor
                    } else {
                        VisualClass::Other
                    };
                    (
                        depth.depth,
                        VisualInfo {
                            class,
                            red_mask: visual.red_mask,
                            green_mask: visual.green_mask,
                            blue_mask: visual.blue_mask,
                        },
                    )
                })
            })
        })
    }

    fn route(&self, event: Event) {
        let (eid, event) = match event {
            Event::PresentConfigureNotify(ev) => (
                ev.event,
                PresentEvent::Configure {
                    extent: Extent::new(ev.width as u32, ev.height as u32),
                    window_destroyed: ev.pixmap_flags & WINDOW_DESTROYED != 0,
                },
            ),
            Event::PresentCompleteNotify(ev) => {
                let kind = if ev.kind == present::CompleteKind::NOTIFY_MSC {
                    CompleteKind::NotifyMsc
                } else {
                    CompleteKind::Pixmap
                };
                let mode = if ev.mode == present::CompleteMode::FLIP {
                    CompleteMode::Flip
                } else if ev.mode == present::CompleteMode::SKIP {
                    CompleteMode::Skip
                } else if ev.mode == present::CompleteMode::SUBOPTIMAL_COPY {
                    CompleteMode::SuboptimalCopy
                } else {
                    CompleteMode::Copy
                };
                (
                    ev.event,
                    PresentEvent::Complete {
                        serial: ev.serial,
                        msc: ev.msc,
                        kind,
                        mode,
                    },
                )
            }
            Event::PresentIdleNotify(ev) => (
                ev.event,
                PresentEvent::Idle {
                    pixmap: ev.pixmap,
                    serial: ev.serial,
                },
            ),
            Event::Error(err) => {
                warn!(?err, "X11 request failed");
                return;
            }
            event => {
                trace!(?event, "Ignoring X11 event");
                return;
            }
        };

        match self.pending.lock().unwrap().get_mut(&eid) {
            Some(queue) => queue.push_back(event),
            None => trace!(eid, "Event for an unknown event context"),
        }
    }

    fn next_event(&self, eid: Xid, deadline: Option<Instant>) -> Result<Option<PresentEvent>, X11Error> {
        loop {
            if let Some(event) = self.pending.lock().unwrap().get_mut(&eid).and_then(VecDeque::pop_front) {
                return Ok(Some(event));
            }
            if let Some(event) = self.conn.poll_for_event()? {
                self.route(event);
                continue;
            }

            let Some(deadline) = deadline else {
                return Ok(None);
            };
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            let mut fds = [PollFd::new(self.conn.stream(), PollFlags::IN)];
            match poll(&mut fds, left.as_millis().clamp(1, i32::MAX as u128) as i32) {
                Ok(_) | Err(Errno::INTR) => {}
                Err(err) => {
                    warn!(?err, "Polling the X11 connection failed");
                    return Err(X11Error::ConnectionLost);
                }
            }
        }
    }
}

impl PresentConnection for XcbConnection {
    fn caps(&self) -> ConnectionCaps {
        self.caps
    }

    fn window_geometry(&self, window: Xid) -> Result<WindowGeometry, X11Error> {
        let geometry = self.conn.get_geometry(window)?.reply()?;
        let attributes = self.conn.get_window_attributes(window)?.reply()?;
        let visual = self.visual(attributes.visual).map(|(_, visual)| visual);
        Ok(WindowGeometry {
            extent: Extent::new(geometry.width as u32, geometry.height as u32),
            depth: geometry.depth,
            visual,
        })
    }

    fn dri3_device(&self, window: Xid) -> Result<Option<u64>, X11Error> {
        if self.caps.dri3.is_none() {
            return Ok(None);
        }
        let reply = match self.conn.dri3_open(window, x11rb::NONE)?.reply() {
            Ok(reply) => reply,
            Err(err) => {
                debug!(?err, "DRI3Open failed");
                return Ok(None);
            }
        };
        let fd: OwnedFd = reply.device_fd;
        match rustix::fs::fstat(&fd) {
            Ok(stat) => Ok(Some(stat.st_rdev)),
            Err(err) => {
                debug!(?err, "Failed to stat the DRI3 device");
                Ok(None)
            }
        }
    }

    fn dri3_modifiers(&self, window: Xid, depth: u8, bpp: u8) -> Result<Vec<Vec<Modifier>>, X11Error> {
        if !self.caps.has_modifiers() {
            return Ok(Vec::new());
        }
        let reply = self.conn.dri3_get_supported_modifiers(window, depth, bpp)?.reply()?;
        Ok([reply.window_modifiers, reply.screen_modifiers]
            .into_iter()
            .filter(|list| !list.is_empty())
            .map(|list| list.into_iter().map(Modifier::from).collect())
            .collect())
    }

    fn select_present_events(&self, window: Xid) -> Result<Xid, X11Error> {
        let eid = self.conn.generate_id()?;
        self.pending.lock().unwrap().insert(eid, VecDeque::new());
        self.conn.present_select_input(
            eid,
            window,
            present::EventMask::CONFIGURE_NOTIFY | present::EventMask::COMPLETE_NOTIFY | present::EventMask::IDLE_NOTIFY,
        )?;
        Ok(eid)
    }

    fn unselect_present_events(&self, window: Xid, eid: Xid) {
        if let Err(err) = self.conn.present_select_input(eid, window, present::EventMask::NO_EVENT) {
            debug!(?err, "Failed to deselect present events");
        }
        self.pending.lock().unwrap().remove(&eid);
    }

    fn pixmap_from_dmabuf(&self, window: Xid, dmabuf: &Dmabuf, depth: u8, bpp: u8) -> Result<Xid, X11Error> {
        let mut fds = dmabuf.duplicate_fds().map_err(|_| X11Error::OutOfResources)?;
        let (width, height) = dmabuf.size();
        let xid = self.conn.generate_id()?;

        if self.caps.dri3 >= Some((1, 2)) {
            if dmabuf.num_planes() > 4 {
                return Err(X11Error::UnsupportedBuffer);
            }
            let mut strides = dmabuf.strides();
            let mut offsets = dmabuf.offsets();
            self.conn
                .dri3_pixmap_from_buffers(
                    xid,
                    window,
                    width as u16,
                    height as u16,
                    strides.next().unwrap_or(x11rb::NONE),
                    offsets.next().unwrap_or(x11rb::NONE),
                    strides.next().unwrap_or(x11rb::NONE),
                    offsets.next().unwrap_or(x11rb::NONE),
                    strides.next().unwrap_or(x11rb::NONE),
                    offsets.next().unwrap_or(x11rb::NONE),
                    strides.next().unwrap_or(x11rb::NONE),
                    offsets.next().unwrap_or(x11rb::NONE),
                    depth,
                    bpp,
                    u64::from(dmabuf.modifier()),
                    fds,
                )?
                .check()?;
        } else {
            // Old codepath can only create a pixmap using one plane from a dmabuf.
            if fds.len() != 1 || dmabuf.has_modifier() {
                return Err(X11Error::UnsupportedBuffer);
            }
            let stride = dmabuf.strides().next().unwrap_or(0);
            self.conn
                .dri3_pixmap_from_buffer(
                    xid,
                    window,
                    height * stride,
                    width as u16,
                    height as u16,
                    stride as u16,
                    depth,
                    bpp,
                    fds.remove(0),
                )?
                .check()?;
        }
        Ok(xid)
    }

    fn pixmap_from_shm(
        &self,
        window: Xid,
        shm: &ShmBuffer,
        extent: Extent,
        depth: u8,
    ) -> Result<ShmPixmap, X11Error> {
        let fd = shm.duplicate_fd().map_err(|_| X11Error::OutOfResources)?;
        let segment = self.conn.generate_id()?;
        self.conn.shm_attach_fd(segment, fd, true)?.check()?;
        let pixmap = self.conn.generate_id()?;
        let created = self
            .conn
            .shm_create_pixmap(
                pixmap,
                window,
                extent.width as u16,
                extent.height as u16,
                depth,
                segment,
                shm.offset() as u32,
            )
            .map_err(X11Error::from)
            .and_then(|cookie| cookie.check().map_err(X11Error::from));
        if let Err(err) = created {
            self.free(XResource::ShmSegment(segment));
            return Err(err);
        }
        Ok(ShmPixmap { pixmap, segment })
    }

    fn fence_from_fd(&self, drawable: Xid, fd: OwnedFd) -> Result<Xid, X11Error> {
        let fence = self.conn.generate_id()?;
        self.conn.dri3_fence_from_fd(drawable, fence, false, fd)?;
        Ok(fence)
    }

    fn create_region(&self) -> Result<Xid, X11Error> {
        let region = self.conn.generate_id()?;
        self.conn.xfixes_create_region(region, &[])?;
        Ok(region)
    }

    fn set_region(&self, region: Xid, rects: &[Rect]) -> Result<(), X11Error> {
        let rects = rects
            .iter()
            .map(|rect| xproto::Rectangle {
                x: rect.offset.x as i16,
                y: rect.offset.y as i16,
                width: rect.extent.width as u16,
                height: rect.extent.height as u16,
            })
            .collect::<Vec<_>>();
        self.conn.xfixes_set_region(region, &rects)?;
        Ok(())
    }

    fn present_pixmap(&self, request: &PresentRequest) -> Result<(), X11Error> {
        self.conn.present_pixmap(
            request.window,
            request.pixmap,
            request.serial,
            x11rb::NONE, // valid area is the whole pixmap
            request.update.unwrap_or(x11rb::NONE),
            0,
            0,
            x11rb::NONE, // let the X server pick the crtc
            x11rb::NONE, // no wait fence, rendering is finished
            request.idle_fence,
            request.options,
            request.target_msc,
            0,
            0,
            &[],
        )?;
        Ok(())
    }

    fn poll_present_event(&self, eid: Xid) -> Result<Option<PresentEvent>, X11Error> {
        self.next_event(eid, None)
    }

    fn wait_present_event(&self, eid: Xid, timeout: Duration) -> Result<Option<PresentEvent>, X11Error> {
        self.next_event(eid, Instant::now().checked_add(timeout))
    }

    fn flush(&self) -> Result<(), X11Error> {
        self.conn.flush()?;
        Ok(())
    }

    fn free(&self, resource: XResource) {
        let result = match resource {
            XResource::Pixmap(pixmap) => self.conn.free_pixmap(pixmap).map(|_| ()),
            XResource::Fence(fence) => self.conn.sync_destroy_fence(fence).map(|_| ()),
            XResource::Region(region) => self.conn.xfixes_destroy_region(region).map(|_| ()),
            XResource::ShmSegment(segment) => self.conn.shm_detach(segment).map(|_| ()),
        };
        if let Err(err) = result {
            debug!(?resource, ?err, "Failed to free X11 resource");
        }
    }
}
