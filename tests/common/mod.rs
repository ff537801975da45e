#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    os::unix::io::OwnedFd,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use wsi::{
    backend::{
        allocator::{dmabuf::Dmabuf, shm::ShmBuffer, Fourcc, MappedImage, Modifier},
        software::{ImageSink, SinkError},
        x11::{
            conn::{
                CompleteKind, CompleteMode, ConnectionCaps, PresentConnection, PresentEvent, PresentRequest,
                ShmPixmap, VisualClass, VisualInfo, WindowGeometry, XResource, Xid,
            },
            ShmFence, X11Error,
        },
    },
    device::{host::HostDevice, ExternalMemoryTypes},
    utils::{Extent, Rect},
};

pub const WINDOW: Xid = 0x20_0001;
pub const SECOND: u64 = 1_000_000_000;
pub const RENDER_NODE: u64 = (226 << 8) | 128;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

/// A device exporting dmabufs, on the same GPU as the X server
pub fn dmabuf_device() -> HostDevice {
    HostDevice::builder()
        .external_memory(ExternalMemoryTypes::DMA_BUF | ExternalMemoryTypes::SHM)
        .render_node(RENDER_NODE)
        .build()
}

#[derive(Debug, Default)]
pub struct Server {
    next_id: Xid,
    pub live: HashSet<XResource>,
    pub event_contexts: HashSet<Xid>,
    fences: HashMap<Xid, ShmFence>,
    idle_fences: HashMap<Xid, Xid>,
    pending: VecDeque<PresentRequest>,
    pub requests: Vec<PresentRequest>,
    displayed: Option<Xid>,
    pub events: VecDeque<PresentEvent>,
    msc: u64,
    /// Completions are reported with this mode
    pub complete_mode: Option<CompleteMode>,
    /// Presentations are never completed
    pub stalled: bool,
}

impl Server {
    fn id(&mut self) -> Xid {
        self.next_id += 1;
        0x40_0000 + self.next_id
    }

    fn next_event(&mut self) -> Option<PresentEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        if self.stalled {
            return None;
        }
        let request = self.pending.pop_front()?;
        self.msc = (self.msc + 1).max(request.target_msc);
        if let Some(previous) = self.displayed.replace(request.pixmap) {
            if previous != request.pixmap {
                if let Some(fence) = self.idle_fences.get(&previous).and_then(|fence| self.fences.get(fence)) {
                    fence.trigger();
                }
                self.events.push_back(PresentEvent::Idle {
                    pixmap: previous,
                    serial: 0,
                });
            }
        }
        Some(PresentEvent::Complete {
            serial: request.serial,
            msc: self.msc,
            kind: CompleteKind::Pixmap,
            mode: self.complete_mode.unwrap_or(CompleteMode::Flip),
        })
    }
}

/// An X server with one 640x480 window, flipping one presentation per vblank
#[derive(Debug, Default)]
pub struct FlipServer {
    server: Mutex<Server>,
}

impl FlipServer {
    pub fn new() -> Arc<FlipServer> {
        Arc::new(FlipServer::default())
    }

    pub fn server(&self) -> MutexGuard<'_, Server> {
        self.server.lock().unwrap()
    }

    pub fn requests(&self) -> Vec<PresentRequest> {
        self.server().requests.clone()
    }
}

impl PresentConnection for FlipServer {
    fn caps(&self) -> ConnectionCaps {
        ConnectionCaps {
            dri3: Some((1, 2)),
            present: Some((1, 2)),
            xfixes: true,
            mit_shm: true,
            is_xwayland: false,
            is_proprietary: false,
        }
    }

    fn window_geometry(&self, window: Xid) -> Result<WindowGeometry, X11Error> {
        if window != WINDOW {
            return Err(X11Error::Protocol("BadWindow".into()));
        }
        Ok(WindowGeometry {
            extent: Extent::new(640, 480),
            depth: 24,
            visual: Some(VisualInfo {
                class: VisualClass::TrueColor,
                red_mask: 0xff0000,
                green_mask: 0xff00,
                blue_mask: 0xff,
            }),
        })
    }

    fn dri3_device(&self, _window: Xid) -> Result<Option<u64>, X11Error> {
        Ok(Some(RENDER_NODE))
    }

    fn dri3_modifiers(&self, _window: Xid, _depth: u8, _bpp: u8) -> Result<Vec<Vec<Modifier>>, X11Error> {
        Ok(Vec::new())
    }

    fn select_present_events(&self, _window: Xid) -> Result<Xid, X11Error> {
        let mut server = self.server();
        let eid = server.id();
        server.event_contexts.insert(eid);
        Ok(eid)
    }

    fn unselect_present_events(&self, _window: Xid, eid: Xid) {
        self.server().event_contexts.remove(&eid);
    }

    fn pixmap_from_dmabuf(&self, _window: Xid, _dmabuf: &Dmabuf, _depth: u8, _bpp: u8) -> Result<Xid, X11Error> {
        let mut server = self.server();
        let pixmap = server.id();
        server.live.insert(XResource::Pixmap(pixmap));
        Ok(pixmap)
    }

    fn pixmap_from_shm(
        &self,
        _window: Xid,
        _shm: &ShmBuffer,
        _extent: Extent,
        _depth: u8,
    ) -> Result<ShmPixmap, X11Error> {
        let mut server = self.server();
        let segment = server.id();
        let pixmap = server.id();
        server.live.insert(XResource::ShmSegment(segment));
        server.live.insert(XResource::Pixmap(pixmap));
        Ok(ShmPixmap { pixmap, segment })
    }

    fn fence_from_fd(&self, drawable: Xid, fd: OwnedFd) -> Result<Xid, X11Error> {
        let fence = ShmFence::from_fd(fd).map_err(X11Error::Fence)?;
        let mut server = self.server();
        let id = server.id();
        server.fences.insert(id, fence);
        server.idle_fences.insert(drawable, id);
        server.live.insert(XResource::Fence(id));
        Ok(id)
    }

    fn create_region(&self) -> Result<Xid, X11Error> {
        let mut server = self.server();
        let region = server.id();
        server.live.insert(XResource::Region(region));
        Ok(region)
    }

    fn set_region(&self, _region: Xid, _rects: &[Rect]) -> Result<(), X11Error> {
        Ok(())
    }

    fn present_pixmap(&self, request: &PresentRequest) -> Result<(), X11Error> {
        let mut server = self.server();
        server.pending.push_back(*request);
        server.requests.push(*request);
        Ok(())
    }

    fn poll_present_event(&self, _eid: Xid) -> Result<Option<PresentEvent>, X11Error> {
        Ok(self.server().next_event())
    }

    fn wait_present_event(&self, eid: Xid, timeout: Duration) -> Result<Option<PresentEvent>, X11Error> {
        let event = self.poll_present_event(eid)?;
        if event.is_none() {
            thread::sleep(timeout.min(Duration::from_millis(2)));
        }
        Ok(event)
    }

    fn flush(&self) -> Result<(), X11Error> {
        Ok(())
    }

    fn free(&self, resource: XResource) {
        let mut server = self.server();
        server.live.remove(&resource);
        if let XResource::Fence(fence) = resource {
            server.fences.remove(&fence);
        }
    }
}

/// A software target remembering how often it received an image
#[derive(Debug)]
pub struct CountingSink {
    pub extent: Mutex<Extent>,
    pub lost: Mutex<bool>,
    pub puts: Mutex<usize>,
}

impl CountingSink {
    pub fn new(extent: Extent) -> Arc<CountingSink> {
        Arc::new(CountingSink {
            extent: Mutex::new(extent),
            lost: Mutex::new(false),
            puts: Mutex::new(0),
        })
    }
}

impl ImageSink for CountingSink {
    fn extent(&self) -> Result<Extent, SinkError> {
        if *self.lost.lock().unwrap() {
            return Err(SinkError::TargetLost);
        }
        Ok(*self.extent.lock().unwrap())
    }

    fn formats(&self) -> Result<Vec<Fourcc>, SinkError> {
        Ok(vec![Fourcc::Xrgb8888])
    }

    fn put_image(&self, image: &MappedImage<'_>, _damage: &[Rect]) -> Result<(), SinkError> {
        if *self.lost.lock().unwrap() {
            return Err(SinkError::TargetLost);
        }
        assert!(image.row(0).len() >= image.extent().width as usize * 4);
        *self.puts.lock().unwrap() += 1;
        Ok(())
    }
}
