use std::{
    collections::{HashMap, HashSet, VecDeque},
    os::unix::io::OwnedFd,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use rustix::fs::makedev;

use super::{
    conn::{
        CompleteKind, CompleteMode, ConnectionCaps, PresentConnection, PresentEvent, PresentRequest, ShmPixmap,
        VisualClass, VisualInfo, WindowGeometry, XResource, Xid, PRESENT_OPTION_ASYNC,
    },
    image_count, ShmFence, X11Error, X11Surface,
};
use crate::{
    backend::allocator::{dmabuf::Dmabuf, format::ColorFormat, shm::ShmBuffer, Fourcc, Modifier},
    config::WsiOptions,
    device::{host::HostDevice, ExternalMemoryTypes},
    image::ImageState,
    status::Outcome,
    surface::{CompositeAlpha, PresentMode, Surface, SwapchainCreateInfo, Wsi},
    utils::{Extent, Rect},
    Error,
};

const WINDOW: Xid = 0x20_0001;
const SECOND: u64 = 1_000_000_000;

fn xrgb_visual() -> VisualInfo {
    VisualInfo {
        class: VisualClass::TrueColor,
        red_mask: 0xff0000,
        green_mask: 0xff00,
        blue_mask: 0xff,
    }
}

fn dri3_caps() -> ConnectionCaps {
    ConnectionCaps {
        dri3: Some((1, 2)),
        present: Some((1, 2)),
        xfixes: true,
        mit_shm: true,
        is_xwayland: false,
        is_proprietary: false,
    }
}

#[derive(Debug, Default)]
struct Server {
    next_id: Xid,
    live: HashSet<XResource>,
    event_contexts: HashSet<Xid>,
    fences: HashMap<Xid, ShmFence>,
    idle_fence: HashMap<Xid, Xid>,
    regions: HashMap<Xid, Vec<Rect>>,
    pending: VecDeque<PresentRequest>,
    requests: Vec<PresentRequest>,
    displayed: Option<Xid>,
    busy: HashSet<Xid>,
    max_busy: usize,
    events: VecDeque<PresentEvent>,
    msc: u64,
    complete_mode: Option<CompleteMode>,
    stalled: bool,
    shm_pixmaps: usize,
}

impl Server {
    fn id(&mut self) -> Xid {
        self.next_id += 1;
        0x40_0000 + self.next_id
    }

    fn make_idle(&mut self, pixmap: Xid) {
        self.busy.remove(&pixmap);
        if let Some(fence) = self.idle_fence.get(&pixmap).and_then(|fence| self.fences.get(fence)) {
            fence.trigger();
        }
        self.events.push_back(PresentEvent::Idle { pixmap, serial: 0 });
    }

    /// Completes the oldest pending presentation at the next vblank, flipping it on screen
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
                self.make_idle(previous);
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

/// An X server with one window, presenting by flipping at every vblank
#[derive(Debug)]
struct MockX11 {
    caps: ConnectionCaps,
    geometry: WindowGeometry,
    device: Option<u64>,
    modifiers: Vec<Vec<Modifier>>,
    server: Mutex<Server>,
}

impl MockX11 {
    fn new(caps: ConnectionCaps) -> MockX11 {
        MockX11 {
            caps,
            geometry: WindowGeometry {
                extent: Extent::new(640, 480),
                depth: 24,
                visual: Some(xrgb_visual()),
            },
            device: Some(makedev(226, 128)),
            modifiers: Vec::new(),
            server: Mutex::new(Server::default()),
        }
    }

    fn server(&self) -> std::sync::MutexGuard<'_, Server> {
        self.server.lock().unwrap()
    }

    fn push_event(&self, event: PresentEvent) {
        self.server().events.push_back(event);
    }

    fn requests(&self) -> Vec<PresentRequest> {
        self.server().requests.clone()
    }
}

impl PresentConnection for MockX11 {
    fn caps(&self) -> ConnectionCaps {
        self.caps
    }

    fn window_geometry(&self, window: Xid) -> Result<WindowGeometry, X11Error> {
        if window != WINDOW {
            return Err(X11Error::Protocol("BadWindow".into()));
        }
        Ok(self.geometry)
    }

    fn dri3_device(&self, _window: Xid) -> Result<Option<u64>, X11Error> {
        Ok(self.device)
    }

    fn dri3_modifiers(&self, _window: Xid, _depth: u8, _bpp: u8) -> Result<Vec<Vec<Modifier>>, X11Error> {
        Ok(self.modifiers.clone())
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

    fn pixmap_from_dmabuf(&self, _window: Xid, dmabuf: &Dmabuf, _depth: u8, _bpp: u8) -> Result<Xid, X11Error> {
        assert!(dmabuf.num_planes() >= 1);
        let mut server = self.server();
        let pixmap = server.id();
        server.live.insert(XResource::Pixmap(pixmap));
        Ok(pixmap)
    }

    fn pixmap_from_shm(
        &self,
        _window: Xid,
        shm: &ShmBuffer,
        extent: Extent,
        _depth: u8,
    ) -> Result<ShmPixmap, X11Error> {
        assert!(shm.stride() >= extent.width * 4);
        let mut server = self.server();
        let segment = server.id();
        let pixmap = server.id();
        server.live.insert(XResource::ShmSegment(segment));
        server.live.insert(XResource::Pixmap(pixmap));
        server.shm_pixmaps += 1;
        Ok(ShmPixmap { pixmap, segment })
    }

    fn fence_from_fd(&self, drawable: Xid, fd: OwnedFd) -> Result<Xid, X11Error> {
        let fence = ShmFence::from_fd(fd).map_err(X11Error::Fence)?;
        let mut server = self.server();
        let id = server.id();
        server.fences.insert(id, fence);
        server.idle_fence.insert(drawable, id);
        server.live.insert(XResource::Fence(id));
        Ok(id)
    }

    fn create_region(&self) -> Result<Xid, X11Error> {
        let mut server = self.server();
        let region = server.id();
        server.regions.insert(region, Vec::new());
        server.live.insert(XResource::Region(region));
        Ok(region)
    }

    fn set_region(&self, region: Xid, rects: &[Rect]) -> Result<(), X11Error> {
        self.server().regions.insert(region, rects.to_vec());
        Ok(())
    }

    fn present_pixmap(&self, request: &PresentRequest) -> Result<(), X11Error> {
        let mut server = self.server();
        assert!(server.live.contains(&XResource::Pixmap(request.pixmap)));
        server.busy.insert(request.pixmap);
        server.max_busy = server.max_busy.max(server.busy.len());
        server.pending.push_back(*request);
        server.requests.push(*request);
        Ok(())
    }

    fn poll_present_event(&self, eid: Xid) -> Result<Option<PresentEvent>, X11Error> {
        let mut server = self.server();
        assert!(server.event_contexts.contains(&eid));
        Ok(server.next_event())
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
        assert!(server.live.remove(&resource), "double free of {:?}", resource);
        if let XResource::Fence(fence) = resource {
            server.fences.remove(&fence);
        }
    }
}

struct Setup {
    conn: Arc<MockX11>,
    wsi: Wsi,
    surface: Surface,
}

fn setup_with(conn: MockX11, device: HostDevice, options: WsiOptions) -> Setup {
    crate::utils::test_logging();
    let conn = Arc::new(conn);
    let surface = X11Surface::new(conn.clone(), WINDOW).into();
    let wsi = Wsi::with_options(Arc::new(device), options);
    Setup { conn, wsi, surface }
}

fn dmabuf_device() -> HostDevice {
    HostDevice::builder()
        .external_memory(ExternalMemoryTypes::DMA_BUF | ExternalMemoryTypes::SHM)
        .render_node(makedev(226, 128))
        .build()
}

fn setup() -> Setup {
    setup_with(MockX11::new(dri3_caps()), dmabuf_device(), WsiOptions::default())
}

fn create_info(count: u32, present_mode: PresentMode) -> SwapchainCreateInfo<'static> {
    SwapchainCreateInfo::new(count, ColorFormat::B8g8r8a8Srgb, Extent::new(640, 480)).with_present_mode(present_mode)
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn fifo_presents_once_per_vblank() {
    let setup = setup();
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(3, PresentMode::Fifo))
        .unwrap();
    assert_eq!(chain.images().len(), 3);

    for _ in 0..12 {
        let image = chain.acquire_next_image(SECOND).unwrap();
        assert!(!image.suboptimal);
        assert_eq!(chain.queue_present(image.index, 0, &[]).unwrap(), Outcome::Optimal);
    }
    assert!(wait_for(|| setup.conn.requests().len() == 12));
    drop(chain);

    let requests = setup.conn.requests();
    for (i, request) in requests.iter().enumerate() {
        assert_eq!(request.serial, i as u32 + 1);
        assert_eq!(request.target_msc, i as u64 + 1);
        assert_eq!(request.options & PRESENT_OPTION_ASYNC, 0);
    }
    // one image on screen and at most one more queued behind it
    assert!(setup.conn.server().max_busy <= 2);
}

#[test]
fn fifo_relaxed_presents_async() {
    let setup = setup();
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(3, PresentMode::FifoRelaxed))
        .unwrap();
    let image = chain.acquire_next_image(SECOND).unwrap();
    chain.queue_present(image.index, 0, &[]).unwrap();
    assert!(wait_for(|| !setup.conn.requests().is_empty()));
    assert_ne!(setup.conn.requests()[0].options & PRESENT_OPTION_ASYNC, 0);
}

#[test]
fn destroy_while_waiting_for_completion() {
    let setup = setup();
    setup.conn.server().stalled = true;
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(3, PresentMode::Fifo))
        .unwrap();
    let image = chain.acquire_next_image(SECOND).unwrap();
    chain.queue_present(image.index, 0, &[]).unwrap();
    assert!(wait_for(|| setup.conn.requests().len() == 1));

    chain.destroy();
    let server = setup.conn.server();
    assert!(server.live.is_empty(), "leaked {:?}", server.live);
    assert!(server.event_contexts.is_empty());
}

#[test]
fn immediate_polls_for_idle_images() {
    let setup = setup();
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(2, PresentMode::Immediate))
        .unwrap();
    assert_eq!(chain.images().len(), 2);

    let first = chain.acquire_next_image(0).unwrap().index;
    let second = chain.acquire_next_image(0).unwrap().index;
    assert_eq!(chain.acquire_next_image(0), Err(Error::NotReady));

    chain.queue_present(first, 0, &[]).unwrap();
    assert_eq!(setup.conn.requests()[0].target_msc, 0);
    assert_ne!(setup.conn.requests()[0].options & PRESENT_OPTION_ASYNC, 0);
    // still on screen
    assert_eq!(chain.acquire_next_image(0), Err(Error::NotReady));
    assert_eq!(chain.image_state(first), Some(ImageState::Displaying));

    chain.queue_present(second, 0, &[]).unwrap();
    let image = chain.acquire_next_image(SECOND).unwrap();
    assert_eq!(image.index, first);
    assert_eq!(chain.image_state(second), Some(ImageState::Displaying));
    assert_eq!(chain.current_status(), Ok(Outcome::Optimal));
}

#[test]
fn mailbox_uses_five_images() {
    let setup = setup();
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(3, PresentMode::Mailbox))
        .unwrap();
    assert_eq!(chain.images().len(), 5);
}

#[test]
fn suboptimal_copy_is_sticky() {
    let setup = setup();
    setup.conn.server().complete_mode = Some(CompleteMode::SuboptimalCopy);
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(3, PresentMode::Fifo))
        .unwrap();

    let mut suboptimal = false;
    for _ in 0..4 {
        let image = chain.acquire_next_image(SECOND).unwrap();
        suboptimal = image.suboptimal;
        chain.queue_present(image.index, 0, &[]).unwrap();
    }
    // the fourth image only became available after the first completion was handled
    assert!(suboptimal);
    assert_eq!(chain.current_status(), Ok(Outcome::Suboptimal));
}

#[test]
fn copy_after_flip_is_suboptimal() {
    let setup = setup();
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(2, PresentMode::Immediate))
        .unwrap();

    let image = chain.acquire_next_image(0).unwrap();
    chain.queue_present(image.index, 0, &[]).unwrap();
    let image = chain.acquire_next_image(0).unwrap();
    assert!(!image.suboptimal);
    // handles the flip of the first image
    assert_eq!(chain.acquire_next_image(0), Err(Error::NotReady));

    setup.conn.server().complete_mode = Some(CompleteMode::Copy);
    chain.queue_present(image.index, 0, &[]).unwrap();
    let image = chain.acquire_next_image(SECOND).unwrap();
    assert!(image.suboptimal);
}

#[test]
fn resize_makes_swapchain_out_of_date() {
    let setup = setup();
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(2, PresentMode::Immediate))
        .unwrap();
    let image = chain.acquire_next_image(0).unwrap();

    setup.conn.push_event(PresentEvent::Configure {
        extent: Extent::new(800, 600),
        window_destroyed: false,
    });
    assert_eq!(chain.queue_present(image.index, 0, &[]), Err(Error::OutOfDate));
    assert_eq!(chain.acquire_next_image(0), Err(Error::OutOfDate));
    assert_eq!(chain.current_status(), Err(Error::OutOfDate));
}

#[test]
fn destroyed_window_stops_the_present_thread() {
    let setup = setup();
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(3, PresentMode::Fifo))
        .unwrap();
    setup.conn.push_event(PresentEvent::Configure {
        extent: Extent::new(640, 480),
        window_destroyed: true,
    });

    let image = chain.acquire_next_image(SECOND).unwrap();
    chain.queue_present(image.index, 0, &[]).unwrap();
    assert!(wait_for(|| chain.current_status().is_err()));
    assert_eq!(chain.acquire_next_image(SECOND), Err(Error::SurfaceLost));
    assert_eq!(chain.queue_present(image.index, 0, &[]), Err(Error::SurfaceLost));
}

#[test]
fn extent_mismatch_is_suboptimal() {
    let setup = setup();
    let info = SwapchainCreateInfo::new(3, ColorFormat::B8g8r8a8Srgb, Extent::new(320, 240));
    let chain = setup.wsi.create_swapchain(&setup.surface, &info).unwrap();
    assert_eq!(chain.current_status(), Ok(Outcome::Suboptimal));
    assert!(chain.acquire_next_image(SECOND).unwrap().suboptimal);
}

#[test]
fn damage_is_sent_as_region() {
    let setup = setup();
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(2, PresentMode::Immediate))
        .unwrap();

    let image = chain.acquire_next_image(0).unwrap();
    chain
        .queue_present(image.index, 0, &[Rect::new(10, 10, 20, 20), Rect::new(600, 400, 100, 100)])
        .unwrap();
    let request = setup.conn.requests()[0];
    let region = request.update.expect("No update region");
    assert_eq!(
        setup.conn.server().regions[&region],
        vec![Rect::new(10, 10, 20, 20), Rect::new(600, 400, 40, 80)]
    );

    let image = chain.acquire_next_image(0).unwrap();
    chain.queue_present(image.index, 0, &[]).unwrap();
    assert_eq!(setup.conn.requests()[1].update, None);
}

#[test]
fn other_gpu_uses_prime_images() {
    let mut conn = MockX11::new(dri3_caps());
    conn.device = Some(makedev(226, 129));
    let setup = setup_with(conn, dmabuf_device(), WsiOptions::default());
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(3, PresentMode::Fifo))
        .unwrap();
    assert!(chain.images().iter().all(|image| image.is_prime()));

    let setup = self::setup();
    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(3, PresentMode::Fifo))
        .unwrap();
    assert!(chain.images().iter().all(|image| !image.is_prime()));
}

#[test]
fn shared_memory_without_dri3() {
    let caps = ConnectionCaps {
        dri3: None,
        present: Some((1, 2)),
        ..dri3_caps()
    };
    let setup = setup_with(MockX11::new(caps), HostDevice::new(), WsiOptions::default());
    assert_eq!(setup.wsi.get_support(&setup.surface, 0), Ok(true));

    let chain = setup
        .wsi
        .create_swapchain(&setup.surface, &create_info(3, PresentMode::Fifo))
        .unwrap();
    assert!(chain.images().iter().all(|image| image.shm().is_some()));
    assert_eq!(setup.conn.server().shm_pixmaps, 3);

    let image = chain.acquire_next_image(SECOND).unwrap();
    chain.queue_present(image.index, 0, &[]).unwrap();
    drop(chain);
    assert!(setup.conn.server().live.is_empty());
}

#[test]
fn no_usable_path_is_unsupported() {
    let caps = ConnectionCaps {
        dri3: None,
        mit_shm: false,
        ..dri3_caps()
    };
    let setup = setup_with(MockX11::new(caps), HostDevice::new(), WsiOptions::default());
    assert_eq!(setup.wsi.get_support(&setup.surface, 0), Ok(false));
    assert_eq!(
        setup
            .wsi
            .create_swapchain(&setup.surface, &create_info(3, PresentMode::Fifo))
            .unwrap_err(),
        Error::InitializationFailed
    );
}

#[test]
fn unsupported_modifiers_fail_allocation() {
    let mut conn = MockX11::new(dri3_caps());
    conn.modifiers = vec![vec![Modifier::I915_y_tiled]];
    let device = HostDevice::builder()
        .external_memory(ExternalMemoryTypes::DMA_BUF | ExternalMemoryTypes::SHM)
        .render_node(makedev(226, 128))
        .modifier(Fourcc::Argb8888, Modifier::Linear, 1)
        .build();
    let setup = setup_with(conn, device, WsiOptions::default());

    assert_eq!(
        setup
            .wsi
            .create_swapchain(&setup.surface, &create_info(3, PresentMode::Fifo))
            .unwrap_err(),
        Error::OutOfHostMemory
    );
    let server = setup.conn.server();
    assert!(server.live.is_empty());
    assert!(server.event_contexts.is_empty());
}

#[test]
fn capabilities_follow_the_window() {
    let setup = setup();
    let caps = setup.wsi.get_capabilities(&setup.surface).unwrap();
    assert_eq!(caps.min_image_count, 3);
    assert_eq!(caps.current_extent, Extent::new(640, 480));
    assert_eq!(caps.supported_composite_alpha, CompositeAlpha::INHERIT | CompositeAlpha::OPAQUE);

    let formats = setup.wsi.get_formats2(&setup.surface).unwrap();
    assert_eq!(formats[0].surface_format.format, ColorFormat::B8g8r8a8Srgb);
    assert!(formats.iter().all(|format| format.drm_format == Fourcc::Xrgb8888));

    let mut conn = MockX11::new(dri3_caps());
    conn.geometry.depth = 32;
    let setup = setup_with(conn, dmabuf_device(), WsiOptions::default());
    let caps = setup.wsi.get_capabilities(&setup.surface).unwrap();
    assert_eq!(
        caps.supported_composite_alpha,
        CompositeAlpha::INHERIT | CompositeAlpha::PRE_MULTIPLIED
    );
    let formats = setup.wsi.get_formats2(&setup.surface).unwrap();
    assert!(formats.iter().all(|format| format.drm_format == Fourcc::Argb8888));
}

#[test]
fn unknown_window_has_undefined_extent() {
    let conn = Arc::new(MockX11::new(dri3_caps()));
    let surface: Surface = X11Surface::new(conn, WINDOW + 1).into();
    let wsi = Wsi::with_options(Arc::new(dmabuf_device()), WsiOptions::default());
    let caps = wsi.get_capabilities(&surface).unwrap();
    assert!(caps.current_extent.is_undefined());
    assert_eq!(caps.min_image_extent, Extent::new(1, 1));
    assert_eq!(wsi.get_support(&surface, 0), Ok(false));
}

#[test]
fn image_count_rules() {
    let options = WsiOptions::default();
    assert_eq!(image_count(&options, 2, PresentMode::Fifo, false), 2);
    assert_eq!(image_count(&options, 2, PresentMode::Mailbox, false), 5);
    assert_eq!(image_count(&options, 2, PresentMode::Immediate, true), 5);
    assert_eq!(image_count(&options, 2, PresentMode::Fifo, true), 2);

    let strict = WsiOptions {
        x11_strict_image_count: true,
        ..WsiOptions::default()
    };
    assert_eq!(image_count(&strict, 2, PresentMode::Mailbox, true), 2);

    let ensure = WsiOptions {
        x11_ensure_min_image_count: true,
        x11_override_min_image_count: Some(4),
        ..WsiOptions::default()
    };
    assert_eq!(image_count(&ensure, 2, PresentMode::Fifo, false), 4);
}
