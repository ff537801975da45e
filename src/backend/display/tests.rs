use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use super::{
    kms::{
        ConnectorId, ConnectorInfo, ConnectorState, CrtcId, CrtcInfo, EncoderId, EncoderInfo, FramebufferId,
        KmsDevice, KmsEvent, ModeInfo, PropertyId, Resources, MODE_TYPE_PREFERRED,
    },
    AccessError, DeviceEvent, DisplayError, DisplayEvent, DisplayModeParameters, DisplayOptions,
    DisplayPowerState, DisplaySurface, DisplayWsi,
};
use crate::{
    backend::allocator::{dmabuf::Dmabuf, format::ColorFormat, Fourcc},
    config::WsiOptions,
    device::{host::HostDevice, ExternalMemoryTypes},
    image::ImageState,
    surface::{Surface, SurfaceCounters, SwapchainCreateInfo, Wsi},
    swapchain::Swapchain,
    utils::{Extent, Rect},
    Error,
};
use rustix::fs::makedev;

const CONNECTOR: ConnectorId = ConnectorId(1);
const ENCODER: EncoderId = EncoderId(20);
const CRTC: CrtcId = CrtcId(10);
const DPMS: PropertyId = PropertyId(30);

pub(crate) fn mode(width: u16, height: u16, preferred: bool) -> ModeInfo {
    ModeInfo {
        clock: width as u32 * height as u32 * 60 / 1000,
        hdisplay: width,
        hsync_start: width,
        hsync_end: width,
        htotal: width,
        vdisplay: height,
        vsync_start: height,
        vsync_end: height,
        vtotal: height,
        vrefresh: 60,
        mode_type: if preferred { MODE_TYPE_PREFERRED } else { 0 },
        name: format!("{}x{}", width, height),
        ..ModeInfo::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    PageFlip(FramebufferId),
    SetCrtc(FramebufferId),
    HideCursor,
    Property(PropertyId, u64),
}

#[derive(Debug, Default)]
struct MockState {
    master: bool,
    connectors: HashMap<ConnectorId, ConnectorInfo>,
    encoder_crtc: Option<CrtcId>,
    scanout: Option<FramebufferId>,
    next_fb: u32,
    framebuffers: Vec<FramebufferId>,
    flip_errors: VecDeque<i32>,
    set_crtc_errors: VecDeque<i32>,
    pending: Vec<CrtcId>,
    vblank_errors: VecDeque<i32>,
    vblanks: Vec<(CrtcId, u64)>,
    ready: Vec<KmsEvent>,
    calls: Vec<Call>,
    sequence: u64,
}

/// Kms device with one connector, one encoder and one crtc
#[derive(Debug)]
pub(crate) struct MockKms {
    state: Mutex<MockState>,
    events: Condvar,
}

fn errno(errno: i32) -> DisplayError {
    DisplayError::Access(AccessError {
        errmsg: "mock",
        dev: None,
        source: io::Error::from_raw_os_error(errno),
    })
}

impl MockKms {
    pub fn new() -> MockKms {
        let mut connectors = HashMap::new();
        connectors.insert(
            CONNECTOR,
            ConnectorInfo {
                id: CONNECTOR,
                name: "DP-1".into(),
                state: ConnectorState::Connected,
                encoder: Some(ENCODER),
                modes: vec![mode(1920, 1080, true), mode(1280, 720, false)],
                dpms_property: Some(DPMS),
            },
        );
        MockKms {
            state: Mutex::new(MockState {
                master: true,
                connectors,
                sequence: 1000,
                ..MockState::default()
            }),
            events: Condvar::new(),
        }
    }

    pub fn set_master(&self, master: bool) {
        self.state.lock().unwrap().master = master;
    }

    pub fn set_modes(&self, id: ConnectorId, modes: Vec<ModeInfo>) {
        self.state.lock().unwrap().connectors.get_mut(&id).unwrap().modes = modes;
    }

    pub fn set_state(&self, id: ConnectorId, state: ConnectorState) {
        self.state.lock().unwrap().connectors.get_mut(&id).unwrap().state = state;
    }

    pub fn fail_flips(&self, errno: i32, count: usize) {
        self.state.lock().unwrap().flip_errors.extend(std::iter::repeat(errno).take(count));
    }

    pub fn fail_set_crtc(&self, errno: i32, count: usize) {
        self.state
            .lock()
            .unwrap()
            .set_crtc_errors
            .extend(std::iter::repeat(errno).take(count));
    }

    /// Completes every scheduled flip
    pub fn complete_flips(&self) {
        let mut state = self.state.lock().unwrap();
        let pending = std::mem::take(&mut state.pending);
        for crtc in pending {
            state.sequence += 1;
            let sequence = state.sequence as u32;
            state.ready.push(KmsEvent::PageFlip {
                crtc,
                sequence,
                time: Duration::ZERO,
            });
        }
        self.events.notify_all();
    }

    pub fn fail_vblanks(&self, errno: i32, count: usize) {
        self.state
            .lock()
            .unwrap()
            .vblank_errors
            .extend(std::iter::repeat(errno).take(count));
    }

    /// Delivers every requested vblank event
    pub fn deliver_vblanks(&self) {
        let mut state = self.state.lock().unwrap();
        state.sequence += 1;
        let sequence = state.sequence as u32;
        let vblanks = std::mem::take(&mut state.vblanks);
        for (crtc, user_data) in vblanks {
            state.ready.push(KmsEvent::Vblank {
                crtc,
                sequence,
                user_data,
            });
        }
        self.events.notify_all();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.lock().unwrap().framebuffers.len()
    }
}

impl KmsDevice for MockKms {
    fn is_master(&self) -> bool {
        self.state.lock().unwrap().master
    }

    fn dev_id(&self) -> Option<u64> {
        Some(0xe200)
    }

    fn resources(&self) -> Result<Resources, DisplayError> {
        Ok(Resources {
            connectors: vec![CONNECTOR],
            encoders: vec![ENCODER],
            crtcs: vec![CRTC],
        })
    }

    fn connector(&self, id: ConnectorId, _rescan: bool) -> Result<ConnectorInfo, DisplayError> {
        let state = self.state.lock().unwrap();
        state.connectors.get(&id).cloned().ok_or_else(|| errno(libc::ENOENT))
    }

    fn encoder(&self, id: EncoderId) -> Result<EncoderInfo, DisplayError> {
        Ok(EncoderInfo {
            id,
            crtc: self.state.lock().unwrap().encoder_crtc,
        })
    }

    fn crtc(&self, id: CrtcId) -> Result<CrtcInfo, DisplayError> {
        Ok(CrtcInfo {
            id,
            framebuffer: self.state.lock().unwrap().scanout,
        })
    }

    fn add_framebuffer(&self, _dmabuf: &Dmabuf, format: Fourcc) -> Result<FramebufferId, DisplayError> {
        assert_eq!(format, Fourcc::Xrgb8888);
        let mut state = self.state.lock().unwrap();
        state.next_fb += 1;
        let fb = FramebufferId(100 + state.next_fb);
        state.framebuffers.push(fb);
        Ok(fb)
    }

    fn remove_framebuffer(&self, framebuffer: FramebufferId) -> Result<(), DisplayError> {
        let mut state = self.state.lock().unwrap();
        let before = state.framebuffers.len();
        state.framebuffers.retain(|fb| *fb != framebuffer);
        if state.framebuffers.len() == before {
            return Err(errno(libc::ENOENT));
        }
        Ok(())
    }

    fn page_flip(&self, crtc: CrtcId, framebuffer: FramebufferId) -> Result<(), DisplayError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.flip_errors.pop_front() {
            return Err(errno(err));
        }
        state.pending.push(crtc);
        state.calls.push(Call::PageFlip(framebuffer));
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc: CrtcId,
        framebuffer: FramebufferId,
        _connector: ConnectorId,
        _mode: &ModeInfo,
    ) -> Result<(), DisplayError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.set_crtc_errors.pop_front() {
            return Err(errno(err));
        }
        state.encoder_crtc = Some(crtc);
        state.scanout = Some(framebuffer);
        state.calls.push(Call::SetCrtc(framebuffer));
        Ok(())
    }

    fn hide_cursor(&self, _crtc: CrtcId) -> Result<(), DisplayError> {
        self.state.lock().unwrap().calls.push(Call::HideCursor);
        Ok(())
    }

    fn set_connector_property(
        &self,
        _connector: ConnectorId,
        property: PropertyId,
        value: u64,
    ) -> Result<(), DisplayError> {
        self.state.lock().unwrap().calls.push(Call::Property(property, value));
        Ok(())
    }

    fn crtc_sequence(&self, _crtc: CrtcId) -> Result<u64, DisplayError> {
        Ok(self.state.lock().unwrap().sequence)
    }

    fn queue_vblank_event(&self, crtc: CrtcId, user_data: u64) -> Result<(), DisplayError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.vblank_errors.pop_front() {
            return Err(errno(err));
        }
        state.vblanks.push((crtc, user_data));
        Ok(())
    }

    fn wait_events(&self, timeout: Duration) -> Result<Vec<KmsEvent>, DisplayError> {
        let mut state = self.state.lock().unwrap();
        if state.ready.is_empty() {
            state = self.events.wait_timeout(state, timeout).unwrap().0;
        }
        Ok(std::mem::take(&mut state.ready))
    }
}

struct Setup {
    kms: Arc<MockKms>,
    display: DisplayWsi,
    wsi: Wsi,
    surface: Surface,
}

fn options() -> DisplayOptions {
    DisplayOptions {
        access_retry_interval: Duration::from_millis(5),
        access_retries: 3,
        event_poll_interval: Duration::from_millis(10),
    }
}

fn setup() -> Setup {
    setup_with_render_node(None)
}

fn setup_with_render_node(render_node: Option<u64>) -> Setup {
    crate::utils::test_logging();
    let kms = Arc::new(MockKms::new());
    let display = DisplayWsi::with_options(kms.clone(), options());
    let monitor = display.displays().unwrap().remove(0);
    let mode = display.display_modes(monitor.display).unwrap()[0].mode;
    let surface = DisplaySurface::new(&display, mode, 0, monitor.physical_resolution).into();
    let mut builder = HostDevice::builder().external_memory(ExternalMemoryTypes::DMA_BUF | ExternalMemoryTypes::SHM);
    if let Some(render_node) = render_node {
        builder = builder.render_node(render_node);
    }
    let device = builder.build();
    let wsi = Wsi::with_options(Arc::new(device), WsiOptions::default());
    Setup {
        kms,
        display,
        wsi,
        surface,
    }
}

fn swapchain(setup: &Setup) -> Swapchain {
    let info = SwapchainCreateInfo::new(2, ColorFormat::B8g8r8a8Srgb, Extent::new(1920, 1080));
    setup.wsi.create_swapchain(&setup.surface, &info).unwrap()
}

#[test]
fn lists_connected_displays() {
    let setup = setup();
    let displays = setup.display.displays().unwrap();
    assert_eq!(displays.len(), 1);
    assert_eq!(displays[0].name, "DP-1");
    assert_eq!(displays[0].physical_resolution, Extent::new(1920, 1080));

    let modes = setup.display.display_modes(displays[0].display).unwrap();
    assert_eq!(modes.len(), 2);
    assert_eq!(modes[0].parameters.visible_region, Extent::new(1920, 1080));
    assert_eq!(modes[0].parameters.refresh_rate, 60_000);

    let planes = setup.display.display_planes().unwrap();
    assert_eq!(planes.len(), 1);
    assert_eq!(planes[0].current_display, None);
    assert_eq!(
        setup.display.plane_supported_displays(0).unwrap(),
        vec![displays[0].display]
    );
    assert!(setup.display.plane_supported_displays(1).unwrap().is_empty());

    setup.kms.set_state(CONNECTOR, ConnectorState::Disconnected);
    assert!(setup.display.displays().unwrap().is_empty());
}

#[test]
fn display_mode_lookup_tolerates_rounding() {
    let setup = setup();
    let display = setup.display.displays().unwrap()[0].display;
    let found = setup
        .display
        .create_display_mode(
            display,
            &DisplayModeParameters {
                visible_region: Extent::new(1280, 720),
                refresh_rate: 60_005,
            },
        )
        .unwrap();
    assert_eq!(found, setup.display.display_modes(display).unwrap()[1].mode);

    let missing = setup.display.create_display_mode(
        display,
        &DisplayModeParameters {
            visible_region: Extent::new(1280, 720),
            refresh_rate: 75_000,
        },
    );
    assert_eq!(missing, Err(Error::InitializationFailed));
}

#[test]
fn first_present_sets_the_mode_then_flips() {
    let setup = setup();
    let chain = swapchain(&setup);
    assert_eq!(setup.kms.live_framebuffers(), 2);
    assert_eq!(chain.counter(SurfaceCounters::VBLANK), Ok(0));

    let first = chain.acquire_next_image(0).unwrap();
    chain.queue_present(first.index, 0, &[]).unwrap();
    assert_eq!(chain.image_state(first.index), Some(ImageState::Displaying));
    assert_eq!(setup.kms.calls(), vec![Call::SetCrtc(FramebufferId(101)), Call::HideCursor]);
    assert_eq!(chain.counter(SurfaceCounters::VBLANK), Ok(1000));

    let second = chain.acquire_next_image(0).unwrap();
    assert_ne!(second.index, first.index);
    chain.queue_present(second.index, 0, &[]).unwrap();
    assert_eq!(chain.image_state(second.index), Some(ImageState::Flipping));
    assert_eq!(chain.acquire_next_image(0), Err(Error::NotReady));

    setup.kms.complete_flips();
    let next = chain.acquire_next_image(1_000_000_000).unwrap();
    assert_eq!(next.index, first.index);
    assert_eq!(chain.image_state(second.index), Some(ImageState::Displaying));
}

#[test]
fn rejected_flip_falls_back_to_mode_set() {
    let setup = setup();
    let chain = swapchain(&setup);

    let first = chain.acquire_next_image(0).unwrap().index;
    chain.queue_present(first, 0, &[]).unwrap();
    let second = chain.acquire_next_image(0).unwrap().index;

    setup.kms.fail_flips(libc::EINVAL, 1);
    chain.queue_present(second, 0, &[]).unwrap();
    assert_eq!(chain.image_state(second), Some(ImageState::Displaying));
    assert_eq!(chain.image_state(first), Some(ImageState::Idle));
    // the rejected flip is not recorded, the mode-set follows the first one directly
    let calls = setup.kms.calls();
    assert!(
        calls.ends_with(&[Call::SetCrtc(FramebufferId(100 + second + 1)), Call::HideCursor]),
        "{:?}",
        calls
    );
    assert!(!calls.contains(&Call::PageFlip(FramebufferId(100 + second + 1))));
}

#[test]
fn busy_device_is_retried() {
    let setup = setup();
    let chain = swapchain(&setup);

    let first = chain.acquire_next_image(0).unwrap().index;
    chain.queue_present(first, 0, &[]).unwrap();
    let second = chain.acquire_next_image(0).unwrap().index;

    // the flip is refused, the retry is a mode-set as the crtc is considered inactive
    setup.kms.fail_flips(libc::EACCES, 1);
    chain.queue_present(second, 0, &[]).unwrap();
    assert_eq!(chain.image_state(second), Some(ImageState::Displaying));

    let third = chain.acquire_next_image(0).unwrap().index;
    setup.kms.fail_flips(libc::EACCES, 1);
    setup.kms.fail_set_crtc(libc::EACCES, 10);
    assert_eq!(chain.queue_present(third, 0, &[]), Err(Error::SurfaceLost));
    assert_eq!(chain.image_state(third), Some(ImageState::Idle));
    assert_eq!(chain.acquire_next_image(0), Err(Error::SurfaceLost));
}

#[test]
fn lost_display_is_sticky() {
    let setup = setup();
    let chain = swapchain(&setup);

    let first = chain.acquire_next_image(0).unwrap().index;
    chain.queue_present(first, 0, &[]).unwrap();
    let second = chain.acquire_next_image(0).unwrap().index;

    setup.kms.fail_flips(libc::ENODEV, 1);
    assert_eq!(chain.queue_present(second, 0, &[]), Err(Error::SurfaceLost));
    assert_eq!(chain.image_state(second), Some(ImageState::Idle));
    assert_eq!(chain.acquire_next_image(0), Err(Error::SurfaceLost));
    assert_eq!(chain.queue_present(second, 0, &[]), Err(Error::SurfaceLost));
}

#[test]
fn unsupported_format_is_device_lost() {
    let setup = setup();
    let info = SwapchainCreateInfo::new(2, ColorFormat::R16g16b16a16Sfloat, Extent::new(64, 64));
    assert_eq!(
        setup.wsi.create_swapchain(&setup.surface, &info).err(),
        Some(Error::DeviceLost)
    );
    assert_eq!(setup.kms.live_framebuffers(), 0);
}

#[test]
fn destroy_removes_framebuffers() {
    let setup = setup();
    let chain = swapchain(&setup);
    let index = chain.acquire_next_image(0).unwrap().index;
    chain.queue_present(index, 0, &[]).unwrap();
    chain.destroy();
    assert_eq!(setup.kms.live_framebuffers(), 0);
}

#[test]
fn released_device() {
    let kms = Arc::new(MockKms::new());
    kms.set_master(false);
    let display = DisplayWsi::with_options(kms.clone(), options());
    assert!(display.is_released());
    assert!(display.displays().unwrap().is_empty());
    assert_eq!(display.acquire(), Err(Error::InitializationFailed));

    kms.set_master(true);
    display.acquire().unwrap();
    let monitor = display.displays().unwrap().remove(0);
    display
        .set_power_state(monitor.display, DisplayPowerState::Off)
        .unwrap();
    assert_eq!(kms.calls(), vec![Call::Property(DPMS, 3)]);

    display.release();
    assert_eq!(
        display.set_power_state(monitor.display, DisplayPowerState::On),
        Err(Error::InitializationFailed)
    );
}

#[test]
fn present_rectangles_cover_the_mode_on_the_same_gpu() {
    // the mock card is card0, its render node is renderD128
    let setup = setup_with_render_node(Some(makedev(226, 128)));
    assert_eq!(
        setup.wsi.get_present_rectangles(&setup.surface),
        Ok(vec![Rect::from_extent(Extent::new(1920, 1080))])
    );

    let other = setup_with_render_node(Some(makedev(226, 129)));
    assert_eq!(other.wsi.get_present_rectangles(&other.surface), Ok(Vec::new()));
    let unknown = setup_with_render_node(None);
    assert_eq!(unknown.wsi.get_present_rectangles(&unknown.surface), Ok(Vec::new()));
}

#[test]
fn modes_gone_after_a_rescan_are_lost() {
    let setup = setup();
    assert!(setup.wsi.get_capabilities(&setup.surface).is_ok());

    setup.kms.set_modes(CONNECTOR, vec![mode(1280, 720, false)]);
    setup.display.displays().unwrap();
    assert_eq!(
        setup.wsi.get_capabilities(&setup.surface).map(|_| ()),
        Err(Error::SurfaceLost)
    );
}

#[test]
fn first_pixel_out_fence() {
    let setup = setup();
    let display = setup.display.displays().unwrap()[0].display;

    // nothing drives the display yet
    assert_eq!(
        setup
            .display
            .register_display_event(display, DisplayEvent::FirstPixelOut)
            .map(|_| ()),
        Err(Error::OutOfHostMemory)
    );

    let chain = swapchain(&setup);
    let index = chain.acquire_next_image(0).unwrap().index;
    chain.queue_present(index, 0, &[]).unwrap();

    let fence = setup
        .display
        .register_display_event(display, DisplayEvent::FirstPixelOut)
        .unwrap();
    assert!(!fence.is_signalled());
    assert_eq!(fence.wait(0), Err(Error::NotReady));
    assert_eq!(fence.wait(10_000_000), Err(Error::Timeout));

    setup.kms.deliver_vblanks();
    assert_eq!(fence.wait(5_000_000_000), Ok(()));
    assert!(fence.is_signalled());

    // an event for a destroyed fence is dropped
    let dropped = setup
        .display
        .register_display_event(display, DisplayEvent::FirstPixelOut)
        .unwrap();
    drop(dropped);
    setup.kms.deliver_vblanks();
    let next = setup
        .display
        .register_display_event(display, DisplayEvent::FirstPixelOut)
        .unwrap();
    setup.kms.deliver_vblanks();
    assert_eq!(next.wait(5_000_000_000), Ok(()));
}

#[test]
fn full_vblank_queue_fails_the_fence() {
    let setup = setup();
    let chain = swapchain(&setup);
    let index = chain.acquire_next_image(0).unwrap().index;
    chain.queue_present(index, 0, &[]).unwrap();
    let display = setup.display.displays().unwrap()[0].display;

    setup.kms.fail_vblanks(libc::ENOMEM, 1);
    assert_eq!(
        setup
            .display
            .register_display_event(display, DisplayEvent::FirstPixelOut)
            .map(|_| ()),
        Err(Error::OutOfHostMemory)
    );

    setup.kms.fail_vblanks(libc::EINVAL, 1);
    assert_eq!(
        setup
            .display
            .register_display_event(display, DisplayEvent::FirstPixelOut)
            .map(|_| ()),
        Err(Error::OutOfHostMemory)
    );
    assert!(setup
        .display
        .register_display_event(display, DisplayEvent::FirstPixelOut)
        .is_ok());
}

#[test]
fn device_events_are_not_supported() {
    let setup = setup();
    assert_eq!(
        setup
            .display
            .register_device_event(DeviceEvent::DisplayHotplug)
            .map(|_| ()),
        Err(Error::FeatureNotPresent)
    );
}
