use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::{DibId, GdiTarget, Win32Error, Win32Surface};
use crate::{
    backend::allocator::{format::ColorFormat, Fourcc, MappedImage},
    config::WsiOptions,
    device::host::HostDevice,
    image::ImageState,
    status::Outcome,
    surface::{PresentMode, Surface, SwapchainCreateInfo, Wsi},
    utils::{Extent, Rect},
    Error,
};

#[derive(Debug)]
struct Window {
    client: Extent,
    destroyed: bool,
    next_id: DibId,
    dibs: HashMap<DibId, (Extent, Vec<u8>)>,
    blits: Vec<(DibId, Extent, Extent)>,
    dib_limit: Option<usize>,
}

#[derive(Debug)]
struct MockGdi {
    window: Mutex<Window>,
}

impl MockGdi {
    fn new(client: Extent) -> MockGdi {
        MockGdi {
            window: Mutex::new(Window {
                client,
                destroyed: false,
                next_id: 0,
                dibs: HashMap::new(),
                blits: Vec::new(),
                dib_limit: None,
            }),
        }
    }

    fn window(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap()
    }
}

impl GdiTarget for MockGdi {
    fn client_extent(&self) -> Result<Extent, Win32Error> {
        let window = self.window();
        if window.destroyed {
            return Err(Win32Error::WindowDestroyed);
        }
        Ok(window.client)
    }

    fn create_dib(&self, extent: Extent) -> Result<DibId, Win32Error> {
        let mut window = self.window();
        if window.dib_limit == Some(window.dibs.len()) {
            return Err(Win32Error::OutOfResources("CreateDIBSection"));
        }
        window.next_id += 1;
        let id = window.next_id;
        let size = extent.width as usize * extent.height as usize * 4;
        window.dibs.insert(id, (extent, vec![0; size]));
        Ok(id)
    }

    fn upload(&self, dib: DibId, image: &MappedImage<'_>) -> Result<(), Win32Error> {
        let mut window = self.window();
        let (extent, bits) = window.dibs.get_mut(&dib).expect("upload to unknown dib");
        assert_eq!(*extent, image.extent());
        let stride = extent.width as usize * 4;
        for y in 0..extent.height {
            let start = y as usize * stride;
            bits[start..start + stride].copy_from_slice(image.row(y));
        }
        Ok(())
    }

    fn stretch_blt(&self, dib: DibId, src: Extent, dst: Extent) -> Result<(), Win32Error> {
        let mut window = self.window();
        assert!(window.dibs.contains_key(&dib));
        window.blits.push((dib, src, dst));
        Ok(())
    }

    fn destroy_dib(&self, dib: DibId) {
        self.window().dibs.remove(&dib);
    }
}

struct Setup {
    gdi: Arc<MockGdi>,
    wsi: Wsi,
    surface: Surface,
}

fn setup() -> Setup {
    crate::utils::test_logging();
    let gdi = Arc::new(MockGdi::new(Extent::new(64, 48)));
    let surface = Win32Surface::new(gdi.clone()).into();
    let wsi = Wsi::with_options(Arc::new(HostDevice::new()), WsiOptions::default());
    Setup { gdi, wsi, surface }
}

fn create_info(count: u32) -> SwapchainCreateInfo<'static> {
    SwapchainCreateInfo::new(count, ColorFormat::B8g8r8a8Unorm, Extent::new(64, 48))
}

#[test]
fn capabilities_follow_the_client_area() {
    let setup = setup();
    assert_eq!(setup.wsi.get_support(&setup.surface, 0), Ok(true));

    let caps = setup.wsi.get_capabilities(&setup.surface).unwrap();
    assert_eq!(caps.min_image_count, 1);
    assert_eq!(caps.current_extent, Extent::new(64, 48));

    let formats = setup.wsi.get_formats2(&setup.surface).unwrap();
    assert!(!formats.is_empty());
    assert!(formats.iter().all(|format| format.drm_format == Fourcc::Xrgb8888));
    assert_eq!(setup.wsi.get_present_modes(&setup.surface), Ok(vec![PresentMode::Fifo]));
    assert_eq!(
        setup.wsi.get_present_rectangles(&setup.surface),
        Ok(vec![Rect::new(0, 0, 64, 48)])
    );

    setup.gdi.window().destroyed = true;
    assert_eq!(setup.wsi.get_support(&setup.surface, 0), Ok(false));
    assert_eq!(
        setup.wsi.get_capabilities(&setup.surface).unwrap().current_extent,
        Extent::UNDEFINED
    );
    assert_eq!(setup.wsi.get_present_rectangles(&setup.surface), Err(Error::SurfaceLost));
}

#[test]
fn present_copies_the_pixels() {
    let setup = setup();
    let chain = setup.wsi.create_swapchain(&setup.surface, &create_info(2)).unwrap();
    assert_eq!(setup.gdi.window().dibs.len(), 2);

    let index = chain.acquire_next_image(0).unwrap().index;
    {
        let mut mapped = chain.image(index).unwrap().map().unwrap();
        let pitch = mapped.row_pitch();
        mapped.as_bytes_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        mapped.as_bytes_mut()[pitch..pitch + 4].copy_from_slice(&[5, 6, 7, 8]);
    }
    assert_eq!(chain.queue_present(index, 0, &[]), Ok(Outcome::Optimal));
    assert_eq!(chain.image_state(index), Some(ImageState::Displaying));

    let window = setup.gdi.window();
    let (dib, src, dst) = window.blits[0];
    assert_eq!((src, dst), (Extent::new(64, 48), Extent::new(64, 48)));
    let bits = &window.dibs[&dib].1;
    assert_eq!(&bits[..4], &[1, 2, 3, 4]);
    assert_eq!(&bits[64 * 4..64 * 4 + 4], &[5, 6, 7, 8]);
}

#[test]
fn single_image_is_reused_after_present() {
    let setup = setup();
    let chain = setup.wsi.create_swapchain(&setup.surface, &create_info(1)).unwrap();

    let index = chain.acquire_next_image(0).unwrap().index;
    assert_eq!(chain.acquire_next_image(0), Err(Error::NotReady));
    assert_eq!(chain.acquire_next_image(1), Err(Error::Timeout));

    for _ in 0..3 {
        chain.queue_present(index, 0, &[]).unwrap();
        assert_eq!(chain.image_state(index), Some(ImageState::Displaying));
        assert_eq!(chain.acquire_next_image(0).unwrap().index, index);
    }
    assert_eq!(setup.gdi.window().blits.len(), 3);
}

#[test]
fn idle_images_come_before_the_front_buffer() {
    let setup = setup();
    let chain = setup.wsi.create_swapchain(&setup.surface, &create_info(3)).unwrap();

    for _ in 0..9 {
        let index = chain.acquire_next_image(0).unwrap().index;
        chain.queue_present(index, 0, &[]).unwrap();
        let states = (0..3).filter_map(|i| chain.image_state(i)).collect::<Vec<_>>();
        assert_eq!(states.iter().filter(|s| **s == ImageState::Displaying).count(), 1);
        assert_eq!(states.iter().filter(|s| **s == ImageState::Idle).count(), 2);
    }
    let front = (0..3)
        .find(|i| chain.image_state(*i) == Some(ImageState::Displaying))
        .unwrap();
    assert_ne!(chain.acquire_next_image(0).unwrap().index, front);
    assert_ne!(chain.acquire_next_image(0).unwrap().index, front);
    assert_eq!(chain.acquire_next_image(0).unwrap().index, front);
    assert_eq!(chain.acquire_next_image(0), Err(Error::NotReady));
}

#[test]
fn resized_window_is_suboptimal() {
    let setup = setup();
    let chain = setup.wsi.create_swapchain(&setup.surface, &create_info(2)).unwrap();

    setup.gdi.window().client = Extent::new(128, 96);
    let index = chain.acquire_next_image(0).unwrap().index;
    assert_eq!(chain.queue_present(index, 0, &[]), Ok(Outcome::Suboptimal));
    assert_eq!(
        setup.gdi.window().blits.last().map(|blit| blit.2),
        Some(Extent::new(128, 96))
    );

    setup.gdi.window().client = Extent::new(64, 48);
    let acquired = chain.acquire_next_image(0).unwrap();
    assert!(acquired.suboptimal);
    assert_eq!(chain.queue_present(acquired.index, 0, &[]), Ok(Outcome::Suboptimal));
}

#[test]
fn mismatched_swapchain_starts_suboptimal() {
    let setup = setup();
    let info = SwapchainCreateInfo::new(2, ColorFormat::B8g8r8a8Unorm, Extent::new(32, 32));
    let chain = setup.wsi.create_swapchain(&setup.surface, &info).unwrap();
    assert_eq!(chain.current_status(), Ok(Outcome::Suboptimal));
    assert!(chain.acquire_next_image(0).unwrap().suboptimal);
}

#[test]
fn destroyed_window_is_lost() {
    let setup = setup();
    let chain = setup.wsi.create_swapchain(&setup.surface, &create_info(2)).unwrap();

    let index = chain.acquire_next_image(0).unwrap().index;
    setup.gdi.window().destroyed = true;
    assert_eq!(chain.queue_present(index, 0, &[]), Err(Error::SurfaceLost));
    assert_eq!(chain.image_state(index), Some(ImageState::Idle));
    assert_eq!(chain.acquire_next_image(0), Err(Error::SurfaceLost));
    assert!(setup.gdi.window().blits.is_empty());
}

#[test]
fn dibs_are_released() {
    let setup = setup();
    let chain = setup.wsi.create_swapchain(&setup.surface, &create_info(3)).unwrap();
    assert_eq!(setup.gdi.window().dibs.len(), 3);
    chain.destroy();
    assert!(setup.gdi.window().dibs.is_empty());

    setup.gdi.window().dib_limit = Some(2);
    assert_eq!(
        setup
            .wsi
            .create_swapchain(&setup.surface, &create_info(3))
            .map(|_| ()),
        Err(Error::OutOfHostMemory)
    );
    assert!(setup.gdi.window().dibs.is_empty());
}
