mod common;

use std::sync::Arc;

use common::{init_logging, CountingSink};
use wsi::{
    backend::{
        allocator::{create_native_image, format::ColorFormat, Fourcc, ImageParams, Modifier},
        software::SoftwareSurface,
    },
    device::{host::HostDevice, Device, ExternalMemoryTypes},
    image::ImageState,
    status::Outcome,
    surface::{PresentMode, Surface, SwapchainCreateInfo, Wsi, DEFAULT_USAGE},
    utils::Extent,
    Error,
};

const EXTENT: Extent = Extent::new(16, 16);

fn setup(sink: &Arc<CountingSink>) -> (Wsi, Surface) {
    init_logging();
    let surface = SoftwareSurface::new(sink.clone()).into();
    let wsi = Wsi::new(Arc::new(HostDevice::new()));
    (wsi, surface)
}

fn info(count: u32) -> SwapchainCreateInfo<'static> {
    SwapchainCreateInfo::new(count, ColorFormat::B8g8r8a8Unorm, EXTENT).with_present_mode(PresentMode::Immediate)
}

#[test]
fn at_most_one_image_is_displayed() {
    let sink = CountingSink::new(EXTENT);
    let (wsi, surface) = setup(&sink);
    let chain = wsi.create_swapchain(&surface, &info(3)).unwrap();

    for _ in 0..10 {
        let index = chain.acquire_next_image(0).unwrap().index;
        chain.queue_present(index, 0, &[]).unwrap();
        let displaying = (0..3)
            .filter(|i| chain.image_state(*i) == Some(ImageState::Displaying))
            .count();
        assert_eq!(displaying, 1);
    }
    assert_eq!(*sink.puts.lock().unwrap(), 10);
}

#[test]
fn terminal_errors_stick() {
    let sink = CountingSink::new(EXTENT);
    let (wsi, surface) = setup(&sink);
    let chain = wsi.create_swapchain(&surface, &info(2)).unwrap();

    let index = chain.acquire_next_image(0).unwrap().index;
    *sink.lost.lock().unwrap() = true;
    assert_eq!(chain.queue_present(index, 0, &[]), Err(Error::SurfaceLost));

    // the target coming back does not revive the swapchain
    *sink.lost.lock().unwrap() = false;
    for _ in 0..3 {
        assert_eq!(chain.acquire_next_image(0), Err(Error::SurfaceLost));
        assert_eq!(chain.queue_present(index, 0, &[]), Err(Error::SurfaceLost));
        assert_eq!(chain.current_status(), Err(Error::SurfaceLost));
    }
    assert_eq!(*sink.puts.lock().unwrap(), 0);
}

#[test]
fn misused_presents_do_not_stick() {
    let sink = CountingSink::new(EXTENT);
    let (wsi, surface) = setup(&sink);
    let chain = wsi.create_swapchain(&surface, &info(2)).unwrap();

    assert_eq!(chain.queue_present(2, 0, &[]), Err(Error::Unknown));
    assert_eq!(chain.current_status(), Ok(Outcome::Optimal));

    let index = chain.acquire_next_image(0).unwrap().index;
    chain.queue_present(index, 0, &[]).unwrap();
    assert_eq!(chain.queue_present(index, 0, &[]), Err(Error::Unknown));
    assert_eq!(chain.current_status(), Ok(Outcome::Optimal));
    assert_eq!(*sink.puts.lock().unwrap(), 1);

    let index = chain.acquire_next_image(0).unwrap().index;
    assert_eq!(chain.queue_present(index, 0, &[]), Ok(Outcome::Optimal));
}

#[test]
fn suboptimal_sticks() {
    let sink = CountingSink::new(EXTENT);
    let (wsi, surface) = setup(&sink);
    let chain = wsi.create_swapchain(&surface, &info(2)).unwrap();

    *sink.extent.lock().unwrap() = Extent::new(32, 32);
    let index = chain.acquire_next_image(0).unwrap().index;
    assert_eq!(chain.queue_present(index, 0, &[]), Ok(Outcome::Suboptimal));

    *sink.extent.lock().unwrap() = EXTENT;
    for _ in 0..3 {
        let image = chain.acquire_next_image(0).unwrap();
        assert!(image.suboptimal);
        assert_eq!(chain.queue_present(image.index, 0, &[]), Ok(Outcome::Suboptimal));
    }
}

#[test]
fn unsupported_modifiers_fail_allocation() {
    init_logging();
    let host = Arc::new(
        HostDevice::builder()
            .external_memory(ExternalMemoryTypes::DMA_BUF)
            .modifier(Fourcc::Argb8888, Modifier::I915_y_tiled, 1)
            .build(),
    );
    let device: Arc<dyn Device> = host.clone();

    let params = ImageParams::new(EXTENT, ColorFormat::B8g8r8a8Unorm, DEFAULT_USAGE)
        .with_modifiers(vec![vec![Modifier::Linear, Modifier::I915_x_tiled]]);
    assert_eq!(
        create_native_image(&device, &params).map(|_| ()),
        Err(Error::OutOfHostMemory)
    );
    assert_eq!(host.live_objects(), 0);

    let params = ImageParams::new(EXTENT, ColorFormat::B8g8r8a8Unorm, DEFAULT_USAGE)
        .with_modifiers(vec![vec![Modifier::Linear, Modifier::I915_y_tiled]]);
    let image = create_native_image(&device, &params).unwrap();
    assert_eq!(image.modifier(), Modifier::I915_y_tiled);
    assert!(image.dmabuf().is_some());
}
