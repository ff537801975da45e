//! Direct presentation to displays through DRM/KMS.
//!
//! A [`DisplayWsi`] wraps a [`KmsDevice`] and exposes the connectors of the device as displays.
//! Applications pick a display and one of its modes, create a [`DisplaySurface`] for it and present
//! to it without any display server involved. Presenting requires DRM master, a device opened
//! without it starts out released and has to be [acquired](DisplayWsi::acquire) first.
//!
//! ### Presentation
//!
//! Images are scanned out with page-flips. At most one flip per swapchain is pending at any time,
//! further presented images wait in the queue until the pending flip completes. A background
//! thread reads the completion events of the device and schedules the next image.
//!
//! If the crtc is not configured for the requested mode yet, or the kernel rejects the flip with
//! `EINVAL`, a full mode-set is done instead. While another session holds the device (`EACCES`),
//! presentation backs off and retries.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use wsi::backend::display::*;
//! # use wsi::utils::Extent;
//! # fn kms() -> Arc<dyn KmsDevice> { unimplemented!() }
//! let display = DisplayWsi::new(kms());
//! let monitor = display.displays()?.into_iter().next().expect("No monitor");
//! let mode = display.display_modes(monitor.display)?[0].mode;
//! let surface = DisplaySurface::new(&display, mode, 0, monitor.physical_resolution);
//! # Ok::<(), wsi::Error>(())
//! ```

#[cfg(feature = "backend_drm")]
mod card;
mod connector;
mod error;
mod event;
pub mod kms;
mod swapchain;
#[cfg(test)]
pub(crate) mod tests;
mod thread;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use tracing::{debug, info, info_span, instrument, warn};

#[cfg(feature = "backend_drm")]
pub use self::card::DrmCard;
pub use self::error::{AccessError, DisplayError};
pub use self::event::{DeviceEvent, DisplayEvent, DisplayEventFence};
pub use self::kms::KmsDevice;
pub use self::swapchain::DisplaySwapchain;

use self::{
    connector::{physical_dimensions, Registry},
    kms::{ConnectorId, ModeInfo},
    swapchain::Chain,
    thread::EventThread,
};
use super::{
    allocator::{format::ColorFormat, Fourcc},
    SurfaceBackend,
};
use crate::{
    surface::{
        CompositeAlpha, PresentMode, SurfaceCapabilities, SurfaceCapabilities2, SurfaceCounters,
        SurfaceFormat2, SurfaceTransforms, Wsi, DEFAULT_USAGE,
    },
    utils::{same_gpu, Extent, Offset, Rect},
    Error,
};

/// Timing of the display backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayOptions {
    /// Time to wait before retrying a flip while another session holds the device
    pub access_retry_interval: Duration,
    /// Number of retries before the display is considered lost
    pub access_retries: u32,
    /// Maximum time the event thread blocks before checking whether it should stop
    pub event_poll_interval: Duration,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        DisplayOptions {
            access_retry_interval: Duration::from_secs(1),
            access_retries: 60,
            event_poll_interval: Duration::from_millis(100),
        }
    }
}

/// A connector able to show images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayHandle(ConnectorId);

impl DisplayHandle {
    /// The connector of the display
    pub fn connector(&self) -> ConnectorId {
        self.0
    }
}

/// A mode of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayModeHandle {
    connector: ConnectorId,
    index: usize,
}

impl DisplayModeHandle {
    /// The display this mode belongs to
    pub fn display(&self) -> DisplayHandle {
        DisplayHandle(self.connector)
    }
}

/// Properties of a display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayProperties {
    /// Handle of the display
    pub display: DisplayHandle,
    /// Name of the connector, like `DP-1`
    pub name: String,
    /// Physical size in millimeters
    pub physical_dimensions: Extent,
    /// Native resolution of the monitor
    pub physical_resolution: Extent,
    /// Supported transformations
    pub supported_transforms: SurfaceTransforms,
    /// Planes of the display can be reordered
    pub plane_reorder_possible: bool,
    /// The display keeps showing its content without refreshes
    pub persistent_content: bool,
}

/// Visible size and refresh rate of a mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayModeParameters {
    /// Visible size
    pub visible_region: Extent,
    /// Refresh rate in mHz
    pub refresh_rate: u32,
}

/// Properties of a display mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayModeProperties {
    /// Handle of the mode
    pub mode: DisplayModeHandle,
    /// Parameters of the mode
    pub parameters: DisplayModeParameters,
}

/// Properties of a display plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayPlaneProperties {
    /// Display currently showing the plane
    pub current_display: Option<DisplayHandle>,
    /// Position in the plane stack
    pub current_stack_index: u32,
}

bitflags::bitflags! {
    /// Alpha modes of a display plane
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DisplayPlaneAlpha: u32 {
        /// Alpha is ignored
        const OPAQUE = 1;
        /// A global alpha value is applied
        const GLOBAL = 2;
        /// Per-pixel alpha, not premultiplied
        const PER_PIXEL = 4;
        /// Per-pixel premultiplied alpha
        const PER_PIXEL_PREMULTIPLIED = 8;
    }
}

/// Limits of a display plane for one mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayPlaneCapabilities {
    /// Supported alpha modes
    pub supported_alpha: DisplayPlaneAlpha,
    /// Smallest source offset
    pub min_src_position: Offset,
    /// Largest source offset
    pub max_src_position: Offset,
    /// Smallest source size
    pub min_src_extent: Extent,
    /// Largest source size
    pub max_src_extent: Extent,
    /// Smallest destination offset
    pub min_dst_position: Offset,
    /// Largest destination offset
    pub max_dst_position: Offset,
    /// Smallest destination size
    pub min_dst_extent: Extent,
    /// Largest destination size
    pub max_dst_extent: Extent,
}

/// Power states of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayPowerState {
    /// The display is off
    Off,
    /// The display is in a low power state and wakes up quickly
    Suspend,
    /// The display is on
    On,
}

impl DisplayPowerState {
    /// Value of the `DPMS` connector property
    pub fn dpms_value(&self) -> u64 {
        match self {
            DisplayPowerState::On => 0,
            DisplayPowerState::Suspend => 2,
            DisplayPowerState::Off => 3,
        }
    }
}

pub(crate) struct DisplayCore {
    pub kms: Arc<dyn KmsDevice>,
    pub state: Mutex<DisplayState>,
    /// Signalled on page-flip completion and on every change of `state` waiters care about
    pub event: Condvar,
    pub options: DisplayOptions,
    pub span: tracing::Span,
}

impl fmt::Debug for DisplayCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayCore")
            .field("kms", &self.kms)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub(crate) struct DisplayState {
    pub released: bool,
    pub registry: Registry,
    pub chains: HashMap<u64, Chain>,
    pub next_chain: u64,
    /// The event thread died, nothing will complete anymore
    pub event_error: bool,
    /// Display event fences and whether their event happened
    pub fences: HashMap<u64, bool>,
    pub next_fence: u64,
}

#[derive(Debug)]
struct DisplayInner {
    core: Arc<DisplayCore>,
    thread: Mutex<Option<EventThread>>,
}

/// Displays of one DRM device
#[derive(Debug, Clone)]
pub struct DisplayWsi {
    inner: Arc<DisplayInner>,
}

impl DisplayWsi {
    /// Wraps `kms` with default timing
    pub fn new(kms: Arc<dyn KmsDevice>) -> DisplayWsi {
        DisplayWsi::with_options(kms, DisplayOptions::default())
    }

    /// Wraps `kms`
    pub fn with_options(kms: Arc<dyn KmsDevice>, options: DisplayOptions) -> DisplayWsi {
        let span = info_span!("backend_display", dev = ?kms.dev_id());
        let released = !kms.is_master();
        if released {
            info!(parent: &span, "Not DRM master, displays cannot be driven until acquired");
        }
        DisplayWsi {
            inner: Arc::new(DisplayInner {
                core: Arc::new(DisplayCore {
                    kms,
                    state: Mutex::new(DisplayState {
                        released,
                        ..DisplayState::default()
                    }),
                    event: Condvar::new(),
                    options,
                    span,
                }),
                thread: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<DisplayCore> {
        &self.inner.core
    }

    /// The wrapped device
    pub fn kms(&self) -> &Arc<dyn KmsDevice> {
        &self.inner.core.kms
    }

    /// Returns true if the device cannot be used for presentation
    pub fn is_released(&self) -> bool {
        self.inner.core.state.lock().unwrap().released
    }

    /// Lists the connected displays, refreshing the connector state.
    #[instrument(level = "debug", parent = &self.inner.core.span, skip(self))]
    pub fn displays(&self) -> Result<Vec<DisplayProperties>, Error> {
        let core = self.core();
        let mut state = core.state.lock().unwrap();
        if state.released {
            return Ok(Vec::new());
        }
        let resources = match core.kms.resources() {
            Ok(resources) => resources,
            Err(err) => {
                warn!(?err, "Failed to read kms resources");
                return Ok(Vec::new());
            }
        };

        let mut displays = Vec::new();
        for id in resources.connectors {
            let connector = state.registry.update(&*core.kms, id).map_err(|err| {
                warn!(?id, ?err, "Failed to read connector");
                Error::OutOfHostMemory
            })?;
            if !connector.connected {
                continue;
            }
            let physical_resolution = connector.physical_resolution();
            displays.push(DisplayProperties {
                display: DisplayHandle(id),
                name: connector.name.clone(),
                physical_dimensions: physical_dimensions(physical_resolution),
                physical_resolution,
                supported_transforms: SurfaceTransforms::IDENTITY,
                plane_reorder_possible: false,
                persistent_content: false,
            });
        }
        Ok(displays)
    }

    /// Lists the planes of the device, one per connector.
    pub fn display_planes(&self) -> Result<Vec<DisplayPlaneProperties>, Error> {
        self.displays()?;
        let state = self.core().state.lock().unwrap();
        Ok(state
            .registry
            .iter()
            .map(|connector| DisplayPlaneProperties {
                current_display: connector.active.then_some(DisplayHandle(connector.id)),
                current_stack_index: 0,
            })
            .collect())
    }

    /// Lists the displays plane `plane_index` can be shown on
    pub fn plane_supported_displays(&self, plane_index: u32) -> Result<Vec<DisplayHandle>, Error> {
        let state = self.core().state.lock().unwrap();
        Ok(state
            .registry
            .iter()
            .enumerate()
            .filter(|(idx, connector)| *idx == plane_index as usize && connector.connected)
            .map(|(_, connector)| DisplayHandle(connector.id))
            .collect())
    }

    /// Lists the modes `display` currently supports
    pub fn display_modes(&self, display: DisplayHandle) -> Result<Vec<DisplayModeProperties>, Error> {
        let state = self.core().state.lock().unwrap();
        let connector = state.registry.get(display.0).ok_or(Error::Unknown)?;
        Ok(connector
            .valid_modes()
            .map(|(index, mode)| DisplayModeProperties {
                mode: DisplayModeHandle {
                    connector: connector.id,
                    index,
                },
                parameters: mode_parameters(&mode.info),
            })
            .collect())
    }

    /// Looks up the mode of `display` matching `parameters`.
    ///
    /// Only modes the monitor offers can be used, the refresh rate has to match within 10 mHz.
    pub fn create_display_mode(
        &self,
        display: DisplayHandle,
        parameters: &DisplayModeParameters,
    ) -> Result<DisplayModeHandle, Error> {
        let state = self.core().state.lock().unwrap();
        let connector = state.registry.get(display.0).ok_or(Error::Unknown)?;
        let found = connector
            .valid_modes()
            .find(|(_, mode)| {
                mode.info.extent() == parameters.visible_region
                    && (mode.info.refresh() * 1000.0 - parameters.refresh_rate as f64).abs() < 10.0
            })
            .map(|(index, _)| DisplayModeHandle {
                connector: connector.id,
                index,
            })
            .ok_or_else(|| {
                debug!(?parameters, "No matching display mode");
                Error::InitializationFailed
            });
        found
    }

    /// Limits of plane `plane_index` when showing `mode`
    pub fn plane_capabilities(
        &self,
        mode: DisplayModeHandle,
        _plane_index: u32,
    ) -> Result<DisplayPlaneCapabilities, Error> {
        let extent = self.mode_info(mode)?.extent();
        Ok(DisplayPlaneCapabilities {
            supported_alpha: DisplayPlaneAlpha::OPAQUE,
            min_src_position: Offset::default(),
            max_src_position: Offset::default(),
            min_src_extent: extent,
            max_src_extent: extent,
            min_dst_position: Offset::default(),
            max_dst_position: Offset::default(),
            min_dst_extent: extent,
            max_dst_extent: extent,
        })
    }

    /// Sets the power state of `display`
    #[instrument(level = "debug", parent = &self.inner.core.span, skip(self, handle, power), fields(display = ?handle))]
    pub fn set_power_state(&self, handle: DisplayHandle, power: DisplayPowerState) -> Result<(), Error> {
        let display = handle;
        let core = self.core();
        let mut state = core.state.lock().unwrap();
        if state.released {
            return Err(Error::InitializationFailed);
        }
        let property = match state.registry.get(display.0).and_then(|c| c.dpms_property) {
            Some(property) => property,
            None => {
                let connector = state.registry.update(&*core.kms, display.0)?;
                match connector.dpms_property {
                    Some(property) => property,
                    None => {
                        warn!("Connector has no DPMS property");
                        return Ok(());
                    }
                }
            }
        };
        core.kms
            .set_connector_property(display.0, property, power.dpms_value())
            .map_err(Error::from)
    }

    /// Takes control of the displays.
    ///
    /// Fails with [`Error::InitializationFailed`] unless the device is DRM master.
    pub fn acquire(&self) -> Result<(), Error> {
        let core = self.core();
        let mut state = core.state.lock().unwrap();
        if !core.kms.is_master() {
            return Err(Error::InitializationFailed);
        }
        if state.released {
            info!(parent: &core.span, "Display device acquired");
        }
        state.released = false;
        state.event_error = false;
        Ok(())
    }

    /// Gives up control of the displays.
    ///
    /// Stops reading events, every swapchain of the device stops presenting.
    pub fn release(&self) {
        let thread = self.inner.thread.lock().unwrap().take();
        drop(thread);

        let core = self.core();
        let mut state = core.state.lock().unwrap();
        state.released = true;
        for connector in state.registry.iter_mut() {
            connector.active = false;
        }
        info!(parent: &core.span, "Display device released");
        core.event.notify_all();
    }

    pub(crate) fn ensure_event_thread(&self) -> Result<(), Error> {
        let mut thread = self.inner.thread.lock().unwrap();
        if thread.as_ref().map(|thread| thread.is_running()).unwrap_or(false) {
            return Ok(());
        }
        *thread = Some(EventThread::spawn(self.core().clone()).map_err(|err| {
            warn!(?err, "Failed to spawn the display event thread");
            Error::OutOfHostMemory
        })?);
        self.core().state.lock().unwrap().event_error = false;
        Ok(())
    }

    fn mode_info(&self, mode: DisplayModeHandle) -> Result<ModeInfo, Error> {
        let state = self.core().state.lock().unwrap();
        state
            .registry
            .get(mode.connector)
            .and_then(|connector| connector.valid_mode(mode.index))
            .map(|mode| mode.info.clone())
            .ok_or(Error::SurfaceLost)
    }
}

fn mode_parameters(mode: &ModeInfo) -> DisplayModeParameters {
    DisplayModeParameters {
        visible_region: mode.extent(),
        refresh_rate: mode.refresh_mhz(),
    }
}

/// A plane of a display showing one mode
#[derive(Debug, Clone)]
pub struct DisplaySurface {
    display: DisplayWsi,
    mode: DisplayModeHandle,
    plane_index: u32,
    image_extent: Extent,
}

impl DisplaySurface {
    /// Creates a surface showing `mode` on plane `plane_index`
    pub fn new(display: &DisplayWsi, mode: DisplayModeHandle, plane_index: u32, image_extent: Extent) -> Self {
        DisplaySurface {
            display: display.clone(),
            mode,
            plane_index,
            image_extent,
        }
    }

    /// The display device of the surface
    pub fn display(&self) -> &DisplayWsi {
        &self.display
    }

    /// The mode the surface is shown in
    pub fn mode(&self) -> DisplayModeHandle {
        self.mode
    }

    /// Plane the surface is shown on
    pub fn plane_index(&self) -> u32 {
        self.plane_index
    }

    /// Size of the images requested for the surface
    pub fn image_extent(&self) -> Extent {
        self.image_extent
    }
}

/// Formats scanned out as `XRGB8888`
const DISPLAY_FORMATS: [ColorFormat; 2] = [ColorFormat::B8g8r8a8Srgb, ColorFormat::B8g8r8a8Unorm];

impl SurfaceBackend for DisplaySurface {
    fn support(&self, _wsi: &Wsi, _queue_family: u32) -> Result<bool, Error> {
        Ok(!self.display.is_released())
    }

    fn capabilities(&self, wsi: &Wsi) -> Result<SurfaceCapabilities2, Error> {
        let mode = self.display.mode_info(self.mode)?;
        let max = wsi.device().info().max_image_dimension;
        Ok(SurfaceCapabilities2 {
            capabilities: SurfaceCapabilities {
                min_image_count: 2,
                max_image_count: 0,
                current_extent: mode.extent(),
                min_image_extent: Extent::new(1, 1),
                max_image_extent: Extent::new(max, max),
                max_image_array_layers: 1,
                supported_transforms: SurfaceTransforms::IDENTITY,
                current_transform: SurfaceTransforms::IDENTITY,
                supported_composite_alpha: CompositeAlpha::OPAQUE,
                supported_usage: DEFAULT_USAGE,
            },
            supported_counters: SurfaceCounters::VBLANK,
        })
    }

    fn formats(&self, _wsi: &Wsi) -> Result<Vec<SurfaceFormat2>, Error> {
        Ok(DISPLAY_FORMATS
            .iter()
            .map(|format| SurfaceFormat2::new(*format, Fourcc::Xrgb8888))
            .collect())
    }

    fn present_modes(&self, _wsi: &Wsi) -> Result<Vec<PresentMode>, Error> {
        Ok(vec![PresentMode::Fifo])
    }

    fn present_rectangles(&self, wsi: &Wsi) -> Result<Vec<Rect>, Error> {
        let same_device = match (wsi.device().info().render_node, self.display.kms().dev_id()) {
            (Some(render_node), Some(dev_id)) => same_gpu(dev_id, render_node),
            _ => false,
        };
        if !same_device {
            return Ok(Vec::new());
        }
        let mode = self.display.mode_info(self.mode)?;
        Ok(vec![Rect::from_extent(mode.extent())])
    }
}
