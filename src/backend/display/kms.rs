//! Kernel mode-setting interface used by the display backend.
//!
//! [`KmsDevice`] covers exactly the ioctls direct display presentation needs. [`DrmCard`] implements
//! it for a DRM device node.
//!
//! [`DrmCard`]: super::DrmCard

use std::{fmt, time::Duration};

use super::DisplayError;
use crate::{
    backend::allocator::{dmabuf::Dmabuf, Fourcc},
    utils::Extent,
};

/// Mode type bit of modes preferred by the monitor
pub const MODE_TYPE_PREFERRED: u32 = 1 << 3;

macro_rules! kms_ids {
    ($($(#[$attr:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$attr])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);
        )*
    };
}

kms_ids! {
    /// Kernel id of a connector
    ConnectorId,
    /// Kernel id of an encoder
    EncoderId,
    /// Kernel id of a crtc
    CrtcId,
    /// Kernel id of a framebuffer
    FramebufferId,
    /// Kernel id of a property
    PropertyId,
}

/// Timings of a display mode, as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModeInfo {
    /// Pixel clock in kHz
    pub clock: u32,
    /// Visible width
    pub hdisplay: u16,
    /// Horizontal sync start
    pub hsync_start: u16,
    /// Horizontal sync end
    pub hsync_end: u16,
    /// Total width including blanking
    pub htotal: u16,
    /// Horizontal skew
    pub hskew: u16,
    /// Visible height
    pub vdisplay: u16,
    /// Vertical sync start
    pub vsync_start: u16,
    /// Vertical sync end
    pub vsync_end: u16,
    /// Total height including blanking
    pub vtotal: u16,
    /// Vertical scan count
    pub vscan: u16,
    /// Refresh rate rounded to Hz
    pub vrefresh: u32,
    /// Mode flags
    pub flags: u32,
    /// Mode type bits
    pub mode_type: u32,
    /// Name of the mode
    pub name: String,
}

impl ModeInfo {
    /// Visible size of the mode
    pub fn extent(&self) -> Extent {
        Extent::new(self.hdisplay as u32, self.vdisplay as u32)
    }

    /// Returns true if the monitor prefers this mode
    pub fn is_preferred(&self) -> bool {
        self.mode_type & MODE_TYPE_PREFERRED != 0
    }

    /// Refresh rate in Hz, computed from the timings
    pub fn refresh(&self) -> f64 {
        let total = self.htotal as f64 * self.vtotal as f64 * self.vscan.max(1) as f64;
        if total == 0.0 {
            return 0.0;
        }
        self.clock as f64 * 1000.0 / total
    }

    /// Refresh rate in mHz
    pub fn refresh_mhz(&self) -> u32 {
        (self.refresh() * 1000.0 + 0.5) as u32
    }

    /// Returns true if both modes drive the monitor the same way, ignoring name and type
    pub fn same_timings(&self, other: &ModeInfo) -> bool {
        self.clock == other.clock
            && self.hdisplay == other.hdisplay
            && self.hsync_start == other.hsync_start
            && self.hsync_end == other.hsync_end
            && self.htotal == other.htotal
            && self.hskew == other.hskew
            && self.vdisplay == other.vdisplay
            && self.vsync_start == other.vsync_start
            && self.vsync_end == other.vsync_end
            && self.vtotal == other.vtotal
            && self.vscan == other.vscan
            && self.flags == other.flags
    }
}

/// Kms objects of a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    /// All connectors
    pub connectors: Vec<ConnectorId>,
    /// All encoders
    pub encoders: Vec<EncoderId>,
    /// All crtcs
    pub crtcs: Vec<CrtcId>,
}

/// Connection state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// A monitor is attached
    Connected,
    /// No monitor is attached
    Disconnected,
    /// The kernel cannot tell
    Unknown,
}

/// State of a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    /// Id of the connector
    pub id: ConnectorId,
    /// Name of the connector, like `DP-1`
    pub name: String,
    /// Connection state
    pub state: ConnectorState,
    /// Encoder currently driving the connector
    pub encoder: Option<EncoderId>,
    /// Modes supported by the attached monitor
    pub modes: Vec<ModeInfo>,
    /// The `DPMS` property of the connector
    pub dpms_property: Option<PropertyId>,
}

/// State of an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    /// Id of the encoder
    pub id: EncoderId,
    /// Crtc feeding the encoder
    pub crtc: Option<CrtcId>,
}

/// State of a crtc
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcInfo {
    /// Id of the crtc
    pub id: CrtcId,
    /// Framebuffer scanned out, `None` if the crtc is idle
    pub framebuffer: Option<FramebufferId>,
}

/// Events read from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmsEvent {
    /// A page-flip completed
    PageFlip {
        /// The crtc that flipped
        crtc: CrtcId,
        /// Vblank sequence of the flip
        sequence: u32,
        /// Timestamp of the flip
        time: Duration,
    },
    /// A vblank requested with [`KmsDevice::queue_vblank_event`] happened
    Vblank {
        /// The crtc of the vblank
        crtc: CrtcId,
        /// Vblank sequence
        sequence: u32,
        /// Value passed when queueing the event
        user_data: u64,
    },
}

/// Mode-setting operations of a DRM device.
///
/// All errors carry the os error of the failed ioctl, the display backend decides on retries by
/// looking at it.
pub trait KmsDevice: Send + Sync + fmt::Debug {
    /// Returns true if the caller is DRM master of the device
    fn is_master(&self) -> bool;

    /// The `dev_t` of the device node
    fn dev_id(&self) -> Option<u64>;

    /// Lists all kms objects
    fn resources(&self) -> Result<Resources, DisplayError>;

    /// Reads a connector, optionally rescanning for monitor changes
    fn connector(&self, id: ConnectorId, rescan: bool) -> Result<ConnectorInfo, DisplayError>;

    /// Reads an encoder
    fn encoder(&self, id: EncoderId) -> Result<EncoderInfo, DisplayError>;

    /// Reads a crtc
    fn crtc(&self, id: CrtcId) -> Result<CrtcInfo, DisplayError>;

    /// Imports the planes of `dmabuf` and creates a framebuffer of `format` from them
    fn add_framebuffer(&self, dmabuf: &Dmabuf, format: Fourcc) -> Result<FramebufferId, DisplayError>;

    /// Destroys a framebuffer
    fn remove_framebuffer(&self, framebuffer: FramebufferId) -> Result<(), DisplayError>;

    /// Schedules a flip to `framebuffer` on the next vblank, requesting a completion event
    fn page_flip(&self, crtc: CrtcId, framebuffer: FramebufferId) -> Result<(), DisplayError>;

    /// Sets `mode` on `crtc`, scanning out `framebuffer` to `connector`
    fn set_crtc(
        &self,
        crtc: CrtcId,
        framebuffer: FramebufferId,
        connector: ConnectorId,
        mode: &ModeInfo,
    ) -> Result<(), DisplayError>;

    /// Disables the hardware cursor of `crtc`
    fn hide_cursor(&self, crtc: CrtcId) -> Result<(), DisplayError>;

    /// Sets a property of a connector
    fn set_connector_property(
        &self,
        connector: ConnectorId,
        property: PropertyId,
        value: u64,
    ) -> Result<(), DisplayError>;

    /// Current vblank sequence of `crtc`
    fn crtc_sequence(&self, crtc: CrtcId) -> Result<u64, DisplayError>;

    /// Requests a [`KmsEvent::Vblank`] carrying `user_data` on the next vblank of `crtc`.
    ///
    /// Fails with `ENOMEM` while the event queue of the kernel is full.
    fn queue_vblank_event(&self, crtc: CrtcId, user_data: u64) -> Result<(), DisplayError>;

    /// Waits up to `timeout` for events and reads them.
    ///
    /// Returns an empty list if nothing happened in time.
    fn wait_events(&self, timeout: Duration) -> Result<Vec<KmsEvent>, DisplayError>;
}
