//! The X server as seen by the presentation engine.

use std::{fmt, os::unix::io::OwnedFd, time::Duration};

use super::X11Error;
use crate::{
    backend::allocator::{dmabuf::Dmabuf, shm::ShmBuffer, Modifier},
    utils::{Extent, Rect},
};

/// X11 resource id
pub type Xid = u32;

/// `PresentOptionAsync`: present without waiting for the vertical blank
pub const PRESENT_OPTION_ASYNC: u32 = 1;
/// `PresentOptionCopy`: never flip
pub const PRESENT_OPTION_COPY: u32 = 2;
/// `PresentOptionUST`: target times are UST instead of MSC
pub const PRESENT_OPTION_UST: u32 = 4;
/// `PresentOptionSuboptimal`: report copies that could be flips with other buffers
pub const PRESENT_OPTION_SUBOPTIMAL: u32 = 8;

/// Extensions and server traits relevant for presentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionCaps {
    /// Version of DRI3
    pub dri3: Option<(u32, u32)>,
    /// Version of Present
    pub present: Option<(u32, u32)>,
    /// XFixes is available, used for damage regions
    pub xfixes: bool,
    /// MIT-SHM with fd passing is available
    pub mit_shm: bool,
    /// The server is Xwayland
    pub is_xwayland: bool,
    /// The server runs a proprietary driver without DRI3
    pub is_proprietary: bool,
}

impl ConnectionCaps {
    /// Returns true if pixmaps with explicit modifiers can be created and `Suboptimal` reported
    pub fn has_modifiers(&self) -> bool {
        self.dri3.map(|v| v >= (1, 2)).unwrap_or(false) && self.present.map(|v| v >= (1, 2)).unwrap_or(false)
    }
}

/// Class of an X visual
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualClass {
    /// Colors are stored directly as rgb values
    TrueColor,
    /// Colors are stored as rgb values and looked up per channel
    DirectColor,
    /// Any kind of palette based visual
    Other,
}

/// Visual of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisualInfo {
    /// Class of the visual
    pub class: VisualClass,
    /// Bits of the red channel
    pub red_mask: u32,
    /// Bits of the green channel
    pub green_mask: u32,
    /// Bits of the blue channel
    pub blue_mask: u32,
}

impl VisualInfo {
    /// Returns true if pixels of the given depth have bits outside of the color channels
    pub fn has_alpha(&self, depth: u8) -> bool {
        let all = if depth >= 32 {
            u32::MAX
        } else {
            (1u32 << depth).wrapping_sub(1)
        };
        all & !(self.red_mask | self.green_mask | self.blue_mask) != 0
    }

    /// Returns true if images can be presented to windows of this visual
    pub fn is_supported(&self) -> bool {
        matches!(self.class, VisualClass::TrueColor | VisualClass::DirectColor)
    }
}

/// Size and visual of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    /// Size of the window
    pub extent: Extent,
    /// Depth of the window
    pub depth: u8,
    /// Visual of the window, if it has one of the screen's visuals
    pub visual: Option<VisualInfo>,
}

/// A pixmap backed by a MIT-SHM segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmPixmap {
    /// The pixmap
    pub pixmap: Xid,
    /// The segment the pixmap lives in
    pub segment: Xid,
}

/// Server side objects created for a swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XResource {
    /// A pixmap
    Pixmap(Xid),
    /// A SYNC fence
    Fence(Xid),
    /// An XFixes region
    Region(Xid),
    /// A MIT-SHM segment
    ShmSegment(Xid),
}

/// Arguments of a `PresentPixmap` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentRequest {
    /// The window to present to
    pub window: Xid,
    /// The pixmap to present
    pub pixmap: Xid,
    /// Serial reported back in the completion event
    pub serial: u32,
    /// Region of the pixmap that changed, `None` for all of it
    pub update: Option<Xid>,
    /// Fence triggered once the pixmap is idle
    pub idle_fence: Xid,
    /// `PRESENT_OPTION_*` flags
    pub options: u32,
    /// Frame counter to present at, `0` for as soon as possible
    pub target_msc: u64,
}

/// How a presentation was completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteKind {
    /// A `PresentPixmap` request completed
    Pixmap,
    /// A `PresentNotifyMSC` request completed
    NotifyMsc,
}

/// How the pixmap reached the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteMode {
    /// The pixmap was copied
    Copy,
    /// The pixmap was flipped
    Flip,
    /// The presentation was skipped
    Skip,
    /// The pixmap was copied, but could have been flipped with a different buffer layout
    SuboptimalCopy,
}

/// Events of the Present extension for one event context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentEvent {
    /// The window changed
    Configure {
        /// New size of the window
        extent: Extent,
        /// The window was destroyed
        window_destroyed: bool,
    },
    /// A presentation completed
    Complete {
        /// Serial of the request
        serial: u32,
        /// Frame counter the presentation happened at
        msc: u64,
        /// Kind of request
        kind: CompleteKind,
        /// How the pixmap was shown
        mode: CompleteMode,
    },
    /// The server does not read from the pixmap anymore
    Idle {
        /// The pixmap
        pixmap: Xid,
        /// Serial of the request that presented it
        serial: u32,
    },
}

/// A connection to an X server implementing DRI3 and Present.
///
/// Every request is asynchronous unless it returns data. Implementations queue the present
/// events per event context, so several swapchains may share one connection.
pub trait PresentConnection: Send + Sync + fmt::Debug {
    /// Extensions of the server
    fn caps(&self) -> ConnectionCaps;
    /// Queries size and visual of `window`
    fn window_geometry(&self, window: Xid) -> Result<WindowGeometry, X11Error>;
    /// `dev_t` of the device the server renders with, if DRI3 can tell
    fn dri3_device(&self, window: Xid) -> Result<Option<u64>, X11Error>;
    /// Modifiers the server accepts for pixmaps of `window`: the window's list, then the screen's
    fn dri3_modifiers(&self, window: Xid, depth: u8, bpp: u8) -> Result<Vec<Vec<Modifier>>, X11Error>;
    /// Selects configure, complete and idle events of `window` into a new event context
    fn select_present_events(&self, window: Xid) -> Result<Xid, X11Error>;
    /// Stops delivery into the event context `eid`
    fn unselect_present_events(&self, window: Xid, eid: Xid);
    /// Imports a dmabuf as pixmap
    fn pixmap_from_dmabuf(&self, window: Xid, dmabuf: &Dmabuf, depth: u8, bpp: u8) -> Result<Xid, X11Error>;
    /// Attaches a shared memory buffer and creates a pixmap of `extent` in it
    fn pixmap_from_shm(&self, window: Xid, shm: &ShmBuffer, extent: Extent, depth: u8)
        -> Result<ShmPixmap, X11Error>;
    /// Creates a SYNC fence for `drawable` from a shared memory fence
    fn fence_from_fd(&self, drawable: Xid, fd: OwnedFd) -> Result<Xid, X11Error>;
    /// Creates an empty XFixes region
    fn create_region(&self) -> Result<Xid, X11Error>;
    /// Replaces the rectangles of `region`
    fn set_region(&self, region: Xid, rects: &[Rect]) -> Result<(), X11Error>;
    /// Sends a `PresentPixmap` request
    fn present_pixmap(&self, request: &PresentRequest) -> Result<(), X11Error>;
    /// Returns a queued event of `eid` without blocking
    fn poll_present_event(&self, eid: Xid) -> Result<Option<PresentEvent>, X11Error>;
    /// Waits at most `timeout` for an event of `eid`
    fn wait_present_event(&self, eid: Xid, timeout: Duration) -> Result<Option<PresentEvent>, X11Error>;
    /// Sends all queued requests
    fn flush(&self) -> Result<(), X11Error>;
    /// Frees a server side object, errors are ignored
    fn free(&self, resource: XResource);
}

#[cfg(test)]
mod tests {
    use super::{ConnectionCaps, VisualClass, VisualInfo};

    #[test]
    fn alpha_visuals() {
        let argb = VisualInfo {
            class: VisualClass::TrueColor,
            red_mask: 0xff0000,
            green_mask: 0xff00,
            blue_mask: 0xff,
        };
        assert!(argb.has_alpha(32));
        assert!(!argb.has_alpha(24));
    }

    #[test]
    fn modifiers_need_both_extensions() {
        let mut caps = ConnectionCaps {
            dri3: Some((1, 2)),
            present: Some((1, 0)),
            ..Default::default()
        };
        assert!(!caps.has_modifiers());
        caps.present = Some((1, 2));
        assert!(caps.has_modifiers());
    }
}
