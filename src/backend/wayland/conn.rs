//! The compositor as seen by the presentation engine.

use std::{fmt, time::Duration};

use indexmap::IndexMap;

use super::WaylandError;
use crate::{
    backend::allocator::{dmabuf::Dmabuf, shm::ShmBuffer, Fourcc, Modifier},
    utils::{Extent, Rect},
};

/// Protocol id of a `wl_surface`
pub type SurfaceId = u32;

/// Protocol id of a `wl_buffer`
pub type BufferId = u32;

/// Buffer related globals announced by the compositor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaylandGlobals {
    /// Formats of `wl_shm`, empty if the global is missing
    pub shm_formats: Vec<Fourcc>,
    /// Formats and modifiers of `zwp_linux_dmabuf_v1`, `None` if the global is missing.
    ///
    /// A format without modifiers can only be imported with an implicit layout.
    pub dmabuf_formats: Option<IndexMap<Fourcc, Vec<Modifier>>>,
}

impl WaylandGlobals {
    /// Returns true if `wl_shm` accepts `format`
    pub fn supports_shm(&self, format: Fourcc) -> bool {
        self.shm_formats.contains(&format)
    }

    /// Returns true if `zwp_linux_dmabuf_v1` accepts `format`
    pub fn supports_dmabuf(&self, format: Fourcc) -> bool {
        self.dmabuf_formats
            .as_ref()
            .map(|formats| formats.contains_key(&format))
            .unwrap_or(false)
    }

    /// Explicit modifiers the compositor accepts for `format`
    pub fn modifiers(&self, format: Fourcc) -> &[Modifier] {
        self.dmabuf_formats
            .as_ref()
            .and_then(|formats| formats.get(&format))
            .map(|modifiers| {
                if modifiers.iter().all(|modifier| *modifier == Modifier::Invalid) {
                    &[][..]
                } else {
                    &modifiers[..]
                }
            })
            .unwrap_or(&[])
    }
}

/// A surface update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Buffer to attach
    pub buffer: BufferId,
    /// Changed areas in buffer coordinates, empty for the whole buffer
    pub damage: Vec<Rect>,
    /// Request a `wl_surface.frame` callback
    pub frame: bool,
}

/// Events of the compositor concerning one surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaylandEvent {
    /// `wl_buffer.release`: the compositor does not read from the buffer anymore
    Release(BufferId),
    /// The frame callback requested by the last commit fired
    FrameDone,
}

/// A connection to a Wayland compositor.
///
/// Buffers are created for one surface, their release events are queued together with the frame
/// callbacks of that surface, so several swapchains may share one connection.
pub trait WaylandConnection: Send + Sync + fmt::Debug {
    /// Binds the buffer globals and collects their formats
    fn query_globals(&self) -> Result<WaylandGlobals, WaylandError>;
    /// Imports a dmabuf through `zwp_linux_buffer_params_v1.create_immed`
    fn create_dmabuf_buffer(&self, surface: SurfaceId, dmabuf: &Dmabuf, format: Fourcc)
        -> Result<BufferId, WaylandError>;
    /// Creates a `wl_shm` buffer of `extent` from a shared memory file
    fn create_shm_buffer(
        &self,
        surface: SurfaceId,
        shm: &ShmBuffer,
        extent: Extent,
        format: Fourcc,
    ) -> Result<BufferId, WaylandError>;
    /// Destroys a buffer, errors are ignored
    fn destroy_buffer(&self, buffer: BufferId);
    /// Attaches a buffer, damages and commits the surface
    fn commit(&self, surface: SurfaceId, commit: &Commit) -> Result<(), WaylandError>;
    /// Returns a queued event of `surface`, reading from the socket without blocking
    fn poll_event(&self, surface: SurfaceId) -> Result<Option<WaylandEvent>, WaylandError>;
    /// Waits at most `timeout` for an event of `surface`
    fn wait_event(&self, surface: SurfaceId, timeout: Duration) -> Result<Option<WaylandEvent>, WaylandError>;
    /// Sends all queued requests
    fn flush(&self) -> Result<(), WaylandError>;
}
