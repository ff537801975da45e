//! Fences signalled by display events.
//!
//! A [`DisplayEventFence`] is registered for an event of a display and signalled by the event
//! thread of the device once the event happened.

use std::{collections::HashMap, time::Duration};

use rustix::io::Errno;
use tracing::{debug, trace, warn};

use super::{DisplayHandle, DisplayWsi};
use crate::{timeout::Timeout, Error};

/// Time to wait for the kernel to drain its event queue before queueing another vblank event
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// Events of a display a fence can wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEvent {
    /// The first pixel of the next frame is sent to the display
    FirstPixelOut,
}

/// Events of the device a fence can wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A display was connected or disconnected
    DisplayHotplug,
}

/// A fence signalled when a display event happened
#[derive(Debug)]
pub struct DisplayEventFence {
    display: DisplayWsi,
    id: u64,
}

impl DisplayEventFence {
    /// Returns true once the event happened
    pub fn is_signalled(&self) -> bool {
        let state = self.display.core().state.lock().unwrap();
        state.fences.get(&self.id).copied().unwrap_or(false)
    }

    /// Waits up to `timeout` nanoseconds for the event.
    ///
    /// Fails with [`Error::NotReady`] or [`Error::Timeout`] if the event did not happen in time
    /// and with [`Error::DeviceLost`] if the device stopped delivering events.
    pub fn wait(&self, timeout: u64) -> Result<(), Error> {
        let timeout = Timeout::from_nanos(timeout);
        let core = self.display.core();
        let mut state = core.state.lock().unwrap();
        loop {
            if state.fences.get(&self.id).copied().unwrap_or(false) {
                trace!(fence = self.id, "Fence passed");
                return Ok(());
            }
            if state.event_error || state.released {
                debug!(fence = self.id, "Fence lost its device");
                return Err(Error::DeviceLost);
            }
            state = timeout.wait(&core.event, state)?;
        }
    }
}

impl Drop for DisplayEventFence {
    fn drop(&mut self) {
        // an event arriving later finds no fence and is dropped
        self.display.core().state.lock().unwrap().fences.remove(&self.id);
    }
}

impl DisplayWsi {
    /// Creates a fence signalled when `event` happens on `display`.
    ///
    /// The display has to be driven by a swapchain, its crtc is the source of the event.
    pub fn register_display_event(
        &self,
        display: DisplayHandle,
        event: DisplayEvent,
    ) -> Result<DisplayEventFence, Error> {
        self.ensure_event_thread()?;

        let core = self.core();
        let mut state = core.state.lock().unwrap();
        if state.released {
            return Err(Error::InitializationFailed);
        }
        let crtc = state
            .registry
            .get(display.connector())
            .ok_or(Error::Unknown)?
            .crtc
            .ok_or_else(|| {
                let handle = display;
                warn!(display = ?handle, "Display is not driven by any crtc");
                Error::OutOfHostMemory
            })?;

        state.next_fence += 1;
        let id = state.next_fence;
        loop {
            match core.kms.queue_vblank_event(crtc, id) {
                Ok(()) => break,
                Err(err) if err.errno() == Some(Errno::NOMEM) => {
                    // the kernel queue is full, wait for the event thread to read some events
                    trace!(fence = id, "Vblank queue full");
                    let (guard, wait) = core.event.wait_timeout(state, QUEUE_FULL_BACKOFF).unwrap();
                    state = guard;
                    if wait.timed_out() || state.event_error {
                        warn!(fence = id, "Vblank queue stayed full");
                        return Err(Error::OutOfHostMemory);
                    }
                }
                Err(err) => {
                    warn!(?err, fence = id, "Failed to queue vblank event");
                    return Err(Error::OutOfHostMemory);
                }
            }
        }
        state.fences.insert(id, false);
        debug!(fence = id, ?crtc, ?event, "Display event registered");

        Ok(DisplayEventFence {
            display: self.clone(),
            id,
        })
    }

    /// Creates a fence signalled when `event` happens on the device.
    ///
    /// Hotplug notifications are not delivered by the kernel mode-setting interface, this always
    /// fails with [`Error::FeatureNotPresent`].
    pub fn register_device_event(&self, event: DeviceEvent) -> Result<DisplayEventFence, Error> {
        debug!(?event, "Device events are not supported");
        Err(Error::FeatureNotPresent)
    }
}

/// Signals the fence `id`, if it still exists
pub(super) fn fence_signalled(fences: &mut HashMap<u64, bool>, id: u64) {
    match fences.get_mut(&id) {
        Some(signalled) => *signalled = true,
        None => trace!(fence = id, "Event for a destroyed fence"),
    }
}
