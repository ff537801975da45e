use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, error, trace};

use super::{event::fence_signalled, kms::KmsEvent, swapchain::flip_completed, DisplayCore};

/// Reads the events of a device, advancing its swapchains and signalling display event fences
#[derive(Debug)]
pub(super) struct EventThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventThread {
    pub fn spawn(core: Arc<DisplayCore>) -> io::Result<EventThread> {
        let running = Arc::new(AtomicBool::new(true));
        let handle = thread::Builder::new().name("wsi-display-events".into()).spawn({
            let running = running.clone();
            move || run(core, running)
        })?;
        Ok(EventThread {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Display event thread panicked");
            }
        }
    }
}

fn run(core: Arc<DisplayCore>, running: Arc<AtomicBool>) {
    let span = core.span.clone();
    let _guard = span.enter();
    debug!("Display event thread started");

    while running.load(Ordering::Acquire) {
        let events = match core.kms.wait_events(core.options.event_poll_interval) {
            Ok(events) => events,
            Err(err) => {
                error!(?err, "Reading display events failed");
                core.state.lock().unwrap().event_error = true;
                core.event.notify_all();
                break;
            }
        };
        if events.is_empty() {
            continue;
        }

        let mut state = core.state.lock().unwrap();
        for event in events {
            match event {
                KmsEvent::PageFlip { crtc, sequence, .. } => {
                    trace!(?crtc, sequence, "Page flip completed");
                    state = flip_completed(&core, state, crtc);
                }
                KmsEvent::Vblank {
                    crtc,
                    sequence,
                    user_data,
                } => {
                    trace!(?crtc, sequence, fence = user_data, "Vblank");
                    fence_signalled(&mut state.fences, user_data);
                }
            }
        }
        drop(state);
        core.event.notify_all();
    }

    debug!("Display event thread stopped");
}
