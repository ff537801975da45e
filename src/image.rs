//! Per-image ownership tracking.
//!
//! Every swapchain image is in exactly one [`ImageState`] at any time, and the state decides who
//! may touch its memory:
//!
//! ```text
//! Idle ──acquire──▶ Drawing ──present──▶ Queued ──accept──▶ Flipping ──complete──▶ Displaying
//!  ▲                                      │                                            │
//!  └──────────────── reject ──────────────┘◀──────────── superseded / released ────────┘
//! ```
//!
//! The shape is identical for all backends, only the events driving the transitions differ.
//! At most one image of an [`ImageTable`] is ever [`ImageState::Displaying`].

use tracing::{error, trace};

/// Ownership state of one swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageState {
    /// Owned by the engine, free for reuse
    Idle,
    /// Acquired by the application, which may render into it
    Drawing,
    /// Presented by the application, waiting for the backend to accept it
    Queued,
    /// Accepted by the backend, the display operation is outstanding
    Flipping,
    /// Currently on screen
    Displaying,
}

/// What happens to the previous front buffer once another image is displayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// The previous front buffer is free right away (page-flips, synchronous copies)
    Immediate,
    /// The platform keeps using the buffer until it explicitly releases it (X11, Wayland)
    UntilReleased,
}

/// A transition that the current state of an image does not allow
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Image {index} cannot be {action} while {state:?}")]
pub struct InvalidTransition {
    /// Index of the image
    pub index: u32,
    /// State the image was in
    pub state: ImageState,
    /// The attempted transition
    pub action: &'static str,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: ImageState,
    sequence: u64,
}

/// States of all images of one swapchain
#[derive(Debug, Clone)]
pub struct ImageTable {
    slots: Vec<Slot>,
    retention: Retention,
    next_sequence: u64,
}

impl ImageTable {
    /// Creates a table of `count` idle images
    pub fn new(count: usize, retention: Retention) -> ImageTable {
        ImageTable {
            slots: vec![
                Slot {
                    state: ImageState::Idle,
                    sequence: 0,
                };
                count
            ],
            retention,
            next_sequence: 0,
        }
    }

    /// Number of images
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the table has no images
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// State of the image at `index`
    pub fn state(&self, index: u32) -> Option<ImageState> {
        self.slots.get(index as usize).map(|slot| slot.state)
    }

    /// Number of images in `state`
    pub fn count(&self, state: ImageState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    /// Returns true if any image is in `state`
    pub fn any(&self, state: ImageState) -> bool {
        self.slots.iter().any(|slot| slot.state == state)
    }

    /// Index of the image currently on screen
    pub fn displaying(&self) -> Option<u32> {
        self.position(|slot| slot.state == ImageState::Displaying)
    }

    fn position(&self, f: impl Fn(&Slot) -> bool) -> Option<u32> {
        self.slots.iter().position(f).map(|index| index as u32)
    }

    fn slot_mut(&mut self, index: u32, action: &'static str) -> Result<&mut Slot, InvalidTransition> {
        // out of range indices are reported like a wrong state
        if index as usize >= self.slots.len() {
            return Err(InvalidTransition {
                index,
                state: ImageState::Idle,
                action,
            });
        }
        Ok(&mut self.slots[index as usize])
    }

    /// Hands the first idle image to the application.
    pub fn acquire(&mut self) -> Option<u32> {
        let index = self.position(|slot| slot.state == ImageState::Idle)?;
        self.slots[index as usize].state = ImageState::Drawing;
        trace!(index, "Image acquired");
        Some(index)
    }

    /// Hands a specific idle image to the application, used when a backend picks the image.
    pub fn acquire_index(&mut self, index: u32) -> Result<(), InvalidTransition> {
        let slot = self.slot_mut(index, "acquired")?;
        match slot.state {
            ImageState::Idle => {
                slot.state = ImageState::Drawing;
                Ok(())
            }
            state => Err(InvalidTransition {
                index,
                state,
                action: "acquired",
            }),
        }
    }

    /// Takes back the front buffer for drawing.
    ///
    /// Only meaningful for backends that copy the image out on present, where the displayed image
    /// is not referenced by the platform anymore.
    pub fn reclaim_displaying(&mut self) -> Option<u32> {
        let index = self.displaying()?;
        self.slots[index as usize].state = ImageState::Drawing;
        trace!(index, "Front buffer reclaimed");
        Some(index)
    }

    /// Marks an image as presented.
    ///
    /// Requires the image to be [`ImageState::Drawing`]. Queued images are ordered by the call order
    /// of this function, see [`ImageTable::oldest_queued`].
    pub fn queue(&mut self, index: u32) -> Result<u64, InvalidTransition> {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let slot = self.slot_mut(index, "presented")?;
        if slot.state != ImageState::Drawing {
            let err = InvalidTransition {
                index,
                state: slot.state,
                action: "presented",
            };
            error!(%err, "Present of an image not owned by the application");
            return Err(err);
        }
        slot.state = ImageState::Queued;
        slot.sequence = sequence;
        Ok(sequence)
    }

    /// The queued image that was presented first
    pub fn oldest_queued(&self) -> Option<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == ImageState::Queued)
            .min_by_key(|(_, slot)| slot.sequence)
            .map(|(index, _)| index as u32)
    }

    /// The backend accepted a queued image.
    pub fn begin_flip(&mut self, index: u32) -> Result<(), InvalidTransition> {
        let slot = self.slot_mut(index, "flipped")?;
        match slot.state {
            ImageState::Queued => {
                slot.state = ImageState::Flipping;
                Ok(())
            }
            state => Err(InvalidTransition {
                index,
                state,
                action: "flipped",
            }),
        }
    }

    /// The image reached the screen.
    ///
    /// Moves a queued or flipping image to [`ImageState::Displaying`] and demotes the previous front
    /// buffer. Depending on the [`Retention`] of the table the previous front buffer becomes idle or
    /// stays in flight until [`ImageTable::release`] is called for it.
    ///
    /// Completions for images in any other state are ignored.
    pub fn complete(&mut self, index: u32) -> bool {
        match self.state(index) {
            Some(ImageState::Queued) | Some(ImageState::Flipping) => {}
            _ => return false,
        }
        let demoted = match self.retention {
            Retention::Immediate => ImageState::Idle,
            Retention::UntilReleased => ImageState::Flipping,
        };
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if i as u32 != index && slot.state == ImageState::Displaying {
                trace!(index = i, ?demoted, "Previous front buffer superseded");
                slot.state = demoted;
            }
        }
        self.slots[index as usize].state = ImageState::Displaying;
        trace!(index, "Image displayed");
        true
    }

    /// The platform gave the buffer back.
    ///
    /// Images owned by the application are left untouched, the release of a queued image means
    /// it was dropped by the platform without being shown.
    pub fn release(&mut self, index: u32) -> bool {
        match self.state(index) {
            Some(ImageState::Flipping) | Some(ImageState::Displaying) | Some(ImageState::Queued) => {
                self.slots[index as usize].state = ImageState::Idle;
                trace!(index, "Image released");
                true
            }
            _ => false,
        }
    }

    /// The backend refused a queued or flipping image, which becomes reusable again.
    pub fn reject(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            if matches!(slot.state, ImageState::Queued | ImageState::Flipping) {
                trace!(index, "Image rejected by backend");
                slot.state = ImageState::Idle;
            }
        }
    }
}
