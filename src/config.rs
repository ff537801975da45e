//! Process wide presentation options.
//!
//! Options are read once from the environment the first time [`WsiOptions::from_env`] is called.
//! Applications that want to control them explicitly can build a [`WsiOptions`] and pass it to
//! [`Wsi::with_options`](crate::surface::Wsi::with_options).
//!
//! | Variable | Effect |
//! |---|---|
//! | `WSI_PRESENT_MODE` | Force `immediate`, `mailbox`, `fifo` or `relaxed` present mode if the backend supports it |
//! | `WSI_X11_OVERRIDE_MIN_IMAGE_COUNT` | Minimum image count reported for X11 surfaces |
//! | `WSI_X11_STRICT_IMAGE_COUNT` | Create exactly the requested number of images on X11 |
//! | `WSI_X11_ENSURE_MIN_IMAGE_COUNT` | Never create less images than the X11 minimum |
//! | `WSI_FORCE_BGRA8_UNORM_FIRST` | Report `B8G8R8A8_UNORM` before the sRGB variant |

use std::{env, str::FromStr};

use once_cell::sync::Lazy;
use tracing::warn;

use crate::surface::PresentMode;

/// Environment variable forcing a present mode
pub const PRESENT_MODE_ENV: &str = "WSI_PRESENT_MODE";

/// Error parsing a present mode name
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown present mode `{0}`, expected one of immediate, mailbox, fifo, relaxed")]
pub struct UnknownPresentMode(pub String);

impl FromStr for PresentMode {
    type Err = UnknownPresentMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(PresentMode::Immediate),
            "mailbox" => Ok(PresentMode::Mailbox),
            "fifo" => Ok(PresentMode::Fifo),
            "relaxed" | "fifo_relaxed" => Ok(PresentMode::FifoRelaxed),
            _ => Err(UnknownPresentMode(s.to_string())),
        }
    }
}

/// Tunables of the presentation engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WsiOptions {
    /// Present mode used instead of the requested one, if supported by the surface
    pub present_mode_override: Option<PresentMode>,
    /// Minimum image count reported by X11 surfaces
    pub x11_override_min_image_count: Option<u32>,
    /// Create exactly the requested amount of images on X11
    pub x11_strict_image_count: bool,
    /// Raise the image count of X11 swapchains to the reported minimum
    pub x11_ensure_min_image_count: bool,
    /// Report `B8G8R8A8_UNORM` as first surface format
    pub force_bgra8_unorm_first: bool,
}

static ENV_OPTIONS: Lazy<WsiOptions> = Lazy::new(|| WsiOptions::parse(|name| env::var(name).ok()));

impl WsiOptions {
    /// Options configured through the process environment
    pub fn from_env() -> WsiOptions {
        ENV_OPTIONS.clone()
    }

    /// Parses options through a variable lookup function
    pub fn parse(lookup: impl Fn(&str) -> Option<String>) -> WsiOptions {
        let present_mode_override = lookup(PRESENT_MODE_ENV).and_then(|value| match value.parse() {
            Ok(mode) => Some(mode),
            Err(err) => {
                warn!(%err, "Ignoring {}", PRESENT_MODE_ENV);
                None
            }
        });
        let x11_override_min_image_count =
            lookup("WSI_X11_OVERRIDE_MIN_IMAGE_COUNT").and_then(|value| match value.trim().parse() {
                Ok(0) | Err(_) => {
                    warn!(%value, "Ignoring invalid WSI_X11_OVERRIDE_MIN_IMAGE_COUNT");
                    None
                }
                Ok(count) => Some(count),
            });

        WsiOptions {
            present_mode_override,
            x11_override_min_image_count,
            x11_strict_image_count: flag(lookup("WSI_X11_STRICT_IMAGE_COUNT")),
            x11_ensure_min_image_count: flag(lookup("WSI_X11_ENSURE_MIN_IMAGE_COUNT")),
            force_bgra8_unorm_first: flag(lookup("WSI_FORCE_BGRA8_UNORM_FIRST")),
        }
    }

    /// Selects the present mode of a new swapchain.
    ///
    /// The override is only honored if `supported` contains it, otherwise a warning is logged and
    /// `requested` is used.
    pub fn select_present_mode(&self, requested: PresentMode, supported: &[PresentMode]) -> PresentMode {
        match self.present_mode_override {
            Some(mode) if supported.contains(&mode) => mode,
            Some(mode) => {
                warn!(?mode, ?supported, "Unsupported {} value, ignoring", PRESENT_MODE_ENV);
                requested
            }
            None => requested,
        }
    }
}

fn flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}
