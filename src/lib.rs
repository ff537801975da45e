#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DRM
#![allow(clippy::upper_case_acronyms)]

//! # wsi: a swapchain presentation engine
//!
//! This crate takes images rendered by a graphics device and hands them to the display mechanism of
//! the platform, while respecting the timing, buffering and ownership rules of the windowing system.
//!
//! ## Structure of the crate
//!
//! - [`device`] describes the graphics device as a capability table ([`device::Device`]). The engine
//!   never records rendering commands itself, it only asks the device to create, bind, export and copy
//!   images. [`device::host::HostDevice`] is a CPU implementation backed by shared memory.
//! - [`backend::allocator`] allocates presentable images and exports them as dmabufs or shared memory.
//! - [`image`] tracks who owns each swapchain image at any point in time.
//! - [`backend`] contains the platform adapters: direct display through DRM/KMS, X11 through
//!   DRI3 and Present, Wayland, Win32 GDI and a software copy path.
//! - [`surface`] and [`swapchain`] form the driver-facing api: [`surface::Wsi`] answers surface
//!   queries and creates [`swapchain::Swapchain`]s, which are then used to acquire and present images.
//!
//! ## Results
//!
//! Every operation returns a [`Result`] carrying an [`Error`] from a closed set. Successful results
//! carry a *suboptimal* flag instead of a separate status. Once a swapchain has observed a terminal
//! error, every following call on it reports that same error, see [`status`].
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging. No subscriber is installed,
//! that is up to the application.
//!
//! For release builds it is recommended to limit the log level during compile time:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod config;
pub mod device;
mod error;
pub mod image;
pub mod queue;
pub mod status;
pub mod surface;
pub mod swapchain;
pub mod timeout;
pub mod utils;

pub use error::Error;

pub mod reexports;
