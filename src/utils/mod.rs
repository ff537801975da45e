//! Various utilities functions and types

mod fd;
mod geometry;

pub use self::fd::{same_gpu, DevPath, DeviceFd};
pub use self::geometry::{Extent, Offset, Rect};

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
#[inline]
pub const fn align(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Installs a log subscriber printing through the test harness, filtered by `RUST_LOG`
#[cfg(test)]
pub(crate) fn test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
