//! Shared memory buffers, as used by MIT-SHM and `wl_shm`.

use std::{
    io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    sync::Arc,
};

use super::{format::ColorFormat, Buffer, Format, Modifier};
use crate::utils::Extent;

#[derive(Debug)]
struct ShmInternal {
    fd: OwnedFd,
    size: Extent,
    format: ColorFormat,
    offset: u64,
    stride: u32,
    pool_size: u64,
}

/// A linear buffer living in a shared memory file
#[derive(Debug, Clone)]
pub struct ShmBuffer(Arc<ShmInternal>);

impl ShmBuffer {
    /// Wraps a shared memory file descriptor.
    ///
    /// `pool_size` is the size of the whole file, the pixels start at `offset`.
    pub fn new(
        fd: OwnedFd,
        size: Extent,
        format: ColorFormat,
        offset: u64,
        stride: u32,
        pool_size: u64,
    ) -> ShmBuffer {
        ShmBuffer(Arc::new(ShmInternal {
            fd,
            size,
            format,
            offset,
            stride,
            pool_size,
        }))
    }

    /// Color format of the pixels
    pub fn color_format(&self) -> ColorFormat {
        self.0.format
    }

    /// Offset of the first pixel in the file
    pub fn offset(&self) -> u64 {
        self.0.offset
    }

    /// Bytes per row
    pub fn stride(&self) -> u32 {
        self.0.stride
    }

    /// Size of the whole file
    pub fn pool_size(&self) -> u64 {
        self.0.pool_size
    }

    /// Duplicates the descriptor, for protocols that take ownership of it
    pub fn duplicate_fd(&self) -> io::Result<OwnedFd> {
        self.0.fd.try_clone()
    }
}

impl AsFd for ShmBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl Buffer for ShmBuffer {
    fn width(&self) -> u32 {
        self.0.size.width
    }

    fn height(&self) -> u32 {
        self.0.size.height
    }

    fn format(&self) -> Format {
        Format {
            code: self.0.format.fourcc(),
            modifier: Modifier::Linear,
        }
    }
}
