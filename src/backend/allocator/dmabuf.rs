//! Module for [dmabuf](https://docs.kernel.org/driver-api/dma-buf.html) buffers.
//!
//! `Dmabuf`s act alike to smart pointers and can be freely cloned and passed around.
//! Once the last `Dmabuf` reference is dropped, its file descriptors are closed.
//!
//! Display servers take ownership of the descriptors they are sent, so every consumer
//! [`duplicate`](Dmabuf::duplicate_fds)s them instead of handing out the originals.

use super::{Buffer, Format, Fourcc, Modifier};
use crate::utils::Extent;
use std::hash::{Hash, Hasher};
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

/// Maximum amount of planes this implementation supports
pub const MAX_PLANES: usize = 4;

#[derive(Debug)]
pub(crate) struct DmabufInternal {
    /// The submitted planes
    pub planes: Vec<Plane>,
    /// The size of this buffer
    pub size: Extent,
    /// The format in use
    pub format: Fourcc,
    /// The modifier shared by all planes
    pub modifier: Modifier,
}

#[derive(Debug)]
pub(crate) struct Plane {
    pub fd: OwnedFd,
    /// The plane index
    pub plane_idx: u32,
    /// Offset from the start of the Fd
    pub offset: u32,
    /// Stride for this plane
    pub stride: u32,
}

#[derive(Debug, Clone)]
/// Strong reference to a dmabuf handle
pub struct Dmabuf(pub(crate) Arc<DmabufInternal>);

impl PartialEq for Dmabuf {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Dmabuf {}

impl Hash for Dmabuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}

impl Buffer for Dmabuf {
    fn width(&self) -> u32 {
        self.0.size.width
    }

    fn height(&self) -> u32 {
        self.0.size.height
    }

    fn format(&self) -> Format {
        Format {
            code: self.0.format,
            modifier: self.0.modifier,
        }
    }
}

/// Builder for Dmabufs
#[derive(Debug)]
pub struct DmabufBuilder {
    internal: DmabufInternal,
}

impl DmabufBuilder {
    /// Add a plane to the constructed Dmabuf
    ///
    /// *Note*: Each Dmabuf needs at least one plane.
    /// MAX_PLANES notes the maximum amount of planes any format may use with this implementation.
    pub fn add_plane(&mut self, fd: OwnedFd, idx: u32, offset: u32, stride: u32) -> bool {
        if self.internal.planes.len() == MAX_PLANES {
            return false;
        }
        self.internal.planes.push(Plane {
            fd,
            plane_idx: idx,
            offset,
            stride,
        });

        true
    }

    /// Build a `Dmabuf` out of the provided parameters and planes
    ///
    /// Returns `None` if the builder has no planes attached.
    pub fn build(mut self) -> Option<Dmabuf> {
        if self.internal.planes.is_empty() {
            return None;
        }

        self.internal.planes.sort_by_key(|plane| plane.plane_idx);
        Some(Dmabuf(Arc::new(self.internal)))
    }
}

impl Dmabuf {
    /// Create a new Dmabuf builder
    pub fn builder(size: impl Into<Extent>, format: Fourcc, modifier: Modifier) -> DmabufBuilder {
        DmabufBuilder {
            internal: DmabufInternal {
                planes: Vec::with_capacity(MAX_PLANES),
                size: size.into(),
                format,
                modifier,
            },
        }
    }

    /// The amount of planes this Dmabuf has
    pub fn num_planes(&self) -> usize {
        self.0.planes.len()
    }

    /// Returns borrowed handles of the planes of this buffer
    pub fn handles(&self) -> impl Iterator<Item = BorrowedFd<'_>> + '_ {
        self.0.planes.iter().map(|p| p.fd.as_fd())
    }

    /// Duplicates the plane descriptors, for protocols that take ownership of them
    pub fn duplicate_fds(&self) -> io::Result<Vec<OwnedFd>> {
        self.0
            .planes
            .iter()
            .map(|p| p.fd.try_clone())
            .collect()
    }

    /// Returns offsets for the planes of this buffer
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.offset)
    }

    /// Returns strides for the planes of this buffer
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.stride)
    }

    /// The modifier of this buffer
    pub fn modifier(&self) -> Modifier {
        self.0.modifier
    }

    /// Returns if this buffer format has any vendor-specific modifiers set or is implicit/linear
    pub fn has_modifier(&self) -> bool {
        self.0.modifier != Modifier::Invalid && self.0.modifier != Modifier::Linear
    }
}

#[cfg(test)]
mod tests {
    use super::{Dmabuf, MAX_PLANES};
    use crate::backend::allocator::{Buffer, Fourcc, Modifier};
    use rustix::fs::{memfd_create, MemfdFlags};

    #[test]
    fn planes_are_sorted_and_limited() {
        let mut builder = Dmabuf::builder((64, 32), Fourcc::Argb8888, Modifier::Linear);
        for idx in (0..MAX_PLANES as u32).rev() {
            let fd = memfd_create("wsi-test", MemfdFlags::CLOEXEC).unwrap();
            assert!(builder.add_plane(fd, idx, idx * 100, 256));
        }
        let fd = memfd_create("wsi-test", MemfdFlags::CLOEXEC).unwrap();
        assert!(!builder.add_plane(fd, 4, 0, 256));

        let dmabuf = builder.build().unwrap();
        assert_eq!(dmabuf.num_planes(), MAX_PLANES);
        assert_eq!(dmabuf.offsets().collect::<Vec<_>>(), vec![0, 100, 200, 300]);
        assert_eq!(dmabuf.size(), (64, 32));
        assert!(!dmabuf.has_modifier());
        assert_eq!(dmabuf.duplicate_fds().unwrap().len(), MAX_PLANES);
    }

    #[test]
    fn empty_builder() {
        assert!(Dmabuf::builder((1, 1), Fourcc::Argb8888, Modifier::Invalid)
            .build()
            .is_none());
    }
}
