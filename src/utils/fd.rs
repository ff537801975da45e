#![forbid(unsafe_op_in_unsafe_fn)]

use std::{
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    path::PathBuf,
    sync::Arc,
};

/// Ref-counted file descriptor of an open device node or shared memory object
#[derive(Debug, Clone)]
pub struct DeviceFd(Arc<OwnedFd>);

impl PartialEq for DeviceFd {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.as_raw_fd() == other.0.as_raw_fd()
    }
}

impl AsFd for DeviceFd {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for DeviceFd {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl FromRawFd for DeviceFd {
    /// SAFETY:
    /// Make sure that `fd` is a valid value!
    #[inline]
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        DeviceFd(Arc::new(unsafe { OwnedFd::from_raw_fd(fd) }))
    }
}

impl From<OwnedFd> for DeviceFd {
    #[inline]
    fn from(fd: OwnedFd) -> Self {
        DeviceFd(Arc::new(fd))
    }
}

impl DeviceFd {
    /// Duplicates the descriptor, for apis that take ownership of the fd they are passed.
    pub fn duplicate(&self) -> std::io::Result<OwnedFd> {
        Ok(rustix::io::fcntl_dupfd_cloexec(&*self.0, 3)?)
    }

    /// Returns the `dev_t` of the device node behind this descriptor
    pub fn dev_id(&self) -> std::io::Result<u64> {
        Ok(rustix::fs::fstat(&*self.0)?.st_rdev as u64)
    }
}

/// Returns true if the device numbers `a` and `b` belong to the same GPU.
///
/// Either both are the same node, or one is the primary node and the other its render node.
pub fn same_gpu(a: u64, b: u64) -> bool {
    use rustix::fs::{major, minor};
    // render nodes start at minor 128, the primary node of the same card is 128 below
    let (primary, render) = if minor(a) < minor(b) { (a, b) } else { (b, a) };
    a == b || (major(primary) == major(render) && minor(primary) + 128 == minor(render))
}

/// Trait representing open devices that *may* return a `Path`
pub trait DevPath {
    /// Returns the path of the open device if possible
    fn dev_path(&self) -> Option<PathBuf>;
}

impl<A: AsFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        use std::fs;

        fs::read_link(format!("/proc/self/fd/{:?}", self.as_fd().as_raw_fd())).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::{same_gpu, DeviceFd};
    use rustix::fs::{makedev, memfd_create, MemfdFlags};

    #[test]
    fn primary_and_render_node_match() {
        assert!(same_gpu(makedev(226, 0), makedev(226, 128)));
        assert!(same_gpu(makedev(226, 128), makedev(226, 0)));
        assert!(same_gpu(makedev(226, 128), makedev(226, 128)));
        assert!(!same_gpu(makedev(226, 1), makedev(226, 128)));
        assert!(!same_gpu(makedev(227, 0), makedev(226, 128)));
    }

    #[test]
    fn duplicate_is_a_distinct_descriptor() {
        let fd: DeviceFd = memfd_create("wsi-test", MemfdFlags::CLOEXEC).unwrap().into();
        let dup = fd.duplicate().unwrap();
        use std::os::unix::io::AsRawFd;
        assert_ne!(dup.as_raw_fd(), fd.as_raw_fd());
        assert!(dup.as_raw_fd() >= 3);
    }
}
