//! Futex based fences shared with the X server.
//!
//! The memory layout and protocol match `libxshmfence`: a single 32 bit word holding `1` once
//! triggered, `0` while untriggered and `-1` while untriggered with waiters sleeping on it.
//! The X server triggers the fence of a pixmap once it stopped reading from it.

use std::{
    io,
    os::unix::io::{AsFd, OwnedFd},
    ptr::{self, NonNull},
    sync::atomic::{AtomicI32, Ordering},
};

use rustix::{
    fs::{ftruncate, memfd_create, MemfdFlags},
    mm::{mmap, munmap, MapFlags, ProtFlags},
};

const SIZE: usize = std::mem::size_of::<i32>();

/// A fence in shared memory
#[derive(Debug)]
pub struct ShmFence {
    fd: OwnedFd,
    word: NonNull<AtomicI32>,
}

// the mapping is only accessed through atomics
unsafe impl Send for ShmFence {}
unsafe impl Sync for ShmFence {}

impl ShmFence {
    /// Allocates a new, untriggered fence
    pub fn new() -> io::Result<ShmFence> {
        let fd = memfd_create("wsi-shmfence", MemfdFlags::CLOEXEC)?;
        ftruncate(&fd, SIZE as u64)?;
        ShmFence::from_fd(fd)
    }

    /// Maps a fence allocated by another party
    pub fn from_fd(fd: OwnedFd) -> io::Result<ShmFence> {
        // SAFETY: a fresh shared mapping of a file at least `SIZE` bytes long
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                SIZE,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let word = NonNull::new(ptr.cast::<AtomicI32>()).ok_or_else(|| io::Error::from(io::ErrorKind::Other))?;
        Ok(ShmFence { fd, word })
    }

    fn word(&self) -> &AtomicI32 {
        // SAFETY: the mapping lives as long as self and is suitably aligned
        unsafe { self.word.as_ref() }
    }

    /// Duplicates the descriptor of the fence, to be sent to the X server
    pub fn duplicate_fd(&self) -> io::Result<OwnedFd> {
        Ok(rustix::io::fcntl_dupfd_cloexec(self.fd.as_fd(), 3)?)
    }

    /// Triggers the fence, waking all waiters
    pub fn trigger(&self) {
        if let Err(-1) = self.word().compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire) {
            self.word().store(1, Ordering::Release);
            futex_wake(self.word());
        }
    }

    /// Blocks until the fence is triggered
    pub fn wait(&self) -> io::Result<()> {
        loop {
            match self.word().compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire) {
                Err(1) => return Ok(()),
                _ => futex_wait(self.word(), -1)?,
            }
        }
    }

    /// Returns true once the fence was triggered
    pub fn is_triggered(&self) -> bool {
        self.word().load(Ordering::Acquire) == 1
    }

    /// Moves a triggered fence back to the untriggered state
    pub fn reset(&self) {
        let _ = self.word().compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

impl Drop for ShmFence {
    fn drop(&mut self) {
        // SAFETY: the mapping was created in `from_fd` and is not referenced anymore
        let _ = unsafe { munmap(self.word.as_ptr().cast(), SIZE) };
    }
}

// The fence is shared with other processes, so the non-private futex operations are used.
fn futex_wake(word: &AtomicI32) {
    // SAFETY: `word` points into a live mapping
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0,
        );
    }
}

fn futex_wait(word: &AtomicI32, value: i32) -> io::Result<()> {
    // SAFETY: `word` points into a live mapping
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            value,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => return Ok(()),
            _ => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ShmFence;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn trigger_and_reset() {
        let fence = ShmFence::new().unwrap();
        assert!(!fence.is_triggered());
        fence.trigger();
        assert!(fence.is_triggered());
        fence.wait().unwrap();
        fence.reset();
        assert!(!fence.is_triggered());
    }

    #[test]
    fn shared_mapping_wakes_waiter() {
        let fence = Arc::new(ShmFence::new().unwrap());
        let server = ShmFence::from_fd(fence.duplicate_fd().unwrap()).unwrap();

        let waiter = thread::spawn({
            let fence = fence.clone();
            move || fence.wait().unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        server.trigger();
        waiter.join().unwrap();
        assert!(fence.is_triggered());
    }
}
