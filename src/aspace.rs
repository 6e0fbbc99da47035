use std::io;

use crate::config::MapMode;

/// Which side of a [`AddressSpace::fork`] the caller continues on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    /// The original process; carries the child's PID.
    Parent(u32),
    /// The newly created process.
    Child,
}

/// The two platform capabilities the probe is built on: establishing a fixed mapping and
/// duplicating the calling process.
///
/// # Safety
///
/// A successful [`AddressSpace::map`] must return the base of a region that stays readable and
/// writable for at least `len` bytes until the process exits. The pattern writer and verifier
/// dereference it without further checks.
pub unsafe trait AddressSpace {
    /// Request `len` bytes of read/write memory at `addr` with the given `mmap(2)` flags,
    /// returning the address actually obtained.
    fn map(&mut self, addr: usize, len: usize, mode: MapMode) -> io::Result<usize>;

    /// Duplicate the calling process.
    fn fork(&mut self) -> io::Result<Fork>;

    /// The identity of the calling process, re-read on every call.
    fn pid(&self) -> u32;
}

/// The address space of the running process, driven through `libc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Native;

unsafe impl AddressSpace for Native {
    fn map(&mut self, addr: usize, len: usize, mode: MapMode) -> io::Result<usize> {
        // No file descriptor is ever passed: without MAP_ANONYMOUS the kernel rejects the
        // request, which is one of the configurations worth observing.
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                mode.bits(),
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as usize)
        }
    }

    fn fork(&mut self) -> io::Result<Fork> {
        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(Fork::Child),
            child => Ok(Fork::Parent(child as u32)),
        }
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }
}
