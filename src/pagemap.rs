use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::error::{ProbeError, Result};

/// The size of a page, as reported by `sysconf(3)`.
pub fn page_size() -> Result<u64> {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        -1 => Err(std::io::Error::last_os_error().into()),
        sz => Ok(sz as u64),
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// PageMapEntry
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of one virtual page, as read from `/proc/self/pagemap`.
///
/// Documentation about the bits can be found in Linux, at
/// [`Documentation/admin-guide/mm/pagemap.rst`](https://www.kernel.org/doc/html/latest/admin-guide/mm/pagemap.html).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapEntry(u64);

impl From<u64> for PageMapEntry {
    fn from(raw: u64) -> Self {
        PageMapEntry(raw)
    }
}

/// Constants are defined in Linux, at `fs/proc/task_mmu.c`.
impl PageMapEntry {
    pub const PM_PFRAME_BITS: u64 = 55;
    pub const PM_PFRAME_MASK: u64 = (1 << Self::PM_PFRAME_BITS) - 1;
    pub const PM_SOFT_DIRTY: u64 = 55;
    pub const PM_MMAP_EXCLUSIVE: u64 = 56;
    pub const PM_FILE: u64 = 61;
    pub const PM_SWAP: u64 = 62;
    pub const PM_PRESENT: u64 = 63;

    #[inline(always)]
    fn bit(&self, bit: u64) -> bool {
        self.0 >> bit & 1 == 1
    }

    /// Returns `true` if the page is backed by a physical frame.
    #[inline(always)]
    pub fn present(&self) -> bool {
        self.bit(Self::PM_PRESENT)
    }

    #[inline(always)]
    pub fn swapped(&self) -> bool {
        self.bit(Self::PM_SWAP)
    }

    /// Returns `true` if the page is file-backed or shared-anonymous.
    #[inline(always)]
    pub fn file_or_shared(&self) -> bool {
        self.bit(Self::PM_FILE)
    }

    /// Returns `true` if the frame is mapped by this process only. Before a copy-on-write fault
    /// a forked pair shares the frame and this is `false` on both sides.
    #[inline(always)]
    pub fn exclusively_mapped(&self) -> bool {
        self.bit(Self::PM_MMAP_EXCLUSIVE)
    }

    #[inline(always)]
    pub fn soft_dirty(&self) -> bool {
        self.bit(Self::PM_SOFT_DIRTY)
    }

    /// The page frame number if the page is present. Unprivileged readers get `Some(0)`.
    pub fn pfn(&self) -> Option<u64> {
        if self.present() {
            Some(self.0 & Self::PM_PFRAME_MASK)
        } else {
            None
        }
    }
}

impl fmt::Display for PageMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "present: {}; swapped: {}; file_or_shared: {}; exclusively_mapped: {}; soft_dirty: {}",
            self.present(),
            self.swapped(),
            self.file_or_shared(),
            self.exclusively_mapped(),
            self.soft_dirty(),
        )?;
        match self.pfn() {
            Some(pfn) => write!(f, "; pfn: 0x{:x}", pfn),
            None => Ok(()),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// PageMap
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A handle on `/proc/self/pagemap`.
///
/// `self` is resolved when the file is opened, so a forked child has to open its own.
#[derive(Debug)]
pub struct PageMap {
    pmf: File,
    page_size: u64,
}

impl PageMap {
    const PATH: &'static str = "/proc/self/pagemap";

    /// Open `/proc/self/pagemap` for the calling process.
    pub fn open() -> Result<Self> {
        Ok(PageMap {
            pmf: File::open(Self::PATH).map_err(|e| ProbeError::Open {
                path: Self::PATH.into(),
                source: e,
            })?,
            page_size: page_size()?,
        })
    }

    /// Read the entry of the page containing `addr`.
    pub fn entry(&mut self, addr: usize) -> Result<PageMapEntry> {
        let mut buf = [0; 8];
        let vpn = addr as u64 / self.page_size;
        self.pmf
            .seek(SeekFrom::Start(vpn * 8))
            .map_err(|e| ProbeError::Seek {
                path: Self::PATH.into(),
                source: e,
            })?;
        self.pmf
            .read_exact(&mut buf)
            .map_err(|e| ProbeError::Read {
                path: Self::PATH.into(),
                source: e,
            })?;
        Ok(u64::from_ne_bytes(buf).into())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
