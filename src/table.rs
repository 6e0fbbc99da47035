use std::fmt;

use log::info;

use crate::{
    aspace::AddressSpace,
    config::MappingConfig,
    error::{ProbeError, Result},
};

/// The address `2^exponent`, or `None` if it does not fit in a pointer.
#[inline(always)]
pub fn address_of(exponent: u32) -> Option<usize> {
    1usize.checked_shl(exponent)
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MappingHandle
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// One established fixed-address mapping.
///
/// Handles are only ever created from a successful [`AddressSpace::map`], so every handle held
/// by a [`MappingTable`] is valid. The region is never unmapped; process teardown reclaims it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingHandle {
    exponent: u32,
    requested: usize,
    base: usize,
    size: usize,
}

impl MappingHandle {
    /// The exponent `i` whose address `2^i` was requested.
    #[inline(always)]
    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    /// The address that was requested.
    #[inline(always)]
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// The address that was obtained.
    #[inline(always)]
    pub fn base(&self) -> usize {
        self.base
    }

    /// The size of the mapping, in bytes.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Fill the first `len` bytes of the region with `byte`.
    ///
    /// # Safety
    ///
    /// `len` is not checked against [`Self::size`]. Writing past the mapping is a deliberate
    /// probe and faults unless the neighbouring memory happens to be mapped too.
    pub(crate) unsafe fn fill(&self, byte: u8, len: usize) {
        std::ptr::write_bytes(self.base as *mut u8, byte, len);
    }

    /// Read the first byte of the region. Volatile, since a process sharing the mapping may
    /// have changed it behind our back.
    pub(crate) fn first_byte(&self) -> u8 {
        unsafe { std::ptr::read_volatile(self.base as *const u8) }
    }
}

impl fmt::Display for MappingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "i={},addr={:#x},ptr={:#x}",
            self.exponent, self.requested, self.base
        )
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MappingTable
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The mappings of one run, index-aligned with the configured exponent range.
#[derive(Debug, Default)]
pub struct MappingTable {
    handles: Vec<MappingHandle>,
}

impl MappingTable {
    /// Map a region at `2^i` for every configured exponent `i`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Alloc`] if the table itself cannot be reserved, before any mapping
    /// is attempted. Mapping stops at the first [`ProbeError::Map`] or [`ProbeError::Exponent`];
    /// the handles gathered so far are dropped along with the table.
    pub fn map<A>(aspace: &mut A, config: &MappingConfig) -> Result<Self>
    where
        A: AddressSpace + ?Sized,
    {
        let count = config.len();
        let mut handles = Vec::new();
        handles
            .try_reserve_exact(count)
            .map_err(|_| ProbeError::Alloc(count))?;

        for exponent in config.exponents() {
            let requested = address_of(exponent).ok_or(ProbeError::Exponent(exponent))?;
            match aspace.map(requested, config.map_size(), config.mode()) {
                Ok(base) => {
                    let handle = MappingHandle {
                        exponent,
                        requested,
                        base,
                        size: config.map_size(),
                    };
                    info!("{}", handle);
                    handles.push(handle);
                }
                Err(source) => {
                    info!("i={},addr={:#x},ptr=MAP_FAILED", exponent, requested);
                    return Err(ProbeError::Map {
                        exponent,
                        addr: requested,
                        source,
                    });
                }
            }
        }

        Ok(MappingTable { handles })
    }

    /// The number of mappings held.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` if no mapping is held.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// The handle at `index`, i.e., for exponent `begin + index`.
    pub fn get(&self, index: usize) -> Option<&MappingHandle> {
        self.handles.get(index)
    }

    /// Iterate over the handles in exponent order.
    pub fn iter(&self) -> std::slice::Iter<'_, MappingHandle> {
        self.handles.iter()
    }
}

impl<'a> IntoIterator for &'a MappingTable {
    type Item = &'a MappingHandle;
    type IntoIter = std::slice::Iter<'a, MappingHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
