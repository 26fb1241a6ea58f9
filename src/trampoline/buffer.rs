//! Bounds-checked access to executable memory.
//!
//! Every read and write the crate performs on machine code goes through [`ExecutableBuffer`].
//! Constructing one is the single `unsafe` step: the caller vouches that the region exists and
//! stays mapped. After that, all accesses are checked against the region length.

use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use crate::{Error, Result};

/// A view of a fixed-size region of executable memory.
#[derive(Debug)]
pub struct ExecutableBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The buffer is only a view. Synchronisation of the memory behind it is up to the owner, which
// in this crate is always the patch registry lock.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Creates a view of `len` bytes at `address`.
    ///
    /// # Safety
    ///
    /// `address..address + len` must be mapped, readable and writable for as long as the
    /// returned buffer is used, and must not be accessed concurrently by other code.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for a null address or a wrapping range.
    pub unsafe fn from_raw(address: usize, len: usize) -> Result<Self> {
        if address.checked_add(len).is_none() {
            return Err(out_of_bounds_error!());
        }
        let Some(ptr) = NonNull::new(address as *mut u8) else {
            return Err(out_of_bounds_error!());
        };
        Ok(ExecutableBuffer { ptr, len })
    }

    /// Start address of the region
    #[must_use]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Size of the region in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` for a zero-sized region
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, size: usize) -> Result<*mut u8> {
        match offset.checked_add(size) {
            // SAFETY: offset + size is within the region the constructor vouched for
            Some(end) if end <= self.len => Ok(unsafe { self.ptr.as_ptr().add(offset) }),
            _ => Err(out_of_bounds_error!()),
        }
    }

    /// Reads `len` bytes starting at `offset`
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn read_bytes_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let src = self.check(offset, len)?;
        let mut data = vec![0; len];
        // SAFETY: bounds checked above, `data` is a fresh allocation
        unsafe { ptr::copy_nonoverlapping(src, data.as_mut_ptr(), len) };
        Ok(data)
    }

    /// Reads a byte at `offset`
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn read_u8_at(&self, offset: usize) -> Result<u8> {
        let src = self.check(offset, 1)?;
        // SAFETY: bounds checked above
        Ok(unsafe { src.read() })
    }

    /// Reads a little-endian `u16` at `offset`
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn read_u16_at(&self, offset: usize) -> Result<u16> {
        let src = self.check(offset, 2)?;
        // SAFETY: bounds checked above
        Ok(u16::from_le(unsafe { src.cast::<u16>().read_unaligned() }))
    }

    /// Reads a little-endian `u32` at `offset`
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn read_u32_at(&self, offset: usize) -> Result<u32> {
        let src = self.check(offset, 4)?;
        // SAFETY: bounds checked above
        Ok(u32::from_le(unsafe { src.cast::<u32>().read_unaligned() }))
    }

    /// Reads a little-endian `u64` at `offset`
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn read_u64_at(&self, offset: usize) -> Result<u64> {
        let src = self.check(offset, 8)?;
        // SAFETY: bounds checked above
        Ok(u64::from_le(unsafe { src.cast::<u64>().read_unaligned() }))
    }

    /// Writes `data` starting at `offset`
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn write_bytes_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self.check(offset, data.len())?;
        // SAFETY: bounds checked above, `data` cannot alias memory we only hold a view of
        unsafe { ptr::copy(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Writes a byte at `offset`
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn write_u8_at(&mut self, offset: usize, value: u8) -> Result<()> {
        self.write_bytes_at(offset, &[value])
    }

    /// Writes a little-endian `u16` at `offset`
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn write_u16_at(&mut self, offset: usize, value: u16) -> Result<()> {
        self.write_bytes_at(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian `u32` at `offset`
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn write_u32_at(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_bytes_at(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian `u64` at `offset`
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region.
    pub fn write_u64_at(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write_bytes_at(offset, &value.to_le_bytes())
    }

    fn check_aligned(&self, offset: usize, size: usize) -> Result<*mut u8> {
        let dst = self.check(offset, size)?;
        if dst as usize % size != 0 {
            return Err(Error::FormatError(format!(
                "Atomic store target 0x{:x} is not {}-byte aligned",
                dst as usize, size
            )));
        }
        Ok(dst)
    }

    /// Writes a little-endian `u32` at `offset` with a single atomic store.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region and
    /// [`crate::Error::FormatError`] if the target is not 4-byte aligned.
    pub fn store_u32_at(&mut self, offset: usize, value: u32) -> Result<()> {
        let dst = self.check_aligned(offset, 4)?;
        // SAFETY: in bounds, aligned, and only ever accessed through this crate under the
        // registry lock
        let slot = unsafe { &*dst.cast::<AtomicU32>() };
        slot.store(value.to_le(), Ordering::SeqCst);
        Ok(())
    }

    /// Writes a little-endian `u64` at `offset` with a single atomic store, so code running
    /// concurrently observes either the old or the new value.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the region and
    /// [`crate::Error::FormatError`] if the target is not 8-byte aligned.
    pub fn store_u64_at(&mut self, offset: usize, value: u64) -> Result<()> {
        let dst = self.check_aligned(offset, 8)?;
        // SAFETY: see store_u32_at
        let slot = unsafe { &*dst.cast::<AtomicU64>() };
        slot.store(value.to_le(), Ordering::SeqCst);
        Ok(())
    }

    /// Makes freshly written code visible to instruction fetch
    pub fn flush(&self) {
        flush_instruction_cache(self.address(), self.len);
    }
}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// Marks every page touching `address..address + len` readable, writable and executable.
///
/// # Safety
///
/// The range must be mapped. Changing the protection of pages affects all other data on them.
///
/// # Errors
/// Returns [`crate::Error::Memory`] if the kernel refuses, and [`crate::Error::NotSupported`]
/// on platforms without `mprotect`.
pub unsafe fn make_writable(address: usize, len: usize) -> Result<()> {
    let page = page_size();
    let start = address & !(page - 1);
    let end = address
        .checked_add(len)
        .and_then(|end| end.checked_add(page - 1))
        .ok_or(out_of_bounds_error!())?
        & !(page - 1);

    #[cfg(unix)]
    {
        // SAFETY: the caller guarantees the range is mapped
        let result = unsafe {
            libc::mprotect(
                start as *mut libc::c_void,
                end - start,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(Error::Memory(std::io::Error::last_os_error()));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (start, end);
        Err(Error::NotSupported)
    }
}

/// Invalidates the instruction cache for a range of freshly written code.
///
/// x86 keeps instruction and data caches coherent, so this only does work on aarch64.
#[allow(unused_variables)]
fn flush_instruction_cache(address: usize, len: usize) {
    #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
    {
        extern "C" {
            fn __clear_cache(start: *mut libc::c_void, end: *mut libc::c_void);
        }
        // SAFETY: __clear_cache only performs cache maintenance on the given range
        unsafe {
            __clear_cache(
                address as *mut libc::c_void,
                (address + len) as *mut libc::c_void,
            );
        }
    }
    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    {
        extern "C" {
            fn sys_icache_invalidate(start: *mut libc::c_void, size: usize);
        }
        // SAFETY: sys_icache_invalidate only performs cache maintenance on the given range
        unsafe { sys_icache_invalidate(address as *mut libc::c_void, len) };
    }
}
