//! Executable memory for translated blocks
//!
//! Each block owns one [`ExecRegion`]: mapped read+write while the pipeline
//! fills it, then sealed read+execute. The mapping is released on drop.
//!
//! The instruction cache must be flushed before a sealed region runs. Bulk
//! hydration seals without flushing and calls [`flush_icache_ranges`] once
//! for everything it touched.

use std::ptr::NonNull;

use crate::error::DynarecError;

#[cfg(unix)]
mod sys {
    use std::io;
    use std::ptr::NonNull;

    use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};

    pub fn page_size() -> usize {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 {
            4096
        } else {
            sz as usize
        }
    }

    pub fn map(len: usize) -> io::Result<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
    }

    pub fn seal(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        let rc = unsafe { libc::mprotect(ptr.as_ptr() as *mut c_void, len, PROT_READ | PROT_EXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn unmap(ptr: NonNull<u8>, len: usize) {
        unsafe {
            libc::munmap(ptr.as_ptr() as *mut c_void, len);
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::io;
    use std::ptr::NonNull;

    pub fn page_size() -> usize {
        4096
    }

    pub fn map(len: usize) -> io::Result<NonNull<u8>> {
        let layout = Layout::from_size_align(len, page_size()).map_err(io::Error::other)?;
        NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"))
    }

    pub fn seal(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn unmap(ptr: NonNull<u8>, len: usize) {
        if let Ok(layout) = Layout::from_size_align(len, page_size()) {
            unsafe { dealloc(ptr.as_ptr(), layout) }
        }
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
extern "C" {
    fn __clear_cache(start: *mut std::ffi::c_void, end: *mut std::ffi::c_void);
}

/// Make freshly written code at `[start, end)` visible to instruction fetch
pub fn flush_icache(start: usize, end: usize) {
    if start >= end {
        return;
    }
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        // coherent icache, only order the stores
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    unsafe {
        __clear_cache(start as *mut std::ffi::c_void, end as *mut std::ffi::c_void);
    }
}

/// One flush pass over a batch of regions
pub fn flush_icache_ranges(ranges: &[(usize, usize)]) {
    for &(start, end) in ranges {
        flush_icache(start, end);
    }
}

/// An owned mapping holding one block
pub struct ExecRegion {
    ptr: NonNull<u8>,
    len: usize,
    map_len: usize,
    sealed: bool,
}

// The region is written only through &mut self before sealing and read-only after.
unsafe impl Send for ExecRegion {}
unsafe impl Sync for ExecRegion {}

impl ExecRegion {
    /// Map `len` zeroed bytes, writable
    pub fn alloc(len: usize) -> Result<Self, DynarecError> {
        let page = sys::page_size();
        let map_len = len.max(1).div_ceil(page) * page;
        let ptr = sys::map(map_len).map_err(|source| DynarecError::ExecAlloc { size: len, source })?;
        Ok(Self {
            ptr,
            len,
            map_len,
            sealed: false,
        })
    }

    /// Host address of the first byte
    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> usize {
        self.base() + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.end()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Writable view, `None` once sealed
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.sealed {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    /// Switch to read+execute. With `flush`, also flush the icache for the region.
    pub fn seal(&mut self, flush: bool) -> Result<(), DynarecError> {
        if self.sealed {
            return Ok(());
        }
        sys::seal(self.ptr, self.map_len).map_err(|source| DynarecError::Protect {
            addr: self.base(),
            source,
        })?;
        self.sealed = true;
        if flush {
            flush_icache(self.base(), self.end());
        }
        Ok(())
    }
}

impl Drop for ExecRegion {
    fn drop(&mut self) {
        sys::unmap(self.ptr, self.map_len);
    }
}

impl std::fmt::Debug for ExecRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecRegion")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.len)
            .field("sealed", &self.sealed)
            .finish()
    }
}
