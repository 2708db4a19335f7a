//! Guest memory as seen by the translator
//!
//! The translator never owns guest memory. It reads bytes through
//! [`GuestMemory`] and asks the memory to write-protect the pages that back
//! live blocks, so that a later write flips the page into "needs test" and
//! the next block entry re-validates by hash.
//!
//! [`FlatMemory`] is a flat image with per-page protection tracking, used by
//! the CLI and the tests.

pub mod exec;
pub mod modules;

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;

pub use crate::error::GuestFault;

/// Guest page granularity for protection tracking
pub const PAGE_SIZE: u64 = 4096;

#[inline]
pub fn page_of(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Guest memory contract used by the translation core
pub trait GuestMemory: Send + Sync {
    /// Copy guest bytes starting at `addr` into `buf`
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), GuestFault>;

    /// True when every byte of `[addr, addr+len)` is backed by guest memory
    fn is_mapped(&self, addr: u64, len: u64) -> bool;

    /// Read `len` bytes into a fresh buffer. The range is checked before
    /// anything is allocated.
    fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>, GuestFault> {
        if !self.is_mapped(addr, len as u64) {
            return Err(GuestFault { addr });
        }
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    fn read_u32(&self, addr: u64) -> Result<u32, GuestFault> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write-protect every page touched by `[addr, addr+size)` so a later
    /// guest write is noticed. `size == 0` protects the page of `addr`.
    fn protect(&self, addr: u64, size: u64);

    /// True when every page of `[addr, addr+size)` is still protected
    fn is_protected(&self, addr: u64, size: u64) -> bool;

    /// True when the page of `addr` was written since it was protected
    fn need_test(&self, addr: u64) -> bool;

    /// Pages that can never be kept clean (e.g. shared writable mappings)
    fn never_clean(&self, _addr: u64) -> bool {
        false
    }

    /// Address is handled by an alternate entry mechanism and must not get a block
    fn has_alternate(&self, _addr: u64) -> bool {
        false
    }

    /// Page saw writes during a recent compile; callers skip translation there
    fn is_hot_page(&self, _addr: u64) -> bool {
        false
    }
}

// Page state, low bits
const PAGE_UNTRACKED: u8 = 0;
const PAGE_PROTECTED: u8 = 1;
const PAGE_NEED_TEST: u8 = 2;
const PAGE_STATE_MASK: u8 = 0x3;
// Page attributes, high bits
const PAGE_NEVER_CLEAN: u8 = 0x10;
const PAGE_HOT: u8 = 0x20;
const PAGE_ALTERNATE: u8 = 0x40;

/// Result of a guest write through [`FlatMemory::write`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Pages that were protected before the write and now need testing
    pub unprotected: Vec<u64>,
}

/// Flat guest image mapped at `base`
pub struct FlatMemory {
    base: u64,
    data: RwLock<Vec<u8>>,
    pages: Vec<AtomicU8>,
}

impl FlatMemory {
    pub fn new(base: u64, image: Vec<u8>) -> Self {
        let npages = (image.len() as u64).div_ceil(PAGE_SIZE) as usize;
        Self {
            base,
            data: RwLock::new(image),
            pages: (0..npages.max(1)).map(|_| AtomicU8::new(PAGE_UNTRACKED)).collect(),
        }
    }

    /// Zero-filled memory of `size` bytes
    pub fn zeroed(base: u64, size: usize) -> Self {
        Self::new(base, vec![0; size])
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn end(&self) -> u64 {
        self.base + self.len() as u64
    }

    fn offset(&self, addr: u64, len: usize) -> Result<usize, GuestFault> {
        let size = self.len() as u64;
        let off = addr.checked_sub(self.base).ok_or(GuestFault { addr })?;
        match off.checked_add(len as u64) {
            Some(end) if end <= size => Ok(off as usize),
            _ => Err(GuestFault { addr }),
        }
    }

    fn page_slot(&self, addr: u64) -> Option<&AtomicU8> {
        let off = addr.checked_sub(self.base)?;
        self.pages.get((off / PAGE_SIZE) as usize)
    }

    /// Page addresses covering `[addr, addr+size)`, at least the page of `addr`
    fn pages_in(addr: u64, size: u64) -> impl Iterator<Item = u64> {
        let first = page_of(addr);
        let last = page_of(addr + size.max(1) - 1);
        (first..=last).step_by(PAGE_SIZE as usize)
    }

    /// Guest store. Protected pages switch to "needs test".
    pub fn write(&self, addr: u64, bytes: &[u8]) -> Result<WriteOutcome, GuestFault> {
        let off = self.offset(addr, bytes.len())?;
        let mut outcome = WriteOutcome::default();
        for page in Self::pages_in(addr, bytes.len() as u64) {
            if let Some(slot) = self.page_slot(page) {
                let prev = slot
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                        (s & PAGE_STATE_MASK == PAGE_PROTECTED)
                            .then_some((s & !PAGE_STATE_MASK) | PAGE_NEED_TEST)
                    })
                    .is_ok();
                if prev {
                    outcome.unprotected.push(page);
                }
            }
        }
        self.data.write()[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(outcome)
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<WriteOutcome, GuestFault> {
        self.write(addr, &value.to_le_bytes())
    }

    fn set_attr(&self, addr: u64, size: u64, attr: u8, on: bool) {
        for page in Self::pages_in(addr, size) {
            if let Some(slot) = self.page_slot(page) {
                if on {
                    slot.fetch_or(attr, Ordering::AcqRel);
                } else {
                    slot.fetch_and(!attr, Ordering::AcqRel);
                }
            }
        }
    }

    pub fn set_never_clean(&self, addr: u64, size: u64) {
        self.set_attr(addr, size, PAGE_NEVER_CLEAN, true);
    }

    pub fn set_hot(&self, addr: u64, hot: bool) {
        self.set_attr(addr, 1, PAGE_HOT, hot);
    }

    pub fn set_alternate(&self, addr: u64, size: u64) {
        self.set_attr(addr, size, PAGE_ALTERNATE, true);
    }

    fn attr(&self, addr: u64, attr: u8) -> bool {
        self.page_slot(addr)
            .map(|s| s.load(Ordering::Acquire) & attr != 0)
            .unwrap_or(false)
    }
}

impl GuestMemory for FlatMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), GuestFault> {
        let off = self.offset(addr, buf.len())?;
        buf.copy_from_slice(&self.data.read()[off..off + buf.len()]);
        Ok(())
    }

    fn protect(&self, addr: u64, size: u64) {
        for page in Self::pages_in(addr, size) {
            if let Some(slot) = self.page_slot(page) {
                let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                    Some((s & !PAGE_STATE_MASK) | PAGE_PROTECTED)
                });
            }
        }
    }

    fn is_protected(&self, addr: u64, size: u64) -> bool {
        Self::pages_in(addr, size).all(|page| {
            self.page_slot(page)
                .map(|s| s.load(Ordering::Acquire) & PAGE_STATE_MASK == PAGE_PROTECTED)
                .unwrap_or(false)
        })
    }

    fn is_mapped(&self, addr: u64, len: u64) -> bool {
        usize::try_from(len).is_ok_and(|len| self.offset(addr, len).is_ok())
    }

    fn need_test(&self, addr: u64) -> bool {
        self.page_slot(addr)
            .map(|s| s.load(Ordering::Acquire) & PAGE_STATE_MASK == PAGE_NEED_TEST)
            .unwrap_or(false)
    }

    fn never_clean(&self, addr: u64) -> bool {
        self.attr(addr, PAGE_NEVER_CLEAN)
    }

    fn has_alternate(&self, addr: u64) -> bool {
        self.attr(addr, PAGE_ALTERNATE)
    }

    fn is_hot_page(&self, addr: u64) -> bool {
        self.attr(addr, PAGE_HOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bounds() {
        let mem = FlatMemory::new(0x1000, vec![1, 2, 3, 4]);
        let mut buf = [0u8; 4];
        mem.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(mem.read(0x1001, &mut buf), Err(GuestFault { addr: 0x1001 }));
        assert_eq!(mem.read(0xfff, &mut [0u8; 1]), Err(GuestFault { addr: 0xfff }));
    }

    #[test]
    fn test_huge_read_faults_without_allocating() {
        let mem = FlatMemory::new(0x1000, vec![1, 2, 3, 4]);
        assert!(mem.is_mapped(0x1000, 4));
        assert!(!mem.is_mapped(0x1000, 5));
        assert!(!mem.is_mapped(u64::MAX, 2));
        assert_eq!(mem.read_vec(0x1000, usize::MAX / 2), Err(GuestFault { addr: 0x1000 }));
        assert_eq!(mem.read_vec(0x1002, 2).unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_write_flips_protected_page() {
        let mem = FlatMemory::zeroed(0x10000, 3 * PAGE_SIZE as usize);
        mem.protect(0x10000, 0x1800);
        assert!(mem.is_protected(0x10000, 0x1800));
        assert!(!mem.is_protected(0x10000, 0x2001));

        let out = mem.write_u32(0x11004, 7).unwrap();
        assert_eq!(out.unprotected, vec![0x11000]);
        assert!(mem.need_test(0x11000));
        assert!(!mem.need_test(0x10000));
        assert!(mem.is_protected(0x10000, 1));
        assert!(!mem.is_protected(0x10000, 0x1800));

        // already unprotected: nothing reported
        let out = mem.write_u32(0x11008, 7).unwrap();
        assert!(out.unprotected.is_empty());

        mem.protect(0x11000, 4);
        assert!(!mem.need_test(0x11000));
        assert_eq!(mem.read_u32(0x11004).unwrap(), 7);
    }

    #[test]
    fn test_page_attributes() {
        let mem = FlatMemory::zeroed(0, 2 * PAGE_SIZE as usize);
        mem.set_never_clean(PAGE_SIZE, 1);
        mem.set_hot(0, true);
        assert!(mem.never_clean(PAGE_SIZE + 8));
        assert!(!mem.never_clean(8));
        assert!(mem.is_hot_page(4));
        mem.set_hot(0, false);
        assert!(!mem.is_hot_page(4));
        // attributes do not disturb protection state
        mem.protect(PAGE_SIZE, 1);
        assert!(mem.is_protected(PAGE_SIZE, 1));
    }
}
