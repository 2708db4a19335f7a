//! Translated blocks
//!
//! A block owns one executable region laid out as
//!
//! ```text
//! 0x00            back-pointer to the block
//! 0x08            native code (rounded up to 8)
//! A               table64: constants loaded PC-relative by the code
//! B               back-pointer again (the trampoline looks like a block)
//! B+0x08..0x18    jump-next trampoline code
//! B+0x18          jump-next target slot
//! B+0x20          instruction size map, (guest, native) nibbles, 0-terminated
//! ```
//!
//! An empty block only has the back-pointer and a trampoline to the epilog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::DynarecError;
use crate::memory::exec::ExecRegion;

/// Width of a pointer slot in the block layout
pub const PTR: usize = 8;
/// Bytes reserved for the jump-next trampoline
pub const JMPNEXT_CODE: usize = 2 * PTR;
/// Size of an empty block region
pub const EMPTY_BLOCK_SIZE: usize = 4 * PTR;

#[inline]
pub fn round8(n: usize) -> usize {
    (n + 7) & !7
}

/// Byte length reserved for a size map of `count` entries
pub fn insts_rsize(count: usize) -> usize {
    round8(count + 2)
}

/// Offsets of the block sections inside the region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// Native code bytes, already rounded to 8
    pub native_size: usize,
    /// Number of table64 entries
    pub table64_size: usize,
    /// Bytes reserved for the size map
    pub insts_rsize: usize,
}

impl BlockLayout {
    pub fn new(native_size: usize, table64_size: usize, insts_rsize: usize) -> Self {
        Self {
            native_size: round8(native_size),
            table64_size,
            insts_rsize,
        }
    }

    /// Region size
    pub fn total(&self) -> usize {
        PTR + self.native_size + self.table64_size * 8 + 4 * PTR + self.insts_rsize
    }

    pub fn code_offset(&self) -> usize {
        PTR
    }

    pub fn table_offset(&self) -> usize {
        PTR + self.native_size
    }

    pub fn next_offset(&self) -> usize {
        self.table_offset() + self.table64_size * 8
    }

    pub fn jmpnext_offset(&self) -> usize {
        self.next_offset() + PTR
    }

    pub fn jmpnext_slot_offset(&self) -> usize {
        self.next_offset() + 3 * PTR
    }

    pub fn insts_offset(&self) -> usize {
        self.next_offset() + 4 * PTR
    }
}

/// One entry of the instruction size map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstSize {
    pub guest: u8,
    pub native: u8,
}

impl InstSize {
    pub fn to_byte(self) -> u8 {
        (self.guest & 0xf) | (self.native << 4)
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            guest: b & 0xf,
            native: b >> 4,
        }
    }

    pub fn is_end(self) -> bool {
        self.guest == 0 && self.native == 0
    }
}

/// Split one instruction's sizes into map entries of at most 15 each
pub fn split_inst_size(guest: usize, native: usize) -> impl Iterator<Item = InstSize> {
    let count = guest.max(native).div_ceil(15).max(1);
    let (mut guest, mut native) = (guest, native);
    (0..count).map(move |_| {
        let g = guest.min(15);
        let n = native.min(15);
        guest -= g;
        native -= n;
        InstSize {
            guest: g as u8,
            native: n as u8,
        }
    })
}

/// Everything the pipeline produces for one block, before it goes live
#[derive(Debug)]
pub(crate) struct BlockParts {
    pub guest_addr: u64,
    pub guest_size: u64,
    pub hash: u32,
    pub isize: u32,
    pub always_test: bool,
    pub dirty: bool,
    pub alternate: bool,
    pub layout: Option<BlockLayout>,
    pub region: ExecRegion,
    pub jump_targets: Vec<u64>,
}

pub struct DynaBlock {
    guest_addr: u64,
    guest_size: u64,
    hash: u32,
    isize: u32,
    always_test: bool,
    dirty: bool,
    alternate: bool,
    layout: Option<BlockLayout>,
    region: ExecRegion,
    jump_targets: Vec<u64>,
    done: AtomicBool,
    gone: AtomicBool,
    freed: AtomicBool,
    previous: Mutex<Option<Arc<DynaBlock>>>,
}

impl DynaBlock {
    /// Write the back-pointers, seal the region and publish the block.
    /// `flush` is false when the caller batches the icache flush.
    pub(crate) fn assemble(parts: BlockParts, flush: bool) -> Result<Arc<Self>, DynarecError> {
        let BlockParts {
            guest_addr,
            guest_size,
            hash,
            isize,
            always_test,
            dirty,
            alternate,
            layout,
            mut region,
            jump_targets,
        } = parts;

        let mut sealed = Ok(());
        let block = Arc::new_cyclic(|me: &Weak<DynaBlock>| {
            let me = (me.as_ptr() as usize as u64).to_le_bytes();
            if let Some(bytes) = region.bytes_mut() {
                bytes[..PTR].copy_from_slice(&me);
                if let Some(l) = &layout {
                    let next = l.next_offset();
                    bytes[next..next + PTR].copy_from_slice(&me);
                }
            }
            sealed = region.seal(flush);
            DynaBlock {
                guest_addr,
                guest_size,
                hash,
                isize,
                always_test,
                dirty,
                alternate,
                layout,
                region,
                jump_targets,
                done: AtomicBool::new(false),
                gone: AtomicBool::new(false),
                freed: AtomicBool::new(false),
                previous: Mutex::new(None),
            }
        });
        sealed?;
        Ok(block)
    }

    pub fn guest_addr(&self) -> u64 {
        self.guest_addr
    }

    pub fn guest_size(&self) -> u64 {
        self.guest_size
    }

    /// One past the last guest byte
    pub fn guest_end(&self) -> u64 {
        self.guest_addr + self.guest_size
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Number of guest instructions
    pub fn isize(&self) -> u32 {
        self.isize
    }

    pub fn always_test(&self) -> bool {
        self.always_test
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn alternate(&self) -> bool {
        self.alternate
    }

    pub fn layout(&self) -> Option<&BlockLayout> {
        self.layout.as_ref()
    }

    /// Block with no translated code, only a jump to the epilog
    pub fn is_empty_block(&self) -> bool {
        self.layout.is_none()
    }

    /// Static jump targets leaving the block
    pub fn jump_targets(&self) -> &[u64] {
        &self.jump_targets
    }

    pub fn region(&self) -> &ExecRegion {
        &self.region
    }

    /// Region size in bytes
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Native entry point
    pub fn entry(&self) -> usize {
        self.region.base() + PTR
    }

    /// Validating trampoline
    pub fn jmpnext(&self) -> usize {
        match &self.layout {
            Some(l) => self.region.base() + l.jmpnext_offset(),
            None => self.entry(),
        }
    }

    /// Translated native code
    pub fn code(&self) -> &[u8] {
        match &self.layout {
            Some(l) => &self.region.bytes()[l.code_offset()..l.code_offset() + l.native_size],
            None => &[],
        }
    }

    /// Constants of the table64 section
    pub fn table64(&self) -> Vec<u64> {
        let Some(l) = &self.layout else {
            return Vec::new();
        };
        self.region.bytes()[l.table_offset()..l.next_offset()]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap_or_default()))
            .collect()
    }

    /// The size map up to its terminator
    pub fn inst_sizes(&self) -> Vec<InstSize> {
        let Some(l) = &self.layout else {
            return Vec::new();
        };
        self.region.bytes()[l.insts_offset()..l.insts_offset() + l.insts_rsize]
            .iter()
            .map(|&b| InstSize::from_byte(b))
            .take_while(|e| !e.is_end())
            .collect()
    }

    /// Value of the back-pointer at the start of the region
    pub fn back_pointer(&self) -> usize {
        let bytes = self.region.bytes();
        u64::from_le_bytes(bytes[..PTR].try_into().unwrap_or_default()) as usize
    }

    /// Guest address of the instruction whose native code contains `pc`
    pub fn guest_address_of(&self, pc: usize) -> Option<u64> {
        let l = self.layout.as_ref()?;
        let start = self.entry();
        if pc < start || pc >= start + l.native_size {
            return None;
        }
        let mut native = start;
        let mut guest = self.guest_addr;
        for e in self.inst_sizes() {
            if pc < native + e.native as usize {
                return Some(guest);
            }
            native += e.native as usize;
            guest += e.guest as u64;
        }
        // alignment padding after the last instruction
        Some(guest.min(self.guest_end().saturating_sub(1)))
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn set_done(&self, done: bool) {
        self.done.store(done, Ordering::Release);
    }

    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    /// Flag the block gone; returns false if it already was
    pub(crate) fn retire(&self) -> bool {
        self.done.store(false, Ordering::Release);
        !self.gone.swap(true, Ordering::AcqRel)
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_freed(&self) -> bool {
        !self.freed.swap(true, Ordering::AcqRel)
    }

    pub fn previous(&self) -> Option<Arc<DynaBlock>> {
        self.previous.lock().clone()
    }

    pub(crate) fn take_previous(&self) -> Option<Arc<DynaBlock>> {
        self.previous.lock().take()
    }

    /// Link `prev` as the superseded block, returning the link it replaces
    pub(crate) fn set_previous(&self, prev: Option<Arc<DynaBlock>>) -> Option<Arc<DynaBlock>> {
        std::mem::replace(&mut *self.previous.lock(), prev)
    }

    /// Half-open overlap with `[addr, addr+size)`. A zero-size block
    /// occupies its start byte; a zero-size range overlaps nothing.
    pub fn overlaps(&self, addr: u64, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        let start = self.guest_addr;
        let end = start + self.guest_size.max(1);
        start < addr.saturating_add(size) && addr < end
    }
}

impl std::fmt::Debug for DynaBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynaBlock")
            .field("guest", &format_args!("{:#x}..{:#x}", self.guest_addr, self.guest_end()))
            .field("hash", &format_args!("{:#010x}", self.hash))
            .field("entry", &format_args!("{:#x}", self.entry()))
            .field("done", &self.is_done())
            .field("gone", &self.is_gone())
            .field("always_test", &self.always_test)
            .field("dirty", &self.dirty)
            .field("alternate", &self.alternate())
            .finish()
    }
}
