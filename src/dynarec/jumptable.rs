//! Jump directory
//!
//! Maps a guest address to the native entry that currently serves it. The
//! fast path (`get`) is lock-free and may run concurrently with every
//! writer; each write is a single atomic operation on one slot.
//!
//! Layout: a three-level radix over the low 48 address bits, 16 bits per
//! level. Inner levels are created on first write and published through
//! `OnceLock`, so readers never see a half-built level.
//!
//! A slot holds a native address. Bit 0 tags the validating trampoline
//! ("jump next") as opposed to a direct block entry; both are 8-byte aligned.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

const LEVEL_BITS: u32 = 16;
const LEVEL_SIZE: usize = 1 << LEVEL_BITS;
const LEVEL_MASK: u64 = (LEVEL_SIZE as u64) - 1;
/// Highest guest address bit the directory covers
pub const ADDR_BITS: u32 = 3 * LEVEL_BITS;

const TAG_VALIDATING: usize = 1;

/// What the directory says about a guest address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpEntry {
    Empty,
    /// Native entry of a validated block
    Direct(usize),
    /// Trampoline that re-validates the block before running it
    Validating(usize),
}

impl JumpEntry {
    fn encode(self) -> usize {
        match self {
            JumpEntry::Empty => 0,
            JumpEntry::Direct(addr) => addr,
            JumpEntry::Validating(addr) => addr | TAG_VALIDATING,
        }
    }

    fn decode(raw: usize) -> Self {
        if raw == 0 {
            JumpEntry::Empty
        } else if raw & TAG_VALIDATING != 0 {
            JumpEntry::Validating(raw & !TAG_VALIDATING)
        } else {
            JumpEntry::Direct(raw)
        }
    }

    /// Native address behind the entry
    pub fn native(self) -> Option<usize> {
        match self {
            JumpEntry::Empty => None,
            JumpEntry::Direct(a) | JumpEntry::Validating(a) => Some(a),
        }
    }
}

type Leaf = Box<[AtomicUsize]>;
type Mid = Box<[OnceLock<Leaf>]>;

pub struct JumpTable {
    top: Box<[OnceLock<Mid>]>,
}

impl Default for JumpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JumpTable {
    pub fn new() -> Self {
        Self {
            top: (0..LEVEL_SIZE).map(|_| OnceLock::new()).collect(),
        }
    }

    #[inline]
    fn split(addr: u64) -> Option<(usize, usize, usize)> {
        if addr >> ADDR_BITS != 0 {
            return None;
        }
        Some((
            ((addr >> (2 * LEVEL_BITS)) & LEVEL_MASK) as usize,
            ((addr >> LEVEL_BITS) & LEVEL_MASK) as usize,
            (addr & LEVEL_MASK) as usize,
        ))
    }

    fn slot(&self, addr: u64) -> Option<&AtomicUsize> {
        let (i0, i1, i2) = Self::split(addr)?;
        let mid = self.top[i0].get()?;
        let leaf = mid[i1].get()?;
        Some(&leaf[i2])
    }

    fn slot_or_create(&self, addr: u64) -> Option<&AtomicUsize> {
        let (i0, i1, i2) = Self::split(addr)?;
        let mid = self.top[i0].get_or_init(|| (0..LEVEL_SIZE).map(|_| OnceLock::new()).collect());
        let leaf = mid[i1].get_or_init(|| (0..LEVEL_SIZE).map(|_| AtomicUsize::new(0)).collect());
        Some(&leaf[i2])
    }

    /// Lock-free lookup
    #[inline]
    pub fn get(&self, addr: u64) -> JumpEntry {
        self.slot(addr)
            .map(|s| JumpEntry::decode(s.load(Ordering::Acquire)))
            .unwrap_or(JumpEntry::Empty)
    }

    /// Install `entry` only if nothing serves `addr` yet
    pub fn add_if_default(&self, addr: u64, entry: JumpEntry) -> bool {
        self.set_if_ref(addr, entry, JumpEntry::Empty)
    }

    /// Replace the entry for `addr` only if it is still `expected`
    pub fn set_if_ref(&self, addr: u64, entry: JumpEntry, expected: JumpEntry) -> bool {
        let Some(slot) = self.slot_or_create(addr) else {
            tracing::warn!(addr = format_args!("{addr:#x}"), "address outside jump directory range");
            return false;
        };
        slot.compare_exchange(expected.encode(), entry.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally reset `addr` to the neutral entry
    pub fn set_default(&self, addr: u64) {
        if let Some(slot) = self.slot(addr) {
            slot.store(0, Ordering::Release);
        }
    }
}
