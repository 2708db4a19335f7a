//! Per-compile state shared by the translation passes

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cpu::GuestInst;

/// Why a compile produced no block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Guest bytes could not be decoded
    Decode { addr: u64 },
    /// Guest memory fault while reading code
    Fault { addr: u64 },
    /// A fault cancelled the compile from outside
    Cancelled,
    /// Another compile is in flight on this context
    Busy,
    /// First page lost its protection during discovery
    RacingWrite,
    /// Guest code changed between discovery and emission
    GuestChanged,
    /// Pass 2 and pass 3 disagree on the native size
    SizeMismatch,
    /// Cached code does not replay to the sizes its metadata records
    CacheMismatch,
    /// Executable memory could not be mapped
    Alloc,
    /// The emitter gave up on an instruction
    Emit(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Decode { addr } => write!(f, "undecodable instruction at {addr:#x}"),
            AbortReason::Fault { addr } => write!(f, "guest fault at {addr:#x}"),
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::Busy => f.write_str("another compile in flight"),
            AbortReason::RacingWrite => f.write_str("write on first page during discovery"),
            AbortReason::GuestChanged => f.write_str("guest code changed while compiling"),
            AbortReason::SizeMismatch => f.write_str("pass 2 / pass 3 size mismatch"),
            AbortReason::CacheMismatch => f.write_str("cached block does not match its metadata"),
            AbortReason::Alloc => f.write_str("executable memory allocation failed"),
            AbortReason::Emit(msg) => write!(f, "emitter: {msg}"),
        }
    }
}

/// Analysis and emission state of one guest instruction
#[derive(Debug, Clone, Default)]
pub struct InstState {
    pub addr: u64,
    pub guest: GuestInst,
    /// Index of the in-block jump target
    pub jmp_insts: Option<usize>,
    pub alive: bool,
    pub has_next: bool,
    pub barrier: u8,
    pub need_before: u8,
    pub need_after: u8,
    /// Flags this instruction must actually materialize
    pub gen_flags: u8,
    pub pred: Vec<usize>,
    pub ymm0_in: u16,
    pub ymm0_out: u16,
    pub purge_ymm: u16,
    /// Native offset of the instruction in the last pass
    pub native_offset: usize,
    /// Native size measured in pass 2
    pub size_pass2: usize,
    /// Native size measured in the last emitting pass
    pub native_size: usize,
}

impl InstState {
    pub fn new(addr: u64, guest: GuestInst) -> Self {
        Self {
            addr,
            has_next: guest.has_next(),
            barrier: guest.barrier,
            guest,
            ..Default::default()
        }
    }
}

/// Shared mutable context of one compile
#[derive(Debug, Clone)]
pub struct CompileHelper {
    pub start: u64,
    pub is32: bool,
    pub alternate: bool,
    pub insts: Vec<InstState>,
    /// Instructions with a static jump target
    pub jmps: Vec<usize>,
    /// Pending forward targets for big-block continuation
    next: Vec<u64>,
    /// Guest bytes covered by `insts`
    pub isize: u64,
    pub always_test: bool,
    pub abort: Option<AbortReason>,
}

impl CompileHelper {
    pub fn new(start: u64, is32: bool, alternate: bool) -> Self {
        Self {
            start,
            is32,
            alternate,
            insts: Vec::new(),
            jmps: Vec::new(),
            next: Vec::new(),
            isize: 0,
            always_test: false,
            abort: None,
        }
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// One past the last live guest byte
    pub fn end(&self) -> u64 {
        self.start + self.isize
    }

    pub fn push(&mut self, addr: u64, guest: GuestInst) -> usize {
        let ninst = self.insts.len();
        if guest.jmp().is_some() {
            self.jmps.push(ninst);
        }
        self.isize += guest.size as u64;
        self.insts.push(InstState::new(addr, guest));
        ninst
    }

    /// Remember a forward target discovery may reach later
    pub fn add_next(&mut self, addr: u64) {
        if !self.next.contains(&addr) {
            self.next.push(addr);
        }
    }

    /// Closest remembered target at or after `addr`; targets behind are dropped
    pub fn closest_next(&mut self, addr: u64) -> Option<u64> {
        self.next.retain(|&n| n >= addr);
        self.next.iter().copied().min()
    }

    pub fn clear_next(&mut self) {
        self.next.clear();
    }

    /// Record an abort; the first reason sticks
    pub fn abort(&mut self, reason: AbortReason) {
        if self.abort.is_none() {
            self.abort = Some(reason);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_some()
    }
}

/// Cancellation from the fault path into an in-flight compile
#[derive(Debug, Default)]
pub struct CancelToken(AtomicBool);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// At most one compile in flight per context
#[derive(Debug, Default)]
pub struct CompileSlot(AtomicBool);

impl CompileSlot {
    pub fn try_enter(&self) -> Option<CompileGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CompileGuard(&self.0))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct CompileGuard<'a>(&'a AtomicBool);

impl Drop for CompileGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Flow;

    #[test]
    fn test_push_tracks_jumps_and_size() {
        let mut h = CompileHelper::new(0x1000, true, false);
        h.push(0x1000, GuestInst::plain(4));
        let j = h.push(
            0x1004,
            GuestInst {
                size: 4,
                flow: Flow::CondJump(0x1000),
                ..Default::default()
            },
        );
        assert_eq!(h.jmps, vec![j]);
        assert_eq!(h.end(), 0x1008);
        assert!(h.insts[j].has_next);
    }

    #[test]
    fn test_closest_next_drops_passed_targets() {
        let mut h = CompileHelper::new(0, true, false);
        h.add_next(0x20);
        h.add_next(0x10);
        h.add_next(0x10);
        assert_eq!(h.closest_next(0x8), Some(0x10));
        assert_eq!(h.closest_next(0x11), Some(0x20));
        assert_eq!(h.closest_next(0x21), None);
    }

    #[test]
    fn test_first_abort_reason_sticks() {
        let mut h = CompileHelper::new(0, true, false);
        h.abort(AbortReason::Cancelled);
        h.abort(AbortReason::Busy);
        assert_eq!(h.abort, Some(AbortReason::Cancelled));
    }

    #[test]
    fn test_compile_slot_is_exclusive() {
        let slot = CompileSlot::default();
        let guard = slot.try_enter().unwrap();
        assert!(slot.is_busy());
        assert!(slot.try_enter().is_none());
        drop(guard);
        assert!(slot.try_enter().is_some());
    }
}
