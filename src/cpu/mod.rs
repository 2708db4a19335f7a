//! Guest instruction model
//!
//! The translator is guest-architecture independent. A [`Decoder`] turns
//! guest bytes into a [`GuestInst`], which carries exactly what discovery and
//! flag/float analysis need: size, control flow, and the flag and float-width
//! effects of the instruction.

pub mod rv32;

use crate::error::DecodeError;
use crate::memory::GuestMemory;

/// Guest condition flags, in the bit layout the analysis works with
pub mod flags {
    pub const X_CF: u8 = 1 << 0;
    pub const X_PF: u8 = 1 << 1;
    pub const X_AF: u8 = 1 << 2;
    pub const X_ZF: u8 = 1 << 3;
    pub const X_SF: u8 = 1 << 4;
    pub const X_OF: u8 = 1 << 5;
    pub const X_ALL: u8 = 0x3f;
    /// Flags are still pending (lazily computed) at this point
    pub const X_PEND: u8 = 0x80;

    // How an instruction leaves the flag state
    pub const SF_UNKNOWN: u8 = 0;
    pub const SF_SET: u8 = 1;
    pub const SF_PENDING: u8 = 2;
    pub const SF_SET_PENDING: u8 = SF_SET | SF_PENDING;
    pub const SF_NODF: u8 = 4;
    pub const SF_SET_NODF: u8 = SF_SET | SF_NODF;
    pub const SF_SUBSET: u8 = 8;
    pub const SF_SUBSET_PENDING: u8 = SF_SUBSET | SF_PENDING;

    pub const BARRIER_NONE: u8 = 0;
    pub const BARRIER_FLAGS: u8 = 1;
    pub const BARRIER_FLOAT: u8 = 2;
    pub const BARRIER_FULL: u8 = BARRIER_FLAGS | BARRIER_FLOAT;
}

/// Control-flow class of a guest instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    /// Falls through to the next instruction
    #[default]
    Next,
    /// Jumps to a static target or falls through
    CondJump(u64),
    /// Always jumps to a static target
    Jump(u64),
    /// Calls a static target; execution resumes after the call
    Call(u64),
    /// Leaves the block through a dynamic target (return, indirect jump, trap)
    Stop,
}

/// Decoded guest instruction, as far as the translator cares
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestInst {
    pub size: u8,
    pub flow: Flow,
    pub barrier: u8,
    /// Branch does not force a barrier on its in-block target
    pub barrier_maybe: bool,
    pub use_flags: u8,
    pub set_flags: u8,
    pub state_flags: u8,
    /// Flags are only conditionally written
    pub may_set: bool,
    /// Float registers whose upper lanes this instruction zeroes
    pub ymm0_add: u16,
    /// Float registers whose upper lanes this instruction may dirty
    pub ymm0_sub: u16,
}

impl GuestInst {
    pub fn plain(size: u8) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    /// Static jump target, if any
    pub fn jmp(&self) -> Option<u64> {
        match self.flow {
            Flow::CondJump(t) | Flow::Jump(t) | Flow::Call(t) => Some(t),
            Flow::Next | Flow::Stop => None,
        }
    }

    /// Execution may continue with the next instruction
    pub fn has_next(&self) -> bool {
        matches!(self.flow, Flow::Next | Flow::CondJump(_) | Flow::Call(_))
    }

    pub fn has_callret(&self) -> bool {
        matches!(self.flow, Flow::Call(_))
    }

    /// Discovery stops after this instruction unless a pending target resumes it
    pub fn ends_block(&self) -> bool {
        matches!(self.flow, Flow::Jump(_) | Flow::Call(_) | Flow::Stop)
    }
}

/// Guest instruction decoder
pub trait Decoder: Send + Sync {
    /// Decode the instruction at `addr`. A fault reading guest memory is an error.
    fn decode(&self, mem: &dyn GuestMemory, addr: u64, is32: bool) -> Result<GuestInst, DecodeError>;

    /// Padding recognized between blocks (used by big-block continuation)
    fn is_padding(&self, _mem: &dyn GuestMemory, _addr: u64, _len: u64) -> bool {
        false
    }
}
