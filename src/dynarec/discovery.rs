//! Pass 0: block discovery
//!
//! Decodes forward from the block start and records every instruction
//! until the flow leaves the block. With big-block continuation, forward
//! targets seen on the way are remembered and discovery carries on past a
//! terminal instruction when one of them is the fall-through address.

use crate::cpu::Decoder;
use crate::error::DecodeError;
use crate::memory::GuestMemory;

use super::helper::{AbortReason, CancelToken, CompileHelper};

/// Padding bytes big-block mode 2 will step over
const MAX_PADDING: u64 = 15;

pub struct Discovery<'a> {
    pub mem: &'a dyn GuestMemory,
    pub decoder: &'a dyn Decoder,
    pub cancel: &'a CancelToken,
    pub bigblock: u8,
    pub max_insts: usize,
}

impl Discovery<'_> {
    /// Fill `helper` with the block's instructions; returns the end address
    pub fn run(&self, helper: &mut CompileHelper) -> u64 {
        let mut addr = helper.start;
        loop {
            if self.cancel.is_cancelled() {
                helper.abort(AbortReason::Cancelled);
                break;
            }
            if helper.len() >= self.max_insts {
                break;
            }
            let inst = match self.decoder.decode(self.mem, addr, helper.is32) {
                Ok(inst) => inst,
                Err(DecodeError::Fault(f)) => {
                    helper.abort(AbortReason::Fault { addr: f.addr });
                    break;
                }
                Err(DecodeError::Invalid { addr, .. }) => {
                    helper.abort(AbortReason::Decode { addr });
                    break;
                }
            };
            let next = addr + inst.size as u64;
            if self.bigblock > 0 {
                match inst.jmp() {
                    Some(target) if target > addr && inst.has_next() => helper.add_next(target),
                    _ => {}
                }
                if inst.has_callret() {
                    helper.add_next(next);
                }
            }
            let ends = inst.ends_block();
            helper.push(addr, inst);
            addr = next;
            if ends && !self.continues_at(helper, addr) {
                break;
            }
        }
        helper.clear_next();
        addr
    }

    fn continues_at(&self, helper: &mut CompileHelper, addr: u64) -> bool {
        if self.bigblock == 0 {
            return false;
        }
        match helper.closest_next(addr) {
            Some(n) if n == addr => true,
            Some(n) if self.bigblock > 1 && n - addr <= MAX_PADDING => {
                self.decoder.is_padding(self.mem, addr, n - addr)
            }
            _ => false,
        }
    }
}
