//! Emission passes
//!
//! Every emitter runs the same instruction walk several times:
//!
//! | pass | output |
//! |---|---|
//! | [`Pass::Float`] | nothing, settles emitter-side state |
//! | [`Pass::Size`] | native size per instruction, table64 entry count |
//! | [`Pass::Emit`] | native code, table64 and size map into the block region |
//! | [`Pass::Rehydrate`] | table64 and size map only, code came from the cache |
//!
//! Absolute values (guest addresses, helper pointers) live in table64 and
//! are loaded PC-relative, so the code bytes do not depend on where the block
//! or the guest module sits.

use crate::memory::GuestMemory;

use super::block::{split_inst_size, BlockLayout, PTR};
use super::helper::{AbortReason, CancelToken, CompileHelper};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Pass {
    Float = 1,
    Size = 2,
    Emit = 3,
    Rehydrate = 4,
}

impl Pass {
    /// The pass writes into a block region
    pub fn fills_region(self) -> bool {
        matches!(self, Pass::Emit | Pass::Rehydrate)
    }
}

/// Output cursor of one pass
pub struct EmitContext<'a> {
    pass: Pass,
    mem: &'a dyn GuestMemory,
    code: Option<&'a mut [u8]>,
    table: Option<&'a mut [u8]>,
    sizes: Option<&'a mut [u8]>,
    offset: usize,
    table64: Vec<u64>,
    /// Distance from the code start to table64
    table_start: usize,
    size_entries: usize,
    overflow: bool,
}

/// What a finished pass measured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    /// Unrounded native code size
    pub native_size: usize,
    pub table64: Vec<u64>,
    /// Number of size map entries
    pub size_entries: usize,
    /// Code, table64 or size map did not fit the region
    pub overflow: bool,
}

impl<'a> EmitContext<'a> {
    /// Context of a pass that produces no bytes
    pub fn dry(pass: Pass, mem: &'a dyn GuestMemory) -> Self {
        Self {
            pass,
            mem,
            code: None,
            table: None,
            sizes: None,
            offset: 0,
            table64: Vec::new(),
            table_start: 0,
            size_entries: 0,
            overflow: false,
        }
    }

    /// Context writing into a whole block region laid out as `layout`.
    /// Rehydration leaves the code section alone.
    pub fn in_region(pass: Pass, mem: &'a dyn GuestMemory, region: &'a mut [u8], layout: &BlockLayout) -> Option<Self> {
        if region.len() < layout.total() {
            return None;
        }
        let (_, rest) = region.split_at_mut(PTR);
        let (code, rest) = rest.split_at_mut(layout.native_size);
        let (table, rest) = rest.split_at_mut(layout.table64_size * 8);
        let (_, rest) = rest.split_at_mut(4 * PTR);
        let (sizes, _) = rest.split_at_mut(layout.insts_rsize);
        Some(Self {
            pass,
            mem,
            code: (pass == Pass::Emit).then_some(code),
            table: Some(table),
            sizes: Some(sizes),
            offset: 0,
            table64: Vec::new(),
            table_start: layout.native_size,
            size_entries: 0,
            overflow: false,
        })
    }

    pub fn pass(&self) -> Pass {
        self.pass
    }

    pub fn mem(&self) -> &dyn GuestMemory {
        self.mem
    }

    /// Current native offset from the code start
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        if let Some(code) = self.code.as_deref_mut() {
            match code.get_mut(self.offset..self.offset + bytes.len()) {
                Some(dst) => dst.copy_from_slice(bytes),
                None => self.overflow = true,
            }
        }
        self.offset += bytes.len();
    }

    pub fn emit_u32(&mut self, word: u32) {
        self.emit_bytes(&word.to_le_bytes());
    }

    /// Intern `val` in table64 and return its offset relative to the
    /// current native position
    pub fn table64(&mut self, val: u64) -> i32 {
        let idx = match self.table64.iter().position(|&v| v == val) {
            Some(idx) => idx,
            None => {
                self.table64.push(val);
                let idx = self.table64.len() - 1;
                if let Some(table) = self.table.as_deref_mut() {
                    match table.get_mut(idx * 8..idx * 8 + 8) {
                        Some(dst) => dst.copy_from_slice(&val.to_le_bytes()),
                        None => self.overflow = true,
                    }
                }
                idx
            }
        };
        (self.table_start as i64 + idx as i64 * 8 - self.offset as i64) as i32
    }

    /// Record one instruction in the size map
    pub fn add_inst(&mut self, guest: usize, native: usize) {
        for entry in split_inst_size(guest, native) {
            if let Some(sizes) = self.sizes.as_deref_mut() {
                match sizes.get_mut(self.size_entries) {
                    Some(b) => *b = entry.to_byte(),
                    None => self.overflow = true,
                }
            }
            self.size_entries += 1;
        }
    }

    pub fn finish(self) -> PassSummary {
        PassSummary {
            native_size: self.offset,
            table64: self.table64,
            size_entries: self.size_entries,
            overflow: self.overflow,
        }
    }
}

/// Per-architecture code generator
pub trait Emitter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Emit instruction `ninst` of the block
    fn emit_inst(&self, ctx: &mut EmitContext<'_>, helper: &CompileHelper, ninst: usize) -> Result<(), AbortReason>;

    /// Leave the block towards `next` after the last instruction
    fn emit_fallthrough(&self, ctx: &mut EmitContext<'_>, next: u64) -> Result<(), AbortReason>;

    /// Fill the 16-byte jump-next trampoline at `code_addr` so it jumps
    /// through the slot at `slot_addr`
    fn write_jmp_next(&self, code: &mut [u8], code_addr: usize, slot_addr: usize);
}

/// Run one pass of `emitter` over the block
pub fn run_pass(
    emitter: &dyn Emitter,
    helper: &mut CompileHelper,
    ctx: &mut EmitContext<'_>,
    cancel: &CancelToken,
) -> Result<(), AbortReason> {
    let n = helper.len();
    for i in 0..n {
        if cancel.is_cancelled() {
            return Err(AbortReason::Cancelled);
        }
        let start = ctx.offset();
        emitter.emit_inst(ctx, helper, i)?;
        let inst = &helper.insts[i];
        if i + 1 == n && inst.has_next {
            emitter.emit_fallthrough(ctx, inst.addr + inst.guest.size as u64)?;
        }
        let size = ctx.offset() - start;
        let inst = &mut helper.insts[i];
        inst.native_offset = start;
        inst.native_size = size;
        if ctx.pass() == Pass::Size {
            inst.size_pass2 = size;
        }
        ctx.add_inst(inst.guest.size as usize, size);
    }
    Ok(())
}

/// Word opcodes of the threaded-code format
pub mod op {
    pub const INST: u32 = 0x01;
    pub const PURGE: u32 = 0x02;
    pub const JUMP_LOCAL: u32 = 0x03;
    pub const JUMP_EXT: u32 = 0x04;
    pub const CALL: u32 = 0x05;
    pub const STOP: u32 = 0x06;
    pub const EXIT: u32 = 0x07;
    pub const TRAMPOLINE: u32 = 0x08;
    /// Jump is conditional
    pub const COND: u32 = 0x80;
}

/// Target-independent emitter producing a stream of 32-bit words that a
/// dispatcher interprets. Output only depends on the analysis results, so it
/// is a faithful witness of what the pipeline decided.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadedEmitter;

impl ThreadedEmitter {
    fn emit_delta(ctx: &mut EmitContext<'_>, val: u64) {
        let delta = ctx.table64(val);
        ctx.emit_u32(delta as u32);
    }
}

impl Emitter for ThreadedEmitter {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn emit_inst(&self, ctx: &mut EmitContext<'_>, helper: &CompileHelper, ninst: usize) -> Result<(), AbortReason> {
        use crate::cpu::Flow;

        let inst = &helper.insts[ninst];
        if inst.purge_ymm != 0 {
            ctx.emit_u32(op::PURGE | (inst.purge_ymm as u32) << 16);
        }
        ctx.emit_u32(
            op::INST
                | (inst.guest.size as u32) << 8
                | (inst.gen_flags as u32) << 16
                | (inst.need_after as u32) << 24,
        );
        match inst.guest.flow {
            Flow::Next => {}
            Flow::CondJump(target) | Flow::Jump(target) => {
                let cond = if matches!(inst.guest.flow, Flow::CondJump(_)) { op::COND } else { 0 };
                match inst.jmp_insts {
                    Some(k) => ctx.emit_u32(op::JUMP_LOCAL | cond | (k as u32) << 8),
                    None => {
                        ctx.emit_u32(op::JUMP_EXT | cond);
                        Self::emit_delta(ctx, target);
                    }
                }
            }
            Flow::Call(target) => {
                ctx.emit_u32(op::CALL);
                Self::emit_delta(ctx, target);
                Self::emit_delta(ctx, inst.addr + inst.guest.size as u64);
            }
            Flow::Stop => {
                ctx.emit_u32(op::STOP);
                Self::emit_delta(ctx, inst.addr);
            }
        }
        Ok(())
    }

    fn emit_fallthrough(&self, ctx: &mut EmitContext<'_>, next: u64) -> Result<(), AbortReason> {
        ctx.emit_u32(op::EXIT);
        Self::emit_delta(ctx, next);
        Ok(())
    }

    fn write_jmp_next(&self, code: &mut [u8], code_addr: usize, slot_addr: usize) {
        let rel = slot_addr.wrapping_sub(code_addr) as u32;
        code[..4].copy_from_slice(&op::TRAMPOLINE.to_le_bytes());
        code[4..8].copy_from_slice(&rel.to_le_bytes());
        code[8..16].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{Flow, GuestInst};
    use crate::dynarec::block::{insts_rsize, InstSize};
    use crate::memory::FlatMemory;

    fn block() -> CompileHelper {
        let mut h = CompileHelper::new(0x1000, true, false);
        h.push(0x1000, GuestInst::plain(4));
        h.push(
            0x1004,
            GuestInst {
                size: 4,
                flow: Flow::CondJump(0x1000),
                ..Default::default()
            },
        );
        h.push(
            0x1008,
            GuestInst {
                size: 4,
                flow: Flow::Call(0x4000),
                ..Default::default()
            },
        );
        h.insts[1].jmp_insts = Some(0);
        h
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn test_dry_passes_agree_on_size() {
        let mem = FlatMemory::zeroed(0x1000, 0x100);
        let cancel = CancelToken::default();
        let mut h = block();
        let mut ctx = EmitContext::dry(Pass::Float, &mem);
        run_pass(&ThreadedEmitter, &mut h, &mut ctx, &cancel).unwrap();
        let p1 = ctx.finish();
        let mut ctx = EmitContext::dry(Pass::Size, &mem);
        run_pass(&ThreadedEmitter, &mut h, &mut ctx, &cancel).unwrap();
        let p2 = ctx.finish();
        assert_eq!(p1.native_size, p2.native_size);
        // inst, jump local, inst+call+2 deltas, exit+delta
        assert_eq!(p2.native_size, 4 + 8 + 16 + 8);
        assert_eq!(p2.table64, vec![0x4000, 0x100c]);
        assert_eq!(h.insts[2].size_pass2, 24);
        assert_eq!(p2.size_entries, 4);
    }

    #[test]
    fn test_emit_writes_code_table_and_sizes() {
        let mem = FlatMemory::zeroed(0x1000, 0x100);
        let cancel = CancelToken::default();
        let mut h = block();
        let mut ctx = EmitContext::dry(Pass::Size, &mem);
        run_pass(&ThreadedEmitter, &mut h, &mut ctx, &cancel).unwrap();
        let p2 = ctx.finish();

        let layout = BlockLayout::new(p2.native_size, p2.table64.len(), insts_rsize(p2.size_entries));
        let mut region = vec![0u8; layout.total()];
        let mut ctx = EmitContext::in_region(Pass::Emit, &mem, &mut region, &layout).unwrap();
        run_pass(&ThreadedEmitter, &mut h, &mut ctx, &cancel).unwrap();
        let p3 = ctx.finish();
        assert_eq!(p3, p2.clone());

        let code = words(&region[8..8 + layout.native_size]);
        assert_eq!(code[0], op::INST | 4 << 8);
        assert_eq!(code[2], op::JUMP_LOCAL | op::COND);
        assert_eq!(code[4], op::CALL);
        // first delta at offset 20 reaches table entry 0 at layout.native_size
        assert_eq!(code[5] as i32, layout.native_size as i32 - 20);
        assert_eq!(code[6] as i32, layout.native_size as i32 + 8 - 24);

        let table = &region[layout.table_offset()..layout.next_offset()];
        assert_eq!(u64::from_le_bytes(table[..8].try_into().unwrap()), 0x4000);
        let sizes = &region[layout.insts_offset()..layout.insts_offset() + layout.insts_rsize];
        assert_eq!(InstSize::from_byte(sizes[0]), InstSize { guest: 4, native: 4 });
        assert_eq!(InstSize::from_byte(sizes[1]), InstSize { guest: 4, native: 8 });
        assert_eq!(InstSize::from_byte(sizes[2]), InstSize { guest: 4, native: 15 });
        assert_eq!(InstSize::from_byte(sizes[3]), InstSize { guest: 0, native: 9 });
        assert_eq!(sizes[4], 0);
    }

    #[test]
    fn test_rehydrate_leaves_code_untouched() {
        let mem = FlatMemory::zeroed(0x1000, 0x100);
        let cancel = CancelToken::default();
        let mut h = block();
        let mut ctx = EmitContext::dry(Pass::Size, &mem);
        run_pass(&ThreadedEmitter, &mut h, &mut ctx, &cancel).unwrap();
        let p2 = ctx.finish();
        let layout = BlockLayout::new(p2.native_size, p2.table64.len(), insts_rsize(p2.size_entries));
        let mut region = vec![0xaau8; layout.total()];
        let mut ctx = EmitContext::in_region(Pass::Rehydrate, &mem, &mut region, &layout).unwrap();
        run_pass(&ThreadedEmitter, &mut h, &mut ctx, &cancel).unwrap();
        assert_eq!(ctx.finish().native_size, p2.native_size);
        assert!(region[8..8 + layout.native_size].iter().all(|&b| b == 0xaa));
        let table = &region[layout.table_offset()..layout.table_offset() + 8];
        assert_eq!(u64::from_le_bytes(table.try_into().unwrap()), 0x4000);
    }

    #[test]
    fn test_table64_dedups() {
        let mem = FlatMemory::zeroed(0, 0x10);
        let mut ctx = EmitContext::dry(Pass::Size, &mem);
        let a = ctx.table64(7);
        ctx.emit_u32(0);
        let b = ctx.table64(7);
        assert_eq!(a - 4, b);
        ctx.table64(9);
        assert_eq!(ctx.finish().table64, vec![7, 9]);
    }

    #[test]
    fn test_small_region_overflows() {
        let mem = FlatMemory::zeroed(0x1000, 0x100);
        let cancel = CancelToken::default();
        let mut h = block();
        let layout = BlockLayout::new(8, 1, insts_rsize(1));
        let mut region = vec![0u8; layout.total()];
        let mut ctx = EmitContext::in_region(Pass::Emit, &mem, &mut region, &layout).unwrap();
        run_pass(&ThreadedEmitter, &mut h, &mut ctx, &cancel).unwrap();
        assert!(ctx.finish().overflow);
    }

    #[test]
    fn test_trampoline_points_at_slot() {
        let mut code = [0xffu8; 16];
        ThreadedEmitter.write_jmp_next(&mut code, 0x1000, 0x1010);
        assert_eq!(words(&code), vec![op::TRAMPOLINE, 0x10, 0, 0]);
    }
}
