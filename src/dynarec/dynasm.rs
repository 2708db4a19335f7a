//! Dynasm-rs x86_64 emitter for RV32 guests
//!
//! Register-register and register-immediate ALU instructions are emitted
//! inline against the guest register file in `rdi`. Anything else leaves the
//! block with the guest PC in `rax` for the dispatcher to interpret.
//! Only available on native builds with the `jit-dynasm` feature.

use dynasm::dynasm;
use dynasmrt::x64::X64Relocation;
use dynasmrt::{DynasmApi, VecAssembler};

use crate::cpu::rv32::{DecodedInst, OP_LUI, OP_OP, OP_OP_IMM};
use crate::cpu::Flow;

use super::emit::{EmitContext, Emitter};
use super::helper::{AbortReason, CompileHelper};

/// `mov rax, [rip + disp32]`
const MOV_RAX_RIP: [u8; 3] = [0x48, 0x8b, 0x05];
const MOV_RAX_RIP_LEN: i32 = 7;
const RET: u8 = 0xc3;
/// `jmp [rip + disp32]`
const JMP_RIP: [u8; 2] = [0xff, 0x25];
const INT3: u8 = 0xcc;

#[derive(Debug, Default, Clone, Copy)]
pub struct DynasmEmitter;

impl DynasmEmitter {
    /// Return to the dispatcher with `pc` as the next guest address
    fn emit_exit(ctx: &mut EmitContext<'_>, pc: u64) {
        let disp = ctx.table64(pc) - MOV_RAX_RIP_LEN;
        ctx.emit_bytes(&MOV_RAX_RIP);
        ctx.emit_bytes(&disp.to_le_bytes());
        ctx.emit_bytes(&[RET]);
    }

    fn assemble(raw: u32) -> Option<Vec<u8>> {
        let inst = DecodedInst::decode(raw);
        let mut ops = VecAssembler::<X64Relocation>::new(0);
        let ok = match inst.opcode {
            // x0 writes are NOPs
            OP_LUI | OP_OP | OP_OP_IMM if inst.rd == 0 => true,
            OP_LUI => {
                let rd_off = (inst.rd as i32) * 4;
                let imm = inst.imm_u;
                dynasm!(ops
                    ; .arch x64
                    ; mov DWORD [rdi + rd_off], imm
                );
                true
            }
            OP_OP => emit_r_type_alu(&mut ops, &inst),
            OP_OP_IMM => emit_i_type_alu(&mut ops, &inst),
            _ => false,
        };
        if !ok {
            return None;
        }
        ops.finalize().ok()
    }
}

fn emit_r_type_alu(ops: &mut VecAssembler<X64Relocation>, inst: &DecodedInst) -> bool {
    let rs1_off = (inst.rs1 as i32) * 4;
    let rs2_off = (inst.rs2 as i32) * 4;
    let rd_off = (inst.rd as i32) * 4;

    dynasm!(ops
        ; .arch x64
        ; mov eax, [rdi + rs1_off]
    );
    match (inst.funct3, inst.funct7) {
        (0b000, 0b0000000) => dynasm!(ops ; .arch x64 ; add eax, [rdi + rs2_off]),
        (0b000, 0b0100000) => dynasm!(ops ; .arch x64 ; sub eax, [rdi + rs2_off]),
        (0b111, 0b0000000) => dynasm!(ops ; .arch x64 ; and eax, [rdi + rs2_off]),
        (0b110, 0b0000000) => dynasm!(ops ; .arch x64 ; or eax, [rdi + rs2_off]),
        (0b100, 0b0000000) => dynasm!(ops ; .arch x64 ; xor eax, [rdi + rs2_off]),
        (0b001, 0b0000000) => dynasm!(ops ; .arch x64 ; mov ecx, [rdi + rs2_off] ; shl eax, cl),
        (0b101, 0b0000000) => dynasm!(ops ; .arch x64 ; mov ecx, [rdi + rs2_off] ; shr eax, cl),
        (0b101, 0b0100000) => dynasm!(ops ; .arch x64 ; mov ecx, [rdi + rs2_off] ; sar eax, cl),
        (0b010, 0b0000000) => dynasm!(ops
            ; .arch x64
            ; cmp eax, [rdi + rs2_off]
            ; setl al
            ; movzx eax, al
        ),
        (0b011, 0b0000000) => dynasm!(ops
            ; .arch x64
            ; cmp eax, [rdi + rs2_off]
            ; setb al
            ; movzx eax, al
        ),
        _ => return false,
    }
    dynasm!(ops
        ; .arch x64
        ; mov [rdi + rd_off], eax
    );
    true
}

fn emit_i_type_alu(ops: &mut VecAssembler<X64Relocation>, inst: &DecodedInst) -> bool {
    let rs1_off = (inst.rs1 as i32) * 4;
    let rd_off = (inst.rd as i32) * 4;
    let imm = inst.imm_i;

    dynasm!(ops
        ; .arch x64
        ; mov eax, [rdi + rs1_off]
    );
    match inst.funct3 {
        0b000 => dynasm!(ops ; .arch x64 ; add eax, imm),
        0b111 => dynasm!(ops ; .arch x64 ; and eax, imm),
        0b110 => dynasm!(ops ; .arch x64 ; or eax, imm),
        0b100 => dynasm!(ops ; .arch x64 ; xor eax, imm),
        0b010 => dynasm!(ops
            ; .arch x64
            ; cmp eax, imm
            ; setl al
            ; movzx eax, al
        ),
        0b011 => dynasm!(ops
            ; .arch x64
            ; cmp eax, imm
            ; setb al
            ; movzx eax, al
        ),
        0b001 => {
            let shamt = (imm & 0x1f) as i8;
            dynasm!(ops ; .arch x64 ; shl eax, shamt);
        }
        0b101 => {
            let shamt = (imm & 0x1f) as i8;
            if (imm >> 10) & 1 == 1 {
                dynasm!(ops ; .arch x64 ; sar eax, shamt);
            } else {
                dynasm!(ops ; .arch x64 ; shr eax, shamt);
            }
        }
        _ => return false,
    }
    dynasm!(ops
        ; .arch x64
        ; mov [rdi + rd_off], eax
    );
    true
}

impl Emitter for DynasmEmitter {
    fn name(&self) -> &'static str {
        "dynasm-x64"
    }

    fn emit_inst(&self, ctx: &mut EmitContext<'_>, helper: &CompileHelper, ninst: usize) -> Result<(), AbortReason> {
        let inst = &helper.insts[ninst];
        if inst.guest.flow == Flow::Next && inst.guest.size == 4 {
            let raw = ctx
                .mem()
                .read_u32(inst.addr)
                .map_err(|f| AbortReason::Fault { addr: f.addr })?;
            if let Some(code) = Self::assemble(raw) {
                ctx.emit_bytes(&code);
                return Ok(());
            }
        }
        Self::emit_exit(ctx, inst.addr);
        Ok(())
    }

    fn emit_fallthrough(&self, ctx: &mut EmitContext<'_>, next: u64) -> Result<(), AbortReason> {
        Self::emit_exit(ctx, next);
        Ok(())
    }

    fn write_jmp_next(&self, code: &mut [u8], code_addr: usize, slot_addr: usize) {
        let disp = slot_addr.wrapping_sub(code_addr + 6) as u32;
        code[..2].copy_from_slice(&JMP_RIP);
        code[2..6].copy_from_slice(&disp.to_le_bytes());
        code[6..16].fill(INT3);
    }
}
