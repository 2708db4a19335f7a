//! RV32 reference decoder
//!
//! Classifies RV32I control flow for block discovery. Everything that is not
//! a branch, jump, call or system instruction is a plain fall-through; the
//! emitter gets the raw word through guest memory when it needs more.

use super::flags::BARRIER_FULL;
use super::{Decoder, Flow, GuestInst};
use crate::error::DecodeError;
use crate::memory::GuestMemory;

// Opcodes
pub const OP_LUI: u32 = 0b0110111;
pub const OP_AUIPC: u32 = 0b0010111;
pub const OP_JAL: u32 = 0b1101111;
pub const OP_JALR: u32 = 0b1100111;
pub const OP_BRANCH: u32 = 0b1100011;
pub const OP_LOAD: u32 = 0b0000011;
pub const OP_STORE: u32 = 0b0100011;
pub const OP_OP_IMM: u32 = 0b0010011;
pub const OP_OP: u32 = 0b0110011;
pub const OP_MISC_MEM: u32 = 0b0001111;
pub const OP_SYSTEM: u32 = 0b1110011;
pub const OP_AMO: u32 = 0b0101111;

const FUNCT3_FENCE_I: u32 = 0b001;

/// `addi x0, x0, 0`
pub const NOP: u32 = 0x0000_0013;

/// Decoded instruction fields
#[derive(Debug, Clone, Copy)]
pub struct DecodedInst {
    pub opcode: u32,
    pub rd: u32,
    pub rs1: u32,
    pub rs2: u32,
    pub funct3: u32,
    pub funct7: u32,
    pub imm_i: i32,
    pub imm_b: i32,
    pub imm_u: i32,
    pub imm_j: i32,
}

impl DecodedInst {
    #[inline(always)]
    pub fn decode(inst: u32) -> Self {
        // B-type immediate
        let imm_b = ((inst & 0x80000000) as i32 >> 19)
            | (((inst >> 7) & 1) << 11) as i32
            | (((inst >> 25) & 0x3F) << 5) as i32
            | (((inst >> 8) & 0xF) << 1) as i32;

        // J-type immediate
        let imm_j = ((inst & 0x80000000) as i32 >> 11)
            | (inst & 0xFF000) as i32
            | (((inst >> 20) & 1) << 11) as i32
            | (((inst >> 21) & 0x3FF) << 1) as i32;

        DecodedInst {
            opcode: inst & 0x7F,
            rd: (inst >> 7) & 0x1F,
            rs1: (inst >> 15) & 0x1F,
            rs2: (inst >> 20) & 0x1F,
            funct3: (inst >> 12) & 0x7,
            funct7: (inst >> 25) & 0x7F,
            imm_i: (inst as i32) >> 20,
            imm_b,
            imm_u: (inst & 0xFFFFF000) as i32,
            imm_j,
        }
    }
}

#[inline]
fn target(pc: u64, offset: i32, is32: bool) -> u64 {
    let t = pc.wrapping_add(offset as i64 as u64);
    if is32 {
        t & 0xffff_ffff
    } else {
        t
    }
}

/// Control-flow classification of one 32-bit word at `pc`
pub fn classify(raw: u32, pc: u64, is32: bool) -> GuestInst {
    let mut inst = GuestInst::plain(4);

    // compressed encodings are not handled: hand them back to the dispatcher
    if raw & 0b11 != 0b11 {
        inst.size = 2;
        inst.flow = Flow::Stop;
        inst.barrier = BARRIER_FULL;
        return inst;
    }

    let d = DecodedInst::decode(raw);
    match d.opcode {
        OP_BRANCH => inst.flow = Flow::CondJump(target(pc, d.imm_b, is32)),
        OP_JAL if d.rd == 0 => inst.flow = Flow::Jump(target(pc, d.imm_j, is32)),
        OP_JAL => inst.flow = Flow::Call(target(pc, d.imm_j, is32)),
        OP_JALR => inst.flow = Flow::Stop,
        OP_SYSTEM => {
            inst.flow = Flow::Stop;
            inst.barrier = BARRIER_FULL;
        }
        OP_MISC_MEM if d.funct3 == FUNCT3_FENCE_I => {
            inst.flow = Flow::Stop;
            inst.barrier = BARRIER_FULL;
        }
        OP_LUI | OP_AUIPC | OP_LOAD | OP_STORE | OP_OP_IMM | OP_OP | OP_MISC_MEM | OP_AMO => {}
        _ => {
            inst.flow = Flow::Stop;
            inst.barrier = BARRIER_FULL;
        }
    }
    inst
}

/// Reference decoder for RV32 guests
#[derive(Debug, Default, Clone, Copy)]
pub struct Rv32Decoder;

impl Decoder for Rv32Decoder {
    fn decode(&self, mem: &dyn GuestMemory, addr: u64, is32: bool) -> Result<GuestInst, DecodeError> {
        let mut half = [0u8; 2];
        mem.read(addr, &mut half)?;
        if u16::from_le_bytes(half) & 0b11 != 0b11 {
            return Ok(classify(u16::from_le_bytes(half) as u32, addr, is32));
        }
        let raw = mem.read_u32(addr)?;
        if raw == 0xffff_ffff {
            return Err(DecodeError::Invalid { addr, raw });
        }
        Ok(classify(raw, addr, is32))
    }

    fn is_padding(&self, mem: &dyn GuestMemory, addr: u64, len: u64) -> bool {
        len % 4 == 0
            && (0..len / 4).all(|i| mem.read_u32(addr + i * 4).map(|w| w == NOP).unwrap_or(false))
    }
}

/// Small RV32 assembler used by the CLI self-test and the tests
pub mod asm {
    pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
        ((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (rd << 7) | super::OP_OP_IMM
    }

    pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
        (rs2 << 20) | (rs1 << 15) | (rd << 7) | super::OP_OP
    }

    pub fn lui(rd: u32, imm: u32) -> u32 {
        (imm & 0xfffff000) | (rd << 7) | super::OP_LUI
    }

    pub fn jal(rd: u32, offset: i32) -> u32 {
        let imm = offset as u32;
        (((imm >> 20) & 1) << 31)
            | (((imm >> 1) & 0x3ff) << 21)
            | (((imm >> 11) & 1) << 20)
            | (((imm >> 12) & 0xff) << 12)
            | (rd << 7)
            | super::OP_JAL
    }

    pub fn beq(rs1: u32, rs2: u32, offset: i32) -> u32 {
        branch(0b000, rs1, rs2, offset)
    }

    pub fn bne(rs1: u32, rs2: u32, offset: i32) -> u32 {
        branch(0b001, rs1, rs2, offset)
    }

    fn branch(funct3: u32, rs1: u32, rs2: u32, offset: i32) -> u32 {
        let imm = offset as u32;
        (((imm >> 12) & 1) << 31)
            | (((imm >> 5) & 0x3f) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (funct3 << 12)
            | (((imm >> 1) & 0xf) << 8)
            | (((imm >> 11) & 1) << 7)
            | super::OP_BRANCH
    }

    /// `jalr x0, 0(ra)`
    pub fn ret() -> u32 {
        (1 << 15) | super::OP_JALR
    }

    pub fn ecall() -> u32 {
        super::OP_SYSTEM
    }

    pub fn nop() -> u32 {
        super::NOP
    }

    /// Little-endian image of a word sequence
    pub fn assemble(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}
