//! AArch64 instruction encoding for patch lowering.
//!
//! This module provides functions for encoding the AArch64 instructions
//! the generation pass needs as machine code bytes.

use super::codebuf::CodeBuffer;

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3,
    X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X8 = 8, X9 = 9, X10 = 10, X11 = 11,
    X12 = 12, X13 = 13, X14 = 14, X15 = 15,
    X16 = 16, X17 = 17, X18 = 18, X19 = 19,
    X20 = 20, X21 = 21, X22 = 22, X23 = 23,
    X24 = 24, X25 = 25, X26 = 26, X27 = 27,
    X28 = 28,
    Fp = 29,  // Frame pointer
    Lr = 30,  // Link register
    Sp = 31,  // Stack pointer / Zero register (XZR in some contexts)
}

impl Reg {
    /// Alias for SP when used as zero register
    pub const XZR: Reg = Reg::Sp;

    const ALL: [Reg; 32] = [
        Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5, Reg::X6, Reg::X7,
        Reg::X8, Reg::X9, Reg::X10, Reg::X11, Reg::X12, Reg::X13, Reg::X14, Reg::X15,
        Reg::X16, Reg::X17, Reg::X18, Reg::X19, Reg::X20, Reg::X21, Reg::X22, Reg::X23,
        Reg::X24, Reg::X25, Reg::X26, Reg::X27, Reg::X28, Reg::Fp, Reg::Lr, Reg::Sp,
    ];

    /// Look up a register by its hardware number.
    pub fn from_id(id: u32) -> Option<Reg> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Rd/Rt in bits 4:0, Rn in bits 9:5.
fn rd_rn(rd: Reg, rn: Reg) -> u32 {
    ((rn.code() as u32) << 5) | rd.code() as u32
}

/// Emits AArch64 instructions into a [`CodeBuffer`].
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Emit one encoded instruction word.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    /// ADD Xd, Xn, #imm12
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        self.emit_raw(0x9100_0000 | ((imm12 as u32 & 0xFFF) << 10) | rd_rn(rd, rn));
    }

    /// SUB Xd, Xn, #imm12
    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        self.emit_raw(0xD100_0000 | ((imm12 as u32 & 0xFFF) << 10) | rd_rn(rd, rn));
    }

    /// ORR Xd, Xn, Xm
    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(0xAA00_0000 | ((rm.code() as u32) << 16) | rd_rn(rd, rn));
    }

    /// MOV Xd, Xm, encoded as ORR Xd, XZR, Xm
    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        self.orr(rd, Reg::XZR, rm);
    }

    /// MOVZ Xd, #imm16
    pub fn mov_imm(&mut self, rd: Reg, imm16: u16) {
        self.emit_raw(0xD280_0000 | ((imm16 as u32) << 5) | rd.code() as u32);
    }

    /// MOVK Xd, #imm16, LSL #(16 * hw)
    pub fn movk(&mut self, rd: Reg, imm16: u16, hw: u8) {
        self.emit_raw(
            0xF280_0000 | ((hw as u32 & 0x3) << 21) | ((imm16 as u32) << 5) | rd.code() as u32,
        );
    }

    /// MOVZ for the low half-word, then one MOVK per nonzero-prefixed chunk above it.
    pub fn mov_imm64(&mut self, rd: Reg, value: u64) {
        self.mov_imm(rd, value as u16);
        for hw in 1..4u8 {
            if value >> (16 * hw as u32) == 0 {
                break;
            }
            self.movk(rd, (value >> (16 * hw as u32)) as u16, hw);
        }
    }

    /// LDR Xt, [Xn, #offset]; `offset` is in bytes and must be a multiple of 8.
    pub fn ldr(&mut self, rt: Reg, rn: Reg, offset: u16) {
        self.emit_raw(0xF940_0000 | Self::scaled(offset) | rd_rn(rt, rn));
    }

    /// STR Xt, [Xn, #offset]; `offset` is in bytes and must be a multiple of 8.
    pub fn str(&mut self, rt: Reg, rn: Reg, offset: u16) {
        self.emit_raw(0xF900_0000 | Self::scaled(offset) | rd_rn(rt, rn));
    }

    fn scaled(offset: u16) -> u32 {
        ((offset as u32 / 8) & 0xFFF) << 10
    }

    /// MRS Xt, NZCV
    pub fn mrs_nzcv(&mut self, rt: Reg) {
        self.emit_raw(0xD53B_4200 | rt.code() as u32);
    }

    /// MSR NZCV, Xt
    pub fn msr_nzcv(&mut self, rt: Reg) {
        self.emit_raw(0xD51B_4200 | rt.code() as u32);
    }

    /// BLR Xn
    pub fn blr(&mut self, rn: Reg) {
        self.emit_raw(0xD63F_0000 | ((rn.code() as u32) << 5));
    }
}
