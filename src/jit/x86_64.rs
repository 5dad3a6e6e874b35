//! x86-64 instruction encoding for patch lowering.
//!
//! This module provides functions for encoding the handful of x86-64
//! instructions the generation pass needs as machine code bytes.

use super::codebuf::CodeBuffer;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    const ALL: [Reg; 16] = [
        Reg::Rax, Reg::Rcx, Reg::Rdx, Reg::Rbx,
        Reg::Rsp, Reg::Rbp, Reg::Rsi, Reg::Rdi,
        Reg::R8, Reg::R9, Reg::R10, Reg::R11,
        Reg::R12, Reg::R13, Reg::R14, Reg::R15,
    ];

    /// Look up a register by its hardware number.
    pub fn from_id(id: u32) -> Option<Reg> {
        Self::ALL.get(id as usize).copied()
    }

    /// Low three bits, as placed in ModR/M or the opcode.
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Fourth bit, carried by REX.R or REX.B.
    pub fn ext(self) -> u8 {
        (self as u8) >> 3
    }
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// Emits x86-64 instructions into a [`CodeBuffer`].
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// REX.W with `reg` in ModR/M.reg and `rm` in ModR/M.rm (or the opcode).
    fn rex_w(&mut self, reg: Option<Reg>, rm: Option<Reg>) {
        let r = reg.map_or(0, |r| r.ext() << 2);
        let b = rm.map_or(0, Reg::ext);
        self.buf.emit_u8(0x48 | r | b);
    }

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(Some(src), Some(dst));
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(modrm(0b11, src.code(), dst.code()));
    }

    /// MOVABS r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) {
        self.rex_w(None, Some(dst));
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm);
    }

    /// MOV r64, [base + disp]
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(Some(dst), Some(base));
        self.buf.emit_u8(0x8B);
        self.mem_operand(dst, base, disp);
    }

    /// MOV r64, [rip + disp32] reading `data_offset` of the data block.
    /// The displacement is left for relocation.
    pub fn mov_r_data(&mut self, dst: Reg, data_offset: u64) {
        self.rex_w(Some(dst), None);
        self.buf.emit_u8(0x8B);
        self.buf.emit_u8(modrm(0b00, dst.code(), 0b101));
        self.buf.emit_data_rel32(data_offset);
    }

    /// MOV [rip + disp32], r64 writing `data_offset` of the data block.
    pub fn mov_data_r(&mut self, data_offset: u64, src: Reg) {
        self.rex_w(Some(src), None);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(modrm(0b00, src.code(), 0b101));
        self.buf.emit_data_rel32(data_offset);
    }

    fn mem_operand(&mut self, reg: Reg, base: Reg, disp: i32) {
        // rsp/r12 as base need a SIB byte; rbp/r13 with mod=00 would mean rip
        let sib = matches!(base, Reg::Rsp | Reg::R12);
        let mode = match disp {
            0 if !matches!(base, Reg::Rbp | Reg::R13) => 0b00,
            -128..=127 => 0b01,
            _ => 0b10,
        };

        if sib {
            self.buf.emit_u8(modrm(mode, reg.code(), 0b100));
            self.buf.emit_u8(0x24);
        } else {
            self.buf.emit_u8(modrm(mode, reg.code(), base.code()));
        }
        match mode {
            0b01 => self.buf.emit_u8(disp as u8),
            0b10 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    /// LEA r64, [base + disp]; leaves the flags alone
    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(Some(dst), Some(base));
        self.buf.emit_u8(0x8D);
        self.mem_operand(dst, base, disp);
    }

    /// AND r64, imm8 (sign-extended)
    pub fn and_ri8(&mut self, dst: Reg, imm: i8) {
        self.rex_w(None, Some(dst));
        self.buf.emit_u8(0x83);
        self.buf.emit_u8(modrm(0b11, 4, dst.code()));
        self.buf.emit_u8(imm as u8);
    }

    pub fn push_r(&mut self, reg: Reg) {
        if reg.ext() != 0 {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop_r(&mut self, reg: Reg) {
        if reg.ext() != 0 {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    pub fn pushfq(&mut self) {
        self.buf.emit_u8(0x9C);
    }

    pub fn popfq(&mut self) {
        self.buf.emit_u8(0x9D);
    }

    /// ADD r64, imm (imm8 form when it fits)
    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_w(None, Some(dst));
        let short = i8::try_from(imm).is_ok();
        self.buf.emit_u8(if short { 0x83 } else { 0x81 });
        self.buf.emit_u8(modrm(0b11, 0, dst.code()));
        if short {
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u32(imm as u32);
        }
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        if reg.ext() != 0 {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(modrm(0b11, 2, reg.code()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mov_rr() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.mov_rr(Reg::Rax, Reg::Rbx);

        // MOV RAX, RBX = 48 89 D8
        assert_eq!(buf.code(), &[0x48, 0x89, 0xD8]);
    }

    #[test]
    fn test_mov_ri64_extended() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.mov_ri64(Reg::R11, 0x1122_3344_5566_7788);

        // MOVABS R11, imm64 = 49 BB imm64
        assert_eq!(
            buf.code(),
            &[0x49, 0xBB, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_mov_rm() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.mov_rm(Reg::Rax, Reg::R11, 0);

        // MOV RAX, [R11] = 49 8B 03
        assert_eq!(buf.code(), &[0x49, 0x8B, 0x03]);
    }

    #[test]
    fn test_mov_rm_rbp_base_has_disp8() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.mov_rm(Reg::Rcx, Reg::Rbp, 0);

        // MOV RCX, [RBP + 0] = 48 8B 4D 00
        assert_eq!(buf.code(), &[0x48, 0x8B, 0x4D, 0x00]);
    }

    #[test]
    fn test_mov_rm_rsp_base_has_sib() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.mov_rm(Reg::Rax, Reg::Rsp, 0);

        // MOV RAX, [RSP] = 48 8B 04 24
        assert_eq!(buf.code(), &[0x48, 0x8B, 0x04, 0x24]);
    }

    #[test]
    fn test_mov_r_data() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.mov_r_data(Reg::R11, 0x48);

        // MOV R11, [RIP + disp32] = 4C 8B 1D disp32
        assert_eq!(buf.code(), &[0x4C, 0x8B, 0x1D, 0, 0, 0, 0]);
        assert_eq!(buf.fixups().len(), 1);
        assert_eq!(buf.fixups()[0].at, 3);
        assert_eq!(buf.fixups()[0].next_inst, 7);
        assert_eq!(buf.fixups()[0].data_offset, 0x48);
    }

    #[test]
    fn test_mov_data_r() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.mov_data_r(0, Reg::Rcx);

        // MOV [RIP + disp32], RCX = 48 89 0D disp32
        assert_eq!(buf.code(), &[0x48, 0x89, 0x0D, 0, 0, 0, 0]);
    }

    #[test]
    fn test_add_ri32() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.add_ri32(Reg::Rax, 8);
        asm.add_ri32(Reg::Rax, 0x1000);

        // ADD RAX, 8 = 48 83 C0 08 ; ADD RAX, 0x1000 = 48 81 C0 00 10 00 00
        assert_eq!(
            buf.code(),
            &[0x48, 0x83, 0xC0, 0x08, 0x48, 0x81, 0xC0, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn test_lea_rsp_below_red_zone() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.lea(Reg::Rsp, Reg::Rsp, -128);
        asm.and_ri8(Reg::Rsp, -16);

        // LEA RSP, [RSP - 0x80] ; AND RSP, -16
        assert_eq!(
            buf.code(),
            &[0x48, 0x8D, 0x64, 0x24, 0x80, 0x48, 0x83, 0xE4, 0xF0]
        );
    }

    #[test]
    fn test_push_pop() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.pushfq();
        asm.pop_r(Reg::Rax);
        asm.push_r(Reg::R11);
        asm.popfq();

        assert_eq!(buf.code(), &[0x9C, 0x58, 0x41, 0x53, 0x9D]);
    }

    #[test]
    fn test_call_r_r11() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.call_r(Reg::R11);

        // CALL R11 = 41 FF D3
        assert_eq!(buf.code(), &[0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn test_from_id() {
        assert_eq!(Reg::from_id(11), Some(Reg::R11));
        assert_eq!(Reg::from_id(16), None);
    }
}
