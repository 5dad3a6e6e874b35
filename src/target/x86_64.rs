//! x86-64 target.
//!
//! Data-block accesses are RIP-relative, so no register is set aside for the
//! generated code; the displacements are filled in at relocation time.

use super::{ContextLayout, NativeOp, Target};
use crate::jit::CodeBuffer;
use crate::jit::x86_64::{Reg as HwReg, X86_64Assembler};
use crate::patch::{ArchReg, PatchError};

pub const RAX: ArchReg = ArchReg::new(0);
pub const RCX: ArchReg = ArchReg::new(1);
pub const RDX: ArchReg = ArchReg::new(2);
pub const RBX: ArchReg = ArchReg::new(3);
pub const RSP: ArchReg = ArchReg::new(4);
pub const RBP: ArchReg = ArchReg::new(5);
pub const RSI: ArchReg = ArchReg::new(6);
pub const RDI: ArchReg = ArchReg::new(7);
pub const R8: ArchReg = ArchReg::new(8);
pub const R9: ArchReg = ArchReg::new(9);
pub const R10: ArchReg = ArchReg::new(10);
pub const R11: ArchReg = ArchReg::new(11);
pub const R12: ArchReg = ArchReg::new(12);
pub const R13: ArchReg = ArchReg::new(13);
pub const R14: ArchReg = ArchReg::new(14);
pub const R15: ArchReg = ArchReg::new(15);
// not encodable as operands, but they have context slots
pub const RIP: ArchReg = ArchReg::new(16);
pub const EFLAGS: ArchReg = ArchReg::new(17);

/// Bytes below the guest RSP that leaf code may use without moving RSP.
const RED_ZONE: i32 = 128;

/// System V x86-64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct X86_64;

impl X86_64 {
    fn hw(reg: ArchReg) -> Result<HwReg, PatchError> {
        HwReg::from_id(reg.value()).ok_or(PatchError::RegisterNotEncodable(reg))
    }
}

impl Target for X86_64 {
    const NAME: &'static str = "x86_64";
    const WORD_SIZE: usize = 8;

    const GPR_ID: &'static [ArchReg] = &[
        RAX, RBX, RCX, RDX, RSI, RDI, R8, R9, R10, R11, R12, R13, R14, R15, RBP, RSP, RIP, EFLAGS,
    ];

    const GPR_NAMES: &'static [&'static str] = &[
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
        "r15", "rbp", "rsp", "rip", "eflags",
    ];

    const HOST_FIELDS: &'static [&'static str] = &[
        "bp", "sp", "selector", "callback", "data", "origin", "exec_flags", "scratch",
    ];

    const PC_SLOT: u32 = 16;

    const CONTEXT: ContextLayout = ContextLayout {
        host_words: 8,
        gpr_count: 18,
        // FXSAVE area
        fpr_size: 512,
        word_size: 8,
    };

    // caller-saved first
    const SCRATCH_POOL: &'static [ArchReg] = &[
        R11, R10, R9, R8, RDX, RCX, RAX, RSI, RDI, RBX, R12, R13, R14, R15, RBP,
    ];

    const RESERVED: &'static [ArchReg] = &[];

    const CALL_CLOBBERED: &'static [ArchReg] = &[RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];

    fn is_encodable(reg: ArchReg) -> bool {
        reg.value() < 16
    }

    fn lower(op: &NativeOp<'_>, buf: &mut CodeBuffer) -> Result<(), PatchError> {
        match *op {
            NativeOp::Raw(bytes) => buf.emit_bytes(bytes),
            NativeOp::Mov { dst, src } => {
                let (dst, src) = (Self::hw(dst)?, Self::hw(src)?);
                X86_64Assembler::new(buf).mov_rr(dst, src);
            }
            NativeOp::MovImm { dst, value } => {
                let dst = Self::hw(dst)?;
                X86_64Assembler::new(buf).mov_ri64(dst, value);
            }
            NativeOp::AddImm { dst, value } => {
                let dst = Self::hw(dst)?;
                let imm = i32::try_from(value).map_err(|_| PatchError::ImmediateOutOfRange(value))?;
                X86_64Assembler::new(buf).add_ri32(dst, imm);
            }
            NativeOp::LoadData { dst, data_offset } => {
                let dst = Self::hw(dst)?;
                X86_64Assembler::new(buf).mov_r_data(dst, data_offset);
            }
            NativeOp::StoreData { src, data_offset } => {
                let src = Self::hw(src)?;
                X86_64Assembler::new(buf).mov_data_r(data_offset, src);
            }
            NativeOp::LoadMem { dst, base } => {
                let (dst, base) = (Self::hw(dst)?, Self::hw(base)?);
                X86_64Assembler::new(buf).mov_rm(dst, base, 0);
            }
            NativeOp::CallHost {
                target,
                stack,
                flags,
            } => {
                let mut asm = X86_64Assembler::new(buf);
                asm.mov_data_r(stack, HwReg::Rsp);
                asm.lea(HwReg::Rsp, HwReg::Rsp, -RED_ZONE);
                asm.pushfq();
                asm.pop_r(HwReg::Rax);
                asm.mov_data_r(flags, HwReg::Rax);
                asm.and_ri8(HwReg::Rsp, -16);
                asm.mov_ri64(HwReg::Rax, target);
                asm.call_r(HwReg::Rax);
                // flags go back through a push below the red zone
                asm.mov_r_data(HwReg::Rax, flags);
                asm.mov_r_data(HwReg::Rsp, stack);
                asm.lea(HwReg::Rsp, HwReg::Rsp, -RED_ZONE);
                asm.push_r(HwReg::Rax);
                asm.popfq();
                asm.mov_r_data(HwReg::Rsp, stack);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpr_table_follows_context_order() {
        assert_eq!(X86_64::GPR_ID[0], RAX);
        assert_eq!(X86_64::GPR_ID[1], RBX);
        assert_eq!(X86_64::GPR_ID[X86_64::PC_SLOT as usize], RIP);
    }

    #[test]
    fn test_lower_rejects_pseudo_registers() {
        let mut buf = CodeBuffer::new();
        let err = X86_64::lower(&NativeOp::Mov { dst: RAX, src: EFLAGS }, &mut buf).unwrap_err();
        assert_eq!(err, PatchError::RegisterNotEncodable(EFLAGS));
    }

    #[test]
    fn test_lower_add_imm_range() {
        let mut buf = CodeBuffer::new();
        X86_64::lower(&NativeOp::AddImm { dst: RAX, value: -16 }, &mut buf).unwrap();
        assert_eq!(buf.code(), &[0x48, 0x83, 0xC0, 0xF0]);

        let err = X86_64::lower(&NativeOp::AddImm { dst: RAX, value: 1 << 40 }, &mut buf)
            .unwrap_err();
        assert_eq!(err, PatchError::ImmediateOutOfRange(1 << 40));
    }

    #[test]
    fn test_lower_call_host() {
        let mut buf = CodeBuffer::new();
        let call = NativeOp::CallHost {
            target: 0x4000,
            stack: 0x300,
            flags: 0x308,
        };
        X86_64::lower(&call, &mut buf).unwrap();
        let code = buf.code();

        // mov [rip + stack], rsp ; lea rsp, [rsp - 128] ; pushfq ; pop rax
        assert_eq!(code[..3], [0x48, 0x89, 0x25]);
        assert_eq!(code[7..14], [0x48, 0x8D, 0x64, 0x24, 0x80, 0x9C, 0x58]);
        // mov [rip + flags], rax ; and rsp, -16 ; movabs rax, 0x4000 ; call rax
        assert_eq!(code[14..17], [0x48, 0x89, 0x05]);
        assert_eq!(code[21..25], [0x48, 0x83, 0xE4, 0xF0]);
        assert_eq!(code[25..29], [0x48, 0xB8, 0x00, 0x40]);
        assert_eq!(code[35..37], [0xFF, 0xD0]);
        // reload flags and rsp, popfq below the red zone, reload rsp
        assert_eq!(code[37..40], [0x48, 0x8B, 0x05]);
        assert_eq!(code[44..47], [0x48, 0x8B, 0x25]);
        assert_eq!(code[51..58], [0x48, 0x8D, 0x64, 0x24, 0x80, 0x50, 0x9D]);
        assert_eq!(code[58..61], [0x48, 0x8B, 0x25]);
        assert_eq!(code.len(), 65);

        let targets: Vec<u64> = buf.fixups().iter().map(|f| f.data_offset).collect();
        assert_eq!(targets, vec![0x300, 0x308, 0x308, 0x300, 0x300]);
    }

    #[test]
    fn test_lower_data_access_records_fixup() {
        let mut buf = CodeBuffer::new();
        X86_64::lower(&NativeOp::StoreData { src: R11, data_offset: 0x300 }, &mut buf).unwrap();
        X86_64::lower(&NativeOp::LoadData { dst: R11, data_offset: 0x300 }, &mut buf).unwrap();
        assert_eq!(buf.fixups().len(), 2);
        assert_eq!(buf.code()[..3], [0x4C, 0x89, 0x1D]);
        assert_eq!(buf.code()[7..10], [0x4C, 0x8B, 0x1D]);
    }
}
