//! AArch64 target.
//!
//! AArch64 has no PC-relative store, so the generated code keeps the data
//! block address in X28 for its whole lifetime and addresses the context and
//! shadow cells relative to it. X28 is therefore off limits to rules and to
//! instrumented instructions.

use super::{ContextLayout, NativeOp, Target};
use crate::jit::CodeBuffer;
use crate::jit::aarch64::{AArch64Assembler, Reg as HwReg};
use crate::patch::{ArchReg, PatchError};

const fn x(n: u32) -> ArchReg {
    ArchReg::new(n)
}

pub const FP: ArchReg = ArchReg::new(29);
pub const LR: ArchReg = ArchReg::new(30);
pub const SP: ArchReg = ArchReg::new(31);
pub const NZCV: ArchReg = ArchReg::new(32);
pub const PC: ArchReg = ArchReg::new(33);

/// Holds the data block address in generated code.
pub const DATA_BASE: ArchReg = ArchReg::new(28);

/// Largest data offset reachable with a scaled 12-bit LDR/STR offset.
const MAX_DATA_OFFSET: u64 = 0xFFF * 8;

/// Stack bytes skipped before a host call (the Darwin red zone).
const RED_ZONE: u16 = 128;

/// AArch64 (AAPCS64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AArch64;

impl AArch64 {
    fn hw(reg: ArchReg) -> Result<HwReg, PatchError> {
        if !Self::is_encodable(reg) {
            return Err(PatchError::RegisterNotEncodable(reg));
        }
        HwReg::from_id(reg.value()).ok_or(PatchError::RegisterNotEncodable(reg))
    }

    /// Like `hw`, but also accepts SP for the instructions that read 31 as SP.
    fn hw_or_sp(reg: ArchReg) -> Result<HwReg, PatchError> {
        if reg == SP {
            Ok(HwReg::Sp)
        } else {
            Self::hw(reg)
        }
    }

    fn data_offset(offset: u64) -> Result<u16, PatchError> {
        if offset % 8 != 0 || offset > MAX_DATA_OFFSET {
            return Err(PatchError::ImmediateOutOfRange(offset as i64));
        }
        Ok(offset as u16)
    }
}

impl Target for AArch64 {
    const NAME: &'static str = "aarch64";
    const WORD_SIZE: usize = 8;

    const GPR_ID: &'static [ArchReg] = &[
        x(0), x(1), x(2), x(3), x(4), x(5), x(6), x(7),
        x(8), x(9), x(10), x(11), x(12), x(13), x(14), x(15),
        x(16), x(17), x(18), x(19), x(20), x(21), x(22), x(23),
        x(24), x(25), x(26), x(27), x(28), FP, LR, SP, NZCV, PC,
    ];

    const GPR_NAMES: &'static [&'static str] = &[
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "fp", "lr", "sp", "nzcv", "pc",
    ];

    const HOST_FIELDS: &'static [&'static str] = &[
        "fp",
        "sp",
        "selector",
        "callback",
        "data",
        "origin",
        "exchange",
        "exec_flags",
        "scratch_register_offset",
        "current_sr_offset",
    ];

    const PC_SLOT: u32 = 33;

    const CONTEXT: ContextLayout = ContextLayout {
        host_words: 10,
        gpr_count: 34,
        // v0-v31 plus fpcr/fpsr
        fpr_size: 32 * 16 + 16,
        word_size: 8,
    };

    // x18 is the platform register; fp/lr stay with the guest frame
    const SCRATCH_POOL: &'static [ArchReg] = &[
        x(9), x(10), x(11), x(12), x(13), x(14), x(15), x(16), x(17),
        x(0), x(1), x(2), x(3), x(4), x(5), x(6), x(7), x(8),
        x(19), x(20), x(21), x(22), x(23), x(24), x(25), x(26), x(27),
    ];

    const RESERVED: &'static [ArchReg] = &[DATA_BASE];

    // AAPCS64 caller-saved registers, and LR which BLR overwrites
    const CALL_CLOBBERED: &'static [ArchReg] = &[
        x(0), x(1), x(2), x(3), x(4), x(5), x(6), x(7), x(8), x(9),
        x(10), x(11), x(12), x(13), x(14), x(15), x(16), x(17), x(18), LR,
    ];

    fn is_encodable(reg: ArchReg) -> bool {
        // 31 reads as XZR in most encodings; only moves and immediate adds take SP
        reg.value() < 31
    }

    fn pc_value(address: u64, _len: usize) -> u64 {
        address
    }

    fn lower(op: &NativeOp<'_>, buf: &mut CodeBuffer) -> Result<(), PatchError> {
        let base = HwReg::X28;
        match *op {
            NativeOp::Raw(bytes) => buf.emit_bytes(bytes),
            NativeOp::Mov { dst, src } if dst == SP || src == SP => {
                let (dst, src) = (Self::hw_or_sp(dst)?, Self::hw_or_sp(src)?);
                // ORR would read SP as XZR
                AArch64Assembler::new(buf).add_imm(dst, src, 0);
            }
            NativeOp::Mov { dst, src } => {
                let (dst, src) = (Self::hw(dst)?, Self::hw(src)?);
                AArch64Assembler::new(buf).mov(dst, src);
            }
            NativeOp::MovImm { dst, value } => {
                let dst = Self::hw(dst)?;
                AArch64Assembler::new(buf).mov_imm64(dst, value);
            }
            NativeOp::AddImm { dst, value } => {
                let dst = Self::hw_or_sp(dst)?;
                let magnitude = value.unsigned_abs();
                if magnitude > 0xFFF {
                    return Err(PatchError::ImmediateOutOfRange(value));
                }
                let mut asm = AArch64Assembler::new(buf);
                if value < 0 {
                    asm.sub_imm(dst, dst, magnitude as u16);
                } else {
                    asm.add_imm(dst, dst, magnitude as u16);
                }
            }
            NativeOp::LoadData { dst, data_offset } => {
                let dst = Self::hw(dst)?;
                let imm = Self::data_offset(data_offset)?;
                AArch64Assembler::new(buf).ldr(dst, base, imm);
            }
            NativeOp::StoreData { src, data_offset } => {
                let src = Self::hw(src)?;
                let imm = Self::data_offset(data_offset)?;
                AArch64Assembler::new(buf).str(src, base, imm);
            }
            NativeOp::LoadMem { dst, base } => {
                let (dst, base) = (Self::hw(dst)?, Self::hw(base)?);
                AArch64Assembler::new(buf).ldr(dst, base, 0);
            }
            NativeOp::CallHost { target, flags, .. } => {
                let flags = Self::data_offset(flags)?;
                let ip0 = HwReg::X16;
                let mut asm = AArch64Assembler::new(buf);
                asm.mrs_nzcv(ip0);
                asm.str(ip0, base, flags);
                asm.sub_imm(HwReg::Sp, HwReg::Sp, RED_ZONE);
                asm.mov_imm64(ip0, target);
                asm.blr(ip0);
                asm.add_imm(HwReg::Sp, HwReg::Sp, RED_ZONE);
                asm.ldr(ip0, base, flags);
                asm.msr_nzcv(ip0);
            }
        }
        Ok(())
    }
}
