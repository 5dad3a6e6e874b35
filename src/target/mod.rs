//! Target descriptions.
//!
//! A target fixes everything the patch layer needs to know about an
//! architecture: the mapping from guest GPR slots to native registers, the
//! layout of the saved context, which registers may back temporaries, and
//! how a resolved operation is encoded.

mod aarch64;
mod x86_64;

pub use aarch64::AArch64;
pub use x86_64::X86_64;

use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;

use crate::jit::CodeBuffer;
use crate::patch::{ArchReg, PatchError};

/// Layout of the saved execution context at the start of the data block.
///
/// ```text
/// [ host state | GPR block | FPR block ]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextLayout {
    /// Words of engine-private state preceding the guest registers
    pub host_words: usize,
    /// Number of slots in the GPR block
    pub gpr_count: usize,
    /// Size of the FPR block in bytes
    pub fpr_size: usize,
    pub word_size: usize,
}

impl ContextLayout {
    /// Offset of the GPR block.
    pub const fn gpr_base(&self) -> usize {
        self.host_words * self.word_size
    }

    /// Offset of GPR slot `index`.
    pub const fn gpr_offset(&self, index: usize) -> usize {
        self.gpr_base() + index * self.word_size
    }

    pub const fn fpr_base(&self) -> usize {
        self.gpr_offset(self.gpr_count)
    }

    /// Total size of the context in bytes.
    pub const fn size(&self) -> usize {
        self.fpr_base() + self.fpr_size
    }
}

/// An operation with every symbolic operand resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeOp<'a> {
    /// Original instruction bytes, copied verbatim
    Raw(&'a [u8]),
    Mov { dst: ArchReg, src: ArchReg },
    MovImm { dst: ArchReg, value: u64 },
    AddImm { dst: ArchReg, value: i64 },
    /// Load a word from the data block
    LoadData { dst: ArchReg, data_offset: u64 },
    /// Store a word to the data block
    StoreData { src: ArchReg, data_offset: u64 },
    /// Load a word from the address held in `base`
    LoadMem { dst: ArchReg, base: ArchReg },
    /// Call a host function at `target`. The sequence preserves the guest
    /// flags and keeps the host frame below the guest's red zone, using the
    /// data-block words at `stack` and `flags`. Registers in
    /// [`Target::CALL_CLOBBERED`] are left to the caller.
    CallHost { target: u64, stack: u64, flags: u64 },
}

/// An instruction set the patch layer can generate for.
pub trait Target:
    Debug + Clone + Copy + PartialEq + Eq + PartialOrd + Ord + Hash + Default + Send + Sync + 'static
{
    const NAME: &'static str;
    const WORD_SIZE: usize;
    /// Native register for each GPR slot
    const GPR_ID: &'static [ArchReg];
    const GPR_NAMES: &'static [&'static str];
    /// Field names of the host state, in layout order
    const HOST_FIELDS: &'static [&'static str];
    /// GPR slot holding the guest program counter
    const PC_SLOT: u32;
    const CONTEXT: ContextLayout;
    /// Registers that may back temporaries, in allocation order
    const SCRATCH_POOL: &'static [ArchReg];
    /// Registers the generated code owns; rules and instructions may not use them
    const RESERVED: &'static [ArchReg];
    /// Guest registers a host call may overwrite: the ABI's caller-saved set
    /// plus anything the call instruction itself writes
    const CALL_CLOBBERED: &'static [ArchReg];

    /// Whether `reg` can appear as a register operand.
    fn is_encodable(reg: ArchReg) -> bool;

    /// Encode one resolved operation.
    fn lower(op: &NativeOp<'_>, buf: &mut CodeBuffer) -> Result<(), PatchError>;

    /// Value the guest PC reads as while the instruction at `address` runs.
    ///
    /// Defaults to the address of the next instruction, as on x86-64.
    /// Targets whose PC reads as the current instruction (AArch64) must
    /// override it.
    fn pc_value(address: u64, len: usize) -> u64 {
        address.wrapping_add(len as u64)
    }

    /// Assembly name of a native register.
    fn reg_name(reg: ArchReg) -> String {
        Self::GPR_ID
            .iter()
            .position(|r| *r == reg)
            .map(|slot| Self::GPR_NAMES[slot].to_string())
            .unwrap_or_else(|| reg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_tables<T: Target>() {
        assert_eq!(T::GPR_ID.len(), T::GPR_NAMES.len());
        assert_eq!(T::GPR_ID.len(), T::CONTEXT.gpr_count);
        assert_eq!(T::HOST_FIELDS.len(), T::CONTEXT.host_words);
        assert_eq!(T::CONTEXT.word_size, T::WORD_SIZE);

        // one slot per native register
        let mut ids: Vec<_> = T::GPR_ID.to_vec();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), T::GPR_ID.len());

        for reg in T::SCRATCH_POOL {
            assert!(T::is_encodable(*reg));
            assert!(!T::RESERVED.contains(reg));
        }
        assert!(!T::is_encodable(T::GPR_ID[T::PC_SLOT as usize]));

        for reg in T::CALL_CLOBBERED {
            assert!(T::is_encodable(*reg));
            assert!(!T::RESERVED.contains(reg));
        }
    }

    #[test]
    fn test_x86_64_tables() {
        check_tables::<X86_64>();
        assert_eq!(X86_64::CONTEXT.gpr_base(), 64);
    }

    #[test]
    fn test_aarch64_tables() {
        check_tables::<AArch64>();
        assert_eq!(AArch64::CONTEXT.gpr_base(), 80);
    }

    #[test]
    fn test_context_layout() {
        let layout = ContextLayout {
            host_words: 2,
            gpr_count: 4,
            fpr_size: 16,
            word_size: 8,
        };
        assert_eq!(layout.gpr_base(), 16);
        assert_eq!(layout.gpr_offset(3), 40);
        assert_eq!(layout.fpr_base(), 48);
        assert_eq!(layout.size(), 64);
    }

    #[test]
    fn test_pc_value() {
        assert_eq!(X86_64::pc_value(0x1000, 4), 0x1004);
        assert_eq!(AArch64::pc_value(0x1000, 4), 0x1000);
    }

    #[test]
    fn test_reg_name() {
        assert_eq!(X86_64::reg_name(ArchReg::new(3)), "rbx");
        assert_eq!(AArch64::reg_name(ArchReg::new(30)), "lr");
        assert_eq!(X86_64::reg_name(ArchReg::new(99)), "r99");
    }
}
