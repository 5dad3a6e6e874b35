//! Value types used to describe patches.
//!
//! Every type here is a small `Copy` value with no reference to the code
//! cache or the data block. They only become concrete (a physical register,
//! a data-block address, an encoded immediate) inside the generation pass.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;

use super::error::PatchError;
use crate::target::Target;

/// A register as the native instruction encoder knows it.
///
/// There is deliberately no `From<u32>`: an integer could be a native id or a
/// guest slot index, so the caller has to say which one it means.
///
/// ```compile_fail
/// use patchgen::patch::ArchReg;
/// let reg: ArchReg = 3u32.into();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ArchReg {
    id: u32,
}

impl ArchReg {
    pub const fn new(id: u32) -> Self {
        Self { id }
    }

    /// Raw encoder id.
    pub const fn value(self) -> u32 {
        self.id
    }
}

impl fmt::Display for ArchReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.id)
    }
}

/// A guest general-purpose register, identified by its slot in the saved GPR
/// block of target `T`.
///
/// A `Reg` converts to exactly one [`ArchReg`] through `T::GPR_ID`. It can be
/// compared with an `ArchReg`, but never with a bare integer, since it would
/// be ambiguous whether the slot index or the native id is meant:
///
/// ```compile_fail
/// use patchgen::patch::Reg;
/// use patchgen::target::X86_64;
/// let rax = Reg::<X86_64>::new(0);
/// assert!(rax == 0u32);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg<T: Target> {
    id: u32,
    _target: PhantomData<T>,
}

impl<T: Target> Reg<T> {
    /// Create a handle for GPR slot `id`.
    ///
    /// # Panics
    /// Panics if `id` is not a slot of `T`'s GPR table. Use [`Reg::try_new`]
    /// for ids that come from outside the program.
    pub const fn new(id: u32) -> Self {
        assert!((id as usize) < T::GPR_ID.len(), "GPR slot out of range");
        Self {
            id,
            _target: PhantomData,
        }
    }

    pub fn try_new(id: u32) -> Result<Self, PatchError> {
        if (id as usize) < T::GPR_ID.len() {
            Ok(Self {
                id,
                _target: PhantomData,
            })
        } else {
            Err(PatchError::InvalidRegister {
                id,
                count: T::GPR_ID.len(),
            })
        }
    }

    /// Slot index in the GPR block.
    pub const fn id(self) -> u32 {
        self.id
    }

    /// The native register backing this slot.
    pub const fn arch(self) -> ArchReg {
        T::GPR_ID[self.id as usize]
    }

    /// Byte offset of this register inside the saved context.
    pub const fn offset(self) -> u64 {
        T::CONTEXT.gpr_offset(self.id as usize) as u64
    }

    pub fn name(self) -> &'static str {
        T::GPR_NAMES[self.id as usize]
    }
}

impl<T: Target> From<Reg<T>> for ArchReg {
    fn from(reg: Reg<T>) -> Self {
        reg.arch()
    }
}

impl<T: Target> PartialEq<ArchReg> for Reg<T> {
    fn eq(&self, other: &ArchReg) -> bool {
        self.arch() == *other
    }
}

impl<T: Target> PartialEq<Reg<T>> for ArchReg {
    fn eq(&self, other: &Reg<T>) -> bool {
        *self == other.arch()
    }
}

impl<T: Target> fmt::Display for Reg<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// First tag reserved for memory-access bookkeeping.
pub const MEMORY_TAG_BEGIN: u16 = 0xffe0;
/// End (exclusive) of the memory-access tag range.
pub const MEMORY_TAG_END: u16 = 0xfff0;
/// No tag: every request gets its own cell.
pub const UNTAGGED: u16 = 0xffff;

/// Memory-access tags used by [`crate::patch::memaccess`].
pub const MEMORY_TAG_ADDRESS: u16 = MEMORY_TAG_BEGIN;
pub const MEMORY_TAG_READ_VALUE: u16 = MEMORY_TAG_BEGIN + 1;
pub const MEMORY_TAG_WRITE_VALUE: u16 = MEMORY_TAG_BEGIN + 2;

/// A private storage cell in the data block, requested by tag.
///
/// Within one instrumented instruction every use of the same tag refers to
/// the same cell, so a pre-instruction hook can leave a value for a
/// post-instruction hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Shadow {
    tag: u16,
}

impl Shadow {
    pub const fn new(tag: u16) -> Self {
        Self { tag }
    }

    pub const fn untagged() -> Self {
        Self { tag: UNTAGGED }
    }

    pub const fn tag(self) -> u16 {
        self.tag
    }

    /// The tag widened to a machine word, for address arithmetic.
    pub const fn tag_word(self) -> u64 {
        self.tag as u64
    }

    pub const fn is_untagged(self) -> bool {
        self.tag == UNTAGGED
    }

    /// Whether the tag lies in the range owned by memory-access instrumentation.
    pub const fn is_memory_tag(self) -> bool {
        self.tag >= MEMORY_TAG_BEGIN && self.tag < MEMORY_TAG_END
    }
}

/// An immediate machine word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Constant {
    value: u64,
}

impl Constant {
    pub const fn new(value: u64) -> Self {
        Self { value }
    }

    pub const fn value(self) -> u64 {
        self.value
    }
}

impl From<u64> for Constant {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<Constant> for u64 {
    fn from(c: Constant) -> Self {
        c.value
    }
}

/// A byte displacement into the saved execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Offset {
    value: i64,
}

impl Offset {
    pub const fn new(value: i64) -> Self {
        Self { value }
    }

    pub const fn value(self) -> i64 {
        self.value
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl<T: Target> From<Reg<T>> for Offset {
    fn from(reg: Reg<T>) -> Self {
        Self::new(reg.offset() as i64)
    }
}

impl From<Offset> for i64 {
    fn from(offset: Offset) -> Self {
        offset.value
    }
}

/// A scratch register not yet bound to a physical register.
///
/// Inside one rule, temps with the same id are the same register. Saving and
/// restoring the physical register is handled by the generation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Temp {
    id: u32,
}

impl Temp {
    /// Id used by the generation pass itself. Rules must not use it.
    pub const RESERVED_ID: u32 = 0xFFFF_FFFF;

    pub(crate) const INTERNAL: Temp = Temp::new(Self::RESERVED_ID);

    pub const fn new(id: u32) -> Self {
        Self { id }
    }

    pub const fn id(self) -> u32 {
        self.id
    }

    pub const fn is_reserved(self) -> bool {
        self.id == Self::RESERVED_ID
    }
}

impl From<Temp> for u32 {
    fn from(temp: Temp) -> Self {
        temp.id
    }
}

impl fmt::Display for Temp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.id)
    }
}

/// Position of an operand in the decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Operand {
    index: u32,
}

impl Operand {
    pub const fn new(index: u32) -> Self {
        Self { index }
    }

    pub const fn index(self) -> u32 {
        self.index
    }
}

impl From<Operand> for u32 {
    fn from(op: Operand) -> Self {
        op.index
    }
}

/// Role of a relocatable instruction in an instrumented sequence.
///
/// The raw values order the phases of a patch: everything tagged `0x2x` runs
/// before the original instruction, everything tagged `0x4x` after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RelocTag {
    Inst = 0x00,
    ChangeScratchRegister = 0x01,
    PatchBegin = 0x10,
    PreInstMemAccess = 0x20,
    PreInstStdCbk = 0x21,
    PatchInstBegin = 0x30,
    PatchInstEnd = 0x31,
    PostInstMemAccess = 0x40,
    PostInstStdCbk = 0x41,
    Invalid = 0xff,
}

impl RelocTag {
    /// Phase of a marker tag; `None` for tags that do not open a phase.
    pub fn phase(self) -> Option<u8> {
        match self {
            RelocTag::Inst | RelocTag::ChangeScratchRegister | RelocTag::Invalid => None,
            tag => Some(tag as u8 >> 4),
        }
    }

    pub fn is_pre_inst(self) -> bool {
        matches!(self, RelocTag::PreInstMemAccess | RelocTag::PreInstStdCbk)
    }

    pub fn is_post_inst(self) -> bool {
        matches!(self, RelocTag::PostInstMemAccess | RelocTag::PostInstStdCbk)
    }

    pub fn is_mem_access(self) -> bool {
        matches!(self, RelocTag::PreInstMemAccess | RelocTag::PostInstMemAccess)
    }

    /// Whether the tag opens a segment of injected instrumentation.
    pub fn is_instrumentation(self) -> bool {
        self.is_pre_inst() || self.is_post_inst()
    }
}

impl TryFrom<u8> for RelocTag {
    type Error = PatchError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Ok(match raw {
            0x00 => RelocTag::Inst,
            0x01 => RelocTag::ChangeScratchRegister,
            0x10 => RelocTag::PatchBegin,
            0x20 => RelocTag::PreInstMemAccess,
            0x21 => RelocTag::PreInstStdCbk,
            0x30 => RelocTag::PatchInstBegin,
            0x31 => RelocTag::PatchInstEnd,
            0x40 => RelocTag::PostInstMemAccess,
            0x41 => RelocTag::PostInstStdCbk,
            0xff => RelocTag::Invalid,
            _ => return Err(PatchError::InvalidRelocTag { position: None }),
        })
    }
}

impl fmt::Display for RelocTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelocTag::Inst => "inst",
            RelocTag::ChangeScratchRegister => "change-scratch-register",
            RelocTag::PatchBegin => "patch-begin",
            RelocTag::PreInstMemAccess => "pre-inst-mem-access",
            RelocTag::PreInstStdCbk => "pre-inst-callback",
            RelocTag::PatchInstBegin => "patch-inst-begin",
            RelocTag::PatchInstEnd => "patch-inst-end",
            RelocTag::PostInstMemAccess => "post-inst-mem-access",
            RelocTag::PostInstStdCbk => "post-inst-callback",
            RelocTag::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{AArch64, X86_64};

    #[test]
    fn test_reg_to_arch_is_stable() {
        for id in 0..X86_64::GPR_ID.len() as u32 {
            let reg = Reg::<X86_64>::new(id);
            assert_eq!(ArchReg::from(reg), ArchReg::from(reg));
            assert_eq!(ArchReg::from(reg), X86_64::GPR_ID[id as usize]);
        }
    }

    #[test]
    fn test_offsets_are_word_spaced() {
        for id in 0..(X86_64::GPR_ID.len() as u32 - 1) {
            let a = Reg::<X86_64>::new(id).offset();
            let b = Reg::<X86_64>::new(id + 1).offset();
            assert_eq!(b - a, X86_64::WORD_SIZE as u64);
        }
        for id in 0..(AArch64::GPR_ID.len() as u32 - 1) {
            let a = Reg::<AArch64>::new(id).offset();
            let b = Reg::<AArch64>::new(id + 1).offset();
            assert_eq!(b - a, AArch64::WORD_SIZE as u64);
        }
    }

    #[test]
    fn test_reg_arch_equality_is_symmetric() {
        for id in 0..X86_64::GPR_ID.len() as u32 {
            let reg = Reg::<X86_64>::new(id);
            for raw in 0..20 {
                let arch = ArchReg::new(raw);
                assert_eq!(reg == arch, arch == reg);
            }
        }
        // RBX is slot 1 but native id 3
        let rbx = Reg::<X86_64>::new(1);
        assert!(rbx == ArchReg::new(3));
        assert!(rbx != ArchReg::new(1));
    }

    #[test]
    fn test_try_new_rejects_out_of_range_slot() {
        let err = Reg::<X86_64>::try_new(18).unwrap_err();
        assert!(matches!(err, PatchError::InvalidRegister { id: 18, count: 18 }));
        assert!(Reg::<AArch64>::try_new(33).is_ok());
    }

    #[test]
    #[should_panic(expected = "GPR slot out of range")]
    fn test_new_panics_out_of_range() {
        let _ = Reg::<X86_64>::new(100);
    }

    #[test]
    fn test_offset_from_reg() {
        let off = Offset::from(Reg::<X86_64>::new(0));
        assert_eq!(off.value(), 64);
        assert_eq!(i64::from(Offset::new(-8)), -8);
    }

    #[test]
    fn test_shadow_tags() {
        assert!(Shadow::new(MEMORY_TAG_BEGIN).is_memory_tag());
        assert!(Shadow::new(MEMORY_TAG_END - 1).is_memory_tag());
        assert!(!Shadow::new(MEMORY_TAG_END).is_memory_tag());
        assert!(!Shadow::untagged().is_memory_tag());
        assert!(Shadow::untagged().is_untagged());
        assert_eq!(Shadow::new(0x1234).tag_word(), 0x1234u64);
    }

    #[test]
    fn test_temp_reserved() {
        assert!(Temp::new(0xFFFF_FFFF).is_reserved());
        assert!(!Temp::new(0).is_reserved());
        assert_eq!(u32::from(Temp::new(7)), 7);
    }

    #[test]
    fn test_constant_word() {
        let c = Constant::from(0xdead_beef_u64);
        assert_eq!(u64::from(c), 0xdead_beef);
    }

    #[test]
    fn test_reloc_tag_raw_values() {
        let tags = [
            RelocTag::Inst,
            RelocTag::ChangeScratchRegister,
            RelocTag::PatchBegin,
            RelocTag::PreInstMemAccess,
            RelocTag::PreInstStdCbk,
            RelocTag::PatchInstBegin,
            RelocTag::PatchInstEnd,
            RelocTag::PostInstMemAccess,
            RelocTag::PostInstStdCbk,
            RelocTag::Invalid,
        ];
        for tag in tags {
            assert_eq!(RelocTag::try_from(tag as u8).unwrap(), tag);
        }
        assert!(RelocTag::try_from(0x22).is_err());
        assert_eq!(RelocTag::PatchBegin as u8, 0x10);
        assert_eq!(RelocTag::PostInstStdCbk as u8, 0x41);
    }

    #[test]
    fn test_reloc_tag_phases() {
        assert_eq!(RelocTag::PatchBegin.phase(), Some(1));
        assert_eq!(RelocTag::PreInstStdCbk.phase(), Some(2));
        assert_eq!(RelocTag::PatchInstEnd.phase(), Some(3));
        assert_eq!(RelocTag::PostInstMemAccess.phase(), Some(4));
        assert_eq!(RelocTag::Inst.phase(), None);
        assert!(RelocTag::PreInstMemAccess.is_mem_access());
        assert!(!RelocTag::PatchInstBegin.is_instrumentation());
    }
}
