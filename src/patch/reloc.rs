//! Relocatable instructions and the order they are emitted in.
//!
//! A patch is described as one flat list of [`RelocatableInst`]s. Zero-byte
//! [`RelocatableInst::Tag`] markers split the list into segments; each
//! operation belongs to the segment opened by the closest marker before it.

use super::error::PatchError;
use super::types::{Constant, Offset, Operand, RelocTag, Reg, Shadow, Temp};
use crate::target::Target;

/// A register operand of a [`PatchOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegRef<T: Target> {
    /// A guest register, used in place in its physical register.
    Reg(Reg<T>),
    Temp(Temp),
}

impl<T: Target> From<Reg<T>> for RegRef<T> {
    fn from(reg: Reg<T>) -> Self {
        RegRef::Reg(reg)
    }
}

impl<T: Target> From<Temp> for RegRef<T> {
    fn from(temp: Temp) -> Self {
        RegRef::Temp(temp)
    }
}

/// One symbolic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchOp<T: Target> {
    /// The instrumented instruction itself, copied verbatim.
    Original,
    Mov { dst: RegRef<T>, src: RegRef<T> },
    MovImm { dst: RegRef<T>, value: Constant },
    /// Copy a register or immediate operand of the instrumented instruction.
    MovOperand { dst: Temp, operand: Operand },
    AddImm { dst: RegRef<T>, value: i64 },
    /// `dst = base + disp` where both come from the instruction's operands.
    Lea { dst: Temp, base: Operand, disp: Operand },
    LoadContext { dst: RegRef<T>, offset: Offset },
    StoreContext { src: RegRef<T>, offset: Offset },
    LoadShadow { dst: RegRef<T>, shadow: Shadow },
    StoreShadow { src: RegRef<T>, shadow: Shadow },
    /// Load the word at the address held in `addr`.
    LoadMem { dst: Temp, addr: Temp },
    /// Call a host function. Guest registers, flags and stack survive the call;
    /// temps bound in the segment hold their pre-call values afterwards.
    Call { target: Constant },
    /// Write the address of the next guest instruction into the saved PC.
    UpdatePc,
}

impl<T: Target> PatchOp<T> {
    /// Temps named by this operation, in operand order.
    pub fn temps(&self) -> Vec<Temp> {
        let regs = self.reg_refs();
        let mut temps: Vec<Temp> = regs
            .into_iter()
            .filter_map(|r| match r {
                RegRef::Temp(t) => Some(t),
                RegRef::Reg(_) => None,
            })
            .collect();
        match *self {
            PatchOp::MovOperand { dst, .. } | PatchOp::Lea { dst, .. } => temps.push(dst),
            PatchOp::LoadMem { dst, addr } => {
                temps.push(dst);
                temps.push(addr);
            }
            _ => {}
        }
        temps
    }

    /// Guest registers used in place by this operation.
    pub fn guest_regs(&self) -> Vec<Reg<T>> {
        self.reg_refs()
            .into_iter()
            .filter_map(|r| match r {
                RegRef::Reg(reg) => Some(reg),
                RegRef::Temp(_) => None,
            })
            .collect()
    }

    fn reg_refs(&self) -> Vec<RegRef<T>> {
        match *self {
            PatchOp::Mov { dst, src } => vec![dst, src],
            PatchOp::MovImm { dst, .. }
            | PatchOp::AddImm { dst, .. }
            | PatchOp::LoadContext { dst, .. }
            | PatchOp::LoadShadow { dst, .. } => vec![dst],
            PatchOp::StoreContext { src, .. } | PatchOp::StoreShadow { src, .. } => vec![src],
            _ => Vec::new(),
        }
    }

    /// The shadow cell this operation reads or writes.
    pub fn shadow(&self) -> Option<Shadow> {
        match *self {
            PatchOp::LoadShadow { shadow, .. } | PatchOp::StoreShadow { shadow, .. } => {
                Some(shadow)
            }
            _ => None,
        }
    }
}

/// An entry of a patch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocatableInst<T: Target> {
    Op(PatchOp<T>),
    /// Move a bound temp to another scratch register.
    ChangeScratch(Temp),
    /// Segment marker; emits no bytes.
    Tag(RelocTag),
}

impl<T: Target> RelocatableInst<T> {
    pub fn tag(&self) -> RelocTag {
        match self {
            RelocatableInst::Op(_) => RelocTag::Inst,
            RelocatableInst::ChangeScratch(_) => RelocTag::ChangeScratchRegister,
            RelocatableInst::Tag(tag) => *tag,
        }
    }
}

impl<T: Target> From<PatchOp<T>> for RelocatableInst<T> {
    fn from(op: PatchOp<T>) -> Self {
        RelocatableInst::Op(op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Begun,
    Pre,
    Inst,
    InstClosed,
    Post,
}

/// Check that `seq` follows the patch layout:
///
/// ```text
/// PatchBegin (Pre* segment)* PatchInstBegin .. PatchInstEnd (Post* segment)*
/// ```
///
/// `Original` may only appear inside the instruction bracket, and every other
/// operation must sit inside some segment.
pub fn check_order<T: Target>(seq: &[RelocatableInst<T>]) -> Result<(), PatchError> {
    let mut phase = Phase::Start;

    for (position, item) in seq.iter().enumerate() {
        let tag = item.tag();
        if tag == RelocTag::Invalid {
            return Err(PatchError::InvalidRelocTag {
                position: Some(position),
            });
        }
        let misplaced = PatchError::MisplacedTag { tag, position };

        phase = match (phase, item) {
            (Phase::Start, RelocatableInst::Tag(RelocTag::PatchBegin)) => Phase::Begun,
            (Phase::Start, _) => return Err(misplaced),

            (Phase::Begun | Phase::Pre, RelocatableInst::Tag(t)) if t.is_pre_inst() => Phase::Pre,
            (Phase::Begun | Phase::Pre, RelocatableInst::Tag(RelocTag::PatchInstBegin)) => {
                Phase::Inst
            }
            (Phase::Inst, RelocatableInst::Tag(RelocTag::PatchInstEnd)) => Phase::InstClosed,
            (Phase::InstClosed | Phase::Post, RelocatableInst::Tag(t)) if t.is_post_inst() => {
                Phase::Post
            }
            (_, RelocatableInst::Tag(_)) => return Err(misplaced),

            (Phase::Inst, RelocatableInst::Op(PatchOp::Original)) => Phase::Inst,
            (_, RelocatableInst::Op(PatchOp::Original)) => return Err(misplaced),

            (Phase::Pre | Phase::Inst | Phase::Post, _) => phase,
            (Phase::Begun | Phase::InstClosed, _) => return Err(misplaced),
        };
    }

    let missing = match phase {
        Phase::Start => Some(RelocTag::PatchBegin),
        Phase::Begun | Phase::Pre => Some(RelocTag::PatchInstBegin),
        Phase::Inst => Some(RelocTag::PatchInstEnd),
        Phase::InstClosed | Phase::Post => None,
    };
    match missing {
        Some(tag) => Err(PatchError::MisplacedTag {
            tag,
            position: seq.len(),
        }),
        None => Ok(()),
    }
}
