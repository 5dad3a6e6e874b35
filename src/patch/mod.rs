//! Symbolic patches and the pass that lowers them.
//!
//! A patch rewrites one guest instruction into a sequence of native
//! instructions. Rules describe that sequence with symbolic operands
//! ([`Temp`], [`Shadow`], [`Offset`], [`Operand`], [`Constant`]) which
//! [`PatchGenerator`] resolves against the target, the decoded instruction
//! and the data block.

pub mod datablock;
mod error;
pub mod generator;
pub mod inst;
pub mod memaccess;
pub mod reloc;
pub mod rule;
pub mod temp;
mod types;

pub use datablock::{DataBlock, ShadowCell};
pub use error::{ErrorKind, PatchError};
pub use generator::{GeneratedPatch, PatchGenerator, SegmentTemps};
pub use inst::{Inst, MachineOperand};
pub use memaccess::{AccessKind, MemoryAccess, memory_access_rules};
pub use reloc::{PatchOp, RegRef, RelocatableInst, check_order};
pub use rule::{InstrRule, PatchRule, Position, assemble};
pub use temp::{TempBinding, TempManager};
pub use types::{
    ArchReg, Constant, MEMORY_TAG_ADDRESS, MEMORY_TAG_BEGIN, MEMORY_TAG_END,
    MEMORY_TAG_READ_VALUE, MEMORY_TAG_WRITE_VALUE, Offset, Operand, Reg, RelocTag, Shadow, Temp,
    UNTAGGED,
};
