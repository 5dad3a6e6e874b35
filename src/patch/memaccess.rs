//! Built-in memory-access instrumentation.
//!
//! Records the effective address of a load or store and the value moved, in
//! shadow cells tagged from the reserved memory-access range. This module is
//! the only place such rules are built; user rules touching those tags are
//! rejected by the generator.

use serde::{Deserialize, Serialize};

use super::reloc::{PatchOp, RegRef};
use super::rule::{InstrRule, Position};
use super::types::{
    MEMORY_TAG_ADDRESS, MEMORY_TAG_READ_VALUE, MEMORY_TAG_WRITE_VALUE, Operand, Shadow, Temp,
};
use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
    ReadWrite,
}

impl AccessKind {
    pub fn reads(self) -> bool {
        matches!(self, AccessKind::Read | AccessKind::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessKind::Write | AccessKind::ReadWrite)
    }
}

/// A `[base + disp]` memory operand of the instrumented instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryAccess {
    /// Operand holding the base register
    pub base: Operand,
    /// Operand holding the displacement immediate
    pub disp: Operand,
    pub kind: AccessKind,
}

/// Shadow holding the effective address.
pub const ADDRESS: Shadow = Shadow::new(MEMORY_TAG_ADDRESS);
/// Shadow holding the value read, captured before the instruction runs.
pub const READ_VALUE: Shadow = Shadow::new(MEMORY_TAG_READ_VALUE);
/// Shadow holding the value written, captured after the instruction runs.
pub const WRITE_VALUE: Shadow = Shadow::new(MEMORY_TAG_WRITE_VALUE);

/// Rules recording `access`.
///
/// The pre rule computes the address before the instruction can clobber the
/// base register. A write gets a post rule that reloads the address and
/// reads back the stored value.
pub fn memory_access_rules<T: Target>(access: MemoryAccess) -> Vec<InstrRule<T>> {
    let addr = Temp::new(0);
    let value = Temp::new(1);

    let mut pre = vec![
        PatchOp::Lea {
            dst: addr,
            base: access.base,
            disp: access.disp,
        },
        PatchOp::StoreShadow {
            src: RegRef::Temp(addr),
            shadow: ADDRESS,
        },
    ];
    if access.kind.reads() {
        pre.push(PatchOp::LoadMem { dst: value, addr });
        pre.push(PatchOp::StoreShadow {
            src: RegRef::Temp(value),
            shadow: READ_VALUE,
        });
    }

    let mut rules = vec![InstrRule::memory_access(Position::Pre, pre)];

    if access.kind.writes() {
        let post = vec![
            PatchOp::LoadShadow {
                dst: RegRef::Temp(addr),
                shadow: ADDRESS,
            },
            PatchOp::LoadMem { dst: value, addr },
            PatchOp::StoreShadow {
                src: RegRef::Temp(value),
                shadow: WRITE_VALUE,
            },
        ];
        rules.push(InstrRule::memory_access(Position::Post, post));
    }

    rules
}
