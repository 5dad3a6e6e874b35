//! Errors reported by the generation pass.

use std::fmt;

use super::types::{ArchReg, RelocTag, Temp};

/// Broad classification of a [`PatchError`].
///
/// None of these are retryable: the same input always fails the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A rule is malformed; only the offending instruction is affected.
    Authoring,
    /// The target description does not match what the rule or layout needs.
    Configuration,
    /// The data block of the current code-cache unit is full.
    Capacity,
}

/// Error type for patch generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// A rule used the temp id reserved for the generation pass.
    ReservedTemp(Temp),
    /// An operand index past the end of the decoded operand list.
    OperandOutOfRange { index: u32, count: usize },
    /// An operand of the wrong kind (e.g. an immediate where a register is needed).
    OperandKind { index: u32, expected: &'static str },
    /// An `Invalid` tag (or an unknown raw tag value) reached the generator.
    InvalidRelocTag { position: Option<usize> },
    /// A tag or instruction placed where the ordering policy forbids it.
    MisplacedTag { tag: RelocTag, position: usize },
    /// A reserved shadow tag used outside memory-access instrumentation.
    ReservedShadowTag(u16),
    /// A context offset outside the saved context.
    OffsetOutOfRange(i64),
    /// An immediate the target cannot encode in that position.
    ImmediateOutOfRange(i64),
    /// A register with no physical encoding (PC, flags...) used as an operand.
    RegisterNotEncodable(ArchReg),
    /// No scratch register left to bind a temp.
    ScratchExhausted(Temp),
    /// A scratch-register change for a temp that is not bound.
    ScratchNotBound(Temp),
    /// A GPR slot index outside the target's GPR table.
    InvalidRegister { id: u32, count: usize },
    /// A register the generated code reserves for itself.
    ReservedRegister(ArchReg),
    /// The data block is too far away from the code for a relocation.
    RelocationOutOfRange { at: usize, distance: i64 },
    /// No room left for another shadow cell.
    DataBlockFull { capacity: usize },
}

impl PatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PatchError::ReservedTemp(_)
            | PatchError::OperandOutOfRange { .. }
            | PatchError::OperandKind { .. }
            | PatchError::InvalidRelocTag { .. }
            | PatchError::MisplacedTag { .. }
            | PatchError::ReservedShadowTag(_)
            | PatchError::OffsetOutOfRange(_)
            | PatchError::ImmediateOutOfRange(_)
            | PatchError::RegisterNotEncodable(_)
            | PatchError::ScratchExhausted(_)
            | PatchError::ScratchNotBound(_) => ErrorKind::Authoring,
            PatchError::InvalidRegister { .. }
            | PatchError::ReservedRegister(_)
            | PatchError::RelocationOutOfRange { .. } => ErrorKind::Configuration,
            PatchError::DataBlockFull { .. } => ErrorKind::Capacity,
        }
    }
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::ReservedTemp(temp) => {
                write!(f, "temp id {:#x} is reserved for internal use", temp.id())
            }
            PatchError::OperandOutOfRange { index, count } => write!(
                f,
                "operand index {} out of range (instruction has {} operands)",
                index, count
            ),
            PatchError::OperandKind { index, expected } => {
                write!(f, "operand {} is not {}", index, expected)
            }
            PatchError::InvalidRelocTag { position: Some(pos) } => {
                write!(f, "invalid relocation tag at position {}", pos)
            }
            PatchError::InvalidRelocTag { position: None } => write!(f, "invalid relocation tag"),
            PatchError::MisplacedTag { tag, position } => {
                write!(f, "{} not allowed at position {}", tag, position)
            }
            PatchError::ReservedShadowTag(tag) => {
                write!(f, "shadow tag {:#06x} is reserved for memory access", tag)
            }
            PatchError::OffsetOutOfRange(offset) => {
                write!(f, "context offset {} out of range", offset)
            }
            PatchError::ImmediateOutOfRange(value) => {
                write!(f, "immediate {} cannot be encoded", value)
            }
            PatchError::RegisterNotEncodable(reg) => {
                write!(f, "register {} cannot be used as an operand", reg)
            }
            PatchError::ScratchExhausted(temp) => {
                write!(f, "no scratch register left for {}", temp)
            }
            PatchError::ScratchNotBound(temp) => {
                write!(f, "scratch register change for unbound {}", temp)
            }
            PatchError::InvalidRegister { id, count } => write!(
                f,
                "GPR slot {} out of range (target has {} slots)",
                id, count
            ),
            PatchError::ReservedRegister(reg) => {
                write!(f, "register {} is reserved by the generated code", reg)
            }
            PatchError::RelocationOutOfRange { at, distance } => write!(
                f,
                "relocation at code offset {} out of range (distance {:#x})",
                at, distance
            ),
            PatchError::DataBlockFull { capacity } => {
                write!(f, "data block full ({} shadow cells)", capacity)
            }
        }
    }
}

impl std::error::Error for PatchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(PatchError::ReservedTemp(Temp::new(u32::MAX)).kind(), ErrorKind::Authoring);
        assert_eq!(
            PatchError::OperandOutOfRange { index: 5, count: 3 }.kind(),
            ErrorKind::Authoring
        );
        assert_eq!(
            PatchError::InvalidRegister { id: 40, count: 18 }.kind(),
            ErrorKind::Configuration
        );
        assert_eq!(PatchError::DataBlockFull { capacity: 4 }.kind(), ErrorKind::Capacity);
    }

    #[test]
    fn test_display() {
        let err = PatchError::OperandOutOfRange { index: 5, count: 3 };
        assert_eq!(
            err.to_string(),
            "operand index 5 out of range (instruction has 3 operands)"
        );
        assert_eq!(
            PatchError::ReservedShadowTag(0xffe0).to_string(),
            "shadow tag 0xffe0 is reserved for memory access"
        );
    }
}
