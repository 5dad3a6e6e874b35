//! Decoded instructions as supplied by the disassembler.

use serde::Serialize;

use super::error::PatchError;
use super::types::{ArchReg, Operand};

/// One operand of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineOperand {
    Reg(ArchReg),
    Imm(i64),
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inst {
    /// Guest address of the instruction
    pub address: u64,
    /// Encoded bytes, copied verbatim for `PatchOp::Original`
    pub bytes: Vec<u8>,
    pub operands: Vec<MachineOperand>,
}

impl Inst {
    pub fn new(address: u64, bytes: Vec<u8>, operands: Vec<MachineOperand>) -> Self {
        Self {
            address,
            bytes,
            operands,
        }
    }

    /// Size of the original encoding in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address of the next instruction in guest order.
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.bytes.len() as u64)
    }

    pub fn operand(&self, op: Operand) -> Result<MachineOperand, PatchError> {
        self.operands
            .get(op.index() as usize)
            .copied()
            .ok_or(PatchError::OperandOutOfRange {
                index: op.index(),
                count: self.operands.len(),
            })
    }

    /// Resolve `op` to the register it names.
    pub fn reg_operand(&self, op: Operand) -> Result<ArchReg, PatchError> {
        match self.operand(op)? {
            MachineOperand::Reg(reg) => Ok(reg),
            MachineOperand::Imm(_) => Err(PatchError::OperandKind {
                index: op.index(),
                expected: "a register",
            }),
        }
    }

    pub fn imm_operand(&self, op: Operand) -> Result<i64, PatchError> {
        match self.operand(op)? {
            MachineOperand::Imm(value) => Ok(value),
            MachineOperand::Reg(_) => Err(PatchError::OperandKind {
                index: op.index(),
                expected: "an immediate",
            }),
        }
    }

    /// Registers named by the operands, in operand order.
    pub fn used_regs(&self) -> impl Iterator<Item = ArchReg> + '_ {
        self.operands.iter().filter_map(|op| match op {
            MachineOperand::Reg(reg) => Some(*reg),
            MachineOperand::Imm(_) => None,
        })
    }
}
