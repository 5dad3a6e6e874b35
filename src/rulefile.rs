//! Patch description files.
//!
//! A description names one decoded instruction and the rules to instrument
//! it with:
//!
//! ```toml
//! [target]
//! arch = "x86_64"
//!
//! [generation]
//! max_shadows = 64
//!
//! [instruction]
//! address = 0x401000
//! bytes = "48 8b 43 08"
//! operands = [{ reg = "rax" }, { reg = "rbx" }, { imm = 8 }]
//!
//! [[patch]]
//! op = "original"
//!
//! [[instrument]]
//! position = "pre"
//! ops = [
//!     { op = "mov_imm", dst = { temp = 0 }, value = 0x1234 },
//!     { op = "store_context", src = { temp = 0 }, offset = { reg = "rax" } },
//! ]
//!
//! [[memory_access]]
//! base = 1
//! disp = 2
//! kind = "read"
//! ```
//!
//! Registers are referred to by name. In rule operations `{ slot = N }`
//! names a guest register by its context slot instead.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::config::{GenerationConfig, TargetArch};
use crate::patch::{
    AccessKind, ArchReg, Constant, Inst, InstrRule, MachineOperand, MemoryAccess, Offset, Operand,
    PatchOp, PatchRule, Position, Reg, RegRef, RelocatableInst, Shadow, Temp, memory_access_rules,
};
use crate::target::Target;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSection {
    pub arch: TargetArch,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BytesSpec {
    /// Whitespace separated hex bytes
    Hex(String),
    List(Vec<u8>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandSpec {
    Reg(String),
    Imm(i64),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstructionSpec {
    pub address: u64,
    pub bytes: BytesSpec,
    #[serde(default)]
    pub operands: Vec<OperandSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegRefSpec {
    Slot(u32),
    Temp(u32),
}

/// Register operand of a rule operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RegSpec {
    Named { reg: String },
    Ref(RegRefSpec),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OffsetSpec {
    Bytes(i64),
    Reg { reg: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpSpec {
    Original,
    Mov {
        dst: RegSpec,
        src: RegSpec,
    },
    MovImm {
        dst: RegSpec,
        value: u64,
    },
    MovOperand {
        dst: u32,
        operand: u32,
    },
    AddImm {
        dst: RegSpec,
        value: i64,
    },
    Lea {
        dst: u32,
        base: u32,
        disp: u32,
    },
    LoadContext {
        dst: RegSpec,
        offset: OffsetSpec,
    },
    StoreContext {
        src: RegSpec,
        offset: OffsetSpec,
    },
    LoadShadow {
        dst: RegSpec,
        tag: Option<u16>,
    },
    StoreShadow {
        src: RegSpec,
        tag: Option<u16>,
    },
    LoadMem {
        dst: u32,
        addr: u32,
    },
    Call {
        target: u64,
    },
    UpdatePc,
    ChangeScratch {
        temp: u32,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentSpec {
    pub position: Position,
    #[serde(default)]
    pub ops: Vec<OpSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryAccessSpec {
    pub base: u32,
    pub disp: u32,
    pub kind: AccessKind,
}

/// A parsed patch description file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleFile {
    pub target: TargetSection,
    #[serde(default)]
    pub generation: GenerationConfig,
    pub instruction: InstructionSpec,
    /// Body of the patch rule; `[original]` when empty
    #[serde(default)]
    pub patch: Vec<OpSpec>,
    #[serde(default)]
    pub instrument: Vec<InstrumentSpec>,
    #[serde(default)]
    pub memory_access: Vec<MemoryAccessSpec>,
}

/// Everything needed for one call to `PatchGenerator::generate`.
#[derive(Debug, Clone)]
pub struct PatchJob<T: Target> {
    pub inst: Inst,
    pub patch: PatchRule<T>,
    pub rules: Vec<InstrRule<T>>,
}

impl RuleFile {
    /// Load a description from a file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::parse(&content).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("failed to parse patch description: {}", e))
    }

    /// Resolve names and build the instruction and rules for target `T`.
    ///
    /// Memory-access rules come before the `[[instrument]]` rules of the same
    /// position.
    pub fn build<T: Target>(&self) -> Result<PatchJob<T>, String> {
        let inst = self.instruction.build::<T>()?;

        let patch = if self.patch.is_empty() {
            PatchRule::original()
        } else {
            PatchRule::new(build_body::<T>(&self.patch)?).map_err(|e| e.to_string())?
        };

        let mut rules = Vec::new();
        for access in &self.memory_access {
            rules.extend(memory_access_rules::<T>(MemoryAccess {
                base: Operand::new(access.base),
                disp: Operand::new(access.disp),
                kind: access.kind,
            }));
        }
        for spec in &self.instrument {
            let body = build_body::<T>(&spec.ops)?;
            rules.push(InstrRule::new(spec.position, body).map_err(|e| e.to_string())?);
        }

        Ok(PatchJob { inst, patch, rules })
    }
}

impl InstructionSpec {
    fn build<T: Target>(&self) -> Result<Inst, String> {
        let bytes = match &self.bytes {
            BytesSpec::List(bytes) => bytes.clone(),
            BytesSpec::Hex(hex) => parse_hex(hex)?,
        };
        let operands = self
            .operands
            .iter()
            .map(|op| match op {
                OperandSpec::Reg(name) => lookup_slot::<T>(name).map(|slot| {
                    MachineOperand::Reg(T::GPR_ID[slot as usize])
                }),
                OperandSpec::Imm(value) => Ok(MachineOperand::Imm(*value)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Inst::new(self.address, bytes, operands))
    }
}

fn parse_hex(hex: &str) -> Result<Vec<u8>, String> {
    hex.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).map_err(|_| format!("invalid byte '{}'", b)))
        .collect()
}

fn lookup_slot<T: Target>(name: &str) -> Result<u32, String> {
    T::GPR_NAMES
        .iter()
        .position(|n| n.eq_ignore_ascii_case(name))
        .map(|slot| slot as u32)
        .ok_or_else(|| format!("unknown {} register '{}'", T::NAME, name))
}

fn build_reg<T: Target>(spec: &RegSpec) -> Result<RegRef<T>, String> {
    match spec {
        RegSpec::Named { reg } => Ok(RegRef::Reg(Reg::new(lookup_slot::<T>(reg)?))),
        RegSpec::Ref(RegRefSpec::Slot(slot)) => Reg::try_new(*slot)
            .map(RegRef::Reg)
            .map_err(|e| e.to_string()),
        RegSpec::Ref(RegRefSpec::Temp(id)) => Ok(RegRef::Temp(Temp::new(*id))),
    }
}

fn build_offset<T: Target>(spec: &OffsetSpec) -> Result<Offset, String> {
    match spec {
        OffsetSpec::Bytes(value) => Ok(Offset::new(*value)),
        OffsetSpec::Reg { reg } => Ok(Offset::from(Reg::<T>::new(lookup_slot::<T>(reg)?))),
    }
}

fn build_shadow(tag: Option<u16>) -> Shadow {
    tag.map_or(Shadow::untagged(), Shadow::new)
}

fn build_body<T: Target>(ops: &[OpSpec]) -> Result<Vec<RelocatableInst<T>>, String> {
    ops.iter().map(build_op::<T>).collect()
}

fn build_op<T: Target>(spec: &OpSpec) -> Result<RelocatableInst<T>, String> {
    let op = match spec {
        OpSpec::Original => PatchOp::Original,
        OpSpec::Mov { dst, src } => PatchOp::Mov {
            dst: build_reg(dst)?,
            src: build_reg(src)?,
        },
        OpSpec::MovImm { dst, value } => PatchOp::MovImm {
            dst: build_reg(dst)?,
            value: Constant::new(*value),
        },
        OpSpec::MovOperand { dst, operand } => PatchOp::MovOperand {
            dst: Temp::new(*dst),
            operand: Operand::new(*operand),
        },
        OpSpec::AddImm { dst, value } => PatchOp::AddImm {
            dst: build_reg(dst)?,
            value: *value,
        },
        OpSpec::Lea { dst, base, disp } => PatchOp::Lea {
            dst: Temp::new(*dst),
            base: Operand::new(*base),
            disp: Operand::new(*disp),
        },
        OpSpec::LoadContext { dst, offset } => PatchOp::LoadContext {
            dst: build_reg(dst)?,
            offset: build_offset::<T>(offset)?,
        },
        OpSpec::StoreContext { src, offset } => PatchOp::StoreContext {
            src: build_reg(src)?,
            offset: build_offset::<T>(offset)?,
        },
        OpSpec::LoadShadow { dst, tag } => PatchOp::LoadShadow {
            dst: build_reg(dst)?,
            shadow: build_shadow(*tag),
        },
        OpSpec::StoreShadow { src, tag } => PatchOp::StoreShadow {
            src: build_reg(src)?,
            shadow: build_shadow(*tag),
        },
        OpSpec::LoadMem { dst, addr } => PatchOp::LoadMem {
            dst: Temp::new(*dst),
            addr: Temp::new(*addr),
        },
        OpSpec::Call { target } => PatchOp::Call {
            target: Constant::new(*target),
        },
        OpSpec::UpdatePc => PatchOp::UpdatePc,
        OpSpec::ChangeScratch { temp } => {
            return Ok(RelocatableInst::ChangeScratch(Temp::new(*temp)));
        }
    };
    Ok(RelocatableInst::Op(op))
}

/// Native register named `name` on target `T`.
pub fn arch_reg<T: Target>(name: &str) -> Result<ArchReg, String> {
    lookup_slot::<T>(name).map(|slot| T::GPR_ID[slot as usize])
}
