//! The generation pass.
//!
//! Lowers an assembled patch sequence for one instruction into native bytes.
//! Segments are lowered one at a time: temps are bound on first use (saving
//! the guest value of their register into a fresh shadow) and every saved
//! register is restored when the segment ends.

use std::collections::BTreeSet;
use std::ops::Range;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::datablock::{DataBlock, ShadowCell};
use super::error::PatchError;
use super::inst::{Inst, MachineOperand};
use super::reloc::{PatchOp, RegRef, RelocatableInst, check_order};
use super::rule::{InstrRule, PatchRule, assemble};
use super::temp::{TempBinding, TempManager};
use super::types::{ArchReg, RelocTag, Shadow, Temp};
use crate::config::GenerationConfig;
use crate::jit::{CodeBuffer, Fixup, TagMark, apply_fixups};
use crate::target::{NativeOp, Target};

/// Temp bindings made inside one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentTemps {
    pub segment: RelocTag,
    pub bindings: Vec<TempBinding>,
}

/// Output of one successful generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedPatch {
    pub arch: &'static str,
    /// Guest address of the instrumented instruction
    pub address: u64,
    /// Code with data-block displacements still unresolved
    pub code: Vec<u8>,
    pub marks: Vec<TagMark>,
    pub fixups: Vec<Fixup>,
    /// Shadow cells allocated for this instruction
    pub shadows: Vec<ShadowCell>,
    pub temps: Vec<SegmentTemps>,
}

impl GeneratedPatch {
    /// Code for placement at `code_addr` with its data block at `data_addr`.
    pub fn relocate(&self, code_addr: u64, data_addr: u64) -> Result<Vec<u8>, PatchError> {
        let mut code = self.code.clone();
        apply_fixups(&mut code, &self.fixups, code_addr, data_addr)?;
        Ok(code)
    }

    /// Byte range of the instruction bracket.
    pub fn original_range(&self) -> Option<Range<usize>> {
        let offset_of = |tag| self.marks.iter().find(|m| m.tag == tag).map(|m| m.offset);
        let start = offset_of(RelocTag::PatchInstBegin)?;
        let end = offset_of(RelocTag::PatchInstEnd)?;
        Some(start..end)
    }

    /// Every marker with the byte range it covers.
    pub fn segments(&self) -> Vec<(RelocTag, Range<usize>)> {
        self.marks
            .iter()
            .enumerate()
            .map(|(i, mark)| {
                let end = self
                    .marks
                    .get(i + 1)
                    .map_or(self.code.len(), |next| next.offset);
                (mark.tag, mark.offset..end)
            })
            .collect()
    }

    /// The segment the byte at `offset` belongs to.
    pub fn segment_at(&self, offset: usize) -> Option<RelocTag> {
        if offset >= self.code.len() {
            return None;
        }
        self.marks
            .iter()
            .rev()
            .find(|m| m.offset <= offset)
            .map(|m| m.tag)
    }

    /// Whether the byte at `offset` was injected by an instrumentation rule.
    pub fn is_instrumentation(&self, offset: usize) -> bool {
        self.segment_at(offset)
            .is_some_and(|tag| tag.is_instrumentation())
    }
}

/// Generates patches for the instructions of one code-cache unit.
///
/// The generator owns the unit's data block; shadow cells allocated by
/// earlier instructions stay allocated until the generator is dropped.
#[derive(Debug)]
pub struct PatchGenerator<T: Target> {
    config: GenerationConfig,
    data: DataBlock<T>,
    /// Sequence number of the next instruction
    next_inst: u64,
}

impl<T: Target> PatchGenerator<T> {
    pub fn new(config: GenerationConfig) -> Self {
        let data = DataBlock::new(config.max_shadows);
        Self {
            config,
            data,
            next_inst: 0,
        }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn data_block(&self) -> &DataBlock<T> {
        &self.data
    }

    /// Instrument `inst` with `patch` and `rules`.
    pub fn generate(
        &mut self,
        inst: &Inst,
        patch: &PatchRule<T>,
        rules: &[InstrRule<T>],
    ) -> Result<GeneratedPatch, PatchError> {
        let seq = assemble(patch, rules);
        self.generate_sequence(inst, &seq)
    }

    /// Lower an already assembled sequence.
    ///
    /// On error nothing is emitted and every shadow cell allocated for
    /// `inst` is released.
    pub fn generate_sequence(
        &mut self,
        inst: &Inst,
        seq: &[RelocatableInst<T>],
    ) -> Result<GeneratedPatch, PatchError> {
        let checkpoint = self.data.checkpoint();

        let result = validate(inst, seq).and_then(|()| {
            let emitter = Emitter {
                inst,
                inst_id: self.next_inst,
                data: &mut self.data,
                buf: CodeBuffer::with_capacity(inst.len() + 64),
                temps: Vec::new(),
                trace: self.config.trace,
            };
            emitter.run(seq)
        });

        match result {
            Ok((buf, temps)) => {
                let (code, marks, fixups) = buf.into_parts();
                let patch = GeneratedPatch {
                    arch: T::NAME,
                    address: inst.address,
                    code,
                    marks,
                    fixups,
                    shadows: self.data.cells_since(checkpoint).to_vec(),
                    temps,
                };
                debug!(
                    arch = T::NAME,
                    address = inst.address,
                    size = patch.code.len(),
                    shadows = patch.shadows.len(),
                    "generated patch"
                );
                self.next_inst += 1;
                Ok(patch)
            }
            Err(err) => {
                self.data.rollback(checkpoint);
                if let PatchError::DataBlockFull { capacity } = err {
                    warn!(capacity, address = inst.address, "data block full");
                } else {
                    debug!(address = inst.address, error = %err, "generation failed");
                }
                Err(err)
            }
        }
    }
}

/// Authoring and configuration checks that do not depend on allocation.
fn validate<T: Target>(inst: &Inst, seq: &[RelocatableInst<T>]) -> Result<(), PatchError> {
    check_order(seq)?;

    if let Some(reg) = inst.used_regs().find(|r| T::RESERVED.contains(r)) {
        return Err(PatchError::ReservedRegister(reg));
    }

    let mut segment = RelocTag::PatchBegin;
    for item in seq {
        match item {
            RelocatableInst::Tag(tag) => segment = *tag,
            RelocatableInst::ChangeScratch(temp) => TempManager::check_user(*temp)?,
            RelocatableInst::Op(op) => {
                for temp in op.temps() {
                    TempManager::check_user(temp)?;
                }
                for reg in op.guest_regs() {
                    if T::RESERVED.contains(&reg.arch()) {
                        return Err(PatchError::ReservedRegister(reg.arch()));
                    }
                }
                if let Some(shadow) = op.shadow() {
                    if shadow.is_memory_tag() && !segment.is_mem_access() {
                        return Err(PatchError::ReservedShadowTag(shadow.tag()));
                    }
                }
            }
        }
    }
    Ok(())
}

fn opens_segment(tag: RelocTag) -> bool {
    tag == RelocTag::PatchInstBegin || tag.is_instrumentation()
}

struct Emitter<'a, T: Target> {
    inst: &'a Inst,
    inst_id: u64,
    data: &'a mut DataBlock<T>,
    buf: CodeBuffer,
    temps: Vec<SegmentTemps>,
    trace: bool,
}

impl<T: Target> Emitter<'_, T> {
    fn run(
        mut self,
        seq: &[RelocatableInst<T>],
    ) -> Result<(CodeBuffer, Vec<SegmentTemps>), PatchError> {
        let mut current: Option<(RelocTag, TempManager)> = None;

        for (position, item) in seq.iter().enumerate() {
            let misplaced = PatchError::MisplacedTag {
                tag: item.tag(),
                position,
            };
            match item {
                RelocatableInst::Tag(tag) => {
                    if let Some((open, tm)) = current.take() {
                        self.close_segment(open, tm)?;
                    }
                    self.buf.mark(*tag);
                    if opens_segment(*tag) {
                        let body = &seq[position + 1..];
                        let end = body
                            .iter()
                            .position(|i| matches!(i, RelocatableInst::Tag(_)))
                            .unwrap_or(body.len());
                        let pool = self.scratch_pool(&body[..end]);
                        current = Some((*tag, TempManager::new(pool)));
                    }
                }
                RelocatableInst::ChangeScratch(temp) => {
                    let (_, tm) = current.as_mut().ok_or(misplaced)?;
                    self.change_scratch(tm, *temp)?;
                }
                RelocatableInst::Op(op) => {
                    let (_, tm) = current.as_mut().ok_or(misplaced)?;
                    self.lower_op(tm, op)?;
                }
            }
        }
        if let Some((open, tm)) = current.take() {
            self.close_segment(open, tm)?;
        }

        Ok((self.buf, self.temps))
    }

    /// Scratch registers usable in a segment: the target pool minus the
    /// instruction's registers and the guest registers the segment uses.
    fn scratch_pool(&self, body: &[RelocatableInst<T>]) -> Vec<ArchReg> {
        let mut excluded: BTreeSet<ArchReg> = self.inst.used_regs().collect();
        excluded.extend(T::RESERVED.iter().copied());
        for item in body {
            if let RelocatableInst::Op(op) = item {
                excluded.extend(op.guest_regs().into_iter().map(|r| r.arch()));
            }
        }
        T::SCRATCH_POOL
            .iter()
            .copied()
            .filter(|r| !excluded.contains(r))
            .collect()
    }

    fn emit(&mut self, op: NativeOp<'_>) -> Result<(), PatchError> {
        if self.trace {
            trace!(offset = self.buf.len(), ?op, "lower");
        }
        T::lower(&op, &mut self.buf)
    }

    fn close_segment(&mut self, tag: RelocTag, tm: TempManager) -> Result<(), PatchError> {
        let (saved, bindings) = tm.finish();
        for (reg, data_offset) in saved {
            self.emit(NativeOp::LoadData {
                dst: reg,
                data_offset,
            })?;
        }
        if !bindings.is_empty() {
            self.temps.push(SegmentTemps {
                segment: tag,
                bindings,
            });
        }
        Ok(())
    }

    /// Save `reg` into a fresh shadow so the segment end can restore it.
    fn save(&mut self, tm: &mut TempManager, reg: ArchReg) -> Result<(), PatchError> {
        let data_offset = self.data.shadow_offset(self.inst_id, Shadow::untagged())?;
        self.emit(NativeOp::StoreData {
            src: reg,
            data_offset,
        })?;
        tm.record_save(reg, data_offset);
        Ok(())
    }

    fn temp(&mut self, tm: &mut TempManager, temp: Temp) -> Result<ArchReg, PatchError> {
        let binding = tm.bind(temp)?;
        if binding.fresh {
            self.save(tm, binding.reg)?;
        }
        Ok(binding.reg)
    }

    fn reg(&mut self, tm: &mut TempManager, r: RegRef<T>) -> Result<ArchReg, PatchError> {
        match r {
            RegRef::Reg(reg) => Ok(reg.arch()),
            RegRef::Temp(temp) => self.temp(tm, temp),
        }
    }

    fn change_scratch(&mut self, tm: &mut TempManager, temp: Temp) -> Result<(), PatchError> {
        let (old, new) = tm.rotate(temp)?;
        self.save(tm, new)?;
        self.emit(NativeOp::Mov { dst: new, src: old })?;
        if let Some(data_offset) = tm.take_save(old) {
            self.emit(NativeOp::LoadData {
                dst: old,
                data_offset,
            })?;
        }
        Ok(())
    }

    /// Load `reg + disp` into `dst`. The guest PC has no physical register,
    /// so its value is materialized as an immediate.
    fn load_reg_plus(&mut self, dst: ArchReg, reg: ArchReg, disp: i64) -> Result<(), PatchError> {
        if reg == T::GPR_ID[T::PC_SLOT as usize] {
            let pc = T::pc_value(self.inst.address, self.inst.len());
            return self.emit(NativeOp::MovImm {
                dst,
                value: pc.wrapping_add_signed(disp),
            });
        }
        self.emit(NativeOp::Mov { dst, src: reg })?;
        if disp != 0 {
            self.emit(NativeOp::AddImm { dst, value: disp })?;
        }
        Ok(())
    }

    /// Call into the host. Every register the call may clobber is saved to
    /// a fresh shadow before and reloaded after, temps included.
    fn call(&mut self, target: u64) -> Result<(), PatchError> {
        let mut saved = Vec::with_capacity(T::CALL_CLOBBERED.len());
        for &reg in T::CALL_CLOBBERED {
            let data_offset = self.data.shadow_offset(self.inst_id, Shadow::untagged())?;
            self.emit(NativeOp::StoreData {
                src: reg,
                data_offset,
            })?;
            saved.push((reg, data_offset));
        }
        let stack = self.data.shadow_offset(self.inst_id, Shadow::untagged())?;
        let flags = self.data.shadow_offset(self.inst_id, Shadow::untagged())?;
        self.emit(NativeOp::CallHost {
            target,
            stack,
            flags,
        })?;
        for (reg, data_offset) in saved {
            self.emit(NativeOp::LoadData {
                dst: reg,
                data_offset,
            })?;
        }
        Ok(())
    }

    fn lower_op(&mut self, tm: &mut TempManager, op: &PatchOp<T>) -> Result<(), PatchError> {
        let inst = self.inst;
        match *op {
            PatchOp::Original => self.emit(NativeOp::Raw(&inst.bytes)),
            PatchOp::Mov { dst, src } => {
                let dst = self.reg(tm, dst)?;
                let src = self.reg(tm, src)?;
                self.emit(NativeOp::Mov { dst, src })
            }
            PatchOp::MovImm { dst, value } => {
                let dst = self.reg(tm, dst)?;
                self.emit(NativeOp::MovImm {
                    dst,
                    value: value.value(),
                })
            }
            PatchOp::MovOperand { dst, operand } => {
                let source = self.inst.operand(operand)?;
                let dst = self.temp(tm, dst)?;
                match source {
                    MachineOperand::Reg(reg) => self.load_reg_plus(dst, reg, 0),
                    MachineOperand::Imm(value) => self.emit(NativeOp::MovImm {
                        dst,
                        value: value as u64,
                    }),
                }
            }
            PatchOp::AddImm { dst, value } => {
                let dst = self.reg(tm, dst)?;
                self.emit(NativeOp::AddImm { dst, value })
            }
            PatchOp::Lea { dst, base, disp } => {
                let base = self.inst.reg_operand(base)?;
                let disp = self.inst.imm_operand(disp)?;
                let dst = self.temp(tm, dst)?;
                self.load_reg_plus(dst, base, disp)
            }
            PatchOp::LoadContext { dst, offset } => {
                let data_offset = DataBlock::<T>::context_offset(offset)?;
                let dst = self.reg(tm, dst)?;
                self.emit(NativeOp::LoadData { dst, data_offset })
            }
            PatchOp::StoreContext { src, offset } => {
                let data_offset = DataBlock::<T>::context_offset(offset)?;
                let src = self.reg(tm, src)?;
                self.emit(NativeOp::StoreData { src, data_offset })
            }
            PatchOp::LoadShadow { dst, shadow } => {
                let data_offset = self.data.shadow_offset(self.inst_id, shadow)?;
                let dst = self.reg(tm, dst)?;
                self.emit(NativeOp::LoadData { dst, data_offset })
            }
            PatchOp::StoreShadow { src, shadow } => {
                let data_offset = self.data.shadow_offset(self.inst_id, shadow)?;
                let src = self.reg(tm, src)?;
                self.emit(NativeOp::StoreData { src, data_offset })
            }
            PatchOp::LoadMem { dst, addr } => {
                let addr = self.temp(tm, addr)?;
                let dst = self.temp(tm, dst)?;
                self.emit(NativeOp::LoadMem { dst, base: addr })
            }
            PatchOp::Call { target } => self.call(target.value()),
            PatchOp::UpdatePc => {
                let reg = self.temp(tm, Temp::INTERNAL)?;
                self.emit(NativeOp::MovImm {
                    dst: reg,
                    value: self.inst.next_address(),
                })?;
                self.emit(NativeOp::StoreData {
                    src: reg,
                    data_offset: T::CONTEXT.gpr_offset(T::PC_SLOT as usize) as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::rule::Position;
    use crate::patch::types::{Constant, Offset, Reg};
    use crate::target::X86_64;

    type R = RelocatableInst<X86_64>;

    fn nop() -> Inst {
        Inst::new(0x1000, vec![0x90], Vec::new())
    }

    fn generator() -> PatchGenerator<X86_64> {
        PatchGenerator::new(GenerationConfig::default())
    }

    #[test]
    fn test_original_only() {
        let patch = generator()
            .generate(&nop(), &PatchRule::original(), &[])
            .unwrap();
        assert_eq!(patch.code, vec![0x90]);
        assert_eq!(patch.original_range(), Some(0..1));
        assert!(patch.fixups.is_empty());
        assert!(patch.shadows.is_empty());
    }

    #[test]
    fn test_temp_saved_and_restored() {
        let rule = InstrRule::callback(
            Position::Pre,
            [PatchOp::MovImm {
                dst: RegRef::Temp(Temp::new(0)),
                value: Constant::new(7),
            }],
        );
        let patch = generator()
            .generate(&nop(), &PatchRule::original(), &[rule])
            .unwrap();

        // save r11, mov r11, 7, restore r11, then the nop
        assert_eq!(patch.shadows.len(), 1);
        assert_eq!(patch.fixups.len(), 2);
        assert_eq!(patch.fixups[0].data_offset, patch.shadows[0].offset);
        assert_eq!(patch.fixups[1].data_offset, patch.shadows[0].offset);
        assert_eq!(&patch.code[7..9], &[0x49, 0xBB]);
        assert_eq!(patch.code.last(), Some(&0x90));
        assert_eq!(
            patch.temps,
            vec![SegmentTemps {
                segment: RelocTag::PreInstStdCbk,
                bindings: vec![TempBinding {
                    temp: Temp::new(0),
                    reg: ArchReg::new(11),
                }],
            }]
        );
    }

    #[test]
    fn test_update_pc_writes_pc_slot() {
        let patch = generator()
            .generate(
                &nop(),
                &PatchRule::from_ops([PatchOp::Original, PatchOp::UpdatePc]),
                &[],
            )
            .unwrap();
        let pc_slot = X86_64::CONTEXT.gpr_offset(X86_64::PC_SLOT as usize) as u64;
        assert!(patch.fixups.iter().any(|f| f.data_offset == pc_slot));
        // movabs r11, 0x1001
        let movabs: [u8; 10] = [0x49, 0xBB, 0x01, 0x10, 0, 0, 0, 0, 0, 0];
        assert!(patch.code.windows(movabs.len()).any(|w| w == movabs));
    }

    #[test]
    fn test_context_offset_checked() {
        let rule = InstrRule::callback(
            Position::Pre,
            [PatchOp::LoadContext {
                dst: RegRef::Temp(Temp::new(0)),
                offset: Offset::new(4096),
            }],
        );
        let err = generator()
            .generate(&nop(), &PatchRule::original(), &[rule])
            .unwrap_err();
        assert_eq!(err, PatchError::OffsetOutOfRange(4096));
    }

    #[test]
    fn test_guest_register_excluded_from_pool() {
        let r11 = Reg::<X86_64>::new(9);
        assert_eq!(r11.arch(), ArchReg::new(11));
        let rule = InstrRule::callback(
            Position::Pre,
            [PatchOp::Mov {
                dst: RegRef::Temp(Temp::new(0)),
                src: RegRef::Reg(r11),
            }],
        );
        let patch = generator()
            .generate(&nop(), &PatchRule::original(), &[rule])
            .unwrap();
        assert_eq!(patch.temps[0].bindings[0].reg, ArchReg::new(10));
    }

    #[test]
    fn test_segment_lookup() {
        let seq = vec![
            R::Tag(RelocTag::PatchBegin),
            R::Tag(RelocTag::PreInstStdCbk),
            R::Op(PatchOp::Call {
                target: Constant::new(0x5000),
            }),
            R::Tag(RelocTag::PatchInstBegin),
            R::Op(PatchOp::Original),
            R::Tag(RelocTag::PatchInstEnd),
        ];
        let patch = generator().generate_sequence(&nop(), &seq).unwrap();
        let range = patch.original_range().unwrap();
        assert_eq!(range.len(), 1);
        assert!(patch.is_instrumentation(0));
        assert!(!patch.is_instrumentation(range.start));
        assert_eq!(patch.segment_at(range.start), Some(RelocTag::PatchInstBegin));
        assert_eq!(patch.segment_at(patch.code.len()), None);
    }

    #[test]
    fn test_failed_generation_frees_shadows() {
        let mut generator = generator();
        let rule = InstrRule::callback(
            Position::Pre,
            [
                PatchOp::StoreShadow {
                    src: RegRef::Reg(Reg::new(0)),
                    shadow: Shadow::new(1),
                },
                PatchOp::LoadContext {
                    dst: RegRef::Reg(Reg::new(0)),
                    offset: Offset::new(-8),
                },
            ],
        );
        assert!(
            generator
                .generate(&nop(), &PatchRule::original(), &[rule])
                .is_err()
        );
        assert!(generator.data_block().is_empty());
    }
}
