//! Patch rules and instrumentation rules.

use serde::{Deserialize, Serialize};

use super::error::PatchError;
use super::reloc::{PatchOp, RelocatableInst};
use super::types::RelocTag;
use crate::target::Target;

/// How the instrumented instruction itself is emitted.
///
/// The body lands between `PatchInstBegin` and `PatchInstEnd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRule<T: Target> {
    body: Vec<RelocatableInst<T>>,
}

impl<T: Target> PatchRule<T> {
    /// A rule made of `body`. Segment markers are not allowed in it.
    pub fn new(body: Vec<RelocatableInst<T>>) -> Result<Self, PatchError> {
        reject_markers(&body)?;
        Ok(Self { body })
    }

    pub fn from_ops(ops: impl IntoIterator<Item = PatchOp<T>>) -> Self {
        Self {
            body: ops.into_iter().map(RelocatableInst::Op).collect(),
        }
    }

    /// Copy the instruction unchanged.
    pub fn original() -> Self {
        Self::from_ops([PatchOp::Original])
    }

    pub fn body(&self) -> &[RelocatableInst<T>] {
        &self.body
    }
}

impl<T: Target> Default for PatchRule<T> {
    fn default() -> Self {
        Self::original()
    }
}

/// Where an instrumentation rule runs relative to the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Pre,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    Callback,
    MemoryAccess,
}

/// Instrumentation injected before or after an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrRule<T: Target> {
    position: Position,
    kind: RuleKind,
    body: Vec<RelocatableInst<T>>,
}

impl<T: Target> InstrRule<T> {
    /// A user instrumentation rule. Segment markers are not allowed in `body`.
    pub fn new(position: Position, body: Vec<RelocatableInst<T>>) -> Result<Self, PatchError> {
        reject_markers(&body)?;
        Ok(Self {
            position,
            kind: RuleKind::Callback,
            body,
        })
    }

    pub fn callback(position: Position, ops: impl IntoIterator<Item = PatchOp<T>>) -> Self {
        Self {
            position,
            kind: RuleKind::Callback,
            body: ops.into_iter().map(RelocatableInst::Op).collect(),
        }
    }

    pub(crate) fn memory_access(position: Position, ops: Vec<PatchOp<T>>) -> Self {
        Self {
            position,
            kind: RuleKind::MemoryAccess,
            body: ops.into_iter().map(RelocatableInst::Op).collect(),
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn is_memory_access(&self) -> bool {
        self.kind == RuleKind::MemoryAccess
    }

    pub fn body(&self) -> &[RelocatableInst<T>] {
        &self.body
    }

    /// Marker opening this rule's segment.
    pub fn segment_tag(&self) -> RelocTag {
        match (self.position, self.kind) {
            (Position::Pre, RuleKind::MemoryAccess) => RelocTag::PreInstMemAccess,
            (Position::Pre, RuleKind::Callback) => RelocTag::PreInstStdCbk,
            (Position::Post, RuleKind::MemoryAccess) => RelocTag::PostInstMemAccess,
            (Position::Post, RuleKind::Callback) => RelocTag::PostInstStdCbk,
        }
    }
}

fn reject_markers<T: Target>(body: &[RelocatableInst<T>]) -> Result<(), PatchError> {
    for (position, item) in body.iter().enumerate() {
        if let RelocatableInst::Tag(tag) = item {
            return Err(PatchError::MisplacedTag {
                tag: *tag,
                position,
            });
        }
    }
    Ok(())
}

/// Lay out one patch: pre rules, the patch rule, then post rules, each in
/// the order given.
pub fn assemble<T: Target>(
    patch: &PatchRule<T>,
    rules: &[InstrRule<T>],
) -> Vec<RelocatableInst<T>> {
    let mut seq = vec![RelocatableInst::Tag(RelocTag::PatchBegin)];

    let segment = |seq: &mut Vec<RelocatableInst<T>>, rule: &InstrRule<T>| {
        seq.push(RelocatableInst::Tag(rule.segment_tag()));
        seq.extend_from_slice(rule.body());
    };

    for rule in rules.iter().filter(|r| r.position == Position::Pre) {
        segment(&mut seq, rule);
    }

    seq.push(RelocatableInst::Tag(RelocTag::PatchInstBegin));
    seq.extend_from_slice(patch.body());
    seq.push(RelocatableInst::Tag(RelocTag::PatchInstEnd));

    for rule in rules.iter().filter(|r| r.position == Position::Post) {
        segment(&mut seq, rule);
    }

    seq
}
