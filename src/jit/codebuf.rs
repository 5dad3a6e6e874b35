//! Code buffer for building patch fragments.
//!
//! This module provides a buffer for incrementally building machine code
//! before it is relocated and copied into a code-cache unit. Besides raw
//! bytes it records where each relocation tag lands and which bytes still
//! depend on the final placement of the data block.

use serde::Serialize;

use crate::patch::{PatchError, RelocTag};

/// Kind of placement-dependent reference to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixupKind {
    /// 32-bit displacement relative to the end of the instruction (x86-64 RIP-relative)
    RipRel32,
}

/// A reference from the code into the data block, resolved at relocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Fixup {
    /// Offset of the displacement field in the code
    pub at: usize,
    /// Offset of the instruction following the reference (the displacement origin)
    pub next_inst: usize,
    /// Target offset inside the data block
    pub data_offset: u64,
    pub kind: FixupKind,
}

/// Byte position of a relocation tag inside the emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TagMark {
    pub tag: RelocTag,
    pub offset: usize,
}

/// A buffer for building machine code.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    /// The code bytes
    code: Vec<u8>,
    /// Tag positions, in emission order
    marks: Vec<TagMark>,
    /// Pending data-block references
    fixups: Vec<Fixup>,
}

impl CodeBuffer {
    /// Create a new empty code buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new code buffer with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            marks: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Get the current size of the code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit multiple bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Record that `tag` applies from the current position on.
    pub fn mark(&mut self, tag: RelocTag) {
        self.marks.push(TagMark {
            tag,
            offset: self.code.len(),
        });
    }

    /// Emit a placeholder RIP-relative displacement to `data_offset`.
    /// The displacement must be the last field of the instruction.
    pub fn emit_data_rel32(&mut self, data_offset: u64) {
        let at = self.code.len();
        self.fixups.push(Fixup {
            at,
            next_inst: at + 4,
            data_offset,
            kind: FixupKind::RipRel32,
        });
        self.emit_u32(0);
    }

    /// Get the code bytes (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn marks(&self) -> &[TagMark] {
        &self.marks
    }

    pub fn fixups(&self) -> &[Fixup] {
        &self.fixups
    }

    /// Consume the buffer and return code, tag marks and fixups.
    /// Note: fixups are not applied - use `apply_fixups` once the placement is known.
    pub fn into_parts(self) -> (Vec<u8>, Vec<TagMark>, Vec<Fixup>) {
        (self.code, self.marks, self.fixups)
    }
}

/// Patch every fixup in `code` for a code block placed at `code_addr` whose
/// data block starts at `data_addr`.
pub fn apply_fixups(
    code: &mut [u8],
    fixups: &[Fixup],
    code_addr: u64,
    data_addr: u64,
) -> Result<(), PatchError> {
    for fixup in fixups {
        match fixup.kind {
            FixupKind::RipRel32 => {
                let target = data_addr.wrapping_add(fixup.data_offset) as i128;
                let origin = code_addr.wrapping_add(fixup.next_inst as u64) as i128;
                let disp = target - origin;
                if disp < i32::MIN as i128 || disp > i32::MAX as i128 {
                    return Err(PatchError::RelocationOutOfRange {
                        at: fixup.at,
                        distance: disp as i64,
                    });
                }
                code[fixup.at..fixup.at + 4].copy_from_slice(&(disp as i32).to_le_bytes());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.len(), 5);
        assert_eq!(buf.code(), &[0x90, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_marks() {
        let mut buf = CodeBuffer::new();
        buf.mark(RelocTag::PatchBegin);
        buf.emit_u8(0x90);
        buf.mark(RelocTag::PatchInstBegin);

        assert_eq!(
            buf.marks(),
            &[
                TagMark { tag: RelocTag::PatchBegin, offset: 0 },
                TagMark { tag: RelocTag::PatchInstBegin, offset: 1 },
            ]
        );
    }

    #[test]
    fn test_apply_rip_fixup() {
        let mut buf = CodeBuffer::new();
        buf.emit_bytes(&[0x48, 0x8B, 0x05]);
        buf.emit_data_rel32(0x40);
        let (mut code, _, fixups) = buf.into_parts();

        apply_fixups(&mut code, &fixups, 0x1000, 0x2000).unwrap();

        // 0x2000 + 0x40 - (0x1000 + 7)
        let disp = i32::from_le_bytes([code[3], code[4], code[5], code[6]]);
        assert_eq!(disp, 0x1039);
    }

    #[test]
    fn test_fixup_out_of_range() {
        let mut buf = CodeBuffer::new();
        buf.emit_data_rel32(0);
        let (mut code, _, fixups) = buf.into_parts();

        let err = apply_fixups(&mut code, &fixups, 0, 0x1_0000_0000).unwrap_err();
        assert!(matches!(err, PatchError::RelocationOutOfRange { at: 0, .. }));
    }
}
