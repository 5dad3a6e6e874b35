//! The data block of a code-cache unit.
//!
//! ```text
//! [ saved context | shadow 0 | shadow 1 | ... ]
//! ```
//!
//! Shadows are handed out as arena indices; a tagged shadow is keyed by the
//! instruction it belongs to, so every hook of one instruction sees the same
//! cell for the same tag.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::Serialize;

use super::error::PatchError;
use super::types::{Offset, Shadow};
use crate::target::Target;

/// One allocated shadow cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShadowCell {
    /// Sequence number of the instruction that requested it
    pub inst: u64,
    pub tag: u16,
    /// Offset from the start of the data block
    pub offset: u64,
}

#[derive(Debug)]
pub struct DataBlock<T: Target> {
    cells: Vec<ShadowCell>,
    index: BTreeMap<(u64, u16), usize>,
    capacity: usize,
    _target: PhantomData<T>,
}

impl<T: Target> DataBlock<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: Vec::new(),
            index: BTreeMap::new(),
            capacity,
            _target: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cells(&self) -> &[ShadowCell] {
        &self.cells
    }

    /// Data offset of arena cell `index`.
    pub fn cell_offset(index: usize) -> u64 {
        (T::CONTEXT.size() + index * T::WORD_SIZE) as u64
    }

    /// Bytes needed for the context plus every allocated cell.
    pub fn size(&self) -> u64 {
        Self::cell_offset(self.cells.len())
    }

    /// Data offset of the context word at `offset`.
    pub fn context_offset(offset: Offset) -> Result<u64, PatchError> {
        let value = offset.value();
        let last = (T::CONTEXT.size() - T::WORD_SIZE) as i64;
        if (0..=last).contains(&value) {
            Ok(value as u64)
        } else {
            Err(PatchError::OffsetOutOfRange(value))
        }
    }

    /// Data offset of `shadow` for instruction `inst`, allocating it on
    /// first request. Untagged shadows always get a new cell.
    pub fn shadow_offset(&mut self, inst: u64, shadow: Shadow) -> Result<u64, PatchError> {
        if !shadow.is_untagged() {
            if let Some(&index) = self.index.get(&(inst, shadow.tag())) {
                return Ok(self.cells[index].offset);
            }
        }
        if self.cells.len() >= self.capacity {
            return Err(PatchError::DataBlockFull {
                capacity: self.capacity,
            });
        }

        let index = self.cells.len();
        let offset = Self::cell_offset(index);
        self.cells.push(ShadowCell {
            inst,
            tag: shadow.tag(),
            offset,
        });
        if !shadow.is_untagged() {
            self.index.insert((inst, shadow.tag()), index);
        }
        Ok(offset)
    }

    /// Marker for [`DataBlock::rollback`].
    pub fn checkpoint(&self) -> usize {
        self.cells.len()
    }

    /// Free every cell allocated since `checkpoint`.
    pub fn rollback(&mut self, checkpoint: usize) {
        self.cells.truncate(checkpoint);
        self.index.retain(|_, index| *index < checkpoint);
    }

    /// Cells allocated since `checkpoint`.
    pub fn cells_since(&self, checkpoint: usize) -> &[ShadowCell] {
        &self.cells[checkpoint.min(self.cells.len())..]
    }
}
