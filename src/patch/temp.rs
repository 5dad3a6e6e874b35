//! Temp to scratch register allocation.
//!
//! One `TempManager` lives for one segment of a patch. It only decides which
//! register backs which temp; the generator emits the matching saves and
//! restores and tells the manager where each register was saved.

use std::collections::BTreeMap;

use serde::Serialize;

use super::error::PatchError;
use super::types::{ArchReg, Temp};

/// Result of binding a temp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub reg: ArchReg,
    /// The register was taken from the pool by this call and must be saved.
    pub fresh: bool,
}

/// A temp binding as reported in a generated patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TempBinding {
    pub temp: Temp,
    pub reg: ArchReg,
}

#[derive(Debug, Default)]
pub struct TempManager {
    /// Registers still free, in allocation order
    free: Vec<ArchReg>,
    bindings: BTreeMap<Temp, ArchReg>,
    /// Registers holding guest values that were saved, with the data offset
    /// of their save cell, in save order
    saved: Vec<(ArchReg, u64)>,
    history: Vec<TempBinding>,
}

impl TempManager {
    /// Temp ids only the generator may use.
    pub const RESERVED_IDS: &'static [u32] = &[Temp::RESERVED_ID];

    pub fn new(pool: impl IntoIterator<Item = ArchReg>) -> Self {
        Self {
            free: pool.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Fail if a rule-authored op names a reserved temp.
    pub fn check_user(temp: Temp) -> Result<(), PatchError> {
        if Self::RESERVED_IDS.contains(&temp.id()) {
            Err(PatchError::ReservedTemp(temp))
        } else {
            Ok(())
        }
    }

    pub fn get(&self, temp: Temp) -> Option<ArchReg> {
        self.bindings.get(&temp).copied()
    }

    /// Register backing `temp`, taking the next free one on first use.
    pub fn bind(&mut self, temp: Temp) -> Result<Binding, PatchError> {
        if let Some(reg) = self.get(temp) {
            return Ok(Binding { reg, fresh: false });
        }
        let reg = self.take_free(temp)?;
        self.bindings.insert(temp, reg);
        self.history.push(TempBinding { temp, reg });
        Ok(Binding { reg, fresh: true })
    }

    /// Move `temp` to a new register. Returns `(old, new)`; the old register
    /// is not handed out again in this segment.
    pub fn rotate(&mut self, temp: Temp) -> Result<(ArchReg, ArchReg), PatchError> {
        let old = self.get(temp).ok_or(PatchError::ScratchNotBound(temp))?;
        let new = self.take_free(temp)?;
        self.bindings.insert(temp, new);
        self.history.push(TempBinding { temp, reg: new });
        Ok((old, new))
    }

    fn take_free(&mut self, temp: Temp) -> Result<ArchReg, PatchError> {
        if self.free.is_empty() {
            return Err(PatchError::ScratchExhausted(temp));
        }
        Ok(self.free.remove(0))
    }

    pub fn record_save(&mut self, reg: ArchReg, data_offset: u64) {
        self.saved.push((reg, data_offset));
    }

    /// Forget the save of `reg` and return where it was saved.
    pub fn take_save(&mut self, reg: ArchReg) -> Option<u64> {
        let index = self.saved.iter().position(|(r, _)| *r == reg)?;
        Some(self.saved.remove(index).1)
    }

    /// Registers to restore at the end of the segment, in save order.
    pub fn finish(self) -> (Vec<(ArchReg, u64)>, Vec<TempBinding>) {
        (self.saved, self.history)
    }
}
