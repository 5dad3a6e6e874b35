//! Native code emission for patch lowering.
//!
//! This module provides the foundation the generation pass emits through:
//! - Code buffer with relocation tag marks and data-block fixups
//! - x86-64 instruction encoding
//! - AArch64 instruction encoding

pub mod aarch64;
pub mod codebuf;
pub mod x86_64;

pub use codebuf::{apply_fixups, CodeBuffer, Fixup, FixupKind, TagMark};
