//! patchgen - symbolic patches for dynamic binary instrumentation
//!
//! This library describes how one guest instruction is rewritten into an
//! instrumented instruction sequence and lowers that description into
//! relocatable native code for x86-64 and AArch64.

pub mod config;
pub mod jit;
pub mod patch;
pub mod rulefile;
pub mod target;

// Re-export commonly used types
pub use config::{GenerationConfig, TargetArch};
pub use patch::{GeneratedPatch, PatchError, PatchGenerator};
pub use target::{AArch64, Target, X86_64};
