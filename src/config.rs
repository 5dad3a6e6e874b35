//! Generation configuration types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Target architecture selector for code that is not generic over `Target`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetArch {
    #[default]
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64", alias = "arm64")]
    AArch64,
}

impl fmt::Display for TargetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetArch::X86_64 => write!(f, "x86_64"),
            TargetArch::AArch64 => write!(f, "aarch64"),
        }
    }
}

/// Configuration for one patch generator (one code-cache unit)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationConfig {
    /// Number of shadow cells the data block can hold
    pub max_shadows: usize,
    /// Log every lowered operation
    pub trace: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_shadows: 1024,
            trace: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: GenerationConfig = toml::from_str("trace = true").unwrap();
        assert_eq!(config.max_shadows, 1024);
        assert!(config.trace);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<GenerationConfig>("max_shadow = 3").is_err());
    }

    #[test]
    fn test_arch_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            arch: TargetArch,
        }
        let w: Wrapper = toml::from_str("arch = \"arm64\"").unwrap();
        assert_eq!(w.arch, TargetArch::AArch64);
        let w: Wrapper = toml::from_str("arch = \"aarch64\"").unwrap();
        assert_eq!(w.arch, TargetArch::AArch64);
        assert_eq!(TargetArch::X86_64.to_string(), "x86_64");
    }
}
