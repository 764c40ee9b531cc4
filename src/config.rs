//! Runtime and compiler configuration.
//!
//! Everything can be set in code or read from the environment:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TIERVM_MAX_FRAMES` | Maximum call-frame depth | 256 |
//! | `TIERVM_MAX_STEPS` | Instruction budget (unset = unlimited) | unset |
//! | `TIERVM_MAX_TRY_DEPTH` | Maximum nested try blocks | 16 |
//! | `TIERVM_TRACE` | Trace every instruction ("1"/"true") | false |
//! | `TIERVM_TYPED` | Typed register fast path ("0" disables) | enabled |
//!
//! Values that fail to parse fall back to the default.

use crate::regalloc::{AllocPolicy, RegisterLayout};
use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub max_frames: usize,
    pub max_steps: Option<usize>,
    pub max_try_depth: usize,
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_frames: 256,
            max_steps: None,
            max_try_depth: 16,
            trace: false,
        }
    }
}

impl VmConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        VmConfig {
            max_frames: parse_env("TIERVM_MAX_FRAMES").unwrap_or(defaults.max_frames),
            max_steps: parse_env("TIERVM_MAX_STEPS").or(defaults.max_steps),
            max_try_depth: parse_env("TIERVM_MAX_TRY_DEPTH").unwrap_or(defaults.max_try_depth),
            trace: env_flag("TIERVM_TRACE").unwrap_or(defaults.trace),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompilerConfig {
    pub policy: AllocPolicy,
    pub layout: RegisterLayout,
}

impl CompilerConfig {
    pub fn from_env() -> Self {
        let policy = match env_flag("TIERVM_TYPED") {
            Some(false) => AllocPolicy::Standard,
            _ => AllocPolicy::PreferTyped,
        };
        CompilerConfig {
            policy,
            ..Self::default()
        }
    }
}

fn parse_env(name: &str) -> Option<usize> {
    env::var(name).ok()?.trim().parse().ok()
}

fn env_flag(name: &str) -> Option<bool> {
    parse_flag(&env::var(name).ok()?)
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.max_frames, 256);
        assert_eq!(config.max_try_depth, 16);
        assert_eq!(config.max_steps, None);
        assert_eq!(CompilerConfig::default().policy, AllocPolicy::PreferTyped);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
