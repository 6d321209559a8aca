//! Engine configuration types.
//!
//! `EngineConfig` is the top-level `scriptflow.toml`. All fields have
//! defaults, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Resource limits applied to every script sandbox.
    #[serde(default)]
    pub sandbox: SandboxLimits,

    /// Seed for retry jitter. `None` draws from OS entropy per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_seed: Option<u64>,
}

/// Resource limits for the script sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Wall-clock execution timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Memory ceiling in bytes. Zero or negative disables enforcement.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: i64,

    /// Interpreter operation budget. Zero means unlimited.
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,

    /// Maximum function call nesting.
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_memory_bytes() -> i64 {
    10 * 1024 * 1024
}

fn default_max_operations() -> u64 {
    5_000_000
}

fn default_max_call_levels() -> usize {
    64
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_memory_bytes: default_max_memory_bytes(),
            max_operations: default_max_operations(),
            max_call_levels: default_max_call_levels(),
        }
    }
}
