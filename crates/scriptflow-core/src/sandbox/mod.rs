//! Sandboxed script runtime: Rhai execution with resource guards plus static
//! security scanning.

pub mod memory;
pub mod scanner;
pub mod script_sandbox;

pub use scanner::{PatternScanner, SecurityScanner};
pub use script_sandbox::{
    DEFAULT_ALLOWED_GLOBALS, SandboxError, SandboxOptions, ScriptContext, ScriptSandbox,
};
