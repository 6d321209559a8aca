//! Workflow engine and sandboxed script runtime for Scriptflow.
//!
//! `WorkflowEngine::execute` is the entry point: it runs a `Workflow`'s steps
//! in order against an `ExecutionContext` and returns a `RunResult`. Script
//! steps run inside a `ScriptSandbox` (Rhai with timeout, operation, memory
//! and global-access limits). Domain types live in `scriptflow-types`.

pub mod config;
pub mod registry;
pub mod sandbox;
pub mod workflow;

pub use registry::ScriptRegistry;
pub use workflow::WorkflowEngine;
