//! Shared domain types for Scriptflow.
//!
//! Workflow definitions, execution inputs and results, sandbox verdicts and
//! engine configuration. Zero runtime dependencies beyond serde, uuid and
//! thiserror.

pub mod config;
pub mod error;
pub mod execution;
pub mod sandbox;
pub mod workflow;
