//! Workflow engine core: sequential execution, retries, and step dispatch.
//!
//! - `definition` -- YAML/JSON parsing and file loading
//! - `engine` -- Sequential run loop, cancellation, and panic containment
//! - `retry` -- Backoff policy and the retry-wrapped step call
//! - `step_runner` -- Step handlers for the built-in step kinds
//! - `expression` -- JEXL evaluator for conditions and transforms
//! - `state` -- Per-run log and warning accumulator

pub mod definition;
pub mod engine;
pub mod expression;
pub mod retry;
pub mod state;
pub mod step_runner;

pub use engine::WorkflowEngine;
pub use retry::{RetryPolicy, execute_step};
pub use state::RunState;
pub use step_runner::{StepError, StepExecutor, StepRunner};
