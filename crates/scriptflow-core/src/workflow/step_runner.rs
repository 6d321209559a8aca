//! One-shot step executors.
//!
//! `StepRunner` dispatches a single attempt of a step to the handler for its
//! `StepConfig` variant. Retries, output bookkeeping and payload threading are
//! the engine's job; a handler only turns the incoming payload into an output
//! or a `StepError`.
//!
//! Step kinds: Trigger, Action, Condition, Transform, Script.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use scriptflow_types::config::SandboxLimits;
use scriptflow_types::execution::ExecutionContext;
use scriptflow_types::workflow::{Step, StepConfig};

use super::expression::{ExpressionError, WorkflowEvaluator};
use super::state::RunState;
use crate::registry::ScriptRegistry;
use crate::sandbox::{
    PatternScanner, SandboxOptions, ScriptContext, ScriptSandbox, SecurityScanner,
};

/// Script run when a `script` step names neither a script ID nor inline code.
pub const DEFAULT_SCRIPT: &str = "context.data";

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors that can occur during a single step attempt.
///
/// The `Display` text is the user-visible failure reason.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    #[error("Condition evaluation failed: {0}")]
    Condition(#[source] ExpressionError),

    #[error("Transform failed: {0}")]
    Transform(#[source] ExpressionError),

    /// Script failed inside the sandbox; carries the sandbox's message.
    #[error("{0}")]
    Script(String),

    #[error("Workflow cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes one attempt of a step.
///
/// Implementations may append to the run's logs and warnings through `state`.
pub trait StepExecutor: Send + Sync {
    fn run_once(
        &self,
        step: &Step,
        payload: &Value,
        ctx: &ExecutionContext,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Default executor for the built-in step kinds.
pub struct StepRunner {
    limits: SandboxLimits,
    scanner: Arc<dyn SecurityScanner>,
}

impl StepRunner {
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            limits,
            scanner: Arc::new(PatternScanner::new()),
        }
    }

    /// Replace the security scanner shared by every script step.
    pub fn with_scanner(mut self, scanner: Arc<dyn SecurityScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    fn run_action(&self, action: Option<&str>, payload: &Value, state: &mut RunState) -> Value {
        state.log(format!("Action: {}", action.unwrap_or("default")));
        payload.clone()
    }

    async fn run_script(
        &self,
        step: &Step,
        script_id: Option<&str>,
        code: Option<&str>,
        payload: &Value,
        ctx: &ExecutionContext,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<Value, StepError> {
        let record = match script_id {
            Some(id) => Some(
                ctx.get_script(id)
                    .ok_or_else(|| StepError::ScriptNotFound(id.to_string()))?,
            ),
            None => None,
        };
        let source = match record {
            Some(record) => record.code.as_str(),
            None => code.unwrap_or(DEFAULT_SCRIPT),
        };

        let mut options = SandboxOptions::from_limits(&self.limits)
            .with_cancellation(cancel.clone())
            .with_scanner(Arc::clone(&self.scanner));
        if let Some(timeout_ms) = record.and_then(|r| r.timeout_ms) {
            options = options.with_timeout(Duration::from_millis(timeout_ms));
        }

        let mut sandbox = ScriptSandbox::new(options);
        if let Some(globals) = record.and_then(|r| r.allowed_globals.as_ref()) {
            sandbox.set_allowed_globals(globals.iter().cloned());
        }

        tracing::debug!(
            step_id = step.id.as_str(),
            script_id = script_id.unwrap_or("<inline>"),
            "running script step"
        );
        let result = sandbox
            .execute_with_sandbox(source, &ScriptContext::for_step(payload, ctx))
            .await;
        sandbox.destroy();

        if result.security.severity.is_warning_worthy() {
            state.warn(format!(
                "Security issues detected: {}",
                result.security.issue_messages().join(", ")
            ));
        }
        for line in &result.execution.logs {
            state.log(format!("[script] {line}"));
        }

        let execution = result.execution;
        if execution.success {
            Ok(execution.result.unwrap_or(Value::Null))
        } else {
            Err(StepError::Script(
                execution
                    .error
                    .unwrap_or_else(|| "script execution failed".to_string()),
            ))
        }
    }
}

impl Default for StepRunner {
    fn default() -> Self {
        Self::new(SandboxLimits::default())
    }
}

impl StepExecutor for StepRunner {
    async fn run_once(
        &self,
        step: &Step,
        payload: &Value,
        ctx: &ExecutionContext,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<Value, StepError> {
        match &step.config {
            StepConfig::Trigger => Ok(payload.clone()),
            StepConfig::Action { action } => Ok(self.run_action(action.as_deref(), payload, state)),
            StepConfig::Condition { condition } => {
                evaluate(condition, payload, ctx).map_err(StepError::Condition)
            }
            StepConfig::Transform { transform } => {
                evaluate(transform, payload, ctx).map_err(StepError::Transform)
            }
            StepConfig::Script { script_id, code } => {
                self.run_script(
                    step,
                    script_id.as_deref(),
                    code.as_deref(),
                    payload,
                    ctx,
                    state,
                    cancel,
                )
                .await
            }
            StepConfig::Unknown { kind } => Err(StepError::UnknownStepType(kind.clone())),
        }
    }
}

/// Evaluate without holding the evaluator across an await point.
fn evaluate(expression: &str, payload: &Value, ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
    WorkflowEvaluator::new().evaluate_for_step(expression, payload, ctx)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
