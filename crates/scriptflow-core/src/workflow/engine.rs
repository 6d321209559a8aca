//! Sequential workflow engine.
//!
//! Runs a workflow's steps in declaration order, threading each step's output
//! into the next step as its payload. A `condition` step whose output is
//! boolean `false` ends the run early (still successful). The first failing
//! step ends the run with an error; outputs gathered so far are kept.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures_util::FutureExt;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use scriptflow_types::config::EngineConfig;
use scriptflow_types::execution::{ExecutionContext, RunResult};
use scriptflow_types::workflow::{StepConfig, Workflow};

use super::retry::execute_step;
use super::state::RunState;
use super::step_runner::{StepError, StepExecutor, StepRunner};

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Executes workflows one step at a time.
///
/// Generic over the step executor so alternative step semantics can be
/// plugged in; the default is [`StepRunner`].
pub struct WorkflowEngine<X: StepExecutor = StepRunner> {
    executor: X,
    jitter_seed: Option<u64>,
}

impl WorkflowEngine<StepRunner> {
    /// Engine with default sandbox limits and OS-seeded jitter.
    pub fn new() -> Self {
        Self::from_config(&EngineConfig::default())
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            executor: StepRunner::new(config.sandbox.clone()),
            jitter_seed: config.jitter_seed,
        }
    }
}

impl Default for WorkflowEngine<StepRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<X: StepExecutor> WorkflowEngine<X> {
    pub fn with_executor(executor: X) -> Self {
        Self {
            executor,
            jitter_seed: None,
        }
    }

    /// Fix the retry jitter seed; every run then draws the same sequence.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    /// Execute a workflow to completion.
    pub async fn execute(&self, workflow: &Workflow, ctx: &ExecutionContext) -> RunResult {
        self.execute_with_cancellation(workflow, ctx, CancellationToken::new())
            .await
    }

    /// Execute a workflow, stopping early if `cancel` fires.
    ///
    /// The token is checked before every step, interrupts retry backoff and
    /// stops running scripts.
    pub async fn execute_with_cancellation(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> RunResult {
        let run_id = Uuid::now_v7();
        let started = Instant::now();
        let span = tracing::info_span!(
            "workflow.run",
            run_id = %run_id,
            workflow = workflow.name.as_str()
        );

        let mut progress = RunProgress::default();
        let mut rng = match self.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let outcome = AssertUnwindSafe(self.run_steps(
            workflow,
            ctx,
            &mut progress,
            &mut rng,
            &cancel,
        ))
        .catch_unwind()
        .instrument(span.clone())
        .await;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(message)) => Some(message),
            Err(panic) => {
                let message = format!("Workflow execution failed: {}", panic_message(&*panic));
                span.in_scope(|| tracing::error!(error = message.as_str(), "workflow panicked"));
                progress.state.log(message.clone());
                Some(message)
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        span.in_scope(|| {
            tracing::info!(
                success = error.is_none(),
                steps_completed = progress.outputs.len(),
                duration_ms,
                "workflow run finished"
            )
        });

        let (logs, security_warnings) = progress.state.into_parts();
        RunResult {
            run_id,
            success: error.is_none(),
            outputs: progress.outputs,
            logs,
            security_warnings,
            error,
            duration_ms,
        }
    }

    async fn run_steps(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        progress: &mut RunProgress,
        rng: &mut StdRng,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let state = &mut progress.state;
        state.log(format!("Starting workflow: {}", workflow.name));
        if !workflow.enabled {
            state.log(format!(
                "Workflow \"{}\" is disabled; executing on explicit request",
                workflow.name
            ));
            tracing::warn!("executing disabled workflow");
        }

        let mut payload = ctx.payload.clone();

        for (index, step) in workflow.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                state.log(format!("Cancelled before step \"{}\"", step.label));
                return Err(StepError::Cancelled.to_string());
            }

            state.log(format!(
                "Executing step {}: {} ({})",
                index + 1,
                step.label,
                step.kind()
            ));
            tracing::debug!(step_id = step.id.as_str(), kind = step.kind(), "executing step");

            let result =
                execute_step(&self.executor, step, &payload, ctx, state, rng, cancel).await;

            if !result.success {
                if cancel.is_cancelled() {
                    state.log(format!("Cancelled during step \"{}\"", step.label));
                    return Err(StepError::Cancelled.to_string());
                }
                let reason = result.error.unwrap_or_else(|| "unknown error".to_string());
                let message = format!("Step \"{}\" failed: {}", step.label, reason);
                state.log(message.clone());
                tracing::warn!(step_id = step.id.as_str(), error = reason.as_str(), "step failed");
                return Err(message);
            }

            let output = result.output.unwrap_or(Value::Null);
            progress.outputs.insert(step.id.clone(), output.clone());
            payload = output;

            if matches!(step.config, StepConfig::Condition { .. }) && payload == Value::Bool(false) {
                state.log(format!(
                    "Condition \"{}\" evaluated to false, stopping workflow",
                    step.label
                ));
                break;
            }
        }

        state.log(format!("Workflow \"{}\" completed successfully", workflow.name));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run state held outside the step loop so it survives a panic.
#[derive(Default)]
struct RunProgress {
    state: RunState,
    outputs: Map<String, Value>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use scriptflow_types::execution::ScriptRecord;
    use scriptflow_types::workflow::{RetryConfig, Step};
    use serde_json::json;

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            id: "wf-test".to_string(),
            name: "Test workflow".to_string(),
            steps,
            edges: vec![],
            enabled: true,
        }
    }

    fn trigger(id: &str) -> Step {
        Step::new(id, "Start", StepConfig::Trigger)
    }

    fn transform(id: &str, expr: &str) -> Step {
        Step::new(
            id,
            "Transform",
            StepConfig::Transform {
                transform: expr.to_string(),
            },
        )
    }

    fn condition(id: &str, expr: &str) -> Step {
        Step::new(
            id,
            "Gate",
            StepConfig::Condition {
                condition: expr.to_string(),
            },
        )
    }

    fn action(id: &str) -> Step {
        Step::new(id, "Act", StepConfig::Action { action: None })
    }

    fn retry_lines(result: &RunResult) -> usize {
        result
            .logs
            .iter()
            .filter(|l| l.starts_with("Retrying step"))
            .count()
    }

    // -------------------------------------------------------------------
    // Test executors
    // -------------------------------------------------------------------

    /// Fails each step's first `failures` attempts, then succeeds with the
    /// payload. Counts attempts per step ID.
    struct FlakyExecutor {
        failures: u32,
        only: Option<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl FlakyExecutor {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                only: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Fail only the step with this ID; every other step succeeds.
        fn only(mut self, step_id: &'static str) -> Self {
            self.only = Some(step_id);
            self
        }

        fn attempts(&self, step_id: &str) -> u32 {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|id| id.as_str() == step_id)
                .count() as u32
        }
    }

    impl StepExecutor for FlakyExecutor {
        async fn run_once(
            &self,
            step: &Step,
            payload: &Value,
            _ctx: &ExecutionContext,
            _state: &mut RunState,
            _cancel: &CancellationToken,
        ) -> Result<Value, StepError> {
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(step.id.clone());
                calls.iter().filter(|id| **id == step.id).count() as u32
            };
            let targeted = self.only.is_none_or(|id| id == step.id);
            if targeted && attempt <= self.failures {
                Err(StepError::Script(format!("transient failure {attempt}")))
            } else {
                Ok(payload.clone())
            }
        }
    }

    /// Panics on the step with the given ID; passes everything else through.
    struct PanickingExecutor {
        panic_on: &'static str,
    }

    impl StepExecutor for PanickingExecutor {
        async fn run_once(
            &self,
            step: &Step,
            payload: &Value,
            _ctx: &ExecutionContext,
            state: &mut RunState,
            _cancel: &CancellationToken,
        ) -> Result<Value, StepError> {
            state.log(format!("visited {}", step.id));
            if step.id == self.panic_on {
                panic!("executor exploded");
            }
            Ok(payload.clone())
        }
    }

    /// Counts attempts and cancels the token on the first one.
    struct CancellingExecutor {
        cancel: CancellationToken,
        calls: AtomicU32,
    }

    impl StepExecutor for CancellingExecutor {
        async fn run_once(
            &self,
            _step: &Step,
            payload: &Value,
            _ctx: &ExecutionContext,
            _state: &mut RunState,
            _cancel: &CancellationToken,
        ) -> Result<Value, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            Ok(payload.clone())
        }
    }

    // -------------------------------------------------------------------
    // Sequencing
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_all_steps_succeed_in_order() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![trigger("a"), action("b"), action("c")]);
        let result = engine
            .execute(&wf, &ExecutionContext::new(json!({ "x": 1 })))
            .await;

        assert!(result.success, "error: {:?}", result.error);
        let keys: Vec<&String> = result.outputs.keys().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert!(result.outputs.values().all(|v| *v == json!({ "x": 1 })));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_transform_scenario() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![
            trigger("trigger"),
            transform("transform", "payload.value + 1"),
            action("action"),
        ]);
        let result = engine
            .execute(&wf, &ExecutionContext::new(json!({ "value": 5 })))
            .await;

        assert!(result.success);
        assert_eq!(result.output("trigger"), Some(&json!({ "value": 5 })));
        assert_eq!(result.output("transform"), Some(&json!(6)));
        assert_eq!(result.output("action"), Some(&json!(6)));
        assert_eq!(result.logs[0], "Starting workflow: Test workflow");
        assert_eq!(result.logs[1], "Executing step 1: Start (trigger)");
        assert_eq!(
            result.logs.last().map(String::as_str),
            Some("Workflow \"Test workflow\" completed successfully")
        );
    }

    #[tokio::test]
    async fn test_false_condition_halts() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![trigger("t"), condition("c", "false"), action("a")]);
        let result = engine.execute(&wf, &ExecutionContext::new(json!({}))).await;

        assert!(result.success);
        assert_eq!(result.outputs.len(), 2);
        assert_eq!(result.output("c"), Some(&json!(false)));
        assert!(result.output("a").is_none());
        assert!(
            result
                .logs
                .contains(&"Condition \"Gate\" evaluated to false, stopping workflow".to_string())
        );
    }

    #[tokio::test]
    async fn test_truthy_condition_continues_with_its_output() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![condition("c", "payload.n > 1"), action("a")]);
        let result = engine
            .execute(&wf, &ExecutionContext::new(json!({ "n": 2 })))
            .await;

        assert!(result.success);
        assert_eq!(result.output("a"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_empty_workflow_succeeds() {
        let engine = WorkflowEngine::new();
        let result = engine
            .execute(&workflow(vec![]), &ExecutionContext::default())
            .await;
        assert!(result.success);
        assert!(result.outputs.is_empty());
        assert_eq!(result.logs.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_workflow_still_runs() {
        let engine = WorkflowEngine::new();
        let mut wf = workflow(vec![trigger("t")]);
        wf.enabled = false;
        let result = engine.execute(&wf, &ExecutionContext::default()).await;
        assert!(result.success);
        assert!(result.logs.iter().any(|l| l.contains("is disabled")));
    }

    // -------------------------------------------------------------------
    // Failures
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_unknown_step_type_fails() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![
            trigger("t"),
            Step::new(
                "u",
                "Mystery",
                StepConfig::Unknown {
                    kind: "teleport".to_string(),
                },
            ),
        ]);
        let result = engine.execute(&wf, &ExecutionContext::default()).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("Unknown step type"), "got: {error}");
        assert_eq!(error, "Step \"Mystery\" failed: Unknown step type: teleport");
        assert_eq!(result.outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_script_fails() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![Step::new(
            "s",
            "Run script",
            StepConfig::Script {
                script_id: Some("ghost".to_string()),
                code: None,
            },
        )]);
        let result = engine.execute(&wf, &ExecutionContext::default()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Script not found: ghost"));
    }

    #[tokio::test]
    async fn test_failing_script_fails_run() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![Step::new(
            "s",
            "Thrower",
            StepConfig::Script {
                script_id: None,
                code: Some("throw \"bad input\";".to_string()),
            },
        )]);
        let result = engine.execute(&wf, &ExecutionContext::default()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("bad input"));
    }

    // -------------------------------------------------------------------
    // Retries
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_retry_until_success() {
        let engine = WorkflowEngine::with_executor(FlakyExecutor::new(2));
        let wf = workflow(vec![
            trigger("t").with_retry(RetryConfig::with_max_attempts(3)),
        ]);
        let result = engine.execute(&wf, &ExecutionContext::new(json!(1))).await;

        assert!(result.success);
        assert_eq!(retry_lines(&result), 2);
        assert_eq!(engine.executor().attempts("t"), 3);
    }

    #[tokio::test]
    async fn test_retry_reruns_only_the_failing_step() {
        let engine = WorkflowEngine::with_executor(FlakyExecutor::new(2).only("b"));
        let wf = workflow(vec![
            trigger("a"),
            trigger("b").with_retry(RetryConfig::with_max_attempts(3)),
            trigger("c"),
        ]);
        let result = engine.execute(&wf, &ExecutionContext::new(json!(7))).await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(engine.executor().attempts("a"), 1);
        assert_eq!(engine.executor().attempts("b"), 3);
        assert_eq!(engine.executor().attempts("c"), 1);
        assert_eq!(retry_lines(&result), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let engine = WorkflowEngine::with_executor(FlakyExecutor::new(u32::MAX));
        let wf = workflow(vec![
            trigger("t").with_retry(RetryConfig::with_max_attempts(2)),
        ]);
        let result = engine.execute(&wf, &ExecutionContext::default()).await;

        assert!(!result.success);
        assert_eq!(retry_lines(&result), 1);
        assert_eq!(
            result.error.as_deref(),
            Some("Step \"Start\" failed: transient failure 2")
        );
    }

    #[tokio::test]
    async fn test_unknown_step_obeys_retry_budget() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![
            Step::new(
                "u",
                "Mystery",
                StepConfig::Unknown {
                    kind: "teleport".to_string(),
                },
            )
            .with_retry(RetryConfig::with_max_attempts(3)),
        ]);
        let result = engine.execute(&wf, &ExecutionContext::default()).await;
        assert!(!result.success);
        assert_eq!(retry_lines(&result), 2);
    }

    #[tokio::test]
    async fn test_seeded_jitter_is_deterministic() {
        let step = trigger("t").with_retry(RetryConfig {
            max_attempts: 2,
            delay_ms: 1,
            backoff_multiplier: 1.0,
            jitter_ms: 5,
        });
        let wf = workflow(vec![step]);

        let first = WorkflowEngine::with_executor(FlakyExecutor::new(1)).with_jitter_seed(9);
        let second = WorkflowEngine::with_executor(FlakyExecutor::new(1)).with_jitter_seed(9);
        let a = first.execute(&wf, &ExecutionContext::default()).await;
        let b = second.execute(&wf, &ExecutionContext::default()).await;

        assert!(a.success && b.success);
        assert_eq!(a.logs, b.logs);
    }

    // -------------------------------------------------------------------
    // Scripts end to end
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_script_reads_user_id() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![Step::new(
            "who",
            "Who",
            StepConfig::Script {
                script_id: Some("whoami".to_string()),
                code: None,
            },
        )]);
        let ctx = ExecutionContext::new(json!({}))
            .with_user(json!({ "id": "user-123" }))
            .with_script(ScriptRecord::new("whoami", "context.user.id"));
        let result = engine.execute(&wf, &ctx).await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output("who"), Some(&json!("user-123")));
    }

    #[tokio::test]
    async fn test_script_output_feeds_next_step() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![
            Step::new(
                "double",
                "Double",
                StepConfig::Script {
                    script_id: None,
                    code: Some("#{ value: payload.value * 2 }".to_string()),
                },
            ),
            transform("plus", "payload.value + 1"),
        ]);
        let result = engine
            .execute(&wf, &ExecutionContext::new(json!({ "value": 4 })))
            .await;
        assert_eq!(result.output("plus"), Some(&json!(9)));
    }

    #[tokio::test]
    async fn test_security_warning_surfaces() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![Step::new(
            "s",
            "Sneaky",
            StepConfig::Script {
                script_id: None,
                code: Some("// os.execute is not here\nlet os = 1; os.execute".to_string()),
            },
        )]);
        let result = engine.execute(&wf, &ExecutionContext::default()).await;
        assert_eq!(result.security_warnings.len(), 1);
        assert!(result.security_warnings[0].starts_with("Security issues detected: "));
    }

    // -------------------------------------------------------------------
    // Panics and cancellation
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_panic_keeps_partial_state() {
        let engine = WorkflowEngine::with_executor(PanickingExecutor { panic_on: "b" });
        let wf = workflow(vec![trigger("a"), trigger("b"), trigger("c")]);
        let result = engine.execute(&wf, &ExecutionContext::new(json!(1))).await;

        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Workflow execution failed: executor exploded")
        );
        assert_eq!(result.outputs.len(), 1);
        assert!(result.output("a").is_some());
        assert!(result.logs.contains(&"visited b".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let engine = WorkflowEngine::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let wf = workflow(vec![trigger("a")]);
        let result = engine
            .execute_with_cancellation(&wf, &ExecutionContext::default(), cancel)
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Workflow cancelled"));
        assert!(result.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_steps_keeps_outputs() {
        let cancel = CancellationToken::new();
        let engine = WorkflowEngine::with_executor(CancellingExecutor {
            cancel: cancel.clone(),
            calls: AtomicU32::new(0),
        });
        let wf = workflow(vec![trigger("a"), trigger("b")]);
        let result = engine
            .execute_with_cancellation(&wf, &ExecutionContext::default(), cancel)
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Workflow cancelled"));
        assert_eq!(result.outputs.len(), 1);
        assert_eq!(engine.executor().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_script() {
        let engine = WorkflowEngine::from_config(&EngineConfig {
            sandbox: scriptflow_types::config::SandboxLimits {
                timeout_ms: 30_000,
                max_operations: 0,
                ..Default::default()
            },
            jitter_seed: None,
        });
        let wf = workflow(vec![Step::new(
            "spin",
            "Spin",
            StepConfig::Script {
                script_id: None,
                code: Some("loop { }".to_string()),
            },
        )]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = engine
            .execute_with_cancellation(&wf, &ExecutionContext::default(), cancel)
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Workflow cancelled"));
    }

    #[tokio::test]
    async fn test_run_ids_are_unique() {
        let engine = WorkflowEngine::new();
        let wf = workflow(vec![]);
        let a = engine.execute(&wf, &ExecutionContext::default()).await;
        let b = engine.execute(&wf, &ExecutionContext::default()).await;
        assert_ne!(a.run_id, b.run_id);
    }
}
