//! Rhai-backed script runtime with resource guards.
//!
//! Each `ScriptSandbox` owns one `rhai::Engine`. Scripts run on a blocking
//! worker raced against a wall-clock timer; the engine's progress hook stops
//! runaway scripts at the same deadline or on cancellation, so a timed-out
//! worker does not keep spinning after the caller has moved on.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Scope};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use scriptflow_types::config::SandboxLimits;
use scriptflow_types::execution::ExecutionContext;
use scriptflow_types::sandbox::{SandboxedExecutionResult, ScriptExecution};

use super::memory;
use super::scanner::{PatternScanner, SecurityScanner};

/// Identifiers bound in a script's scope unless narrowed by
/// [`ScriptSandbox::set_allowed_globals`].
pub const DEFAULT_ALLOWED_GLOBALS: &[&str] = &["context", "payload", "data", "user"];

/// Symbols removed from the language before any script runs.
const DISABLED_SYMBOLS: &[&str] = &["eval", "import", "export", "is_def_var", "is_def_fn"];

/// The progress hook consults the clock and the cancellation token once per
/// this many operations.
const PROGRESS_CHECK_INTERVAL: u64 = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while running a script.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("Execution timeout: script exceeded {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Operation limit exceeded: {limit} operations")]
    OperationLimit { limit: u64 },

    #[error("Memory limit exceeded: {used} bytes used (max {max})")]
    MemoryLimit { used: u64, max: u64 },

    /// A single string, array or map was refused while the script ran.
    #[error("Memory limit exceeded: {what} exceeds the {max} byte ceiling")]
    AllocationRefused { what: String, max: u64 },

    #[error("Syntax error: {0}")]
    Parse(String),

    #[error("{0}")]
    Runtime(String),

    #[error("Unsupported script value: {0}")]
    Conversion(String),

    #[error("Sandbox has been destroyed")]
    Destroyed,

    #[error("Sandbox is still running a previous script")]
    Busy,
}

// ---------------------------------------------------------------------------
// Options and inputs
// ---------------------------------------------------------------------------

/// Construction options for a [`ScriptSandbox`].
#[derive(Clone)]
pub struct SandboxOptions {
    pub timeout: Duration,
    /// Memory ceiling in bytes. Zero or negative disables enforcement.
    pub max_memory_bytes: i64,
    /// Zero means unlimited.
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub cancel: Option<CancellationToken>,
    pub scanner: Arc<dyn SecurityScanner>,
}

impl SandboxOptions {
    pub fn from_limits(limits: &SandboxLimits) -> Self {
        Self {
            timeout: Duration::from_millis(limits.timeout_ms),
            max_memory_bytes: limits.max_memory_bytes,
            max_operations: limits.max_operations,
            max_call_levels: limits.max_call_levels,
            cancel: None,
            scanner: Arc::new(PatternScanner::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn SecurityScanner>) -> Self {
        self.scanner = scanner;
        self
    }
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self::from_limits(&SandboxLimits::default())
    }
}

impl std::fmt::Debug for SandboxOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxOptions")
            .field("timeout", &self.timeout)
            .field("max_memory_bytes", &self.max_memory_bytes)
            .field("max_operations", &self.max_operations)
            .field("max_call_levels", &self.max_call_levels)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Values a script can see through its globals.
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    pub payload: Value,
    pub user: Option<Value>,
}

impl ScriptContext {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            user: None,
        }
    }

    /// Context for a step: the step's payload plus the caller identity.
    pub fn for_step(payload: &Value, ctx: &ExecutionContext) -> Self {
        Self {
            payload: payload.clone(),
            user: ctx.user.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution guard
// ---------------------------------------------------------------------------

const NOT_INTERRUPTED: u8 = 0;
const INTERRUPT_TIMEOUT: u8 = 1;
const INTERRUPT_CANCELLED: u8 = 2;

/// State shared between the sandbox and the engine's progress hook.
struct ExecutionGuard {
    deadline: Mutex<Option<Instant>>,
    timeout_ms: AtomicU64,
    interrupt: AtomicU8,
    operations: AtomicU64,
    cancel: Option<CancellationToken>,
}

impl ExecutionGuard {
    fn new(cancel: Option<CancellationToken>) -> Self {
        Self {
            deadline: Mutex::new(None),
            timeout_ms: AtomicU64::new(0),
            interrupt: AtomicU8::new(NOT_INTERRUPTED),
            operations: AtomicU64::new(0),
            cancel,
        }
    }

    fn arm(&self, timeout: Duration) {
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = Some(Instant::now() + timeout);
        }
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
        self.operations.store(0, Ordering::Relaxed);
        self.interrupt.store(NOT_INTERRUPTED, Ordering::Release);
    }

    /// Record an interrupt reason. The first reason wins.
    fn interrupt(&self, reason: u8) {
        let _ = self.interrupt.compare_exchange(
            NOT_INTERRUPTED,
            reason,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn interrupted(&self) -> u8 {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Called by the progress hook with the running operation count.
    fn should_stop(&self, operations: u64) -> bool {
        self.operations.store(operations, Ordering::Relaxed);

        if operations % PROGRESS_CHECK_INTERVAL == 0 {
            if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                self.interrupt(INTERRUPT_CANCELLED);
            }
            let expired = self
                .deadline
                .lock()
                .ok()
                .and_then(|d| *d)
                .is_some_and(|d| Instant::now() >= d);
            if expired {
                self.interrupt(INTERRUPT_TIMEOUT);
            }
        }

        self.interrupted() != NOT_INTERRUPTED
    }

    fn interrupt_error(&self) -> SandboxError {
        match self.interrupted() {
            INTERRUPT_CANCELLED => SandboxError::Cancelled,
            _ => SandboxError::Timeout {
                timeout_ms: self.timeout_ms.load(Ordering::Relaxed),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptSandbox
// ---------------------------------------------------------------------------

/// A single-use-at-a-time Rhai runtime with timeout, operation, memory and
/// global-access restrictions.
pub struct ScriptSandbox {
    engine: Option<Arc<Engine>>,
    timeout: Duration,
    max_memory_bytes: i64,
    max_operations: u64,
    allowed_globals: BTreeSet<String>,
    dangerous_disabled: bool,
    logs: Arc<Mutex<Vec<String>>>,
    guard: Arc<ExecutionGuard>,
    scanner: Arc<dyn SecurityScanner>,
    last_memory_usage: u64,
}

impl ScriptSandbox {
    pub fn new(options: SandboxOptions) -> Self {
        let logs = Arc::new(Mutex::new(Vec::new()));
        let guard = Arc::new(ExecutionGuard::new(options.cancel.clone()));

        let mut engine = Engine::new();
        engine.set_max_operations(options.max_operations);
        engine.set_max_call_levels(options.max_call_levels);
        engine.set_strict_variables(true);
        if options.max_memory_bytes > 0 {
            let ceiling = usize::try_from(options.max_memory_bytes).unwrap_or(usize::MAX);
            let slots = (ceiling / std::mem::size_of::<Dynamic>()).max(1);
            engine.set_max_string_size(ceiling);
            engine.set_max_array_size(slots);
            engine.set_max_map_size(slots);
        }

        let sink = Arc::clone(&logs);
        engine.on_print(move |line| push_line(&sink, line));
        let sink = Arc::clone(&logs);
        engine.on_debug(move |line, _source, _pos| push_line(&sink, line));
        let sink = Arc::clone(&logs);
        engine.register_fn("log", move |line: &str| push_line(&sink, line));

        let hook_guard = Arc::clone(&guard);
        engine.on_progress(move |ops| {
            if hook_guard.should_stop(ops) {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });

        Self {
            engine: Some(Arc::new(engine)),
            timeout: options.timeout,
            max_memory_bytes: options.max_memory_bytes,
            max_operations: options.max_operations,
            allowed_globals: DEFAULT_ALLOWED_GLOBALS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            dangerous_disabled: false,
            logs,
            guard,
            scanner: options.scanner,
            last_memory_usage: 0,
        }
    }

    /// Restrict the globals bound in the script scope to `names`.
    ///
    /// Names outside [`DEFAULT_ALLOWED_GLOBALS`] have no value to bind and
    /// are ignored. Any other free identifier fails compilation.
    pub fn set_allowed_globals<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_globals = names.into_iter().map(Into::into).collect();
    }

    /// Remove dynamic evaluation, module loading and definition
    /// introspection from the language. Idempotent.
    pub fn disable_dangerous_functions(&mut self) -> Result<(), SandboxError> {
        if self.dangerous_disabled {
            return Ok(());
        }
        let engine = self.engine.as_mut().ok_or(SandboxError::Destroyed)?;
        let engine = Arc::get_mut(engine).ok_or(SandboxError::Busy)?;

        for symbol in DISABLED_SYMBOLS {
            engine.disable_symbol(*symbol);
        }
        engine.set_module_resolver(DummyModuleResolver::new());

        self.dangerous_disabled = true;
        Ok(())
    }

    /// Scan and run `code`, returning the execution outcome alongside the
    /// scanner verdict. Never fails past this boundary.
    pub async fn execute_with_sandbox(
        &mut self,
        code: &str,
        context: &ScriptContext,
    ) -> SandboxedExecutionResult {
        let prepared = self.disable_dangerous_functions();

        let security = self.scanner.scan(code);
        if security.severity.is_warning_worthy() {
            tracing::warn!(
                severity = %security.severity,
                issues = security.issues.len(),
                "script flagged by security scanner"
            );
        }

        let outcome = match prepared {
            Ok(()) => self.run(code, context).await,
            Err(e) => Err(e),
        };
        let logs = self.take_logs();
        let operations = self.guard.operations.load(Ordering::Relaxed);

        let execution = match outcome {
            Ok(value) => ScriptExecution {
                success: true,
                result: Some(value),
                logs,
                error: None,
                operations,
                memory_bytes: self.last_memory_usage,
            },
            Err(e) => {
                tracing::debug!(error = %e, "script execution failed");
                ScriptExecution {
                    success: false,
                    result: None,
                    logs,
                    error: Some(e.to_string()),
                    operations,
                    memory_bytes: self.last_memory_usage,
                }
            }
        };

        SandboxedExecutionResult {
            execution,
            security,
        }
    }

    /// Compare the last sampled memory usage against the ceiling.
    pub fn enforce_max_memory(&self) -> Result<(), SandboxError> {
        memory::check_memory_ceiling(self.last_memory_usage, self.max_memory_bytes)
    }

    /// Release the runtime. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.engine.take().is_some() {
            // A worker that outlived its timeout stops at its next progress check.
            self.guard.interrupt(INTERRUPT_CANCELLED);
            tracing::trace!("script sandbox destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.engine.is_none()
    }

    /// Memory sampled after the last successful evaluation.
    pub fn last_memory_usage(&self) -> u64 {
        self.last_memory_usage
    }

    async fn run(&mut self, code: &str, context: &ScriptContext) -> Result<Value, SandboxError> {
        let engine = self.engine.as_ref().ok_or(SandboxError::Destroyed)?;
        if Arc::strong_count(engine) > 1 {
            return Err(SandboxError::Busy);
        }
        let engine = Arc::clone(engine);
        let scope = self.build_scope(context)?;

        self.take_logs();
        self.last_memory_usage = 0;
        self.guard.arm(self.timeout);

        let guard = Arc::clone(&self.guard);
        let limits = RunLimits {
            max_operations: self.max_operations,
            max_memory_bytes: self.max_memory_bytes,
        };
        let source = code.to_string();
        let worker = tokio::task::spawn_blocking(move || {
            evaluate(&engine, &source, scope, &guard, limits)
        });

        let timeout_ms = self.timeout.as_millis() as u64;
        let outcome = tokio::select! {
            joined = tokio::time::timeout(self.timeout, worker) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(SandboxError::Runtime(format!("script worker failed: {e}"))),
                Err(_) => {
                    self.guard.interrupt(INTERRUPT_TIMEOUT);
                    Err(SandboxError::Timeout { timeout_ms })
                }
            },
            _ = wait_cancelled(self.guard.cancel.as_ref()) => {
                self.guard.interrupt(INTERRUPT_CANCELLED);
                Err(SandboxError::Cancelled)
            }
        };

        let (value, usage) = outcome?;
        self.last_memory_usage = usage;
        self.enforce_max_memory()?;
        Ok(value)
    }

    fn build_scope(&self, context: &ScriptContext) -> Result<Scope<'static>, SandboxError> {
        let payload = to_dynamic(&context.payload)?;
        let user = to_dynamic(context.user.as_ref().unwrap_or(&Value::Null))?;

        let mut scope = Scope::new();
        for name in &self.allowed_globals {
            let value = match name.as_str() {
                "context" => {
                    let mut map = Map::new();
                    map.insert("payload".into(), payload.clone());
                    map.insert("data".into(), payload.clone());
                    map.insert("user".into(), user.clone());
                    Dynamic::from_map(map)
                }
                "payload" | "data" => payload.clone(),
                "user" => user.clone(),
                _ => continue,
            };
            scope.push_dynamic(name.clone(), value);
        }
        Ok(scope)
    }

    fn take_logs(&self) -> Vec<String> {
        self.logs
            .lock()
            .map(|mut lines| std::mem::take(&mut *lines))
            .unwrap_or_default()
    }
}

impl Drop for ScriptSandbox {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct RunLimits {
    max_operations: u64,
    max_memory_bytes: i64,
}

fn evaluate(
    engine: &Engine,
    code: &str,
    mut scope: Scope<'static>,
    guard: &ExecutionGuard,
    limits: RunLimits,
) -> Result<(Value, u64), SandboxError> {
    let ast = engine
        .compile_with_scope(&scope, code)
        .map_err(|e| SandboxError::Parse(e.to_string()))?;

    // The injected globals are the caller's data; only growth past them counts.
    let baseline = memory::estimate_scope(&scope);
    let result = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        .map_err(|e| classify(&e, guard, limits))?;

    let usage = memory::estimate_scope(&scope).saturating_sub(baseline)
        + memory::estimate_dynamic(&result);
    let value = rhai::serde::from_dynamic::<Value>(&result)
        .map_err(|e| SandboxError::Conversion(e.to_string()))?;
    Ok((value, usage as u64))
}

fn classify(err: &EvalAltResult, guard: &ExecutionGuard, limits: RunLimits) -> SandboxError {
    match err {
        EvalAltResult::ErrorTerminated(..) => guard.interrupt_error(),
        EvalAltResult::ErrorTooManyOperations(..) => SandboxError::OperationLimit {
            limit: limits.max_operations,
        },
        EvalAltResult::ErrorDataTooLarge(what, _) => SandboxError::AllocationRefused {
            what: what.clone(),
            max: limits.max_memory_bytes.max(0) as u64,
        },
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) if is_limit_error(inner) => {
            classify(inner, guard, limits)
        }
        EvalAltResult::ErrorParsing(..) => SandboxError::Parse(err.to_string()),
        _ => SandboxError::Runtime(err.to_string()),
    }
}

/// Resource errors that keep their meaning when raised inside a function.
fn is_limit_error(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(..)
        | EvalAltResult::ErrorTooManyOperations(..)
        | EvalAltResult::ErrorDataTooLarge(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_limit_error(inner),
        _ => false,
    }
}

fn to_dynamic(value: &Value) -> Result<Dynamic, SandboxError> {
    rhai::serde::to_dynamic(value).map_err(|e| SandboxError::Conversion(e.to_string()))
}

fn push_line(sink: &Mutex<Vec<String>>, line: &str) {
    if let Ok(mut lines) = sink.lock() {
        lines.push(line.to_string());
    }
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
