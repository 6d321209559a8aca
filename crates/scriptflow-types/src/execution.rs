//! Execution inputs and results.
//!
//! `ExecutionContext` is what the caller hands to the engine alongside a
//! workflow; `RunResult` is what comes back. `StepResult` is the per-step
//! outcome that never escapes as an error past a step boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Caller-supplied inputs for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Input payload for the first step.
    #[serde(default, alias = "data")]
    pub payload: Value,
    /// Identity of the caller, exposed to expressions and scripts as `user`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    /// Scripts that `script` steps may reference by ID. First match wins.
    #[serde(default)]
    pub scripts: Vec<ScriptRecord>,
}

impl ExecutionContext {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user: Value) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_script(mut self, script: ScriptRecord) -> Self {
        self.scripts.push(script);
        self
    }
}

/// A registered script body plus its execution metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Overrides the sandbox execution timeout for this script.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    /// Restricts which globals the script may reference.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "allowedGlobals")]
    pub allowed_globals: Option<Vec<String>>,
}

impl ScriptRecord {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            code: code.into(),
            description: None,
            timeout_ms: None,
            allowed_globals: None,
        }
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Outcome of executing one step (after retries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// RunResult
// ---------------------------------------------------------------------------

/// Aggregated outcome of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// UUIDv7 assigned when the run started.
    pub run_id: Uuid,
    pub success: bool,
    /// Step outputs keyed by step ID, in execution order. Only steps that
    /// executed to completion have an entry.
    pub outputs: Map<String, Value>,
    /// Human-readable trace lines.
    pub logs: Vec<String>,
    /// Security warnings raised by script steps.
    pub security_warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
}

impl RunResult {
    /// Output of the given step, if it completed.
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
