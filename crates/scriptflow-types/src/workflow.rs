//! Workflow domain types for Scriptflow.
//!
//! A `Workflow` is an ordered list of `Step`s. Each step carries a
//! kind-specific `StepConfig` (a tagged union over the step kinds), an optional
//! retry configuration, and an optional canvas position that only matters to
//! the visual builder.
//!
//! The on-disk / wire shape keeps the kind and the configuration bag separate:
//!
//! ```json
//! { "id": "n2", "type": "transform", "label": "Add one",
//!   "config": { "transform": "payload.value + 1" },
//!   "retry": { "maxAttempts": 3, "delayMs": 100 } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DefinitionError;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A workflow definition. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow identifier.
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Steps in execution order.
    #[serde(alias = "nodes")]
    pub steps: Vec<Step>,
    /// Declared connections between steps.
    ///
    /// Carried for the visual builder; the engine executes `steps` in list
    /// order and never consults this field.
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    /// Whether the workflow is enabled for triggering.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A declared connection between two steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single unit of workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct Step {
    /// Step ID, unique within a workflow. Keys the run's output map.
    pub id: String,
    /// Human-readable label used in logs and error messages.
    pub label: String,
    /// Kind-specific configuration.
    pub config: StepConfig,
    /// Retry configuration. `None` means a single attempt with no delay.
    pub retry: Option<RetryConfig>,
    /// Canvas position (visual builder only).
    pub position: Option<Position>,
}

impl Step {
    /// Create a step with no retry configuration and no position.
    pub fn new(id: impl Into<String>, label: impl Into<String>, config: StepConfig) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            config,
            retry: None,
            position: None,
        }
    }

    /// Attach a retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// The step kind as it appears in definitions (`trigger`, `script`, ...).
    pub fn kind(&self) -> &str {
        self.config.kind()
    }
}

/// Canvas position coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Step-specific configuration, keyed by step kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepConfig {
    /// Entry point; passes the payload through.
    Trigger,
    /// Named action; logs the name and passes the payload through.
    Action { action: Option<String> },
    /// JEXL expression; a result of exactly `false` stops the workflow.
    Condition { condition: String },
    /// JEXL expression whose result becomes the new payload.
    Transform { transform: String },
    /// Script executed in the sandbox, either registered (`script_id`) or inline.
    Script {
        script_id: Option<String>,
        code: Option<String>,
    },
    /// A step kind this engine does not know. Fails when executed.
    Unknown { kind: String },
}

impl StepConfig {
    pub fn kind(&self) -> &str {
        match self {
            StepConfig::Trigger => "trigger",
            StepConfig::Action { .. } => "action",
            StepConfig::Condition { .. } => "condition",
            StepConfig::Transform { .. } => "transform",
            StepConfig::Script { .. } => "script",
            StepConfig::Unknown { kind } => kind,
        }
    }

    /// Build a config from a kind string and its configuration bag.
    pub fn from_parts(kind: &str, config: Value) -> Result<Self, DefinitionError> {
        let config = if config.is_null() {
            Value::Object(Default::default())
        } else {
            config
        };
        let invalid = |e: serde_json::Error| DefinitionError::InvalidConfig {
            kind: kind.to_string(),
            reason: e.to_string(),
        };

        Ok(match kind {
            "trigger" => StepConfig::Trigger,
            "action" => {
                let c: ActionBag = serde_json::from_value(config).map_err(invalid)?;
                StepConfig::Action { action: c.action }
            }
            "condition" => {
                let c: ConditionBag = serde_json::from_value(config).map_err(invalid)?;
                StepConfig::Condition {
                    condition: c.condition,
                }
            }
            "transform" => {
                let c: TransformBag = serde_json::from_value(config).map_err(invalid)?;
                StepConfig::Transform {
                    transform: c.transform,
                }
            }
            "script" => {
                let c: ScriptBag = serde_json::from_value(config).map_err(invalid)?;
                StepConfig::Script {
                    script_id: c.script_id,
                    code: c.code,
                }
            }
            other => StepConfig::Unknown {
                kind: other.to_string(),
            },
        })
    }

    /// The configuration bag for this kind (inverse of [`StepConfig::from_parts`]).
    pub fn to_bag(&self) -> Value {
        let mut bag = serde_json::Map::new();
        match self {
            StepConfig::Trigger | StepConfig::Unknown { .. } => {}
            StepConfig::Action { action } => {
                if let Some(action) = action {
                    bag.insert("action".into(), Value::String(action.clone()));
                }
            }
            StepConfig::Condition { condition } => {
                bag.insert("condition".into(), Value::String(condition.clone()));
            }
            StepConfig::Transform { transform } => {
                bag.insert("transform".into(), Value::String(transform.clone()));
            }
            StepConfig::Script { script_id, code } => {
                if let Some(id) = script_id {
                    bag.insert("scriptId".into(), Value::String(id.clone()));
                }
                if let Some(code) = code {
                    bag.insert("code".into(), Value::String(code.clone()));
                }
            }
        }
        Value::Object(bag)
    }
}

#[derive(Deserialize)]
struct ActionBag {
    #[serde(default)]
    action: Option<String>,
}

#[derive(Deserialize)]
struct ConditionBag {
    #[serde(default)]
    condition: String,
}

#[derive(Deserialize)]
struct TransformBag {
    #[serde(default)]
    transform: String,
}

#[derive(Deserialize)]
struct ScriptBag {
    #[serde(default, alias = "scriptId")]
    script_id: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Serialized shape of a [`Step`].
#[derive(Serialize, Deserialize)]
struct RawStep {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    config: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    retry: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<Position>,
}

impl TryFrom<RawStep> for Step {
    type Error = DefinitionError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let config = StepConfig::from_parts(&raw.kind, raw.config)?;
        Ok(Step {
            label: if raw.label.is_empty() {
                raw.id.clone()
            } else {
                raw.label
            },
            id: raw.id,
            config,
            retry: RetryConfig::from_value_lenient(raw.retry),
            position: raw.position,
        })
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        RawStep {
            kind: step.kind().to_string(),
            config: step.config.to_bag(),
            retry: step
                .retry
                .and_then(|r| serde_json::to_value(r).ok())
                .unwrap_or(Value::Null),
            id: step.id,
            label: step.label,
            position: step.position,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Configuration
// ---------------------------------------------------------------------------

/// Retry configuration for a step, as written by the operator.
///
/// Values are not validated here; the engine clamps them when it builds a
/// retry policy (`max_attempts >= 1`, `delay_ms >= 0`,
/// `backoff_multiplier >= 1`, `jitter_ms >= 0`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default 1).
    #[serde(default = "default_max_attempts", alias = "maxAttempts")]
    pub max_attempts: i64,
    /// Base delay before a retry, in milliseconds (default 0).
    #[serde(default, alias = "delayMs")]
    pub delay_ms: i64,
    /// Exponential backoff multiplier (default 1.0).
    #[serde(default = "default_backoff_multiplier", alias = "backoffMultiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound of the uniform random jitter, in milliseconds (default 0).
    #[serde(default, alias = "jitterMs")]
    pub jitter_ms: i64,
}

fn default_max_attempts() -> i64 {
    1
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: 0,
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ms: 0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(max_attempts: i64) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Parse a retry block, treating anything malformed as "no retry config".
    pub fn from_value_lenient(value: Value) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
