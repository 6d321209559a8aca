//! Script sandbox result types and security scan verdicts.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Security scan
// ---------------------------------------------------------------------------

/// Risk tier assigned to a script by the security scanner.
///
/// Ordered from least to most severe, so `max()` over issues gives the
/// overall verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecuritySeverity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl SecuritySeverity {
    /// Whether a finding of this severity should surface as a run warning.
    pub fn is_warning_worthy(self) -> bool {
        self >= SecuritySeverity::High
    }
}

impl fmt::Display for SecuritySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecuritySeverity::None => "none",
            SecuritySeverity::Low => "low",
            SecuritySeverity::Medium => "medium",
            SecuritySeverity::High => "high",
            SecuritySeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Category of a scanner finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityIssueKind {
    /// Capability that can be abused (dynamic evaluation, module loading).
    Dangerous,
    /// Suspicious but commonly benign (unbounded loops, very long literals).
    Warning,
    /// Attempted access to host surface the sandbox never provides.
    Malicious,
}

/// A single scanner finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityIssue {
    pub kind: SecurityIssueKind,
    pub severity: SecuritySeverity,
    /// The pattern that matched.
    pub pattern: String,
    pub message: String,
    /// 1-based line of the first match.
    pub line: usize,
}

/// Verdict returned by a security scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityScanResult {
    pub severity: SecuritySeverity,
    pub issues: Vec<SecurityIssue>,
    pub safe: bool,
}

impl SecurityScanResult {
    /// A clean verdict with no findings.
    pub fn clean() -> Self {
        Self {
            severity: SecuritySeverity::None,
            issues: Vec::new(),
            safe: true,
        }
    }

    /// Build a verdict from findings: severity is the worst finding, and the
    /// code is considered safe while nothing reaches `High`.
    pub fn from_issues(issues: Vec<SecurityIssue>) -> Self {
        let severity = issues
            .iter()
            .map(|i| i.severity)
            .max()
            .unwrap_or_default();
        Self {
            severity,
            safe: !severity.is_warning_worthy(),
            issues,
        }
    }

    pub fn issue_messages(&self) -> Vec<&str> {
        self.issues.iter().map(|i| i.message.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Execution result
// ---------------------------------------------------------------------------

/// Outcome of running code inside the script runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptExecution {
    pub success: bool,
    /// Script return value as JSON (`null` for unit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Lines captured from `print`, `debug` and `log`.
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Interpreter operations consumed.
    pub operations: u64,
    /// Sampled memory held by the script's scope and result, in bytes.
    pub memory_bytes: u64,
}

/// Execution outcome paired with the scanner verdict for the same code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxedExecutionResult {
    pub execution: ScriptExecution,
    pub security: SecurityScanResult,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
