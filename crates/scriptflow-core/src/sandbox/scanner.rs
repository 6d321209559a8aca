//! Static security scanning of script source.
//!
//! The scanner runs on raw code before execution. Its verdict is advisory:
//! high and critical findings are surfaced as run warnings, while the
//! sandbox's own limits remain the enforcement boundary.

use std::sync::LazyLock;

use regex::Regex;

use scriptflow_types::sandbox::{
    SecurityIssue, SecurityIssueKind, SecurityScanResult, SecuritySeverity,
};

/// Inspects script source and returns a severity verdict.
pub trait SecurityScanner: Send + Sync {
    fn scan(&self, code: &str) -> SecurityScanResult;
}

// ---------------------------------------------------------------------------
// PatternScanner
// ---------------------------------------------------------------------------

struct ScanRule {
    regex: Regex,
    pattern: &'static str,
    kind: SecurityIssueKind,
    severity: SecuritySeverity,
    message: &'static str,
}

const RULE_TABLE: &[(&str, SecurityIssueKind, SecuritySeverity, &str)] = &[
    (
        r"\beval\s*\(",
        SecurityIssueKind::Dangerous,
        SecuritySeverity::Critical,
        "eval() executes dynamically built code",
    ),
    (
        r"\b(os|io)\.[A-Za-z_]+",
        SecurityIssueKind::Malicious,
        SecuritySeverity::Critical,
        "access to host os/io library",
    ),
    (
        r"\b(std::process|std::fs|std::env|Command::new)\b",
        SecurityIssueKind::Malicious,
        SecuritySeverity::Critical,
        "reference to host process or filesystem API",
    ),
    (
        r"\b(loadstring|dofile|loadfile|require)\s*\(",
        SecurityIssueKind::Malicious,
        SecuritySeverity::High,
        "dynamic code loading",
    ),
    (
        r#"\bimport\s+""#,
        SecurityIssueKind::Dangerous,
        SecuritySeverity::High,
        "module import attempts to load external code",
    ),
    (
        r"\bdebug\.[A-Za-z_]+",
        SecurityIssueKind::Malicious,
        SecuritySeverity::High,
        "access to interpreter debug library",
    ),
    (
        r"\b(is_def_var|is_def_fn)\s*\(",
        SecurityIssueKind::Dangerous,
        SecuritySeverity::Medium,
        "runtime introspection of definitions",
    ),
    (
        r"\bwhile\s+true\b|\bloop\s*\{",
        SecurityIssueKind::Warning,
        SecuritySeverity::Medium,
        "unbounded loop relies on the execution timeout",
    ),
    (
        r#"\bFn\s*\(\s*""#,
        SecurityIssueKind::Warning,
        SecuritySeverity::Low,
        "function pointer built from a string",
    ),
];

static DEFAULT_RULES: LazyLock<Vec<ScanRule>> = LazyLock::new(|| {
    RULE_TABLE
        .iter()
        .filter_map(|&(pattern, kind, severity, message)| {
            let regex = match Regex::new(pattern) {
                Ok(regex) => regex,
                Err(e) => {
                    tracing::error!(pattern, error = %e, "invalid security scan pattern");
                    return None;
                }
            };
            Some(ScanRule {
                regex,
                pattern,
                kind,
                severity,
                message,
            })
        })
        .collect()
});

/// Regex-based scanner over a fixed rule table.
///
/// Reports at most one issue per rule (the first matching line). Lines that
/// are entirely `//` comments are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternScanner;

impl PatternScanner {
    pub fn new() -> Self {
        Self
    }
}

impl SecurityScanner for PatternScanner {
    fn scan(&self, code: &str) -> SecurityScanResult {
        let mut issues = Vec::new();

        for rule in DEFAULT_RULES.iter() {
            let hit = code
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim_start().starts_with("//"))
                .find(|(_, line)| rule.regex.is_match(line));

            if let Some((index, _)) = hit {
                issues.push(SecurityIssue {
                    kind: rule.kind,
                    severity: rule.severity,
                    pattern: rule.pattern.to_string(),
                    message: rule.message.to_string(),
                    line: index + 1,
                });
            }
        }

        SecurityScanResult::from_issues(issues)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
