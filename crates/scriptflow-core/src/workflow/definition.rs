//! Workflow definition parsing and file loading.
//!
//! Definitions are accepted as YAML or JSON. Structural validation (unique
//! IDs, name rules) belongs to whatever stores definitions; the engine only
//! needs something it can deserialize. Unknown step kinds parse fine and fail
//! when executed.

use std::path::Path;

use scriptflow_types::workflow::Workflow;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a `Workflow`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<Workflow, WorkflowError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Parse a JSON string into a `Workflow`.
pub fn parse_workflow_json(json: &str) -> Result<Workflow, WorkflowError> {
    serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Serialize a `Workflow` to a YAML string.
pub fn serialize_workflow_yaml(workflow: &Workflow) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(workflow).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from disk.
///
/// `.json` files are parsed as JSON; everything else as YAML (a superset).
pub async fn load_workflow_file(path: &Path) -> Result<Workflow, WorkflowError> {
    let content = tokio::fs::read_to_string(path).await?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let workflow = if is_json {
        parse_workflow_json(&content)?
    } else {
        parse_workflow_yaml(&content)?
    };
    tracing::debug!(
        path = %path.display(),
        workflow = workflow.name.as_str(),
        steps = workflow.steps.len(),
        "loaded workflow definition"
    );
    Ok(workflow)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use scriptflow_types::workflow::StepConfig;
    use tempfile::TempDir;

    const SAMPLE_YAML: &str = r#"
id: wf-orders
name: Order enrichment
steps:
  - id: start
    type: trigger
  - id: bump
    label: Bump value
    type: transform
    config:
      transform: payload.value + 1
    retry:
      maxAttempts: 3
      delayMs: 10
  - id: score
    type: script
    config:
      scriptId: scorer
edges:
  - source: start
    target: bump
"#;

    #[test]
    fn test_parse_yaml() {
        let wf = parse_workflow_yaml(SAMPLE_YAML).unwrap();
        assert_eq!(wf.name, "Order enrichment");
        assert_eq!(wf.steps.len(), 3);
        assert!(wf.enabled);
        assert_eq!(wf.edges.len(), 1);
        assert_eq!(wf.steps[0].label, "start");
        assert_eq!(wf.steps[1].retry.as_ref().map(|r| r.max_attempts), Some(3));
        assert_eq!(
            wf.steps[2].config,
            StepConfig::Script {
                script_id: Some("scorer".to_string()),
                code: None,
            }
        );
    }

    #[test]
    fn test_yaml_roundtrip() {
        let wf = parse_workflow_yaml(SAMPLE_YAML).unwrap();
        let yaml = serialize_workflow_yaml(&wf).unwrap();
        let reparsed = parse_workflow_yaml(&yaml).unwrap();
        assert_eq!(wf.steps, reparsed.steps);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = parse_workflow_yaml("steps: [[[").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_load_json_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("flow.json");
        tokio::fs::write(
            &path,
            r#"{ "id": "wf", "name": "json flow", "steps": [{ "id": "a", "type": "mystery" }] }"#,
        )
        .await
        .unwrap();

        let wf = load_workflow_file(&path).await.unwrap();
        assert_eq!(wf.name, "json flow");
        assert_eq!(wf.steps[0].kind(), "mystery");
    }

    #[tokio::test]
    async fn test_load_yaml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("flow.yaml");
        tokio::fs::write(&path, SAMPLE_YAML).await.unwrap();

        let wf = load_workflow_file(&path).await.unwrap();
        assert_eq!(wf.id, "wf-orders");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = load_workflow_file(&tmp.path().join("absent.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::IoError(_)));
    }
}
