use thiserror::Error;

/// Errors raised while reading a workflow definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("invalid config for step kind '{kind}': {reason}")]
    InvalidConfig { kind: String, reason: String },
}
